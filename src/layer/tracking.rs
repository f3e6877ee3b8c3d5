//! Which system and session the layer augments.

use openxr_sys as xr;

/// The head-mounted display system and the one session created for it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SessionTracker {
    system: Option<xr::SystemId>,
    session: Option<xr::Session>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn system(&self) -> Option<xr::SystemId> {
        self.system
    }

    pub fn session(&self) -> Option<xr::Session> {
        self.session
    }

    /// Record a successful `xrGetSystem`. Only the first head-mounted display
    /// system is kept.
    pub fn on_get_system(&mut self, form_factor: xr::FormFactor, system: xr::SystemId) {
        if form_factor != xr::FormFactor::HEAD_MOUNTED_DISPLAY {
            return;
        }

        match self.system {
            None => {
                log::info!("Tracking HMD system {:?}", system);
                self.system = Some(system);
            },
            Some(tracked) if tracked != system => {
                log::warn!("Ignoring second HMD system {:?}, already tracking {:?}", system, tracked);
            },
            Some(_) => {},
        }
    }

    pub fn is_tracked_system(&self, system: xr::SystemId) -> bool {
        self.system == Some(system)
    }

    /// Record a successful `xrCreateSession`. Returns whether the session
    /// belongs to the tracked system and is now the tracked session.
    pub fn on_session_created(&mut self, system: xr::SystemId, session: xr::Session) -> bool {
        if !self.is_tracked_system(system) {
            return false;
        }

        if let Some(previous) = self.session.replace(session) {
            log::warn!("Session {:?} replaces still tracked session {:?}", session, previous);
        }
        log::info!("Tracking session {:?}", session);
        true
    }

    pub fn is_tracked_session(&self, session: xr::Session) -> bool {
        session != xr::Session::NULL && self.session == Some(session)
    }

    /// Record a successful `xrDestroySession`. Returns whether it was the
    /// tracked one.
    pub fn on_session_destroyed(&mut self, session: xr::Session) -> bool {
        if !self.is_tracked_session(session) {
            return false;
        }
        self.session = None;
        log::info!("Session {:?} destroyed", session);
        true
    }
}
