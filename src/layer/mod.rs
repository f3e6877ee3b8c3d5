//! The passthrough layer context.
//!
//! [`OpenXrApi`] forwards every hooked call to the next layer by default.
//! [`PassthroughLayer`] overrides the calls it augments:
//! - `xrGetSystem` / `xrCreateSession` / `xrDestroySession`: tracking and
//!   graphics lifetime
//! - `xrEnumerateEnvironmentBlendModes`: advertise additive blending
//! - `xrEndFrame`: prepend the passthrough layer

pub mod composer;
pub mod tracking;


use std::sync::Arc;

use openxr_sys as xr;
use openxr_sys::pfn;
use wmr_camera_feed::{CameraFeed, CameraSource};

use crate::config::LayerConfig;
use crate::dispatch::loader::c_chars_to_string;
use crate::dispatch::NextDispatch;
use crate::error::{succeeded, PassthroughResult};
use crate::graphics::resources::CameraConnector;
use crate::graphics::{default_backend_factory, BackendFactory, GraphicsBinding, GraphicsResources, XrRuntime};

use composer::{FrameComposition, OwnedLayer};
use tracking::SessionTracker;

/// Hooked entry points, forwarding unchanged unless overridden.
///
/// # Safety
/// Every method receives the raw pointers of the corresponding OpenXR call
/// and must uphold that call's contract.
pub trait OpenXrApi {
    fn next(&self) -> &NextDispatch;

    unsafe fn get_system(
        &mut self,
        instance: xr::Instance,
        get_info: *const xr::SystemGetInfo,
        system_id: *mut xr::SystemId,
    ) -> PassthroughResult<xr::Result> {
        Ok((self.next().get_system)(instance, get_info, system_id))
    }

    unsafe fn enumerate_environment_blend_modes(
        &mut self,
        instance: xr::Instance,
        system_id: xr::SystemId,
        view_type: xr::ViewConfigurationType,
        capacity: u32,
        count: *mut u32,
        modes: *mut xr::EnvironmentBlendMode,
    ) -> PassthroughResult<xr::Result> {
        Ok((self.next().enumerate_environment_blend_modes)(
            instance, system_id, view_type, capacity, count, modes,
        ))
    }

    unsafe fn create_session(
        &mut self,
        instance: xr::Instance,
        create_info: *const xr::SessionCreateInfo,
        session: *mut xr::Session,
    ) -> PassthroughResult<xr::Result> {
        Ok((self.next().create_session)(instance, create_info, session))
    }

    unsafe fn destroy_session(&mut self, session: xr::Session) -> PassthroughResult<xr::Result> {
        Ok((self.next().destroy_session)(session))
    }

    unsafe fn end_frame(
        &mut self,
        session: xr::Session,
        frame_end_info: *const xr::FrameEndInfo,
    ) -> PassthroughResult<xr::Result> {
        Ok((self.next().end_frame)(session, frame_end_info))
    }

    unsafe fn destroy_instance(&mut self, instance: xr::Instance) -> PassthroughResult<xr::Result> {
        Ok((self.next().destroy_instance)(instance))
    }
}

pub struct PassthroughLayer {
    next: Arc<NextDispatch>,
    config: LayerConfig,
    tracker: SessionTracker,
    graphics: Option<GraphicsResources>,
    backend_factory: BackendFactory,
    camera_connector: CameraConnector,
}

impl PassthroughLayer {
    pub fn new(
        next: Arc<NextDispatch>,
        config: LayerConfig,
        backend_factory: BackendFactory,
        camera_connector: CameraConnector,
    ) -> Self {
        Self {
            next,
            config,
            tracker: SessionTracker::new(),
            graphics: None,
            backend_factory,
            camera_connector,
        }
    }

    /// Build the context for a freshly created instance: resolve the next
    /// layer's functions and log who we are running between.
    ///
    /// # Safety
    /// `get_instance_proc_addr` must belong to the next layer of `instance`;
    /// `create_info` must be null or valid.
    pub unsafe fn create(
        instance: xr::Instance,
        get_instance_proc_addr: pfn::GetInstanceProcAddr,
        create_info: *const xr::InstanceCreateInfo,
        config: LayerConfig,
    ) -> PassthroughResult<Self> {
        let next = NextDispatch::load(instance, get_instance_proc_addr)?;

        match next.runtime_properties() {
            Ok((name, version)) => log::info!(
                "Runtime: {} {}.{}.{}",
                name,
                version.major(),
                version.minor(),
                version.patch()
            ),
            Err(e) => log::warn!("Could not query runtime properties: {}", e),
        }
        if let Some(info) = create_info.as_ref() {
            log::info!(
                "Application: {} (engine {})",
                c_chars_to_string(&info.application_info.application_name),
                c_chars_to_string(&info.application_info.engine_name)
            );
        }

        Ok(Self::new(
            Arc::new(next),
            config,
            default_backend_factory(),
            feed_connector(),
        ))
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn graphics(&self) -> Option<&GraphicsResources> {
        self.graphics.as_ref()
    }

    fn create_graphics(&mut self, create_info: &xr::SessionCreateInfo) {
        let binding = match unsafe { GraphicsBinding::from_next_chain(create_info.next) } {
            Some(binding) => binding,
            None => {
                log::warn!("Session has no D3D11 or D3D12 binding, passthrough disabled");
                return;
            },
        };

        match (self.backend_factory)(&binding) {
            Ok(backend) => {
                let runtime: Arc<dyn XrRuntime> = self.next.clone();
                self.graphics = Some(GraphicsResources::new(
                    runtime,
                    &binding,
                    backend,
                    self.camera_connector.clone(),
                    self.config.clone(),
                    create_info.system_id,
                ));
            },
            Err(e) => log::error!("Passthrough disabled for {} session: {}", binding.api_name(), e),
        }
    }

    /// Connect, draw and compose. `Ok(None)` means no passthrough this frame.
    unsafe fn compose(
        &mut self,
        session: xr::Session,
        info: &xr::FrameEndInfo,
    ) -> PassthroughResult<Option<FrameComposition>> {
        let Some(graphics) = self.graphics.as_mut() else {
            return Ok(None);
        };
        graphics.connect(session)?;

        let layers = OwnedLayer::copy_all(info);
        let source = composer::projection_source(&layers, &self.config);
        let frame = graphics.draw_passthrough_layer(info.display_time, source.as_ref())?;

        Ok(frame.map(|frame| FrameComposition::new(frame, layers)))
    }
}

/// Camera sources reading the process-wide feed.
pub fn feed_connector() -> CameraConnector {
    Arc::new(|| Box::new(CameraFeed::global().source()) as Box<dyn CameraSource>)
}

impl OpenXrApi for PassthroughLayer {
    fn next(&self) -> &NextDispatch {
        &self.next
    }

    unsafe fn get_system(
        &mut self,
        instance: xr::Instance,
        get_info: *const xr::SystemGetInfo,
        system_id: *mut xr::SystemId,
    ) -> PassthroughResult<xr::Result> {
        let result = (self.next.get_system)(instance, get_info, system_id);
        if succeeded(result) && !get_info.is_null() && !system_id.is_null() {
            self.tracker.on_get_system((*get_info).form_factor, *system_id);
        }
        Ok(result)
    }

    unsafe fn enumerate_environment_blend_modes(
        &mut self,
        instance: xr::Instance,
        system_id: xr::SystemId,
        view_type: xr::ViewConfigurationType,
        capacity: u32,
        count: *mut u32,
        modes: *mut xr::EnvironmentBlendMode,
    ) -> PassthroughResult<xr::Result> {
        let result = (self.next.enumerate_environment_blend_modes)(instance, system_id, view_type, capacity, count, modes);
        if !succeeded(result)
            || count.is_null()
            || !self.tracker.is_tracked_system(system_id)
            || view_type != xr::ViewConfigurationType::PRIMARY_STEREO
        {
            return Ok(result);
        }

        let modes = if modes.is_null() || capacity == 0 {
            None
        } else {
            Some(std::slice::from_raw_parts_mut(modes, capacity as usize))
        };
        let (appended, total) = append_additive_mode(*count, modes);
        *count = total;
        Ok(if succeeded(appended) { result } else { appended })
    }

    unsafe fn create_session(
        &mut self,
        instance: xr::Instance,
        create_info: *const xr::SessionCreateInfo,
        session: *mut xr::Session,
    ) -> PassthroughResult<xr::Result> {
        let result = (self.next.create_session)(instance, create_info, session);
        if !succeeded(result) || create_info.is_null() || session.is_null() {
            return Ok(result);
        }

        let create_info = &*create_info;
        if self.tracker.on_session_created(create_info.system_id, *session) {
            // At most one session is augmented.
            self.graphics = None;
            self.create_graphics(create_info);
        }
        Ok(result)
    }

    unsafe fn destroy_session(&mut self, session: xr::Session) -> PassthroughResult<xr::Result> {
        // The swapchain and space belong to the session, release them first.
        if self.tracker.is_tracked_session(session) {
            self.graphics = None;
        }

        let result = (self.next.destroy_session)(session);
        if succeeded(result) {
            self.tracker.on_session_destroyed(session);
        }
        Ok(result)
    }

    unsafe fn end_frame(
        &mut self,
        session: xr::Session,
        frame_end_info: *const xr::FrameEndInfo,
    ) -> PassthroughResult<xr::Result> {
        if frame_end_info.is_null() || !self.tracker.is_tracked_session(session) {
            return Ok((self.next.end_frame)(session, frame_end_info));
        }

        let info = &*frame_end_info;
        if !matches!(
            info.environment_blend_mode,
            xr::EnvironmentBlendMode::ADDITIVE | xr::EnvironmentBlendMode::ALPHA_BLEND
        ) {
            return Ok((self.next.end_frame)(session, frame_end_info));
        }

        match self.compose(session, info) {
            Ok(Some(mut composition)) => {
                let composed = composition.frame_end_info(info);
                Ok((self.next.end_frame)(session, &composed))
            },
            Ok(None) => Ok((self.next.end_frame)(session, frame_end_info)),
            Err(e) => {
                log::warn!("Passthrough skipped this frame: {}", e);
                Ok((self.next.end_frame)(session, frame_end_info))
            },
        }
    }

    unsafe fn destroy_instance(&mut self, instance: xr::Instance) -> PassthroughResult<xr::Result> {
        // Session objects must go before their instance.
        self.graphics = None;
        Ok((self.next.destroy_instance)(instance))
    }
}

/// Append `ADDITIVE` after the `upstream_count` modes the runtime wrote.
///
/// Returns the status and the count to report. `modes` is `None` for a size
/// query.
pub fn append_additive_mode(
    upstream_count: u32,
    modes: Option<&mut [xr::EnvironmentBlendMode]>,
) -> (xr::Result, u32) {
    let total = upstream_count + 1;
    match modes {
        None => (xr::Result::SUCCESS, total),
        Some(modes) if modes.len() < total as usize => (xr::Result::ERROR_SIZE_INSUFFICIENT, total),
        Some(modes) => {
            modes[upstream_count as usize] = xr::EnvironmentBlendMode::ADDITIVE;
            (xr::Result::SUCCESS, total)
        },
    }
}
