//! Call boundary between the loader and Rust code.
//!
//! Nothing may unwind or leak a Rust error across an `extern "system"`
//! function. Every hook runs its body through [`intercept`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use openxr_sys as xr;

use crate::error::PassthroughResult;

/// Run a hook body, logging entry and exit.
///
/// `Ok(result)` is returned to the caller as is. Errors and panics are
/// logged and become `XR_ERROR_RUNTIME_FAILURE`.
pub fn intercept<F>(name: &'static str, body: F) -> xr::Result
where
    F: FnOnce() -> PassthroughResult<xr::Result>,
{
    log::debug!("--> {}", name);

    let result = match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            log::error!("{}: {}", name, e);
            xr::Result::ERROR_RUNTIME_FAILURE
        },
        Err(payload) => {
            log::error!("{} panicked: {}", name, panic_message(payload.as_ref()));
            xr::Result::ERROR_RUNTIME_FAILURE
        },
    };

    log::debug!("<-- {} {:?}", name, result);
    result
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
