//! Central error types for the passthrough layer.
//!
//! Errors never cross the OpenXR boundary: the call interceptor turns them into
//! `XR_ERROR_RUNTIME_FAILURE` (see `dispatch::interceptor`).

use openxr_sys as xr;
use thiserror::Error;

/// Main error type for layer operations.
#[derive(Error, Debug)]
pub enum PassthroughError {
    /// A function the layer needs could not be resolved from the next layer
    #[error("Failed to resolve {name}: {result:?}")]
    UnresolvedFunction { name: String, result: xr::Result },

    /// An OpenXR call into the runtime failed
    #[error("{call} failed: {result:?}")]
    Runtime { call: &'static str, result: xr::Result },

    /// D3D11/D3D12 error
    #[error("Graphics error: {0}")]
    Graphics(String),

    /// Session created with a graphics API the layer cannot draw with
    #[error("Unsupported graphics binding: {0}")]
    UnsupportedGraphics(String),

    /// Caller handed us something we cannot work with
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// No layer context (instance not created or already destroyed)
    #[error("Layer is not initialized")]
    NotInitialized,

    /// Settings file could not be read
    #[error("Config error: {0}")]
    Config(String),

    /// File system error (logs, settings)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

#[cfg(windows)]
impl From<windows::core::Error> for PassthroughError {
    fn from(err: windows::core::Error) -> Self {
        PassthroughError::Graphics(err.to_string())
    }
}

impl From<String> for PassthroughError {
    fn from(msg: String) -> Self {
        PassthroughError::Other(msg)
    }
}

impl From<&str> for PassthroughError {
    fn from(msg: &str) -> Self {
        PassthroughError::Other(msg.to_string())
    }
}

/// Type alias for Results using PassthroughError.
pub type PassthroughResult<T> = Result<T, PassthroughError>;

/// Converts raw `XrResult` codes into `PassthroughResult`.
pub trait XrResultExt {
    /// `Ok(self)` for success codes (including qualified successes), otherwise
    /// a `PassthroughError::Runtime` naming `call`.
    fn check(self, call: &'static str) -> PassthroughResult<xr::Result>;
}

impl XrResultExt for xr::Result {
    fn check(self, call: &'static str) -> PassthroughResult<xr::Result> {
        if succeeded(self) {
            Ok(self)
        } else {
            Err(PassthroughError::Runtime { call, result: self })
        }
    }
}

/// `XR_SUCCEEDED`.
pub fn succeeded(result: xr::Result) -> bool {
    result.into_raw() >= 0
}

/// Extension trait for adding context to Results.
pub trait ResultExt<T> {
    /// Add context to an error, converting it to PassthroughError::Other.
    fn context(self, msg: &str) -> PassthroughResult<T>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F: FnOnce() -> String>(self, f: F) -> PassthroughResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn context(self, msg: &str) -> PassthroughResult<T> {
        self.map_err(|e| PassthroughError::Other(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> PassthroughResult<T> {
        self.map_err(|e| PassthroughError::Other(format!("{}: {}", f(), e)))
    }
}

/// Extension trait for adding context to Option types.
pub trait OptionExt<T> {
    /// Convert None to PassthroughError::Other with the given message.
    fn context(self, msg: &str) -> PassthroughResult<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn context(self, msg: &str) -> PassthroughResult<T> {
        self.ok_or_else(|| PassthroughError::Other(msg.to_string()))
    }
}
