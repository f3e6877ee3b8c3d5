//! WMR passthrough OpenXR API layer.
//!
//! Sits between an application and the OpenXR runtime, forwards every call,
//! and on `xrEndFrame` prepends a projection layer showing the headset's
//! camera feed, warped for the camera lenses and blended behind the
//! application's content.
//!
//! Layout:
//! - `dispatch`: loader negotiation, the function interception table and the
//!   raw `extern "system"` hooks.
//! - `layer`: the layer context, session tracking and frame composition.
//! - `graphics`: swapchain and GPU resources for the passthrough layer, plus
//!   the distortion mesh and eye transform math.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod graphics;
pub mod layer;
pub mod logging;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::entry::xrNegotiateLoaderApiLayerInterface;
pub use error::{PassthroughError, PassthroughResult};
pub use layer::PassthroughLayer;

/// Name under which the layer is registered with the loader.
pub const LAYER_NAME: &str = "XR_APILAYER_NOVENDOR_wmr_passthrough";

/// Layer implementation version reported in the manifest.
pub const LAYER_VERSION: u32 = 1;

/// Version string of the crate, for log lines.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
