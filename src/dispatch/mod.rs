//! Everything that touches the loader ABI.
//!
//! - `loader`: negotiation structures shared with the OpenXR loader
//! - `table`: next-layer function table and the `xrGetInstanceProcAddr` cache
//! - `interceptor`: error and panic containment around every hook
//! - `entry`: the exported negotiation function and the hooks themselves

pub mod entry;
pub mod interceptor;
pub mod loader;
pub mod table;

pub use interceptor::intercept;
pub use table::{InterceptionTable, NextDispatch};
