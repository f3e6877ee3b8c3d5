//! Layer configuration management.
//!
//! Settings live next to the logs in the layer's local app-data directory:
//!
//! - `settings.json`: optional overrides of [`LayerConfig`]
//! - `logs/`: daily log files (see `crate::logging`)

pub mod layer;

use std::path::PathBuf;

pub use layer::{FrameFilterConfig, LayerConfig, LensCalibration, TagLayout};

use crate::error::PassthroughResult;
use crate::LAYER_NAME;

/// Settings file name inside [`layer_data_dir`].
pub const SETTINGS_FILE: &str = "settings.json";

/// `%LOCALAPPDATA%\XR_APILAYER_NOVENDOR_wmr_passthrough`, or the temp dir
/// when the platform has no local data directory.
pub fn layer_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(LAYER_NAME)
}

pub fn settings_path() -> PathBuf {
    layer_data_dir().join(SETTINGS_FILE)
}

/// Load the settings file from [`layer_data_dir`]. A missing file yields the
/// defaults; a broken one is an error for the caller to report.
pub fn load_layer_config() -> PassthroughResult<LayerConfig> {
    LayerConfig::load(&settings_path())
}
