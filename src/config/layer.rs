//! Layer configuration.
//!
//! Consolidates the tunables of the passthrough pipeline into one typed struct
//! read once per instance from `settings.json`.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::PassthroughResult;

/// Brightness-based rejection of corrupted camera frames.
///
/// The defaults were measured on WMR headset cameras; change them only with
/// hardware to validate against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FrameFilterConfig {
    /// A frame darker than `baseline * rejection_ratio` is suspicious.
    pub rejection_ratio: f32,
    /// Suspicious frames skipped in a row before one is accepted anyway.
    pub max_consecutive_rejections: u32,
    /// Sample every Nth byte of the straddling rows.
    pub sample_stride: usize,
}

impl Default for FrameFilterConfig {
    fn default() -> Self {
        Self {
            rejection_ratio: 0.25,
            max_consecutive_rejections: 7,
            sample_stride: 32,
        }
    }
}

/// Where the camera's metadata tags sit in the raw buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TagLayout {
    /// Bytes per block, tag included.
    pub block_size: usize,
    /// Tag bytes at the start of every block.
    pub tag_size: usize,
}

impl TagLayout {
    /// Pixel bytes per block.
    pub fn payload_size(&self) -> usize {
        self.block_size - self.tag_size
    }
}

impl Default for TagLayout {
    fn default() -> Self {
        Self {
            block_size: 1312,
            tag_size: 32,
        }
    }
}

/// Fixed per-device lens and mounting calibration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LensCalibration {
    /// Quadratic radial distortion coefficient (barrel < 0 < pincushion).
    pub k1: f32,
    /// Quartic radial distortion coefficient.
    pub k2: f32,
    /// Uniform scale of the warped image plane.
    pub radial_scale: f32,
    /// Width / height of one camera image.
    pub camera_aspect: f32,
    /// Camera position relative to each eye, meters (left, right).
    pub eye_offsets: [[f32; 3]; 2],
    /// Rotation of each camera around the vertical axis, radians (left, right).
    pub eye_cant: [f32; 2],
    /// Horizontal texture inset of the right camera image (normalized).
    pub right_eye_inset: f32,
    /// Distance of the image plane in front of the eye, meters.
    pub projection_distance: f32,
}

impl Default for LensCalibration {
    fn default() -> Self {
        Self {
            k1: -0.65,
            k2: 0.0,
            radial_scale: 1.3,
            camera_aspect: 4.0 / 3.0,
            eye_offsets: [[0.0, -0.02, -0.02], [0.0, -0.02, -0.02]],
            eye_cant: [0.0, 0.0],
            right_eye_inset: 2.0 / 1280.0,
            projection_distance: 1.0,
        }
    }
}

/// All layer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LayerConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub log_level: String,

    /// RGB multiplier applied to the (monochrome) camera image.
    pub color_adjustment: [f32; 3],

    pub frame_filter: FrameFilterConfig,

    pub tag_layout: TagLayout,

    pub calibration: LensCalibration,

    /// Peak angular jitter per axis, radians.
    pub jitter_amplitude: f32,

    /// Grid cells per side of the distortion mesh.
    pub mesh_resolution: u32,

    /// Clip planes used when the application gives no depth information.
    pub default_near_z: f32,
    pub default_far_z: f32,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            color_adjustment: [0.75, 0.75, 0.75],
            frame_filter: FrameFilterConfig::default(),
            tag_layout: TagLayout::default(),
            calibration: LensCalibration::default(),
            jitter_amplitude: 0.0002,
            mesh_resolution: 20,
            default_near_z: 0.1,
            default_far_z: 100.0,
        }
    }
}

impl LayerConfig {
    /// Validate and clamp settings to acceptable ranges.
    pub fn validate(&mut self) {
        for channel in &mut self.color_adjustment {
            *channel = channel.clamp(0.0, 1.0);
        }

        self.frame_filter.rejection_ratio = self.frame_filter.rejection_ratio.clamp(0.0, 1.0);
        self.frame_filter.sample_stride = self.frame_filter.sample_stride.max(1);

        if self.tag_layout.tag_size >= self.tag_layout.block_size {
            log::warn!(
                "Tag size {} does not fit in block size {}, using defaults",
                self.tag_layout.tag_size,
                self.tag_layout.block_size
            );
            self.tag_layout = TagLayout::default();
        }

        if !(self.calibration.camera_aspect > 0.0) {
            self.calibration.camera_aspect = LensCalibration::default().camera_aspect;
        }
        if !(self.calibration.projection_distance > 0.0) {
            self.calibration.projection_distance = LensCalibration::default().projection_distance;
        }
        self.calibration.right_eye_inset = self.calibration.right_eye_inset.clamp(0.0, 0.25);

        self.jitter_amplitude = self.jitter_amplitude.clamp(0.0, 0.01);
        self.mesh_resolution = self.mesh_resolution.clamp(1, 128);

        self.default_near_z = self.default_near_z.max(0.001);
        if self.default_far_z <= self.default_near_z {
            self.default_far_z = self.default_near_z * 1000.0;
        }
    }

    /// The configured log level, `Info` when unparsable.
    pub fn level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> PassthroughResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let mut config: LayerConfig = serde_json::from_str(&content)?;
        config.validate();
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_camera_hardware() {
        let config = LayerConfig::default();
        assert_eq!(config.tag_layout.block_size, 1312);
        assert_eq!(config.tag_layout.tag_size, 32);
        assert_eq!(config.tag_layout.payload_size(), 1280);
        assert_eq!(config.frame_filter.max_consecutive_rejections, 7);
        assert!((config.frame_filter.rejection_ratio - 0.25).abs() < f32::EPSILON);
        assert_eq!(config.mesh_resolution, 20);
        assert!((config.calibration.k1 + 0.65).abs() < f32::EPSILON);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "logLevel": "debug", "frameFilter": { "maxConsecutiveRejections": 3 } }"#;
        let config: LayerConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.level_filter(), log::LevelFilter::Debug);
        assert_eq!(config.frame_filter.max_consecutive_rejections, 3);
        assert_eq!(config.frame_filter.sample_stride, 32);
        assert_eq!(config.tag_layout, TagLayout::default());
    }

    #[test]
    fn test_validate_clamps() {
        let mut config = LayerConfig {
            color_adjustment: [2.0, -1.0, 0.5],
            mesh_resolution: 0,
            jitter_amplitude: 1.0,
            tag_layout: TagLayout {
                block_size: 16,
                tag_size: 32,
            },
            ..Default::default()
        };
        config.validate();

        assert_eq!(config.color_adjustment, [1.0, 0.0, 0.5]);
        assert_eq!(config.mesh_resolution, 1);
        assert!(config.jitter_amplitude <= 0.01);
        assert_eq!(config.tag_layout, TagLayout::default());
    }

    #[test]
    fn test_unknown_log_level_falls_back_to_info() {
        let config = LayerConfig {
            log_level: "chatty".to_string(),
            ..Default::default()
        };
        assert_eq!(config.level_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn test_load_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("wmr-passthrough-does-not-exist.json");
        let config = LayerConfig::load(&path).unwrap();
        assert_eq!(config.mesh_resolution, LayerConfig::default().mesh_resolution);
    }

    #[test]
    fn test_load_broken_file_is_an_error() {
        let path = std::env::temp_dir().join(format!(
            "wmr-passthrough-broken-{}.json",
            std::process::id()
        ));
        fs::write(&path, "{ not json").unwrap();

        assert!(matches!(LayerConfig::load(&path), Err(crate::error::PassthroughError::Json(_))));

        let _ = fs::remove_file(&path);
    }
}
