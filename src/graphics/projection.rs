//! Eye transforms for the passthrough quad.
//!
//! The camera image is head-locked: each eye's mesh is placed in head space
//! (the mean of both eye poses) and projected with that eye's field of view.
//! A tiny per-frame rotation jitter hides the fixed pattern of the camera
//! sensor.

use glam::{Mat4, Quat, Vec3};
use openxr_sys as xr;

use crate::config::LensCalibration;

use super::mesh::Eye;

/// Per-eye input to the transform: where the eye is and what it sees.
#[derive(Debug, Clone, Copy)]
pub struct EyeView {
    pub pose: xr::Posef,
    pub fov: xr::Fovf,
}

/// Clip planes for the projection matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DepthRange {
    pub near_z: f32,
    pub far_z: f32,
}

/// 32-bit avalanche mixer (lowbias32).
pub fn hash(mut x: u32) -> u32 {
    x ^= x >> 16;
    x = x.wrapping_mul(0x7feb_352d);
    x ^= x >> 15;
    x = x.wrapping_mul(0x846c_a68b);
    x ^= x >> 16;
    x
}

/// Small pseudo-random rotation for frame `seed`, in `[-amplitude, amplitude]`
/// radians per axis.
pub fn jitter(seed: u32, amplitude: f32) -> Vec3 {
    let axis = |i: u32| {
        let h = hash(seed.wrapping_mul(3).wrapping_add(i));
        (h as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32 * amplitude
    };
    Vec3::new(axis(0), axis(1), axis(2))
}

/// Right-handed, depth 0..1 (D3D) projection from an asymmetric field of view.
pub fn projection_from_fov(fov: &xr::Fovf, depth: DepthRange) -> Mat4 {
    let left = fov.angle_left.tan();
    let right = fov.angle_right.tan();
    let down = fov.angle_down.tan();
    let up = fov.angle_up.tan();

    let width = right - left;
    let height = up - down;
    let near = depth.near_z;
    let far = depth.far_z;

    Mat4::from_cols_array(&[
        2.0 / width,
        0.0,
        0.0,
        0.0,
        //
        0.0,
        2.0 / height,
        0.0,
        0.0,
        //
        (right + left) / width,
        (up + down) / height,
        far / (near - far),
        -1.0,
        //
        0.0,
        0.0,
        near * far / (near - far),
        0.0,
    ])
}

pub fn pose_to_mat4(pose: &xr::Posef) -> Mat4 {
    Mat4::from_rotation_translation(to_quat(&pose.orientation), to_vec3(&pose.position))
}

fn to_vec3(v: &xr::Vector3f) -> Vec3 {
    Vec3::new(v.x, v.y, v.z)
}

fn to_quat(q: &xr::Quaternionf) -> Quat {
    Quat::from_xyzw(q.x, q.y, q.z, q.w).normalize()
}

/// Head pose as the mean of both eye poses.
pub fn head_pose(views: &[EyeView; 2]) -> Mat4 {
    let position = (to_vec3(&views[0].pose.position) + to_vec3(&views[1].pose.position)) * 0.5;
    let orientation = to_quat(&views[0].pose.orientation).slerp(to_quat(&views[1].pose.orientation), 0.5);
    Mat4::from_rotation_translation(orientation, position)
}

/// Placement of one eye's mesh in head space.
pub fn model_matrix(eye: Eye, calibration: &LensCalibration, jitter: Vec3) -> Mat4 {
    let i = eye.index();
    let offset = Vec3::from_array(calibration.eye_offsets[i]);
    let distance = calibration.projection_distance;
    let scale = calibration.radial_scale * distance;

    Mat4::from_translation(offset)
        * Mat4::from_rotation_y(calibration.eye_cant[i])
        * Mat4::from_euler(glam::EulerRot::XYZ, jitter.x, jitter.y, jitter.z)
        * Mat4::from_translation(Vec3::new(0.0, 0.0, -distance))
        * Mat4::from_scale(Vec3::new(scale, scale, 1.0))
}

/// Full model-view-projection for one eye.
pub fn eye_mvp(
    eye: Eye,
    views: &[EyeView; 2],
    calibration: &LensCalibration,
    jitter: Vec3,
    depth: DepthRange,
) -> Mat4 {
    let view = views[eye.index()];
    let eye_in_head = head_pose(views).inverse() * pose_to_mat4(&view.pose);
    projection_from_fov(&view.fov, depth) * eye_in_head.inverse() * model_matrix(eye, calibration, jitter)
}
