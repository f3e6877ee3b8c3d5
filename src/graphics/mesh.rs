//! Lens distortion mesh.
//!
//! The camera image is drawn onto a regular grid whose vertices are pulled
//! radially to undo the barrel distortion of the camera lenses. Each eye gets
//! its own mesh because the two cameras share one side-by-side image.

use bytemuck::{Pod, Zeroable};

use crate::config::LensCalibration;

/// Vertex layout shared with the vertex shader (`POSITION`, `TEXCOORD`).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshVertex {
    pub position: [f32; 2],
    pub texcoord: [f32; 2],
}

/// Which half of the side-by-side camera image a mesh samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eye {
    Left = 0,
    Right = 1,
}

impl Eye {
    pub const BOTH: [Eye; 2] = [Eye::Left, Eye::Right];

    pub fn index(self) -> usize {
        self as usize
    }
}

/// Warped grid for one eye.
#[derive(Debug, Clone, PartialEq)]
pub struct DistortionMesh {
    pub vertices: Vec<MeshVertex>,
    pub indices: Vec<u16>,
}

impl DistortionMesh {
    /// Build a `resolution` x `resolution` cell grid for `eye`.
    pub fn build(eye: Eye, resolution: u32, calibration: &LensCalibration) -> Self {
        let cells = resolution.max(1) as usize;
        let stride = cells + 1;

        let mut vertices = Vec::with_capacity(stride * stride);
        for j in 0..stride {
            let y = j as f32 / cells as f32;
            for i in 0..stride {
                let x = i as f32 / cells as f32;
                vertices.push(MeshVertex {
                    position: warp(x, y, calibration),
                    texcoord: texcoord(eye, x, y, calibration.right_eye_inset),
                });
            }
        }

        let mut indices = Vec::with_capacity(cells * cells * 6);
        for j in 0..cells {
            for i in 0..cells {
                let a = (j * stride + i) as u16;
                let b = a + 1;
                let c = a + stride as u16;
                let d = c + 1;
                indices.extend_from_slice(&[a, c, b, b, c, d]);
            }
        }

        Self { vertices, indices }
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }
}

/// Radial warp of the normalized grid point `(x, y)` (origin top-left).
fn warp(x: f32, y: f32, calibration: &LensCalibration) -> [f32; 2] {
    let u = x - 0.5;
    let v = (0.5 - y) / calibration.camera_aspect;
    let r2 = u * u + v * v;
    let d = 1.0 + calibration.k1 * r2 + calibration.k2 * r2 * r2;
    [u / d, v / d]
}

fn texcoord(eye: Eye, x: f32, y: f32, inset: f32) -> [f32; 2] {
    let s = match eye {
        Eye::Left => x * 0.5,
        Eye::Right => 0.5 + inset + x * (0.5 - inset),
    };
    [s, y]
}
