//! Frame composition: owned copies of the application's layers and the
//! layer list submitted in their place.

use std::ffi::c_void;
use std::ptr;

use openxr_sys as xr;

use crate::config::LayerConfig;
use crate::graphics::resources::{PassthroughFrame, ProjectionSource};
use crate::graphics::{DepthRange, EyeView, VIEW_COUNT};

/// A copy of one submitted composition layer.
///
/// Known layer types are copied so their flags can be changed without
/// touching the caller's memory. Anything else is passed through by pointer.
#[derive(Debug, Clone, Copy)]
pub enum OwnedLayer {
    Projection(xr::CompositionLayerProjection),
    Quad(xr::CompositionLayerQuad),
    Cylinder(xr::CompositionLayerCylinderKHR),
    Cube(xr::CompositionLayerCubeKHR),
    Equirect(xr::CompositionLayerEquirectKHR),
    Equirect2(xr::CompositionLayerEquirect2KHR),
    Foreign(*const xr::CompositionLayerBaseHeader),
}

impl OwnedLayer {
    /// Copy the layer at `header`.
    ///
    /// # Safety
    /// `header` must be null or point to a composition layer structure whose
    /// type field matches its layout.
    pub unsafe fn copy_from(header: *const xr::CompositionLayerBaseHeader) -> Self {
        if header.is_null() {
            return OwnedLayer::Foreign(header);
        }

        match (*header).ty {
            xr::StructureType::COMPOSITION_LAYER_PROJECTION => {
                OwnedLayer::Projection(*(header as *const xr::CompositionLayerProjection))
            },
            xr::StructureType::COMPOSITION_LAYER_QUAD => OwnedLayer::Quad(*(header as *const xr::CompositionLayerQuad)),
            xr::StructureType::COMPOSITION_LAYER_CYLINDER_KHR => {
                OwnedLayer::Cylinder(*(header as *const xr::CompositionLayerCylinderKHR))
            },
            xr::StructureType::COMPOSITION_LAYER_CUBE_KHR => {
                OwnedLayer::Cube(*(header as *const xr::CompositionLayerCubeKHR))
            },
            xr::StructureType::COMPOSITION_LAYER_EQUIRECT_KHR => {
                OwnedLayer::Equirect(*(header as *const xr::CompositionLayerEquirectKHR))
            },
            xr::StructureType::COMPOSITION_LAYER_EQUIRECT2_KHR => {
                OwnedLayer::Equirect2(*(header as *const xr::CompositionLayerEquirect2KHR))
            },
            other => {
                log::trace!("Passing unknown layer type {:?} through", other);
                OwnedLayer::Foreign(header)
            },
        }
    }

    /// Copy every layer of `info`.
    ///
    /// # Safety
    /// `info.layers` must hold `info.layer_count` valid layer pointers.
    pub unsafe fn copy_all(info: &xr::FrameEndInfo) -> Vec<Self> {
        if info.layers.is_null() || info.layer_count == 0 {
            return Vec::new();
        }
        std::slice::from_raw_parts(info.layers, info.layer_count as usize)
            .iter()
            .map(|&header| Self::copy_from(header))
            .collect()
    }

    fn flags_mut(&mut self) -> Option<&mut xr::CompositionLayerFlags> {
        match self {
            OwnedLayer::Projection(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Quad(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Cylinder(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Cube(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Equirect(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Equirect2(layer) => Some(&mut layer.layer_flags),
            OwnedLayer::Foreign(_) => None,
        }
    }

    /// Blend the layer by its own alpha over the passthrough layer.
    pub fn enable_source_alpha(&mut self) {
        if let Some(flags) = self.flags_mut() {
            *flags = *flags | xr::CompositionLayerFlags::BLEND_TEXTURE_SOURCE_ALPHA;
        }
    }

    /// Pointer to hand to the runtime. Valid while `self` is not moved.
    pub fn as_header(&self) -> *const xr::CompositionLayerBaseHeader {
        match self {
            OwnedLayer::Projection(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Quad(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Cylinder(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Cube(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Equirect(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Equirect2(layer) => layer as *const _ as *const xr::CompositionLayerBaseHeader,
            OwnedLayer::Foreign(header) => *header,
        }
    }
}

/// Eye poses of the first projection layer in `layers`.
///
/// # Safety
/// Projection layers must point to `view_count` valid views.
pub unsafe fn projection_source(layers: &[OwnedLayer], config: &LayerConfig) -> Option<ProjectionSource> {
    let layer = layers.iter().find_map(|layer| match layer {
        OwnedLayer::Projection(projection) => Some(projection),
        _ => None,
    })?;

    if layer.views.is_null() || (layer.view_count as usize) < VIEW_COUNT {
        return None;
    }
    let views = std::slice::from_raw_parts(layer.views, VIEW_COUNT);
    let eye = |view: &xr::CompositionLayerProjectionView| EyeView {
        pose: view.pose,
        fov: view.fov,
    };

    let depth = find_depth_info(views[0].next).map(|info| sanitize_depth(info.near_z, info.far_z, config));

    Some(ProjectionSource {
        space: layer.space,
        views: [eye(&views[0]), eye(&views[1])],
        depth,
    })
}

unsafe fn find_depth_info(mut next: *const c_void) -> Option<xr::CompositionLayerDepthInfoKHR> {
    while !next.is_null() {
        let header = &*(next as *const xr::BaseInStructure);
        if header.ty == xr::StructureType::COMPOSITION_LAYER_DEPTH_INFO_KHR {
            return Some(*(next as *const xr::CompositionLayerDepthInfoKHR));
        }
        next = header.next as *const c_void;
    }
    None
}

/// Clip planes from application depth info. Reversed-Z ranges are swapped
/// back; an infinite or unusable plane takes the configured default.
pub fn sanitize_depth(near_z: f32, far_z: f32, config: &LayerConfig) -> DepthRange {
    let (near_z, far_z) = if near_z > far_z { (far_z, near_z) } else { (near_z, far_z) };

    let near_z = if near_z.is_finite() && near_z > 0.0 {
        near_z
    } else {
        config.default_near_z
    };
    let far_z = if far_z.is_finite() && far_z > near_z {
        far_z
    } else {
        config.default_far_z.max(near_z * 1000.0)
    };

    DepthRange { near_z, far_z }
}

/// The layer list submitted instead of the application's.
pub struct FrameComposition {
    views: [xr::CompositionLayerProjectionView; VIEW_COUNT],
    passthrough: xr::CompositionLayerProjection,
    layers: Vec<OwnedLayer>,
    headers: Vec<*const xr::CompositionLayerBaseHeader>,
}

impl FrameComposition {
    /// `layers` get the source alpha flag; the passthrough layer goes first.
    pub fn new(frame: PassthroughFrame, mut layers: Vec<OwnedLayer>) -> Self {
        for layer in &mut layers {
            layer.enable_source_alpha();
        }

        Self {
            views: frame.views,
            passthrough: xr::CompositionLayerProjection {
                ty: xr::CompositionLayerProjection::TYPE,
                next: ptr::null(),
                layer_flags: xr::CompositionLayerFlags::EMPTY,
                space: frame.space,
                view_count: VIEW_COUNT as u32,
                views: ptr::null(),
            },
            layers,
            headers: Vec::new(),
        }
    }

    pub fn layers(&self) -> &[OwnedLayer] {
        &self.layers
    }

    /// `original` with the composed layer list and an opaque blend mode.
    ///
    /// The returned structure points into `self` and is valid until `self` is
    /// moved or mutated.
    pub fn frame_end_info(&mut self, original: &xr::FrameEndInfo) -> xr::FrameEndInfo {
        self.passthrough.views = self.views.as_ptr();

        self.headers.clear();
        self.headers
            .push(&self.passthrough as *const _ as *const xr::CompositionLayerBaseHeader);
        self.headers
            .extend(self.layers.iter().map(OwnedLayer::as_header));

        xr::FrameEndInfo {
            ty: original.ty,
            next: original.next,
            display_time: original.display_time,
            environment_blend_mode: xr::EnvironmentBlendMode::OPAQUE,
            layer_count: self.headers.len() as u32,
            layers: self.headers.as_ptr(),
        }
    }
}
