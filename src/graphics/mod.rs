//! Graphics for the passthrough layer.
//!
//! `resources` owns the passthrough swapchain and drives one frame of
//! drawing. It talks to the outside world through two seams:
//! - [`XrRuntime`]: the OpenXR calls it needs (implemented by the dispatch table)
//! - [`RenderBackend`]: the GPU work (Direct3D 11, natively or bridged from 12)

pub mod mesh;
pub mod projection;
pub mod resources;
pub mod staging;

#[cfg(windows)]
pub mod d3d11;

use std::ffi::c_void;

use openxr_sys as xr;

use crate::error::PassthroughResult;

pub use mesh::{DistortionMesh, Eye, MeshVertex};
pub use projection::{DepthRange, EyeView};
pub use resources::GraphicsResources;

/// Views of the primary stereo configuration.
pub const VIEW_COUNT: usize = 2;

// ============================================================================
// Graphics binding
// ============================================================================

/// Graphics API the application created its session with, decoded from the
/// `XrSessionCreateInfo` next chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphicsBinding {
    D3D11 { device: *mut c_void },
    D3D12 { device: *mut c_void, queue: *mut c_void },
}

// Handles are only used on the session's thread; the binding itself is plain
// data.
unsafe impl Send for GraphicsBinding {}

#[repr(C)]
struct BindingHeader {
    ty: xr::StructureType,
    next: *const c_void,
}

#[repr(C)]
struct BindingD3D11 {
    ty: xr::StructureType,
    next: *const c_void,
    device: *mut c_void,
}

#[repr(C)]
struct BindingD3D12 {
    ty: xr::StructureType,
    next: *const c_void,
    device: *mut c_void,
    queue: *mut c_void,
}

impl GraphicsBinding {
    /// Walk a `next` chain looking for a D3D11 or D3D12 binding.
    ///
    /// # Safety
    /// `next` must be null or point to a valid OpenXR structure chain.
    pub unsafe fn from_next_chain(mut next: *const c_void) -> Option<Self> {
        while !next.is_null() {
            let header = &*(next as *const BindingHeader);
            match header.ty {
                xr::StructureType::GRAPHICS_BINDING_D3D11_KHR => {
                    let binding = &*(next as *const BindingD3D11);
                    return Some(GraphicsBinding::D3D11 {
                        device: binding.device,
                    });
                },
                xr::StructureType::GRAPHICS_BINDING_D3D12_KHR => {
                    let binding = &*(next as *const BindingD3D12);
                    return Some(GraphicsBinding::D3D12 {
                        device: binding.device,
                        queue: binding.queue,
                    });
                },
                _ => next = header.next,
            }
        }
        None
    }

    pub fn api_name(&self) -> &'static str {
        match self {
            GraphicsBinding::D3D11 { .. } => "D3D11",
            GraphicsBinding::D3D12 { .. } => "D3D12",
        }
    }

    /// Structure type of this API's swapchain image struct.
    pub fn swapchain_image_type(&self) -> xr::StructureType {
        match self {
            GraphicsBinding::D3D11 { .. } => xr::StructureType::SWAPCHAIN_IMAGE_D3D11_KHR,
            GraphicsBinding::D3D12 { .. } => xr::StructureType::SWAPCHAIN_IMAGE_D3D12_KHR,
        }
    }
}

// ============================================================================
// Runtime seam
// ============================================================================

/// The OpenXR calls the graphics code makes, already error-checked.
pub trait XrRuntime: Send + Sync {
    fn instance(&self) -> xr::Instance;

    fn enumerate_swapchain_formats(&self, session: xr::Session) -> PassthroughResult<Vec<i64>>;

    fn enumerate_view_configuration_views(
        &self,
        system: xr::SystemId,
        view_type: xr::ViewConfigurationType,
    ) -> PassthroughResult<Vec<xr::ViewConfigurationView>>;

    fn create_reference_space(
        &self,
        session: xr::Session,
        info: &xr::ReferenceSpaceCreateInfo,
    ) -> PassthroughResult<xr::Space>;

    fn destroy_space(&self, space: xr::Space) -> PassthroughResult<()>;

    fn create_swapchain(
        &self,
        session: xr::Session,
        info: &xr::SwapchainCreateInfo,
    ) -> PassthroughResult<xr::Swapchain>;

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> PassthroughResult<()>;

    /// Native texture pointers of every image, for the API identified by
    /// `image_type`.
    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        image_type: xr::StructureType,
    ) -> PassthroughResult<Vec<*mut c_void>>;

    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> PassthroughResult<u32>;

    fn wait_swapchain_image(&self, swapchain: xr::Swapchain, timeout: xr::Duration) -> PassthroughResult<()>;

    fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> PassthroughResult<()>;

    fn locate_views(
        &self,
        session: xr::Session,
        info: &xr::ViewLocateInfo,
    ) -> PassthroughResult<(xr::ViewState, Vec<xr::View>)>;
}

// ============================================================================
// GPU seam
// ============================================================================

/// Size and format of the passthrough swapchain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainLayout {
    pub format: i64,
    pub width: u32,
    pub height: u32,
    pub array_size: u32,
}

/// Everything the backend needs to build its pipeline once.
pub struct PipelineDesc<'a> {
    pub meshes: &'a [DistortionMesh; VIEW_COUNT],
    pub color_adjustment: [f32; 3],
}

/// GPU side of the passthrough layer.
pub trait RenderBackend: Send {
    fn api_name(&self) -> &'static str;

    /// Wrap the swapchain's native textures as per-eye render targets.
    fn import_swapchain_images(&mut self, textures: &[*mut c_void], layout: &SwapchainLayout) -> PassthroughResult<()>;

    /// Shaders, mesh buffers, constant buffers and states.
    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> PassthroughResult<()>;

    /// Replace the camera texture contents with a tightly packed R8 image,
    /// (re)creating the texture when the size changes.
    fn upload_camera_image(&mut self, pixels: &[u8], width: u32, height: u32) -> PassthroughResult<()>;

    /// Whether a camera image was uploaded before.
    fn has_camera_image(&self) -> bool;

    /// Start rendering into swapchain image `image_index`.
    fn begin_draw(&mut self, image_index: u32) -> PassthroughResult<()>;

    /// Draw one eye's mesh into its array slice.
    fn draw_eye(&mut self, eye: Eye, mvp: &glam::Mat4) -> PassthroughResult<()>;

    /// Submit the work recorded since [`Self::begin_draw`].
    fn end_draw(&mut self) -> PassthroughResult<()>;

    /// Discard the work recorded since [`Self::begin_draw`] and hand the
    /// swapchain image back. Does nothing outside a draw.
    fn abort_draw(&mut self);

    /// Block until the GPU no longer uses any of our resources.
    fn wait_idle(&mut self) -> PassthroughResult<()>;

    /// Drop the render targets of the swapchain images.
    fn release_swapchain_images(&mut self);
}

/// Creates a backend for a session's graphics binding.
pub type BackendFactory = Box<dyn Fn(&GraphicsBinding) -> PassthroughResult<Box<dyn RenderBackend>> + Send>;

/// The Direct3D backend for `binding`.
#[cfg(windows)]
pub fn create_backend(binding: &GraphicsBinding) -> PassthroughResult<Box<dyn RenderBackend>> {
    let backend = match *binding {
        GraphicsBinding::D3D11 { device } => unsafe { d3d11::D3D11Backend::from_d3d11(device)? },
        GraphicsBinding::D3D12 { device, queue } => unsafe { d3d11::D3D11Backend::from_d3d12(device, queue)? },
    };
    Ok(Box::new(backend))
}

#[cfg(not(windows))]
pub fn create_backend(binding: &GraphicsBinding) -> PassthroughResult<Box<dyn RenderBackend>> {
    Err(crate::error::PassthroughError::UnsupportedGraphics(format!(
        "{} is only available on Windows",
        binding.api_name()
    )))
}

/// Default [`BackendFactory`].
pub fn default_backend_factory() -> BackendFactory {
    Box::new(create_backend)
}
