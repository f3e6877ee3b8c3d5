//! Test doubles: a runtime made of `extern "system"` functions, a GPU
//! backend and a camera source.
//!
//! Everything records into one thread-local [`mock::MockState`], so each
//! test (running on its own thread) sees its own runtime.

use std::ffi::c_void;
use std::sync::Arc;

use wmr_camera_feed::{CameraFeed, CameraFrame, CameraSource, FeedSource};

use crate::config::{LayerConfig, TagLayout};
use crate::error::{PassthroughError, PassthroughResult};
use crate::graphics::resources::CameraConnector;
use crate::graphics::staging::raw_len;
use crate::graphics::{BackendFactory, Eye, GraphicsBinding, PipelineDesc, RenderBackend, SwapchainLayout};

pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Defaults with a small tag layout so test frames stay tiny.
pub fn test_config() -> LayerConfig {
    LayerConfig {
        tag_layout: TagLayout {
            block_size: 10,
            tag_size: 2,
        },
        ..LayerConfig::default()
    }
}

/// A raw camera buffer of uniform brightness for [`test_config`].
pub fn camera_frame_bytes(width: u32, height: u32, value: u8) -> Vec<u8> {
    vec![value; raw_len(width as usize, height as usize, &test_config().tag_layout)]
}

pub mod mock {
    use std::cell::RefCell;
    use std::ffi::{c_char, CStr};
    use std::mem;
    use std::ptr;

    use openxr_sys as xr;
    use openxr_sys::pfn;

    use super::*;

    pub const SYSTEM_ID: u64 = 42;
    pub const SWAPCHAIN_FORMATS: [i64; 2] = [29, 28];
    pub const VIEW_SIZE: u32 = 1440;

    pub fn instance() -> xr::Instance {
        xr::Instance::from_raw(1)
    }

    pub fn system() -> xr::SystemId {
        xr::SystemId::from_raw(SYSTEM_ID)
    }

    /// One composition layer as the runtime received it.
    #[derive(Debug, Clone, Copy)]
    pub struct RecordedLayer {
        pub header: *const xr::CompositionLayerBaseHeader,
        pub ty: xr::StructureType,
        pub flags: xr::CompositionLayerFlags,
        pub space: xr::Space,
        /// First view's swapchain, for projection layers.
        pub swapchain: Option<xr::Swapchain>,
    }

    #[derive(Debug, Clone)]
    pub struct RecordedEndFrame {
        pub info: *const xr::FrameEndInfo,
        pub layer_array: *const *const xr::CompositionLayerBaseHeader,
        pub blend_mode: xr::EnvironmentBlendMode,
        pub layers: Vec<RecordedLayer>,
    }

    /// What the backend was asked to do.
    #[derive(Debug, Default)]
    pub struct BackendLog {
        pub imported_images: usize,
        pub layout: Option<SwapchainLayout>,
        pub pipelines: u32,
        pub uploads: Vec<(u32, u32, usize)>,
        pub draws: Vec<(u32, Eye)>,
        pub submitted: u32,
        pub aborted: u32,
        pub fail_draw: bool,
    }

    pub struct MockState {
        /// Every runtime and backend call, in order.
        pub calls: Vec<&'static str>,
        pub proc_addr_queries: u32,
        /// Names the mock `xrGetInstanceProcAddr` refuses to resolve.
        pub missing: Vec<&'static str>,

        pub next_handle: u64,
        pub upstream_blend_modes: Vec<xr::EnvironmentBlendMode>,
        pub view_state_flags: xr::ViewStateFlags,
        pub image_count: u32,
        pub acquired_images: u32,
        pub released_images: u32,
        pub fail_wait: bool,
        pub swapchain_info: Option<(u32, u32, u32, i64)>,
        pub end_frames: Vec<RecordedEndFrame>,

        pub backend: BackendLog,
        pub camera_acquired: u32,
        pub camera_released: u32,
    }

    impl Default for MockState {
        fn default() -> Self {
            Self {
                calls: Vec::new(),
                proc_addr_queries: 0,
                missing: Vec::new(),
                next_handle: 100,
                upstream_blend_modes: vec![xr::EnvironmentBlendMode::OPAQUE],
                view_state_flags: xr::ViewStateFlags::ORIENTATION_VALID | xr::ViewStateFlags::POSITION_VALID,
                image_count: 3,
                acquired_images: 0,
                released_images: 0,
                fail_wait: false,
                swapchain_info: None,
                end_frames: Vec::new(),
                backend: BackendLog::default(),
                camera_acquired: 0,
                camera_released: 0,
            }
        }
    }

    impl MockState {
        pub fn count(&self, call: &str) -> usize {
            self.calls.iter().filter(|&&c| c == call).count()
        }

        pub fn position(&self, call: &str) -> Option<usize> {
            self.calls.iter().position(|&c| c == call)
        }

        fn handle(&mut self) -> u64 {
            self.next_handle += 1;
            self.next_handle
        }
    }

    thread_local! {
        static STATE: RefCell<MockState> = RefCell::new(MockState::default());
    }

    pub fn reset() {
        init_test_logging();
        STATE.with(|state| *state.borrow_mut() = MockState::default());
    }

    pub fn with_state<R>(f: impl FnOnce(&mut MockState) -> R) -> R {
        STATE.with(|state| f(&mut state.borrow_mut()))
    }

    fn record(call: &'static str) {
        with_state(|state| state.calls.push(call));
    }

    unsafe fn void<T: Copy>(function: T) -> pfn::VoidFunction {
        mem::transmute_copy(&function)
    }

    /// The mock's function for `name`.
    pub fn lookup(name: &str) -> Option<pfn::VoidFunction> {
        let function = unsafe {
            match name {
                "xrGetInstanceProcAddr" => void(get_instance_proc_addr as pfn::GetInstanceProcAddr),
                "xrDestroyInstance" => void(destroy_instance as pfn::DestroyInstance),
                "xrGetInstanceProperties" => void(get_instance_properties as pfn::GetInstanceProperties),
                "xrGetSystem" => void(get_system as pfn::GetSystem),
                "xrEnumerateEnvironmentBlendModes" => {
                    void(enumerate_environment_blend_modes as pfn::EnumerateEnvironmentBlendModes)
                },
                "xrCreateSession" => void(create_session as pfn::CreateSession),
                "xrDestroySession" => void(destroy_session as pfn::DestroySession),
                "xrWaitFrame" => void(wait_frame as pfn::WaitFrame),
                "xrEndFrame" => void(end_frame as pfn::EndFrame),
                "xrEnumerateSwapchainFormats" => void(enumerate_swapchain_formats as pfn::EnumerateSwapchainFormats),
                "xrEnumerateViewConfigurationViews" => {
                    void(enumerate_view_configuration_views as pfn::EnumerateViewConfigurationViews)
                },
                "xrCreateReferenceSpace" => void(create_reference_space as pfn::CreateReferenceSpace),
                "xrDestroySpace" => void(destroy_space as pfn::DestroySpace),
                "xrCreateSwapchain" => void(create_swapchain as pfn::CreateSwapchain),
                "xrDestroySwapchain" => void(destroy_swapchain as pfn::DestroySwapchain),
                "xrEnumerateSwapchainImages" => void(enumerate_swapchain_images as pfn::EnumerateSwapchainImages),
                "xrAcquireSwapchainImage" => void(acquire_swapchain_image as pfn::AcquireSwapchainImage),
                "xrWaitSwapchainImage" => void(wait_swapchain_image as pfn::WaitSwapchainImage),
                "xrReleaseSwapchainImage" => void(release_swapchain_image as pfn::ReleaseSwapchainImage),
                "xrLocateViews" => void(locate_views as pfn::LocateViews),
                _ => return None,
            }
        };
        Some(function)
    }

    pub unsafe extern "system" fn get_instance_proc_addr(
        _instance: xr::Instance,
        name: *const c_char,
        function: *mut Option<pfn::VoidFunction>,
    ) -> xr::Result {
        let name = CStr::from_ptr(name).to_string_lossy();
        let missing = with_state(|state| {
            state.proc_addr_queries += 1;
            state.missing.iter().any(|&m| m == name)
        });

        *function = if missing { None } else { lookup(&name) };
        if (*function).is_some() {
            xr::Result::SUCCESS
        } else {
            xr::Result::ERROR_FUNCTION_UNSUPPORTED
        }
    }

    unsafe extern "system" fn destroy_instance(_instance: xr::Instance) -> xr::Result {
        record("xrDestroyInstance");
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn get_instance_properties(
        _instance: xr::Instance,
        properties: *mut xr::InstanceProperties,
    ) -> xr::Result {
        let name = b"Mock Runtime";
        for (dst, &src) in (*properties).runtime_name.iter_mut().zip(name.iter()) {
            *dst = src as c_char;
        }
        (*properties).runtime_name[name.len()] = 0;
        (*properties).runtime_version = xr::Version::new(1, 2, 3);
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn get_system(
        _instance: xr::Instance,
        info: *const xr::SystemGetInfo,
        system_id: *mut xr::SystemId,
    ) -> xr::Result {
        record("xrGetSystem");
        if (*info).form_factor != xr::FormFactor::HEAD_MOUNTED_DISPLAY {
            return xr::Result::ERROR_FORM_FACTOR_UNAVAILABLE;
        }
        *system_id = system();
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn enumerate_environment_blend_modes(
        _instance: xr::Instance,
        _system_id: xr::SystemId,
        _view_type: xr::ViewConfigurationType,
        capacity: u32,
        count: *mut u32,
        modes: *mut xr::EnvironmentBlendMode,
    ) -> xr::Result {
        let upstream = with_state(|state| state.upstream_blend_modes.clone());
        *count = upstream.len() as u32;
        if capacity == 0 {
            return xr::Result::SUCCESS;
        }
        if (capacity as usize) < upstream.len() {
            return xr::Result::ERROR_SIZE_INSUFFICIENT;
        }
        for (i, mode) in upstream.iter().enumerate() {
            *modes.add(i) = *mode;
        }
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn create_session(
        _instance: xr::Instance,
        _info: *const xr::SessionCreateInfo,
        session: *mut xr::Session,
    ) -> xr::Result {
        record("xrCreateSession");
        *session = xr::Session::from_raw(with_state(MockState::handle));
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn destroy_session(_session: xr::Session) -> xr::Result {
        record("xrDestroySession");
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn wait_frame(
        _session: xr::Session,
        _info: *const xr::FrameWaitInfo,
        _state: *mut xr::FrameState,
    ) -> xr::Result {
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn end_frame(_session: xr::Session, info: *const xr::FrameEndInfo) -> xr::Result {
        record("xrEndFrame");
        let frame = &*info;
        let headers = if frame.layer_count == 0 {
            &[][..]
        } else {
            std::slice::from_raw_parts(frame.layers, frame.layer_count as usize)
        };

        let layers = headers
            .iter()
            .map(|&header| {
                let base = &*header;
                let swapchain = if base.ty == xr::StructureType::COMPOSITION_LAYER_PROJECTION {
                    let projection = &*(header as *const xr::CompositionLayerProjection);
                    Some((*projection.views).sub_image.swapchain)
                } else {
                    None
                };
                RecordedLayer {
                    header,
                    ty: base.ty,
                    flags: base.layer_flags,
                    space: base.space,
                    swapchain,
                }
            })
            .collect();

        with_state(|state| {
            state.end_frames.push(RecordedEndFrame {
                info,
                layer_array: frame.layers,
                blend_mode: frame.environment_blend_mode,
                layers,
            })
        });
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn enumerate_swapchain_formats(
        _session: xr::Session,
        capacity: u32,
        count: *mut u32,
        formats: *mut i64,
    ) -> xr::Result {
        *count = SWAPCHAIN_FORMATS.len() as u32;
        if capacity == 0 {
            return xr::Result::SUCCESS;
        }
        for (i, format) in SWAPCHAIN_FORMATS.iter().enumerate().take(capacity as usize) {
            *formats.add(i) = *format;
        }
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn enumerate_view_configuration_views(
        _instance: xr::Instance,
        _system_id: xr::SystemId,
        _view_type: xr::ViewConfigurationType,
        capacity: u32,
        count: *mut u32,
        views: *mut xr::ViewConfigurationView,
    ) -> xr::Result {
        *count = 2;
        for i in 0..capacity.min(2) as usize {
            let view = &mut *views.add(i);
            view.recommended_image_rect_width = VIEW_SIZE;
            view.recommended_image_rect_height = VIEW_SIZE;
            view.max_image_rect_width = VIEW_SIZE * 2;
            view.max_image_rect_height = VIEW_SIZE * 2;
            view.recommended_swapchain_sample_count = 1;
            view.max_swapchain_sample_count = 4;
        }
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn create_reference_space(
        _session: xr::Session,
        _info: *const xr::ReferenceSpaceCreateInfo,
        space: *mut xr::Space,
    ) -> xr::Result {
        record("xrCreateReferenceSpace");
        *space = xr::Space::from_raw(with_state(MockState::handle));
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn destroy_space(_space: xr::Space) -> xr::Result {
        record("xrDestroySpace");
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn create_swapchain(
        _session: xr::Session,
        info: *const xr::SwapchainCreateInfo,
        swapchain: *mut xr::Swapchain,
    ) -> xr::Result {
        record("xrCreateSwapchain");
        let info = &*info;
        let handle = with_state(|state| {
            state.swapchain_info = Some((info.width, info.height, info.array_size, info.format));
            state.handle()
        });
        *swapchain = xr::Swapchain::from_raw(handle);
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn destroy_swapchain(_swapchain: xr::Swapchain) -> xr::Result {
        record("xrDestroySwapchain");
        xr::Result::SUCCESS
    }

    #[repr(C)]
    struct SwapchainImageNative {
        ty: xr::StructureType,
        next: *mut c_void,
        texture: *mut c_void,
    }

    unsafe extern "system" fn enumerate_swapchain_images(
        _swapchain: xr::Swapchain,
        capacity: u32,
        count: *mut u32,
        images: *mut xr::SwapchainImageBaseHeader,
    ) -> xr::Result {
        let image_count = with_state(|state| state.image_count);
        *count = image_count;
        if capacity == 0 {
            return xr::Result::SUCCESS;
        }
        let images = images as *mut SwapchainImageNative;
        for i in 0..capacity.min(image_count) as usize {
            (*images.add(i)).texture = (0x1000 + i) as *mut c_void;
        }
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn acquire_swapchain_image(
        _swapchain: xr::Swapchain,
        _info: *const xr::SwapchainImageAcquireInfo,
        index: *mut u32,
    ) -> xr::Result {
        record("xrAcquireSwapchainImage");
        *index = with_state(|state| {
            let index = state.acquired_images % state.image_count;
            state.acquired_images += 1;
            index
        });
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn wait_swapchain_image(
        _swapchain: xr::Swapchain,
        _info: *const xr::SwapchainImageWaitInfo,
    ) -> xr::Result {
        record("xrWaitSwapchainImage");
        if with_state(|state| state.fail_wait) {
            xr::Result::ERROR_RUNTIME_FAILURE
        } else {
            xr::Result::SUCCESS
        }
    }

    unsafe extern "system" fn release_swapchain_image(
        _swapchain: xr::Swapchain,
        _info: *const xr::SwapchainImageReleaseInfo,
    ) -> xr::Result {
        record("xrReleaseSwapchainImage");
        with_state(|state| state.released_images += 1);
        xr::Result::SUCCESS
    }

    unsafe extern "system" fn locate_views(
        _session: xr::Session,
        _info: *const xr::ViewLocateInfo,
        view_state: *mut xr::ViewState,
        capacity: u32,
        count: *mut u32,
        views: *mut xr::View,
    ) -> xr::Result {
        record("xrLocateViews");
        (*view_state).view_state_flags = with_state(|state| state.view_state_flags);
        *count = 2;
        if capacity < 2 {
            return if capacity == 0 {
                xr::Result::SUCCESS
            } else {
                xr::Result::ERROR_SIZE_INSUFFICIENT
            };
        }
        for i in 0..2 {
            let view = &mut *views.add(i);
            view.pose = crate::graphics::resources::identity_pose();
            view.pose.position.x = if i == 0 { -0.032 } else { 0.032 };
            view.fov = xr::Fovf {
                angle_left: -0.8,
                angle_right: 0.8,
                angle_up: 0.8,
                angle_down: -0.8,
            };
        }
        xr::Result::SUCCESS
    }

    /// Session create info header carrying a D3D11 binding.
    #[repr(C)]
    pub struct D3D11Binding {
        pub ty: xr::StructureType,
        pub next: *const c_void,
        pub device: *mut c_void,
    }

    pub fn session_create_info(binding: *const c_void) -> xr::SessionCreateInfo {
        xr::SessionCreateInfo {
            ty: xr::SessionCreateInfo::TYPE,
            next: binding,
            create_flags: xr::SessionCreateFlags::EMPTY,
            system_id: system(),
        }
    }

    impl D3D11Binding {
        pub fn new() -> Self {
            Self {
                ty: xr::StructureType::GRAPHICS_BINDING_D3D11_KHR,
                next: ptr::null(),
                device: 0xd3d as *mut c_void,
            }
        }
    }
}

// ============================================================================
// Backend
// ============================================================================

/// Records into [`mock::MockState::backend`] and the shared call list.
#[derive(Default)]
pub struct MockBackend {
    has_image: bool,
    current_image: Option<u32>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn factory() -> BackendFactory {
        Box::new(|_binding: &GraphicsBinding| Ok(Box::new(MockBackend::new()) as Box<dyn RenderBackend>))
    }

    pub fn failing_factory() -> BackendFactory {
        Box::new(|binding: &GraphicsBinding| {
            Err(PassthroughError::UnsupportedGraphics(binding.api_name().to_string()))
        })
    }
}

impl RenderBackend for MockBackend {
    fn api_name(&self) -> &'static str {
        "Mock"
    }

    fn import_swapchain_images(&mut self, textures: &[*mut c_void], layout: &SwapchainLayout) -> PassthroughResult<()> {
        mock::with_state(|state| {
            state.calls.push("backend.import");
            state.backend.imported_images = textures.len();
            state.backend.layout = Some(*layout);
        });
        Ok(())
    }

    fn create_pipeline(&mut self, desc: &PipelineDesc<'_>) -> PassthroughResult<()> {
        assert_eq!(desc.meshes[0].index_count(), desc.meshes[1].index_count());
        mock::with_state(|state| state.backend.pipelines += 1);
        Ok(())
    }

    fn upload_camera_image(&mut self, pixels: &[u8], width: u32, height: u32) -> PassthroughResult<()> {
        assert_eq!(pixels.len(), (width * height) as usize);
        mock::with_state(|state| state.backend.uploads.push((width, height, pixels.len())));
        self.has_image = true;
        Ok(())
    }

    fn has_camera_image(&self) -> bool {
        self.has_image
    }

    fn begin_draw(&mut self, image_index: u32) -> PassthroughResult<()> {
        self.current_image = Some(image_index);
        Ok(())
    }

    fn draw_eye(&mut self, eye: Eye, mvp: &glam::Mat4) -> PassthroughResult<()> {
        assert!(mvp.is_finite());
        let image = self.current_image.ok_or(PassthroughError::NotInitialized)?;
        mock::with_state(|state| {
            if state.backend.fail_draw {
                return Err(PassthroughError::Graphics("draw failed".to_string()));
            }
            state.backend.draws.push((image, eye));
            Ok(())
        })
    }

    fn end_draw(&mut self) -> PassthroughResult<()> {
        self.current_image = None;
        mock::with_state(|state| state.backend.submitted += 1);
        Ok(())
    }

    fn abort_draw(&mut self) {
        if self.current_image.take().is_some() {
            mock::with_state(|state| {
                state.calls.push("backend.abort_draw");
                state.backend.aborted += 1;
            });
        }
    }

    fn wait_idle(&mut self) -> PassthroughResult<()> {
        mock::with_state(|state| state.calls.push("backend.wait_idle"));
        Ok(())
    }

    fn release_swapchain_images(&mut self) {
        mock::with_state(|state| state.calls.push("backend.release_images"));
    }
}

// ============================================================================
// Camera
// ============================================================================

/// A feed consumer that counts acquires and releases.
pub struct CountingCamera {
    inner: FeedSource,
}

impl CameraSource for CountingCamera {
    fn acquire_next_frame(&mut self) -> bool {
        let acquired = self.inner.acquire_next_frame();
        if acquired {
            mock::with_state(|state| state.camera_acquired += 1);
        }
        acquired
    }

    fn current_frame(&self) -> Option<&CameraFrame> {
        self.inner.current_frame()
    }

    fn release_frame(&mut self) {
        mock::with_state(|state| state.camera_released += 1);
        self.inner.release_frame();
    }
}

/// Connector handing out [`CountingCamera`]s reading from `feed`.
pub fn camera_connector(feed: &CameraFeed) -> CameraConnector {
    let feed = feed.clone();
    Arc::new(move || Box::new(CountingCamera { inner: feed.source() }) as Box<dyn CameraSource>)
}

/// Publish a uniform frame for [`test_config`].
pub fn publish_frame(feed: &CameraFeed, width: u32, height: u32, value: u8) {
    let _ = feed.publish(width, height, camera_frame_bytes(width, height, value));
}

