//! Function tables.
//!
//! [`NextDispatch`] holds the next layer's entry points the layer calls
//! itself, resolved eagerly when the instance is created.
//! [`InterceptionTable`] answers the application's `xrGetInstanceProcAddr`
//! queries: every name is resolved once through the next layer and cached,
//! and the few names the layer hooks are swapped for its own functions.

use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr};
use std::mem;
use std::ptr;

use openxr_sys as xr;
use openxr_sys::pfn;

use crate::error::{succeeded, PassthroughError, PassthroughResult, XrResultExt};
use crate::graphics::{XrRuntime, VIEW_COUNT};

/// Resolve `name` through `get_instance_proc_addr` as a function of type `T`.
///
/// # Safety
/// `T` must be the `pfn` type matching `name`.
pub unsafe fn resolve<T: Copy>(
    get_instance_proc_addr: pfn::GetInstanceProcAddr,
    instance: xr::Instance,
    name: &CStr,
) -> PassthroughResult<T> {
    debug_assert_eq!(mem::size_of::<T>(), mem::size_of::<pfn::VoidFunction>());

    let mut function: Option<pfn::VoidFunction> = None;
    let result = get_instance_proc_addr(instance, name.as_ptr(), &mut function);
    match function {
        Some(function) if succeeded(result) => Ok(mem::transmute_copy(&function)),
        _ => Err(PassthroughError::UnresolvedFunction {
            name: name.to_string_lossy().into_owned(),
            result: if succeeded(result) {
                xr::Result::ERROR_FUNCTION_UNSUPPORTED
            } else {
                result
            },
        }),
    }
}

// ============================================================================
// Next layer dispatch
// ============================================================================

/// Entry points of the next layer (or the runtime) used by this layer.
pub struct NextDispatch {
    instance: xr::Instance,

    pub get_instance_proc_addr: pfn::GetInstanceProcAddr,
    pub destroy_instance: pfn::DestroyInstance,
    pub get_instance_properties: pfn::GetInstanceProperties,
    pub get_system: pfn::GetSystem,
    pub enumerate_environment_blend_modes: pfn::EnumerateEnvironmentBlendModes,
    pub create_session: pfn::CreateSession,
    pub destroy_session: pfn::DestroySession,
    pub end_frame: pfn::EndFrame,

    pub enumerate_swapchain_formats: pfn::EnumerateSwapchainFormats,
    pub enumerate_view_configuration_views: pfn::EnumerateViewConfigurationViews,
    pub create_reference_space: pfn::CreateReferenceSpace,
    pub destroy_space: pfn::DestroySpace,
    pub create_swapchain: pfn::CreateSwapchain,
    pub destroy_swapchain: pfn::DestroySwapchain,
    pub enumerate_swapchain_images: pfn::EnumerateSwapchainImages,
    pub acquire_swapchain_image: pfn::AcquireSwapchainImage,
    pub wait_swapchain_image: pfn::WaitSwapchainImage,
    pub release_swapchain_image: pfn::ReleaseSwapchainImage,
    pub locate_views: pfn::LocateViews,
}

impl NextDispatch {
    /// Resolve every entry point the layer depends on. Any missing function
    /// is fatal.
    ///
    /// # Safety
    /// `get_instance_proc_addr` must be the next layer's resolver for `instance`.
    pub unsafe fn load(instance: xr::Instance, get_instance_proc_addr: pfn::GetInstanceProcAddr) -> PassthroughResult<Self> {
        let gipa = get_instance_proc_addr;
        Ok(Self {
            instance,
            get_instance_proc_addr: gipa,
            destroy_instance: resolve(gipa, instance, c"xrDestroyInstance")?,
            get_instance_properties: resolve(gipa, instance, c"xrGetInstanceProperties")?,
            get_system: resolve(gipa, instance, c"xrGetSystem")?,
            enumerate_environment_blend_modes: resolve(gipa, instance, c"xrEnumerateEnvironmentBlendModes")?,
            create_session: resolve(gipa, instance, c"xrCreateSession")?,
            destroy_session: resolve(gipa, instance, c"xrDestroySession")?,
            end_frame: resolve(gipa, instance, c"xrEndFrame")?,
            enumerate_swapchain_formats: resolve(gipa, instance, c"xrEnumerateSwapchainFormats")?,
            enumerate_view_configuration_views: resolve(gipa, instance, c"xrEnumerateViewConfigurationViews")?,
            create_reference_space: resolve(gipa, instance, c"xrCreateReferenceSpace")?,
            destroy_space: resolve(gipa, instance, c"xrDestroySpace")?,
            create_swapchain: resolve(gipa, instance, c"xrCreateSwapchain")?,
            destroy_swapchain: resolve(gipa, instance, c"xrDestroySwapchain")?,
            enumerate_swapchain_images: resolve(gipa, instance, c"xrEnumerateSwapchainImages")?,
            acquire_swapchain_image: resolve(gipa, instance, c"xrAcquireSwapchainImage")?,
            wait_swapchain_image: resolve(gipa, instance, c"xrWaitSwapchainImage")?,
            release_swapchain_image: resolve(gipa, instance, c"xrReleaseSwapchainImage")?,
            locate_views: resolve(gipa, instance, c"xrLocateViews")?,
        })
    }

    /// `(runtime name, runtime version)` from `xrGetInstanceProperties`.
    pub fn runtime_properties(&self) -> PassthroughResult<(String, xr::Version)> {
        let mut properties = xr::InstanceProperties {
            ty: xr::InstanceProperties::TYPE,
            next: ptr::null_mut(),
            runtime_version: xr::Version::new(0, 0, 0),
            runtime_name: [0; xr::MAX_RUNTIME_NAME_SIZE],
        };
        unsafe { (self.get_instance_properties)(self.instance, &mut properties) }.check("xrGetInstanceProperties")?;

        Ok((
            super::loader::c_chars_to_string(&properties.runtime_name),
            properties.runtime_version,
        ))
    }
}

/// `XrSwapchainImageD3D11KHR` / `XrSwapchainImageD3D12KHR` share this layout.
#[repr(C)]
#[derive(Clone, Copy)]
struct SwapchainImageNative {
    ty: xr::StructureType,
    next: *mut c_void,
    texture: *mut c_void,
}

impl XrRuntime for NextDispatch {
    fn instance(&self) -> xr::Instance {
        self.instance
    }

    fn enumerate_swapchain_formats(&self, session: xr::Session) -> PassthroughResult<Vec<i64>> {
        let mut count = 0u32;
        unsafe { (self.enumerate_swapchain_formats)(session, 0, &mut count, ptr::null_mut()) }
            .check("xrEnumerateSwapchainFormats")?;

        let mut formats = vec![0i64; count as usize];
        unsafe { (self.enumerate_swapchain_formats)(session, count, &mut count, formats.as_mut_ptr()) }
            .check("xrEnumerateSwapchainFormats")?;
        formats.truncate(count as usize);
        Ok(formats)
    }

    fn enumerate_view_configuration_views(
        &self,
        system: xr::SystemId,
        view_type: xr::ViewConfigurationType,
    ) -> PassthroughResult<Vec<xr::ViewConfigurationView>> {
        let mut count = 0u32;
        unsafe {
            (self.enumerate_view_configuration_views)(self.instance, system, view_type, 0, &mut count, ptr::null_mut())
        }
        .check("xrEnumerateViewConfigurationViews")?;

        let empty = xr::ViewConfigurationView {
            ty: xr::ViewConfigurationView::TYPE,
            next: ptr::null_mut(),
            recommended_image_rect_width: 0,
            max_image_rect_width: 0,
            recommended_image_rect_height: 0,
            max_image_rect_height: 0,
            recommended_swapchain_sample_count: 0,
            max_swapchain_sample_count: 0,
        };
        let mut views = vec![empty; count as usize];
        unsafe {
            (self.enumerate_view_configuration_views)(
                self.instance,
                system,
                view_type,
                count,
                &mut count,
                views.as_mut_ptr(),
            )
        }
        .check("xrEnumerateViewConfigurationViews")?;
        views.truncate(count as usize);
        Ok(views)
    }

    fn create_reference_space(
        &self,
        session: xr::Session,
        info: &xr::ReferenceSpaceCreateInfo,
    ) -> PassthroughResult<xr::Space> {
        let mut space = xr::Space::NULL;
        unsafe { (self.create_reference_space)(session, info, &mut space) }.check("xrCreateReferenceSpace")?;
        Ok(space)
    }

    fn destroy_space(&self, space: xr::Space) -> PassthroughResult<()> {
        unsafe { (self.destroy_space)(space) }.check("xrDestroySpace")?;
        Ok(())
    }

    fn create_swapchain(
        &self,
        session: xr::Session,
        info: &xr::SwapchainCreateInfo,
    ) -> PassthroughResult<xr::Swapchain> {
        let mut swapchain = xr::Swapchain::NULL;
        unsafe { (self.create_swapchain)(session, info, &mut swapchain) }.check("xrCreateSwapchain")?;
        Ok(swapchain)
    }

    fn destroy_swapchain(&self, swapchain: xr::Swapchain) -> PassthroughResult<()> {
        unsafe { (self.destroy_swapchain)(swapchain) }.check("xrDestroySwapchain")?;
        Ok(())
    }

    fn enumerate_swapchain_images(
        &self,
        swapchain: xr::Swapchain,
        image_type: xr::StructureType,
    ) -> PassthroughResult<Vec<*mut c_void>> {
        let mut count = 0u32;
        unsafe { (self.enumerate_swapchain_images)(swapchain, 0, &mut count, ptr::null_mut()) }
            .check("xrEnumerateSwapchainImages")?;

        let empty = SwapchainImageNative {
            ty: image_type,
            next: ptr::null_mut(),
            texture: ptr::null_mut(),
        };
        let mut images = vec![empty; count as usize];
        unsafe {
            (self.enumerate_swapchain_images)(
                swapchain,
                count,
                &mut count,
                images.as_mut_ptr() as *mut xr::SwapchainImageBaseHeader,
            )
        }
        .check("xrEnumerateSwapchainImages")?;

        Ok(images
            .iter()
            .take(count as usize)
            .map(|image| image.texture)
            .collect())
    }

    fn acquire_swapchain_image(&self, swapchain: xr::Swapchain) -> PassthroughResult<u32> {
        let info = xr::SwapchainImageAcquireInfo {
            ty: xr::SwapchainImageAcquireInfo::TYPE,
            next: ptr::null(),
        };
        let mut index = 0u32;
        unsafe { (self.acquire_swapchain_image)(swapchain, &info, &mut index) }.check("xrAcquireSwapchainImage")?;
        Ok(index)
    }

    fn wait_swapchain_image(&self, swapchain: xr::Swapchain, timeout: xr::Duration) -> PassthroughResult<()> {
        let info = xr::SwapchainImageWaitInfo {
            ty: xr::SwapchainImageWaitInfo::TYPE,
            next: ptr::null(),
            timeout,
        };
        let result = unsafe { (self.wait_swapchain_image)(swapchain, &info) }.check("xrWaitSwapchainImage")?;
        if result == xr::Result::TIMEOUT_EXPIRED {
            return Err(PassthroughError::Runtime {
                call: "xrWaitSwapchainImage",
                result,
            });
        }
        Ok(())
    }

    fn release_swapchain_image(&self, swapchain: xr::Swapchain) -> PassthroughResult<()> {
        let info = xr::SwapchainImageReleaseInfo {
            ty: xr::SwapchainImageReleaseInfo::TYPE,
            next: ptr::null(),
        };
        unsafe { (self.release_swapchain_image)(swapchain, &info) }.check("xrReleaseSwapchainImage")?;
        Ok(())
    }

    fn locate_views(
        &self,
        session: xr::Session,
        info: &xr::ViewLocateInfo,
    ) -> PassthroughResult<(xr::ViewState, Vec<xr::View>)> {
        let mut state = xr::ViewState {
            ty: xr::ViewState::TYPE,
            next: ptr::null_mut(),
            view_state_flags: xr::ViewStateFlags::EMPTY,
        };
        let empty = xr::View {
            ty: xr::View::TYPE,
            next: ptr::null_mut(),
            pose: crate::graphics::resources::identity_pose(),
            fov: xr::Fovf {
                angle_left: 0.0,
                angle_right: 0.0,
                angle_up: 0.0,
                angle_down: 0.0,
            },
        };
        let mut views = vec![empty; VIEW_COUNT];
        let mut count = 0u32;
        unsafe {
            (self.locate_views)(
                session,
                info,
                &mut state,
                views.len() as u32,
                &mut count,
                views.as_mut_ptr(),
            )
        }
        .check("xrLocateViews")?;
        views.truncate(count as usize);
        Ok((state, views))
    }
}

// ============================================================================
// Interception table
// ============================================================================

#[derive(Debug, Clone, Copy)]
struct Resolution {
    result: xr::Result,
    /// What the application gets.
    exposed: Option<pfn::VoidFunction>,
}

/// Name to function pointer table for one instance. Calls into the next
/// layer go through [`NextDispatch`], which holds the real functions.
pub struct InterceptionTable {
    instance: xr::Instance,
    next_get_instance_proc_addr: pfn::GetInstanceProcAddr,
    overrides: Vec<(&'static str, pfn::VoidFunction)>,
    cache: HashMap<String, Resolution>,
}

impl InterceptionTable {
    pub fn new(
        instance: xr::Instance,
        next_get_instance_proc_addr: pfn::GetInstanceProcAddr,
        overrides: Vec<(&'static str, pfn::VoidFunction)>,
    ) -> Self {
        Self {
            instance,
            next_get_instance_proc_addr,
            overrides,
            cache: HashMap::new(),
        }
    }

    pub fn is_overridden(&self, name: &str) -> bool {
        self.overrides.iter().any(|(hooked, _)| *hooked == name)
    }

    /// Function the application should call for `name`.
    ///
    /// # Safety
    /// The next layer's `xrGetInstanceProcAddr` must still be valid.
    pub unsafe fn lookup(&mut self, name: &CStr) -> (xr::Result, Option<pfn::VoidFunction>) {
        let key = name.to_string_lossy();
        if let Some(resolution) = self.cache.get(key.as_ref()) {
            return (resolution.result, resolution.exposed);
        }

        let mut real: Option<pfn::VoidFunction> = None;
        let result = (self.next_get_instance_proc_addr)(self.instance, name.as_ptr(), &mut real);

        let exposed = if succeeded(result) && real.is_some() {
            self.overrides
                .iter()
                .find(|(hooked, _)| *hooked == key)
                .map(|&(_, hook)| hook)
                .or(real)
        } else {
            None
        };

        if exposed != real {
            log::debug!("Intercepting {}", key);
        }

        let resolution = Resolution { result, exposed };
        self.cache.insert(key.into_owned(), resolution);
        (result, exposed)
    }

    pub fn cached_names(&self) -> usize {
        self.cache.len()
    }
}

/// Raw `xrGetInstanceProcAddr` name argument as a `CStr`.
///
/// # Safety
/// `name` must be null or a valid NUL-terminated string.
pub unsafe fn name_from_ptr<'a>(name: *const c_char) -> Option<&'a CStr> {
    if name.is_null() {
        None
    } else {
        Some(CStr::from_ptr(name))
    }
}
