//! The loader boundary.
//!
//! The loader finds the layer through its manifest and calls the exported
//! [`xrNegotiateLoaderApiLayerInterface`]. From there on it only talks to the
//! `extern "system"` functions in this file, which forward into the layer
//! context stored in [`LAYER`].

use std::ffi::c_char;
use std::mem;
use std::path::Path;

use lazy_static::lazy_static;
use log::LevelFilter;
use openxr_sys as xr;
use openxr_sys::pfn;
use parking_lot::Mutex;

use super::interceptor::intercept;
use super::loader::{
    FnCreateApiLayerInstance, LoaderInterfaceStructs, XrApiLayerCreateInfo, XrNegotiateApiLayerRequest,
    XrNegotiateLoaderInfo, XR_CURRENT_LOADER_API_LAYER_VERSION,
};
use super::table::{self, name_from_ptr, InterceptionTable};
use crate::config::{self, LayerConfig};
use crate::error::{succeeded, PassthroughError, PassthroughResult};
use crate::layer::{OpenXrApi, PassthroughLayer};
use crate::logging;
use crate::{LAYER_NAME, LAYER_VERSION, VERSION};

/// Everything that lives between instance creation and destruction.
struct LayerContext {
    table: InterceptionTable,
    layer: PassthroughLayer,
}

lazy_static! {
    static ref LAYER: Mutex<Option<LayerContext>> = Mutex::new(None);
}

fn with_layer<F>(f: F) -> PassthroughResult<xr::Result>
where
    F: FnOnce(&mut PassthroughLayer) -> PassthroughResult<xr::Result>,
{
    let mut slot = LAYER.lock();
    let context = slot.as_mut().ok_or(PassthroughError::NotInitialized)?;
    f(&mut context.layer)
}

/// Functions handed out in place of the next layer's.
fn overrides() -> Vec<(&'static str, pfn::VoidFunction)> {
    unsafe {
        vec![
            (
                "xrGetInstanceProcAddr",
                mem::transmute::<pfn::GetInstanceProcAddr, pfn::VoidFunction>(get_instance_proc_addr),
            ),
            (
                "xrDestroyInstance",
                mem::transmute::<pfn::DestroyInstance, pfn::VoidFunction>(destroy_instance),
            ),
            (
                "xrGetSystem",
                mem::transmute::<pfn::GetSystem, pfn::VoidFunction>(get_system),
            ),
            (
                "xrEnumerateEnvironmentBlendModes",
                mem::transmute::<pfn::EnumerateEnvironmentBlendModes, pfn::VoidFunction>(
                    enumerate_environment_blend_modes,
                ),
            ),
            (
                "xrCreateSession",
                mem::transmute::<pfn::CreateSession, pfn::VoidFunction>(create_session),
            ),
            (
                "xrDestroySession",
                mem::transmute::<pfn::DestroySession, pfn::VoidFunction>(destroy_session),
            ),
            (
                "xrEndFrame",
                mem::transmute::<pfn::EndFrame, pfn::VoidFunction>(end_frame),
            ),
        ]
    }
}

// ============================================================================
// Negotiation
// ============================================================================

/// Entry point named in the layer manifest.
///
/// # Safety
/// Called by the OpenXR loader with its negotiation structures.
#[no_mangle]
pub unsafe extern "system" fn xrNegotiateLoaderApiLayerInterface(
    loader_info: *const XrNegotiateLoaderInfo,
    layer_name: *const c_char,
    api_layer_request: *mut XrNegotiateApiLayerRequest,
) -> xr::Result {
    intercept("xrNegotiateLoaderApiLayerInterface", || {
        Ok(negotiate(loader_info, layer_name, api_layer_request))
    })
}

unsafe fn negotiate(
    loader_info: *const XrNegotiateLoaderInfo,
    layer_name: *const c_char,
    api_layer_request: *mut XrNegotiateApiLayerRequest,
) -> xr::Result {
    let (Some(loader_info), Some(request)) = (loader_info.as_ref(), api_layer_request.as_mut()) else {
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    };

    if let Some(name) = name_from_ptr(layer_name) {
        if name.to_bytes() != LAYER_NAME.as_bytes() {
            log::error!("Negotiation for unexpected layer {:?}", name);
            return xr::Result::ERROR_INITIALIZATION_FAILED;
        }
    }

    if !loader_info.is_compatible() || !request.is_valid() {
        log::error!(
            "Incompatible loader: interface {}..{}",
            loader_info.min_interface_version,
            loader_info.max_interface_version
        );
        return xr::Result::ERROR_INITIALIZATION_FAILED;
    }

    request.layer_interface_version = XR_CURRENT_LOADER_API_LAYER_VERSION;
    request.layer_api_version = xr::CURRENT_API_VERSION;
    request.get_instance_proc_addr = Some(get_instance_proc_addr);
    request.create_api_layer_instance = Some(create_api_layer_instance as FnCreateApiLayerInstance);
    xr::Result::SUCCESS
}

// ============================================================================
// Instance lifecycle
// ============================================================================

unsafe extern "system" fn create_api_layer_instance(
    info: *const xr::InstanceCreateInfo,
    api_layer_info: *const XrApiLayerCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result {
    intercept("xrCreateApiLayerInstance", || {
        create_instance(info, api_layer_info, instance)
    })
}

unsafe fn create_instance(
    info: *const xr::InstanceCreateInfo,
    api_layer_info: *const XrApiLayerCreateInfo,
    instance: *mut xr::Instance,
) -> PassthroughResult<xr::Result> {
    let log_dir = config::layer_data_dir().join("logs");
    let config = startup_config(&log_dir, config::load_layer_config());

    chain_instance(info, api_layer_info, instance, config)
}

/// Bring logging up at the configured level, then settle on the settings to
/// run with. A broken settings file is reported in the log and replaced by
/// the defaults.
fn startup_config(log_dir: &Path, loaded: PassthroughResult<LayerConfig>) -> LayerConfig {
    let level = loaded
        .as_ref()
        .map_or(LevelFilter::Info, LayerConfig::level_filter);
    if let Err(e) = logging::init_logging(log_dir, level) {
        eprintln!("[{}] Failed to initialize logging: {}", LAYER_NAME, e);
    }
    log::info!("{} {} (implementation version {}) loading", LAYER_NAME, VERSION, LAYER_VERSION);

    loaded.unwrap_or_else(|e| {
        log::warn!("Ignoring settings file {:?}: {}", config::settings_path(), e);
        LayerConfig::default()
    })
}

/// Create the instance through the rest of the chain, then build the layer
/// context for it.
unsafe fn chain_instance(
    info: *const xr::InstanceCreateInfo,
    api_layer_info: *const XrApiLayerCreateInfo,
    instance: *mut xr::Instance,
    config: LayerConfig,
) -> PassthroughResult<xr::Result> {
    let api_layer_info = api_layer_info
        .as_ref()
        .ok_or_else(|| PassthroughError::InvalidArgument("null XrApiLayerCreateInfo".to_string()))?;
    let next_info = api_layer_info
        .next_info
        .as_ref()
        .filter(|next| next.struct_type == LoaderInterfaceStructs::ApiLayerNextInfo)
        .ok_or_else(|| PassthroughError::InvalidArgument("missing XrApiLayerNextInfo".to_string()))?;
    if instance.is_null() {
        return Err(PassthroughError::InvalidArgument("null instance output".to_string()));
    }

    // The next layer sees the chain starting after us.
    let mut chained = *api_layer_info;
    chained.next_info = next_info.next;
    let result = (next_info.next_create_api_layer_instance)(info, &chained, instance);
    if !succeeded(result) {
        log::error!("Next layer failed to create the instance: {:?}", result);
        return Ok(result);
    }

    let created = *instance;
    let next_gipa = next_info.next_get_instance_proc_addr;
    match PassthroughLayer::create(created, next_gipa, info, config) {
        Ok(layer) => {
            let table = InterceptionTable::new(created, next_gipa, overrides());
            *LAYER.lock() = Some(LayerContext { table, layer });
            log::info!("Layer ready for instance {:?}", created);
            Ok(result)
        },
        Err(e) => {
            log::error!("Layer initialization failed, destroying instance: {}", e);
            match table::resolve::<pfn::DestroyInstance>(next_gipa, created, c"xrDestroyInstance") {
                Ok(destroy) => {
                    destroy(created);
                },
                Err(destroy_err) => log::error!("{}", destroy_err),
            }
            *instance = xr::Instance::NULL;
            Err(e)
        },
    }
}

unsafe extern "system" fn destroy_instance(instance: xr::Instance) -> xr::Result {
    intercept("xrDestroyInstance", || {
        let mut slot = LAYER.lock();
        let context = slot.as_mut().ok_or(PassthroughError::NotInitialized)?;
        let result = context.layer.destroy_instance(instance);
        // The instance is gone whatever the runtime answered.
        *slot = None;
        log::info!("Layer context released");
        result
    })
}

unsafe extern "system" fn get_instance_proc_addr(
    _instance: xr::Instance,
    name: *const c_char,
    function: *mut Option<pfn::VoidFunction>,
) -> xr::Result {
    intercept("xrGetInstanceProcAddr", || {
        if function.is_null() {
            return Ok(xr::Result::ERROR_VALIDATION_FAILURE);
        }
        *function = None;

        let Some(name) = name_from_ptr(name) else {
            return Ok(xr::Result::ERROR_VALIDATION_FAILURE);
        };

        let mut slot = LAYER.lock();
        let Some(context) = slot.as_mut() else {
            return Ok(xr::Result::ERROR_HANDLE_INVALID);
        };
        let (result, resolved) = context.table.lookup(name);
        *function = resolved;
        Ok(result)
    })
}

// ============================================================================
// Hooks
// ============================================================================

unsafe extern "system" fn get_system(
    instance: xr::Instance,
    get_info: *const xr::SystemGetInfo,
    system_id: *mut xr::SystemId,
) -> xr::Result {
    intercept("xrGetSystem", || {
        with_layer(|layer| layer.get_system(instance, get_info, system_id))
    })
}

unsafe extern "system" fn enumerate_environment_blend_modes(
    instance: xr::Instance,
    system_id: xr::SystemId,
    view_type: xr::ViewConfigurationType,
    capacity: u32,
    count: *mut u32,
    modes: *mut xr::EnvironmentBlendMode,
) -> xr::Result {
    intercept("xrEnumerateEnvironmentBlendModes", || {
        with_layer(|layer| {
            layer.enumerate_environment_blend_modes(instance, system_id, view_type, capacity, count, modes)
        })
    })
}

unsafe extern "system" fn create_session(
    instance: xr::Instance,
    create_info: *const xr::SessionCreateInfo,
    session: *mut xr::Session,
) -> xr::Result {
    intercept("xrCreateSession", || {
        with_layer(|layer| layer.create_session(instance, create_info, session))
    })
}

unsafe extern "system" fn destroy_session(session: xr::Session) -> xr::Result {
    intercept("xrDestroySession", || {
        with_layer(|layer| layer.destroy_session(session))
    })
}

unsafe extern "system" fn end_frame(session: xr::Session, frame_end_info: *const xr::FrameEndInfo) -> xr::Result {
    intercept("xrEndFrame", || {
        with_layer(|layer| layer.end_frame(session, frame_end_info))
    })
}

#[cfg(test)]
mod tests {
    use crate::dispatch::loader::{self, XrApiLayerNextInfo};
    use super::*;
    use crate::testing::mock;
    use std::ffi::{CStr, CString};
    use std::mem::size_of;
    use std::ptr;

    fn loader_info() -> XrNegotiateLoaderInfo {
        XrNegotiateLoaderInfo {
            struct_type: LoaderInterfaceStructs::LoaderInfo,
            struct_version: loader::XR_LOADER_INFO_STRUCT_VERSION,
            struct_size: size_of::<XrNegotiateLoaderInfo>(),
            min_interface_version: 1,
            max_interface_version: 1,
            min_api_version: xr::Version::new(1, 0, 0),
            max_api_version: xr::Version::new(1, 0xffff, 0),
        }
    }

    fn request() -> XrNegotiateApiLayerRequest {
        XrNegotiateApiLayerRequest {
            struct_type: LoaderInterfaceStructs::ApiLayerRequest,
            struct_version: loader::XR_API_LAYER_INFO_STRUCT_VERSION,
            struct_size: size_of::<XrNegotiateApiLayerRequest>(),
            layer_interface_version: 0,
            layer_api_version: xr::Version::new(0, 0, 0),
            get_instance_proc_addr: None,
            create_api_layer_instance: None,
        }
    }

    #[test]
    fn test_negotiation_fills_request() {
        let info = loader_info();
        let mut request = request();
        let name = CString::new(LAYER_NAME).unwrap();

        let result = unsafe { xrNegotiateLoaderApiLayerInterface(&info, name.as_ptr(), &mut request) };
        assert_eq!(result, xr::Result::SUCCESS);
        assert_eq!(request.layer_interface_version, XR_CURRENT_LOADER_API_LAYER_VERSION);
        assert_eq!(request.layer_api_version, xr::CURRENT_API_VERSION);
        assert!(request.get_instance_proc_addr.is_some());
        assert!(request.create_api_layer_instance.is_some());
    }

    #[test]
    fn test_negotiation_rejects_other_layer_names() {
        let info = loader_info();
        let mut request = request();
        let name = CString::new("XR_APILAYER_someone_else").unwrap();

        let result = unsafe { xrNegotiateLoaderApiLayerInterface(&info, name.as_ptr(), &mut request) };
        assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
        assert!(request.get_instance_proc_addr.is_none());
    }

    #[test]
    fn test_negotiation_rejects_incompatible_loader() {
        let mut info = loader_info();
        info.min_interface_version = 2;
        info.max_interface_version = 3;
        let mut request = request();

        let result = unsafe { xrNegotiateLoaderApiLayerInterface(&info, ptr::null(), &mut request) };
        assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);

        let info = loader_info();
        let mut bad_request = request;
        bad_request.struct_size = 4;
        let result = unsafe { xrNegotiateLoaderApiLayerInterface(&info, ptr::null(), &mut bad_request) };
        assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
    }

    #[test]
    fn test_negotiation_rejects_null() {
        let mut request = request();
        let result = unsafe { xrNegotiateLoaderApiLayerInterface(ptr::null(), ptr::null(), &mut request) };
        assert_eq!(result, xr::Result::ERROR_INITIALIZATION_FAILED);
    }

    #[test]
    fn test_manifest_matches_layer() {
        let manifest: serde_json::Value =
            serde_json::from_str(include_str!("../../XR_APILAYER_NOVENDOR_wmr_passthrough.json")).unwrap();
        let layer = &manifest["api_layer"];
        assert_eq!(layer["name"], LAYER_NAME);
        assert_eq!(layer["implementation_version"], LAYER_VERSION.to_string());
        assert_eq!(
            layer["functions"]["xrNegotiateLoaderApiLayerInterface"],
            "xrNegotiateLoaderApiLayerInterface"
        );
    }

    #[test]
    fn test_startup_config_reports_broken_settings_after_logging() {
        let log_dir = std::env::temp_dir().join(format!("wmr-passthrough-startup-{}", std::process::id()));
        let broken: PassthroughResult<LayerConfig> = Err(PassthroughError::Config("unexpected token".to_string()));

        let config = startup_config(&log_dir, broken);

        // Logging is up before the settings fall back to the defaults.
        assert!(log_dir.is_dir());
        assert_eq!(config.log_level, LayerConfig::default().log_level);
        assert_eq!(config.mesh_resolution, LayerConfig::default().mesh_resolution);

        let _ = std::fs::remove_dir_all(&log_dir);
    }

    #[test]
    fn test_startup_config_keeps_loaded_settings() {
        let log_dir = std::env::temp_dir().join(format!("wmr-passthrough-startup-ok-{}", std::process::id()));
        let loaded = LayerConfig {
            mesh_resolution: 8,
            ..LayerConfig::default()
        };

        let config = startup_config(&log_dir, Ok(loaded));
        assert_eq!(config.mesh_resolution, 8);

        let _ = std::fs::remove_dir_all(&log_dir);
    }

    #[test]
    fn test_overrides_cover_hooked_names() {
        let names: Vec<&str> = overrides().iter().map(|(name, _)| *name).collect();
        for expected in [
            "xrGetInstanceProcAddr",
            "xrDestroyInstance",
            "xrGetSystem",
            "xrEnumerateEnvironmentBlendModes",
            "xrCreateSession",
            "xrDestroySession",
            "xrEndFrame",
        ] {
            assert!(names.contains(&expected), "{} is not hooked", expected);
        }
        assert_eq!(names.len(), 7);
    }

    unsafe extern "system" fn next_create_api_layer_instance(
        _info: *const xr::InstanceCreateInfo,
        api_layer_info: *const XrApiLayerCreateInfo,
        instance: *mut xr::Instance,
    ) -> xr::Result {
        // We were the last layer before the runtime.
        assert!((*api_layer_info).next_info.is_null());
        *instance = mock::instance();
        xr::Result::SUCCESS
    }

    fn next_info() -> XrApiLayerNextInfo {
        XrApiLayerNextInfo {
            struct_type: LoaderInterfaceStructs::ApiLayerNextInfo,
            struct_version: loader::XR_API_LAYER_NEXT_INFO_STRUCT_VERSION,
            struct_size: size_of::<XrApiLayerNextInfo>(),
            layer_name: [0; xr::MAX_API_LAYER_NAME_SIZE],
            next_get_instance_proc_addr: mock::get_instance_proc_addr,
            next_create_api_layer_instance,
            next: ptr::null_mut(),
        }
    }

    fn create_info(next_info: &mut XrApiLayerNextInfo) -> XrApiLayerCreateInfo {
        XrApiLayerCreateInfo {
            struct_type: LoaderInterfaceStructs::ApiLayerCreateInfo,
            struct_version: loader::XR_API_LAYER_CREATE_INFO_STRUCT_VERSION,
            struct_size: size_of::<XrApiLayerCreateInfo>(),
            loader_instance: ptr::null(),
            settings_file_location: [0; loader::XR_API_LAYER_MAX_SETTINGS_PATH_SIZE],
            next_info,
        }
    }

    fn lookup(name: &CStr) -> (xr::Result, Option<pfn::VoidFunction>) {
        let mut function = None;
        let result = unsafe { get_instance_proc_addr(mock::instance(), name.as_ptr(), &mut function) };
        (result, function)
    }

    /// The boundary slot is process-wide, so the whole lifecycle runs in one
    /// test.
    #[test]
    fn test_instance_lifecycle() {
        mock::reset();

        // Before any instance exists.
        assert_eq!(lookup(c"xrEndFrame").0, xr::Result::ERROR_HANDLE_INVALID);

        // A missing required function destroys the new instance again.
        mock::with_state(|state| state.missing.push("xrLocateViews"));
        let mut next = next_info();
        let layer_info = create_info(&mut next);
        let mut instance = xr::Instance::NULL;
        let result = unsafe {
            create_api_layer_instance_with(&layer_info, &mut instance)
        };
        assert!(result.is_err());
        assert_eq!(instance, xr::Instance::NULL);
        assert_eq!(mock::with_state(|state| state.count("xrDestroyInstance")), 1);
        assert!(LAYER.lock().is_none());

        // Now with everything available.
        mock::reset();
        let mut next = next_info();
        let layer_info = create_info(&mut next);
        let result = unsafe { create_api_layer_instance_with(&layer_info, &mut instance) };
        assert_eq!(result.unwrap(), xr::Result::SUCCESS);
        assert_eq!(instance, mock::instance());

        let (result, end_frame_fn) = lookup(c"xrEndFrame");
        assert_eq!(result, xr::Result::SUCCESS);
        assert_ne!(end_frame_fn, mock::lookup("xrEndFrame"));
        assert_eq!(lookup(c"xrWaitFrame").1, mock::lookup("xrWaitFrame"));
        assert_eq!(lookup(c"xrFooBarEXT").0, xr::Result::ERROR_FUNCTION_UNSUPPORTED);

        // Call through the hook we handed out.
        let destroy: pfn::DestroyInstance = unsafe { mem::transmute(lookup(c"xrDestroyInstance").1.unwrap()) };
        assert_eq!(unsafe { destroy(instance) }, xr::Result::SUCCESS);
        assert_eq!(mock::with_state(|state| state.count("xrDestroyInstance")), 1);
        assert!(LAYER.lock().is_none());
        assert_eq!(lookup(c"xrEndFrame").0, xr::Result::ERROR_HANDLE_INVALID);
    }

    unsafe fn create_api_layer_instance_with(
        layer_info: &XrApiLayerCreateInfo,
        instance: &mut xr::Instance,
    ) -> PassthroughResult<xr::Result> {
        chain_instance(ptr::null(), layer_info, instance, crate::testing::test_config())
    }
}
