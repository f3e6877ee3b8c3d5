//! Loader/layer negotiation structures (`openxr_loader_negotiation.h`).
//!
//! `openxr-sys` does not carry these, they only exist between the loader and
//! API layers.

use std::ffi::c_char;

use openxr_sys as xr;

pub const XR_LOADER_INFO_STRUCT_VERSION: u32 = 1;
pub const XR_API_LAYER_INFO_STRUCT_VERSION: u32 = 1;
pub const XR_API_LAYER_CREATE_INFO_STRUCT_VERSION: u32 = 1;
pub const XR_API_LAYER_NEXT_INFO_STRUCT_VERSION: u32 = 1;
pub const XR_CURRENT_LOADER_API_LAYER_VERSION: u32 = 1;

pub const XR_API_LAYER_MAX_SETTINGS_PATH_SIZE: usize = 512;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoaderInterfaceStructs {
    Uninitialized = 0,
    LoaderInfo = 1,
    ApiLayerRequest = 2,
    RuntimeRequest = 3,
    ApiLayerCreateInfo = 4,
    ApiLayerNextInfo = 5,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XrNegotiateLoaderInfo {
    pub struct_type: LoaderInterfaceStructs,
    pub struct_version: u32,
    pub struct_size: usize,
    pub min_interface_version: u32,
    pub max_interface_version: u32,
    pub min_api_version: xr::Version,
    pub max_api_version: xr::Version,
}

pub type FnCreateApiLayerInstance = unsafe extern "system" fn(
    info: *const xr::InstanceCreateInfo,
    api_layer_info: *const XrApiLayerCreateInfo,
    instance: *mut xr::Instance,
) -> xr::Result;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XrNegotiateApiLayerRequest {
    pub struct_type: LoaderInterfaceStructs,
    pub struct_version: u32,
    pub struct_size: usize,
    pub layer_interface_version: u32,
    pub layer_api_version: xr::Version,
    pub get_instance_proc_addr: Option<xr::pfn::GetInstanceProcAddr>,
    pub create_api_layer_instance: Option<FnCreateApiLayerInstance>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XrApiLayerNextInfo {
    pub struct_type: LoaderInterfaceStructs,
    pub struct_version: u32,
    pub struct_size: usize,
    pub layer_name: [c_char; xr::MAX_API_LAYER_NAME_SIZE],
    pub next_get_instance_proc_addr: xr::pfn::GetInstanceProcAddr,
    pub next_create_api_layer_instance: FnCreateApiLayerInstance,
    pub next: *mut XrApiLayerNextInfo,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct XrApiLayerCreateInfo {
    pub struct_type: LoaderInterfaceStructs,
    pub struct_version: u32,
    pub struct_size: usize,
    pub loader_instance: *const std::ffi::c_void,
    pub settings_file_location: [c_char; XR_API_LAYER_MAX_SETTINGS_PATH_SIZE],
    pub next_info: *mut XrApiLayerNextInfo,
}

impl XrNegotiateLoaderInfo {
    /// Whether the loader speaks an interface version we support.
    pub fn is_compatible(&self) -> bool {
        self.struct_type == LoaderInterfaceStructs::LoaderInfo
            && self.struct_version == XR_LOADER_INFO_STRUCT_VERSION
            && self.struct_size == std::mem::size_of::<Self>()
            && self.min_interface_version <= XR_CURRENT_LOADER_API_LAYER_VERSION
            && self.max_interface_version >= XR_CURRENT_LOADER_API_LAYER_VERSION
    }
}

impl XrNegotiateApiLayerRequest {
    pub fn is_valid(&self) -> bool {
        self.struct_type == LoaderInterfaceStructs::ApiLayerRequest
            && self.struct_version == XR_API_LAYER_INFO_STRUCT_VERSION
            && self.struct_size == std::mem::size_of::<Self>()
    }
}

/// Name in a fixed-size C string buffer, lossy.
pub fn c_chars_to_string(chars: &[c_char]) -> String {
    let bytes: Vec<u8> = chars
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}
