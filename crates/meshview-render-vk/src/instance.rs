// SPDX-License-Identifier: CEPL-1.0
//! Process-wide Vulkan instance and debug channel.
//!
//! One [`Instance`] is created at startup with [`Instance::init`] and shared
//! by reference count with every renderer; [`Instance::shutdown`] is the
//! matching end-of-process call.
use std::ffi::{c_char, c_void, CStr, CString};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::ext::debug_utils;
use ash::khr::surface;
use ash::{vk, Entry};
use meshview_render::NativeWindow;
use raw_window_handle::RawDisplayHandle;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// Lowest instance and device API version we run on.
pub const MIN_API_VERSION: u32 = vk::API_VERSION_1_1;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("cannot load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),
    #[error("unsupported Vulkan version {0}, need at least {1}")]
    UnsupportedVersion(String, String),
    #[error("display has no Vulkan surface support: {0}")]
    SurfaceExtensions(vk::Result),
    #[error("vkCreateInstance failed: {0}")]
    Creation(vk::Result),
}

pub(crate) fn version_string(v: u32) -> String {
    format!(
        "{}.{}.{}",
        vk::api_version_major(v),
        vk::api_version_minor(v),
        vk::api_version_patch(v)
    )
}

pub(crate) fn check_api_version(version: u32) -> Result<(), InstanceError> {
    // variant bits are ignored, 1.1.x with any patch level passes
    let base = vk::make_api_version(
        0,
        vk::api_version_major(version),
        vk::api_version_minor(version),
        0,
    );
    if base < MIN_API_VERSION {
        return Err(InstanceError::UnsupportedVersion(
            version_string(version),
            version_string(MIN_API_VERSION),
        ));
    }
    Ok(())
}

#[derive(Clone, Debug)]
pub struct InstanceConfig {
    pub app_name: String,
    /// Enable the Khronos validation layer and forward its messages to tracing.
    pub validation: bool,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "meshview".to_owned(),
            validation: cfg!(debug_assertions),
        }
    }
}

impl InstanceConfig {
    /// Defaults, with `MESHVIEW_VALIDATION=1|0` overriding the validation switch.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        let var = std::env::var("MESHVIEW_VALIDATION").ok();
        if let Some(on) = parse_switch(var.as_deref()) {
            cfg.validation = on;
        }
        cfg
    }
}

fn parse_switch(value: Option<&str>) -> Option<bool> {
    match value.map(str::trim) {
        Some("1") => Some(true),
        Some("0") => Some(false),
        _ => None,
    }
}

unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    types: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() {
        return vk::FALSE;
    }
    let data = &*data;
    let id = data
        .message_id_name_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default();
    let msg = data
        .message_as_c_str()
        .map(CStr::to_string_lossy)
        .unwrap_or_default();

    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        error!("[vulkan {types:?}] [{id}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        warn!("[vulkan {types:?}] [{id}] {msg}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        debug!("[vulkan {types:?}] [{id}] {msg}");
    } else {
        trace!("[vulkan {types:?}] [{id}] {msg}");
    }
    vk::FALSE
}

struct DebugChannel {
    loader: debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

pub struct Instance {
    entry: Entry,
    raw: ash::Instance,
    surface_loader: surface::Instance,
    debug: Option<DebugChannel>,
    api_version: u32,
}

impl Instance {
    /// Load the Vulkan library and create the instance for `display`.
    pub fn init(display: RawDisplayHandle, config: &InstanceConfig) -> Result<Arc<Self>> {
        unsafe {
            let entry = Entry::load().map_err(InstanceError::from)?;

            let api_version = entry
                .try_enumerate_instance_version()
                .context("vkEnumerateInstanceVersion")?
                .unwrap_or(vk::API_VERSION_1_0);
            check_api_version(api_version)?;

            let mut extensions: Vec<*const c_char> =
                ash_window::enumerate_required_extensions(display)
                    .map_err(InstanceError::SurfaceExtensions)?
                    .to_vec();

            let mut layers: Vec<*const c_char> = Vec::new();
            let mut debug_wanted = false;
            if config.validation {
                let available = entry
                    .enumerate_instance_layer_properties()
                    .context("enumerate_instance_layer_properties")?;
                if available
                    .iter()
                    .any(|l| l.layer_name_as_c_str() == Ok(VALIDATION_LAYER))
                {
                    layers.push(VALIDATION_LAYER.as_ptr());
                } else {
                    warn!("validation requested but {VALIDATION_LAYER:?} is not installed");
                }

                let exts = entry
                    .enumerate_instance_extension_properties(None)
                    .context("enumerate_instance_extension_properties")?;
                if exts
                    .iter()
                    .any(|e| e.extension_name_as_c_str() == Ok(debug_utils::NAME))
                {
                    extensions.push(debug_utils::NAME.as_ptr());
                    debug_wanted = true;
                } else {
                    warn!("instance debug utils extension not found");
                }
            }

            let app_name = CString::new(config.app_name.as_str())
                .context("application name contains a NUL byte")?;
            let app_info = vk::ApplicationInfo {
                s_type: vk::StructureType::APPLICATION_INFO,
                p_application_name: app_name.as_ptr(),
                application_version: 0,
                p_engine_name: c"meshview".as_ptr(),
                engine_version: 0,
                api_version: MIN_API_VERSION,
                ..Default::default()
            };

            let create_info = vk::InstanceCreateInfo {
                s_type: vk::StructureType::INSTANCE_CREATE_INFO,
                p_application_info: &app_info,
                enabled_layer_count: layers.len() as u32,
                pp_enabled_layer_names: layers.as_ptr(),
                enabled_extension_count: extensions.len() as u32,
                pp_enabled_extension_names: extensions.as_ptr(),
                ..Default::default()
            };
            let raw = entry
                .create_instance(&create_info, None)
                .map_err(InstanceError::Creation)?;

            let debug = if debug_wanted {
                match create_debug_channel(&entry, &raw) {
                    Ok(ch) => Some(ch),
                    Err(e) => {
                        warn!("debug messenger unavailable: {e}");
                        None
                    }
                }
            } else {
                None
            };

            let surface_loader = surface::Instance::new(&entry, &raw);
            info!(
                "Vulkan instance ready (loader {}, validation layers {})",
                version_string(api_version),
                layers.len()
            );

            Ok(Arc::new(Self {
                entry,
                raw,
                surface_loader,
                debug,
                api_version,
            }))
        }
    }

    /// Release the caller's reference. The instance is destroyed right away
    /// when nothing else holds it; otherwise it lives until the last renderer
    /// drops. Returns whether it was destroyed here.
    pub fn shutdown(instance: Arc<Self>) -> bool {
        match Arc::try_unwrap(instance) {
            Ok(inst) => {
                drop(inst);
                true
            }
            Err(shared) => {
                warn!(
                    "instance shutdown with {} live renderer(s); destruction deferred",
                    Arc::strong_count(&shared) - 1
                );
                false
            }
        }
    }

    pub fn entry(&self) -> &Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }

    pub fn surface_loader(&self) -> &surface::Instance {
        &self.surface_loader
    }

    pub fn api_version(&self) -> u32 {
        self.api_version
    }
}

unsafe fn create_debug_channel(entry: &Entry, instance: &ash::Instance) -> Result<DebugChannel> {
    let loader = debug_utils::Instance::new(entry, instance);
    let ci = vk::DebugUtilsMessengerCreateInfoEXT {
        s_type: vk::StructureType::DEBUG_UTILS_MESSENGER_CREATE_INFO_EXT,
        message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
            | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
            | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
            | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
            | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
            | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        pfn_user_callback: Some(debug_callback),
        ..Default::default()
    };
    let messenger = loader.create_debug_utils_messenger(&ci, None)?;
    Ok(DebugChannel { loader, messenger })
}

// Messenger first, instance last. Every surface and device created from
// this instance holds an Arc to it, so they are gone by now.
impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if let Some(ch) = self.debug.take() {
                ch.loader.destroy_debug_utils_messenger(ch.messenger, None);
            }
            self.raw.destroy_instance(None);
        }
        info!("Vulkan instance destroyed");
    }
}

/// A `VkSurfaceKHR` for one host window, destroyed with its last owner.
pub struct PresentSurface {
    instance: Arc<Instance>,
    raw: vk::SurfaceKHR,
}

impl PresentSurface {
    pub fn create(instance: Arc<Instance>, native: &NativeWindow) -> Result<Self> {
        let raw = unsafe {
            ash_window::create_surface(
                instance.entry(),
                instance.raw(),
                native.display,
                native.window,
                None,
            )
        }
        .context("ash_window::create_surface")?;
        Ok(Self { instance, raw })
    }

    pub fn raw(&self) -> vk::SurfaceKHR {
        self.raw
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Drop for PresentSurface {
    fn drop(&mut self) {
        unsafe {
            self.instance
                .surface_loader()
                .destroy_surface(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_gate() {
        assert!(check_api_version(vk::make_api_version(0, 1, 0, 65)).is_err());
        assert!(check_api_version(vk::make_api_version(0, 1, 1, 0)).is_ok());
        assert!(check_api_version(vk::make_api_version(0, 1, 3, 281)).is_ok());
        assert!(check_api_version(vk::make_api_version(0, 2, 0, 0)).is_ok());
    }

    #[test]
    fn version_error_names_both_versions() {
        let err = check_api_version(vk::API_VERSION_1_0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "unsupported Vulkan version 1.0.0, need at least 1.1.0"
        );
    }

    #[test]
    fn validation_switch() {
        assert_eq!(parse_switch(Some("1")), Some(true));
        assert_eq!(parse_switch(Some(" 0 ")), Some(false));
        assert_eq!(parse_switch(Some("yes")), None);
        assert_eq!(parse_switch(None), None);
    }
}
