//! Vulkan instance, physical device selection and platform surface creation.

use crate::context::GraphicsContext;
use crate::device::{query_capabilities, GfxDevice};
use crate::error::{GfxError, Result};
use crate::scoring::{self, DeviceScore};
use crate::surface::GfxSurface;
use ash::extensions::{ext::DebugUtils, khr::Surface};
use ash::vk;
use parking_lot::Mutex;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::collections::HashMap;
use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_char;
use std::sync::Arc;
use tracing::{debug, info, warn};

const VALIDATION_LAYER: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_LAYER_KHRONOS_validation\0") };

unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() {
        return vk::FALSE;
    }
    let callback_data = *p_callback_data;
    let message_id_name = if callback_data.p_message_id_name.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message_id_name).to_string_lossy()
    };
    let message = if callback_data.p_message.is_null() {
        std::borrow::Cow::from("")
    } else {
        CStr::from_ptr(callback_data.p_message).to_string_lossy()
    };

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::trace!(target: "vulkan", "{:?} [{}]: {}", message_type, message_id_name, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::debug!(target: "vulkan", "{:?} [{}]: {}", message_type, message_id_name, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!(target: "vulkan", "{:?} [{}]: {}", message_type, message_id_name, message)
        }
        _ => tracing::error!(target: "vulkan", "{:?} [{}]: {}", message_type, message_id_name, message),
    }
    vk::FALSE
}

/// The loaded entry, the instance and its debug messenger. Shared by the
/// system and every device created from it; the instance is destroyed when
/// the last of them is dropped.
pub struct VulkanInstance {
    entry: ash::Entry,
    raw: ash::Instance,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
}

impl VulkanInstance {
    pub fn entry(&self) -> &ash::Entry {
        &self.entry
    }

    pub fn raw(&self) -> &ash::Instance {
        &self.raw
    }
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe {
            if let Some((loader, messenger)) = self.debug_utils.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.raw.destroy_instance(None);
        }
        info!("Vulkan instance destroyed.");
    }
}

/// Entry point of the graphics subsystem: owns the instance and the logical
/// devices, and creates surfaces for windows.
///
/// Surfaces keep the system alive and devices keep the instance alive, so
/// the instance outlives every platform surface and device created from it.
pub struct GfxSystem {
    context: Arc<GraphicsContext>,
    instance: Arc<VulkanInstance>,
    surface_loader: Surface,
    devices: Mutex<HashMap<vk::PhysicalDevice, Arc<GfxDevice>>>,
}

impl GfxSystem {
    /// Loads Vulkan and creates an instance able to present to windows of `display`.
    pub fn new(context: Arc<GraphicsContext>, display: RawDisplayHandle) -> Result<Arc<Self>> {
        let surface_extensions = ash_window::enumerate_required_extensions(display)?.to_vec();
        Self::with_extensions(context, surface_extensions)
    }

    /// An instance without platform surface extensions, able to enumerate
    /// devices but not to create surfaces.
    pub fn headless(context: Arc<GraphicsContext>) -> Result<Arc<Self>> {
        Self::with_extensions(context, vec![Surface::name().as_ptr()])
    }

    fn with_extensions(context: Arc<GraphicsContext>, mut extensions: Vec<*const c_char>) -> Result<Arc<Self>> {
        let _lock = context.lock();
        let config = context.config();
        let entry = unsafe { ash::Entry::load()? };

        let to_cstring = |s: &str| {
            CString::new(s).map_err(|e| GfxError::ResourceCreation {
                resource: "instance",
                message: format!("invalid name {:?}: {}", s, e),
            })
        };
        let app_name = to_cstring(&config.application_name)?;
        let engine_name = to_cstring(&config.engine_name)?;
        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(&engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);

        let validation = config.enable_validation && Self::has_validation_layer(&entry);
        if config.enable_validation && !validation {
            warn!("Validation requested but {:?} is not installed.", VALIDATION_LAYER);
        }
        if validation {
            extensions.push(DebugUtils::name().as_ptr());
        }
        let layers: Vec<*const c_char> = if validation { vec![VALIDATION_LAYER.as_ptr()] } else { Vec::new() };

        let mut messenger_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let mut instance_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layers);
        if validation {
            instance_info = instance_info.push_next(&mut messenger_info);
        }
        let instance = unsafe { entry.create_instance(&instance_info, None)? };
        info!("Vulkan instance created (validation {}).", validation);

        let debug_utils = if validation {
            let loader = DebugUtils::new(&entry, &instance);
            match unsafe { loader.create_debug_utils_messenger(&messenger_info, None) } {
                Ok(messenger) => Some((loader, messenger)),
                Err(e) => {
                    warn!("Debug messenger could not be created: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let surface_loader = Surface::new(&entry, &instance);
        Ok(Arc::new(Self {
            context: context.clone(),
            instance: Arc::new(VulkanInstance {
                entry,
                raw: instance,
                debug_utils,
            }),
            surface_loader,
            devices: Mutex::new(HashMap::new()),
        }))
    }

    fn has_validation_layer(entry: &ash::Entry) -> bool {
        entry
            .enumerate_instance_layer_properties()
            .map(|layers| {
                layers
                    .iter()
                    .any(|l| unsafe { CStr::from_ptr(l.layer_name.as_ptr()) } == VALIDATION_LAYER)
            })
            .unwrap_or(false)
    }

    pub fn context(&self) -> &Arc<GraphicsContext> {
        &self.context
    }

    pub fn instance(&self) -> &ash::Instance {
        self.instance.raw()
    }

    pub fn shared_instance(&self) -> &Arc<VulkanInstance> {
        &self.instance
    }

    pub fn surface_loader(&self) -> &Surface {
        &self.surface_loader
    }

    pub fn physical_devices(&self) -> Result<Vec<vk::PhysicalDevice>> {
        Ok(unsafe { self.instance.raw().enumerate_physical_devices()? })
    }

    /// Creates the platform surface of a window; the returned surface starts
    /// in the `HasWindow` state.
    pub fn create_surface(self: &Arc<Self>, display: RawDisplayHandle, window: RawWindowHandle) -> Result<GfxSurface> {
        let _lock = self.context.lock();
        let handle = unsafe { ash_window::create_surface(self.instance.entry(), self.instance.raw(), display, window, None)? };
        info!("Platform surface created.");
        Ok(GfxSurface::new(self.clone(), handle))
    }

    /// Scores every physical device for `surface` and returns the logical
    /// device of the best one, creating it on first use. A device created
    /// earlier is scored with the queue family it already uses.
    pub fn find_best_device(&self, surface: vk::SurfaceKHR) -> Result<Arc<GfxDevice>> {
        let _lock = self.context.lock();
        let allow_hdr = self.context.config().allow_hdr;

        let mut candidates: Vec<(vk::PhysicalDevice, DeviceScore)> = Vec::new();
        for physical_device in self.physical_devices()? {
            let caps = query_capabilities(self.instance.raw(), physical_device, &self.surface_loader, surface)?;
            let score = match self.devices.lock().get(&physical_device) {
                Some(device) => device.score_capabilities(&caps),
                None => scoring::score(&caps, allow_hdr),
            };
            info!("Device {} ({:?}) scored {}.", caps.name, caps.device_type, score.total);
            candidates.push((physical_device, score));
        }

        let (physical_device, score) = scoring::select_best(candidates).ok_or(GfxError::NoSuitableDevice)?;
        if let Some(device) = self.devices.lock().get(&physical_device) {
            debug!("Reusing device {} (score {}).", device.name(), score.total);
            return Ok(device.clone());
        }

        let device = GfxDevice::new(
            self.context.clone(),
            &self.instance,
            physical_device,
            &self.surface_loader,
            surface,
        )?;
        info!("Selected device {} with score {}.", device.name(), score.total);
        self.devices.lock().insert(physical_device, device.clone());
        Ok(device)
    }

    pub fn device_count(&self) -> usize {
        self.devices.lock().len()
    }
}

impl Drop for GfxSystem {
    fn drop(&mut self) {
        let _lock = self.context.lock();
        for (_, device) in self.devices.get_mut().drain() {
            if Arc::strong_count(&device) > 1 {
                debug!("Device {} outlives the system and keeps the instance alive.", device.name());
            }
        }
    }
}
