// SPDX-License-Identifier: CEPL-1.0
//! Rendering context bootstrap: pick the first device that satisfies every
//! requirement for a surface, then create its logical device, queue and
//! memory allocator.
use std::mem::ManuallyDrop;
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use thiserror::Error;
use tracing::{info, warn};

use crate::capability::CapabilityDescriptor;
use crate::instance::{check_api_version, version_string, Instance, PresentSurface};
use crate::memory::GpuMemory;
use crate::settings::{negotiate, RenderSettings, SettingsPreset, UnmetRequirement};

/// Why one candidate device was skipped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeviceRejection {
    #[error("swapchain extension not supported")]
    MissingSwapchain,
    #[error("device API version {0} is too old")]
    ApiTooOld(String),
    #[error("missing device features: {0}")]
    MissingFeatures(String),
    #[error(transparent)]
    Unmet(#[from] UnmetRequirement),
    #[error("no queue family supports both graphics and present")]
    NoQueueFamily,
    #[error("capability probe failed: {0}")]
    Probe(vk::Result),
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no applicable device found ({0} candidate(s) rejected)")]
    NoApplicableDevice(usize),
    #[error("vkCreateDevice failed: {0}")]
    DeviceCreation(vk::Result),
    #[error("cannot create memory allocator: {0}")]
    Allocator(#[from] gpu_allocator::AllocationError),
}

/// A device that passed every check, and what we will create on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub settings: RenderSettings,
    pub queue_family: u32,
    pub wide_lines: bool,
}

fn missing_features(f: &vk::PhysicalDeviceFeatures) -> Vec<&'static str> {
    let mut missing = Vec::new();
    if f.fill_mode_non_solid != vk::TRUE {
        missing.push("fillModeNonSolid");
    }
    if f.geometry_shader != vk::TRUE {
        missing.push("geometryShader");
    }
    missing
}

/// Checks run in order: swapchain extension, API version, required
/// features, settings negotiation, graphics+present queue family.
pub fn evaluate(
    desc: &CapabilityDescriptor,
    preset: &SettingsPreset,
) -> Result<Candidate, DeviceRejection> {
    if !desc.has_extension(swapchain::NAME) {
        return Err(DeviceRejection::MissingSwapchain);
    }
    if check_api_version(desc.api_version).is_err() {
        return Err(DeviceRejection::ApiTooOld(version_string(desc.api_version)));
    }
    let missing = missing_features(&desc.features);
    if !missing.is_empty() {
        return Err(DeviceRejection::MissingFeatures(missing.join(", ")));
    }
    let settings = negotiate(desc, preset)?;
    let queue_family = desc
        .graphics_present_family()
        .ok_or(DeviceRejection::NoQueueFamily)?;
    Ok(Candidate {
        settings,
        queue_family,
        wide_lines: desc.features.wide_lines == vk::TRUE,
    })
}

/// First item `check` accepts, in iteration order. Later items are never
/// checked; rejected ones are logged and skipped.
pub fn select_first<D, T>(
    items: impl IntoIterator<Item = D>,
    mut check: impl FnMut(&D) -> Result<T, DeviceRejection>,
) -> Result<(D, T), BootstrapError> {
    let mut rejected = 0;
    for (i, item) in items.into_iter().enumerate() {
        match check(&item) {
            Ok(t) => return Ok((item, t)),
            Err(why) => {
                warn!("device #{i} skipped: {why}");
                rejected += 1;
            }
        }
    }
    Err(BootstrapError::NoApplicableDevice(rejected))
}

pub struct RenderingContext {
    memory: ManuallyDrop<GpuMemory>,
    device: ash::Device,
    swapchain_loader: swapchain::Device,
    phys: vk::PhysicalDevice,
    queue: vk::Queue,
    queue_family: u32,
    settings: RenderSettings,
    capabilities: CapabilityDescriptor,
    wide_lines: bool,
    // destroyed after the device
    surface: PresentSurface,
}

impl RenderingContext {
    pub fn create(surface: PresentSurface, preset: &SettingsPreset) -> Result<Self> {
        let instance = Arc::clone(surface.instance());
        let raw = instance.raw();
        let devices =
            unsafe { raw.enumerate_physical_devices() }.context("enumerate_physical_devices")?;

        let (phys, (capabilities, picked)) = select_first(devices, |&phys| {
            let desc = unsafe { CapabilityDescriptor::probe(&instance, phys, surface.raw()) }
                .map_err(DeviceRejection::Probe)?;
            info!("found device: {}", desc.name);
            let candidate = evaluate(&desc, preset)?;
            Ok((desc, candidate))
        })?;

        let device = unsafe { create_device(raw, phys, &picked)? };
        let queue = unsafe { device.get_device_queue(picked.queue_family, 0) };

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: raw.clone(),
            device: device.clone(),
            physical_device: phys,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        });
        let allocator = match allocator {
            Ok(a) => a,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(BootstrapError::Allocator(e).into());
            }
        };

        let swapchain_loader = swapchain::Device::new(raw, &device);
        let s = &picked.settings;
        info!(
            "using {} (api {}), {:?} {:?}, {:?}, {:?}, min images {}, wide lines {}",
            capabilities.name,
            version_string(capabilities.api_version),
            s.format.format,
            s.format.color_space,
            s.present_mode,
            s.sample_count,
            s.min_image_count,
            picked.wide_lines
        );

        Ok(Self {
            memory: ManuallyDrop::new(GpuMemory::new(device.clone(), allocator)),
            device,
            swapchain_loader,
            phys,
            queue,
            queue_family: picked.queue_family,
            settings: picked.settings,
            capabilities,
            wide_lines: picked.wide_lines,
            surface,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn memory(&self) -> &GpuMemory {
        &self.memory
    }

    pub fn swapchain_loader(&self) -> &swapchain::Device {
        &self.swapchain_loader
    }

    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.capabilities
    }

    pub fn wide_lines(&self) -> bool {
        self.wide_lines
    }

    pub fn surface(&self) -> vk::SurfaceKHR {
        self.surface.raw()
    }

    pub fn instance(&self) -> &Arc<Instance> {
        self.surface.instance()
    }

    /// Fresh surface capabilities; the probed ones go stale on resize.
    pub fn surface_capabilities(&self) -> Result<vk::SurfaceCapabilitiesKHR> {
        unsafe {
            self.instance()
                .surface_loader()
                .get_physical_device_surface_capabilities(self.phys, self.surface.raw())
        }
        .context("get_physical_device_surface_capabilities")
    }
}

unsafe fn create_device(
    instance: &ash::Instance,
    phys: vk::PhysicalDevice,
    picked: &Candidate,
) -> Result<ash::Device, BootstrapError> {
    let priorities = [1.0_f32];
    let qinfo = vk::DeviceQueueCreateInfo {
        s_type: vk::StructureType::DEVICE_QUEUE_CREATE_INFO,
        queue_family_index: picked.queue_family,
        queue_count: 1,
        p_queue_priorities: priorities.as_ptr(),
        ..Default::default()
    };

    let features = vk::PhysicalDeviceFeatures {
        fill_mode_non_solid: vk::TRUE,
        geometry_shader: vk::TRUE,
        wide_lines: if picked.wide_lines { vk::TRUE } else { vk::FALSE },
        ..Default::default()
    };

    let device_exts = [swapchain::NAME.as_ptr()];
    let dinfo = vk::DeviceCreateInfo {
        s_type: vk::StructureType::DEVICE_CREATE_INFO,
        queue_create_info_count: 1,
        p_queue_create_infos: &qinfo,
        enabled_extension_count: device_exts.len() as u32,
        pp_enabled_extension_names: device_exts.as_ptr(),
        p_enabled_features: &features,
        ..Default::default()
    };

    instance
        .create_device(phys, &dinfo, None)
        .map_err(BootstrapError::DeviceCreation)
}

// STRICT TEARDOWN ORDER:
// - device idle before anything is released
// - allocator (and with it every memory block) before the device
// - device before the surface; the surface field drops last and releases
//   its instance reference
impl Drop for RenderingContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();

            let outstanding = self.memory.outstanding();
            if outstanding > 0 {
                tracing::error!("{outstanding} GPU resource(s) outlive their rendering context");
            }
            ManuallyDrop::drop(&mut self.memory);

            self.device.destroy_device(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::QueueFamily;
    use std::cell::Cell;

    fn good_device() -> CapabilityDescriptor {
        CapabilityDescriptor {
            name: "test gpu".to_owned(),
            api_version: vk::make_api_version(0, 1, 3, 0),
            extensions: vec!["VK_KHR_swapchain".to_owned()],
            formats: vec![vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            }],
            present_modes: vec![vk::PresentModeKHR::FIFO],
            surface: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 0,
                supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
                supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
                ..Default::default()
            },
            color_sample_counts: vk::SampleCountFlags::TYPE_1 | vk::SampleCountFlags::TYPE_4,
            line_width_range: [1.0, 8.0],
            features: vk::PhysicalDeviceFeatures {
                fill_mode_non_solid: vk::TRUE,
                geometry_shader: vk::TRUE,
                wide_lines: vk::TRUE,
                ..Default::default()
            },
            queue_families: vec![
                QueueFamily {
                    index: 0,
                    flags: vk::QueueFlags::COMPUTE,
                    present: true,
                },
                QueueFamily {
                    index: 1,
                    flags: vk::QueueFlags::GRAPHICS,
                    present: true,
                },
            ],
        }
    }

    #[test]
    fn accepts_complete_device() {
        let c = evaluate(&good_device(), &SettingsPreset::default()).unwrap();
        assert_eq!(c.queue_family, 1);
        assert!(c.wide_lines);
        assert_eq!(c.settings.sample_count, vk::SampleCountFlags::TYPE_4);
        assert_eq!(c.settings.present_mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn rejection_reasons_in_order() {
        let preset = SettingsPreset::default();

        let mut d = good_device();
        d.extensions.clear();
        d.api_version = vk::API_VERSION_1_0;
        assert_eq!(evaluate(&d, &preset), Err(DeviceRejection::MissingSwapchain));

        let mut d = good_device();
        d.api_version = vk::API_VERSION_1_0;
        assert_eq!(
            evaluate(&d, &preset),
            Err(DeviceRejection::ApiTooOld("1.0.0".to_owned()))
        );

        let mut d = good_device();
        d.features.geometry_shader = vk::FALSE;
        d.features.fill_mode_non_solid = vk::FALSE;
        assert_eq!(
            evaluate(&d, &preset),
            Err(DeviceRejection::MissingFeatures(
                "fillModeNonSolid, geometryShader".to_owned()
            ))
        );

        let mut d = good_device();
        d.present_modes = vec![vk::PresentModeKHR::MAILBOX];
        d.queue_families.clear();
        assert_eq!(
            evaluate(&d, &preset),
            Err(DeviceRejection::Unmet(UnmetRequirement::PresentMode))
        );

        let mut d = good_device();
        d.queue_families[1].present = false;
        assert_eq!(evaluate(&d, &preset), Err(DeviceRejection::NoQueueFamily));
    }

    #[test]
    fn wide_lines_are_optional() {
        let mut d = good_device();
        d.features.wide_lines = vk::FALSE;
        assert!(!evaluate(&d, &SettingsPreset::default()).unwrap().wide_lines);
    }

    #[test]
    fn first_satisfying_device_wins() {
        let mut slow = good_device();
        slow.name = "second".to_owned();
        let mut broken = good_device();
        broken.extensions.clear();
        let devices = vec![broken, good_device(), slow];

        let checked = Cell::new(0);
        let (picked, _) = select_first(devices, |d| {
            checked.set(checked.get() + 1);
            evaluate(d, &SettingsPreset::default())
        })
        .unwrap();
        assert_eq!(picked.name, "test gpu");
        assert_eq!(checked.get(), 2);
    }

    #[test]
    fn all_rejected_is_fatal() {
        let mut d = good_device();
        d.queue_families.clear();
        let err = select_first(vec![d.clone(), d], |d| {
            evaluate(d, &SettingsPreset::default())
        })
        .unwrap_err();
        assert!(matches!(err, BootstrapError::NoApplicableDevice(2)));

        let err = select_first(Vec::<CapabilityDescriptor>::new(), |d| {
            evaluate(d, &SettingsPreset::default())
        })
        .unwrap_err();
        assert!(matches!(err, BootstrapError::NoApplicableDevice(0)));
    }
}
