// SPDX-License-Identifier: CEPL-1.0
//! Read-only snapshot of what one physical device can do with one surface.
use std::ffi::CStr;

use ash::prelude::VkResult;
use ash::vk;

use crate::instance::Instance;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamily {
    pub index: u32,
    pub flags: vk::QueueFlags,
    /// Can present to the probed surface.
    pub present: bool,
}

/// Taken once per candidate device. Goes stale when the surface changes.
#[derive(Clone, Debug, Default)]
pub struct CapabilityDescriptor {
    pub name: String,
    pub api_version: u32,
    pub extensions: Vec<String>,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
    pub surface: vk::SurfaceCapabilitiesKHR,
    pub color_sample_counts: vk::SampleCountFlags,
    pub line_width_range: [f32; 2],
    pub features: vk::PhysicalDeviceFeatures,
    pub queue_families: Vec<QueueFamily>,
}

impl CapabilityDescriptor {
    /// Query everything about `phys` that negotiation and device selection
    /// look at. Issues no writes.
    pub unsafe fn probe(
        instance: &Instance,
        phys: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> VkResult<Self> {
        let raw = instance.raw();
        let surf = instance.surface_loader();

        let props = raw.get_physical_device_properties(phys);
        let name = props
            .device_name_as_c_str()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "<unnamed>".to_owned());

        let extensions = raw
            .enumerate_device_extension_properties(phys)?
            .iter()
            .filter_map(|e| e.extension_name_as_c_str().ok())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();

        let mut queue_families = Vec::new();
        for (i, q) in raw
            .get_physical_device_queue_family_properties(phys)
            .iter()
            .enumerate()
        {
            let index = i as u32;
            queue_families.push(QueueFamily {
                index,
                flags: q.queue_flags,
                present: surf.get_physical_device_surface_support(phys, index, surface)?,
            });
        }

        Ok(Self {
            name,
            api_version: props.api_version,
            extensions,
            formats: surf.get_physical_device_surface_formats(phys, surface)?,
            present_modes: surf.get_physical_device_surface_present_modes(phys, surface)?,
            surface: surf.get_physical_device_surface_capabilities(phys, surface)?,
            color_sample_counts: props.limits.framebuffer_color_sample_counts,
            line_width_range: props.limits.line_width_range,
            features: raw.get_physical_device_features(phys),
            queue_families,
        })
    }

    pub fn has_extension(&self, name: &CStr) -> bool {
        let Ok(name) = name.to_str() else {
            return false;
        };
        self.extensions.iter().any(|e| e == name)
    }

    /// First queue family that does graphics and presents to the surface.
    pub fn graphics_present_family(&self) -> Option<u32> {
        self.queue_families
            .iter()
            .find(|q| q.present && q.flags.contains(vk::QueueFlags::GRAPHICS))
            .map(|q| q.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_needs_graphics_and_present() {
        let desc = CapabilityDescriptor {
            queue_families: vec![
                QueueFamily {
                    index: 0,
                    flags: vk::QueueFlags::GRAPHICS,
                    present: false,
                },
                QueueFamily {
                    index: 1,
                    flags: vk::QueueFlags::TRANSFER,
                    present: true,
                },
                QueueFamily {
                    index: 2,
                    flags: vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE,
                    present: true,
                },
            ],
            ..Default::default()
        };
        assert_eq!(desc.graphics_present_family(), Some(2));
        assert_eq!(CapabilityDescriptor::default().graphics_present_family(), None);
    }

    #[test]
    fn extension_lookup() {
        let desc = CapabilityDescriptor {
            extensions: vec!["VK_KHR_swapchain".to_owned()],
            ..Default::default()
        };
        assert!(desc.has_extension(ash::khr::swapchain::NAME));
        assert!(!desc.has_extension(c"VK_KHR_maintenance1"));
    }
}
