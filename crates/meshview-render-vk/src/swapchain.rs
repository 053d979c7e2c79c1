// SPDX-License-Identifier: CEPL-1.0
//! Presentable image chain for the context's surface.
use anyhow::{Context, Result};
use ash::khr::swapchain;
use ash::vk;
use tracing::info;

use crate::context::RenderingContext;

/// Swapchain extent for the given capabilities. A current extent of
/// `u32::MAX` means the surface size follows the swapchain, in which case
/// the largest allowed extent is used.
pub fn resolve_extent(caps: &vk::SurfaceCapabilitiesKHR) -> vk::Extent2D {
    if caps.current_extent.width == u32::MAX || caps.current_extent.height == u32::MAX {
        caps.max_image_extent
    } else {
        caps.current_extent
    }
}

pub struct Swapchain {
    device: ash::Device,
    loader: swapchain::Device,
    raw: vk::SwapchainKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
}

impl Swapchain {
    /// Build a swapchain from the context's settings and the surface's
    /// current capabilities. `previous` is handed to the driver for reuse;
    /// the caller releases it only after this returns.
    pub fn create(ctx: &RenderingContext, previous: Option<&Swapchain>) -> Result<Self> {
        let caps = ctx.surface_capabilities()?;
        let extent = resolve_extent(&caps);
        let s = ctx.settings();

        let swap_info = vk::SwapchainCreateInfoKHR {
            s_type: vk::StructureType::SWAPCHAIN_CREATE_INFO_KHR,
            surface: ctx.surface(),
            min_image_count: s.min_image_count,
            image_format: s.format.format,
            image_color_space: s.format.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage: s.image_usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform: s.pre_transform,
            composite_alpha: s.composite_alpha,
            present_mode: s.present_mode,
            clipped: vk::TRUE,
            old_swapchain: previous.map_or(vk::SwapchainKHR::null(), |p| p.raw),
            ..Default::default()
        };

        let loader = ctx.swapchain_loader().clone();
        let device = ctx.device().clone();
        unsafe {
            let raw = loader
                .create_swapchain(&swap_info, None)
                .context("create_swapchain")?;
            let mut this = Self {
                device,
                loader,
                raw,
                extent,
                images: Vec::new(),
                views: Vec::new(),
            };
            this.images = this
                .loader
                .get_swapchain_images(raw)
                .context("get_swapchain_images")?;

            for &image in &this.images {
                let iv_info = vk::ImageViewCreateInfo {
                    s_type: vk::StructureType::IMAGE_VIEW_CREATE_INFO,
                    image,
                    view_type: vk::ImageViewType::TYPE_2D,
                    format: s.format.format,
                    subresource_range: vk::ImageSubresourceRange {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        base_mip_level: 0,
                        level_count: 1,
                        base_array_layer: 0,
                        layer_count: 1,
                    },
                    ..Default::default()
                };
                let view = this.device.create_image_view(&iv_info, None)?;
                this.views.push(view);
            }

            info!(
                "swapchain ready: {}x{}, {} images, {:?}",
                extent.width,
                extent.height,
                this.images.len(),
                s.present_mode
            );
            Ok(this)
        }
    }

    pub fn raw(&self) -> vk::SwapchainKHR {
        self.raw
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            // views are created from the swapchain images
            for &view in &self.views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.raw, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(current: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: current.0,
                height: current.1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 2160,
            },
            ..Default::default()
        }
    }

    #[test]
    fn current_extent_is_used() {
        let e = resolve_extent(&caps((800, 600)));
        assert_eq!((e.width, e.height), (800, 600));
    }

    #[test]
    fn automatic_sentinel_uses_max() {
        let e = resolve_extent(&caps((u32::MAX, u32::MAX)));
        assert_eq!((e.width, e.height), (4096, 2160));
    }

    #[test]
    fn zero_extent_passes_through() {
        let e = resolve_extent(&caps((0, 0)));
        assert_eq!((e.width, e.height), (0, 0));
    }
}
