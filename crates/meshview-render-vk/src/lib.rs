// SPDX-License-Identifier: CEPL-1.0
//! Vulkan backend for the mesh viewer.
//!
//! Object lifetimes nest strictly: [`Instance`] (process-wide, shared) >
//! [`PresentSurface`] > [`RenderingContext`] > [`VkRenderer`] and the
//! swapchain generations it owns. Each level keeps the one above alive.
use std::sync::Arc;

use anyhow::Result;
use meshview_render::{Backend, NativeWindow};
use tracing::debug;

pub mod capability;
pub mod context;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod renderer;
pub mod settings;
pub mod swapchain;

pub use capability::{CapabilityDescriptor, QueueFamily};
pub use context::{BootstrapError, DeviceRejection, RenderingContext};
pub use instance::{Instance, InstanceConfig, InstanceError, PresentSurface};
pub use renderer::{VkRenderer, DEFAULT_CLEAR_COLOR};
pub use settings::{RenderSettings, SettingsPreset, UnmetRequirement};

#[derive(Clone, Debug)]
pub struct RendererConfig {
    pub clear_color: [f32; 4],
    pub preset: SettingsPreset,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            clear_color: DEFAULT_CLEAR_COLOR,
            preset: SettingsPreset::default(),
        }
    }
}

/// Builds one [`VkRenderer`] per native window on a shared instance.
pub struct VkBackend {
    instance: Arc<Instance>,
    config: RendererConfig,
}

impl VkBackend {
    pub fn new(instance: Arc<Instance>, config: RendererConfig) -> Self {
        Self { instance, config }
    }

    pub fn instance(&self) -> &Arc<Instance> {
        &self.instance
    }
}

impl Backend for VkBackend {
    type Native = NativeWindow;
    type Target = VkRenderer;

    fn create_target(&self, native: &NativeWindow) -> Result<VkRenderer> {
        use meshview_render::Renderer;

        let surface = PresentSurface::create(Arc::clone(&self.instance), native)?;
        let ctx = RenderingContext::create(surface, &self.config.preset)?;
        let mut renderer = VkRenderer::new(ctx)?;
        renderer.set_clear_color(self.config.clear_color);
        debug!("render target created");
        Ok(renderer)
    }
}
