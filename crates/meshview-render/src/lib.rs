// SPDX-License-Identifier: CEPL-1.0
//! Backend-agnostic half of the mesh viewer renderer: the geometry the host
//! hands over each paint, the host surface bridge, frame packing, and the
//! `SurfaceRenderer` handle that ties a host surface to a GPU backend.
use anyhow::Result;

pub mod frame;
pub mod geometry;
pub mod host;
pub mod surface;

pub use frame::{
    draw_count, CanvasUniform, DrawIndexedIndirect, DrawIndirect, FrameGeometry, PackError,
};
pub use geometry::{PolygonSet, PolygonTree, Triangulation};
pub use host::{Backend, RebuildStats, SurfaceRenderer};
pub use surface::{
    ChangeTracker, HostSurface, LockFlags, NativeWindow, SurfaceBounds, SurfaceChange,
    SurfaceError, SurfaceInfo, SurfaceLock,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Device pixels per logical canvas unit, per axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Scale {
    pub x: f64,
    pub y: f64,
}

impl Scale {
    pub const ONE: Scale = Scale { x: 1.0, y: 1.0 };

    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn uniform(s: f64) -> Self {
        Self { x: s, y: s }
    }
}

impl Default for Scale {
    fn default() -> Self {
        Scale::ONE
    }
}

/// A live render target bound to one native surface.
///
/// `rebuild_swapchain` is called after the target is created and whenever
/// the host surface bounds change. It returns `false` when no swapchain was
/// built, e.g. for a zero-area surface. `render` draws one frame of the
/// given snapshot and returns once it is queued for presentation.
pub trait Renderer {
    fn rebuild_swapchain(&mut self) -> Result<bool>;
    fn render(
        &mut self,
        polygons: &PolygonSet,
        triangulation: Option<&Triangulation>,
        scale: Scale,
    ) -> Result<()>;
    fn set_clear_color(&mut self, rgba: [f32; 4]);
}
