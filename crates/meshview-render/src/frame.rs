// SPDX-License-Identifier: CEPL-1.0
//! Per-frame packing of a geometry snapshot into GPU-ready payloads.
//!
//! The two indirect records mirror `VkDrawIndexedIndirectCommand` and
//! `VkDrawIndirectCommand` byte for byte, so a backend can copy them
//! straight into its indirect buffers.
use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::geometry::{PolygonSet, Triangulation};
use crate::{RenderSize, Scale};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndexedIndirect {
    pub index_count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    pub vertex_offset: i32,
    pub first_instance: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawIndirect {
    pub vertex_count: u32,
    pub instance_count: u32,
    pub first_vertex: u32,
    pub first_instance: u32,
}

/// Uniform block read by the vertex and geometry stages.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CanvasUniform {
    /// Logical canvas size: device pixels divided by the host scale.
    pub size: [f32; 2],
}

impl CanvasUniform {
    pub fn new(extent: RenderSize, scale: Scale) -> Self {
        let axis = |px: u32, s: f64| {
            // non-positive or non-finite scale falls back to 1:1
            let s = if s.is_finite() && s > 0.0 { s } else { 1.0 };
            (px as f64 / s) as f32
        };
        Self {
            size: [axis(extent.width, scale.x), axis(extent.height, scale.y)],
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PackError {
    #[error("{0} draw elements do not fit a 32-bit indirect count")]
    CountOverflow(u128),
}

/// `elements * per` as an indirect draw count.
pub fn draw_count(elements: usize, per: usize) -> Result<u32, PackError> {
    elements
        .checked_mul(per)
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(PackError::CountOverflow(elements as u128 * per as u128))
}

/// Packed payloads for one frame. Buffers are cleared and refilled by
/// [`FrameGeometry::pack`], so their heap capacity is reused across frames.
#[derive(Debug, Default)]
pub struct FrameGeometry {
    pub vertices: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
    /// Polygon edges as explicit segment endpoint pairs.
    pub edge_vertices: Vec<[f32; 2]>,
    pub triangle_draw: DrawIndexedIndirect,
    pub polygon_draw: DrawIndirect,
}

impl FrameGeometry {
    /// Fails when a draw count does not fit `u32`; the payload vectors are
    /// then filled but the indirect records keep the previous frame's values.
    pub fn pack(
        &mut self,
        polygons: &PolygonSet,
        triangulation: Option<&Triangulation>,
    ) -> Result<(), PackError> {
        self.vertices.clear();
        self.indices.clear();
        self.edge_vertices.clear();

        if let Some(t) = triangulation {
            self.vertices
                .extend(t.vertices.iter().map(|v| [v.x as f32, v.y as f32]));
            self.indices.extend(t.triangles.iter().flatten().copied());
        }

        let point_count = polygons.point_count();
        self.edge_vertices.reserve(point_count * 2);
        for (a, b) in polygons.edges() {
            self.edge_vertices.push([a.x as f32, a.y as f32]);
            self.edge_vertices.push([b.x as f32, b.y as f32]);
        }

        let triangle_count = triangulation.map_or(0, |t| t.triangles.len());
        let index_count = draw_count(triangle_count, 3)?;
        let vertex_count = draw_count(point_count, 2)?;
        self.triangle_draw = DrawIndexedIndirect {
            index_count,
            instance_count: 1,
            ..Default::default()
        };
        self.polygon_draw = DrawIndirect {
            vertex_count,
            instance_count: 1,
            ..Default::default()
        };
        Ok(())
    }

    pub fn has_vertices(&self) -> bool {
        !self.vertices.is_empty()
    }

    pub fn has_triangles(&self) -> bool {
        !self.indices.is_empty()
    }

    pub fn has_polygon_edges(&self) -> bool {
        !self.edge_vertices.is_empty()
    }
}
