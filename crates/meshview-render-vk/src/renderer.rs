// SPDX-License-Identifier: CEPL-1.0
//! The Vulkan frame loop.
//!
//! One frame is in flight at a time. Geometry lives in host-visible stream
//! buffers that only grow; draw counts go through indirect buffers so a new
//! snapshot only forces a re-record when a buffer had to be replaced.
use anyhow::{anyhow, Context, Result};
use ash::vk;
use tracing::{debug, info};

use meshview_render::{
    CanvasUniform, DrawIndexedIndirect, DrawIndirect, FrameGeometry, PolygonSet, RenderSize,
    Renderer, Scale, Triangulation,
};

use crate::context::RenderingContext;
use crate::memory::{DeviceImage, StreamBuffer};
use crate::pipeline::Pipelines;
use crate::swapchain::{resolve_extent, Swapchain};

pub const DEFAULT_CLEAR_COLOR: [f32; 4] = [1.0, 1.0, 1.0, 1.0];

/// One draw in a recorded command buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DrawStep {
    Triangles,
    PolygonEdges,
    PolygonVertices,
    TriangleEdges,
}

/// Draws recorded for the buffers that currently exist. Triangle edges go
/// last so they stay visible over the polygon outline.
pub fn draw_plan(has_mesh: bool, has_polygons: bool) -> Vec<DrawStep> {
    let mut steps = Vec::with_capacity(4);
    if has_mesh {
        steps.push(DrawStep::Triangles);
    }
    if has_polygons {
        steps.push(DrawStep::PolygonEdges);
        steps.push(DrawStep::PolygonVertices);
    }
    if has_mesh {
        steps.push(DrawStep::TriangleEdges);
    }
    steps
}

fn byte_len<T>(items: &[T]) -> u64 {
    std::mem::size_of_val(items) as u64
}

struct FrameSync {
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
}

/// Everything sized or counted after the current swapchain.
struct SwapchainContext {
    device: ash::Device,
    command_pool: vk::CommandPool,
    framebuffers: Vec<vk::Framebuffer>,
    command_buffers: Vec<vk::CommandBuffer>,
    // multisampled target, absent when rendering straight to the swapchain
    color: Option<DeviceImage>,
}

impl SwapchainContext {
    fn new(
        ctx: &RenderingContext,
        pipelines: &Pipelines,
        command_pool: vk::CommandPool,
        swapchain: &Swapchain,
    ) -> Result<Self> {
        let s = ctx.settings();
        let extent = swapchain.extent();
        let mut this = Self {
            device: ctx.device().clone(),
            command_pool,
            framebuffers: Vec::with_capacity(swapchain.image_count()),
            command_buffers: Vec::new(),
            color: None,
        };

        if s.sample_count != vk::SampleCountFlags::TYPE_1 {
            let info = vk::ImageCreateInfo {
                s_type: vk::StructureType::IMAGE_CREATE_INFO,
                image_type: vk::ImageType::TYPE_2D,
                format: s.format.format,
                extent: vk::Extent3D {
                    width: extent.width,
                    height: extent.height,
                    depth: 1,
                },
                mip_levels: 1,
                array_layers: 1,
                samples: s.sample_count,
                tiling: vk::ImageTiling::OPTIMAL,
                usage: vk::ImageUsageFlags::COLOR_ATTACHMENT
                    | vk::ImageUsageFlags::TRANSIENT_ATTACHMENT,
                sharing_mode: vk::SharingMode::EXCLUSIVE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                ..Default::default()
            };
            this.color = Some(DeviceImage::new(ctx.memory(), "msaa color", &info)?);
        }

        unsafe {
            for &view in swapchain.views() {
                let attachments: Vec<vk::ImageView> = match &this.color {
                    Some(color) => vec![color.view(), view],
                    None => vec![view],
                };
                let fb_info = vk::FramebufferCreateInfo {
                    s_type: vk::StructureType::FRAMEBUFFER_CREATE_INFO,
                    render_pass: pipelines.render_pass(),
                    attachment_count: attachments.len() as u32,
                    p_attachments: attachments.as_ptr(),
                    width: extent.width,
                    height: extent.height,
                    layers: 1,
                    ..Default::default()
                };
                let fb = this
                    .device
                    .create_framebuffer(&fb_info, None)
                    .context("create_framebuffer")?;
                this.framebuffers.push(fb);
            }

            let alloc_info = vk::CommandBufferAllocateInfo {
                s_type: vk::StructureType::COMMAND_BUFFER_ALLOCATE_INFO,
                command_pool,
                level: vk::CommandBufferLevel::PRIMARY,
                command_buffer_count: this.framebuffers.len() as u32,
                ..Default::default()
            };
            this.command_buffers = this
                .device
                .allocate_command_buffers(&alloc_info)
                .context("allocate_command_buffers")?;
        }
        Ok(this)
    }
}

impl Drop for SwapchainContext {
    fn drop(&mut self) {
        unsafe {
            if !self.command_buffers.is_empty() {
                self.device
                    .free_command_buffers(self.command_pool, &self.command_buffers);
            }
            for &fb in &self.framebuffers {
                self.device.destroy_framebuffer(fb, None);
            }
        }
    }
}

pub struct VkRenderer {
    sync: FrameSync,
    descriptor_pool: vk::DescriptorPool,
    canvas_set: vk::DescriptorSet,
    command_pool: vk::CommandPool,
    targets: Option<SwapchainContext>,
    swapchain: Option<Swapchain>,

    vertex_buffer: Option<StreamBuffer>,
    index_buffer: Option<StreamBuffer>,
    polygon_buffer: Option<StreamBuffer>,
    uniform: StreamBuffer,
    triangle_indirect: StreamBuffer,
    polygon_indirect: StreamBuffer,
    pipelines: Pipelines,

    frame: FrameGeometry,
    clear: [f32; 4],
    needs_record: bool,
    stale: bool,
    paused: bool,

    // dropped last: every field above holds handles from its device
    ctx: RenderingContext,
}

impl VkRenderer {
    /// The swapchain is built lazily, on the first `rebuild_swapchain` or
    /// `render` call.
    pub fn new(ctx: RenderingContext) -> Result<Self> {
        let pipelines = Pipelines::new(&ctx)?;
        let mem = ctx.memory();
        let uniform = StreamBuffer::new(
            mem,
            "canvas uniform",
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            std::mem::size_of::<CanvasUniform>() as u64,
        )?;
        let triangle_indirect = StreamBuffer::new(
            mem,
            "triangle indirect",
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            std::mem::size_of::<DrawIndexedIndirect>() as u64,
        )?;
        let polygon_indirect = StreamBuffer::new(
            mem,
            "polygon indirect",
            vk::BufferUsageFlags::INDIRECT_BUFFER,
            std::mem::size_of::<DrawIndirect>() as u64,
        )?;

        let mut this = Self {
            sync: FrameSync {
                image_available: vk::Semaphore::null(),
                render_finished: vk::Semaphore::null(),
                in_flight: vk::Fence::null(),
            },
            descriptor_pool: vk::DescriptorPool::null(),
            canvas_set: vk::DescriptorSet::null(),
            command_pool: vk::CommandPool::null(),
            targets: None,
            swapchain: None,
            vertex_buffer: None,
            index_buffer: None,
            polygon_buffer: None,
            uniform,
            triangle_indirect,
            polygon_indirect,
            pipelines,
            frame: FrameGeometry::default(),
            clear: DEFAULT_CLEAR_COLOR,
            needs_record: true,
            stale: true,
            paused: false,
            ctx,
        };
        // Drop releases whatever was created if this fails halfway
        unsafe { this.create_raw_objects()? };
        info!("vulkan renderer ready");
        Ok(this)
    }

    unsafe fn create_raw_objects(&mut self) -> Result<()> {
        let d = self.ctx.device();

        let sem_info = vk::SemaphoreCreateInfo {
            s_type: vk::StructureType::SEMAPHORE_CREATE_INFO,
            ..Default::default()
        };
        // signaled so the first frame does not wait forever
        let fence_info = vk::FenceCreateInfo {
            s_type: vk::StructureType::FENCE_CREATE_INFO,
            flags: vk::FenceCreateFlags::SIGNALED,
            ..Default::default()
        };
        self.sync.image_available = d.create_semaphore(&sem_info, None)?;
        self.sync.render_finished = d.create_semaphore(&sem_info, None)?;
        self.sync.in_flight = d.create_fence(&fence_info, None)?;

        let pool_info = vk::CommandPoolCreateInfo {
            s_type: vk::StructureType::COMMAND_POOL_CREATE_INFO,
            queue_family_index: self.ctx.queue_family(),
            ..Default::default()
        };
        self.command_pool = d
            .create_command_pool(&pool_info, None)
            .context("create_command_pool")?;

        let pool_size = vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        };
        let dp_info = vk::DescriptorPoolCreateInfo {
            s_type: vk::StructureType::DESCRIPTOR_POOL_CREATE_INFO,
            max_sets: 1,
            pool_size_count: 1,
            p_pool_sizes: &pool_size,
            ..Default::default()
        };
        self.descriptor_pool = d
            .create_descriptor_pool(&dp_info, None)
            .context("create_descriptor_pool")?;

        let set_layout = self.pipelines.set_layout();
        let alloc_info = vk::DescriptorSetAllocateInfo {
            s_type: vk::StructureType::DESCRIPTOR_SET_ALLOCATE_INFO,
            descriptor_pool: self.descriptor_pool,
            descriptor_set_count: 1,
            p_set_layouts: &set_layout,
            ..Default::default()
        };
        self.canvas_set = d
            .allocate_descriptor_sets(&alloc_info)
            .context("allocate_descriptor_sets")?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("descriptor pool returned no set"))?;

        let buffer_info = vk::DescriptorBufferInfo {
            buffer: self.uniform.raw(),
            offset: 0,
            range: vk::WHOLE_SIZE,
        };
        let write = vk::WriteDescriptorSet {
            s_type: vk::StructureType::WRITE_DESCRIPTOR_SET,
            dst_set: self.canvas_set,
            dst_binding: 0,
            descriptor_count: 1,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            p_buffer_info: &buffer_info,
            ..Default::default()
        };
        d.update_descriptor_sets(std::slice::from_ref(&write), &[]);
        Ok(())
    }

    pub fn context(&self) -> &RenderingContext {
        &self.ctx
    }

    /// Make sure every non-empty payload fits its buffer, then copy it in.
    /// Replacing a buffer flags the recorded command buffers for re-record.
    fn upload_geometry(&mut self) -> Result<()> {
        let mem = self.ctx.memory();
        let f = &self.frame;

        if f.has_vertices() {
            StreamBuffer::ensure(
                &mut self.vertex_buffer,
                &mut self.needs_record,
                mem,
                "vertices",
                vk::BufferUsageFlags::VERTEX_BUFFER,
                byte_len(&f.vertices),
            )?;
            if let Some(b) = self.vertex_buffer.as_mut() {
                b.write(&f.vertices)?;
            }
        }
        if f.has_triangles() {
            StreamBuffer::ensure(
                &mut self.index_buffer,
                &mut self.needs_record,
                mem,
                "indices",
                vk::BufferUsageFlags::INDEX_BUFFER,
                byte_len(&f.indices),
            )?;
            if let Some(b) = self.index_buffer.as_mut() {
                b.write(&f.indices)?;
            }
        }
        if f.has_polygon_edges() {
            StreamBuffer::ensure(
                &mut self.polygon_buffer,
                &mut self.needs_record,
                mem,
                "polygon edges",
                vk::BufferUsageFlags::VERTEX_BUFFER,
                byte_len(&f.edge_vertices),
            )?;
            if let Some(b) = self.polygon_buffer.as_mut() {
                b.write(&f.edge_vertices)?;
            }
        }

        self.triangle_indirect.write(&[f.triangle_draw])?;
        self.polygon_indirect.write(&[f.polygon_draw])?;
        Ok(())
    }

    unsafe fn record(&mut self) -> Result<()> {
        let (Some(targets), Some(swapchain)) = (self.targets.as_ref(), self.swapchain.as_ref())
        else {
            return Ok(());
        };
        self.ctx
            .device()
            .reset_command_pool(self.command_pool, vk::CommandPoolResetFlags::empty())
            .context("reset_command_pool")?;
        for (&cmd, &fb) in targets.command_buffers.iter().zip(&targets.framebuffers) {
            self.record_one(cmd, fb, swapchain.extent())?;
        }
        debug!(
            "recorded {} command buffer(s)",
            targets.command_buffers.len()
        );
        self.needs_record = false;
        Ok(())
    }

    unsafe fn record_one(
        &self,
        cmd: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) -> Result<()> {
        let d = self.ctx.device();
        let begin = vk::CommandBufferBeginInfo {
            s_type: vk::StructureType::COMMAND_BUFFER_BEGIN_INFO,
            ..Default::default()
        };
        d.begin_command_buffer(cmd, &begin)?;

        let clear = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: self.clear,
            },
        };
        let rp_begin = vk::RenderPassBeginInfo {
            s_type: vk::StructureType::RENDER_PASS_BEGIN_INFO,
            render_pass: self.pipelines.render_pass(),
            framebuffer,
            render_area: vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            },
            clear_value_count: 1,
            p_clear_values: &clear,
            ..Default::default()
        };
        d.cmd_begin_render_pass(cmd, &rp_begin, vk::SubpassContents::INLINE);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        d.cmd_set_viewport(cmd, 0, &[viewport]);
        d.cmd_set_scissor(cmd, 0, &[scissor]);
        d.cmd_bind_descriptor_sets(
            cmd,
            vk::PipelineBindPoint::GRAPHICS,
            self.pipelines.layout(),
            0,
            &[self.canvas_set],
            &[],
        );

        let mesh = self.vertex_buffer.as_ref().zip(self.index_buffer.as_ref());
        let polygons = self.polygon_buffer.as_ref();
        let indexed_stride = std::mem::size_of::<DrawIndexedIndirect>() as u32;
        let stride = std::mem::size_of::<DrawIndirect>() as u32;

        for step in draw_plan(mesh.is_some(), polygons.is_some()) {
            match (step, mesh, polygons) {
                (DrawStep::Triangles, Some((vb, ib)), _) => {
                    d.cmd_bind_vertex_buffers(cmd, 0, &[vb.raw()], &[0]);
                    d.cmd_bind_index_buffer(cmd, ib.raw(), 0, vk::IndexType::UINT32);
                    d.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.triangle,
                    );
                    d.cmd_draw_indexed_indirect(
                        cmd,
                        self.triangle_indirect.raw(),
                        0,
                        1,
                        indexed_stride,
                    );
                }
                (DrawStep::PolygonEdges, _, Some(pb)) => {
                    d.cmd_bind_vertex_buffers(cmd, 0, &[pb.raw()], &[0]);
                    d.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.polygon_edge,
                    );
                    d.cmd_draw_indirect(cmd, self.polygon_indirect.raw(), 0, 1, stride);
                }
                (DrawStep::PolygonVertices, _, Some(_)) => {
                    d.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.polygon_vertex,
                    );
                    d.cmd_draw_indirect(cmd, self.polygon_indirect.raw(), 0, 1, stride);
                }
                (DrawStep::TriangleEdges, Some((vb, _)), _) => {
                    // the polygon pass rebound binding 0; the index buffer stays
                    d.cmd_bind_vertex_buffers(cmd, 0, &[vb.raw()], &[0]);
                    d.cmd_bind_pipeline(
                        cmd,
                        vk::PipelineBindPoint::GRAPHICS,
                        self.pipelines.triangle_edge,
                    );
                    d.cmd_draw_indexed_indirect(
                        cmd,
                        self.triangle_indirect.raw(),
                        0,
                        1,
                        indexed_stride,
                    );
                }
                _ => {}
            }
        }

        d.cmd_end_render_pass(cmd);
        d.end_command_buffer(cmd)?;
        Ok(())
    }
}

impl Renderer for VkRenderer {
    // STRICT ORDER (rebuild):
    // 1) wait for the in-flight frame
    // 2) release framebuffers, command buffers and the msaa image
    // 3) create the new swapchain from the old one, then drop the old one
    // 4) rebuild the per-swapchain objects and mark for re-record
    fn rebuild_swapchain(&mut self) -> Result<bool> {
        unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[self.sync.in_flight], true, u64::MAX)
                .context("wait_for_fences(rebuild)")?;
        }

        let extent = resolve_extent(&self.ctx.surface_capabilities()?);
        if extent.width == 0 || extent.height == 0 {
            if !self.paused {
                info!("surface extent is 0x0, paused");
            }
            self.paused = true;
            self.stale = true;
            return Ok(false);
        }

        self.targets = None;
        let swapchain = Swapchain::create(&self.ctx, self.swapchain.as_ref())?;
        self.swapchain = Some(swapchain);
        if let Some(sc) = self.swapchain.as_ref() {
            self.targets = Some(SwapchainContext::new(
                &self.ctx,
                &self.pipelines,
                self.command_pool,
                sc,
            )?);
        }

        if self.paused {
            info!("surface extent is {}x{}, resumed", extent.width, extent.height);
        }
        self.paused = false;
        self.stale = false;
        self.needs_record = true;
        Ok(true)
    }

    // STRICT PER-FRAME ORDER:
    // 1) wait for the previous frame's fence; buffers are free to change
    // 2) upload uniform, geometry and draw counts; re-record if needed
    // 3) acquire, then reset the fence right before submit
    // 4) submit (waits on acquire, signals render-finished), then present
    fn render(
        &mut self,
        polygons: &PolygonSet,
        triangulation: Option<&Triangulation>,
        scale: Scale,
    ) -> Result<()> {
        if self.stale {
            self.rebuild_swapchain()?;
        }
        if self.paused {
            return Ok(());
        }
        let Some((swapchain, extent)) = self.swapchain.as_ref().map(|s| (s.raw(), s.extent()))
        else {
            return Ok(());
        };

        unsafe {
            self.ctx
                .device()
                .wait_for_fences(&[self.sync.in_flight], true, u64::MAX)
                .context("wait_for_fences(frame)")?;
        }

        let size = RenderSize {
            width: extent.width,
            height: extent.height,
        };
        self.uniform.write(&[CanvasUniform::new(size, scale)])?;
        self.frame
            .pack(polygons, triangulation)
            .context("pack frame geometry")?;
        self.upload_geometry()?;

        unsafe {
            if self.needs_record {
                self.record()?;
            }

            let image_index = match self.ctx.swapchain_loader().acquire_next_image(
                swapchain,
                u64::MAX,
                self.sync.image_available,
                vk::Fence::null(),
            ) {
                Ok((index, _suboptimal)) => index,
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    debug!("acquire: swapchain out of date, frame skipped");
                    self.stale = true;
                    return Ok(());
                }
                Err(e) => return Err(anyhow!("acquire_next_image: {e:?}")),
            };

            let cmd = self
                .targets
                .as_ref()
                .and_then(|t| t.command_buffers.get(image_index as usize).copied())
                .ok_or_else(|| anyhow!("no command buffer for image {image_index}"))?;

            let d = self.ctx.device();
            d.reset_fences(&[self.sync.in_flight])?;

            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let submit = vk::SubmitInfo {
                s_type: vk::StructureType::SUBMIT_INFO,
                wait_semaphore_count: 1,
                p_wait_semaphores: &self.sync.image_available,
                p_wait_dst_stage_mask: wait_stages.as_ptr(),
                command_buffer_count: 1,
                p_command_buffers: &cmd,
                signal_semaphore_count: 1,
                p_signal_semaphores: &self.sync.render_finished,
                ..Default::default()
            };
            d.queue_submit(
                self.ctx.queue(),
                std::slice::from_ref(&submit),
                self.sync.in_flight,
            )
            .context("queue_submit")?;

            let present = vk::PresentInfoKHR {
                s_type: vk::StructureType::PRESENT_INFO_KHR,
                wait_semaphore_count: 1,
                p_wait_semaphores: &self.sync.render_finished,
                swapchain_count: 1,
                p_swapchains: &swapchain,
                p_image_indices: &image_index,
                ..Default::default()
            };
            match self
                .ctx
                .swapchain_loader()
                .queue_present(self.ctx.queue(), &present)
            {
                Ok(false) => {}
                Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                    debug!("present: swapchain needs rebuild");
                    self.stale = true;
                }
                Err(e) => return Err(anyhow!("queue_present: {e:?}")),
            }
        }
        Ok(())
    }

    fn set_clear_color(&mut self, rgba: [f32; 4]) {
        self.clear = rgba;
        self.needs_record = true;
    }
}

// STRICT TEARDOWN ORDER:
// - device idle before anything is released
// - per-swapchain objects, then the swapchain
// - raw sync objects and pools
// - the remaining fields drop in declaration order: stream buffers and
//   pipelines first, the rendering context last
impl Drop for VkRenderer {
    fn drop(&mut self) {
        unsafe {
            self.ctx.device().device_wait_idle().ok();
            self.targets = None;
            self.swapchain = None;

            let d = self.ctx.device();
            if self.descriptor_pool != vk::DescriptorPool::null() {
                d.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.command_pool != vk::CommandPool::null() {
                d.destroy_command_pool(self.command_pool, None);
            }
            if self.sync.in_flight != vk::Fence::null() {
                d.destroy_fence(self.sync.in_flight, None);
            }
            for sem in [self.sync.image_available, self.sync.render_finished] {
                if sem != vk::Semaphore::null() {
                    d.destroy_semaphore(sem, None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scene_draw_order() {
        assert_eq!(
            draw_plan(true, true),
            vec![
                DrawStep::Triangles,
                DrawStep::PolygonEdges,
                DrawStep::PolygonVertices,
                DrawStep::TriangleEdges,
            ]
        );
    }

    #[test]
    fn missing_buffers_skip_their_draws() {
        assert_eq!(
            draw_plan(false, true),
            vec![DrawStep::PolygonEdges, DrawStep::PolygonVertices]
        );
        assert_eq!(
            draw_plan(true, false),
            vec![DrawStep::Triangles, DrawStep::TriangleEdges]
        );
        assert!(draw_plan(false, false).is_empty());
    }

    #[test]
    fn payload_sizes() {
        let vertices = [[0.0f32; 2]; 4];
        let indices = [0u32; 6];
        assert_eq!(byte_len(&vertices), 32);
        assert_eq!(byte_len(&indices), 24);
        assert_eq!(byte_len::<u32>(&[]), 0);
    }
}
