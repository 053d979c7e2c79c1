// SPDX-License-Identifier: CEPL-1.0
//! Render pass, layouts and the four graphics pipelines.
//!
//! | pipeline        | stages                 | topology      | fill  | color            |
//! |-----------------|------------------------|---------------|-------|------------------|
//! | triangle        | main.vert, triangle    | triangle list | fill  | fragment stage   |
//! | triangle edge   | main.vert, flat        | triangle list | line  | light flat color |
//! | polygon edge    | main.vert, flat        | line list     | fill  | dark flat color  |
//! | polygon vertex  | main.vert, points.geom, flat | line list | fill | dark flat color |
use std::ffi::{c_void, CStr};
use std::io::Cursor;

use anyhow::{anyhow, Context, Result};
use ash::util::read_spv;
use ash::vk;

use crate::context::RenderingContext;

pub const TRIANGLE_EDGE_COLOR: [f32; 3] = [1.0, 1.0, 1.0];
pub const POLYGON_COLOR: [f32; 3] = [0.1, 0.1, 0.1];
/// Polygon edge width when the device supports wide lines.
pub const WIDE_EDGE_WIDTH: f32 = 3.0;

const ENTRY: &CStr = c"main";

/// Line width used for polygon edges.
pub fn edge_line_width(wide_lines: bool, range: [f32; 2]) -> f32 {
    if wide_lines {
        WIDE_EDGE_WIDTH.min(range[1]).max(1.0)
    } else {
        1.0
    }
}

unsafe fn load_shader(device: &ash::Device, bytes: &[u8]) -> Result<vk::ShaderModule> {
    let code = read_spv(&mut Cursor::new(bytes))?;
    let ci = vk::ShaderModuleCreateInfo {
        s_type: vk::StructureType::SHADER_MODULE_CREATE_INFO,
        p_code: code.as_ptr(),
        code_size: code.len() * 4,
        ..Default::default()
    };
    Ok(device.create_shader_module(&ci, None)?)
}

struct Shaders {
    vert: vk::ShaderModule,
    triangle_frag: vk::ShaderModule,
    flat_frag: vk::ShaderModule,
    points_geom: vk::ShaderModule,
}

impl Shaders {
    unsafe fn load(device: &ash::Device) -> Result<Self> {
        let mut s = Self {
            vert: vk::ShaderModule::null(),
            triangle_frag: vk::ShaderModule::null(),
            flat_frag: vk::ShaderModule::null(),
            points_geom: vk::ShaderModule::null(),
        };
        let sources: [(&mut vk::ShaderModule, &[u8]); 4] = [
            (
                &mut s.vert,
                include_bytes!(concat!(env!("OUT_DIR"), "/main.vert.spv")),
            ),
            (
                &mut s.triangle_frag,
                include_bytes!(concat!(env!("OUT_DIR"), "/triangle.frag.spv")),
            ),
            (
                &mut s.flat_frag,
                include_bytes!(concat!(env!("OUT_DIR"), "/flat.frag.spv")),
            ),
            (
                &mut s.points_geom,
                include_bytes!(concat!(env!("OUT_DIR"), "/points.geom.spv")),
            ),
        ];
        let mut failed = None;
        for (slot, bytes) in sources {
            match load_shader(device, bytes) {
                Ok(m) => *slot = m,
                Err(e) => {
                    failed = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failed {
            s.destroy(device);
            return Err(e.context("create_shader_module"));
        }
        Ok(s)
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        for m in [self.vert, self.triangle_frag, self.flat_frag, self.points_geom] {
            if m != vk::ShaderModule::null() {
                device.destroy_shader_module(m, None);
            }
        }
    }
}

/// One multisampled color attachment resolved into the presentable image,
/// or the presentable image alone when the device has no multisampling.
unsafe fn create_render_pass(
    device: &ash::Device,
    format: vk::Format,
    samples: vk::SampleCountFlags,
) -> Result<vk::RenderPass> {
    let msaa = samples != vk::SampleCountFlags::TYPE_1;

    let color = vk::AttachmentDescription {
        format,
        samples,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: if msaa {
            vk::AttachmentStoreOp::DONT_CARE
        } else {
            vk::AttachmentStoreOp::STORE
        },
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: if msaa {
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        } else {
            vk::ImageLayout::PRESENT_SRC_KHR
        },
        ..Default::default()
    };
    let resolve = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::DONT_CARE,
        store_op: vk::AttachmentStoreOp::STORE,
        stencil_load_op: vk::AttachmentLoadOp::DONT_CARE,
        stencil_store_op: vk::AttachmentStoreOp::DONT_CARE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let attachments = [color, resolve];

    let color_ref = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let resolve_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription {
        pipeline_bind_point: vk::PipelineBindPoint::GRAPHICS,
        color_attachment_count: 1,
        p_color_attachments: &color_ref,
        p_resolve_attachments: if msaa {
            &resolve_ref
        } else {
            std::ptr::null()
        },
        ..Default::default()
    };

    // the acquire semaphore is waited at color output; order the layout
    // transition after it
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        ..Default::default()
    };

    let rp_info = vk::RenderPassCreateInfo {
        s_type: vk::StructureType::RENDER_PASS_CREATE_INFO,
        attachment_count: if msaa { 2 } else { 1 },
        p_attachments: attachments.as_ptr(),
        subpass_count: 1,
        p_subpasses: &subpass,
        dependency_count: 1,
        p_dependencies: &dependency,
        ..Default::default()
    };
    Ok(device.create_render_pass(&rp_info, None)?)
}

unsafe fn create_canvas_set_layout(device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
    let binding = vk::DescriptorSetLayoutBinding {
        binding: 0,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        descriptor_count: 1,
        stage_flags: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::GEOMETRY,
        ..Default::default()
    };
    let ci = vk::DescriptorSetLayoutCreateInfo {
        s_type: vk::StructureType::DESCRIPTOR_SET_LAYOUT_CREATE_INFO,
        binding_count: 1,
        p_bindings: &binding,
        ..Default::default()
    };
    Ok(device.create_descriptor_set_layout(&ci, None)?)
}

struct PipelineDesc {
    geometry: Option<vk::ShaderModule>,
    fragment: vk::ShaderModule,
    flat_color: Option<[f32; 3]>,
    topology: vk::PrimitiveTopology,
    polygon_mode: vk::PolygonMode,
    line_width: f32,
}

unsafe fn create_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    samples: vk::SampleCountFlags,
    vert: vk::ShaderModule,
    desc: &PipelineDesc,
) -> Result<vk::Pipeline> {
    let spec_entries = [0u32, 1, 2].map(|i| vk::SpecializationMapEntry {
        constant_id: i,
        offset: i * 4,
        size: 4,
    });
    let spec_data = desc.flat_color.unwrap_or_default();
    let spec_info = vk::SpecializationInfo {
        map_entry_count: spec_entries.len() as u32,
        p_map_entries: spec_entries.as_ptr(),
        data_size: std::mem::size_of_val(&spec_data),
        p_data: spec_data.as_ptr() as *const c_void,
        ..Default::default()
    };

    let mut stages = vec![vk::PipelineShaderStageCreateInfo {
        s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
        stage: vk::ShaderStageFlags::VERTEX,
        module: vert,
        p_name: ENTRY.as_ptr(),
        ..Default::default()
    }];
    if let Some(geom) = desc.geometry {
        stages.push(vk::PipelineShaderStageCreateInfo {
            s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
            stage: vk::ShaderStageFlags::GEOMETRY,
            module: geom,
            p_name: ENTRY.as_ptr(),
            ..Default::default()
        });
    }
    stages.push(vk::PipelineShaderStageCreateInfo {
        s_type: vk::StructureType::PIPELINE_SHADER_STAGE_CREATE_INFO,
        stage: vk::ShaderStageFlags::FRAGMENT,
        module: desc.fragment,
        p_name: ENTRY.as_ptr(),
        p_specialization_info: if desc.flat_color.is_some() {
            &spec_info
        } else {
            std::ptr::null()
        },
        ..Default::default()
    });

    // binding 0: tightly packed vec2 positions
    let vb = vk::VertexInputBindingDescription {
        binding: 0,
        stride: std::mem::size_of::<[f32; 2]>() as u32,
        input_rate: vk::VertexInputRate::VERTEX,
    };
    let va = vk::VertexInputAttributeDescription {
        location: 0,
        binding: 0,
        format: vk::Format::R32G32_SFLOAT,
        offset: 0,
    };
    let vertex_input = vk::PipelineVertexInputStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VERTEX_INPUT_STATE_CREATE_INFO,
        vertex_binding_description_count: 1,
        p_vertex_binding_descriptions: &vb,
        vertex_attribute_description_count: 1,
        p_vertex_attribute_descriptions: &va,
        ..Default::default()
    };
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_INPUT_ASSEMBLY_STATE_CREATE_INFO,
        topology: desc.topology,
        ..Default::default()
    };
    let dyn_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state = vk::PipelineDynamicStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_DYNAMIC_STATE_CREATE_INFO,
        dynamic_state_count: dyn_states.len() as u32,
        p_dynamic_states: dyn_states.as_ptr(),
        ..Default::default()
    };
    let viewport_state = vk::PipelineViewportStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_VIEWPORT_STATE_CREATE_INFO,
        viewport_count: 1,
        scissor_count: 1,
        ..Default::default()
    };
    let raster = vk::PipelineRasterizationStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_RASTERIZATION_STATE_CREATE_INFO,
        polygon_mode: desc.polygon_mode,
        cull_mode: vk::CullModeFlags::NONE,
        front_face: vk::FrontFace::COUNTER_CLOCKWISE,
        line_width: desc.line_width,
        ..Default::default()
    };
    let multisample = vk::PipelineMultisampleStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_MULTISAMPLE_STATE_CREATE_INFO,
        rasterization_samples: samples,
        ..Default::default()
    };
    let color_blend_att = vk::PipelineColorBlendAttachmentState {
        color_write_mask: vk::ColorComponentFlags::RGBA,
        blend_enable: vk::FALSE,
        ..Default::default()
    };
    let color_blend = vk::PipelineColorBlendStateCreateInfo {
        s_type: vk::StructureType::PIPELINE_COLOR_BLEND_STATE_CREATE_INFO,
        attachment_count: 1,
        p_attachments: &color_blend_att,
        ..Default::default()
    };

    let pipeline_info = vk::GraphicsPipelineCreateInfo {
        s_type: vk::StructureType::GRAPHICS_PIPELINE_CREATE_INFO,
        stage_count: stages.len() as u32,
        p_stages: stages.as_ptr(),
        p_vertex_input_state: &vertex_input,
        p_input_assembly_state: &input_assembly,
        p_viewport_state: &viewport_state,
        p_rasterization_state: &raster,
        p_multisample_state: &multisample,
        p_color_blend_state: &color_blend,
        p_dynamic_state: &dynamic_state,
        layout,
        render_pass,
        subpass: 0,
        ..Default::default()
    };

    match device.create_graphics_pipelines(
        vk::PipelineCache::null(),
        std::slice::from_ref(&pipeline_info),
        None,
    ) {
        Ok(p) => p
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("create_graphics_pipelines returned nothing")),
        Err((_, err)) => Err(anyhow!("create_graphics_pipelines failed: {err:?}")),
    }
}

/// Everything that depends only on the rendering context, not on the
/// swapchain generation.
pub struct Pipelines {
    device: ash::Device,
    render_pass: vk::RenderPass,
    set_layout: vk::DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pub triangle: vk::Pipeline,
    pub triangle_edge: vk::Pipeline,
    pub polygon_edge: vk::Pipeline,
    pub polygon_vertex: vk::Pipeline,
}

impl Pipelines {
    pub fn new(ctx: &RenderingContext) -> Result<Self> {
        let device = ctx.device();
        let s = ctx.settings();
        let samples = s.sample_count;
        let edge_width = edge_line_width(ctx.wide_lines(), ctx.capabilities().line_width_range);

        unsafe {
            // partially built objects are released by Drop on error
            let mut this = Self {
                device: device.clone(),
                render_pass: vk::RenderPass::null(),
                set_layout: vk::DescriptorSetLayout::null(),
                layout: vk::PipelineLayout::null(),
                triangle: vk::Pipeline::null(),
                triangle_edge: vk::Pipeline::null(),
                polygon_edge: vk::Pipeline::null(),
                polygon_vertex: vk::Pipeline::null(),
            };
            this.render_pass = create_render_pass(device, s.format.format, samples)
                .context("create_render_pass")?;
            this.set_layout = create_canvas_set_layout(device)?;
            let layout_info = vk::PipelineLayoutCreateInfo {
                s_type: vk::StructureType::PIPELINE_LAYOUT_CREATE_INFO,
                set_layout_count: 1,
                p_set_layouts: &this.set_layout,
                ..Default::default()
            };
            this.layout = device.create_pipeline_layout(&layout_info, None)?;

            let shaders = Shaders::load(device)?;
            let built = this.build_all(&shaders, samples, edge_width);
            shaders.destroy(device);
            built?;

            tracing::debug!("pipelines ready (samples {samples:?}, edge width {edge_width})");
            Ok(this)
        }
    }

    unsafe fn build_all(
        &mut self,
        shaders: &Shaders,
        samples: vk::SampleCountFlags,
        edge_width: f32,
    ) -> Result<()> {
        let make = |desc: PipelineDesc| {
            create_pipeline(
                &self.device,
                self.render_pass,
                self.layout,
                samples,
                shaders.vert,
                &desc,
            )
        };
        let triangle = make(PipelineDesc {
            geometry: None,
            fragment: shaders.triangle_frag,
            flat_color: None,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            line_width: 1.0,
        });
        let triangle_edge = make(PipelineDesc {
            geometry: None,
            fragment: shaders.flat_frag,
            flat_color: Some(TRIANGLE_EDGE_COLOR),
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::LINE,
            line_width: 1.0,
        });
        let polygon_edge = make(PipelineDesc {
            geometry: None,
            fragment: shaders.flat_frag,
            flat_color: Some(POLYGON_COLOR),
            topology: vk::PrimitiveTopology::LINE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            line_width: edge_width,
        });
        let polygon_vertex = make(PipelineDesc {
            geometry: Some(shaders.points_geom),
            fragment: shaders.flat_frag,
            flat_color: Some(POLYGON_COLOR),
            topology: vk::PrimitiveTopology::LINE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            line_width: 1.0,
        });

        // keep whatever was built so Drop can release it
        let mut first_err = None;
        for (slot, built) in [
            (&mut self.triangle, triangle),
            (&mut self.triangle_edge, triangle_edge),
            (&mut self.polygon_edge, polygon_edge),
            (&mut self.polygon_vertex, polygon_vertex),
        ] {
            match built {
                Ok(p) => *slot = p,
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn set_layout(&self) -> vk::DescriptorSetLayout {
        self.set_layout
    }

    pub fn layout(&self) -> vk::PipelineLayout {
        self.layout
    }
}

impl Drop for Pipelines {
    fn drop(&mut self) {
        let d = &self.device;
        unsafe {
            for p in [
                self.triangle,
                self.triangle_edge,
                self.polygon_edge,
                self.polygon_vertex,
            ] {
                if p != vk::Pipeline::null() {
                    d.destroy_pipeline(p, None);
                }
            }
            if self.layout != vk::PipelineLayout::null() {
                d.destroy_pipeline_layout(self.layout, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                d.destroy_descriptor_set_layout(self.set_layout, None);
            }
            if self.render_pass != vk::RenderPass::null() {
                d.destroy_render_pass(self.render_pass, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edge_width_follows_wide_lines() {
        assert_eq!(edge_line_width(true, [1.0, 64.0]), 3.0);
        assert_eq!(edge_line_width(false, [1.0, 64.0]), 1.0);
    }

    #[test]
    fn edge_width_respects_device_range() {
        assert_eq!(edge_line_width(true, [1.0, 2.0]), 2.0);
        // a bogus range never drops below one pixel
        assert_eq!(edge_line_width(true, [0.0, 0.0]), 1.0);
    }
}
