use std::{env, fs, path::PathBuf};

fn main() {
    let out = PathBuf::from(env::var("OUT_DIR").unwrap());

    // Shared vertex stage: canvas-space position -> clip space.
    //   - binding 0, location 0: R32G32_SFLOAT (pos)
    //   - set 0, binding 0: Canvas { vec2 size } (logical canvas size)
    let main_vert = r#"
#version 450
layout(location = 0) in vec2 inPos;

layout(set = 0, binding = 0) uniform Canvas { vec2 size; } canvas;

void main() {
    gl_Position = vec4(inPos / canvas.size * 2.0 - 1.0, 0.0, 1.0);
}
"#;

    // Filled triangles.
    let triangle_frag = r#"
#version 450
layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(0.62, 0.78, 0.94, 1.0);
}
"#;

    // Edges and vertices: color baked in per pipeline.
    let flat_frag = r#"
#version 450
layout(constant_id = 0) const float R = 0.0;
layout(constant_id = 1) const float G = 0.0;
layout(constant_id = 2) const float B = 0.0;

layout(location = 0) out vec4 outColor;

void main() {
    outColor = vec4(R, G, B, 1.0);
}
"#;

    // Polygon vertices: each segment's start point becomes a small square.
    let points_geom = r#"
#version 450
layout(lines) in;
layout(triangle_strip, max_vertices = 4) out;

layout(set = 0, binding = 0) uniform Canvas { vec2 size; } canvas;

const float HALF = 3.0;

void main() {
    vec4 c = gl_in[0].gl_Position;
    vec2 d = HALF * 2.0 / canvas.size;
    gl_Position = c + vec4(-d.x, -d.y, 0.0, 0.0); EmitVertex();
    gl_Position = c + vec4( d.x, -d.y, 0.0, 0.0); EmitVertex();
    gl_Position = c + vec4(-d.x,  d.y, 0.0, 0.0); EmitVertex();
    gl_Position = c + vec4( d.x,  d.y, 0.0, 0.0); EmitVertex();
    EndPrimitive();
}
"#;

    let comp = shaderc::Compiler::new().unwrap();
    let mut opts = shaderc::CompileOptions::new().unwrap();

    // Instance and devices are required to be 1.1.
    opts.set_target_env(
        shaderc::TargetEnv::Vulkan,
        shaderc::EnvVersion::Vulkan1_1 as u32,
    );
    opts.set_optimization_level(shaderc::OptimizationLevel::Performance);

    let shaders = [
        (main_vert, shaderc::ShaderKind::Vertex, "main.vert"),
        (triangle_frag, shaderc::ShaderKind::Fragment, "triangle.frag"),
        (flat_frag, shaderc::ShaderKind::Fragment, "flat.frag"),
        (points_geom, shaderc::ShaderKind::Geometry, "points.geom"),
    ];
    for (src, kind, name) in shaders {
        let spv = comp
            .compile_into_spirv(src, kind, name, "main", Some(&opts))
            .unwrap();
        fs::write(out.join(format!("{name}.spv")), spv.as_binary_u8()).unwrap();
    }

    // Re-run if this file changes (inline sources live here)
    println!("cargo:rerun-if-changed=build.rs");
}
