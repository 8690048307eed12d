//! Spinning textured quad
//!
//! ```bash
//! cargo run --example spinning_quad -- --backend vulkan --no-vsync
//! ```

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use glam::{Mat4, Vec3};
use render_environment::command::{Draw, SetUniform};
use render_environment::resources::{Descriptor, Program, RenderedObject, Texture};
use render_environment::{geometry, window, BackendType, Command, EnvironmentConfig, RenderingEnvironment};

const SHADER: &str = r#"
struct Transform {
    model: mat4x4<f32>,
}
@group(0) @binding(0) var<uniform> transform: Transform;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = transform.model * vec4<f32>(position, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, in.uv);
}
"#;

/// Graphics backend selection for CLI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliBackend {
    /// Cross-platform backend via wgpu
    #[default]
    Wgpu,
    /// Native Vulkan backend via ash
    Vulkan,
    /// Opens the window but draws nothing
    Dummy,
}

impl From<CliBackend> for BackendType {
    fn from(cli: CliBackend) -> Self {
        match cli {
            CliBackend::Wgpu => BackendType::Wgpu,
            CliBackend::Vulkan => BackendType::Vulkan,
            CliBackend::Dummy => BackendType::Dummy,
        }
    }
}

#[derive(Debug, Parser)]
#[command(about = "Draws a spinning textured quad")]
struct Args {
    #[arg(long, value_enum, default_value_t = CliBackend::default())]
    backend: CliBackend,
    /// Disable vertical sync
    #[arg(long)]
    no_vsync: bool,
    #[arg(long, default_value_t = 800)]
    width: u32,
    #[arg(long, default_value_t = 600)]
    height: u32,
    /// Turns per second
    #[arg(long, default_value_t = 0.25)]
    speed: f32,
}

fn main() {
    render_environment::init_logging();
    let args = Args::parse();

    let config = EnvironmentConfig {
        title: "Spinning quad".to_string(),
        width: args.width,
        height: args.height,
        backend: args.backend.into(),
        vsync: !args.no_vsync,
        ..Default::default()
    };

    let texture = Descriptor::new(
        Texture::checkerboard(8, [230, 80, 60, 255], [240, 240, 240, 255]).with_label("checkerboard"),
    );
    let program = Descriptor::new(Program::new(SHADER).with_label("spinning"));
    let quad = Descriptor::new(
        RenderedObject::new(&program, &geometry::quad())
            .with_label("quad")
            .map_attributes_by_name()
            .with_texture("albedo", &texture),
    );

    let environment = RenderingEnvironment::new();
    environment.handle_rendered_object(&quad);

    let start = Instant::now();
    let speed = args.speed;
    let object = quad.clone();
    environment.add_command_supplier(move || -> Vec<Arc<dyn Command>> {
        let angle = start.elapsed().as_secs_f32() * speed * std::f32::consts::TAU;
        let model = Mat4::from_axis_angle(Vec3::Z, angle) * Mat4::from_scale(Vec3::splat(1.2));
        vec![
            Arc::new(SetUniform::new(&object, "model", model)),
            Arc::new(Draw(object.clone())),
        ]
    });

    let mut frames = 0u64;
    let result = window::run(config, environment, move |_, _| {
        frames += 1;
        if frames % 600 == 0 {
            log::info!("{frames} frames");
        }
    });
    if let Err(e) = result {
        log::error!("{e}");
        std::process::exit(1);
    }
}
