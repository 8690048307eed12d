//! Common utilities for the integration tests.
//!
//! Tests are parameterized over the backends that can run without a window:
//! the dummy backend always, headless wgpu whenever an adapter is present.

use std::sync::Arc;

use render_environment::backend::dummy::DummyBackend;
use render_environment::resources::{DataBuffer, Descriptor, GraphicsObject, Program, RenderedObject, Texture};
use render_environment::{geometry, Backend, BackendType, CollectingReporter, Renderer};

/// Textured shader with one uniform block
pub const TEXTURED_SHADER: &str = r#"
struct Params {
    tint: vec4<f32>,
    scale: f32,
}
@group(0) @binding(0) var<uniform> params: Params;
@group(0) @binding(1) var albedo: texture_2d<f32>;
@group(0) @binding(2) var albedo_sampler: sampler;

struct VertexOutput {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> VertexOutput {
    var out: VertexOutput;
    out.position = vec4<f32>(position * params.scale, 1.0);
    out.uv = uv;
    return out;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4<f32> {
    return textureSample(albedo, albedo_sampler, in.uv) * params.tint;
}
"#;

/// Position-only shader with a solid color
pub const FLAT_SHADER: &str = r#"
struct Globals {
    color: vec4<f32>,
}
@group(0) @binding(0) var<uniform> globals: Globals;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.color;
}
"#;

/// Backends the tests can create without a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestBackend {
    Dummy,
    Wgpu,
}

impl TestBackend {
    fn backend_type(self) -> BackendType {
        match self {
            TestBackend::Dummy => BackendType::Dummy,
            TestBackend::Wgpu => BackendType::Wgpu,
        }
    }

    /// Create a headless backend, or `None` when this machine cannot
    pub fn create(self, width: u32, height: u32) -> Option<Backend> {
        match Backend::headless(self.backend_type(), width, height) {
            Ok(backend) => Some(backend),
            Err(e) => {
                eprintln!("Backend {self:?} not available, skipping: {e}");
                None
            }
        }
    }
}

/// A renderer plus the reporter it reports into.
pub struct TestContext {
    pub renderer: Renderer,
    pub reporter: Arc<CollectingReporter>,
}

impl TestContext {
    #[allow(dead_code)]
    pub fn new(backend: TestBackend) -> Option<Self> {
        let backend = backend.create(64, 64)?;
        Some(Self::with_backend(backend))
    }

    #[allow(dead_code)]
    pub fn dummy() -> Self {
        Self::with_backend(Backend::Dummy(DummyBackend::new(64, 64)))
    }

    pub fn with_backend(backend: Backend) -> Self {
        let reporter = Arc::new(CollectingReporter::new());
        let renderer = Renderer::new(backend).with_reporter(reporter.clone());
        Self { renderer, reporter }
    }

    /// The dummy backend, for tests that inspect native objects
    #[allow(dead_code)]
    pub fn dummy_backend(&self) -> Option<&DummyBackend> {
        self.renderer.backend().as_dummy()
    }
}

/// Graphics object with one index buffer and one attribute buffer
#[allow(dead_code)]
pub fn indexed_triangle() -> (Descriptor<GraphicsObject>, Descriptor<DataBuffer>, Descriptor<DataBuffer>) {
    let index = Descriptor::new(DataBuffer::indices_u16(&[0, 1, 2]).with_label("I"));
    let vertices = Descriptor::new(
        DataBuffer::from_f32(3, &[0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0]).with_label("V"),
    );
    let object = Descriptor::new(
        GraphicsObject::triangles()
            .with_label("G")
            .with_attribute("position", &vertices)
            .with_index(&index),
    );
    (object, index, vertices)
}

/// A textured quad ready to be handled
#[allow(dead_code)]
pub fn textured_quad(texture: &Descriptor<Texture>) -> Descriptor<RenderedObject> {
    let program = Descriptor::new(Program::new(TEXTURED_SHADER).with_label("textured"));
    Descriptor::new(
        RenderedObject::new(&program, &geometry::quad())
            .with_label("textured quad")
            .map_attributes_by_name()
            .with_texture("albedo", texture),
    )
}

/// A flat-colored object over `geometry`
#[allow(dead_code)]
pub fn flat_object(geometry: &Descriptor<GraphicsObject>) -> Descriptor<RenderedObject> {
    let program = Descriptor::new(Program::new(FLAT_SHADER).with_label("flat"));
    Descriptor::new(RenderedObject::new(&program, geometry).map_attribute("position", "position"))
}
