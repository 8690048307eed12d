//! The renderer: one handler per resource kind plus the active backend

use crate::backend::{
    Backend, ColorAttachment, DepthStencilAttachment, FrameContext, GraphicsBackend, LoadOp, RenderPassDescriptor,
    StoreOp, TextureDescriptor, TextureHandle, TextureUsage, TextureViewHandle,
};
use crate::error::{ErrorReporter, LogReporter, RenderError, RenderResult};
use crate::handler::{
    BackendContext, DataBufferHandler, DrawCommand, FrameBufferHandler, GraphicsObjectHandler, NameGenerator,
    ProgramHandler, RenderTarget, RenderedObjectDeps, RenderedObjectHandler, SequentialNames, TextureHandler,
    DEPTH_FORMAT,
};
use crate::resources::{
    DataBuffer, Descriptor, DescriptorId, FrameBuffer, GraphicsObject, Program, RenderedObject, Texture,
};
use crate::uniform::UniformValue;
use crate::EnvironmentConfig;
use std::collections::HashSet;
use std::ops::Range;
use std::sync::Arc;

/// Where draws currently land
#[derive(Debug, Clone)]
enum ActiveTarget {
    Surface,
    FrameBuffer(Descriptor<FrameBuffer>),
}

#[derive(Debug)]
struct ActiveFrame {
    context: FrameContext,
    target: ActiveTarget,
    /// Frame buffers already cleared this frame
    cleared: HashSet<DescriptorId>,
}

#[derive(Debug, Clone, Copy)]
struct SurfaceDepth {
    texture: TextureHandle,
    view: TextureViewHandle,
    width: u32,
    height: u32,
}

/// Owns the backend and every handler. Lives on the rendering thread.
pub struct Renderer {
    backend: Backend,
    reporter: Arc<dyn ErrorReporter>,
    data_buffers: DataBufferHandler,
    frame_buffers: FrameBufferHandler,
    textures: TextureHandler,
    graphics_objects: GraphicsObjectHandler,
    programs: ProgramHandler,
    rendered_objects: RenderedObjectHandler,
    clear_color: [f32; 4],
    surface_depth: Option<SurfaceDepth>,
    frame: Option<ActiveFrame>,
}

/// Builds a [`BackendContext`] and the dependency handlers a rendered object needs
macro_rules! split {
    ($self:ident, $ctx:ident, $deps:ident) => {
        let mut $ctx = BackendContext::new(&mut $self.backend, &*$self.reporter);
        let mut $deps = RenderedObjectDeps {
            programs: &mut $self.programs,
            graphics_objects: &mut $self.graphics_objects,
            data_buffers: &mut $self.data_buffers,
            textures: &mut $self.textures,
            frame_buffers: &mut $self.frame_buffers,
        };
    };
}

impl Renderer {
    pub fn new(backend: Backend) -> Self {
        log::info!("Renderer using the {} backend", backend.name());
        Self {
            backend,
            reporter: Arc::new(LogReporter),
            data_buffers: DataBufferHandler::new(),
            frame_buffers: FrameBufferHandler::new(),
            textures: TextureHandler::new(),
            graphics_objects: GraphicsObjectHandler::new(),
            programs: ProgramHandler::default(),
            rendered_objects: RenderedObjectHandler::new(),
            clear_color: [0.1, 0.1, 0.15, 1.0],
            surface_depth: None,
            frame: None,
        }
    }

    /// Renderer with the clear color and program names of `config`
    pub fn from_config(backend: Backend, config: &EnvironmentConfig) -> Self {
        Self::new(backend)
            .with_clear_color(config.clear_color)
            .with_program_prefix(&config.program_name_prefix)
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Replaces the program name generator. Only affects programs handled afterwards.
    pub fn with_name_generator(mut self, names: Box<dyn NameGenerator>) -> Self {
        self.programs = ProgramHandler::new(names);
        self
    }

    pub fn with_program_prefix(self, prefix: &str) -> Self {
        self.with_name_generator(Box::new(SequentialNames::new(prefix)))
    }

    pub fn with_clear_color(mut self, clear_color: [f32; 4]) -> Self {
        self.clear_color = clear_color;
        self
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut Backend {
        &mut self.backend
    }

    pub fn reporter(&self) -> &Arc<dyn ErrorReporter> {
        &self.reporter
    }

    /// Send `error` to the reporter and hand it back
    pub fn report(&self, error: RenderError) -> RenderError {
        self.reporter.report(&error);
        error
    }

    pub fn programs(&self) -> &ProgramHandler {
        &self.programs
    }

    pub fn graphics_objects(&self) -> &GraphicsObjectHandler {
        &self.graphics_objects
    }

    pub fn data_buffers(&self) -> &DataBufferHandler {
        &self.data_buffers
    }

    pub fn textures(&self) -> &TextureHandler {
        &self.textures
    }

    pub fn frame_buffers(&self) -> &FrameBufferHandler {
        &self.frame_buffers
    }

    pub fn rendered_objects(&self) -> &RenderedObjectHandler {
        &self.rendered_objects
    }

    // Handling

    pub fn handle_data_buffer(&mut self, descriptor: &Descriptor<DataBuffer>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.data_buffers.handle(&mut ctx, descriptor).map(|_| ())
    }

    pub fn release_data_buffer(&mut self, descriptor: &Descriptor<DataBuffer>) -> RenderResult<usize> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.data_buffers.release(&mut ctx, descriptor)
    }

    pub fn handle_frame_buffer(&mut self, descriptor: &Descriptor<FrameBuffer>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.frame_buffers.handle(&mut ctx, descriptor).map(|_| ())
    }

    pub fn release_frame_buffer(&mut self, descriptor: &Descriptor<FrameBuffer>) -> RenderResult<usize> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.frame_buffers.release(&mut ctx, descriptor)
    }

    pub fn handle_texture(&mut self, descriptor: &Descriptor<Texture>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.textures
            .handle(&mut ctx, &mut self.frame_buffers, descriptor)
            .map(|_| ())
    }

    pub fn release_texture(&mut self, descriptor: &Descriptor<Texture>) -> RenderResult<usize> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.textures.release(&mut ctx, &mut self.frame_buffers, descriptor)
    }

    pub fn handle_graphics_object(&mut self, descriptor: &Descriptor<GraphicsObject>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.graphics_objects
            .handle(&mut ctx, &mut self.data_buffers, descriptor)
            .map(|_| ())
    }

    pub fn release_graphics_object(&mut self, descriptor: &Descriptor<GraphicsObject>) -> RenderResult<usize> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.graphics_objects
            .release(&mut ctx, &mut self.data_buffers, descriptor)
    }

    pub fn handle_program(&mut self, descriptor: &Descriptor<Program>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.programs.handle(&mut ctx, descriptor).map(|_| ())
    }

    pub fn release_program(&mut self, descriptor: &Descriptor<Program>) -> RenderResult<usize> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.programs.release(&mut ctx, descriptor)
    }

    pub fn handle_rendered_object(&mut self, descriptor: &Descriptor<RenderedObject>) -> RenderResult<()> {
        split!(self, ctx, deps);
        self.rendered_objects
            .handle(&mut ctx, &mut deps, descriptor)
            .map(|_| ())
    }

    pub fn release_rendered_object(&mut self, descriptor: &Descriptor<RenderedObject>) -> RenderResult<usize> {
        split!(self, ctx, deps);
        self.rendered_objects.release(&mut ctx, &mut deps, descriptor)
    }

    // Updates

    pub fn update_data_buffer(&mut self, descriptor: &Descriptor<DataBuffer>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.data_buffers.update(&mut ctx, descriptor)
    }

    pub fn update_data_buffer_range(
        &mut self,
        descriptor: &Descriptor<DataBuffer>,
        range: Range<usize>,
    ) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.data_buffers.update_range(&mut ctx, descriptor, range)
    }

    pub fn update_texture(&mut self, descriptor: &Descriptor<Texture>) -> RenderResult<()> {
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.textures.update(&mut ctx, descriptor)
    }

    /// Write `value` into uniform `name` of a handled rendered object
    pub fn set_uniform(
        &mut self,
        descriptor: &Descriptor<RenderedObject>,
        name: &str,
        value: impl Into<UniformValue>,
    ) -> RenderResult<()> {
        let value = value.into();
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        self.rendered_objects
            .set_uniform(&mut ctx, descriptor, name, value.as_bytes())
    }

    // Frames

    pub fn frame_active(&self) -> bool {
        self.frame.is_some()
    }

    pub fn resize(&mut self, width: u32, height: u32) {
        if width == 0 || height == 0 {
            return;
        }
        self.backend.resize(width, height);
        log::debug!("Surface resized to {:?}", self.backend.surface_size());
    }

    fn ensure_surface_depth(&mut self, width: u32, height: u32) -> RenderResult<TextureViewHandle> {
        if let Some(depth) = self.surface_depth {
            if depth.width == width && depth.height == height {
                return Ok(depth.view);
            }
        }
        self.destroy_surface_depth();

        let texture = self.backend.create_texture(&TextureDescriptor {
            label: Some("surface depth".into()),
            width,
            height,
            format: DEPTH_FORMAT,
            usage: TextureUsage::RENDER_ATTACHMENT,
            ..Default::default()
        })?;
        let view = match self.backend.create_texture_view(texture) {
            Ok(view) => view,
            Err(e) => {
                self.backend.destroy_texture(texture);
                return Err(e.into());
            }
        };
        self.surface_depth = Some(SurfaceDepth {
            texture,
            view,
            width,
            height,
        });
        Ok(view)
    }

    fn destroy_surface_depth(&mut self) {
        if let Some(depth) = self.surface_depth.take() {
            self.backend.destroy_texture_view(depth.view);
            self.backend.destroy_texture(depth.texture);
        }
    }

    /// Acquire the next surface image and start drawing into it
    pub fn begin_frame(&mut self) -> RenderResult<()> {
        if self.frame.is_some() {
            return Err(RenderError::Backend(crate::backend::BackendError::AcquireImageFailed(
                "frame already in progress".into(),
            )));
        }
        let context = self.backend.begin_frame()?;
        let depth = match self.ensure_surface_depth(context.width, context.height) {
            Ok(depth) => depth,
            Err(e) => {
                // Present the empty frame so the backend is ready for the next one
                self.backend.end_frame().ok();
                return Err(e);
            }
        };

        self.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some("surface".into()),
            color_attachments: vec![ColorAttachment {
                view: context.swapchain_view,
                load_op: LoadOp::Clear(self.clear_color),
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: Some(DepthStencilAttachment {
                view: depth,
                depth_load_op: LoadOp::Clear([1.0, 0.0, 0.0, 0.0]),
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        self.frame = Some(ActiveFrame {
            context,
            target: ActiveTarget::Surface,
            cleared: HashSet::new(),
        });
        Ok(())
    }

    /// Finish the current pass and present
    pub fn end_frame(&mut self) -> RenderResult<()> {
        if self.frame.take().is_none() {
            return Err(RenderError::NoActiveFrame);
        }
        self.backend.end_render_pass();
        self.backend.end_frame()?;
        Ok(())
    }

    /// Direct following draws into `frame_buffer`, or back to the surface with
    /// `None`. A frame buffer is cleared the first time it is activated in a
    /// frame and loaded afterwards.
    pub fn activate_frame_buffer(&mut self, frame_buffer: Option<&Descriptor<FrameBuffer>>) -> RenderResult<()> {
        let Some(frame) = self.frame.as_mut() else {
            self.reporter.report(&RenderError::NoActiveFrame);
            return Err(RenderError::NoActiveFrame);
        };

        let (label, color, depth, first_use, clear_color, target) = match frame_buffer {
            None => (
                "surface".to_string(),
                frame.context.swapchain_view,
                self.surface_depth.map(|d| d.view),
                false,
                self.clear_color,
                ActiveTarget::Surface,
            ),
            Some(fb) => {
                let Some(native) = self.frame_buffers.get_internal(fb) else {
                    let error = RenderError::missing(format!("activation of {}", fb.name()), "handled frame buffer");
                    self.reporter.report(&error);
                    return Err(error);
                };
                (
                    fb.name(),
                    native.color_view,
                    native.depth.map(|(_, view)| view),
                    frame.cleared.insert(fb.id()),
                    fb.clear_color,
                    ActiveTarget::FrameBuffer(fb.clone()),
                )
            }
        };

        let load_op = if first_use { LoadOp::Clear(clear_color) } else { LoadOp::Load };
        let depth_load_op = if first_use {
            LoadOp::Clear([1.0, 0.0, 0.0, 0.0])
        } else {
            LoadOp::Load
        };

        self.backend.end_render_pass();
        self.backend.begin_render_pass(&RenderPassDescriptor {
            label: Some(label),
            color_attachments: vec![ColorAttachment {
                view: color,
                load_op,
                store_op: StoreOp::Store,
            }],
            depth_stencil_attachment: depth.map(|view| DepthStencilAttachment {
                view,
                depth_load_op,
                depth_store_op: StoreOp::Store,
                depth_clear_value: 1.0,
            }),
        });
        frame.target = target;
        Ok(())
    }

    fn current_target(&self) -> RenderResult<RenderTarget> {
        let frame = self.frame.as_ref().ok_or(RenderError::NoActiveFrame)?;
        match &frame.target {
            ActiveTarget::Surface => Ok(RenderTarget {
                format: self.backend.swapchain_format(),
                depth: true,
            }),
            ActiveTarget::FrameBuffer(fb) => {
                let native = self
                    .frame_buffers
                    .get_internal(fb)
                    .ok_or_else(|| RenderError::missing(format!("draw into {}", fb.name()), "handled frame buffer"))?;
                Ok(RenderTarget {
                    format: native.format,
                    depth: native.depth.is_some(),
                })
            }
        }
    }

    /// Draw a handled rendered object into the active target
    pub fn draw(&mut self, descriptor: &Descriptor<RenderedObject>) -> RenderResult<()> {
        let target = self.current_target().map_err(|e| self.report(e))?;
        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        let command = self.rendered_objects.prepare(&mut ctx, descriptor, target)?;
        self.record(&command);
        Ok(())
    }

    fn record(&mut self, command: &DrawCommand) {
        let backend = &mut self.backend;
        backend.set_render_pipeline(command.pipeline);
        if let Some(bind_group) = command.bind_group {
            backend.set_bind_group(0, bind_group);
        }
        for (slot, buffer) in command.vertex_buffers.iter().enumerate() {
            backend.set_vertex_buffer(slot as u32, *buffer, 0);
        }
        match command.index {
            Some(index) => {
                backend.set_index_buffer(index.buffer, 0, index.format);
                backend.draw_indexed(0..command.elements, 0, 0..command.instances);
            }
            None => backend.draw(0..command.elements, 0..command.instances),
        }
    }

    // Context replacement

    /// Move every live resource onto `backend` and return the previous one.
    ///
    /// Natives are destroyed on the old backend and recreated on the new one
    /// with the same counts; descriptors keep their identity.
    pub fn replace_backend(&mut self, backend: Backend) -> Backend {
        if self.frame.is_some() {
            log::warn!("Backend replaced mid-frame; presenting the partial frame");
            if let Err(e) = self.end_frame() {
                self.reporter.report(&e);
            }
        }
        self.backend.wait_idle();

        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        let rendered_objects = self.rendered_objects.release_all(&mut ctx);
        let graphics_objects = self.graphics_objects.release_all(&mut ctx);
        let textures = self.textures.release_all(&mut ctx);
        let programs = self.programs.release_all(&mut ctx);
        let frame_buffers = self.frame_buffers.release_all(&mut ctx);
        let data_buffers = self.data_buffers.release_all(&mut ctx);
        self.destroy_surface_depth();

        log::info!(
            "Replacing the {} backend with {}: {} data buffers, {} frame buffers, {} programs, {} textures, {} graphics objects, {} rendered objects",
            self.backend.name(),
            backend.name(),
            data_buffers.len(),
            frame_buffers.len(),
            programs.len(),
            textures.len(),
            graphics_objects.len(),
            rendered_objects.len()
        );
        let previous = std::mem::replace(&mut self.backend, backend);

        split!(self, ctx, deps);
        deps.data_buffers.handle_all(&mut ctx, data_buffers);
        deps.frame_buffers.handle_all(&mut ctx, frame_buffers);
        deps.programs.handle_all(&mut ctx, programs);
        deps.textures.handle_all(&mut ctx, deps.frame_buffers, textures);
        deps.graphics_objects
            .handle_all(&mut ctx, deps.data_buffers, graphics_objects);
        self.rendered_objects.handle_all(&mut ctx, &mut deps, rendered_objects);
        previous
    }

    /// Destroy every native resource and forget all descriptors
    pub fn release_all(&mut self) -> usize {
        if self.frame.is_some() {
            if let Err(e) = self.end_frame() {
                self.reporter.report(&e);
            }
        }
        self.backend.wait_idle();

        let mut ctx = BackendContext::new(&mut self.backend, &*self.reporter);
        let released = self.rendered_objects.release_all(&mut ctx).len()
            + self.graphics_objects.release_all(&mut ctx).len()
            + self.textures.release_all(&mut ctx).len()
            + self.programs.release_all(&mut ctx).len()
            + self.frame_buffers.release_all(&mut ctx).len()
            + self.data_buffers.release_all(&mut ctx).len();
        self.rendered_objects.forget_retired();
        self.programs.forget_retired();
        self.destroy_surface_depth();
        log::info!("Released {released} live descriptors");
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::error::CollectingReporter;
    use crate::geometry;

    const SHADER: &str = r#"
struct Globals {
    color: vec4<f32>,
    offset: vec2<f32>,
}
@group(0) @binding(0) var<uniform> globals: Globals;

@vertex
fn vs_main(@location(0) position: vec3<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position.xy + globals.offset, position.z, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.color;
}
"#;

    fn renderer() -> (Renderer, Arc<CollectingReporter>) {
        let reporter = Arc::new(CollectingReporter::new());
        let renderer = Renderer::new(Backend::Dummy(DummyBackend::new(64, 64))).with_reporter(reporter.clone());
        (renderer, reporter)
    }

    fn dummy(renderer: &Renderer) -> &DummyBackend {
        renderer.backend().as_dummy().unwrap()
    }

    fn quad_object() -> Descriptor<RenderedObject> {
        let program = Descriptor::new(Program::new(SHADER));
        Descriptor::new(RenderedObject::new(&program, &geometry::quad()).map_attribute("position", "position"))
    }

    #[test]
    fn test_draw_records_indexed_call() {
        let (mut renderer, reporter) = renderer();
        let object = quad_object();
        renderer.handle_rendered_object(&object).unwrap();

        renderer.begin_frame().unwrap();
        renderer.set_uniform(&object, "offset", glam::Vec2::new(0.5, 0.0)).unwrap();
        renderer.draw(&object).unwrap();
        renderer.end_frame().unwrap();

        let dummy = dummy(&renderer);
        assert_eq!(dummy.frames_presented(), 1);
        let draws = dummy.draws();
        assert_eq!(draws.len(), 1);
        assert!(draws[0].indexed);
        assert_eq!(draws[0].elements, 0..6);
        assert_eq!(draws[0].instances, 0..1);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_draw_outside_frame_is_reported() {
        let (mut renderer, reporter) = renderer();
        let object = quad_object();
        renderer.handle_rendered_object(&object).unwrap();

        assert!(matches!(renderer.draw(&object), Err(RenderError::NoActiveFrame)));
        assert!(matches!(renderer.end_frame(), Err(RenderError::NoActiveFrame)));
        assert_eq!(reporter.len(), 1);
    }

    #[test]
    fn test_frame_buffer_is_cleared_once_per_frame() {
        let (mut renderer, _) = renderer();
        let fb = Descriptor::new(FrameBuffer::new(32, 32).with_clear_color([1.0, 0.0, 0.0, 1.0]));
        let object = quad_object();
        renderer.handle_frame_buffer(&fb).unwrap();
        renderer.handle_rendered_object(&object).unwrap();

        renderer.begin_frame().unwrap();
        renderer.activate_frame_buffer(Some(&fb)).unwrap();
        renderer.draw(&object).unwrap();
        renderer.activate_frame_buffer(None).unwrap();
        renderer.draw(&object).unwrap();
        renderer.activate_frame_buffer(Some(&fb)).unwrap();
        renderer.end_frame().unwrap();

        let passes = dummy(&renderer).passes();
        assert_eq!(passes.len(), 4);
        assert_eq!(passes[1].color_attachments[0].load_op, LoadOp::Clear([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(passes[2].color_attachments[0].load_op, LoadOp::Load);
        assert_eq!(passes[3].color_attachments[0].load_op, LoadOp::Load);

        // One pipeline per target format
        let native = renderer.rendered_objects().get_internal(&object).unwrap();
        assert_eq!(native.pipeline_count(), 2);
    }

    #[test]
    fn test_replace_backend_keeps_counts() {
        let (mut renderer, reporter) = renderer();
        let object = quad_object();
        renderer.handle_rendered_object(&object).unwrap();
        renderer.handle_rendered_object(&object).unwrap();
        renderer.set_uniform(&object, "color", [1.0, 0.0, 0.0, 1.0]).unwrap();
        let name = renderer.programs().get_internal(&object.program).unwrap().name.clone();

        let old = renderer.replace_backend(Backend::Dummy(DummyBackend::new(64, 64)));
        assert_eq!(old.as_dummy().unwrap().live_total(), 0);

        assert_eq!(renderer.rendered_objects().count(&object), 2);
        assert_eq!(renderer.programs().count(&object.program), 2);
        assert_eq!(renderer.graphics_objects().count(&object.graphics_object), 2);
        assert_eq!(renderer.programs().get_internal(&object.program).unwrap().name, name);
        assert!(dummy(&renderer).live_count(ObjectKind::RenderPipeline) == 0);
        assert!(dummy(&renderer).live_count(ObjectKind::Buffer) > 0);

        // Uniforms written before the swap reach the new buffers
        renderer.begin_frame().unwrap();
        renderer.draw(&object).unwrap();
        renderer.end_frame().unwrap();
        let native = renderer.rendered_objects().get_internal(&object).unwrap();
        let contents = dummy(&renderer).buffer_contents(native.uniforms[0].buffer).unwrap();
        assert_eq!(&contents[..16], bytemuck::bytes_of(&[1.0f32, 0.0, 0.0, 1.0]));
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_release_all_destroys_everything() {
        let (mut renderer, _) = renderer();
        let object = quad_object();
        renderer.handle_rendered_object(&object).unwrap();
        renderer.begin_frame().unwrap();
        renderer.draw(&object).unwrap();
        renderer.end_frame().unwrap();

        assert_eq!(renderer.release_all(), 6);
        assert!(renderer.rendered_objects().is_empty());
        assert!(renderer.data_buffers().is_empty());
        // Nothing is kept around for a restore that will not come
        assert_eq!(renderer.rendered_objects().retired_len(), 0);
        assert_eq!(renderer.programs().retired_len(), 0);
        // Only the swapchain view remains
        assert_eq!(dummy(&renderer).live_total(), 1);
    }
}
