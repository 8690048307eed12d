use super::{
    BackendContext, DataBufferHandler, FrameBufferHandler, GraphicsObjectHandler, Handler, IndexBinding,
    NativeGraphicsObject, NativeProgram, ProgramHandler, TextureHandler, DEPTH_FORMAT,
};
use crate::backend::shader::SamplerSlot;
use crate::backend::{
    Backend, BindGroupEntry, BindGroupHandle, BlendState, BufferDescriptor, BufferHandle, BufferUsage, ColorTargetState,
    ColorWrites, CompareFunction, DepthStencilState, GraphicsBackend, PrimitiveTopology,
    RenderPipelineDescriptor, RenderPipelineHandle, SamplerDescriptor, SamplerHandle, TextureDescriptor, TextureFormat,
    TextureHandle, TextureUsage, TextureViewHandle, VertexAttribute, VertexBufferLayout, VertexFormat, VertexStepMode,
};
use crate::error::{RenderError, RenderResult};
use crate::resources::{BlendMode, Descriptor, DescriptorId, RenderedObject};
use std::collections::HashMap;

/// Color format and depth presence of the pass a draw lands in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderTarget {
    pub format: TextureFormat,
    pub depth: bool,
}

/// One vertex buffer slot feeding a single program input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VertexSlot {
    pub location: u32,
    pub buffer: BufferHandle,
    pub layout: VertexBufferLayout,
    /// Reads the zero fallback buffer
    pub fallback: bool,
}

/// GPU buffer of one uniform block plus the CPU copy it is written from
#[derive(Debug, Clone)]
pub struct UniformBuffer {
    pub binding: u32,
    pub buffer: BufferHandle,
    pub shadow: Vec<u8>,
    pub dirty: bool,
}

#[derive(Debug)]
pub struct NativeRenderedObject {
    /// Copy of the program's handles and reflection
    pub program: NativeProgram,
    pub topology: PrimitiveTopology,
    pub vertex_slots: Vec<VertexSlot>,
    pub index: Option<IndexBinding>,
    pub element_count: u32,
    pub instances: u32,
    pub uniforms: Vec<UniformBuffer>,
    pub bind_group: Option<BindGroupHandle>,
    pipelines: HashMap<RenderTarget, RenderPipelineHandle>,
    fallback_vertex: Option<BufferHandle>,
    fallback_texture: Option<(TextureHandle, TextureViewHandle)>,
    samplers: Vec<SamplerHandle>,
}

impl NativeRenderedObject {
    fn new(program: &NativeProgram, geometry: &NativeGraphicsObject, instances: u32) -> Self {
        Self {
            program: program.clone(),
            topology: geometry.topology,
            vertex_slots: Vec::new(),
            index: geometry.index,
            element_count: geometry.element_count(),
            instances,
            uniforms: Vec::new(),
            bind_group: None,
            pipelines: HashMap::new(),
            fallback_vertex: None,
            fallback_texture: None,
            samplers: Vec::new(),
        }
    }

    pub fn pipeline(&self, target: RenderTarget) -> Option<RenderPipelineHandle> {
        self.pipelines.get(&target).copied()
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.len()
    }
}

/// Everything a draw call needs, resolved
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrawCommand {
    pub pipeline: RenderPipelineHandle,
    pub bind_group: Option<BindGroupHandle>,
    pub vertex_buffers: Vec<BufferHandle>,
    pub index: Option<IndexBinding>,
    pub elements: u32,
    pub instances: u32,
}

/// The handlers a rendered object depends on
pub struct RenderedObjectDeps<'h> {
    pub programs: &'h mut ProgramHandler,
    pub graphics_objects: &'h mut GraphicsObjectHandler,
    pub data_buffers: &'h mut DataBufferHandler,
    pub textures: &'h mut TextureHandler,
    pub frame_buffers: &'h mut FrameBufferHandler,
}

/// Largest vertex format, so one zero buffer serves every fallback slot
const FALLBACK_VERTEX_SIZE: u64 = 16;
const WHITE: [u8; 4] = [255, 255, 255, 255];

fn destroy(backend: &mut Backend, native: NativeRenderedObject) {
    for (_, pipeline) in native.pipelines {
        backend.destroy_render_pipeline(pipeline);
    }
    if let Some(bind_group) = native.bind_group {
        backend.destroy_bind_group(bind_group);
    }
    for uniform in native.uniforms {
        backend.destroy_buffer(uniform.buffer);
    }
    if let Some(buffer) = native.fallback_vertex {
        backend.destroy_buffer(buffer);
    }
    if let Some((texture, view)) = native.fallback_texture {
        backend.destroy_texture_view(view);
        backend.destroy_texture(texture);
    }
    for sampler in native.samplers {
        backend.destroy_sampler(sampler);
    }
}

fn blend_state(mode: BlendMode) -> Option<BlendState> {
    match mode {
        BlendMode::Opaque => None,
        BlendMode::Alpha => Some(BlendState::alpha_blending()),
        BlendMode::Additive => Some(BlendState::additive()),
    }
}

fn compatible(attribute: VertexFormat, input: VertexFormat) -> bool {
    attribute.kind() == input.kind()
}

/// Uniform buffers are sized in 16-byte steps
fn uniform_size(size: u32) -> usize {
    (size.max(16) as usize).div_ceil(16) * 16
}

#[derive(Default)]
pub struct RenderedObjectHandler {
    objects: Handler<RenderedObject, NativeRenderedObject>,
    /// Uniform contents of objects torn down by `release_all`
    retired_uniforms: HashMap<DescriptorId, Vec<Vec<u8>>>,
}

impl RenderedObjectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(
        ctx: &mut BackendContext<'_>,
        programs: &ProgramHandler,
        graphics_objects: &GraphicsObjectHandler,
        textures: &TextureHandler,
        descriptor: &Descriptor<RenderedObject>,
    ) -> RenderResult<NativeRenderedObject> {
        let name = descriptor.name();
        let program = programs
            .get_internal(&descriptor.program)
            .ok_or_else(|| RenderError::missing(&name, format!("handled {}", descriptor.program.name())))?;
        let geometry = graphics_objects
            .get_internal(&descriptor.graphics_object)
            .ok_or_else(|| RenderError::missing(&name, format!("handled {}", descriptor.graphics_object.name())))?;

        let mut native = NativeRenderedObject::new(program, geometry, descriptor.instances);
        let populated = Self::bind_vertices(ctx, &mut native, geometry, descriptor)
            .and_then(|_| Self::bind_resources(ctx, &mut native, textures, descriptor));
        match populated {
            Ok(()) => Ok(native),
            Err(e) => {
                destroy(ctx.backend, native);
                Err(e)
            }
        }
    }

    /// One slot per program input: mapped attributes first, zero fallback for the rest
    fn bind_vertices(
        ctx: &mut BackendContext<'_>,
        native: &mut NativeRenderedObject,
        geometry: &NativeGraphicsObject,
        descriptor: &Descriptor<RenderedObject>,
    ) -> RenderResult<()> {
        let name = descriptor.name();
        let mut mapped: HashMap<u32, VertexSlot> = HashMap::new();

        for mapping in &descriptor.mappings {
            let Some(attribute) = geometry.attribute(&mapping.attribute) else {
                ctx.report(RenderError::missing(&name, format!("attribute `{}`", mapping.attribute)));
                continue;
            };
            let Some(input) = native.program.reflection.input(&mapping.input) else {
                ctx.report(RenderError::missing(&name, format!("program input `{}`", mapping.input)));
                continue;
            };
            if !compatible(attribute.format, input.format) {
                ctx.report(RenderError::missing(
                    &name,
                    format!(
                        "{:?} input `{}` for {:?} attribute `{}`",
                        input.format.kind(),
                        input.name,
                        attribute.format.kind(),
                        attribute.name
                    ),
                ));
                continue;
            }
            if mapped.contains_key(&input.location) {
                ctx.report(RenderError::missing(
                    &name,
                    format!("free program input `{}` for attribute `{}`", input.name, attribute.name),
                ));
                continue;
            }
            mapped.insert(
                input.location,
                VertexSlot {
                    location: input.location,
                    buffer: attribute.buffer,
                    layout: VertexBufferLayout {
                        array_stride: attribute.stride,
                        step_mode: VertexStepMode::Vertex,
                        attributes: vec![VertexAttribute {
                            location: input.location,
                            format: attribute.format,
                            offset: 0,
                        }],
                    },
                    fallback: false,
                },
            );
        }

        for input in native.program.reflection.inputs.clone() {
            if let Some(slot) = mapped.remove(&input.location) {
                native.vertex_slots.push(slot);
                continue;
            }

            log::debug!("{name}: input `{}` reads zeros", input.name);
            let buffer = match native.fallback_vertex {
                Some(buffer) => buffer,
                None => {
                    let buffer = ctx.backend.create_buffer_init(
                        &BufferDescriptor {
                            label: Some(format!("{name} zero attributes")),
                            size: FALLBACK_VERTEX_SIZE,
                            usage: BufferUsage::VERTEX,
                        },
                        &[0; FALLBACK_VERTEX_SIZE as usize],
                    )?;
                    native.fallback_vertex = Some(buffer);
                    buffer
                }
            };
            native.vertex_slots.push(VertexSlot {
                location: input.location,
                buffer,
                layout: VertexBufferLayout {
                    array_stride: 0,
                    step_mode: VertexStepMode::Vertex,
                    attributes: vec![VertexAttribute {
                        location: input.location,
                        format: input.format,
                        offset: 0,
                    }],
                },
                fallback: true,
            });
        }
        Ok(())
    }

    fn fallback_texture(
        ctx: &mut BackendContext<'_>,
        native: &mut NativeRenderedObject,
        name: &str,
    ) -> RenderResult<TextureViewHandle> {
        if let Some((_, view)) = native.fallback_texture {
            return Ok(view);
        }
        let backend = &mut *ctx.backend;
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(format!("{name} white")),
            format: TextureFormat::Rgba8UnormSrgb,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(texture, &WHITE, 1, 1);
        let view = match backend.create_texture_view(texture) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy_texture(texture);
                return Err(e.into());
            }
        };
        native.fallback_texture = Some((texture, view));
        Ok(view)
    }

    fn owned_sampler(
        ctx: &mut BackendContext<'_>,
        native: &mut NativeRenderedObject,
        name: &str,
        compare: Option<CompareFunction>,
    ) -> RenderResult<SamplerHandle> {
        let sampler = ctx.backend.create_sampler(&SamplerDescriptor {
            label: Some(name.to_string()),
            compare,
            ..Default::default()
        })?;
        native.samplers.push(sampler);
        Ok(sampler)
    }

    /// Sampler for `slot`: a comparison sampler if asked for, then the
    /// sampler of texture `X` for `X_sampler`, then the first texture's.
    fn pick_sampler(
        ctx: &mut BackendContext<'_>,
        native: &mut NativeRenderedObject,
        slot: &SamplerSlot,
        texture_samplers: &[(String, SamplerHandle)],
        name: &str,
    ) -> RenderResult<SamplerHandle> {
        if slot.comparison {
            return Self::owned_sampler(ctx, native, &format!("{name} {}", slot.name), Some(CompareFunction::LessEqual));
        }
        let by_name = slot
            .name
            .strip_suffix("_sampler")
            .and_then(|texture| texture_samplers.iter().find(|(n, _)| n == texture));
        match by_name.or(texture_samplers.first()) {
            Some((_, sampler)) => Ok(*sampler),
            None => Self::owned_sampler(ctx, native, &format!("{name} {}", slot.name), None),
        }
    }

    /// Uniform buffers, textures and samplers in one bind group
    fn bind_resources(
        ctx: &mut BackendContext<'_>,
        native: &mut NativeRenderedObject,
        textures: &TextureHandler,
        descriptor: &Descriptor<RenderedObject>,
    ) -> RenderResult<()> {
        let name = descriptor.name();
        let mut entries = Vec::new();

        for block in native.program.reflection.uniform_blocks.clone() {
            let size = uniform_size(block.size);
            let shadow = vec![0u8; size];
            let buffer = ctx.backend.create_buffer_init(
                &BufferDescriptor {
                    label: Some(format!("{name} {}", block.name)),
                    size: size as u64,
                    usage: BufferUsage::UNIFORM | BufferUsage::COPY_DST,
                },
                &shadow,
            )?;
            native.uniforms.push(UniformBuffer {
                binding: block.binding,
                buffer,
                shadow,
                dirty: false,
            });
            entries.push((
                block.binding,
                BindGroupEntry::Buffer {
                    buffer,
                    offset: 0,
                    size: None,
                },
            ));
        }

        let mut texture_samplers = Vec::new();
        for slot in native.program.reflection.textures.clone() {
            let resolved = descriptor
                .texture(&slot.name)
                .and_then(|texture| textures.get_internal(texture));
            let view = match resolved {
                Some(texture) => {
                    texture_samplers.push((slot.name.clone(), texture.sampler));
                    texture.view
                }
                None => {
                    ctx.report(RenderError::missing(&name, format!("texture `{}`", slot.name)));
                    Self::fallback_texture(ctx, native, &name)?
                }
            };
            entries.push((slot.binding, BindGroupEntry::Texture(view)));
        }

        for binding in &descriptor.textures {
            if native.program.reflection.textures.iter().all(|t| t.name != binding.name) {
                log::debug!("{name}: program has no texture `{}`", binding.name);
            }
        }

        for slot in native.program.reflection.samplers.clone() {
            let sampler = Self::pick_sampler(ctx, native, &slot, &texture_samplers, &name)?;
            entries.push((slot.binding, BindGroupEntry::Sampler(sampler)));
        }

        if !entries.is_empty() {
            entries.sort_by_key(|(binding, _)| *binding);
            native.bind_group = Some(
                ctx.backend
                    .create_bind_group(native.program.bind_group_layout, &entries)?,
            );
        }
        Ok(())
    }

    fn create_pipeline(
        backend: &mut Backend,
        native: &NativeRenderedObject,
        descriptor: &RenderedObject,
        target: RenderTarget,
    ) -> RenderResult<RenderPipelineHandle> {
        let program = &native.program;
        let depth_stencil = target.depth.then(|| DepthStencilState {
            format: DEPTH_FORMAT,
            depth_write_enabled: descriptor.depth_test,
            depth_compare: if descriptor.depth_test {
                CompareFunction::Less
            } else {
                CompareFunction::Always
            },
        });

        let pipeline = backend.create_render_pipeline(&RenderPipelineDescriptor {
            label: Some(format!("{} {:?}", program.name, target.format)),
            shader: program.shader,
            vertex_entry: program.vertex_entry.clone(),
            fragment_entry: program.fragment_entry.clone(),
            vertex_layouts: native.vertex_slots.iter().map(|s| s.layout.clone()).collect(),
            bind_group_layouts: if native.bind_group.is_some() {
                vec![program.bind_group_layout]
            } else {
                Vec::new()
            },
            primitive_topology: native.topology,
            strip_index_format: native
                .index
                .filter(|_| native.topology.is_strip())
                .map(|index| index.format),
            front_face: descriptor.front_face,
            cull_mode: descriptor.cull_mode,
            depth_stencil,
            color_targets: vec![ColorTargetState {
                format: target.format,
                blend: blend_state(descriptor.blend),
                write_mask: ColorWrites::ALL,
            }],
        })?;
        Ok(pipeline)
    }

    /// Handle the program, the graphics object and every texture, then the
    /// object itself.
    pub fn handle(
        &mut self,
        ctx: &mut BackendContext<'_>,
        deps: &mut RenderedObjectDeps<'_>,
        descriptor: &Descriptor<RenderedObject>,
    ) -> RenderResult<&NativeRenderedObject> {
        deps.programs.handle(ctx, &descriptor.program)?;
        if let Err(e) = deps
            .graphics_objects
            .handle(ctx, deps.data_buffers, &descriptor.graphics_object)
        {
            deps.programs.release(ctx, &descriptor.program).ok();
            return Err(e);
        }
        for (acquired, binding) in descriptor.textures.iter().enumerate() {
            if let Err(e) = deps.textures.handle(ctx, deps.frame_buffers, &binding.texture) {
                for held in descriptor.textures[..acquired].iter().rev() {
                    deps.textures.release(ctx, deps.frame_buffers, &held.texture).ok();
                }
                deps.graphics_objects
                    .release(ctx, deps.data_buffers, &descriptor.graphics_object)
                    .ok();
                deps.programs.release(ctx, &descriptor.program).ok();
                return Err(e);
            }
        }

        let (programs, graphics_objects, textures) = (&*deps.programs, &*deps.graphics_objects, &*deps.textures);
        let created = self
            .objects
            .handle(descriptor, |d| Self::create(ctx, programs, graphics_objects, textures, d));
        match created {
            Ok(native) => Ok(&*native),
            Err(e) => {
                Self::release_dependencies(ctx, deps, descriptor).ok();
                Err(e)
            }
        }
    }

    fn release_dependencies(
        ctx: &mut BackendContext<'_>,
        deps: &mut RenderedObjectDeps<'_>,
        descriptor: &RenderedObject,
    ) -> RenderResult<()> {
        let mut result = Ok(());
        for binding in descriptor.textures.iter().rev() {
            if let Err(e) = deps.textures.release(ctx, deps.frame_buffers, &binding.texture) {
                result = Err(e);
            }
        }
        if let Err(e) = deps
            .graphics_objects
            .release(ctx, deps.data_buffers, &descriptor.graphics_object)
        {
            result = Err(e);
        }
        if let Err(e) = deps.programs.release(ctx, &descriptor.program) {
            result = Err(e);
        }
        result
    }

    /// Release the object, then its dependencies in reverse order
    pub fn release(
        &mut self,
        ctx: &mut BackendContext<'_>,
        deps: &mut RenderedObjectDeps<'_>,
        descriptor: &Descriptor<RenderedObject>,
    ) -> RenderResult<usize> {
        let backend = &mut *ctx.backend;
        let remaining = self
            .objects
            .release(descriptor, |native| destroy(backend, native))
            .map_err(|e| ctx.report(e.into()))?;
        Self::release_dependencies(ctx, deps, descriptor)?;
        Ok(remaining)
    }

    /// Copy `bytes` into the CPU copy of uniform `name`. The GPU buffer is
    /// written before the next draw of the object.
    pub fn set_uniform(
        &mut self,
        ctx: &mut BackendContext<'_>,
        descriptor: &Descriptor<RenderedObject>,
        name: &str,
        bytes: &[u8],
    ) -> RenderResult<()> {
        let Some(native) = self.objects.get_internal_mut(descriptor) else {
            return Err(ctx.report(RenderError::missing(
                format!("uniform `{name}`"),
                format!("handled {}", descriptor.name()),
            )));
        };
        let Some((block, member)) = native.program.reflection.uniform(name) else {
            return Err(ctx.report(RenderError::missing(descriptor.name(), format!("uniform `{name}`"))));
        };
        if member.size as usize != bytes.len() {
            return Err(ctx.report(RenderError::UniformSizeMismatch {
                name: name.to_string(),
                expected: member.size as usize,
                actual: bytes.len(),
            }));
        }

        let offset = member.offset as usize;
        let uniform = &mut native.uniforms[block];
        uniform.shadow[offset..offset + bytes.len()].copy_from_slice(bytes);
        uniform.dirty = true;
        Ok(())
    }

    /// Resolve a draw of `descriptor` into `target`: creates the pipeline on
    /// first use and flushes modified uniforms.
    pub fn prepare(
        &mut self,
        ctx: &mut BackendContext<'_>,
        descriptor: &Descriptor<RenderedObject>,
        target: RenderTarget,
    ) -> RenderResult<DrawCommand> {
        let Some(native) = self.objects.get_internal_mut(descriptor) else {
            return Err(ctx.report(RenderError::missing(
                format!("draw of {}", descriptor.name()),
                "handled rendered object",
            )));
        };

        let pipeline = match native.pipelines.get(&target) {
            Some(pipeline) => *pipeline,
            None => {
                let pipeline = Self::create_pipeline(ctx.backend, native, descriptor, target)?;
                log::debug!("{}: pipeline for {:?}", descriptor.name(), target);
                native.pipelines.insert(target, pipeline);
                pipeline
            }
        };

        for uniform in native.uniforms.iter_mut().filter(|u| u.dirty) {
            ctx.backend.write_buffer(uniform.buffer, 0, &uniform.shadow);
            uniform.dirty = false;
        }

        Ok(DrawCommand {
            pipeline,
            bind_group: native.bind_group,
            vertex_buffers: native.vertex_slots.iter().map(|s| s.buffer).collect(),
            index: native.index,
            elements: native.element_count,
            instances: native.instances,
        })
    }

    pub fn get_internal(&self, descriptor: &Descriptor<RenderedObject>) -> Option<&NativeRenderedObject> {
        self.objects.get_internal(descriptor)
    }

    pub fn count(&self, descriptor: &Descriptor<RenderedObject>) -> usize {
        self.objects.count(descriptor)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Destroys native objects only; dependency counts are left as they are.
    /// Uniform contents are kept for `handle_all`.
    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<RenderedObject>, usize)> {
        let retired = &mut self.retired_uniforms;
        self.objects.release_all(|d, native| {
            retired.insert(d.id(), native.uniforms.iter().map(|u| u.shadow.clone()).collect());
            destroy(ctx.backend, native);
        })
    }

    /// Recreate released objects; their dependencies must be restored first.
    ///
    /// An object that cannot be recreated releases its dependencies once per
    /// reference it held, in the same order as [`RenderedObjectHandler::release`].
    pub fn handle_all(
        &mut self,
        ctx: &mut BackendContext<'_>,
        deps: &mut RenderedObjectDeps<'_>,
        descriptors: Vec<(Descriptor<RenderedObject>, usize)>,
    ) {
        let retired = &mut self.retired_uniforms;
        let (programs, graphics_objects, textures) = (&*deps.programs, &*deps.graphics_objects, &*deps.textures);
        let failures = self.objects.handle_all(descriptors, |d| {
            let mut native = Self::create(ctx, programs, graphics_objects, textures, d)?;
            if let Some(shadows) = retired.remove(&d.id()) {
                for (uniform, shadow) in native.uniforms.iter_mut().zip(shadows) {
                    if uniform.shadow.len() == shadow.len() {
                        uniform.shadow = shadow;
                        uniform.dirty = true;
                    }
                }
            }
            Ok::<_, RenderError>(native)
        });
        self.retired_uniforms.clear();
        for (descriptor, count, error) in failures {
            ctx.report(error);
            for _ in 0..count {
                Self::release_live_dependencies(ctx, deps, &descriptor);
            }
        }
    }

    /// Like `release_dependencies`, skipping whatever is no longer handled
    fn release_live_dependencies(
        ctx: &mut BackendContext<'_>,
        deps: &mut RenderedObjectDeps<'_>,
        descriptor: &RenderedObject,
    ) {
        for binding in descriptor.textures.iter().rev() {
            if deps.textures.count(&binding.texture) > 0 {
                deps.textures.release(ctx, deps.frame_buffers, &binding.texture).ok();
            }
        }
        if deps.graphics_objects.count(&descriptor.graphics_object) > 0 {
            deps.graphics_objects
                .release(ctx, deps.data_buffers, &descriptor.graphics_object)
                .ok();
        }
        if deps.programs.count(&descriptor.program) > 0 {
            deps.programs.release(ctx, &descriptor.program).ok();
        }
    }

    /// Drop the uniform contents kept by `release_all` when nothing will be restored
    pub fn forget_retired(&mut self) {
        self.retired_uniforms.clear();
    }

    pub fn retired_len(&self) -> usize {
        self.retired_uniforms.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::error::CollectingReporter;
    use crate::resources::{DataBuffer, GraphicsObject, Program, Texture};
    use glam::{Vec2, Vec3};

    const SHADER: &str = r#"
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

    struct Fixture {
        backend: Backend,
        reporter: CollectingReporter,
        programs: ProgramHandler,
        graphics_objects: GraphicsObjectHandler,
        data_buffers: DataBufferHandler,
        textures: TextureHandler,
        frame_buffers: FrameBufferHandler,
        objects: RenderedObjectHandler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: Backend::Dummy(DummyBackend::new(8, 8)),
                reporter: CollectingReporter::new(),
                programs: ProgramHandler::default(),
                graphics_objects: GraphicsObjectHandler::new(),
                data_buffers: DataBufferHandler::new(),
                textures: TextureHandler::new(),
                frame_buffers: FrameBufferHandler::new(),
                objects: RenderedObjectHandler::new(),
            }
        }

        fn with<R>(&mut self, f: impl FnOnce(&mut RenderedObjectHandler, &mut BackendContext<'_>, &mut RenderedObjectDeps<'_>) -> R) -> R {
            let mut ctx = BackendContext::new(&mut self.backend, &self.reporter);
            let mut deps = RenderedObjectDeps {
                programs: &mut self.programs,
                graphics_objects: &mut self.graphics_objects,
                data_buffers: &mut self.data_buffers,
                textures: &mut self.textures,
                frame_buffers: &mut self.frame_buffers,
            };
            f(&mut self.objects, &mut ctx, &mut deps)
        }

        fn dummy(&self) -> &DummyBackend {
            self.backend.as_dummy().unwrap()
        }
    }

    fn quad() -> Descriptor<GraphicsObject> {
        let positions = Descriptor::new(DataBuffer::from_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y]));
        let uvs = Descriptor::new(DataBuffer::from_vec2(&[Vec2::ZERO, Vec2::X, Vec2::Y]));
        Descriptor::new(
            GraphicsObject::triangles()
                .with_attribute("position", &positions)
                .with_attribute("uv", &uvs),
        )
    }

    const TARGET: RenderTarget = RenderTarget {
        format: TextureFormat::Bgra8UnormSrgb,
        depth: true,
    };

    #[test]
    fn test_mappings_and_bindings() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let texture = Descriptor::new(Texture::white());
        let object = Descriptor::new(
            RenderedObject::new(&program, &quad())
                .map_attribute("position", "position")
                .map_attribute("uv", "uv")
                .with_texture("albedo", &texture),
        );

        f.with(|objects, ctx, deps| {
            let native = objects.handle(ctx, deps, &object).unwrap();
            assert_eq!(native.vertex_slots.len(), 2);
            assert!(native.vertex_slots.iter().all(|s| !s.fallback));
            assert_eq!(native.vertex_slots[0].layout.array_stride, 12);
            assert_eq!(native.element_count, 3);
            assert_eq!(native.uniforms.len(), 1);
            assert_eq!(native.uniforms[0].shadow.len(), 32);
            assert!(native.bind_group.is_some());

            // The texture's own sampler serves `albedo_sampler`
            assert!(native.samplers.is_empty());
            assert!(native.fallback_texture.is_none());
            assert_eq!(deps.textures.count(&texture), 1);
        });
        assert!(f.reporter.is_empty());
    }

    #[test]
    fn test_unresolved_mappings_are_reported_and_skipped() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let object = Descriptor::new(
            RenderedObject::new(&program, &quad())
                .map_attribute("position", "position")
                .map_attribute("normal", "normal")
                .map_attribute("uv", "tangent"),
        );

        f.with(|objects, ctx, deps| {
            let native = objects.handle(ctx, deps, &object).unwrap();
            // `uv` input falls back to zeros, the texture to white
            assert_eq!(native.vertex_slots.len(), 2);
            assert!(native.vertex_slots[1].fallback);
            assert_eq!(native.vertex_slots[1].layout.array_stride, 0);
            assert!(native.fallback_texture.is_some());
        });
        // attribute `normal`, input `tangent`, texture `albedo`
        assert_eq!(f.reporter.len(), 3);
    }

    #[test]
    fn test_release_propagates_in_mirror_order() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let geometry = quad();
        let texture = Descriptor::new(Texture::white());
        let a = Descriptor::new(
            RenderedObject::new(&program, &geometry)
                .map_attributes_by_name()
                .with_texture("albedo", &texture),
        );
        let b = Descriptor::new(RenderedObject::new(&program, &geometry).with_texture("albedo", &texture));

        f.with(|objects, ctx, deps| {
            objects.handle(ctx, deps, &a).unwrap();
            objects.handle(ctx, deps, &b).unwrap();
            assert_eq!(deps.programs.count(&program), 2);
            assert_eq!(deps.graphics_objects.count(&geometry), 2);

            objects.release(ctx, deps, &a).unwrap();
            assert_eq!(deps.programs.count(&program), 1);
            assert_eq!(deps.textures.count(&texture), 1);
            assert!(deps.graphics_objects.get_internal(&geometry).is_some());

            objects.release(ctx, deps, &b).unwrap();
            assert!(deps.programs.is_empty());
            assert!(deps.graphics_objects.is_empty());
            assert!(deps.data_buffers.is_empty());
            assert!(deps.textures.is_empty());
        });
        assert_eq!(f.dummy().live_total(), 0);
    }

    #[test]
    fn test_set_uniform_and_prepare() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let object = Descriptor::new(RenderedObject::new(&program, &quad()).map_attributes_by_name());

        let (command, uniform_buffer) = f.with(|objects, ctx, deps| {
            objects.handle(ctx, deps, &object).unwrap();
            objects
                .set_uniform(ctx, &object, "scale", bytemuck::bytes_of(&2.0f32))
                .unwrap();
            assert!(objects.set_uniform(ctx, &object, "scale", &[0; 8]).is_err());
            assert!(objects.set_uniform(ctx, &object, "missing", &[0; 4]).is_err());
            assert!(objects.get_internal(&object).unwrap().uniforms[0].dirty);

            let command = objects.prepare(ctx, &object, TARGET).unwrap();
            let again = objects.prepare(ctx, &object, TARGET).unwrap();
            assert_eq!(command.pipeline, again.pipeline);
            objects
                .prepare(ctx, &object, RenderTarget { depth: false, ..TARGET })
                .unwrap();

            let native = objects.get_internal(&object).unwrap();
            assert_eq!(native.pipeline_count(), 2);
            assert!(!native.uniforms[0].dirty);
            (command, native.uniforms[0].buffer)
        });

        assert_eq!(command.elements, 3);
        assert_eq!(command.vertex_buffers.len(), 2);
        let contents = f.dummy().buffer_contents(uniform_buffer).unwrap();
        assert_eq!(&contents[16..20], bytemuck::bytes_of(&2.0f32));
        assert_eq!(f.reporter.len(), 3);
        assert_eq!(f.dummy().live_count(ObjectKind::RenderPipeline), 2);
    }

    #[test]
    fn test_uniforms_survive_release_all() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let object = Descriptor::new(RenderedObject::new(&program, &quad()).map_attributes_by_name());

        f.with(|objects, ctx, deps| {
            objects.handle(ctx, deps, &object).unwrap();
            objects
                .set_uniform(ctx, &object, "tint", bytemuck::bytes_of(&[1.0f32, 0.5, 0.25, 1.0]))
                .unwrap();

            let released = objects.release_all(ctx);
            assert!(objects.is_empty());
            objects.handle_all(ctx, deps, released);

            let native = objects.get_internal(&object).unwrap();
            assert!(native.uniforms[0].dirty);
            assert_eq!(
                &native.uniforms[0].shadow[..16],
                bytemuck::bytes_of(&[1.0f32, 0.5, 0.25, 1.0])
            );
            assert_eq!(objects.count(&object), 1);
        });
    }

    #[test]
    fn test_failed_dependency_rolls_back() {
        let mut f = Fixture::new();
        let program = Descriptor::new(Program::new(SHADER));
        let broken = Descriptor::new(Texture::from_rgba8(4, 4, vec![0; 4]));
        let object = Descriptor::new(
            RenderedObject::new(&program, &quad())
                .map_attributes_by_name()
                .with_texture("albedo", &broken),
        );

        f.with(|objects, ctx, deps| {
            assert!(objects.handle(ctx, deps, &object).is_err());
            assert!(deps.programs.is_empty());
            assert!(deps.graphics_objects.is_empty());
            assert!(deps.data_buffers.is_empty());
            assert_eq!(objects.count(&object), 0);
        });
        assert_eq!(f.dummy().live_total(), 0);
    }
}
