use super::{BackendContext, Handler};
use crate::backend::shader::{ParsedShader, ShaderReflection, UniformMember};
use crate::backend::{
    Backend, BindGroupLayoutEntry, BindGroupLayoutHandle, GraphicsBackend, ShaderModuleDescriptor, ShaderModuleHandle,
};
use crate::error::RenderResult;
use crate::resources::{Descriptor, DescriptorId, Program, Resource};
use std::collections::HashMap;

/// Names programs that carry no label
pub trait NameGenerator: Send {
    fn next_name(&mut self, program: &Program) -> String;
}

/// Generates `<prefix>-1`, `<prefix>-2`, ...
#[derive(Debug, Clone)]
pub struct SequentialNames {
    prefix: String,
    next: u64,
}

impl SequentialNames {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl Default for SequentialNames {
    fn default() -> Self {
        Self::new("program")
    }
}

impl NameGenerator for SequentialNames {
    fn next_name(&mut self, _program: &Program) -> String {
        let name = format!("{}-{}", self.prefix, self.next);
        self.next += 1;
        name
    }
}

/// Compiled program with its reflected interface
#[derive(Debug, Clone)]
pub struct NativeProgram {
    pub name: String,
    pub shader: ShaderModuleHandle,
    pub bind_group_layout: BindGroupLayoutHandle,
    pub layout_entries: Vec<BindGroupLayoutEntry>,
    pub reflection: ShaderReflection,
    pub vertex_entry: String,
    pub fragment_entry: Option<String>,
}

fn destroy(backend: &mut Backend, native: NativeProgram) {
    backend.destroy_bind_group_layout(native.bind_group_layout);
    backend.destroy_shader_module(native.shader);
}

pub struct ProgramHandler {
    programs: Handler<Program, NativeProgram>,
    names: Box<dyn NameGenerator>,
    /// Names of programs torn down by `release_all`, reused by `handle_all`
    retired_names: HashMap<DescriptorId, String>,
}

impl Default for ProgramHandler {
    fn default() -> Self {
        Self::new(Box::new(SequentialNames::default()))
    }
}

impl ProgramHandler {
    pub fn new(names: Box<dyn NameGenerator>) -> Self {
        Self {
            programs: Handler::new(),
            names,
            retired_names: HashMap::new(),
        }
    }

    fn name_of(names: &mut dyn NameGenerator, descriptor: &Descriptor<Program>) -> String {
        match descriptor.label() {
            Some(label) => label.to_string(),
            None => names.next_name(descriptor),
        }
    }

    fn create(ctx: &mut BackendContext<'_>, name: String, descriptor: &Descriptor<Program>) -> RenderResult<NativeProgram> {
        let parsed = ParsedShader::parse(&descriptor.source)?;
        let reflection = parsed.reflect(&descriptor.vertex_entry, descriptor.fragment_entry.as_deref())?;
        let layout_entries = reflection.layout_entries();

        let backend = &mut *ctx.backend;
        let shader = backend.create_shader_module(&ShaderModuleDescriptor {
            label: Some(name.clone()),
            source: descriptor.source.clone(),
        })?;
        let bind_group_layout = match backend.create_bind_group_layout(&layout_entries) {
            Ok(layout) => layout,
            Err(e) => {
                backend.destroy_shader_module(shader);
                return Err(e.into());
            }
        };

        log::debug!(
            "Program `{name}`: {} inputs, {} uniform blocks, {} textures",
            reflection.inputs.len(),
            reflection.uniform_blocks.len(),
            reflection.textures.len()
        );

        Ok(NativeProgram {
            name,
            shader,
            bind_group_layout,
            layout_entries,
            reflection,
            vertex_entry: descriptor.vertex_entry.clone(),
            fragment_entry: descriptor.fragment_entry.clone(),
        })
    }

    pub fn handle(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<Program>) -> RenderResult<&NativeProgram> {
        let names = &mut *self.names;
        self.programs
            .handle(descriptor, |d| Self::create(ctx, Self::name_of(names, d), d))
            .map(|native| &*native)
    }

    pub fn release(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<Program>) -> RenderResult<usize> {
        let backend = &mut *ctx.backend;
        self.programs
            .release(descriptor, |native| destroy(backend, native))
            .map_err(|e| ctx.report(e.into()))
    }

    pub fn get_internal(&self, descriptor: &Descriptor<Program>) -> Option<&NativeProgram> {
        self.programs.get_internal(descriptor)
    }

    /// Location of the vertex input called `name`
    pub fn input_location(&self, descriptor: &Descriptor<Program>, name: &str) -> Option<u32> {
        self.get_internal(descriptor)?
            .reflection
            .input(name)
            .map(|input| input.location)
    }

    /// Uniform block index and member layout of the uniform called `name`
    pub fn uniform(&self, descriptor: &Descriptor<Program>, name: &str) -> Option<(usize, &UniformMember)> {
        self.get_internal(descriptor)?.reflection.uniform(name)
    }

    pub fn count(&self, descriptor: &Descriptor<Program>) -> usize {
        self.programs.count(descriptor)
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<Program>, usize)> {
        let retired = &mut self.retired_names;
        self.programs.release_all(|d, native| {
            retired.insert(d.id(), native.name.clone());
            destroy(ctx.backend, native)
        })
    }

    /// Recreate released programs under their previous names
    pub fn handle_all(&mut self, ctx: &mut BackendContext<'_>, descriptors: Vec<(Descriptor<Program>, usize)>) {
        let retired = &mut self.retired_names;
        let names = &mut *self.names;
        let failures = self.programs.handle_all(descriptors, |d| {
            let name = retired
                .remove(&d.id())
                .unwrap_or_else(|| Self::name_of(names, d));
            Self::create(ctx, name, d)
        });
        self.retired_names.clear();
        for (_, _, error) in failures {
            ctx.report(error);
        }
    }

    /// Drop the names kept by `release_all` when nothing will be restored
    pub fn forget_retired(&mut self) {
        self.retired_names.clear();
    }

    pub fn retired_len(&self) -> usize {
        self.retired_names.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::backend::shader::ShaderError;
    use crate::error::{CollectingReporter, RenderError};

    const SHADER: &str = r#"
struct Globals {
    color: vec4<f32>,
}
@group(0) @binding(0) var<uniform> globals: Globals;

@vertex
fn vs_main(@location(0) position: vec3<f32>, @location(1) uv: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(position + vec3<f32>(uv, 0.0), 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return globals.color;
}
"#;

    #[test]
    fn test_reflection_queries() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let mut programs = ProgramHandler::default();
        let program = Descriptor::new(Program::new(SHADER));

        let native = programs.handle(&mut ctx, &program).unwrap();
        assert_eq!(native.name, "program-1");
        assert_eq!(native.layout_entries.len(), 1);

        assert_eq!(programs.input_location(&program, "position"), Some(0));
        assert_eq!(programs.input_location(&program, "uv"), Some(1));
        assert_eq!(programs.input_location(&program, "normal"), None);
        let (block, member) = programs.uniform(&program, "color").unwrap();
        assert_eq!((block, member.offset, member.size), (0, 0, 16));
    }

    #[test]
    fn test_names() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let mut programs = ProgramHandler::new(Box::new(SequentialNames::new("shader")));

        let a = Descriptor::new(Program::new(SHADER));
        let b = Descriptor::new(Program::new(SHADER).with_label("sky"));
        let c = Descriptor::new(Program::new(SHADER));
        assert_eq!(programs.handle(&mut ctx, &a).unwrap().name, "shader-1");
        assert_eq!(programs.handle(&mut ctx, &b).unwrap().name, "sky");
        assert_eq!(programs.handle(&mut ctx, &c).unwrap().name, "shader-2");
        // Handling again keeps the name
        assert_eq!(programs.handle(&mut ctx, &a).unwrap().name, "shader-1");

        let released = programs.release_all(&mut ctx);
        programs.handle_all(&mut ctx, released);
        assert_eq!(programs.get_internal(&c).unwrap().name, "shader-2");
        assert_eq!(programs.count(&a), 2);
    }

    #[test]
    fn test_bad_source_stays_unhandled() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let mut programs = ProgramHandler::default();

        let broken = Descriptor::new(Program::new("fn vs_main( {"));
        assert!(matches!(
            programs.handle(&mut ctx, &broken),
            Err(RenderError::Shader(ShaderError::Parse(_)))
        ));
        let no_entry = Descriptor::new(Program::new(SHADER).with_entry_points("main", None));
        assert!(matches!(
            programs.handle(&mut ctx, &no_entry),
            Err(RenderError::Shader(ShaderError::MissingEntryPoint(_)))
        ));
        assert!(programs.is_empty());
        assert_eq!(ctx.backend.as_dummy().unwrap().live_count(ObjectKind::ShaderModule), 0);
    }
}
