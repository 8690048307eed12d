//! Deferred work executed against a [`Renderer`] on the rendering thread

use crate::error::RenderResult;
use crate::renderer::Renderer;
use crate::resources::{DataBuffer, Descriptor, FrameBuffer, GraphicsObject, Program, RenderedObject, Texture};
use crate::uniform::UniformValue;
use std::fmt;
use std::sync::Arc;

/// One unit of rendering-thread work
pub trait Command: Send + Sync {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()>;

    /// Short label used when a failure is logged
    fn describe(&self) -> String;
}

/// Per-frame command source, queried once per frame in registration order
pub trait CommandSupplier: Send + Sync {
    fn commands(&self) -> Vec<Arc<dyn Command>>;
}

impl<F> CommandSupplier for F
where
    F: Fn() -> Vec<Arc<dyn Command>> + Send + Sync,
{
    fn commands(&self) -> Vec<Arc<dyn Command>> {
        self()
    }
}

/// Any descriptor, for the handle and release commands
#[derive(Debug, Clone)]
pub enum ResourceRef {
    DataBuffer(Descriptor<DataBuffer>),
    Texture(Descriptor<Texture>),
    FrameBuffer(Descriptor<FrameBuffer>),
    GraphicsObject(Descriptor<GraphicsObject>),
    Program(Descriptor<Program>),
    RenderedObject(Descriptor<RenderedObject>),
}

impl ResourceRef {
    pub fn name(&self) -> String {
        match self {
            ResourceRef::DataBuffer(d) => d.name(),
            ResourceRef::Texture(d) => d.name(),
            ResourceRef::FrameBuffer(d) => d.name(),
            ResourceRef::GraphicsObject(d) => d.name(),
            ResourceRef::Program(d) => d.name(),
            ResourceRef::RenderedObject(d) => d.name(),
        }
    }

    fn handle(&self, renderer: &mut Renderer) -> RenderResult<()> {
        match self {
            ResourceRef::DataBuffer(d) => renderer.handle_data_buffer(d),
            ResourceRef::Texture(d) => renderer.handle_texture(d),
            ResourceRef::FrameBuffer(d) => renderer.handle_frame_buffer(d),
            ResourceRef::GraphicsObject(d) => renderer.handle_graphics_object(d),
            ResourceRef::Program(d) => renderer.handle_program(d),
            ResourceRef::RenderedObject(d) => renderer.handle_rendered_object(d),
        }
    }

    fn release(&self, renderer: &mut Renderer) -> RenderResult<usize> {
        match self {
            ResourceRef::DataBuffer(d) => renderer.release_data_buffer(d),
            ResourceRef::Texture(d) => renderer.release_texture(d),
            ResourceRef::FrameBuffer(d) => renderer.release_frame_buffer(d),
            ResourceRef::GraphicsObject(d) => renderer.release_graphics_object(d),
            ResourceRef::Program(d) => renderer.release_program(d),
            ResourceRef::RenderedObject(d) => renderer.release_rendered_object(d),
        }
    }
}

macro_rules! impl_resource_ref {
    ($($kind:ident),*) => {
        $(
            impl From<Descriptor<$kind>> for ResourceRef {
                fn from(descriptor: Descriptor<$kind>) -> Self {
                    ResourceRef::$kind(descriptor)
                }
            }

            impl From<&Descriptor<$kind>> for ResourceRef {
                fn from(descriptor: &Descriptor<$kind>) -> Self {
                    ResourceRef::$kind(descriptor.clone())
                }
            }
        )*
    };
}

impl_resource_ref!(DataBuffer, Texture, FrameBuffer, GraphicsObject, Program, RenderedObject);

/// Handle a descriptor and its dependencies
#[derive(Debug, Clone)]
pub struct Handle(pub ResourceRef);

impl Handle {
    pub fn new(resource: impl Into<ResourceRef>) -> Self {
        Self(resource.into())
    }
}

impl Command for Handle {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        self.0.handle(renderer)
    }

    fn describe(&self) -> String {
        format!("handle {}", self.0.name())
    }
}

/// Release a descriptor and its dependencies
#[derive(Debug, Clone)]
pub struct Release(pub ResourceRef);

impl Release {
    pub fn new(resource: impl Into<ResourceRef>) -> Self {
        Self(resource.into())
    }
}

impl Command for Release {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        self.0.release(renderer).map(|_| ())
    }

    fn describe(&self) -> String {
        format!("release {}", self.0.name())
    }
}

#[derive(Debug, Clone)]
pub struct Draw(pub Descriptor<RenderedObject>);

impl Command for Draw {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        renderer.draw(&self.0)
    }

    fn describe(&self) -> String {
        format!("draw {}", self.0.name())
    }
}

#[derive(Debug, Clone)]
pub struct SetUniform {
    pub object: Descriptor<RenderedObject>,
    pub name: String,
    pub value: UniformValue,
}

impl SetUniform {
    pub fn new(object: &Descriptor<RenderedObject>, name: impl Into<String>, value: impl Into<UniformValue>) -> Self {
        Self {
            object: object.clone(),
            name: name.into(),
            value: value.into(),
        }
    }
}

impl Command for SetUniform {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        renderer.set_uniform(&self.object, &self.name, self.value)
    }

    fn describe(&self) -> String {
        format!("set {} `{}` of {}", self.value.type_name(), self.name, self.object.name())
    }
}

/// Send following draws into a frame buffer, or to the surface with `None`
#[derive(Debug, Clone)]
pub struct ActivateFrameBuffer(pub Option<Descriptor<FrameBuffer>>);

impl Command for ActivateFrameBuffer {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        renderer.activate_frame_buffer(self.0.as_ref())
    }

    fn describe(&self) -> String {
        match &self.0 {
            Some(fb) => format!("activate {}", fb.name()),
            None => "activate surface".to_string(),
        }
    }
}

/// Re-upload the contents of a data buffer
#[derive(Debug, Clone)]
pub struct UpdateDataBuffer(pub Descriptor<DataBuffer>);

impl Command for UpdateDataBuffer {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        renderer.update_data_buffer(&self.0)
    }

    fn describe(&self) -> String {
        format!("update {}", self.0.name())
    }
}

/// Re-upload the pixels of an image texture
#[derive(Debug, Clone)]
pub struct UpdateTexture(pub Descriptor<Texture>);

impl Command for UpdateTexture {
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        renderer.update_texture(&self.0)
    }

    fn describe(&self) -> String {
        format!("update {}", self.0.name())
    }
}

/// A closure run as a command
pub struct FnCommand<F> {
    label: String,
    f: F,
}

impl<F> fmt::Debug for FnCommand<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnCommand").field("label", &self.label).finish()
    }
}

impl<F> Command for FnCommand<F>
where
    F: Fn(&mut Renderer) -> RenderResult<()> + Send + Sync,
{
    fn execute(&self, renderer: &mut Renderer) -> RenderResult<()> {
        (self.f)(renderer)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

pub fn from_fn<F>(label: impl Into<String>, f: F) -> FnCommand<F>
where
    F: Fn(&mut Renderer) -> RenderResult<()> + Send + Sync,
{
    FnCommand { label: label.into(), f }
}
