use super::{BackendContext, Handler};
use crate::backend::{
    Backend, GraphicsBackend, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage, TextureViewHandle,
};
use crate::error::{HandlerError, RenderResult};
use crate::resources::{Descriptor, FrameBuffer, Resource};

pub const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

/// Native attachments of a [`FrameBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeFrameBuffer {
    pub color: TextureHandle,
    pub color_view: TextureViewHandle,
    pub depth: Option<(TextureHandle, TextureViewHandle)>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
}

fn destroy(backend: &mut Backend, native: NativeFrameBuffer) {
    backend.destroy_texture_view(native.color_view);
    backend.destroy_texture(native.color);
    if let Some((texture, view)) = native.depth {
        backend.destroy_texture_view(view);
        backend.destroy_texture(texture);
    }
}

/// Texture plus view; the texture is destroyed again if the view fails
fn create_attachment(backend: &mut Backend, desc: &TextureDescriptor) -> RenderResult<(TextureHandle, TextureViewHandle)> {
    let texture = backend.create_texture(desc)?;
    match backend.create_texture_view(texture) {
        Ok(view) => Ok((texture, view)),
        Err(e) => {
            backend.destroy_texture(texture);
            Err(e.into())
        }
    }
}

#[derive(Default)]
pub struct FrameBufferHandler {
    frame_buffers: Handler<FrameBuffer, NativeFrameBuffer>,
}

impl FrameBufferHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(ctx: &mut BackendContext<'_>, descriptor: &Descriptor<FrameBuffer>) -> RenderResult<NativeFrameBuffer> {
        if descriptor.width == 0 || descriptor.height == 0 || descriptor.format.is_depth() {
            return Err(HandlerError::InvalidDescriptor {
                kind: FrameBuffer::KIND,
                label: descriptor.name(),
                reason: format!(
                    "{}x{} {:?} is not a usable color target",
                    descriptor.width, descriptor.height, descriptor.format
                ),
            }
            .into());
        }

        let name = descriptor.name();
        let (color, color_view) = create_attachment(
            ctx.backend,
            &TextureDescriptor {
                label: Some(format!("{name} color")),
                width: descriptor.width,
                height: descriptor.height,
                format: descriptor.format,
                usage: TextureUsage::RENDER_ATTACHMENT | TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_SRC,
                ..Default::default()
            },
        )?;

        let depth = if descriptor.depth {
            let depth = create_attachment(
                ctx.backend,
                &TextureDescriptor {
                    label: Some(format!("{name} depth")),
                    width: descriptor.width,
                    height: descriptor.height,
                    format: DEPTH_FORMAT,
                    usage: TextureUsage::RENDER_ATTACHMENT,
                    ..Default::default()
                },
            );
            match depth {
                Ok(depth) => Some(depth),
                Err(e) => {
                    ctx.backend.destroy_texture_view(color_view);
                    ctx.backend.destroy_texture(color);
                    return Err(e);
                }
            }
        } else {
            None
        };

        Ok(NativeFrameBuffer {
            color,
            color_view,
            depth,
            width: descriptor.width,
            height: descriptor.height,
            format: descriptor.format,
        })
    }

    pub fn handle(
        &mut self,
        ctx: &mut BackendContext<'_>,
        descriptor: &Descriptor<FrameBuffer>,
    ) -> RenderResult<&NativeFrameBuffer> {
        self.frame_buffers
            .handle(descriptor, |d| Self::create(ctx, d))
            .map(|native| &*native)
    }

    pub fn release(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<FrameBuffer>) -> RenderResult<usize> {
        let backend = &mut *ctx.backend;
        self.frame_buffers
            .release(descriptor, |native| destroy(backend, native))
            .map_err(|e| ctx.report(e.into()))
    }

    pub fn get_internal(&self, descriptor: &Descriptor<FrameBuffer>) -> Option<&NativeFrameBuffer> {
        self.frame_buffers.get_internal(descriptor)
    }

    pub fn count(&self, descriptor: &Descriptor<FrameBuffer>) -> usize {
        self.frame_buffers.count(descriptor)
    }

    pub fn len(&self) -> usize {
        self.frame_buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frame_buffers.is_empty()
    }

    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<FrameBuffer>, usize)> {
        self.frame_buffers
            .release_all(|_, native| destroy(ctx.backend, native))
    }

    pub fn handle_all(&mut self, ctx: &mut BackendContext<'_>, descriptors: Vec<(Descriptor<FrameBuffer>, usize)>) {
        for (_, _, error) in self.frame_buffers.handle_all(descriptors, |d| Self::create(ctx, d)) {
            ctx.report(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::error::CollectingReporter;

    #[test]
    fn test_attachments() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut handler = FrameBufferHandler::new();
        let with_depth = Descriptor::new(FrameBuffer::new(32, 16).with_label("shadow"));
        let color_only = Descriptor::new(FrameBuffer::new(32, 16).with_depth(false));

        {
            let mut ctx = BackendContext::new(&mut backend, &reporter);
            let native = *handler.handle(&mut ctx, &with_depth).unwrap();
            assert!(native.depth.is_some());
            assert_eq!((native.width, native.height), (32, 16));
            assert!(handler.handle(&mut ctx, &color_only).unwrap().depth.is_none());
        }
        let dummy = backend.as_dummy().unwrap();
        assert_eq!(dummy.live_count(ObjectKind::Texture), 3);
        assert!(dummy
            .live_labels(ObjectKind::Texture)
            .contains(&"shadow depth".to_string()));

        {
            let mut ctx = BackendContext::new(&mut backend, &reporter);
            handler.release(&mut ctx, &with_depth).unwrap();
            handler.release(&mut ctx, &color_only).unwrap();
        }
        assert_eq!(backend.as_dummy().unwrap().live_total(), 0);
    }

    #[test]
    fn test_failed_depth_cleans_up_color() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut handler = FrameBufferHandler::new();
        let fb = Descriptor::new(FrameBuffer::new(4, 4));

        let mut ctx = BackendContext::new(&mut backend, &reporter);
        // color texture, color view, then the depth texture fails
        ctx.backend.as_dummy_mut().unwrap().fail_after(2);
        assert!(handler.handle(&mut ctx, &fb).is_err());
        assert_eq!(handler.count(&fb), 0);
        assert_eq!(backend.as_dummy().unwrap().live_total(), 0);
    }

    #[test]
    fn test_zero_size_is_invalid() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let mut handler = FrameBufferHandler::new();

        let fb = Descriptor::new(FrameBuffer::new(0, 4));
        assert!(handler.handle(&mut ctx, &fb).is_err());
        assert!(handler.is_empty());
    }
}
