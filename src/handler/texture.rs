use super::{BackendContext, FrameBufferHandler, Handler};
use crate::backend::{
    Backend, GraphicsBackend, SamplerHandle, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage,
    TextureViewHandle,
};
use crate::error::{HandlerError, RenderError, RenderResult};
use crate::resources::{Descriptor, Resource, Texture, TextureSource};

/// Native handles of a [`Texture`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeTexture {
    pub texture: TextureHandle,
    pub view: TextureViewHandle,
    pub sampler: SamplerHandle,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    /// False when `texture` and `view` belong to a frame buffer
    pub owned: bool,
}

fn destroy(backend: &mut Backend, native: NativeTexture) {
    backend.destroy_sampler(native.sampler);
    if native.owned {
        backend.destroy_texture_view(native.view);
        backend.destroy_texture(native.texture);
    }
}

#[derive(Default)]
pub struct TextureHandler {
    textures: Handler<Texture, NativeTexture>,
}

impl TextureHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn create_image(ctx: &mut BackendContext<'_>, descriptor: &Descriptor<Texture>) -> RenderResult<NativeTexture> {
        let TextureSource::Image(image) = descriptor.source() else {
            return Err(RenderError::missing(descriptor.name(), "image source"));
        };
        let pixels = image.pixels();
        if image.width == 0 || image.height == 0 || pixels.len() != image.expected_len() {
            return Err(HandlerError::InvalidDescriptor {
                kind: Texture::KIND,
                label: descriptor.name(),
                reason: format!(
                    "{} bytes of pixels for a {}x{} {:?} image",
                    pixels.len(),
                    image.width,
                    image.height,
                    image.format
                ),
            }
            .into());
        }

        let backend = &mut *ctx.backend;
        let texture = backend.create_texture(&TextureDescriptor {
            label: Some(descriptor.name()),
            width: image.width,
            height: image.height,
            format: image.format,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
            ..Default::default()
        })?;
        backend.write_texture(texture, &pixels, image.width, image.height);

        let view = match backend.create_texture_view(texture) {
            Ok(view) => view,
            Err(e) => {
                backend.destroy_texture(texture);
                return Err(e.into());
            }
        };
        let sampler = match backend.create_sampler(&descriptor.sampler.to_descriptor(Some(descriptor.name()))) {
            Ok(sampler) => sampler,
            Err(e) => {
                backend.destroy_texture_view(view);
                backend.destroy_texture(texture);
                return Err(e.into());
            }
        };

        Ok(NativeTexture {
            texture,
            view,
            sampler,
            width: image.width,
            height: image.height,
            format: image.format,
            owned: true,
        })
    }

    /// Wraps the frame buffer's color attachment, which must already be handled
    fn create_attached(
        ctx: &mut BackendContext<'_>,
        frame_buffers: &FrameBufferHandler,
        descriptor: &Descriptor<Texture>,
    ) -> RenderResult<NativeTexture> {
        let Some(fb) = descriptor.frame_buffer() else {
            return Err(RenderError::missing(descriptor.name(), "frame buffer source"));
        };
        let Some(attachment) = frame_buffers.get_internal(fb) else {
            return Err(RenderError::missing(descriptor.name(), format!("handled {}", fb.name())));
        };
        let sampler = ctx
            .backend
            .create_sampler(&descriptor.sampler.to_descriptor(Some(descriptor.name())))?;

        Ok(NativeTexture {
            texture: attachment.color,
            view: attachment.color_view,
            sampler,
            width: attachment.width,
            height: attachment.height,
            format: attachment.format,
            owned: false,
        })
    }

    fn create(
        ctx: &mut BackendContext<'_>,
        frame_buffers: &FrameBufferHandler,
        descriptor: &Descriptor<Texture>,
    ) -> RenderResult<NativeTexture> {
        match descriptor.source() {
            TextureSource::Image(_) => Self::create_image(ctx, descriptor),
            TextureSource::FrameBuffer(_) => Self::create_attached(ctx, frame_buffers, descriptor),
        }
    }

    /// Handle `descriptor`. Frame-buffer textures handle their frame buffer first.
    pub fn handle(
        &mut self,
        ctx: &mut BackendContext<'_>,
        frame_buffers: &mut FrameBufferHandler,
        descriptor: &Descriptor<Texture>,
    ) -> RenderResult<&NativeTexture> {
        let fb = descriptor.frame_buffer();
        if let Some(fb) = fb {
            frame_buffers.handle(ctx, fb)?;
        }

        match self
            .textures
            .handle(descriptor, |d| Self::create(ctx, frame_buffers, d))
        {
            Ok(native) => Ok(&*native),
            Err(e) => {
                if let Some(fb) = fb {
                    frame_buffers.release(ctx, fb).ok();
                }
                Err(e)
            }
        }
    }

    pub fn release(
        &mut self,
        ctx: &mut BackendContext<'_>,
        frame_buffers: &mut FrameBufferHandler,
        descriptor: &Descriptor<Texture>,
    ) -> RenderResult<usize> {
        let backend = &mut *ctx.backend;
        let remaining = self
            .textures
            .release(descriptor, |native| destroy(backend, native))
            .map_err(|e| ctx.report(e.into()))?;

        if let Some(fb) = descriptor.frame_buffer() {
            frame_buffers.release(ctx, fb)?;
        }
        Ok(remaining)
    }

    /// Re-upload the pixels of an image texture
    pub fn update(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<Texture>) -> RenderResult<()> {
        let Some(native) = self.textures.get_internal(descriptor) else {
            return Err(ctx.report(RenderError::missing(
                format!("update of {}", descriptor.name()),
                "handled texture",
            )));
        };
        match descriptor.source() {
            TextureSource::Image(image) => {
                ctx.backend
                    .write_texture(native.texture, &image.pixels(), native.width, native.height);
                Ok(())
            }
            TextureSource::FrameBuffer(fb) => Err(ctx.report(RenderError::missing(
                format!("update of {}", descriptor.name()),
                format!("pixels ({} is rendered into)", fb.name()),
            ))),
        }
    }

    pub fn get_internal(&self, descriptor: &Descriptor<Texture>) -> Option<&NativeTexture> {
        self.textures.get_internal(descriptor)
    }

    pub fn count(&self, descriptor: &Descriptor<Texture>) -> usize {
        self.textures.count(descriptor)
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }

    /// Destroys native textures only. Frame buffer counts are left as they are.
    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<Texture>, usize)> {
        self.textures.release_all(|_, native| destroy(ctx.backend, native))
    }

    /// Recreate released textures; frame buffers must be restored first.
    ///
    /// A texture that cannot be recreated gives back the references it held
    /// on its frame buffer.
    pub fn handle_all(
        &mut self,
        ctx: &mut BackendContext<'_>,
        frame_buffers: &mut FrameBufferHandler,
        descriptors: Vec<(Descriptor<Texture>, usize)>,
    ) {
        let failures = {
            let frame_buffers = &*frame_buffers;
            self.textures
                .handle_all(descriptors, |d| Self::create(ctx, frame_buffers, d))
        };
        for (descriptor, count, error) in failures {
            ctx.report(error);
            if let Some(fb) = descriptor.frame_buffer() {
                for _ in 0..count.min(frame_buffers.count(fb)) {
                    frame_buffers.release(ctx, fb).ok();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::error::CollectingReporter;
    use crate::resources::FrameBuffer;

    #[test]
    fn test_image_texture_lifecycle() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut frame_buffers = FrameBufferHandler::new();
        let mut textures = TextureHandler::new();
        let texture = Descriptor::new(Texture::checkerboard(16, [0; 4], [255; 4]));

        {
            let mut ctx = BackendContext::new(&mut backend, &reporter);
            let native = *textures.handle(&mut ctx, &mut frame_buffers, &texture).unwrap();
            assert!(native.owned);
            assert_eq!((native.width, native.height), (16, 16));
            textures.update(&mut ctx, &texture).unwrap();
        }
        let dummy = backend.as_dummy().unwrap();
        assert_eq!(dummy.live_count(ObjectKind::Texture), 1);
        assert_eq!(dummy.live_count(ObjectKind::Sampler), 1);

        {
            let mut ctx = BackendContext::new(&mut backend, &reporter);
            assert_eq!(textures.release(&mut ctx, &mut frame_buffers, &texture).unwrap(), 0);
        }
        assert_eq!(backend.as_dummy().unwrap().live_total(), 0);
        assert!(reporter.is_empty());
    }

    #[test]
    fn test_frame_buffer_texture_shares_attachment() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut frame_buffers = FrameBufferHandler::new();
        let mut textures = TextureHandler::new();
        let fb = Descriptor::new(FrameBuffer::new(64, 64).with_depth(false));
        let texture = Descriptor::new(Texture::from_frame_buffer(&fb));

        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let native = *textures.handle(&mut ctx, &mut frame_buffers, &texture).unwrap();
        let attachment = *frame_buffers.get_internal(&fb).unwrap();
        assert!(!native.owned);
        assert_eq!(native.texture, attachment.color);
        assert_eq!(native.view, attachment.color_view);
        assert_eq!(frame_buffers.count(&fb), 1);

        // The frame buffer outlives the texture while it is handled elsewhere
        frame_buffers.handle(&mut ctx, &fb).unwrap();
        textures.release(&mut ctx, &mut frame_buffers, &texture).unwrap();
        assert_eq!(frame_buffers.count(&fb), 1);
        let dummy = ctx.backend.as_dummy().unwrap();
        assert!(dummy.is_alive(attachment.color.raw()));
        assert_eq!(dummy.live_count(ObjectKind::Sampler), 0);

        // Pixels cannot be uploaded into a rendered texture
        textures.handle(&mut ctx, &mut frame_buffers, &texture).unwrap();
        assert!(textures.update(&mut ctx, &texture).is_err());
        assert_eq!(reporter.len(), 1);
    }

    #[test]
    fn test_failed_texture_releases_frame_buffer() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut frame_buffers = FrameBufferHandler::new();
        let mut textures = TextureHandler::new();
        let fb = Descriptor::new(FrameBuffer::new(8, 8).with_depth(false));
        let texture = Descriptor::new(Texture::from_frame_buffer(&fb));

        let mut ctx = BackendContext::new(&mut backend, &reporter);
        // color texture and view succeed, the sampler fails
        ctx.backend.as_dummy_mut().unwrap().fail_after(2);
        assert!(textures.handle(&mut ctx, &mut frame_buffers, &texture).is_err());
        assert_eq!(textures.count(&texture), 0);
        assert_eq!(frame_buffers.count(&fb), 0);
        assert_eq!(ctx.backend.as_dummy().unwrap().live_total(), 0);
    }

    #[test]
    fn test_mismatched_pixels_are_invalid() {
        let mut backend = Backend::Dummy(DummyBackend::new(8, 8));
        let reporter = CollectingReporter::new();
        let mut frame_buffers = FrameBufferHandler::new();
        let mut textures = TextureHandler::new();
        let texture = Descriptor::new(Texture::from_rgba8(2, 2, vec![0; 3]));

        let mut ctx = BackendContext::new(&mut backend, &reporter);
        let err = textures.handle(&mut ctx, &mut frame_buffers, &texture).unwrap_err();
        assert!(matches!(err, RenderError::Handler(HandlerError::InvalidDescriptor { .. })));
    }
}
