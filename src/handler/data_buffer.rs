use super::{BackendContext, Handler};
use crate::backend::{BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend};
use crate::error::{HandlerError, RenderError, RenderResult};
use crate::resources::{DataBuffer, Descriptor, Resource};
use std::ops::Range;

/// GPU copy of a [`DataBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeBuffer {
    pub buffer: BufferHandle,
    /// Allocated size, the contents padded to 4 bytes
    pub size: u64,
}

/// Buffer writes must be 4-byte aligned
const ALIGNMENT: usize = 4;

fn padded_len(len: usize) -> usize {
    len.max(ALIGNMENT).div_ceil(ALIGNMENT) * ALIGNMENT
}

fn padded_range(range: Range<usize>, len: usize) -> Range<usize> {
    let start = range.start - range.start % ALIGNMENT;
    let end = range.end.div_ceil(ALIGNMENT) * ALIGNMENT;
    start..end.min(padded_len(len))
}

/// Copy of `contents[range]`, zero-filled where the range passes the end
fn padded_bytes(contents: &[u8], range: Range<usize>) -> Vec<u8> {
    let mut bytes = vec![0u8; range.len()];
    let available = contents.len().min(range.end).saturating_sub(range.start);
    bytes[..available].copy_from_slice(&contents[range.start..range.start + available]);
    bytes
}

#[derive(Default)]
pub struct DataBufferHandler {
    buffers: Handler<DataBuffer, NativeBuffer>,
}

impl DataBufferHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn create(ctx: &mut BackendContext<'_>, descriptor: &Descriptor<DataBuffer>) -> RenderResult<NativeBuffer> {
        let components = descriptor.components();
        if !(1..=4).contains(&components) {
            return Err(HandlerError::InvalidDescriptor {
                kind: DataBuffer::KIND,
                label: descriptor.name(),
                reason: format!("{components} components per element"),
            }
            .into());
        }

        let contents = descriptor.contents();
        let size = padded_len(contents.len());
        let bytes = padded_bytes(&contents, 0..size);
        let buffer = ctx.backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(descriptor.name()),
                size: size as u64,
                usage: BufferUsage::VERTEX | BufferUsage::INDEX | BufferUsage::UNIFORM | BufferUsage::COPY_DST,
            },
            &bytes,
        )?;
        Ok(NativeBuffer {
            buffer,
            size: size as u64,
        })
    }

    /// Upload `descriptor` on first use, otherwise add a reference
    pub fn handle(
        &mut self,
        ctx: &mut BackendContext<'_>,
        descriptor: &Descriptor<DataBuffer>,
    ) -> RenderResult<&NativeBuffer> {
        self.buffers
            .handle(descriptor, |d| Self::create(ctx, d))
            .map(|native| &*native)
    }

    pub fn release(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<DataBuffer>) -> RenderResult<usize> {
        let backend = &mut *ctx.backend;
        self.buffers
            .release(descriptor, |native| backend.destroy_buffer(native.buffer))
            .map_err(|e| ctx.report(e.into()))
    }

    /// Re-upload the whole contents of a handled buffer
    pub fn update(&mut self, ctx: &mut BackendContext<'_>, descriptor: &Descriptor<DataBuffer>) -> RenderResult<()> {
        let len = descriptor.byte_len();
        self.update_range(ctx, descriptor, 0..len)
    }

    /// Re-upload `range` of the contents, widened to 4-byte alignment
    pub fn update_range(
        &mut self,
        ctx: &mut BackendContext<'_>,
        descriptor: &Descriptor<DataBuffer>,
        range: Range<usize>,
    ) -> RenderResult<()> {
        let Some(native) = self.buffers.get_internal(descriptor) else {
            return Err(ctx.report(RenderError::missing(
                format!("update of {}", descriptor.name()),
                "handled data buffer",
            )));
        };

        let contents = descriptor.contents();
        if range.start > range.end || range.end > contents.len() {
            return Err(RenderError::OutOfBounds {
                offset: range.start,
                len: range.end.saturating_sub(range.start),
                size: contents.len(),
            });
        }
        if range.is_empty() {
            return Ok(());
        }

        let aligned = padded_range(range, contents.len());
        let bytes = padded_bytes(&contents, aligned.clone());
        ctx.backend.write_buffer(native.buffer, aligned.start as u64, &bytes);
        log::trace!("Updated {} bytes of {}", bytes.len(), descriptor.name());
        Ok(())
    }

    pub fn get_internal(&self, descriptor: &Descriptor<DataBuffer>) -> Option<&NativeBuffer> {
        self.buffers.get_internal(descriptor)
    }

    pub fn count(&self, descriptor: &Descriptor<DataBuffer>) -> usize {
        self.buffers.count(descriptor)
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<DataBuffer>, usize)> {
        self.buffers
            .release_all(|_, native| ctx.backend.destroy_buffer(native.buffer))
    }

    pub fn handle_all(&mut self, ctx: &mut BackendContext<'_>, descriptors: Vec<(Descriptor<DataBuffer>, usize)>) {
        for (_, _, error) in self.buffers.handle_all(descriptors, |d| Self::create(ctx, d)) {
            ctx.report(error);
        }
    }
}
