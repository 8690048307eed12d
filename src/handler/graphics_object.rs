use super::{BackendContext, DataBufferHandler, Handler};
use crate::backend::{
    Backend, BufferDescriptor, BufferHandle, BufferUsage, GraphicsBackend, IndexFormat, PrimitiveTopology,
    VertexFormat,
};
use crate::error::{HandlerError, RenderError, RenderResult};
use crate::resources::{DataBuffer, Descriptor, ElementType, GraphicsObject, Resource};

/// A graphics-object attribute resolved to its native buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeBinding {
    pub name: String,
    pub buffer: BufferHandle,
    pub format: VertexFormat,
    pub stride: u64,
}

/// Index buffer as seen by draw calls. Shared by every graphics object
/// using the same index data buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexBinding {
    pub buffer: BufferHandle,
    pub format: IndexFormat,
    pub count: u32,
    /// True when `buffer` is a widened copy owned by the binding
    pub owned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeGraphicsObject {
    pub topology: PrimitiveTopology,
    pub attributes: Vec<AttributeBinding>,
    pub index: Option<IndexBinding>,
    pub vertex_count: u32,
}

impl NativeGraphicsObject {
    pub fn attribute(&self, name: &str) -> Option<&AttributeBinding> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Number of elements a draw consumes
    pub fn element_count(&self) -> u32 {
        self.index.map_or(self.vertex_count, |index| index.count)
    }
}

fn destroy_index(backend: &mut Backend, binding: IndexBinding) {
    if binding.owned {
        backend.destroy_buffer(binding.buffer);
    }
}

#[derive(Default)]
pub struct GraphicsObjectHandler {
    objects: Handler<GraphicsObject, NativeGraphicsObject>,
    indices: Handler<DataBuffer, IndexBinding>,
}

impl GraphicsObjectHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn validate(descriptor: &Descriptor<GraphicsObject>) -> RenderResult<()> {
        let invalid = |reason: String| -> RenderError {
            HandlerError::InvalidDescriptor {
                kind: GraphicsObject::KIND,
                label: descriptor.name(),
                reason,
            }
            .into()
        };

        if let Some(index) = &descriptor.index {
            let usable = index.components() == 1
                && matches!(index.element_type(), ElementType::U8 | ElementType::U16 | ElementType::U32);
            if !usable {
                return Err(invalid(format!(
                    "index buffer {} holds {:?}x{}",
                    index.name(),
                    index.element_type(),
                    index.components()
                )));
            }
        }
        for attribute in &descriptor.attributes {
            if attribute.buffer.vertex_format().is_none() {
                return Err(invalid(format!(
                    "attribute `{}` holds {:?}x{}, which is not a vertex format",
                    attribute.name,
                    attribute.buffer.element_type(),
                    attribute.buffer.components()
                )));
            }
        }
        Ok(())
    }

    fn create_index(
        ctx: &mut BackendContext<'_>,
        data_buffers: &DataBufferHandler,
        index: &Descriptor<DataBuffer>,
    ) -> RenderResult<IndexBinding> {
        let count = index.element_count() as u32;
        if let Some(format) = index.index_format() {
            let native = data_buffers
                .get_internal(index)
                .ok_or_else(|| RenderError::missing(index.name(), "handled index buffer"))?;
            return Ok(IndexBinding {
                buffer: native.buffer,
                format,
                count,
                owned: false,
            });
        }

        // No 8-bit index format on the GPU
        let widened: Vec<u16> = index.contents().iter().map(|&i| u16::from(i)).collect();
        let mut bytes: Vec<u8> = bytemuck::cast_slice(&widened).to_vec();
        bytes.resize(bytes.len().max(4).div_ceil(4) * 4, 0);
        let buffer = ctx.backend.create_buffer_init(
            &BufferDescriptor {
                label: Some(format!("{} (u16)", index.name())),
                size: bytes.len() as u64,
                usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
            },
            &bytes,
        )?;
        Ok(IndexBinding {
            buffer,
            format: IndexFormat::Uint16,
            count,
            owned: true,
        })
    }

    fn create(
        ctx: &mut BackendContext<'_>,
        data_buffers: &DataBufferHandler,
        indices: &mut Handler<DataBuffer, IndexBinding>,
        descriptor: &Descriptor<GraphicsObject>,
    ) -> RenderResult<NativeGraphicsObject> {
        let mut attributes = Vec::with_capacity(descriptor.attributes.len());
        for attribute in &descriptor.attributes {
            let native = data_buffers.get_internal(&attribute.buffer).ok_or_else(|| {
                RenderError::missing(descriptor.name(), format!("handled buffer for `{}`", attribute.name))
            })?;
            let format = attribute
                .buffer
                .vertex_format()
                .ok_or_else(|| RenderError::missing(descriptor.name(), format!("vertex format of `{}`", attribute.name)))?;
            attributes.push(AttributeBinding {
                name: attribute.name.clone(),
                buffer: native.buffer,
                format,
                stride: attribute.buffer.stride() as u64,
            });
        }

        let index = match &descriptor.index {
            Some(index) => Some(*indices.handle(index, |d| Self::create_index(ctx, data_buffers, d))?),
            None => None,
        };

        let vertex_count = descriptor.vertex_count.unwrap_or_else(|| {
            descriptor
                .attributes
                .first()
                .map_or(0, |a| a.buffer.element_count() as u32)
        });

        Ok(NativeGraphicsObject {
            topology: descriptor.topology,
            attributes,
            index,
            vertex_count,
        })
    }

    /// Handle every buffer of `descriptor`, then the object itself.
    ///
    /// Buffers are handled on every call so each live reference holds them.
    pub fn handle(
        &mut self,
        ctx: &mut BackendContext<'_>,
        data_buffers: &mut DataBufferHandler,
        descriptor: &Descriptor<GraphicsObject>,
    ) -> RenderResult<&NativeGraphicsObject> {
        Self::validate(descriptor)?;

        let buffers: Vec<&Descriptor<DataBuffer>> = descriptor.buffers().collect();
        for (acquired, buffer) in buffers.iter().enumerate() {
            if let Err(e) = data_buffers.handle(ctx, buffer) {
                for held in buffers[..acquired].iter().rev() {
                    data_buffers.release(ctx, held).ok();
                }
                return Err(e);
            }
        }

        let indices = &mut self.indices;
        match self
            .objects
            .handle(descriptor, |d| Self::create(ctx, data_buffers, indices, d))
        {
            Ok(native) => Ok(&*native),
            Err(e) => {
                for buffer in buffers.iter().rev() {
                    data_buffers.release(ctx, buffer).ok();
                }
                Err(e)
            }
        }
    }

    /// Release the object, then its buffers in reverse order
    pub fn release(
        &mut self,
        ctx: &mut BackendContext<'_>,
        data_buffers: &mut DataBufferHandler,
        descriptor: &Descriptor<GraphicsObject>,
    ) -> RenderResult<usize> {
        let indices = &mut self.indices;
        let backend = &mut *ctx.backend;
        let remaining = self
            .objects
            .release(descriptor, |_| {
                if let Some(index) = &descriptor.index {
                    if let Err(e) = indices.release(index, |binding| destroy_index(backend, binding)) {
                        log::error!("{e}");
                    }
                }
            })
            .map_err(|e| ctx.report(e.into()))?;

        let mut result = Ok(remaining);
        for buffer in descriptor.buffers().collect::<Vec<_>>().into_iter().rev() {
            if let Err(e) = data_buffers.release(ctx, buffer) {
                result = Err(e);
            }
        }
        result
    }

    pub fn get_internal(&self, descriptor: &Descriptor<GraphicsObject>) -> Option<&NativeGraphicsObject> {
        self.objects.get_internal(descriptor)
    }

    pub fn count(&self, descriptor: &Descriptor<GraphicsObject>) -> usize {
        self.objects.count(descriptor)
    }

    /// Number of live graphics objects sharing the binding of `index`
    pub fn index_users(&self, index: &Descriptor<DataBuffer>) -> usize {
        self.indices.count(index)
    }

    pub fn index_binding(&self, index: &Descriptor<DataBuffer>) -> Option<&IndexBinding> {
        self.indices.get_internal(index)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Drops every object and index binding. Buffer counts are left as they are.
    pub fn release_all(&mut self, ctx: &mut BackendContext<'_>) -> Vec<(Descriptor<GraphicsObject>, usize)> {
        let released = self.objects.release_all(|_, _| {});
        self.indices
            .release_all(|_, binding| destroy_index(ctx.backend, binding));
        released
    }

    /// Recreate released objects; data buffers must be restored first.
    ///
    /// An object that cannot be recreated releases its buffers once per
    /// reference it held, as if each of them had been released.
    pub fn handle_all(
        &mut self,
        ctx: &mut BackendContext<'_>,
        data_buffers: &mut DataBufferHandler,
        descriptors: Vec<(Descriptor<GraphicsObject>, usize)>,
    ) {
        let indices = &mut self.indices;
        let failures = {
            let data_buffers = &*data_buffers;
            self.objects
                .handle_all(descriptors, |d| Self::create(ctx, data_buffers, indices, d))
        };
        for (descriptor, count, error) in failures {
            ctx.report(error);
            Self::release_buffers(ctx, data_buffers, &descriptor, count);
        }
    }

    /// Give back `count` references on each buffer that is still live
    fn release_buffers(
        ctx: &mut BackendContext<'_>,
        data_buffers: &mut DataBufferHandler,
        descriptor: &GraphicsObject,
        count: usize,
    ) {
        for buffer in descriptor.buffers().collect::<Vec<_>>().into_iter().rev() {
            for _ in 0..count.min(data_buffers.count(buffer)) {
                data_buffers.release(ctx, buffer).ok();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::dummy::{DummyBackend, ObjectKind};
    use crate::error::CollectingReporter;
    use glam::Vec3;

    struct Fixture {
        backend: Backend,
        reporter: CollectingReporter,
        data_buffers: DataBufferHandler,
        objects: GraphicsObjectHandler,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                backend: Backend::Dummy(DummyBackend::new(8, 8)),
                reporter: CollectingReporter::new(),
                data_buffers: DataBufferHandler::new(),
                objects: GraphicsObjectHandler::new(),
            }
        }

        fn handle(&mut self, d: &Descriptor<GraphicsObject>) -> RenderResult<NativeGraphicsObject> {
            let mut ctx = BackendContext::new(&mut self.backend, &self.reporter);
            self.objects.handle(&mut ctx, &mut self.data_buffers, d).cloned()
        }

        fn release(&mut self, d: &Descriptor<GraphicsObject>) -> RenderResult<usize> {
            let mut ctx = BackendContext::new(&mut self.backend, &self.reporter);
            self.objects.release(&mut ctx, &mut self.data_buffers, d)
        }

        fn live_buffers(&self) -> usize {
            self.backend.as_dummy().unwrap().live_count(ObjectKind::Buffer)
        }
    }

    fn triangle(index: &Descriptor<DataBuffer>) -> (Descriptor<DataBuffer>, Descriptor<GraphicsObject>) {
        let positions = Descriptor::new(DataBuffer::from_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y]));
        let object = Descriptor::new(
            GraphicsObject::triangles()
                .with_attribute("position", &positions)
                .with_index(index),
        );
        (positions, object)
    }

    #[test]
    fn test_counts_propagate_to_buffers() {
        let mut f = Fixture::new();
        let index = Descriptor::new(DataBuffer::indices_u16(&[0, 1, 2]));
        let (positions, object) = triangle(&index);

        let native = f.handle(&object).unwrap();
        f.handle(&object).unwrap();
        assert_eq!(native.element_count(), 3);
        assert_eq!(native.vertex_count, 3);
        assert_eq!(f.objects.count(&object), 2);
        assert_eq!(f.data_buffers.count(&index), 2);
        assert_eq!(f.data_buffers.count(&positions), 2);
        assert_eq!(f.objects.index_users(&index), 1);

        f.release(&object).unwrap();
        assert_eq!(f.data_buffers.count(&positions), 1);
        assert!(f.objects.get_internal(&object).is_some());

        f.release(&object).unwrap();
        assert!(f.objects.get_internal(&object).is_none());
        assert!(f.data_buffers.get_internal(&index).is_none());
        assert!(f.data_buffers.get_internal(&positions).is_none());
        assert_eq!(f.live_buffers(), 0);
    }

    #[test]
    fn test_index_binding_shared() {
        let mut f = Fixture::new();
        let index = Descriptor::new(DataBuffer::indices_u32(&[0, 1, 2]));
        let (_, a) = triangle(&index);
        let (_, b) = triangle(&index);

        let native_a = f.handle(&a).unwrap();
        let native_b = f.handle(&b).unwrap();
        assert_eq!(native_a.index, native_b.index);
        assert_eq!(f.objects.index_users(&index), 2);
        assert_eq!(f.data_buffers.count(&index), 2);

        f.release(&a).unwrap();
        assert_eq!(f.objects.index_users(&index), 1);
        assert!(f.data_buffers.get_internal(&index).is_some());

        f.release(&b).unwrap();
        assert_eq!(f.objects.index_users(&index), 0);
        assert!(f.data_buffers.get_internal(&index).is_none());
    }

    #[test]
    fn test_u8_indices_are_widened() {
        let mut f = Fixture::new();
        let index = Descriptor::new(DataBuffer::indices_u8(&[2, 1, 0]));
        let (_, object) = triangle(&index);

        let native = f.handle(&object).unwrap();
        let binding = native.index.unwrap();
        assert!(binding.owned);
        assert_eq!(binding.format, IndexFormat::Uint16);
        assert_eq!(binding.count, 3);
        let contents = f.backend.as_dummy().unwrap().buffer_contents(binding.buffer).unwrap();
        assert_eq!(&contents[..6], bytemuck::cast_slice::<u16, u8>(&[2, 1, 0]));

        // index data buffer, widened copy, positions
        assert_eq!(f.live_buffers(), 3);
        f.release(&object).unwrap();
        assert_eq!(f.live_buffers(), 0);
    }

    #[test]
    fn test_over_release_keeps_buffers() {
        let mut f = Fixture::new();
        let index = Descriptor::new(DataBuffer::indices_u16(&[0, 1, 2]));
        let (positions, object) = triangle(&index);
        let (_, other) = triangle(&index);

        f.handle(&other).unwrap();
        assert!(f.release(&object).is_err());
        assert_eq!(f.data_buffers.count(&index), 1);
        assert_eq!(f.data_buffers.count(&positions), 0);
        assert_eq!(f.reporter.len(), 1);
    }

    #[test]
    fn test_failed_buffer_rolls_back() {
        let mut f = Fixture::new();
        let index = Descriptor::new(DataBuffer::indices_u16(&[0, 1, 2]));
        let (positions, object) = triangle(&index);

        // index buffer succeeds, positions fail
        f.backend.as_dummy_mut().unwrap().fail_after(1);
        assert!(f.handle(&object).is_err());
        assert_eq!(f.data_buffers.count(&index), 0);
        assert_eq!(f.data_buffers.count(&positions), 0);
        assert_eq!(f.objects.count(&object), 0);
        assert_eq!(f.live_buffers(), 0);
    }

    #[test]
    fn test_invalid_attribute_format() {
        let mut f = Fixture::new();
        let packed = Descriptor::new(DataBuffer::zeroed(ElementType::U16, 2, 12));
        let object = Descriptor::new(GraphicsObject::triangles().with_attribute("packed", &packed));

        assert!(matches!(
            f.handle(&object),
            Err(RenderError::Handler(HandlerError::InvalidDescriptor { .. }))
        ));
        assert_eq!(f.data_buffers.count(&packed), 0);
    }
}
