//! Raw data buffers: vertex attributes, indices

use super::Resource;
use crate::backend::types::{IndexFormat, VertexFormat};
use crate::error::{RenderError, RenderResult};
use bytemuck::Pod;
use glam::{Vec2, Vec3, Vec4};
use parking_lot::{RwLock, RwLockReadGuard};

/// Scalar type of the elements stored in a [`DataBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElementType {
    U8,
    U16,
    U32,
    I32,
    F32,
}

impl ElementType {
    pub fn size(self) -> usize {
        match self {
            ElementType::U8 => 1,
            ElementType::U16 => 2,
            ElementType::U32 | ElementType::I32 | ElementType::F32 => 4,
        }
    }
}

/// A block of typed data destined for a GPU buffer.
///
/// The byte length is fixed at construction. Contents can be rewritten in
/// place with [`DataBuffer::write`]; the change reaches the GPU once the
/// buffer is updated through its handler.
pub struct DataBuffer {
    label: Option<String>,
    element: ElementType,
    components: u32,
    contents: RwLock<Vec<u8>>,
}

impl DataBuffer {
    pub fn new(element: ElementType, components: u32, bytes: Vec<u8>) -> Self {
        Self {
            label: None,
            element,
            components,
            contents: RwLock::new(bytes),
        }
    }

    pub fn from_pod<T: Pod>(element: ElementType, components: u32, data: &[T]) -> Self {
        Self::new(element, components, bytemuck::cast_slice(data).to_vec())
    }

    pub fn from_f32(components: u32, data: &[f32]) -> Self {
        Self::from_pod(ElementType::F32, components, data)
    }

    pub fn from_vec2(data: &[Vec2]) -> Self {
        Self::from_pod(ElementType::F32, 2, data)
    }

    pub fn from_vec3(data: &[Vec3]) -> Self {
        Self::from_pod(ElementType::F32, 3, data)
    }

    pub fn from_vec4(data: &[Vec4]) -> Self {
        Self::from_pod(ElementType::F32, 4, data)
    }

    pub fn indices_u8(data: &[u8]) -> Self {
        Self::new(ElementType::U8, 1, data.to_vec())
    }

    pub fn indices_u16(data: &[u16]) -> Self {
        Self::from_pod(ElementType::U16, 1, data)
    }

    pub fn indices_u32(data: &[u32]) -> Self {
        Self::from_pod(ElementType::U32, 1, data)
    }

    /// Zero-filled buffer of `len` bytes
    pub fn zeroed(element: ElementType, components: u32, len: usize) -> Self {
        Self::new(element, components, vec![0; len])
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn element_type(&self) -> ElementType {
        self.element
    }

    pub fn components(&self) -> u32 {
        self.components
    }

    /// Size of one element including all of its components
    pub fn stride(&self) -> usize {
        self.element.size() * self.components as usize
    }

    pub fn byte_len(&self) -> usize {
        self.contents.read().len()
    }

    pub fn element_count(&self) -> usize {
        match self.stride() {
            0 => 0,
            stride => self.byte_len() / stride,
        }
    }

    pub fn contents(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.contents.read()
    }

    /// Overwrite `bytes.len()` bytes starting at `offset`.
    pub fn write(&self, offset: usize, bytes: &[u8]) -> RenderResult<()> {
        let mut contents = self.contents.write();
        let size = contents.len();
        let end = offset
            .checked_add(bytes.len())
            .filter(|end| *end <= size)
            .ok_or(RenderError::OutOfBounds {
                offset,
                len: bytes.len(),
                size,
            })?;
        contents[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_pod<T: Pod>(&self, offset: usize, data: &[T]) -> RenderResult<()> {
        self.write(offset, bytemuck::cast_slice(data))
    }

    /// Vertex format this buffer provides when bound as an attribute
    pub fn vertex_format(&self) -> Option<VertexFormat> {
        match (self.element, self.components) {
            (ElementType::F32, 1) => Some(VertexFormat::Float32),
            (ElementType::F32, 2) => Some(VertexFormat::Float32x2),
            (ElementType::F32, 3) => Some(VertexFormat::Float32x3),
            (ElementType::F32, 4) => Some(VertexFormat::Float32x4),
            (ElementType::U32, 1) => Some(VertexFormat::Uint32),
            (ElementType::I32, 1) => Some(VertexFormat::Sint32),
            _ => None,
        }
    }

    /// Index format this buffer provides when bound as an index buffer.
    ///
    /// `U8` indices have no native format and get widened by the handler.
    pub fn index_format(&self) -> Option<IndexFormat> {
        match (self.element, self.components) {
            (ElementType::U16, 1) => Some(IndexFormat::Uint16),
            (ElementType::U32, 1) => Some(IndexFormat::Uint32),
            _ => None,
        }
    }
}

impl Resource for DataBuffer {
    const KIND: &'static str = "data buffer";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("label", &self.label)
            .field("element", &self.element)
            .field("components", &self.components)
            .field("byte_len", &self.byte_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_formats() {
        let positions = DataBuffer::from_vec3(&[Vec3::ZERO, Vec3::X, Vec3::Y]);
        assert_eq!(positions.vertex_format(), Some(VertexFormat::Float32x3));
        assert_eq!(positions.element_count(), 3);
        assert_eq!(positions.stride(), 12);
        assert_eq!(positions.index_format(), None);

        let indices = DataBuffer::indices_u16(&[0, 1, 2]);
        assert_eq!(indices.index_format(), Some(IndexFormat::Uint16));
        assert_eq!(indices.element_count(), 3);

        assert_eq!(DataBuffer::indices_u8(&[0, 1, 2]).index_format(), None);
        assert_eq!(DataBuffer::zeroed(ElementType::U16, 3, 12).vertex_format(), None);
    }

    #[test]
    fn test_write_in_bounds() {
        let buffer = DataBuffer::from_f32(1, &[0.0, 0.0, 0.0]);
        buffer.write_pod(4, &[2.5f32]).unwrap();

        let values: Vec<f32> = bytemuck::cast_slice(&buffer.contents()).to_vec();
        assert_eq!(values, vec![0.0, 2.5, 0.0]);
    }

    #[test]
    fn test_write_out_of_bounds_is_rejected() {
        let buffer = DataBuffer::from_f32(1, &[0.0, 0.0]);
        let err = buffer.write(6, &[0; 4]).unwrap_err();
        assert!(matches!(
            err,
            RenderError::OutOfBounds {
                offset: 6,
                len: 4,
                size: 8
            }
        ));
        assert!(buffer.write(usize::MAX, &[1]).is_err());
        assert!(buffer.contents().iter().all(|b| *b == 0));
    }
}
