//! Geometry: an optional index buffer plus one data buffer per attribute

use super::{DataBuffer, Descriptor, Resource};
use crate::backend::types::PrimitiveTopology;

/// A named vertex attribute and the buffer holding its values
#[derive(Debug, Clone)]
pub struct Attribute {
    pub name: String,
    pub buffer: Descriptor<DataBuffer>,
}

#[derive(Debug, Clone)]
pub struct GraphicsObject {
    label: Option<String>,
    pub topology: PrimitiveTopology,
    pub index: Option<Descriptor<DataBuffer>>,
    pub attributes: Vec<Attribute>,
    /// Overrides the vertex count derived from the first attribute
    pub vertex_count: Option<u32>,
}

impl GraphicsObject {
    pub fn new(topology: PrimitiveTopology) -> Self {
        Self {
            label: None,
            topology,
            index: None,
            attributes: Vec::new(),
            vertex_count: None,
        }
    }

    pub fn triangles() -> Self {
        Self::new(PrimitiveTopology::TriangleList)
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, buffer: &Descriptor<DataBuffer>) -> Self {
        self.attributes.push(Attribute {
            name: name.into(),
            buffer: buffer.clone(),
        });
        self
    }

    pub fn with_index(mut self, buffer: &Descriptor<DataBuffer>) -> Self {
        self.index = Some(buffer.clone());
        self
    }

    pub fn with_vertex_count(mut self, count: u32) -> Self {
        self.vertex_count = Some(count);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&Attribute> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Every buffer this object depends on, index buffer first
    pub fn buffers(&self) -> impl Iterator<Item = &Descriptor<DataBuffer>> {
        self.index
            .iter()
            .chain(self.attributes.iter().map(|a| &a.buffer))
    }
}

impl Resource for GraphicsObject {
    const KIND: &'static str = "graphics object";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
