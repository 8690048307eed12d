//! Drawable objects: a program applied to a graphics object

use super::{Descriptor, GraphicsObject, Program, Resource, Texture};
use crate::backend::types::{CullMode, FrontFace};

/// Feeds the graphics-object attribute `attribute` into the program input `input`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMapping {
    pub attribute: String,
    pub input: String,
}

/// Binds `texture` to the program's texture variable called `name`
#[derive(Clone)]
pub struct TextureBinding {
    pub name: String,
    pub texture: Descriptor<Texture>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
}

#[derive(Clone)]
pub struct RenderedObject {
    label: Option<String>,
    pub program: Descriptor<Program>,
    pub graphics_object: Descriptor<GraphicsObject>,
    pub mappings: Vec<AttributeMapping>,
    pub textures: Vec<TextureBinding>,
    pub blend: BlendMode,
    pub depth_test: bool,
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub instances: u32,
}

impl RenderedObject {
    pub fn new(program: &Descriptor<Program>, graphics_object: &Descriptor<GraphicsObject>) -> Self {
        Self {
            label: None,
            program: program.clone(),
            graphics_object: graphics_object.clone(),
            mappings: Vec::new(),
            textures: Vec::new(),
            blend: BlendMode::Opaque,
            depth_test: true,
            cull_mode: CullMode::None,
            front_face: FrontFace::Ccw,
            instances: 1,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn map_attribute(mut self, attribute: impl Into<String>, input: impl Into<String>) -> Self {
        self.mappings.push(AttributeMapping {
            attribute: attribute.into(),
            input: input.into(),
        });
        self
    }

    /// Maps every attribute of the graphics object to the input of the same name
    pub fn map_attributes_by_name(mut self) -> Self {
        let names: Vec<String> = self
            .graphics_object
            .attributes
            .iter()
            .map(|a| a.name.clone())
            .collect();
        for name in names {
            self = self.map_attribute(name.clone(), name);
        }
        self
    }

    pub fn with_texture(mut self, name: impl Into<String>, texture: &Descriptor<Texture>) -> Self {
        self.textures.push(TextureBinding {
            name: name.into(),
            texture: texture.clone(),
        });
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_depth_test(mut self, depth_test: bool) -> Self {
        self.depth_test = depth_test;
        self
    }

    pub fn with_cull_mode(mut self, cull_mode: CullMode) -> Self {
        self.cull_mode = cull_mode;
        self
    }

    pub fn with_front_face(mut self, front_face: FrontFace) -> Self {
        self.front_face = front_face;
        self
    }

    pub fn with_instances(mut self, instances: u32) -> Self {
        self.instances = instances;
        self
    }

    pub fn texture(&self, name: &str) -> Option<&Descriptor<Texture>> {
        self.textures
            .iter()
            .find(|binding| binding.name == name)
            .map(|binding| &binding.texture)
    }
}

impl Resource for RenderedObject {
    const KIND: &'static str = "rendered object";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::DataBuffer;

    #[test]
    fn test_map_attributes_by_name() {
        let positions = Descriptor::new(DataBuffer::from_f32(2, &[0.0; 6]));
        let uvs = Descriptor::new(DataBuffer::from_f32(2, &[0.0; 6]));
        let geometry = Descriptor::new(
            GraphicsObject::triangles()
                .with_attribute("position", &positions)
                .with_attribute("uv", &uvs),
        );
        let program = Descriptor::new(Program::new(""));

        let object = RenderedObject::new(&program, &geometry).map_attributes_by_name();
        assert_eq!(
            object.mappings,
            vec![
                AttributeMapping {
                    attribute: "position".into(),
                    input: "position".into()
                },
                AttributeMapping {
                    attribute: "uv".into(),
                    input: "uv".into()
                },
            ]
        );
    }
}
