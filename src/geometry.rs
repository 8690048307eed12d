//! Ready-made graphics objects
//!
//! Every shape carries `position` (vec3) and `uv` (vec2) attributes and a
//! 16-bit index buffer; the cube additionally has `normal` (vec3).

use crate::resources::{DataBuffer, Descriptor, GraphicsObject};
use glam::{Vec2, Vec3};

/// A unit quad in the XY plane, centered at the origin
pub fn quad() -> Descriptor<GraphicsObject> {
    let positions = [
        Vec3::new(-0.5, -0.5, 0.0),
        Vec3::new(0.5, -0.5, 0.0),
        Vec3::new(0.5, 0.5, 0.0),
        Vec3::new(-0.5, 0.5, 0.0),
    ];
    let uvs = [
        Vec2::new(0.0, 1.0),
        Vec2::new(1.0, 1.0),
        Vec2::new(1.0, 0.0),
        Vec2::new(0.0, 0.0),
    ];
    let indices: [u16; 6] = [0, 1, 2, 0, 2, 3];

    let positions = Descriptor::new(DataBuffer::from_vec3(&positions).with_label("quad positions"));
    let uvs = Descriptor::new(DataBuffer::from_vec2(&uvs).with_label("quad uvs"));
    let index = Descriptor::new(DataBuffer::indices_u16(&indices).with_label("quad indices"));

    Descriptor::new(
        GraphicsObject::triangles()
            .with_label("quad")
            .with_attribute("position", &positions)
            .with_attribute("uv", &uvs)
            .with_index(&index),
    )
}

/// A unit cube centered at the origin, four vertices per face
pub fn cube() -> Descriptor<GraphicsObject> {
    let faces = [
        (Vec3::Z, Vec3::X, Vec3::Y),
        (-Vec3::Z, -Vec3::X, Vec3::Y),
        (Vec3::X, -Vec3::Z, Vec3::Y),
        (-Vec3::X, Vec3::Z, Vec3::Y),
        (Vec3::Y, Vec3::X, -Vec3::Z),
        (-Vec3::Y, Vec3::X, Vec3::Z),
    ];

    let mut positions = Vec::with_capacity(24);
    let mut normals = Vec::with_capacity(24);
    let mut uvs = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (face, (normal, right, up)) in faces.into_iter().enumerate() {
        let center = normal * 0.5;
        let corners = [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)];
        for (x, y) in corners {
            positions.push(center + right * x + up * y);
            normals.push(normal);
            uvs.push(Vec2::new(x + 0.5, 0.5 - y));
        }

        let base = (face * 4) as u16;
        indices.extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
    }

    let positions = Descriptor::new(DataBuffer::from_vec3(&positions).with_label("cube positions"));
    let normals = Descriptor::new(DataBuffer::from_vec3(&normals).with_label("cube normals"));
    let uvs = Descriptor::new(DataBuffer::from_vec2(&uvs).with_label("cube uvs"));
    let index = Descriptor::new(DataBuffer::indices_u16(&indices).with_label("cube indices"));

    Descriptor::new(
        GraphicsObject::triangles()
            .with_label("cube")
            .with_attribute("position", &positions)
            .with_attribute("normal", &normals)
            .with_attribute("uv", &uvs)
            .with_index(&index),
    )
}
