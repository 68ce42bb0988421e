// Vertex layout for the triangle
//
// Interleaved position + color, matching the attribute locations declared
// in shaders/triangle.vert.

use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub pos: Vec2,
    pub color: Vec3,
}

impl Vertex {
    pub const fn new(pos: Vec2, color: Vec3) -> Self {
        Self { pos, color }
    }

    pub fn binding_description() -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(std::mem::size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build()
    }

    pub fn attribute_descriptions() -> [vk::VertexInputAttributeDescription; 2] {
        [
            // layout(location = 0) in vec2 inPosition
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(0)
                .format(vk::Format::R32G32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, pos) as u32)
                .build(),
            // layout(location = 1) in vec3 inColor
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(1)
                .format(vk::Format::R32G32B32_SFLOAT)
                .offset(std::mem::offset_of!(Vertex, color) as u32)
                .build(),
        ]
    }
}

/// The one piece of geometry this renderer draws
pub const TRIANGLE: [Vertex; 3] = [
    Vertex::new(Vec2::new(0.0, -0.5), Vec3::new(1.0, 1.0, 1.0)),
    Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(0.0, 1.0, 0.0)),
    Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(0.0, 0.0, 1.0)),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stride_matches_interleaved_layout() {
        // vec2 position + vec3 color, tightly packed
        assert_eq!(Vertex::binding_description().stride, 20);
        assert_eq!(std::mem::size_of::<Vertex>(), 20);
    }

    #[test]
    fn attributes_match_shader_locations() {
        let attrs = Vertex::attribute_descriptions();

        assert_eq!(attrs[0].location, 0);
        assert_eq!(attrs[0].format, vk::Format::R32G32_SFLOAT);
        assert_eq!(attrs[0].offset, 0);

        assert_eq!(attrs[1].location, 1);
        assert_eq!(attrs[1].format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(attrs[1].offset, 8);
    }

    #[test]
    fn triangle_bytes_round_trip() {
        let bytes: &[u8] = bytemuck::cast_slice(&TRIANGLE);
        assert_eq!(bytes.len(), 3 * std::mem::size_of::<Vertex>());

        let back: &[Vertex] = bytemuck::cast_slice(bytes);
        assert_eq!(back[0].pos, Vec2::new(0.0, -0.5));
        assert_eq!(back[2].color, Vec3::new(0.0, 0.0, 1.0));
    }
}
