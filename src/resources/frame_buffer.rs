//! Offscreen render targets

use super::Resource;
use crate::backend::types::TextureFormat;

/// An offscreen color target with an optional depth attachment.
///
/// The color attachment can be sampled through a frame-buffer-backed
/// [`Texture`](super::Texture).
#[derive(Debug, Clone)]
pub struct FrameBuffer {
    label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub depth: bool,
    pub clear_color: [f32; 4],
}

impl FrameBuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            label: None,
            width,
            height,
            format: TextureFormat::Rgba8Unorm,
            depth: true,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_format(mut self, format: TextureFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_depth(mut self, depth: bool) -> Self {
        self.depth = depth;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }
}

impl Resource for FrameBuffer {
    const KIND: &'static str = "frame buffer";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}
