//! Textures: decoded images or the color attachment of a frame buffer

use super::{Descriptor, FrameBuffer, Resource};
use crate::backend::types::{AddressMode, FilterMode, SamplerDescriptor, TextureFormat};
use crate::error::{HandlerError, RenderResult};
use image::{DynamicImage, GenericImageView};
use parking_lot::{RwLock, RwLockReadGuard};
use std::path::Path;

/// How a texture is filtered and addressed when sampled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerSettings {
    pub filter: FilterMode,
    pub address_mode: AddressMode,
}

impl Default for SamplerSettings {
    fn default() -> Self {
        Self {
            filter: FilterMode::Linear,
            address_mode: AddressMode::ClampToEdge,
        }
    }
}

impl SamplerSettings {
    pub fn nearest() -> Self {
        Self {
            filter: FilterMode::Nearest,
            ..Default::default()
        }
    }

    pub fn repeat() -> Self {
        Self {
            address_mode: AddressMode::Repeat,
            ..Default::default()
        }
    }

    pub fn to_descriptor(self, label: Option<String>) -> SamplerDescriptor {
        SamplerDescriptor {
            label,
            mag_filter: self.filter,
            min_filter: self.filter,
            mipmap_filter: self.filter,
            address_mode_u: self.address_mode,
            address_mode_v: self.address_mode,
            address_mode_w: self.address_mode,
            compare: None,
        }
    }
}

/// Pixels of an image texture
pub struct ImageData {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pixels: RwLock<Vec<u8>>,
}

impl ImageData {
    pub fn pixels(&self) -> RwLockReadGuard<'_, Vec<u8>> {
        self.pixels.read()
    }

    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * self.format.bytes_per_pixel() as usize
    }
}

/// Where the texels of a [`Texture`] come from
pub enum TextureSource {
    Image(ImageData),
    FrameBuffer(Descriptor<FrameBuffer>),
}

pub struct Texture {
    label: Option<String>,
    source: TextureSource,
    pub sampler: SamplerSettings,
}

impl Texture {
    /// Image texture from raw pixels in `format`
    pub fn from_pixels(width: u32, height: u32, format: TextureFormat, pixels: Vec<u8>) -> Self {
        Self {
            label: None,
            source: TextureSource::Image(ImageData {
                width,
                height,
                format,
                pixels: RwLock::new(pixels),
            }),
            sampler: SamplerSettings::default(),
        }
    }

    pub fn from_rgba8(width: u32, height: u32, pixels: Vec<u8>) -> Self {
        Self::from_pixels(width, height, TextureFormat::Rgba8UnormSrgb, pixels)
    }

    /// Load texture from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, image::ImageError> {
        let path = path.as_ref();
        let img = image::open(path)?;
        let mut texture = Self::from_image(img);
        texture.label = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);
        Ok(texture)
    }

    /// Decode an encoded image (png, jpeg, ...) held in memory
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, image::ImageError> {
        let img = image::load_from_memory(bytes)?;
        Ok(Self::from_image(img))
    }

    fn from_image(img: DynamicImage) -> Self {
        let (width, height) = img.dimensions();
        Self::from_rgba8(width, height, img.to_rgba8().into_raw())
    }

    pub fn solid_color(color: [u8; 4]) -> Self {
        Self::from_rgba8(1, 1, color.to_vec())
    }

    pub fn white() -> Self {
        Self::solid_color([255, 255, 255, 255])
    }

    /// Checkerboard with 8x8 texel cells
    pub fn checkerboard(size: u32, color1: [u8; 4], color2: [u8; 4]) -> Self {
        let mut data = Vec::with_capacity((size * size * 4) as usize);

        for y in 0..size {
            for x in 0..size {
                let is_even = ((x / 8) + (y / 8)) % 2 == 0;
                let color = if is_even { color1 } else { color2 };
                data.extend_from_slice(&color);
            }
        }

        Self::from_rgba8(size, size, data)
    }

    /// Texture reading the color attachment of `frame_buffer`
    pub fn from_frame_buffer(frame_buffer: &Descriptor<FrameBuffer>) -> Self {
        Self {
            label: None,
            source: TextureSource::FrameBuffer(frame_buffer.clone()),
            sampler: SamplerSettings::default(),
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_sampler(mut self, sampler: SamplerSettings) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn source(&self) -> &TextureSource {
        &self.source
    }

    pub fn frame_buffer(&self) -> Option<&Descriptor<FrameBuffer>> {
        match &self.source {
            TextureSource::FrameBuffer(fb) => Some(fb),
            TextureSource::Image(_) => None,
        }
    }

    pub fn size(&self) -> (u32, u32) {
        match &self.source {
            TextureSource::Image(image) => (image.width, image.height),
            TextureSource::FrameBuffer(fb) => (fb.width, fb.height),
        }
    }

    /// Replace the pixels of an image texture; the size cannot change.
    pub fn write_pixels(&self, pixels: &[u8]) -> RenderResult<()> {
        let invalid = |reason: String| HandlerError::InvalidDescriptor {
            kind: Self::KIND,
            label: self.label.clone().unwrap_or_default(),
            reason,
        };
        match &self.source {
            TextureSource::Image(image) => {
                if pixels.len() != image.expected_len() {
                    return Err(invalid(format!(
                        "expected {} bytes of pixels, got {}",
                        image.expected_len(),
                        pixels.len()
                    ))
                    .into());
                }
                image.pixels.write().copy_from_slice(pixels);
                Ok(())
            }
            TextureSource::FrameBuffer(_) => {
                Err(invalid("frame buffer textures are written by rendering".into()).into())
            }
        }
    }
}

impl Resource for Texture {
    const KIND: &'static str = "texture";

    fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkerboard_cells() {
        let texture = Texture::checkerboard(16, [255, 0, 0, 255], [0, 0, 255, 255]);
        let TextureSource::Image(image) = texture.source() else {
            panic!("expected image texture");
        };
        assert_eq!(image.pixels().len(), image.expected_len());
        assert_eq!(&image.pixels()[0..4], &[255, 0, 0, 255]);
        // Texel (8, 0) starts the next cell
        assert_eq!(&image.pixels()[8 * 4..8 * 4 + 4], &[0, 0, 255, 255]);
    }

    #[test]
    fn test_write_pixels_checks_size() {
        let texture = Texture::solid_color([0, 0, 0, 255]);
        texture.write_pixels(&[9, 9, 9, 9]).unwrap();
        assert!(texture.write_pixels(&[1, 2, 3]).is_err());

        let TextureSource::Image(image) = texture.source() else {
            panic!("expected image texture");
        };
        assert_eq!(&image.pixels()[..], &[9, 9, 9, 9]);
    }

    #[test]
    fn test_frame_buffer_texture() {
        let fb = Descriptor::new(FrameBuffer::new(64, 32));
        let texture = Texture::from_frame_buffer(&fb);
        assert_eq!(texture.size(), (64, 32));
        assert_eq!(texture.frame_buffer(), Some(&fb));
        assert!(texture.write_pixels(&[0; 4]).is_err());
    }

    #[test]
    fn test_from_bytes_rejects_garbage() {
        assert!(Texture::from_bytes(&[1, 2, 3, 4]).is_err());
    }
}
