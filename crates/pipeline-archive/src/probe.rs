//! Deterministic render probe
//!
//! The probe renders one fixed scene through a pipeline object and returns the
//! raw bytes of the color target. It exists only to observe a pipeline's output,
//! so the scene never varies between invocations.

use crate::backend::Backend;
use crate::descriptor::PixelFormat;
use crate::error::{ArchiveError, Result};

/// Primitive topology used by the probe scene
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeTopology {
    PointList,
}

/// The fixed scene rendered by [`render`]
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeScene {
    /// Target width in pixels
    pub width: u32,
    /// Target height in pixels
    pub height: u32,
    /// Clear color applied by the load action, RGBA in 0..=1
    pub clear_color: [f64; 4],
    /// Primitive topology of the single draw
    pub topology: ProbeTopology,
    /// Vertices issued by the single draw
    pub vertex_count: u32,
}

impl ProbeScene {
    /// One point vertex on a 4x4 target cleared to transparent black
    pub const FIXED: ProbeScene = ProbeScene {
        width: 4,
        height: 4,
        clear_color: [0.0, 0.0, 0.0, 0.0],
        topology: ProbeTopology::PointList,
        vertex_count: 1,
    };

    /// Size in bytes of a tightly packed target
    pub fn byte_len(&self) -> usize {
        (self.width * self.height * PixelFormat::BYTES_PER_PIXEL) as usize
    }
}

/// Byte count that does not fit a buffer's dimensions
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("expected {expected} bytes for a {width}x{height} buffer, got {actual}")]
pub struct BufferSizeError {
    pub width: u32,
    pub height: u32,
    pub expected: usize,
    pub actual: usize,
}

/// Raw pixel bytes read back from a probe target
///
/// Bytes are in the attachment's native channel order, rows tightly packed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    bytes: Vec<u8>,
}

impl PixelBuffer {
    /// Wraps tightly packed bytes, checking the length against the dimensions
    pub fn new(width: u32, height: u32, format: PixelFormat, bytes: Vec<u8>) -> Result<Self, BufferSizeError> {
        let expected = (width * height * PixelFormat::BYTES_PER_PIXEL) as usize;
        if bytes.len() != expected {
            return Err(BufferSizeError {
                width,
                height,
                expected,
                actual: bytes.len(),
            });
        }
        Ok(Self { width, height, format, bytes })
    }

    /// A buffer with every pixel set to `pixel`
    pub fn filled(width: u32, height: u32, format: PixelFormat, pixel: [u8; 4]) -> Self {
        let bytes = pixel.iter().copied().cycle().take((width * height * PixelFormat::BYTES_PER_PIXEL) as usize).collect();
        Self { width, height, format, bytes }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    /// Raw 4-byte pixel at (x, y), or None if out of bounds
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let offset = ((y * self.width + x) * PixelFormat::BYTES_PER_PIXEL) as usize;
        self.bytes[offset..offset + 4].try_into().ok()
    }

    /// Iterates pixels in row-major order
    pub fn pixels(&self) -> impl Iterator<Item = [u8; 4]> + '_ {
        self.bytes.chunks_exact(4).map(|chunk| [chunk[0], chunk[1], chunk[2], chunk[3]])
    }

    /// Bytes reordered to RGBA, for image encoders
    pub fn to_rgba(&self) -> Vec<u8> {
        if !self.format.is_bgra() {
            return self.bytes.clone();
        }
        self.pixels().flat_map(|[b, g, r, a]| [r, g, b, a]).collect()
    }
}

/// Renders [`ProbeScene::FIXED`] through `pipeline`
///
/// Any backend failure is fatal and returned as-is. A buffer whose size does not
/// match the scene is reported as a render error rather than passed on.
pub fn render<B: Backend>(pipeline: &B::Pipeline, backend: &B) -> Result<PixelBuffer> {
    let scene = ProbeScene::FIXED;
    let pixels = backend.submit_render(pipeline, &scene)?;

    if pixels.dimensions() != (scene.width, scene.height) {
        return Err(ArchiveError::render(
            backend.name(),
            format!("backend returned a {}x{} target for a {}x{} scene", pixels.width(), pixels.height(), scene.width, scene.height),
        ));
    }

    tracing::debug!(backend = backend.name(), bytes = pixels.as_bytes().len(), "render probe completed");
    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_rejects_wrong_length() {
        let err = PixelBuffer::new(4, 4, PixelFormat::Rgba8Unorm, vec![0; 63]).unwrap_err();
        assert_eq!(
            err,
            BufferSizeError {
                width: 4,
                height: 4,
                expected: 64,
                actual: 63,
            }
        );
        assert_eq!(err.to_string(), "expected 64 bytes for a 4x4 buffer, got 63");
        assert!(PixelBuffer::new(4, 4, PixelFormat::Rgba8Unorm, vec![0; 64]).is_ok());
    }

    #[test]
    fn test_pixel_access() {
        let mut bytes = vec![0u8; 64];
        bytes[((2 * 4 + 1) * 4) as usize..((2 * 4 + 1) * 4 + 4) as usize].copy_from_slice(&[1, 2, 3, 4]);
        let buffer = PixelBuffer::new(4, 4, PixelFormat::Rgba8Unorm, bytes).unwrap();

        assert_eq!(buffer.pixel(1, 2), Some([1, 2, 3, 4]));
        assert_eq!(buffer.pixel(0, 0), Some([0, 0, 0, 0]));
        assert_eq!(buffer.pixel(4, 0), None);
        assert_eq!(buffer.pixels().count(), 16);
    }

    #[test]
    fn test_to_rgba_swizzles_bgra() {
        let buffer = PixelBuffer::filled(2, 1, PixelFormat::Bgra8Unorm, [10, 20, 30, 255]);
        assert_eq!(buffer.to_rgba(), vec![30, 20, 10, 255, 30, 20, 10, 255]);

        let rgba = PixelBuffer::filled(1, 1, PixelFormat::Rgba8Unorm, [10, 20, 30, 255]);
        assert_eq!(rgba.to_rgba(), vec![10, 20, 30, 255]);
    }

    #[test]
    fn test_fixed_scene() {
        let scene = ProbeScene::FIXED;
        assert_eq!((scene.width, scene.height), (4, 4));
        assert_eq!(scene.vertex_count, 1);
        assert_eq!(scene.topology, ProbeTopology::PointList);
        assert_eq!(scene.byte_len(), 64);
    }
}
