//! Render target allocation and synchronous readback

use crate::descriptor::PixelFormat;

/// Texture usage flags for probe render targets
///
/// Rendered into, then copied out for readback
pub const TEXTURE_USAGE_TARGET: wgpu::TextureUsages = wgpu::TextureUsages::RENDER_ATTACHMENT.union(wgpu::TextureUsages::COPY_SRC);

/// Failure while mapping a readback buffer
#[derive(Debug, thiserror::Error)]
pub enum ReadbackError {
    #[error("device poll failed: {0}")]
    Poll(#[from] wgpu::PollError),
    #[error("map callback was dropped")]
    CallbackDropped,
    #[error("failed to map readback buffer: {0}")]
    Map(#[from] wgpu::BufferAsyncError),
}

/// Maps a probe pixel format to its wgpu texture format
pub fn texture_format(format: PixelFormat) -> wgpu::TextureFormat {
    match format {
        PixelFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
        PixelFormat::Bgra8Unorm => wgpu::TextureFormat::Bgra8Unorm,
        PixelFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
        PixelFormat::Bgra8UnormSrgb => wgpu::TextureFormat::Bgra8UnormSrgb,
    }
}

/// Row pitch of the readback buffer, padded to the copy alignment
pub fn padded_bytes_per_row(width: u32) -> u32 {
    (width * PixelFormat::BYTES_PER_PIXEL).next_multiple_of(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT)
}

/// Creates a 2D render target
pub fn create_render_target(device: &wgpu::Device, width: u32, height: u32, format: wgpu::TextureFormat) -> wgpu::Texture {
    device.create_texture(&wgpu::TextureDescriptor {
        label: Some("Probe Target"),
        size: wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        },
        mip_level_count: 1,
        sample_count: 1,
        dimension: wgpu::TextureDimension::D2,
        format,
        usage: TEXTURE_USAGE_TARGET,
        view_formats: &[],
    })
}

/// Creates a CPU-mappable buffer large enough for `texture`
pub fn create_readback_buffer(device: &wgpu::Device, texture: &wgpu::Texture) -> wgpu::Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("Probe Readback"),
        size: (padded_bytes_per_row(texture.width()) * texture.height()) as u64,
        usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
        mapped_at_creation: false,
    })
}

/// Records a copy of `texture` into `buffer`
pub fn encode_copy_to_buffer(encoder: &mut wgpu::CommandEncoder, texture: &wgpu::Texture, buffer: &wgpu::Buffer) {
    encoder.copy_texture_to_buffer(
        wgpu::TexelCopyTextureInfo {
            texture,
            mip_level: 0,
            origin: wgpu::Origin3d::ZERO,
            aspect: wgpu::TextureAspect::All,
        },
        wgpu::TexelCopyBufferInfo {
            buffer,
            layout: wgpu::TexelCopyBufferLayout {
                offset: 0,
                bytes_per_row: Some(padded_bytes_per_row(texture.width())),
                rows_per_image: Some(texture.height()),
            },
        },
        texture.size(),
    );
}

/// Maps `buffer`, blocks until the GPU is done, and returns tightly packed rows
pub fn read_buffer(device: &wgpu::Device, buffer: &wgpu::Buffer, width: u32, height: u32) -> Result<Vec<u8>, ReadbackError> {
    let buffer_slice = buffer.slice(..);
    let (sender, receiver) = futures_intrusive::channel::shared::oneshot_channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |v| {
        let _ = sender.send(v);
    });

    device.poll(wgpu::PollType::Wait)?;
    pollster::block_on(receiver.receive()).ok_or(ReadbackError::CallbackDropped)??;

    let row_bytes = (width * PixelFormat::BYTES_PER_PIXEL) as usize;
    let padded = padded_bytes_per_row(width) as usize;
    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    {
        let data = buffer_slice.get_mapped_range();
        for row in data.chunks(padded).take(height as usize) {
            pixels.extend_from_slice(&row[..row_bytes]);
        }
    }
    buffer.unmap();

    Ok(pixels)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padded_bytes_per_row() {
        assert_eq!(padded_bytes_per_row(4), wgpu::COPY_BYTES_PER_ROW_ALIGNMENT);
        assert_eq!(padded_bytes_per_row(64), 256);
        assert_eq!(padded_bytes_per_row(65), 512);
    }

    #[test]
    fn test_readback_error_messages() {
        assert_eq!(ReadbackError::CallbackDropped.to_string(), "map callback was dropped");
        assert!(ReadbackError::Map(wgpu::BufferAsyncError).to_string().starts_with("failed to map readback buffer"));
    }

    #[test]
    fn test_texture_format_mapping() {
        assert_eq!(texture_format(PixelFormat::Bgra8Unorm), wgpu::TextureFormat::Bgra8Unorm);
        assert_eq!(texture_format(PixelFormat::Rgba8UnormSrgb), wgpu::TextureFormat::Rgba8UnormSrgb);
    }
}
