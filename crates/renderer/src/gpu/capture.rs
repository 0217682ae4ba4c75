use std::sync::mpsc;

use image::RgbaImage;

use crate::RenderError;

use super::pipeline::TARGET_FORMAT;

const BYTES_PER_PIXEL: u32 = 4;

/// Offscreen colour target plus the mappable buffer frames are copied into.
pub(crate) struct RenderTarget {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    readback: wgpu::Buffer,
    padded_bytes_per_row: u32,
    pub width: u32,
    pub height: u32,
}

impl RenderTarget {
    pub fn new(device: &wgpu::Device, width: u32, height: u32) -> Self {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("offscreen target"),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: TARGET_FORMAT,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let padded_bytes_per_row = padded_row_bytes(width);
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("frame readback"),
            size: u64::from(padded_bytes_per_row) * u64::from(height),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        Self {
            texture,
            view,
            readback,
            padded_bytes_per_row,
            width,
            height,
        }
    }

    pub fn matches(&self, (width, height): (u32, u32)) -> bool {
        self.width == width && self.height == height
    }

    pub fn encode_copy(&self, encoder: &mut wgpu::CommandEncoder) {
        encoder.copy_texture_to_buffer(
            wgpu::TexelCopyTextureInfo {
                texture: &self.texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::TexelCopyBufferInfo {
                buffer: &self.readback,
                layout: wgpu::TexelCopyBufferLayout {
                    offset: 0,
                    bytes_per_row: Some(self.padded_bytes_per_row),
                    rows_per_image: Some(self.height),
                },
            },
            wgpu::Extent3d {
                width: self.width,
                height: self.height,
                depth_or_array_layers: 1,
            },
        );
    }

    /// Maps the readback buffer, blocking until the GPU has finished the copy.
    pub fn read(&self, device: &wgpu::Device) -> Result<RgbaImage, RenderError> {
        let slice = self.readback.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        device
            .poll(wgpu::PollType::Wait)
            .map_err(|err| RenderError::Capture(format!("GPU poll failed: {err}")))?;
        rx.recv()
            .map_err(|_| RenderError::Capture("readback channel closed".into()))?
            .map_err(|err| RenderError::Capture(format!("readback map failed: {err}")))?;

        let row_bytes = (self.width * BYTES_PER_PIXEL) as usize;
        let mapped = slice.get_mapped_range();
        let pixels = unpad_rows(
            &mapped,
            row_bytes,
            self.padded_bytes_per_row as usize,
            self.height as usize,
        );
        drop(mapped);
        self.readback.unmap();

        RgbaImage::from_raw(self.width, self.height, pixels)
            .ok_or_else(|| RenderError::Capture("readback size does not match target".into()))
    }
}

fn padded_row_bytes(width: u32) -> u32 {
    let unpadded = width * BYTES_PER_PIXEL;
    let align = wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
    unpadded.div_ceil(align) * align
}

fn unpad_rows(mapped: &[u8], row_bytes: usize, padded: usize, rows: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(row_bytes * rows);
    for row in 0..rows {
        let start = row * padded;
        out.extend_from_slice(&mapped[start..start + row_bytes]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_pad_to_copy_alignment() {
        assert_eq!(padded_row_bytes(64), 256);
        assert_eq!(padded_row_bytes(65), 512);
        assert_eq!(padded_row_bytes(1), 256);
    }

    #[test]
    fn unpad_drops_row_padding() {
        let mut mapped = vec![0u8; 16];
        mapped[..4].copy_from_slice(&[1, 2, 3, 4]);
        mapped[8..12].copy_from_slice(&[5, 6, 7, 8]);
        assert_eq!(unpad_rows(&mapped, 4, 8, 2), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }
}
