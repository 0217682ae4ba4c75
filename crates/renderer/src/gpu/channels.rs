use std::path::Path;

use image::imageops::flip_vertical_in_place;
use image::GenericImageView;
use wgpu::util::{DeviceExt, TextureDataOrder};

use crate::types::{ChannelBindings, CHANNEL_COUNT};

const CHANNEL_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Rgba8Unorm;

pub(crate) struct ChannelResources {
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub resolution: [f32; 4],
}

/// Builds one resource per channel slot. Unbound or unreadable channels get a
/// 1x1 placeholder so the bind group layout never changes.
pub(crate) fn create_resources(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    bindings: &ChannelBindings,
) -> Vec<ChannelResources> {
    (0..CHANNEL_COUNT)
        .map(|index| match bindings.texture(index) {
            Some(path) => match load_texture_channel(device, queue, index, path) {
                Ok(resource) => resource,
                Err(error) => {
                    tracing::warn!(
                        channel = index,
                        path = %path.display(),
                        %error,
                        "failed to load texture channel; using placeholder"
                    );
                    create_placeholder_texture(device, queue, index)
                }
            },
            None => create_placeholder_texture(device, queue, index),
        })
        .collect()
}

fn create_placeholder_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    index: usize,
) -> ChannelResources {
    let data = [0u8, 0, 0, 255];
    let texture = upload_texture(
        device,
        queue,
        &format!("placeholder channel texture #{index}"),
        (1, 1),
        &data,
    );
    ChannelResources {
        view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
        sampler: linear_sampler(device),
        resolution: [1.0, 1.0, 1.0, 0.0],
    }
}

fn load_texture_channel(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    index: usize,
    path: &Path,
) -> Result<ChannelResources, image::ImageError> {
    let image = image::open(path)?;
    let (width, height) = image.dimensions();
    let mut rgba = image.to_rgba8();
    // ShaderToy samples with a bottom-left origin.
    flip_vertical_in_place(&mut rgba);

    let texture = upload_texture(
        device,
        queue,
        &format!("channel texture #{index}"),
        (width, height),
        &rgba,
    );
    Ok(ChannelResources {
        view: texture.create_view(&wgpu::TextureViewDescriptor::default()),
        sampler: linear_sampler(device),
        resolution: [width as f32, height as f32, 1.0, 0.0],
    })
}

fn upload_texture(
    device: &wgpu::Device,
    queue: &wgpu::Queue,
    label: &str,
    (width, height): (u32, u32),
    data: &[u8],
) -> wgpu::Texture {
    device.create_texture_with_data(
        queue,
        &wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: CHANNEL_FORMAT,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        },
        TextureDataOrder::LayerMajor,
        data,
    )
}

fn linear_sampler(device: &wgpu::Device) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        address_mode_u: wgpu::AddressMode::ClampToEdge,
        address_mode_v: wgpu::AddressMode::ClampToEdge,
        address_mode_w: wgpu::AddressMode::ClampToEdge,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Linear,
        ..Default::default()
    })
}
