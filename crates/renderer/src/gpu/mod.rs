//! Headless `wgpu` engine.
//!
//! - `context` owns the instance and device, applies launch hardening, and
//!   tracks device loss.
//! - `channels` materialises `iChannel0-3` textures and placeholders.
//! - `pipeline` links wrapped GLSL into render pipelines.
//! - `uniforms` mirrors the ShaderToy uniform block.
//! - `capture` owns the offscreen target and frame readback.

mod capture;
mod channels;
mod context;
mod pipeline;
mod uniforms;

use wgpu::util::DeviceExt;

use crate::program::{ProgramBuilder, PROBE_SHADER};
use crate::types::{FrameSample, LaunchFlags, ProgramRequest};
use crate::{RenderEngine, RenderError, RenderSession, RgbaImage};

use capture::RenderTarget;
use context::GpuContext;
use pipeline::{PipelineLayouts, ShaderProgram};
use uniforms::ShadertoyUniforms;

const PROBE_SIZE: u32 = 8;

/// Spawns one `wgpu` device per session.
#[derive(Debug, Clone, Default)]
pub struct GpuEngine {
    flags: LaunchFlags,
    builder: ProgramBuilder,
}

impl GpuEngine {
    pub fn new(flags: LaunchFlags) -> Self {
        Self {
            flags,
            builder: ProgramBuilder::new(),
        }
    }

    pub fn flags(&self) -> &LaunchFlags {
        &self.flags
    }
}

impl RenderEngine for GpuEngine {
    type Session = GpuSession;

    fn spawn(&self) -> Result<GpuSession, RenderError> {
        let context = GpuContext::new(&self.flags)?;
        let layouts = PipelineLayouts::new(&context.device, self.builder.vertex_source());
        let uniforms = ShadertoyUniforms::new(PROBE_SIZE, PROBE_SIZE);
        let uniform_buffer = context
            .device
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("shadertoy uniforms"),
                contents: bytemuck::bytes_of(&uniforms),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            });
        let uniform_bind_group = context
            .device
            .create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some("uniform bind group"),
                layout: &layouts.uniform_layout,
                entries: &[wgpu::BindGroupEntry {
                    binding: 0,
                    resource: uniform_buffer.as_entire_binding(),
                }],
            });
        let target = RenderTarget::new(&context.device, PROBE_SIZE, PROBE_SIZE);

        let mut session = GpuSession {
            context,
            builder: self.builder,
            layouts,
            uniforms,
            uniform_buffer,
            uniform_bind_group,
            target,
            program: None,
            has_frame: false,
            closed: false,
        };

        // Link and draw a known-good program once so a broken driver fails
        // here instead of on the first user job.
        session
            .load_program(&ProgramRequest::new(PROBE_SHADER, (PROBE_SIZE, PROBE_SIZE)))
            .and_then(|_| session.render_frame(FrameSample::first(1.0)))
            .map_err(|err| RenderError::Spawn(format!("probe program failed: {err}")))?;
        session.program = None;
        session.has_frame = false;

        tracing::debug!(
            adapter = %session.context.adapter_name,
            max_dimension = session.context.max_dimension,
            "rendering session ready"
        );
        Ok(session)
    }
}

pub struct GpuSession {
    context: GpuContext,
    builder: ProgramBuilder,
    layouts: PipelineLayouts,
    uniforms: ShadertoyUniforms,
    uniform_buffer: wgpu::Buffer,
    uniform_bind_group: wgpu::BindGroup,
    target: RenderTarget,
    program: Option<ShaderProgram>,
    has_frame: bool,
    closed: bool,
}

impl GpuSession {
    fn ensure_alive(&self) -> Result<(), RenderError> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(RenderError::SessionLost)
        }
    }
}

impl RenderSession for GpuSession {
    fn is_alive(&self) -> bool {
        !self.closed && !self.context.is_lost()
    }

    fn load_program(&mut self, request: &ProgramRequest) -> Result<(), RenderError> {
        self.ensure_alive()?;
        let (width, height) = request.resolution;
        let max = self.context.max_dimension;
        if width == 0 || height == 0 || width > max || height > max {
            return Err(RenderError::Viewport { width, height, max });
        }

        let fragment = self
            .builder
            .fragment(&request.source)
            .map_err(|err| RenderError::Link(err.to_string()))?;

        self.program = None;
        self.has_frame = false;
        if !self.target.matches(request.resolution) {
            self.target = RenderTarget::new(&self.context.device, width, height);
        }

        let channel_resources =
            channels::create_resources(&self.context.device, &self.context.queue, &request.channels);
        let layouts = &self.layouts;
        let (program, error) = self.context.scoped(|device| {
            ShaderProgram::link(device, layouts, fragment.source, &channel_resources)
        });
        if let Some(message) = error {
            return Err(RenderError::Link(message));
        }

        self.uniforms = ShadertoyUniforms::new(width, height);
        self.uniforms.set_mouse(request.pointer);
        for (index, resolution) in program.channel_resolutions.iter().enumerate() {
            self.uniforms.set_channel_resolution(index, *resolution);
        }
        self.program = Some(program);
        Ok(())
    }

    fn render_frame(&mut self, sample: FrameSample) -> Result<(), RenderError> {
        self.ensure_alive()?;
        let program = self.program.as_ref().ok_or(RenderError::NoProgram)?;

        self.uniforms.apply_sample(sample);
        self.context
            .queue
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(&self.uniforms));

        let target = &self.target;
        let uniform_bind_group = &self.uniform_bind_group;
        let queue = &self.context.queue;
        let ((), error) = self.context.scoped(|device| {
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("frame encoder"),
            });
            {
                let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
                    label: Some("shader pass"),
                    color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                        view: &target.view,
                        depth_slice: None,
                        resolve_target: None,
                        ops: wgpu::Operations {
                            load: wgpu::LoadOp::Clear(wgpu::Color::BLACK),
                            store: wgpu::StoreOp::Store,
                        },
                    })],
                    depth_stencil_attachment: None,
                    timestamp_writes: None,
                    occlusion_query_set: None,
                });
                pass.set_pipeline(&program.pipeline);
                pass.set_bind_group(0, uniform_bind_group, &[]);
                pass.set_bind_group(1, &program.channel_bind_group, &[]);
                pass.draw(0..3, 0..1);
            }
            queue.submit(std::iter::once(encoder.finish()));
        });
        if let Some(message) = error {
            return Err(RenderError::Frame {
                frame: sample.frame_index,
                message,
            });
        }
        self.context.wait_idle()?;
        self.has_frame = true;
        Ok(())
    }

    fn capture_frame(&mut self) -> Result<RgbaImage, RenderError> {
        self.ensure_alive()?;
        if !self.has_frame {
            return Err(RenderError::Capture("no frame has been rendered".into()));
        }
        let mut encoder =
            self.context
                .device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("capture encoder"),
                });
        self.target.encode_copy(&mut encoder);
        self.context.queue.submit(std::iter::once(encoder.finish()));
        self.target.read(&self.context.device)
    }

    fn close(&mut self) -> Result<(), RenderError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.program = None;
        self.context.destroy();
        Ok(())
    }
}

impl Drop for GpuSession {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to close rendering session");
        }
    }
}
