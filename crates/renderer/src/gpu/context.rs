use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::types::LaunchFlags;
use crate::RenderError;

/// Headless device plus the liveness flag flipped by wgpu's loss callback.
pub(crate) struct GpuContext {
    _instance: wgpu::Instance,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub max_dimension: u32,
    pub adapter_name: String,
    lost: Arc<AtomicBool>,
}

impl GpuContext {
    pub(crate) fn new(flags: &LaunchFlags) -> Result<Self, RenderError> {
        let instance_flags = if flags.debug_layers {
            wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
        } else {
            wgpu::InstanceFlags::empty()
        };
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            flags: instance_flags,
            memory_budget_thresholds: wgpu::MemoryBudgetThresholds::default(),
            backend_options: wgpu::BackendOptions::default(),
        });

        let adapter = request_adapter(&instance, flags.software_rasterizer)?;
        let info = adapter.get_info();
        let limits = adapter.limits();
        tracing::debug!(
            name = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "selected GPU adapter"
        );

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("shaderbot device"),
            required_features: wgpu::Features::empty(),
            required_limits: limits.clone(),
            memory_hints: wgpu::MemoryHints::MemoryUsage,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|err| RenderError::Spawn(format!("failed to create GPU device: {err}")))?;

        let lost = Arc::new(AtomicBool::new(false));
        let lost_flag = Arc::clone(&lost);
        device.set_device_lost_callback(move |reason, message| {
            lost_flag.store(true, Ordering::SeqCst);
            tracing::warn!(?reason, %message, "GPU device lost");
        });
        device.on_uncaptured_error(Box::new(|error| {
            tracing::error!(%error, "uncaptured GPU error");
        }));

        Ok(Self {
            _instance: instance,
            device,
            queue,
            max_dimension: limits.max_texture_dimension_2d.min(flags.max_viewport),
            adapter_name: info.name,
            lost,
        })
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::SeqCst)
    }

    pub(crate) fn mark_lost(&self) {
        self.lost.store(true, Ordering::SeqCst);
    }

    /// Runs `op` inside a validation error scope and reports anything it raised.
    pub(crate) fn scoped<T>(&self, op: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<String>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = op(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error.map(|err| err.to_string()))
    }

    pub(crate) fn wait_idle(&self) -> Result<(), RenderError> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|err| {
                tracing::warn!(error = %err, "GPU poll failed; treating session as lost");
                self.mark_lost();
                RenderError::SessionLost
            })
    }

    pub(crate) fn destroy(&self) {
        self.device.destroy();
        self.mark_lost();
    }
}

fn request_adapter(
    instance: &wgpu::Instance,
    software: bool,
) -> Result<wgpu::Adapter, RenderError> {
    let options = |force_fallback_adapter| wgpu::RequestAdapterOptions {
        power_preference: wgpu::PowerPreference::LowPower,
        compatible_surface: None,
        force_fallback_adapter,
    };
    if software {
        match pollster::block_on(instance.request_adapter(&options(true))) {
            Ok(adapter) => return Ok(adapter),
            Err(err) => tracing::warn!(
                error = %err,
                "software rasterizer unavailable; falling back to hardware adapter"
            ),
        }
    }
    pollster::block_on(instance.request_adapter(&options(false)))
        .map_err(|err| RenderError::Spawn(format!("failed to find a suitable GPU adapter: {err}")))
}
