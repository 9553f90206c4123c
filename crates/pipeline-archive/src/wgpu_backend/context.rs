//! GPU device acquisition
//!
//! A [`GpuContext`] is created once per process and passed by reference to every
//! stage. Dropping it releases the device and queue.

use crate::error::{ArchiveError, Result};

/// Options controlling adapter selection
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Request a software/fallback adapter
    pub force_fallback_adapter: bool,
}

/// Device, queue and adapter information shared by all stages
#[derive(Debug)]
pub struct GpuContext {
    pub(crate) device: wgpu::Device,
    pub(crate) queue: wgpu::Queue,
    adapter_info: wgpu::AdapterInfo,
    /// Key identifying driver pipeline-cache blobs usable on this adapter
    pipeline_cache_key: Option<String>,
}

impl GpuContext {
    /// Acquires an adapter, device and queue
    pub fn new(options: &ContextOptions) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: options.force_fallback_adapter,
        }))
        .map_err(|e| ArchiveError::render("device", format!("no suitable GPU adapter: {e}")))?;

        // Driver pipeline caches are optional; only request them where supported
        let required_features = adapter.features() & wgpu::Features::PIPELINE_CACHE;

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("Pipeline Archive"),
            required_features,
            required_limits: wgpu::Limits::downlevel_defaults(),
            memory_hints: wgpu::MemoryHints::default(),
            trace: Default::default(),
        }))
        .map_err(|e| ArchiveError::render("device", format!("failed to create device: {e}")))?;

        let adapter_info = adapter.get_info();
        let pipeline_cache_key = if device.features().contains(wgpu::Features::PIPELINE_CACHE) {
            wgpu::util::pipeline_cache_key(&adapter_info)
        } else {
            None
        };

        tracing::info!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            device_type = ?adapter_info.device_type,
            driver = %adapter_info.driver,
            driver_info = %adapter_info.driver_info,
            pipeline_cache = pipeline_cache_key.is_some(),
            "acquired GPU device"
        );

        Ok(Self {
            device,
            queue,
            adapter_info,
            pipeline_cache_key,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    pub fn pipeline_cache_key(&self) -> Option<&str> {
        self.pipeline_cache_key.as_deref()
    }

    /// Runs `f` inside a validation error scope and returns the captured error, if any
    pub(crate) fn validation_scope<T>(&self, f: impl FnOnce(&wgpu::Device) -> T) -> (T, Option<wgpu::Error>) {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let error = pollster::block_on(self.device.pop_error_scope());
        (value, error)
    }
}
