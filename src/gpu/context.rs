//! Headless device acquisition for the compute backend.

use crate::error::SearchError;

/// An initialized device and queue, plus the limits the dispatcher has to
/// honor. Constructed once and handed to [`super::GpuSearcher`]; no
/// surface or window is involved.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_name: String,
    pub max_workgroups_per_dim: u32,
}

impl GpuContext {
    /// Acquire a high-performance adapter with no surface attached.
    pub fn new_headless() -> Result<Self, SearchError> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .ok()
        .ok_or(SearchError::NoAdapter)?;

        let info = adapter.get_info();
        let limits = adapter.limits();

        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("ringscan_device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: Default::default(),
            trace: Default::default(),
        }))
        .map_err(|err| SearchError::Device(err.to_string()))?;

        log::debug!("compute context on {}", info.name);
        Ok(GpuContext {
            device,
            queue,
            adapter_name: info.name,
            max_workgroups_per_dim: limits.max_compute_workgroups_per_dimension,
        })
    }
}
