//! GPU device acquisition and the small helpers every module shares:
//! blocking buffer read-back and error-scope capture.

use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, error, info};
use wgpu::{Adapter, Device, Queue};

use crate::config::{AdapterPreference, RuntimeConfig};
use crate::error::{Result, RuntimeError};

/// Result of an operation run under a GPU error scope.
#[derive(Debug)]
pub struct Captured<T> {
    pub value: T,
    /// First error reported by the scope, if any.
    pub diagnostic: Option<String>,
}

impl<T> Captured<T> {
    pub fn is_clean(&self) -> bool {
        self.diagnostic.is_none()
    }

    pub fn into_result(self) -> Result<T> {
        match self.diagnostic {
            None => Ok(self.value),
            Some(message) => Err(RuntimeError::Validation(message)),
        }
    }
}

/// What the selected adapter is and what it allows.
#[derive(Debug, Clone)]
pub struct AdapterSummary {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub driver: String,
    pub timestamps: bool,
    pub max_workgroup_size: [u32; 3],
    pub max_storage_buffer_binding_size: u32,
}

/// Device and queue shared by the whole runtime.
pub struct GpuContext {
    device: Arc<Device>,
    queue: Arc<Queue>,
    summary: AdapterSummary,
}

fn request_options(preference: AdapterPreference) -> wgpu::RequestAdapterOptions<'static, 'static> {
    let (power_preference, force_fallback_adapter) = match preference {
        AdapterPreference::HighPerformance => (wgpu::PowerPreference::HighPerformance, false),
        AdapterPreference::LowPower => (wgpu::PowerPreference::LowPower, false),
        AdapterPreference::Fallback => (wgpu::PowerPreference::None, true),
    };
    wgpu::RequestAdapterOptions {
        power_preference,
        force_fallback_adapter,
        compatible_surface: None,
    }
}

/// Buffers to unmap after a partly failed `map_read`: every one whose map
/// succeeded, or none when all of them did.
fn mapped_to_release(outcomes: &[std::result::Result<(), String>]) -> Vec<usize> {
    if outcomes.iter().all(|o| o.is_ok()) {
        return Vec::new();
    }
    outcomes
        .iter()
        .enumerate()
        .filter(|(_, o)| o.is_ok())
        .map(|(i, _)| i)
        .collect()
}

impl GpuContext {
    /// Acquire an adapter and device according to `config`.
    pub async fn new_async(config: &RuntimeConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor::default());
        let adapter = instance
            .request_adapter(&request_options(config.adapter))
            .await
            .map_err(|e| RuntimeError::AdapterUnavailable(e.to_string()))?;
        Self::from_adapter(adapter, config).await
    }

    /// Blocking wrapper around [`GpuContext::new_async`].
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        pollster::block_on(Self::new_async(config))
    }

    async fn from_adapter(adapter: Adapter, config: &RuntimeConfig) -> Result<Self> {
        let info = adapter.get_info();
        info!(
            adapter = %info.name,
            backend = ?info.backend,
            device_type = ?info.device_type,
            "using GPU adapter"
        );

        let (required_features, required_limits) = if config.adapter_limits {
            (adapter.features(), adapter.limits())
        } else {
            let timestamps = adapter.features() & wgpu::Features::TIMESTAMP_QUERY;
            (timestamps, wgpu::Limits::default())
        };

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("hipgpu device"),
                required_features,
                required_limits,
                memory_hints: Default::default(),
                trace: Default::default(),
            })
            .await
            .map_err(|e| RuntimeError::DeviceRequest(e.to_string()))?;

        // Errors outside an error scope would otherwise panic inside wgpu.
        device.on_uncaptured_error(Box::new(|err| {
            error!(%err, "uncaptured GPU error");
        }));

        let limits = device.limits();
        let summary = AdapterSummary {
            name: info.name.clone(),
            backend: format!("{:?}", info.backend),
            device_type: format!("{:?}", info.device_type),
            driver: info.driver.clone(),
            timestamps: device.features().contains(wgpu::Features::TIMESTAMP_QUERY),
            max_workgroup_size: [
                limits.max_compute_workgroup_size_x,
                limits.max_compute_workgroup_size_y,
                limits.max_compute_workgroup_size_z,
            ],
            max_storage_buffer_binding_size: limits.max_storage_buffer_binding_size,
        };
        debug!(timestamps = summary.timestamps, "device ready");

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            summary,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn summary(&self) -> &AdapterSummary {
        &self.summary
    }

    pub fn supports_timestamps(&self) -> bool {
        self.summary.timestamps
    }

    /// Nanoseconds per timestamp tick.
    pub fn timestamp_period(&self) -> f32 {
        self.queue.get_timestamp_period()
    }

    /// Run `f` inside a validation error scope.
    pub fn capture_validation<T>(&self, f: impl FnOnce(&Device) -> T) -> Captured<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let diagnostic = pollster::block_on(self.device.pop_error_scope()).map(|e| e.to_string());
        Captured { value, diagnostic }
    }

    /// Like [`GpuContext::capture_validation`], also catching out-of-memory.
    pub fn capture_errors<T>(&self, f: impl FnOnce(&Device) -> T) -> Captured<T> {
        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f(&self.device);
        let validation = pollster::block_on(self.device.pop_error_scope());
        let oom = pollster::block_on(self.device.pop_error_scope());
        let diagnostic = validation.or(oom).map(|e| e.to_string());
        Captured { value, diagnostic }
    }

    /// Map every buffer in `buffers` for reading and wait for all of them
    /// with a single device poll. Callers read through
    /// `get_mapped_range` and must `unmap` afterwards.
    pub fn map_read(&self, buffers: &[&wgpu::Buffer]) -> Result<()> {
        let receivers: Vec<_> = buffers
            .iter()
            .map(|buffer| {
                let (tx, rx) = oneshot::channel();
                buffer.slice(..).map_async(wgpu::MapMode::Read, move |result| {
                    let _ = tx.send(result);
                });
                rx
            })
            .collect();

        if let Err(e) = self.device.poll(wgpu::PollType::Wait) {
            for buffer in buffers {
                buffer.unmap();
            }
            return Err(RuntimeError::MapFailed(e.to_string()));
        }

        let outcomes: Vec<std::result::Result<(), String>> = receivers
            .into_iter()
            .map(|rx| match pollster::block_on(rx) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err("map callback dropped".into()),
            })
            .collect();
        if let Some(message) = outcomes.iter().find_map(|o| o.as_ref().err()) {
            // Buffers left mapped would fail every later copy into them.
            for index in mapped_to_release(&outcomes) {
                buffers[index].unmap();
            }
            return Err(RuntimeError::MapFailed(message.clone()));
        }
        Ok(())
    }

    /// Wait for all submitted work.
    pub fn wait_idle(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| RuntimeError::MapFailed(e.to_string()))
    }
}
