//! Device to host diagnostics: `printf` output and device-side aborts.
//!
//! Both travel through storage buffers the kernel writes into. After a launch
//! the runtime copies them into mappable staging buffers and clears the
//! device copies in the same submission, so every launch starts from an
//! empty ring and a lowered abort flag. [`ChannelGuard`] owns that
//! protocol for a single launch.

pub mod printf;

use std::sync::Arc;

use tracing::{debug, trace};

use crate::device::GpuContext;
use crate::error::Result;

pub use printf::{PrintfDescriptor, PrintfDescriptors};

const ABORT_FLAG_BYTES: u64 = 4;
const COUNTER_BYTES: u64 = 4;

pub struct DiagnosticsChannel {
    ring: wgpu::Buffer,
    staging: wgpu::Buffer,
    abort_staging: wgpu::Buffer,
    layout: wgpu::BindGroupLayout,
    bind_group: wgpu::BindGroup,
    group: u32,
    descriptors: PrintfDescriptors,
}

impl DiagnosticsChannel {
    pub fn new(gpu: &GpuContext, ring_size: u64, group: u32, descriptors: PrintfDescriptors) -> Self {
        let device = gpu.device();
        let ring = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("printf ring"),
            size: ring_size,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_SRC
                | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("printf staging"),
            size: ring_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let abort_staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("abort staging"),
            size: ABORT_FLAG_BYTES,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        gpu.queue().write_buffer(&ring, 0, &[0u8; COUNTER_BYTES as usize]);

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("printf"),
            entries: &[wgpu::BindGroupLayoutEntry {
                binding: 0,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            }],
        });
        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("printf"),
            layout: &layout,
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: ring.as_entire_binding(),
            }],
        });
        debug!(ring_size, group, descriptors = descriptors.len(), "diagnostics channel ready");

        Self {
            ring,
            staging,
            abort_staging,
            layout,
            bind_group,
            group,
            descriptors,
        }
    }

    /// Bind group index printing kernels expect the ring at.
    pub fn group(&self) -> u32 {
        self.group
    }

    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.layout
    }

    pub fn bind_group(&self) -> &wgpu::BindGroup {
        &self.bind_group
    }

    pub fn descriptors(&self) -> &PrintfDescriptors {
        &self.descriptors
    }

    pub fn ring_size(&self) -> u64 {
        self.ring.size()
    }

    /// Start the diagnostics protocol for one launch.
    pub fn open<'a>(
        &'a self,
        gpu: &'a GpuContext,
        printf: bool,
        abort_flag: Option<Arc<wgpu::Buffer>>,
    ) -> ChannelGuard<'a> {
        ChannelGuard {
            channel: self,
            gpu,
            printf,
            abort_flag,
            settled: false,
        }
    }

    /// Render a ring snapshot with this module's descriptors.
    pub fn render(&self, bytes: &[u8]) -> Result<String> {
        printf::render(bytes, &self.descriptors)
    }
}

/// What a launch left in the diagnostics buffers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Collected {
    /// The abort flag was raised.
    pub aborted: bool,
    /// Used part of the ring, counter word included. `None` for kernels that
    /// do not print.
    pub printf: Option<Vec<u8>>,
}

/// Per-launch handle on the diagnostics buffers.
///
/// Encode the copies and clears with [`ChannelGuard::encode`], submit, then
/// [`ChannelGuard::collect`]. A guard dropped before `collect` submits the
/// clears on its own so the next launch still starts clean.
pub struct ChannelGuard<'a> {
    channel: &'a DiagnosticsChannel,
    gpu: &'a GpuContext,
    printf: bool,
    abort_flag: Option<Arc<wgpu::Buffer>>,
    settled: bool,
}

impl ChannelGuard<'_> {
    pub fn prints(&self) -> bool {
        self.printf
    }

    pub fn watches_abort(&self) -> bool {
        self.abort_flag.is_some()
    }

    /// Snapshot and clear. Must be encoded after the dispatch.
    pub fn encode(&self, encoder: &mut wgpu::CommandEncoder) {
        let ch = self.channel;
        if self.printf {
            encoder.copy_buffer_to_buffer(&ch.ring, 0, &ch.staging, 0, ch.ring.size());
            encoder.clear_buffer(&ch.ring, 0, Some(COUNTER_BYTES));
        }
        if let Some(flag) = &self.abort_flag {
            encoder.copy_buffer_to_buffer(flag, 0, &ch.abort_staging, 0, ABORT_FLAG_BYTES);
            encoder.clear_buffer(flag, 0, Some(ABORT_FLAG_BYTES));
        }
    }

    /// Wait for the staging copies and read them. Call after submitting the
    /// encoder passed to [`ChannelGuard::encode`].
    pub fn collect(mut self) -> Result<Collected> {
        self.settled = true;
        let ch = self.channel;

        let mut pending: Vec<&wgpu::Buffer> = Vec::with_capacity(2);
        if self.printf {
            pending.push(&ch.staging);
        }
        if self.abort_flag.is_some() {
            pending.push(&ch.abort_staging);
        }
        if pending.is_empty() {
            return Ok(Collected::default());
        }
        self.gpu.map_read(&pending)?;

        let mut collected = Collected::default();
        if self.abort_flag.is_some() {
            {
                let mapped = ch.abort_staging.slice(..).get_mapped_range();
                collected.aborted = mapped.iter().any(|&b| b != 0);
            }
            ch.abort_staging.unmap();
        }
        if self.printf {
            {
                let mapped = ch.staging.slice(..).get_mapped_range();
                let used = printf::used_bytes(&mapped);
                collected.printf = Some(mapped[..used].to_vec());
            }
            ch.staging.unmap();
        }
        trace!(aborted = collected.aborted, "diagnostics collected");
        Ok(collected)
    }
}

impl Drop for ChannelGuard<'_> {
    fn drop(&mut self) {
        if self.settled || (!self.printf && self.abort_flag.is_none()) {
            return;
        }
        let mut encoder = self
            .gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("diagnostics reset"),
            });
        if self.printf {
            encoder.clear_buffer(&self.channel.ring, 0, Some(COUNTER_BYTES));
        }
        if let Some(flag) = &self.abort_flag {
            encoder.clear_buffer(flag, 0, Some(ABORT_FLAG_BYTES));
        }
        self.gpu.queue().submit(Some(encoder.finish()));
        debug!("diagnostics reset after unsettled launch");
    }
}
