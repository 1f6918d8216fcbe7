//! GPU timestamps around each dispatch.
//!
//! Every timed launch writes a begin/end pair into a two-entry query set,
//! resolves it into a 16-byte buffer and copies that into its own slot of a
//! read-back ring. Nothing is read until [`TimingInstrument::finish`], so the
//! per-launch cost is a few encoder commands.

use tracing::{debug, warn};

use crate::device::GpuContext;
use crate::error::Result;
use crate::history::{LaunchHistory, RecordIndex};

const SLOT_BYTES: u64 = 16;

/// Raw durations whose low 16 bits are all zero hint at a driver that
/// rounds timestamps, e.g. as a timing side-channel mitigation.
const QUANTIZATION_MASK: u64 = 0xFFFF;

/// Summary of one [`TimingInstrument::finish`] pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TimingReport {
    /// Launches that received a duration.
    pub timed: usize,
    pub quantized: bool,
}

/// Convert raw `(begin, end)` tick pairs to nanoseconds.
///
/// Returns the durations and whether the batch looks quantized.
pub fn durations(pairs: &[(u64, u64)], period_ns: f32) -> (Vec<u64>, bool) {
    let mut quantized = false;
    let out = pairs
        .iter()
        .map(|&(begin, end)| {
            let ticks = end.saturating_sub(begin);
            if ticks != 0 && ticks & QUANTIZATION_MASK == 0 {
                quantized = true;
            }
            (ticks as f64 * f64::from(period_ns)).round() as u64
        })
        .collect();
    (out, quantized)
}

/// Slot reserved for one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampSlot(u32);

pub struct TimingInstrument {
    query_set: wgpu::QuerySet,
    resolve: wgpu::Buffer,
    readback: wgpu::Buffer,
    capacity: u32,
    pending: Vec<(RecordIndex, TimestampSlot)>,
}

impl TimingInstrument {
    /// `None` when the device cannot write timestamps.
    pub fn new(gpu: &GpuContext, capacity: u32) -> Option<Self> {
        if !gpu.supports_timestamps() || capacity == 0 {
            debug!("timestamp queries unavailable, launches will not be timed");
            return None;
        }
        let device = gpu.device();
        let query_set = device.create_query_set(&wgpu::QuerySetDescriptor {
            label: Some("launch timestamps"),
            ty: wgpu::QueryType::Timestamp,
            count: 2,
        });
        let resolve = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp resolve"),
            size: SLOT_BYTES,
            usage: wgpu::BufferUsages::QUERY_RESOLVE | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let readback = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("timestamp readback"),
            size: SLOT_BYTES * u64::from(capacity),
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        Some(Self {
            query_set,
            resolve,
            readback,
            capacity,
            pending: Vec::new(),
        })
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Claim the next ring slot for `record`. `None` once the ring is full;
    /// later launches simply go untimed.
    pub fn reserve(&mut self, record: RecordIndex) -> Option<TimestampSlot> {
        let next = self.pending.len() as u32;
        if next >= self.capacity {
            return None;
        }
        let slot = TimestampSlot(next);
        self.pending.push((record, slot));
        Some(slot)
    }

    pub fn pass_writes(&self) -> wgpu::ComputePassTimestampWrites<'_> {
        wgpu::ComputePassTimestampWrites {
            query_set: &self.query_set,
            beginning_of_pass_write_index: Some(0),
            end_of_pass_write_index: Some(1),
        }
    }

    /// Resolve the pass timestamps into `slot`. Encode after the pass ends.
    pub fn encode_resolve(&self, encoder: &mut wgpu::CommandEncoder, slot: TimestampSlot) {
        encoder.resolve_query_set(&self.query_set, 0..2, &self.resolve, 0);
        encoder.copy_buffer_to_buffer(
            &self.resolve,
            0,
            &self.readback,
            u64::from(slot.0) * SLOT_BYTES,
            SLOT_BYTES,
        );
    }

    /// Read every pending slot back and fill in the matching records'
    /// durations. The ring is empty afterwards.
    pub fn finish(&mut self, gpu: &GpuContext, history: &mut LaunchHistory) -> Result<TimingReport> {
        if self.pending.is_empty() {
            return Ok(TimingReport::default());
        }
        gpu.map_read(&[&self.readback])?;
        let pairs: Vec<(u64, u64)> = {
            let mapped = self.readback.slice(..).get_mapped_range();
            self.pending
                .iter()
                .map(|(_, slot)| {
                    let base = (u64::from(slot.0) * SLOT_BYTES) as usize;
                    let begin: u64 = bytemuck::pod_read_unaligned(&mapped[base..base + 8]);
                    let end: u64 = bytemuck::pod_read_unaligned(&mapped[base + 8..base + 16]);
                    (begin, end)
                })
                .collect()
        };
        self.readback.unmap();

        let (nanos, quantized) = durations(&pairs, gpu.timestamp_period());
        for ((record, _), ns) in self.pending.drain(..).zip(nanos) {
            if let Some(record) = history.get_mut(record) {
                record.duration_ns = Some(ns);
            }
        }
        if quantized {
            warn!("GPU timestamps appear quantized, durations are coarse");
        }
        Ok(TimingReport {
            timed: pairs.len(),
            quantized,
        })
    }
}
