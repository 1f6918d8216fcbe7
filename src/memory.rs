//! Device allocations addressed by opaque pointer-sized handles.
//!
//! Host code never sees a `wgpu::Buffer`; it sees a [`DevicePtr`], which is
//! what ends up in kernel argument slots and what `memcpy` accepts. The
//! [`DeviceMemory`] table resolves handles back to buffers.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU64;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::device::GpuContext;
use crate::error::{Result, RuntimeError};
use crate::status::MemcpyKind;

/// Handle of a device allocation as seen by host code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DevicePtr(NonZeroU64);

impl DevicePtr {
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(DevicePtr)
    }

    pub fn raw(self) -> u64 {
        self.0.get()
    }

    /// Decode a handle stored in an argument slot. Both 32-bit and 64-bit
    /// pointer widths are accepted; a null handle yields `None`.
    pub fn read_slot(slot: &[u8]) -> Option<Self> {
        let raw = match slot.len() {
            4..=7 => u64::from(u32::from_le_bytes(slot[..4].try_into().ok()?)),
            n if n >= 8 => u64::from_le_bytes(slot[..8].try_into().ok()?),
            _ => return None,
        };
        Self::from_raw(raw)
    }

    pub fn to_le_bytes(self) -> [u8; 8] {
        self.raw().to_le_bytes()
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.raw())
    }
}

/// Round a byte count up to the 4-byte granularity of buffer copies.
pub fn copy_aligned(size: u64) -> u64 {
    size.div_ceil(wgpu::COPY_BUFFER_ALIGNMENT) * wgpu::COPY_BUFFER_ALIGNMENT
}

struct Allocation {
    buffer: Arc<wgpu::Buffer>,
    /// Size requested by the host, before alignment.
    size: u64,
    /// Backs a registered global; not freeable by host code.
    pinned: bool,
}

/// Destination of a `memcpy`.
pub enum CopyDst<'a> {
    Host(&'a mut [u8]),
    Device(DevicePtr),
}

/// Source of a `memcpy`.
pub enum CopySrc<'a> {
    Host(&'a [u8]),
    Device(DevicePtr),
}

pub struct DeviceMemory {
    allocations: HashMap<DevicePtr, Allocation>,
    next_handle: u64,
}

impl Default for DeviceMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceMemory {
    pub fn new() -> Self {
        Self {
            allocations: HashMap::new(),
            // Low handles stay unused so stray small integers never resolve.
            next_handle: 0x1000,
        }
    }

    fn insert(&mut self, buffer: wgpu::Buffer, size: u64, pinned: bool) -> DevicePtr {
        let handle = DevicePtr::from_raw(self.next_handle).unwrap_or(DevicePtr(NonZeroU64::MIN));
        self.next_handle += copy_aligned(size.max(1)).max(0x100);
        self.allocations.insert(
            handle,
            Allocation {
                buffer: Arc::new(buffer),
                size,
                pinned,
            },
        );
        handle
    }

    fn create(gpu: &GpuContext, size: u64, label: Option<&str>) -> Result<wgpu::Buffer> {
        let captured = gpu.capture_errors(|device| {
            device.create_buffer(&wgpu::BufferDescriptor {
                label,
                size: copy_aligned(size),
                usage: wgpu::BufferUsages::STORAGE
                    | wgpu::BufferUsages::COPY_DST
                    | wgpu::BufferUsages::COPY_SRC,
                mapped_at_creation: false,
            })
        });
        match captured.diagnostic {
            None => Ok(captured.value),
            Some(message) => {
                warn!(size, %message, "device allocation failed");
                Err(RuntimeError::OutOfMemory(message))
            }
        }
    }

    /// Allocate `size` bytes. Zero-sized requests return a null handle.
    pub fn malloc(&mut self, gpu: &GpuContext, size: u64) -> Result<Option<DevicePtr>> {
        if size == 0 {
            return Ok(None);
        }
        let buffer = Self::create(gpu, size, Some("hip allocation"))?;
        let ptr = self.insert(buffer, size, false);
        debug!(%ptr, size, "malloc");
        Ok(Some(ptr))
    }

    /// Allocate the backing buffer of a global variable.
    pub fn alloc_global(&mut self, gpu: &GpuContext, name: &str, size: u64) -> Result<DevicePtr> {
        let buffer = Self::create(gpu, size.max(4), Some(name))?;
        Ok(self.insert(buffer, size, true))
    }

    pub fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        match self.allocations.get(&ptr) {
            Some(alloc) if !alloc.pinned => {
                if let Some(alloc) = self.allocations.remove(&ptr) {
                    alloc.buffer.destroy();
                }
                debug!(%ptr, "free");
                Ok(())
            }
            _ => Err(RuntimeError::InvalidDevicePtr(ptr)),
        }
    }

    /// Drop an allocation regardless of pinning. Used when a global is
    /// registered again under the same name.
    pub(crate) fn release(&mut self, ptr: DevicePtr) {
        if let Some(alloc) = self.allocations.remove(&ptr) {
            alloc.buffer.destroy();
        }
    }

    pub fn resolve(&self, ptr: DevicePtr) -> Result<&Arc<wgpu::Buffer>> {
        self.allocations
            .get(&ptr)
            .map(|a| &a.buffer)
            .ok_or(RuntimeError::InvalidDevicePtr(ptr))
    }

    pub fn size_of(&self, ptr: DevicePtr) -> Result<u64> {
        self.allocations
            .get(&ptr)
            .map(|a| a.size)
            .ok_or(RuntimeError::InvalidDevicePtr(ptr))
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }

    fn check_range(&self, ptr: DevicePtr, size: u64) -> Result<()> {
        let capacity = self.size_of(ptr)?;
        if size > capacity {
            return Err(RuntimeError::CopyOutOfRange { size, capacity });
        }
        Ok(())
    }

    /// `hipMemcpy`: dispatch on the raw copy kind. An unrecognized kind, or
    /// endpoints that do not match the kind, fail with
    /// [`RuntimeError::UnsupportedCopyKind`].
    pub fn copy(
        &mut self,
        gpu: &GpuContext,
        dst: CopyDst<'_>,
        src: CopySrc<'_>,
        size: usize,
        kind: u32,
    ) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let kind = MemcpyKind::from_raw(kind).ok_or(RuntimeError::UnsupportedCopyKind(kind))?;
        match (kind, dst, src) {
            (MemcpyKind::HostToHost, CopyDst::Host(dst), CopySrc::Host(src)) => {
                let n = size.min(dst.len()).min(src.len());
                dst[..n].copy_from_slice(&src[..n]);
                Ok(())
            }
            (MemcpyKind::HostToDevice, CopyDst::Device(dst), CopySrc::Host(src)) => {
                self.write(gpu, dst, &src[..size.min(src.len())])
            }
            (MemcpyKind::DeviceToHost, CopyDst::Host(dst), CopySrc::Device(src)) => {
                let n = size.min(dst.len());
                self.read(gpu, src, &mut dst[..n])
            }
            (MemcpyKind::DeviceToDevice, CopyDst::Device(dst), CopySrc::Device(src)) => {
                self.copy_device(gpu, dst, src, size as u64)
            }
            (kind, _, _) => Err(RuntimeError::UnsupportedCopyKind(kind.raw())),
        }
    }

    /// Host to device. The tail is zero-padded to the copy granularity.
    pub fn write(&self, gpu: &GpuContext, dst: DevicePtr, data: &[u8]) -> Result<()> {
        self.check_range(dst, data.len() as u64)?;
        let buffer = self.resolve(dst)?;
        let padded_len = copy_aligned(data.len() as u64) as usize;
        if padded_len == data.len() {
            gpu.queue().write_buffer(buffer, 0, data);
        } else {
            let mut padded = data.to_vec();
            padded.resize(padded_len, 0);
            gpu.queue().write_buffer(buffer, 0, &padded);
        }
        gpu.queue().submit(None);
        Ok(())
    }

    /// Device to host through a temporary staging buffer.
    pub fn read(&self, gpu: &GpuContext, src: DevicePtr, out: &mut [u8]) -> Result<()> {
        self.check_range(src, out.len() as u64)?;
        let buffer = self.resolve(src)?;
        let size = copy_aligned(out.len() as u64);
        let staging = gpu.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("hip readback"),
            size,
            usage: wgpu::BufferUsages::COPY_DST | wgpu::BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });
        let mut encoder = gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("hip readback"),
            });
        encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
        gpu.queue().submit(Some(encoder.finish()));

        gpu.map_read(&[&staging])?;
        {
            let mapped = staging.slice(..size).get_mapped_range();
            out.copy_from_slice(&mapped[..out.len()]);
        }
        staging.unmap();
        staging.destroy();
        Ok(())
    }

    pub fn copy_device(&self, gpu: &GpuContext, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        self.check_range(dst, size)?;
        self.check_range(src, size)?;
        let (dst, src) = (self.resolve(dst)?, self.resolve(src)?);
        let mut encoder = gpu
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("hip device copy"),
            });
        encoder.copy_buffer_to_buffer(src, 0, dst, 0, copy_aligned(size));
        gpu.queue().submit(Some(encoder.finish()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_slot_widths() {
        let wide = 0x1234_5678_9abc_u64.to_le_bytes();
        assert_eq!(DevicePtr::read_slot(&wide).map(DevicePtr::raw), Some(0x1234_5678_9abc));

        let narrow = 0x2000_u32.to_le_bytes();
        assert_eq!(DevicePtr::read_slot(&narrow).map(DevicePtr::raw), Some(0x2000));

        assert_eq!(DevicePtr::read_slot(&[0u8; 8]), None, "null handle");
        assert_eq!(DevicePtr::read_slot(&[1u8, 2]), None, "too short");
    }

    #[test]
    fn test_display_is_hex() {
        let ptr = DevicePtr::from_raw(0x1000).unwrap();
        assert_eq!(ptr.to_string(), "0x1000");
        assert_eq!(DevicePtr::read_slot(&ptr.to_le_bytes()), Some(ptr));
    }

    #[test]
    fn test_copy_aligned() {
        assert_eq!(copy_aligned(0), 0);
        assert_eq!(copy_aligned(1), 4);
        assert_eq!(copy_aligned(4), 4);
        assert_eq!(copy_aligned(13), 16);
    }
}
