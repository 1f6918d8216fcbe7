/// Kernel argument buffer.
///
/// A launch receives its arguments the way `hipLaunchKernel` does: one slot
/// per parameter, indexed by the parameter's ordinal. Each slot holds the raw
/// bytes of the value. Device pointers are stored as 8-byte handles.
use bytemuck::Pod;

use crate::memory::DevicePtr;

#[derive(Debug, Clone, Default)]
pub struct KernelParams {
    values: Vec<Vec<u8>>,
}

impl KernelParams {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device pointer parameter
    pub fn push_device_ptr(&mut self, ptr: DevicePtr) -> &mut Self {
        self.values.push(ptr.to_le_bytes().to_vec());
        self
    }

    /// Add a plain-old-data parameter (`i32`, `f32`, `[f32; 4]`, ...)
    pub fn push<T: Pod>(&mut self, value: T) -> &mut Self {
        self.values.push(bytemuck::bytes_of(&value).to_vec());
        self
    }

    /// Add a parameter from raw bytes, e.g. a packed struct.
    pub fn push_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.values.push(bytes.to_vec());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Slot view handed to the launcher. Borrows `self` for the launch.
    pub fn slots(&self) -> Vec<&[u8]> {
        self.values.iter().map(Vec::as_slice).collect()
    }
}
