//! HIP status codes and memory copy kinds.
//!
//! The numeric values are part of the host ABI: compiled host programs compare
//! against them directly, so they must match the HIP headers exactly.

use std::fmt;

/// Status code returned by every runtime entry point.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HipError {
    Success = 0,
    InvalidValue = 1,
    OutOfMemory = 2,
    InvalidSymbol = 13,
    InvalidDeviceFunction = 98,
    Assert = 710,
    Unknown = 999,
}

impl HipError {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn is_success(self) -> bool {
        self == HipError::Success
    }

    /// Name as spelled in the HIP headers.
    pub fn name(self) -> &'static str {
        match self {
            HipError::Success => "hipSuccess",
            HipError::InvalidValue => "hipErrorInvalidValue",
            HipError::OutOfMemory => "hipErrorOutOfMemory",
            HipError::InvalidSymbol => "hipErrorInvalidSymbol",
            HipError::InvalidDeviceFunction => "hipErrorInvalidDeviceFunction",
            HipError::Assert => "hipErrorAssert",
            HipError::Unknown => "hipErrorUnknown",
        }
    }
}

impl fmt::Display for HipError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

impl From<HipError> for i32 {
    fn from(err: HipError) -> i32 {
        err.code()
    }
}

/// Direction of a `memcpy`, using the raw `hipMemcpyKind` numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemcpyKind {
    HostToHost,
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

impl MemcpyKind {
    /// Decode a raw kind. Anything outside 0..=3 is rejected; the caller reports
    /// it as a copy failure (status 1).
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(MemcpyKind::HostToHost),
            1 => Some(MemcpyKind::HostToDevice),
            2 => Some(MemcpyKind::DeviceToHost),
            3 => Some(MemcpyKind::DeviceToDevice),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            MemcpyKind::HostToHost => 0,
            MemcpyKind::HostToDevice => 1,
            MemcpyKind::DeviceToHost => 2,
            MemcpyKind::DeviceToDevice => 3,
        }
    }
}
