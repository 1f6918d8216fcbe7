use thiserror::Error;

use crate::memory::DevicePtr;
use crate::status::HipError;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("No suitable GPU adapter found: {0}")]
    AdapterUnavailable(String),

    #[error("Failed to create device: {0}")]
    DeviceRequest(String),

    #[error("Unknown kernel '{0}'")]
    UnknownKernel(String),

    #[error("Out of device memory: {0}")]
    OutOfMemory(String),

    #[error("GPU validation error: {0}")]
    Validation(String),

    #[error("Device pointer {0} does not refer to a live allocation")]
    InvalidDevicePtr(DevicePtr),

    #[error("Global '{0}' has not been registered")]
    UnregisteredGlobal(String),

    #[error("Argument {ordinal} of kernel '{kernel}' needs {needed} bytes, got {got}")]
    ArgumentTooShort {
        kernel: String,
        ordinal: u32,
        needed: usize,
        got: usize,
    },

    #[error("Argument {ordinal} of kernel '{kernel}' is a null device pointer")]
    NullPointer { kernel: String, ordinal: u32 },

    #[error("Copy of {size} bytes out of range for a {capacity}-byte allocation")]
    CopyOutOfRange { size: u64, capacity: u64 },

    #[error("Unsupported memcpy kind {0}")]
    UnsupportedCopyKind(u32),

    #[error("Kernel '{0}' has bindings but the printf group is configured at index 0")]
    PrintfGroupConflict(String),

    #[error("Buffer map failed: {0}")]
    MapFailed(String),

    #[error("Printf buffer is malformed: {0}")]
    Printf(String),

    #[error("Device-side abort in kernel '{0}'")]
    DeviceAbort(String),

    #[error("Launch of '{kernel}' failed with {status}")]
    LaunchFailed { kernel: String, status: HipError },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime worker failed: {0}")]
    Worker(String),

    #[error("Program was cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RuntimeError {
    /// The status code a host program observes for this failure.
    pub fn status(&self) -> HipError {
        match self {
            RuntimeError::UnknownKernel(_) => HipError::InvalidDeviceFunction,
            RuntimeError::UnregisteredGlobal(_) => HipError::InvalidSymbol,
            RuntimeError::DeviceAbort(_) => HipError::Assert,
            RuntimeError::LaunchFailed { status, .. } => *status,
            RuntimeError::OutOfMemory(_) => HipError::OutOfMemory,
            RuntimeError::Validation(_) => HipError::Unknown,
            RuntimeError::InvalidDevicePtr(_)
            | RuntimeError::ArgumentTooShort { .. }
            | RuntimeError::NullPointer { .. }
            | RuntimeError::CopyOutOfRange { .. }
            | RuntimeError::UnsupportedCopyKind(_) => HipError::InvalidValue,
            RuntimeError::AdapterUnavailable(_) | RuntimeError::DeviceRequest(_) => {
                HipError::Unknown
            }
            RuntimeError::PrintfGroupConflict(_)
            | RuntimeError::MapFailed(_)
            | RuntimeError::Printf(_)
            | RuntimeError::Config(_)
            | RuntimeError::Worker(_)
            | RuntimeError::Cancelled
            | RuntimeError::Io(_)
            | RuntimeError::Json(_) => HipError::Unknown,
        }
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
