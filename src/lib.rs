//! # hipgpu - HIP-Style Kernel Launches on WebGPU
//!
//! hipgpu runs kernels written against the CUDA/HIP launch model on a
//! compute-dispatch GPU backend. The kernel compiler hands over two
//! artifacts: a WGSL shader module with one entry point per kernel, and a
//! line-oriented reflection stream describing each kernel's arguments. From
//! those the runtime rebuilds binding layouts, turns the pointer-indexed
//! argument buffer of each launch into bound GPU resources, and relays
//! device `printf` output, device-side aborts and execution timing back to
//! the host.
//!
//! ## Key Features
//!
//! - **Synchronous launches**: every launch waits for its diagnostics, so a
//!   host program sees an ordinary call returning a HIP status code
//! - **Lazy layouts**: kernels that touch `__device__` globals are completed
//!   on first launch, after the globals are registered
//! - **Pipeline cache**: one compute pipeline per kernel and block shape
//! - **Device printf**: a shared ring buffer rendered on the host with the
//!   format strings shipped in the reflection stream
//! - **Timing**: per-launch GPU timestamps when the adapter supports them
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hipgpu::{Dim3, GpuContext, HipRuntime, KernelLauncher, KernelParams, RuntimeConfig};
//!
//! # fn main() -> hipgpu::Result<()> {
//! let config = RuntimeConfig::default().with_env()?;
//! let gpu = GpuContext::new(&config)?;
//! let launcher = KernelLauncher::new(
//!     gpu,
//!     config,
//!     &std::fs::read_to_string("kernels.csv")?,
//!     &std::fs::read_to_string("kernels.wgsl")?,
//! )?;
//! let mut hip = HipRuntime::new(launcher);
//!
//! let out = hip.malloc(1024).ok().flatten().expect("allocation");
//! let mut params = KernelParams::new();
//! params.push_device_ptr(out).push(256u32);
//! let status = hip.launch_by_name("fill", Dim3::from(1), Dim3::from(256), &params.slots(), 0)?;
//! assert!(status.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//! reflection ──▶ KernelTable ──▶ layout::plan ──┐
//!                                               ▼
//! host program ──▶ HipRuntime ──▶ KernelLauncher ──▶ wgpu queue
//!                      ▲               │  ▲
//!                      │               ▼  │
//!                  printf text ◀── DiagnosticsChannel / TimingInstrument
//! ```

pub mod args;
pub mod config;
pub mod device;
pub mod diagnostics;
pub mod error;
pub mod globals;
pub mod hip;
pub mod history;
pub mod launcher;
pub mod layout;
pub mod memory;
pub mod reflection;
pub mod session;
pub mod status;
pub mod timing;

// Re-export key types
pub use args::KernelParams;
pub use config::RuntimeConfig;
pub use device::{Captured, GpuContext};
pub use error::{Result, RuntimeError};
pub use hip::{Dim3, HipRuntime, HostFunction};
pub use history::{LaunchHistory, LaunchRecord};
pub use launcher::{KernelLauncher, LaunchRequest};
pub use memory::{CopyDst, CopySrc, DevicePtr};
pub use reflection::{KernelDescriptor, KernelTable};
pub use session::{run_program, ModuleSource, RunInfo, RunOutcome};
pub use status::{HipError, MemcpyKind};
