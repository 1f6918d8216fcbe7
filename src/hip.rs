//! Host-facing HIP entry points.
//!
//! Compiled host programs talk to the runtime through a handful of calls:
//! function and variable registration emitted by the compiler, the
//! `<<<grid, block>>>` call-configuration stack, `hipLaunchKernel`, and the
//! memory API. [`HipRuntime`] implements them on top of [`KernelLauncher`]
//! and renders device `printf` output to a host writer after each launch.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, warn};

use crate::error::{Result, RuntimeError};
use crate::launcher::{KernelLauncher, LaunchRequest};
use crate::memory::{CopyDst, CopySrc, DevicePtr};
use crate::status::{HipError, MemcpyKind};
use crate::timing::TimingReport;

/// Launch dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub fn to_array(self) -> [u32; 3] {
        [self.x, self.y, self.z]
    }
}

impl From<u32> for Dim3 {
    fn from(x: u32) -> Self {
        Self::new(x, 1, 1)
    }
}

impl From<(u32, u32, u32)> for Dim3 {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Self::new(x, y, z)
    }
}

/// Opaque identity of a host-side kernel stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFunction(pub u64);

/// One `<<<...>>>` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallConfig {
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem: u64,
}

pub struct HipRuntime<W: Write = io::Stdout> {
    launcher: KernelLauncher,
    functions: HashMap<HostFunction, String>,
    call_stack: Vec<CallConfig>,
    last_error: HipError,
    printf_buf: Vec<u8>,
    out: W,
    cancel: Arc<AtomicBool>,
}

impl HipRuntime<io::Stdout> {
    pub fn new(launcher: KernelLauncher) -> Self {
        Self::with_output(launcher, io::stdout())
    }
}

impl<W: Write> HipRuntime<W> {
    /// Render device `printf` output to `out` instead of stdout.
    pub fn with_output(launcher: KernelLauncher, out: W) -> Self {
        Self {
            launcher,
            functions: HashMap::new(),
            call_stack: Vec::new(),
            last_error: HipError::Success,
            printf_buf: Vec::new(),
            out,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancel flag with the owner of this runtime. Once it is set,
    /// every call fails without touching the device.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    fn live(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(RuntimeError::Cancelled);
        }
        Ok(())
    }

    pub fn launcher(&self) -> &KernelLauncher {
        &self.launcher
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    fn track(&mut self, status: HipError) -> HipError {
        if !status.is_success() {
            self.last_error = status;
        }
        status
    }

    fn track_result<T>(&mut self, result: Result<T>) -> std::result::Result<T, HipError> {
        result.map_err(|err| {
            warn!(%err, "HIP call failed");
            self.track(err.status())
        })
    }

    /// `hipGetLastError`: returns and resets the last failure.
    pub fn get_last_error(&mut self) -> HipError {
        std::mem::replace(&mut self.last_error, HipError::Success)
    }

    /// `hipPeekAtLastError`
    pub fn peek_at_last_error(&self) -> HipError {
        self.last_error
    }

    /// `__hipRegisterFunction`
    pub fn register_function(&mut self, host: HostFunction, device_name: &str) {
        self.functions.insert(host, device_name.to_string());
    }

    /// `__hipRegisterVar`: allocate the variable and run its initializer.
    pub fn register_var(&mut self, name: &str, size: u64, constant: bool) -> std::result::Result<DevicePtr, HipError> {
        let result = self
            .live()
            .and_then(|()| self.launcher.register_global(name, size, constant));
        self.track_result(result)
    }

    pub fn push_call_configuration(&mut self, grid: Dim3, block: Dim3, shared_mem: u64) -> HipError {
        if let Err(err) = self.live() {
            return self.track(err.status());
        }
        self.call_stack.push(CallConfig {
            grid,
            block,
            shared_mem,
        });
        HipError::Success
    }

    pub fn pop_call_configuration(&mut self) -> std::result::Result<CallConfig, HipError> {
        match self.call_stack.pop() {
            Some(config) => Ok(config),
            None => Err(self.track(HipError::Unknown)),
        }
    }

    /// `hipLaunchKernel` by host stub.
    ///
    /// A device-side abort is escalated to `Err(RuntimeError::DeviceAbort)`;
    /// host programs are not expected to continue past it.
    pub fn launch_kernel(
        &mut self,
        host: HostFunction,
        grid: Dim3,
        block: Dim3,
        args: &[&[u8]],
        shared_mem: u64,
    ) -> Result<HipError> {
        self.live()?;
        let Some(name) = self.functions.get(&host).cloned() else {
            return Ok(self.track(HipError::InvalidDeviceFunction));
        };
        self.launch_by_name(&name, grid, block, args, shared_mem)
    }

    /// Launch with the configuration pushed by the last `<<<...>>>`.
    pub fn launch_configured(&mut self, host: HostFunction, args: &[&[u8]]) -> Result<HipError> {
        self.live()?;
        match self.pop_call_configuration() {
            Ok(config) => self.launch_kernel(host, config.grid, config.block, args, config.shared_mem),
            Err(status) => Ok(status),
        }
    }

    pub fn launch_by_name(
        &mut self,
        kernel: &str,
        grid: Dim3,
        block: Dim3,
        args: &[&[u8]],
        shared_mem: u64,
    ) -> Result<HipError> {
        self.live()?;
        let request =
            LaunchRequest::new(kernel, grid.to_array(), block.to_array(), args).with_shared_mem(shared_mem);
        let status = self.launcher.launch(&request, &mut self.printf_buf);
        self.flush_printf()?;
        self.track(status);
        if status == HipError::Assert {
            error!(kernel, "device-side assertion failed");
            return Err(RuntimeError::DeviceAbort(kernel.to_string()));
        }
        Ok(status)
    }

    fn flush_printf(&mut self) -> Result<()> {
        let counter = self
            .printf_buf
            .get(..4)
            .map_or(0, |w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]));
        if counter == 0 {
            return Ok(());
        }
        match self.launcher.diagnostics().render(&self.printf_buf) {
            Ok(text) => {
                self.out.write_all(text.as_bytes())?;
                self.out.flush()?;
            }
            // Partial output is still useful; the launch itself succeeded.
            Err(err) => warn!(%err, "printf output dropped"),
        }
        Ok(())
    }

    /// `hipMalloc`. Zero bytes yields a null pointer.
    pub fn malloc(&mut self, size: u64) -> std::result::Result<Option<DevicePtr>, HipError> {
        let result = self.live().and_then(|()| self.launcher.malloc(size));
        self.track_result(result)
    }

    /// `hipFree`
    pub fn free(&mut self, ptr: DevicePtr) -> HipError {
        let result = self.live().and_then(|()| self.launcher.free(ptr));
        match self.track_result(result) {
            Ok(()) => HipError::Success,
            Err(status) => status,
        }
    }

    /// `hipMemcpy` with a raw copy kind.
    pub fn memcpy(&mut self, dst: CopyDst<'_>, src: CopySrc<'_>, size: usize, kind: u32) -> HipError {
        let result = self
            .live()
            .and_then(|()| self.launcher.memcpy(dst, src, size, kind));
        match self.track_result(result) {
            Ok(()) => HipError::Success,
            Err(status) => status,
        }
    }

    pub fn memcpy_htod(&mut self, dst: DevicePtr, src: &[u8]) -> HipError {
        self.memcpy(
            CopyDst::Device(dst),
            CopySrc::Host(src),
            src.len(),
            MemcpyKind::HostToDevice.raw(),
        )
    }

    pub fn memcpy_dtoh(&mut self, dst: &mut [u8], src: DevicePtr) -> HipError {
        let size = dst.len();
        self.memcpy(
            CopyDst::Host(dst),
            CopySrc::Device(src),
            size,
            MemcpyKind::DeviceToHost.raw(),
        )
    }

    /// `hipGetSymbolAddress`
    pub fn get_symbol_address(&mut self, symbol: &str) -> std::result::Result<DevicePtr, HipError> {
        if let Err(err) = self.live() {
            return Err(self.track(err.status()));
        }
        match self.launcher.globals().symbol(symbol) {
            Some(var) => Ok(var.ptr),
            None => Err(self.track(HipError::InvalidSymbol)),
        }
    }

    /// `hipMemcpyToSymbol`. Only offset 0 is supported.
    pub fn memcpy_to_symbol(&mut self, symbol: &str, src: &[u8], offset: u64, kind: u32) -> HipError {
        if offset != 0 {
            return self.track(HipError::InvalidValue);
        }
        match self.get_symbol_address(symbol) {
            Ok(ptr) => self.memcpy(CopyDst::Device(ptr), CopySrc::Host(src), src.len(), kind),
            Err(status) => status,
        }
    }

    /// `hipMemcpyFromSymbol`. Only offset 0 is supported.
    pub fn memcpy_from_symbol(&mut self, dst: &mut [u8], symbol: &str, offset: u64, kind: u32) -> HipError {
        if offset != 0 {
            return self.track(HipError::InvalidValue);
        }
        match self.get_symbol_address(symbol) {
            Ok(ptr) => {
                let size = dst.len();
                self.memcpy(CopyDst::Host(dst), CopySrc::Device(ptr), size, kind)
            }
            Err(status) => status,
        }
    }

    /// `hipDeviceSynchronize`
    pub fn device_synchronize(&mut self) -> HipError {
        let result = self.live().and_then(|()| self.launcher.gpu().wait_idle());
        match self.track_result(result) {
            Ok(()) => HipError::Success,
            Err(status) => status,
        }
    }

    /// Wait for the device and attach timing to the launch history.
    pub fn finish(&mut self) -> Result<TimingReport> {
        self.launcher.finish()
    }

    pub fn into_launcher(self) -> KernelLauncher {
        self.launcher
    }
}
