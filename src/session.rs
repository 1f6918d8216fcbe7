//! Running a host program end to end.
//!
//! A program is a closure driving a [`HipRuntime`]. It runs on a blocking
//! worker so the async caller stays responsive, and it can be abandoned at
//! any point through a cancel signal: the caller gets control back at once and
//! the program's next HIP call fails with [`RuntimeError::Cancelled`].
//! Completed runs report the exit code and the launch history with durations
//! filled in.

use std::future::pending;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info};

use crate::config::RuntimeConfig;
use crate::device::GpuContext;
use crate::error::{Result, RuntimeError};
use crate::hip::HipRuntime;
use crate::history::LaunchRecord;
use crate::launcher::KernelLauncher;

/// Exit code of a program stopped by a device-side abort.
pub const ABORT_EXIT_CODE: i32 = 1;

/// Compiler output for one program.
#[derive(Debug, Clone)]
pub struct ModuleSource {
    pub reflection: String,
    pub wgsl: String,
}

impl ModuleSource {
    pub fn new(reflection: impl Into<String>, wgsl: impl Into<String>) -> Self {
        Self {
            reflection: reflection.into(),
            wgsl: wgsl.into(),
        }
    }

    pub fn from_files(reflection: impl AsRef<Path>, wgsl: impl AsRef<Path>) -> Result<Self> {
        Ok(Self {
            reflection: std::fs::read_to_string(reflection)?,
            wgsl: std::fs::read_to_string(wgsl)?,
        })
    }
}

/// What a completed run did on the device.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunInfo {
    /// Launches issued by the program, in order. Initializer runs are
    /// not reported.
    pub kernels: Vec<LaunchRecord>,
    /// Every kernel the module declares, initializers excluded.
    pub all_kernels: Vec<String>,
    /// Timestamps looked rounded by the driver.
    pub quantized_timing: bool,
}

#[derive(Debug)]
pub enum RunOutcome {
    Completed { exit_code: i32, info: RunInfo },
    Cancelled,
}

/// Sender half of a cancel signal; dropping it never cancels.
pub fn cancel_signal() -> (watch::Sender<bool>, watch::Receiver<bool>) {
    watch::channel(false)
}

async fn cancelled(mut signal: watch::Receiver<bool>) {
    if signal.wait_for(|&cancel| cancel).await.is_err() {
        pending::<()>().await;
    }
}

fn run_blocking<W, F>(
    config: RuntimeConfig,
    source: ModuleSource,
    output: W,
    cancel: Arc<AtomicBool>,
    program: F,
) -> Result<RunOutcome>
where
    W: Write,
    F: FnOnce(&mut HipRuntime<W>) -> Result<i32>,
{
    let gpu = GpuContext::new(&config)?;
    let launcher = KernelLauncher::new(gpu, config, &source.reflection, &source.wgsl)?;
    let mut hip = HipRuntime::with_output(launcher, output).with_cancel_flag(cancel);

    let exit_code = match program(&mut hip) {
        Ok(code) => code,
        Err(RuntimeError::DeviceAbort(kernel)) => {
            error!(%kernel, "program aborted by device assertion");
            ABORT_EXIT_CODE
        }
        Err(RuntimeError::Cancelled) => return Ok(RunOutcome::Cancelled),
        Err(err) => return Err(err),
    };

    let timing = hip.finish()?;
    let history = hip.launcher().history();
    let info = RunInfo {
        kernels: history.host_launches().cloned().collect(),
        all_kernels: hip.launcher().kernels().launchable().map(str::to_string).collect(),
        quantized_timing: timing.quantized,
    };
    info!(exit_code, launches = info.kernels.len(), "program finished");
    Ok(RunOutcome::Completed { exit_code, info })
}

/// Run `program` to completion or until `cancel` fires.
///
/// On cancellation the worker is abandoned without waiting for an in-flight
/// launch to settle. Its HIP calls fail from then on, so the program stops at
/// the next one; a program that never calls back into the runtime keeps its
/// blocking thread until it returns, and the owner of the tokio runtime
/// should shut it down with `shutdown_background`.
pub async fn run_program<W, F>(
    config: RuntimeConfig,
    source: ModuleSource,
    output: W,
    cancel: watch::Receiver<bool>,
    program: F,
) -> Result<RunOutcome>
where
    W: Write + Send + 'static,
    F: FnOnce(&mut HipRuntime<W>) -> Result<i32> + Send + 'static,
{
    let flag = Arc::new(AtomicBool::new(false));
    let worker_flag = Arc::clone(&flag);
    let worker =
        tokio::task::spawn_blocking(move || run_blocking(config, source, output, worker_flag, program));
    tokio::select! {
        joined = worker => joined.map_err(|e| RuntimeError::Worker(e.to_string()))?,
        _ = cancelled(cancel) => {
            flag.store(true, Ordering::SeqCst);
            info!("run cancelled");
            Ok(RunOutcome::Cancelled)
        }
    }
}
