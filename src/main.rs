//! `hipgpu` command line: inspect reflection streams, probe the adapter and
//! launch single kernels against a compiled module.

use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};
use tracing::error;

use hipgpu::layout::{self, LayoutPlan};
use hipgpu::session::{cancel_signal, run_program, ModuleSource, RunOutcome};
use hipgpu::{Dim3, DevicePtr, GpuContext, HipRuntime, KernelParams, KernelTable, RuntimeConfig, RuntimeError};

#[derive(Parser, Debug)]
#[command(author, version, about = "HIP-style kernel launches on WebGPU")]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG takes precedence.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    /// JSON runtime configuration file.
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the kernels and binding layouts of a reflection stream.
    Inspect {
        #[arg(value_name = "REFLECTION")]
        reflection: PathBuf,
        /// Emit JSON instead of text.
        #[arg(long)]
        json: bool,
    },
    /// Print what the selected GPU adapter supports.
    Probe,
    /// Launch one kernel and dump its buffer arguments afterwards.
    Launch {
        #[arg(long, value_name = "FILE")]
        reflection: PathBuf,
        #[arg(long, value_name = "FILE")]
        wgsl: PathBuf,
        #[arg(long, value_name = "NAME")]
        kernel: String,
        /// Grid dimensions, `x[,y[,z]]`.
        #[arg(long, default_value = "1")]
        grid: String,
        /// Block dimensions, `x[,y[,z]]`.
        #[arg(long, default_value = "1")]
        block: String,
        /// Dynamic shared memory in bytes.
        #[arg(long, default_value_t = 0)]
        shared: u64,
        /// Kernel arguments in order: `buf:<bytes>`, `u32:<v>`, `i32:<v>`, `f32:<v>`.
        #[arg(long = "arg", value_name = "KIND:VALUE")]
        args: Vec<String>,
        /// Abandon the run after this many seconds.
        #[arg(long, value_name = "SECS")]
        timeout: Option<u64>,
    },
}

fn init_logging(verbose: u8) {
    use std::io::IsTerminal;
    use std::sync::OnceLock;
    use tracing_subscriber::{fmt, EnvFilter};

    static INITIALISED: OnceLock<()> = OnceLock::new();

    INITIALISED.get_or_init(|| {
        let directive = match verbose {
            0 => "hipgpu=info",
            1 => "hipgpu=debug",
            _ => "hipgpu=trace",
        };
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let subscriber = fmt::fmt()
            .with_env_filter(filter)
            .with_ansi(std::env::var_os("NO_COLOR").is_none() && std::io::stderr().is_terminal())
            .with_writer(std::io::stderr)
            .with_target(true)
            .compact()
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// One `--arg` value.
#[derive(Debug, Clone, PartialEq)]
enum HostArg {
    Buffer(u64),
    U32(u32),
    I32(i32),
    F32(f32),
}

fn parse_arg(raw: &str) -> Result<HostArg, String> {
    let (kind, value) = raw
        .split_once(':')
        .ok_or_else(|| format!("argument '{raw}' is not KIND:VALUE"))?;
    let bad = |e: &dyn std::fmt::Display| format!("argument '{raw}': {e}");
    match kind {
        "buf" => value.parse().map(HostArg::Buffer).map_err(|e| bad(&e)),
        "u32" => value.parse().map(HostArg::U32).map_err(|e| bad(&e)),
        "i32" => value.parse().map(HostArg::I32).map_err(|e| bad(&e)),
        "f32" => value.parse().map(HostArg::F32).map_err(|e| bad(&e)),
        other => Err(format!("unknown argument kind '{other}'")),
    }
}

fn parse_dim(raw: &str) -> Result<Dim3, String> {
    let parts = raw
        .split(',')
        .map(|p| p.trim().parse::<u32>().map_err(|e| format!("dimension '{raw}': {e}")))
        .collect::<Result<Vec<_>, _>>()?;
    match parts.as_slice() {
        [x] => Ok(Dim3::new(*x, 1, 1)),
        [x, y] => Ok(Dim3::new(*x, *y, 1)),
        [x, y, z] => Ok(Dim3::new(*x, *y, *z)),
        _ => Err(format!("dimension '{raw}' needs 1 to 3 components")),
    }
}

fn load_config(path: Option<&PathBuf>) -> hipgpu::Result<RuntimeConfig> {
    let config = match path {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.with_env()
}

fn inspect(reflection: &PathBuf, json: bool) -> hipgpu::Result<()> {
    let table = KernelTable::parse(&std::fs::read_to_string(reflection)?);
    let kernels: Vec<serde_json::Value> = table
        .iter()
        .map(|(_, kernel)| {
            let plan = layout::plan(kernel);
            serde_json::json!({
                "name": kernel.name,
                "printf": kernel.printf,
                "initializer": kernel.is_initializer(),
                "dynamic_shared_elem": kernel.dynamic_mem_elem_size,
                "deferred": plan.is_deferred(),
                "uniforms": plan.uniforms().iter().collect::<Vec<_>>(),
                "args": kernel.args.iter().map(|a| serde_json::json!({
                    "name": a.name,
                    "ordinal": a.ordinal,
                    "kind": format!("{:?}", a.kind),
                    "binding": a.binding,
                    "size": a.size,
                    "offset": a.offset,
                })).collect::<Vec<_>>(),
            })
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&kernels)?);
        return Ok(());
    }
    for (_, kernel) in table.iter() {
        let plan = layout::plan(kernel);
        let state = match &plan {
            LayoutPlan::Ready(layout) => format!("{} bindings", layout.entries().len()),
            LayoutPlan::Deferred(partial) => format!("deferred on {} globals", partial.globals().count()),
        };
        println!(
            "{}{} ({state})",
            kernel.name,
            if kernel.printf { " [printf]" } else { "" }
        );
        for arg in &kernel.args {
            println!(
                "  #{:<2} {:<24} {:?} binding={} size={} offset={}",
                arg.ordinal, arg.name, arg.kind, arg.binding, arg.size, arg.offset
            );
        }
    }
    Ok(())
}

fn probe(config: &RuntimeConfig) -> hipgpu::Result<()> {
    let gpu = GpuContext::new(config)?;
    let s = gpu.summary();
    println!("Adapter:   {} ({})", s.name, s.backend);
    println!("Type:      {}", s.device_type);
    println!("Driver:    {}", s.driver);
    println!("Timestamp: {}", if s.timestamps { "yes" } else { "no" });
    println!(
        "Workgroup: {}x{}x{} max",
        s.max_workgroup_size[0], s.max_workgroup_size[1], s.max_workgroup_size[2]
    );
    println!("Storage binding: {} bytes max", s.max_storage_buffer_binding_size);
    Ok(())
}

fn launch_program(
    hip: &mut HipRuntime<std::io::Stdout>,
    kernel: &str,
    grid: Dim3,
    block: Dim3,
    shared: u64,
    args: &[HostArg],
) -> hipgpu::Result<i32> {
    let mut params = KernelParams::new();
    let mut buffers: Vec<(usize, DevicePtr, u64)> = Vec::new();
    for (ordinal, arg) in args.iter().enumerate() {
        match *arg {
            HostArg::Buffer(size) => {
                let ptr = hip
                    .malloc(size)
                    .map_err(|status| RuntimeError::LaunchFailed { kernel: kernel.into(), status })?
                    .ok_or_else(|| RuntimeError::Config(format!("argument {ordinal}: zero-sized buffer")))?;
                params.push_device_ptr(ptr);
                buffers.push((ordinal, ptr, size));
            }
            HostArg::U32(v) => {
                params.push(v);
            }
            HostArg::I32(v) => {
                params.push(v);
            }
            HostArg::F32(v) => {
                params.push(v);
            }
        }
    }

    let status = hip.launch_by_name(kernel, grid, block, &params.slots(), shared)?;
    println!("{kernel}: {status}");

    for (ordinal, ptr, size) in buffers {
        let mut bytes = vec![0u8; size as usize];
        hip.memcpy_dtoh(&mut bytes, ptr);
        let words: Vec<String> = bytes
            .chunks(4)
            .take(16)
            .map(|w| {
                let mut word = [0u8; 4];
                word[..w.len()].copy_from_slice(w);
                format!("{:08x}", u32::from_le_bytes(word))
            })
            .collect();
        println!("  arg {ordinal} ({ptr}): {}", words.join(" "));
    }
    Ok(if status.is_success() { 0 } else { status.code() })
}

#[allow(clippy::too_many_arguments)]
fn launch(
    config: RuntimeConfig,
    reflection: PathBuf,
    wgsl: PathBuf,
    kernel: String,
    grid: &str,
    block: &str,
    shared: u64,
    raw_args: &[String],
    timeout: Option<u64>,
) -> Result<i32, String> {
    let grid = parse_dim(grid)?;
    let block = parse_dim(block)?;
    let args = raw_args.iter().map(|a| parse_arg(a)).collect::<Result<Vec<_>, _>>()?;
    let source = ModuleSource::from_files(&reflection, &wgsl).map_err(|e| e.to_string())?;

    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    let result = runtime.block_on(async move {
        let (cancel_tx, cancel_rx) = cancel_signal();
        if let Some(secs) = timeout {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(secs)).await;
                let _ = cancel_tx.send(true);
            });
        }
        let outcome = run_program(config, source, std::io::stdout(), cancel_rx, move |hip| {
            launch_program(hip, &kernel, grid, block, shared, &args)
        })
        .await
        .map_err(|e| e.to_string())?;

        match outcome {
            RunOutcome::Completed { exit_code, info } => {
                for record in &info.kernels {
                    let duration = record
                        .duration_ns
                        .map_or_else(|| "-".to_string(), |ns| format!("{:.3} ms", ns as f64 / 1e6));
                    println!(
                        "  {} grid={:?} block={:?} time={duration}{}",
                        record.kernel,
                        record.grid,
                        record.block,
                        record.status.as_deref().map(|s| format!(" status={s}")).unwrap_or_default()
                    );
                }
                if info.quantized_timing {
                    println!("  (timestamps are quantized by the driver)");
                }
                Ok(exit_code)
            }
            RunOutcome::Cancelled => Err("run timed out".to_string()),
        }
    });
    // A cancelled program may still hold its blocking thread.
    runtime.shutdown_background();
    result
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match load_config(cli.config.as_ref()) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("error[config]: {err}");
            process::exit(2);
        }
    };

    let code = match cli.command {
        Command::Inspect { reflection, json } => match inspect(&reflection, json) {
            Ok(()) => 0,
            Err(err) => {
                error!(%err, "inspect failed");
                1
            }
        },
        Command::Probe => match probe(&config) {
            Ok(()) => 0,
            Err(err) => {
                error!(%err, "probe failed");
                1
            }
        },
        Command::Launch {
            reflection,
            wgsl,
            kernel,
            grid,
            block,
            shared,
            args,
            timeout,
        } => match launch(config, reflection, wgsl, kernel, &grid, &block, shared, &args, timeout) {
            Ok(code) => code,
            Err(err) => {
                eprintln!("error[launch]: {err}");
                1
            }
        },
    };
    process::exit(code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_kinds() {
        assert_eq!(parse_arg("buf:1024"), Ok(HostArg::Buffer(1024)));
        assert_eq!(parse_arg("u32:7"), Ok(HostArg::U32(7)));
        assert_eq!(parse_arg("i32:-3"), Ok(HostArg::I32(-3)));
        assert_eq!(parse_arg("f32:1.5"), Ok(HostArg::F32(1.5)));
        assert!(parse_arg("u32:x").is_err());
        assert!(parse_arg("ptr:1").is_err());
        assert!(parse_arg("17").is_err());
    }

    #[test]
    fn test_parse_dim() {
        assert_eq!(parse_dim("64"), Ok(Dim3::new(64, 1, 1)));
        assert_eq!(parse_dim("8, 8"), Ok(Dim3::new(8, 8, 1)));
        assert_eq!(parse_dim("2,3,4"), Ok(Dim3::new(2, 3, 4)));
        assert!(parse_dim("1,2,3,4").is_err());
        assert!(parse_dim("").is_err());
    }

    #[test]
    fn test_cli_parses_launch() {
        let cli = Cli::try_parse_from([
            "hipgpu", "-v", "launch", "--reflection", "k.csv", "--wgsl", "k.wgsl", "--kernel", "fill",
            "--block", "256", "--arg", "buf:1024", "--arg", "u32:256",
        ])
        .unwrap();
        assert_eq!(cli.verbose, 1);
        match cli.command {
            Command::Launch { kernel, args, .. } => {
                assert_eq!(kernel, "fill");
                assert_eq!(args, vec!["buf:1024", "u32:256"]);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
