#![allow(dead_code)]

use hipgpu::{CopyDst, CopySrc, DevicePtr, GpuContext, KernelLauncher, MemcpyKind, RuntimeConfig};

/// Overrides every kernel entry point declares.
pub const OVERRIDES: &str = "
override _cuda_wgx: u32 = 1u;
override _cuda_wgy: u32 = 1u;
override _cuda_wgz: u32 = 1u;
";

pub fn test_config() -> RuntimeConfig {
    RuntimeConfig {
        printf_buffer_size: 4096,
        timing_capacity: 16,
        ..Default::default()
    }
}

/// `None` when the machine has no usable adapter; the caller skips.
pub fn launcher(reflection: &str, wgsl_body: &str) -> Option<KernelLauncher> {
    launcher_with(test_config(), reflection, wgsl_body)
}

pub fn launcher_with(config: RuntimeConfig, reflection: &str, wgsl_body: &str) -> Option<KernelLauncher> {
    let gpu = match GpuContext::new(&config) {
        Ok(gpu) => gpu,
        Err(err) => {
            eprintln!("skipping GPU test: {err}");
            return None;
        }
    };
    let wgsl = format!("{OVERRIDES}\n{wgsl_body}");
    Some(KernelLauncher::new(gpu, config, reflection, &wgsl).expect("module must load"))
}

pub fn upload(launcher: &mut KernelLauncher, words: &[u32]) -> DevicePtr {
    let bytes: &[u8] = bytemuck::cast_slice(words);
    let ptr = launcher
        .malloc(bytes.len() as u64)
        .expect("malloc")
        .expect("non-null");
    launcher
        .memcpy(
            CopyDst::Device(ptr),
            CopySrc::Host(bytes),
            bytes.len(),
            MemcpyKind::HostToDevice.raw(),
        )
        .expect("upload");
    ptr
}

pub fn download(launcher: &mut KernelLauncher, ptr: DevicePtr, words: usize) -> Vec<u32> {
    let mut bytes = vec![0u8; words * 4];
    launcher
        .memcpy(
            CopyDst::Host(&mut bytes),
            CopySrc::Device(ptr),
            words * 4,
            MemcpyKind::DeviceToHost.raw(),
        )
        .expect("download");
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_le_bytes([w[0], w[1], w[2], w[3]]))
        .collect()
}
