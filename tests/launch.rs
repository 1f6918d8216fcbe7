//! End-to-end launches. Every test returns early when no GPU adapter is
//! available.

mod common;

use common::{download, launcher, launcher_with, test_config, upload};
use hipgpu::{Dim3, HipError, HipRuntime, KernelParams, LaunchRequest, RuntimeError};

const ADD_REFLECTION: &str = "\
kernel_decl,addKernel,printf,0
kernel,addKernel,arg,a,argOrdinal,0,argKind,buffer,binding,0
kernel,addKernel,arg,b,argOrdinal,1,argKind,buffer,binding,1
kernel,addKernel,arg,n,argOrdinal,2,argKind,pod_ubo,binding,2,offset,0,argSize,4
";

const ADD_WGSL: &str = "
struct Params { n: u32 }
@group(0) @binding(0) var<storage, read_write> a: array<u32>;
@group(0) @binding(1) var<storage, read_write> b: array<u32>;
@group(0) @binding(2) var<uniform> params: Params;

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn addKernel(@builtin(global_invocation_id) id: vec3<u32>) {
    if (id.x < params.n) {
        a[id.x] = a[id.x] + b[id.x];
    }
}
";

#[test]
fn test_add_kernel_round_trip() {
    let Some(mut launcher) = launcher(ADD_REFLECTION, ADD_WGSL) else {
        return;
    };
    let a: Vec<u32> = (0..64).collect();
    let b: Vec<u32> = (0..64).map(|i| i * 2).collect();
    let pa = upload(&mut launcher, &a);
    let pb = upload(&mut launcher, &b);

    let mut params = KernelParams::new();
    params.push_device_ptr(pa).push_device_ptr(pb).push(64u32);
    let slots = params.slots();
    let mut printf = Vec::new();
    let status = launcher.launch(&LaunchRequest::new("addKernel", [2, 1, 1], [32, 1, 1], &slots), &mut printf);

    assert_eq!(status, HipError::Success);
    assert_eq!(printf, vec![0; 4], "non-printing kernel yields a zero word");
    let out = download(&mut launcher, pa, 64);
    assert!(out.iter().enumerate().all(|(i, &v)| v == 3 * i as u32));

    let history = launcher.history();
    assert_eq!(history.len(), 1);
    assert_eq!(history.records()[0].grid, [2, 1, 1]);
    assert_eq!(history.records()[0].block, [32, 1, 1]);
    assert_eq!(history.records()[0].status, None);
}

#[test]
fn test_unknown_kernel_appends_nothing() {
    let Some(mut launcher) = launcher(ADD_REFLECTION, ADD_WGSL) else {
        return;
    };
    let mut printf = Vec::new();
    let status = launcher.launch(&LaunchRequest::new("missing", [1, 1, 1], [1, 1, 1], &[]), &mut printf);
    assert_eq!(status, HipError::InvalidDeviceFunction);
    assert_eq!(status.code(), 98);
    assert!(launcher.history().is_empty());
}

#[test]
fn test_bad_arguments_rejected_before_record() {
    let Some(mut launcher) = launcher(ADD_REFLECTION, ADD_WGSL) else {
        return;
    };
    let dangling = 0xdead_0000u64.to_le_bytes();
    let n = 1u32.to_le_bytes();
    let slots: [&[u8]; 3] = [&dangling, &dangling, &n];
    let mut printf = Vec::new();
    let status = launcher.launch(&LaunchRequest::new("addKernel", [1, 1, 1], [1, 1, 1], &slots), &mut printf);
    assert_eq!(status, HipError::InvalidValue);
    assert!(launcher.history().is_empty());
}

const PRINTF_REFLECTION: &str = "\
kernel_decl,hello,printf,1
printf,id,0,format,68656c6c6f2025750a,args,4
";

const PRINTF_WGSL: &str = "
@group(1) @binding(0) var<storage, read_write> printf_buffer: array<atomic<u32>>;

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn hello(@builtin(global_invocation_id) id: vec3<u32>) {
    let at = atomicAdd(&printf_buffer[0], 2u) + 1u;
    atomicStore(&printf_buffer[at], 0u);
    atomicStore(&printf_buffer[at + 1u], id.x);
}
";

#[test]
fn test_printf_ring_cleared_between_launches() {
    let Some(launcher) = launcher(PRINTF_REFLECTION, PRINTF_WGSL) else {
        return;
    };
    let mut hip = HipRuntime::with_output(launcher, Vec::new());

    let status = hip.launch_by_name("hello", Dim3::from(1), Dim3::from(1), &[], 0).unwrap();
    assert_eq!(status, HipError::Success);
    assert_eq!(String::from_utf8_lossy(hip.output()), "hello 0\n");

    // A stale counter would replay the first record.
    hip.launch_by_name("hello", Dim3::from(1), Dim3::from(1), &[], 0).unwrap();
    assert_eq!(String::from_utf8_lossy(hip.output()), "hello 0\nhello 0\n");

    let status = hip.launch_by_name("hello", Dim3::from(1), Dim3::from(4), &[], 0).unwrap();
    assert_eq!(status, HipError::Success);
    let text = String::from_utf8_lossy(hip.output()).into_owned();
    let mut tail: Vec<&str> = text.lines().skip(2).collect();
    tail.sort_unstable();
    assert_eq!(tail, vec!["hello 0", "hello 1", "hello 2", "hello 3"]);
}

const GLOBAL_REFLECTION: &str = "\
kernel_decl,_chip_var_init_counter,printf,0
kernel,_chip_var_init_counter,arg,_chip_var_counter,argOrdinal,0,argKind,buffer,binding,0
kernel_decl,myKernel,printf,0
kernel,myKernel,arg,out,argOrdinal,0,argKind,buffer,binding,0
kernel,myKernel,arg,_chip_var_counter,argOrdinal,1,argKind,buffer,binding,1
";

const GLOBAL_WGSL: &str = "
@group(0) @binding(0) var<storage, read_write> slot0: array<u32>;
@group(0) @binding(1) var<storage, read_write> slot1: array<u32>;

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn _chip_var_init_counter() {
    slot0[0] = 41u;
}

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn myKernel() {
    slot0[0] = slot1[0] + 1u;
}
";

#[test]
fn test_global_completes_deferred_layout() {
    let Some(mut launcher) = launcher(GLOBAL_REFLECTION, GLOBAL_WGSL) else {
        return;
    };
    let out = upload(&mut launcher, &[0]);
    let out_slot = out.to_le_bytes();
    let slots: [&[u8]; 1] = [&out_slot];
    let request = LaunchRequest::new("myKernel", [1, 1, 1], [1, 1, 1], &slots);
    let mut printf = Vec::new();

    assert!(!launcher.layout_ready("myKernel"));
    assert_eq!(launcher.launch(&request, &mut printf), HipError::InvalidSymbol);
    assert!(launcher.history().is_empty(), "no record for a rejected launch");

    launcher.register_global("counter", 4, false).unwrap();
    assert_eq!(launcher.history().len(), 1, "initializer ran once");
    assert!(launcher.history().records()[0].initializer);

    assert_eq!(launcher.launch(&request, &mut printf), HipError::Success);
    assert!(launcher.layout_ready("myKernel"));
    assert_eq!(download(&mut launcher, out, 1), vec![42]);
    assert_eq!(launcher.history().host_launches().count(), 1);
}

#[test]
fn test_initializer_leaves_timing_ring_to_host_launches() {
    let config = hipgpu::RuntimeConfig {
        timing_capacity: 1,
        ..test_config()
    };
    let Some(mut launcher) = launcher_with(config, GLOBAL_REFLECTION, GLOBAL_WGSL) else {
        return;
    };
    launcher.register_global("counter", 4, false).unwrap();
    let out = upload(&mut launcher, &[0]);
    let out_slot = out.to_le_bytes();
    let slots: [&[u8]; 1] = [&out_slot];
    let mut printf = Vec::new();
    let request = LaunchRequest::new("myKernel", [1, 1, 1], [1, 1, 1], &slots);
    assert_eq!(launcher.launch(&request, &mut printf), HipError::Success);

    let report = launcher.finish().unwrap();
    let records = launcher.history().records();
    assert!(records[0].initializer);
    assert_eq!(records[0].duration_ns, None, "initializer runs are not timed");
    if launcher.gpu().supports_timestamps() {
        assert_eq!(report.timed, 1);
        assert!(records[1].duration_ns.is_some(), "the only slot went to the host launch");
    }
}

const SHARED_REFLECTION: &str = "\
kernel_decl,sharedKernel,printf,0
kernel,sharedKernel,arg,out,argOrdinal,0,argKind,buffer,binding,0
kernel,sharedKernel,arg,smem,argOrdinal,1,argKind,local,arrayElemSize,4
";

const SHARED_WGSL: &str = "
override _cuda_shared: u32 = 1u;
@group(0) @binding(0) var<storage, read_write> out: array<u32>;

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn sharedKernel() {
    out[0] = _cuda_shared;
}
";

#[test]
fn test_dynamic_shared_memory_specialization() {
    let Some(mut launcher) = launcher(SHARED_REFLECTION, SHARED_WGSL) else {
        return;
    };
    let out = upload(&mut launcher, &[0]);
    let out_slot = out.to_le_bytes();
    let slots: [&[u8]; 1] = [&out_slot];
    let mut printf = Vec::new();

    let request = LaunchRequest::new("sharedKernel", [1, 1, 1], [1, 1, 1], &slots).with_shared_mem(32);
    assert_eq!(launcher.launch(&request, &mut printf), HipError::Success);
    assert_eq!(download(&mut launcher, out, 1), vec![8]);

    // Different size, different pipeline.
    let request = request.with_shared_mem(64);
    assert_eq!(launcher.launch(&request, &mut printf), HipError::Success);
    assert_eq!(download(&mut launcher, out, 1), vec![16]);
}

const ABORT_REFLECTION: &str = "\
kernel_decl,boom,printf,0
kernel,boom,arg,fail,argOrdinal,0,argKind,pod_ubo,binding,1,offset,0,argSize,4
kernel,boom,arg,_chip_var___chipspv_abort_called,argOrdinal,1,argKind,buffer,binding,0
";

const ABORT_WGSL: &str = "
struct Params { fail: u32 }
@group(0) @binding(0) var<storage, read_write> abort_flag: array<u32>;
@group(0) @binding(1) var<uniform> params: Params;

@compute @workgroup_size(_cuda_wgx, _cuda_wgy, _cuda_wgz)
fn boom() {
    if (params.fail != 0u) {
        abort_flag[0] = 1u;
    }
}
";

#[test]
fn test_abort_flag_returns_assert() {
    let Some(mut launcher) = launcher(ABORT_REFLECTION, ABORT_WGSL) else {
        return;
    };
    launcher.register_global("__chipspv_abort_called", 4, false).unwrap();
    let mut printf = Vec::new();

    let fail = 1u32.to_le_bytes();
    let slots: [&[u8]; 1] = [&fail];
    let status = launcher.launch(&LaunchRequest::new("boom", [1, 1, 1], [1, 1, 1], &slots), &mut printf);
    assert_eq!(status, HipError::Assert);
    assert_eq!(status.code(), 710);
    assert!(launcher.history().records()[0].aborted());

    // The flag was lowered by the previous launch.
    let pass = 0u32.to_le_bytes();
    let slots: [&[u8]; 1] = [&pass];
    let status = launcher.launch(&LaunchRequest::new("boom", [1, 1, 1], [1, 1, 1], &slots), &mut printf);
    assert_eq!(status, HipError::Success);
    assert_eq!(launcher.history().records()[1].status, None);
}

#[test]
fn test_abort_escalates_through_hip_runtime() {
    let Some(launcher) = launcher(ABORT_REFLECTION, ABORT_WGSL) else {
        return;
    };
    let mut hip = HipRuntime::with_output(launcher, Vec::new());
    hip.register_var("__chipspv_abort_called", 4, false).unwrap();

    let fail = 1u32.to_le_bytes();
    let result = hip.launch_by_name("boom", Dim3::from(1), Dim3::from(1), &[&fail], 0);
    assert!(matches!(result, Err(RuntimeError::DeviceAbort(ref k)) if k == "boom"));
    assert_eq!(hip.peek_at_last_error(), HipError::Assert);
    assert_eq!(hip.get_last_error(), HipError::Assert);
    assert_eq!(hip.get_last_error(), HipError::Success);
}

#[test]
fn test_finish_fills_durations() {
    let Some(mut launcher) = launcher(ADD_REFLECTION, ADD_WGSL) else {
        return;
    };
    let pa = upload(&mut launcher, &[1, 2, 3, 4]);
    let pb = upload(&mut launcher, &[1, 1, 1, 1]);
    let mut params = KernelParams::new();
    params.push_device_ptr(pa).push_device_ptr(pb).push(4u32);
    let slots = params.slots();
    let mut printf = Vec::new();
    for _ in 0..3 {
        let request = LaunchRequest::new("addKernel", [1, 1, 1], [4, 1, 1], &slots);
        assert_eq!(launcher.launch(&request, &mut printf), HipError::Success);
    }

    let report = launcher.finish().unwrap();
    let timed = launcher.gpu().supports_timestamps();
    assert_eq!(report.timed, if timed { 3 } else { 0 });
    for record in launcher.history().records() {
        assert_eq!(record.duration_ns.is_some(), timed);
    }
    assert_eq!(download(&mut launcher, pa, 4), vec![4, 5, 6, 7]);
}

#[test]
fn test_memcpy_kind_validation() {
    let Some(launcher) = launcher(ADD_REFLECTION, ADD_WGSL) else {
        return;
    };
    let mut hip = HipRuntime::with_output(launcher, Vec::new());
    let ptr = hip.malloc(16).unwrap().unwrap();
    let data = [1u8; 16];

    let status = hip.memcpy(hipgpu::CopyDst::Device(ptr), hipgpu::CopySrc::Host(&data), 16, 7);
    assert_eq!(status.code(), 1, "unknown copy kind");

    // Kind says device-to-host but the endpoints are host-to-device.
    let status = hip.memcpy(hipgpu::CopyDst::Device(ptr), hipgpu::CopySrc::Host(&data), 16, 2);
    assert_eq!(status, HipError::InvalidValue);

    assert_eq!(hip.memcpy_htod(ptr, &data), HipError::Success);
    let mut back = [0u8; 16];
    assert_eq!(hip.memcpy_dtoh(&mut back, ptr), HipError::Success);
    assert_eq!(back, data);

    assert_eq!(hip.free(ptr), HipError::Success);
    assert_eq!(hip.free(ptr), HipError::InvalidValue, "double free");
    assert_eq!(hip.malloc(0), Ok(None));
}
