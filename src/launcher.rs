//! Kernel launch protocol.
//!
//! A launch looks up the kernel, completes its binding layout if it was
//! waiting on globals, packs the argument slots into storage and uniform
//! bindings, fetches or builds the pipeline for the requested block shape,
//! then records a single compute pass. The diagnostics buffers are
//! snapshotted in the same submission and read back before returning, so a
//! launch is synchronous from the host's point of view.

use std::borrow::Cow;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::device::{Captured, GpuContext};
use crate::diagnostics::{DiagnosticsChannel, PrintfDescriptors};
use crate::error::{Result, RuntimeError};
use crate::globals::{GlobalRegistry, GlobalVariable};
use crate::history::{LaunchHistory, LaunchRecord, STATUS_ABORTED};
use crate::layout::{self, padded_uniform_size, BindingLayout, LayoutPlan, ResourceKind};
use crate::memory::{CopyDst, CopySrc, DeviceMemory, DevicePtr};
use crate::reflection::{
    global_key, initializer_name, ArgKind, KernelDescriptor, KernelId, KernelTable, ABORT_FLAG_GLOBAL,
};
use crate::status::HipError;
use crate::timing::{TimingInstrument, TimingReport};

/// Overridable constants every kernel entry point declares.
pub const WORKGROUP_X: &str = "_cuda_wgx";
pub const WORKGROUP_Y: &str = "_cuda_wgy";
pub const WORKGROUP_Z: &str = "_cuda_wgz";
/// Only declared by kernels using dynamic shared memory.
pub const SHARED_REPEAT: &str = "_cuda_shared";

/// One kernel launch as issued by host code.
#[derive(Debug, Clone, Copy)]
pub struct LaunchRequest<'a> {
    pub kernel: &'a str,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    /// Argument slots indexed by parameter ordinal.
    pub args: &'a [&'a [u8]],
    /// Dynamic shared memory in bytes.
    pub shared_mem: u64,
}

impl<'a> LaunchRequest<'a> {
    pub fn new(kernel: &'a str, grid: [u32; 3], block: [u32; 3], args: &'a [&'a [u8]]) -> Self {
        Self {
            kernel,
            grid,
            block,
            args,
            shared_mem: 0,
        }
    }

    pub fn with_shared_mem(mut self, bytes: u64) -> Self {
        self.shared_mem = bytes;
        self
    }
}

/// Element count of the dynamic shared array, never 0.
pub fn shared_repeat(shared_bytes: u64, elem_size: u32) -> u32 {
    if elem_size == 0 {
        return 1;
    }
    (shared_bytes / u64::from(elem_size)).clamp(1, u64::from(u32::MAX)) as u32
}

/// Pipeline-overridable constants for one block shape.
pub fn pipeline_constants(block: [u32; 3], shared: Option<u32>) -> Vec<(&'static str, f64)> {
    let mut constants = vec![
        (WORKGROUP_X, f64::from(block[0])),
        (WORKGROUP_Y, f64::from(block[1])),
        (WORKGROUP_Z, f64::from(block[2])),
    ];
    if let Some(repeat) = shared {
        constants.push((SHARED_REPEAT, f64::from(repeat)));
    }
    constants
}

/// Bind group indices used by one kernel's pipeline layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupAssignment {
    pub kernel: Option<u32>,
    pub printf: Option<u32>,
}

impl GroupAssignment {
    fn count(&self) -> u32 {
        self.kernel.max(self.printf).map_or(0, |g| g + 1)
    }
}

/// Place the kernel's own group and, for printing kernels, the printf ring.
pub fn assign_groups(kernel: &KernelDescriptor, layout: &BindingLayout, printf_group: u32) -> Result<GroupAssignment> {
    if !kernel.printf {
        return Ok(GroupAssignment {
            kernel: Some(0),
            printf: None,
        });
    }
    if printf_group == 0 {
        if !layout.is_empty() {
            return Err(RuntimeError::PrintfGroupConflict(kernel.name.clone()));
        }
        return Ok(GroupAssignment {
            kernel: None,
            printf: Some(0),
        });
    }
    Ok(GroupAssignment {
        kernel: Some(0),
        printf: Some(printf_group),
    })
}

/// Resources gathered from the argument slots of one launch.
#[derive(Default)]
struct Bindings {
    storage: Vec<(u32, Arc<wgpu::Buffer>)>,
    uniforms: BTreeMap<u32, Vec<u8>>,
    abort_flag: Option<Arc<wgpu::Buffer>>,
}

impl Bindings {
    fn storage(&self, binding: u32) -> Option<&wgpu::Buffer> {
        // First occurrence wins, like the layout.
        self.storage
            .iter()
            .find(|(b, _)| *b == binding)
            .map(|(_, buffer)| buffer.as_ref())
    }
}

/// Smallest slot a device pointer can be read from (a 32-bit handle).
const MIN_POINTER_SLOT: usize = 4;

fn marshal(
    kernel: &KernelDescriptor,
    layout: &BindingLayout,
    args: &[&[u8]],
    globals: &GlobalRegistry,
    memory: &DeviceMemory,
) -> Result<Bindings> {
    let mut bindings = Bindings {
        uniforms: layout
            .uniforms()
            .iter()
            .map(|(binding, size)| (binding, vec![0u8; padded_uniform_size(size) as usize]))
            .collect(),
        ..Default::default()
    };

    for arg in &kernel.args {
        if arg.is_global() {
            let var = globals
                .get(&arg.name)
                .ok_or_else(|| RuntimeError::UnregisteredGlobal(arg.name.clone()))?;
            let buffer = memory.resolve(var.ptr)?.clone();
            if arg.name == ABORT_FLAG_GLOBAL {
                bindings.abort_flag = Some(buffer.clone());
            }
            bindings.storage.push((arg.binding, buffer));
            continue;
        }

        let slot = args.get(arg.ordinal as usize).copied().unwrap_or(&[]);
        match arg.kind {
            ArgKind::Buffer => {
                if slot.len() < MIN_POINTER_SLOT {
                    return Err(RuntimeError::ArgumentTooShort {
                        kernel: kernel.name.clone(),
                        ordinal: arg.ordinal,
                        needed: MIN_POINTER_SLOT,
                        got: slot.len(),
                    });
                }
                let ptr = DevicePtr::read_slot(slot).ok_or_else(|| RuntimeError::NullPointer {
                    kernel: kernel.name.clone(),
                    ordinal: arg.ordinal,
                })?;
                bindings.storage.push((arg.binding, memory.resolve(ptr)?.clone()));
            }
            ArgKind::PodUniform => {
                let size = arg.size as usize;
                if slot.len() < size {
                    return Err(RuntimeError::ArgumentTooShort {
                        kernel: kernel.name.clone(),
                        ordinal: arg.ordinal,
                        needed: size,
                        got: slot.len(),
                    });
                }
                if let Some(data) = bindings.uniforms.get_mut(&arg.binding) {
                    let offset = arg.offset as usize;
                    data[offset..offset + size].copy_from_slice(&slot[..size]);
                }
            }
        }
    }
    Ok(bindings)
}

struct GpuLayout {
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline_layout: wgpu::PipelineLayout,
    groups: GroupAssignment,
}

struct KernelSlot {
    plan: LayoutPlan,
    gpu: Option<GpuLayout>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    kernel: KernelId,
    block: [u32; 3],
    shared: Option<u32>,
}

pub struct KernelLauncher {
    gpu: GpuContext,
    config: RuntimeConfig,
    module: wgpu::ShaderModule,
    kernels: KernelTable,
    slots: Vec<KernelSlot>,
    pipelines: HashMap<PipelineKey, wgpu::ComputePipeline>,
    empty_group: wgpu::BindGroupLayout,
    memory: DeviceMemory,
    globals: GlobalRegistry,
    diagnostics: DiagnosticsChannel,
    timing: Option<TimingInstrument>,
    history: LaunchHistory,
}

impl KernelLauncher {
    /// Load a compiled module: its reflection stream and WGSL source.
    pub fn new(gpu: GpuContext, config: RuntimeConfig, reflection: &str, wgsl: &str) -> Result<Self> {
        config.validate()?;
        let kernels = KernelTable::parse(reflection);

        let module = gpu
            .capture_validation(|device| {
                device.create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some("kernels"),
                    source: wgpu::ShaderSource::Wgsl(Cow::Borrowed(wgsl)),
                })
            })
            .into_result()?;

        let descriptors = PrintfDescriptors::parse(kernels.printf_blob());
        let diagnostics =
            DiagnosticsChannel::new(&gpu, config.printf_buffer_size, config.printf_group, descriptors);
        let timing = if config.enable_timing {
            TimingInstrument::new(&gpu, config.timing_capacity)
        } else {
            None
        };
        let empty_group = gpu
            .device()
            .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                label: Some("unused group"),
                entries: &[],
            });
        let slots = kernels
            .iter()
            .map(|(_, kernel)| KernelSlot {
                plan: layout::plan(kernel),
                gpu: None,
            })
            .collect();

        let mut launcher = Self {
            gpu,
            config,
            module,
            kernels,
            slots,
            pipelines: HashMap::new(),
            empty_group,
            memory: DeviceMemory::new(),
            globals: GlobalRegistry::default(),
            diagnostics,
            timing,
            history: LaunchHistory::default(),
        };

        // Layouts that do not wait on globals are built up front.
        let ready: Vec<KernelId> = launcher
            .kernels
            .iter()
            .filter(|(id, _)| !launcher.slots[id.index()].plan.is_deferred())
            .map(|(id, _)| id)
            .collect();
        for id in ready {
            if let Err(err) = launcher.ensure_layout(id) {
                warn!(kernel = %launcher.kernels.kernel(id).name, %err, "layout not built at load");
            }
        }
        info!(
            kernels = launcher.kernels.len(),
            timing = launcher.timing.is_some(),
            "module loaded"
        );
        Ok(launcher)
    }

    pub fn gpu(&self) -> &GpuContext {
        &self.gpu
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn kernels(&self) -> &KernelTable {
        &self.kernels
    }

    pub fn globals(&self) -> &GlobalRegistry {
        &self.globals
    }

    pub fn memory(&self) -> &DeviceMemory {
        &self.memory
    }

    pub fn history(&self) -> &LaunchHistory {
        &self.history
    }

    pub fn diagnostics(&self) -> &DiagnosticsChannel {
        &self.diagnostics
    }

    /// Whether `kernel`'s binding layout has been completed.
    pub fn layout_ready(&self, kernel: &str) -> bool {
        self.kernels
            .lookup(kernel)
            .is_some_and(|id| self.slots[id.index()].gpu.is_some())
    }

    pub fn malloc(&mut self, size: u64) -> Result<Option<DevicePtr>> {
        self.memory.malloc(&self.gpu, size)
    }

    pub fn free(&mut self, ptr: DevicePtr) -> Result<()> {
        self.memory.free(ptr)
    }

    pub fn memcpy(&mut self, dst: CopyDst<'_>, src: CopySrc<'_>, size: usize, kind: u32) -> Result<()> {
        self.memory.copy(&self.gpu, dst, src, size, kind)
    }

    /// Allocate and register global `name`, then run its initializer kernel
    /// once if the module has one.
    pub fn register_global(&mut self, name: &str, size: u64, constant: bool) -> Result<DevicePtr> {
        let ptr = self.memory.alloc_global(&self.gpu, &global_key(name), size)?;
        let replaced = self.globals.insert(GlobalVariable {
            name: name.to_string(),
            ptr,
            size,
            constant,
        });
        if let Some(previous) = replaced {
            self.memory.release(previous.ptr);
        }

        let init = initializer_name(name);
        if let Some(id) = self.kernels.lookup(&init) {
            let request = LaunchRequest::new(&init, [1, 1, 1], [1, 1, 1], &[]);
            let mut scratch = Vec::new();
            let status = self.launch_id(id, &request, &mut scratch)?;
            if !status.is_success() {
                return Err(RuntimeError::LaunchFailed { kernel: init, status });
            }
        }
        Ok(ptr)
    }

    /// Launch a kernel and wait for it. `printf_out` receives the used part
    /// of the printf ring, or a single zero word when nothing was printed.
    pub fn launch(&mut self, request: &LaunchRequest<'_>, printf_out: &mut Vec<u8>) -> HipError {
        let Some(id) = self.kernels.lookup(request.kernel) else {
            warn!(kernel = request.kernel, "launch of unknown kernel");
            return HipError::InvalidDeviceFunction;
        };
        match self.launch_id(id, request, printf_out) {
            Ok(status) => status,
            Err(err) => {
                warn!(kernel = request.kernel, %err, "launch failed");
                err.status()
            }
        }
    }

    fn ensure_layout(&mut self, id: KernelId) -> Result<()> {
        let slot = &mut self.slots[id.index()];
        if slot.gpu.is_some() {
            return Ok(());
        }
        let layout = match &slot.plan {
            LayoutPlan::Ready(layout) => layout.clone(),
            LayoutPlan::Deferred(partial) => partial.finalize(&self.globals)?,
        };
        let kernel = self.kernels.kernel(id);
        let groups = assign_groups(kernel, &layout, self.diagnostics.group())?;

        let device = self.gpu.device();
        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&kernel.name),
            entries: &layout.wgpu_entries(),
        });
        let group_layouts: Vec<&wgpu::BindGroupLayout> = (0..groups.count())
            .map(|index| {
                if groups.kernel == Some(index) {
                    &bind_group_layout
                } else if groups.printf == Some(index) {
                    self.diagnostics.bind_group_layout()
                } else {
                    &self.empty_group
                }
            })
            .collect();
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&kernel.name),
            bind_group_layouts: &group_layouts,
            push_constant_ranges: &[],
        });
        drop(group_layouts);

        debug!(kernel = %kernel.name, bindings = layout.entries().len(), "layout built");
        slot.plan = LayoutPlan::Ready(layout);
        slot.gpu = Some(GpuLayout {
            bind_group_layout,
            pipeline_layout,
            groups,
        });
        Ok(())
    }

    fn launch_id(&mut self, id: KernelId, request: &LaunchRequest<'_>, printf_out: &mut Vec<u8>) -> Result<HipError> {
        self.ensure_layout(id)?;

        let kernel = self.kernels.kernel(id);
        let slot = &self.slots[id.index()];
        let (LayoutPlan::Ready(layout), Some(gpu_layout)) = (&slot.plan, &slot.gpu) else {
            return Err(RuntimeError::UnregisteredGlobal(kernel.name.clone()));
        };
        let bindings = marshal(kernel, layout, request.args, &self.globals, &self.memory)?;
        let shared = kernel
            .uses_dynamic_shared_memory()
            .then(|| shared_repeat(request.shared_mem, kernel.dynamic_mem_elem_size));
        let key = PipelineKey {
            kernel: id,
            block: request.block,
            shared,
        };

        let gpu = &self.gpu;
        let module = &self.module;
        let diagnostics = &self.diagnostics;
        let pipelines = &mut self.pipelines;
        let timing = &mut self.timing;
        let history = &mut self.history;

        let Captured { value: (record, guard), diagnostic } = gpu.capture_validation(move |device| {
            let pipeline = pipelines.entry(key).or_insert_with(|| {
                let constants = pipeline_constants(request.block, shared);
                device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(&kernel.name),
                    layout: Some(&gpu_layout.pipeline_layout),
                    module,
                    entry_point: Some(&kernel.name),
                    compilation_options: wgpu::PipelineCompilationOptions {
                        constants: &constants,
                        zero_initialize_workgroup_memory: true,
                    },
                    cache: None,
                })
            });

            let uniform_buffers: Vec<(u32, wgpu::Buffer)> = bindings
                .uniforms
                .iter()
                .map(|(&binding, data)| {
                    let buffer = device.create_buffer(&wgpu::BufferDescriptor {
                        label: Some("pod arguments"),
                        size: data.len() as u64,
                        usage: wgpu::BufferUsages::UNIFORM,
                        mapped_at_creation: true,
                    });
                    buffer.slice(..).get_mapped_range_mut().copy_from_slice(data);
                    buffer.unmap();
                    (binding, buffer)
                })
                .collect();
            let entries: Vec<wgpu::BindGroupEntry<'_>> = layout
                .entries()
                .iter()
                .filter_map(|entry| {
                    let buffer = match entry.kind {
                        ResourceKind::Storage => bindings.storage(entry.binding),
                        ResourceKind::Uniform => uniform_buffers
                            .iter()
                            .find(|(b, _)| *b == entry.binding)
                            .map(|(_, buffer)| buffer),
                    }?;
                    Some(wgpu::BindGroupEntry {
                        binding: entry.binding,
                        resource: buffer.as_entire_binding(),
                    })
                })
                .collect();
            let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(&kernel.name),
                layout: &gpu_layout.bind_group_layout,
                entries: &entries,
            });

            let guard = diagnostics.open(gpu, kernel.printf, bindings.abort_flag.clone());
            let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some(&kernel.name),
            });

            let record = history.push(LaunchRecord {
                initializer: kernel.is_initializer(),
                ..LaunchRecord::new(&kernel.name, request.grid, request.block)
            });
            // Initializer runs stay untimed and keep the ring for host launches.
            let stamp = if kernel.is_initializer() {
                None
            } else {
                timing.as_mut().and_then(|t| t.reserve(record))
            };
            {
                let timestamp_writes = match (stamp, timing.as_ref()) {
                    (Some(_), Some(t)) => Some(t.pass_writes()),
                    _ => None,
                };
                let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                    label: Some(&kernel.name),
                    timestamp_writes,
                });
                pass.set_pipeline(pipeline);
                if let Some(group) = gpu_layout.groups.kernel {
                    pass.set_bind_group(group, &bind_group, &[]);
                }
                if let Some(group) = gpu_layout.groups.printf {
                    pass.set_bind_group(group, diagnostics.bind_group(), &[]);
                }
                let [x, y, z] = request.grid;
                pass.dispatch_workgroups(x, y, z);
            }
            if let (Some(stamp), Some(t)) = (stamp, timing.as_ref()) {
                t.encode_resolve(&mut encoder, stamp);
            }
            guard.encode(&mut encoder);
            gpu.queue().submit(Some(encoder.finish()));
            (record, guard)
        });

        let collected = guard.collect();
        let entry = self.history.get_mut(record);
        let collected = match collected {
            Ok(collected) => collected,
            Err(err) => {
                if let Some(entry) = entry {
                    entry.status = Some(err.to_string());
                }
                return Err(err);
            }
        };

        let mut status = HipError::Success;
        printf_out.clear();
        if collected.aborted {
            status = HipError::Assert;
            printf_out.extend_from_slice(&0u32.to_le_bytes());
        } else {
            match &collected.printf {
                Some(bytes) => printf_out.extend_from_slice(bytes),
                None => printf_out.extend_from_slice(&0u32.to_le_bytes()),
            }
        }

        if let Some(entry) = entry {
            if collected.aborted {
                entry.status = Some(STATUS_ABORTED.to_string());
            }
            if let Some(message) = &diagnostic {
                warn!(kernel = %entry.kernel, %message, "validation error during launch");
                entry.status.get_or_insert_with(|| message.clone());
            }
        }
        debug!(kernel = request.kernel, grid = ?request.grid, block = ?request.block, %status, "launch complete");
        Ok(status)
    }

    /// Wait for outstanding work and fill in launch durations.
    pub fn finish(&mut self) -> Result<TimingReport> {
        self.gpu.wait_idle()?;
        match &mut self.timing {
            Some(timing) => timing.finish(&self.gpu, &mut self.history),
            None => Ok(TimingReport::default()),
        }
    }
}
