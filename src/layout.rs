//! Binding layout derivation.
//!
//! Layouts are built in two phases. [`plan`] runs once per kernel when the
//! module is loaded. Kernels that touch no globals get a finished
//! [`BindingLayout`] right away; kernels that do get a [`PartialLayout`], which
//! is completed by [`PartialLayout::finalize`] on first launch, once the
//! registered globals are known.

use std::collections::BTreeMap;

use crate::error::{Result, RuntimeError};
use crate::globals::GlobalRegistry;
use crate::reflection::{ArgKind, KernelDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    /// Read-write storage buffer (device pointers and globals).
    Storage,
    /// Uniform buffer holding packed POD arguments.
    Uniform,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LayoutEntry {
    pub binding: u32,
    pub kind: ResourceKind,
}

impl LayoutEntry {
    pub fn to_wgpu(self) -> wgpu::BindGroupLayoutEntry {
        let ty = match self.kind {
            ResourceKind::Storage => wgpu::BufferBindingType::Storage { read_only: false },
            ResourceKind::Uniform => wgpu::BufferBindingType::Uniform,
        };
        wgpu::BindGroupLayoutEntry {
            binding: self.binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty,
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        }
    }
}

/// Uniform buffer sizes keyed by binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniformSizes(BTreeMap<u32, u64>);

impl UniformSizes {
    /// Grow `binding` so that `end` fits.
    pub fn accumulate(&mut self, binding: u32, end: u64) {
        let size = self.0.entry(binding).or_insert(0);
        *size = (*size).max(end);
    }

    pub fn get(&self, binding: u32) -> Option<u64> {
        self.0.get(&binding).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        self.0.iter().map(|(&b, &s)| (b, s))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Round a uniform size up to what a mapped uniform buffer accepts.
pub fn padded_uniform_size(size: u64) -> u64 {
    const ALIGN: u64 = 16;
    size.max(ALIGN).div_ceil(ALIGN) * ALIGN
}

/// A complete, immutable binding layout for one kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingLayout {
    entries: Vec<LayoutEntry>,
    uniforms: UniformSizes,
}

impl BindingLayout {
    pub fn entries(&self) -> &[LayoutEntry] {
        &self.entries
    }

    pub fn uniforms(&self) -> &UniformSizes {
        &self.uniforms
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn wgpu_entries(&self) -> Vec<wgpu::BindGroupLayoutEntry> {
        self.entries.iter().map(|e| e.to_wgpu()).collect()
    }
}

/// Layout of a kernel that references globals, waiting for registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialLayout {
    entries: Vec<LayoutEntry>,
    uniforms: UniformSizes,
    /// `(argument name, binding)` of every global the kernel touches.
    globals: Vec<(String, u32)>,
}

impl PartialLayout {
    pub fn globals(&self) -> impl Iterator<Item = (&str, u32)> {
        self.globals.iter().map(|(n, b)| (n.as_str(), *b))
    }

    pub fn uniforms(&self) -> &UniformSizes {
        &self.uniforms
    }

    /// Append one storage entry per referenced global. Fails while any of
    /// them is still unregistered; the partial layout is left untouched so a
    /// later launch can retry.
    pub fn finalize(&self, registry: &GlobalRegistry) -> Result<BindingLayout> {
        let mut entries = self.entries.clone();
        for (name, binding) in &self.globals {
            if !registry.contains(name) {
                return Err(RuntimeError::UnregisteredGlobal(name.clone()));
            }
            push_unique(
                &mut entries,
                LayoutEntry {
                    binding: *binding,
                    kind: ResourceKind::Storage,
                },
            );
        }
        Ok(BindingLayout {
            entries,
            uniforms: self.uniforms.clone(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutPlan {
    Ready(BindingLayout),
    Deferred(PartialLayout),
}

impl LayoutPlan {
    pub fn is_deferred(&self) -> bool {
        matches!(self, LayoutPlan::Deferred(_))
    }

    pub fn uniforms(&self) -> &UniformSizes {
        match self {
            LayoutPlan::Ready(layout) => layout.uniforms(),
            LayoutPlan::Deferred(partial) => partial.uniforms(),
        }
    }
}

fn push_unique(entries: &mut Vec<LayoutEntry>, entry: LayoutEntry) {
    if !entries.iter().any(|e| e.binding == entry.binding) {
        entries.push(entry);
    }
}

/// Derive the static layout of `kernel`.
pub fn plan(kernel: &KernelDescriptor) -> LayoutPlan {
    let initializer = kernel.is_initializer();
    let mut entries = Vec::new();
    let mut uniforms = UniformSizes::default();
    let mut globals = Vec::new();

    for arg in &kernel.args {
        if !initializer && arg.is_global() {
            globals.push((arg.name.clone(), arg.binding));
            continue;
        }
        let kind = match arg.kind {
            ArgKind::PodUniform => {
                uniforms.accumulate(arg.binding, arg.end());
                ResourceKind::Uniform
            }
            ArgKind::Buffer => ResourceKind::Storage,
        };
        push_unique(
            &mut entries,
            LayoutEntry {
                binding: arg.binding,
                kind,
            },
        );
    }

    if globals.is_empty() {
        LayoutPlan::Ready(BindingLayout { entries, uniforms })
    } else {
        LayoutPlan::Deferred(PartialLayout {
            entries,
            uniforms,
            globals,
        })
    }
}
