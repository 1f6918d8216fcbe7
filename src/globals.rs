//! Registered device globals.
//!
//! Host code registers each `__device__` variable once, before launching
//! kernels that reference it. The registry maps the `_chip_var_`-prefixed key
//! used in reflection records to the allocation backing the variable. Running
//! the variable's initializer kernel is the launcher's job, see
//! [`crate::launcher::KernelLauncher::register_global`].

use std::collections::HashMap;

use tracing::debug;

use crate::memory::DevicePtr;
use crate::reflection::{global_key, GLOBAL_PREFIX};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalVariable {
    /// Host-visible name, without prefix.
    pub name: String,
    pub ptr: DevicePtr,
    pub size: u64,
    pub constant: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GlobalRegistry {
    vars: HashMap<String, GlobalVariable>,
}

impl GlobalRegistry {
    /// Record `var` under its prefixed key. Re-registering a name replaces
    /// the previous entry.
    pub fn insert(&mut self, var: GlobalVariable) -> Option<GlobalVariable> {
        let key = global_key(&var.name);
        debug!(%key, ptr = %var.ptr, size = var.size, constant = var.constant, "global registered");
        self.vars.insert(key, var)
    }

    /// Whether a global is registered under `key` (prefix included).
    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// Look up by prefixed key, as found in argument records.
    pub fn get(&self, key: &str) -> Option<&GlobalVariable> {
        self.vars.get(key)
    }

    /// Look up by host-visible symbol; the prefixed form is accepted too.
    pub fn symbol(&self, name: &str) -> Option<&GlobalVariable> {
        if name.starts_with(GLOBAL_PREFIX) {
            self.vars.get(name)
        } else {
            self.vars.get(&global_key(name))
        }
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &GlobalVariable> {
        self.vars.values()
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&mut self, name: &str, ptr: DevicePtr, size: u64, constant: bool) {
        self.insert(GlobalVariable {
            name: name.to_string(),
            ptr,
            size,
            constant,
        });
    }
}
