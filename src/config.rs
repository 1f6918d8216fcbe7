use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RuntimeError};

/// Size of the shared printf ring when nothing else is configured.
pub const DEFAULT_PRINTF_BUFFER_SIZE: u64 = 1 << 20;

/// Launch slots in the timestamp read-back ring.
pub const DEFAULT_TIMING_CAPACITY: u32 = 128;

/// Adapter selection, mirrors `wgpu::PowerPreference`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AdapterPreference {
    #[default]
    HighPerformance,
    LowPower,
    Fallback,
}

/// Runtime configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Capacity of the printf ring in bytes (first word is the length counter)
    pub printf_buffer_size: u64,

    /// Capture GPU timestamps around each dispatch when the adapter allows it
    pub enable_timing: bool,

    /// Number of launches whose timestamps fit in the read-back ring
    pub timing_capacity: u32,

    /// Bind group index the compiler assigned to the printf buffer
    pub printf_group: u32,

    pub adapter: AdapterPreference,

    /// Request every feature and limit the adapter exposes
    pub adapter_limits: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            printf_buffer_size: DEFAULT_PRINTF_BUFFER_SIZE,
            enable_timing: true,
            timing_capacity: DEFAULT_TIMING_CAPACITY,
            printf_group: 1,
            adapter: AdapterPreference::default(),
            adapter_limits: true,
        }
    }
}

impl RuntimeConfig {
    /// Load a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `HIPGPU_*` environment overrides on top of `self`.
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("HIPGPU_PRINTF_BUFFER_SIZE") {
            self.printf_buffer_size = value.trim().parse().map_err(|_| {
                RuntimeError::Config(format!("HIPGPU_PRINTF_BUFFER_SIZE: invalid value '{value}'"))
            })?;
        }
        if let Some(value) = lookup("HIPGPU_TIMING_CAPACITY") {
            self.timing_capacity = value.trim().parse().map_err(|_| {
                RuntimeError::Config(format!("HIPGPU_TIMING_CAPACITY: invalid value '{value}'"))
            })?;
        }
        if lookup("HIPGPU_DISABLE_TIMING").is_some_and(|v| v != "0") {
            self.enable_timing = false;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.printf_buffer_size < 8 || self.printf_buffer_size % 4 != 0 {
            return Err(RuntimeError::Config(format!(
                "printf_buffer_size must be a multiple of 4 and at least 8, got {}",
                self.printf_buffer_size
            )));
        }
        if self.enable_timing && self.timing_capacity == 0 {
            return Err(RuntimeError::Config(
                "timing_capacity must be nonzero when timing is enabled".into(),
            ));
        }
        Ok(())
    }
}
