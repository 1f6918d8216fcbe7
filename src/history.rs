//! Append-only record of every launch, in submission order.

use serde::Serialize;

/// Status attached to a launch whose abort flag was raised.
pub const STATUS_ABORTED: &str = "aborted";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaunchRecord {
    pub kernel: String,
    pub grid: [u32; 3],
    pub block: [u32; 3],
    /// GPU execution time in nanoseconds, once timing has been read back.
    pub duration_ns: Option<u64>,
    /// Validation diagnostic or `"aborted"`.
    pub status: Option<String>,
    /// Launched by global registration rather than by host code.
    #[serde(skip)]
    pub initializer: bool,
}

impl LaunchRecord {
    pub fn new(kernel: &str, grid: [u32; 3], block: [u32; 3]) -> Self {
        Self {
            kernel: kernel.to_string(),
            grid,
            block,
            duration_ns: None,
            status: None,
            initializer: false,
        }
    }

    pub fn aborted(&self) -> bool {
        self.status.as_deref() == Some(STATUS_ABORTED)
    }
}

/// Position of a record in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordIndex(usize);

impl RecordIndex {
    pub fn get(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct LaunchHistory {
    records: Vec<LaunchRecord>,
}

impl LaunchHistory {
    pub fn push(&mut self, record: LaunchRecord) -> RecordIndex {
        self.records.push(record);
        RecordIndex(self.records.len() - 1)
    }

    /// Records can be annotated after submission but never removed or reordered.
    pub(crate) fn get_mut(&mut self, index: RecordIndex) -> Option<&mut LaunchRecord> {
        self.records.get_mut(index.0)
    }

    pub fn get(&self, index: RecordIndex) -> Option<&LaunchRecord> {
        self.records.get(index.0)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> &[LaunchRecord] {
        &self.records
    }

    /// Launches issued by host code, initializer runs excluded.
    pub fn host_launches(&self) -> impl Iterator<Item = &LaunchRecord> {
        self.records.iter().filter(|r| !r.initializer)
    }
}
