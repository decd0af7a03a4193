//! Session metadata shared between the transcoder and the handler
//!
//! The transcoder owns a [`TraceMeta`] and mutates it as bytes arrive; the
//! converter appends marks to it. Handlers only ever see snapshots.

use serde::{Deserialize, Serialize};

/// One loaded code/memory region of the traced process
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Module name (usually the image file name)
    pub name: String,

    /// Load address of the module
    pub base_address: u64,

    /// Size of the mapped region in bytes
    pub size_bytes: u64,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, base_address: u64, size_bytes: u64) -> Self {
        Self {
            name: name.into(),
            base_address,
            size_bytes,
        }
    }

    /// Check whether `address` falls inside this module
    pub fn contains(&self, address: u64) -> bool {
        address >= self.base_address && address - self.base_address < self.size_bytes
    }
}

/// A named point on the session's logical clock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMark {
    pub name: String,

    /// Logical clock value at insertion time
    pub timestamp: u64,
}

impl TraceMark {
    pub fn new(name: impl Into<String>, timestamp: u64) -> Self {
        Self {
            name: name.into(),
            timestamp,
        }
    }
}

impl std::fmt::Display for TraceMark {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Recording status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Recording,
    Ended,
}

/// Mutable metadata describing one recording session
///
/// Status only moves forward: once [`TraceMeta::finish`] has been called the
/// session stays `Ended`. Marks keep insertion order and are never
/// deduplicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceMeta {
    status: TraceStatus,

    /// Where the trace came from (peer address or configured label)
    pub source: String,

    marks: Vec<TraceMark>,

    modules: Vec<ModuleInfo>,

    /// Total raw bytes ingested so far
    pub input_bytes: u64,
}

impl TraceMeta {
    /// Create metadata for a session that is recording from `source`
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            status: TraceStatus::Recording,
            source: source.into(),
            marks: Vec::new(),
            modules: Vec::new(),
            input_bytes: 0,
        }
    }

    pub fn status(&self) -> TraceStatus {
        self.status
    }

    pub fn is_recording(&self) -> bool {
        self.status == TraceStatus::Recording
    }

    /// Transition to `Ended`. Idempotent.
    pub fn finish(&mut self) {
        self.status = TraceStatus::Ended;
    }

    pub fn add_mark(&mut self, mark: TraceMark) {
        self.marks.push(mark);
    }

    pub fn marks(&self) -> &[TraceMark] {
        &self.marks
    }

    pub fn add_module(&mut self, module: ModuleInfo) {
        self.modules.push(module);
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// Find the module containing `address`, if any
    pub fn module_at(&self, address: u64) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// Render a JSON snapshot of the metadata
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
