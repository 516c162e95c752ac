use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::bytes::format_bytes;

/// Point-in-time resource snapshot of a host process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub start_time: DateTime<Utc>,
    /// User plus kernel time consumed so far.
    pub total_processor_time: Duration,
    pub virtual_memory_size: u64,
    pub working_set: u64,
    /// Heap bytes currently allocated and not yet freed.
    pub heap_live_bytes: u64,
    /// Heap bytes allocated over the process lifetime.
    pub heap_allocated_bytes: u64,
}

impl fmt::Display for ResourceUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "started {}, cpu {:?}, virtual {}, working set {}, heap {} live / {} allocated",
            self.start_time.to_rfc3339(),
            self.total_processor_time,
            format_bytes(self.virtual_memory_size, true),
            format_bytes(self.working_set, true),
            format_bytes(self.heap_live_bytes, true),
            format_bytes(self.heap_allocated_bytes, true),
        )
    }
}
