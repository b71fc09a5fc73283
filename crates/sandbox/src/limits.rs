//! Resource limits and deadlines applied to sandbox containers.
//!
//! Network access is deliberately not a field here: it is forbidden
//! unconditionally, so `ResourceLimits` has no toggle for it (unlike a
//! project-level `ResourceLimits` that might allow network for package
//! downloads — that escape hatch has no counterpart in this system).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::MemoryClass;

/// Resource limits applied to a single sandbox container, derived from a
/// language's `MemoryClass`. Matches the mandatory security profile every
/// sandbox container runs under.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Memory and memory+swap ceiling, in bytes.
    pub memory_bytes: u64,
    /// CPU quota in nanoseconds of CPU time per 1s period (`NanoCpus` = 1.0e9 == one full core).
    pub nano_cpus: i64,
    /// Maximum number of processes/threads.
    pub pids_limit: i64,
    /// Maximum combined stdout+stderr bytes retained before truncation.
    pub max_output_bytes: usize,
}

impl ResourceLimits {
    pub fn for_memory_class(class: MemoryClass) -> Self {
        Self {
            memory_bytes: class.bytes(),
            nano_cpus: 1_000_000_000,
            pids_limit: 50,
            max_output_bytes: 1024 * 1024,
        }
    }
}

/// Deadlines for batch executions. The plain/stdin-detected split is
/// intentional and retained, not collapsed into one constant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatchDeadlines {
    pub plain: Duration,
    pub stdin_detected: Duration,
}

impl Default for BatchDeadlines {
    fn default() -> Self {
        Self {
            plain: Duration::from_secs(10),
            stdin_detected: Duration::from_secs(15),
        }
    }
}

/// Deadline for interactive executions.
pub const INTERACTIVE_DEADLINE: Duration = Duration::from_secs(300);

/// Grace period between a graceful `stop` and a forced `kill` on deadline
/// expiry or cancellation.
pub const STOP_GRACE: Duration = Duration::from_secs(10);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_memory_class_limits() {
        let limits = ResourceLimits::for_memory_class(MemoryClass::Standard);
        assert_eq!(limits.memory_bytes, 100 * 1024 * 1024);
        assert_eq!(limits.nano_cpus, 1_000_000_000);
        assert_eq!(limits.pids_limit, 50);
    }

    #[test]
    fn heavy_memory_class_limits() {
        let limits = ResourceLimits::for_memory_class(MemoryClass::Heavy);
        assert_eq!(limits.memory_bytes, 256 * 1024 * 1024);
    }

    #[test]
    fn batch_deadlines_default() {
        let deadlines = BatchDeadlines::default();
        assert_eq!(deadlines.plain, Duration::from_secs(10));
        assert_eq!(deadlines.stdin_detected, Duration::from_secs(15));
    }
}
