// Execution manager constants (no magic values)
use std::time::Duration;

/// Exit code recorded when the engine itself failed the execution
/// (supervisor panic, lost runner outcome, engine restart)
pub const ENGINE_FAULT_EXIT_CODE: i32 = -1;

/// Listing page size when the caller gives none
pub const DEFAULT_LIST_LIMIT: usize = 100;

/// Upper bound on a listing page
pub const MAX_LIST_LIMIT: usize = 1000;

/// Poll interval while waiting for in-flight executions to drain
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reason recorded when the supervising task panics
pub const SUPERVISOR_PANIC_REASON: &str = "supervisor panicked";
