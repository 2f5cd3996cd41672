// Process control for startup recovery
// Adapted from the graceful kill path: SIGTERM, poll, then SIGKILL

use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use crate::process_runner::KILL_GRACE;
use crate::signals::{self, GroupSignal};
use cmdexec_core::port::{ExecutionError, ProcessControl};

/// Poll interval while waiting for a terminated group to exit
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Liveness and termination of leftover process groups (startup recovery)
pub struct UnixProcessControl {
    grace: Duration,
}

impl UnixProcessControl {
    pub fn new() -> Self {
        Self { grace: KILL_GRACE }
    }
}

impl Default for UnixProcessControl {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessControl for UnixProcessControl {
    fn is_alive(&self, pid: u32) -> bool {
        signals::is_alive(pid)
    }

    /// SIGTERM the group, poll every 100ms, SIGKILL after the grace
    async fn terminate_group(&self, pid: u32) -> Result<(), ExecutionError> {
        info!(pid = %pid, "Sending SIGTERM to process group");
        signals::signal_group(pid, GroupSignal::Terminate).map_err(ExecutionError::KillFailed)?;

        let started = Instant::now();
        loop {
            sleep(POLL_INTERVAL).await;
            if !signals::is_alive(pid) {
                info!(pid = %pid, "Process group exited after SIGTERM");
                return Ok(());
            }
            if started.elapsed() > self.grace {
                warn!(pid = %pid, "Process group did not exit after SIGTERM, sending SIGKILL");
                return signals::signal_group(pid, GroupSignal::Kill).map_err(ExecutionError::KillFailed);
            }
        }
    }
}
