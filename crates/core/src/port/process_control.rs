// Process Control Port
// Liveness checks and group termination for processes left over by a previous engine run

use crate::port::process_runner::ExecutionError;
use async_trait::async_trait;

#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Check if a process with this PID exists
    fn is_alive(&self, pid: u32) -> bool;

    /// Terminate the process group led by `pid` (graceful, then forced)
    async fn terminate_group(&self, pid: u32) -> Result<(), ExecutionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Pretends a fixed set of PIDs is alive; records terminations
    #[derive(Default)]
    pub struct MockProcessControl {
        alive: Mutex<HashSet<u32>>,
        terminated: Mutex<Vec<u32>>,
    }

    impl MockProcessControl {
        pub fn with_alive(pids: &[u32]) -> Self {
            Self {
                alive: Mutex::new(pids.iter().copied().collect()),
                terminated: Mutex::new(Vec::new()),
            }
        }

        pub fn terminated(&self) -> Vec<u32> {
            self.terminated.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessControl for MockProcessControl {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        async fn terminate_group(&self, pid: u32) -> Result<(), ExecutionError> {
            self.alive.lock().unwrap().remove(&pid);
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }
}
