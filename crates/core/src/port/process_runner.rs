// Process Runner Port
// Spawns one OS process per execution and reports output + outcome over channels

use crate::domain::{ExecutionId, Invocation, OutputChunk};
use crate::port::cancel::CancelToken;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Conventional exit code for "command not found"
pub const EXIT_CODE_NOT_FOUND: i32 = 127;

/// Conventional exit code for "found but could not be executed"
pub const EXIT_CODE_CANNOT_EXECUTE: i32 = 126;

/// Everything the runner needs to launch one execution
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub execution_id: ExecutionId,
    pub invocation: Invocation,
    pub working_dir: Option<PathBuf>,
    /// Wall-clock deadline measured from spawn
    pub timeout: Duration,
    /// Total captured bytes across stdout and stderr
    pub max_output_bytes: u64,
}

/// How the process ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// Natural exit (signal deaths map to 128 + signal)
    Exited { exit_code: i32 },
    /// Wall-clock deadline hit, process group terminated
    TimedOut,
    /// Cancel signal received, process group terminated
    Cancelled,
    /// Output cap hit, process group terminated
    OutputLimitExceeded { limit: u64, exit_code: i32 },
}

/// Channels for one running process
///
/// `output` closes after every captured byte has been forwarded; `exit`
/// resolves after that.
#[derive(Debug)]
pub struct RunHandle {
    pub pid: Option<u32>,
    pub output: mpsc::Receiver<OutputChunk>,
    pub exit: oneshot::Receiver<ProcessOutcome>,
}

/// Runner errors (all happen before the process is running)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Command not found: {0}")]
    NotFound(String),

    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Process kill failed: {0}")]
    KillFailed(String),

    #[error("IO error: {0}")]
    Io(String),
}

impl ExecutionError {
    /// Exit code recorded on the Failed execution
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecutionError::NotFound(_) => EXIT_CODE_NOT_FOUND,
            _ => EXIT_CODE_CANNOT_EXECUTE,
        }
    }
}

/// Process Runner trait
///
/// Implementations:
/// - TokioProcessRunner (infra-system): real child processes
/// - ScriptedRunner (mocks): canned output for manager tests
pub trait ProcessRunner: Send + Sync {
    /// Spawn the process and return its channels without waiting for it
    ///
    /// # Errors
    /// - ExecutionError::NotFound / SpawnFailed if the OS could not create the process
    /// - ExecutionError::InvalidInvocation for an empty argument vector
    fn start(&self, spec: RunSpec, cancel: CancelToken) -> Result<RunHandle, ExecutionError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use crate::domain::StreamKind;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Mock runner behavior
    #[derive(Debug, Clone)]
    pub enum MockBehavior {
        /// Emit chunks then exit with the code
        Exit {
            chunks: Vec<(StreamKind, String)>,
            exit_code: i32,
        },
        /// Fail to spawn
        SpawnError(ExecutionError),
        /// Run until cancelled or timed out
        Hang,
        /// Leave a process running, then panic inside `start`
        Panic(String),
    }

    /// Mock Process Runner for testing
    pub struct ScriptedRunner {
        behavior: Mutex<MockBehavior>,
        starts: AtomicUsize,
        cancels_seen: Arc<AtomicUsize>,
    }

    impl ScriptedRunner {
        pub fn new(behavior: MockBehavior) -> Self {
            Self {
                behavior: Mutex::new(behavior),
                starts: AtomicUsize::new(0),
                cancels_seen: Arc::new(AtomicUsize::new(0)),
            }
        }

        pub fn exiting(chunks: &[(StreamKind, &str)], exit_code: i32) -> Self {
            Self::new(MockBehavior::Exit {
                chunks: chunks.iter().map(|(k, s)| (*k, s.to_string())).collect(),
                exit_code,
            })
        }

        pub fn hanging() -> Self {
            Self::new(MockBehavior::Hang)
        }

        pub fn start_count(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }

        /// Started processes that were told to stop
        pub fn cancels_seen(&self) -> usize {
            self.cancels_seen.load(Ordering::SeqCst)
        }
    }

    impl ProcessRunner for ScriptedRunner {
        fn start(&self, spec: RunSpec, mut cancel: CancelToken) -> Result<RunHandle, ExecutionError> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let behavior = self.behavior.lock().unwrap().clone();

            let (out_tx, out_rx) = mpsc::channel(64);
            let (exit_tx, exit_rx) = oneshot::channel();

            match behavior {
                MockBehavior::SpawnError(err) => return Err(err),
                MockBehavior::Panic(msg) => {
                    let seen = self.cancels_seen.clone();
                    tokio::spawn(async move {
                        cancel.cancelled().await;
                        seen.fetch_add(1, Ordering::SeqCst);
                    });
                    panic!("{}", msg)
                }
                MockBehavior::Exit { chunks, exit_code } => {
                    tokio::spawn(async move {
                        for (seq, (stream, text)) in chunks.into_iter().enumerate() {
                            let chunk = OutputChunk::new(seq as u64, stream, text, 0);
                            if out_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        drop(out_tx);
                        let _ = exit_tx.send(ProcessOutcome::Exited { exit_code });
                    });
                }
                MockBehavior::Hang => {
                    let seen = self.cancels_seen.clone();
                    tokio::spawn(async move {
                        let outcome = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                seen.fetch_add(1, Ordering::SeqCst);
                                ProcessOutcome::Cancelled
                            }
                            _ = tokio::time::sleep(spec.timeout) => ProcessOutcome::TimedOut,
                        };
                        drop(out_tx);
                        let _ = exit_tx.send(outcome);
                    });
                }
            }

            Ok(RunHandle {
                pid: Some(4242),
                output: out_rx,
                exit: exit_rx,
            })
        }
    }
}
