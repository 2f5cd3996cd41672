// Process runner implementation
// One child per execution, own process group, stdout/stderr pumped by a single task
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::signals::{self, GroupSignal};
use cmdexec_core::domain::{ExecutionId, Invocation, OutputChunk, StreamKind};
use cmdexec_core::port::{
    CancelToken, ExecutionError, ProcessOutcome, ProcessRunner, RunHandle, RunSpec,
    TimeProvider,
};

/// Grace between SIGTERM and SIGKILL
pub const KILL_GRACE: Duration = Duration::from_millis(500);

/// Upper bound on pipe draining after the process is gone
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Read buffer per pipe
const READ_BUFFER_SIZE: usize = 8192;

/// Output channel depth (chunks) between pump and supervisor
const OUTPUT_CHANNEL_CAPACITY: usize = 256;

const SHELL: &str = "/bin/sh";

/// Why the runner terminated the process itself
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Termination {
    Cancelled,
    TimedOut,
    OutputLimit,
}

/// Tokio-based process runner
/// Spawns children with a cleared, allowlisted environment
pub struct TokioProcessRunner {
    time_provider: Arc<dyn TimeProvider>,
    env_allowlist: Vec<String>,
    kill_grace: Duration,
    drain_timeout: Duration,
}

impl TokioProcessRunner {
    /// Create a new process runner
    ///
    /// # Arguments
    /// * `time_provider` - Timestamps for output chunks
    /// * `env_allowlist` - Environment variables passed through to children
    ///
    /// # Example
    /// ```ignore
    /// let runner = TokioProcessRunner::new(
    ///     Arc::new(SystemTimeProvider),
    ///     vec!["PATH".to_string(), "HOME".to_string()],
    /// );
    /// ```
    pub fn new(time_provider: Arc<dyn TimeProvider>, env_allowlist: Vec<String>) -> Self {
        Self {
            time_provider,
            env_allowlist,
            kill_grace: KILL_GRACE,
            drain_timeout: DRAIN_TIMEOUT,
        }
    }

    /// Filter the daemon's environment to the allowlist
    fn filtered_env(&self) -> Vec<(String, std::ffi::OsString)> {
        self.env_allowlist
            .iter()
            .filter_map(|key| std::env::var_os(key).map(|v| (key.clone(), v)))
            .collect()
    }

    fn build_command(&self, spec: &RunSpec) -> Result<(Command, String), ExecutionError> {
        let (mut cmd, program) = match &spec.invocation {
            Invocation::Argv(argv) => {
                let (program, args) = argv.split_first().ok_or_else(|| {
                    ExecutionError::InvalidInvocation("empty argument vector".to_string())
                })?;
                let mut cmd = Command::new(program);
                cmd.args(args);
                (cmd, program.clone())
            }
            Invocation::Shell(script) => {
                let mut cmd = Command::new(SHELL);
                cmd.arg("-c").arg(script);
                (cmd, SHELL.to_string())
            }
        };

        cmd.env_clear()
            .envs(self.filtered_env())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }
        Ok((cmd, program))
    }
}

impl ProcessRunner for TokioProcessRunner {
    fn start(&self, spec: RunSpec, cancel: CancelToken) -> Result<RunHandle, ExecutionError> {
        let (mut cmd, program) = self.build_command(&spec)?;

        let mut child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ExecutionError::NotFound(format!("{}: {}", program, e)),
            _ => ExecutionError::SpawnFailed(format!("{}: {}", program, e)),
        })?;

        let pid = child.id();
        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(ExecutionError::Io("child pipes unavailable".to_string()));
        };

        info!(
            execution_id = %spec.execution_id,
            pid = ?pid,
            program = %program,
            timeout_ms = spec.timeout.as_millis() as u64,
            "Process spawned"
        );

        let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();

        let pump = Pump {
            execution_id: spec.execution_id,
            child,
            pid,
            stdout,
            stderr,
            out_tx,
            cancel,
            timeout: spec.timeout,
            max_output_bytes: spec.max_output_bytes,
            kill_grace: self.kill_grace,
            drain_timeout: self.drain_timeout,
            time_provider: self.time_provider.clone(),
        };
        tokio::spawn(async move {
            let outcome = pump.run().await;
            let _ = exit_tx.send(outcome);
        });

        Ok(RunHandle {
            pid,
            output: out_rx,
            exit: exit_rx,
        })
    }
}

/// Reads both pipes, enforces deadline, cancel and output cap, reaps the child
struct Pump<O, E> {
    execution_id: ExecutionId,
    child: Child,
    pid: Option<u32>,
    stdout: O,
    stderr: E,
    out_tx: mpsc::Sender<OutputChunk>,
    cancel: CancelToken,
    timeout: Duration,
    max_output_bytes: u64,
    kill_grace: Duration,
    drain_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl<O, E> Pump<O, E>
where
    O: AsyncRead + Unpin + Send,
    E: AsyncRead + Unpin + Send,
{
    async fn run(mut self) -> ProcessOutcome {
        let mut stdout_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut stderr_buf = vec![0u8; READ_BUFFER_SIZE];
        let mut stdout_open = true;
        let mut stderr_open = true;

        let mut seq: u64 = 0;
        let mut captured: u64 = 0;
        let mut termination: Option<Termination> = None;
        let mut exit_code: Option<i32> = None;
        let mut killed = false;

        let deadline = sleep(self.timeout);
        let escalate = sleep(Duration::MAX / 4);
        let drain = sleep(Duration::MAX / 4);
        tokio::pin!(deadline, escalate, drain);

        loop {
            if exit_code.is_some() && !stdout_open && !stderr_open {
                break;
            }
            let running = exit_code.is_none();

            tokio::select! {
                biased;

                _ = self.cancel.cancelled(), if running && termination.is_none() => {
                    info!(execution_id = %self.execution_id, "Cancel received, terminating process group");
                    termination = Some(Termination::Cancelled);
                    self.terminate(GroupSignal::Terminate);
                    escalate.as_mut().reset(Instant::now() + self.kill_grace);
                }

                _ = &mut deadline, if running && termination.is_none() => {
                    warn!(
                        execution_id = %self.execution_id,
                        timeout_ms = self.timeout.as_millis() as u64,
                        "Wall-clock timeout, terminating process group"
                    );
                    termination = Some(Termination::TimedOut);
                    self.terminate(GroupSignal::Terminate);
                    escalate.as_mut().reset(Instant::now() + self.kill_grace);
                }

                _ = &mut escalate, if running && termination.is_some() && !killed => {
                    warn!(execution_id = %self.execution_id, pid = ?self.pid, "Process ignored SIGTERM, sending SIGKILL");
                    killed = true;
                    self.terminate(GroupSignal::Kill);
                }

                status = self.child.wait(), if running => {
                    let code = match status {
                        Ok(status) => exit_code_of(status),
                        Err(e) => {
                            warn!(execution_id = %self.execution_id, error = %e, "Failed to reap child");
                            -1
                        }
                    };
                    debug!(execution_id = %self.execution_id, exit_code = code, "Process exited");
                    exit_code = Some(code);
                    // group members may still hold the pipes open
                    if termination.is_some() {
                        self.terminate(GroupSignal::Kill);
                    }
                    drain.as_mut().reset(Instant::now() + self.drain_timeout);
                }

                _ = &mut drain, if !running => {
                    warn!(execution_id = %self.execution_id, "Pipes still open after exit, abandoning drain");
                    break;
                }

                read = self.stdout.read(&mut stdout_buf), if stdout_open => {
                    match read {
                        Ok(0) | Err(_) => stdout_open = false,
                        Ok(n) => {
                            if self.forward(StreamKind::Stdout, &stdout_buf[..n], &mut seq, &mut captured).await
                                && termination.is_none()
                            {
                                termination = Some(Termination::OutputLimit);
                                self.terminate(GroupSignal::Terminate);
                                escalate.as_mut().reset(Instant::now() + self.kill_grace);
                            }
                        }
                    }
                }

                read = self.stderr.read(&mut stderr_buf), if stderr_open => {
                    match read {
                        Ok(0) | Err(_) => stderr_open = false,
                        Ok(n) => {
                            if self.forward(StreamKind::Stderr, &stderr_buf[..n], &mut seq, &mut captured).await
                                && termination.is_none()
                            {
                                termination = Some(Termination::OutputLimit);
                                self.terminate(GroupSignal::Terminate);
                                escalate.as_mut().reset(Instant::now() + self.kill_grace);
                            }
                        }
                    }
                }
            }
        }

        let exit_code = exit_code.unwrap_or(-1);
        match termination {
            Some(Termination::Cancelled) => ProcessOutcome::Cancelled,
            Some(Termination::TimedOut) => ProcessOutcome::TimedOut,
            Some(Termination::OutputLimit) => ProcessOutcome::OutputLimitExceeded {
                limit: self.max_output_bytes,
                exit_code,
            },
            None => ProcessOutcome::Exited { exit_code },
        }
    }

    /// Forward bytes up to the cap; returns true if the cap was exceeded
    async fn forward(
        &self,
        stream: StreamKind,
        bytes: &[u8],
        seq: &mut u64,
        captured: &mut u64,
    ) -> bool {
        let remaining = self.max_output_bytes.saturating_sub(*captured);
        let take = (bytes.len() as u64).min(remaining) as usize;
        if take > 0 {
            let chunk = OutputChunk::new(
                *seq,
                stream,
                bytes[..take].to_vec(),
                self.time_provider.now_millis(),
            );
            *seq += 1;
            *captured += take as u64;
            // receiver gone means nobody is listening; keep reaping anyway
            let _ = self.out_tx.send(chunk).await;
        }
        take < bytes.len()
    }

    fn terminate(&mut self, signal: GroupSignal) {
        let Some(pid) = self.pid else {
            return;
        };
        if let Err(e) = signals::signal_group(pid, signal) {
            warn!(execution_id = %self.execution_id, error = %e, "Group signal failed, killing child only");
            let _ = self.child.start_kill();
        }
    }
}

/// Exit code, or 128 + signal for signal deaths
fn exit_code_of(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
