// Process-group signalling helpers (unix)

use tracing::debug;

/// Signals the runner and recovery send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

/// Send a signal to the whole process group led by `pid`
///
/// A group that no longer exists is not an error.
#[cfg(unix)]
pub fn signal_group(pid: u32, signal: GroupSignal) -> Result<(), String> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {
            debug!(pgid = pid, signal = ?sig, "Signalled process group");
            Ok(())
        }
        Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(format!("{} to group {} failed: {}", sig, pid, e)),
    }
}

#[cfg(not(unix))]
pub fn signal_group(_pid: u32, _signal: GroupSignal) -> Result<(), String> {
    Err("process groups are not supported on this platform".to_string())
}

/// Check if a process exists (signal 0)
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}
