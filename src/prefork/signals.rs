//! Exit analysis for worker processes.

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Why a worker process stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// Normal exit with status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// Still running at the time of the check.
    StillAlive,
    /// Already reaped, or the status could not be read.
    Unknown,
}

impl TerminationReason {
    /// Whether the worker exited cleanly.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Exited(0))
    }

    /// Whether the process is gone for good.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::StillAlive)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {}", code),
            Self::Signaled(Signal::SIGKILL) => {
                write!(f, "killed by signal SIGKILL (possibly out of memory)")
            }
            Self::Signaled(Signal::SIGSEGV) => {
                write!(f, "killed by signal SIGSEGV (possibly stack overflow)")
            }
            Self::Signaled(sig) => write!(f, "killed by signal {:?}", sig),
            Self::StillAlive => write!(f, "still running"),
            Self::Unknown => write!(f, "unknown reason"),
        }
    }
}

/// Map a `WaitStatus` to a termination reason.
pub fn analyze_wait_status(status: WaitStatus) -> TerminationReason {
    match status {
        WaitStatus::Exited(_, code) => TerminationReason::Exited(code),
        WaitStatus::Signaled(_, signal, _) => TerminationReason::Signaled(signal),
        WaitStatus::StillAlive => TerminationReason::StillAlive,
        _ => TerminationReason::Unknown,
    }
}
