//! Worker exit-status classification.
//!
//! Maps the wait status of a dead child onto the failure kinds surfaced to
//! clients: out-of-memory or a plain quit with the observed status.

use std::fmt;

use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;

/// Distinguished exit status used by a worker that detects it has exceeded
/// its memory budget and leaves the protocol voluntarily.
pub const OOM_EXIT_CODE: i32 = 152;

/// How a worker process left the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuitStatus {
    /// Normal exit with the given status code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(Signal),
    /// The status could not be observed (e.g. already reaped elsewhere).
    Unknown,
}

impl fmt::Display for QuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited {}", code),
            Self::Signaled(sig) => write!(f, "signaled {}", sig.as_str()),
            Self::Unknown => write!(f, "unknown status"),
        }
    }
}

/// Failure kind attached to [`crate::Error::WorkerFailed`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerFailure {
    /// The child was killed by the OOM killer, or exited with
    /// [`OOM_EXIT_CODE`] after its own memory self-check.
    Oomed,
    /// The child left the protocol with the given status.
    Quit(QuitStatus),
    /// The job itself failed; carries the user-side error rendered by the
    /// executor.
    JobFailed(String),
}

impl fmt::Display for WorkerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oomed => write!(f, "out of memory"),
            Self::Quit(status) => write!(f, "quit ({})", status),
            Self::JobFailed(message) => write!(f, "job failed: {}", message),
        }
    }
}

/// Reduce a `WaitStatus` to the quit status reported to clients.
pub fn quit_status_of(status: WaitStatus) -> QuitStatus {
    match status {
        WaitStatus::Exited(_, code) => QuitStatus::Exited(code),
        WaitStatus::Signaled(_, signal, _) => QuitStatus::Signaled(signal),
        // Not observable without WUNTRACED; kept for totality.
        _ => QuitStatus::Unknown,
    }
}

/// Classify the wait status of a dead worker.
///
/// SIGKILL normally means the kernel OOM killer. When the controller itself
/// delivered the kill (cancellation or force-quit), the caller passes
/// `controller_killed` and the death is reported as a plain quit instead.
pub fn classify_wait_status(status: WaitStatus, controller_killed: bool) -> WorkerFailure {
    match quit_status_of(status) {
        QuitStatus::Exited(OOM_EXIT_CODE) => WorkerFailure::Oomed,
        QuitStatus::Signaled(Signal::SIGKILL) if !controller_killed => WorkerFailure::Oomed,
        status => WorkerFailure::Quit(status),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Pid;

    #[test]
    fn test_normal_exit_is_quit() {
        let status = WaitStatus::Exited(Pid::from_raw(1), 0);
        assert_eq!(
            classify_wait_status(status, false),
            WorkerFailure::Quit(QuitStatus::Exited(0))
        );

        let status = WaitStatus::Exited(Pid::from_raw(1), 3);
        assert_eq!(
            classify_wait_status(status, false),
            WorkerFailure::Quit(QuitStatus::Exited(3))
        );
    }

    #[test]
    fn test_oom_exit_code_classifies_as_oom() {
        let status = WaitStatus::Exited(Pid::from_raw(1), OOM_EXIT_CODE);
        assert_eq!(classify_wait_status(status, false), WorkerFailure::Oomed);
    }

    #[test]
    fn test_sigkill_is_oom_unless_controller_initiated() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGKILL, false);
        assert_eq!(classify_wait_status(status, false), WorkerFailure::Oomed);
        assert_eq!(
            classify_wait_status(status, true),
            WorkerFailure::Quit(QuitStatus::Signaled(Signal::SIGKILL))
        );
    }

    #[test]
    fn test_other_signals_are_quits() {
        let status = WaitStatus::Signaled(Pid::from_raw(1), Signal::SIGTERM, false);
        assert_eq!(
            classify_wait_status(status, false),
            WorkerFailure::Quit(QuitStatus::Signaled(Signal::SIGTERM))
        );
    }

    #[test]
    fn test_display_forms() {
        assert_eq!(QuitStatus::Exited(0).to_string(), "exited 0");
        assert_eq!(
            QuitStatus::Signaled(Signal::SIGKILL).to_string(),
            "signaled SIGKILL"
        );
        assert_eq!(WorkerFailure::Oomed.to_string(), "out of memory");
        assert_eq!(
            WorkerFailure::JobFailed("bad input".into()).to_string(),
            "job failed: bad input"
        );
    }
}
