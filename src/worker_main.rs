//! Worker subprocess executor.
//!
//! Runs inside a freshly forked child: installs the worker environment,
//! then loops reading job requests and writing responses. A long-lived
//! child services requests until its input pipe closes; a clone child
//! services exactly one request and exits.

use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::resource::{UsageWho, getrusage};

use crate::ipc::Channel;
use crate::protocol::{ExecMode, WorkerRequest, WorkerResponse};
use crate::registry::{CallWrapper, JobRegistry};
use crate::status::OOM_EXIT_CODE;
use crate::worker_env::{self, WorkerParams};

/// Post-job self-check: has this process's peak resident set crossed the
/// configured budget? An unreadable rusage counts as in-budget.
fn over_memory_budget(limit_mib: usize) -> bool {
    let Ok(usage) = getrusage(UsageWho::RUSAGE_SELF) else {
        return false;
    };
    // ru_maxrss is reported in bytes on macOS, kilobytes elsewhere.
    let per_mib: i64 = if cfg!(target_os = "macos") {
        1024 * 1024
    } else {
        1024
    };
    usage.max_rss() / per_mib > limit_mib as i64
}

/// Child entry point: set up the environment and run the job loop.
/// Returns the process exit code.
pub(crate) fn run_worker(
    params: WorkerParams,
    registry: &JobRegistry,
    wrapper: Option<&CallWrapper>,
    memory_limit_mib: Option<usize>,
    mut channel: Channel,
) -> i32 {
    // Pipe errors must surface as io::Error, not SIGPIPE death.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )
        .ok();
    }

    let longlived = params.longlived;
    let controller_fd = params.controller_fd;
    worker_env::install(params.entry);

    match worker_loop(
        longlived,
        controller_fd,
        registry,
        wrapper,
        memory_limit_mib,
        &mut channel,
    ) {
        Ok(code) => code,
        Err(_) => 1, // Controller gone or pipe broken
    }
}

fn worker_loop(
    longlived: bool,
    controller_fd: Option<RawFd>,
    registry: &JobRegistry,
    wrapper: Option<&CallWrapper>,
    memory_limit_mib: Option<usize>,
    channel: &mut Channel,
) -> io::Result<i32> {
    if longlived {
        // Startup handshake; consumed by the controller inside `make`.
        WorkerResponse::Ready.send(channel)?;
    }

    loop {
        if let Some(fd) = controller_fd {
            if controller_gone(channel.read_fd(), fd)? {
                return Ok(0);
            }
        }

        let Some(request) = WorkerRequest::recv(channel)? else {
            return Ok(0); // EOF: the controller closed our input
        };

        match request {
            WorkerRequest::Exit => return Ok(0),

            WorkerRequest::Job {
                call_id: _,
                entry,
                arg,
                wrapped,
                mode,
            } => {
                let outcome = registry.run(&entry, arg, if wrapped { wrapper } else { None });
                let response = match outcome {
                    Ok(value) => WorkerResponse::ok(value),
                    Err(message) => WorkerResponse::failed(message),
                };
                response.send(channel)?;

                if memory_limit_mib.is_some_and(over_memory_budget) {
                    // Leave the protocol with the distinguished status;
                    // the controller classifies it as an OOM.
                    return Ok(OOM_EXIT_CODE);
                }

                if !longlived || mode == ExecMode::ClonePerCall {
                    return Ok(0); // One job per clone
                }
            }
        }
    }
}

/// Block until either a request is readable or the controller is gone.
/// Returns `true` when the liveness descriptor reports hangup and no
/// request is pending.
fn controller_gone(input_fd: RawFd, controller_fd: RawFd) -> io::Result<bool> {
    loop {
        // SAFETY: both descriptors belong to this process and stay open
        // for the duration of the poll.
        let mut fds = [
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(input_fd) },
                PollFlags::POLLIN,
            ),
            PollFd::new(
                unsafe { BorrowedFd::borrow_raw(controller_fd) },
                PollFlags::POLLIN,
            ),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {
                let input_ready = fds[0].revents().is_some_and(|r| !r.is_empty());
                let controller_down = fds[1]
                    .revents()
                    .is_some_and(|r| r.intersects(PollFlags::POLLHUP | PollFlags::POLLERR));
                return Ok(controller_down && !input_ready);
            }
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_budget_check() {
        // Any live process has at least a MiB resident.
        assert!(over_memory_budget(0));
        // And far less than a million MiB.
        assert!(!over_memory_budget(1_000_000));
    }
}
