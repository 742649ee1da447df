//! Readiness selection over pending handles and extra descriptors.
//!
//! Partitions a set of handles into those whose response has started to
//! arrive and those still waiting. No response bytes are consumed here,
//! so the single-consumer discipline of the handle stays intact.

use std::io;
use std::os::unix::io::{BorrowedFd, RawFd};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::error::Result;
use crate::handle::JobHandle;

/// Partition produced by [`select`].
pub struct Selected<A, R> {
    /// Handles whose channel is readable, plus handles that are already
    /// resolved, cancelled, or on a dead worker.
    pub readys: Vec<JobHandle<A, R>>,
    /// Handles still waiting on their worker.
    pub waiters: Vec<JobHandle<A, R>>,
    /// Extra descriptors that reported readiness.
    pub ready_fds: Vec<RawFd>,
}

/// Wait for readiness across `handles` and `extra_fds`.
///
/// Blocks until at least one input is ready, unless some handle is
/// already classifiable as ready without polling (resolved, cancelled,
/// severed, or on a force-quit worker), in which case the poll is
/// non-blocking. A force-quit worker's channel reports ready at EOF; the
/// subsequent `get_result` surfaces the failure.
///
/// The returned `readys` and `waiters` partition the input exactly;
/// `ready_fds` is a subset of `extra_fds`.
pub fn select<A, R>(handles: Vec<JobHandle<A, R>>, extra_fds: &[RawFd]) -> Result<Selected<A, R>> {
    let mut readys = Vec::new();
    let mut pollable = Vec::new();
    for handle in handles {
        if handle.ready_now() {
            readys.push(handle);
        } else {
            pollable.push(handle);
        }
    }

    if pollable.is_empty() && extra_fds.is_empty() {
        return Ok(Selected {
            readys,
            waiters: Vec::new(),
            ready_fds: Vec::new(),
        });
    }

    let mut poll_fds: Vec<PollFd> = Vec::with_capacity(pollable.len() + extra_fds.len());
    for handle in &pollable {
        let fd = handle.read_fd().expect("pollable handle has a live channel");
        // SAFETY: the controller is single-threaded and owns these
        // descriptors; nothing closes them while the poll runs.
        poll_fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(fd) },
            PollFlags::POLLIN,
        ));
    }
    for &fd in extra_fds {
        poll_fds.push(PollFd::new(
            unsafe { BorrowedFd::borrow_raw(fd) },
            PollFlags::POLLIN,
        ));
    }

    // Don't block when something is already deliverable.
    let timeout = if readys.is_empty() {
        PollTimeout::NONE
    } else {
        PollTimeout::ZERO
    };
    loop {
        match poll(&mut poll_fds, timeout) {
            Ok(_) => break,
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from_raw_os_error(e as i32).into()),
        }
    }

    fn is_ready(poll_fd: &PollFd) -> bool {
        poll_fd
            .revents()
            .is_some_and(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR))
    }

    let handle_ready: Vec<bool> = poll_fds[..pollable.len()].iter().map(is_ready).collect();
    let ready_fds = poll_fds[pollable.len()..]
        .iter()
        .zip(extra_fds)
        .filter(|(poll_fd, _)| is_ready(poll_fd))
        .map(|(_, &fd)| fd)
        .collect();
    drop(poll_fds);

    let mut waiters = Vec::new();
    for (handle, ready) in pollable.into_iter().zip(handle_ready) {
        if ready {
            readys.push(handle);
        } else {
            waiters.push(handle);
        }
    }

    Ok(Selected {
        readys,
        waiters,
        ready_fds,
    })
}
