//! Fork-based daemon primitive.
//!
//! Spawns a child process connected to the controller by a pair of pipes
//! (requests parent→child, responses child→parent) and wraps it in a
//! [`ChildProc`] lifecycle handle.

#![allow(dead_code)] // Some methods are for debugging/monitoring

use std::io;
use std::os::unix::io::RawFd;
use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe};
use tracing::debug;

use crate::ipc::Channel;

/// Fork a child connected by a request pipe and a response pipe.
///
/// The parent receives a [`ChildProc`] whose channel writes requests and
/// reads responses. The child runs `entry` on the mirrored channel and
/// exits with its return code; it never returns into caller code.
pub fn spawn<F>(entry: F) -> io::Result<ChildProc>
where
    F: FnOnce(Channel) -> i32,
{
    let (req_read, req_write) = pipe().map_err(io_error)?;
    let (resp_read, resp_write) = pipe().map_err(io_error)?;

    // SAFETY: the child runs only caller-provided worker code plus pipe
    // I/O and allocation; the controller side stays single-threaded.
    match unsafe { fork() }.map_err(io_error)? {
        ForkResult::Parent { child } => {
            drop(req_read);
            drop(resp_write);
            debug!(pid = child.as_raw(), "spawned worker child");
            Ok(ChildProc::new(child, Channel::new(resp_read, req_write)))
        }
        ForkResult::Child => {
            drop(req_write);
            drop(resp_read);
            let channel = Channel::new(req_read, resp_write);
            let code = entry(channel);
            std::process::exit(code);
        }
    }
}

fn io_error(errno: Errno) -> io::Error {
    io::Error::from_raw_os_error(errno as i32)
}

/// Handle to a worker subprocess with its IPC channel.
pub struct ChildProc {
    pid: Pid,
    channel: Option<Channel>,
    /// Whether the process has been reaped.
    reaped: bool,
    /// Wait status recorded when the child was reaped.
    status: Option<WaitStatus>,
    /// Whether the controller itself delivered the fatal signal.
    controller_killed: bool,
}

impl ChildProc {
    fn new(pid: Pid, channel: Channel) -> Self {
        Self {
            pid,
            channel: Some(channel),
            reaped: false,
            status: None,
            controller_killed: false,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn pid_raw(&self) -> i32 {
        self.pid.as_raw()
    }

    /// The duplex channel, unless it has been severed.
    pub fn channel_mut(&mut self) -> Option<&mut Channel> {
        self.channel.as_mut()
    }

    /// Raw descriptor of the response side, for readiness polling. `None`
    /// once severed.
    pub fn read_fd(&self) -> Option<RawFd> {
        self.channel.as_ref().map(Channel::read_fd)
    }

    /// Close both pipe ends. Any in-flight peer read observes EOF.
    pub fn sever(&mut self) {
        self.channel = None;
    }

    /// Disarm this handle inside a freshly forked sibling: close the pipe
    /// copies and pretend the child is reaped so no lifecycle action runs
    /// against a process this copy does not own.
    pub(crate) fn disarm(&mut self) {
        self.channel = None;
        self.reaped = true;
    }

    pub fn controller_killed(&self) -> bool {
        self.controller_killed
    }

    /// Wait status recorded at reap time, if the child is known dead.
    pub fn last_status(&self) -> Option<WaitStatus> {
        self.status
    }

    /// Reap the child if it has exited (non-blocking).
    pub fn try_wait(&mut self) -> Option<WaitStatus> {
        if let Some(status) = self.status {
            return Some(status);
        }
        if self.reaped {
            return None;
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => None,
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                Some(status)
            }
            Err(_) => {
                self.reaped = true;
                None
            }
        }
    }

    /// Block until the child exits and record its status.
    pub fn wait(&mut self) -> Option<WaitStatus> {
        if let Some(status) = self.status {
            return Some(status);
        }
        if self.reaped {
            return None;
        }
        match waitpid(self.pid, None) {
            Ok(status) => {
                self.reaped = true;
                self.status = Some(status);
                Some(status)
            }
            Err(_) => {
                self.reaped = true;
                None
            }
        }
    }

    /// Check whether the process is still running (non-blocking).
    pub fn is_running(&mut self) -> bool {
        !self.reaped && self.try_wait().is_none()
    }

    /// SIGKILL the child, sever its channel, and reap it. Idempotent.
    pub fn kill(&mut self) {
        if !self.reaped {
            self.controller_killed = true;
            let _ = signal::kill(self.pid, Signal::SIGKILL);
        }
        self.sever();
        let _ = self.wait();
    }

    /// Wait up to `timeout` for a voluntary exit, then escalate to
    /// SIGKILL. The caller is expected to have asked the child to leave
    /// (exit request or severed input) before calling this.
    pub fn stop(&mut self, timeout: Duration) {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.try_wait().is_some() {
                self.sever();
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
        self.kill();
    }
}

impl Drop for ChildProc {
    fn drop(&mut self) {
        if !self.reaped {
            // No strays, no zombies.
            self.controller_killed = true;
            let _ = signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.reaped = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{WorkerRequest, WorkerResponse};
    use serde_json::json;

    #[test]
    fn test_spawn_echo_child() {
        let mut child = spawn(|mut channel| {
            // Echo each request argument back as the response value.
            while let Ok(Some(WorkerRequest::Job { arg, .. })) = WorkerRequest::recv(&mut channel)
            {
                if WorkerResponse::ok(arg).send(&mut channel).is_err() {
                    return 1;
                }
            }
            0
        })
        .expect("Failed to spawn child");

        let request = WorkerRequest::Job {
            call_id: 1,
            entry: "echo".into(),
            arg: json!("hello"),
            wrapped: false,
            mode: crate::protocol::ExecMode::Persistent,
        };
        {
            let channel = child.channel_mut().unwrap();
            request.send(channel).unwrap();
            match WorkerResponse::recv(channel).unwrap() {
                Some(WorkerResponse::Ok { value }) => assert_eq!(value, json!("hello")),
                other => panic!("Expected Ok response, got {:?}", other),
            }
        }

        // Severing our end makes the child see EOF and exit cleanly.
        child.sever();
        assert_eq!(
            child.wait(),
            Some(WaitStatus::Exited(child.pid(), 0))
        );
    }

    #[test]
    fn test_kill_records_controller_intent() {
        let mut child = spawn(|_channel| {
            std::thread::sleep(Duration::from_secs(60));
            0
        })
        .expect("Failed to spawn child");

        assert!(child.is_running());
        child.kill();
        assert!(!child.is_running());
        assert!(child.controller_killed());
        assert!(matches!(
            child.last_status(),
            Some(WaitStatus::Signaled(_, Signal::SIGKILL, _))
        ));
    }

    #[test]
    fn test_try_wait_reaps_exited_child() {
        let mut child = spawn(|_channel| 7).expect("Failed to spawn child");
        let status = child.wait();
        assert_eq!(status, Some(WaitStatus::Exited(child.pid(), 7)));
        // Further waits return the recorded status without touching waitpid.
        assert_eq!(child.try_wait(), status);
    }
}
