//! Future-style handle for an outstanding call.
//!
//! A handle binds one pending job to the worker running it and lazily
//! reads the result from the worker channel. It is single-consumer: the
//! first `get_result` performs the read, later calls return the cached
//! outcome. The handle pins its worker busy until the result is consumed,
//! the worker is observed dead, or the call is cancelled.

use std::cell::RefCell;
use std::fmt;
use std::os::unix::io::RawFd;
use std::rc::Rc;

use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::daemon::ChildProc;
use crate::error::{Error, Result};
use crate::pool::PoolCore;
use crate::protocol::WorkerResponse;
use crate::status::{QuitStatus, WorkerFailure, classify_wait_status, quit_status_of};
use crate::worker::HandleMeta;

/// Resolved outcome cached on the handle.
enum Outcome<R> {
    Ok(R),
    Failed { pid: i32, failure: WorkerFailure },
}

/// A future bound to one outstanding job on one worker.
///
/// The worker is addressed by id through the pool arena; the handle holds
/// no strong worker reference, only the shared child-process handle its
/// result arrives on.
pub struct JobHandle<A, R> {
    core: Rc<PoolCore>,
    meta: Rc<HandleMeta>,
    job: A,
    proc_: Rc<RefCell<ChildProc>>,
    outcome: Option<Outcome<R>>,
}

impl<A, R> JobHandle<A, R> {
    pub(crate) fn new(
        core: Rc<PoolCore>,
        meta: Rc<HandleMeta>,
        job: A,
        proc_: Rc<RefCell<ChildProc>>,
    ) -> Self {
        Self {
            core,
            meta,
            job,
            proc_,
            outcome: None,
        }
    }

    /// Caller-supplied correlation tag, returned verbatim.
    pub fn call_id(&self) -> u64 {
        self.meta.call_id()
    }

    /// The original argument, retained so schedulers can requeue on
    /// failure.
    pub fn job(&self) -> &A {
        &self.job
    }

    /// Id of the worker running this job.
    pub fn worker_id(&self) -> usize {
        self.meta.worker_id()
    }

    /// Pid of the child executing this job.
    pub fn pid(&self) -> i32 {
        self.proc_.borrow().pid_raw()
    }

    pub fn is_cancelled(&self) -> bool {
        self.meta.is_cancelled()
    }

    /// Whether the outcome has already been read.
    pub fn is_resolved(&self) -> bool {
        self.outcome.is_some()
    }

    /// Read-side descriptor of the result channel, for readiness polling.
    /// `None` once the channel is severed.
    pub(crate) fn read_fd(&self) -> Option<RawFd> {
        self.proc_.borrow().read_fd()
    }

    /// Ready without consulting poll: resolved, cancelled, severed, or on
    /// a force-quit worker (whose channel reports EOF anyway).
    pub(crate) fn ready_now(&self) -> bool {
        self.outcome.is_some()
            || self.meta.is_cancelled()
            || self.core.slot(self.worker_id()).borrow().is_force_quit()
            || self.read_fd().is_none()
    }

    /// Cancel this call: sever the result channel, kill the child, and
    /// release the worker. After this returns no result of the call can be
    /// observed; `get_result` resolves promptly with a worker failure.
    pub fn cancel(&mut self) {
        if self.outcome.is_some() || self.meta.is_cancelled() {
            return;
        }
        self.meta.set_cancelled();
        debug!(
            worker_id = self.worker_id(),
            call_id = self.call_id(),
            "cancelling call"
        );
        self.proc_.borrow_mut().kill();
        let status = self.proc_.borrow().last_status().map(quit_status_of);

        let slot_cell = self.core.slot(self.worker_id());
        let mut slot = slot_cell.borrow_mut();
        slot.release();
        slot.take_proc();
        if slot.is_longlived() {
            // The persistent child had a request in flight; the record
            // cannot be reused.
            slot.set_force_quit();
            if let Some(status) = status {
                slot.note_exit_status(status);
            }
        }
    }
}

impl<A, R: DeserializeOwned> JobHandle<A, R> {
    /// Block until the job's result is available.
    ///
    /// On success the worker returns to idle and the value is cached. On a
    /// failed response or a dead channel the worker is condemned and the
    /// error identifies the child pid and the failure kind. Idempotent
    /// once resolved: later calls return the cached outcome without
    /// touching the channel.
    pub fn get_result(&mut self) -> Result<&R> {
        if self.outcome.is_none() {
            let outcome = self.resolve();
            self.outcome = Some(outcome);
        }
        match self.outcome.as_ref().expect("outcome just cached") {
            Outcome::Ok(value) => Ok(value),
            Outcome::Failed { pid, failure } => Err(Error::WorkerFailed {
                pid: *pid,
                failure: failure.clone(),
            }),
        }
    }

    fn resolve(&mut self) -> Outcome<R> {
        let worker_id = self.worker_id();
        let pid = self.pid();

        if self.meta.is_cancelled() {
            // Cancel already killed the child and severed the channel.
            let failure = self.death_failure();
            return Outcome::Failed { pid, failure };
        }

        let response = {
            let mut proc_ = self.proc_.borrow_mut();
            match proc_.channel_mut() {
                Some(channel) => WorkerResponse::recv(channel),
                None => Ok(None), // Severed: same as EOF
            }
        };

        match response {
            Ok(Some(WorkerResponse::Ok { value })) => match serde_json::from_value::<R>(value) {
                Ok(value) => {
                    self.release_worker_ok();
                    Outcome::Ok(value)
                }
                Err(e) => {
                    warn!(worker_id, pid, error = %e, "undecodable worker result");
                    self.condemn();
                    Outcome::Failed {
                        pid,
                        failure: WorkerFailure::JobFailed(format!("result decode: {}", e)),
                    }
                }
            },

            Ok(Some(WorkerResponse::Failed { message })) => {
                debug!(worker_id, pid, "worker reported failed job");
                self.condemn();
                Outcome::Failed {
                    pid,
                    failure: WorkerFailure::JobFailed(message),
                }
            }

            Ok(Some(WorkerResponse::Ready)) => {
                warn!(worker_id, pid, "unexpected ready frame in call cycle");
                self.condemn();
                Outcome::Failed {
                    pid,
                    failure: WorkerFailure::JobFailed("unexpected ready frame".into()),
                }
            }

            // EOF or transport error before a complete response: the child
            // is gone.
            Ok(None) | Err(_) => {
                let failure = self.death_failure();
                Outcome::Failed { pid, failure }
            }
        }
    }

    /// Success path: the worker returns to idle; a clone child is reaped
    /// and its record goes back to dormant.
    fn release_worker_ok(&mut self) {
        let longlived = {
            let slot_cell = self.core.slot(self.worker_id());
            let mut slot = slot_cell.borrow_mut();
            slot.mark_free();
            slot.note_completed();
            if !slot.is_longlived() {
                slot.take_proc();
            }
            slot.is_longlived()
        };
        if !longlived {
            let mut proc_ = self.proc_.borrow_mut();
            proc_.sever();
            let _ = proc_.wait(); // Reap the exited clone
        }
    }

    /// Classify a dead child, then condemn the worker record.
    fn death_failure(&mut self) -> WorkerFailure {
        let failure = {
            let mut proc_ = self.proc_.borrow_mut();
            proc_.sever();
            match proc_.wait() {
                Some(status) => classify_wait_status(status, proc_.controller_killed()),
                None => WorkerFailure::Quit(QuitStatus::Unknown),
            }
        };
        warn!(
            worker_id = self.worker_id(),
            pid = self.pid(),
            failure = %failure,
            "worker died"
        );
        self.condemn();
        failure
    }

    /// Failure path: a long-lived record is condemned; a clone record
    /// returns to dormant idle so the next call forks a fresh child.
    fn condemn(&mut self) {
        self.proc_.borrow_mut().kill();
        let status = self.proc_.borrow().last_status().map(quit_status_of);

        let slot_cell = self.core.slot(self.worker_id());
        let mut slot = slot_cell.borrow_mut();
        slot.release();
        slot.take_proc();
        if slot.is_longlived() {
            slot.set_force_quit();
            if let Some(status) = status {
                slot.note_exit_status(status);
            }
        }
    }
}

impl<A: fmt::Debug, R> fmt::Debug for JobHandle<A, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("worker_id", &self.worker_id())
            .field("call_id", &self.call_id())
            .field("job", &self.job)
            .field("resolved", &self.outcome.is_some())
            .field("cancelled", &self.meta.is_cancelled())
            .finish()
    }
}

impl<A, R> Drop for JobHandle<A, R> {
    fn drop(&mut self) {
        if self.outcome.is_none() && !self.meta.is_cancelled() {
            let busy = self.core.slot(self.worker_id()).borrow().is_busy();
            if busy {
                // Dropping an unconsumed handle leaves the worker busy
                // forever.
                tracing::error!(
                    worker_id = self.worker_id(),
                    call_id = self.call_id(),
                    "job handle dropped without consuming its result"
                );
                debug_assert!(
                    std::thread::panicking(),
                    "job handle dropped without consuming its result"
                );
            }
        }
    }
}
