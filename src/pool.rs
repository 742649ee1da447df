//! Pool controller.
//!
//! Builds the fixed-size worker arena, enforces the busy/free protocol,
//! and implements dispatch, cancellation and force-quit. All worker-record
//! mutation happens on the single controller thread; true parallelism
//! comes exclusively from the child processes.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::io;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::pipe;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::daemon::{self, ChildProc};
use crate::error::{Error, Result, SendError};
use crate::handle::JobHandle;
use crate::protocol::{ExecMode, WorkerRequest, WorkerResponse};
use crate::registry::{CallWrapper, JobEntry, JobRegistry};
use crate::status::{QuitStatus, WorkerFailure, classify_wait_status, quit_status_of};
use crate::worker::{HandleMeta, WorkerSlot};
use crate::worker_env::{EntryState, GcControl, HeapHandle, WorkerParams};
use crate::worker_main;

/// Pool construction parameters.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Number of worker records to allocate.
    pub nbr_procs: usize,
    /// Long-lived workers are forked once at `make` and service many jobs
    /// sequentially; otherwise a fresh clone child is forked per call so
    /// each job runs in a throwaway address space.
    pub longlived_workers: bool,
    /// Optional per-worker memory budget. A worker over budget leaves the
    /// protocol with the distinguished OOM status after finishing its
    /// current job.
    pub memory_limit_mib: Option<usize>,
    /// GC tuning blob, relayed to children untouched.
    pub gc_control: GcControl,
    /// Shared-heap token, relayed to children untouched.
    pub heap: HeapHandle,
}

impl Default for PoolConfig {
    fn default() -> Self {
        const DEFAULT_WORKERS: usize = 4;
        Self {
            nbr_procs: DEFAULT_WORKERS,
            longlived_workers: true,
            memory_limit_mib: None,
            gc_control: GcControl::default(),
            heap: HeapHandle::default(),
        }
    }
}

/// Shared pool state: the worker arena plus everything a forked child
/// inherits (registry, wrapper, entry-state template).
pub(crate) struct PoolCore {
    workers: Vec<RefCell<WorkerSlot>>,
    registry: Arc<JobRegistry>,
    wrapper: Option<CallWrapper>,
    saved_state: Arc<dyn Any + Send + Sync>,
    config: PoolConfig,
    /// Read end of the liveness pipe, inherited by every child.
    liveness_read: OwnedFd,
    /// Write end of the liveness pipe. Children poll the read end and
    /// exit when every write end is gone; each child closes its own
    /// inherited copy at startup so only the controller's survives.
    liveness_write: RefCell<Option<OwnedFd>>,
    force_quit: Cell<bool>,
}

impl PoolCore {
    pub(crate) fn slot(&self, worker: usize) -> &RefCell<WorkerSlot> {
        &self.workers[worker]
    }
}

/// Fixed-size pool of subprocess workers.
///
/// Dropping the pool force-quits every worker.
pub struct WorkerPool {
    core: Rc<PoolCore>,
}

impl WorkerPool {
    /// Allocate `nbr_procs` worker records with ids `0..nbr_procs-1`.
    ///
    /// Long-lived mode forks each child immediately and consumes its
    /// startup handshake; clone-per-call records stay dormant until the
    /// first call. `wrapper`, when present, is applied around every user
    /// function inside the child.
    pub fn make(
        config: PoolConfig,
        registry: Arc<JobRegistry>,
        saved_state: Arc<dyn Any + Send + Sync>,
        wrapper: Option<CallWrapper>,
    ) -> Result<Self> {
        info!(
            workers = config.nbr_procs,
            longlived = config.longlived_workers,
            "initializing worker pool"
        );
        let (liveness_read, liveness_write) = pipe().map_err(errno_error)?;

        let longlived = config.longlived_workers;
        let workers = (0..config.nbr_procs)
            .map(|id| RefCell::new(WorkerSlot::new(id, longlived)))
            .collect();
        let pool = Self {
            core: Rc::new(PoolCore {
                workers,
                registry,
                wrapper,
                saved_state,
                config,
                liveness_read,
                liveness_write: RefCell::new(Some(liveness_write)),
                force_quit: Cell::new(false),
            }),
        };

        if longlived {
            for id in 0..pool.core.workers.len() {
                let proc_ = pool.spawn_child(id).map_err(Error::Io)?;
                pool.core.slot(id).borrow_mut().set_proc(proc_);
            }
            // Consume each child's startup handshake before handing the
            // pool out.
            for id in 0..pool.core.workers.len() {
                pool.wait_for_ready(id)?;
            }
            info!(workers = pool.core.workers.len(), "all workers ready");
        }

        Ok(pool)
    }

    /// Number of worker records.
    pub fn worker_count(&self) -> usize {
        self.core.workers.len()
    }

    /// Ids of all worker records, `0..worker_count`.
    pub fn workers(&self) -> Vec<usize> {
        (0..self.core.workers.len()).collect()
    }

    pub fn is_busy(&self, worker: usize) -> bool {
        self.core.slot(worker).borrow().is_busy()
    }

    pub fn is_force_quit(&self, worker: usize) -> bool {
        self.core.slot(worker).borrow().is_force_quit()
    }

    /// Metadata of the handle currently running on `worker`, when busy.
    ///
    /// This is the deliberately type-erased escape hatch for schedulers:
    /// call id, worker id and cancellation flag only, never the channel.
    pub fn current_handle(&self, worker: usize) -> Option<Rc<HandleMeta>> {
        self.core.slot(worker).borrow().current_handle()
    }

    /// Dispatch a job to an idle worker and return its handle without
    /// waiting. Equivalent to [`WorkerPool::call_with_id`] with id 0.
    pub fn call<A, R>(&self, worker: usize, entry: JobEntry<A, R>, arg: A) -> Result<JobHandle<A, R>>
    where
        A: Serialize,
    {
        self.call_with_id(worker, entry, arg, 0)
    }

    /// Dispatch a job with a caller-chosen correlation id.
    ///
    /// Preconditions: the worker is neither busy nor force-quit. A busy
    /// worker fails with `WorkerBusy` (scheduler bug); a force-quit or
    /// unreachable worker fails with `FailedToSendJob` and the scheduler
    /// may retry elsewhere. For clone-per-call workers a fresh child is
    /// forked here and recorded on the handle.
    pub fn call_with_id<A, R>(
        &self,
        worker: usize,
        entry: JobEntry<A, R>,
        arg: A,
        call_id: u64,
    ) -> Result<JobHandle<A, R>>
    where
        A: Serialize,
    {
        {
            let slot = self.core.slot(worker).borrow();
            if slot.is_force_quit() {
                return Err(Error::FailedToSendJob(SendError::WorkerAlreadyExited(
                    slot.exit_status().unwrap_or(QuitStatus::Unknown),
                )));
            }
            if slot.is_busy() {
                return Err(Error::WorkerBusy);
            }
        }

        let arg_value = serde_json::to_value(&arg)?;
        let longlived = self.core.config.longlived_workers;

        let proc_ = {
            let existing = self.core.slot(worker).borrow().proc();
            match existing {
                Some(proc_) => proc_,
                None if longlived => {
                    // The persistent child is gone without a force-quit
                    // mark; nothing to dispatch on.
                    return Err(Error::FailedToSendJob(SendError::WorkerAlreadyExited(
                        QuitStatus::Unknown,
                    )));
                }
                None => {
                    let proc_ = self
                        .spawn_child(worker)
                        .map_err(|e| Error::FailedToSendJob(SendError::Other(e)))?;
                    self.core
                        .slot(worker)
                        .borrow_mut()
                        .set_proc(Rc::clone(&proc_));
                    proc_
                }
            }
        };

        let request = WorkerRequest::Job {
            call_id,
            entry: entry.name().to_string(),
            arg: arg_value,
            wrapped: self.core.wrapper.is_some(),
            mode: if longlived {
                ExecMode::Persistent
            } else {
                ExecMode::ClonePerCall
            },
        };

        let send_result = {
            let mut proc_ = proc_.borrow_mut();
            match proc_.channel_mut() {
                Some(channel) => request.send(channel),
                None => Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "worker channel severed",
                )),
            }
        };
        if let Err(e) = send_result {
            return Err(Error::FailedToSendJob(self.send_failure(worker, &proc_, e)));
        }

        let meta = Rc::new(HandleMeta::new(call_id, worker));
        self.core
            .slot(worker)
            .borrow_mut()
            .mark_busy(Rc::clone(&meta))?;
        debug!(worker_id = worker, call_id, entry = entry.name(), "dispatched job");

        Ok(JobHandle::new(
            Rc::clone(&self.core),
            meta,
            arg,
            proc_,
        ))
    }

    /// Pre-fork the child for a clone-per-call worker. Idempotent: a
    /// parked child, a busy record or a force-quit record is left
    /// untouched, and long-lived workers (spawned by `make`) are a no-op.
    pub fn spawn(&self, worker: usize) -> Result<()> {
        {
            let slot = self.core.slot(worker).borrow();
            if slot.is_longlived()
                || slot.is_force_quit()
                || slot.is_busy()
                || slot.proc().is_some()
            {
                return Ok(());
            }
        }
        let proc_ = self.spawn_child(worker).map_err(Error::Io)?;
        self.core.slot(worker).borrow_mut().set_proc(proc_);
        Ok(())
    }

    /// Close a clone-per-call worker's parked child, if any. Idempotent
    /// and safe to call multiply; the record stays usable.
    pub fn close(&self, worker: usize) {
        let proc_ = {
            let mut slot = self.core.slot(worker).borrow_mut();
            if slot.is_longlived() || slot.is_busy() {
                return;
            }
            slot.take_proc()
        };
        if let Some(proc_) = proc_ {
            proc_.borrow_mut().kill();
        }
    }

    /// Cancel each listed handle. Guarantees: the handles become ready
    /// promptly, no cancelled result is observed after this returns, and
    /// no worker is left stuck busy. Best-effort beyond that: a child mid
    /// computation may still finish and its result is discarded.
    pub fn cancel<A, R>(&self, handles: &mut [JobHandle<A, R>]) {
        for handle in handles {
            handle.cancel();
        }
    }

    /// Kill every live child, sever every channel, and mark every record
    /// terminal. Idempotent; safe during process shutdown and also run on
    /// drop.
    pub fn force_quit_all(&self) {
        if self.core.force_quit.replace(true) {
            return;
        }
        info!("force-quitting worker pool");
        for slot_cell in &self.core.workers {
            let proc_ = slot_cell.borrow_mut().take_proc();
            if let Some(proc_) = proc_ {
                let status = {
                    let mut proc_ = proc_.borrow_mut();
                    proc_.kill();
                    proc_.last_status().map(quit_status_of)
                };
                if let Some(status) = status {
                    slot_cell.borrow_mut().note_exit_status(status);
                }
            }
            slot_cell.borrow_mut().set_force_quit();
        }
        *self.core.liveness_write.borrow_mut() = None;
    }

    /// Gracefully stop idle long-lived workers: send `Exit`, wait up to
    /// `timeout` per worker, escalate to SIGKILL. Busy workers and
    /// clone-per-call records are left untouched.
    pub fn shutdown(&self, timeout: Duration) {
        for id in 0..self.core.workers.len() {
            let proc_ = {
                let slot = self.core.slot(id).borrow();
                if !slot.is_longlived() || slot.is_busy() || slot.is_force_quit() {
                    continue;
                }
                slot.proc()
            };
            let Some(proc_) = proc_ else { continue };
            debug!(worker_id = id, "stopping worker");
            let status = {
                let mut proc_ = proc_.borrow_mut();
                if let Some(channel) = proc_.channel_mut() {
                    let _ = WorkerRequest::Exit.send(channel);
                }
                proc_.stop(timeout);
                proc_.last_status().map(quit_status_of)
            };
            let mut slot = self.core.slot(id).borrow_mut();
            slot.take_proc();
            slot.set_force_quit();
            if let Some(status) = status {
                slot.note_exit_status(status);
            }
        }
    }

    /// Aggregate pool counters.
    pub fn stats(&self) -> PoolStats {
        let mut total_jobs_completed = 0;
        let mut force_quit_count = 0;
        for slot_cell in &self.core.workers {
            let slot = slot_cell.borrow();
            total_jobs_completed += slot.jobs_completed();
            if slot.is_force_quit() {
                force_quit_count += 1;
            }
        }
        PoolStats {
            worker_count: self.core.workers.len(),
            total_jobs_completed,
            force_quit_count,
        }
    }

    /// Fork one child for `worker` and return its process handle.
    fn spawn_child(&self, worker: usize) -> io::Result<Rc<RefCell<ChildProc>>> {
        let core = &self.core;
        let params = WorkerParams {
            longlived: core.config.longlived_workers,
            entry: EntryState {
                saved_state: Arc::clone(&core.saved_state),
                gc_control: core.config.gc_control.clone(),
                heap: core.config.heap,
                worker_id: worker,
            },
            controller_fd: Some(core.liveness_read.as_raw_fd()),
        };
        let child_core = Rc::clone(core);
        let proc_ = daemon::spawn(move |channel| {
            child_side_cleanup(&child_core);
            worker_main::run_worker(
                params,
                &child_core.registry,
                child_core.wrapper.as_ref(),
                child_core.config.memory_limit_mib,
                channel,
            )
        })?;
        Ok(Rc::new(RefCell::new(proc_)))
    }

    /// Consume a long-lived child's startup handshake.
    fn wait_for_ready(&self, worker: usize) -> Result<()> {
        let proc_ = self.core.slot(worker).borrow().proc().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("worker {} not spawned", worker),
            ))
        })?;
        let pid = proc_.borrow().pid_raw();

        let response = {
            let mut proc_ = proc_.borrow_mut();
            match proc_.channel_mut() {
                Some(channel) => WorkerResponse::recv(channel),
                None => Ok(None),
            }
        };
        match response {
            Ok(Some(WorkerResponse::Ready)) => Ok(()),
            Ok(Some(other)) => Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("worker {} sent {:?} before ready", worker, other),
            ))),
            Ok(None) | Err(_) => {
                // Died during startup.
                let failure = {
                    let mut proc_ = proc_.borrow_mut();
                    proc_.sever();
                    match proc_.wait() {
                        Some(status) => classify_wait_status(status, proc_.controller_killed()),
                        None => WorkerFailure::Quit(QuitStatus::Unknown),
                    }
                };
                let mut slot = self.core.slot(worker).borrow_mut();
                slot.take_proc();
                slot.set_force_quit();
                Err(Error::WorkerFailed { pid, failure })
            }
        }
    }

    /// Condemn a worker whose request could not be delivered and shape
    /// the send error.
    fn send_failure(
        &self,
        worker: usize,
        proc_: &Rc<RefCell<ChildProc>>,
        error: io::Error,
    ) -> SendError {
        let status = proc_.borrow_mut().try_wait().map(quit_status_of);
        warn!(worker_id = worker, error = %error, status = ?status, "failed to send job");

        proc_.borrow_mut().kill();
        let mut slot = self.core.slot(worker).borrow_mut();
        slot.take_proc();
        slot.set_force_quit();
        if let Some(status) = status {
            slot.note_exit_status(status);
        }

        match status {
            Some(status) => SendError::WorkerAlreadyExited(status),
            None => SendError::Other(error),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.force_quit_all();
    }
}

/// First thing inside a freshly forked child: disarm this copy's handles
/// to sibling processes (closing the inherited pipe ends keeps their EOF
/// semantics intact for the controller) and drop the inherited controller
/// end of the liveness pipe.
fn child_side_cleanup(core: &PoolCore) {
    for slot_cell in &core.workers {
        if let Some(proc_) = slot_cell.borrow().proc() {
            proc_.borrow_mut().disarm();
        }
    }
    *core.liveness_write.borrow_mut() = None;
}

fn errno_error(errno: nix::errno::Errno) -> Error {
    Error::Io(io::Error::from_raw_os_error(errno as i32))
}

/// Statistics about the worker pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    /// Number of worker records in the pool.
    pub worker_count: usize,
    /// Jobs completed successfully across all workers.
    pub total_jobs_completed: u64,
    /// Records in the terminal force-quit state.
    pub force_quit_count: usize,
}
