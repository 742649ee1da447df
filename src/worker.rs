//! In-controller bookkeeping record for one worker.
//!
//! Slots are manipulated on the single controller thread only, so they
//! carry no locking; the pool stores them in `RefCell`s.

#![allow(dead_code)] // Some queries are for schedulers and monitoring

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::trace;

use crate::daemon::ChildProc;
use crate::error::{Error, Result};
use crate::status::QuitStatus;

/// Metadata view of the handle currently running on a worker.
///
/// This is the deliberately type-erased record stored on the worker slot:
/// call id, worker id and the cancellation flag only. The result channel
/// is never reachable through it; schedulers that need more must keep
/// their own typed handle.
#[derive(Debug)]
pub struct HandleMeta {
    call_id: u64,
    worker_id: usize,
    cancelled: Cell<bool>,
}

impl HandleMeta {
    pub(crate) fn new(call_id: u64, worker_id: usize) -> Self {
        Self {
            call_id,
            worker_id,
            cancelled: Cell::new(false),
        }
    }

    pub fn call_id(&self) -> u64 {
        self.call_id
    }

    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub(crate) fn set_cancelled(&self) {
        self.cancelled.set(true);
    }
}

/// One worker record: identity, mode, liveness and the busy/free protocol.
pub(crate) struct WorkerSlot {
    id: usize,
    longlived: bool,
    /// Live child of a long-lived worker, or the in-flight clone child.
    proc_: Option<Rc<RefCell<ChildProc>>>,
    busy: bool,
    force_quit: bool,
    current: Option<Rc<HandleMeta>>,
    /// Exit status recorded when the child was observed dead.
    exit_status: Option<QuitStatus>,
    jobs_completed: u64,
}

impl WorkerSlot {
    pub fn new(id: usize, longlived: bool) -> Self {
        Self {
            id,
            longlived,
            proc_: None,
            busy: false,
            force_quit: false,
            current: None,
            exit_status: None,
            jobs_completed: 0,
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn is_longlived(&self) -> bool {
        self.longlived
    }

    pub fn is_busy(&self) -> bool {
        self.busy
    }

    pub fn is_force_quit(&self) -> bool {
        self.force_quit
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// Mark the worker busy and record its outstanding handle.
    ///
    /// Fails with `WorkerBusy` when an outstanding call exists; that is a
    /// scheduler invariant violation, not a runtime condition.
    pub fn mark_busy(&mut self, meta: Rc<HandleMeta>) -> Result<()> {
        if self.busy {
            return Err(Error::WorkerBusy);
        }
        debug_assert!(!self.force_quit, "mark_busy on a force-quit worker");
        self.busy = true;
        self.current = Some(meta);
        trace!(worker_id = self.id, "worker busy");
        Ok(())
    }

    /// Return the worker to idle after a consumed result.
    pub fn mark_free(&mut self) {
        debug_assert!(self.busy, "mark_free on an idle worker");
        self.busy = false;
        self.current = None;
        trace!(worker_id = self.id, "worker free");
    }

    /// Clear the busy mark on a failure or cancellation path. Unlike
    /// `mark_free` this tolerates a slot already released by force-quit.
    pub fn release(&mut self) {
        self.busy = false;
        self.current = None;
    }

    pub fn note_completed(&mut self) {
        self.jobs_completed += 1;
    }

    /// Metadata of the outstanding handle, when busy.
    pub fn current_handle(&self) -> Option<Rc<HandleMeta>> {
        self.current.clone()
    }

    /// Transition to the terminal state. The record stays addressable but
    /// refuses new calls.
    pub fn set_force_quit(&mut self) {
        self.force_quit = true;
        self.busy = false;
        self.current = None;
    }

    pub fn note_exit_status(&mut self, status: QuitStatus) {
        self.exit_status = Some(status);
    }

    pub fn exit_status(&self) -> Option<QuitStatus> {
        self.exit_status
    }

    pub fn proc(&self) -> Option<Rc<RefCell<ChildProc>>> {
        self.proc_.clone()
    }

    pub fn set_proc(&mut self, proc_: Rc<RefCell<ChildProc>>) {
        self.proc_ = Some(proc_);
    }

    pub fn take_proc(&mut self) -> Option<Rc<RefCell<ChildProc>>> {
        self.proc_.take()
    }
}
