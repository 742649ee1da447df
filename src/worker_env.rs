//! Per-child worker environment.
//!
//! Each child receives an [`EntryState`] at spawn: an opaque caller value,
//! a GC control blob, a shared-heap token and its worker id. The executor
//! installs it process-globally so registered jobs can read it.

use std::any::Any;
use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::{Arc, OnceLock};

use serde::{Deserialize, Serialize};

/// Opaque garbage-collection control blob, relayed to children untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcControl(pub Vec<u8>);

/// Opaque token for a shared memory region children attach to. The pool
/// only relays it; the storage subsystem that issued it defines its
/// meaning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapHandle(pub u64);

/// State handed to a child at spawn. Immutable afterwards.
#[derive(Clone)]
pub struct EntryState {
    /// Opaque caller-supplied value (saved-state restoration input).
    pub saved_state: Arc<dyn Any + Send + Sync>,
    /// GC tuning blob, passed through.
    pub gc_control: GcControl,
    /// Shared-heap token, passed through.
    pub heap: HeapHandle,
    /// Id of the worker this child backs.
    pub worker_id: usize,
}

impl fmt::Debug for EntryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryState")
            .field("gc_control", &self.gc_control)
            .field("heap", &self.heap)
            .field("worker_id", &self.worker_id)
            .finish_non_exhaustive()
    }
}

/// Startup parameters for one worker child.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    /// Whether this child services many jobs or exactly one.
    pub longlived: bool,
    pub entry: EntryState,
    /// Read end of the controller liveness pipe, when present. The child
    /// exits when this descriptor reports hangup.
    pub controller_fd: Option<RawFd>,
}

static ENTRY: OnceLock<EntryState> = OnceLock::new();

/// Install the entry state in this process. Called once by the executor,
/// before the first job runs.
pub(crate) fn install(entry: EntryState) {
    let _ = ENTRY.set(entry);
}

/// Entry state of the current process, if this process is a worker child.
pub fn entry_state() -> Option<&'static EntryState> {
    ENTRY.get()
}
