//! Fixed-size pool of subprocess workers with future-style job handles.
//!
//! A client builds the pool once at startup and dispatches jobs to idle
//! workers; each call returns a handle that can be awaited, polled
//! through a readiness-selection primitive, or cancelled.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─────────────────┐
//!                     │   Controller    │
//!                     │  (WorkerPool)   │
//!                     └────────┬────────┘
//!                              │ framed pipes
//!               ┌──────────────┼──────────────┐
//!               │              │              │
//!         ┌─────▼─────┐  ┌─────▼─────┐  ┌─────▼─────┐
//!         │ Worker 0  │  │ Worker 1  │  │ Worker N  │
//!         │ (process) │  │ (process) │  │ (process) │
//!         └───────────┘  └───────────┘  └───────────┘
//! ```
//!
//! # Features
//!
//! - **Process isolation**: each worker executes jobs in its own address
//!   space; clone-per-call mode forks a throwaway child per job
//! - **Lazy futures**: a [`JobHandle`] reads its result from the worker
//!   channel on first use and caches the outcome
//! - **Readiness selection**: [`select`] partitions pending handles into
//!   ready and waiting without consuming response bytes
//! - **Failure classification**: a dead child surfaces as an OOM or a
//!   quit with the observed exit status, always with its pid
//!
//! The controller runs on a single thread; worker records carry no locks.
//! Jobs are shipped as registered entry tags plus serialized arguments
//! (see [`JobRegistry`]), so the table must be fully registered before
//! the pool forks its first child.

mod daemon;
mod error;
mod handle;
mod ipc;
pub mod logging;
mod pool;
mod protocol;
mod registry;
mod select;
mod status;
mod worker;
pub mod worker_env;
mod worker_main;

pub use error::{Error, Result, SendError};
pub use handle::JobHandle;
pub use pool::{PoolConfig, PoolStats, WorkerPool};
pub use registry::{CallWrapper, JobEntry, JobOutcome, JobRegistry};
pub use select::{Selected, select};
pub use status::{OOM_EXIT_CODE, QuitStatus, WorkerFailure};
pub use worker::HandleMeta;
pub use worker_env::{EntryState, GcControl, HeapHandle, entry_state};
