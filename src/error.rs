//! Error types for procpool.

use std::io;

use thiserror::Error;

use crate::status::{QuitStatus, WorkerFailure};

/// Main error type for pool operations.
///
/// Three failure taxonomies share this surface: protocol misuse
/// ([`Error::WorkerBusy`], a scheduler bug), transport failure
/// ([`Error::FailedToSendJob`], raised synchronously from dispatch), and
/// execution failure ([`Error::WorkerFailed`], observed when collecting a
/// result). The pool never retries internally; the outer scheduler decides.
#[derive(Error, Debug)]
pub enum Error {
    /// The child backing a call died or reported a failed job. Always
    /// identifies the pid so logs can correlate with OS records.
    #[error("worker {pid} failed: {failure}")]
    WorkerFailed { pid: i32, failure: WorkerFailure },

    /// A second call was issued to a busy worker. This is an
    /// assertion-class error: it signals a scheduler invariant violation,
    /// never a runtime condition.
    #[error("worker is already busy with an outstanding call")]
    WorkerBusy,

    /// The job request could not be delivered to the worker.
    #[error("failed to send job to worker: {0}")]
    FailedToSendJob(SendError),

    /// I/O error outside a worker channel exchange.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Job argument or result could not be converted to its wire form.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Why a job request failed to reach its worker.
#[derive(Error, Debug)]
pub enum SendError {
    /// The channel's peer was already gone when the request was written.
    #[error("worker already exited ({0})")]
    WorkerAlreadyExited(QuitStatus),

    /// The transport failed for another reason.
    #[error("transport error: {0}")]
    Other(io::Error),
}

/// Result type alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
