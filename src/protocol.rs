//! Wire protocol for the controller ↔ worker job exchange.
//!
//! Messages are JSON payloads inside length-prefixed frames. After the
//! long-lived startup handshake, one call produces exactly one request
//! frame and one response frame; end-of-file before a complete response
//! denotes a dead child.

use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ipc::Channel;

/// Execution mode requested for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecMode {
    /// Executed in-process by a persistent worker that then awaits the
    /// next request.
    Persistent,
    /// Executed by a throwaway child that exits after this one job.
    ClonePerCall,
}

/// Request from controller to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerRequest {
    /// Dispatch one job: a registered entry tag plus its serialized
    /// argument.
    Job {
        call_id: u64,
        entry: String,
        arg: Value,
        /// Whether the pool's call wrapper applies to this job.
        wrapped: bool,
        mode: ExecMode,
    },

    /// Graceful shutdown request.
    Exit,
}

/// Response from worker to controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerResponse {
    /// Long-lived worker startup handshake, sent once before the first
    /// request.
    Ready,

    /// Job completed; `value` is the serialized result.
    Ok { value: Value },

    /// Job failed; carries the user-side error rendered as text.
    Failed { message: String },
}

impl WorkerRequest {
    /// Serialize to a frame payload.
    pub fn to_frame(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("WorkerRequest serialization failed")
    }

    /// Deserialize from a frame payload.
    pub fn from_frame(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Write this request as one frame on `channel`.
    pub fn send(&self, channel: &mut Channel) -> io::Result<()> {
        channel.send(&self.to_frame())
    }

    /// Read one request frame from `channel`. `None` on clean EOF.
    pub fn recv(channel: &mut Channel) -> io::Result<Option<Self>> {
        match channel.recv()? {
            Some(payload) => Self::from_frame(&payload)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}

impl WorkerResponse {
    /// Create a successful response.
    pub fn ok(value: Value) -> Self {
        Self::Ok { value }
    }

    /// Create a failed response.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Serialize to a frame payload.
    pub fn to_frame(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("WorkerResponse serialization failed")
    }

    /// Deserialize from a frame payload.
    pub fn from_frame(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    /// Write this response as one frame on `channel`.
    pub fn send(&self, channel: &mut Channel) -> io::Result<()> {
        channel.send(&self.to_frame())
    }

    /// Read one response frame from `channel`. `None` on clean EOF.
    pub fn recv(channel: &mut Channel) -> io::Result<Option<Self>> {
        match channel.recv()? {
            Some(payload) => Self::from_frame(&payload)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            None => Ok(None),
        }
    }
}
