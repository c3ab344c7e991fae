use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::job::{RequestId, ScriptRef, WorkerId};

/// Terminal failure of a single job.
///
/// This is the value carried by `error` envelopes, so it serializes with a
/// `kind` tag that survives the trip through the event stream.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobError {
    /// The job's own code failed, or its script could not be loaded.
    #[error("script error: {message}")]
    Script { message: String },
    /// The job named a module or entry point nobody registered.
    #[error("{what} not found")]
    NotFound { what: String },
    /// The worker executing the job died before posting an outcome.
    #[error("worker {worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: WorkerId, reason: String },
    /// The job was abandoned because its worker or dispatcher was torn down.
    #[error("job cancelled")]
    Cancelled,
    /// A request id was submitted while an identical one was still pending.
    #[error("request {request_id} is already pending")]
    DuplicateRequest { request_id: RequestId },
    /// A bridge call was made after the job it belongs to had finished.
    #[error("script context used after its job completed")]
    ContextClosed,
}

impl JobError {
    pub fn not_found(what: impl Into<String>) -> Self {
        JobError::NotFound { what: what.into() }
    }

    pub fn script(message: impl Into<String>) -> Self {
        JobError::Script {
            message: message.into(),
        }
    }

    /// Flatten an executor error chain into a script error.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        JobError::Script {
            message: format!("{err:#}"),
        }
    }

    /// Short label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Script { .. } => "script",
            JobError::NotFound { .. } => "not_found",
            JobError::WorkerCrashed { .. } => "worker_crashed",
            JobError::Cancelled => "cancelled",
            JobError::DuplicateRequest { .. } => "duplicate_request",
            JobError::ContextClosed => "context_closed",
        }
    }
}

/// Failure to get a submission in front of a worker.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeployError {
    #[error("submission {request_id} carries neither a script_uri nor an inline script")]
    MissingScript { request_id: RequestId },
    #[error("script {script_ref} could not be resolved: {message}")]
    Unresolvable { script_ref: ScriptRef, message: String },
    #[error("script {script_ref} could not be stored: {message}")]
    Store { script_ref: ScriptRef, message: String },
    #[error("request {request_id} is already in flight")]
    Duplicate { request_id: RequestId },
    #[error("dispatcher has been terminated")]
    Closed,
}

/// Failure while polling the object store for a result.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("no result at {url} after {attempts} attempts within {budget:?}")]
    Timeout {
        url: String,
        attempts: u32,
        budget: Duration,
    },
    #[error("result at {url} is not valid JSON: {message}")]
    InvalidPayload { url: String, message: String },
    #[error("empty result received from {url}")]
    EmptyResult { url: String },
}

/// Any error surfaced by the crate's high-level entry points.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Job(#[from] JobError),
    #[error(transparent)]
    Deploy(#[from] DeployError),
    #[error(transparent)]
    Poll(#[from] PollError),
}
