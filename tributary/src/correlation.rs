use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::error::JobError;
use crate::job::{RequestId, WorkerId};

/// Continuation fired with a job's terminal outcome.
pub(crate) type Reply = oneshot::Sender<Result<Value, JobError>>;

#[derive(Debug)]
struct PendingCall {
    worker_id: WorkerId,
    reply: Reply,
}

/// Pending-call table mapping request ids to the caller awaiting them.
///
/// Owned by exactly one actor, so there is no locking. Every entry fires at
/// most once: resolving removes it, and later outcomes for the same id are
/// reported as unknown.
#[derive(Debug, Default)]
pub struct PendingCallTable {
    calls: HashMap<RequestId, PendingCall>,
}

impl PendingCallTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a continuation. Returns `false` and leaves the table alone
    /// when the id is already pending.
    pub(crate) fn insert(&mut self, request_id: RequestId, worker_id: WorkerId, reply: Reply) -> bool {
        if self.calls.contains_key(&request_id) {
            return false;
        }
        self.calls.insert(request_id, PendingCall { worker_id, reply });
        true
    }

    /// Fire the continuation for `request_id`.
    ///
    /// Returns the worker that owned the call, or `None` when nothing was
    /// pending (an unknown or already-resolved id).
    pub fn resolve(
        &mut self,
        request_id: &RequestId,
        outcome: Result<Value, JobError>,
    ) -> Option<WorkerId> {
        let call = self.calls.remove(request_id)?;
        if call.reply.send(outcome).is_err() {
            trace!(request_id = %request_id, "caller stopped waiting before the outcome arrived");
        }
        Some(call.worker_id)
    }

    /// Worker a pending call was routed to.
    pub fn worker_of(&self, request_id: &RequestId) -> Option<&WorkerId> {
        self.calls.get(request_id).map(|call| &call.worker_id)
    }

    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.calls.contains_key(request_id)
    }

    /// Fail every call routed to `worker_id`, returning the affected ids.
    pub fn fail_worker(&mut self, worker_id: &WorkerId, error: &JobError) -> Vec<RequestId> {
        let ids: Vec<RequestId> = self
            .calls
            .iter()
            .filter(|(_, call)| &call.worker_id == worker_id)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &ids {
            self.resolve(id, Err(error.clone()));
        }
        if !ids.is_empty() {
            debug!(worker_id = %worker_id, failed = ids.len(), error = %error, "failed pending calls of worker");
        }
        ids
    }

    /// Fail everything still pending. Returns how many calls were failed.
    pub fn fail_all(&mut self, error: &JobError) -> usize {
        let drained: Vec<(RequestId, PendingCall)> = self.calls.drain().collect();
        let count = drained.len();
        for (request_id, call) in drained {
            if call.reply.send(Err(error.clone())).is_err() {
                trace!(request_id = %request_id, "caller gone during teardown");
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Pending ids, sorted for stable output.
    pub fn request_ids(&self) -> Vec<RequestId> {
        let mut ids: Vec<RequestId> = self.calls.keys().cloned().collect();
        ids.sort();
        ids
    }
}
