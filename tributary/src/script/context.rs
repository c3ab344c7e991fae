use futures::future::join_all;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::error::JobError;
use crate::job::{JobRequest, RequestId, WorkerId};
use crate::protocol::Envelope;
use crate::runtime::pool::WorkerPool;
use crate::runtime::worker::WorkerEvent;

/// Registration of a job suspended in [`ScriptContext::await_step`].
#[derive(Debug)]
pub(crate) struct StepWait {
    pub(crate) request_id: RequestId,
    pub(crate) reply: oneshot::Sender<Value>,
}

/// Host capabilities handed to a running script.
///
/// A context is bound to one job. Once that job has posted its outcome every
/// capability fails with [`JobError::ContextClosed`].
#[derive(Clone)]
pub struct ScriptContext {
    request: Arc<JobRequest>,
    worker_id: WorkerId,
    pool: WorkerPool,
    outbound: mpsc::UnboundedSender<WorkerEvent>,
    steps: mpsc::UnboundedSender<StepWait>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for ScriptContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptContext")
            .field("request_id", &self.request.request_id)
            .field("worker_id", &self.worker_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl ScriptContext {
    pub(crate) fn new(
        request: Arc<JobRequest>,
        worker_id: WorkerId,
        pool: WorkerPool,
        outbound: mpsc::UnboundedSender<WorkerEvent>,
        steps: mpsc::UnboundedSender<StepWait>,
        closed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            request,
            worker_id,
            pool,
            outbound,
            steps,
            closed,
        }
    }

    pub fn request(&self) -> &JobRequest {
        &self.request
    }

    pub fn request_id(&self) -> &RequestId {
        &self.request.request_id
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// Pool that sub-jobs of this job are placed on.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<(), JobError> {
        if self.is_closed() {
            return Err(JobError::ContextClosed);
        }
        Ok(())
    }

    /// Run `entry_point` of the current script as a sub-job and wait for it.
    pub async fn distribute(&self, entry_point: &str, params: Value) -> Result<Value, JobError> {
        self.ensure_open()?;
        let child = self.request.derive(entry_point, params);
        debug!(
            parent = %self.request.request_id,
            child = %child.request_id,
            entry_point,
            "distributing sub-job"
        );
        self.pool.submit(child).await
    }

    /// Fan out one sub-job per parameter and join them.
    ///
    /// Results come back in parameter order. Every sub-job runs to its end;
    /// if any failed, the error of the earliest failing one is returned.
    pub async fn distribute_many<I>(&self, entry_point: &str, params: I) -> Result<Vec<Value>, JobError>
    where
        I: IntoIterator<Item = Value>,
    {
        self.ensure_open()?;
        let children: Vec<JobRequest> = params
            .into_iter()
            .map(|params| self.request.derive(entry_point, params))
            .collect();
        debug!(
            parent = %self.request.request_id,
            entry_point,
            fan_out = children.len(),
            "distributing sub-jobs"
        );

        let outcomes = join_all(children.into_iter().map(|child| self.pool.submit(child))).await;
        outcomes.into_iter().collect()
    }

    /// Emit a non-terminal payload to whoever owns this job.
    pub fn message(&self, data: Value) -> Result<(), JobError> {
        self.ensure_open()?;
        self.outbound
            .send(WorkerEvent::Envelope {
                worker_id: self.worker_id.clone(),
                envelope: Envelope::Message {
                    request_id: self.request.request_id.clone(),
                    data,
                },
            })
            .map_err(|_| JobError::Cancelled)
    }

    /// Suspend until a `step` envelope for this job arrives and return its payload.
    ///
    /// There is no timeout. `hint` is only recorded in the logs.
    pub async fn await_step(&self, hint: Value) -> Result<Value, JobError> {
        self.ensure_open()?;
        let (reply, step) = oneshot::channel();
        self.steps
            .send(StepWait {
                request_id: self.request.request_id.clone(),
                reply,
            })
            .map_err(|_| JobError::Cancelled)?;
        debug!(request_id = %self.request.request_id, hint = %hint, "suspended awaiting step");

        step.await.map_err(|_| JobError::Cancelled)
    }
}
