use futures::future::BoxFuture;
use serde_json::Value;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{AbortHandle, JoinError};
use tracing::{debug, error, trace};

use super::pool::{Upstream, WorkerPool};
use super::scheduler::SchedulerContext;
use crate::error::JobError;
use crate::job::{JobRequest, RequestId, WorkerId};
use crate::protocol::Envelope;
use crate::script::context::{ScriptContext, StepWait};
use crate::script::Executors;
use crate::telemetry::{self, JobTimingHandle};

/// Traffic from a worker to its owner.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Envelope {
        worker_id: WorkerId,
        envelope: Envelope,
    },
    Exited {
        worker_id: WorkerId,
        cause: ExitCause,
    },
}

/// Why a worker task ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum ExitCause {
    /// The inbox closed and the loop returned.
    Finished,
    /// The task panicked, usually inside a job.
    Crashed(String),
    /// The owner aborted the task.
    Aborted,
}

impl ExitCause {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            ExitCause::Finished => "finished",
            ExitCause::Crashed(_) => "crashed",
            ExitCause::Aborted => "aborted",
        }
    }

    /// Error reported for jobs that were still held by the worker.
    pub(crate) fn into_error(self, worker_id: &WorkerId) -> JobError {
        match self {
            ExitCause::Crashed(reason) => JobError::WorkerCrashed {
                worker_id: worker_id.clone(),
                reason,
            },
            ExitCause::Finished => JobError::WorkerCrashed {
                worker_id: worker_id.clone(),
                reason: "worker stopped unexpectedly".to_string(),
            },
            ExitCause::Aborted => JobError::Cancelled,
        }
    }
}

/// Owner-side handle to a running worker.
#[derive(Debug)]
pub(crate) struct WorkerHandle {
    id: WorkerId,
    inbox: mpsc::UnboundedSender<Envelope>,
    abort: AbortHandle,
}

impl WorkerHandle {
    pub(crate) fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Queue an envelope. Returns `false` once the worker is gone.
    pub(crate) fn send(&self, envelope: Envelope) -> bool {
        self.inbox.send(envelope).is_ok()
    }

    /// Hard-stop the worker. Its in-progress job is dropped mid-flight.
    pub(crate) fn terminate(&self) {
        self.abort.abort();
    }
}

/// Start a worker task plus a watcher that reports how it ended on `outbound`.
pub(crate) fn spawn_worker(
    id: WorkerId,
    context: SchedulerContext,
    outbound: mpsc::UnboundedSender<WorkerEvent>,
) -> WorkerHandle {
    let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
    let runtime = WorkerRuntime::new(id.clone(), context, inbox_rx, outbound.clone());
    let task = tokio::spawn(runtime.run());
    let abort = task.abort_handle();

    let watched = id.clone();
    tokio::spawn(async move {
        let cause = exit_cause(task.await);
        if let ExitCause::Crashed(reason) = &cause {
            error!(worker_id = %watched, reason = %reason, "worker crashed");
        }
        let _ = outbound.send(WorkerEvent::Exited {
            worker_id: watched,
            cause,
        });
    });

    telemetry::record_worker_spawned(&id);
    WorkerHandle {
        id,
        inbox: inbox_tx,
        abort,
    }
}

fn exit_cause(result: Result<(), JoinError>) -> ExitCause {
    match result {
        Ok(()) => ExitCause::Finished,
        Err(err) if err.is_panic() => ExitCause::Crashed(panic_message(err.into_panic())),
        Err(_) => ExitCause::Aborted,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "worker panicked".to_string()
    }
}

type Running = BoxFuture<'static, Completion>;

struct Completion {
    job: Arc<JobRequest>,
    executors: Executors,
    outcome: Result<Value, JobError>,
    closed: Arc<AtomicBool>,
    timing: JobTimingHandle,
}

/// Single-flight execution loop of one worker.
///
/// Jobs are queued FIFO and run one at a time. The executors move into the
/// running job's future and come back with its outcome, so two jobs can never
/// hold them at once.
struct WorkerRuntime {
    id: WorkerId,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    outbound: mpsc::UnboundedSender<WorkerEvent>,
    steps_tx: mpsc::UnboundedSender<StepWait>,
    steps_rx: mpsc::UnboundedReceiver<StepWait>,
    queue: VecDeque<JobRequest>,
    step_waits: HashMap<RequestId, Vec<oneshot::Sender<Value>>>,
    pool: WorkerPool,
    executors: Option<Executors>,
}

impl WorkerRuntime {
    fn new(
        id: WorkerId,
        context: SchedulerContext,
        inbox: mpsc::UnboundedReceiver<Envelope>,
        outbound: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let (steps_tx, steps_rx) = mpsc::unbounded_channel();
        let pool = WorkerPool::spawn(
            context.clone(),
            Upstream::Worker {
                worker_id: id.clone(),
                outbound: outbound.clone(),
            },
        );

        Self {
            executors: Some(context.executors()),
            id,
            inbox,
            outbound,
            steps_tx,
            steps_rx,
            queue: VecDeque::new(),
            step_waits: HashMap::new(),
            pool,
        }
    }

    async fn run(mut self) {
        debug!(worker_id = %self.id, "worker started");
        let mut running: Option<Running> = None;

        loop {
            if running.is_none() {
                running = self.start_next();
            }

            tokio::select! {
                biased;

                // Step registrations first: a job that suspended during the
                // last poll must be waiting before any step is delivered.
                Some(wait) = self.steps_rx.recv() => self.register_step_wait(wait),
                completion = next_completion(&mut running), if running.is_some() => {
                    running = None;
                    self.finish(completion);
                }
                message = self.inbox.recv() => match message {
                    Some(envelope) => self.handle_inbound(envelope),
                    None => break,
                },
            }
        }

        debug!(
            worker_id = %self.id,
            abandoned = self.queue.len() + usize::from(running.is_some()),
            "worker inbox closed; stopping"
        );
    }

    fn start_next(&mut self) -> Option<Running> {
        let job = self.queue.pop_front()?;
        let Some(executors) = self.executors.take() else {
            self.queue.push_front(job);
            return None;
        };
        Some(self.start(job, executors))
    }

    fn start(&self, job: JobRequest, mut executors: Executors) -> Running {
        let job = Arc::new(job);
        let closed = Arc::new(AtomicBool::new(false));
        let ctx = ScriptContext::new(
            Arc::clone(&job),
            self.id.clone(),
            self.pool.clone(),
            self.outbound.clone(),
            self.steps_tx.clone(),
            Arc::clone(&closed),
        );
        let timing = telemetry::record_job_start(&job.request_id);
        let (request_id, entry_point) = (job.request_id.clone(), job.entry_point.clone());

        Box::pin(telemetry::instrument_job(
            request_id,
            self.id.clone(),
            entry_point,
            async move {
                let outcome = executors.execute(&job, ctx).await;
                Completion {
                    job,
                    executors,
                    outcome,
                    closed,
                    timing,
                }
            },
        ))
    }

    fn finish(&mut self, completion: Completion) {
        let Completion {
            job,
            executors,
            outcome,
            closed,
            timing,
        } = completion;

        closed.store(true, Ordering::Release);
        self.executors = Some(executors);
        self.step_waits.remove(&job.request_id);

        let status = match &outcome {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        telemetry::record_job_end(timing, job.framework.as_str(), status);

        let envelope = Envelope::outcome(job.request_id.clone(), outcome);
        if self
            .outbound
            .send(WorkerEvent::Envelope {
                worker_id: self.id.clone(),
                envelope,
            })
            .is_err()
        {
            debug!(worker_id = %self.id, request_id = %job.request_id, "owner gone; outcome dropped");
        }
    }

    fn handle_inbound(&mut self, envelope: Envelope) {
        match envelope {
            Envelope::Request(job) | Envelope::SubRequest(job) => {
                trace!(
                    worker_id = %self.id,
                    request_id = %job.request_id,
                    queued = self.queue.len(),
                    "job queued"
                );
                self.queue.push_back(job);
            }
            Envelope::Step { request_id, step } => self.deliver_step(request_id, step),
            other => debug!(
                worker_id = %self.id,
                kind = other.type_name(),
                request_id = %other.request_id(),
                "ignoring unexpected inbound envelope"
            ),
        }
    }

    fn register_step_wait(&mut self, wait: StepWait) {
        self.step_waits
            .entry(wait.request_id)
            .or_default()
            .push(wait.reply);
    }

    /// Resume jobs waiting on `request_id`; otherwise pass the step down to
    /// the sub-pool, where a descendant job may be waiting for it.
    fn deliver_step(&mut self, request_id: RequestId, step: Value) {
        match self.step_waits.remove(&request_id) {
            Some(waiters) => {
                trace!(worker_id = %self.id, request_id = %request_id, "step delivered");
                for waiter in waiters {
                    let _ = waiter.send(step.clone());
                }
            }
            None => {
                if !self.pool.step(request_id, step) {
                    debug!(worker_id = %self.id, "sub-pool closed; step dropped");
                }
            }
        }
    }
}

async fn next_completion(running: &mut Option<Running>) -> Completion {
    match running.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}
