use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use super::scheduler::SchedulerContext;
use super::shutdown::ShutdownToken;
use super::worker::{spawn_worker, ExitCause, WorkerEvent, WorkerHandle};
use crate::correlation::{PendingCallTable, Reply};
use crate::error::JobError;
use crate::job::{JobRequest, RequestId, WorkerId};
use crate::protocol::Envelope;
use crate::telemetry;

/// Where a pool sends `message` envelopes coming out of its workers.
#[derive(Debug)]
pub(crate) enum Upstream {
    /// Nobody listens; messages are logged and dropped.
    Detached,
    /// Sub-pool of a worker: messages continue through that worker's owner.
    Worker {
        worker_id: WorkerId,
        outbound: mpsc::UnboundedSender<WorkerEvent>,
    },
    /// Root pool with a host-provided sink.
    Sink(mpsc::UnboundedSender<Envelope>),
}

impl Upstream {
    fn forward(&self, envelope: Envelope) {
        let delivered = match self {
            Upstream::Detached => false,
            Upstream::Worker {
                worker_id,
                outbound,
            } => outbound
                .send(WorkerEvent::Envelope {
                    worker_id: worker_id.clone(),
                    envelope,
                })
                .is_ok(),
            Upstream::Sink(sink) => sink.send(envelope).is_ok(),
        };
        if !delivered {
            trace!("message envelope dropped; no upstream listener");
        }
    }
}

/// Outcome of the placement policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Placement {
    Spawn,
    Route(usize),
}

/// Decide where the next job goes given the current per-worker loads.
///
/// A new worker is spawned when the pool is empty, or when every worker is
/// busy and the limit allows one more. Otherwise the first least-loaded
/// worker is used.
pub(crate) fn place(loads: &[usize], worker_limit: usize) -> Placement {
    let saturated = loads.iter().all(|&load| load > 0);
    if loads.is_empty() || (saturated && loads.len() < worker_limit.max(1)) {
        return Placement::Spawn;
    }

    loads
        .iter()
        .enumerate()
        .min_by_key(|(_, load)| **load)
        .map(|(index, _)| Placement::Route(index))
        .unwrap_or(Placement::Spawn)
}

/// Load of one worker at snapshot time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct WorkerLoad {
    pub worker_id: WorkerId,
    pub in_flight: usize,
}

/// Point-in-time view of a pool.
#[derive(Clone, Debug, Serialize)]
pub struct PoolSnapshot {
    pub worker_limit: usize,
    pub workers: Vec<WorkerLoad>,
    pub pending: Vec<RequestId>,
    pub sampled_at: DateTime<Utc>,
}

impl PoolSnapshot {
    /// Sum of in-flight counts across workers.
    pub fn in_flight(&self) -> usize {
        self.workers.iter().map(|worker| worker.in_flight).sum()
    }

    pub fn worker(&self, worker_id: &WorkerId) -> Option<&WorkerLoad> {
        self.workers.iter().find(|worker| &worker.worker_id == worker_id)
    }

    pub fn loads(&self) -> Vec<usize> {
        self.workers.iter().map(|worker| worker.in_flight).collect()
    }
}

enum PoolCommand {
    Submit {
        job: JobRequest,
        reply: Reply,
    },
    Step {
        request_id: RequestId,
        step: Value,
    },
    Snapshot {
        reply: oneshot::Sender<PoolSnapshot>,
    },
    TerminateWorker {
        worker_id: WorkerId,
        reply: oneshot::Sender<bool>,
    },
    Shutdown {
        reply: oneshot::Sender<usize>,
    },
}

/// Handle to a worker pool.
///
/// The pool grows on demand up to its worker limit and never shrinks except
/// when a worker crashes or is terminated. Clones share the same pool; the
/// pool tears itself down once every handle is gone.
#[derive(Clone)]
pub struct WorkerPool {
    commands: mpsc::UnboundedSender<PoolCommand>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

impl WorkerPool {
    pub(crate) fn spawn(context: SchedulerContext, upstream: Upstream) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let actor = PoolActor {
            worker_limit: context.config().pool.effective_limit(),
            shutdown: context.shutdown_token(),
            context,
            entries: Vec::new(),
            pending: PendingCallTable::new(),
            commands: commands_rx,
            events_tx,
            events_rx,
            upstream,
        };
        tokio::spawn(actor.run());
        Self {
            commands: commands_tx,
        }
    }

    /// Place `job` on a worker and wait for its terminal outcome.
    pub async fn submit(&self, job: JobRequest) -> Result<Value, JobError> {
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(PoolCommand::Submit { job, reply })
            .map_err(|_| JobError::Cancelled)?;
        outcome.await.unwrap_or(Err(JobError::Cancelled))
    }

    /// Deliver a `step` payload to whichever worker holds `request_id`.
    ///
    /// Unknown ids are broadcast to every worker so a deeper job can pick
    /// them up. Returns `false` once the pool is gone.
    pub fn step(&self, request_id: RequestId, step: Value) -> bool {
        self.commands
            .send(PoolCommand::Step { request_id, step })
            .is_ok()
    }

    pub async fn snapshot(&self) -> Option<PoolSnapshot> {
        let (reply, snapshot) = oneshot::channel();
        self.commands.send(PoolCommand::Snapshot { reply }).ok()?;
        snapshot.await.ok()
    }

    /// Hard-stop one worker. Its jobs fail with [`JobError::Cancelled`].
    pub async fn terminate_worker(&self, worker_id: &WorkerId) -> bool {
        let (reply, terminated) = oneshot::channel();
        if self
            .commands
            .send(PoolCommand::TerminateWorker {
                worker_id: worker_id.clone(),
                reply,
            })
            .is_err()
        {
            return false;
        }
        terminated.await.unwrap_or(false)
    }

    /// Stop every worker and cancel everything pending. Returns how many
    /// calls were cancelled.
    pub async fn shutdown(&self) -> usize {
        let (reply, cancelled) = oneshot::channel();
        if self.commands.send(PoolCommand::Shutdown { reply }).is_err() {
            return 0;
        }
        cancelled.await.unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }
}

#[derive(Debug)]
struct WorkerEntry {
    handle: WorkerHandle,
    in_flight: usize,
}

struct PoolActor {
    context: SchedulerContext,
    worker_limit: usize,
    entries: Vec<WorkerEntry>,
    pending: PendingCallTable,
    commands: mpsc::UnboundedReceiver<PoolCommand>,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    upstream: Upstream,
    shutdown: ShutdownToken,
}

impl PoolActor {
    async fn run(mut self) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.teardown("scheduler shut down");
                    break;
                }
                command = self.commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command) {
                            break;
                        }
                    }
                    None => {
                        self.teardown("all pool handles dropped");
                        break;
                    }
                },
                Some(event) = self.events_rx.recv() => self.handle_event(event),
            }
        }
    }

    /// Returns `false` once the pool should stop.
    fn handle_command(&mut self, command: PoolCommand) -> bool {
        match command {
            PoolCommand::Submit { job, reply } => self.submit(job, reply),
            PoolCommand::Step { request_id, step } => self.route_step(request_id, step),
            PoolCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
            }
            PoolCommand::TerminateWorker { worker_id, reply } => {
                let _ = reply.send(self.terminate_worker(&worker_id));
            }
            PoolCommand::Shutdown { reply } => {
                let _ = reply.send(self.teardown("pool shut down"));
                return false;
            }
        }
        true
    }

    fn loads(&self) -> Vec<usize> {
        self.entries.iter().map(|entry| entry.in_flight).collect()
    }

    fn submit(&mut self, job: JobRequest, reply: Reply) {
        let request_id = job.request_id.clone();
        if self.pending.contains(&request_id) {
            warn!(request_id = %request_id, "rejecting submission with a pending request id");
            let _ = reply.send(Err(JobError::DuplicateRequest { request_id }));
            return;
        }

        let index = match place(&self.loads(), self.worker_limit) {
            Placement::Spawn => self.spawn_entry(),
            Placement::Route(index) => index,
        };
        let Some(entry) = self.entries.get_mut(index) else {
            let _ = reply.send(Err(JobError::Cancelled));
            return;
        };

        entry.in_flight += 1;
        let worker_id = entry.handle.id().clone();
        self.pending.insert(request_id.clone(), worker_id.clone(), reply);
        if !entry.handle.send(Envelope::SubRequest(job)) {
            // The exit notification that must follow fails the call.
            debug!(worker_id = %worker_id, request_id = %request_id, "worker inbox already closed");
        }
        telemetry::record_job_submitted(&request_id, &worker_id);
    }

    fn spawn_entry(&mut self) -> usize {
        let worker_id = WorkerId::generate();
        let handle = spawn_worker(worker_id.clone(), self.context.clone(), self.events_tx.clone());
        self.entries.push(WorkerEntry {
            handle,
            in_flight: 0,
        });
        info!(
            worker_id = %worker_id,
            pool_size = self.entries.len(),
            worker_limit = self.worker_limit,
            "spawned worker"
        );
        self.entries.len() - 1
    }

    fn entry_mut(&mut self, worker_id: &WorkerId) -> Option<&mut WorkerEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.handle.id() == worker_id)
    }

    fn handle_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Envelope {
                worker_id,
                envelope,
            } => {
                if let Envelope::Message { .. } = envelope {
                    self.upstream.forward(envelope);
                    return;
                }
                let kind = envelope.type_name();
                match envelope.into_outcome() {
                    Some((request_id, outcome)) => self.complete(&worker_id, request_id, outcome),
                    None => debug!(worker_id = %worker_id, kind, "ignoring envelope from worker"),
                }
            }
            WorkerEvent::Exited { worker_id, cause } => self.handle_exit(worker_id, cause),
        }
    }

    fn complete(&mut self, worker_id: &WorkerId, request_id: RequestId, outcome: Result<Value, JobError>) {
        let status = match &outcome {
            Ok(_) => "success",
            Err(err) => err.kind(),
        };
        match self.pending.resolve(&request_id, outcome) {
            Some(owner) => {
                if let Some(entry) = self.entry_mut(&owner) {
                    entry.in_flight = entry.in_flight.saturating_sub(1);
                }
                telemetry::record_job_completed(&request_id, status);
            }
            None => debug!(
                worker_id = %worker_id,
                request_id = %request_id,
                "ignoring outcome for unknown or already resolved request"
            ),
        }
    }

    fn handle_exit(&mut self, worker_id: WorkerId, cause: ExitCause) {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.handle.id() == &worker_id)
        else {
            trace!(worker_id = %worker_id, "exit of a worker no longer in the pool");
            return;
        };

        self.entries.remove(index);
        let label = cause.label();
        let error = cause.into_error(&worker_id);
        let failed = self.pending.fail_worker(&worker_id, &error);
        telemetry::record_worker_exit(&worker_id, label, failed.len());
        warn!(
            worker_id = %worker_id,
            cause = label,
            failed = failed.len(),
            remaining_workers = self.entries.len(),
            "worker left the pool"
        );
    }

    fn terminate_worker(&mut self, worker_id: &WorkerId) -> bool {
        let Some(index) = self
            .entries
            .iter()
            .position(|entry| entry.handle.id() == worker_id)
        else {
            return false;
        };

        let entry = self.entries.remove(index);
        entry.handle.terminate();
        let failed = self.pending.fail_worker(worker_id, &JobError::Cancelled);
        telemetry::record_worker_exit(worker_id, "terminated", failed.len());
        info!(worker_id = %worker_id, cancelled = failed.len(), "worker terminated");
        true
    }

    fn route_step(&self, request_id: RequestId, step: Value) {
        let owner = self.pending.worker_of(&request_id).cloned();
        let targets: Vec<&WorkerEntry> = match &owner {
            Some(owner) => self
                .entries
                .iter()
                .filter(|entry| entry.handle.id() == owner)
                .collect(),
            None => self.entries.iter().collect(),
        };

        trace!(request_id = %request_id, targets = targets.len(), "routing step");
        for entry in targets {
            entry.handle.send(Envelope::Step {
                request_id: request_id.clone(),
                step: step.clone(),
            });
        }
    }

    fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            worker_limit: self.worker_limit,
            workers: self
                .entries
                .iter()
                .map(|entry| WorkerLoad {
                    worker_id: entry.handle.id().clone(),
                    in_flight: entry.in_flight,
                })
                .collect(),
            pending: self.pending.request_ids(),
            sampled_at: Utc::now(),
        }
    }

    fn teardown(&mut self, reason: &str) -> usize {
        let workers = self.entries.len();
        for entry in self.entries.drain(..) {
            entry.handle.terminate();
        }
        let cancelled = self.pending.fail_all(&JobError::Cancelled);
        telemetry::record_jobs_cancelled(cancelled);
        if workers > 0 || cancelled > 0 {
            debug!(reason, workers, cancelled, "pool torn down");
        }
        cancelled
    }
}
