use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn, Instrument};

use super::scheduler::SchedulerContext;
use super::shutdown::ShutdownToken;
use super::worker::{spawn_worker, WorkerEvent, WorkerHandle};
use crate::error::{DeployError, Error, JobError};
use crate::events::{DispatchEvent, DispatchEventPayload, EventBus};
use crate::job::{JobRequest, JobSubmission, RequestId, ScriptRef, WorkerId};
use crate::protocol::Envelope;
use crate::telemetry;

enum DispatcherCommand {
    Dispatch {
        job: JobRequest,
        reply: oneshot::Sender<Result<(), DeployError>>,
    },
    Post { envelope: Envelope },
    Terminate { reply: Option<oneshot::Sender<()>> },
}

/// Host-facing entry point that owns one top-level worker.
///
/// Outcomes are not returned from [`JobDispatcher::deploy`]; they arrive on
/// the event stream from [`JobDispatcher::subscribe`]. Dropping the
/// dispatcher terminates its worker.
pub struct JobDispatcher {
    context: SchedulerContext,
    commands: mpsc::UnboundedSender<DispatcherCommand>,
    events: EventBus,
}

impl std::fmt::Debug for JobDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobDispatcher")
            .field("events", &self.events)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

impl JobDispatcher {
    pub(crate) fn spawn(context: SchedulerContext) -> Self {
        let events = EventBus::new(context.config().dispatcher.event_capacity);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (worker_events_tx, worker_events_rx) = mpsc::unbounded_channel();
        let actor = DispatcherActor {
            context: context.clone(),
            commands: commands_rx,
            worker_events_tx,
            worker_events_rx,
            worker: None,
            in_flight: HashSet::new(),
            events: events.clone(),
            shutdown: context.shutdown_token(),
        };
        tokio::spawn(actor.run());

        Self {
            context,
            commands: commands_tx,
            events,
        }
    }

    /// Receive results, errors and messages for every job deployed here.
    /// Subscribe before deploying to be sure not to miss anything.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Resolve or upload the submission's script and hand the job to the
    /// top-level worker. Returns the job's request id.
    ///
    /// A request id that is still in flight is rejected with
    /// [`DeployError::Duplicate`]; the running job is left alone.
    pub async fn deploy(&self, submission: JobSubmission) -> Result<RequestId, DeployError> {
        let request_id = submission
            .request_id
            .clone()
            .unwrap_or_else(RequestId::generate);
        let span = telemetry::deploy_span(&request_id, submission.framework.as_str());

        async move {
            let script_ref = self.prepare_script(&request_id, &submission).await?;
            let job = JobRequest {
                request_id: request_id.clone(),
                script_ref,
                framework: submission.framework,
                entry_point: submission.function_name,
                params: submission.params,
                libraries: submission.libraries,
            };

            let (reply, accepted) = oneshot::channel();
            self.commands
                .send(DispatcherCommand::Dispatch { job, reply })
                .map_err(|_| DeployError::Closed)?;
            accepted.await.map_err(|_| DeployError::Closed)??;
            debug!(request_id = %request_id, "job deployed");
            Ok(request_id)
        }
        .instrument(span)
        .await
    }

    async fn prepare_script(
        &self,
        request_id: &RequestId,
        submission: &JobSubmission,
    ) -> Result<ScriptRef, DeployError> {
        if let Some(script_uri) = &submission.script_uri {
            self.context
                .check_resolvable(submission.framework, script_uri)
                .await
                .map_err(|err| DeployError::Unresolvable {
                    script_ref: script_uri.clone(),
                    message: format!("{err:#}"),
                })?;
            return Ok(script_uri.clone());
        }

        let Some(source) = &submission.script else {
            return Err(DeployError::MissingScript {
                request_id: request_id.clone(),
            });
        };

        let prefix = &self.context.config().dispatcher.script_prefix;
        let script_ref = ScriptRef::new(format!(
            "{}/{}.{}",
            prefix.trim_end_matches('/'),
            request_id,
            submission.framework.as_str()
        ));
        let content_type = submission
            .content_type
            .as_deref()
            .unwrap_or_else(|| submission.framework.default_content_type());
        self.context
            .store()
            .store(&script_ref, source, content_type)
            .await
            .map_err(|err| DeployError::Store {
                script_ref: script_ref.clone(),
                message: format!("{err:#}"),
            })?;
        debug!(script_ref = %script_ref, bytes = source.len(), "inline script uploaded");
        Ok(script_ref)
    }

    /// Forward a host message, typically a `step`, to the top-level worker.
    pub fn post(&self, envelope: Envelope) -> Result<(), DeployError> {
        self.commands
            .send(DispatcherCommand::Post { envelope })
            .map_err(|_| DeployError::Closed)
    }

    /// Release a job suspended in `await_step`, at any depth.
    pub fn step(&self, request_id: RequestId, step: Value) -> Result<(), DeployError> {
        self.post(Envelope::Step { request_id, step })
    }

    /// Deploy and wait for the job's terminal outcome.
    pub async fn run(&self, submission: JobSubmission) -> Result<Value, Error> {
        let mut events = self.subscribe();
        let request_id = self.deploy(submission).await?;

        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(outcome) = event.outcome_for(&request_id) {
                        return outcome.map_err(Error::from);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(request_id = %request_id, skipped, "event subscriber lagged");
                }
                Err(RecvError::Closed) => return Err(JobError::Cancelled.into()),
            }
        }
    }

    /// Stop the worker and fail every job still in flight with `Cancelled`.
    pub async fn terminate(&self) {
        let (reply, done) = oneshot::channel();
        if self
            .commands
            .send(DispatcherCommand::Terminate { reply: Some(reply) })
            .is_ok()
        {
            let _ = done.await;
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.commands.is_closed()
    }
}

impl Drop for JobDispatcher {
    fn drop(&mut self) {
        let _ = self
            .commands
            .send(DispatcherCommand::Terminate { reply: None });
    }
}

struct DispatcherActor {
    context: SchedulerContext,
    commands: mpsc::UnboundedReceiver<DispatcherCommand>,
    worker_events_tx: mpsc::UnboundedSender<WorkerEvent>,
    worker_events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    worker: Option<WorkerHandle>,
    in_flight: HashSet<RequestId>,
    events: EventBus,
    shutdown: ShutdownToken,
}

impl DispatcherActor {
    async fn run(mut self) {
        let reply = loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("hosting context shut down; terminating dispatcher");
                    break None;
                }
                command = self.commands.recv() => match command {
                    Some(DispatcherCommand::Dispatch { job, reply }) => {
                        let _ = reply.send(self.dispatch(job));
                    }
                    Some(DispatcherCommand::Post { envelope }) => self.post(envelope),
                    Some(DispatcherCommand::Terminate { reply }) => break reply,
                    None => break None,
                },
                Some(event) = self.worker_events_rx.recv() => self.handle_worker_event(event),
            }
        };

        self.terminate();
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }

    fn dispatch(&mut self, job: JobRequest) -> Result<(), DeployError> {
        let request_id = job.request_id.clone();
        if !self.in_flight.insert(request_id.clone()) {
            warn!(request_id = %request_id, "rejecting deploy with an in-flight request id");
            return Err(DeployError::Duplicate { request_id });
        }

        let worker = self.worker.get_or_insert_with(|| {
            let worker_id = WorkerId::generate();
            info!(worker_id = %worker_id, "starting top-level worker");
            spawn_worker(worker_id, self.context.clone(), self.worker_events_tx.clone())
        });
        if !worker.send(Envelope::Request(job)) {
            debug!(request_id = %request_id, "top-level worker inbox closed; its exit will fail the job");
        }
        telemetry::record_job_submitted(&request_id, worker.id());
        Ok(())
    }

    fn post(&self, envelope: Envelope) {
        match &self.worker {
            Some(worker) => {
                if !worker.send(envelope) {
                    debug!("top-level worker gone; host message dropped");
                }
            }
            None => debug!(
                kind = envelope.type_name(),
                request_id = %envelope.request_id(),
                "no top-level worker; host message dropped"
            ),
        }
    }

    fn handle_worker_event(&mut self, event: WorkerEvent) {
        match event {
            WorkerEvent::Envelope { envelope, .. } => {
                if envelope.is_terminal() {
                    if !self.in_flight.remove(envelope.request_id()) {
                        debug!(
                            request_id = %envelope.request_id(),
                            "ignoring outcome for unknown or already resolved request"
                        );
                        return;
                    }
                    let status = match &envelope {
                        Envelope::Error { error, .. } => error.kind(),
                        _ => "success",
                    };
                    telemetry::record_job_completed(envelope.request_id(), status);
                }
                self.events.publish(DispatchEvent::from_envelope(envelope));
            }
            WorkerEvent::Exited { worker_id, cause } => {
                let current = self.worker.as_ref().map(WorkerHandle::id);
                if current != Some(&worker_id) {
                    return;
                }
                self.worker = None;

                let label = cause.label();
                let error = cause.into_error(&worker_id);
                let failed: Vec<RequestId> = self.in_flight.drain().collect();
                telemetry::record_worker_exit(&worker_id, label, failed.len());
                error!(
                    worker_id = %worker_id,
                    cause = label,
                    failed = failed.len(),
                    "top-level worker failed; it will be recreated on the next deploy"
                );

                self.events.publish(DispatchEvent::new(DispatchEventPayload::WorkerFailed {
                    worker_id,
                    error: error.clone(),
                }));
                for request_id in failed {
                    self.events.publish(DispatchEvent::from_envelope(Envelope::Error {
                        request_id,
                        error: error.clone(),
                    }));
                }
            }
        }
    }

    fn terminate(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.terminate();
            info!(worker_id = %worker.id(), "top-level worker terminated");
        }

        telemetry::record_jobs_cancelled(self.in_flight.len());

        // Deploys still queued behind the shutdown are refused.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let DispatcherCommand::Dispatch { reply, .. } = command {
                let _ = reply.send(Err(DeployError::Closed));
            }
        }

        let cancelled: Vec<RequestId> = self.in_flight.drain().collect();
        for request_id in cancelled {
            self.events.publish(DispatchEvent::from_envelope(Envelope::Error {
                request_id,
                error: JobError::Cancelled,
            }));
        }
    }
}
