//! Dispatcher integration tests: deploy paths, host events, step delivery,
//! termination and recovery from a crashed top-level worker.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tributary::{
    DeployError, DispatchEvent, DispatchEventPayload, Envelope, Error, Framework, JobError,
    JobSubmission, RequestId, Scheduler,
};
use tributary_testkit::{
    fixture_scheduler, InterpreterLog, MockInterpreter, Fixture, RecordingScriptStore, FIXTURE_SCRIPT,
};

fn native(entry_point: &str, params: Value) -> JobSubmission {
    JobSubmission::from_uri(FIXTURE_SCRIPT, Framework::Native, entry_point, params)
}

async fn next_event(events: &mut broadcast::Receiver<DispatchEvent>) -> DispatchEvent {
    timeout(Duration::from_secs(2), events.recv())
        .await
        .expect("timed out waiting for a dispatcher event")
        .expect("dispatcher event stream closed")
}

async fn outcome_of(
    events: &mut broadcast::Receiver<DispatchEvent>,
    request_id: &RequestId,
) -> Result<Value, JobError> {
    loop {
        if let Some(outcome) = next_event(events).await.outcome_for(request_id) {
            return outcome;
        }
    }
}

fn interpreted_scheduler(store: &RecordingScriptStore, log: &InterpreterLog) -> Scheduler {
    Scheduler::builder()
        .with_shared_store(Arc::new(store.clone()))
        .with_interpreter(MockInterpreter::factory(log.clone()))
        .with_preloaded_libraries(["pandas"])
        .build()
        .unwrap()
}

#[tokio::test]
async fn run_returns_the_result_of_a_referenced_native_script() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();

    let value = dispatcher.run(native("echo", json!({ "n": 5 }))).await.unwrap();
    assert_eq!(value, json!({ "n": 5 }));
}

#[tokio::test]
async fn script_errors_arrive_as_error_events() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let request_id = dispatcher
        .deploy(native("fail", json!({ "message": "no such column" })))
        .await
        .unwrap();
    let event = next_event(&mut events).await;
    match &event.payload {
        DispatchEventPayload::Error(Envelope::Error { request_id: id, error }) => {
            assert_eq!(id, &request_id);
            assert!(matches!(error, JobError::Script { message } if message.contains("no such column")));
        }
        other => panic!("expected an error event, got {other:?}"),
    }

    let err = dispatcher.run(native("fail", Value::Null)).await.unwrap_err();
    assert!(matches!(err, Error::Job(JobError::Script { .. })));
}

#[tokio::test]
async fn deploy_rejects_unusable_submissions() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();

    let mut empty = native("echo", Value::Null).with_request_id("empty");
    empty.script_uri = None;
    assert_eq!(
        dispatcher.deploy(empty).await.unwrap_err(),
        DeployError::MissingScript { request_id: "empty".into() }
    );

    let unknown = JobSubmission::from_uri("not-registered", Framework::Native, "run", Value::Null);
    assert!(matches!(
        dispatcher.deploy(unknown).await.unwrap_err(),
        DeployError::Unresolvable { .. }
    ));

    // No interpreter was configured for this scheduler.
    let interpreted = JobSubmission::from_uri("/scripts/a.py", Framework::Interpreted, "run", Value::Null);
    let err = dispatcher.run(interpreted).await.unwrap_err();
    assert!(matches!(err, Error::Deploy(DeployError::Unresolvable { .. })));
}

#[tokio::test]
async fn inline_scripts_are_uploaded_before_running() {
    let store = RecordingScriptStore::new();
    let log = InterpreterLog::new();
    let dispatcher = interpreted_scheduler(&store, &log).dispatcher();

    let submission = JobSubmission::inline("def main(x): return x", Framework::Interpreted, "main", json!(1))
        .with_request_id("inline-1");
    let value = dispatcher.run(submission).await.unwrap();

    assert_eq!(value, json!({ "source": "def main(x): return x", "params": 1 }));
    assert_eq!(
        store.stored(),
        vec![("/job_scripts/inline-1.interpreted".into(), "text/plain".to_string())]
    );
    assert_eq!(
        store.source_of("/job_scripts/inline-1.interpreted").await.as_deref(),
        Some("def main(x): return x")
    );

    let custom = JobSubmission::inline("x", Framework::Interpreted, "main", Value::Null)
        .with_request_id("inline-2")
        .with_content_type("text/x-python");
    dispatcher.run(custom).await.unwrap();
    assert_eq!(store.stored()[1].1, "text/x-python");
}

#[tokio::test]
async fn interpreter_bootstraps_once_and_caches_scripts_per_worker() {
    let store = RecordingScriptStore::new().with_script("/scripts/stats.py", "def run(x): ...");
    let log = InterpreterLog::new();
    let dispatcher = interpreted_scheduler(&store, &log).dispatcher();

    for n in 0..3 {
        let submission = JobSubmission::from_uri("/scripts/stats.py", Framework::Interpreted, "echo", json!(n))
            .with_libraries(["numpy"]);
        assert_eq!(dispatcher.run(submission).await.unwrap(), json!(n));
    }

    assert_eq!(log.bootstraps(), 1);
    assert_eq!(log.loads_of("pandas"), 1);
    assert_eq!(log.loads_of("numpy"), 1);
    assert_eq!(log.count("run echo"), 3);
    // Three deploy-time checks plus a single fetch into the worker's cache.
    assert_eq!(store.resolve_count("/scripts/stats.py"), 4);
}

#[tokio::test]
async fn interpreted_scripts_can_fan_out() {
    let store = RecordingScriptStore::new().with_script("/scripts/fan.py", "...");
    let log = InterpreterLog::new();
    let dispatcher = interpreted_scheduler(&store, &log).dispatcher();

    let submission = JobSubmission::from_uri("/scripts/fan.py", Framework::Interpreted, "fan_out", json!([1, 2, 3]));
    assert_eq!(dispatcher.run(submission).await.unwrap(), json!([1, 2, 3]));
    assert_eq!(log.count("run echo"), 3);
}

#[tokio::test]
async fn steps_resume_jobs_suspended_at_any_depth() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let parent = dispatcher
        .deploy(native("nested_step", json!("need input")).with_request_id("parent"))
        .await
        .unwrap();

    let child = match next_event(&mut events).await.payload {
        DispatchEventPayload::Response(Envelope::Message { request_id, data }) => {
            assert_eq!(data["waiting"], json!(request_id.as_str()));
            request_id
        }
        other => panic!("expected the child's waiting message, got {other:?}"),
    };
    assert_ne!(child, parent);

    dispatcher.step("someone-else".into(), json!("ignored")).unwrap();
    dispatcher.step(child, json!(7)).unwrap();
    assert_eq!(outcome_of(&mut events, &parent).await.unwrap(), json!(7));
}

#[tokio::test]
async fn messages_are_forwarded_without_ending_the_job() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let id = dispatcher.deploy(native("report", json!(["a", "b"]))).await.unwrap();
    let mut seen = Vec::new();
    loop {
        let event = next_event(&mut events).await;
        if let Some(outcome) = event.outcome_for(&id) {
            assert_eq!(outcome.unwrap(), json!(2));
            break;
        }
        assert!(!event.is_terminal_for(&id));
        if let Some(Envelope::Message { data, .. }) = event.envelope() {
            seen.push(data.clone());
        }
    }
    assert_eq!(seen, vec![json!("a"), json!("b")]);
}

#[tokio::test]
async fn terminate_cancels_in_flight_jobs() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let stuck = dispatcher
        .deploy(native("gated", json!({ "gate": "never" })))
        .await
        .unwrap();
    dispatcher.terminate().await;

    assert_eq!(outcome_of(&mut events, &stuck).await.unwrap_err(), JobError::Cancelled);
    assert!(dispatcher.is_terminated());
    assert_eq!(
        dispatcher.deploy(native("echo", Value::Null)).await.unwrap_err(),
        DeployError::Closed
    );
}

#[tokio::test]
async fn scheduler_shutdown_terminates_dispatchers() {
    let fixture = Fixture::new();
    let scheduler = fixture_scheduler(&fixture, 2);
    let dispatcher = scheduler.dispatcher();
    let mut events = dispatcher.subscribe();

    let stuck = dispatcher
        .deploy(native("gated", json!({ "gate": "never" })))
        .await
        .unwrap();
    scheduler.shutdown();

    assert_eq!(outcome_of(&mut events, &stuck).await.unwrap_err(), JobError::Cancelled);
}

#[tokio::test]
async fn crashed_top_level_worker_is_replaced() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let doomed = dispatcher.deploy(native("panic", Value::Null)).await.unwrap();

    let failed_worker = match next_event(&mut events).await.payload {
        DispatchEventPayload::WorkerFailed { worker_id, error } => {
            assert!(matches!(error, JobError::WorkerCrashed { .. }));
            worker_id
        }
        other => panic!("expected a worker failure, got {other:?}"),
    };
    match outcome_of(&mut events, &doomed).await {
        Err(JobError::WorkerCrashed { worker_id, reason }) => {
            assert_eq!(worker_id, failed_worker);
            assert!(reason.contains("fixture panic"));
        }
        other => panic!("expected a crash, got {other:?}"),
    }

    assert_eq!(dispatcher.run(native("echo", json!("again"))).await.unwrap(), json!("again"));
    let calls = fixture.calls();
    assert_ne!(calls.last().unwrap().worker_id, failed_worker);
}

#[tokio::test]
async fn duplicate_in_flight_ids_are_rejected_at_deploy() {
    let fixture = Fixture::new();
    let dispatcher = fixture_scheduler(&fixture, 2).dispatcher();
    let mut events = dispatcher.subscribe();

    let job = native("gated", json!({ "gate": "g", "value": 1 })).with_request_id("same");
    dispatcher.deploy(job.clone()).await.unwrap();
    assert_eq!(
        dispatcher.deploy(job.clone()).await.unwrap_err(),
        DeployError::Duplicate { request_id: "same".into() }
    );

    fixture.release("g");
    assert_eq!(outcome_of(&mut events, &"same".into()).await.unwrap(), json!(1));

    // Exactly one terminal event was published for the id.
    let marker = dispatcher.deploy(native("echo", json!("marker"))).await.unwrap();
    loop {
        let event = next_event(&mut events).await;
        assert!(!event.is_terminal_for(&"same".into()), "second outcome for a single job: {event:?}");
        if event.is_terminal_for(&marker) {
            break;
        }
    }

    // Once resolved, the id may be reused.
    fixture.release("g");
    assert_eq!(dispatcher.run(job).await.unwrap(), json!(1));
}

#[tokio::test]
async fn concurrent_run_keeps_its_result_when_a_duplicate_is_deployed() {
    let fixture = Fixture::new();
    let dispatcher = Arc::new(fixture_scheduler(&fixture, 2).dispatcher());

    let job = native("gated", json!({ "gate": "h", "value": "real" })).with_request_id("shared");
    let running = {
        let dispatcher = dispatcher.clone();
        let job = job.clone();
        tokio::spawn(async move { dispatcher.run(job).await })
    };
    tributary_testkit::wait_for_calls(&fixture, "gated", 1).await;

    assert!(matches!(
        dispatcher.deploy(job).await,
        Err(DeployError::Duplicate { .. })
    ));
    fixture.release("h");
    assert_eq!(running.await.unwrap().unwrap(), json!("real"));
}
