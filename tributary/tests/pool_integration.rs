//! Pool integration tests: placement, FIFO execution, crash isolation,
//! recursive fan-out and step routing through nested pools.

use std::time::Duration;

use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tributary::{Envelope, Framework, JobError, JobRequest, WorkerPool};
use tributary_testkit::{fixture_scheduler, wait_for_pending, Fixture, FIXTURE_SCRIPT};

fn job(id: &str, entry_point: &str, params: Value) -> JobRequest {
    JobRequest::new(FIXTURE_SCRIPT, Framework::Native, entry_point, params).with_request_id(id)
}

fn gated(id: &str, gate: &str) -> JobRequest {
    job(id, "gated", json!({ "gate": gate, "value": id }))
}

fn spawn_submit(pool: &WorkerPool, job: JobRequest) -> JoinHandle<Result<Value, JobError>> {
    let pool = pool.clone();
    tokio::spawn(async move { pool.submit(job).await })
}

async fn outcome(handle: JoinHandle<Result<Value, JobError>>) -> Result<Value, JobError> {
    timeout(Duration::from_secs(2), handle)
        .await
        .expect("timed out waiting for job outcome")
        .expect("submit task panicked")
}

#[tokio::test]
async fn third_job_is_routed_to_the_least_loaded_worker() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 2).pool();

    let a = spawn_submit(&pool, gated("a", "gate-a"));
    wait_for_pending(&pool, 1).await;
    let b = spawn_submit(&pool, gated("b", "gate-b"));
    wait_for_pending(&pool, 2).await;
    let c = spawn_submit(&pool, gated("c", "gate-c"));
    wait_for_pending(&pool, 3).await;

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 2);
    assert_eq!(snapshot.loads(), vec![2, 1]);
    assert_eq!(snapshot.in_flight(), 3);

    // Once b is done its worker is the idle one and takes the next job.
    fixture.release("gate-b");
    assert_eq!(outcome(b).await.unwrap(), json!("b"));
    let d = spawn_submit(&pool, job("d", "echo", json!("d")));
    assert_eq!(outcome(d).await.unwrap(), json!("d"));

    fixture.release("gate-a");
    fixture.release("gate-c");
    assert_eq!(outcome(a).await.unwrap(), json!("a"));
    assert_eq!(outcome(c).await.unwrap(), json!("c"));
    assert_eq!(pool.snapshot().await.unwrap().workers.len(), 2);

    let calls = fixture.calls();
    let worker_of = |id: &str| {
        calls
            .iter()
            .find(|call| call.request_id.as_str() == id)
            .map(|call| call.worker_id.clone())
            .unwrap()
    };
    assert_eq!(worker_of("d"), worker_of("b"));
    assert_ne!(worker_of("a"), worker_of("b"));
    assert_eq!(worker_of("c"), worker_of("a"));
}

#[tokio::test]
async fn saturated_worker_runs_jobs_in_arrival_order() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 1).pool();

    let a = spawn_submit(&pool, gated("a", "gate"));
    wait_for_pending(&pool, 1).await;
    let b = spawn_submit(&pool, job("b", "echo", json!("b")));
    wait_for_pending(&pool, 2).await;
    let c = spawn_submit(&pool, job("c", "echo", json!("c")));
    wait_for_pending(&pool, 3).await;

    // Nothing behind the gate has started yet.
    assert!(fixture.calls_to("echo").is_empty());

    fixture.release("gate");
    assert_eq!(outcome(a).await.unwrap(), json!("a"));
    assert_eq!(outcome(b).await.unwrap(), json!("b"));
    assert_eq!(outcome(c).await.unwrap(), json!("c"));

    let order: Vec<String> = fixture
        .calls()
        .into_iter()
        .map(|call| call.request_id.to_string())
        .collect();
    assert_eq!(order, vec!["a", "b", "c"]);
}

#[tokio::test]
async fn crash_fails_only_the_jobs_held_by_that_worker() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 2).pool();

    let doomed = job("a", "gated", json!({ "gate": "crash", "panic": true }));
    let a = spawn_submit(&pool, doomed);
    wait_for_pending(&pool, 1).await;
    let b = spawn_submit(&pool, gated("b", "keep"));
    wait_for_pending(&pool, 2).await;
    let c = spawn_submit(&pool, job("c", "echo", json!("c")));
    wait_for_pending(&pool, 3).await;
    assert_eq!(pool.snapshot().await.unwrap().loads(), vec![2, 1]);

    fixture.release("crash");
    let mut crashed = Vec::new();
    for handle in [a, c] {
        match outcome(handle).await {
            Err(JobError::WorkerCrashed { worker_id, reason }) => {
                assert!(reason.contains("fixture panic after gate"), "reason: {reason}");
                crashed.push(worker_id);
            }
            other => panic!("expected a worker crash, got {other:?}"),
        }
    }
    let worker_of_a = fixture
        .calls()
        .into_iter()
        .find(|call| call.request_id.as_str() == "a")
        .map(|call| call.worker_id)
        .unwrap();
    assert_eq!(crashed, vec![worker_of_a.clone(), worker_of_a]);

    let snapshot = pool.snapshot().await.unwrap();
    assert_eq!(snapshot.workers.len(), 1);
    assert_eq!(snapshot.pending, vec!["b".into()]);

    fixture.release("keep");
    assert_eq!(outcome(b).await.unwrap(), json!("b"));

    // The pool replaces the lost worker on demand.
    let e = spawn_submit(&pool, job("e", "echo", json!(1)));
    assert_eq!(outcome(e).await.unwrap(), json!(1));
}

#[tokio::test]
async fn recursive_fan_out_stays_within_the_worker_limit() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 4).pool();

    let result = timeout(
        Duration::from_secs(2),
        pool.submit(job("parent", "sum_squares", json!([1, 2, 3, 4, 5]))),
    )
    .await
    .expect("fan-out timed out")
    .unwrap();

    assert_eq!(result["sum"], json!(55));
    assert_eq!(result["squares"], json!([1, 4, 9, 16, 25]));
    let workers = result["workers"].as_u64().unwrap();
    assert!((1..=4).contains(&workers), "child pool grew to {workers} workers");
    assert_eq!(fixture.calls_to("square").len(), 5);

    // The parent only resolves after every sub-job has been called.
    let calls = fixture.calls();
    assert_eq!(calls.first().unwrap().entry_point, "sum_squares");
}

#[tokio::test]
async fn script_failures_are_reported_and_the_worker_survives() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 1).pool();

    let err = pool
        .submit(job("f", "fail", json!({ "message": "bad input" })))
        .await
        .unwrap_err();
    assert!(matches!(&err, JobError::Script { message } if message.contains("bad input")));

    let err = pool.submit(job("m", "missing_entry", Value::Null)).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound { .. }));

    assert_eq!(pool.submit(job("ok", "echo", json!(3))).await.unwrap(), json!(3));
    assert_eq!(pool.snapshot().await.unwrap().workers.len(), 1);
}

#[tokio::test]
async fn duplicate_request_ids_are_rejected_while_pending() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 2).pool();

    let first = spawn_submit(&pool, gated("dup", "gate"));
    wait_for_pending(&pool, 1).await;

    let err = pool.submit(gated("dup", "gate")).await.unwrap_err();
    assert_eq!(err, JobError::DuplicateRequest { request_id: "dup".into() });

    fixture.release("gate");
    assert_eq!(outcome(first).await.unwrap(), json!("dup"));

    // Once resolved the id may be reused.
    assert_eq!(pool.submit(job("dup", "echo", json!(1))).await.unwrap(), json!(1));
}

#[tokio::test]
async fn terminating_a_worker_cancels_its_jobs() {
    let fixture = Fixture::new();
    let pool = fixture_scheduler(&fixture, 2).pool();

    let a = spawn_submit(&pool, gated("a", "never"));
    wait_for_pending(&pool, 1).await;
    let worker_id = pool.snapshot().await.unwrap().workers[0].worker_id.clone();

    assert!(pool.terminate_worker(&worker_id).await);
    assert_eq!(outcome(a).await.unwrap_err(), JobError::Cancelled);
    assert!(!pool.terminate_worker(&worker_id).await);
    assert!(pool.snapshot().await.unwrap().workers.is_empty());
}

#[tokio::test]
async fn shutdown_cancels_everything_pending() {
    let fixture = Fixture::new();
    let scheduler = fixture_scheduler(&fixture, 2);
    let pool = scheduler.pool();
    let other = scheduler.pool();

    let a = spawn_submit(&pool, gated("a", "never"));
    let b = spawn_submit(&other, gated("b", "never"));
    wait_for_pending(&pool, 1).await;
    wait_for_pending(&other, 1).await;

    assert_eq!(pool.shutdown().await, 1);
    assert_eq!(outcome(a).await.unwrap_err(), JobError::Cancelled);
    assert_eq!(pool.submit(job("late", "echo", Value::Null)).await.unwrap_err(), JobError::Cancelled);

    // Shutting the scheduler down reaches pools it handed out earlier.
    scheduler.shutdown();
    assert_eq!(outcome(b).await.unwrap_err(), JobError::Cancelled);
}

#[tokio::test]
async fn messages_bubble_up_to_the_root_sink() {
    let fixture = Fixture::new();
    let (pool, mut messages) = fixture_scheduler(&fixture, 2).pool_with_messages();

    let count = pool.submit(job("r", "report", json!(["one", "two"]))).await.unwrap();
    assert_eq!(count, json!(2));

    for expected in ["one", "two"] {
        match timeout(Duration::from_secs(1), messages.recv()).await.unwrap() {
            Some(Envelope::Message { request_id, data }) => {
                assert_eq!(request_id.as_str(), "r");
                assert_eq!(data, json!(expected));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}

#[tokio::test]
async fn steps_reach_a_job_waiting_inside_a_sub_pool() {
    let fixture = Fixture::new();
    let (pool, mut messages) = fixture_scheduler(&fixture, 2).pool_with_messages();

    let parent = spawn_submit(&pool, job("parent", "nested_step", json!("hint")));
    let child_id = match timeout(Duration::from_secs(1), messages.recv()).await.unwrap() {
        Some(Envelope::Message { request_id, data }) => {
            assert_eq!(data["waiting"], json!(request_id.as_str()));
            request_id
        }
        other => panic!("unexpected message {other:?}"),
    };
    assert_ne!(child_id.as_str(), "parent");

    // A step for some other id does not release the child.
    assert!(pool.step("unrelated".into(), json!("wrong")));
    assert!(pool.step(child_id, json!("go")));

    assert_eq!(outcome(parent).await.unwrap(), json!("go"));
}
