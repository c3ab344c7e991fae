use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tributary::{NativeModule, RequestId, ScriptContext, WorkerId, WorkerPool};

/// Script reference the fixture module is registered under.
pub const FIXTURE_SCRIPT: &str = "fixture";

/// One recorded entry point invocation.
#[derive(Clone, Debug, PartialEq)]
pub struct Call {
    pub request_id: RequestId,
    pub worker_id: WorkerId,
    pub entry_point: String,
    pub params: Value,
}

/// Shared recorder and gate set behind the fixture module.
///
/// Entry points:
/// - `echo`: returns its params.
/// - `fail`: fails with the params' `message` (or a default).
/// - `panic`: panics the worker.
/// - `gated`: waits on gate `params.gate`, then panics if `params.panic` is
///   true, else returns `params.value`.
/// - `delayed`: sleeps `params.ms` milliseconds, returns `params.value`.
/// - `square`: returns `n * n`.
/// - `sum_squares`: distributes `square` over an array and reports the sum,
///   the individual squares and the size of its child pool.
/// - `wait_step`: messages `{"waiting": <request id>}`, then returns the step.
/// - `nested_step`: distributes `wait_step` and returns its result.
/// - `report`: messages each element of an array, returns the count.
#[derive(Clone)]
pub struct Fixture {
    calls: Arc<Mutex<Vec<Call>>>,
    gates: Arc<Mutex<HashMap<String, Arc<Semaphore>>>>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            gates: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Request ids of calls to `entry_point`, in invocation order.
    pub fn calls_to(&self, entry_point: &str) -> Vec<RequestId> {
        self.calls
            .lock()
            .iter()
            .filter(|call| call.entry_point == entry_point)
            .map(|call| call.request_id.clone())
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    /// Let one job waiting on `gate` through.
    pub fn release(&self, gate: &str) {
        tracing::debug!(gate, "releasing gate");
        self.gate(gate).add_permits(1);
    }

    fn gate(&self, name: &str) -> Arc<Semaphore> {
        self.gates
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(0)))
            .clone()
    }

    fn record(&self, ctx: &ScriptContext, params: &Value) {
        self.calls.lock().push(Call {
            request_id: ctx.request_id().clone(),
            worker_id: ctx.worker_id().clone(),
            entry_point: ctx.request().entry_point.clone(),
            params: params.clone(),
        });
    }

    pub fn module(&self) -> NativeModule {
        NativeModule::new()
            .entry("echo", self.bind(Fixture::echo))
            .entry("fail", self.bind(Fixture::fail))
            .entry("panic", self.bind(Fixture::panic))
            .entry("gated", self.bind(Fixture::gated))
            .entry("delayed", self.bind(Fixture::delayed))
            .entry("square", self.bind(Fixture::square))
            .entry("sum_squares", self.bind(Fixture::sum_squares))
            .entry("wait_step", self.bind(Fixture::wait_step))
            .entry("nested_step", self.bind(Fixture::nested_step))
            .entry("report", self.bind(Fixture::report))
    }

    /// Adapt a recording handler into a native entry point.
    fn bind<F, Fut>(&self, handler: F) -> impl Fn(ScriptContext, Value) -> Fut + Send + Sync + 'static
    where
        F: Fn(Fixture, ScriptContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let fixture = self.clone();
        move |ctx, params| {
            fixture.record(&ctx, &params);
            handler(fixture.clone(), ctx, params)
        }
    }

    async fn echo(self, _ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        Ok(params)
    }

    async fn fail(self, _ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let message = params["message"].as_str().unwrap_or("deliberate failure");
        tracing::warn!("Fixture job failing: {}", message);
        anyhow::bail!("{message}")
    }

    async fn panic(self, _ctx: ScriptContext, _params: Value) -> anyhow::Result<Value> {
        panic!("fixture panic")
    }

    async fn gated(self, _ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let gate = self.gate(params["gate"].as_str().unwrap_or("default"));
        gate.acquire().await?.forget();
        if params["panic"].as_bool().unwrap_or(false) {
            panic!("fixture panic after gate");
        }
        Ok(params["value"].clone())
    }

    async fn delayed(self, _ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let ms = params["ms"].as_u64().unwrap_or(10);
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(params["value"].clone())
    }

    async fn square(self, _ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let n = params
            .as_i64()
            .ok_or_else(|| anyhow::anyhow!("square expects an integer, got {params}"))?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        Ok(json!(n * n))
    }

    async fn sum_squares(self, ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let items = params.as_array().cloned().unwrap_or_default();
        let squares = ctx.distribute_many("square", items).await?;
        let sum: i64 = squares.iter().filter_map(Value::as_i64).sum();
        let workers = child_workers(ctx.pool()).await;
        Ok(json!({ "sum": sum, "squares": squares, "workers": workers }))
    }

    async fn wait_step(self, ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        ctx.message(json!({ "waiting": ctx.request_id() }))?;
        Ok(ctx.await_step(params).await?)
    }

    async fn nested_step(self, ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        Ok(ctx.distribute("wait_step", params).await?)
    }

    async fn report(self, ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
        let items = params.as_array().cloned().unwrap_or_default();
        for item in &items {
            ctx.message(item.clone())?;
        }
        Ok(json!(items.len()))
    }
}

async fn child_workers(pool: &WorkerPool) -> usize {
    pool.snapshot()
        .await
        .map(|snapshot| snapshot.workers.len())
        .unwrap_or_default()
}

/// Wait until `entry_point` has been invoked `count` times.
///
/// Panics after two seconds so a broken test fails instead of hanging.
pub async fn wait_for_calls(fixture: &Fixture, entry_point: &str, count: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let seen = fixture.calls_to(entry_point).len();
        if seen >= count {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {count} calls to {entry_point}, saw {seen}"
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Poll `pool` until it holds `pending` unresolved calls.
///
/// Panics after two seconds so a broken test fails instead of hanging.
pub async fn wait_for_pending(pool: &WorkerPool, pending: usize) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = pool.snapshot().await.expect("pool closed while waiting");
        if snapshot.pending.len() == pending {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "expected {pending} pending calls, pool has {}",
            snapshot.pending.len()
        );
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}
