//! Recursive fan-out with a native module.
//!
//! A `range_sum` job splits its range in half and distributes both halves
//! until the ranges are small, so the work spreads over a tree of pools.
//! Progress messages from every depth reach the host as dispatcher events.
//!
//! Run with `RUST_LOG=tributary=debug cargo run --example fanout` to see the
//! pool and worker lifecycle.

use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use tributary::*;

const LEAF_SIZE: u64 = 250;

async fn range_sum(ctx: ScriptContext, params: Value) -> anyhow::Result<Value> {
    let start = params["start"].as_u64().unwrap_or(0);
    let end = params["end"].as_u64().unwrap_or(start);

    if end - start <= LEAF_SIZE {
        let sum: u64 = (start..end).sum();
        ctx.message(json!({ "leaf": [start, end], "sum": sum }))?;
        return Ok(json!(sum));
    }

    let mid = start + (end - start) / 2;
    let halves = ctx
        .distribute_many(
            "range_sum",
            [json!({ "start": start, "end": mid }), json!({ "start": mid, "end": end })],
        )
        .await?;
    let sum: u64 = halves.iter().filter_map(Value::as_u64).sum();
    Ok(json!(sum))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let scheduler = Scheduler::builder()
        .with_config(SchedulerConfig::from_env())
        .with_store(InMemoryScriptStore::new())
        .with_native_module("arith", NativeModule::new().entry("range_sum", range_sum))
        .build()?;

    let dispatcher = scheduler.dispatcher();
    let mut events = dispatcher.subscribe();
    let printer = tokio::spawn(async move {
        let mut leaves = 0usize;
        while let Ok(event) = events.recv().await {
            if let Some(Envelope::Message { data, .. }) = event.envelope() {
                leaves += 1;
                tracing::debug!(%data, "leaf finished");
            }
        }
        leaves
    });

    let submission = JobSubmission::from_uri("arith", Framework::Native, "range_sum", json!({ "start": 0, "end": 10_000 }));
    let total = dispatcher.run(submission).await?;
    println!("sum of 0..10000 = {total}");

    dispatcher.terminate().await;
    drop(dispatcher);
    scheduler.shutdown();
    let leaves = printer.await?;
    println!("{leaves} leaf jobs reported progress");
    Ok(())
}
