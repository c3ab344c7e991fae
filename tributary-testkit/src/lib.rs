//! Fixtures for exercising tributary pools and dispatchers.
//!
//! - [`Fixture`] builds a native module of scripted entry points and records
//!   every call it sees. Named gates hold jobs in flight until released.
//! - [`MockInterpreter`] stands in for an embedded interpreter.
//! - [`RecordingScriptStore`] and [`ScriptedObjectStore`] replace the remote
//!   stores.

mod fixture;
mod mock;
mod store;

pub use fixture::{wait_for_calls, wait_for_pending, Call, Fixture, FIXTURE_SCRIPT};
pub use mock::{InterpreterLog, MockInterpreter};
pub use store::{RecordingScriptStore, ScriptedObjectStore};

use tributary::{InMemoryScriptStore, Scheduler};

/// Scheduler with `fixture`'s module registered under [`FIXTURE_SCRIPT`] and an
/// in-memory script store.
pub fn fixture_scheduler(fixture: &Fixture, worker_limit: usize) -> Scheduler {
    Scheduler::builder()
        .with_store(InMemoryScriptStore::new())
        .with_native_module(FIXTURE_SCRIPT, fixture.module())
        .with_worker_limit(worker_limit)
        .build()
        .expect("fixture scheduler should build")
}

