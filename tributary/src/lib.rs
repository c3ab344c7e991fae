//! Tributary - recursive fan-out job scheduling over a pool of script workers.
//!
//! Jobs name a script, an entry point and JSON parameters. They run on
//! worker runtimes, each executing one job at a time, managed by a pool that
//! grows on demand up to a fixed limit. A running job may split itself into
//! sub-jobs through its [`ScriptContext`]; those land on the worker's own
//! child pool, so recursive fan-out never waits on a worker above it.
//!
//! # Core Concepts
//!
//! - **Scheduler**: [`Scheduler`] holds the shared context (configuration,
//!   script store, framework executors, shutdown signal) and hands out pools,
//!   dispatchers and pollers bound to it.
//!
//! - **Pool**: [`WorkerPool`] places each submission on an idle worker, a new
//!   worker while under the limit, or the least-loaded one, and resolves it
//!   exactly once.
//!
//! - **Dispatcher**: [`JobDispatcher`] is the host entry point. It uploads or
//!   resolves scripts and reports outcomes as [`DispatchEvent`]s.
//!
//! - **Frameworks**: native modules registered in a [`NativeRegistry`] and an
//!   embedded [`Interpreter`] for script text fetched from a [`ScriptStore`].
//!
//! - **Results**: [`ResultPoller`] waits for results written to a remote store
//!   under a linear backoff budget.
//!
//! # Feature Flags
//!
//! - `metrics` - Prometheus metrics support
//!
//! # Example
//!
//! ```ignore
//! use serde_json::json;
//! use tributary::*;
//!
//! let module = NativeModule::new().entry("square", |_ctx, params| async move {
//!     let n = params.as_i64().unwrap_or_default();
//!     Ok(json!(n * n))
//! });
//! let scheduler = Scheduler::builder()
//!     .with_store(InMemoryScriptStore::new())
//!     .with_native_module("math", module)
//!     .build()?;
//!
//! let dispatcher = scheduler.dispatcher();
//! let value = dispatcher
//!     .run(JobSubmission::from_uri("math", Framework::Native, "square", json!(7)))
//!     .await?;
//! assert_eq!(value, json!(49));
//! ```

/// Pool, polling and dispatcher settings, loadable from the environment.
pub mod config;

/// The pending-call table correlating request ids with waiting callers.
pub mod correlation;

/// Error taxonomy for jobs, deploys and result polling.
pub mod error;

/// Host-facing events emitted by a [`JobDispatcher`] and the bus carrying them.
pub mod events;

/// Identifiers, job requests and host submissions.
pub mod job;

/// Prometheus metrics, behind the `metrics` feature.
#[cfg(feature = "metrics")]
pub mod metrics;

/// Backoff polling of remote job results.
pub mod poller;

/// The wire envelope exchanged between pools, workers and the dispatcher.
pub mod protocol;

/// Schedulers, pools, worker runtimes and the dispatcher.
pub mod runtime;

/// Framework executors, the script store and the bridge given to scripts.
pub mod script;

/// Span constructors and `record_*` helpers.
pub mod telemetry;

pub use config::*;
pub use correlation::PendingCallTable;
pub use error::{DeployError, Error, JobError, PollError};
pub use events::*;
pub use job::*;
pub use poller::{HttpObjectStore, ManifestJob, ObjectStore, ResultManifest, ResultPoller};
pub use protocol::Envelope;
pub use runtime::*;
pub use script::*;
