/// Builder validating a scheduler's collaborators.
pub mod builder;
/// Host-facing dispatcher owning a top-level worker.
pub mod dispatcher;
/// Dynamic worker pool and its placement policy.
pub mod pool;
/// Shared scheduler context and the crate's entry point.
pub mod scheduler;
/// Cooperative shutdown signal.
pub mod shutdown;
/// Worker runtime: single-flight job execution with a FIFO backlog.
pub mod worker;

pub use builder::SchedulerBuilder;
pub use dispatcher::JobDispatcher;
pub use pool::{PoolSnapshot, WorkerLoad, WorkerPool};
pub use scheduler::{Scheduler, SchedulerContext};
pub use shutdown::ShutdownToken;
