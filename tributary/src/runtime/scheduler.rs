use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::builder::SchedulerBuilder;
use super::dispatcher::JobDispatcher;
use super::pool::{Upstream, WorkerPool};
use super::shutdown::ShutdownToken;
use crate::config::SchedulerConfig;
use crate::job::{Framework, ScriptRef};
use crate::poller::{ObjectStore, ResultPoller};
use crate::protocol::Envelope;
use crate::script::{
    Executors, InterpretedExecutor, InterpreterFactory, NativeExecutor, NativeRegistry, ScriptStore,
};

/// Shared, immutable state every pool, worker and dispatcher is built from.
#[derive(Clone)]
pub struct SchedulerContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    config: SchedulerConfig,
    store: Arc<dyn ScriptStore>,
    native: NativeRegistry,
    interpreter: Option<InterpreterFactory>,
    preload: Vec<String>,
    shutdown: ShutdownToken,
}

impl fmt::Debug for SchedulerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerContext")
            .field("config", &self.inner.config)
            .field("native_modules", &self.inner.native.len())
            .field("interpreter", &self.inner.interpreter.is_some())
            .field("preload", &self.inner.preload)
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl SchedulerContext {
    pub(crate) fn new(
        config: SchedulerConfig,
        store: Arc<dyn ScriptStore>,
        native: NativeRegistry,
        interpreter: Option<InterpreterFactory>,
        preload: Vec<String>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                config,
                store,
                native,
                interpreter,
                preload,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn ScriptStore> {
        &self.inner.store
    }

    pub fn native(&self) -> &NativeRegistry {
        &self.inner.native
    }

    pub fn has_interpreter(&self) -> bool {
        self.inner.interpreter.is_some()
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.inner.shutdown.clone()
    }

    /// Fresh executors for a new worker. Interpreters are created lazily on
    /// the worker's first interpreted job.
    pub(crate) fn executors(&self) -> Executors {
        let native = NativeExecutor::new(self.inner.native.clone());
        let interpreted = self.inner.interpreter.as_ref().map(|factory| {
            InterpretedExecutor::new(
                Arc::clone(factory),
                Arc::clone(&self.inner.store),
                self.inner.preload.clone(),
            )
        });
        Executors::new(native, interpreted)
    }

    /// Check that a referenced script can be run before it is dispatched.
    pub(crate) async fn check_resolvable(
        &self,
        framework: Framework,
        script_ref: &ScriptRef,
    ) -> anyhow::Result<()> {
        match framework {
            Framework::Native => {
                if !self.inner.native.contains(script_ref) {
                    anyhow::bail!("no native module registered as {script_ref}");
                }
                Ok(())
            }
            Framework::Interpreted => {
                if self.inner.interpreter.is_none() {
                    anyhow::bail!("no interpreter configured");
                }
                self.inner.store.resolve(script_ref).await.map(|_| ())
            }
        }
    }
}

/// Entry point of the crate: owns the shared context and hands out pools,
/// dispatchers and pollers bound to it.
///
/// ```ignore
/// let scheduler = Scheduler::builder()
///     .with_store(InMemoryScriptStore::new())
///     .with_native_module("stats", stats_module())
///     .build()?;
/// let dispatcher = scheduler.dispatcher();
/// let value = dispatcher.run(JobSubmission::from_uri("stats", Framework::Native, "run", params)).await?;
/// ```
#[derive(Debug, Clone)]
pub struct Scheduler {
    context: SchedulerContext,
}

impl Scheduler {
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder::new()
    }

    pub(crate) fn from_context(context: SchedulerContext) -> Self {
        Self { context }
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.context
    }

    pub fn config(&self) -> &SchedulerConfig {
        self.context.config()
    }

    /// A root pool whose sub-job messages are discarded.
    pub fn pool(&self) -> WorkerPool {
        WorkerPool::spawn(self.context.clone(), Upstream::Detached)
    }

    /// A root pool plus a receiver for `message` envelopes from any depth.
    pub fn pool_with_messages(&self) -> (WorkerPool, mpsc::UnboundedReceiver<Envelope>) {
        let (sink, messages) = mpsc::unbounded_channel();
        (WorkerPool::spawn(self.context.clone(), Upstream::Sink(sink)), messages)
    }

    pub fn dispatcher(&self) -> JobDispatcher {
        JobDispatcher::spawn(self.context.clone())
    }

    pub fn poller<S: ObjectStore>(&self, store: S) -> ResultPoller<S> {
        ResultPoller::new(store, self.config().poll.clone())
    }

    pub fn shutdown_token(&self) -> ShutdownToken {
        self.context.shutdown_token()
    }

    /// Tear down every pool and dispatcher created from this scheduler.
    pub fn shutdown(&self) {
        self.context.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.context.inner.shutdown.is_cancelled()
    }
}
