use std::fmt;
use std::sync::Arc;

use super::scheduler::{Scheduler, SchedulerContext};
use super::shutdown::ShutdownToken;
use crate::config::SchedulerConfig;
use crate::job::ScriptRef;
use crate::script::{Interpreter, InterpreterFactory, NativeModule, NativeRegistry, ScriptStore};

/// Builder for a [`Scheduler`] with explicit collaborators.
///
/// A script store is required, as is at least one framework: a native module
/// or an interpreter factory.
///
/// ```ignore
/// let scheduler = SchedulerBuilder::new()
///     .with_config(SchedulerConfig::from_env())
///     .with_store(HttpScriptStore::new("https://jobs.example.org"))
///     .with_interpreter(|| Box::new(MyInterpreter::default()) as Box<dyn Interpreter>)
///     .with_preloaded_libraries(["numpy"])
///     .build()?;
/// ```
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    store: Option<Arc<dyn ScriptStore>>,
    native: NativeRegistry,
    interpreter: Option<InterpreterFactory>,
    preload: Vec<String>,
    shutdown: Option<ShutdownToken>,
}

impl fmt::Debug for SchedulerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerBuilder")
            .field("config", &self.config)
            .field("store_set", &self.store.is_some())
            .field("native_modules", &self.native.len())
            .field("interpreter_set", &self.interpreter.is_some())
            .field("preload", &self.preload)
            .field("shutdown_set", &self.shutdown.is_some())
            .finish()
    }
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    pub fn new() -> Self {
        Self {
            config: SchedulerConfig::default(),
            store: None,
            native: NativeRegistry::new(),
            interpreter: None,
            preload: Vec::new(),
            shutdown: None,
        }
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Shorthand for overriding only the pool limit.
    pub fn with_worker_limit(mut self, worker_limit: usize) -> Self {
        self.config.pool = self.config.pool.with_worker_limit(worker_limit);
        self
    }

    pub fn with_store<S>(self, store: S) -> Self
    where
        S: ScriptStore + 'static,
    {
        self.with_shared_store(Arc::new(store))
    }

    pub fn with_shared_store(mut self, store: Arc<dyn ScriptStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_native_module(mut self, script_ref: impl Into<ScriptRef>, module: NativeModule) -> Self {
        self.native = self.native.with_module(script_ref, module);
        self
    }

    /// Replace the native registry wholesale.
    pub fn with_native_registry(mut self, registry: NativeRegistry) -> Self {
        self.native = registry;
        self
    }

    /// Enable the interpreted framework. `factory` runs once per worker, on
    /// that worker's first interpreted job.
    pub fn with_interpreter<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Box<dyn Interpreter> + Send + Sync + 'static,
    {
        let factory: InterpreterFactory = Arc::new(factory);
        self.interpreter = Some(factory);
        self
    }

    /// Libraries every interpreter loads right after bootstrap.
    pub fn with_preloaded_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for library in libraries {
            let library = library.into();
            if !self.preload.contains(&library) {
                self.preload.push(library);
            }
        }
        self
    }

    /// Tie the scheduler to an externally owned shutdown signal.
    pub fn with_shutdown_token(mut self, token: ShutdownToken) -> Self {
        self.shutdown = Some(token);
        self
    }

    pub fn build(self) -> anyhow::Result<Scheduler> {
        let store = self
            .store
            .ok_or_else(|| anyhow::anyhow!("script store dependency missing"))?;
        if self.native.is_empty() && self.interpreter.is_none() {
            anyhow::bail!("no script executor configured: register a native module or an interpreter");
        }
        if !self.preload.is_empty() && self.interpreter.is_none() {
            anyhow::bail!("preloaded libraries require an interpreter");
        }
        if self.config.dispatcher.event_capacity == 0 {
            anyhow::bail!("dispatcher event capacity must be at least 1");
        }

        let context = SchedulerContext::new(
            self.config,
            store,
            self.native,
            self.interpreter,
            self.preload,
            self.shutdown.unwrap_or_default(),
        );
        Ok(Scheduler::from_context(context))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::InMemoryScriptStore;

    #[test]
    fn store_is_required() {
        let err = SchedulerBuilder::new()
            .with_native_module("m", NativeModule::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("script store"));
    }

    #[test]
    fn an_executor_is_required() {
        let err = SchedulerBuilder::new()
            .with_store(InMemoryScriptStore::new())
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("no script executor"));
    }

    #[test]
    fn preloading_needs_an_interpreter() {
        let err = SchedulerBuilder::new()
            .with_store(InMemoryScriptStore::new())
            .with_native_module("m", NativeModule::new())
            .with_preloaded_libraries(["numpy"])
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("require an interpreter"));
    }

    #[test]
    fn worker_limit_override_is_clamped() {
        let scheduler = SchedulerBuilder::new()
            .with_store(InMemoryScriptStore::new())
            .with_native_module("m", NativeModule::new())
            .with_worker_limit(0)
            .build()
            .unwrap();
        assert_eq!(scheduler.config().pool.worker_limit, 1);
        assert!(!scheduler.is_shut_down());
    }

    #[test]
    fn external_shutdown_token_is_shared() {
        let token = ShutdownToken::new();
        let scheduler = SchedulerBuilder::new()
            .with_store(InMemoryScriptStore::new())
            .with_native_module("m", NativeModule::new())
            .with_shutdown_token(token.clone())
            .build()
            .unwrap();
        token.cancel();
        assert!(scheduler.is_shut_down());
    }
}
