use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use super::context::ScriptContext;
use super::store::ScriptStore;
use super::ScriptExecutor;
use crate::error::JobError;
use crate::job::{JobRequest, ScriptRef};

/// An embedded interpreter driven by the interpreted executor.
///
/// Each worker owns at most one instance, so implementations may keep
/// interpreter state between jobs without synchronisation.
#[async_trait]
pub trait Interpreter: Send {
    /// One-time setup, run before the first library load or job.
    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Make `library` importable. Called at most once per name.
    async fn load_library(&mut self, library: &str) -> anyhow::Result<()>;

    /// Evaluate `source` and call `entry_point(params)` with the bridge exposed.
    async fn run(
        &mut self,
        source: &str,
        entry_point: &str,
        params: Value,
        bridge: ScriptContext,
    ) -> anyhow::Result<Value>;
}

/// Creates a fresh interpreter for a worker.
pub type InterpreterFactory = Arc<dyn Fn() -> Box<dyn Interpreter> + Send + Sync>;

/// Per-worker cache of script sources keyed by reference.
#[derive(Debug, Default)]
pub struct ScriptCache {
    scripts: HashMap<ScriptRef, Arc<str>>,
    hits: u64,
    misses: u64,
}

impl ScriptCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached source, resolving it through `store` on first use.
    pub async fn get_or_resolve(
        &mut self,
        store: &dyn ScriptStore,
        script_ref: &ScriptRef,
    ) -> anyhow::Result<Arc<str>> {
        if let Some(source) = self.scripts.get(script_ref) {
            self.hits += 1;
            return Ok(Arc::clone(source));
        }

        self.misses += 1;
        let source: Arc<str> = store.resolve(script_ref).await?.into();
        self.scripts.insert(script_ref.clone(), Arc::clone(&source));
        Ok(source)
    }

    pub fn contains(&self, script_ref: &ScriptRef) -> bool {
        self.scripts.contains_key(script_ref)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }
}

/// Runs source-text scripts on a lazily bootstrapped interpreter.
pub struct InterpretedExecutor {
    factory: InterpreterFactory,
    store: Arc<dyn ScriptStore>,
    preload: Vec<String>,
    interpreter: Option<Box<dyn Interpreter>>,
    loaded: HashSet<String>,
    cache: ScriptCache,
}

impl std::fmt::Debug for InterpretedExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpretedExecutor")
            .field("bootstrapped", &self.interpreter.is_some())
            .field("loaded", &self.loaded)
            .field("cached_scripts", &self.cache.len())
            .finish()
    }
}

impl InterpretedExecutor {
    /// `preload` names libraries loaded right after bootstrap.
    pub fn new(factory: InterpreterFactory, store: Arc<dyn ScriptStore>, preload: Vec<String>) -> Self {
        Self {
            factory,
            store,
            preload,
            interpreter: None,
            loaded: HashSet::new(),
            cache: ScriptCache::new(),
        }
    }

    pub fn is_bootstrapped(&self) -> bool {
        self.interpreter.is_some()
    }

    pub fn cache(&self) -> &ScriptCache {
        &self.cache
    }

    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        if self.interpreter.is_some() {
            return Ok(());
        }

        let started = Instant::now();
        let mut interpreter = (self.factory)();
        interpreter.bootstrap().await?;
        for library in &self.preload {
            if self.loaded.insert(library.clone()) {
                interpreter.load_library(library).await?;
            }
        }
        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            preloaded = self.preload.len(),
            "interpreter bootstrapped"
        );
        self.interpreter = Some(interpreter);
        Ok(())
    }
}

#[async_trait]
impl ScriptExecutor for InterpretedExecutor {
    async fn execute(&mut self, job: &JobRequest, ctx: ScriptContext) -> Result<Value, JobError> {
        if let Err(err) = self.bootstrap().await {
            // Leave the slot empty so the next job retries from scratch.
            self.loaded.clear();
            return Err(JobError::from_anyhow(&err.context("interpreter bootstrap failed")));
        }
        let Some(interpreter) = self.interpreter.as_mut() else {
            return Err(JobError::script("interpreter unavailable"));
        };

        for library in &job.libraries {
            if self.loaded.contains(library) {
                continue;
            }
            interpreter
                .load_library(library)
                .await
                .map_err(|err| JobError::from_anyhow(&err.context(format!("loading library `{library}`"))))?;
            debug!(library = %library, "library loaded");
            self.loaded.insert(library.clone());
        }

        let source = self
            .cache
            .get_or_resolve(self.store.as_ref(), &job.script_ref)
            .await
            .map_err(|err| JobError::from_anyhow(&err.context(format!("resolving script {}", job.script_ref))))?;

        interpreter
            .run(&source, &job.entry_point, job.params.clone(), ctx)
            .await
            .map_err(|err| JobError::from_anyhow(&err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::store::InMemoryScriptStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        inner: InMemoryScriptStore,
        resolves: AtomicUsize,
    }

    #[async_trait]
    impl ScriptStore for CountingStore {
        async fn resolve(&self, script_ref: &ScriptRef) -> anyhow::Result<String> {
            self.resolves.fetch_add(1, Ordering::SeqCst);
            self.inner.resolve(script_ref).await
        }

        async fn store(&self, script_ref: &ScriptRef, source: &str, content_type: &str) -> anyhow::Result<()> {
            self.inner.store(script_ref, source, content_type).await
        }
    }

    #[tokio::test]
    async fn cache_resolves_each_reference_once() {
        let store = CountingStore {
            inner: InMemoryScriptStore::new().with_script("a.py", "print(1)"),
            resolves: AtomicUsize::new(0),
        };
        let mut cache = ScriptCache::new();
        let script_ref = ScriptRef::new("a.py");

        let first = cache.get_or_resolve(&store, &script_ref).await.unwrap();
        let second = cache.get_or_resolve(&store, &script_ref).await.unwrap();

        assert_eq!(&*first, "print(1)");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(store.resolves.load(Ordering::SeqCst), 1);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[tokio::test]
    async fn failed_resolution_is_not_cached() {
        let store = CountingStore {
            inner: InMemoryScriptStore::new(),
            resolves: AtomicUsize::new(0),
        };
        let mut cache = ScriptCache::new();
        let script_ref = ScriptRef::new("late.py");

        assert!(cache.get_or_resolve(&store, &script_ref).await.is_err());
        store.store(&script_ref, "x = 1", "text/plain").await.unwrap();
        assert!(cache.get_or_resolve(&store, &script_ref).await.is_ok());
        assert!(cache.contains(&script_ref));
        assert_eq!(store.resolves.load(Ordering::SeqCst), 2);
    }
}
