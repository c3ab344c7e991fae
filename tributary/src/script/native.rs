use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use super::context::ScriptContext;
use super::ScriptExecutor;
use crate::error::JobError;
use crate::job::{JobRequest, ScriptRef};

type NativeHandler = Arc<dyn Fn(ScriptContext, Value) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

/// A named set of async entry points compiled into the host.
///
/// ```ignore
/// let module = NativeModule::new()
///     .entry("square", |_ctx, n| async move { Ok(json!(n.as_i64().unwrap_or(0).pow(2))) });
/// ```
#[derive(Clone, Default)]
pub struct NativeModule {
    entry_points: HashMap<String, NativeHandler>,
}

impl std::fmt::Debug for NativeModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.entry_points().collect();
        names.sort_unstable();
        f.debug_struct("NativeModule").field("entry_points", &names).finish()
    }
}

impl NativeModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry point. A later registration under the same name wins.
    pub fn entry<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ScriptContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let handler: NativeHandler = Arc::new(
            move |ctx: ScriptContext, params: Value| -> BoxFuture<'static, anyhow::Result<Value>> {
                Box::pin(handler(ctx, params))
            },
        );
        self.entry_points.insert(name.into(), handler);
        self
    }

    pub fn entry_points(&self) -> impl Iterator<Item = &str> {
        self.entry_points.keys().map(String::as_str)
    }

    pub fn has_entry(&self, name: &str) -> bool {
        self.entry_points.contains_key(name)
    }

    fn handler(&self, name: &str) -> Option<NativeHandler> {
        self.entry_points.get(name).cloned()
    }
}

/// Modules addressable by script reference. Cheap to clone and shared by
/// every worker.
#[derive(Clone, Debug, Default)]
pub struct NativeRegistry {
    modules: Arc<HashMap<ScriptRef, NativeModule>>,
}

impl NativeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, script_ref: impl Into<ScriptRef>, module: NativeModule) -> Self {
        Arc::make_mut(&mut self.modules).insert(script_ref.into(), module);
        self
    }

    pub fn get(&self, script_ref: &ScriptRef) -> Option<&NativeModule> {
        self.modules.get(script_ref)
    }

    pub fn contains(&self, script_ref: &ScriptRef) -> bool {
        self.modules.contains_key(script_ref)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Runs jobs whose script is a registered native module.
#[derive(Debug, Clone)]
pub struct NativeExecutor {
    registry: NativeRegistry,
}

impl NativeExecutor {
    pub fn new(registry: NativeRegistry) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ScriptExecutor for NativeExecutor {
    async fn execute(&mut self, job: &JobRequest, ctx: ScriptContext) -> Result<Value, JobError> {
        let module = self
            .registry
            .get(&job.script_ref)
            .ok_or_else(|| JobError::not_found(format!("native module `{}`", job.script_ref)))?;
        let handler = module.handler(&job.entry_point).ok_or_else(|| {
            JobError::not_found(format!(
                "entry point `{}` in native module `{}`",
                job.entry_point, job.script_ref
            ))
        })?;

        handler(ctx, job.params.clone())
            .await
            .map_err(|err| JobError::from_anyhow(&err))
    }
}
