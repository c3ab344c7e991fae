//! Script execution: the executor seam, the two framework executors, the
//! script store and the bridge exposed to running scripts.

pub mod context;
pub mod interpreted;
pub mod native;
pub mod store;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::JobError;
use crate::job::{Framework, JobRequest};

pub use context::ScriptContext;
pub use interpreted::{InterpretedExecutor, Interpreter, InterpreterFactory, ScriptCache};
pub use native::{NativeExecutor, NativeModule, NativeRegistry};
pub use store::{HttpScriptStore, InMemoryScriptStore, ScriptStore, StoredScript};

/// Runs one job to completion.
///
/// Executors are owned by a single worker and only ever run one job at a
/// time, hence `&mut self`.
#[async_trait]
pub trait ScriptExecutor: Send {
    async fn execute(&mut self, job: &JobRequest, ctx: ScriptContext) -> Result<Value, JobError>;
}

/// The executors owned by one worker, one per framework.
#[derive(Debug)]
pub struct Executors {
    native: NativeExecutor,
    interpreted: Option<InterpretedExecutor>,
}

impl Executors {
    pub fn new(native: NativeExecutor, interpreted: Option<InterpretedExecutor>) -> Self {
        Self { native, interpreted }
    }

    fn for_framework(&mut self, framework: Framework) -> Result<&mut dyn ScriptExecutor, JobError> {
        match framework {
            Framework::Native => Ok(&mut self.native),
            Framework::Interpreted => match self.interpreted.as_mut() {
                Some(executor) => Ok(executor),
                None => Err(JobError::not_found("interpreter for the interpreted framework")),
            },
        }
    }

    pub async fn execute(&mut self, job: &JobRequest, ctx: ScriptContext) -> Result<Value, JobError> {
        self.for_framework(job.framework)?.execute(job, ctx).await
    }
}
