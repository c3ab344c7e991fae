use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tributary::{Interpreter, ScriptContext};

/// Everything the mock interpreters created from one log did, in order.
#[derive(Clone, Default)]
pub struct InterpreterLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl InterpreterLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|entry| entry.starts_with(prefix))
            .count()
    }

    pub fn bootstraps(&self) -> usize {
        self.count("bootstrap")
    }

    pub fn loads_of(&self, library: &str) -> usize {
        self.count(&format!("load {library}"))
    }

    fn push(&self, entry: String) {
        self.entries.lock().push(entry);
    }
}

/// Interpreter stand-in.
///
/// `run` understands a few entry points: `echo` returns the params, `fail`
/// errors, `fan_out` distributes `echo` over an array of params. Any other
/// entry point returns the source text it was handed, which lets tests see
/// what the script store served.
pub struct MockInterpreter {
    log: InterpreterLog,
    fail_bootstrap: bool,
}

impl MockInterpreter {
    pub fn new(log: InterpreterLog) -> Self {
        Self {
            log,
            fail_bootstrap: false,
        }
    }

    pub fn failing_bootstrap(log: InterpreterLog) -> Self {
        Self {
            log,
            fail_bootstrap: true,
        }
    }

    /// Factory closure suitable for `SchedulerBuilder::with_interpreter`.
    pub fn factory(log: InterpreterLog) -> impl Fn() -> Box<dyn Interpreter> + Send + Sync + 'static {
        move || Box::new(MockInterpreter::new(log.clone())) as Box<dyn Interpreter>
    }
}

#[async_trait]
impl Interpreter for MockInterpreter {
    async fn bootstrap(&mut self) -> anyhow::Result<()> {
        self.log.push("bootstrap".to_string());
        if self.fail_bootstrap {
            anyhow::bail!("mock interpreter refused to start");
        }
        Ok(())
    }

    async fn load_library(&mut self, library: &str) -> anyhow::Result<()> {
        self.log.push(format!("load {library}"));
        Ok(())
    }

    async fn run(
        &mut self,
        source: &str,
        entry_point: &str,
        params: Value,
        bridge: ScriptContext,
    ) -> anyhow::Result<Value> {
        self.log.push(format!("run {entry_point}"));
        match entry_point {
            "echo" => Ok(params),
            "fail" => anyhow::bail!("mock script raised: {params}"),
            "fan_out" => {
                let items = params.as_array().cloned().unwrap_or_default();
                Ok(Value::Array(bridge.distribute_many("echo", items).await?))
            }
            _ => Ok(json!({ "source": source, "params": params })),
        }
    }
}
