use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tributary::{InMemoryScriptStore, ObjectStore, ScriptRef, ScriptStore};

/// Script store that counts resolutions and uploads on top of an in-memory map.
#[derive(Clone, Default)]
pub struct RecordingScriptStore {
    inner: Arc<InMemoryScriptStore>,
    resolved: Arc<Mutex<Vec<ScriptRef>>>,
    stored: Arc<Mutex<Vec<(ScriptRef, String)>>>,
}

impl RecordingScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script_ref: impl Into<ScriptRef>, source: impl Into<String>) -> Self {
        let inner = Arc::try_unwrap(self.inner)
            .unwrap_or_default()
            .with_script(script_ref, source);
        Self {
            inner: Arc::new(inner),
            ..self
        }
    }

    /// Every reference passed to `resolve`, in call order.
    pub fn resolved(&self) -> Vec<ScriptRef> {
        self.resolved.lock().clone()
    }

    pub fn resolve_count(&self, script_ref: &str) -> usize {
        self.resolved
            .lock()
            .iter()
            .filter(|resolved| resolved.as_str() == script_ref)
            .count()
    }

    /// `(reference, content type)` of every upload.
    pub fn stored(&self) -> Vec<(ScriptRef, String)> {
        self.stored.lock().clone()
    }

    pub async fn source_of(&self, script_ref: &str) -> Option<String> {
        self.inner
            .get(&ScriptRef::from(script_ref))
            .await
            .map(|stored| stored.source)
    }
}

#[async_trait]
impl ScriptStore for RecordingScriptStore {
    async fn resolve(&self, script_ref: &ScriptRef) -> anyhow::Result<String> {
        self.resolved.lock().push(script_ref.clone());
        self.inner.resolve(script_ref).await
    }

    async fn store(&self, script_ref: &ScriptRef, source: &str, content_type: &str) -> anyhow::Result<()> {
        self.stored
            .lock()
            .push((script_ref.clone(), content_type.to_string()));
        self.inner.store(script_ref, source, content_type).await
    }
}

/// Object store serving canned bodies after a scripted number of misses.
#[derive(Clone, Default)]
pub struct ScriptedObjectStore {
    bodies: Arc<Mutex<HashMap<String, (u32, Vec<u8>)>>>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl ScriptedObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `body` at `url` after the first `misses` requests for it fail.
    pub fn serve(self, url: impl Into<String>, misses: u32, body: impl Into<Vec<u8>>) -> Self {
        self.bodies.lock().insert(url.into(), (misses, body.into()));
        self
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self, url: &str) -> usize {
        self.requests.lock().iter().filter(|seen| seen.as_str() == url).count()
    }
}

#[async_trait]
impl ObjectStore for ScriptedObjectStore {
    async fn get(&self, url: &str) -> anyhow::Result<Vec<u8>> {
        self.requests.lock().push(url.to_string());
        let mut bodies = self.bodies.lock();
        let Some((misses, body)) = bodies.get_mut(url) else {
            anyhow::bail!("404 Not Found: {url}");
        };
        if *misses > 0 {
            *misses -= 1;
            anyhow::bail!("404 Not Found: {url}");
        }
        Ok(body.clone())
    }
}
