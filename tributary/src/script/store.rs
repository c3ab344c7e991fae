use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::debug;

use crate::job::ScriptRef;

/// Storage that turns script references into source text.
#[async_trait]
pub trait ScriptStore: Send + Sync {
    /// Fetch the source for `script_ref`.
    async fn resolve(&self, script_ref: &ScriptRef) -> anyhow::Result<String>;

    /// Upload `source` under `script_ref`, replacing anything already there.
    async fn store(
        &self,
        script_ref: &ScriptRef,
        source: &str,
        content_type: &str,
    ) -> anyhow::Result<()>;
}

/// A stored script and the content type it was uploaded with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoredScript {
    pub source: String,
    pub content_type: String,
}

/// Map-backed store.
#[derive(Debug, Default)]
pub struct InMemoryScriptStore {
    scripts: RwLock<HashMap<ScriptRef, StoredScript>>,
}

impl InMemoryScriptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a script at construction time.
    pub fn with_script(mut self, script_ref: impl Into<ScriptRef>, source: impl Into<String>) -> Self {
        self.scripts.get_mut().insert(
            script_ref.into(),
            StoredScript {
                source: source.into(),
                content_type: "text/plain".to_string(),
            },
        );
        self
    }

    pub async fn get(&self, script_ref: &ScriptRef) -> Option<StoredScript> {
        self.scripts.read().await.get(script_ref).cloned()
    }

    pub async fn len(&self) -> usize {
        self.scripts.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.scripts.read().await.is_empty()
    }
}

#[async_trait]
impl ScriptStore for InMemoryScriptStore {
    async fn resolve(&self, script_ref: &ScriptRef) -> anyhow::Result<String> {
        self.scripts
            .read()
            .await
            .get(script_ref)
            .map(|stored| stored.source.clone())
            .with_context(|| format!("script {script_ref} is not in the store"))
    }

    async fn store(
        &self,
        script_ref: &ScriptRef,
        source: &str,
        content_type: &str,
    ) -> anyhow::Result<()> {
        self.scripts.write().await.insert(
            script_ref.clone(),
            StoredScript {
                source: source.to_string(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }
}

/// Store that fetches scripts over HTTP and keeps uploads and fetched
/// sources in a local map.
///
/// Relative references are joined onto `base_url`; absolute http(s) URLs are
/// fetched as-is. Uploaded scripts never leave the process.
pub struct HttpScriptStore {
    client: reqwest::Client,
    base_url: String,
    local: InMemoryScriptStore,
}

impl HttpScriptStore {
    /// * `base_url` - Origin relative references resolve against, e.g. `https://host`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    /// Reuse an existing client (connection pooling).
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            local: InMemoryScriptStore::new(),
        }
    }

    fn url_for(&self, script_ref: &ScriptRef) -> String {
        if script_ref.is_remote() {
            return script_ref.to_string();
        }
        let path = script_ref.as_str().trim_start_matches('/');
        format!("{}/{}", self.base_url, path)
    }
}

impl std::fmt::Debug for HttpScriptStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpScriptStore")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl ScriptStore for HttpScriptStore {
    async fn resolve(&self, script_ref: &ScriptRef) -> anyhow::Result<String> {
        if let Some(stored) = self.local.get(script_ref).await {
            return Ok(stored.source);
        }

        let url = self.url_for(script_ref);
        debug!(script_ref = %script_ref, url = %url, "fetching remote script");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?
            .error_for_status()
            .with_context(|| format!("GET {url} returned an error status"))?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("text/plain")
            .to_string();
        let source = response
            .text()
            .await
            .with_context(|| format!("reading body of {url} failed"))?;

        self.local.store(script_ref, &source, &content_type).await?;
        Ok(source)
    }

    async fn store(
        &self,
        script_ref: &ScriptRef,
        source: &str,
        content_type: &str,
    ) -> anyhow::Result<()> {
        self.local.store(script_ref, source, content_type).await
    }
}
