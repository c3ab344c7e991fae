use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Entry point invoked when a submission does not name one.
pub const DEFAULT_ENTRY_POINT: &str = "run";

/// Correlation token linking a request to its eventual response.
///
/// Ids are opaque strings on the wire so callers may bring their own; the
/// scheduler mints UUIDv7 values when it needs a fresh one.
#[derive(Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mint a fresh, time-ordered id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RequestId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RequestId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of a single worker runtime.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(format!("worker-{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for WorkerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference to a script: a URL, a store path, or a registered module name.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScriptRef(String);

impl ScriptRef {
    pub fn new(uri: impl Into<String>) -> Self {
        Self(uri.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the reference is an absolute http(s) URL.
    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl AsRef<str> for ScriptRef {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScriptRef {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ScriptRef {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Execution environment a job's script targets.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    /// Modules compiled into the host and registered by name.
    #[serde(alias = "js")]
    Native,
    /// Source text run by an embedded interpreter.
    #[serde(alias = "py")]
    Interpreted,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Native => "native",
            Framework::Interpreted => "interpreted",
        }
    }

    /// Content type used when an inline script is uploaded without one.
    pub fn default_content_type(&self) -> &'static str {
        match self {
            Framework::Native => "application/javascript",
            Framework::Interpreted => "text/plain",
        }
    }
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one unit of work.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub request_id: RequestId,
    #[serde(rename = "script_uri")]
    pub script_ref: ScriptRef,
    pub framework: Framework,
    #[serde(rename = "function_name", default = "default_entry_point")]
    pub entry_point: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<String>,
}

fn default_entry_point() -> String {
    DEFAULT_ENTRY_POINT.to_string()
}

impl JobRequest {
    pub fn new(
        script_ref: impl Into<ScriptRef>,
        framework: Framework,
        entry_point: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            request_id: RequestId::generate(),
            script_ref: script_ref.into(),
            framework,
            entry_point: entry_point.into(),
            params,
            libraries: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Set the libraries the job needs loaded, dropping repeats but keeping order.
    pub fn with_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.libraries = dedupe_libraries(libraries);
        self
    }

    /// Derive a sub-job that runs another entry point of the same script.
    ///
    /// The child gets a fresh request id and inherits the script, framework
    /// and libraries of its parent.
    pub fn derive(&self, entry_point: &str, params: Value) -> Self {
        Self {
            request_id: RequestId::generate(),
            script_ref: self.script_ref.clone(),
            framework: self.framework,
            entry_point: entry_point.to_string(),
            params,
            libraries: self.libraries.clone(),
        }
    }
}

/// A job as handed to the dispatcher by a host application.
///
/// Exactly one of `script_uri` and `script` is expected; when both are set
/// the reference wins and the inline text is ignored.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobSubmission {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<RequestId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_uri: Option<ScriptRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub framework: Framework,
    #[serde(default = "default_entry_point")]
    pub function_name: String,
    #[serde(default)]
    pub params: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub libraries: Vec<String>,
}

impl JobSubmission {
    /// Submission whose script is already resolvable by reference.
    pub fn from_uri(
        script_uri: impl Into<ScriptRef>,
        framework: Framework,
        function_name: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            request_id: None,
            script_uri: Some(script_uri.into()),
            script: None,
            content_type: None,
            framework,
            function_name: function_name.into(),
            params,
            libraries: Vec::new(),
        }
    }

    /// Submission carrying its script text inline.
    pub fn inline(
        script: impl Into<String>,
        framework: Framework,
        function_name: impl Into<String>,
        params: Value,
    ) -> Self {
        Self {
            request_id: None,
            script_uri: None,
            script: Some(script.into()),
            content_type: None,
            framework,
            function_name: function_name.into(),
            params,
            libraries: Vec::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<RequestId>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_libraries<I, S>(mut self, libraries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.libraries = dedupe_libraries(libraries);
        self
    }
}

fn dedupe_libraries<I, S>(libraries: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut out: Vec<String> = Vec::new();
    for library in libraries {
        let library = library.into();
        if !out.contains(&library) {
            out.push(library);
        }
    }
    out
}
