//! Message envelopes exchanged between dispatchers, pools and workers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::JobError;
use crate::job::{JobRequest, RequestId};

/// Tagged message carried on every worker channel.
///
/// Serialized with a `type` discriminator in snake case, so a request reads
/// `{"type": "request", "request_id": ..., "script_uri": ..., ...}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Top-level job from a dispatcher.
    Request(JobRequest),
    /// Job submitted through a worker pool.
    SubRequest(JobRequest),
    /// Pacing signal delivered to a job suspended in `await_step`.
    Step {
        request_id: RequestId,
        #[serde(default)]
        step: Value,
    },
    /// Successful terminal outcome.
    Result {
        request_id: RequestId,
        #[serde(default)]
        data: Value,
    },
    /// Failed terminal outcome.
    Error {
        request_id: RequestId,
        error: JobError,
    },
    /// Non-terminal progress payload emitted by a running job.
    Message {
        request_id: RequestId,
        #[serde(default)]
        data: Value,
    },
}

impl Envelope {
    pub fn request_id(&self) -> &RequestId {
        match self {
            Envelope::Request(job) | Envelope::SubRequest(job) => &job.request_id,
            Envelope::Step { request_id, .. }
            | Envelope::Result { request_id, .. }
            | Envelope::Error { request_id, .. }
            | Envelope::Message { request_id, .. } => request_id,
        }
    }

    /// Wire name of the variant.
    pub fn type_name(&self) -> &'static str {
        match self {
            Envelope::Request(_) => "request",
            Envelope::SubRequest(_) => "sub_request",
            Envelope::Step { .. } => "step",
            Envelope::Result { .. } => "result",
            Envelope::Error { .. } => "error",
            Envelope::Message { .. } => "message",
        }
    }

    /// Whether this envelope ends its job.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Envelope::Result { .. } | Envelope::Error { .. })
    }

    pub fn outcome(request_id: RequestId, outcome: Result<Value, JobError>) -> Self {
        match outcome {
            Ok(data) => Envelope::Result { request_id, data },
            Err(error) => Envelope::Error { request_id, error },
        }
    }

    /// Split a terminal envelope into its request id and outcome.
    pub fn into_outcome(self) -> Option<(RequestId, Result<Value, JobError>)> {
        match self {
            Envelope::Result { request_id, data } => Some((request_id, Ok(data))),
            Envelope::Error { request_id, error } => Some((request_id, Err(error))),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::Framework;
    use serde_json::json;

    #[test]
    fn sub_request_is_flattened_under_type_tag() {
        let job = JobRequest::new("mod", Framework::Native, "square", json!(4))
            .with_request_id("sub-1");
        let value = serde_json::to_value(Envelope::SubRequest(job)).unwrap();

        assert_eq!(value["type"], "sub_request");
        assert_eq!(value["request_id"], "sub-1");
        assert_eq!(value["function_name"], "square");
    }

    #[test]
    fn error_envelope_decodes_from_wire() {
        let envelope: Envelope = serde_json::from_value(json!({
            "type": "error",
            "request_id": "r-9",
            "error": {"kind": "script", "message": "NameError"},
        }))
        .unwrap();

        assert!(envelope.is_terminal());
        assert_eq!(envelope.request_id().as_str(), "r-9");
        let (_, outcome) = envelope.into_outcome().unwrap();
        assert_eq!(outcome, Err(JobError::script("NameError")));
    }

    #[test]
    fn messages_and_steps_are_not_terminal() {
        let message = Envelope::Message {
            request_id: "r".into(),
            data: json!({"progress": 0.5}),
        };
        let step = Envelope::Step {
            request_id: "r".into(),
            step: json!(1),
        };
        assert!(!message.is_terminal());
        assert!(!step.is_terminal());
        assert_eq!(step.type_name(), "step");
        assert!(message.into_outcome().is_none());
    }
}
