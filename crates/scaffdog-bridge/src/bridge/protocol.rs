//! Wire protocol types for host-worker communication.
//!
//! Every message crossing the channel is an [`Envelope`]:
//! - **sessionId**: which session the envelope belongs to
//! - **method**: application method (`import`, `list`, `generate`) or a
//!   built-in control method (`worker/open`, `worker/close`, `worker/ack`)
//! - **ack**: set only on acknowledgements, names the acknowledged method
//! - **body** / **error**: at most one of them is non-null

use std::borrow::Cow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of one session multiplexed over the channel.
///
/// Host sessions are numbered from a process-wide counter; worker sessions
/// carry [`SessionId::PLACEHOLDER`] until an `open` request binds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(u64);

impl SessionId {
    pub const PLACEHOLDER: SessionId = SessionId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Method discriminator carried by every envelope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Method(Cow<'static, str>);

impl Method {
    /// Host asks the worker to bind an idle session.
    pub const OPEN: Method = Method::from_static("worker/open");
    /// Either side tears a session down.
    pub const CLOSE: Method = Method::from_static("worker/close");
    /// Acknowledgement of a control method, see [`Envelope::ack`].
    pub const ACK: Method = Method::from_static("worker/ack");
    /// Wildcard mailbox for envelopes nobody registered an expectation for.
    pub const ANY: Method = Method::from_static("worker/any");

    pub const IMPORT: Method = Method::from_static("import");
    pub const LIST: Method = Method::from_static("list");
    pub const GENERATE: Method = Method::from_static("generate");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Control methods handled by the connector itself.
    pub fn is_builtin(&self) -> bool {
        self.0.starts_with("worker/")
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Structured error carried across the boundary in [`Envelope`] `error`.
///
/// Never contains a language-specific trace; nested failures (for example
/// every parse error of a project) travel in `errors`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{name}: {message}")]
pub struct WireError {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<WireError>,
}

impl WireError {
    /// Name of the error sent when the user dismisses a prompt.
    pub const CANCELLED: &'static str = "PromptCancelError";
    /// Name of locally synthesized desynchronization failures.
    pub const DESYNC: &'static str = "DesynchronizationError";
    pub const VALIDATION: &'static str = "ValidationError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
            errors: Vec::new(),
        }
    }

    pub fn with_errors(mut self, errors: Vec<WireError>) -> Self {
        self.errors = errors;
        self
    }

    pub fn cancelled() -> Self {
        Self::new(Self::CANCELLED, "prompt cancelled")
    }

    pub fn desync(message: impl Into<String>) -> Self {
        Self::new(Self::DESYNC, message)
    }

    pub fn is_cancelled(&self) -> bool {
        self.name == Self::CANCELLED
    }

    pub fn is_desync(&self) -> bool {
        self.name == Self::DESYNC
    }

    /// Message with the nested error messages appended: `"msg (a, b)"`.
    pub fn summary(&self) -> String {
        if self.errors.is_empty() {
            return self.message.clone();
        }
        let nested: Vec<&str> = self.errors.iter().map(|e| e.message.as_str()).collect();
        format!("{} ({})", self.message, nested.join(", "))
    }
}

/// Envelope payload. `Empty` is what control messages carry.
///
/// A `null` body is indistinguishable from no body on the wire, so
/// `Body(Value::Null)` and `Empty` mean the same thing. [`Payload::body`]
/// and [`Envelope::new`] fold the former into the latter.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    Body(serde_json::Value),
    Error(WireError),
}

impl Payload {
    /// Success payload; `null` becomes [`Payload::Empty`].
    pub fn body(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Payload::Empty,
            value => Payload::Body(value),
        }
    }

    fn normalized(self) -> Self {
        match self {
            Payload::Body(value) => Payload::body(value),
            other => other,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Payload::Error(_))
    }

    /// Success bodies (empty counts as `null`) or the carried error.
    pub fn into_result(self) -> Result<serde_json::Value, WireError> {
        match self {
            Payload::Empty => Ok(serde_json::Value::Null),
            Payload::Body(body) => Ok(body),
            Payload::Error(error) => Err(error),
        }
    }
}

/// One wire message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawEnvelope", into = "RawEnvelope")]
pub struct Envelope {
    pub session: SessionId,
    pub method: Method,
    pub ack: Option<Method>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(session: SessionId, method: Method, payload: Payload) -> Self {
        Self {
            session,
            method,
            ack: None,
            payload: payload.normalized(),
        }
    }

    pub fn control(session: SessionId, method: Method) -> Self {
        Self::new(session, method, Payload::Empty)
    }

    pub fn ack(session: SessionId, acked: Method) -> Self {
        Self {
            session,
            method: Method::ACK,
            ack: Some(acked),
            payload: Payload::Empty,
        }
    }

    /// Local failure standing in for an envelope that never arrived.
    pub fn failure(session: SessionId, method: Method, error: WireError) -> Self {
        Self::new(session, method, Payload::Error(error))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("envelope for {session} `{method}` carries both a body and an error")]
pub struct EnvelopeShapeError {
    session: SessionId,
    method: Method,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEnvelope {
    session_id: SessionId,
    method: Method,
    #[serde(default)]
    ack: Option<Method>,
    #[serde(default)]
    body: Option<serde_json::Value>,
    #[serde(default)]
    error: Option<WireError>,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = EnvelopeShapeError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let payload = match (raw.body, raw.error) {
            (Some(_), Some(_)) => {
                return Err(EnvelopeShapeError {
                    session: raw.session_id,
                    method: raw.method,
                });
            }
            (Some(body), None) => Payload::body(body),
            (None, Some(error)) => Payload::Error(error),
            (None, None) => Payload::Empty,
        };
        Ok(Self {
            session: raw.session_id,
            method: raw.method,
            ack: raw.ack,
            payload,
        })
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let (body, error) = match envelope.payload {
            Payload::Empty | Payload::Body(serde_json::Value::Null) => (None, None),
            Payload::Body(body) => (Some(body), None),
            Payload::Error(error) => (None, Some(error)),
        };
        Self {
            session_id: envelope.session,
            method: envelope.method,
            ack: envelope.ack,
            body,
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn import_request_serializes() {
        let envelope = Envelope::new(
            SessionId::new(3),
            Method::IMPORT,
            Payload::Body(json!({ "specifier": null })),
        );
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "sessionId": 3,
          "method": "import",
          "ack": null,
          "body": {
            "specifier": null
          },
          "error": null
        }
        "#);
    }

    #[test]
    fn null_body_is_an_empty_payload() {
        assert_eq!(Payload::body(serde_json::Value::Null), Payload::Empty);
        assert_eq!(Payload::body(json!(false)), Payload::Body(json!(false)));

        let built = Envelope::new(SessionId::new(4), Method::GENERATE, Payload::Body(json!(null)));
        assert_eq!(built.payload, Payload::Empty);

        // Built by hand, it still travels and decodes as empty.
        let raw = Envelope {
            payload: Payload::Body(json!(null)),
            ..Envelope::control(SessionId::new(4), Method::GENERATE)
        };
        let decoded: Envelope = serde_json::from_value(serde_json::to_value(&raw).unwrap()).unwrap();
        assert_eq!(decoded, built);
        assert_eq!(decoded.payload.into_result(), Ok(serde_json::Value::Null));
    }

    #[test]
    fn ack_serializes() {
        let envelope = Envelope::ack(SessionId::new(1), Method::CLOSE);
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "sessionId": 1,
          "method": "worker/ack",
          "ack": "worker/close",
          "body": null,
          "error": null
        }
        "#);
    }

    #[test]
    fn failure_serializes() {
        let error = WireError::new("ProjectError", "Cannot resolve scaffdog project!")
            .with_errors(vec![WireError::new("ParseError", "bad front matter")]);
        let envelope = Envelope::failure(SessionId::new(2), Method::LIST, error);
        insta::assert_json_snapshot!(envelope, @r#"
        {
          "sessionId": 2,
          "method": "list",
          "ack": null,
          "body": null,
          "error": {
            "name": "ProjectError",
            "message": "Cannot resolve scaffdog project!",
            "errors": [
              {
                "name": "ParseError",
                "message": "bad front matter"
              }
            ]
          }
        }
        "#);
    }

    #[test]
    fn body_and_error_rejected() {
        let raw = json!({
            "sessionId": 1,
            "method": "list",
            "ack": null,
            "body": [],
            "error": { "name": "Error", "message": "boom" }
        });
        let err = serde_json::from_value::<Envelope>(raw).unwrap_err();
        assert!(err.to_string().contains("both a body and an error"));
    }

    #[test]
    fn missing_payload_is_empty() {
        let raw = json!({ "sessionId": 7, "method": "worker/open" });
        let envelope: Envelope = serde_json::from_value(raw).unwrap();
        assert_eq!(envelope.session, SessionId::new(7));
        assert_eq!(envelope.method, Method::OPEN);
        assert_eq!(envelope.payload, Payload::Empty);
        assert_eq!(envelope.payload.into_result().unwrap(), serde_json::Value::Null);
    }

    #[test]
    fn builtin_methods() {
        assert!(Method::OPEN.is_builtin());
        assert!(Method::ANY.is_builtin());
        assert!(!Method::GENERATE.is_builtin());
        assert_eq!(Method::new("generate"), Method::GENERATE);
    }

    #[test]
    fn summary_appends_nested_messages() {
        let error = WireError::new("Error", "2 documents failed")
            .with_errors(vec![WireError::new("E", "a"), WireError::new("E", "b")]);
        assert_eq!(error.summary(), "2 documents failed (a, b)");
        assert_eq!(WireError::new("E", "plain").summary(), "plain");
    }

    #[test]
    fn session_id_displays_with_hash() {
        assert_eq!(SessionId::new(12).to_string(), "#12");
    }
}
