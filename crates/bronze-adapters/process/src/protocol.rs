//! The line-delimited JSON wire protocol.
//!
//! Each message is one UTF-8 JSON object on its own line.
//!
//! Host → plugin, an **event message**:
//!
//! ```json
//! {"id":"…","type":"event","name":"command","correlationId":"…","payload":{…}}
//! ```
//!
//! Plugin → host, a **response message**. Its `id` echoes the correlation id
//! of the request it answers (responses to fire-and-forget events may use
//! any id):
//!
//! ```json
//! {"id":"…","ok":true,"actions":[{"type":"reply","text":"hi"}],"error":null}
//! ```
//!
//! Actions are side effects the host performs for the plugin; see
//! [`ActionKind`].

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use bronze_core::{Target, TargetKind};

use crate::error::{PluginError, PluginResult};

/// Value of the `type` field on every host → plugin message.
pub const EVENT_MESSAGE_TYPE: &str = "event";

/// Well-known event names sent by the host.
pub mod names {
    /// A matched command forwarded to the plugin (request).
    pub const COMMAND: &str = "command";
    /// An inbound platform event forwarded to a listening plugin.
    pub const EVENT: &str = "event";
    /// Result of a `call-capability` action that carried a correlation id.
    pub const SKILL_RESULT: &str = "skill_result";
    /// Sent before the host closes the plugin's input.
    pub const SHUTDOWN: &str = "shutdown";
}

/// Host → plugin message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub name: String,
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl EventMessage {
    /// Creates a message with a fresh id and no correlation id.
    pub fn new(name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: new_id(),
            kind: EVENT_MESSAGE_TYPE.to_string(),
            name: name.into(),
            correlation_id: None,
            payload,
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Plugin → host message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    #[serde(default)]
    pub id: String,
    pub ok: bool,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub error: Option<String>,
}

impl ResponseMessage {
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: true,
            actions: Vec::new(),
            error: None,
        }
    }

    pub fn failed(id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ok: false,
            actions: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn with_action(mut self, action: Action) -> Self {
        self.actions.push(action);
        self
    }

    /// Turns `ok: false` into [`PluginError::Rejected`].
    pub fn into_result(self) -> PluginResult<Self> {
        if self.ok {
            Ok(self)
        } else {
            let reason = self
                .error
                .unwrap_or_else(|| "plugin reported failure".to_string());
            Err(PluginError::Rejected(reason))
        }
    }
}

/// The kind of side effect an [`Action`] requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    /// Send text back to the conversation the request came from (or the
    /// explicit target).
    Reply,
    /// Send text to an explicit target.
    SendMessage,
    /// Run a host capability on the plugin's behalf.
    CallCapability,
    /// Open a dialog session for a user.
    StartDialog,
    /// Close a user's dialog session.
    EndDialog,
    /// Anything this host does not understand. Ignored.
    #[serde(other)]
    Unknown,
}

/// A side effect requested by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub kind: ActionKind,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub payload: Option<Map<String, Value>>,
}

impl Action {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            target: None,
            target_id: None,
            text: None,
            correlation_id: None,
            payload: None,
        }
    }

    pub fn reply(text: impl Into<String>) -> Self {
        Self::new(ActionKind::Reply).with_text(text)
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_target(mut self, target: &Target) -> Self {
        self.target = Some(target.kind.as_str().to_string());
        self.target_id = Some(target.id.clone());
        self
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// The explicit target named by `target`/`targetId`, if complete and valid.
    pub fn explicit_target(&self) -> Option<Target> {
        let kind: TargetKind = self.target.as_deref()?.parse().ok()?;
        let id = self.target_id.as_deref().filter(|id| !id.is_empty())?;
        Some(Target {
            kind,
            id: id.to_string(),
        })
    }

    /// Reads a string field from the payload.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.as_ref()?.get(key)?.as_str()
    }
}

/// Generates a fresh message or correlation id.
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Serializes `message` as one protocol line, including the trailing newline.
pub fn encode_line<T: Serialize>(message: &T) -> PluginResult<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Parses one line from a plugin.
pub fn decode_response(line: &str) -> PluginResult<ResponseMessage> {
    Ok(serde_json::from_str(line.trim())?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_event_message_wire_format() {
        let mut payload = Map::new();
        payload.insert("text".into(), json!("hi"));
        let message = EventMessage::new("command", payload).with_correlation_id("c1");

        let line = encode_line(&message).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);

        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["type"], "event");
        assert_eq!(value["name"], "command");
        assert_eq!(value["correlationId"], "c1");
        assert_eq!(value["payload"]["text"], "hi");

        let parsed: EventMessage = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn test_uncorrelated_event_serializes_null() {
        let line = encode_line(&EventMessage::new("event", Map::new())).unwrap();
        let value: Value = serde_json::from_str(&line).unwrap();
        assert!(value["correlationId"].is_null());
    }

    #[test]
    fn test_fresh_ids_are_unique() {
        let a = EventMessage::new("x", Map::new());
        let b = EventMessage::new("x", Map::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_decode_response_with_actions() {
        let response = decode_response(
            r#"{"id":"c1","ok":true,"actions":[
                {"type":"reply","text":"hello"},
                {"type":"send-message","target":"group","targetId":"42","text":"hey"},
                {"type":"call-capability","correlationId":"k9","payload":{"capability":"weather"}},
                {"type":"teleport"}
            ],"error":null}"#,
        )
        .unwrap();

        assert_eq!(response.id, "c1");
        assert!(response.ok);
        let kinds: Vec<_> = response.actions.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds,
            [
                ActionKind::Reply,
                ActionKind::SendMessage,
                ActionKind::CallCapability,
                ActionKind::Unknown
            ]
        );
        assert_eq!(response.actions[1].explicit_target(), Some(Target::group("42")));
        assert_eq!(response.actions[2].payload_str("capability"), Some("weather"));
    }

    #[test]
    fn test_response_survives_encode_and_decode() {
        let mut payload = Map::new();
        payload.insert("capability".into(), json!("weather"));
        payload.insert("args".into(), json!(["Paris", 3]));

        let mut response = ResponseMessage::failed("c7", "partly done");
        for kind in [
            ActionKind::Reply,
            ActionKind::SendMessage,
            ActionKind::CallCapability,
            ActionKind::StartDialog,
            ActionKind::EndDialog,
            ActionKind::Unknown,
        ] {
            response = response.with_action(Action::new(kind));
        }
        response.actions[0] = Action::reply("on it");
        response.actions[1] = Action::new(ActionKind::SendMessage)
            .with_target(&Target::private("u9"))
            .with_text("psst");
        response.actions[2] = Action::new(ActionKind::CallCapability)
            .with_correlation_id("k1")
            .with_payload(payload);

        let line = encode_line(&response).unwrap();
        let decoded = decode_response(&line).unwrap();
        assert_eq!(decoded, response);
        assert!(!decoded.ok);
        assert_eq!(decoded.error.as_deref(), Some("partly done"));
        assert_eq!(decoded.actions[1].explicit_target(), Some(Target::private("u9")));
    }

    #[test]
    fn test_decode_minimal_response() {
        let response = decode_response(r#"{"id":"c1","ok":false,"error":"boom"}"#).unwrap();
        assert!(response.actions.is_empty());
        assert!(matches!(response.into_result(), Err(PluginError::Rejected(e)) if e == "boom"));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(decode_response("not json"), Err(PluginError::Codec(_))));
        assert!(matches!(decode_response(r#"{"id":"x"}"#), Err(PluginError::Codec(_))));
    }

    #[test]
    fn test_incomplete_target_is_not_explicit() {
        let mut action = Action::reply("x");
        action.target = Some("group".into());
        assert!(action.explicit_target().is_none());

        action.target = Some("channel".into());
        action.target_id = Some("1".into());
        assert!(action.explicit_target().is_none());
    }
}
