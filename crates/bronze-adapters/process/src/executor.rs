//! Host-side execution of plugin actions.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use bronze_core::{Entities, Event, ReplySink, Target};
use bronze_framework::{BoxError, DialogManager, Invocation, Registry, SessionKey};

use crate::connection::{ActionContext, ActionHandler};
use crate::protocol::{Action, ActionKind, names, new_id};

/// Platform name stamped on events synthesized for `call-capability`
/// actions that have no source event.
pub const SYNTHETIC_PLATFORM: &str = "plugin";

/// Step a dialog starts at when the action names none.
pub const DEFAULT_DIALOG_STEP: &str = "start";

/// Performs plugin actions against the host's registry, reply sink and
/// dialog manager.
///
/// | action            | effect                                                  |
/// |-------------------|---------------------------------------------------------|
/// | `reply`           | text to the explicit target, else the source conversation |
/// | `send-message`    | text to the explicit target (required)                  |
/// | `call-capability` | runs a capability, reports back as `skill_result`       |
/// | `start-dialog`    | opens a dialog session, optional prompt text            |
/// | `end-dialog`      | closes the session, optional closing text               |
///
/// Failures are logged; nothing is reported back to the plugin except the
/// `skill_result` of a correlated capability call.
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<Registry>,
    replies: Arc<dyn ReplySink>,
    dialogs: Option<DialogManager>,
}

impl ActionExecutor {
    pub fn new(registry: Arc<Registry>, replies: Arc<dyn ReplySink>) -> Self {
        Self {
            registry,
            replies,
            dialogs: None,
        }
    }

    /// Enables `start-dialog` / `end-dialog`.
    pub fn with_dialogs(mut self, dialogs: DialogManager) -> Self {
        self.dialogs = Some(dialogs);
        self
    }

    async fn deliver(&self, target: &Target, text: &str) -> Result<(), BoxError> {
        self.replies.reply(target, text).await?;
        Ok(())
    }

    async fn reply(&self, action: &Action, ctx: &ActionContext) -> Result<(), BoxError> {
        let Some(text) = action.text.as_deref() else {
            warn!(plugin = %ctx.plugin_id, "Reply action without text");
            return Ok(());
        };
        let Some(target) = action.explicit_target().or_else(|| ctx.default_target()) else {
            warn!(plugin = %ctx.plugin_id, "Reply action has no target and no source event");
            return Ok(());
        };
        self.deliver(&target, text).await
    }

    async fn send_message(&self, action: &Action, ctx: &ActionContext) -> Result<(), BoxError> {
        let Some(text) = action.text.as_deref() else {
            warn!(plugin = %ctx.plugin_id, "Send-message action without text");
            return Ok(());
        };
        let Some(target) = action.explicit_target() else {
            warn!(plugin = %ctx.plugin_id, "Send-message action without a valid target");
            return Ok(());
        };
        self.deliver(&target, text).await
    }

    async fn call_capability(&self, action: &Action, ctx: &ActionContext) -> Result<(), BoxError> {
        let payload = action.payload.clone().unwrap_or_default();
        let event = synthetic_event(action, &payload, ctx);
        let entities = Arc::new(Entities::from_event(&event));
        let event = Arc::new(event);

        let (capability, result) = match payload.get("capability").and_then(Value::as_str) {
            Some(name) => {
                let invocation = Invocation::new(Arc::clone(&event), entities, name)
                    .with_args(string_list(payload.get("args")));
                let result = self.registry.invoke(name, invocation).await;
                (Some(name.to_string()), result.map_err(|e| e.to_string()))
            }
            // Match the text against triggers without notifying listeners,
            // so a plugin cannot re-trigger its own event subscriptions.
            None => match self.registry.find_command(event.text()) {
                Some(found) => {
                    let invocation = Invocation::new(Arc::clone(&event), entities, found.command.as_str())
                        .with_trigger(found.trigger)
                        .with_args(found.args);
                    let result = self.registry.invoke(&found.command, invocation).await;
                    (Some(found.command), result.map_err(|e| e.to_string()))
                }
                None => (None, Err(format!("no capability matches '{}'", event.text()))),
            },
        };
        debug!(plugin = %ctx.plugin_id, capability = ?capability, ok = result.is_ok(), "Capability called by plugin");

        match action.correlation_id.as_deref() {
            Some(correlation_id) => {
                let mut outcome = Map::new();
                outcome.insert("ok".into(), json!(result.is_ok()));
                outcome.insert("capability".into(), json!(capability));
                match &result {
                    Ok(text) => {
                        outcome.insert("text".into(), json!(text));
                        outcome.insert("error".into(), Value::Null);
                    }
                    Err(e) => {
                        outcome.insert("text".into(), Value::Null);
                        outcome.insert("error".into(), json!(e));
                    }
                }
                ctx.connection
                    .send_event(names::SKILL_RESULT, outcome, Some(correlation_id))
                    .await?;
            }
            None => match result {
                Ok(Some(text)) => {
                    let target = action.explicit_target().unwrap_or_else(|| event.origin());
                    self.deliver(&target, &text).await?;
                }
                Ok(None) => {}
                Err(e) => warn!(plugin = %ctx.plugin_id, error = %e, "Uncorrelated capability call failed"),
            },
        }
        Ok(())
    }

    async fn start_dialog(&self, action: &Action, ctx: &ActionContext) -> Result<(), BoxError> {
        let Some(dialogs) = &self.dialogs else {
            warn!(plugin = %ctx.plugin_id, "Dialogs are not enabled; ignoring start-dialog");
            return Ok(());
        };
        let Some(key) = session_key(action, ctx) else {
            warn!(plugin = %ctx.plugin_id, "Start-dialog action names no user");
            return Ok(());
        };
        let Some(target_action) = action.payload_str("action") else {
            warn!(plugin = %ctx.plugin_id, "Start-dialog action names no capability");
            return Ok(());
        };

        let step = action.payload_str("step").unwrap_or(DEFAULT_DIALOG_STEP);
        let data = action
            .payload
            .as_ref()
            .and_then(|payload| payload.get("data"))
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        dialogs
            .start_dialog_with_data(&key, &ctx.plugin_id, target_action, step, data)
            .await?;

        self.prompt(action, &key).await
    }

    async fn end_dialog(&self, action: &Action, ctx: &ActionContext) -> Result<(), BoxError> {
        let Some(dialogs) = &self.dialogs else {
            warn!(plugin = %ctx.plugin_id, "Dialogs are not enabled; ignoring end-dialog");
            return Ok(());
        };
        let Some(key) = session_key(action, ctx) else {
            warn!(plugin = %ctx.plugin_id, "End-dialog action names no user");
            return Ok(());
        };
        dialogs.finish(&key).await?;
        self.prompt(action, &key).await
    }

    /// Sends the optional text of a dialog action to the dialog's conversation.
    async fn prompt(&self, action: &Action, key: &SessionKey) -> Result<(), BoxError> {
        let Some(text) = action.text.as_deref() else {
            return Ok(());
        };
        let target = action.explicit_target().unwrap_or_else(|| match key.group() {
            Some(group) => Target::group(group),
            None => Target::private(key.user()),
        });
        self.deliver(&target, text).await
    }
}

#[async_trait]
impl ActionHandler for ActionExecutor {
    async fn execute(&self, action: Action, ctx: &ActionContext) {
        let kind = action.kind;
        let result = match kind {
            ActionKind::Reply => self.reply(&action, ctx).await,
            ActionKind::SendMessage => self.send_message(&action, ctx).await,
            ActionKind::CallCapability => self.call_capability(&action, ctx).await,
            ActionKind::StartDialog => self.start_dialog(&action, ctx).await,
            ActionKind::EndDialog => self.end_dialog(&action, ctx).await,
            ActionKind::Unknown => {
                warn!(plugin = %ctx.plugin_id, "Ignoring unknown action type");
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(plugin = %ctx.plugin_id, kind = ?kind, error = %e, "Plugin action failed");
        }
    }
}

/// Builds the event a `call-capability` action runs as.
///
/// Payload `userId` / `groupId` / `text` override the source event; the
/// action's own `text` is used when the payload has none.
fn synthetic_event(action: &Action, payload: &Map<String, Value>, ctx: &ActionContext) -> Event {
    let source = ctx.source.as_deref();
    let user = payload
        .get("userId")
        .and_then(Value::as_str)
        .or(source.map(Event::user_id))
        .unwrap_or(ctx.plugin_id.as_str());
    let text = payload
        .get("text")
        .and_then(Value::as_str)
        .or(action.text.as_deref())
        .unwrap_or_default();
    let platform = source.map_or(SYNTHETIC_PLATFORM, Event::platform);

    let mut event = Event::message(user, text)
        .with_id(new_id())
        .with_platform(platform);
    if let Some(source) = source {
        event = event.with_bot(source.bot_id());
    }
    let group = payload
        .get("groupId")
        .and_then(Value::as_str)
        .or(source.and_then(Event::group_id));
    if let Some(group) = group {
        event = event.in_group(group);
    }
    event
}

fn session_key(action: &Action, ctx: &ActionContext) -> Option<SessionKey> {
    let source = ctx.source.as_deref();
    let user = action
        .payload_str("userId")
        .or(source.map(Event::user_id))?;
    let group = action
        .payload_str("groupId")
        .or(source.and_then(Event::group_id));
    Some(SessionKey::new(user, group))
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(s)) => bronze_framework::shell_split(s),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use bronze_core::{ChannelReplySink, OutboundReply};
    use bronze_framework::{Command, MemoryKvStore, SessionStore, into_handler};
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    use super::*;
    use crate::connection::{ConnectionOptions, IgnoreActions, PluginConnection};
    use crate::protocol::EventMessage;

    struct Harness {
        executor: ActionExecutor,
        replies: mpsc::Receiver<OutboundReply>,
        dialogs: DialogManager,
        connection: PluginConnection,
        plugin_lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
        _plugin_writer: WriteHalf<DuplexStream>,
    }

    fn harness() -> Harness {
        let registry = Arc::new(Registry::new());
        registry
            .register_command(
                Command::new("echo").trigger("/echo"),
                into_handler(|inv: Invocation| async move { Ok(Some(inv.args().join(" "))) }),
            )
            .unwrap();
        registry
            .register_command(
                Command::new("whoami"),
                into_handler(|inv: Invocation| async move {
                    Ok(Some(format!("{}@{}", inv.user_id(), inv.group_id().unwrap_or("-"))))
                }),
            )
            .unwrap();

        let (sink, replies) = ChannelReplySink::new(16);
        let dialogs = DialogManager::new(SessionStore::new(Arc::new(MemoryKvStore::new())));
        let executor = ActionExecutor::new(registry, Arc::new(sink)).with_dialogs(dialogs.clone());

        let (host, plugin) = tokio::io::duplex(16 * 1024);
        let (host_read, host_write) = tokio::io::split(host);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let (connection, _reader) = PluginConnection::start(
            "weather",
            host_read,
            host_write,
            Arc::new(IgnoreActions),
            ConnectionOptions::default(),
        );

        Harness {
            executor,
            replies,
            dialogs,
            connection,
            plugin_lines: BufReader::new(plugin_read).lines(),
            _plugin_writer: plugin_write,
        }
    }

    impl Harness {
        fn ctx(&self, source: Option<Event>) -> ActionContext {
            ActionContext {
                plugin_id: "weather".to_string(),
                source: source.map(Arc::new),
                connection: self.connection.clone(),
            }
        }

        async fn plugin_recv(&mut self) -> EventMessage {
            let line = self.plugin_lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    fn payload(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_reply_defaults_to_source_conversation() {
        let mut h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "/weather").in_group("g1")));

        h.executor.execute(Action::reply("sunny"), &ctx).await;
        h.executor
            .execute(Action::reply("psst").with_target(&Target::private("u1")), &ctx)
            .await;

        let first = h.replies.recv().await.unwrap();
        assert_eq!(first.target, Target::group("g1"));
        assert_eq!(first.text, "sunny");
        assert_eq!(h.replies.recv().await.unwrap().target, Target::private("u1"));
    }

    #[tokio::test]
    async fn test_send_message_requires_explicit_target() {
        let mut h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "x")));

        h.executor
            .execute(Action::new(ActionKind::SendMessage).with_text("lost"), &ctx)
            .await;
        h.executor
            .execute(
                Action::new(ActionKind::SendMessage)
                    .with_text("news")
                    .with_target(&Target::group("42")),
                &ctx,
            )
            .await;

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.text, "news");
        assert_eq!(reply.target, Target::group("42"));
        assert!(h.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_capability_reports_skill_result() {
        let mut h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "/weather").in_group("g1")));

        let action = Action::new(ActionKind::CallCapability)
            .with_correlation_id("k9")
            .with_payload(payload(json!({"capability": "whoami", "userId": "u7"})));
        h.executor.execute(action, &ctx).await;

        let message = h.plugin_recv().await;
        assert_eq!(message.name, "skill_result");
        assert_eq!(message.correlation_id.as_deref(), Some("k9"));
        assert_eq!(message.payload["ok"], true);
        assert_eq!(message.payload["text"], "u7@g1");
        assert!(h.replies.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_call_unknown_capability_reports_error() {
        let mut h = harness();
        let ctx = h.ctx(None);

        let action = Action::new(ActionKind::CallCapability)
            .with_correlation_id("k1")
            .with_payload(payload(json!({"capability": "nope", "userId": "u1"})));
        h.executor.execute(action, &ctx).await;

        let message = h.plugin_recv().await;
        assert_eq!(message.payload["ok"], false);
        assert!(message.payload["error"].as_str().unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_call_capability_by_text_without_correlation_replies() {
        let mut h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "x")));

        let action = Action::new(ActionKind::CallCapability)
            .with_payload(payload(json!({"text": "/echo a \"b c\""})));
        h.executor.execute(action, &ctx).await;

        let reply = h.replies.recv().await.unwrap();
        assert_eq!(reply.text, "a b c");
        assert_eq!(reply.target, Target::private("u1"));
    }

    #[tokio::test]
    async fn test_dialog_actions_manage_sessions() {
        let mut h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "/book").in_group("g1")));
        let key = SessionKey::new("u1", Some("g1"));

        let start = Action::new(ActionKind::StartDialog)
            .with_text("Which city?")
            .with_payload(payload(json!({"action": "book", "step": "city", "data": {"n": 1}})));
        h.executor.execute(start, &ctx).await;

        let session = h.dialogs.current(&key).await.unwrap().unwrap();
        assert_eq!(session.plugin_id, "weather");
        assert_eq!(session.action, "book");
        assert_eq!(session.step.as_deref(), Some("city"));
        assert_eq!(session.data["n"], 1);
        let prompt = h.replies.recv().await.unwrap();
        assert_eq!((prompt.target, prompt.text.as_str()), (Target::group("g1"), "Which city?"));

        h.executor.execute(Action::new(ActionKind::EndDialog), &ctx).await;
        assert!(h.dialogs.current(&key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_dialog_without_action_is_ignored() {
        let h = harness();
        let ctx = h.ctx(Some(Event::message("u1", "x")));

        h.executor.execute(Action::new(ActionKind::StartDialog), &ctx).await;
        let key = SessionKey::new("u1", None);
        assert!(h.dialogs.current(&key).await.unwrap().is_none());
    }

    #[test]
    fn test_string_list_accepts_arrays_and_strings() {
        assert_eq!(string_list(Some(&json!(["a", 1]))), ["a", "1"]);
        assert_eq!(string_list(Some(&json!("x 'y z'"))), ["x", "y z"]);
        assert!(string_list(None).is_empty());
    }
}
