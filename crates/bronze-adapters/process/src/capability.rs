//! Exposes a plugin's commands and event subscriptions through the registry.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tracing::debug;

use bronze_core::{Event, EventKind};
use bronze_framework::{
    BoxError, BoxedHandler, BoxedListener, Command, Invocation, Registry, RegistryResult, into_handler,
    into_listener,
};

use crate::connection::PluginConnection;
use crate::error::PluginResult;
use crate::process::PluginProcess;
use crate::protocol::{ResponseMessage, names};

/// Something that carries messages to one plugin.
#[async_trait]
pub trait PluginChannel: Send + Sync + 'static {
    fn plugin_id(&self) -> &str;

    async fn request(
        &self,
        source: Option<Arc<Event>>,
        name: &str,
        payload: Map<String, Value>,
    ) -> PluginResult<ResponseMessage>;

    async fn notify(&self, name: &str, payload: Map<String, Value>) -> PluginResult<()>;
}

#[async_trait]
impl PluginChannel for PluginConnection {
    fn plugin_id(&self) -> &str {
        PluginConnection::plugin_id(self)
    }

    async fn request(
        &self,
        source: Option<Arc<Event>>,
        name: &str,
        payload: Map<String, Value>,
    ) -> PluginResult<ResponseMessage> {
        self.send_request_from(source, name, payload).await
    }

    async fn notify(&self, name: &str, payload: Map<String, Value>) -> PluginResult<()> {
        self.send_event(name, payload, None).await
    }
}

#[async_trait]
impl PluginChannel for PluginProcess {
    fn plugin_id(&self) -> &str {
        self.id()
    }

    async fn request(
        &self,
        source: Option<Arc<Event>>,
        name: &str,
        payload: Map<String, Value>,
    ) -> PluginResult<ResponseMessage> {
        self.send_request_from(source, name, payload).await
    }

    async fn notify(&self, name: &str, payload: Map<String, Value>) -> PluginResult<()> {
        self.send_event(name, payload).await
    }
}

/// Registers `commands` as capabilities served by `plugin` and subscribes it
/// to `events`.
///
/// Each command is owned by the plugin. Registration stops at the first
/// rejected command; the ones before it stay registered. Returns how many
/// commands were registered.
pub fn register_plugin<C, I, E>(registry: &Registry, plugin: C, commands: I, events: E) -> RegistryResult<usize>
where
    C: PluginChannel + Clone,
    I: IntoIterator<Item = Command>,
    E: IntoIterator<Item = EventKind>,
{
    let mut registered = 0;
    for command in commands {
        let command = command.owner(plugin.plugin_id());
        registry.register_command(command, command_handler(plugin.clone()))?;
        registered += 1;
    }
    for kind in events {
        let name = format!("{}:{kind}", plugin.plugin_id());
        registry.register_event(kind, name, event_listener(plugin.clone()));
    }
    Ok(registered)
}

/// Forwards a matched command to the plugin as a `command` request.
///
/// The plugin answers through actions, so the handler itself returns no
/// text. A timeout or an `ok: false` response becomes the registry's apology.
pub fn command_handler<C: PluginChannel + Clone>(plugin: C) -> BoxedHandler {
    into_handler(move |inv: Invocation| {
        let plugin = plugin.clone();
        async move {
            let payload = command_payload(&inv)?;
            let response = plugin
                .request(Some(inv.event_arc()), names::COMMAND, payload)
                .await?
                .into_result()?;
            debug!(
                plugin = %plugin.plugin_id(),
                capability = %inv.capability(),
                actions = response.actions.len(),
                "Plugin handled command"
            );
            Ok(None)
        }
    })
}

/// Forwards every event it sees to the plugin as an `event` message.
pub fn event_listener<C: PluginChannel + Clone>(plugin: C) -> BoxedListener {
    into_listener(move |inv: Invocation| {
        let plugin = plugin.clone();
        async move {
            let mut payload = Map::new();
            payload.insert("event".into(), serde_json::to_value(inv.event())?);
            payload.insert("entities".into(), serde_json::to_value(inv.entities())?);
            plugin.notify(names::EVENT, payload).await?;
            Ok(())
        }
    })
}

fn command_payload(inv: &Invocation) -> Result<Map<String, Value>, BoxError> {
    let mut payload = Map::new();
    payload.insert("capability".into(), json!(inv.capability()));
    payload.insert("trigger".into(), json!(inv.trigger()));
    payload.insert("args".into(), json!(inv.args()));
    payload.insert("event".into(), serde_json::to_value(inv.event())?);
    payload.insert("entities".into(), serde_json::to_value(inv.entities())?);
    payload.insert("session".into(), serde_json::to_value(inv.session())?);
    payload.insert("confirmed".into(), json!(inv.is_confirmed()));
    Ok(payload)
}
