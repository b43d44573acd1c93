//! The capability registry.
//!
//! Capabilities come in two flavours:
//!
//! - **Commands**: named handlers reached either through one of their text
//!   triggers (`/weather Paris`) or directly by name. A command without
//!   triggers is an *intent*: only reachable by name, typically from a
//!   dialog session or a plugin's `call-capability` action.
//! - **Event listeners**: fire-and-forget callbacks for every event of a
//!   given kind. Their failures are logged and never affect other
//!   listeners or command dispatch.
//!
//! # Matching
//!
//! A message matches a trigger when its trimmed text starts with the
//! trigger, compared case-insensitively. When several triggers match, the
//! longest wins; equal lengths go to the capability registered first. The
//! remainder after the trigger is split shell-style into arguments.
//!
//! Registration is append-only and goes through `&self`, so the registry is
//! shared as an `Arc<Registry>` between the pipeline and plugin adapters.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use bronze_core::EventKind;

use crate::context::Context;
use crate::error::{RegistryError, RegistryResult};
use crate::handler::{BoxedHandler, BoxedListener, HandlerResult, Invocation};
use crate::split::{shell_split, strip_prefix_ignore_case};

/// Apology sent when a handler fails and no template is configured.
pub const DEFAULT_APOLOGY: &str = "Sorry, {name} failed: {error}";

/// Describes a command capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    #[serde(default)]
    pub triggers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Plugin that provides the command, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            triggers: Vec::new(),
            description: None,
            owner: None,
        }
    }

    pub fn trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    pub fn triggers<I, S>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.triggers.extend(triggers.into_iter().map(Into::into));
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    /// Whether the command is only reachable by name.
    pub fn is_intent(&self) -> bool {
        self.triggers.is_empty()
    }
}

/// A successful trigger match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMatch {
    pub command: String,
    pub trigger: String,
    pub args: Vec<String>,
}

/// What happened when an event reached the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchOutcome {
    /// Number of listeners that ran for the event.
    pub listeners: usize,
    /// The command that matched, if any.
    pub command: Option<String>,
    /// Reply text produced by the command (or its apology).
    pub reply: Option<String>,
}

struct CommandEntry {
    command: Command,
    handler: BoxedHandler,
}

struct ListenerEntry {
    kind: EventKind,
    name: String,
    listener: BoxedListener,
}

#[derive(Default)]
struct RegistryInner {
    commands: Vec<CommandEntry>,
    by_name: HashMap<String, usize>,
    /// Lowercased trigger to owning command name.
    triggers: HashMap<String, String>,
    listeners: Vec<ListenerEntry>,
}

/// Holds every command and event listener known to the host.
pub struct Registry {
    inner: RwLock<RegistryInner>,
    apology: String,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_apology(DEFAULT_APOLOGY)
    }

    /// Creates a registry with a custom apology template.
    ///
    /// `{name}` and `{error}` in the template are replaced with the
    /// capability name and the handler's error.
    pub fn with_apology(template: impl Into<String>) -> Self {
        Self {
            inner: RwLock::new(RegistryInner::default()),
            apology: template.into(),
        }
    }

    // ─── Registration ─────────────────────────────────────────────────────────

    /// Registers a command.
    ///
    /// Fails if the name is taken or any trigger already belongs to another
    /// command; in that case nothing is registered.
    pub fn register_command(&self, command: Command, handler: BoxedHandler) -> RegistryResult<()> {
        let mut command = command;
        command.name = command.name.trim().to_string();
        command.triggers = command
            .triggers
            .iter()
            .map(|t| t.trim().to_string())
            .collect();

        if command.name.is_empty() || command.triggers.iter().any(String::is_empty) {
            return Err(RegistryError::Empty(command.name));
        }

        let mut inner = self.inner.write();
        if inner.by_name.contains_key(&command.name) {
            return Err(RegistryError::DuplicateCapability(command.name));
        }

        let mut seen = Vec::with_capacity(command.triggers.len());
        for trigger in &command.triggers {
            let folded = trigger.to_lowercase();
            if let Some(owner) = inner.triggers.get(&folded) {
                return Err(RegistryError::TriggerConflict {
                    trigger: trigger.clone(),
                    owner: owner.clone(),
                });
            }
            if !seen.contains(&folded) {
                seen.push(folded);
            }
        }

        for folded in seen {
            inner.triggers.insert(folded, command.name.clone());
        }
        let index = inner.commands.len();
        inner.by_name.insert(command.name.clone(), index);

        debug!(
            command = %command.name,
            triggers = ?command.triggers,
            owner = command.owner.as_deref().unwrap_or("host"),
            "Registered command"
        );
        inner.commands.push(CommandEntry { command, handler });
        Ok(())
    }

    /// Registers a listener for every event of `kind`.
    pub fn register_event(&self, kind: EventKind, name: impl Into<String>, listener: BoxedListener) {
        let name = name.into();
        debug!(kind = %kind, listener = %name, "Registered event listener");
        self.inner.write().listeners.push(ListenerEntry {
            kind,
            name,
            listener,
        });
    }

    // ─── Introspection ────────────────────────────────────────────────────────

    pub fn contains(&self, name: &str) -> bool {
        self.inner.read().by_name.contains_key(name)
    }

    /// Descriptors of all commands, in registration order.
    pub fn commands(&self) -> Vec<Command> {
        self.inner
            .read()
            .commands
            .iter()
            .map(|entry| entry.command.clone())
            .collect()
    }

    pub fn command_count(&self) -> usize {
        self.inner.read().commands.len()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.read().listeners.len()
    }

    // ─── Matching ─────────────────────────────────────────────────────────────

    /// Finds the command whose trigger best matches `text`.
    pub fn find_command(&self, text: &str) -> Option<CommandMatch> {
        let text = text.trim();
        let inner = self.inner.read();

        let mut best: Option<(usize, &str, &str, &str)> = None;
        for entry in &inner.commands {
            for trigger in &entry.command.triggers {
                let Some(rest) = strip_prefix_ignore_case(text, trigger) else {
                    continue;
                };
                let len = trigger.chars().count();
                if best.is_none_or(|(best_len, ..)| len > best_len) {
                    best = Some((len, entry.command.name.as_str(), trigger.as_str(), rest));
                }
            }
        }

        best.map(|(_, command, trigger, rest)| CommandMatch {
            command: command.to_string(),
            trigger: trigger.to_string(),
            args: shell_split(rest),
        })
    }

    // ─── Dispatch ─────────────────────────────────────────────────────────────

    /// Routes an event through listeners and command matching.
    ///
    /// Returns the reply text of the matched command, if any.
    pub async fn dispatch(&self, ctx: &Context) -> Option<String> {
        self.dispatch_outcome(ctx).await.reply
    }

    /// Like [`dispatch`](Self::dispatch) but reports what ran.
    pub async fn dispatch_outcome(&self, ctx: &Context) -> DispatchOutcome {
        let mut outcome = DispatchOutcome {
            listeners: self.notify_listeners(ctx).await,
            ..Default::default()
        };

        if !ctx.event().is_message() {
            return outcome;
        }

        let Some(found) = self.find_command(ctx.text()) else {
            return outcome;
        };
        let Some(handler) = self.handler(&found.command) else {
            return outcome;
        };

        debug!(command = %found.command, trigger = %found.trigger, "Command matched");
        let invocation = Invocation::from_context(ctx, found.command.as_str())
            .with_trigger(found.trigger)
            .with_args(found.args);
        outcome.reply = self.call(&found.command, handler, invocation).await;
        outcome.command = Some(found.command);
        outcome
    }

    /// Calls a capability by name.
    ///
    /// Handler failures are converted to apology text; only an unknown name
    /// is reported as an error.
    pub async fn invoke(&self, name: &str, invocation: Invocation) -> RegistryResult<Option<String>> {
        let handler = self
            .handler(name)
            .ok_or_else(|| RegistryError::UnknownCapability(name.to_string()))?;
        Ok(self.call(name, handler, invocation).await)
    }

    fn handler(&self, name: &str) -> Option<BoxedHandler> {
        let inner = self.inner.read();
        inner
            .by_name
            .get(name)
            .map(|&index| Arc::clone(&inner.commands[index].handler))
    }

    async fn call(&self, name: &str, handler: BoxedHandler, invocation: Invocation) -> Option<String> {
        let result: Result<HandlerResult, _> =
            AssertUnwindSafe(handler(invocation)).catch_unwind().await;

        match result {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => {
                warn!(capability = %name, error = %e, "Capability failed");
                Some(self.apology(name, &e.to_string()))
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(capability = %name, panic = %message, "Capability panicked");
                Some(self.apology(name, &message))
            }
        }
    }

    async fn notify_listeners(&self, ctx: &Context) -> usize {
        let kind = ctx.event().kind();
        let listeners: Vec<(String, BoxedListener)> = self
            .inner
            .read()
            .listeners
            .iter()
            .filter(|entry| entry.kind == kind)
            .map(|entry| (entry.name.clone(), Arc::clone(&entry.listener)))
            .collect();

        for (name, listener) in &listeners {
            let invocation = Invocation::from_context(ctx, name.as_str());
            match AssertUnwindSafe(listener(invocation)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(listener = %name, error = %e, "Event listener failed"),
                Err(panic) => error!(
                    listener = %name,
                    panic = %panic_message(panic.as_ref()),
                    "Event listener panicked"
                ),
            }
        }

        listeners.len()
    }

    fn apology(&self, name: &str, error: &str) -> String {
        self.apology
            .replace("{name}", name)
            .replace("{error}", error)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Registry")
            .field("commands", &inner.commands.len())
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}

/// Extracts a readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
