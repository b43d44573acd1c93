//! Multi-turn dialogs and confirmation codes.
//!
//! Capabilities use the [`DialogManager`] to park a conversation:
//!
//! - **Dialogs** route the user's next message back to a named capability
//!   (`action`), carrying a `step` and free-form `data` between turns.
//! - **Confirmations** guard a sensitive action behind a random three-digit
//!   code. Replying with exactly that code runs the action with
//!   [`Invocation::is_confirmed`](crate::Invocation::is_confirmed) set;
//!   anything else leaves the confirmation pending until it expires.
//!
//! The [`DialogStage`] is the pipeline half of this: it intercepts messages
//! from users with a live session before command matching runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::context::Context;
use crate::error::{RegistryError, SessionError, SessionResult, StageResult};
use crate::handler::Invocation;
use crate::pipeline::{Next, Stage};
use crate::registry::Registry;
use crate::session::{Session, SessionKey, SessionStore};
use crate::split::shell_split;

/// Default lifetime of a dialog session.
pub const DEFAULT_DIALOG_TTL: Duration = Duration::from_secs(300);

/// Default lifetime of a pending confirmation.
pub const DEFAULT_CONFIRMATION_TTL: Duration = Duration::from_secs(120);

/// Result of checking a reply against a pending confirmation.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfirmationCheck {
    /// The code matched. The session has been cleared and is returned for
    /// the caller to run its action.
    Confirmed(Session),
    /// A confirmation is pending but the reply did not match. It stays pending.
    Mismatch(Session),
    /// No confirmation is pending for this conversation.
    NotPending,
}

/// Generates a zero-padded three-digit confirmation code.
pub fn generate_code() -> String {
    format!("{:03}", rand::thread_rng().gen_range(0..1000))
}

/// Starts, advances and ends dialog sessions.
#[derive(Debug, Clone)]
pub struct DialogManager {
    sessions: SessionStore,
    dialog_ttl: Duration,
    confirmation_ttl: Duration,
}

impl DialogManager {
    pub fn new(sessions: SessionStore) -> Self {
        Self {
            sessions,
            dialog_ttl: DEFAULT_DIALOG_TTL,
            confirmation_ttl: DEFAULT_CONFIRMATION_TTL,
        }
    }

    pub fn with_dialog_ttl(mut self, ttl: Duration) -> Self {
        self.dialog_ttl = ttl;
        self
    }

    pub fn with_confirmation_ttl(mut self, ttl: Duration) -> Self {
        self.confirmation_ttl = ttl;
        self
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// Routes the next message from `key` to `action`, replacing any
    /// session already open for it.
    pub async fn start_dialog(
        &self,
        key: &SessionKey,
        plugin_id: &str,
        action: &str,
        step: &str,
    ) -> SessionResult<Session> {
        self.start_dialog_with_data(key, plugin_id, action, step, Map::new())
            .await
    }

    pub async fn start_dialog_with_data(
        &self,
        key: &SessionKey,
        plugin_id: &str,
        action: &str,
        step: &str,
        data: Map<String, Value>,
    ) -> SessionResult<Session> {
        let session = Session::new(plugin_id, action)
            .with_step(step)
            .with_data(data);
        self.sessions.put(key, &session, self.dialog_ttl).await?;
        debug!(%key, plugin = plugin_id, action, step, "Dialog started");
        Ok(session)
    }

    /// Moves the open dialog to `step`, restarting its TTL.
    pub async fn advance(&self, key: &SessionKey, step: &str) -> SessionResult<Session> {
        let mut session = self.require(key).await?;
        session.step = Some(step.to_string());
        self.sessions.put(key, &session, self.dialog_ttl).await?;
        Ok(session)
    }

    /// Merges `data` into the open dialog, restarting its TTL.
    pub async fn set_data(&self, key: &SessionKey, data: Map<String, Value>) -> SessionResult<Session> {
        let mut session = self.require(key).await?;
        session.data.extend(data);
        self.sessions.put(key, &session, self.dialog_ttl).await?;
        Ok(session)
    }

    pub async fn current(&self, key: &SessionKey) -> SessionResult<Option<Session>> {
        self.sessions.get(key).await
    }

    /// Ends whatever session is open for `key`. Returns whether one was.
    pub async fn finish(&self, key: &SessionKey) -> SessionResult<bool> {
        let removed = self.sessions.clear(key).await?;
        if removed {
            debug!(%key, "Session finished");
        }
        Ok(removed)
    }

    /// Parks `action` behind a fresh confirmation code and returns the code.
    pub async fn start_confirmation(
        &self,
        key: &SessionKey,
        plugin_id: &str,
        action: &str,
    ) -> SessionResult<String> {
        self.start_confirmation_with_data(key, plugin_id, action, Map::new())
            .await
    }

    pub async fn start_confirmation_with_data(
        &self,
        key: &SessionKey,
        plugin_id: &str,
        action: &str,
        data: Map<String, Value>,
    ) -> SessionResult<String> {
        let code = generate_code();
        let mut session = Session::new(plugin_id, action).with_data(data);
        session.confirmation_code = Some(code.clone());
        self.sessions.put(key, &session, self.confirmation_ttl).await?;
        debug!(%key, plugin = plugin_id, action, "Confirmation pending");
        Ok(code)
    }

    /// Compares `reply` (trimmed) against the pending code for `key`.
    pub async fn check_confirmation(&self, key: &SessionKey, reply: &str) -> SessionResult<ConfirmationCheck> {
        let Some(session) = self.sessions.get(key).await? else {
            return Ok(ConfirmationCheck::NotPending);
        };

        match session.confirmation_code.as_deref() {
            None => Ok(ConfirmationCheck::NotPending),
            Some(code) if code == reply.trim() => {
                self.sessions.clear(key).await?;
                debug!(%key, action = %session.action, "Confirmation accepted");
                Ok(ConfirmationCheck::Confirmed(session))
            }
            Some(_) => Ok(ConfirmationCheck::Mismatch(session)),
        }
    }

    async fn require(&self, key: &SessionKey) -> SessionResult<Session> {
        self.sessions
            .get(key)
            .await?
            .ok_or_else(|| SessionError::NotFound(key.to_string()))
    }
}

/// Pipeline stage that routes messages into open dialogs.
///
/// - A pending confirmation answered with the right code runs the guarded
///   action (confirmed) and stops the chain. A wrong answer falls through to
///   normal processing and the confirmation stays pending.
/// - An open dialog sends the message to its action and stops the chain.
/// - A session naming an unknown capability is cleared and ignored.
#[derive(Debug, Clone)]
pub struct DialogStage {
    dialogs: DialogManager,
    registry: Arc<Registry>,
}

impl DialogStage {
    pub fn new(dialogs: DialogManager, registry: Arc<Registry>) -> Self {
        Self { dialogs, registry }
    }

    async fn run_action(&self, ctx: &mut Context, key: &SessionKey, invocation: Invocation) -> Option<bool> {
        let action = invocation.capability().to_string();
        match self.registry.invoke(&action, invocation).await {
            Ok(reply) => {
                if let Some(reply) = reply {
                    ctx.push_reply(reply);
                }
                ctx.mark_handled();
                Some(true)
            }
            Err(RegistryError::UnknownCapability(_)) => {
                warn!(%key, action = %action, "Session names an unknown capability, clearing it");
                if let Err(e) = self.dialogs.finish(key).await {
                    warn!(%key, error = %e, "Failed to clear stale session");
                }
                None
            }
            Err(e) => {
                warn!(%key, error = %e, "Dialog action failed");
                None
            }
        }
    }
}

#[async_trait]
impl Stage for DialogStage {
    fn name(&self) -> &str {
        "dialog"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
        if !ctx.event().is_message() {
            return next.run(ctx).await;
        }

        let key = SessionKey::new(ctx.event().user_id(), ctx.event().group_id());
        let Some(session) = self.dialogs.current(&key).await? else {
            return next.run(ctx).await;
        };

        if session.is_confirmation() {
            return match self.dialogs.check_confirmation(&key, ctx.text()).await? {
                ConfirmationCheck::Confirmed(session) => {
                    let invocation = Invocation::from_context(ctx, session.action.as_str())
                        .with_session(session)
                        .confirmed(true);
                    match self.run_action(ctx, &key, invocation).await {
                        Some(_) => Ok(()),
                        None => next.run(ctx).await,
                    }
                }
                ConfirmationCheck::Mismatch(_) | ConfirmationCheck::NotPending => {
                    next.run(ctx).await
                }
            };
        }

        debug!(%key, action = %session.action, step = ?session.step, "Continuing dialog");
        let invocation = Invocation::from_context(ctx, session.action.as_str())
            .with_args(shell_split(ctx.text()))
            .with_session(session);
        match self.run_action(ctx, &key, invocation).await {
            Some(_) => Ok(()),
            None => next.run(ctx).await,
        }
    }
}
