//! Per-conversation session records.
//!
//! A [`Session`] remembers that a user is in the middle of a multi-turn
//! dialog (or owes the bot a confirmation code) so the next free-form
//! message can be routed back to the capability that asked. At most one
//! session exists per user/group pair; sessions live in the shared
//! [`KvStore`] under the key `{prefix}:{user}:{group}` and expire with it.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use bronze_core::KvStore;

use crate::error::SessionResult;

/// Key prefix used when none is configured.
pub const DEFAULT_KEY_PREFIX: &str = "session";

/// Group placeholder for private conversations.
const NO_GROUP: &str = "-";

/// Conversational state for one user/group pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Plugin that owns the dialog.
    pub plugin_id: String,
    /// Capability the next message is routed to.
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    /// What the dialog expects next (free text, a number, ...). Informational.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waiting_for: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Present only while a confirmation is pending.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmation_code: Option<String>,
}

impl Session {
    pub fn new(plugin_id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            action: action.into(),
            step: None,
            waiting_for: None,
            data: Map::new(),
            confirmation_code: None,
        }
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = data;
        self
    }

    /// Whether this session is waiting for a confirmation code.
    pub fn is_confirmation(&self) -> bool {
        self.confirmation_code.is_some()
    }
}

/// Identifies the conversation a session belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    user: String,
    group: Option<String>,
}

impl SessionKey {
    pub fn new(user: impl Into<String>, group: Option<&str>) -> Self {
        Self {
            user: user.into(),
            group: group.map(str::to_string),
        }
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    /// Renders the storage key under `prefix`.
    pub fn render(&self, prefix: &str) -> String {
        format!(
            "{prefix}:{}:{}",
            self.user,
            self.group.as_deref().unwrap_or(NO_GROUP)
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.group {
            Some(group) => write!(f, "user {} in group {group}", self.user),
            None => write!(f, "user {} (private)", self.user),
        }
    }
}

/// Typed access to sessions on top of a [`KvStore`].
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn KvStore>,
    prefix: String,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KvStore>) -> Self {
        Self::with_prefix(store, DEFAULT_KEY_PREFIX)
    }

    pub fn with_prefix(store: Arc<dyn KvStore>, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Loads the live session for `key`.
    ///
    /// A record that no longer decodes is deleted and reported as absent,
    /// so one bad write cannot wedge a conversation.
    pub async fn get(&self, key: &SessionKey) -> SessionResult<Option<Session>> {
        let storage_key = key.render(&self.prefix);
        let Some(raw) = self.store.get(&storage_key).await? else {
            return Ok(None);
        };

        match serde_json::from_str(&raw) {
            Ok(session) => Ok(Some(session)),
            Err(e) => {
                warn!(key = %storage_key, error = %e, "Discarding undecodable session");
                self.store.delete(&storage_key).await?;
                Ok(None)
            }
        }
    }

    /// Stores `session`, replacing any existing one and restarting its TTL.
    pub async fn put(&self, key: &SessionKey, session: &Session, ttl: Duration) -> SessionResult<()> {
        let storage_key = key.render(&self.prefix);
        let raw = serde_json::to_string(session).map_err(bronze_core::StoreError::from)?;
        self.store.set(&storage_key, raw, ttl).await?;
        debug!(key = %storage_key, action = %session.action, "Session stored");
        Ok(())
    }

    /// Removes the session for `key`. Returns whether one existed.
    pub async fn clear(&self, key: &SessionKey) -> SessionResult<bool> {
        Ok(self.store.delete(&key.render(&self.prefix)).await?)
    }
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKvStore;

    fn store() -> (SessionStore, MemoryKvStore) {
        let kv = MemoryKvStore::new();
        (SessionStore::new(Arc::new(kv.clone())), kv)
    }

    #[test]
    fn test_key_render() {
        assert_eq!(
            SessionKey::new("u1", Some("g1")).render("session"),
            "session:u1:g1"
        );
        assert_eq!(SessionKey::new("u1", None).render("bot"), "bot:u1:-");
    }

    #[test]
    fn test_session_wire_format() {
        let session = Session::new("demo", "Feedback").with_step("WaitContent");
        let json = serde_json::to_value(&session).unwrap();

        assert_eq!(json["pluginId"], "demo");
        assert_eq!(json["action"], "Feedback");
        assert_eq!(json["step"], "WaitContent");
        assert!(json.get("confirmationCode").is_none());
    }

    #[tokio::test]
    async fn test_put_get_clear() {
        let (sessions, _) = store();
        let key = SessionKey::new("u1", Some("g1"));
        let session = Session::new("demo", "Feedback").with_step("WaitContent");

        sessions.put(&key, &session, Duration::from_secs(60)).await.unwrap();
        assert_eq!(sessions.get(&key).await.unwrap(), Some(session));

        // Other conversations are independent.
        assert!(sessions.get(&SessionKey::new("u1", None)).await.unwrap().is_none());

        assert!(sessions.clear(&key).await.unwrap());
        assert!(sessions.get(&key).await.unwrap().is_none());
        assert!(!sessions.clear(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_session_is_discarded() {
        let (sessions, kv) = store();
        let key = SessionKey::new("u1", None);
        kv.set(&key.render("session"), "{not json".into(), Duration::from_secs(60))
            .await
            .unwrap();

        assert!(sessions.get(&key).await.unwrap().is_none());
        assert!(kv.get("session:u1:-").await.unwrap().is_none());
    }
}
