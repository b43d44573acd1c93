//! Resolved entities attached to an event.
//!
//! The entity/cache service turns the bare ids of an [`Event`] into richer
//! records. The host only needs ids and an open attribute bag; whatever the
//! service knows beyond that (points, permissions, nicknames) rides along in
//! `attributes` for capability handlers to read.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ResolveResult;
use crate::event::Event;

/// A user record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// A group record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub attributes: Map<String, Value>,
}

/// The bot account an event arrived on.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BotIdentity {
    pub id: String,
    pub platform: String,
}

/// Everything the entity service resolved for one event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entities {
    pub user: User,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<Group>,
    pub bot: BotIdentity,
}

impl Entities {
    /// Builds bare entities (ids only) straight from the event.
    pub fn from_event(event: &Event) -> Self {
        Self {
            user: User {
                id: event.user_id().to_string(),
                ..Default::default()
            },
            group: event.group_id().map(|id| Group {
                id: id.to_string(),
                ..Default::default()
            }),
            bot: BotIdentity {
                id: event.bot_id().to_string(),
                platform: event.platform().to_string(),
            },
        }
    }
}

/// The entity/cache service consumed by the host.
///
/// Implementations typically hit a database or cache; they are called once
/// per event, before any pipeline stage runs.
#[async_trait]
pub trait EntityResolver: Send + Sync {
    /// Resolves the user, group and bot referenced by `event`.
    async fn resolve(&self, event: &Event) -> ResolveResult<Entities>;
}

/// Resolver that performs no lookups and returns ids only.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassthroughResolver;

#[async_trait]
impl EntityResolver for PassthroughResolver {
    async fn resolve(&self, event: &Event) -> ResolveResult<Entities> {
        Ok(Entities::from_event(event))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_passthrough_resolver() {
        let event = Event::message("u1", "hi")
            .in_group("g1")
            .with_bot("b1")
            .with_platform("qq");

        let entities = PassthroughResolver.resolve(&event).await.unwrap();
        assert_eq!(entities.user.id, "u1");
        assert_eq!(entities.group.as_ref().map(|g| g.id.as_str()), Some("g1"));
        assert_eq!(entities.bot.id, "b1");
        assert_eq!(entities.bot.platform, "qq");
    }

    #[test]
    fn test_private_event_has_no_group() {
        let entities = Entities::from_event(&Event::message("u2", "hey"));
        assert!(entities.group.is_none());
    }
}
