//! Event model for the Bronze host.
//!
//! An [`Event`] is produced by the upstream gateway after it has already
//! normalized the platform's wire format. The host never mutates an event
//! once it has been wrapped in an `Arc` and handed to the pipeline; all
//! per-event working state lives in the framework's `Context` instead.
//!
//! Events travel as camelCase JSON:
//!
//! ```json
//! {"id":"e1","type":"message","platform":"qq","botId":"b1",
//!  "userId":"u1","groupId":"g1","text":"/help","payload":{}}
//! ```

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ============================================================================
// Event Kind
// ============================================================================

/// Classification of inbound events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// Private or group chat messages.
    Message,
    /// Notices (member joined, message recalled, ...).
    Notice,
    /// Requests (friend request, group invitation, ...).
    Request,
}

impl EventKind {
    /// Returns the lowercase wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Notice => "notice",
            Self::Request => "request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "message" => Ok(Self::Message),
            "notice" => Ok(Self::Notice),
            "request" => Ok(Self::Request),
            other => Err(format!("unknown event type '{other}'")),
        }
    }
}

// ============================================================================
// Target
// ============================================================================

/// Whether a conversation is a private chat or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    /// One-to-one conversation with a user.
    Private,
    /// Group conversation.
    Group,
}

impl TargetKind {
    /// Returns the wire name of this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Private => "private",
            Self::Group => "group",
        }
    }
}

impl FromStr for TargetKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" | "user" | "friend" => Ok(Self::Private),
            "group" => Ok(Self::Group),
            other => Err(format!("unknown target kind '{other}'")),
        }
    }
}

/// A conversation that outbound text can be delivered to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Target {
    /// Private chat or group.
    pub kind: TargetKind,
    /// User id for private chats, group id for groups.
    pub id: String,
}

impl Target {
    /// A private conversation with `user_id`.
    pub fn private(user_id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Private,
            id: user_id.into(),
        }
    }

    /// A group conversation.
    pub fn group(group_id: impl Into<String>) -> Self {
        Self {
            kind: TargetKind::Group,
            id: group_id.into(),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            TargetKind::Private => write!(f, "private:{}", self.id),
            TargetKind::Group => write!(f, "group:{}", self.id),
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable, normalized inbound event.
///
/// Construct with [`Event::new`] / [`Event::message`] and the `with_*`
/// builder methods, then share it as `Arc<Event>`.
///
/// ```rust
/// use bronze_core::{Event, EventKind};
///
/// let event = Event::message("u1", "/help")
///     .with_id("e1")
///     .in_group("g1");
///
/// assert_eq!(event.kind(), EventKind::Message);
/// assert_eq!(event.group_id(), Some("g1"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    id: String,
    #[serde(rename = "type")]
    kind: EventKind,
    #[serde(default = "default_platform")]
    platform: String,
    #[serde(default)]
    bot_id: String,
    user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    payload: Map<String, Value>,
}

fn default_platform() -> String {
    "unknown".to_string()
}

impl Event {
    /// Creates an event of the given kind from `user_id`.
    pub fn new(kind: EventKind, user_id: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            kind,
            platform: default_platform(),
            bot_id: String::new(),
            user_id: user_id.into(),
            group_id: None,
            text: String::new(),
            payload: Map::new(),
        }
    }

    /// Creates a message event carrying `text`.
    pub fn message(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(EventKind::Message, user_id).with_text(text)
    }

    /// Sets the event id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Sets the platform name.
    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = platform.into();
        self
    }

    /// Sets the id of the bot account that received the event.
    pub fn with_bot(mut self, bot_id: impl Into<String>) -> Self {
        self.bot_id = bot_id.into();
        self
    }

    /// Marks the event as coming from a group.
    pub fn in_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    /// Sets the raw text.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = text.into();
        self
    }

    /// Inserts one payload entry.
    pub fn with_payload(mut self, key: impl Into<String>, value: Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn bot_id(&self) -> &str {
        &self.bot_id
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref()
    }

    /// The raw message text (empty for non-message events).
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    /// Returns `true` for message events.
    pub fn is_message(&self) -> bool {
        self.kind == EventKind::Message
    }

    /// The conversation a reply to this event should go to.
    ///
    /// Group events answer in the group; everything else answers privately.
    pub fn origin(&self) -> Target {
        match &self.group_id {
            Some(group) => Target::group(group.clone()),
            None => Target::private(self.user_id.clone()),
        }
    }
}
