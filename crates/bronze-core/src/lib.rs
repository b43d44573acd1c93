//! # Bronze Core
//!
//! The data model and collaborator interfaces shared by every Bronze crate.
//!
//! ## Contents
//!
//! - **Events**: the immutable, already-normalized input record ([`Event`],
//!   [`EventKind`]) and the conversation it came from ([`Target`]).
//! - **Entities**: user/group/bot records resolved for an event
//!   ([`Entities`], [`EntityResolver`]).
//! - **Replies**: outbound text delivery ([`ReplySink`]).
//! - **Key/value storage**: the TTL store sessions live in ([`KvStore`]).
//!
//! Everything that touches a real backend (the entity cache, the messaging
//! gateway, a networked key/value store) sits behind one of these traits so
//! the host core never depends on a concrete platform.
//!
//! ```text
//! ┌──────────┐   Event    ┌──────────┐   text    ┌───────────┐
//! │ Gateway  │──────────▶│   Host   │─────────▶│ ReplySink │
//! └──────────┘            └────┬─────┘           └───────────┘
//!                              │ get/set/delete
//!                         ┌────▼─────┐
//!                         │ KvStore  │
//!                         └──────────┘
//! ```

pub mod entity;
pub mod error;
pub mod event;
pub mod reply;
pub mod store;

pub use entity::{BotIdentity, Entities, EntityResolver, Group, PassthroughResolver, User};
pub use error::{
    ReplyError, ReplyResult, ResolveError, ResolveResult, StoreError, StoreResult,
};
pub use event::{Event, EventKind, Target, TargetKind};
pub use reply::{ChannelReplySink, LogReplySink, OutboundReply, ReplySink};
pub use store::KvStore;

/// Prelude for common imports.
pub mod prelude {
    pub use super::entity::{Entities, EntityResolver};
    pub use super::event::{Event, EventKind, Target, TargetKind};
    pub use super::reply::ReplySink;
    pub use super::store::KvStore;
}
