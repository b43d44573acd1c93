//! # Bronze Framework
//!
//! The event-processing core of the Bronze bot host.
//!
//! ## Components
//!
//! - [`Pipeline`]: runs each event through an ordered chain of [`Stage`]s
//!   ending in capability dispatch, then flushes the buffered replies.
//! - [`Registry`]: commands (text triggers or direct by name) and event
//!   listeners.
//! - [`SessionStore`] / [`DialogManager`]: per-conversation state for
//!   multi-turn dialogs and confirmation codes, on top of any
//!   [`KvStore`](bronze_core::KvStore).
//! - [`DialogStage`]: the stage that routes messages into open dialogs.
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bronze_framework::prelude::*;
//!
//! let registry = Arc::new(Registry::new());
//! registry.register_command(
//!     Command::new("ping").trigger("/ping"),
//!     into_handler(|_inv: Invocation| async move { Ok(Some("pong".into())) }),
//! )?;
//!
//! let dialogs = DialogManager::new(SessionStore::new(Arc::new(MemoryKvStore::new())));
//! let pipeline = Pipeline::builder(registry.clone())
//!     .stage(TracingStage)
//!     .stage(DialogStage::new(dialogs, registry))
//!     .build();
//!
//! pipeline.execute(Event::message("u1", "/ping")).await;
//! ```

pub mod context;
pub mod dialog;
pub mod error;
pub mod handler;
pub mod memory;
pub mod pipeline;
pub mod registry;
pub mod session;
pub mod split;
pub mod stages;

pub use context::Context;
pub use dialog::{
    ConfirmationCheck, DEFAULT_CONFIRMATION_TTL, DEFAULT_DIALOG_TTL, DialogManager, DialogStage,
    generate_code,
};
pub use error::{
    BoxError, RegistryError, RegistryResult, SessionError, SessionResult, StageError, StageResult,
};
pub use handler::{
    BoxedHandler, BoxedListener, HandlerResult, Invocation, ListenerResult, into_handler,
    into_listener,
};
pub use memory::MemoryKvStore;
pub use pipeline::{BoxedStage, FnStage, Next, Pipeline, PipelineBuilder, Stage, stage_fn};
pub use registry::{Command, CommandMatch, DEFAULT_APOLOGY, DispatchOutcome, Registry};
pub use session::{DEFAULT_KEY_PREFIX, Session, SessionKey, SessionStore};
pub use split::shell_split;
pub use stages::{BlocklistStage, TracingStage};

/// Prelude for common imports.
pub mod prelude {
    pub use super::context::Context;
    pub use super::dialog::{DialogManager, DialogStage};
    pub use super::error::{StageError, StageResult};
    pub use super::handler::{HandlerResult, Invocation, into_handler, into_listener};
    pub use super::memory::MemoryKvStore;
    pub use super::pipeline::{Next, Pipeline, Stage};
    pub use super::registry::{Command, Registry};
    pub use super::session::{Session, SessionKey, SessionStore};
    pub use super::stages::TracingStage;
    pub use bronze_core::prelude::*;
}
