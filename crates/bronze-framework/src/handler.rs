//! Capability handlers and the invocation they receive.
//!
//! A handler is any async function taking an [`Invocation`] and returning a
//! [`HandlerResult`]. Returning `Ok(Some(text))` produces a reply;
//! `Ok(None)` means the capability did its work without replying (a plugin
//! that answers through its own actions, for instance). An `Err` is turned
//! into apology text by the [`Registry`](crate::Registry).
//!
//! ```rust,ignore
//! async fn ping(_inv: Invocation) -> HandlerResult {
//!     Ok(Some("pong".into()))
//! }
//!
//! registry.register_command(Command::new("ping").trigger("/ping"), ping)?;
//! ```

use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use bronze_core::{Entities, Event};

use crate::context::Context;
use crate::error::BoxError;
use crate::session::Session;

/// Return type of a capability handler.
pub type HandlerResult = Result<Option<String>, BoxError>;

/// Return type of an event listener.
pub type ListenerResult = Result<(), BoxError>;

/// A type-erased capability handler.
pub type BoxedHandler = Arc<dyn Fn(Invocation) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// A type-erased event listener.
pub type BoxedListener =
    Arc<dyn Fn(Invocation) -> BoxFuture<'static, ListenerResult> + Send + Sync>;

/// Converts an async function into a [`BoxedHandler`].
pub fn into_handler<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(move |inv| Box::pin(f(inv)))
}

/// Converts an async function into a [`BoxedListener`].
pub fn into_listener<F, Fut>(f: F) -> BoxedListener
where
    F: Fn(Invocation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ListenerResult> + Send + 'static,
{
    Arc::new(move |inv| Box::pin(f(inv)))
}

/// An owned snapshot of everything a capability needs to run.
///
/// Handlers get an `Invocation` rather than the live [`Context`] so their
/// futures are `'static` and can be forwarded to other tasks (or processes).
#[derive(Debug, Clone)]
pub struct Invocation {
    event: Arc<Event>,
    entities: Arc<Entities>,
    capability: String,
    trigger: Option<String>,
    args: Vec<String>,
    session: Option<Session>,
    confirmed: bool,
}

impl Invocation {
    pub fn new(event: Arc<Event>, entities: Arc<Entities>, capability: impl Into<String>) -> Self {
        Self {
            event,
            entities,
            capability: capability.into(),
            trigger: None,
            args: Vec::new(),
            session: None,
            confirmed: false,
        }
    }

    /// Snapshots `ctx` for a call to `capability`.
    pub fn from_context(ctx: &Context, capability: impl Into<String>) -> Self {
        Self::new(ctx.event_arc(), ctx.entities_arc(), capability)
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Attaches the dialog session the call continues.
    pub fn with_session(mut self, session: Session) -> Self {
        self.session = Some(session);
        self
    }

    /// Marks the call as the confirmed execution of a guarded action.
    pub fn confirmed(mut self, confirmed: bool) -> Self {
        self.confirmed = confirmed;
        self
    }

    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn event_arc(&self) -> Arc<Event> {
        Arc::clone(&self.event)
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    /// Name of the capability being invoked.
    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// The trigger that matched, if the call came from command matching.
    pub fn trigger(&self) -> Option<&str> {
        self.trigger.as_deref()
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).map(String::as_str)
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmed
    }

    pub fn text(&self) -> &str {
        self.event.text()
    }

    pub fn user_id(&self) -> &str {
        self.event.user_id()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.event.group_id()
    }
}
