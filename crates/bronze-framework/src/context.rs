//! Per-event working state.
//!
//! A [`Context`] is created by the [`Pipeline`](crate::Pipeline) for each
//! incoming event once its entities have been resolved. It is owned by that
//! event's task and handed down the stage chain by `&mut`, so stages can
//! enrich entities, buffer replies and stash typed state for later stages
//! without any locking.
//!
//! Buffered output is only flushed to the reply sink after the whole chain
//! has completed without error.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use bronze_core::{Entities, Event, Target};

/// Mutable per-event state passed through the pipeline.
pub struct Context {
    event: Arc<Event>,
    entities: Arc<Entities>,
    output: Vec<String>,
    handled: bool,
    state: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl Context {
    /// Creates a context for `event` with the entities resolved for it.
    pub fn new(event: Arc<Event>, entities: Entities) -> Self {
        Self {
            event,
            entities: Arc::new(entities),
            output: Vec::new(),
            handled: false,
            state: HashMap::new(),
        }
    }

    /// Creates a context with bare entities taken from the event ids.
    pub fn from_event(event: Event) -> Self {
        let entities = Entities::from_event(&event);
        Self::new(Arc::new(event), entities)
    }

    // ─── Event and entities ───────────────────────────────────────────────────

    pub fn event(&self) -> &Event {
        &self.event
    }

    /// Returns a clone of the event `Arc`.
    pub fn event_arc(&self) -> Arc<Event> {
        Arc::clone(&self.event)
    }

    pub fn entities(&self) -> &Entities {
        &self.entities
    }

    /// Returns a clone of the entities `Arc`.
    pub fn entities_arc(&self) -> Arc<Entities> {
        Arc::clone(&self.entities)
    }

    /// Mutable access to the resolved entities.
    ///
    /// Clones on write if an [`Invocation`](crate::Invocation) still holds
    /// a snapshot.
    pub fn entities_mut(&mut self) -> &mut Entities {
        Arc::make_mut(&mut self.entities)
    }

    /// Shorthand for the event text.
    pub fn text(&self) -> &str {
        self.event.text()
    }

    /// The conversation buffered replies will be delivered to.
    pub fn origin(&self) -> Target {
        self.event.origin()
    }

    // ─── Output buffer ────────────────────────────────────────────────────────

    /// Appends a reply to the output buffer. Empty text is ignored.
    pub fn push_reply(&mut self, text: impl Into<String>) {
        let text = text.into();
        if !text.is_empty() {
            self.output.push(text);
        }
    }

    pub fn output(&self) -> &[String] {
        &self.output
    }

    /// Mutable access to the buffer, for stages that post-process replies.
    pub fn output_mut(&mut self) -> &mut Vec<String> {
        &mut self.output
    }

    /// Drains the output buffer.
    pub fn take_output(&mut self) -> Vec<String> {
        std::mem::take(&mut self.output)
    }

    // ─── Handled flag ─────────────────────────────────────────────────────────

    /// Marks the event as handled by some capability or stage.
    pub fn mark_handled(&mut self) {
        self.handled = true;
    }

    pub fn is_handled(&self) -> bool {
        self.handled
    }

    // ─── Typed state ──────────────────────────────────────────────────────────

    /// Stores a value for later stages. One value per type; later calls overwrite.
    pub fn set_state<T: Send + Sync + 'static>(&mut self, value: T) {
        self.state.insert(TypeId::of::<T>(), Box::new(value));
    }

    pub fn get_state<T: 'static>(&self) -> Option<&T> {
        self.state
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
    }

    pub fn has_state<T: 'static>(&self) -> bool {
        self.state.contains_key(&TypeId::of::<T>())
    }

    /// Removes and returns a stored value.
    pub fn take_state<T: 'static>(&mut self) -> Option<T> {
        self.state
            .remove(&TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("event", &self.event)
            .field("output", &self.output)
            .field("handled", &self.handled)
            .finish_non_exhaustive()
    }
}
