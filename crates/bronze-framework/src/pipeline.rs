//! The event pipeline.
//!
//! Every event flows through an ordered chain of [`Stage`]s that ends in
//! capability dispatch:
//!
//! ```text
//! resolve entities ─▶ stage 1 ─▶ stage 2 ─▶ … ─▶ Registry::dispatch
//!                        ◀──────────◀────────◀──────────┘
//!                 (stages resume here: post-processing)
//! ```
//!
//! A stage receives the [`Context`] and a [`Next`] continuation. Calling
//! `next.run(ctx).await` passes control down the chain; code after that call
//! runs on the way back out. A stage that returns without calling it
//! short-circuits everything after it, including dispatch.
//!
//! If any stage returns an error (or panics) the event is abandoned: no
//! buffered output is sent and the event counts as unhandled. Other events
//! are unaffected.
//!
//! # Example
//!
//! ```rust,ignore
//! struct Greeter;
//!
//! #[async_trait]
//! impl Stage for Greeter {
//!     async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
//!         next.run(ctx).await?;
//!         if !ctx.is_handled() && ctx.text() == "hi" {
//!             ctx.push_reply("hello!");
//!             ctx.mark_handled();
//!         }
//!         Ok(())
//!     }
//! }
//!
//! let pipeline = Pipeline::builder(registry).stage(Greeter).build();
//! ```

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::BoxFuture;
use tracing::{Instrument, Level, debug, error, span, trace, warn};

use bronze_core::{EntityResolver, Event, LogReplySink, PassthroughResolver, ReplySink};

use crate::context::Context;
use crate::error::{StageError, StageResult};
use crate::registry::{Registry, panic_message};

/// One step of the event pipeline.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs and errors.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Processes the event, calling `next.run(ctx)` to continue the chain.
    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult;
}

/// A type-erased stage.
pub type BoxedStage = Arc<dyn Stage>;

/// The remainder of the chain after the current stage.
pub struct Next<'a> {
    stages: &'a [BoxedStage],
    registry: &'a Registry,
}

impl<'a> Next<'a> {
    pub(crate) fn new(stages: &'a [BoxedStage], registry: &'a Registry) -> Self {
        Self { stages, registry }
    }

    /// Runs the rest of the chain.
    pub async fn run(self, ctx: &mut Context) -> StageResult {
        match self.stages.split_first() {
            Some((stage, rest)) => {
                trace!(stage = stage.name(), "Entering stage");
                stage.handle(ctx, Next::new(rest, self.registry)).await
            }
            None => {
                let outcome = self.registry.dispatch_outcome(ctx).await;
                if outcome.command.is_some() {
                    ctx.mark_handled();
                }
                if let Some(reply) = outcome.reply {
                    ctx.push_reply(reply);
                }
                Ok(())
            }
        }
    }

    /// Number of stages left before dispatch.
    pub fn remaining(&self) -> usize {
        self.stages.len()
    }
}

// =============================================================================
// Closure stages
// =============================================================================

/// A stage built from a closure. See [`stage_fn`].
pub struct FnStage<F> {
    name: String,
    f: F,
}

/// Builds a stage from a closure returning a boxed future.
///
/// ```rust,ignore
/// let upper = stage_fn("upper", |ctx, next| {
///     async move {
///         let result = next.run(ctx).await;
///         for reply in ctx.output_mut() {
///             *reply = reply.to_uppercase();
///         }
///         result
///     }
///     .boxed()
/// });
/// ```
pub fn stage_fn<F>(name: impl Into<String>, f: F) -> FnStage<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, StageResult> + Send + Sync,
{
    FnStage {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<F> Stage for FnStage<F>
where
    F: for<'a> Fn(&'a mut Context, Next<'a>) -> BoxFuture<'a, StageResult> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
        (self.f)(ctx, next).await
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Runs events through the stage chain and delivers the resulting replies.
pub struct Pipeline {
    stages: Vec<BoxedStage>,
    registry: Arc<Registry>,
    resolver: Arc<dyn EntityResolver>,
    reply: Arc<dyn ReplySink>,
}

impl Pipeline {
    /// Starts building a pipeline that dispatches into `registry`.
    pub fn builder(registry: Arc<Registry>) -> PipelineBuilder {
        PipelineBuilder {
            stages: Vec::new(),
            registry,
            resolver: Arc::new(PassthroughResolver),
            reply: Arc::new(LogReplySink),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Processes one event end to end.
    ///
    /// Resolves entities, runs the chain, then flushes buffered output to
    /// the event's origin. Returns whether the event was handled. Stage
    /// errors and panics are logged here and never escape.
    pub async fn execute(&self, event: impl Into<Arc<Event>>) -> bool {
        let event = event.into();
        let span = span!(
            Level::DEBUG,
            "event",
            id = %event.id(),
            kind = %event.kind(),
            user = %event.user_id(),
        );

        self.execute_inner(event).instrument(span).await
    }

    async fn execute_inner(&self, event: Arc<Event>) -> bool {
        let entities = match self.resolver.resolve(&event).await {
            Ok(entities) => entities,
            Err(e) => {
                warn!(error = %e, "Entity resolution failed, dropping event");
                return false;
            }
        };

        let mut ctx = Context::new(event, entities);
        match AssertUnwindSafe(self.run(&mut ctx)).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(error = %e, "Pipeline aborted");
                return false;
            }
            Err(panic) => {
                let e = StageError::Panicked(panic_message(panic.as_ref()));
                error!(error = %e, "Pipeline aborted");
                return false;
            }
        }

        let origin = ctx.origin();
        for text in ctx.take_output() {
            if let Err(e) = self.reply.reply(&origin, &text).await {
                warn!(to = %origin, error = %e, "Failed to deliver reply");
            }
        }

        debug!(handled = ctx.is_handled(), "Event processed");
        ctx.is_handled()
    }

    /// Runs the stage chain on an existing context without flushing output.
    pub async fn run(&self, ctx: &mut Context) -> StageResult {
        Next::new(&self.stages, &self.registry).run(ctx).await
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.stage_names())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder {
    stages: Vec<BoxedStage>,
    registry: Arc<Registry>,
    resolver: Arc<dyn EntityResolver>,
    reply: Arc<dyn ReplySink>,
}

impl PipelineBuilder {
    /// Appends a stage. Stages run in the order they are added.
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_boxed(mut self, stage: BoxedStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn EntityResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn reply_sink(mut self, reply: Arc<dyn ReplySink>) -> Self {
        self.reply = reply;
        self
    }

    pub fn build(self) -> Pipeline {
        Pipeline {
            stages: self.stages,
            registry: self.registry,
            resolver: self.resolver,
            reply: self.reply,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use bronze_core::{ChannelReplySink, Entities, ResolveError, ResolveResult, Target};

    use super::*;
    use crate::handler::{Invocation, into_handler};
    use crate::registry::Command;

    /// Records its name on the way in and out.
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Stage for Trace {
        fn name(&self) -> &str {
            self.name
        }

        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
            self.log.lock().unwrap().push(format!("{}:in", self.name));
            next.run(ctx).await?;
            self.log.lock().unwrap().push(format!("{}:out", self.name));
            Ok(())
        }
    }

    struct Stop;

    #[async_trait]
    impl Stage for Stop {
        async fn handle(&self, ctx: &mut Context, _next: Next<'_>) -> StageResult {
            ctx.push_reply("stopped");
            ctx.mark_handled();
            Ok(())
        }
    }

    struct Fail;

    #[async_trait]
    impl Stage for Fail {
        fn name(&self) -> &str {
            "fail"
        }

        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> StageResult {
            Err(StageError::failed(self.name(), "rejected"))
        }
    }

    struct FailAfter;

    #[async_trait]
    impl Stage for FailAfter {
        async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
            next.run(ctx).await?;
            Err(StageError::failed("fail-after", "post-processing failed"))
        }
    }

    struct Panics;

    #[async_trait]
    impl Stage for Panics {
        async fn handle(&self, _ctx: &mut Context, _next: Next<'_>) -> StageResult {
            panic!("stage exploded");
        }
    }

    struct Unreachable;

    #[async_trait]
    impl EntityResolver for Unreachable {
        async fn resolve(&self, _event: &Event) -> ResolveResult<Entities> {
            Err(ResolveError::Backend("cache offline".into()))
        }
    }

    fn registry() -> Arc<Registry> {
        let registry = Registry::new();
        registry
            .register_command(
                Command::new("ping").trigger("/ping"),
                into_handler(|_inv: Invocation| async move { Ok(Some("pong".to_string())) }),
            )
            .unwrap();
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_stages_wrap_dispatch_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .stage(Trace { name: "a", log: log.clone() })
            .stage(Trace { name: "b", log: log.clone() })
            .reply_sink(Arc::new(sink))
            .build();

        assert!(pipeline.execute(Event::message("u1", "/ping").in_group("g1")).await);
        assert_eq!(*log.lock().unwrap(), ["a:in", "b:in", "b:out", "a:out"]);

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.target, Target::group("g1"));
        assert_eq!(reply.text, "pong");
    }

    #[tokio::test]
    async fn test_unmatched_message_is_unhandled() {
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry()).reply_sink(Arc::new(sink)).build();

        assert!(!pipeline.execute(Event::message("u1", "hello")).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_short_circuit_skips_dispatch() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .stage(Stop)
            .stage(Trace { name: "after", log: log.clone() })
            .reply_sink(Arc::new(sink))
            .build();

        assert!(pipeline.execute(Event::message("u1", "/ping")).await);
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(rx.recv().await.unwrap().text, "stopped");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stage_error_discards_output() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .stage(Trace { name: "outer", log: log.clone() })
            .stage(Fail)
            .reply_sink(Arc::new(sink))
            .build();

        assert!(!pipeline.execute(Event::message("u1", "/ping")).await);
        // The error propagates through `?`, so the outer stage never resumes.
        assert_eq!(*log.lock().unwrap(), ["outer:in"]);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_error_after_dispatch_still_discards_output() {
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .stage(FailAfter)
            .reply_sink(Arc::new(sink))
            .build();

        assert!(!pipeline.execute(Event::message("u1", "/ping")).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_panicking_stage_is_contained() {
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .stage(Panics)
            .reply_sink(Arc::new(sink))
            .build();

        assert!(!pipeline.execute(Event::message("u1", "/ping")).await);
        assert!(rx.try_recv().is_err());

        // The pipeline stays usable for the next event.
        let healthy = Pipeline::builder(pipeline.registry().clone())
            .reply_sink(Arc::new(ChannelReplySink::new(1).0))
            .build();
        assert!(healthy.execute(Event::message("u1", "/ping")).await);
    }

    #[tokio::test]
    async fn test_resolution_failure_is_a_stage_error() {
        let (sink, mut rx) = ChannelReplySink::new(8);
        let pipeline = Pipeline::builder(registry())
            .resolver(Arc::new(Unreachable))
            .reply_sink(Arc::new(sink))
            .build();

        assert!(!pipeline.execute(Event::message("u1", "/ping")).await);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stage_fn_post_processes_output() {
        let (sink, mut rx) = ChannelReplySink::new(8);
        let upper = stage_fn("upper", |ctx, next| {
            async move {
                let result = next.run(ctx).await;
                for reply in ctx.output_mut() {
                    *reply = reply.to_uppercase();
                }
                result
            }
            .boxed()
        });
        let pipeline = Pipeline::builder(registry())
            .stage(upper)
            .reply_sink(Arc::new(sink))
            .build();

        assert_eq!(pipeline.stage_names(), ["upper"]);
        assert!(pipeline.execute(Event::message("u1", "/ping")).await);
        assert_eq!(rx.recv().await.unwrap().text, "PONG");
    }
}
