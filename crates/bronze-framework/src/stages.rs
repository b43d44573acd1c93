//! Built-in pipeline stages.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use crate::context::Context;
use crate::error::StageResult;
use crate::pipeline::{Next, Stage};

/// Logs every event on the way in and its outcome on the way out.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingStage;

#[async_trait]
impl Stage for TracingStage {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
        let started = Instant::now();
        debug!(
            platform = ctx.event().platform(),
            group = ctx.event().group_id().unwrap_or("-"),
            text = ctx.text(),
            "Event received"
        );

        let result = next.run(ctx).await;

        debug!(
            handled = ctx.is_handled(),
            replies = ctx.output().len(),
            ok = result.is_ok(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Event finished"
        );
        result
    }
}

/// Silently drops events from blocked users.
#[derive(Debug, Clone, Default)]
pub struct BlocklistStage {
    users: HashSet<String>,
}

impl BlocklistStage {
    pub fn new<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            users: users.into_iter().map(Into::into).collect(),
        }
    }

    pub fn is_blocked(&self, user_id: &str) -> bool {
        self.users.contains(user_id)
    }
}

#[async_trait]
impl Stage for BlocklistStage {
    fn name(&self) -> &str {
        "blocklist"
    }

    async fn handle(&self, ctx: &mut Context, next: Next<'_>) -> StageResult {
        if self.is_blocked(ctx.event().user_id()) {
            debug!(user = ctx.event().user_id(), "Dropping event from blocked user");
            return Ok(());
        }
        next.run(ctx).await
    }
}
