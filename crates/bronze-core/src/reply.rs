//! Outbound reply delivery.
//!
//! The host never speaks a platform protocol itself. Every piece of text it
//! produces (capability results, plugin `reply` actions) goes through a
//! [`ReplySink`], which the embedding application wires to its gateway.

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::info;

use crate::error::{ReplyError, ReplyResult};
use crate::event::Target;

/// Delivers text to a conversation on the origin platform.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Sends `text` to `target`.
    async fn reply(&self, target: &Target, text: &str) -> ReplyResult<()>;
}

/// A reply captured by [`ChannelReplySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundReply {
    pub target: Target,
    pub text: String,
}

/// Sink that forwards every reply into an mpsc channel.
///
/// Useful when a separate task owns the gateway connection, and in tests.
#[derive(Debug, Clone)]
pub struct ChannelReplySink {
    tx: mpsc::Sender<OutboundReply>,
}

impl ChannelReplySink {
    /// Creates a sink and the receiver that drains it.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<OutboundReply>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ReplySink for ChannelReplySink {
    async fn reply(&self, target: &Target, text: &str) -> ReplyResult<()> {
        self.tx
            .send(OutboundReply {
                target: target.clone(),
                text: text.to_string(),
            })
            .await
            .map_err(|_| ReplyError::Closed)
    }
}

/// Sink that only logs replies. Handy for dry runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReplySink;

#[async_trait]
impl ReplySink for LogReplySink {
    async fn reply(&self, target: &Target, text: &str) -> ReplyResult<()> {
        info!(to = %target, text = %text, "Reply");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelReplySink::new(4);
        sink.reply(&Target::group("g1"), "hello").await.unwrap();

        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.target, Target::group("g1"));
        assert_eq!(reply.text, "hello");
    }

    #[tokio::test]
    async fn test_channel_sink_closed() {
        let (sink, rx) = ChannelReplySink::new(1);
        drop(rx);
        let err = sink.reply(&Target::private("u1"), "x").await.unwrap_err();
        assert!(matches!(err, ReplyError::Closed));
    }
}
