//! Request/response correlation over a plugin's stdio pipes.
//!
//! A [`PluginConnection`] owns the write half of the pipe pair and a reader
//! task for the other half. Two primitives are offered:
//!
//! - [`send_event`](PluginConnection::send_event): fire-and-forget.
//! - [`send_request`](PluginConnection::send_request): registers a pending
//!   request under a fresh correlation id, sends, then waits for the
//!   matching response. The write and the wait share one deadline, so a
//!   plugin that stops reading its input still times out.
//!
//! # Exactly-once resolution
//!
//! Each pending request is resolved by exactly one of: its response, its
//! timeout, or the connection closing. The reader and the closer both
//! remove the entry and send its result while holding the pending-map lock,
//! so a waiter whose deadline fires finds either its entry (and reports the
//! timeout) or an already-sent result (and returns that instead).
//!
//! A write cut off by a deadline can leave half a line in the pipe. The next
//! write terminates it first, so the plugin sees one malformed line and the
//! framing recovers.
//!
//! # Reader loop
//!
//! Lines that do not decode are logged and skipped. Actions carried by a
//! response run on a spawned task, in order, so a slow action never stalls
//! the reader. When the plugin closes its output every pending request
//! fails and later sends fail fast.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tracing::{debug, trace, warn};

use bronze_core::{Event, Target};

use crate::error::{PluginError, PluginResult};
use crate::protocol::{Action, EventMessage, ResponseMessage, decode_response, encode_line, new_id};

/// Default deadline for a request/response round-trip.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default cap on a single protocol line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Tunables for a [`PluginConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub request_timeout: Duration,
    /// Longer lines are a protocol violation and close the connection.
    pub max_line_bytes: usize,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

// =============================================================================
// Action handling seam
// =============================================================================

/// Where an action came from.
#[derive(Clone)]
pub struct ActionContext {
    pub plugin_id: String,
    /// The inbound event whose request produced the action, if any.
    pub source: Option<Arc<Event>>,
    /// Connection to answer on (for `skill_result` follow-ups).
    pub connection: PluginConnection,
}

impl ActionContext {
    /// Conversation a `reply` action goes to when it names none.
    pub fn default_target(&self) -> Option<Target> {
        self.source.as_ref().map(|event| event.origin())
    }
}

/// Executes actions emitted by a plugin.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    async fn execute(&self, action: Action, ctx: &ActionContext);
}

/// Handler that logs and drops every action.
#[derive(Debug, Clone, Copy, Default)]
pub struct IgnoreActions;

#[async_trait]
impl ActionHandler for IgnoreActions {
    async fn execute(&self, action: Action, ctx: &ActionContext) {
        debug!(plugin = %ctx.plugin_id, kind = ?action.kind, "Ignoring plugin action");
    }
}

// =============================================================================
// PluginConnection
// =============================================================================

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct PipeWriter {
    io: BoxedWriter,
    /// The last write did not finish its line.
    torn: bool,
}

struct Pending {
    tx: oneshot::Sender<PluginResult<ResponseMessage>>,
    source: Option<Arc<Event>>,
}

#[derive(Default)]
struct State {
    pending: HashMap<String, Pending>,
    closed: Option<PluginError>,
}

struct Inner {
    plugin_id: String,
    options: ConnectionOptions,
    writer: tokio::sync::Mutex<Option<PipeWriter>>,
    state: Mutex<State>,
}

/// A live protocol session with one plugin. Cheap to clone.
#[derive(Clone)]
pub struct PluginConnection {
    inner: Arc<Inner>,
}

impl PluginConnection {
    /// Wraps a pipe pair and spawns the reader loop.
    ///
    /// Returns the connection and the reader task's handle; the task ends
    /// when the plugin closes its output.
    pub fn start<R, W>(
        plugin_id: impl Into<String>,
        reader: R,
        writer: W,
        actions: Arc<dyn ActionHandler>,
        options: ConnectionOptions,
    ) -> (Self, JoinHandle<()>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let connection = Self {
            inner: Arc::new(Inner {
                plugin_id: plugin_id.into(),
                options,
                writer: tokio::sync::Mutex::new(Some(PipeWriter {
                    io: Box::new(writer),
                    torn: false,
                })),
                state: Mutex::new(State::default()),
            }),
        };
        let reader_task = tokio::spawn(reader_loop(connection.clone(), reader, actions));
        (connection, reader_task)
    }

    pub fn plugin_id(&self) -> &str {
        &self.inner.plugin_id
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.inner.options
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed.is_some()
    }

    /// Why the connection closed, if it has.
    pub fn closed_reason(&self) -> Option<PluginError> {
        self.inner.state.lock().closed.clone()
    }

    /// Sends a fire-and-forget event.
    ///
    /// Fails with [`PluginError::Timeout`] if the plugin does not take the
    /// line within the request timeout.
    pub async fn send_event(
        &self,
        name: &str,
        payload: Map<String, Value>,
        correlation_id: Option<&str>,
    ) -> PluginResult<()> {
        self.check_open()?;
        let mut message = EventMessage::new(name, payload);
        message.correlation_id = correlation_id.map(str::to_string);

        let after = self.inner.options.request_timeout;
        match timeout(after, self.write(&message)).await {
            Ok(written) => written,
            Err(_) => {
                debug!(plugin = %self.inner.plugin_id, name, "Plugin is not reading its input");
                Err(PluginError::Timeout {
                    name: name.to_string(),
                    after,
                })
            }
        }
    }

    /// Sends a request and waits for its response.
    pub async fn send_request(&self, name: &str, payload: Map<String, Value>) -> PluginResult<ResponseMessage> {
        self.send_request_from(None, name, payload).await
    }

    /// Sends a request on behalf of an inbound event.
    ///
    /// `reply` actions in the response that name no target are delivered to
    /// `source`'s conversation.
    pub async fn send_request_from(
        &self,
        source: Option<Arc<Event>>,
        name: &str,
        payload: Map<String, Value>,
    ) -> PluginResult<ResponseMessage> {
        let correlation_id = new_id();
        let message = EventMessage::new(name, payload).with_correlation_id(correlation_id.as_str());

        // Register before sending so a fast response is never missed.
        let (tx, mut rx) = oneshot::channel();
        {
            let mut state = self.inner.state.lock();
            if let Some(reason) = &state.closed {
                return Err(reason.clone());
            }
            state
                .pending
                .insert(correlation_id.clone(), Pending { tx, source });
        }

        trace!(plugin = %self.inner.plugin_id, name, correlation_id = %correlation_id, "Sending request");
        let after = self.inner.options.request_timeout;
        let exchange = async {
            // The connection may close while the write is still blocked.
            tokio::select! {
                resolved = &mut rx => return resolved,
                written = self.write(&message) => {
                    if let Err(e) = written {
                        self.inner.state.lock().pending.remove(&correlation_id);
                        return Ok(Err(e));
                    }
                }
            }
            (&mut rx).await
        };

        match timeout(after, exchange).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(PluginError::Closed("response channel dropped".to_string())),
            Err(_) => {
                let removed = self.inner.state.lock().pending.remove(&correlation_id);
                if removed.is_some() {
                    debug!(plugin = %self.inner.plugin_id, name, "Request timed out");
                    return Err(PluginError::Timeout {
                        name: name.to_string(),
                        after,
                    });
                }
                // Resolved under the lock just as the deadline fired.
                rx.try_recv()
                    .unwrap_or_else(|_| Err(PluginError::Closed("response channel dropped".to_string())))
            }
        }
    }

    /// Fails every pending request with `reason` and closes the plugin's input.
    ///
    /// Later sends fail fast with `reason`. Calling it again replaces the
    /// reported reason (a crash detected after the output closed, say).
    /// Waits at most the request timeout for a stalled writer.
    pub async fn close(&self, reason: PluginError) {
        self.fail_pending(reason, true);

        let closing = async {
            match self.inner.writer.lock().await.take() {
                Some(mut writer) => writer.io.shutdown().await,
                None => Ok(()),
            }
        };
        match timeout(self.inner.options.request_timeout, closing).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => trace!(plugin = %self.inner.plugin_id, error = %e, "Closing plugin input failed"),
            Err(_) => debug!(plugin = %self.inner.plugin_id, "Plugin input did not close in time"),
        }
    }

    /// Fails everything pending and marks the connection closed. An earlier
    /// reason is kept unless `overwrite` is set.
    pub(crate) fn fail_pending(&self, reason: PluginError, overwrite: bool) -> usize {
        let mut state = self.inner.state.lock();
        if overwrite || state.closed.is_none() {
            state.closed = Some(reason);
        }
        let Some(reason) = state.closed.clone() else {
            return 0;
        };
        let failed = state.pending.len();
        for (_, pending) in state.pending.drain() {
            let _ = pending.tx.send(Err(reason.clone()));
        }
        if failed > 0 {
            debug!(plugin = %self.inner.plugin_id, failed, "Failed pending requests");
        }
        failed
    }

    fn check_open(&self) -> PluginResult<()> {
        match &self.inner.state.lock().closed {
            Some(reason) => Err(reason.clone()),
            None => Ok(()),
        }
    }

    async fn write(&self, message: &EventMessage) -> PluginResult<()> {
        let line = encode_line(message)?;
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(self
                .closed_reason()
                .unwrap_or_else(|| PluginError::Closed("plugin input closed".to_string())));
        };
        if writer.torn {
            writer.io.write_all(b"\n").await?;
        }
        writer.torn = true;
        writer.io.write_all(line.as_bytes()).await?;
        writer.io.flush().await?;
        writer.torn = false;
        Ok(())
    }

    /// Routes one decoded response. Returns the actions to run and their source.
    fn resolve(&self, response: ResponseMessage) -> (Vec<Action>, Option<Arc<Event>>) {
        let actions = response.actions.clone();
        let mut state = self.inner.state.lock();
        match state.pending.remove(&response.id) {
            Some(pending) => {
                let source = pending.source;
                let _ = pending.tx.send(Ok(response));
                (actions, source)
            }
            None => {
                trace!(plugin = %self.inner.plugin_id, id = %response.id, "Uncorrelated response");
                (actions, None)
            }
        }
    }
}

impl std::fmt::Debug for PluginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginConnection")
            .field("plugin_id", &self.inner.plugin_id)
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn reader_loop<R>(connection: PluginConnection, reader: R, actions: Arc<dyn ActionHandler>)
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let plugin_id = connection.plugin_id().to_string();
    let codec = LinesCodec::new_with_max_length(connection.options().max_line_bytes);
    let mut lines = FramedRead::new(reader, codec);

    let reason = loop {
        let line = match lines.next().await {
            Some(Ok(line)) => line,
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                break PluginError::Codec("line exceeds maximum length".to_string());
            }
            Some(Err(LinesCodecError::Io(e))) => break PluginError::from(e),
            None => break PluginError::Closed("plugin closed its output".to_string()),
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = match decode_response(&line) {
            Ok(response) => response,
            Err(e) => {
                warn!(plugin = %plugin_id, error = %e, "Dropping malformed line");
                continue;
            }
        };

        let (batch, source) = connection.resolve(response);
        if batch.is_empty() {
            continue;
        }

        let ctx = ActionContext {
            plugin_id: plugin_id.clone(),
            source,
            connection: connection.clone(),
        };
        let handler = Arc::clone(&actions);
        tokio::spawn(async move {
            for action in batch {
                handler.execute(action, &ctx).await;
            }
        });
    };

    debug!(plugin = %plugin_id, reason = %reason, "Reader loop finished");
    connection.fail_pending(reason, false);
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocol::ActionKind;

    /// Forwards every executed action to a channel.
    struct Recorder(mpsc::UnboundedSender<(Action, Option<Target>)>);

    #[async_trait]
    impl ActionHandler for Recorder {
        async fn execute(&self, action: Action, ctx: &ActionContext) {
            let _ = self.0.send((action, ctx.default_target()));
        }
    }

    /// The plugin's end of the pipes.
    struct FakePlugin {
        lines: tokio::io::Lines<BufReader<ReadHalf<DuplexStream>>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakePlugin {
        async fn recv(&mut self) -> EventMessage {
            let line = self.lines.next_line().await.unwrap().unwrap();
            serde_json::from_str(&line).unwrap()
        }

        async fn send_raw(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
            self.writer.flush().await.unwrap();
        }

        async fn respond(&mut self, response: &ResponseMessage) {
            let line = serde_json::to_string(response).unwrap();
            self.send_raw(&line).await;
        }
    }

    fn connect(
        options: ConnectionOptions,
    ) -> (
        PluginConnection,
        FakePlugin,
        mpsc::UnboundedReceiver<(Action, Option<Target>)>,
    ) {
        connect_with_buffer(64 * 1024, options)
    }

    fn connect_with_buffer(
        buffer: usize,
        options: ConnectionOptions,
    ) -> (
        PluginConnection,
        FakePlugin,
        mpsc::UnboundedReceiver<(Action, Option<Target>)>,
    ) {
        let (host, plugin) = tokio::io::duplex(buffer);
        let (host_read, host_write) = tokio::io::split(host);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let (tx, rx) = mpsc::unbounded_channel();

        let (connection, _reader) =
            PluginConnection::start("test", host_read, host_write, Arc::new(Recorder(tx)), options);
        let plugin = FakePlugin {
            lines: BufReader::new(plugin_read).lines(),
            writer: plugin_write,
        };
        (connection, plugin, rx)
    }

    async fn wait_for_pending(connection: &PluginConnection, count: usize) {
        while connection.pending_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (connection, mut plugin, _rx) = connect(ConnectionOptions::default());

        let mut payload = Map::new();
        payload.insert("q".into(), json!(1));
        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("command", payload).await }
        });

        let message = plugin.recv().await;
        assert_eq!(message.kind, "event");
        assert_eq!(message.name, "command");
        assert_eq!(message.payload["q"], 1);
        let correlation_id = message.correlation_id.clone().unwrap();
        assert_ne!(correlation_id, "");

        plugin.respond(&ResponseMessage::ok(correlation_id.as_str())).await;

        let response = request.await.unwrap().unwrap();
        assert!(response.ok);
        assert_eq!(response.id, correlation_id);
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_send_event_is_fire_and_forget() {
        let (connection, mut plugin, _rx) = connect(ConnectionOptions::default());

        connection.send_event("event", Map::new(), Some("abc")).await.unwrap();
        let message = plugin.recv().await;
        assert_eq!(message.correlation_id.as_deref(), Some("abc"));
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_pending_entry() {
        let options = ConnectionOptions {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, mut plugin, _rx) = connect(options);

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("slow", Map::new()).await }
        });
        let message = plugin.recv().await;

        let err = request.await.unwrap().unwrap_err();
        assert!(matches!(err, PluginError::Timeout { ref name, .. } if name == "slow"));
        assert_eq!(connection.pending_count(), 0);

        // A late answer is ignored; the connection stays usable.
        let late = message.correlation_id.unwrap();
        plugin.respond(&ResponseMessage::ok(late)).await;

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("fast", Map::new()).await }
        });
        let message = plugin.recv().await;
        plugin
            .respond(&ResponseMessage::ok(message.correlation_id.unwrap()))
            .await;
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_input_times_out_and_framing_recovers() {
        let options = ConnectionOptions {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, mut plugin, _rx) = connect_with_buffer(64, options);

        // The plugin reads nothing, so the write fills the pipe and blocks.
        let mut payload = Map::new();
        payload.insert("blob".into(), json!("x".repeat(4096)));
        let err = connection.send_request("big", payload).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout { ref name, .. } if name == "big"));
        assert_eq!(connection.pending_count(), 0);

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("small", Map::new()).await }
        });

        // The half-written line arrives terminated; the next line is intact.
        let torn = plugin.lines.next_line().await.unwrap().unwrap();
        assert!(serde_json::from_str::<EventMessage>(&torn).is_err());
        let message = plugin.recv().await;
        assert_eq!(message.name, "small");
        plugin
            .respond(&ResponseMessage::ok(message.correlation_id.unwrap()))
            .await;
        assert!(request.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_input_bounds_fire_and_forget() {
        let options = ConnectionOptions {
            request_timeout: Duration::from_millis(200),
            ..Default::default()
        };
        let (connection, _plugin, _rx) = connect_with_buffer(64, options);

        let mut payload = Map::new();
        payload.insert("blob".into(), json!("x".repeat(4096)));
        let err = connection.send_event("event", payload, None).await.unwrap_err();
        assert!(matches!(err, PluginError::Timeout { .. }));
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let (connection, mut plugin, _rx) = connect(ConnectionOptions::default());

        let request = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("command", Map::new()).await }
        });
        let message = plugin.recv().await;

        plugin.send_raw("this is not json").await;
        plugin.send_raw("").await;
        plugin.send_raw(r#"{"id":"nobody","ok":true}"#).await;
        plugin
            .respond(&ResponseMessage::ok(message.correlation_id.unwrap()))
            .await;

        assert!(request.await.unwrap().is_ok());
        assert!(!connection.is_closed());
    }

    #[tokio::test]
    async fn test_actions_default_to_request_source() {
        let (connection, mut plugin, mut rx) = connect(ConnectionOptions::default());
        let source = Arc::new(Event::message("u1", "/weather").in_group("g1"));

        let request = tokio::spawn({
            let connection = connection.clone();
            let source = Arc::clone(&source);
            async move {
                connection
                    .send_request_from(Some(source), "command", Map::new())
                    .await
            }
        });
        let message = plugin.recv().await;
        plugin
            .respond(
                &ResponseMessage::ok(message.correlation_id.unwrap())
                    .with_action(Action::reply("sunny"))
                    .with_action(Action::reply("and warm")),
            )
            .await;

        assert!(request.await.unwrap().is_ok());
        let (first, target) = rx.recv().await.unwrap();
        assert_eq!(first.kind, ActionKind::Reply);
        assert_eq!(first.text.as_deref(), Some("sunny"));
        assert_eq!(target, Some(Target::group("g1")));
        assert_eq!(rx.recv().await.unwrap().0.text.as_deref(), Some("and warm"));
    }

    #[tokio::test]
    async fn test_unsolicited_actions_run_without_source() {
        let (_connection, mut plugin, mut rx) = connect(ConnectionOptions::default());

        plugin
            .respond(
                &ResponseMessage::ok("push")
                    .with_action(Action::new(ActionKind::SendMessage).with_text("news")),
            )
            .await;

        let (action, target) = rx.recv().await.unwrap();
        assert_eq!(action.kind, ActionKind::SendMessage);
        assert!(target.is_none());
    }

    #[tokio::test]
    async fn test_eof_fails_all_pending_requests() {
        let (connection, plugin, _rx) = connect(ConnectionOptions::default());

        let first = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("a", Map::new()).await }
        });
        let second = tokio::spawn({
            let connection = connection.clone();
            async move { connection.send_request("b", Map::new()).await }
        });
        wait_for_pending(&connection, 2).await;

        drop(plugin);

        assert!(matches!(first.await.unwrap(), Err(PluginError::Closed(_))));
        assert!(matches!(second.await.unwrap(), Err(PluginError::Closed(_))));
        assert_eq!(connection.pending_count(), 0);
        assert!(connection.is_closed());

        // Fails fast: no new pending entry, no wait.
        let err = connection.send_request("c", Map::new()).await.unwrap_err();
        assert!(err.is_terminal());
        assert_eq!(connection.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_reports_reason() {
        let (connection, _plugin, _rx) = connect(ConnectionOptions::default());

        connection.close(PluginError::Stopped).await;
        assert!(matches!(connection.closed_reason(), Some(PluginError::Stopped)));
        assert!(matches!(
            connection.send_event("x", Map::new(), None).await,
            Err(PluginError::Stopped)
        ));
    }
}
