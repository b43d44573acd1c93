//! Supervised plugin child processes.
//!
//! ```text
//!  Starting ──▶ Running ──▶ Stopping ──▶ Stopped
//!     │            │            │
//!     └────────────┴────────────┴──────▶ Crashed
//! ```
//!
//! A supervisor task owns the child. It waits for either the child's exit
//! (an unrequested exit is a crash: pending requests fail, the state becomes
//! `Crashed`) or a stop request (send `shutdown`, close stdin, give the child
//! its grace period, then kill it). The grace period also bounds the
//! shutdown message and closing stdin, so a plugin that stopped reading is
//! still killed on time. Once terminal, every send fails fast.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

use bronze_core::Event;

use crate::connection::{
    ActionHandler, ConnectionOptions, DEFAULT_MAX_LINE_BYTES, DEFAULT_REQUEST_TIMEOUT, PluginConnection,
};
use crate::error::{PluginError, PluginResult};
use crate::protocol::{ResponseMessage, names};

/// How long a stopping plugin may take to exit before it is killed.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

// =============================================================================
// ProcessState
// =============================================================================

/// Lifecycle state of a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessState {
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Crashed => "crashed",
        }
    }

    /// `Stopped` and `Crashed` are final.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }

    /// Whether the lifecycle allows moving from `self` to `to`.
    pub fn can_transition(&self, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, to),
            (Starting, Running | Stopped | Crashed) | (Running, Stopping | Crashed) | (Stopping, Stopped | Crashed)
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// PluginSpec
// =============================================================================

/// How to launch one plugin.
#[derive(Debug, Clone)]
pub struct PluginSpec {
    pub id: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_line_bytes: usize,
}

impl PluginSpec {
    pub fn new(id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn max_line_bytes(mut self, max: usize) -> Self {
        self.max_line_bytes = max;
        self
    }

    fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            request_timeout: self.request_timeout,
            max_line_bytes: self.max_line_bytes,
        }
    }
}

// =============================================================================
// PluginProcess
// =============================================================================

struct Inner {
    spec: PluginSpec,
    pid: Option<u32>,
    connection: PluginConnection,
    state: watch::Sender<ProcessState>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Inner {
    fn state(&self) -> ProcessState {
        *self.state.borrow()
    }

    fn transition(&self, to: ProcessState) -> PluginResult<ProcessState> {
        let mut result = Err(PluginError::InvalidTransition { from: to, to });
        self.state.send_if_modified(|current| {
            if current.can_transition(to) {
                result = Ok(*current);
                *current = to;
                true
            } else {
                result = Err(PluginError::InvalidTransition { from: *current, to });
                false
            }
        });
        if let Ok(from) = result {
            debug!(plugin = %self.spec.id, %from, %to, "Plugin state changed");
        }
        result
    }
}

/// A running plugin child process. Cheap to clone.
#[derive(Clone)]
pub struct PluginProcess {
    inner: Arc<Inner>,
}

impl PluginProcess {
    /// Launches the plugin and starts supervising it.
    ///
    /// Actions in the plugin's responses are run through `actions`.
    pub fn spawn(spec: PluginSpec, actions: Arc<dyn ActionHandler>) -> PluginResult<Self> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command
            .spawn()
            .map_err(|e| PluginError::Spawn(format!("{}: {e}", spec.command)))?;
        let (Some(stdin), Some(stdout), Some(stderr)) = (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(PluginError::Spawn("child stdio was not captured".to_string()));
        };
        let pid = child.id();

        tokio::spawn(forward_stderr(spec.id.clone(), stderr));
        let (connection, _reader) =
            PluginConnection::start(spec.id.clone(), stdout, stdin, actions, spec.connection_options());

        let (stop_tx, stop_rx) = oneshot::channel();
        let (state, _) = watch::channel(ProcessState::Starting);
        let inner = Arc::new(Inner {
            spec,
            pid,
            connection,
            state,
            stop: Mutex::new(Some(stop_tx)),
        });
        inner.transition(ProcessState::Running)?;
        info!(plugin = %inner.spec.id, pid = ?pid, command = %inner.spec.command, "Plugin started");

        tokio::spawn(supervise(Arc::clone(&inner), child, stop_rx));
        Ok(Self { inner })
    }

    pub fn id(&self) -> &str {
        &self.inner.spec.id
    }

    pub fn spec(&self) -> &PluginSpec {
        &self.inner.spec
    }

    /// OS process id, if the child was still alive when it was read.
    pub fn pid(&self) -> Option<u32> {
        self.inner.pid
    }

    pub fn state(&self) -> ProcessState {
        self.inner.state()
    }

    /// Subscribes to state changes.
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ProcessState::Running
    }

    pub fn connection(&self) -> &PluginConnection {
        &self.inner.connection
    }

    /// Sends a request and waits for the plugin's response.
    pub async fn send_request(&self, name: &str, payload: Map<String, Value>) -> PluginResult<ResponseMessage> {
        self.ensure_running()?;
        self.inner.connection.send_request(name, payload).await
    }

    /// Sends a request on behalf of `source`; see
    /// [`PluginConnection::send_request_from`].
    pub async fn send_request_from(
        &self,
        source: Option<Arc<Event>>,
        name: &str,
        payload: Map<String, Value>,
    ) -> PluginResult<ResponseMessage> {
        self.ensure_running()?;
        self.inner.connection.send_request_from(source, name, payload).await
    }

    pub async fn send_event(&self, name: &str, payload: Map<String, Value>) -> PluginResult<()> {
        self.ensure_running()?;
        self.inner.connection.send_event(name, payload, None).await
    }

    /// Stops the plugin and waits until it has exited.
    ///
    /// Stopping an already stopped or crashed plugin is a no-op.
    pub async fn stop(&self) -> PluginResult<ProcessState> {
        if self.state().is_terminal() {
            return Ok(self.state());
        }
        if let Err(e) = self.inner.transition(ProcessState::Stopping) {
            // Lost a race with the supervisor.
            if !self.state().is_terminal() && self.state() != ProcessState::Stopping {
                return Err(e);
            }
        }
        if let Some(stop) = self.inner.stop.lock().take() {
            let _ = stop.send(());
        }
        Ok(self.wait_terminal().await)
    }

    /// Waits until the plugin is `Stopped` or `Crashed`.
    pub async fn wait_terminal(&self) -> ProcessState {
        let mut rx = self.inner.state.subscribe();
        match rx.wait_for(ProcessState::is_terminal).await {
            Ok(state) => *state,
            Err(_) => self.state(),
        }
    }

    fn ensure_running(&self) -> PluginResult<()> {
        match self.state() {
            ProcessState::Running => Ok(()),
            other => Err(PluginError::NotRunning(other)),
        }
    }
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("id", &self.inner.spec.id)
            .field("pid", &self.inner.pid)
            .field("state", &self.state())
            .finish()
    }
}

async fn supervise(inner: Arc<Inner>, mut child: Child, stop: oneshot::Receiver<()>) {
    let plugin = inner.spec.id.clone();

    tokio::select! {
        status = child.wait() => {
            let reason = match status {
                Ok(status) => format!("exited with {status}"),
                Err(e) => format!("wait failed: {e}"),
            };
            warn!(plugin = %plugin, %reason, "Plugin exited unexpectedly");
            let _ = inner.transition(ProcessState::Crashed);
            inner.connection.close(PluginError::Crashed(reason)).await;
        }
        _ = stop => {
            let grace = inner.spec.shutdown_grace;
            let deadline = Instant::now() + grace;

            let notify = async {
                if let Err(e) = inner.connection.send_event(names::SHUTDOWN, Map::new(), None).await {
                    debug!(plugin = %plugin, error = %e, "Could not deliver shutdown event");
                }
                inner.connection.close(PluginError::Stopped).await;
            };
            if timeout_at(deadline, notify).await.is_err() {
                debug!(plugin = %plugin, "Plugin input is stalled");
                inner.connection.fail_pending(PluginError::Stopped, true);
            }

            match timeout_at(deadline, child.wait()).await {
                Ok(Ok(status)) => debug!(plugin = %plugin, %status, "Plugin exited"),
                Ok(Err(e)) => warn!(plugin = %plugin, error = %e, "Waiting for plugin failed"),
                Err(_) => {
                    warn!(plugin = %plugin, ?grace, "Plugin ignored shutdown; killing");
                    if let Err(e) = child.kill().await {
                        warn!(plugin = %plugin, error = %e, "Killing plugin failed");
                    }
                }
            }
            let _ = inner.transition(ProcessState::Stopped);
            info!(plugin = %plugin, "Plugin stopped");
        }
    }
}

async fn forward_stderr(plugin: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(plugin = %plugin, "{line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(plugin = %plugin, error = %e, "Stopped reading plugin stderr");
                break;
            }
        }
    }
}
