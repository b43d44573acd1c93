//! Host orchestration.
//!
//! [`BronzeRuntime`] wires the configured pieces together: one [`Registry`],
//! one [`Pipeline`], one [`DialogManager`] and the supervised plugin
//! processes. Gateways hand it events through [`BronzeRuntime::submit`] (one
//! task per event, bounded) or [`BronzeRuntime::handle`] (inline).
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use bronze_runtime::BronzeRuntime;
//!
//! let runtime = BronzeRuntime::builder()
//!     .config_file("bronze.toml")
//!     .reply_sink(gateway.clone())
//!     .build()?;
//!
//! runtime.start().await?;
//! runtime.submit(event)?;
//! runtime.shutdown().await;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::signal;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use bronze_adapter_process::{ActionExecutor, PluginProcess, register_plugin};
use bronze_core::{EntityResolver, Event, EventKind, KvStore, LogReplySink, PassthroughResolver, ReplySink};
use bronze_framework::{
    BlocklistStage, BoxedHandler, BoxedListener, BoxedStage, Command, DialogManager, DialogStage,
    MemoryKvStore, Pipeline, Registry, SessionStore, Stage, TracingStage,
};

use crate::config::{BronzeConfig, ConfigLoader, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    ShutDown,
}

#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    handled: AtomicU64,
    unhandled: AtomicU64,
}

struct RuntimeInner {
    config: BronzeConfig,
    registry: Arc<Registry>,
    pipeline: Pipeline,
    dialogs: DialogManager,
    replies: Arc<dyn ReplySink>,
    /// Set when sessions live in the built-in store, which needs sweeping.
    memory: Option<MemoryKvStore>,
    plugins: RwLock<BTreeMap<String, PluginProcess>>,
    state: Mutex<RunState>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
    tracker: TaskTracker,
    permits: Arc<Semaphore>,
    counters: Counters,
}

/// The Bronze host.
///
/// Cloning is cheap; clones share the same registry, pipeline and plugins.
#[derive(Clone)]
pub struct BronzeRuntime {
    inner: Arc<RuntimeInner>,
}

impl BronzeRuntime {
    /// Creates a runtime builder.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Builds a runtime from an already loaded configuration, with the
    /// default collaborators.
    pub fn from_config(config: BronzeConfig) -> RuntimeResult<Self> {
        RuntimeBuilder::new().config(config).build()
    }

    pub fn config(&self) -> &BronzeConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    pub fn dialogs(&self) -> &DialogManager {
        &self.inner.dialogs
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.inner.pipeline
    }

    /// Registers an in-process command next to the plugin-provided ones.
    pub fn register_command(&self, command: Command, handler: BoxedHandler) -> RuntimeResult<()> {
        self.inner.registry.register_command(command, handler)?;
        Ok(())
    }

    /// Registers an in-process event listener.
    pub fn register_event(&self, kind: EventKind, name: impl Into<String>, listener: BoxedListener) {
        self.inner.registry.register_event(kind, name, listener);
    }

    /// The running plugin with this id, if it was started.
    pub fn plugin(&self, id: &str) -> Option<PluginProcess> {
        self.inner.plugins.read().get(id).cloned()
    }

    /// Ids of the plugins started by [`start`](Self::start).
    pub fn plugin_ids(&self) -> Vec<String> {
        self.inner.plugins.read().keys().cloned().collect()
    }

    pub fn is_running(&self) -> bool {
        *self.inner.state.lock() == RunState::Running
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Spawns every enabled plugin and registers its capabilities.
    ///
    /// A plugin that fails to spawn or register is logged and skipped.
    /// Returns how many plugins are running.
    pub async fn start(&self) -> RuntimeResult<usize> {
        {
            let mut state = self.inner.state.lock();
            match *state {
                RunState::Idle => *state = RunState::Running,
                RunState::Running => return Err(RuntimeError::InvalidState("already running")),
                RunState::ShutDown => return Err(RuntimeError::InvalidState("shut down")),
            }
        }

        info!("Starting Bronze runtime");
        self.start_sweeper();

        for (id, plugin) in self.inner.config.plugins.iter() {
            if !plugin.enabled {
                debug!(plugin = %id, "Plugin disabled, skipping");
                continue;
            }
            if let Err(e) = self.start_plugin(id).await {
                error!(plugin = %id, error = %e, "Failed to start plugin");
            }
        }

        let running = self.inner.plugins.read().len();
        info!(
            plugins = running,
            commands = self.inner.registry.command_count(),
            listeners = self.inner.registry.listener_count(),
            "Runtime started"
        );
        Ok(running)
    }

    async fn start_plugin(&self, id: &str) -> RuntimeResult<()> {
        let plugin = self
            .inner
            .config
            .plugins
            .get(id)
            .ok_or_else(|| RuntimeError::PluginNotFound(id.to_string()))?;

        let executor = ActionExecutor::new(
            Arc::clone(&self.inner.registry),
            Arc::clone(&self.inner.replies),
        )
        .with_dialogs(self.inner.dialogs.clone());

        let process = PluginProcess::spawn(plugin.to_spec(id), Arc::new(executor))
            .map_err(|e| RuntimeError::plugin(id, e))?;

        let registered = match register_plugin(
            &self.inner.registry,
            process.clone(),
            plugin.to_commands(),
            plugin.events.iter().copied(),
        ) {
            Ok(count) => count,
            Err(e) => {
                if let Err(stop_err) = process.stop().await {
                    warn!(plugin = %id, error = %stop_err, "Failed to stop rejected plugin");
                }
                return Err(e.into());
            }
        };

        info!(
            plugin = %id,
            pid = ?process.pid(),
            commands = registered,
            events = plugin.events.len(),
            "Plugin started"
        );
        self.inner.plugins.write().insert(id.to_string(), process);
        Ok(())
    }

    fn start_sweeper(&self) {
        let Some(memory) = &self.inner.memory else {
            return;
        };
        let interval = self.inner.config.session.sweep_interval_secs;
        if interval == 0 {
            return;
        }
        let handle = memory.spawn_sweeper(std::time::Duration::from_secs(interval));
        *self.inner.sweeper.lock() = Some(handle);
    }

    /// Waits for in-flight events, then stops every plugin concurrently.
    ///
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        {
            let mut state = self.inner.state.lock();
            if *state == RunState::ShutDown {
                return;
            }
            *state = RunState::ShutDown;
        }

        info!("Stopping Bronze runtime");

        self.inner.tracker.close();
        self.inner.tracker.wait().await;

        let plugins: Vec<(String, PluginProcess)> = self
            .inner
            .plugins
            .read()
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();

        let results = join_all(plugins.iter().map(|(id, process)| async move {
            (id, process.stop().await)
        }))
        .await;

        for (id, result) in results {
            match result {
                Ok(state) => debug!(plugin = %id, state = %state, "Plugin stopped"),
                Err(e) => warn!(plugin = %id, error = %e, "Error while stopping plugin"),
            }
        }

        if let Some(sweeper) = self.inner.sweeper.lock().take() {
            sweeper.abort();
        }

        info!(stats = %self.stats(), "Runtime stopped");
    }

    /// Starts, waits for `shutdown` to resolve, then shuts down.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: std::future::Future<Output = ()>,
    {
        self.start().await?;
        shutdown.await;
        self.shutdown().await;
        Ok(())
    }

    /// Starts and runs until Ctrl+C or SIGTERM.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start().await?;
        info!("Bronze runtime is now running. Press Ctrl+C to stop.");
        wait_for_shutdown().await;
        self.shutdown().await;
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Runs one event through the pipeline on the current task.
    pub async fn handle(&self, event: impl Into<Arc<Event>>) -> bool {
        process_event(&self.inner, event.into()).await
    }

    /// Runs one event on its own task.
    ///
    /// At most `dispatch.max_concurrent_events` events are processed at the
    /// same time; the rest wait for a permit. Fails once the runtime has been
    /// shut down.
    pub fn submit(&self, event: impl Into<Arc<Event>>) -> RuntimeResult<JoinHandle<bool>> {
        if *self.inner.state.lock() == RunState::ShutDown {
            return Err(RuntimeError::InvalidState("shut down"));
        }

        let event = event.into();
        let inner = Arc::clone(&self.inner);
        Ok(self.inner.tracker.spawn(async move {
            let Ok(_permit) = Arc::clone(&inner.permits).acquire_owned().await else {
                return false;
            };
            process_event(&inner, event).await
        }))
    }

    pub fn stats(&self) -> RuntimeStats {
        let counters = &self.inner.counters;
        let plugins = self.inner.plugins.read();
        RuntimeStats {
            events_received: counters.received.load(Ordering::Relaxed),
            events_handled: counters.handled.load(Ordering::Relaxed),
            events_unhandled: counters.unhandled.load(Ordering::Relaxed),
            events_in_flight: self.inner.tracker.len(),
            plugins_running: plugins.values().filter(|p| p.is_running()).count(),
            plugins_total: plugins.len(),
            commands: self.inner.registry.command_count(),
        }
    }
}

impl fmt::Debug for BronzeRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BronzeRuntime")
            .field("state", &*self.inner.state.lock())
            .field("pipeline", &self.inner.pipeline)
            .field("plugins", &self.plugin_ids())
            .finish_non_exhaustive()
    }
}

async fn process_event(inner: &RuntimeInner, event: Arc<Event>) -> bool {
    inner.counters.received.fetch_add(1, Ordering::Relaxed);
    let handled = inner.pipeline.execute(event).await;
    let counter = if handled {
        &inner.counters.handled
    } else {
        &inner.counters.unhandled
    };
    counter.fetch_add(1, Ordering::Relaxed);
    handled
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down");
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to register SIGTERM handler");
                if let Err(e) = signal::ctrl_c().await {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down");
    }
}

// =============================================================================
// RuntimeStats
// =============================================================================

/// Point-in-time counters of a runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeStats {
    pub events_received: u64,
    pub events_handled: u64,
    /// Events that went through the pipeline without being handled, including
    /// blocked and failed ones.
    pub events_unhandled: u64,
    /// Submitted events not finished yet.
    pub events_in_flight: usize,
    pub plugins_running: usize,
    pub plugins_total: usize,
    pub commands: usize,
}

impl fmt::Display for RuntimeStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "events {}/{} handled ({} in flight), plugins {}/{} running, {} commands",
            self.events_handled,
            self.events_received,
            self.events_in_flight,
            self.plugins_running,
            self.plugins_total,
            self.commands,
        )
    }
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for [`BronzeRuntime`].
///
/// Without an explicit [`config`](Self::config) the configuration is loaded
/// through a [`ConfigLoader`] with its default search. Collaborators
/// default to [`PassthroughResolver`], [`LogReplySink`] and an in-memory
/// session store.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    config: Option<BronzeConfig>,
    resolver: Option<Arc<dyn EntityResolver>>,
    replies: Option<Arc<dyn ReplySink>>,
    store: Option<Arc<dyn KvStore>>,
    stages: Vec<BoxedStage>,
    init_logging: bool,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            config: None,
            resolver: None,
            replies: None,
            store: None,
            stages: Vec::new(),
            init_logging: true,
        }
    }

    /// Sets a specific configuration file to load.
    pub fn config_file<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    /// Adds the `bronze.{profile}.toml` layer (e.g. "production").
    pub fn profile(mut self, profile: impl Into<String>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    /// Adds a search path for configuration files.
    pub fn search_path<P: AsRef<std::path::Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges additional configuration programmatically.
    pub fn merge(mut self, config: BronzeConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    /// Uses `config` as is, skipping file and environment loading.
    pub fn config(mut self, config: BronzeConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn resolver(mut self, resolver: Arc<dyn EntityResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Where replies and plugin messages are delivered.
    pub fn reply_sink(mut self, replies: Arc<dyn ReplySink>) -> Self {
        self.replies = Some(replies);
        self
    }

    /// Key/value store holding sessions.
    pub fn store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Adds a stage between the blocklist and the dialog router.
    pub fn stage<S: Stage + 'static>(mut self, stage: S) -> Self {
        self.stages.push(Arc::new(stage));
        self
    }

    pub fn stage_boxed(mut self, stage: BoxedStage) -> Self {
        self.stages.push(stage);
        self
    }

    /// Leaves the global tracing subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.init_logging = false;
        self
    }

    /// Loads and validates the configuration, then assembles the runtime.
    pub fn build(self) -> RuntimeResult<BronzeRuntime> {
        let config = match self.config {
            Some(config) => config,
            None => self.config_loader.load()?,
        };
        validate_config(&config)?;

        if self.init_logging {
            logging::init_from_config(&config.logging);
        }

        let (store, memory): (Arc<dyn KvStore>, _) = match self.store {
            Some(store) => (store, None),
            None => {
                let memory = MemoryKvStore::new();
                (Arc::new(memory.clone()), Some(memory))
            }
        };

        let sessions = SessionStore::with_prefix(store, config.session.key_prefix.as_str());
        let dialogs = DialogManager::new(sessions)
            .with_dialog_ttl(config.session.ttl())
            .with_confirmation_ttl(config.session.confirmation_ttl());

        let registry = Arc::new(Registry::with_apology(config.dispatch.apology.as_str()));
        let replies = self.replies.unwrap_or_else(|| Arc::new(LogReplySink));
        let resolver = self.resolver.unwrap_or_else(|| Arc::new(PassthroughResolver));

        let mut pipeline = Pipeline::builder(Arc::clone(&registry))
            .resolver(resolver)
            .reply_sink(Arc::clone(&replies))
            .stage(TracingStage);
        if !config.dispatch.blocklist.is_empty() {
            pipeline = pipeline.stage(BlocklistStage::new(config.dispatch.blocklist.iter().cloned()));
        }
        for stage in self.stages {
            pipeline = pipeline.stage_boxed(stage);
        }
        let pipeline = pipeline
            .stage(DialogStage::new(dialogs.clone(), Arc::clone(&registry)))
            .build();

        info!(
            log_level = %config.logging.level,
            plugins = config.plugins.len(),
            stages = ?pipeline.stage_names(),
            "Runtime initialized from configuration"
        );

        let permits = Arc::new(Semaphore::new(config.dispatch.max_concurrent_events));
        Ok(BronzeRuntime {
            inner: Arc::new(RuntimeInner {
                config,
                registry,
                pipeline,
                dialogs,
                replies,
                memory,
                plugins: RwLock::new(BTreeMap::new()),
                state: Mutex::new(RunState::Idle),
                sweeper: Mutex::new(None),
                tracker: TaskTracker::new(),
                permits,
                counters: Counters::default(),
            }),
        })
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}
