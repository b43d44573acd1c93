//! Configuration schema definitions.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use bronze_adapter_process::PluginSpec;
use bronze_core::EventKind;
use bronze_framework::{Command, DEFAULT_APOLOGY, DEFAULT_KEY_PREFIX};

/// Root configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BronzeConfig {
    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Session and dialog settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Event dispatch settings.
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Out-of-process plugins, keyed by plugin id.
    #[serde(default)]
    pub plugins: BTreeMap<String, PluginConfig>,
}

// =============================================================================
// Logging
// =============================================================================

/// Log verbosity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }

    pub fn to_tracing_level(self) -> tracing::Level {
        match self {
            Self::Trace => tracing::Level::TRACE,
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error => tracing::Level::ERROR,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(Self::Trace),
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" | "warning" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

/// Log line layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Full,
    Pretty,
    /// Requires the `json-log` feature; falls back to `full` without it.
    Json,
}

/// Where log lines go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
}

/// When file output rolls over to a new file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

/// Which span lifecycle events are logged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpanEventConfig {
    #[serde(default)]
    pub new: bool,
    #[serde(default)]
    pub enter: bool,
    #[serde(default)]
    pub exit: bool,
    #[serde(default)]
    pub close: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: LogLevel,

    #[serde(default)]
    pub format: LogFormat,

    #[serde(default)]
    pub output: LogOutput,

    /// Log file for `output = "file"`.
    #[serde(default)]
    pub file_path: Option<PathBuf>,

    #[serde(default)]
    pub rotation: LogRotation,

    /// Rotated files to keep (0 keeps all).
    #[serde(default = "default_max_files")]
    pub max_files: u32,

    #[serde(default)]
    pub thread_ids: bool,

    /// Include file and line of the call site.
    #[serde(default)]
    pub file_location: bool,

    #[serde(default)]
    pub span_events: SpanEventConfig,

    /// Per-module levels, e.g. `bronze_adapter_process = "debug"`.
    #[serde(default)]
    pub filters: HashMap<String, LogLevel>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::default(),
            format: LogFormat::default(),
            output: LogOutput::default(),
            file_path: None,
            rotation: LogRotation::default(),
            max_files: default_max_files(),
            thread_ids: false,
            file_location: false,
            span_events: SpanEventConfig::default(),
            filters: HashMap::new(),
        }
    }
}

fn default_max_files() -> u32 {
    5
}

// =============================================================================
// Sessions and dispatch
// =============================================================================

/// Session store and dialog settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lifetime of a dialog session, restarted on every step.
    #[serde(default = "default_session_ttl")]
    pub ttl_secs: u64,

    /// Lifetime of a pending confirmation code.
    #[serde(default = "default_confirmation_ttl")]
    pub confirmation_ttl_secs: u64,

    /// Prefix of every session key in the key/value store.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the in-memory store drops expired entries (0 disables).
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl SessionConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn confirmation_ttl(&self) -> Duration {
        Duration::from_secs(self.confirmation_ttl_secs)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_session_ttl(),
            confirmation_ttl_secs: default_confirmation_ttl(),
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_session_ttl() -> u64 {
    300
}

fn default_confirmation_ttl() -> u64 {
    120
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

/// Event dispatch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Reply sent when a capability fails. `{name}` and `{error}` are
    /// substituted.
    #[serde(default = "default_apology")]
    pub apology: String,

    /// Events processed at the same time by `submit`.
    #[serde(default = "default_max_concurrent_events")]
    pub max_concurrent_events: usize,

    /// User ids whose events are dropped before any processing.
    #[serde(default)]
    pub blocklist: Vec<String>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            apology: default_apology(),
            max_concurrent_events: default_max_concurrent_events(),
            blocklist: Vec::new(),
        }
    }
}

fn default_apology() -> String {
    DEFAULT_APOLOGY.to_string()
}

fn default_max_concurrent_events() -> usize {
    256
}

// =============================================================================
// Plugins
// =============================================================================

/// One out-of-process plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Program to run.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,

    /// Commands the plugin serves.
    #[serde(default)]
    pub commands: Vec<CommandConfig>,

    /// Event types forwarded to the plugin.
    #[serde(default)]
    pub events: Vec<EventKind>,
}

impl PluginConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            enabled: true,
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            request_timeout_ms: default_request_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            max_line_bytes: default_max_line_bytes(),
            commands: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Launch description for the plugin with the given id.
    pub fn to_spec(&self, id: &str) -> PluginSpec {
        let mut spec = PluginSpec::new(id, self.command.as_str())
            .args(self.args.iter().cloned())
            .request_timeout(Duration::from_millis(self.request_timeout_ms))
            .shutdown_grace(Duration::from_millis(self.shutdown_grace_ms))
            .max_line_bytes(self.max_line_bytes);
        spec.env = self.env.clone();
        spec.cwd.clone_from(&self.cwd);
        spec
    }

    pub fn to_commands(&self) -> Vec<Command> {
        self.commands.iter().map(CommandConfig::to_command).collect()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    3000
}

fn default_max_line_bytes() -> usize {
    1024 * 1024
}

/// A command declared by a plugin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandConfig {
    pub name: String,

    /// Text prefixes; none makes an intent reachable only by name.
    #[serde(default)]
    pub triggers: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl CommandConfig {
    pub fn to_command(&self) -> Command {
        let mut command = Command::new(self.name.as_str()).triggers(self.triggers.iter().cloned());
        if let Some(description) = &self.description {
            command = command.description(description.as_str());
        }
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BronzeConfig::default();
        assert_eq!(config.session.ttl(), Duration::from_secs(300));
        assert_eq!(config.session.confirmation_ttl(), Duration::from_secs(120));
        assert_eq!(config.session.key_prefix, "session");
        assert_eq!(config.dispatch.apology, "Sorry, {name} failed: {error}");
        assert_eq!(config.dispatch.max_concurrent_events, 256);
        assert!(config.plugins.is_empty());
    }

    #[test]
    fn test_plugin_to_spec() {
        let mut plugin = PluginConfig::new("python3");
        plugin.args = vec!["weather.py".into()];
        plugin.request_timeout_ms = 250;
        plugin.commands.push(CommandConfig {
            name: "weather".into(),
            triggers: vec!["/weather".into()],
            description: Some("Forecast".into()),
        });

        let spec = plugin.to_spec("weather");
        assert_eq!(spec.id, "weather");
        assert_eq!(spec.args, ["weather.py"]);
        assert_eq!(spec.request_timeout, Duration::from_millis(250));
        assert_eq!(spec.shutdown_grace, Duration::from_secs(3));

        let commands = plugin.to_commands();
        assert_eq!(commands[0].triggers, ["/weather"]);
        assert_eq!(commands[0].description.as_deref(), Some("Forecast"));
    }

    #[test]
    fn test_log_level_parse() {
        assert_eq!("WARNING".parse::<LogLevel>(), Ok(LogLevel::Warn));
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
