//! # Bronze Process Adapter
//!
//! Runs plugins as child processes and talks to them over stdin/stdout with
//! line-delimited JSON (see [`protocol`]).
//!
//! ## Architecture
//!
//! ```text
//! Registry ──command──▶ PluginProcess ──stdin──▶  plugin
//!    ▲                       │                      │
//!    │                  PluginConnection ◀─stdout───┘
//!    │                       │ actions
//!    └──── ActionExecutor ◀──┘ ──▶ ReplySink / DialogManager
//! ```
//!
//! - [`PluginConnection`]: correlation of requests and responses over any
//!   `AsyncRead`/`AsyncWrite` pair, with per-request deadlines.
//! - [`PluginProcess`]: spawns and supervises the child; crashes fail every
//!   in-flight request.
//! - [`ActionExecutor`]: performs the actions plugins send back.
//! - [`register_plugin`]: makes a plugin's commands and event subscriptions
//!   visible to the [`Registry`](bronze_framework::Registry).
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use bronze_adapter_process::{ActionExecutor, PluginProcess, PluginSpec, register_plugin};
//! use bronze_framework::Command;
//!
//! let executor = ActionExecutor::new(registry.clone(), reply_sink.clone());
//! let process = PluginProcess::spawn(
//!     PluginSpec::new("weather", "python3").arg("weather.py"),
//!     Arc::new(executor),
//! )?;
//! register_plugin(
//!     &registry,
//!     process.clone(),
//!     [Command::new("weather").trigger("/weather")],
//!     [],
//! )?;
//! ```

pub mod capability;
pub mod connection;
pub mod error;
pub mod executor;
pub mod process;
pub mod protocol;

pub use capability::{PluginChannel, command_handler, event_listener, register_plugin};
pub use connection::{
    ActionContext, ActionHandler, ConnectionOptions, DEFAULT_MAX_LINE_BYTES, DEFAULT_REQUEST_TIMEOUT,
    IgnoreActions, PluginConnection,
};
pub use error::{PluginError, PluginResult};
pub use executor::ActionExecutor;
pub use process::{DEFAULT_SHUTDOWN_GRACE, PluginProcess, PluginSpec, ProcessState};
pub use protocol::{Action, ActionKind, EventMessage, ResponseMessage};
