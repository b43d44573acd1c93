//! # Bronze
//!
//! The host core of a chat bot: it receives normalized events from a
//! messaging gateway, runs them through a pipeline, dispatches them to
//! capabilities and keeps per-conversation dialog state. Capabilities live in
//! process or in separate plugin programs speaking line-delimited JSON.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────┐  Event  ┌──────────────────────────────────────┐  reply  ┌───────────┐
//! │ Gateway │───────▶│ Pipeline: tracing ▸ blocklist ▸ ...  │───────▶│ ReplySink │
//! └─────────┘         │           ▸ dialog ▸ Registry        │         └───────────┘
//!                     └──────────────┬───────────────────────┘               ▲
//!                                    │ command / event                       │ actions
//!                             ┌──────▼──────┐   stdin/stdout (JSON lines)    │
//!                             │   Plugin    │────────────────────────────────┘
//!                             │  process    │
//!                             └─────────────┘
//! ```
//!
//! - **Core** ([`core`]): events, targets, entities and the collaborator
//!   traits for the entity service, reply delivery and key/value storage.
//! - **Framework** ([`framework`]): pipeline stages, the capability
//!   registry, sessions and the dialog/confirmation state machine.
//! - **Process adapter** ([`process`]): plugin child processes and their
//!   wire protocol.
//! - **Runtime** ([`runtime`]): configuration, logging and the host itself.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use bronze::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = BronzeRuntime::builder().build()?;
//!     runtime.register_command(
//!         Command::new("ping").trigger("/ping"),
//!         into_handler(|_inv: Invocation| async move { Ok(Some("pong".into())) }),
//!     )?;
//!
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` (default): read `bronze.toml`
//! - `yaml-config`: read `bronze.yaml`
//! - `json-log`: JSON log lines

pub use bronze_adapter_process as process;
pub use bronze_core as core;
pub use bronze_framework as framework;
pub use bronze_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use bronze::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use bronze_runtime::{BronzeConfig, BronzeRuntime, RuntimeBuilder, RuntimeError};

    // Capabilities
    pub use bronze_framework::{
        BoxError, Command, Invocation, Registry, into_handler, into_listener,
    };

    // Pipeline stages
    pub use bronze_framework::{Context, Next, Stage, StageResult, stage_fn};

    // Dialogs
    pub use bronze_framework::{DialogManager, Session, SessionKey};

    // Data model and collaborators
    pub use bronze_core::{
        Entities, EntityResolver, Event, EventKind, KvStore, ReplySink, Target, TargetKind,
    };

    // Plugins
    pub use bronze_adapter_process::{PluginProcess, PluginSpec, ProcessState};
}
