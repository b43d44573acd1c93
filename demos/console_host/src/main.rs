//! Console Host Example
//!
//! Runs a Bronze host whose "gateway" is the terminal. Every stdin line is
//! one inbound event and every reply is printed to stdout.
//!
//! # Input
//!
//! - A JSON object is read as a normalized event:
//!   `{"type":"message","userId":"u1","groupId":"g1","text":"/weather"}`
//! - Any other line is a message from `--user` (in `--group`, if given).
//!
//! # Usage
//!
//! ```bash
//! cargo run --package console-host -- --config demos/console_host/bronze.toml
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use bronze::core::{ChannelReplySink, OutboundReply};
use bronze::prelude::*;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(about = "Drive a Bronze host from the terminal")]
struct Args {
    /// Configuration file (defaults to bronze.toml in the current directory).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Configuration profile.
    #[arg(short, long)]
    profile: Option<String>,

    /// Sender of plain-text lines.
    #[arg(short, long, default_value = "console")]
    user: String,

    /// Group plain-text lines are sent in.
    #[arg(short, long)]
    group: Option<String>,
}

// ============================================================================
// In-process commands
// ============================================================================

fn register_builtins(runtime: &BronzeRuntime) -> Result<()> {
    runtime.register_command(
        Command::new("ping").trigger("/ping").description("Pong!"),
        into_handler(|_inv: Invocation| async move { Ok(Some("Pong! 🏓".to_string())) }),
    )?;

    runtime.register_command(
        Command::new("echo").trigger("/echo").description("Echo the arguments"),
        into_handler(|inv: Invocation| async move { Ok(Some(inv.args().join(" "))) }),
    )?;

    let registry = Arc::clone(runtime.registry());
    runtime.register_command(
        Command::new("help").trigger("/help").description("List commands"),
        into_handler(move |_inv: Invocation| {
            let registry = Arc::clone(&registry);
            async move {
                let mut lines = vec!["Commands:".to_string()];
                for command in registry.commands() {
                    let Some(trigger) = command.triggers.first() else {
                        continue;
                    };
                    let description = command.description.as_deref().unwrap_or("");
                    lines.push(format!("  {trigger:<12} {description}"));
                }
                Ok(Some(lines.join("\n")))
            }
        }),
    )?;

    // Destructive commands ask for a confirmation code first.
    let dialogs = runtime.dialogs().clone();
    runtime.register_command(
        Command::new("forget").trigger("/forget").description("Forget everything (asks first)"),
        into_handler(move |inv: Invocation| {
            let dialogs = dialogs.clone();
            async move {
                if inv.is_confirmed() {
                    return Ok(Some("Done. I remember nothing.".to_string()));
                }
                let key = SessionKey::new(inv.user_id(), inv.group_id());
                let code = dialogs.start_confirmation(&key, "console", "forget").await?;
                Ok(Some(format!("Really? Reply {code} to confirm.")))
            }
        }),
    )?;

    Ok(())
}

// ============================================================================
// Terminal gateway
// ============================================================================

fn parse_line(line: &str, args: &Args, seq: u64) -> Option<Event> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    if line.starts_with('{') {
        return match serde_json::from_str::<Event>(line) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed event");
                None
            }
        };
    }

    let mut event = Event::message(args.user.as_str(), line)
        .with_id(format!("console-{seq}"))
        .with_platform("console");
    if let Some(group) = &args.group {
        event = event.in_group(group.as_str());
    }
    Some(event)
}

async fn print_replies(mut rx: mpsc::Receiver<OutboundReply>) {
    while let Some(reply) = rx.recv().await {
        println!("[{}] {}", reply.target, reply.text);
    }
}

async fn read_events(runtime: BronzeRuntime, args: Args) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut seq = 0;

    while let Some(line) = lines.next_line().await.context("reading stdin")? {
        seq += 1;
        let Some(event) = parse_line(&line, &args, seq) else {
            continue;
        };
        runtime.submit(event)?;
    }

    info!("End of input");
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (sink, rx) = ChannelReplySink::new(64);
    let mut builder = BronzeRuntime::builder().reply_sink(Arc::new(sink));
    if let Some(path) = &args.config {
        builder = builder.config_file(path);
    }
    if let Some(profile) = &args.profile {
        builder = builder.profile(profile.as_str());
    }
    let runtime = builder.build()?;

    register_builtins(&runtime)?;
    let printer = tokio::spawn(print_replies(rx));

    let input = read_events(runtime.clone(), args);
    runtime
        .run_until(async {
            tokio::select! {
                result = input => {
                    if let Err(e) = result {
                        warn!(error = %e, "Input stopped");
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down");
                }
            }
        })
        .await?;

    info!(stats = %runtime.stats(), "Bye");
    drop(runtime);
    // Let the printer drain what is still queued.
    let _ = tokio::time::timeout(Duration::from_secs(1), printer).await;
    Ok(())
}
