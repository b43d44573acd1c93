//! Echo Plugin Example
//!
//! A Bronze plugin is any program that reads event messages from stdin and
//! writes responses to stdout, one JSON object per line. This one serves two
//! commands:
//!
//! - `shout`: replies with its arguments in capitals
//! - `survey`: a two-step dialog driven by `start-dialog` / `end-dialog`
//!   actions
//!
//! Diagnostics go to stderr, which the host forwards to its log.

use std::io::{self, BufRead, Write};

use anyhow::Result;
use serde_json::{Value, json};

fn main() -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout().lock();

    for line in stdin.lock().lines() {
        let line = line?;
        let message: Value = match serde_json::from_str(&line) {
            Ok(message) => message,
            Err(e) => {
                eprintln!("echo-plugin: bad message: {e}");
                continue;
            }
        };

        let name = message["name"].as_str().unwrap_or_default();
        let payload = &message["payload"];

        match name {
            "command" => {
                let Some(id) = message["correlationId"].as_str() else {
                    continue;
                };
                let response = match command(payload) {
                    Ok(actions) => json!({"id": id, "ok": true, "actions": actions}),
                    Err(error) => json!({"id": id, "ok": false, "error": error}),
                };
                writeln!(stdout, "{response}")?;
                stdout.flush()?;
            }
            "event" => {
                let event = &payload["event"];
                eprintln!(
                    "echo-plugin: {} event from {}",
                    event["type"].as_str().unwrap_or("?"),
                    event["userId"].as_str().unwrap_or("?"),
                );
            }
            "shutdown" => break,
            other => eprintln!("echo-plugin: ignoring '{other}'"),
        }
    }

    Ok(())
}

fn command(payload: &Value) -> Result<Vec<Value>, String> {
    let args: Vec<&str> = payload["args"]
        .as_array()
        .map(|args| args.iter().filter_map(Value::as_str).collect())
        .unwrap_or_default();

    match payload["capability"].as_str() {
        Some("shout") if args.is_empty() => Err("nothing to shout".to_string()),
        Some("shout") => Ok(vec![reply(&args.join(" ").to_uppercase())]),
        Some("survey") => Ok(survey(payload, &args)),
        other => Err(format!("unknown capability {other:?}")),
    }
}

fn reply(text: &str) -> Value {
    json!({"type": "reply", "text": text})
}

fn survey(payload: &Value, args: &[&str]) -> Vec<Value> {
    let session = &payload["session"];
    let answer = args.join(" ");

    match session["step"].as_str() {
        None => vec![json!({
            "type": "start-dialog",
            "text": "Favourite colour?",
            "payload": {"action": "survey", "step": "colour"},
        })],
        Some("colour") => vec![json!({
            "type": "start-dialog",
            "text": "Favourite animal?",
            "payload": {"action": "survey", "step": "animal", "data": {"colour": answer}},
        })],
        Some(_) => {
            let colour = session["data"]["colour"].as_str().unwrap_or("plain");
            vec![json!({
                "type": "end-dialog",
                "text": format!("A {colour} {answer}, lovely."),
            })]
        }
    }
}
