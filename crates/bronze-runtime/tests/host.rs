//! End-to-end tests of the host: commands, dialogs, confirmations and
//! out-of-process plugins driven through `BronzeRuntime`.

use std::sync::Arc;
use std::time::Duration;

use bronze_core::{ChannelReplySink, Event, OutboundReply, Target};
use bronze_framework::{Command, Invocation, SessionKey, into_handler};
use bronze_runtime::{BronzeConfig, BronzeRuntime};
use tokio::sync::mpsc;
use tokio::time::timeout;

fn host(config: BronzeConfig) -> (BronzeRuntime, mpsc::Receiver<OutboundReply>) {
    let (sink, rx) = ChannelReplySink::new(32);
    let runtime = BronzeRuntime::builder()
        .config(config)
        .reply_sink(Arc::new(sink))
        .without_logging()
        .build()
        .unwrap();
    (runtime, rx)
}

async fn next_reply(rx: &mut mpsc::Receiver<OutboundReply>) -> OutboundReply {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no reply within 5s")
        .expect("reply channel closed")
}

#[tokio::test]
async fn test_command_reply_goes_to_group() {
    let (runtime, mut rx) = host(BronzeConfig::default());
    runtime
        .register_command(
            Command::new("echo").trigger("/echo"),
            into_handler(|inv: Invocation| async move { Ok(Some(inv.args().join(" "))) }),
        )
        .unwrap();

    let handled = runtime
        .handle(Event::message("u1", r#"/echo "hello world" again"#).in_group("g1"))
        .await;
    assert!(handled);

    let reply = next_reply(&mut rx).await;
    assert_eq!(reply.target, Target::group("g1"));
    assert_eq!(reply.text, "hello world again");
}

#[tokio::test]
async fn test_failing_command_sends_configured_apology() {
    let mut config = BronzeConfig::default();
    config.dispatch.apology = "{name} is broken ({error})".into();
    let (runtime, mut rx) = host(config);
    runtime
        .register_command(
            Command::new("boom").trigger("/boom"),
            into_handler(|_inv: Invocation| async move { Err("no fuel".into()) }),
        )
        .unwrap();

    assert!(runtime.handle(Event::message("u1", "/boom")).await);
    assert_eq!(next_reply(&mut rx).await.text, "boom is broken (no fuel)");
}

#[tokio::test]
async fn test_blocklisted_user_is_ignored() {
    let mut config = BronzeConfig::default();
    config.dispatch.blocklist = vec!["spammer".into()];
    let (runtime, mut rx) = host(config);
    runtime
        .register_command(
            Command::new("ping").trigger("/ping"),
            into_handler(|_inv: Invocation| async move { Ok(Some("pong".into())) }),
        )
        .unwrap();

    assert!(!runtime.handle(Event::message("spammer", "/ping")).await);
    assert!(runtime.handle(Event::message("friend", "/ping")).await);

    let reply = next_reply(&mut rx).await;
    assert_eq!(reply.target, Target::private("friend"));
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_dialog_routes_follow_up_message() {
    let (runtime, mut rx) = host(BronzeConfig::default());
    let dialogs = runtime.dialogs().clone();
    runtime
        .register_command(
            Command::new("order").trigger("/order"),
            into_handler(move |inv: Invocation| {
                let dialogs = dialogs.clone();
                async move {
                    let key = SessionKey::new(inv.user_id(), inv.group_id());
                    match inv.session() {
                        None => {
                            dialogs.start_dialog(&key, "host", "order", "size").await?;
                            Ok(Some("What size?".into()))
                        }
                        Some(session) => {
                            assert_eq!(session.step.as_deref(), Some("size"));
                            dialogs.finish(&key).await?;
                            Ok(Some(format!("Ordered {}", inv.text())))
                        }
                    }
                }
            }),
        )
        .unwrap();

    assert!(runtime.handle(Event::message("u1", "/order")).await);
    assert_eq!(next_reply(&mut rx).await.text, "What size?");

    // Someone else in another conversation is unaffected.
    assert!(!runtime.handle(Event::message("u2", "large")).await);

    assert!(runtime.handle(Event::message("u1", "large")).await);
    assert_eq!(next_reply(&mut rx).await.text, "Ordered large");

    assert!(!runtime.handle(Event::message("u1", "large")).await);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_confirmation_guards_action() {
    let (runtime, mut rx) = host(BronzeConfig::default());
    let dialogs = runtime.dialogs().clone();
    runtime
        .register_command(
            Command::new("reset").trigger("/reset"),
            into_handler(move |inv: Invocation| {
                let dialogs = dialogs.clone();
                async move {
                    if inv.is_confirmed() {
                        return Ok(Some("Reset done".into()));
                    }
                    let key = SessionKey::new(inv.user_id(), inv.group_id());
                    let code = dialogs.start_confirmation(&key, "host", "reset").await?;
                    Ok(Some(format!("Reply {code} to confirm")))
                }
            }),
        )
        .unwrap();

    assert!(runtime.handle(Event::message("u1", "/reset").in_group("g1")).await);
    let prompt = next_reply(&mut rx).await.text;
    let code = prompt
        .strip_prefix("Reply ")
        .and_then(|rest| rest.strip_suffix(" to confirm"))
        .unwrap()
        .to_string();

    // A wrong answer falls through and keeps the confirmation pending.
    assert!(!runtime.handle(Event::message("u1", "nope").in_group("g1")).await);
    let key = SessionKey::new("u1", Some("g1"));
    assert!(runtime.dialogs().current(&key).await.unwrap().is_some());

    let answer = format!("  {code} ");
    assert!(runtime.handle(Event::message("u1", answer).in_group("g1")).await);
    assert_eq!(next_reply(&mut rx).await.text, "Reset done");
    assert!(runtime.dialogs().current(&key).await.unwrap().is_none());
}

#[tokio::test]
async fn test_submit_runs_events_concurrently() {
    let mut config = BronzeConfig::default();
    config.dispatch.max_concurrent_events = 2;
    let (runtime, mut rx) = host(config);
    runtime
        .register_command(
            Command::new("slow").trigger("/slow"),
            into_handler(|inv: Invocation| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(Some(inv.user_id().to_string()))
            }),
        )
        .unwrap();
    runtime.start().await.unwrap();

    let handles: Vec<_> = (0..6)
        .map(|i| runtime.submit(Event::message(format!("u{i}"), "/slow")).unwrap())
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap());
    }

    let mut users = Vec::new();
    while let Ok(reply) = rx.try_recv() {
        users.push(reply.text);
    }
    users.sort();
    assert_eq!(users, ["u0", "u1", "u2", "u3", "u4", "u5"]);

    runtime.shutdown().await;
    assert_eq!(runtime.stats().events_handled, 6);
}

#[cfg(unix)]
mod plugins {
    use bronze_runtime::{CommandConfig, PluginConfig};

    use super::*;

    /// Asks for a city on the first call, answers and closes the dialog on
    /// the follow-up.
    const WEATHER: &str = r#"while read -r line; do
  case "$line" in
    *'"name":"command"'*)
      id=$(printf '%s' "$line" | sed 's/.*"correlationId":"\([^"]*\)".*/\1/')
      case "$line" in
        *'"session":null'*)
          printf '{"id":"%s","ok":true,"actions":[{"type":"start-dialog","text":"Which city?","payload":{"action":"weather","step":"city"}}]}\n' "$id"
          ;;
        *)
          city=$(printf '%s' "$line" | sed 's/.*"args":\["\([^"]*\)".*/\1/')
          printf '{"id":"%s","ok":true,"actions":[{"type":"end-dialog","text":"Sunny in %s"}]}\n' "$id" "$city"
          ;;
      esac
      ;;
  esac
done"#;

    fn weather_config() -> BronzeConfig {
        let mut plugin = PluginConfig::new("sh");
        plugin.args = vec!["-c".into(), WEATHER.into()];
        plugin.commands.push(CommandConfig {
            name: "weather".into(),
            triggers: vec!["/weather".into()],
            description: Some("Forecast for a city".into()),
        });

        let mut config = BronzeConfig::default();
        config.plugins.insert("weather".into(), plugin);
        config
    }

    #[tokio::test]
    async fn test_plugin_dialog_round_trip() {
        let (runtime, mut rx) = host(weather_config());
        assert_eq!(runtime.start().await.unwrap(), 1);
        assert!(runtime.registry().contains("weather"));

        assert!(runtime.handle(Event::message("u1", "/weather").in_group("g1")).await);
        let prompt = next_reply(&mut rx).await;
        assert_eq!(prompt.target, Target::group("g1"));
        assert_eq!(prompt.text, "Which city?");

        assert!(runtime.handle(Event::message("u1", "Paris").in_group("g1")).await);
        assert_eq!(next_reply(&mut rx).await.text, "Sunny in Paris");

        let key = SessionKey::new("u1", Some("g1"));
        assert!(runtime.dialogs().current(&key).await.unwrap().is_none());

        let stats = runtime.stats();
        assert_eq!(stats.plugins_running, 1);
        assert_eq!(stats.commands, 1);

        runtime.shutdown().await;
        let plugin = runtime.plugin("weather").unwrap();
        assert!(plugin.state().is_terminal());
        assert_eq!(runtime.stats().plugins_running, 0);
    }

    #[tokio::test]
    async fn test_disabled_plugin_is_not_started() {
        let mut config = weather_config();
        if let Some(plugin) = config.plugins.get_mut("weather") {
            plugin.enabled = false;
        }
        let (runtime, _rx) = host(config);

        assert_eq!(runtime.start().await.unwrap(), 0);
        assert!(!runtime.registry().contains("weather"));
        runtime.shutdown().await;
    }
}
