//! WebSocket sessions on `/api/ws`.
//!
//! Client -> server: `{"type": "subscribe", "targets": [...]}` (`["all"]` for
//! everything) and `{"type": "execute_command", "target", "command_name"}`.
//! Server -> client: see `broadcast::ServerEvent`.

use crate::app::AppState;
use crate::broadcast::{ConnectionId, ServerEvent, Subscription, ALL_TARGETS};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

pub async fn ws_handler(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| session(socket, app))
}

async fn session(socket: WebSocket, app: AppState) {
    let (id, mut outbound) = app.broadcaster.connect();
    let (mut sink, mut stream) = socket.split();

    // ends when the broadcaster drops this connection's sender
    let writer = tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            if sink.send(Message::Text(msg.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    app.broadcaster.send_to(id, &ServerEvent::TargetsList(app.target_views()));

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&app, id, text.as_str()),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("client {id} read error: {e}");
                break;
            }
        }
    }

    app.broadcaster.disconnect(id);
    if writer.await.is_err() {
        warn!("client {id} writer ended abnormally");
    }
}

fn all_targets() -> Vec<String> {
    vec![ALL_TARGETS.to_string()]
}

#[derive(Debug, Deserialize)]
struct SubscribeMessage {
    #[serde(default = "all_targets")]
    targets: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ExecuteMessage {
    #[serde(default)]
    target: String,
    #[serde(default)]
    command_name: String,
}

fn handle_text(app: &AppState, id: ConnectionId, text: &str) {
    let message: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => {
            warn!("client {id} sent invalid json");
            app.broadcaster.send_to(id, &ServerEvent::error("Invalid JSON message"));
            return;
        }
    };
    let kind = message.get("type").and_then(|t| t.as_str()).unwrap_or_default().to_string();

    match kind.as_str() {
        "subscribe" => {
            let targets = serde_json::from_value::<SubscribeMessage>(message)
                .map(|m| m.targets)
                .unwrap_or_else(|_| all_targets());
            info!("client {id} subscribed to {targets:?}");
            app.broadcaster.subscribe(id, Subscription::from_names(targets));
            app.broadcaster.send_to(id, &ServerEvent::TargetsList(app.target_views()));
        }
        "execute_command" => {
            let msg = serde_json::from_value::<ExecuteMessage>(message).unwrap_or(ExecuteMessage {
                target: String::new(),
                command_name: String::new(),
            });
            if msg.target.is_empty() || msg.command_name.is_empty() {
                app.broadcaster.send_to(id, &ServerEvent::error("Missing target or command_name"));
                return;
            }
            let app = app.clone();
            tokio::spawn(async move {
                execute(&app, id, &msg.target, &msg.command_name).await;
            });
        }
        other => {
            warn!("client {id} sent unknown message type '{other}'");
            app.broadcaster
                .send_to(id, &ServerEvent::error(format!("Unknown message type: {other}")));
        }
    }
}

async fn execute(app: &AppState, id: ConnectionId, target: &str, command_name: &str) {
    match app.run_command(target, command_name).await {
        // subscribers of the target already got it from run_command
        Ok(output) if !app.broadcaster.is_subscribed(id, target) => {
            app.broadcaster.send_to(
                id,
                &ServerEvent::CommandOutput { target: target.to_string(), output },
            );
        }
        Ok(_) => {}
        Err(e) => {
            app.broadcaster.send_to(id, &ServerEvent::error(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, PresetCatalog};
    use crate::coordinator::MockCoordinator;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    async fn app() -> (AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.files.presets_file = dir.path().join("presets.json").display().to_string();
        let catalog = PresetCatalog::from_yaml(
            "commands:\n  - name: uptime\n    command: uptime\n",
        )
        .unwrap();
        let app = AppState::build(config, Arc::new(MockCoordinator::demo_fleet()), catalog);
        app.refresh_once().await;
        (app, dir)
    }

    async fn next_json(rx: &mut Receiver<std::sync::Arc<str>>) -> serde_json::Value {
        let msg = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&msg).unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_replies_with_targets_list() {
        let (app, _dir) = app().await;
        let (id, mut rx) = app.broadcaster.connect();
        handle_text(&app, id, r#"{"type": "subscribe", "targets": ["dut-1"]}"#);

        let msg = next_json(&mut rx).await;
        assert_eq!(msg["type"], "targets_list");
        assert_eq!(msg["data"].as_array().unwrap().len(), 3);
        assert!(app.broadcaster.is_subscribed(id, "dut-1"));
        assert!(!app.broadcaster.is_subscribed(id, "dut-2"));
    }

    #[tokio::test]
    async fn test_bad_messages_get_errors() {
        let (app, _dir) = app().await;
        let (id, mut rx) = app.broadcaster.connect();

        handle_text(&app, id, "not json");
        assert_eq!(next_json(&mut rx).await["data"]["detail"], "Invalid JSON message");

        handle_text(&app, id, r#"{"type": "dance"}"#);
        assert_eq!(next_json(&mut rx).await["data"]["detail"], "Unknown message type: dance");

        handle_text(&app, id, r#"{"type": "execute_command", "target": "dut-1"}"#);
        assert_eq!(next_json(&mut rx).await["data"]["detail"], "Missing target or command_name");
    }

    #[tokio::test]
    async fn test_execute_command_delivers_once() {
        let (app, _dir) = app().await;
        let (id, mut rx) = app.broadcaster.connect();
        handle_text(&app, id, r#"{"type": "execute_command", "target": "dut-1", "command_name": "uptime"}"#);

        let msg = next_json(&mut rx).await;
        assert_eq!(msg["type"], "command_output");
        assert_eq!(msg["data"]["target"], "dut-1");
        assert_eq!(msg["data"]["output"]["output"], "uptime @ dut-1\n");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_execute_command_unsubscribed_still_answered() {
        let (app, _dir) = app().await;
        let (id, mut rx) = app.broadcaster.connect();
        app.broadcaster.subscribe(id, Subscription::from_names(["dut-9"]));
        handle_text(&app, id, r#"{"type": "execute_command", "target": "dut-1", "command_name": "uptime"}"#);
        assert_eq!(next_json(&mut rx).await["type"], "command_output");

        handle_text(&app, id, r#"{"type": "execute_command", "target": "dut-2", "command_name": "uptime"}"#);
        let err = next_json(&mut rx).await;
        assert_eq!(err["type"], "error");
        assert!(err["data"]["detail"].as_str().unwrap().contains("developer@host"));
    }
}
