/**
 * API REST - HTTP surface of the kernel
 *
 * ROUTES :
 * - /health, /api/health                     : liveness + kernel health
 * - /api/targets[/{name}[/commands|/preset]] : fleet view, per-target preset
 * - /api/targets/{name}/command              : ad-hoc command (409 if contended)
 * - /api/presets[/{id}]                      : preset catalog
 * - /api/scheduled-commands[/{name}/run]     : scheduled jobs, manual trigger
 * - /api/config/reload                       : re-read commands file
 * - /api/ws                                  : live session (see ws.rs)
 *
 * SECURITY :
 * When `http.api_key` is configured, every route except /health requires a
 * matching `x-api-key` header.
 */

use crate::app::{AppError, AppState, ReloadReport, TargetPreset};
use crate::health::KernelHealth;
use crate::models::{Command, CommandOutput, Preset, PresetSummary, ScheduledCommand, Target};
use crate::scheduler::{SchedulerError, TickReport};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::TargetNotFound(_)
            | AppError::CommandNotFound(_)
            | AppError::PresetNotFound(_)
            | AppError::Scheduler(SchedulerError::UnknownCommand(_)) => StatusCode::NOT_FOUND,
            AppError::Contended { .. } => StatusCode::CONFLICT,
            AppError::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse {
    detail: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("{self}");
        }
        (status, Json(ErrorResponse { detail: self.to_string() })).into_response()
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.config.http.api_key.as_deref().filter(|k| !k.is_empty()) else {
        return Ok(next.run(req).await);
    };
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("rejected {} {}: bad or missing api key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/health", get(get_health))
        .route("/api/targets", get(list_targets))
        .route("/api/targets/{name}", get(get_target))
        .route("/api/targets/{name}/commands", get(target_commands))
        .route("/api/targets/{name}/command", post(run_command))
        .route("/api/targets/{name}/preset", get(get_target_preset).put(set_target_preset))
        .route("/api/presets", get(list_presets))
        .route("/api/presets/{id}", get(get_preset))
        .route("/api/scheduled-commands", get(list_scheduled))
        .route("/api/scheduled-commands/{name}/run", post(run_scheduled))
        .route("/api/config/reload", post(reload_config))
        .route("/api/ws", get(crate::ws::ws_handler))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health())
}

async fn list_targets(State(app): State<AppState>) -> Json<Vec<Target>> {
    Json(app.target_views())
}

async fn get_target(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<Target>, AppError> {
    Ok(Json(app.target_view(&name)?))
}

async fn target_commands(
    State(app): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Vec<Command>>, AppError> {
    Ok(Json(app.commands_for_target(&name)?))
}

#[derive(Debug, Deserialize)]
struct RunCommandBody {
    command_name: String,
}

async fn run_command(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<RunCommandBody>,
) -> Result<Json<CommandOutput>, AppError> {
    Ok(Json(app.run_command(&name, &body.command_name).await?))
}

async fn get_target_preset(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<TargetPreset>, AppError> {
    app.target_view(&name)?;
    Ok(Json(app.target_preset(&name)))
}

#[derive(Debug, Deserialize)]
struct SetPresetBody {
    preset_id: String,
}

async fn set_target_preset(
    State(app): State<AppState>,
    Path(name): Path<String>,
    Json(body): Json<SetPresetBody>,
) -> Result<Json<TargetPreset>, AppError> {
    app.target_view(&name)?;
    Ok(Json(app.set_target_preset(&name, &body.preset_id)?))
}

#[derive(Serialize)]
struct PresetsResponse {
    presets: Vec<PresetSummary>,
    default_preset: String,
}

async fn list_presets(State(app): State<AppState>) -> Json<PresetsResponse> {
    let catalog = app.scheduler.catalog();
    Json(PresetsResponse {
        presets: catalog.presets().iter().map(Preset::summary).collect(),
        default_preset: catalog.default_preset().to_string(),
    })
}

async fn get_preset(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<Preset>, AppError> {
    app.scheduler
        .catalog()
        .preset(&id)
        .cloned()
        .map(Json)
        .ok_or(AppError::PresetNotFound(id))
}

async fn list_scheduled(State(app): State<AppState>) -> Json<Vec<ScheduledCommand>> {
    Json(app.scheduler.get_commands())
}

async fn run_scheduled(State(app): State<AppState>, Path(name): Path<String>) -> Result<Json<TickReport>, AppError> {
    Ok(Json(app.run_scheduled_now(&name).await?))
}

async fn reload_config(State(app): State<AppState>) -> Json<ReloadReport> {
    Json(app.reload_commands().await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, PresetCatalog};
    use crate::coordinator::MockCoordinator;
    use std::sync::Arc;

    const COMMANDS: &str = r#"
presets:
  basic:
    commands:
      - name: uptime
        command: uptime
    scheduled_commands:
      - name: load
        command: cat /proc/loadavg
        interval_seconds: 30
"#;

    struct Server {
        base: String,
        _dir: tempfile::TempDir,
    }

    async fn serve(api_key: Option<&str>) -> Server {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.http.api_key = api_key.map(str::to_string);
        config.files.presets_file = dir.path().join("presets.json").display().to_string();
        let app = AppState::build(
            config,
            Arc::new(MockCoordinator::demo_fleet()),
            PresetCatalog::from_yaml(COMMANDS).unwrap(),
        );
        app.refresh_once().await;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, build_router(app)).await.unwrap();
        });
        Server { base: format!("http://{addr}"), _dir: dir }
    }

    #[test]
    fn test_error_statuses() {
        assert_eq!(AppError::TargetNotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(
            AppError::Contended { target: "x".into(), owner: "y".into() }.status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::from(SchedulerError::UnknownCommand("x".into())).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn test_targets_and_commands() {
        let server = serve(None).await;
        let client = reqwest::Client::new();

        let targets: Vec<serde_json::Value> = client
            .get(format!("{}/api/targets", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(targets.len(), 3);

        let missing = client.get(format!("{}/api/targets/nope", server.base)).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);

        let out: serde_json::Value = client
            .post(format!("{}/api/targets/dut-1/command", server.base))
            .json(&serde_json::json!({"command_name": "uptime"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(out["exit_code"], 0);
        assert_eq!(out["output"], "uptime @ dut-1\n");

        let contended = client
            .post(format!("{}/api/targets/dut-2/command", server.base))
            .json(&serde_json::json!({"command_name": "uptime"}))
            .send()
            .await
            .unwrap();
        assert_eq!(contended.status(), reqwest::StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_scheduled_run_and_presets() {
        let server = serve(None).await;
        let client = reqwest::Client::new();

        let report: serde_json::Value = client
            .post(format!("{}/api/scheduled-commands/load/run", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        // dut-3 is offline, dut-2 is held by another user
        assert_eq!(report["executed"], serde_json::json!(["dut-1"]));
        assert_eq!(report["skipped"], serde_json::json!(["dut-2"]));

        let unknown = client
            .post(format!("{}/api/scheduled-commands/nope/run", server.base))
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status(), reqwest::StatusCode::NOT_FOUND);

        let presets: serde_json::Value = client
            .get(format!("{}/api/presets", server.base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(presets["default_preset"], "basic");

        let bad = client
            .put(format!("{}/api/targets/dut-1/preset", server.base))
            .json(&serde_json::json!({"preset_id": "missing"}))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_api_key_required_when_configured() {
        let server = serve(Some("s3cret")).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{}/health", server.base)).send().await.unwrap();
        assert_eq!(health.status(), reqwest::StatusCode::OK);

        let denied = client.get(format!("{}/api/targets", server.base)).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client
            .get(format!("{}/api/targets", server.base))
            .header("x-api-key", "s3cret")
            .send()
            .await
            .unwrap();
        assert_eq!(allowed.status(), reqwest::StatusCode::OK);
    }
}
