/**
 * APP - Explicit application context
 *
 * ROLE :
 * Built once at startup and handed to the HTTP/WebSocket handlers and the
 * background loops. Owns the engine parts and wires them together:
 *
 *   Registry -> Scheduler / Acquisition -> Dispatcher -> Coordinator
 *   Scheduler -> Notifiers (Broadcaster, MQTT)
 */

use crate::acquisition::AcquisitionCoordinator;
use crate::broadcast::{Broadcaster, ServerEvent};
use crate::config::{KernelConfig, PresetCatalog};
use crate::coordinator::Coordinator;
use crate::dispatcher::{CoordinatorDispatcher, Dispatcher};
use crate::error::ExecError;
use crate::health::{HealthInputs, HealthTracker, KernelHealth};
use crate::locks::TargetLocks;
use crate::models::{Command, CommandOutput, Preset, Target};
use crate::mqtt::MqttNotifier;
use crate::presets::{PresetStore, PresetStoreError};
use crate::registry::TargetRegistry;
use crate::scheduler::{Scheduler, SchedulerError, TickReport};
use serde::Serialize;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("target '{0}' not found")]
    TargetNotFound(String),
    #[error("command '{0}' not found in the target's preset")]
    CommandNotFound(String),
    #[error("preset '{0}' not found")]
    PresetNotFound(String),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("target '{target}' is acquired by {owner}")]
    Contended { target: String, owner: String },
    #[error(transparent)]
    Persist(#[from] PresetStoreError),
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetPreset {
    pub target: String,
    pub preset_id: String,
    pub preset: Option<Preset>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReloadReport {
    pub presets: usize,
    pub scheduled_commands: usize,
    pub default_preset: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<KernelConfig>,
    pub registry: Arc<TargetRegistry>,
    pub acquisition: Arc<AcquisitionCoordinator>,
    pub scheduler: Arc<Scheduler>,
    pub presets: Arc<PresetStore>,
    pub broadcaster: Arc<Broadcaster>,
    pub health: HealthTracker,
}

impl AppState {
    /// Wires every part. Must run inside the tokio runtime (MQTT event loop).
    pub fn build(config: KernelConfig, coordinator: Arc<dyn Coordinator>, catalog: PresetCatalog) -> Self {
        let health = HealthTracker::new(coordinator.kind());
        let locks = TargetLocks::new();
        let registry = Arc::new(TargetRegistry::new(coordinator.clone()));
        let dispatcher: Arc<dyn Dispatcher> = Arc::new(CoordinatorDispatcher::new(coordinator));
        let acquisition = Arc::new(
            AcquisitionCoordinator::new(
                registry.clone(),
                dispatcher,
                locks.clone(),
                &config.coordinator.owner_identity(),
            )
            .with_release_retries(config.coordinator.release_retries),
        );
        let presets = Arc::new(PresetStore::open(
            &config.files.presets_file,
            catalog.default_preset(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            catalog,
            registry.clone(),
            acquisition.clone(),
            presets.clone(),
            locks,
            config.coordinator.command_timeout(),
        ));

        let broadcaster = Arc::new(Broadcaster::new());
        scheduler.add_notifier(broadcaster.clone());
        if let Some(mqtt) = &config.mqtt {
            health.mark_mqtt_connecting();
            scheduler.add_notifier(Arc::new(MqttNotifier::spawn(mqtt, health.clone())));
        }

        Self {
            config: Arc::new(config),
            registry,
            acquisition,
            scheduler,
            presets,
            broadcaster,
            health,
        }
    }

    /// Target with its latest scheduled outputs attached.
    pub fn enrich(&self, mut target: Target) -> Target {
        target.scheduled_outputs = self.scheduler.get_outputs_for_target(&target.name);
        target
    }

    pub fn target_views(&self) -> Vec<Target> {
        self.registry.list().into_iter().map(|t| self.enrich(t)).collect()
    }

    pub fn target_view(&self, name: &str) -> Result<Target, AppError> {
        self.registry
            .get(name)
            .map(|t| self.enrich(t))
            .ok_or_else(|| AppError::TargetNotFound(name.to_string()))
    }

    pub fn commands_for_target(&self, name: &str) -> Result<Vec<Command>, AppError> {
        self.target_view(name)?;
        let preset = self.presets.get_assignment(name);
        Ok(self.scheduler.catalog().commands_for_preset(&preset))
    }

    /// Ad-hoc path: resolves `command_name` in the target's preset, runs it
    /// exclusively and fans the output out to subscribers of the target.
    /// Only contention is an error; other failures become a failed output.
    pub async fn run_command(&self, target: &str, command_name: &str) -> Result<CommandOutput, AppError> {
        self.target_view(target)?;
        let preset = self.presets.get_assignment(target);
        let command = self
            .scheduler
            .catalog()
            .command_for_preset(&preset, command_name)
            .cloned()
            .ok_or_else(|| AppError::CommandNotFound(command_name.to_string()))?;

        info!("running '{}' on {target}", command.name);
        let timeout = self.config.coordinator.command_timeout();
        let output = match self
            .acquisition
            .execute_exclusive(target, &command.command, timeout)
            .await
        {
            Ok(result) => CommandOutput {
                command: command.command.clone(),
                output: result.output,
                timestamp: OffsetDateTime::now_utc(),
                exit_code: result.exit_code,
            },
            Err(ExecError::Contended { target, owner }) => {
                return Err(AppError::Contended { target, owner });
            }
            Err(e) => CommandOutput {
                command: command.command.clone(),
                output: format!("Error executing command: {e}"),
                timestamp: OffsetDateTime::now_utc(),
                exit_code: e.exit_code(),
            },
        };

        self.broadcaster.broadcast_to_subscribed(
            &ServerEvent::CommandOutput { target: target.to_string(), output: output.clone() },
            target,
        );
        Ok(output)
    }

    pub fn target_preset(&self, target: &str) -> TargetPreset {
        let preset_id = self.presets.get_assignment(target);
        TargetPreset {
            target: target.to_string(),
            preset: self.scheduler.catalog().preset(&preset_id).cloned(),
            preset_id,
        }
    }

    pub fn set_target_preset(&self, target: &str, preset_id: &str) -> Result<TargetPreset, AppError> {
        if self.scheduler.catalog().preset(preset_id).is_none() {
            return Err(AppError::PresetNotFound(preset_id.to_string()));
        }
        self.presets.set_assignment(target, preset_id)?;
        Ok(self.target_preset(target))
    }

    pub async fn run_scheduled_now(&self, name: &str) -> Result<TickReport, AppError> {
        Ok(self.scheduler.execute_now(name).await?)
    }

    /// Re-reads the commands file and restarts the scheduler on it.
    pub async fn reload_commands(&self) -> ReloadReport {
        let catalog = PresetCatalog::load(&self.config.files.commands_file).await;
        let report = ReloadReport {
            presets: catalog.presets().len(),
            scheduled_commands: catalog.unique_scheduled_commands().len(),
            default_preset: catalog.default_preset().to_string(),
        };
        self.presets.set_default_preset(catalog.default_preset());
        self.scheduler.reload(catalog).await;
        info!(
            "commands reloaded: {} presets, {} scheduled jobs",
            report.presets, report.scheduled_commands
        );
        report
    }

    pub fn health(&self) -> KernelHealth {
        self.health.get_health(HealthInputs {
            targets: self.registry.list().len(),
            connections: self.broadcaster.connection_count(),
            jobs: self.scheduler.job_count(),
        })
    }

    /// One registry refresh; changed targets go out as `target_update`.
    pub async fn refresh_once(&self) -> usize {
        match self.registry.refresh().await {
            Ok(_) => self.health.record_refresh_ok(),
            Err(_) => self.health.record_refresh_failure(),
        }
        let changed = self.registry.drain_changes();
        for target in &changed {
            let target = self.enrich(target.clone());
            self.broadcaster
                .broadcast_to_subscribed(&ServerEvent::TargetUpdate(target.clone()), &target.name);
        }
        if !changed.is_empty() {
            debug!("{} targets changed", changed.len());
        }
        changed.len()
    }

    pub fn spawn_refresh_loop(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let app = self.clone();
        let every = self.config.coordinator.refresh_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(every) => {}
                }
                app.refresh_once().await;
            }
            debug!("refresh loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MockCoordinator;
    use crate::health::CoordinatorStatus;

    const COMMANDS: &str = r#"
default_preset: basic
presets:
  basic:
    name: Basic
    commands:
      - name: uptime
        command: uptime
    scheduled_commands:
      - name: up
        command: uptime
        interval_seconds: 60
  advanced:
    name: Advanced
    commands:
      - name: uptime
        command: uptime -p
      - name: dmesg
        command: dmesg | tail
"#;

    async fn app() -> (Arc<MockCoordinator>, AppState, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = KernelConfig::default();
        config.files.presets_file = dir.path().join("presets.json").display().to_string();
        let mock = Arc::new(MockCoordinator::demo_fleet());
        let catalog = PresetCatalog::from_yaml(COMMANDS).unwrap();
        let app = AppState::build(config, mock.clone(), catalog);
        app.refresh_once().await;
        (mock, app, dir)
    }

    #[tokio::test]
    async fn test_run_command_resolves_from_assigned_preset() {
        let (mock, app, _dir) = app().await;
        app.set_target_preset("dut-1", "advanced").unwrap();
        let out = app.run_command("dut-1", "uptime").await.unwrap();
        assert_eq!(out.command, "uptime -p");
        assert_eq!(out.output, "uptime -p @ dut-1\n");
        assert_eq!(mock.calls().release, 1);
    }

    #[tokio::test]
    async fn test_run_command_errors() {
        let (_mock, app, _dir) = app().await;
        assert!(matches!(
            app.run_command("nope", "uptime").await,
            Err(AppError::TargetNotFound(_))
        ));
        assert!(matches!(
            app.run_command("dut-1", "dmesg").await,
            Err(AppError::CommandNotFound(_))
        ));
        assert!(matches!(
            app.run_command("dut-2", "uptime").await,
            Err(AppError::Contended { ref owner, .. }) if owner == "developer@host"
        ));
    }

    #[tokio::test]
    async fn test_scheduled_tick_skips_target_running_ad_hoc_command() {
        let (mock, app, _dir) = app().await;
        mock.set_run_delay(std::time::Duration::from_millis(300));

        let (ad_hoc, report) = tokio::join!(app.run_command("dut-1", "uptime"), async {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            app.run_scheduled_now("up").await
        });

        assert_eq!(ad_hoc.unwrap().exit_code, 0);
        let report = report.unwrap();
        assert!(report.executed.is_empty());
        // dut-1 busy locally, dut-2 held by another owner, dut-3 offline
        assert_eq!(report.skipped, ["dut-1", "dut-2"]);
        assert_eq!(mock.calls().runs, [("dut-1".to_string(), "uptime".to_string())]);
        assert!(app.scheduler.get_outputs_for_target("dut-1").is_empty());
    }

    #[tokio::test]
    async fn test_command_output_reaches_subscribers() {
        let (_mock, app, _dir) = app().await;
        let (_id, mut rx) = app.broadcaster.connect();
        app.run_command("dut-1", "uptime").await.unwrap();
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("\"type\":\"command_output\""));
    }

    #[tokio::test]
    async fn test_unknown_preset_rejected() {
        let (_mock, app, _dir) = app().await;
        assert!(matches!(
            app.set_target_preset("dut-1", "missing"),
            Err(AppError::PresetNotFound(_))
        ));
        assert_eq!(app.target_preset("dut-1").preset_id, "basic");
    }

    #[tokio::test]
    async fn test_refresh_broadcasts_only_changes() {
        let (mock, app, _dir) = app().await;
        let (_id, mut rx) = app.broadcaster.connect();
        assert_eq!(app.refresh_once().await, 0);

        mock.remove_exporter("exporter-1");
        assert_eq!(app.refresh_once().await, 1);
        let msg = rx.try_recv().unwrap();
        assert!(msg.contains("\"type\":\"target_update\""));
        assert!(msg.contains("\"status\":\"offline\""));
        // still listed
        assert_eq!(app.target_views().len(), 3);
    }

    #[tokio::test]
    async fn test_refresh_failure_marks_degraded() {
        let (mock, app, _dir) = app().await;
        mock.set_unreachable(true);
        app.refresh_once().await;
        assert_eq!(app.health.coordinator_status(), CoordinatorStatus::Degraded);
        assert_eq!(app.target_views().len(), 3);
        assert_eq!(app.health().status, "degraded");
    }
}
