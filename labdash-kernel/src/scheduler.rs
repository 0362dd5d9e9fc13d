/**
 * SCHEDULER - Periodic commands across the fleet
 *
 * ROLE :
 * One job per unique scheduled command name (shared across presets). Each tick
 * picks the online targets whose assigned preset defines that name, resolves
 * the command body from the target's own preset, and runs it under the
 * per-target lock. A busy target is skipped for that tick, never queued.
 *
 * OUTPUTS :
 * Latest result per (command, target), overwritten on every successful run,
 * then pushed to every registered `Notifier`.
 */

use crate::config::PresetCatalog;
use crate::dispatcher::Dispatcher;
use crate::locks::{TargetGuard, TargetLocks};
use crate::models::{ScheduledCommand, ScheduledOutput, Target};
use async_trait::async_trait;
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Extra pause after a failed iteration, on top of the regular interval.
pub const ERROR_PAUSE: Duration = Duration::from_secs(5);

/// Current fleet as seen by the scheduler.
#[async_trait]
pub trait TargetSource: Send + Sync + 'static {
    async fn targets(&self) -> Vec<Target>;
}

/// Receives every freshly cached scheduled output.
#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn scheduled_output(&self, target: &str, output: &ScheduledOutput) -> anyhow::Result<()>;
}

/// Target -> assigned preset id.
pub trait PresetLookup: Send + Sync + 'static {
    fn preset_for(&self, target: &str) -> String;
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("unknown scheduled command: {0}")]
    UnknownCommand(String),
}

/// What one tick did, per target.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub executed: Vec<String>,
    /// Target busy locally or held by another owner.
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

/// command name -> target -> latest output
type OutputCache = HashMap<String, HashMap<String, ScheduledOutput>>;

struct Engine {
    catalog: RwLock<Arc<PresetCatalog>>,
    targets: Arc<dyn TargetSource>,
    dispatcher: Arc<dyn Dispatcher>,
    presets: Arc<dyn PresetLookup>,
    locks: TargetLocks,
    notifiers: RwLock<Vec<Arc<dyn Notifier>>>,
    outputs: RwLock<OutputCache>,
    command_timeout: Duration,
}

enum RunOutcome {
    Executed,
    Skipped,
    Failed,
}

impl Engine {
    fn catalog(&self) -> Arc<PresetCatalog> {
        self.catalog.read().clone()
    }

    async fn tick(&self, name: &str) -> TickReport {
        let catalog = self.catalog();
        let mut report = TickReport::default();
        let mut runs = Vec::new();

        for target in self.targets.targets().await {
            if !target.is_online() {
                continue;
            }
            let preset = self.presets.preset_for(&target.name);
            let Some(command) = catalog.scheduled_command(&preset, name) else {
                continue;
            };
            let Some(guard) = self.locks.try_acquire(&target.name) else {
                debug!("'{name}' skipped on {}: target busy", target.name);
                report.skipped.push(target.name);
                continue;
            };
            let command = command.clone();
            runs.push(async move {
                let outcome = self.run_on(&target.name, &command, guard).await;
                (target.name, outcome)
            });
        }

        for (target, outcome) in join_all(runs).await {
            match outcome {
                RunOutcome::Executed => report.executed.push(target),
                RunOutcome::Skipped => report.skipped.push(target),
                RunOutcome::Failed => report.failed.push(target),
            }
        }
        report
    }

    async fn run_on(&self, target: &str, command: &ScheduledCommand, guard: TargetGuard) -> RunOutcome {
        let result = self
            .dispatcher
            .execute(target, &command.command, self.command_timeout)
            .await;
        drop(guard);

        let result = match result {
            Ok(result) => result,
            Err(e) if e.is_contended() => {
                debug!("'{}' skipped on {target}: {e}", command.name);
                return RunOutcome::Skipped;
            }
            Err(e) => {
                warn!("'{}' failed on {target}: {e}", command.name);
                return RunOutcome::Failed;
            }
        };

        let output = ScheduledOutput {
            command_name: command.name.clone(),
            output: result.output.trim().to_string(),
            timestamp: OffsetDateTime::now_utc(),
            exit_code: result.exit_code,
        };
        self.outputs
            .write()
            .entry(command.name.clone())
            .or_default()
            .insert(target.to_string(), output.clone());
        debug!("'{}' on {target} -> exit {}", command.name, output.exit_code);

        let notifiers = self.notifiers.read().clone();
        for notifier in notifiers {
            if let Err(e) = notifier.scheduled_output(target, &output).await {
                warn!("notifier failed for '{}' on {target}: {e:#}", command.name);
            }
        }
        RunOutcome::Executed
    }
}

async fn run_job(engine: Arc<Engine>, name: String, interval: Duration, cancel: CancellationToken) {
    info!("scheduled job '{name}' started (every {}s)", interval.as_secs());
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let pause = match AssertUnwindSafe(engine.tick(&name)).catch_unwind().await {
            Ok(report) => {
                debug!(
                    "'{name}' tick: {} executed, {} skipped, {} failed",
                    report.executed.len(),
                    report.skipped.len(),
                    report.failed.len()
                );
                interval
            }
            Err(_) => {
                error!("scheduled job '{name}' iteration panicked, pausing {}s", ERROR_PAUSE.as_secs());
                ERROR_PAUSE + interval
            }
        };
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(pause) => {}
        }
    }
    debug!("scheduled job '{name}' stopped");
}

pub struct Scheduler {
    engine: Arc<Engine>,
    jobs: Mutex<HashMap<String, JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl Scheduler {
    pub fn new(
        catalog: PresetCatalog,
        targets: Arc<dyn TargetSource>,
        dispatcher: Arc<dyn Dispatcher>,
        presets: Arc<dyn PresetLookup>,
        locks: TargetLocks,
        command_timeout: Duration,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                catalog: RwLock::new(Arc::new(catalog)),
                targets,
                dispatcher,
                presets,
                locks,
                notifiers: RwLock::new(Vec::new()),
                outputs: RwLock::new(HashMap::new()),
                command_timeout,
            }),
            jobs: Mutex::new(HashMap::new()),
            cancel: Mutex::new(CancellationToken::new()),
        }
    }

    pub fn add_notifier(&self, notifier: Arc<dyn Notifier>) {
        self.engine.notifiers.write().push(notifier);
    }

    pub fn catalog(&self) -> Arc<PresetCatalog> {
        self.engine.catalog()
    }

    /// Spawns one job per unique command name. Jobs already running are kept.
    pub fn start(&self) {
        let cancel = self.cancel.lock().clone();
        let mut jobs = self.jobs.lock();
        for command in self.engine.catalog().unique_scheduled_commands() {
            if jobs.contains_key(&command.name) {
                continue;
            }
            let handle = tokio::spawn(run_job(
                self.engine.clone(),
                command.name.clone(),
                command.interval(),
                cancel.clone(),
            ));
            jobs.insert(command.name, handle);
        }
        info!("scheduler running {} jobs", jobs.len());
    }

    /// Signals every job and waits for in-flight ticks to finish.
    pub async fn stop(&self) {
        let handles: Vec<(String, JoinHandle<()>)> = {
            let mut cancel = self.cancel.lock();
            cancel.cancel();
            *cancel = CancellationToken::new();
            self.jobs.lock().drain().collect()
        };
        for (name, handle) in handles {
            if let Err(e) = handle.await {
                error!("scheduled job '{name}' ended abnormally: {e}");
            }
        }
        info!("scheduler stopped");
    }

    /// Restarts jobs against a new catalog and drops outputs of removed commands.
    pub async fn reload(&self, catalog: PresetCatalog) {
        self.stop().await;
        let names = catalog.scheduled_command_names();
        *self.engine.catalog.write() = Arc::new(catalog);
        self.engine.outputs.write().retain(|name, _| names.contains(name));
        self.start();
    }

    pub fn job_count(&self) -> usize {
        self.jobs.lock().len()
    }

    pub fn get_outputs_for_target(&self, target: &str) -> HashMap<String, ScheduledOutput> {
        self.engine
            .outputs
            .read()
            .iter()
            .filter_map(|(name, per_target)| per_target.get(target).map(|o| (name.clone(), o.clone())))
            .collect()
    }

    pub fn get_all_outputs(&self) -> HashMap<String, HashMap<String, ScheduledOutput>> {
        self.engine.outputs.read().clone()
    }

    /// Unique by name, first definition wins.
    pub fn get_commands(&self) -> Vec<ScheduledCommand> {
        self.engine.catalog().unique_scheduled_commands()
    }

    pub fn get_commands_for_preset(&self, preset: &str) -> Vec<ScheduledCommand> {
        self.engine.catalog().scheduled_commands_for_preset(preset)
    }

    /// One immediate tick outside the job timer.
    pub async fn execute_now(&self, name: &str) -> Result<TickReport, SchedulerError> {
        if !self.engine.catalog().scheduled_command_names().contains(name) {
            return Err(SchedulerError::UnknownCommand(name.to_string()));
        }
        Ok(self.engine.tick(name).await)
    }
}
