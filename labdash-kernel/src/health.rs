use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorStatus {
    Connecting,
    Connected,
    Degraded,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KernelHealth {
    pub status: String,
    pub uptime_seconds: u64,
    pub coordinator: String,
    pub coordinator_status: CoordinatorStatus,
    pub refresh_failures: u32,
    pub targets_tracked: u32,
    pub connections: u32,
    pub scheduled_jobs: u32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

/// Live counters the kernel gathers for `/health`.
#[derive(Debug, Clone, Copy, Default)]
pub struct HealthInputs {
    pub targets: usize,
    pub connections: usize,
    pub jobs: usize,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    coordinator_kind: &'static str,
    coordinator_status: Arc<Mutex<CoordinatorStatus>>,
    refresh_failures: Arc<AtomicU32>,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl HealthTracker {
    pub fn new(coordinator_kind: &'static str) -> Self {
        Self {
            start_time: Instant::now(),
            coordinator_kind,
            coordinator_status: Arc::new(Mutex::new(CoordinatorStatus::Connecting)),
            refresh_failures: Arc::new(AtomicU32::new(0)),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn record_refresh_ok(&self) {
        self.refresh_failures.store(0, Ordering::Relaxed);
        *self.coordinator_status.lock() = CoordinatorStatus::Connected;
    }

    pub fn record_refresh_failure(&self) {
        self.refresh_failures.fetch_add(1, Ordering::Relaxed);
        *self.coordinator_status.lock() = CoordinatorStatus::Degraded;
    }

    pub fn coordinator_status(&self) -> CoordinatorStatus {
        *self.coordinator_status.lock()
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_mqtt_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn get_health(&self, inputs: HealthInputs) -> KernelHealth {
        let coordinator_status = self.coordinator_status();
        let status = match coordinator_status {
            CoordinatorStatus::Degraded => "degraded",
            _ => "healthy",
        };
        KernelHealth {
            status: status.to_string(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            coordinator: self.coordinator_kind.to_string(),
            coordinator_status,
            refresh_failures: self.refresh_failures.load(Ordering::Relaxed),
            targets_tracked: inputs.targets as u32,
            connections: inputs.connections as u32,
            scheduled_jobs: inputs.jobs as u32,
            mqtt_status: self.mqtt_status.lock().clone(),
            mqtt_reconnects: self.mqtt_reconnects.load(Ordering::Relaxed),
        }
    }
}
