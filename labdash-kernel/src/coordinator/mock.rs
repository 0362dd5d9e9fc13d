//! In-memory coordinator.
//!
//! Serves a small simulated fleet when no coordinator is reachable, and is the
//! scriptable double used by the engine tests (failure injection, latency,
//! call counters).

use super::{Coordinator, ExporterResources};
use crate::error::CoordinatorError;
use crate::models::{CommandResult, Resource};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;

/// Calls observed by the mock, for assertions.
#[derive(Debug, Clone, Default)]
pub struct MockCalls {
    pub fetch: u32,
    pub request_ownership: u32,
    pub release: u32,
    pub runs: Vec<(String, String)>,
}

#[derive(Default)]
struct MockState {
    exporters: ExporterResources,
    unreachable: bool,
    /// Remaining scripted release failures; `u32::MAX` fails forever.
    release_failures: u32,
    acquire_rejection: Option<String>,
    run_delay: Duration,
    outputs: HashMap<String, CommandResult>,
    calls: MockCalls,
}

#[derive(Default)]
pub struct MockCoordinator {
    state: Mutex<MockState>,
}

impl MockCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Three development boards: one free, one held by a developer, one
    /// reporting without parameters (offline).
    pub fn demo_fleet() -> Self {
        let mock = Self::new();
        mock.add_resource(
            "exporter-1",
            "dut-1",
            "NetworkSerialPort",
            serde_json::json!({"host": "192.168.1.101", "port": 4001}),
        );
        mock.add_resource(
            "exporter-1",
            "dut-1",
            "NetworkPowerPort",
            serde_json::json!({"host": "pdu-1", "index": 1}),
        );
        mock.add_resource(
            "exporter-2",
            "dut-2",
            "NetworkSerialPort",
            serde_json::json!({"host": "192.168.1.102", "port": 4002}),
        );
        mock.set_owner("dut-2", Some("developer@host"));
        mock.add_resource("exporter-3", "dut-3", "NetworkSerialPort", serde_json::json!({}));
        mock
    }

    pub fn add_resource(&self, exporter: &str, group: &str, cls: &str, params: serde_json::Value) {
        let resource = Resource {
            exporter: exporter.to_string(),
            group: group.to_string(),
            cls: cls.to_string(),
            params: params.as_object().cloned().unwrap_or_default(),
            acquired: None,
            available: true,
        };
        self.state
            .lock()
            .exporters
            .entry(exporter.to_string())
            .or_default()
            .push(resource);
    }

    /// Shorthand for a target with a single serial port at `host`.
    pub fn add_target(&self, exporter: &str, target: &str, host: &str) {
        self.add_resource(
            exporter,
            target,
            "NetworkSerialPort",
            serde_json::json!({"host": host, "port": 4000}),
        );
    }

    /// Stops reporting an exporter, as if it dropped off the coordinator.
    pub fn remove_exporter(&self, exporter: &str) {
        self.state.lock().exporters.remove(exporter);
    }

    pub fn set_resource_available(&self, target: &str, available: bool) {
        let mut state = self.state.lock();
        for r in state.exporters.values_mut().flatten().filter(|r| r.group == target) {
            r.available = available;
        }
    }

    pub fn set_owner(&self, target: &str, owner: Option<&str>) {
        let mut state = self.state.lock();
        for r in state.exporters.values_mut().flatten().filter(|r| r.group == target) {
            r.acquired = owner.map(str::to_string);
        }
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn fail_releases(&self, times: u32) {
        self.state.lock().release_failures = times;
    }

    pub fn always_fail_release(&self) {
        self.state.lock().release_failures = u32::MAX;
    }

    pub fn reject_acquire(&self, message: &str) {
        self.state.lock().acquire_rejection = Some(message.to_string());
    }

    pub fn set_run_delay(&self, delay: Duration) {
        self.state.lock().run_delay = delay;
    }

    pub fn set_output(&self, command: &str, result: CommandResult) {
        self.state.lock().outputs.insert(command.to_string(), result);
    }

    pub fn calls(&self) -> MockCalls {
        self.state.lock().calls.clone()
    }
}

#[async_trait]
impl Coordinator for MockCoordinator {
    async fn fetch_resources(&self) -> Result<ExporterResources, CoordinatorError> {
        let mut state = self.state.lock();
        state.calls.fetch += 1;
        if state.unreachable {
            return Err(CoordinatorError::Transport("mock coordinator offline".into()));
        }
        Ok(state.exporters.clone())
    }

    async fn request_ownership(&self, target: &str, owner: &str) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        state.calls.request_ownership += 1;
        if state.unreachable {
            return Err(CoordinatorError::Transport("mock coordinator offline".into()));
        }
        if let Some(message) = state.acquire_rejection.clone() {
            return Err(CoordinatorError::Rejected(message));
        }

        let mut resources: Vec<&mut Resource> = state
            .exporters
            .values_mut()
            .flatten()
            .filter(|r| r.group == target)
            .collect();
        if resources.is_empty() {
            return Err(CoordinatorError::Rejected(format!("place {target} not found")));
        }
        if let Some(holder) = resources
            .iter()
            .filter_map(|r| r.acquired.as_deref())
            .find(|o| *o != owner)
        {
            return Err(CoordinatorError::Rejected(format!(
                "place {target} is already acquired by {holder}"
            )));
        }
        for r in resources.iter_mut() {
            r.acquired = Some(owner.to_string());
        }
        Ok(())
    }

    async fn release_ownership(&self, target: &str) -> Result<(), CoordinatorError> {
        let mut state = self.state.lock();
        state.calls.release += 1;
        if state.unreachable {
            return Err(CoordinatorError::Transport("mock coordinator offline".into()));
        }
        if state.release_failures > 0 {
            if state.release_failures != u32::MAX {
                state.release_failures -= 1;
            }
            return Err(CoordinatorError::Rejected(format!("release of {target} failed")));
        }
        for r in state.exporters.values_mut().flatten().filter(|r| r.group == target) {
            r.acquired = None;
        }
        Ok(())
    }

    async fn run(
        &self,
        target: &str,
        command: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, CoordinatorError> {
        let (delay, scripted) = {
            let mut state = self.state.lock();
            state.calls.runs.push((target.to_string(), command.to_string()));
            if state.unreachable {
                return Err(CoordinatorError::Transport("mock coordinator offline".into()));
            }
            (state.run_delay, state.outputs.get(command).cloned())
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(scripted.unwrap_or_else(|| CommandResult::new(format!("{command} @ {target}\n"), 0)))
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_demo_fleet_shape() {
        let mock = MockCoordinator::demo_fleet();
        let resources = mock.fetch_resources().await.unwrap();
        assert_eq!(resources.len(), 3);
        assert_eq!(resources["exporter-1"].len(), 2);
        assert_eq!(resources["exporter-2"][0].acquired.as_deref(), Some("developer@host"));
        assert!(resources["exporter-3"][0].params.is_empty());
    }

    #[tokio::test]
    async fn test_ownership_conflicts() {
        let mock = MockCoordinator::demo_fleet();
        mock.request_ownership("dut-1", "me").await.unwrap();
        mock.request_ownership("dut-1", "me").await.unwrap();

        let err = mock.request_ownership("dut-2", "me").await.unwrap_err();
        assert_eq!(
            err,
            CoordinatorError::Rejected("place dut-2 is already acquired by developer@host".into())
        );

        mock.release_ownership("dut-1").await.unwrap();
        let calls = mock.calls();
        assert_eq!(calls.request_ownership, 3);
        assert_eq!(calls.release, 1);
    }

    #[tokio::test]
    async fn test_scripted_release_failures() {
        let mock = MockCoordinator::demo_fleet();
        mock.fail_releases(1);
        assert!(mock.release_ownership("dut-1").await.is_err());
        assert!(mock.release_ownership("dut-1").await.is_ok());
    }
}
