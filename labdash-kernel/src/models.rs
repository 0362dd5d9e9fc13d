//! Shared data model: targets, resources, commands and their outputs.
//!
//! `Target` values are always derived from the registry's merged view and are
//! never persisted on their own. Scheduled outputs are attached by the caller
//! that renders a target (REST, WebSocket), not by the registry.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetStatus {
    Available,
    Acquired,
    Offline,
}

/// One resource shared by an exporter, as last reported by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    pub exporter: String,
    /// Resource group; the coordinator exposes it as the place (target) name.
    pub group: String,
    #[serde(rename = "type")]
    pub cls: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub acquired: Option<String>,
    pub available: bool,
}

impl Resource {
    /// Best-effort network address advertised by the resource parameters.
    pub fn address(&self) -> Option<&str> {
        ["host", "address", "ip"]
            .iter()
            .find_map(|key| self.params.get(*key).and_then(|v| v.as_str()))
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub status: TargetStatus,
    /// Current owner; empty when nobody holds the place.
    pub acquired_by: String,
    pub resources: Vec<Resource>,
    pub ip_address: Option<String>,
    #[serde(default)]
    pub scheduled_outputs: HashMap<String, ScheduledOutput>,
}

impl Target {
    pub fn is_online(&self) -> bool {
        self.status != TargetStatus::Offline
    }
}

/// Ad-hoc command as listed in a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub description: String,
}

/// Periodic command. The name doubles as the output-cache key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledCommand {
    pub name: String,
    pub command: String,
    pub interval_seconds: u64,
    #[serde(default)]
    pub description: String,
}

impl ScheduledCommand {
    pub const MIN_INTERVAL_SECS: u64 = 5;

    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.interval_seconds.max(Self::MIN_INTERVAL_SECS))
    }
}

/// Latest output of one scheduled command on one target (last-write-wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledOutput {
    pub command_name: String,
    pub output: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub exit_code: i32,
}

/// Output of an ad-hoc command run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    pub output: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub exit_code: i32,
}

/// Raw result of a command run by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub output: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn new(output: impl Into<String>, exit_code: i32) -> Self {
        Self { output: output.into(), exit_code }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresetSummary {
    pub id: String,
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Preset {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub scheduled_commands: Vec<ScheduledCommand>,
    #[serde(default)]
    pub auto_refresh_commands: Vec<String>,
}

impl Preset {
    pub fn summary(&self) -> PresetSummary {
        PresetSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            description: self.description.clone(),
        }
    }

    pub fn scheduled_command(&self, name: &str) -> Option<&ScheduledCommand> {
        self.scheduled_commands.iter().find(|c| c.name == name)
    }

    pub fn command(&self, name: &str) -> Option<&Command> {
        self.commands.iter().find(|c| c.name == name)
    }
}
