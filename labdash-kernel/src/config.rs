//! Kernel configuration (`kernel.yaml`) and the preset catalog (`commands.yaml`).

use crate::models::{Command, Preset, ScheduledCommand};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

pub const DEFAULT_PRESET: &str = "basic";

/// Host part given to a bare owner name.
pub const DEFAULT_OWNER_HOST: &str = "labdash";

/// `host/user` -> (host, user). A bare user gets `DEFAULT_OWNER_HOST`, so the
/// identity sent to the coordinator and the one compared against lock
/// holders stay the same string.
pub fn split_owner(owner: &str) -> (String, String) {
    match owner.trim().split_once('/') {
        Some((host, user)) => (host.to_string(), user.to_string()),
        None => (DEFAULT_OWNER_HOST.to_string(), owner.trim().to_string()),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorMode {
    Cli,
    Mock,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CoordinatorConf {
    pub mode: CoordinatorMode,
    pub url: String,
    /// Program string; `{url}` is replaced with `url` before splitting.
    pub program: String,
    /// Identity used for ownership requests, `host/user` or a bare user.
    pub owner: String,
    pub command_timeout_secs: u64,
    pub refresh_interval_secs: u64,
    pub release_retries: u32,
}

impl Default for CoordinatorConf {
    fn default() -> Self {
        Self {
            mode: CoordinatorMode::Mock,
            url: "ws://localhost:20408/ws".into(),
            program: "labgrid-client -x {url}".into(),
            owner: "labdash/dashboard".into(),
            command_timeout_secs: 30,
            refresh_interval_secs: 5,
            release_retries: crate::acquisition::DEFAULT_RELEASE_RETRIES,
        }
    }
}

impl CoordinatorConf {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    /// Full `host/user` owner identity.
    pub fn owner_identity(&self) -> String {
        let (host, user) = split_owner(&self.owner);
        format!("{host}/{user}")
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    pub api_key: Option<String>,
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8000".into(), api_key: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
}

fn default_topic_prefix() -> String {
    "labdash".into()
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FilesConf {
    pub commands_file: String,
    pub presets_file: String,
}

impl Default for FilesConf {
    fn default() -> Self {
        Self {
            commands_file: "commands.yaml".into(),
            presets_file: "data/presets.json".into(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub coordinator: CoordinatorConf,
    pub http: HttpConf,
    pub mqtt: Option<MqttConf>,
    pub files: FilesConf,
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("LABDASH_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    if !Path::new(&path).exists() {
        warn!("no {path}, using default configuration");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(&path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("invalid {path}, using default configuration: {e}");
        KernelConfig::default()
    })
}

// ---------------------------------------------------------------------------
// commands.yaml
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawCommand {
    #[serde(default)]
    name: String,
    #[serde(default)]
    command: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize)]
struct RawScheduledCommand {
    #[serde(default)]
    name: String,
    #[serde(default)]
    command: String,
    #[serde(default = "default_interval")]
    interval_seconds: u64,
    #[serde(default)]
    description: String,
}

fn default_interval() -> u64 {
    60
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPreset {
    name: Option<String>,
    description: String,
    commands: Vec<RawCommand>,
    scheduled_commands: Vec<RawScheduledCommand>,
    auto_refresh_commands: Vec<String>,
}

impl RawPreset {
    fn into_preset(self, id: &str, fallback_name: &str, fallback_description: &str) -> Preset {
        let commands = self
            .commands
            .into_iter()
            .map(|c| Command { name: c.name, command: c.command, description: c.description })
            .collect();
        let scheduled_commands = self
            .scheduled_commands
            .into_iter()
            .filter_map(|c| {
                if c.interval_seconds < ScheduledCommand::MIN_INTERVAL_SECS {
                    warn!(
                        "scheduled command '{}' in preset '{id}' rejected: interval {}s is below {}s",
                        c.name,
                        c.interval_seconds,
                        ScheduledCommand::MIN_INTERVAL_SECS
                    );
                    return None;
                }
                Some(ScheduledCommand {
                    name: c.name,
                    command: c.command,
                    interval_seconds: c.interval_seconds,
                    description: c.description,
                })
            })
            .collect();
        let description = if self.description.is_empty() {
            fallback_description.to_string()
        } else {
            self.description
        };
        Preset {
            id: id.to_string(),
            name: self.name.unwrap_or_else(|| fallback_name.to_string()),
            description,
            commands,
            scheduled_commands,
            auto_refresh_commands: self.auto_refresh_commands,
        }
    }
}

/// Presets in file order plus the id used for unassigned targets.
#[derive(Debug, Clone, PartialEq)]
pub struct PresetCatalog {
    default_preset: String,
    presets: Vec<Preset>,
}

impl Default for PresetCatalog {
    fn default() -> Self {
        Self::new(DEFAULT_PRESET, Vec::new())
    }
}

impl PresetCatalog {
    pub fn new(default_preset: &str, presets: Vec<Preset>) -> Self {
        Self { default_preset: default_preset.to_string(), presets }
    }

    /// Accepts the preset format (`presets:` key) and the legacy flat format,
    /// which becomes a single `basic` preset.
    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        let Some(map) = value.as_mapping() else {
            return Ok(Self::default());
        };

        if let Some(presets) = map.get("presets") {
            let default_preset = map
                .get("default_preset")
                .and_then(|v| v.as_str())
                .unwrap_or(DEFAULT_PRESET)
                .to_string();
            let mut out = Vec::new();
            if let Some(presets) = presets.as_mapping() {
                for (id, body) in presets {
                    let Some(id) = id.as_str() else { continue };
                    let raw: RawPreset = if body.is_null() {
                        RawPreset::default()
                    } else {
                        serde_yaml::from_value(body.clone())?
                    };
                    out.push(raw.into_preset(id, id, ""));
                }
            }
            Ok(Self { default_preset, presets: out })
        } else {
            let raw: RawPreset = serde_yaml::from_value(value.clone())?;
            let preset = RawPreset { name: None, description: String::new(), ..raw }
                .into_preset(DEFAULT_PRESET, "Basic", "Default commands");
            Ok(Self::new(DEFAULT_PRESET, vec![preset]))
        }
    }

    /// Missing, empty or invalid files yield an empty catalog.
    pub async fn load(path: &str) -> Self {
        if !Path::new(path).exists() {
            warn!("commands file not found: {path}");
            return Self::default();
        }
        let txt = match fs::read_to_string(path).await {
            Ok(txt) => txt,
            Err(source) => {
                warn!("{}", ConfigError::Io { path: path.to_string(), source });
                return Self::default();
            }
        };
        if txt.trim().is_empty() {
            warn!("commands file is empty: {path}");
            return Self::default();
        }
        match Self::from_yaml(&txt) {
            Ok(catalog) => {
                info!(
                    "loaded {} presets, {} commands, {} scheduled commands",
                    catalog.presets.len(),
                    catalog.presets.iter().map(|p| p.commands.len()).sum::<usize>(),
                    catalog.presets.iter().map(|p| p.scheduled_commands.len()).sum::<usize>()
                );
                catalog
            }
            Err(e) => {
                warn!("failed to load {path}: {e}");
                Self::default()
            }
        }
    }

    pub fn default_preset(&self) -> &str {
        &self.default_preset
    }

    pub fn presets(&self) -> &[Preset] {
        &self.presets
    }

    pub fn preset(&self, id: &str) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == id)
    }

    pub fn commands_for_preset(&self, id: &str) -> Vec<Command> {
        self.preset(id).map(|p| p.commands.clone()).unwrap_or_default()
    }

    pub fn scheduled_commands_for_preset(&self, id: &str) -> Vec<ScheduledCommand> {
        self.preset(id).map(|p| p.scheduled_commands.clone()).unwrap_or_default()
    }

    pub fn command_for_preset(&self, id: &str, name: &str) -> Option<&Command> {
        self.preset(id)?.command(name)
    }

    pub fn scheduled_command(&self, id: &str, name: &str) -> Option<&ScheduledCommand> {
        self.preset(id)?.scheduled_command(name)
    }

    /// One entry per scheduled command name, first definition wins.
    pub fn unique_scheduled_commands(&self) -> Vec<ScheduledCommand> {
        let mut seen = HashSet::new();
        self.presets
            .iter()
            .flat_map(|p| p.scheduled_commands.iter())
            .filter(|c| seen.insert(c.name.clone()))
            .cloned()
            .collect()
    }

    pub fn scheduled_command_names(&self) -> HashSet<String> {
        self.presets
            .iter()
            .flat_map(|p| p.scheduled_commands.iter().map(|c| c.name.clone()))
            .collect()
    }
}
