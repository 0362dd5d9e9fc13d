//! `labgrid-client` driven coordinator.
//!
//! Every call spawns the client program with `kill_on_drop`, so dropping the
//! future (timeout, cancelled request) terminates the child process.

use super::{Coordinator, ExporterResources};
use crate::config::split_owner;
use crate::error::CoordinatorError;
use crate::models::{CommandResult, Resource};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Budget for control-plane calls (resources, acquire, release).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CliCoordinator {
    program: String,
    base_args: Vec<String>,
    owner_host: String,
    owner_user: String,
}

#[derive(Debug, Deserialize)]
struct DumpEntry {
    #[serde(default)]
    cls: Option<String>,
    #[serde(default)]
    params: Option<serde_json::Map<String, serde_json::Value>>,
    #[serde(default)]
    acquired: Option<String>,
    #[serde(default)]
    avail: bool,
}

type ResourceDump = HashMap<String, HashMap<String, HashMap<String, DumpEntry>>>;

impl CliCoordinator {
    /// `program` is a command line such as `labgrid-client -x {url}`; `{url}` is
    /// substituted before splitting. `owner` is `host/user` or a bare user,
    /// which gets the default host.
    pub fn new(program: &str, url: &str, owner: &str) -> Result<Self, shell_words::ParseError> {
        let mut words = shell_words::split(&program.replace("{url}", url))?;
        let program = if words.is_empty() {
            "labgrid-client".to_string()
        } else {
            words.remove(0)
        };
        let (owner_host, owner_user) = split_owner(owner);
        Ok(Self { program, base_args: words, owner_host, owner_user })
    }

    async fn invoke(&self, args: &[&str], timeout: Duration) -> Result<Output, CoordinatorError> {
        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(&self.base_args)
            .args(args)
            .env("LG_HOSTNAME", &self.owner_host)
            .env("LG_USERNAME", &self.owner_user)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!("invoking {} {:?}", self.program, args);

        let child = cmd
            .spawn()
            .map_err(|e| CoordinatorError::Transport(format!("failed to spawn {}: {e}", self.program)))?;
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(CoordinatorError::Transport(e.to_string())),
            Err(_) => Err(CoordinatorError::TimedOut(timeout)),
        }
    }
}

fn failure_message(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if !stderr.is_empty() {
        return stderr;
    }
    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if stdout.is_empty() {
        format!("exited with {}", output.status)
    } else {
        stdout
    }
}

/// Parses the `{exporter: {group: {class: {params, acquired, avail}}}}` dump.
pub fn parse_resource_dump(raw: &str) -> Result<ExporterResources, CoordinatorError> {
    let dump: ResourceDump = serde_json::from_str(raw)
        .map_err(|e| CoordinatorError::Rejected(format!("invalid resource dump: {e}")))?;

    let mut out = ExporterResources::new();
    for (exporter, groups) in dump {
        let mut resources = Vec::new();
        for (group, classes) in groups {
            for (key, entry) in classes {
                resources.push(Resource {
                    exporter: exporter.clone(),
                    group: group.clone(),
                    cls: entry.cls.unwrap_or(key),
                    params: entry.params.unwrap_or_default(),
                    acquired: entry.acquired.filter(|o| !o.is_empty()),
                    available: entry.avail,
                });
            }
        }
        resources.sort_by(|a, b| (&a.group, &a.cls).cmp(&(&b.group, &b.cls)));
        out.insert(exporter, resources);
    }
    Ok(out)
}

#[async_trait]
impl Coordinator for CliCoordinator {
    async fn fetch_resources(&self) -> Result<ExporterResources, CoordinatorError> {
        let output = self.invoke(&["resources", "--json"], CONTROL_TIMEOUT).await?;
        if !output.status.success() {
            return Err(CoordinatorError::Transport(failure_message(&output)));
        }
        parse_resource_dump(&String::from_utf8_lossy(&output.stdout))
    }

    async fn request_ownership(&self, target: &str, _owner: &str) -> Result<(), CoordinatorError> {
        // Owner identity travels through LG_HOSTNAME/LG_USERNAME.
        let output = self.invoke(&["-p", target, "acquire"], CONTROL_TIMEOUT).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CoordinatorError::Rejected(failure_message(&output)))
        }
    }

    async fn release_ownership(&self, target: &str) -> Result<(), CoordinatorError> {
        let output = self.invoke(&["-p", target, "release"], CONTROL_TIMEOUT).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(CoordinatorError::Rejected(failure_message(&output)))
        }
    }

    async fn run(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, CoordinatorError> {
        let output = self.invoke(&["-p", target, "ssh", "--", command], timeout).await?;
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        Ok(CommandResult::new(text, output.status.code().unwrap_or(-1)))
    }

    fn kind(&self) -> &'static str {
        "cli"
    }
}
