/**
 * COORDINATOR - Boundary to the external fleet-management service
 *
 * ROLE :
 * The coordinator is authoritative for resource discovery and place ownership.
 * Everything the kernel knows about the fleet comes through this trait.
 *
 * IMPLEMENTATIONS :
 * - `cli::CliCoordinator`  : drives the `labgrid-client` program
 * - `mock::MockCoordinator`: in-memory simulated fleet (dev mode + tests)
 */

pub mod cli;
pub mod mock;

use crate::error::CoordinatorError;
use crate::models::{CommandResult, Resource};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

pub use cli::CliCoordinator;
pub use mock::MockCoordinator;

/// Resources reported in one cycle, keyed by exporter name.
pub type ExporterResources = HashMap<String, Vec<Resource>>;

#[async_trait]
pub trait Coordinator: Send + Sync + 'static {
    /// Current exporter -> resources snapshot. `Resource::available` carries the
    /// coordinator's raw flag; the registry derives effective availability.
    async fn fetch_resources(&self) -> Result<ExporterResources, CoordinatorError>;

    async fn request_ownership(&self, target: &str, owner: &str) -> Result<(), CoordinatorError>;

    async fn release_ownership(&self, target: &str) -> Result<(), CoordinatorError>;

    async fn run(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, CoordinatorError>;

    fn kind(&self) -> &'static str;
}
