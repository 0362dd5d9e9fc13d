/**
 * TARGET REGISTRY - Outage-tolerant local view of the fleet
 *
 * ROLE :
 * Turns the coordinator's eventually-consistent exporter -> resource snapshots
 * into stable `Target` values.
 *
 * RULES :
 * - A resource is available only if the coordinator flags it `avail` AND it
 *   reports a non-empty parameter payload.
 * - Exporters are never deleted: one missing from a cycle keeps its resources,
 *   all flagged unavailable, so its targets stay listed as offline.
 * - A failed refresh leaves the known map untouched.
 */

use crate::coordinator::{Coordinator, ExporterResources};
use crate::error::CoordinatorError;
use crate::models::{Resource, Target, TargetStatus};
use crate::scheduler::TargetSource;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone)]
pub struct RefreshReport {
    pub exporters_reported: usize,
    /// Known exporters absent from this cycle (flagged unavailable).
    pub exporters_missing: Vec<String>,
    pub targets: usize,
}

pub struct TargetRegistry {
    coordinator: Arc<dyn Coordinator>,
    /// exporter -> resources, availability already derived
    known: RwLock<HashMap<String, Vec<Resource>>>,
    /// Last state handed out by `drain_changes`.
    published: Mutex<BTreeMap<String, Target>>,
}

impl TargetRegistry {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            known: RwLock::new(HashMap::new()),
            published: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Arc<dyn Coordinator> {
        &self.coordinator
    }

    /// Fetches a snapshot and merges it into the known-exporter map.
    pub async fn refresh(&self) -> Result<RefreshReport, CoordinatorError> {
        let snapshot = match self.coordinator.fetch_resources().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!("registry refresh failed, keeping previous view: {e}");
                return Err(e);
            }
        };

        let report = self.merge(snapshot);
        debug!(
            "registry refreshed: {} exporters reported, {} missing, {} targets",
            report.exporters_reported,
            report.exporters_missing.len(),
            report.targets
        );
        Ok(report)
    }

    fn merge(&self, snapshot: ExporterResources) -> RefreshReport {
        let reported: HashSet<String> = snapshot.keys().cloned().collect();
        let mut known = self.known.write();

        for (exporter, mut resources) in snapshot {
            for r in resources.iter_mut() {
                r.available = r.available && !r.params.is_empty();
            }
            known.insert(exporter, resources);
        }

        let mut missing = Vec::new();
        for (exporter, resources) in known.iter_mut() {
            if reported.contains(exporter) {
                continue;
            }
            if resources.iter().any(|r| r.available) {
                info!("exporter {exporter} missing from coordinator, marking its resources offline");
            }
            for r in resources.iter_mut() {
                r.available = false;
            }
            missing.push(exporter.clone());
        }
        missing.sort();

        RefreshReport {
            exporters_reported: reported.len(),
            exporters_missing: missing,
            targets: derive_targets(&known).len(),
        }
    }

    pub fn list(&self) -> Vec<Target> {
        derive_targets(&self.known.read()).into_values().collect()
    }

    /// `None` only for names never seen in any refresh cycle.
    pub fn get(&self, name: &str) -> Option<Target> {
        derive_targets(&self.known.read()).remove(name)
    }

    /// Owner according to the last successful refresh.
    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.get(name)
            .map(|t| t.acquired_by)
            .filter(|owner| !owner.is_empty())
    }

    /// Targets whose derived state differs from what the previous call returned.
    pub fn drain_changes(&self) -> Vec<Target> {
        let current = derive_targets(&self.known.read());
        let mut published = self.published.lock();
        let changed = current
            .values()
            .filter(|t| published.get(&t.name) != Some(*t))
            .cloned()
            .collect();
        *published = current;
        changed
    }
}

#[async_trait]
impl TargetSource for TargetRegistry {
    async fn targets(&self) -> Vec<Target> {
        self.list()
    }
}

fn derive_targets(known: &HashMap<String, Vec<Resource>>) -> BTreeMap<String, Target> {
    let mut grouped: BTreeMap<String, Vec<Resource>> = BTreeMap::new();
    for resource in known.values().flatten() {
        grouped.entry(resource.group.clone()).or_default().push(resource.clone());
    }

    grouped
        .into_iter()
        .map(|(name, mut resources)| {
            resources.sort_by(|a, b| (&a.exporter, &a.cls).cmp(&(&b.exporter, &b.cls)));
            let owner = resources
                .iter()
                .filter_map(|r| r.acquired.as_deref())
                .find(|o| !o.is_empty())
                .unwrap_or_default()
                .to_string();
            let status = if resources.iter().any(|r| !r.available) {
                TargetStatus::Offline
            } else if !owner.is_empty() {
                TargetStatus::Acquired
            } else {
                TargetStatus::Available
            };
            let ip_address = resources.iter().find_map(|r| r.address()).map(str::to_string);
            let target = Target {
                name: name.clone(),
                status,
                acquired_by: owner,
                resources,
                ip_address,
                scheduled_outputs: HashMap::new(),
            };
            (name, target)
        })
        .collect()
}
