use super::naming::ResourceNaming;
use crate::tasks::store::{DeploymentStore, ScanScope};
use crate::tasks::types::Result;
use std::sync::Arc;
use tracing::{debug, warn};

/// Returned when no managed Deployment carries a usable run number
pub const NO_RUN: i64 = -1;

/// Answers "what is the latest run already deployed?" from Deployment labels
#[derive(Clone)]
pub struct RunDiscovery {
    store: Arc<dyn DeploymentStore>,
}

impl RunDiscovery {
    pub fn new(store: Arc<dyn DeploymentStore>) -> Self {
        Self { store }
    }

    /// Highest run number among managed Deployments in `scope`, or [`NO_RUN`].
    ///
    /// Best effort: Deployments created while the scan runs may or may not be
    /// seen. Items with a missing or malformed run-number label are skipped.
    pub async fn latest_deployed_run_number(&self, scope: &ScanScope) -> Result<i64> {
        let selector = ResourceNaming::managed_selector();
        let deployments = self
            .store
            .list_deployments(scope, Some(&selector))
            .await?;

        let latest = deployments
            .iter()
            .filter_map(|d| match ResourceNaming::run_number_of(d) {
                Ok(n) => Some(n),
                Err(e) => {
                    warn!(error = %e, "Skipping deployment during run discovery");
                    None
                }
            })
            .fold(NO_RUN, i64::max);

        debug!(%scope, scanned = deployments.len(), latest, "Run discovery finished");
        Ok(latest)
    }
}
