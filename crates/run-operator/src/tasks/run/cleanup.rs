//! Garbage collection of finished worker Deployments and the namespaces they
//! leave empty.
//!
//! Shared by the periodic sweep and by `RunResource` finalization. Every step
//! is idempotent: deleting something already gone counts as done, so a sweep
//! and a reconcile racing on the same Deployment only produce a redundant no-op.

use super::naming::ResourceNaming;
use super::webserver::{LatestRunSource, WebserverClient};
use crate::tasks::config::{ControllerConfig, FinishedPolicyKind};
use crate::tasks::store::{DeploymentStore, ScanScope};
use crate::tasks::types::Result;
use k8s_openapi::api::apps::v1::Deployment;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// How a managed Deployment is judged finished
#[derive(Clone)]
pub enum FinishedPolicy {
    /// Observed replica count is exactly zero
    Replicas,
    /// Run number is below the latest run reported by the dependent service
    RunNumber(Arc<dyn LatestRunSource>),
}

impl std::fmt::Debug for FinishedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Replicas => write!(f, "Replicas"),
            Self::RunNumber(_) => write!(f, "RunNumber"),
        }
    }
}

impl FinishedPolicy {
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        match config.garbage_collection.policy {
            FinishedPolicyKind::Replicas => Ok(Self::Replicas),
            FinishedPolicyKind::RunNumber => Ok(Self::RunNumber(Arc::new(
                WebserverClient::from_config(config)?,
            ))),
        }
    }

    /// Resolve external inputs once for a whole pass
    pub async fn snapshot(&self) -> Result<FinishedRule> {
        match self {
            Self::Replicas => Ok(FinishedRule::ZeroReplicas),
            Self::RunNumber(source) => {
                let latest = source.latest_run_number().await?;
                Ok(FinishedRule::SupersededBy(latest))
            }
        }
    }
}

/// A finished-check with all external inputs already fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishedRule {
    ZeroReplicas,
    SupersededBy(i64),
}

impl FinishedRule {
    /// Unknown state is never finished
    pub fn is_finished(&self, deployment: &Deployment) -> bool {
        match self {
            Self::ZeroReplicas => deployment
                .status
                .as_ref()
                .and_then(|s| s.replicas)
                .is_some_and(|replicas| replicas == 0),
            Self::SupersededBy(latest) => match ResourceNaming::run_number_of(deployment) {
                Ok(run_number) => run_number < *latest,
                Err(e) => {
                    warn!(error = %e, "Skipping deployment with unusable run number");
                    false
                }
            },
        }
    }
}

/// Counts from one collection pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectReport {
    pub deleted_deployments: usize,
    pub deleted_namespaces: usize,
}

#[derive(Clone)]
pub struct GarbageCollector {
    store: Arc<dyn DeploymentStore>,
    policy: FinishedPolicy,
    protected_namespaces: Vec<String>,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        policy: FinishedPolicy,
        protected_namespaces: Vec<String>,
    ) -> Self {
        Self {
            store,
            policy,
            protected_namespaces,
        }
    }

    #[must_use]
    pub fn policy(&self) -> &FinishedPolicy {
        &self.policy
    }

    /// Delete every finished managed Deployment in `scope`, then every
    /// namespace those deletions left empty.
    ///
    /// Only a failure to list or to resolve the policy aborts the pass.
    /// Individual delete failures are logged and left for the next pass.
    #[instrument(skip(self), fields(policy = ?self.policy))]
    pub async fn collect(&self, scope: &ScanScope) -> Result<CollectReport> {
        let rule = self.policy.snapshot().await?;
        let selector = ResourceNaming::managed_selector();
        let deployments = self
            .store
            .list_deployments(scope, Some(&selector))
            .await?;

        let mut report = CollectReport::default();
        for deployment in deployments.iter().filter(|d| rule.is_finished(d)) {
            let (Some(namespace), Some(name)) = (
                deployment.metadata.namespace.as_deref(),
                deployment.metadata.name.as_deref(),
            ) else {
                warn!("Skipping finished deployment without name or namespace");
                continue;
            };

            match self.remove_deployment(namespace, name).await {
                Ok(deleted) => {
                    if deleted {
                        report.deleted_deployments += 1;
                    }
                    if self.cleanup_namespace(namespace).await {
                        report.deleted_namespaces += 1;
                    }
                }
                Err(e) => {
                    warn!(%namespace, %name, error = %e, "Failed to delete finished deployment, retrying next pass");
                }
            }
        }

        info!(
            %scope,
            scanned = deployments.len(),
            deleted_deployments = report.deleted_deployments,
            deleted_namespaces = report.deleted_namespaces,
            "Garbage collection pass finished"
        );
        Ok(report)
    }

    /// Delete one Deployment. `Ok(false)` means it was already gone.
    pub async fn remove_deployment(&self, namespace: &str, name: &str) -> Result<bool> {
        match self.store.delete_deployment(namespace, name).await {
            Ok(()) => {
                info!(%namespace, %name, "Deleted deployment");
                Ok(true)
            }
            Err(e) if e.is_benign() => {
                debug!(%namespace, %name, "Deployment already gone");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Delete `namespace` if it holds no Deployments right now.
    ///
    /// The emptiness check and the delete are not atomic: a Deployment created
    /// in between is a known race. Any failure here is logged and left for
    /// manual intervention; it is never retried.
    pub async fn cleanup_namespace(&self, namespace: &str) -> bool {
        if self.protected_namespaces.iter().any(|p| p == namespace) {
            debug!(%namespace, "Namespace is protected, keeping it");
            return false;
        }

        let scope = ScanScope::Namespace(namespace.to_string());
        match self.store.list_deployments(&scope, None).await {
            Ok(remaining) if !remaining.is_empty() => {
                debug!(%namespace, remaining = remaining.len(), "Namespace still in use");
                return false;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(%namespace, error = %e, "Could not list namespace before cleanup");
                return false;
            }
        }

        match self.store.delete_namespace(namespace).await {
            Ok(()) => {
                info!(%namespace, "Deleted empty namespace");
                true
            }
            Err(e) if e.is_benign() => {
                debug!(%namespace, "Namespace already gone");
                false
            }
            Err(e) => {
                warn!(%namespace, error = %e, "Failed to delete empty namespace, leaving it for manual cleanup");
                false
            }
        }
    }
}
