use super::cleanup::{FinishedPolicy, FinishedRule, GarbageCollector};
use super::discovery::RunDiscovery;
use super::naming::RunIdentity;
use super::resources::{DeploymentMaterializer, EnsureOutcome};
use crate::crds::{RunResource, RunResourceStatus};
use crate::tasks::config::ControllerConfig;
use crate::tasks::store::DeploymentStore;
use crate::tasks::template::TemplateSource;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use kube::ResourceExt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Where a call sits in the host's retry budget
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryInfo {
    /// 1-based attempt number for the current change
    pub attempt: u32,
    pub is_last_attempt: bool,
}

impl RetryInfo {
    #[must_use]
    pub fn new(attempt: u32, max_attempts: u32) -> Self {
        Self {
            attempt,
            is_last_attempt: attempt >= max_attempts,
        }
    }
}

/// Callbacks the controller host drives for each `RunResource`
#[async_trait]
pub trait RunLifecycle: Send + Sync {
    /// Bring the cluster in line with a created or updated run and report
    /// the status to record. Errors make the host retry.
    async fn reconcile(&self, run: &RunResource, retry: RetryInfo) -> Result<RunResourceStatus>;

    /// Release everything owned by a run that is being deleted
    async fn finalize(&self, run: &RunResource, retry: RetryInfo) -> Result<()>;

    /// Called once a run has used up its retry budget.
    ///
    /// No terminal-failure behavior is defined yet (e.g. marking the run as
    /// failed), so the default only records the event.
    fn on_last_attempt_failed(&self, run: &RunResource, error: &Error) {
        warn!(
            run = %run.name_any(),
            namespace = ?run.namespace(),
            error = %error,
            "Run exhausted its retries; no terminal action is configured"
        );
    }
}

/// Production [`RunLifecycle`] built from the materializer, discovery and
/// garbage collector
#[derive(Clone)]
pub struct RunController {
    store: Arc<dyn DeploymentStore>,
    materializer: DeploymentMaterializer,
    discovery: RunDiscovery,
    collector: GarbageCollector,
    config: Arc<ControllerConfig>,
}

impl RunController {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        template: Arc<dyn TemplateSource>,
        policy: FinishedPolicy,
        config: Arc<ControllerConfig>,
    ) -> Self {
        let materializer = DeploymentMaterializer::new(store.clone(), template, config.clone());
        let discovery = RunDiscovery::new(store.clone());
        let collector = GarbageCollector::new(
            store.clone(),
            policy,
            config.garbage_collection.protected_namespaces.clone(),
        );
        Self {
            store,
            materializer,
            discovery,
            collector,
            config,
        }
    }

    #[must_use]
    pub fn collector(&self) -> &GarbageCollector {
        &self.collector
    }

    fn identity(run: &RunResource) -> RunIdentity {
        RunIdentity::new(run.spec.run_number, run.spec.run_pipe.clone())
    }

    /// The rule the collector applies, so the status never disagrees with it.
    /// An unreachable dependency reports the run as still running.
    async fn finished_rule(&self) -> Option<FinishedRule> {
        match self.collector.policy().snapshot().await {
            Ok(rule) => Some(rule),
            Err(e) => {
                warn!(error = %e, "Could not resolve finished policy, reporting run as running");
                None
            }
        }
    }

    /// `finished` is `None` when no Deployment backs the run any more
    fn observed_status(name: String, finished: Option<bool>, message: &str) -> RunResourceStatus {
        RunResourceStatus {
            is_run_finished: finished.unwrap_or(true),
            deployment_name: Some(name),
            message: Some(message.to_string()),
            last_update: None,
        }
    }
}

#[async_trait]
impl RunLifecycle for RunController {
    #[instrument(skip(self, run), fields(run = %run.name_any(), run_number = run.spec.run_number, run_pipe = %run.spec.run_pipe))]
    async fn reconcile(&self, run: &RunResource, retry: RetryInfo) -> Result<RunResourceStatus> {
        let identity = Self::identity(run);
        let run_namespace = run.namespace();
        let namespace = self
            .config
            .namespace_or_fallback(run_namespace.as_deref())
            .to_string();
        let name = self.materializer.deployment_name(&identity)?;

        // A finished run is never brought back after its Deployment is collected.
        // The recorded status only counts while it names the current Deployment.
        if let Some(status) = run
            .status
            .as_ref()
            .filter(|s| s.is_run_finished && s.deployment_name.as_deref() == Some(name.as_str()))
        {
            info!(%name, "Run already finished, nothing to do");
            return Ok(status.clone());
        }

        let existing = self.store.get_deployment(&namespace, &name).await?;

        if self.config.discovery.skip_superseded && existing.is_none() {
            let latest = self
                .discovery
                .latest_deployed_run_number(&self.config.discovery.scope())
                .await?;
            if latest >= i64::from(identity.run_number) {
                info!(latest, "Equal or newer run already deployed, skipping materialization");
                return Ok(Self::observed_status(
                    name,
                    None,
                    &format!("Superseded by run {latest}"),
                ));
            }
        }

        // Recorded earlier but gone now: the collector already reclaimed it
        let created_before = run
            .status
            .as_ref()
            .and_then(|s| s.deployment_name.as_deref())
            == Some(name.as_str());
        if created_before && existing.is_none() {
            info!(%namespace, %name, "Worker deployment was garbage collected");
            return Ok(Self::observed_status(
                name,
                None,
                "Worker deployment finished and was collected",
            ));
        }

        let outcome = self
            .materializer
            .ensure_deployment(run_namespace.as_deref(), &identity)
            .await?;
        info!(attempt = retry.attempt, outcome = ?outcome, "Worker deployment ensured");

        let current = self
            .store
            .get_deployment(outcome.namespace(), outcome.name())
            .await?;
        let finished = match current {
            Some(deployment) => self
                .finished_rule()
                .await
                .is_some_and(|rule| rule.is_finished(&deployment)),
            None => false,
        };
        let message = match (&outcome, finished) {
            (_, true) => "Worker deployment finished",
            (EnsureOutcome::Created { .. }, false) => "Worker deployment created",
            (EnsureOutcome::AlreadyExists { .. }, false) => "Worker deployment running",
        };

        Ok(Self::observed_status(
            outcome.name().to_string(),
            Some(finished),
            message,
        ))
    }

    #[instrument(skip(self, run), fields(run = %run.name_any(), run_number = run.spec.run_number, run_pipe = %run.spec.run_pipe))]
    async fn finalize(&self, run: &RunResource, retry: RetryInfo) -> Result<()> {
        let identity = Self::identity(run);
        let run_namespace = run.namespace();
        let namespace = self.config.namespace_or_fallback(run_namespace.as_deref());
        let name = self.materializer.deployment_name(&identity)?;

        let deleted = self.collector.remove_deployment(namespace, &name).await?;
        info!(%namespace, %name, deleted, attempt = retry.attempt, "Run deployment released");

        self.collector.cleanup_namespace(namespace).await;
        Ok(())
    }
}
