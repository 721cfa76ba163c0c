use super::naming::{ResourceNaming, RunIdentity, ENV_RUN_NUMBER, ENV_RUN_PIPE};
use crate::tasks::config::ControllerConfig;
use crate::tasks::store::DeploymentStore;
use crate::tasks::template::TemplateSource;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::EnvVar;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Result of [`DeploymentMaterializer::ensure_deployment`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnsureOutcome {
    Created { namespace: String, name: String },
    AlreadyExists { namespace: String, name: String },
}

impl EnsureOutcome {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Created { name, .. } | Self::AlreadyExists { name, .. } => name,
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        match self {
            Self::Created { namespace, .. } | Self::AlreadyExists { namespace, .. } => namespace,
        }
    }
}

/// Renders worker Deployments from the template and creates them idempotently
#[derive(Clone)]
pub struct DeploymentMaterializer {
    store: Arc<dyn DeploymentStore>,
    template: Arc<dyn TemplateSource>,
    config: Arc<ControllerConfig>,
}

impl DeploymentMaterializer {
    pub fn new(
        store: Arc<dyn DeploymentStore>,
        template: Arc<dyn TemplateSource>,
        config: Arc<ControllerConfig>,
    ) -> Self {
        Self {
            store,
            template,
            config,
        }
    }

    /// Name of the Deployment that belongs to `run`
    pub fn deployment_name(&self, run: &RunIdentity) -> Result<String> {
        let template = self.template.load()?;
        Ok(ResourceNaming::deployment_name(&base_name(&template)?, run))
    }

    /// Make sure exactly one worker Deployment exists for `run`.
    ///
    /// An existing Deployment is never touched. A create that loses a race
    /// with a concurrent reconcile reports `AlreadyExists`.
    #[instrument(skip(self), fields(run = %run))]
    pub async fn ensure_deployment(
        &self,
        namespace: Option<&str>,
        run: &RunIdentity,
    ) -> Result<EnsureOutcome> {
        let mut deployment = self.template.load()?;
        let name = ResourceNaming::deployment_name(&base_name(&deployment)?, run);
        let namespace = self.config.namespace_or_fallback(namespace).to_string();

        if self.store.get_deployment(&namespace, &name).await?.is_some() {
            debug!(%namespace, %name, "Deployment already exists, nothing to do");
            return Ok(EnsureOutcome::AlreadyExists { namespace, name });
        }

        deployment
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .extend(ResourceNaming::labels(run));

        let env = self.worker_env(run).await?;
        inject_env(&mut deployment, &env);

        deployment.metadata.name = Some(name.clone());
        deployment.metadata.namespace = Some(namespace.clone());

        match self.store.create_deployment(&namespace, &deployment).await {
            Ok(_) => {
                info!(%namespace, %name, "Created worker deployment");
                Ok(EnsureOutcome::Created { namespace, name })
            }
            Err(Error::CreateConflict { .. }) => {
                info!(%namespace, %name, "Deployment created concurrently, treating as existing");
                Ok(EnsureOutcome::AlreadyExists { namespace, name })
            }
            Err(e) => Err(e),
        }
    }

    /// The four variables appended to every worker container
    async fn worker_env(&self, run: &RunIdentity) -> Result<Vec<EnvVar>> {
        let dependency = &self.config.dependency_service;
        let missing = |reason: &str| Error::DependencyServiceMissing {
            namespace: dependency.namespace.clone(),
            name: dependency.name.clone(),
            reason: reason.to_string(),
        };

        let service = self
            .store
            .get_service(&dependency.namespace, &dependency.name)
            .await?
            .ok_or_else(|| missing("service not found"))?;
        let spec = service.spec.as_ref().ok_or_else(|| missing("service has no spec"))?;
        let host = spec
            .cluster_ip
            .as_deref()
            .filter(|ip| !ip.is_empty() && *ip != "None")
            .ok_or_else(|| missing("service has no cluster IP"))?;
        let port = spec
            .ports
            .as_ref()
            .and_then(|ports| ports.first())
            .map(|p| p.port)
            .ok_or_else(|| missing("service exposes no port"))?;

        Ok(vec![
            env_var(ENV_RUN_NUMBER, run.run_number.to_string()),
            env_var(ENV_RUN_PIPE, run.run_pipe.clone()),
            env_var(&ResourceNaming::service_host_env(&dependency.name), host.to_string()),
            env_var(&ResourceNaming::service_port_env(&dependency.name), port.to_string()),
        ])
    }
}

fn base_name(template: &Deployment) -> Result<String> {
    template
        .metadata
        .name
        .clone()
        .ok_or_else(|| Error::TemplateUnavailable("template has no metadata.name".to_string()))
}

fn env_var(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

/// Append `env` to every container in the pod template.
///
/// Appending keeps any template entry with the same name in place; Kubernetes
/// resolves duplicates last-wins, so the injected value takes effect.
fn inject_env(deployment: &mut Deployment, env: &[EnvVar]) {
    let containers = deployment
        .spec
        .as_mut()
        .and_then(|spec| spec.template.spec.as_mut())
        .map(|pod| pod.containers.iter_mut());

    for container in containers.into_iter().flatten() {
        container
            .env
            .get_or_insert_with(Vec::new)
            .extend(env.iter().cloned());
    }
}
