//! Base Deployment definition for worker Deployments.
//!
//! The template is only ever read; every run gets a fresh copy that the
//! materializer then renames, labels and injects environment into.

use crate::tasks::config::TemplateConfig;
use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const EMBEDDED_WORKER_TEMPLATE: &str = include_str!("../../templates/deploy-worker.yaml");

/// Source of the base worker Deployment
pub trait TemplateSource: Send + Sync {
    /// Load a fresh copy of the template. The result always carries a
    /// `metadata.name`, which is the base of every worker Deployment name.
    fn load(&self) -> Result<Deployment>;
}

/// Template compiled into the binary
#[derive(Debug, Default, Clone, Copy)]
pub struct EmbeddedTemplate;

impl TemplateSource for EmbeddedTemplate {
    fn load(&self) -> Result<Deployment> {
        parse_template(EMBEDDED_WORKER_TEMPLATE, "embedded template")
    }
}

/// Template read from disk on every load, so a re-mounted ConfigMap is picked up
#[derive(Debug, Clone)]
pub struct FileTemplate {
    path: PathBuf,
}

impl FileTemplate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TemplateSource for FileTemplate {
    fn load(&self) -> Result<Deployment> {
        let raw = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::TemplateUnavailable(format!("cannot read {}: {e}", self.path.display()))
        })?;
        debug!(path = %self.path.display(), "Loaded deployment template from file");
        parse_template(&raw, &self.path.display().to_string())
    }
}

/// Fixed in-memory template
#[derive(Debug, Clone)]
pub struct StaticTemplate {
    deployment: Deployment,
}

impl StaticTemplate {
    #[must_use]
    pub fn new(deployment: Deployment) -> Self {
        Self { deployment }
    }
}

impl TemplateSource for StaticTemplate {
    fn load(&self) -> Result<Deployment> {
        require_name(self.deployment.clone(), "static template")
    }
}

/// Pick the template source described by configuration
#[must_use]
pub fn from_config(config: &TemplateConfig) -> Arc<dyn TemplateSource> {
    match config.path.as_deref().map(str::trim) {
        Some(path) if !path.is_empty() => Arc::new(FileTemplate::new(path)),
        _ => Arc::new(EmbeddedTemplate),
    }
}

fn parse_template(raw: &str, origin: &str) -> Result<Deployment> {
    let deployment: Deployment = serde_yaml::from_str(raw)
        .map_err(|e| Error::TemplateUnavailable(format!("cannot parse {origin}: {e}")))?;
    require_name(deployment, origin)
}

fn require_name(deployment: Deployment, origin: &str) -> Result<Deployment> {
    match deployment.metadata.name.as_deref() {
        Some(name) if !name.trim().is_empty() => Ok(deployment),
        _ => Err(Error::TemplateUnavailable(format!(
            "{origin} has no metadata.name"
        ))),
    }
}
