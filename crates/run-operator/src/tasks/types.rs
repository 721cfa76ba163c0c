use crate::tasks::config::ControllerConfig;
use crate::tasks::run::controller::RunLifecycle;
use dashmap::DashMap;
use kube::Client;
use std::sync::Arc;
use thiserror::Error;

/// Finalizer placed on every `RunResource` so deletion waits for Deployment cleanup
pub const RUN_FINALIZER_NAME: &str = "operator.tdaq.cern.ch/run-cleanup";

#[derive(Debug, Error)]
pub enum Error {
    /// The base Deployment definition could not be read or parsed
    #[error("Deployment template unavailable: {0}")]
    TemplateUnavailable(String),

    /// The companion service whose address is injected into workers is absent
    #[error("Dependency service {namespace}/{name} missing: {reason}")]
    DependencyServiceMissing {
        namespace: String,
        name: String,
        reason: String,
    },

    /// Object already exists; benign during creation
    #[error("{kind} {namespace}/{name} already exists")]
    CreateConflict {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Object already gone; benign during deletion
    #[error("{kind} {name} not found")]
    DeleteNotFound { kind: &'static str, name: String },

    /// Generic cluster or network failure, left to the scheduler's retry
    #[error("Cluster call failed: {0}")]
    ClusterCallFailed(String),

    /// Malformed run-number label met during a scan
    #[error("Deployment {deployment}: cannot parse run number {value:?}")]
    ParseError { deployment: String, value: String },

    /// The latest-run query against the dependent service failed
    #[error("Dependency query failed: {0}")]
    DependencyQueryFailed(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Object is missing its name or namespace")]
    MissingObjectKey,
}

impl Error {
    /// Errors that callers treat as success
    #[must_use]
    pub fn is_benign(&self) -> bool {
        matches!(self, Error::CreateConflict { .. } | Error::DeleteNotFound { .. })
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self {
        Error::ClusterCallFailed(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Shared state handed to every reconcile call by the kube-rs runtime
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    pub lifecycle: Arc<dyn RunLifecycle>,
    /// Failed attempts per `namespace/name`, cleared on success
    pub attempts: Arc<DashMap<String, u32>>,
}
