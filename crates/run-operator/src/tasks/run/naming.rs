use crate::tasks::types::{Error, Result};
use k8s_openapi::api::apps::v1::Deployment;
use std::collections::BTreeMap;

/// Zero-padding width of the run number inside Deployment names.
///
/// Discovery and deletion match existing Deployments created with this
/// width; it must stay the same for the lifetime of a cluster.
pub const RUN_NUMBER_PADDING: usize = 4;

pub const LABEL_RUN_NUMBER: &str = "tdaq.run-number";
pub const LABEL_RUN_PIPE: &str = "tdaq.run-pipe";
pub const LABEL_WORKER: &str = "tdaq.worker";
pub const LABEL_WORKER_VALUE: &str = "true";

pub const ENV_RUN_NUMBER: &str = "RUN_NUMBER";
pub const ENV_RUN_PIPE: &str = "RUN_PIPE";

/// Identity of one run; selects exactly one worker Deployment
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunIdentity {
    pub run_number: u32,
    pub run_pipe: String,
}

impl RunIdentity {
    pub fn new(run_number: u32, run_pipe: impl Into<String>) -> Self {
        Self {
            run_number,
            run_pipe: run_pipe.into(),
        }
    }
}

impl std::fmt::Display for RunIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "run {} ({})", self.run_number, self.run_pipe)
    }
}

pub struct ResourceNaming;

impl ResourceNaming {
    /// Deployment name for a run.
    /// Format: {base}-{run number zero padded to RUN_NUMBER_PADDING}-{run pipe}
    /// This is the single source of truth for worker Deployment names, used
    /// both when creating and when deleting
    pub fn deployment_name(base_name: &str, run: &RunIdentity) -> String {
        format!(
            "{base_name}-{:0width$}-{}",
            run.run_number,
            run.run_pipe,
            width = RUN_NUMBER_PADDING
        )
    }

    /// Labels stamped on every managed Deployment
    pub fn labels(run: &RunIdentity) -> BTreeMap<String, String> {
        BTreeMap::from([
            (LABEL_RUN_NUMBER.to_string(), run.run_number.to_string()),
            (LABEL_RUN_PIPE.to_string(), run.run_pipe.clone()),
            (LABEL_WORKER.to_string(), LABEL_WORKER_VALUE.to_string()),
        ])
    }

    /// Label selector matching only Deployments created by this controller
    pub fn managed_selector() -> String {
        format!("{LABEL_WORKER}={LABEL_WORKER_VALUE}")
    }

    /// Environment prefix Kubernetes uses for a service's discovery variables,
    /// e.g. `webserver-service` -> `WEBSERVER_SERVICE`
    pub fn service_env_prefix(service_name: &str) -> String {
        service_name
            .chars()
            .map(|c| match c {
                '-' | '.' => '_',
                other => other.to_ascii_uppercase(),
            })
            .collect()
    }

    pub fn service_host_env(service_name: &str) -> String {
        format!("{}_SERVICE_HOST", Self::service_env_prefix(service_name))
    }

    pub fn service_port_env(service_name: &str) -> String {
        format!("{}_SERVICE_PORT", Self::service_env_prefix(service_name))
    }

    /// Run number recorded on a Deployment's labels.
    ///
    /// Reads the label, never the name: names produced under other padding
    /// widths would not parse back reliably.
    pub fn run_number_of(deployment: &Deployment) -> Result<i64> {
        let raw = deployment
            .metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(LABEL_RUN_NUMBER));

        match raw {
            Some(value) => value.trim().parse::<i64>().map_err(|_| Error::ParseError {
                deployment: Self::display_key(deployment),
                value: value.clone(),
            }),
            None => Err(Error::ParseError {
                deployment: Self::display_key(deployment),
                value: String::new(),
            }),
        }
    }

    /// `namespace/name` for log lines
    pub fn display_key(deployment: &Deployment) -> String {
        format!(
            "{}/{}",
            deployment.metadata.namespace.as_deref().unwrap_or("-"),
            deployment.metadata.name.as_deref().unwrap_or("-")
        )
    }
}
