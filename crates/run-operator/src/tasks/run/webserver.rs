//! Client for the run registry web server, the authority on which run is the
//! latest one taken by the experiment.

use crate::tasks::config::ControllerConfig;
use crate::tasks::run::naming::ResourceNaming;
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Asking for run `-1` returns the latest run without selecting a specific one
const LATEST_RUN_QUERY: i64 = -1;

/// Something that knows the most recent run number
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LatestRunSource: Send + Sync {
    async fn latest_run_number(&self) -> Result<i64>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LatestRunResponse {
    latest_run_number: i64,
}

/// HTTP client for `GET /?run=<n>` on the dependent web server
#[derive(Debug, Clone)]
pub struct WebserverClient {
    base_url: String,
    http: reqwest::Client,
}

impl WebserverClient {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            base_url,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Build the client from `garbageCollection.latestRunEndpoint`, falling back
    /// to the service discovery variables Kubernetes sets for the dependency
    /// service in the operator's own pod.
    pub fn from_config(config: &ControllerConfig) -> Result<Self> {
        if let Some(endpoint) = config.garbage_collection.latest_run_endpoint.as_deref() {
            return Ok(Self::new(endpoint));
        }

        let service = &config.dependency_service.name;
        let host_var = ResourceNaming::service_host_env(service);
        let port_var = ResourceNaming::service_port_env(service);
        match (std::env::var(&host_var), std::env::var(&port_var)) {
            (Ok(host), Ok(port)) if !host.is_empty() && !port.is_empty() => {
                Ok(Self::new(format!("http://{host}:{port}")))
            }
            _ => Err(Error::ConfigError(format!(
                "no latestRunEndpoint configured and {host_var}/{port_var} are not set"
            ))),
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Query the server for run `run`; `-1` asks for the latest
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn query_run(&self, run: i64) -> Result<i64> {
        let url = format!("{}/", self.base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("run", run.to_string())])
            .send()
            .await
            .map_err(|e| Error::DependencyQueryFailed(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::DependencyQueryFailed(format!(
                "GET {url} returned {status}"
            )));
        }

        let body: LatestRunResponse = response
            .json()
            .await
            .map_err(|e| Error::DependencyQueryFailed(format!("invalid response body: {e}")))?;

        debug!(latest_run_number = body.latest_run_number, "Latest run fetched");
        Ok(body.latest_run_number)
    }
}

#[async_trait]
impl LatestRunSource for WebserverClient {
    async fn latest_run_number(&self) -> Result<i64> {
        self.query_run(LATEST_RUN_QUERY).await
    }
}
