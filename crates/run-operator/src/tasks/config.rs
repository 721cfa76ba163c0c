//! Run Operator Configuration
//!
//! Mounted as `config.yaml` from a ConfigMap. Every section has defaults so a
//! missing or partial file still yields a usable controller.

use crate::tasks::run::naming::ResourceNaming;
use crate::tasks::store::ScanScope;
use serde::{Deserialize, Serialize};

/// Main controller configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControllerConfig {
    /// Namespace to watch for `RunResource`s; all namespaces when unset
    #[serde(default)]
    pub watch_namespace: Option<String>,

    /// Namespace used when a run arrives without one
    #[serde(default = "default_fallback_namespace")]
    pub fallback_namespace: String,

    #[serde(default)]
    pub template: TemplateConfig,

    #[serde(default)]
    pub dependency_service: DependencyServiceConfig,

    #[serde(default)]
    pub discovery: DiscoveryConfig,

    #[serde(default)]
    pub garbage_collection: GarbageCollectionConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub health: HealthConfig,
}

/// Deployment template configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    /// Path to a Deployment YAML; the embedded template is used when unset
    #[serde(default)]
    pub path: Option<String>,
}

/// Companion service whose address is injected into every worker container
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyServiceConfig {
    #[serde(default = "default_dependency_namespace")]
    pub namespace: String,

    #[serde(default = "default_dependency_name")]
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryConfig {
    /// Restrict the latest-run scan to one namespace; cluster-wide when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Skip materialization when an equal-or-newer run is already deployed
    #[serde(default)]
    pub skip_superseded: bool,
}

impl DiscoveryConfig {
    #[must_use]
    pub fn scope(&self) -> ScanScope {
        ScanScope::from_namespace(self.namespace.as_deref())
    }
}

/// Which rule marks a managed Deployment as finished
#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum FinishedPolicyKind {
    /// Observed replica count is exactly zero
    #[default]
    Replicas,
    /// Run number is below the latest run reported by the dependent service
    RunNumber,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GarbageCollectionConfig {
    /// Whether the periodic sweep runs
    #[serde(default = "default_gc_enabled")]
    pub enabled: bool,

    #[serde(default = "default_gc_interval")]
    pub interval_seconds: u64,

    #[serde(default)]
    pub policy: FinishedPolicyKind,

    /// Restrict the sweep to one namespace; cluster-wide when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Base URL of the latest-run endpoint, e.g. `http://10.0.0.12:8080`.
    /// Falls back to the dependency service's `*_SERVICE_HOST`/`*_SERVICE_PORT`
    /// environment when unset.
    #[serde(default)]
    pub latest_run_endpoint: Option<String>,

    /// Namespaces that namespace cleanup never deletes
    #[serde(default = "default_protected_namespaces")]
    pub protected_namespaces: Vec<String>,
}

impl GarbageCollectionConfig {
    #[must_use]
    pub fn scope(&self) -> ScanScope {
        ScanScope::from_namespace(self.namespace.as_deref())
    }
}

/// Requeue policy applied by the controller host after a failed reconcile
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_retry_interval")]
    pub interval_seconds: u64,

    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthConfig {
    #[serde(default = "default_health_port")]
    pub port: u16,
}

fn default_fallback_namespace() -> String {
    "default".to_string()
}

fn default_dependency_namespace() -> String {
    "default".to_string()
}

fn default_dependency_name() -> String {
    "webserver-service".to_string()
}

fn default_gc_enabled() -> bool {
    true
}

fn default_gc_interval() -> u64 {
    30 // seconds
}

fn default_protected_namespaces() -> Vec<String> {
    ["default", "kube-system", "kube-public", "kube-node-lease"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_retry_interval() -> u64 {
    10
}

fn default_retry_attempts() -> u32 {
    10
}

fn default_health_port() -> u16 {
    8080
}

impl Default for DependencyServiceConfig {
    fn default() -> Self {
        Self {
            namespace: default_dependency_namespace(),
            name: default_dependency_name(),
        }
    }
}

impl Default for GarbageCollectionConfig {
    fn default() -> Self {
        Self {
            enabled: default_gc_enabled(),
            interval_seconds: default_gc_interval(),
            policy: FinishedPolicyKind::default(),
            namespace: None,
            latest_run_endpoint: None,
            protected_namespaces: default_protected_namespaces(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_retry_interval(),
            max_attempts: default_retry_attempts(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: default_health_port(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            fallback_namespace: default_fallback_namespace(),
            template: TemplateConfig::default(),
            dependency_service: DependencyServiceConfig::default(),
            discovery: DiscoveryConfig::default(),
            garbage_collection: GarbageCollectionConfig::default(),
            retry: RetryConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that configuration values are usable
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.fallback_namespace.trim().is_empty() {
            return Err(anyhow::anyhow!("fallbackNamespace must not be empty"));
        }

        if self.dependency_service.name.trim().is_empty()
            || self.dependency_service.namespace.trim().is_empty()
        {
            return Err(anyhow::anyhow!(
                "dependencyService.namespace and dependencyService.name must both be set"
            ));
        }

        if self.garbage_collection.enabled && self.garbage_collection.interval_seconds == 0 {
            return Err(anyhow::anyhow!(
                "garbageCollection.intervalSeconds must be greater than zero"
            ));
        }

        if self.retry.interval_seconds == 0 || self.retry.max_attempts == 0 {
            return Err(anyhow::anyhow!(
                "retry.intervalSeconds and retry.maxAttempts must be greater than zero"
            ));
        }

        match &self.garbage_collection.latest_run_endpoint {
            Some(endpoint) => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(anyhow::anyhow!(format!(
                        "garbageCollection.latestRunEndpoint must be an http(s) URL, got '{endpoint}'"
                    )));
                }
            }
            None if self.garbage_collection.policy == FinishedPolicyKind::RunNumber => {
                let host_var = ResourceNaming::service_host_env(&self.dependency_service.name);
                if std::env::var(&host_var).is_err() {
                    return Err(anyhow::anyhow!(
                        "runNumber policy needs garbageCollection.latestRunEndpoint or {host_var}"
                    ));
                }
            }
            None => {}
        }

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Namespace a run lands in when its resource carries none
    #[must_use]
    pub fn namespace_or_fallback<'a>(&'a self, namespace: Option<&'a str>) -> &'a str {
        namespace
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or(&self.fallback_namespace)
    }
}
