//! Cluster access used by the run lifecycle core.
//!
//! Everything the materializer, discovery and garbage collector need from the
//! API server goes through [`DeploymentStore`], so the same logic runs against
//! the live cluster ([`KubeStore`]) or the in-memory fake ([`InMemoryStore`]).

pub mod memory;

use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::Client;
use tracing::debug;

pub use memory::InMemoryStore;

/// Where a label scan looks
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    Cluster,
    Namespace(String),
}

impl ScanScope {
    #[must_use]
    pub fn from_namespace(namespace: Option<&str>) -> Self {
        match namespace.map(str::trim) {
            Some(ns) if !ns.is_empty() => ScanScope::Namespace(ns.to_string()),
            _ => ScanScope::Cluster,
        }
    }
}

impl std::fmt::Display for ScanScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cluster => write!(f, "cluster"),
            Self::Namespace(ns) => write!(f, "namespace/{ns}"),
        }
    }
}

/// Repository over the Deployments, Namespaces and Services the core touches.
///
/// Implementations report a create on an existing object as
/// [`Error::CreateConflict`] and a delete of a missing object as
/// [`Error::DeleteNotFound`]; every other failure is
/// [`Error::ClusterCallFailed`]. Lookups of missing objects return `None`.
#[async_trait]
pub trait DeploymentStore: Send + Sync {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;

    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;

    /// List Deployments in `scope`, optionally filtered by a label selector
    /// such as `tdaq.worker=true`
    async fn list_deployments(
        &self,
        scope: &ScanScope,
        selector: Option<&str>,
    ) -> Result<Vec<Deployment>>;

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_namespace(&self, name: &str) -> Result<()>;

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
}

/// Production store backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl DeploymentStore for KubeStore {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployments(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        match self
            .deployments(namespace)
            .create(&PostParams::default(), deployment)
            .await
        {
            Ok(created) => Ok(created),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Err(Error::CreateConflict {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: deployment.metadata.name.clone().unwrap_or_default(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn list_deployments(
        &self,
        scope: &ScanScope,
        selector: Option<&str>,
    ) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = match scope {
            ScanScope::Cluster => Api::all(self.client.clone()),
            ScanScope::Namespace(ns) => self.deployments(ns),
        };

        let mut params = ListParams::default();
        if let Some(selector) = selector {
            params = params.labels(selector);
        }

        let list = api.list(&params).await?;
        debug!(%scope, count = list.items.len(), "Listed deployments");
        Ok(list.items)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        match self
            .deployments(namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::DeleteNotFound {
                kind: "Deployment",
                name: format!("{namespace}/{name}"),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        match namespaces.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Err(Error::DeleteNotFound {
                kind: "Namespace",
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        Ok(services.get_opt(name).await?)
    }
}
