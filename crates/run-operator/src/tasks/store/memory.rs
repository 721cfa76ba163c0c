//! In-memory [`DeploymentStore`] used by tests and local dry runs.
//!
//! Besides plain storage it can stage "concurrent" writes that land between
//! two calls of the core, which is how the create and namespace-emptiness
//! races are reproduced without a cluster.

use super::{DeploymentStore, ScanScope};
use crate::tasks::types::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

type Key = (String, String);

#[derive(Default)]
struct State {
    deployments: BTreeMap<Key, Deployment>,
    services: BTreeMap<Key, Service>,
    namespaces: BTreeSet<String>,
    namespace_deletions: Vec<String>,
    create_calls: usize,
    before_next_create: Vec<Deployment>,
    after_next_delete: Vec<Deployment>,
    before_next_namespace_delete: Vec<Deployment>,
    failing_deletes: BTreeSet<Key>,
    failing_namespace_deletes: BTreeSet<String>,
}

impl State {
    fn insert(&mut self, deployment: Deployment) {
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        let name = deployment.metadata.name.clone().unwrap_or_default();
        self.namespaces.insert(namespace.clone());
        self.deployments.insert((namespace, name), deployment);
    }

    fn insert_all(&mut self, pending: Vec<Deployment>) {
        for deployment in pending {
            self.insert(deployment);
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store a Deployment as-is; its metadata must carry namespace and name
    pub fn insert_deployment(&self, deployment: Deployment) {
        self.lock().insert(deployment);
    }

    /// Register a ClusterIP service exposing a single port
    pub fn insert_service(&self, namespace: &str, name: &str, cluster_ip: &str, port: i32) {
        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some(cluster_ip.to_string()),
                ports: Some(vec![ServicePort {
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut state = self.lock();
        state.namespaces.insert(namespace.to_string());
        state
            .services
            .insert((namespace.to_string(), name.to_string()), service);
    }

    /// Stage a Deployment that appears right before the next create is applied
    pub fn inject_before_next_create(&self, deployment: Deployment) {
        self.lock().before_next_create.push(deployment);
    }

    /// Stage a Deployment that appears right after the next Deployment delete
    pub fn inject_after_next_delete(&self, deployment: Deployment) {
        self.lock().after_next_delete.push(deployment);
    }

    /// Stage a Deployment that appears after the emptiness check, right
    /// before the next namespace delete is applied
    pub fn inject_before_next_namespace_delete(&self, deployment: Deployment) {
        self.lock().before_next_namespace_delete.push(deployment);
    }

    /// Make every delete of namespace `namespace` fail with a cluster error
    pub fn fail_namespace_deletes_of(&self, namespace: &str) {
        self.lock()
            .failing_namespace_deletes
            .insert(namespace.to_string());
    }

    /// Make every delete of `namespace/name` fail with a cluster error
    pub fn fail_deletes_of(&self, namespace: &str, name: &str) {
        self.lock()
            .failing_deletes
            .insert((namespace.to_string(), name.to_string()));
    }

    #[must_use]
    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    #[must_use]
    pub fn deployments(&self) -> Vec<Deployment> {
        self.lock().deployments.values().cloned().collect()
    }

    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    /// Every namespace delete call received, successful or not
    #[must_use]
    pub fn namespace_deletions(&self) -> Vec<String> {
        self.lock().namespace_deletions.clone()
    }

    #[must_use]
    pub fn create_calls(&self) -> usize {
        self.lock().create_calls
    }
}

/// Minimal equality-based selector matching (`k=v,k2=v2` or bare `k`)
fn matches_selector(deployment: &Deployment, selector: &str) -> bool {
    let labels = deployment.metadata.labels.as_ref();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim()),
            None => labels.is_some_and(|l| l.contains_key(term)),
        })
}

#[async_trait]
impl DeploymentStore for InMemoryStore {
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        let mut state = self.lock();
        state.create_calls += 1;
        let staged = std::mem::take(&mut state.before_next_create);
        state.insert_all(staged);

        let name = deployment
            .metadata
            .name
            .clone()
            .ok_or(Error::MissingObjectKey)?;
        let key = (namespace.to_string(), name.clone());
        if state.deployments.contains_key(&key) {
            return Err(Error::CreateConflict {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name,
            });
        }

        let mut stored = deployment.clone();
        stored.metadata.namespace = Some(namespace.to_string());
        state.insert(stored.clone());
        Ok(stored)
    }

    async fn list_deployments(
        &self,
        scope: &ScanScope,
        selector: Option<&str>,
    ) -> Result<Vec<Deployment>> {
        let state = self.lock();
        Ok(state
            .deployments
            .iter()
            .filter(|((ns, _), _)| match scope {
                ScanScope::Cluster => true,
                ScanScope::Namespace(scope_ns) => ns == scope_ns,
            })
            .filter(|(_, d)| selector.map_or(true, |s| matches_selector(d, s)))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.lock();
        let key = (namespace.to_string(), name.to_string());
        if state.failing_deletes.contains(&key) {
            return Err(Error::ClusterCallFailed(format!(
                "injected failure deleting {namespace}/{name}"
            )));
        }

        let removed = state.deployments.remove(&key);
        let staged = std::mem::take(&mut state.after_next_delete);
        state.insert_all(staged);

        match removed {
            Some(_) => Ok(()),
            None => Err(Error::DeleteNotFound {
                kind: "Deployment",
                name: format!("{namespace}/{name}"),
            }),
        }
    }

    async fn delete_namespace(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        state.namespace_deletions.push(name.to_string());
        let staged = std::mem::take(&mut state.before_next_namespace_delete);
        state.insert_all(staged);

        if state.failing_namespace_deletes.contains(name) {
            return Err(Error::ClusterCallFailed(format!(
                "injected failure deleting namespace {name}"
            )));
        }
        if !state.namespaces.remove(name) {
            return Err(Error::DeleteNotFound {
                kind: "Namespace",
                name: name.to_string(),
            });
        }
        // Namespace deletion cascades to everything inside it
        state.deployments.retain(|(ns, _), _| ns != name);
        state.services.retain(|(ns, _), _| ns != name);
        Ok(())
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self
            .lock()
            .services
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deployment(namespace: &str, name: &str, labels: &[(&str, &str)]) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn selector_filters_by_label_value() {
        let store = InMemoryStore::new();
        store.insert_deployment(deployment("ns1", "a", &[("tdaq.worker", "true")]));
        store.insert_deployment(deployment("ns1", "b", &[("tdaq.worker", "false")]));
        store.insert_deployment(deployment("ns2", "c", &[]));

        let managed = store
            .list_deployments(&ScanScope::Cluster, Some("tdaq.worker=true"))
            .await
            .unwrap();
        assert_eq!(managed.len(), 1);

        let ns1 = store
            .list_deployments(&ScanScope::Namespace("ns1".to_string()), None)
            .await
            .unwrap();
        assert_eq!(ns1.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = InMemoryStore::new();
        let d = deployment("ns1", "a", &[]);
        store.create_deployment("ns1", &d).await.unwrap();

        let err = store.create_deployment("ns1", &d).await.unwrap_err();
        assert!(matches!(err, Error::CreateConflict { .. }));
        assert_eq!(store.create_calls(), 2);
    }

    #[tokio::test]
    async fn staged_create_lands_before_the_write() {
        let store = InMemoryStore::new();
        let d = deployment("ns1", "a", &[]);
        store.inject_before_next_create(d.clone());

        let err = store.create_deployment("ns1", &d).await.unwrap_err();
        assert!(matches!(err, Error::CreateConflict { .. }));
        assert_eq!(store.deployments().len(), 1);
    }

    #[tokio::test]
    async fn deleting_missing_objects_reports_not_found() {
        let store = InMemoryStore::new();
        let err = store.delete_deployment("ns1", "ghost").await.unwrap_err();
        assert!(matches!(err, Error::DeleteNotFound { .. }));

        let err = store.delete_namespace("ns1").await.unwrap_err();
        assert!(matches!(err, Error::DeleteNotFound { .. }));
        assert_eq!(store.namespace_deletions(), vec!["ns1".to_string()]);
    }

    #[tokio::test]
    async fn failing_namespace_delete_keeps_the_namespace() {
        let store = InMemoryStore::new();
        store.insert_deployment(deployment("ns1", "a", &[]));
        store.fail_namespace_deletes_of("ns1");

        let err = store.delete_namespace("ns1").await.unwrap_err();
        assert!(matches!(err, Error::ClusterCallFailed(_)));
        assert_eq!(store.namespaces(), vec!["ns1".to_string()]);
        assert_eq!(store.deployments().len(), 1);
    }

    #[tokio::test]
    async fn service_lookup() {
        let store = InMemoryStore::new();
        store.insert_service("default", "webserver-service", "10.0.0.12", 8080);

        let svc = store
            .get_service("default", "webserver-service")
            .await
            .unwrap()
            .unwrap();
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("10.0.0.12"));
        assert!(store.get_service("default", "other").await.unwrap().is_none());
    }
}
