//! End-to-end run lifecycle scenarios against the in-memory store

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use run_operator::tasks::run::naming::{LABEL_RUN_NUMBER, LABEL_RUN_PIPE, LABEL_WORKER};
use run_operator::tasks::run::{
    DeploymentMaterializer, EnsureOutcome, FinishedPolicy, GarbageCollector, LatestRunSource,
    RetryInfo, RunController, RunIdentity, RunLifecycle,
};
use run_operator::tasks::store::{InMemoryStore, ScanScope};
use run_operator::tasks::template::EmbeddedTemplate;
use run_operator::{ControllerConfig, Error, Result, RunResource, RunResourceSpec};
use std::sync::Arc;

struct FixedLatestRun(i64);

#[async_trait]
impl LatestRunSource for FixedLatestRun {
    async fn latest_run_number(&self) -> Result<i64> {
        Ok(self.0)
    }
}

fn cluster() -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.insert_service("default", "webserver-service", "10.96.0.15", 8080);
    store
}

fn materializer(store: &Arc<InMemoryStore>) -> DeploymentMaterializer {
    DeploymentMaterializer::new(
        store.clone(),
        Arc::new(EmbeddedTemplate),
        Arc::new(ControllerConfig::default()),
    )
}

fn collector(store: &Arc<InMemoryStore>, policy: FinishedPolicy) -> GarbageCollector {
    GarbageCollector::new(
        store.clone(),
        policy,
        ControllerConfig::default()
            .garbage_collection
            .protected_namespaces,
    )
}

fn run_resource(namespace: &str, run_number: u32, run_pipe: &str) -> RunResource {
    let mut run = RunResource::new(
        &format!("run-{run_number}"),
        RunResourceSpec {
            name: format!("run-{run_number}"),
            run_number,
            run_pipe: run_pipe.to_string(),
            label: Some("physics".to_string()),
        },
    );
    run.metadata.namespace = Some(namespace.to_string());
    run
}

fn worker(namespace: &str, name: &str, run_number: &str, replicas: Option<i32>) -> Deployment {
    Deployment {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(
                [
                    (LABEL_WORKER.to_string(), "true".to_string()),
                    (LABEL_RUN_NUMBER.to_string(), run_number.to_string()),
                    (LABEL_RUN_PIPE.to_string(), "express".to_string()),
                ]
                .into_iter()
                .collect(),
            ),
            ..Default::default()
        },
        status: Some(DeploymentStatus {
            replicas,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn first_attempt() -> RetryInfo {
    RetryInfo::new(1, 10)
}

#[tokio::test]
async fn new_run_creates_one_labelled_worker() {
    let store = cluster();
    let controller = RunController::new(
        store.clone(),
        Arc::new(EmbeddedTemplate),
        FinishedPolicy::Replicas,
        Arc::new(ControllerConfig::default()),
    );

    let status = controller
        .reconcile(&run_resource("ns1", 5, "express"), first_attempt())
        .await
        .unwrap();
    assert_eq!(status.deployment_name.as_deref(), Some("worker-0005-express"));

    let deployments = store.deployments();
    assert_eq!(deployments.len(), 1);
    let deployment = store.deployment("ns1", "worker-0005-express").unwrap();

    let labels = deployment.metadata.labels.clone().unwrap();
    assert_eq!(labels[LABEL_RUN_NUMBER], "5");
    assert_eq!(labels[LABEL_RUN_PIPE], "express");
    assert_eq!(labels[LABEL_WORKER], "true");

    let containers = deployment.spec.unwrap().template.spec.unwrap().containers;
    for container in containers {
        let env: Vec<(String, Option<String>)> = container
            .env
            .unwrap_or_default()
            .into_iter()
            .map(|e| (e.name, e.value))
            .collect();
        assert!(env.contains(&("RUN_NUMBER".to_string(), Some("5".to_string()))));
        assert!(env.contains(&("RUN_PIPE".to_string(), Some("express".to_string()))));
        assert!(env.contains(&(
            "WEBSERVER_SERVICE_SERVICE_HOST".to_string(),
            Some("10.96.0.15".to_string())
        )));
        assert!(env.contains(&(
            "WEBSERVER_SERVICE_SERVICE_PORT".to_string(),
            Some("8080".to_string())
        )));
    }
}

#[tokio::test]
async fn ensure_deployment_is_idempotent() {
    let store = cluster();
    let materializer = materializer(&store);
    let run = RunIdentity::new(5, "express");

    let first = materializer.ensure_deployment(Some("ns1"), &run).await;
    let second = materializer.ensure_deployment(Some("ns1"), &run).await;

    tokio_test::assert_ok!(&first);
    assert!(matches!(first.unwrap(), EnsureOutcome::Created { .. }));
    assert!(matches!(second.unwrap(), EnsureOutcome::AlreadyExists { .. }));
    assert_eq!(store.deployments().len(), 1);
}

#[tokio::test]
async fn create_conflict_converges_to_already_exists() {
    let store = cluster();
    let materializer = materializer(&store);

    // Another reconcile creates the same Deployment between our lookup and our create
    store.inject_before_next_create(worker("ns1", "worker-0005-express", "5", None));

    let outcome = materializer
        .ensure_deployment(Some("ns1"), &RunIdentity::new(5, "express"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        EnsureOutcome::AlreadyExists {
            namespace: "ns1".to_string(),
            name: "worker-0005-express".to_string(),
        }
    );
    assert_eq!(store.deployments().len(), 1);
    assert_eq!(store.create_calls(), 1);
}

#[tokio::test]
async fn simultaneous_ensures_leave_one_deployment() {
    let store = cluster();
    let a = materializer(&store);
    let b = materializer(&store);
    let run = RunIdentity::new(12, "calib");

    let (left, right) = tokio::join!(
        a.ensure_deployment(Some("ns1"), &run),
        b.ensure_deployment(Some("ns1"), &run)
    );

    let outcomes = [left.unwrap(), right.unwrap()];
    let created = outcomes
        .iter()
        .filter(|o| matches!(o, EnsureOutcome::Created { .. }))
        .count();
    assert_eq!(created, 1);
    assert_eq!(store.deployments().len(), 1);
}

#[tokio::test]
async fn replica_policy_only_collects_zero_replicas() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0001-express", "1", Some(0)));
    store.insert_deployment(worker("ns1", "worker-0002-express", "2", Some(2)));
    store.insert_deployment(worker("ns1", "worker-0003-express", "3", None));

    let report = collector(&store, FinishedPolicy::Replicas)
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();

    assert_eq!(report.deleted_deployments, 1);
    assert!(store.deployment("ns1", "worker-0001-express").is_none());
    assert!(store.deployment("ns1", "worker-0002-express").is_some());
    assert!(store.deployment("ns1", "worker-0003-express").is_some());
    assert!(store.namespace_deletions().is_empty());
}

#[tokio::test]
async fn run_number_policy_collects_superseded_runs_only() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0007-express", "7", Some(1)));
    store.insert_deployment(worker("ns1", "worker-0008-express", "8", Some(1)));
    store.insert_deployment(worker("ns1", "worker-0009-express", "9", Some(1)));
    store.insert_deployment(worker("ns1", "worker-bad-express", "nine", Some(1)));

    let policy = FinishedPolicy::RunNumber(Arc::new(FixedLatestRun(9)));
    let report = collector(&store, policy)
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();

    assert_eq!(report.deleted_deployments, 2);
    assert!(store.deployment("ns1", "worker-0009-express").is_some());
    assert!(store.deployment("ns1", "worker-bad-express").is_some());
}

#[tokio::test]
async fn namespace_survives_create_before_emptiness_check() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0001-express", "1", Some(0)));

    // A new run lands in ns1 after the finished worker is deleted but before
    // the collector lists the namespace, so the list sees it
    store.inject_after_next_delete(worker("ns1", "worker-0002-express", "2", None));

    let report = collector(&store, FinishedPolicy::Replicas)
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();

    assert_eq!(report.deleted_deployments, 1);
    assert_eq!(report.deleted_namespaces, 0);
    assert!(store.namespace_deletions().is_empty());
    assert!(store.deployment("ns1", "worker-0002-express").is_some());
}

#[tokio::test]
async fn create_after_emptiness_check_is_lost_with_the_namespace() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0001-express", "1", Some(0)));

    // Lands after the namespace was listed empty but before it is deleted.
    // The check and the delete are not atomic, so the namespace still goes.
    store.inject_before_next_namespace_delete(worker("ns1", "worker-0002-express", "2", None));

    let report = collector(&store, FinishedPolicy::Replicas)
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();

    assert_eq!(report.deleted_deployments, 1);
    assert_eq!(report.deleted_namespaces, 1);
    assert_eq!(store.namespace_deletions(), vec!["ns1".to_string()]);
    assert!(store.deployment("ns1", "worker-0002-express").is_none());
}

#[tokio::test]
async fn namespace_delete_failure_leaves_the_pass_successful() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0001-express", "1", Some(0)));
    store.fail_namespace_deletes_of("ns1");

    let report = tokio_test::assert_ok!(
        collector(&store, FinishedPolicy::Replicas)
            .collect(&ScanScope::Cluster)
            .await
    );

    assert_eq!(report.deleted_deployments, 1);
    assert_eq!(report.deleted_namespaces, 0);
    assert!(store.namespaces().contains(&"ns1".to_string()));
}

#[tokio::test]
async fn new_run_number_after_finish_gets_a_fresh_worker() {
    let store = cluster();
    let controller = RunController::new(
        store.clone(),
        Arc::new(EmbeddedTemplate),
        FinishedPolicy::Replicas,
        Arc::new(ControllerConfig::default()),
    );
    let mut run = run_resource("ns1", 5, "express");
    run.status = Some(controller.reconcile(&run, first_attempt()).await.unwrap());

    store.insert_deployment(worker("ns1", "worker-0005-express", "5", Some(0)));
    run.status = Some(controller.reconcile(&run, first_attempt()).await.unwrap());
    controller
        .collector()
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();
    assert!(store.deployment("ns1", "worker-0005-express").is_none());

    run.spec.run_number = 6;
    let status = controller.reconcile(&run, first_attempt()).await.unwrap();

    assert_eq!(status.deployment_name.as_deref(), Some("worker-0006-express"));
    assert!(store.deployment("ns1", "worker-0006-express").is_some());
}

#[tokio::test]
async fn emptied_namespace_is_removed() {
    let store = cluster();
    store.insert_deployment(worker("ns1", "worker-0001-express", "1", Some(0)));

    let report = collector(&store, FinishedPolicy::Replicas)
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();

    assert_eq!(report.deleted_namespaces, 1);
    assert!(!store.namespaces().contains(&"ns1".to_string()));
}

#[tokio::test]
async fn deleting_a_run_releases_its_worker() {
    let store = cluster();
    let controller = RunController::new(
        store.clone(),
        Arc::new(EmbeddedTemplate),
        FinishedPolicy::Replicas,
        Arc::new(ControllerConfig::default()),
    );
    let run = run_resource("ns1", 5, "express");

    controller.reconcile(&run, first_attempt()).await.unwrap();
    controller.finalize(&run, first_attempt()).await.unwrap();

    assert!(store.deployment("ns1", "worker-0005-express").is_none());
    assert_eq!(store.namespace_deletions(), vec!["ns1".to_string()]);

    // A sweep racing with finalization finds nothing left to do
    let report = controller
        .collector()
        .collect(&ScanScope::Cluster)
        .await
        .unwrap();
    assert_eq!(report.deleted_deployments, 0);
}

#[tokio::test]
async fn missing_dependency_service_is_retried_by_the_host() {
    let store = Arc::new(InMemoryStore::new());
    let controller = RunController::new(
        store.clone(),
        Arc::new(EmbeddedTemplate),
        FinishedPolicy::Replicas,
        Arc::new(ControllerConfig::default()),
    );

    let err = controller
        .reconcile(&run_resource("ns1", 5, "express"), first_attempt())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::DependencyServiceMissing { .. }));
    assert!(store.deployments().is_empty());
}
