use crate::crds::{RunResource, RunResourceStatus};
use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn, Instrument};

pub mod config;
pub mod run;
pub mod store;
pub mod sweep;
pub mod template;
pub mod types;

// Re-export commonly used items
pub use config::ControllerConfig;
pub use run::{RetryInfo, RunController, RunLifecycle};
pub use types::{Context, Error, Result, RUN_FINALIZER_NAME};

/// Watch `RunResource`s and drive them through the lifecycle until the
/// process receives SIGINT/SIGTERM
#[instrument(skip(client, context), fields(namespace = ?context.config.watch_namespace))]
pub async fn run_task_controller(client: Client, context: Arc<Context>) -> Result<()> {
    let runs: Api<RunResource> = match context.config.watch_namespace.as_deref() {
        Some(namespace) => Api::namespaced(client, namespace),
        None => Api::all(client),
    };

    info!("Starting RunResource controller");

    Controller::new(runs, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(reconcile_run, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("run_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((run, action)) => {
                        debug!(run = %run.name, namespace = ?run.namespace, ?action, "RunResource reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = %reconciliation_err, "RunResource reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("RunResource controller shutting down");
    Ok(())
}

fn attempt_key(run: &RunResource) -> String {
    format!(
        "{}/{}",
        run.namespace().unwrap_or_default(),
        run.name_any()
    )
}

fn retry_info(run: &RunResource, ctx: &Context) -> RetryInfo {
    let failed = ctx
        .attempts
        .get(&attempt_key(run))
        .map_or(0, |count| *count);
    RetryInfo::new(failed + 1, ctx.config.retry.max_attempts)
}

#[instrument(skip(run, ctx), fields(run = %run.name_any(), namespace = ?run.namespace()))]
pub async fn reconcile_run(run: Arc<RunResource>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = run.namespace().ok_or(Error::MissingObjectKey)?;
    let runs: Api<RunResource> = Api::namespaced(ctx.client.clone(), &namespace);
    let retry = retry_info(&run, &ctx);
    debug!(attempt = retry.attempt, "Reconciling RunResource");

    let result = finalizer(&runs, RUN_FINALIZER_NAME, run.clone(), |event| async {
        match event {
            FinalizerEvent::Apply(run) => apply_run(run, &runs, &ctx, retry).await,
            FinalizerEvent::Cleanup(run) => cleanup_run(run, &ctx, retry).await,
        }
    })
    .await
    .map_err(|e| match e {
        kube::runtime::finalizer::Error::ApplyFailed(err)
        | kube::runtime::finalizer::Error::CleanupFailed(err) => err,
        kube::runtime::finalizer::Error::AddFinalizer(e)
        | kube::runtime::finalizer::Error::RemoveFinalizer(e) => Error::from(e),
        kube::runtime::finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        kube::runtime::finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    });

    match result {
        Ok(action) => {
            ctx.attempts.remove(&attempt_key(&run));
            Ok(action)
        }
        Err(err) => {
            if retry.is_last_attempt {
                ctx.lifecycle.on_last_attempt_failed(&run, &err);
            }
            Err(err)
        }
    }
}

async fn apply_run(
    run: Arc<RunResource>,
    runs: &Api<RunResource>,
    ctx: &Context,
    retry: RetryInfo,
) -> Result<Action> {
    let status = ctx.lifecycle.reconcile(&run, retry).await?;
    let finished = status.is_run_finished;
    patch_status_if_changed(runs, &run, status).await?;

    if finished {
        Ok(Action::await_change())
    } else {
        // Re-check later so the status notices the worker scaling down
        Ok(Action::requeue(Duration::from_secs(
            ctx.config.garbage_collection.interval_seconds.max(1),
        )))
    }
}

async fn cleanup_run(run: Arc<RunResource>, ctx: &Context, retry: RetryInfo) -> Result<Action> {
    ctx.lifecycle.finalize(&run, retry).await?;
    info!(run = %run.name_any(), "RunResource finalized");
    Ok(Action::await_change())
}

/// Write `status` through the status subresource when a material field changed
async fn patch_status_if_changed(
    runs: &Api<RunResource>,
    run: &RunResource,
    mut status: RunResourceStatus,
) -> Result<()> {
    let current = run.status.clone().unwrap_or_default();
    if !current.differs_from(&status) {
        debug!("Status unchanged, skipping patch");
        return Ok(());
    }

    status.last_update = Some(chrono::Utc::now().to_rfc3339());
    let patch = json!({ "status": status });
    runs.patch_status(&run.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(
        is_run_finished = status.is_run_finished,
        message = ?status.message,
        "Updated RunResource status"
    );
    Ok(())
}

/// Requeue every `retry.intervalSeconds` until the retry budget is spent,
/// then wait for the next change
fn error_policy(run: Arc<RunResource>, err: &Error, ctx: Arc<Context>) -> Action {
    let key = attempt_key(&run);
    let failed = {
        let mut count = ctx.attempts.entry(key.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if failed >= ctx.config.retry.max_attempts {
        ctx.attempts.remove(&key);
        error!(run = %key, attempts = failed, error = %err, "RunResource reconciliation failed, giving up until the next change");
        return Action::await_change();
    }

    warn!(run = %key, attempt = failed, error = %err, "RunResource reconciliation failed, will retry");
    Action::requeue(Duration::from_secs(ctx.config.retry.interval_seconds))
}
