/*
 * TDAQ Run Operator - Kubernetes lifecycle controller for TDAQ runs
 * Copyright (C) 2025 TDAQ team
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Run Operator - Kubernetes controller for `RunResource` CRDs
//!
//! This service:
//! - Watches `RunResource`s and keeps one worker Deployment per run
//! - Removes a run's Deployment (and its emptied namespace) on deletion
//! - Periodically garbage-collects finished worker Deployments
//! - Serves a liveness endpoint

use anyhow::Context as _;
use dashmap::DashMap;
use run_operator::health;
use run_operator::tasks::{
    config::ControllerConfig,
    run::{FinishedPolicy, RunController},
    run_task_controller,
    store::KubeStore,
    sweep::spawn_sweep,
    template,
    types::Context as TaskContext,
};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    info!(
        "Starting TDAQ Run Operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = load_controller_config();
    config
        .validate()
        .context("Controller configuration is invalid")?;
    let config = Arc::new(config);

    let client = kube::Client::try_default()
        .await
        .context("Failed to connect to Kubernetes")?;
    info!("Connected to Kubernetes cluster");

    let store = Arc::new(KubeStore::new(client.clone()));
    let policy = FinishedPolicy::from_config(&config)?;
    info!(?policy, "Garbage collection policy selected");

    let lifecycle = RunController::new(
        store,
        template::from_config(&config.template),
        policy,
        config.clone(),
    );

    let sweep_handle = spawn_sweep(lifecycle.collector().clone(), &config.garbage_collection);

    let context = Arc::new(TaskContext {
        client: client.clone(),
        config: config.clone(),
        lifecycle: Arc::new(lifecycle),
        attempts: Arc::new(DashMap::new()),
    });

    // Start the controller in the background
    let controller_handle = tokio::spawn(async move {
        if let Err(e) = run_task_controller(client, context).await {
            error!("Controller error: {}", e);
        }
    });

    let address = format!("0.0.0.0:{}", config.health.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {address}"))?;
    info!("Health endpoint listening on {}", address);

    axum::serve(listener, health::router())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweep_handle {
        handle.abort();
    }
    controller_handle.abort();
    info!("Run operator stopped");
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,run_operator=debug".into());

    let json = std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

fn load_controller_config() -> ControllerConfig {
    let override_path = std::env::var("CONTROLLER_CONFIG_PATH").ok();
    let config_path = override_path
        .as_deref()
        .filter(|path| Path::new(path).exists())
        .unwrap_or(DEFAULT_CONFIG_PATH);

    match ControllerConfig::from_mounted_file(config_path) {
        Ok(cfg) => {
            info!("Loaded controller configuration from {}", config_path);
            cfg
        }
        Err(err) => {
            warn!(
                "Failed to load configuration from {}: {}. Using defaults.",
                config_path, err
            );
            ControllerConfig::default()
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
