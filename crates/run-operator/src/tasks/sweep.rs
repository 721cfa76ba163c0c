//! Periodic garbage collection, independent of any single `RunResource` event

use crate::tasks::config::GarbageCollectionConfig;
use crate::tasks::run::GarbageCollector;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Spawn the sweep task, or return `None` when garbage collection is disabled.
///
/// A failed pass is logged and the next tick tries again.
pub fn spawn_sweep(
    collector: GarbageCollector,
    config: &GarbageCollectionConfig,
) -> Option<JoinHandle<()>> {
    if !config.enabled {
        info!("Periodic garbage collection disabled");
        return None;
    }

    let period = Duration::from_secs(config.interval_seconds.max(1));
    let scope = config.scope();
    info!(?period, %scope, "Starting periodic garbage collection");

    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            match collector.collect(&scope).await {
                Ok(report) => debug!(?report, "Sweep completed"),
                Err(e) => error!(error = %e, "Sweep failed, retrying next tick"),
            }
        }
    }))
}
