pub mod cleanup;
pub mod controller;
pub mod discovery;
pub mod naming;
pub mod resources;
pub mod webserver;

pub use cleanup::{CollectReport, FinishedPolicy, FinishedRule, GarbageCollector};
pub use controller::{RetryInfo, RunController, RunLifecycle};
pub use discovery::RunDiscovery;
pub use naming::{ResourceNaming, RunIdentity};
pub use resources::{DeploymentMaterializer, EnsureOutcome};
pub use webserver::{LatestRunSource, WebserverClient};
