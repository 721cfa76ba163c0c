//! `RunResource` Custom Resource Definition for TDAQ runs

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Declared desired state of one run.
///
/// The run identity (`runNumber`, `runPipe`) selects exactly one worker
/// Deployment; the operator never writes to `spec`.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "operator.tdaq.cern.ch", version = "v1", kind = "RunResource")]
#[kube(namespaced)]
#[kube(status = "RunResourceStatus")]
#[kube(printcolumn = r#"{"name":"RunNumber","type":"integer","jsonPath":".spec.runNumber"}"#)]
#[kube(printcolumn = r#"{"name":"RunPipe","type":"string","jsonPath":".spec.runPipe"}"#)]
#[kube(printcolumn = r#"{"name":"Finished","type":"boolean","jsonPath":".status.isRunFinished"}"#)]
#[kube(printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#)]
#[serde(rename_all = "camelCase")]
pub struct RunResourceSpec {
    /// Human readable name of the run
    #[serde(default)]
    pub name: String,
    pub run_number: u32,
    /// Run-pipe classification; must be a valid Kubernetes label value
    pub run_pipe: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RunResourceStatus {
    #[serde(default)]
    pub is_run_finished: bool,
    /// Name of the worker Deployment backing this run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<String>,
}

impl RunResourceStatus {
    /// True when `other` differs in a field worth a status write.
    ///
    /// `last_update` is ignored so an unchanged run does not patch itself
    /// on every pass and trigger another reconcile.
    #[must_use]
    pub fn differs_from(&self, other: &RunResourceStatus) -> bool {
        self.is_run_finished != other.is_run_finished
            || self.deployment_name != other.deployment_name
            || self.message != other.message
    }
}
