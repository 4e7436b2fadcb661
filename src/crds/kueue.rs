//! Kueue quota objects (kueue.x-k8s.io/v1beta1)

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

use super::Condition;

/// Annotation marking a LocalQueue as the namespace default
pub const DEFAULT_QUEUE_ANNOTATION: &str = "kueue.x-k8s.io/default-queue";

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1beta1",
    kind = "ResourceFlavor",
    plural = "resourceflavors",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceFlavorSpec {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_labels: BTreeMap<String, String>,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1beta1",
    kind = "ClusterQueue",
    plural = "clusterqueues",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterQueueSpec {
    /// An empty selector admits workloads from every namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceGroup {
    pub covered_resources: Vec<String>,
    pub flavors: Vec<FlavorQuotas>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlavorQuotas {
    pub name: String,
    pub resources: Vec<ResourceQuota>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceQuota {
    pub name: String,
    pub nominal_quota: Quantity,
}

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1beta1",
    kind = "LocalQueue",
    plural = "localqueues",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct LocalQueueSpec {
    pub cluster_queue: String,
}

/// Kueue's admission unit; created by Kueue, observed by the harness
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kueue.x-k8s.io",
    version = "v1beta1",
    kind = "Workload",
    root = "KueueWorkload",
    plural = "workloads",
    status = "KueueWorkloadStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KueueWorkloadSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pod_sets: Vec<serde_json::Value>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KueueWorkloadStatus {
    #[serde(default)]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admission: Option<serde_json::Value>,
}

impl KueueWorkload {
    pub fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_workload_reads_admitted_condition() {
        let workload: KueueWorkload = serde_json::from_value(json!({
            "apiVersion": "kueue.x-k8s.io/v1beta1",
            "kind": "Workload",
            "metadata": {"name": "raycluster-hpo", "namespace": "test-ns-1"},
            "spec": {"queueName": "local-queue"},
            "status": {"conditions": [{"type": "Admitted", "status": "True"}]}
        }))
        .unwrap();

        assert_eq!(workload.spec.queue_name.as_deref(), Some("local-queue"));
        assert_eq!(workload.conditions()[0].type_, "Admitted");

        let value =
            serde_json::to_value(KueueWorkload::new("wl", KueueWorkloadSpec::default())).unwrap();
        assert_eq!(value["kind"], "Workload");
        assert_eq!(value["apiVersion"], "kueue.x-k8s.io/v1beta1");
    }
}
