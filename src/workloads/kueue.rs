//! Kueue quota objects for queue-admitted workloads

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crds::kueue::{
    ClusterQueue, ClusterQueueSpec, DEFAULT_QUEUE_ANNOTATION, FlavorQuotas, LocalQueue,
    LocalQueueSpec, ResourceFlavor, ResourceFlavorSpec, ResourceGroup, ResourceQuota,
};

/// Quota granted to a scenario's cluster queue
#[derive(Debug, Clone, PartialEq)]
pub struct QueueQuota {
    pub cpu: String,
    pub memory: String,
    pub gpus: u32,
}

impl Default for QueueQuota {
    fn default() -> Self {
        Self {
            cpu: "8".to_string(),
            memory: "12Gi".to_string(),
            gpus: 0,
        }
    }
}

const GPU_RESOURCE: &str = "nvidia.com/gpu";

pub fn resource_flavor(name: &str) -> ResourceFlavor {
    ResourceFlavor::new(name, ResourceFlavorSpec::default())
}

/// Cluster queue admitting from every namespace, single flavor
pub fn cluster_queue(name: &str, flavor: &str, quota: &QueueQuota) -> ClusterQueue {
    let quotas = [
        ("cpu", quota.cpu.clone()),
        ("memory", quota.memory.clone()),
        (GPU_RESOURCE, quota.gpus.to_string()),
    ];

    ClusterQueue::new(
        name,
        ClusterQueueSpec {
            namespace_selector: Some(LabelSelector::default()),
            resource_groups: vec![ResourceGroup {
                covered_resources: quotas.iter().map(|(r, _)| r.to_string()).collect(),
                flavors: vec![FlavorQuotas {
                    name: flavor.to_string(),
                    resources: quotas
                        .into_iter()
                        .map(|(name, value)| ResourceQuota {
                            name: name.to_string(),
                            nominal_quota: Quantity(value),
                        })
                        .collect(),
                }],
            }],
        },
    )
}

/// Namespace default local queue feeding `cluster_queue`
pub fn default_local_queue(namespace: &str, name: &str, cluster_queue: &str) -> LocalQueue {
    let mut queue = LocalQueue::new(
        name,
        LocalQueueSpec {
            cluster_queue: cluster_queue.to_string(),
        },
    );
    queue.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        annotations: Some(BTreeMap::from([(
            DEFAULT_QUEUE_ANNOTATION.to_string(),
            "true".to_string(),
        )])),
        ..Default::default()
    };
    queue
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_queue_covers_cpu_memory_gpu() {
        let cq = cluster_queue(
            "cq",
            "flavor",
            &QueueQuota {
                gpus: 1,
                ..Default::default()
            },
        );
        let group = &cq.spec.resource_groups[0];
        assert_eq!(group.covered_resources, vec!["cpu", "memory", "nvidia.com/gpu"]);
        assert_eq!(group.flavors[0].name, "flavor");

        let quotas: Vec<(&str, &str)> = group.flavors[0]
            .resources
            .iter()
            .map(|q| (q.name.as_str(), q.nominal_quota.0.as_str()))
            .collect();
        assert_eq!(
            quotas,
            vec![("cpu", "8"), ("memory", "12Gi"), ("nvidia.com/gpu", "1")]
        );

        // an empty selector must serialize as {} to match all namespaces
        let json = serde_json::to_value(&cq).unwrap();
        assert_eq!(json["spec"]["namespaceSelector"], serde_json::json!({}));
    }

    #[test]
    fn test_local_queue_is_namespace_default() {
        let lq = default_local_queue("ns", "local-queue", "cq");
        assert_eq!(lq.metadata.namespace.as_deref(), Some("ns"));
        assert_eq!(
            lq.metadata.annotations.unwrap()[DEFAULT_QUEUE_ANNOTATION],
            "true"
        );
        assert_eq!(lq.spec.cluster_queue, "cq");
    }
}
