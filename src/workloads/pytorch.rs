//! PyTorchJob builder for the distributed MNIST workload

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    Affinity, ConfigMapVolumeSource, Container, EmptyDirVolumeSource, EnvVar, PodAffinityTerm,
    PodAntiAffinity, PodSpec, PodTemplateSpec, ResourceRequirements, Toleration, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};

use crate::crds::pytorchjob::{MASTER, PyTorchJob, PyTorchJobSpec, ReplicaSpec, WORKER};
use crate::models::{FILES_DIR, MASTER_REPLICAS, WorkloadRequest};

pub const GENERATE_NAME: &str = "kfto-mnist-";
pub const APP_LABEL: &str = "app";
pub const APP_NAME: &str = "kfto-mnist";
pub const ROLE_LABEL: &str = "role";
pub const CONTAINER_NAME: &str = "pytorch";
pub const MEMORY: &str = "6Gi";
const TMP_VOLUME: &str = "tmp-volume";
const RESTART_POLICY: &str = "OnFailure";
const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Install requirements into /tmp/lib, fetch MNIST, then launch torchrun
pub const TRAINING_COMMAND: &str = r#"mkdir -p /tmp/lib /tmp/datasets/mnist && export PYTHONPATH=$PYTHONPATH:/tmp/lib && \
pip install --no-cache-dir -r {{ files_dir }}/requirements.txt --target=/tmp/lib && \
echo "Downloading MNIST dataset..." && \
python3 -c "from torchvision.datasets import MNIST; from torchvision.transforms import Compose, ToTensor; \
MNIST('/tmp/datasets/mnist', train=False, download=True, transform=Compose([ToTensor()]))" && \
echo -e "\n\n Dataset downloaded to /tmp/datasets/mnist" && ls -R /tmp/datasets/mnist && \
echo -e "\n\n Starting training..." && \
torchrun --nproc_per_node={{ nproc_per_node }} {{ files_dir }}/mnist.py --dataset_path "/tmp/datasets/mnist" --epochs 7 --save_every 2 --batch_size 128 --lr 0.001 --snapshot_path "mnist_snapshot.pt" --backend {{ backend }}"#;

/// Build the job for `request` with its files mounted from `config_map`
pub fn build_pytorchjob(request: &WorkloadRequest, namespace: &str, config_map: &str) -> PyTorchJob {
    let replica_specs = BTreeMap::from([
        (
            MASTER.to_string(),
            replica_spec(request, config_map, "master", MASTER_REPLICAS),
        ),
        (
            WORKER.to_string(),
            // builder guarantees workers fits an i32
            replica_spec(request, config_map, "worker", request.workers() as i32),
        ),
    ]);

    PyTorchJob {
        metadata: ObjectMeta {
            generate_name: Some(GENERATE_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: PyTorchJobSpec {
            pytorch_replica_specs: replica_specs,
            run_policy: None,
        },
        status: None,
    }
}

fn replica_spec(request: &WorkloadRequest, config_map: &str, role: &str, replicas: i32) -> ReplicaSpec {
    let labels = BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (ROLE_LABEL.to_string(), role.to_string()),
    ]);

    ReplicaSpec {
        replicas,
        restart_policy: RESTART_POLICY.to_string(),
        template: PodTemplateSpec {
            metadata: Some(ObjectMeta {
                labels: Some(labels),
                ..Default::default()
            }),
            spec: Some(pod_spec(request, config_map)),
        },
    }
}

fn pod_spec(request: &WorkloadRequest, config_map: &str) -> PodSpec {
    let accelerator = request.accelerator();
    let procs = Quantity(request.procs_per_replica().to_string());

    let mut resources = BTreeMap::from([
        ("cpu".to_string(), procs.clone()),
        ("memory".to_string(), Quantity(MEMORY.to_string())),
    ]);
    let mut env = None;
    let mut tolerations = None;

    if let Some(label) = accelerator.resource_label() {
        resources.insert(label.to_string(), procs);
        env = Some(vec![
            env_var("NCCL_DEBUG", "INFO"),
            env_var("TORCH_DISTRIBUTED_DEBUG", "DETAIL"),
        ]);
        tolerations = Some(vec![Toleration {
            key: Some(label.to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        }]);
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(request.image().to_string()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec![
            "/bin/bash".to_string(),
            "-c".to_string(),
            request.command().to_string(),
        ]),
        env,
        volume_mounts: Some(vec![
            VolumeMount {
                name: config_map.to_string(),
                mount_path: FILES_DIR.to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: TMP_VOLUME.to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            },
        ]),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        ..Default::default()
    };

    PodSpec {
        affinity: Some(Affinity {
            pod_anti_affinity: Some(PodAntiAffinity {
                required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                    label_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            APP_LABEL.to_string(),
                            APP_NAME.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }),
        containers: vec![container],
        volumes: Some(vec![
            Volume {
                name: config_map.to_string(),
                config_map: Some(ConfigMapVolumeSource {
                    name: config_map.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: TMP_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ]),
        restart_policy: Some(RESTART_POLICY.to_string()),
        tolerations,
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}
