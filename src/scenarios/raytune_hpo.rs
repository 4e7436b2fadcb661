//! Ray Tune hyperparameter search launched from a notebook, admitted by Kueue

use std::collections::BTreeMap;
use std::time::Duration;

use super::{Scenario, ScenarioEnv};
use crate::client::ResourceKind;
use crate::conditions::{
    all_of, boxed, contains_element, fetch_list, have_len, negate, ray_cluster_ready,
    workload_admitted,
};
use crate::config::{TimeoutTier, Timeouts};
use crate::content::substitute_once;
use crate::crds::kueue::KueueWorkload;
use crate::crds::ray::RayCluster;
use crate::error::{Error, Result};
use crate::evaluator::Evaluation;
use crate::lifecycle::{ReleasePolicy, ResourceDescriptor, ResourceHandle};
use crate::models::Accelerator;
use crate::poller::ConditionSpec;
use crate::workloads::kueue::{QueueQuota, cluster_queue, default_local_queue, resource_flavor};
use crate::workloads::notebook::{NotebookRequest, build_notebook};
use crate::workloads::{config_map, user_role_binding};

pub const FILES_CONFIG_MAP: &str = "hpo-files";
pub const LOCAL_QUEUE: &str = "local-queue";
const NOTEBOOK_FILE: &str = "mnist_hpo_raytune.ipynb";
const REQUIREMENTS_FILE: &str = "hpo_raytune_requirements.txt";
const GPU_PLACEHOLDER: &str = "gpu_value=\"has to be specified\"";
const USER_ROLE_BINDING: &str = "notebook-user-admin";
const USER_CLUSTER_ROLE: &str = "admin";

pub struct RayTuneHpo {
    name: String,
    description: String,
    gpus: u32,
}

impl RayTuneHpo {
    pub fn new(name: impl Into<String>, description: impl Into<String>, gpus: u32) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            gpus,
        }
    }

    fn files(&self, env: &ScenarioEnv) -> Result<BTreeMap<String, Vec<u8>>> {
        let script = substitute_once(
            &env.content.read("mnist_hpo.py")?,
            GPU_PLACEHOLDER,
            &format!("gpu_value=\"{}\"", self.gpus),
        )?;
        Ok(BTreeMap::from([
            (NOTEBOOK_FILE.to_string(), env.content.read(NOTEBOOK_FILE)?),
            ("mnist_hpo.py".to_string(), script),
            (REQUIREMENTS_FILE.to_string(), env.content.read(REQUIREMENTS_FILE)?),
        ]))
    }
}

/// Cluster-scoped queue objects are named after the scenario namespace
pub fn flavor_name(namespace: &str) -> String {
    format!("{}-flavor", namespace)
}

pub fn cluster_queue_name(namespace: &str) -> String {
    format!("{}-cq", namespace)
}

fn required<'a>(value: &'a Option<String>, what: &str, variable: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| Error::config(format!("{} is required (set {})", what, variable)))
}

impl Scenario for RayTuneHpo {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn accelerator(&self) -> Accelerator {
        if self.gpus > 0 {
            Accelerator::Nvidia
        } else {
            Accelerator::Cpu
        }
    }

    fn plan(&self, namespace: &str, env: &ScenarioEnv) -> Result<Vec<ResourceDescriptor>> {
        let user = &env.config.notebook_user;
        let user_name = required(&user.name, "notebook user name", "KFTO_NOTEBOOK_USER_NAME")?;
        let token = required(&user.token, "notebook user token", "KFTO_NOTEBOOK_USER_TOKEN")?;

        let flavor = flavor_name(namespace);
        let queue = cluster_queue_name(namespace);
        let quota = QueueQuota {
            gpus: self.gpus,
            ..Default::default()
        };
        let notebook = build_notebook(&NotebookRequest {
            namespace: namespace.to_string(),
            image: env.config.images.notebook.clone(),
            config_map: FILES_CONFIG_MAP.to_string(),
            notebook_file: NOTEBOOK_FILE.to_string(),
            api_url: env.api_url.clone(),
            token: token.to_string(),
            gpus: self.gpus,
        })?;

        Ok(vec![
            ResourceDescriptor::new(ResourceKind::ResourceFlavor, &resource_flavor(&flavor))?,
            ResourceDescriptor::new(
                ResourceKind::ClusterQueue,
                &cluster_queue(&queue, &flavor, &quota),
            )?,
            ResourceDescriptor::new(
                ResourceKind::LocalQueue,
                &default_local_queue(namespace, LOCAL_QUEUE, &queue),
            )?,
            ResourceDescriptor::new(
                ResourceKind::ConfigMap,
                &config_map(namespace, FILES_CONFIG_MAP, &self.files(env)?),
            )?,
            ResourceDescriptor::new(
                ResourceKind::RoleBinding,
                &user_role_binding(namespace, USER_ROLE_BINDING, user_name, USER_CLUSTER_ROLE),
            )?,
            // gone before the namespace is deleted
            ResourceDescriptor::new(ResourceKind::Notebook, &notebook)?.with_policy(
                ReleasePolicy::ExplicitThenAwaitAbsence(
                    env.config.timeouts.poll(TimeoutTier::Medium)?,
                ),
            ),
        ])
    }

    fn stages(
        &self,
        namespace: &str,
        env: &ScenarioEnv,
        _handles: &[ResourceHandle],
    ) -> Result<Evaluation> {
        let timeouts = &env.config.timeouts;
        let rayclusters = || {
            fetch_list::<RayCluster>(
                env.client.clone(),
                ResourceKind::RayCluster,
                namespace.to_string(),
                None,
            )
        };

        Ok(Evaluation::new()
            .stage(
                "RayCluster ready",
                ConditionSpec::new(
                    "exactly one RayCluster in state ready",
                    timeouts.poll(TimeoutTier::Long)?,
                    rayclusters(),
                    all_of(vec![
                        boxed(have_len::<RayCluster>(1)),
                        boxed(contains_element("in state ready", |rc: &RayCluster| {
                            ray_cluster_ready(rc).is_true()
                        })),
                    ]),
                ),
            )
            .stage(
                "Workload admitted",
                ConditionSpec::new(
                    "exactly one Kueue workload, admitted",
                    timeouts.poll(TimeoutTier::Medium)?,
                    fetch_list::<KueueWorkload>(
                        env.client.clone(),
                        ResourceKind::KueueWorkload,
                        namespace.to_string(),
                        None,
                    ),
                    all_of(vec![
                        boxed(have_len::<KueueWorkload>(1)),
                        boxed(contains_element("admitted", |wl: &KueueWorkload| {
                            workload_admitted(wl).is_true()
                        })),
                    ]),
                ),
            )
            .stage(
                "RayCluster deleted",
                ConditionSpec::new(
                    "no RayCluster left",
                    timeouts.poll(TimeoutTier::Long)?,
                    rayclusters(),
                    negate(
                        "a RayCluster present",
                        contains_element("at all", |_: &RayCluster| true),
                    ),
                ),
            ))
    }

    fn expected_duration(&self, timeouts: &Timeouts) -> Duration {
        timeouts.deadline(TimeoutTier::Long) * 2 + timeouts.deadline(TimeoutTier::Medium)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::config::HarnessConfig;
    use crate::content::EmbeddedResources;
    use crate::crds::kueue::ClusterQueue;
    use crate::crds::notebook::Notebook;
    use k8s_openapi::api::core::v1::ConfigMap;
    use std::sync::Arc;

    fn env(token: Option<&str>) -> ScenarioEnv {
        let mut config = HarnessConfig::default();
        config.notebook_user.name = Some("developer".to_string());
        config.notebook_user.token = token.map(str::to_string);
        ScenarioEnv {
            client: Arc::new(InMemoryCluster::new()),
            config,
            content: Arc::new(EmbeddedResources),
            metrics: None,
            api_url: "https://api.example.com:6443".to_string(),
        }
    }

    #[test]
    fn test_plan_order_and_policies() {
        let scenario = RayTuneHpo::new("hpo", "", 1);
        let plan = scenario.plan("test-ns-1", &env(Some("sha256~t"))).unwrap();
        let kinds: Vec<ResourceKind> = plan.iter().map(|d| d.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ResourceKind::ResourceFlavor,
                ResourceKind::ClusterQueue,
                ResourceKind::LocalQueue,
                ResourceKind::ConfigMap,
                ResourceKind::RoleBinding,
                ResourceKind::Notebook,
            ]
        );
        assert_eq!(plan[0].policy, ReleasePolicy::Explicit);
        assert_eq!(plan[2].policy, ReleasePolicy::Cascade);
        assert!(matches!(
            plan[5].policy,
            ReleasePolicy::ExplicitThenAwaitAbsence(_)
        ));

        let cq: ClusterQueue = crate::client::from_dynamic(&plan[1].object).unwrap();
        assert_eq!(cq.metadata.name.as_deref(), Some("test-ns-1-cq"));
        let quotas = &cq.spec.resource_groups[0].flavors[0];
        assert_eq!(quotas.name, "test-ns-1-flavor");
        assert_eq!(quotas.resources[2].nominal_quota.0, "1");
    }

    #[test]
    fn test_gpu_value_substituted() {
        for (gpus, expected) in [(0, "gpu_value=\"0\""), (1, "gpu_value=\"1\"")] {
            let scenario = RayTuneHpo::new("hpo", "", gpus);
            let plan = scenario.plan("ns", &env(Some("t"))).unwrap();
            let cm: ConfigMap = crate::client::from_dynamic(&plan[3].object).unwrap();
            let data = cm.data.unwrap();
            assert!(data["mnist_hpo.py"].contains(expected));
            assert!(data.contains_key(NOTEBOOK_FILE));
        }
    }

    #[test]
    fn test_notebook_gets_token_and_api_url() {
        let plan = RayTuneHpo::new("hpo", "", 0)
            .plan("ns", &env(Some("sha256~secret")))
            .unwrap();
        let nb: Notebook = crate::client::from_dynamic(&plan[5].object).unwrap();
        let container = &nb.spec.template.spec.containers[0];
        let env: Vec<(&str, Option<&str>)> = container
            .env
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| (v.name.as_str(), v.value.as_deref()))
            .collect();
        assert!(env.contains(&("NOTEBOOK_USER_TOKEN", Some("sha256~secret"))));
        assert!(env.contains(&("OPENSHIFT_API_URL", Some("https://api.example.com:6443"))));
        assert!(!container.command.as_ref().unwrap()[2].contains("sha256~secret"));
    }

    #[test]
    fn test_missing_token_is_config_error() {
        let err = RayTuneHpo::new("hpo", "", 0)
            .plan("ns", &env(None))
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(err.to_string().contains("KFTO_NOTEBOOK_USER_TOKEN"));
    }
}
