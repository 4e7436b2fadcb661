//! Distributed MNIST training through a PyTorchJob

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;

use super::{Scenario, ScenarioEnv};
use crate::client::ResourceKind;
use crate::conditions::{JOB_RUNNING, JOB_SUCCEEDED, fetch_list, fetch_object, have_len, job_reached};
use crate::config::{TimeoutTier, Timeouts};
use crate::content::substitute_once;
use crate::crds::pytorchjob::{JOB_NAME_LABEL, PyTorchJob};
use crate::error::{Error, Result};
use crate::evaluator::Evaluation;
use crate::lifecycle::{ResourceDescriptor, ResourceHandle};
use crate::metrics::{UtilizationSource, fetch_utilization, utilized};
use crate::models::{Accelerator, WorkloadRequest};
use crate::poller::{ConditionSpec, PollSettings};
use crate::workloads::config_map;
use crate::workloads::pytorch::{TRAINING_COMMAND, build_pytorchjob};

pub const FILES_CONFIG_MAP: &str = "mnist-files";
const ACCELERATOR_PLACEHOLDER: &str = "accelerator=\"has to be specified\"";

pub struct PyTorchMnist {
    name: String,
    description: String,
    accelerator: Accelerator,
    workers: u32,
    procs_per_replica: u32,
}

impl PyTorchMnist {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        accelerator: Accelerator,
        workers: u32,
        procs_per_replica: u32,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            accelerator,
            workers,
            procs_per_replica,
        }
    }

    /// Script with the accelerator filled in, plus the matching requirements
    pub fn request(&self, env: &ScenarioEnv) -> Result<WorkloadRequest> {
        let script = substitute_once(
            &env.content.read("mnist.py")?,
            ACCELERATOR_PLACEHOLDER,
            &format!("accelerator=\"{}\"", self.accelerator.script_value()),
        )?;
        let requirements = env.content.read(self.accelerator.requirements_file())?;

        WorkloadRequest::builder(self.accelerator)
            .workers(self.workers)
            .procs_per_replica(self.procs_per_replica)
            .image(self.accelerator.training_image(&env.config.images))
            .file("mnist.py", script)
            .file("requirements.txt", requirements)
            .command_template(TRAINING_COMMAND)
            .build()
    }

    fn utilization_source(&self, env: &ScenarioEnv) -> Option<Arc<dyn UtilizationSource>> {
        if self.accelerator != Accelerator::Nvidia || !env.config.metrics.enabled {
            return None;
        }
        env.metrics.clone()
    }
}

/// Pod names the training operator gives a job's replicas
fn replica_pods(job: &str, workers: u32) -> Vec<String> {
    std::iter::once(format!("{}-master-0", job))
        .chain((0..workers).map(|i| format!("{}-worker-{}", job, i)))
        .collect()
}

impl Scenario for PyTorchMnist {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    fn plan(&self, namespace: &str, env: &ScenarioEnv) -> Result<Vec<ResourceDescriptor>> {
        let request = self.request(env)?;
        Ok(vec![
            ResourceDescriptor::new(
                ResourceKind::ConfigMap,
                &config_map(namespace, FILES_CONFIG_MAP, request.files()),
            )?,
            ResourceDescriptor::new(
                ResourceKind::PyTorchJob,
                &build_pytorchjob(&request, namespace, FILES_CONFIG_MAP),
            )?,
        ])
    }

    fn stages(
        &self,
        namespace: &str,
        env: &ScenarioEnv,
        handles: &[ResourceHandle],
    ) -> Result<Evaluation> {
        let job = handles
            .iter()
            .find(|h| h.target.kind == ResourceKind::PyTorchJob)
            .ok_or_else(|| Error::invalid_request("no PyTorchJob was created"))?;
        let timeouts = &env.config.timeouts;
        let client = env.client.clone();

        let mut evaluation = Evaluation::new().stage(
            "Running",
            ConditionSpec::new(
                format!("PyTorchJob {} to be running", job.name()),
                timeouts.poll(TimeoutTier::Double)?,
                fetch_object::<PyTorchJob>(client.clone(), job.target.clone()),
                job_reached(JOB_RUNNING),
            ),
        );

        if let Some(source) = self.utilization_source(env) {
            let pods = replica_pods(job.name(), self.workers);
            evaluation = evaluation.stage(
                "Training pods",
                ConditionSpec::new(
                    format!("{} training pods", pods.len()),
                    timeouts.poll(TimeoutTier::Short)?,
                    fetch_list::<Pod>(
                        client.clone(),
                        ResourceKind::Pod,
                        namespace.to_string(),
                        Some(format!("{}={}", JOB_NAME_LABEL, job.name())),
                    ),
                    have_len::<Pod>(pods.len()),
                ),
            );

            let settings = PollSettings::new(timeouts.poll_interval, env.config.metrics.deadline)?;
            let threshold = env.config.metrics.utilization_threshold;
            let gpus = self.procs_per_replica as usize;
            for pod in pods {
                evaluation = evaluation.stage(
                    format!("GPU utilisation {}", pod),
                    ConditionSpec::new(
                        format!("{} GPU sample(s), at least one above {}%", gpus, threshold),
                        settings,
                        fetch_utilization(source.clone(), namespace.to_string(), pod),
                        utilized(gpus, threshold),
                    ),
                );
            }
        }

        Ok(evaluation.stage(
            "Succeeded",
            ConditionSpec::new(
                format!("PyTorchJob {} to succeed", job.name()),
                timeouts.poll(TimeoutTier::Double)?,
                fetch_object::<PyTorchJob>(client, job.target.clone()),
                job_reached(JOB_SUCCEEDED),
            ),
        ))
    }

    fn expected_duration(&self, timeouts: &Timeouts) -> Duration {
        timeouts.deadline(TimeoutTier::Double) * 2
    }
}
