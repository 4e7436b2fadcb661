//! Scenario catalogue
//!
//! A scenario plans the objects it submits and the stages it waits on; the
//! [`runner`] owns namespace creation, acquisition, evaluation and teardown.

pub mod pytorch_mnist;
pub mod raytune_hpo;
pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use crate::client::ClusterClient;
use crate::config::{HarnessConfig, Timeouts};
use crate::content::ContentSource;
use crate::error::Result;
use crate::evaluator::Evaluation;
use crate::lifecycle::{ResourceDescriptor, ResourceHandle};
use crate::metrics::UtilizationSource;
use crate::models::Accelerator;

use pytorch_mnist::PyTorchMnist;
use raytune_hpo::RayTuneHpo;

/// Collaborators shared by every scenario of a run
#[derive(Clone)]
pub struct ScenarioEnv {
    pub client: Arc<dyn ClusterClient>,
    pub config: HarnessConfig,
    pub content: Arc<dyn ContentSource>,
    /// GPU utilisation is only checked when a source is present
    pub metrics: Option<Arc<dyn UtilizationSource>>,
    /// API server URL handed to workloads that talk to the cluster themselves
    pub api_url: String,
}

/// A self-contained end-to-end check
pub trait Scenario: Send + Sync {
    /// Unique identifier, used on the command line
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn accelerator(&self) -> Accelerator;

    /// Objects to create inside `namespace`, in creation order
    ///
    /// The namespace itself is created by the runner and is not part of the plan.
    fn plan(&self, namespace: &str, env: &ScenarioEnv) -> Result<Vec<ResourceDescriptor>>;

    /// Stages to await once every planned object exists
    fn stages(
        &self,
        namespace: &str,
        env: &ScenarioEnv,
        handles: &[ResourceHandle],
    ) -> Result<Evaluation>;

    /// Upper bound of the polling phase
    fn expected_duration(&self, timeouts: &Timeouts) -> Duration;
}

/// Registry of all available scenarios
pub fn all_scenarios() -> Vec<Box<dyn Scenario>> {
    vec![
        Box::new(PyTorchMnist::new(
            "mnist-cpu-single",
            "PyTorchJob MNIST on CPU, 2 workers, 1 process each",
            Accelerator::Cpu,
            2,
            1,
        )),
        Box::new(PyTorchMnist::new(
            "mnist-cpu-multi",
            "PyTorchJob MNIST on CPU, 2 workers, 2 processes each",
            Accelerator::Cpu,
            2,
            2,
        )),
        Box::new(PyTorchMnist::new(
            "mnist-cuda-single-gpu",
            "PyTorchJob MNIST on NVIDIA GPUs, 1 worker, 1 GPU per replica",
            Accelerator::Nvidia,
            1,
            1,
        )),
        Box::new(PyTorchMnist::new(
            "mnist-cuda-multi-gpu",
            "PyTorchJob MNIST on NVIDIA GPUs, 1 worker, 2 GPUs per replica",
            Accelerator::Nvidia,
            1,
            2,
        )),
        Box::new(PyTorchMnist::new(
            "mnist-rocm-single-gpu",
            "PyTorchJob MNIST on AMD GPUs, 1 worker, 1 GPU per replica",
            Accelerator::Amd,
            1,
            1,
        )),
        Box::new(PyTorchMnist::new(
            "mnist-rocm-multi-gpu",
            "PyTorchJob MNIST on AMD GPUs, 1 worker, 2 GPUs per replica",
            Accelerator::Amd,
            1,
            2,
        )),
        Box::new(RayTuneHpo::new(
            "raytune-hpo-cpu",
            "Ray Tune MNIST HPO from a notebook, Kueue admitted, CPU only",
            0,
        )),
        Box::new(RayTuneHpo::new(
            "raytune-hpo-gpu",
            "Ray Tune MNIST HPO from a notebook, Kueue admitted, 1 GPU",
            1,
        )),
    ]
}

/// Get a scenario by name
pub fn scenario_by_name(name: &str) -> Option<Box<dyn Scenario>> {
    all_scenarios().into_iter().find(|s| s.name() == name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_registry_names_are_unique() {
        let scenarios = all_scenarios();
        let names: HashSet<&str> = scenarios.iter().map(|s| s.name()).collect();
        assert_eq!(names.len(), scenarios.len());
        assert_eq!(scenarios.len(), 8);
    }

    #[test]
    fn test_lookup_by_name() {
        let scenario = scenario_by_name("mnist-cuda-multi-gpu").unwrap();
        assert_eq!(scenario.accelerator(), Accelerator::Nvidia);
        assert!(scenario_by_name("mnist-tpu").is_none());
    }
}
