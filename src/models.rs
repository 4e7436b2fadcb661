use std::collections::BTreeMap;
use std::fmt;

use minijinja::Environment;
use serde::{Deserialize, Serialize};

use crate::config::Images;
use crate::error::{Error, Result};

/// Accelerator a training workload runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Accelerator {
    Cpu,
    Nvidia,
    Amd,
}

impl Accelerator {
    pub fn is_accelerated(&self) -> bool {
        !matches!(self, Self::Cpu)
    }

    /// Extended resource name the device plugin advertises, `None` for CPU
    pub fn resource_label(&self) -> Option<&'static str> {
        match self {
            Self::Cpu => None,
            Self::Nvidia => Some("nvidia.com/gpu"),
            Self::Amd => Some("amd.com/gpu"),
        }
    }

    /// torch.distributed backend
    pub fn comm_backend(&self) -> &'static str {
        if self.is_accelerated() { "nccl" } else { "gloo" }
    }

    /// Value substituted into the training script's accelerator placeholder
    pub fn script_value(&self) -> &'static str {
        if self.is_accelerated() { "gpu" } else { "cpu" }
    }

    /// Embedded requirements file mounted as `requirements.txt`
    pub fn requirements_file(&self) -> &'static str {
        match self {
            Self::Amd => "requirements-rocm.txt",
            _ => "requirements.txt",
        }
    }

    pub fn training_image<'a>(&self, images: &'a Images) -> &'a str {
        match self {
            Self::Amd => &images.training_rocm,
            _ => &images.training_cuda,
        }
    }
}

impl fmt::Display for Accelerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "CPU"),
            Self::Nvidia => write!(f, "NVIDIA"),
            Self::Amd => write!(f, "AMD"),
        }
    }
}

/// The rank-0 replica group always has exactly one replica
pub const MASTER_REPLICAS: i32 = 1;

/// Directory the workload's config map is mounted at
pub const FILES_DIR: &str = "/mnt/files";

#[derive(Serialize)]
struct CommandContext<'a> {
    nproc_per_node: u32,
    backend: &'a str,
    files_dir: &'a str,
}

/// Validated description of a distributed training submission
///
/// Built through [`WorkloadRequestBuilder`]; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadRequest {
    accelerator: Accelerator,
    workers: u32,
    procs_per_replica: u32,
    image: String,
    files: BTreeMap<String, Vec<u8>>,
    command: String,
}

impl WorkloadRequest {
    pub fn builder(accelerator: Accelerator) -> WorkloadRequestBuilder {
        WorkloadRequestBuilder {
            accelerator,
            workers: 0,
            procs_per_replica: 1,
            image: None,
            files: BTreeMap::new(),
            command_template: None,
        }
    }

    pub fn accelerator(&self) -> Accelerator {
        self.accelerator
    }

    pub fn workers(&self) -> u32 {
        self.workers
    }

    pub fn procs_per_replica(&self) -> u32 {
        self.procs_per_replica
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    /// Shell command with procs and backend already rendered in
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Pods the training operator will create for this request
    pub fn total_replicas(&self) -> u32 {
        self.workers + MASTER_REPLICAS as u32
    }
}

pub struct WorkloadRequestBuilder {
    accelerator: Accelerator,
    workers: u32,
    procs_per_replica: u32,
    image: Option<String>,
    files: BTreeMap<String, Vec<u8>>,
    command_template: Option<String>,
}

impl WorkloadRequestBuilder {
    pub fn workers(mut self, workers: u32) -> Self {
        self.workers = workers;
        self
    }

    pub fn procs_per_replica(mut self, procs: u32) -> Self {
        self.procs_per_replica = procs;
        self
    }

    pub fn image(mut self, image: impl Into<String>) -> Self {
        self.image = Some(image.into());
        self
    }

    pub fn file(mut self, name: impl Into<String>, content: Vec<u8>) -> Self {
        self.files.insert(name.into(), content);
        self
    }

    /// Jinja template with `nproc_per_node`, `backend` and `files_dir` in scope
    pub fn command_template(mut self, template: impl Into<String>) -> Self {
        self.command_template = Some(template.into());
        self
    }

    pub fn build(self) -> Result<WorkloadRequest> {
        if self.procs_per_replica == 0 {
            return Err(Error::invalid_request(
                "processes per replica must be greater than zero",
            ));
        }
        if i32::try_from(self.workers).is_err() {
            return Err(Error::invalid_request(format!(
                "worker count {} does not fit a replica count",
                self.workers
            )));
        }
        let image = self
            .image
            .filter(|i| !i.trim().is_empty())
            .ok_or_else(|| Error::invalid_request("a container image is required"))?;
        let template = self
            .command_template
            .ok_or_else(|| Error::invalid_request("a command template is required"))?;

        for name in self.files.keys() {
            if name.is_empty() || name.contains('/') {
                return Err(Error::invalid_request(format!(
                    "mounted file name '{}' is not a valid config map key",
                    name
                )));
            }
        }

        let context = CommandContext {
            nproc_per_node: self.procs_per_replica,
            backend: self.accelerator.comm_backend(),
            files_dir: FILES_DIR,
        };
        let mut env = Environment::new();
        env.set_undefined_behavior(minijinja::UndefinedBehavior::Strict);
        env.add_template("command", &template)
            .map_err(|e| Error::invalid_request(format!("command template: {}", e)))?;
        let command = env
            .get_template("command")
            .and_then(|t| t.render(&context))
            .map_err(|e| Error::invalid_request(format!("command template: {}", e)))?;

        Ok(WorkloadRequest {
            accelerator: self.accelerator,
            workers: self.workers,
            procs_per_replica: self.procs_per_replica,
            image,
            files: self.files,
            command,
        })
    }
}

/// Observed state of a status condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    pub fn parse(value: &str) -> Self {
        match value {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }

    pub fn is_true(&self) -> bool {
        matches!(self, Self::True)
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CleanupMode {
    Cleanup,
    NoCleanup,
}

impl CleanupMode {
    pub fn should_cleanup(&self) -> bool {
        matches!(self, Self::Cleanup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionMode {
    DryRun,
    Execute,
}

impl ExecutionMode {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalHandling {
    CleanupOnSignal,
    NoCleanupOnSignal,
}

impl SignalHandling {
    pub fn should_cleanup_on_signal(&self) -> bool {
        matches!(self, Self::CleanupOnSignal)
    }
}
