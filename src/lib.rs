//! End-to-end checks for distributed training on Kubernetes
//!
//! Each scenario submits a training workload into a fresh namespace, waits
//! for a sequence of observable conditions and removes everything it created.

pub mod client;
pub mod conditions;
pub mod config;
pub mod content;
pub mod crds;
pub mod error;
pub mod evaluator;
pub mod formatters;
pub mod lifecycle;
pub mod metrics;
pub mod models;
pub mod poller;
pub mod scenarios;
pub mod workloads;

pub use error::{Error, Result};
