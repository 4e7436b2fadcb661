//! Runs scenarios against a cluster and reports what happened

use chrono::{DateTime, Utc};
use futures::future::join_all;
use owo_colors::OwoColorize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::{Scenario, ScenarioEnv};
use crate::client::{ResourceKind, ResourceRef, to_dynamic};
use crate::config::TimeoutTier;
use crate::error::{Error, Result};
use crate::evaluator::{EvaluationOutcome, PhaseEntry, PhaseLog, ScenarioPhase, StageReport};
use crate::lifecycle::{ResourceLifecycle, TeardownReport, scoped};
use crate::models::CleanupMode;
use crate::workloads::namespace;

const REDACTED: &str = "<redacted>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioOutcome {
    Passed,
    Failed,
    Interrupted,
}

/// Everything recorded about one scenario run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScenarioReport {
    pub scenario: String,
    pub run_id: String,
    pub namespace: String,
    pub outcome: ScenarioOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_stage: Option<String>,
    pub stages: Vec<StageReport>,
    pub teardown: TeardownReport,
    /// Left in place because cleanup was disabled
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub kept: Vec<ResourceRef>,
    pub phases: Vec<PhaseEntry>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ScenarioReport {
    pub fn passed(&self) -> bool {
        self.outcome == ScenarioOutcome::Passed
    }

    pub fn duration_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}

pub struct ScenarioRunner {
    env: ScenarioEnv,
    cleanup: CleanupMode,
    cancel: CancellationToken,
}

impl ScenarioRunner {
    pub fn new(env: ScenarioEnv, cleanup: CleanupMode) -> Self {
        Self {
            env,
            cleanup,
            cancel: CancellationToken::new(),
        }
    }

    /// Token that interrupts every running scenario when cancelled
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn lifecycle(&self) -> ResourceLifecycle {
        let lifecycle = ResourceLifecycle::new(self.env.client.clone());
        if !self.env.config.teardown.await_namespace_deletion {
            return lifecycle;
        }
        match self.env.config.timeouts.poll(TimeoutTier::Long) {
            Ok(settings) => lifecycle.with_namespace_wait(settings),
            Err(e) => {
                warn!(error = %e, "not waiting for namespace deletion");
                lifecycle
            }
        }
    }

    /// Run scenarios concurrently, one namespace each
    pub async fn run_all(&self, scenarios: &[Box<dyn Scenario>]) -> Vec<ScenarioReport> {
        join_all(scenarios.iter().map(|s| self.run(s.as_ref()))).await
    }

    pub async fn run(&self, scenario: &dyn Scenario) -> ScenarioReport {
        let run_id = Uuid::new_v4().simple().to_string();
        let namespace = format!("{}-{}", self.env.config.namespace_prefix, &run_id[..8]);
        let started_at = Utc::now();
        let mut phases = PhaseLog::new(scenario.name());

        println!(
            "{} {} in namespace {}",
            "Starting".bold(),
            scenario.name().cyan(),
            namespace
        );
        info!(
            scenario = scenario.name(),
            %namespace,
            expected_secs = scenario.expected_duration(&self.env.config.timeouts).as_secs(),
            "starting scenario"
        );

        let lifecycle = self.lifecycle();
        let cleanup = self.cleanup.should_cleanup();
        let cancel = self.cancel.clone();
        let env = &self.env;
        let ns = namespace.as_str();
        let log = &mut phases;

        let (result, teardown) = scoped(&lifecycle, |lc| async move {
            let outcome = execute(scenario, ns, env, &lc, log, &cancel).await;
            let kept = if cleanup { Vec::new() } else { lc.abandon() };
            Ok::<_, Error>((outcome, kept))
        })
        .await;
        phases.advance(ScenarioPhase::TornDown);

        let (outcome, kept) = match result {
            Ok(done) => done,
            Err(e) => (
                EvaluationOutcome {
                    stages: Vec::new(),
                    error: Some(e),
                },
                Vec::new(),
            ),
        };

        let mut error = outcome.error;
        if error.is_none() && !teardown.is_clean() {
            error = teardown.clone().into_result().err();
        }

        let report = ScenarioReport {
            scenario: scenario.name().to_string(),
            run_id,
            namespace,
            outcome: match &error {
                None => ScenarioOutcome::Passed,
                Some(Error::Interrupted) => ScenarioOutcome::Interrupted,
                Some(_) => ScenarioOutcome::Failed,
            },
            failed_stage: error.as_ref().and_then(|e| e.failed_stage()).map(str::to_string),
            error: error.as_ref().map(|e| e.to_string()),
            stages: outcome.stages,
            teardown,
            kept,
            phases: phases.entries().to_vec(),
            started_at,
            finished_at: Utc::now(),
        };
        print_summary(&report);
        report
    }
}

async fn execute(
    scenario: &dyn Scenario,
    namespace: &str,
    env: &ScenarioEnv,
    lifecycle: &ResourceLifecycle,
    phases: &mut PhaseLog,
    cancel: &CancellationToken,
) -> EvaluationOutcome {
    match prepare(scenario, namespace, env, lifecycle, phases, cancel).await {
        // a create in flight is never dropped; interrupts land between creates or while polling
        Ok(evaluation) => tokio::select! {
            outcome = evaluation.run(phases) => outcome,
            _ = cancel.cancelled() => {
                warn!(scenario = scenario.name(), "interrupted, releasing resources");
                EvaluationOutcome {
                    stages: Vec::new(),
                    error: Some(Error::Interrupted),
                }
            }
        },
        Err(Error::Interrupted) => {
            warn!(scenario = scenario.name(), "interrupted during setup, releasing resources");
            EvaluationOutcome {
                stages: Vec::new(),
                error: Some(Error::Interrupted),
            }
        }
        Err(e) => {
            warn!(scenario = scenario.name(), error = %e, "scenario setup failed");
            EvaluationOutcome {
                stages: Vec::new(),
                error: Some(e),
            }
        }
    }
}

async fn prepare(
    scenario: &dyn Scenario,
    namespace_name: &str,
    env: &ScenarioEnv,
    lifecycle: &ResourceLifecycle,
    phases: &mut PhaseLog,
    cancel: &CancellationToken,
) -> Result<crate::evaluator::Evaluation> {
    // plan first so a bad plan creates nothing
    let plan = scenario.plan(namespace_name, env)?;

    if cancel.is_cancelled() {
        return Err(Error::Interrupted);
    }
    let mut handles = vec![
        lifecycle
            .acquire_typed(ResourceKind::Namespace, &namespace(namespace_name))
            .await?,
    ];
    for descriptor in plan {
        if cancel.is_cancelled() {
            return Err(Error::Interrupted);
        }
        handles.push(lifecycle.acquire(descriptor).await?);
    }
    phases.advance(ScenarioPhase::ResourcesAcquired);

    scenario.stages(namespace_name, env, &handles)
}

fn print_summary(report: &ScenarioReport) {
    match report.outcome {
        ScenarioOutcome::Passed => println!(
            "{} {} ({:.0}s)",
            "PASSED".green().bold(),
            report.scenario,
            report.duration_secs()
        ),
        ScenarioOutcome::Interrupted => println!(
            "{} {}",
            "INTERRUPTED".yellow().bold(),
            report.scenario
        ),
        ScenarioOutcome::Failed => {
            println!("{} {}", "FAILED".red().bold(), report.scenario);
            if let Some(error) = &report.error {
                println!("{}", error);
            }
        }
    }
    for target in &report.kept {
        println!("  kept {}", target.to_string().dimmed());
    }
}

/// Manifests a scenario would submit, as a multi-document YAML stream
///
/// Nothing is sent to the cluster. Credentials are replaced by a placeholder.
pub fn render(scenario: &dyn Scenario, namespace_name: &str, env: &ScenarioEnv) -> Result<String> {
    let mut redacted = env.clone();
    redacted.config.notebook_user.token = Some(REDACTED.to_string());
    if redacted.config.notebook_user.name.is_none() {
        redacted.config.notebook_user.name = Some("<notebook-user>".to_string());
    }

    let mut documents = vec![serde_yaml::to_string(&to_dynamic(&namespace(namespace_name))?)?];
    for descriptor in scenario.plan(namespace_name, &redacted)? {
        documents.push(serde_yaml::to_string(&descriptor.object)?);
    }
    Ok(documents.join("---\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::memory::InMemoryCluster;
    use crate::config::HarnessConfig;
    use crate::content::EmbeddedResources;
    use crate::scenarios::scenario_by_name;
    use std::sync::Arc;

    fn env(cluster: &InMemoryCluster) -> ScenarioEnv {
        let mut config = HarnessConfig::default();
        config.notebook_user.name = Some("developer".to_string());
        config.notebook_user.token = Some("sha256~secret".to_string());
        ScenarioEnv {
            client: Arc::new(cluster.clone()),
            config,
            content: Arc::new(EmbeddedResources),
            metrics: None,
            api_url: "https://api.example.com:6443".to_string(),
        }
    }

    #[test]
    fn test_render_redacts_token_and_creates_nothing() {
        let cluster = InMemoryCluster::new();
        let scenario = scenario_by_name("raytune-hpo-cpu").unwrap();
        let rendered = render(scenario.as_ref(), "test-ns-render", &env(&cluster)).unwrap();

        assert!(!rendered.contains("sha256~secret"));
        assert!(rendered.contains(REDACTED));
        assert!(rendered.starts_with("apiVersion: v1\nkind: Namespace\n"));
        assert_eq!(rendered.lines().filter(|l| *l == "---").count(), 6);
        assert!(cluster.created().is_empty());
    }

    #[test]
    fn test_render_without_notebook_user() {
        let cluster = InMemoryCluster::new();
        let mut env = env(&cluster);
        env.config.notebook_user.name = None;
        env.config.notebook_user.token = None;
        let scenario = scenario_by_name("raytune-hpo-gpu").unwrap();
        assert!(render(scenario.as_ref(), "ns", &env).is_ok());
    }
}
