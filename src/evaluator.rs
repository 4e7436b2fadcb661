//! Ordered multi-stage assertions over polled cluster state
//!
//! An [`Evaluation`] runs its stages strictly in sequence. The first stage that
//! does not pass stops the run; the remaining stages are reported as skipped.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::error::{Error, Result, StageFailure};
use crate::poller::{ConditionSpec, PollSettings, StageOutcome, StageResult, await_condition};

/// Where a scenario is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScenarioPhase {
    Building,
    ResourcesAcquired,
    Polling(usize),
    Passed(usize),
    Succeeded,
    Failed,
    TornDown,
}

impl ScenarioPhase {
    /// Whether `next` may follow this phase; every phase may go to `TornDown`
    pub fn can_advance_to(&self, next: ScenarioPhase) -> bool {
        use ScenarioPhase::*;
        match (*self, next) {
            (TornDown, _) => false,
            (_, TornDown) => true,
            (Building, ResourcesAcquired) => true,
            (ResourcesAcquired, Polling(0)) | (ResourcesAcquired, Succeeded) => true,
            (Polling(i), Passed(j)) => i == j,
            (Polling(_), Failed) => true,
            (Passed(i), Polling(j)) => j == i + 1,
            (Passed(_), Succeeded) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Building => write!(f, "building"),
            Self::ResourcesAcquired => write!(f, "resources-acquired"),
            Self::Polling(i) => write!(f, "polling({})", i),
            Self::Passed(i) => write!(f, "passed({})", i),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::TornDown => write!(f, "torn-down"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseEntry {
    pub phase: ScenarioPhase,
    pub at: DateTime<Utc>,
}

/// Timestamped phase transitions of one scenario
#[derive(Debug, Clone, Default, Serialize)]
pub struct PhaseLog {
    scenario: String,
    entries: Vec<PhaseEntry>,
}

impl PhaseLog {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            entries: vec![PhaseEntry {
                phase: ScenarioPhase::Building,
                at: Utc::now(),
            }],
        }
    }

    pub fn current(&self) -> ScenarioPhase {
        self.entries
            .last()
            .map(|e| e.phase)
            .unwrap_or(ScenarioPhase::Building)
    }

    /// Record `next`; an unexpected transition is logged and still recorded
    pub fn advance(&mut self, next: ScenarioPhase) {
        let current = self.current();
        if current == next {
            return;
        }
        if !current.can_advance_to(next) {
            warn!(scenario = %self.scenario, from = %current, to = %next, "unexpected phase transition");
        }
        self.entries.push(PhaseEntry {
            phase: next,
            at: Utc::now(),
        });
    }

    pub fn phases(&self) -> Vec<ScenarioPhase> {
        self.entries.iter().map(|e| e.phase).collect()
    }

    pub fn entries(&self) -> &[PhaseEntry] {
        &self.entries
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StageStatus {
    Passed,
    TimedOut,
    Failed,
    Skipped,
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::TimedOut => write!(f, "timed out"),
            Self::Failed => write!(f, "failed"),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// One row of the run report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StageReport {
    pub name: String,
    pub expectation: String,
    pub status: StageStatus,
    pub elapsed_secs: f64,
    pub deadline_secs: u64,
    pub polls: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[async_trait]
trait ErasedStage: Send + Sync {
    fn name(&self) -> &str;
    fn expectation(&self) -> &str;
    fn settings(&self) -> PollSettings;
    async fn run(&self) -> StageResult<Value>;
}

struct TypedStage<S> {
    name: String,
    spec: ConditionSpec<S>,
}

#[async_trait]
impl<S> ErasedStage for TypedStage<S>
where
    S: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn expectation(&self) -> &str {
        self.spec.expectation()
    }

    fn settings(&self) -> PollSettings {
        self.spec.settings()
    }

    async fn run(&self) -> StageResult<Value> {
        await_condition(&self.name, &self.spec)
            .await
            .map_snapshot(|s| snapshot_value(&self.name, &s))
    }
}

/// What an evaluation produced
#[derive(Debug)]
pub struct EvaluationOutcome {
    pub stages: Vec<StageReport>,
    /// First failing stage as `StageTimeout` or `StageFailed`
    pub error: Option<Error>,
}

impl EvaluationOutcome {
    pub fn passed(&self) -> bool {
        self.error.is_none()
    }

    pub fn into_result(self) -> Result<Vec<StageReport>> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.stages),
        }
    }
}

/// Named stages awaited in order
#[derive(Default)]
pub struct Evaluation {
    stages: Vec<Box<dyn ErasedStage>>,
}

impl Evaluation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stage<S>(mut self, name: impl Into<String>, spec: ConditionSpec<S>) -> Self
    where
        S: Serialize + Send + Sync + 'static,
    {
        self.stages.push(Box::new(TypedStage {
            name: name.into(),
            spec,
        }));
        self
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.name().to_string()).collect()
    }

    /// Sum of all stage deadlines, the upper bound of a run
    pub fn total_deadline(&self) -> Duration {
        self.stages.iter().map(|s| s.settings().deadline()).sum()
    }

    pub async fn run(self, phases: &mut PhaseLog) -> EvaluationOutcome {
        let mut reports = Vec::with_capacity(self.stages.len());
        let mut error = None;

        for (index, stage) in self.stages.iter().enumerate() {
            if error.is_some() {
                reports.push(StageReport {
                    name: stage.name().to_string(),
                    expectation: stage.expectation().to_string(),
                    status: StageStatus::Skipped,
                    elapsed_secs: 0.0,
                    deadline_secs: stage.settings().deadline().as_secs(),
                    polls: 0,
                    detail: None,
                });
                continue;
            }

            phases.advance(ScenarioPhase::Polling(index));
            info!(stage = stage.name(), expectation = stage.expectation(), "waiting");
            let result = stage.run().await;

            let status = match &result.outcome {
                StageOutcome::Passed => StageStatus::Passed,
                StageOutcome::TimedOut => StageStatus::TimedOut,
                StageOutcome::Failed(_) => StageStatus::Failed,
            };
            let mut report = StageReport {
                name: stage.name().to_string(),
                expectation: stage.expectation().to_string(),
                status,
                elapsed_secs: result.elapsed.as_secs_f64(),
                deadline_secs: stage.settings().deadline().as_secs(),
                polls: result.polls,
                detail: None,
            };

            if result.is_passed() {
                info!(
                    stage = stage.name(),
                    elapsed_ms = result.elapsed.as_millis() as u64,
                    polls = result.polls,
                    "stage passed"
                );
                phases.advance(ScenarioPhase::Passed(index));
            } else {
                let e = stage_error(stage.as_ref(), result);
                warn!(stage = stage.name(), error = %first_line(&e), "stage did not pass");
                report.detail = Some(first_line(&e));
                phases.advance(ScenarioPhase::Failed);
                error = Some(e);
            }
            reports.push(report);
        }

        if error.is_none() {
            phases.advance(ScenarioPhase::Succeeded);
        }
        EvaluationOutcome {
            stages: reports,
            error,
        }
    }
}

/// Observed state as JSON; unserializable state is logged and shown as null
fn snapshot_value<S: Serialize>(stage: &str, state: &S) -> Value {
    serde_json::to_value(state).unwrap_or_else(|e| {
        warn!(stage, error = %e, "could not serialize observed state");
        Value::Null
    })
}

fn first_line(e: &Error) -> String {
    e.to_string().lines().next().unwrap_or_default().to_string()
}

fn stage_error(stage: &dyn ErasedStage, result: StageResult<Value>) -> Error {
    let never_observed = result.never_observed();
    let snapshot = result
        .snapshot
        .as_ref()
        .and_then(|s| serde_yaml::to_string(s).ok());
    let (terminal_reason, timed_out) = match result.outcome {
        StageOutcome::Failed(reason) => (Some(reason), false),
        _ => (None, true),
    };
    let failure = Box::new(StageFailure {
        stage: stage.name().to_string(),
        expectation: stage.expectation().to_string(),
        elapsed: result.elapsed,
        deadline: stage.settings().deadline(),
        polls: result.polls,
        mismatch: result.mismatch,
        terminal_reason,
        last_fetch_error: result.last_fetch_error,
        never_observed,
        snapshot,
    });
    if timed_out {
        Error::StageTimeout(failure)
    } else {
        Error::StageFailed(failure)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::Verdict;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(deadline: u64) -> PollSettings {
        PollSettings::new(Duration::from_secs(5), Duration::from_secs(deadline)).unwrap()
    }

    /// Fetch yields `{"polls": n}`; satisfied from poll `ready_at` on
    fn stage(ready_at: u32, deadline: u64) -> (ConditionSpec<Value>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let spec = ConditionSpec::new(
            format!("ready after {} polls", ready_at),
            settings(deadline),
            move || {
                let counter = counter.clone();
                async move { Ok(json!({ "polls": counter.fetch_add(1, Ordering::SeqCst) + 1 })) }
            },
            move |v: &Value| {
                if v["polls"].as_u64().unwrap_or(0) >= ready_at as u64 {
                    Verdict::Satisfied
                } else {
                    Verdict::pending(format!("polls={}", v["polls"]))
                }
            },
        );
        (spec, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_stages_pass_in_order() {
        let (first, _) = stage(2, 60);
        let (second, _) = stage(1, 60);
        let evaluation = Evaluation::new().stage("Running", first).stage("Succeeded", second);
        assert_eq!(evaluation.total_deadline(), Duration::from_secs(120));

        let mut phases = PhaseLog::new("cpu");
        phases.advance(ScenarioPhase::ResourcesAcquired);
        let outcome = evaluation.run(&mut phases).await;

        assert!(outcome.passed());
        assert_eq!(outcome.stages.len(), 2);
        assert_eq!(outcome.stages[0].status, StageStatus::Passed);
        assert_eq!(outcome.stages[0].polls, 2);
        assert_eq!(outcome.stages[0].elapsed_secs, 5.0);
        assert_eq!(
            phases.phases(),
            vec![
                ScenarioPhase::Building,
                ScenarioPhase::ResourcesAcquired,
                ScenarioPhase::Polling(0),
                ScenarioPhase::Passed(0),
                ScenarioPhase::Polling(1),
                ScenarioPhase::Passed(1),
                ScenarioPhase::Succeeded,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_failure_short_circuits() {
        let (first, _) = stage(1, 60);
        let (second, _) = stage(u32::MAX, 30);
        let (third, third_calls) = stage(1, 60);
        let evaluation = Evaluation::new()
            .stage("Running", first)
            .stage("Admitted", second)
            .stage("Succeeded", third);

        let mut phases = PhaseLog::new("hpo");
        phases.advance(ScenarioPhase::ResourcesAcquired);
        let outcome = evaluation.run(&mut phases).await;

        assert_eq!(third_calls.load(Ordering::SeqCst), 0);
        let statuses: Vec<_> = outcome.stages.iter().map(|s| s.status).collect();
        assert_eq!(
            statuses,
            vec![StageStatus::Passed, StageStatus::TimedOut, StageStatus::Skipped]
        );
        assert_eq!(phases.current(), ScenarioPhase::Failed);

        let err = outcome.error.unwrap();
        assert_eq!(err.failed_stage(), Some("Admitted"));
        let msg = err.to_string();
        assert!(msg.starts_with("stage 'Admitted' timed out after 30s"));
        assert!(msg.contains("7 polls"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_verdict_maps_to_stage_failed() {
        let spec = ConditionSpec::new(
            "job succeeded",
            settings(600),
            || async { Ok(json!({"conditions": [{"type": "Failed", "status": "True"}]})) },
            |_: &Value| Verdict::failed("Failed=True (OOMKilled)"),
        );
        let mut phases = PhaseLog::new("gpu");
        let outcome = Evaluation::new().stage("Succeeded", spec).run(&mut phases).await;

        assert_eq!(outcome.stages[0].status, StageStatus::Failed);
        match outcome.error {
            Some(Error::StageFailed(f)) => {
                assert_eq!(f.terminal_reason.as_deref(), Some("Failed=True (OOMKilled)"));
                assert!(f.snapshot.unwrap().contains("type: Failed"));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_unserializable_state_becomes_null() {
        // JSON objects need string keys
        let state = std::collections::BTreeMap::from([((1u8, 2u8), 3u8)]);
        assert_eq!(snapshot_value("Running", &state), Value::Null);
        assert_eq!(snapshot_value("Running", &json!({"a": 1})), json!({"a": 1}));
    }

    #[test]
    fn test_phase_transitions() {
        use ScenarioPhase::*;
        assert!(Building.can_advance_to(ResourcesAcquired));
        assert!(Building.can_advance_to(TornDown));
        assert!(Polling(0).can_advance_to(Passed(0)));
        assert!(!Polling(0).can_advance_to(Passed(1)));
        assert!(Passed(0).can_advance_to(Polling(1)));
        assert!(!Passed(0).can_advance_to(Polling(2)));
        assert!(Polling(3).can_advance_to(Failed));
        assert!(Failed.can_advance_to(TornDown));
        assert!(!Succeeded.can_advance_to(Failed));
        assert!(!TornDown.can_advance_to(TornDown));
    }
}
