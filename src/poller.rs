//! Time-bounded polling of remote state
//!
//! [`await_condition`] fetches fresh state on every poll, hands it to a
//! predicate and stops on the first [`Verdict::Satisfied`] or
//! [`Verdict::Failed`], or once the deadline has elapsed. A failed fetch counts
//! as a non-matching poll; the deadline clock keeps running.

use std::future::Future;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, warn};

use crate::config::format_duration;
use crate::error::{Error, Result};

/// Interval and deadline of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    interval: Duration,
    deadline: Duration,
}

impl PollSettings {
    pub fn new(interval: Duration, deadline: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if interval >= deadline {
            return Err(Error::config(format!(
                "poll interval {} must be shorter than the deadline {}",
                format_duration(interval),
                format_duration(deadline)
            )));
        }
        Ok(Self { interval, deadline })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn deadline(&self) -> Duration {
        self.deadline
    }
}

/// Predicate result for one observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Satisfied,
    /// Not there yet; the string says what was observed instead
    Pending(String),
    /// A terminal condition that can never turn into success
    Failed(String),
}

impl Verdict {
    pub fn pending(reason: impl Into<String>) -> Self {
        Self::Pending(reason.into())
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }
}

pub type FetchFn<S> = Box<dyn Fn() -> BoxFuture<'static, Result<S>> + Send + Sync>;
pub type PredicateFn<S> = Box<dyn Fn(&S) -> Verdict + Send + Sync>;

/// What to fetch, what to expect of it, and for how long
pub struct ConditionSpec<S> {
    expectation: String,
    settings: PollSettings,
    fetch: FetchFn<S>,
    predicate: PredicateFn<S>,
}

impl<S> ConditionSpec<S> {
    pub fn new<F, Fut, P>(
        expectation: impl Into<String>,
        settings: PollSettings,
        fetch: F,
        predicate: P,
    ) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S>> + Send + 'static,
        P: Fn(&S) -> Verdict + Send + Sync + 'static,
    {
        Self {
            expectation: expectation.into(),
            settings,
            fetch: Box::new(move || -> BoxFuture<'static, Result<S>> { Box::pin(fetch()) }),
            predicate: Box::new(predicate),
        }
    }

    pub fn expectation(&self) -> &str {
        &self.expectation
    }

    pub fn settings(&self) -> PollSettings {
        self.settings
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    Passed,
    TimedOut,
    Failed(String),
}

/// Result of awaiting one condition
#[derive(Debug, Clone)]
pub struct StageResult<S> {
    pub outcome: StageOutcome,
    /// Last successfully fetched state
    pub snapshot: Option<S>,
    pub elapsed: Duration,
    pub polls: u32,
    /// Why the last observation did not satisfy the predicate
    pub mismatch: Option<String>,
    pub last_fetch_error: Option<String>,
}

impl<S> StageResult<S> {
    pub fn is_passed(&self) -> bool {
        self.outcome == StageOutcome::Passed
    }

    /// Every poll failed to fetch; the predicate never saw any state
    pub fn never_observed(&self) -> bool {
        self.snapshot.is_none() && self.last_fetch_error.is_some()
    }

    pub fn map_snapshot<T>(self, f: impl FnOnce(S) -> T) -> StageResult<T> {
        StageResult {
            outcome: self.outcome,
            snapshot: self.snapshot.map(f),
            elapsed: self.elapsed,
            polls: self.polls,
            mismatch: self.mismatch,
            last_fetch_error: self.last_fetch_error,
        }
    }
}

/// Poll until the predicate holds, reports a terminal failure, or the deadline passes
///
/// Returns without sleeping when the first observation matches. A timeout is
/// reported no earlier than the deadline and no later than deadline plus one
/// interval: each fetch is bounded by the interval and the last sleep is
/// clamped to the time remaining.
pub async fn await_condition<S>(stage: &str, spec: &ConditionSpec<S>) -> StageResult<S> {
    let PollSettings { interval, deadline } = spec.settings;
    let start = Instant::now();
    let expires = start + deadline;

    let mut polls = 0u32;
    let mut snapshot = None;
    let mut mismatch = None;
    let mut last_fetch_error = None;

    loop {
        polls += 1;
        match timeout(interval, (spec.fetch)()).await {
            Ok(Ok(state)) => match (spec.predicate)(&state) {
                Verdict::Satisfied => {
                    debug!(stage, polls, elapsed_ms = start.elapsed().as_millis() as u64, "condition satisfied");
                    return StageResult {
                        outcome: StageOutcome::Passed,
                        snapshot: Some(state),
                        elapsed: start.elapsed(),
                        polls,
                        mismatch: None,
                        last_fetch_error,
                    };
                }
                Verdict::Failed(reason) => {
                    debug!(stage, polls, %reason, "terminal condition observed");
                    return StageResult {
                        outcome: StageOutcome::Failed(reason),
                        snapshot: Some(state),
                        elapsed: start.elapsed(),
                        polls,
                        mismatch,
                        last_fetch_error,
                    };
                }
                Verdict::Pending(reason) => {
                    debug!(stage, polls, %reason, "condition not met yet");
                    mismatch = Some(reason);
                    snapshot = Some(state);
                }
            },
            Ok(Err(e)) => {
                let e = match e {
                    Error::TransientFetch(_) => e,
                    other => Error::TransientFetch(other.to_string()),
                };
                warn!(stage, polls, error = %e, "fetch failed, will retry");
                last_fetch_error = Some(e.to_string());
            }
            Err(_) => {
                let e = Error::TransientFetch(format!(
                    "fetch did not complete within {}",
                    format_duration(interval)
                ));
                warn!(stage, polls, error = %e, "fetch timed out, will retry");
                last_fetch_error = Some(e.to_string());
            }
        }

        let now = Instant::now();
        if now >= expires {
            return StageResult {
                outcome: StageOutcome::TimedOut,
                snapshot,
                elapsed: now - start,
                polls,
                mismatch,
                last_fetch_error,
            };
        }
        sleep(interval.min(expires - now)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn settings(interval: u64, deadline: u64) -> PollSettings {
        PollSettings::new(Duration::from_secs(interval), Duration::from_secs(deadline)).unwrap()
    }

    /// Spec whose fetch returns the poll number
    fn counting_spec<P>(settings: PollSettings, predicate: P) -> (ConditionSpec<u32>, Arc<AtomicU32>)
    where
        P: Fn(&u32) -> Verdict + Send + Sync + 'static,
    {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let spec = ConditionSpec::new(
            "counter reaches target",
            settings,
            move || {
                let counter = counter.clone();
                async move { Ok(counter.fetch_add(1, Ordering::SeqCst) + 1) }
            },
            predicate,
        );
        (spec, calls)
    }

    #[test]
    fn test_interval_must_be_shorter_than_deadline() {
        assert!(PollSettings::new(Duration::from_secs(5), Duration::from_secs(5)).is_err());
        assert!(PollSettings::new(Duration::ZERO, Duration::from_secs(5)).is_err());
        assert!(PollSettings::new(Duration::from_secs(1), Duration::from_secs(5)).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_poll_match_returns_without_sleeping() {
        let (spec, calls) = counting_spec(settings(5, 60), |_| Verdict::Satisfied);

        let started = Instant::now();
        let result = await_condition("immediate", &spec).await;

        assert!(result.is_passed());
        assert_eq!(result.polls, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(result.snapshot, Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_bounded_by_deadline_and_interval() {
        for (interval, deadline) in [(5, 60), (5, 62), (7, 30)] {
            let (spec, _) = counting_spec(settings(interval, deadline), |n| {
                Verdict::pending(format!("poll {}", n))
            });

            let started = Instant::now();
            let result = await_condition("never", &spec).await;
            let elapsed = started.elapsed();

            assert_eq!(result.outcome, StageOutcome::TimedOut);
            assert!(elapsed >= Duration::from_secs(deadline));
            assert!(elapsed <= Duration::from_secs(deadline + interval));
            assert_eq!(result.elapsed, elapsed);
            assert_eq!(result.mismatch, Some(format!("poll {}", result.polls)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_count_on_exact_multiple() {
        let (spec, _) = counting_spec(settings(5, 60), |_| Verdict::pending("no"));
        let result = await_condition("exact", &spec).await;
        // t = 0, 5, ..., 60
        assert_eq!(result.polls, 13);
        assert_eq!(result.elapsed, Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_eventual_match_after_several_polls() {
        let (spec, _) = counting_spec(settings(5, 60), |n| {
            if *n >= 4 {
                Verdict::Satisfied
            } else {
                Verdict::pending("not yet")
            }
        });
        let result = await_condition("eventual", &spec).await;
        assert!(result.is_passed());
        assert_eq!(result.polls, 4);
        assert_eq!(result.elapsed, Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminal_failure_short_circuits() {
        let (spec, _) = counting_spec(settings(5, 600), |n| {
            if *n == 3 {
                Verdict::failed("Failed=True")
            } else {
                Verdict::pending("Running=Unknown")
            }
        });
        let result = await_condition("terminal", &spec).await;
        assert_eq!(result.outcome, StageOutcome::Failed("Failed=True".to_string()));
        assert_eq!(result.elapsed, Duration::from_secs(10));
        assert_eq!(result.snapshot, Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_errors_count_as_polls_without_resetting_clock() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let spec = ConditionSpec::new(
            "flaky fetch",
            settings(5, 60),
            move || {
                let counter = counter.clone();
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                    if n <= 3 {
                        Err(Error::TransientFetch("connection refused".to_string()))
                    } else {
                        Ok(n)
                    }
                }
            },
            |_| Verdict::Satisfied,
        );

        let result = await_condition("flaky", &spec).await;
        assert!(result.is_passed());
        assert_eq!(result.polls, 4);
        assert_eq!(result.elapsed, Duration::from_secs(15));
        assert!(result.last_fetch_error.unwrap().contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_fetch_errors_time_out_unobserved() {
        let spec: ConditionSpec<u32> = ConditionSpec::new(
            "unreachable",
            settings(5, 30),
            || async { Err(Error::content("boom")) },
            |_| Verdict::Satisfied,
        );

        let result = await_condition("unreachable", &spec).await;
        assert_eq!(result.outcome, StageOutcome::TimedOut);
        assert!(result.never_observed());
        assert!(result.last_fetch_error.unwrap().contains("boom"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_fetch_is_bounded_by_interval() {
        let spec: ConditionSpec<u32> = ConditionSpec::new(
            "hung",
            settings(5, 20),
            || async {
                sleep(Duration::from_secs(3600)).await;
                Ok(0)
            },
            |_| Verdict::Satisfied,
        );

        let started = Instant::now();
        let result = await_condition("hung", &spec).await;
        assert_eq!(result.outcome, StageOutcome::TimedOut);
        assert!(started.elapsed() <= Duration::from_secs(25));
        assert!(result.never_observed());
    }
}
