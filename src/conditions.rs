//! Condition observers, predicate combinators and fetch helpers
//!
//! Observers map a fetched object to a [`ConditionStatus`]. Combinators build
//! [`Verdict`]-returning predicates over freshly listed objects so compound
//! expectations ("exactly one RayCluster and it is ready") are evaluated on
//! every poll.

use std::sync::Arc;

use futures::future::BoxFuture;
use kube::Resource;
use serde::de::DeserializeOwned;

use crate::client::{ClusterClient, ResourceKind, ResourceRef, from_dynamic, from_dynamic_list};
use crate::crds::find_condition;
use crate::crds::kueue::KueueWorkload;
use crate::crds::pytorchjob::PyTorchJob;
use crate::crds::ray::{RayCluster, STATE_READY};
use crate::error::{Error, Result};
use crate::models::ConditionStatus;
use crate::poller::Verdict;

pub const JOB_RUNNING: &str = "Running";
pub const JOB_SUCCEEDED: &str = "Succeeded";
pub const JOB_FAILED: &str = "Failed";
pub const WORKLOAD_ADMITTED: &str = "Admitted";

pub type Predicate<S> = Box<dyn Fn(&S) -> Verdict + Send + Sync>;

/// Status of a PyTorchJob condition type
pub fn job_condition(job: &PyTorchJob, type_: &str) -> ConditionStatus {
    find_condition(job.conditions(), type_)
        .map(|c| ConditionStatus::parse(&c.status))
        .unwrap_or(ConditionStatus::Unknown)
}

pub fn workload_admitted(workload: &KueueWorkload) -> ConditionStatus {
    find_condition(workload.conditions(), WORKLOAD_ADMITTED)
        .map(|c| ConditionStatus::parse(&c.status))
        .unwrap_or(ConditionStatus::Unknown)
}

pub fn ray_cluster_ready(cluster: &RayCluster) -> ConditionStatus {
    match cluster.state() {
        None => ConditionStatus::Unknown,
        Some(state) if state.eq_ignore_ascii_case(STATE_READY) => ConditionStatus::True,
        Some(_) => ConditionStatus::False,
    }
}

fn job_failure(job: &PyTorchJob) -> Option<String> {
    let failed = find_condition(job.conditions(), JOB_FAILED)?;
    if !ConditionStatus::parse(&failed.status).is_true() {
        return None;
    }
    let mut reason = format!("{}=True", JOB_FAILED);
    if let Some(r) = &failed.reason {
        reason.push_str(&format!(" ({})", r));
    }
    if let Some(m) = &failed.message {
        reason.push_str(&format!(": {}", m));
    }
    Some(reason)
}

/// The job has reached `type_`; a `Failed=True` job can never get there
///
/// A job observed as succeeded also counts as having been running, since a
/// short job can pass through `Running` between two polls.
pub fn job_reached(type_: &'static str) -> impl Fn(&PyTorchJob) -> Verdict + Send + Sync + Clone {
    move |job| {
        if let Some(reason) = job_failure(job) {
            return Verdict::Failed(reason);
        }
        let status = job_condition(job, type_);
        if status.is_true()
            || (type_ == JOB_RUNNING && job_condition(job, JOB_SUCCEEDED).is_true())
        {
            return Verdict::Satisfied;
        }
        Verdict::pending(format!("{}={}", type_, status))
    }
}

/// Exactly `n` items
pub fn have_len<T>(n: usize) -> impl Fn(&Vec<T>) -> Verdict + Send + Sync + Clone {
    move |items| {
        if items.len() == n {
            Verdict::Satisfied
        } else {
            Verdict::pending(format!("expected {} item(s), found {}", n, items.len()))
        }
    }
}

/// At least one item matches `matcher`
pub fn contains_element<T, M>(
    description: impl Into<String>,
    matcher: M,
) -> impl Fn(&Vec<T>) -> Verdict + Send + Sync + Clone
where
    M: Fn(&T) -> bool + Send + Sync + Clone,
{
    let description = description.into();
    move |items| {
        if items.iter().any(&matcher) {
            Verdict::Satisfied
        } else {
            Verdict::pending(format!("no item {}", description))
        }
    }
}

/// Every predicate holds; reports the first one that does not
pub fn all_of<S>(predicates: Vec<Predicate<S>>) -> impl Fn(&S) -> Verdict + Send + Sync {
    move |state| {
        predicates
            .iter()
            .map(|p| p(state))
            .find(|v| !v.is_satisfied())
            .unwrap_or(Verdict::Satisfied)
    }
}

/// Inverts presence into absence; terminal failures pass through
pub fn negate<S, P>(
    description: impl Into<String>,
    predicate: P,
) -> impl Fn(&S) -> Verdict + Send + Sync
where
    P: Fn(&S) -> Verdict + Send + Sync,
{
    let description = description.into();
    move |state| match predicate(state) {
        Verdict::Satisfied => Verdict::pending(format!("still {}", description)),
        Verdict::Pending(_) => Verdict::Satisfied,
        failed @ Verdict::Failed(_) => failed,
    }
}

/// Object is gone
pub fn absent<T>() -> impl Fn(&Option<T>) -> Verdict + Send + Sync + Clone {
    |obj| match obj {
        None => Verdict::Satisfied,
        Some(_) => Verdict::pending("object still exists"),
    }
}

pub fn boxed<S, P>(predicate: P) -> Predicate<S>
where
    P: Fn(&S) -> Verdict + Send + Sync + 'static,
{
    Box::new(predicate)
}

/// Fetch one object; absence is a fetch error so the poll counts as non-matching
pub fn fetch_object<K>(
    client: Arc<dyn ClusterClient>,
    target: ResourceRef,
) -> impl Fn() -> BoxFuture<'static, Result<K>> + Send + Sync + 'static
where
    K: Resource + DeserializeOwned + Send + 'static,
{
    move || -> BoxFuture<'static, Result<K>> {
        let client = client.clone();
        let target = target.clone();
        Box::pin(async move {
            match client.get(&target).await? {
                Some(obj) => from_dynamic(&obj),
                None => Err(Error::TransientFetch(format!("{} not found", target))),
            }
        })
    }
}

/// Fetch one object, `None` when it does not exist
pub fn fetch_optional<K>(
    client: Arc<dyn ClusterClient>,
    target: ResourceRef,
) -> impl Fn() -> BoxFuture<'static, Result<Option<K>>>
+ Send
+ Sync
+ 'static
where
    K: DeserializeOwned + Send + 'static,
{
    move || -> BoxFuture<'static, Result<Option<K>>> {
        let client = client.clone();
        let target = target.clone();
        Box::pin(async move {
            client
                .get(&target)
                .await?
                .map(|obj| from_dynamic(&obj))
                .transpose()
        })
    }
}

/// List objects of `kind` in a namespace, optionally by label selector
pub fn fetch_list<K>(
    client: Arc<dyn ClusterClient>,
    kind: ResourceKind,
    namespace: String,
    label_selector: Option<String>,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<K>>>
+ Send
+ Sync
+ 'static
where
    K: DeserializeOwned + Send + 'static,
{
    move || -> BoxFuture<'static, Result<Vec<K>>> {
        let client = client.clone();
        let namespace = namespace.clone();
        let selector = label_selector.clone();
        Box::pin(async move {
            let objects = client
                .list(kind, Some(&namespace), selector.as_deref())
                .await?;
            from_dynamic_list(&objects)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::Condition;
    use crate::crds::kueue::{KueueWorkloadSpec, KueueWorkloadStatus};
    use crate::crds::pytorchjob::{PyTorchJobSpec, PyTorchJobStatus};
    use crate::crds::ray::{RayClusterSpec, RayClusterStatus};

    fn job(conditions: Vec<Condition>) -> PyTorchJob {
        let mut job = PyTorchJob::new("kfto-mnist-abc", PyTorchJobSpec::default());
        job.status = Some(PyTorchJobStatus {
            conditions,
            ..Default::default()
        });
        job
    }

    fn ray(state: Option<&str>) -> RayCluster {
        let mut rc = RayCluster::new("raycluster", RayClusterSpec::default());
        rc.status = Some(RayClusterStatus {
            state: state.map(str::to_string),
            ..Default::default()
        });
        rc
    }

    #[test]
    fn test_job_condition_tri_state() {
        let j = job(vec![
            Condition::new("Created", "True"),
            Condition::new("Running", "False"),
        ]);
        assert_eq!(job_condition(&j, "Created"), ConditionStatus::True);
        assert_eq!(job_condition(&j, "Running"), ConditionStatus::False);
        assert_eq!(job_condition(&j, "Succeeded"), ConditionStatus::Unknown);

        let no_status = PyTorchJob::new("x", PyTorchJobSpec::default());
        assert_eq!(job_condition(&no_status, "Running"), ConditionStatus::Unknown);
    }

    #[test]
    fn test_job_reached_running_accepts_succeeded() {
        let running = job_reached(JOB_RUNNING);
        assert_eq!(
            running(&job(vec![Condition::new("Running", "True")])),
            Verdict::Satisfied
        );
        assert_eq!(
            running(&job(vec![Condition::new("Succeeded", "True")])),
            Verdict::Satisfied
        );
        assert_eq!(
            running(&job(vec![Condition::new("Created", "True")])),
            Verdict::pending("Running=Unknown")
        );
    }

    #[test]
    fn test_job_failed_is_terminal() {
        let succeeded = job_reached(JOB_SUCCEEDED);
        let verdict = succeeded(&job(vec![
            Condition::new("Running", "False"),
            Condition::new("Failed", "True").with_reason("BackoffLimitExceeded"),
        ]));
        assert_eq!(
            verdict,
            Verdict::failed("Failed=True (BackoffLimitExceeded)")
        );
    }

    #[test]
    fn test_workload_admitted() {
        let mut wl = KueueWorkload::new("wl", KueueWorkloadSpec::default());
        assert_eq!(workload_admitted(&wl), ConditionStatus::Unknown);
        wl.status = Some(KueueWorkloadStatus {
            conditions: vec![Condition::new("Admitted", "True")],
            admission: None,
        });
        assert_eq!(workload_admitted(&wl), ConditionStatus::True);
    }

    #[test]
    fn test_compound_list_predicate() {
        let predicate = all_of(vec![
            boxed(have_len::<RayCluster>(1)),
            boxed(contains_element("in state ready", |rc: &RayCluster| {
                ray_cluster_ready(rc).is_true()
            })),
        ]);

        assert_eq!(
            predicate(&vec![]),
            Verdict::pending("expected 1 item(s), found 0")
        );
        assert_eq!(
            predicate(&vec![ray(Some("unhealthy"))]),
            Verdict::pending("no item in state ready")
        );
        assert_eq!(predicate(&vec![ray(Some("ready"))]), Verdict::Satisfied);
        assert_eq!(
            predicate(&vec![ray(Some("ready")), ray(None)]),
            Verdict::pending("expected 1 item(s), found 2")
        );
    }

    #[test]
    fn test_absence_is_inverted_presence() {
        let gone = negate("present", have_len::<u8>(1));
        assert_eq!(gone(&vec![]), Verdict::Satisfied);
        assert_eq!(gone(&vec![1]), Verdict::pending("still present"));

        let missing = absent::<u8>();
        assert_eq!(missing(&None), Verdict::Satisfied);
        assert!(!missing(&Some(1)).is_satisfied());
    }
}
