//! Resource acquisition and guaranteed release
//!
//! Every object a scenario creates goes through [`ResourceLifecycle::acquire`]
//! and lands in a ledger. [`ResourceLifecycle::release_all`] drains the ledger
//! exactly once: cluster-scoped and explicitly released objects first in
//! reverse creation order, namespaces last. Namespaced objects whose namespace
//! is also tracked are left to the namespace cascade.

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use kube::Resource;
use kube::api::DynamicObject;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::client::{ClusterClient, DeleteOutcome, ResourceKind, ResourceRef, to_dynamic};
use crate::conditions::{absent, fetch_optional};
use crate::error::{Error, Result};
use crate::poller::{ConditionSpec, PollSettings, await_condition};

/// How an acquired object is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// Removed with its namespace when the namespace is tracked too
    Cascade,
    /// Deleted explicitly
    Explicit,
    /// Deleted explicitly, then polled until it is gone
    ExplicitThenAwaitAbsence(PollSettings),
}

/// An object to create plus its release policy
#[derive(Debug, Clone)]
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub object: DynamicObject,
    pub policy: ReleasePolicy,
}

impl ResourceDescriptor {
    /// Describe a typed object; namespaced kinds default to [`ReleasePolicy::Cascade`]
    pub fn new<K>(kind: ResourceKind, object: &K) -> Result<Self>
    where
        K: Resource + Serialize,
    {
        let policy = if kind.is_namespaced() {
            ReleasePolicy::Cascade
        } else {
            ReleasePolicy::Explicit
        };
        Ok(Self {
            kind,
            object: to_dynamic(object)?,
            policy,
        })
    }

    pub fn with_policy(mut self, policy: ReleasePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Name, or the generateName prefix followed by `*`
    pub fn display_name(&self) -> String {
        let meta = &self.object.metadata;
        let name = match (&meta.name, &meta.generate_name) {
            (Some(name), _) => name.clone(),
            (None, Some(prefix)) => format!("{}*", prefix),
            (None, None) => "<unnamed>".to_string(),
        };
        match meta.namespace.as_deref().filter(|_| self.kind.is_namespaced()) {
            Some(ns) => format!("{} {}/{}", self.kind, ns, name),
            None => format!("{} {}", self.kind, name),
        }
    }
}

/// A live object owned by one scenario
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub target: ResourceRef,
    pub policy: ReleasePolicy,
    pub uid: Option<String>,
}

impl ResourceHandle {
    pub fn name(&self) -> &str {
        &self.target.name
    }
}

/// A teardown problem that does not fail the scenario
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TeardownWarning {
    pub target: ResourceRef,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TeardownFailure {
    pub target: Option<ResourceRef>,
    pub message: String,
}

/// What `release_all` did
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TeardownReport {
    pub released: Vec<ResourceRef>,
    /// Left to their namespace's deletion
    pub cascaded: Vec<ResourceRef>,
    pub warnings: Vec<TeardownWarning>,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.released.is_empty()
            && self.cascaded.is_empty()
            && self.warnings.is_empty()
            && self.failures.is_empty()
    }

    pub fn into_result(self) -> Result<()> {
        if self.failures.is_empty() {
            return Ok(());
        }
        Err(Error::TeardownIncomplete(
            self.failures.into_iter().filter_map(|f| f.target).collect(),
        ))
    }
}

struct Ledger {
    handles: Vec<ResourceHandle>,
    client: Arc<dyn ClusterClient>,
}

impl Drop for Ledger {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        let leaked: Vec<String> = self.handles.iter().map(|h| h.target.to_string()).collect();
        error!(
            resources = %leaked.join(", "),
            "resource lifecycle dropped without release, attempting best-effort cleanup"
        );
        // the runtime may already be shutting down; nothing more can be done then
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handles = std::mem::take(&mut self.handles);
            let client = self.client.clone();
            runtime.spawn(async move {
                for handle in handles.iter().rev() {
                    if let Err(e) = client.delete(&handle.target).await {
                        warn!(resource = %handle.target, error = %e, "best-effort cleanup failed");
                    }
                }
            });
        }
    }
}

/// Owns the live handles of one scenario
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone)]
pub struct ResourceLifecycle {
    client: Arc<dyn ClusterClient>,
    ledger: Arc<Mutex<Ledger>>,
    namespace_wait: Option<PollSettings>,
}

impl ResourceLifecycle {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                handles: Vec::new(),
                client: client.clone(),
            })),
            client,
            namespace_wait: None,
        }
    }

    /// Poll released namespaces until they are gone
    pub fn with_namespace_wait(mut self, settings: PollSettings) -> Self {
        self.namespace_wait = Some(settings);
        self
    }

    pub fn client(&self) -> Arc<dyn ClusterClient> {
        self.client.clone()
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create the object and track it for release
    pub async fn acquire(&self, descriptor: ResourceDescriptor) -> Result<ResourceHandle> {
        let resource = descriptor.display_name();
        let created = self
            .client
            .create(descriptor.kind, &descriptor.object)
            .await
            .map_err(|source| {
                error!(%resource, error = %source, "resource creation rejected");
                Error::ResourceCreation {
                    resource: resource.clone(),
                    source,
                }
            })?;

        let handle = ResourceHandle {
            target: ResourceRef::from_object(descriptor.kind, &created)?,
            policy: descriptor.policy,
            uid: created.metadata.uid.clone(),
        };
        info!(
            kind = %handle.target.kind,
            name = %handle.target.name,
            namespace = handle.target.namespace.as_deref().unwrap_or(""),
            "created resource"
        );
        self.ledger().handles.push(handle.clone());
        Ok(handle)
    }

    /// [`acquire`](Self::acquire) for a typed object with the default policy
    pub async fn acquire_typed<K>(&self, kind: ResourceKind, object: &K) -> Result<ResourceHandle>
    where
        K: Resource + Serialize,
    {
        self.acquire(ResourceDescriptor::new(kind, object)?).await
    }

    /// Handles currently held, in acquisition order
    pub fn handles(&self) -> Vec<ResourceHandle> {
        self.ledger().handles.clone()
    }

    /// Stop tracking everything without deleting; returns what was left behind
    pub fn abandon(&self) -> Vec<ResourceRef> {
        let handles = std::mem::take(&mut self.ledger().handles);
        let kept: Vec<ResourceRef> = handles.into_iter().map(|h| h.target).collect();
        for target in &kept {
            info!(resource = %target, "keeping resource (cleanup disabled)");
        }
        kept
    }

    /// Release every tracked handle; later calls find nothing left to release
    pub async fn release_all(&self) -> TeardownReport {
        let handles = std::mem::take(&mut self.ledger().handles);
        let mut report = TeardownReport::default();
        if handles.is_empty() {
            return report;
        }
        debug!(count = handles.len(), "releasing resources");

        let tracked_namespaces: HashSet<String> = handles
            .iter()
            .filter(|h| h.target.kind == ResourceKind::Namespace)
            .map(|h| h.target.name.clone())
            .collect();
        let (namespaces, others): (Vec<_>, Vec<_>) = handles
            .into_iter()
            .partition(|h| h.target.kind == ResourceKind::Namespace);

        for handle in others.into_iter().rev() {
            let cascades = handle.policy == ReleasePolicy::Cascade
                && handle
                    .target
                    .namespace
                    .as_ref()
                    .is_some_and(|ns| tracked_namespaces.contains(ns));
            if cascades {
                debug!(resource = %handle.target, "left to namespace deletion");
                report.cascaded.push(handle.target);
                continue;
            }
            self.release_one(handle, &mut report).await;
        }

        let mut deleted_namespaces = Vec::new();
        for handle in namespaces.into_iter().rev() {
            if self.release_one(handle.clone(), &mut report).await {
                deleted_namespaces.push(handle.target);
            }
        }

        if let Some(settings) = self.namespace_wait {
            for target in deleted_namespaces {
                self.await_absence(&target, settings, &mut report).await;
            }
        }

        report
    }

    /// Returns true when the delete call removed the object
    async fn release_one(&self, handle: ResourceHandle, report: &mut TeardownReport) -> bool {
        match self.client.delete(&handle.target).await {
            Ok(DeleteOutcome::Deleted) => {
                info!(
                    kind = %handle.target.kind,
                    name = %handle.target.name,
                    namespace = handle.target.namespace.as_deref().unwrap_or(""),
                    "deleted resource"
                );
                report.released.push(handle.target.clone());
                if let ReleasePolicy::ExplicitThenAwaitAbsence(settings) = handle.policy {
                    self.await_absence(&handle.target, settings, report).await;
                }
                true
            }
            Ok(DeleteOutcome::NotFound) => {
                warn!(resource = %handle.target, "resource already gone at teardown");
                report.warnings.push(TeardownWarning {
                    target: handle.target,
                    message: "not found".to_string(),
                });
                false
            }
            Err(e) => {
                error!(resource = %handle.target, error = %e, "failed to delete resource");
                report.failures.push(TeardownFailure {
                    target: Some(handle.target),
                    message: e.to_string(),
                });
                false
            }
        }
    }

    async fn await_absence(
        &self,
        target: &ResourceRef,
        settings: PollSettings,
        report: &mut TeardownReport,
    ) {
        let spec = ConditionSpec::new(
            format!("{} to be gone", target),
            settings,
            fetch_optional::<DynamicObject>(self.client.clone(), target.clone()),
            absent(),
        );
        let stage = format!("teardown {}", target);
        let result = await_condition(&stage, &spec).await;
        if !result.is_passed() {
            warn!(resource = %target, elapsed_ms = result.elapsed.as_millis() as u64, "resource still present after teardown wait");
            report.warnings.push(TeardownWarning {
                target: target.clone(),
                message: format!("still present after {}s", result.elapsed.as_secs()),
            });
        }
    }
}

/// Run `body` with `lifecycle`, then release everything it acquired
///
/// Release happens on success, on error and on panic; a panic is resumed
/// after teardown.
pub async fn scoped<F, Fut, T>(lifecycle: &ResourceLifecycle, body: F) -> (Result<T>, TeardownReport)
where
    F: FnOnce(ResourceLifecycle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let outcome = AssertUnwindSafe(body(lifecycle.clone()))
        .catch_unwind()
        .await;
    let report = lifecycle.release_all().await;
    match outcome {
        Ok(result) => (result, report),
        Err(panic) => {
            error!(released = report.released.len(), "scenario panicked, resources released");
            std::panic::resume_unwind(panic)
        }
    }
}
