//! In-memory [`ClusterClient`] with scripted status progression
//!
//! Reactions registered per kind fire when an object of that kind is
//! created and schedule [`Effect`]s at a delay. Effects are applied lazily
//! whenever the cluster is touched, against `tokio::time::Instant`, so tests
//! running with paused time see deterministic progress.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use serde_json::Value;
use tokio::time::Instant;
use tracing::trace;

use super::{ClientError, ClusterClient, DeleteOutcome, ResourceKind, ResourceRef};

/// A delayed change to cluster state
#[derive(Debug, Clone)]
pub enum Effect {
    /// Replace the status of the object that triggered the reaction
    SetStatus(Value),
    /// Create another object; namespaced kinds default to the trigger's namespace
    Create(ResourceKind, DynamicObject),
    /// Delete the object that triggered the reaction
    DeleteSelf,
    /// Delete an arbitrary object
    Delete(ResourceRef),
}

type Reaction = Arc<dyn Fn(&DynamicObject) -> Vec<(Duration, Effect)> + Send + Sync>;

struct Scheduled {
    due: Instant,
    subject: ResourceRef,
    effect: Effect,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, DynamicObject>,
    scheduled: Vec<Scheduled>,
    reactions: HashMap<ResourceKind, Vec<Reaction>>,
    generated: u64,
    failing_reads: u32,
    rejected_kinds: HashMap<ResourceKind, String>,
    undeletable: HashSet<ResourceKind>,
    created: Vec<ResourceRef>,
    deleted: Vec<ResourceRef>,
}

/// Cluster stand-in shared between a test and the code under test
#[derive(Clone, Default)]
pub struct InMemoryCluster {
    state: Arc<Mutex<State>>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // a panicking test thread must not wedge the remaining assertions
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn settled(&self) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.settle(Instant::now());
        state
    }

    /// Register a reaction fired for every created object of `kind`
    pub fn on_create<F>(&self, kind: ResourceKind, reaction: F)
    where
        F: Fn(&DynamicObject) -> Vec<(Duration, Effect)> + Send + Sync + 'static,
    {
        self.lock()
            .reactions
            .entry(kind)
            .or_default()
            .push(Arc::new(reaction));
    }

    /// Make the next `n` get/list calls fail with a transport error
    pub fn fail_next_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    /// Reject every create of `kind` with a 403
    pub fn reject_creates(&self, kind: ResourceKind, message: impl Into<String>) {
        self.lock().rejected_kinds.insert(kind, message.into());
    }

    /// Make deletes of `kind` fail with a 500
    pub fn fail_deletes(&self, kind: ResourceKind) {
        self.lock().undeletable.insert(kind);
    }

    /// Replace the status of an existing object immediately
    pub fn set_status(&self, target: &ResourceRef, status: Value) -> bool {
        let mut state = self.settled();
        match state.objects.get_mut(target) {
            Some(obj) => {
                set_status(obj, status);
                true
            }
            None => false,
        }
    }

    /// Every object ever created, in creation order
    pub fn created(&self) -> Vec<ResourceRef> {
        self.lock().created.clone()
    }

    /// Every successful delete call, in call order
    pub fn deleted(&self) -> Vec<ResourceRef> {
        self.lock().deleted.clone()
    }

    /// Objects currently present
    pub fn remaining(&self) -> Vec<ResourceRef> {
        self.settled().objects.keys().cloned().collect()
    }

    pub fn exists(&self, target: &ResourceRef) -> bool {
        self.settled().objects.contains_key(target)
    }
}

impl State {
    fn settle(&mut self, now: Instant) {
        loop {
            let next = self
                .scheduled
                .iter()
                .enumerate()
                .filter(|(_, s)| s.due <= now)
                .min_by_key(|(_, s)| s.due)
                .map(|(i, _)| i);
            let Some(index) = next else { break };
            let scheduled = self.scheduled.remove(index);
            self.apply(scheduled);
        }
    }

    fn apply(&mut self, scheduled: Scheduled) {
        let Scheduled {
            due,
            subject,
            effect,
        } = scheduled;
        trace!(%subject, ?effect, "applying scripted effect");
        match effect {
            Effect::SetStatus(status) => {
                if let Some(obj) = self.objects.get_mut(&subject) {
                    set_status(obj, status);
                }
            }
            Effect::Create(kind, mut obj) => {
                if kind.is_namespaced() && obj.metadata.namespace.is_none() {
                    obj.metadata.namespace = subject.namespace.clone();
                }
                // scripted creates that collide are simply dropped
                let _ = self.insert(kind, obj, due);
            }
            Effect::DeleteSelf => self.remove(&subject),
            Effect::Delete(target) => self.remove(&target),
        }
    }

    fn insert(
        &mut self,
        kind: ResourceKind,
        mut obj: DynamicObject,
        at: Instant,
    ) -> Result<DynamicObject, ClientError> {
        if let Some(message) = self.rejected_kinds.get(&kind) {
            return Err(ClientError::Rejected {
                code: 403,
                message: message.clone(),
            });
        }

        if obj.metadata.name.is_none() {
            let prefix = obj.metadata.generate_name.clone().ok_or_else(|| {
                ClientError::Rejected {
                    code: 422,
                    message: "name or generateName is required".to_string(),
                }
            })?;
            self.generated += 1;
            obj.metadata.name = Some(format!("{}{:05}", prefix, self.generated));
        }
        if !kind.is_namespaced() {
            obj.metadata.namespace = None;
        }
        if obj.types.is_none() {
            let ar = kind.api_resource();
            obj.types = Some(TypeMeta {
                api_version: ar.api_version,
                kind: ar.kind,
            });
        }

        let name = obj.metadata.name.clone().unwrap_or_default();
        let target = ResourceRef::new(kind, obj.metadata.namespace.as_deref(), name);

        if kind.is_namespaced() {
            let ns = target.namespace.clone().ok_or_else(|| ClientError::Rejected {
                code: 422,
                message: format!("{} requires a namespace", kind),
            })?;
            if !self.objects.contains_key(&ResourceRef::namespace(ns.clone())) {
                return Err(ClientError::Rejected {
                    code: 404,
                    message: format!("namespaces \"{}\" not found", ns),
                });
            }
        }
        if self.objects.contains_key(&target) {
            return Err(ClientError::Conflict(target.to_string()));
        }

        obj.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        self.objects.insert(target.clone(), obj.clone());
        self.created.push(target.clone());

        let reactions = self.reactions.get(&kind).cloned().unwrap_or_default();
        for reaction in reactions {
            for (delay, effect) in reaction(&obj) {
                self.scheduled.push(Scheduled {
                    due: at + delay,
                    subject: target.clone(),
                    effect,
                });
            }
        }

        Ok(obj)
    }

    fn remove(&mut self, target: &ResourceRef) {
        if self.objects.remove(target).is_none() {
            return;
        }
        if target.kind == ResourceKind::Namespace {
            let ns = Some(target.name.clone());
            self.objects.retain(|r, _| r.namespace != ns);
        }
    }

    fn take_read_failure(&mut self) -> Result<(), ClientError> {
        if self.failing_reads > 0 {
            self.failing_reads -= 1;
            return Err(ClientError::Transport(
                "connection reset by peer".to_string(),
            ));
        }
        Ok(())
    }
}

fn set_status(obj: &mut DynamicObject, status: Value) {
    if !obj.data.is_object() {
        obj.data = Value::Object(Default::default());
    }
    if let Some(map) = obj.data.as_object_mut() {
        map.insert("status".to_string(), status);
    }
}

fn matches_selector(obj: &DynamicObject, selector: &str) -> bool {
    let labels = obj.metadata.labels.clone().unwrap_or_default();
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((key, value)) => labels.get(key.trim()).map(String::as_str) == Some(value.trim()),
            None => labels.contains_key(term),
        })
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let now = Instant::now();
        let mut state = self.lock();
        state.settle(now);
        state.insert(kind, object.clone(), now)
    }

    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>, ClientError> {
        let mut state = self.settled();
        state.take_read_failure()?;
        Ok(state.objects.get(target).cloned())
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let mut state = self.settled();
        state.take_read_failure()?;
        Ok(state
            .objects
            .iter()
            .filter(|(r, _)| r.kind == kind)
            .filter(|(r, _)| namespace.is_none() || r.namespace.as_deref() == namespace)
            .filter(|(_, obj)| label_selector.is_none_or(|s| matches_selector(obj, s)))
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn delete(&self, target: &ResourceRef) -> Result<DeleteOutcome, ClientError> {
        let mut state = self.settled();
        if state.undeletable.contains(&target.kind) {
            return Err(ClientError::Rejected {
                code: 500,
                message: format!("deletion of {} is failing", target),
            });
        }
        if !state.objects.contains_key(target) {
            return Ok(DeleteOutcome::NotFound);
        }
        state.remove(target);
        state.deleted.push(target.clone());
        Ok(DeleteOutcome::Deleted)
    }
}

/// Build a bare object of `kind`, handy for seeding and scripted creates
pub fn object(kind: ResourceKind, namespace: Option<&str>, name: &str) -> DynamicObject {
    let obj = DynamicObject::new(name, &kind.api_resource());
    match namespace {
        Some(ns) if kind.is_namespaced() => obj.within(ns),
        _ => obj,
    }
}
