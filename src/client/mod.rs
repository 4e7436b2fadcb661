//! Cluster resource client.
//!
//! The harness talks to the cluster through [`ClusterClient`], a narrow
//! create/get/list/delete surface over [`DynamicObject`]s. [`KubeCluster`]
//! is the production implementation backed by `kube`; [`memory::InMemoryCluster`]
//! stands in for a cluster in tests.

pub mod memory;

use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod};
use k8s_openapi::api::rbac::v1::RoleBinding;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::crds::kueue::{ClusterQueue, KueueWorkload, LocalQueue, ResourceFlavor};
use crate::crds::notebook::Notebook;
use crate::crds::pytorchjob::PyTorchJob;
use crate::crds::ray::RayCluster;
use crate::error::{Error, Result};

/// Resource kinds the harness creates or observes
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum ResourceKind {
    Namespace,
    ConfigMap,
    RoleBinding,
    Pod,
    ResourceFlavor,
    ClusterQueue,
    LocalQueue,
    KueueWorkload,
    PyTorchJob,
    Notebook,
    RayCluster,
}

impl ResourceKind {
    pub fn api_resource(&self) -> ApiResource {
        match self {
            Self::Namespace => ApiResource::erase::<Namespace>(&()),
            Self::ConfigMap => ApiResource::erase::<ConfigMap>(&()),
            Self::RoleBinding => ApiResource::erase::<RoleBinding>(&()),
            Self::Pod => ApiResource::erase::<Pod>(&()),
            Self::ResourceFlavor => ApiResource::erase::<ResourceFlavor>(&()),
            Self::ClusterQueue => ApiResource::erase::<ClusterQueue>(&()),
            Self::LocalQueue => ApiResource::erase::<LocalQueue>(&()),
            Self::KueueWorkload => ApiResource::erase::<KueueWorkload>(&()),
            Self::PyTorchJob => ApiResource::erase::<PyTorchJob>(&()),
            Self::Notebook => ApiResource::erase::<Notebook>(&()),
            Self::RayCluster => ApiResource::erase::<RayCluster>(&()),
        }
    }

    /// Cluster-scoped kinds survive namespace deletion and need explicit release
    pub fn is_namespaced(&self) -> bool {
        !matches!(
            self,
            Self::Namespace | Self::ResourceFlavor | Self::ClusterQueue
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::KueueWorkload => "Workload",
            _ => return write!(f, "{:?}", self),
        };
        write!(f, "{}", name)
    }
}

/// Identity of one object in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: ResourceKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl ResourceRef {
    pub fn new(kind: ResourceKind, namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace
                .filter(|_| kind.is_namespaced())
                .map(str::to_string),
            name: name.into(),
        }
    }

    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new(ResourceKind::Namespace, None, name)
    }

    /// Build a reference from a created object's metadata
    pub fn from_object(kind: ResourceKind, object: &DynamicObject) -> Result<Self> {
        let name = object.metadata.name.clone().ok_or_else(|| {
            Error::serialization(format!("{} returned by the cluster has no name", kind))
        })?;
        Ok(Self::new(kind, object.metadata.namespace.as_deref(), name))
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Errors surfaced by a [`ClusterClient`]
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ClientError {
    #[error("not found")]
    NotFound,

    #[error("already exists: {0}")]
    Conflict(String),

    /// The API server refused the request (quota, admission, validation, ...)
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// Network or transport failure; usually worth retrying
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<kube::Error> for ClientError {
    fn from(e: kube::Error) -> Self {
        match e {
            kube::Error::Api(ae) if ae.code == 404 => Self::NotFound,
            kube::Error::Api(ae) if ae.code == 409 => Self::Conflict(ae.message.clone()),
            kube::Error::Api(ae) => Self::Rejected {
                code: ae.code,
                message: ae.message.clone(),
            },
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Outcome of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// Trait abstracting cluster CRUD for the harness
///
/// Implementations must be safe to share between concurrently running
/// scenarios.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create an object; the returned object carries server-assigned fields
    /// such as a name generated from `generateName`.
    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError>;

    /// Get an object, `None` when it does not exist
    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>, ClientError>;

    /// List objects of a kind, optionally within a namespace and label selector
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError>;

    /// Delete an object, tolerating absence
    async fn delete(&self, target: &ResourceRef) -> Result<DeleteOutcome, ClientError>;
}

/// [`ClusterClient`] backed by a live Kubernetes API server
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(&self, kind: ResourceKind, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = kind.api_resource();
        match namespace {
            Some(ns) if kind.is_namespaced() => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create(
        &self,
        kind: ResourceKind,
        object: &DynamicObject,
    ) -> Result<DynamicObject, ClientError> {
        let api = self.api(kind, object.metadata.namespace.as_deref());
        debug!(%kind, "creating object");
        Ok(api.create(&PostParams::default(), object).await?)
    }

    async fn get(&self, target: &ResourceRef) -> Result<Option<DynamicObject>, ClientError> {
        let api = self.api(target.kind, target.namespace.as_deref());
        Ok(api.get_opt(&target.name).await?)
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<DynamicObject>, ClientError> {
        let api = self.api(kind, namespace);
        let mut lp = ListParams::default();
        if let Some(selector) = label_selector {
            lp = lp.labels(selector);
        }
        Ok(api.list(&lp).await?.items)
    }

    async fn delete(&self, target: &ResourceRef) -> Result<DeleteOutcome, ClientError> {
        let api = self.api(target.kind, target.namespace.as_deref());
        match api.delete(&target.name, &DeleteParams::background()).await {
            Ok(_) => Ok(DeleteOutcome::Deleted),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(DeleteOutcome::NotFound),
            Err(e) => Err(e.into()),
        }
    }
}

/// Convert a typed object into the dynamic form the client speaks
pub fn to_dynamic<K>(object: &K) -> Result<DynamicObject>
where
    K: Resource + Serialize,
{
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a dynamic object back into its typed form
pub fn from_dynamic<K>(object: &DynamicObject) -> Result<K>
where
    K: DeserializeOwned,
{
    let value = serde_json::to_value(object)?;
    Ok(serde_json::from_value(value)?)
}

/// Convert a list of dynamic objects, failing on the first malformed one
pub fn from_dynamic_list<K>(objects: &[DynamicObject]) -> Result<Vec<K>>
where
    K: DeserializeOwned,
{
    objects.iter().map(from_dynamic).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn test_cluster_scoped_refs_drop_namespace() {
        let r = ResourceRef::new(ResourceKind::ClusterQueue, Some("ns"), "cq");
        assert_eq!(r.namespace, None);
        assert_eq!(r.to_string(), "ClusterQueue cq");

        let r = ResourceRef::new(ResourceKind::KueueWorkload, Some("ns"), "wl");
        assert_eq!(r.to_string(), "Workload ns/wl");
    }

    #[test]
    fn test_dynamic_round_trip_keeps_type_meta() {
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some("kfto-test".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let dynamic = to_dynamic(&ns).unwrap();
        let types = dynamic.types.clone().unwrap();
        assert_eq!(types.kind, "Namespace");
        assert_eq!(types.api_version, "v1");

        let back: Namespace = from_dynamic(&dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("kfto-test"));
    }

    #[test]
    fn test_api_resources_for_crds() {
        let ar = ResourceKind::PyTorchJob.api_resource();
        assert_eq!(ar.group, "kubeflow.org");
        assert_eq!(ar.plural, "pytorchjobs");

        let ar = ResourceKind::KueueWorkload.api_resource();
        assert_eq!(ar.group, "kueue.x-k8s.io");
        assert_eq!(ar.kind, "Workload");
    }
}
