//! Kubeflow Notebook (kubeflow.org/v1)

use k8s_openapi::api::core::v1::PodSpec;
use kube::CustomResource;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize)]
#[kube(
    group = "kubeflow.org",
    version = "v1",
    kind = "Notebook",
    plural = "notebooks",
    status = "NotebookStatus",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct NotebookSpec {
    pub template: NotebookTemplateSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct NotebookTemplateSpec {
    pub spec: PodSpec,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotebookStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready_replicas: Option<i32>,
}
