//! Notebook that executes the Ray Tune HPO notebook with papermill

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EnvVar, PodSpec, ResourceRequirements,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use minijinja::Environment;
use serde::Serialize;

use crate::crds::notebook::{Notebook, NotebookSpec, NotebookTemplateSpec};
use crate::error::{Error, Result};

pub const NOTEBOOK_NAME: &str = "jupyter-nb-hpo";
const NOTEBOOKS_DIR: &str = "/opt/app-root/notebooks";
const TOKEN_VAR: &str = "NOTEBOOK_USER_TOKEN";
const API_URL_VAR: &str = "OPENSHIFT_API_URL";

// credentials reach papermill through the environment, never through shell text
const NOTEBOOK_COMMAND: &str = "pip install papermill && \
papermill {{ notebooks_dir }}/{{ notebook_file }} {{ notebooks_dir }}/out-{{ notebook_file }} \
-p namespace {{ namespace }} \
-p openshift_api_url \"${{ api_url_var }}\" \
-p kubernetes_user_bearer_token \"${{ token_var }}\" \
-p num_gpus {{ gpus }} \
--log-output && sleep infinity";

/// Everything needed to run one notebook
#[derive(Debug, Clone, Serialize)]
pub struct NotebookRequest {
    pub namespace: String,
    pub image: String,
    pub config_map: String,
    /// Key of the notebook inside the config map
    pub notebook_file: String,
    pub api_url: String,
    #[serde(skip)]
    pub token: String,
    pub gpus: u32,
}

#[derive(Serialize)]
struct CommandContext<'a> {
    notebooks_dir: &'a str,
    notebook_file: &'a str,
    namespace: &'a str,
    api_url_var: &'a str,
    token_var: &'a str,
    gpus: u32,
}

pub fn build_notebook(request: &NotebookRequest) -> Result<Notebook> {
    let context = CommandContext {
        notebooks_dir: NOTEBOOKS_DIR,
        notebook_file: &request.notebook_file,
        namespace: &request.namespace,
        api_url_var: API_URL_VAR,
        token_var: TOKEN_VAR,
        gpus: request.gpus,
    };
    let mut env = Environment::new();
    env.add_template("notebook", NOTEBOOK_COMMAND)
        .map_err(|e| Error::content(format!("notebook command template: {}", e)))?;
    let command = env
        .get_template("notebook")
        .and_then(|t| t.render(&context))
        .map_err(|e| Error::content(format!("notebook command template: {}", e)))?;

    let mut resources = BTreeMap::from([
        ("cpu".to_string(), Quantity("2".to_string())),
        ("memory".to_string(), Quantity("3Gi".to_string())),
    ]);
    if request.gpus > 0 {
        resources.insert(
            "nvidia.com/gpu".to_string(),
            Quantity(request.gpus.to_string()),
        );
    }

    let container = Container {
        name: NOTEBOOK_NAME.to_string(),
        image: Some(request.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(vec!["/bin/sh".to_string(), "-c".to_string(), command]),
        env: Some(vec![
            EnvVar {
                name: "JUPYTER_NOTEBOOK_PORT".to_string(),
                value: Some("8888".to_string()),
                ..Default::default()
            },
            EnvVar {
                name: API_URL_VAR.to_string(),
                value: Some(request.api_url.clone()),
                ..Default::default()
            },
            EnvVar {
                name: TOKEN_VAR.to_string(),
                value: Some(request.token.clone()),
                ..Default::default()
            },
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("notebook-port".to_string()),
            container_port: 8888,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        volume_mounts: Some(vec![VolumeMount {
            name: request.config_map.clone(),
            mount_path: NOTEBOOKS_DIR.to_string(),
            ..Default::default()
        }]),
        resources: Some(ResourceRequirements {
            requests: Some(resources.clone()),
            limits: Some(resources),
            ..Default::default()
        }),
        ..Default::default()
    };

    let mut notebook = Notebook::new(
        NOTEBOOK_NAME,
        NotebookSpec {
            template: NotebookTemplateSpec {
                spec: PodSpec {
                    containers: vec![container],
                    volumes: Some(vec![Volume {
                        name: request.config_map.clone(),
                        config_map: Some(ConfigMapVolumeSource {
                            name: request.config_map.clone(),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                },
            },
        },
    );
    notebook.metadata = ObjectMeta {
        name: Some(NOTEBOOK_NAME.to_string()),
        namespace: Some(request.namespace.clone()),
        annotations: Some(BTreeMap::from([(
            "notebooks.opendatahub.io/inject-oauth".to_string(),
            "true".to_string(),
        )])),
        labels: Some(BTreeMap::from([(
            "app".to_string(),
            NOTEBOOK_NAME.to_string(),
        )])),
        ..Default::default()
    };
    Ok(notebook)
}
