//! Builders for the objects a scenario submits
//!
//! Builders are pure: they take validated inputs and return typed objects.
//! Anything that could be malformed is rejected earlier, when the inputs are
//! constructed.

pub mod kueue;
pub mod notebook;
pub mod pytorch;

use std::collections::BTreeMap;

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace};
use k8s_openapi::api::rbac::v1::{RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

/// Label put on every namespace the harness creates
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY_VALUE: &str = "kfto-e2e";

pub fn namespace(name: &str) -> Namespace {
    Namespace {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(BTreeMap::from([(
                MANAGED_BY_LABEL.to_string(),
                MANAGED_BY_VALUE.to_string(),
            )])),
            ..Default::default()
        },
        ..Default::default()
    }
}

/// Config map holding mounted files; non UTF-8 content goes to `binaryData`
pub fn config_map(namespace: &str, name: &str, files: &BTreeMap<String, Vec<u8>>) -> ConfigMap {
    let mut data = BTreeMap::new();
    let mut binary_data = BTreeMap::new();
    for (key, content) in files {
        match std::str::from_utf8(content) {
            Ok(text) => {
                data.insert(key.clone(), text.to_string());
            }
            Err(_) => {
                binary_data.insert(key.clone(), ByteString(content.clone()));
            }
        }
    }

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: (!data.is_empty()).then_some(data),
        binary_data: (!binary_data.is_empty()).then_some(binary_data),
        ..Default::default()
    }
}

/// Bind a cluster role to a user within one namespace
pub fn user_role_binding(
    namespace: &str,
    name: &str,
    user: &str,
    cluster_role: &str,
) -> RoleBinding {
    RoleBinding {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: cluster_role.to_string(),
        },
        subjects: Some(vec![Subject {
            api_group: Some("rbac.authorization.k8s.io".to_string()),
            kind: "User".to_string(),
            name: user.to_string(),
            ..Default::default()
        }]),
    }
}
