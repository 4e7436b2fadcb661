//! GPU utilisation samples for training pods
//!
//! Samples come from the DCGM exporter's `DCGM_FI_DEV_GPU_UTIL` series,
//! queried through the API server's service proxy to the cluster's thanos
//! querier.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::client::ClientError;
use crate::conditions::{all_of, boxed, contains_element, have_len};
use crate::error::{Error, Result};
use crate::poller::Verdict;

pub const GPU_UTIL_METRIC: &str = "DCGM_FI_DEV_GPU_UTIL";

/// Utilisation of one GPU attached to a pod, in percent
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSample {
    pub gpu: String,
    pub value: f64,
}

#[async_trait]
pub trait UtilizationSource: Send + Sync {
    /// Latest sample of every GPU the pod uses
    async fn gpu_utilization(&self, namespace: &str, pod: &str) -> Result<Vec<GpuSample>>;
}

/// Prometheus HTTP API reached through the kube API server
pub struct PrometheusUtilization {
    client: kube::Client,
    namespace: String,
    service: String,
}

impl PrometheusUtilization {
    pub fn new(client: kube::Client, namespace: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            service: service.into(),
        }
    }

    /// The OpenShift monitoring stack's thanos querier
    pub fn openshift(client: kube::Client) -> Self {
        Self::new(client, "openshift-monitoring", "https:thanos-querier:9091")
    }

    fn query_path(&self, query: &str) -> String {
        format!(
            "/api/v1/namespaces/{}/services/{}/proxy/api/v1/query?query={}",
            self.namespace,
            self.service,
            encode_query(query)
        )
    }
}

#[async_trait]
impl UtilizationSource for PrometheusUtilization {
    async fn gpu_utilization(&self, namespace: &str, pod: &str) -> Result<Vec<GpuSample>> {
        let query = pod_query(namespace, pod);
        let path = self.query_path(&query);
        debug!(%query, "querying GPU utilisation");

        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| Error::TransientFetch(format!("invalid metrics request: {}", e)))?;
        let body = self
            .client
            .request_text(request)
            .await
            .map_err(ClientError::from)?;
        parse_response(&body)
    }
}

fn pod_query(namespace: &str, pod: &str) -> String {
    format!(
        "{}{{exported_namespace=\"{}\",exported_pod=\"{}\"}}",
        GPU_UTIL_METRIC, namespace, pod
    )
}

// unreserved characters pass through, everything else is %XX
fn encode_query(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() * 3);
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<VectorSample>,
}

#[derive(Deserialize)]
struct VectorSample {
    #[serde(default)]
    metric: BTreeMap<String, String>,
    value: (f64, String),
}

fn parse_response(body: &str) -> Result<Vec<GpuSample>> {
    let response: QueryResponse = serde_json::from_str(body)
        .map_err(|e| Error::TransientFetch(format!("unreadable metrics response: {}", e)))?;
    if response.status != "success" {
        return Err(Error::TransientFetch(format!(
            "metrics query failed: {}",
            response.error.unwrap_or(response.status)
        )));
    }

    response
        .data
        .map(|d| d.result)
        .unwrap_or_default()
        .into_iter()
        .map(|sample| {
            let value = sample.value.1.parse::<f64>().map_err(|_| {
                Error::TransientFetch(format!("non-numeric sample '{}'", sample.value.1))
            })?;
            let gpu = sample
                .metric
                .get("gpu")
                .or_else(|| sample.metric.get("UUID"))
                .cloned()
                .unwrap_or_default();
            Ok(GpuSample { gpu, value })
        })
        .collect()
}

/// One sample per GPU and at least one GPU busier than `threshold` percent
pub fn utilized(gpus: usize, threshold: f64) -> impl Fn(&Vec<GpuSample>) -> Verdict + Send + Sync {
    all_of(vec![
        boxed(have_len::<GpuSample>(gpus)),
        boxed(contains_element(
            format!("above {}% utilisation", threshold),
            move |s: &GpuSample| s.value > threshold,
        )),
    ])
}

pub fn fetch_utilization(
    source: Arc<dyn UtilizationSource>,
    namespace: String,
    pod: String,
) -> impl Fn() -> BoxFuture<'static, Result<Vec<GpuSample>>> + Send + Sync + 'static {
    move || -> BoxFuture<'static, Result<Vec<GpuSample>>> {
        let source = source.clone();
        let namespace = namespace.clone();
        let pod = pod.clone();
        Box::pin(async move { source.gpu_utilization(&namespace, &pod).await })
    }
}
