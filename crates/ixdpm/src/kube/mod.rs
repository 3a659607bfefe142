//! Cluster collaborators: the API client wrapper, the node-local pod
//! cache, per-node ConfigMap publication, the pod-resources client, and
//! the GPU reset coordinator.

pub mod cache;
pub mod ops;
pub mod pod_resources;
pub mod reset;
pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use lazy_static::lazy_static;
use regex::Regex;
use tracing::{info, warn};

use crate::config::{
    DEVICE_INFO_CM_NAMESPACE, DEVICE_INFO_CM_PREFIX, KUBE_ENV_MAX_LENGTH, PATCH_WAIT_TIME,
    POD_PREDICATE_TIME, POD_VOLCANO_DEVICES, RETRY_UPDATE_COUNT, UPDATE_INTERVAL, UPDATE_TIMEOUT,
};

pub use cache::PodCache;

/// Errors from the kube client setup and environment validation.
#[derive(Debug, thiserror::Error)]
pub enum KubeError {
    #[error("the env variable NODE_NAME must be set")]
    MissingNodeName,
    #[error("invalid node name: {0}")]
    InvalidNodeName(String),
    #[error(transparent)]
    Kube(#[from] kube::Error),
}

lazy_static! {
    static ref NODE_NAME_PATTERN: Regex =
        Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("static pattern compiles");
}

/// API client plus the node-scoped names derived from `NODE_NAME`.
pub struct KubeClient {
    pub client: Client,
    pub node_name: String,
    /// Name of this node's device-info ConfigMap.
    pub device_info_name: String,
}

impl KubeClient {
    /// Builds a client from the pod's service account (or a local
    /// kubeconfig) and the validated `NODE_NAME` environment variable.
    pub async fn try_new() -> Result<KubeClient, KubeError> {
        let client = Client::try_default().await?;
        let node_name = node_name_from_env()?;
        Ok(KubeClient::with_client(client, node_name))
    }

    /// Wraps an existing client; used by tests with a mock service.
    pub fn with_client(client: Client, node_name: impl Into<String>) -> KubeClient {
        let node_name = node_name.into();
        KubeClient {
            client,
            device_info_name: format!("{}{}", DEVICE_INFO_CM_PREFIX, node_name),
            node_name,
        }
    }

    /// ConfigMaps in the namespace the plugin publishes to.
    pub fn config_maps(&self) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), DEVICE_INFO_CM_NAMESPACE)
    }

    pub fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Creates the ConfigMap or patches its data in, polling until it goes
    /// through or [`UPDATE_TIMEOUT`] elapses.
    pub async fn create_or_update_config_map(&self, cm: ConfigMap) -> anyhow::Result<()> {
        let name = cm
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("config map has no name"))?;
        let namespace = cm
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| DEVICE_INFO_CM_NAMESPACE.to_string());
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &namespace);

        let deadline = Instant::now() + UPDATE_TIMEOUT;
        loop {
            let result = match api.get(&name).await {
                Ok(_) => {
                    let patch = serde_json::json!({ "data": cm.data.clone() });
                    api.patch(&name, &PatchParams::default(), &Patch::Strategic(patch))
                        .await
                        .map(|_| ())
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    api.create(&PostParams::default(), &cm).await.map(|_| ())
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(anyhow::anyhow!(
                        "create or update of config map {}/{} timed out: {}",
                        namespace,
                        name,
                        e
                    ));
                }
                Err(e) => {
                    warn!(error = %e, config_map = %name, "config map write failed, retrying");
                    tokio::time::sleep(UPDATE_INTERVAL).await;
                }
            }
        }
    }

    /// Strategic-merge-patches a pod's annotations, with bounded retries
    /// on transient errors. A missing pod is not retried.
    pub async fn try_update_pod_annotation(
        &self,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> anyhow::Result<()> {
        let name = pod
            .metadata
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("pod has no name"))?;
        let namespace = pod
            .metadata
            .namespace
            .clone()
            .unwrap_or_else(|| "default".to_string());
        let api = self.pods(&namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": annotations } });

        for _ in 0..RETRY_UPDATE_COUNT {
            match api
                .patch(&name, &PatchParams::default(), &Patch::Strategic(patch.clone()))
                .await
            {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(anyhow::anyhow!("pod {}/{} not found", namespace, name));
                }
                Err(e) => {
                    warn!(error = %e, pod = %name, "patch pod annotation failed, trying again");
                    tokio::time::sleep(PATCH_WAIT_TIME).await;
                }
            }
        }
        Err(anyhow::anyhow!(
            "patch pod annotation failed, exceeded max number of retries"
        ))
    }
}

fn node_name_from_env() -> Result<String, KubeError> {
    let node_name = std::env::var("NODE_NAME").map_err(|_| KubeError::MissingNodeName)?;
    validate_node_name(&node_name)?;
    Ok(node_name)
}

pub(crate) fn validate_node_name(name: &str) -> Result<(), KubeError> {
    if name.is_empty() {
        return Err(KubeError::MissingNodeName);
    }
    if name.len() > KUBE_ENV_MAX_LENGTH || !NODE_NAME_PATTERN.is_match(name) {
        return Err(KubeError::InvalidNodeName(name.to_string()));
    }
    Ok(())
}

/// Volcano scheduler integration: replaces the kubelet-chosen device IDs
/// in an allocation with the scheduler's assignment, read from the
/// matched pod's annotations.
pub struct VolcanoContext {
    kube: Arc<KubeClient>,
    cache: PodCache,
}

impl VolcanoContext {
    pub fn new(kube: Arc<KubeClient>, cache: PodCache) -> VolcanoContext {
        VolcanoContext { kube, cache }
    }

    /// Finds the pod this allocation belongs to and returns the
    /// volcano-assigned device IDs, marking the pod's predicate timestamp
    /// as consumed. `None` when no pod matches.
    pub async fn assigned_devices(
        &self,
        request: &[String],
    ) -> anyhow::Result<Option<Vec<String>>> {
        let pod = match self.kube.matched_pod(&self.cache, request).await? {
            Some(pod) => pod,
            None => return Ok(None),
        };

        let devices: Vec<String> = match cache::annotation(&pod, POD_VOLCANO_DEVICES) {
            Some(value) => value.split(',').map(str::to_string).collect(),
            None => return Ok(None),
        };

        info!(
            pod = %pod.metadata.name.as_deref().unwrap_or_default(),
            ?devices,
            "matched volcano pod"
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(POD_PREDICATE_TIME.to_string(), u64::MAX.to_string());
        if let Err(e) = ops::try_update_pod_cache_annotation(&self.kube, &self.cache, &pod, annotations).await
        {
            warn!(error = %e, "failed to mark the volcano predicate as consumed");
        }

        Ok(Some(devices))
    }
}
