//! Node-local pod cache fed by a watch on the API server.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::Client;
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::config::{GET_POD_FROM_INFORMER_TIMES, POD_PREDICATE_TIME, POD_VOLCANO_DEVICES};
use crate::kube::KubeClient;

/// In-memory view of the pods scheduled to this node, keyed by pod UID.
/// Writes come exclusively from the watch task.
#[derive(Clone, Default)]
pub struct PodCache {
    pods: Arc<RwLock<HashMap<String, Pod>>>,
}

impl PodCache {
    /// Follows the pod watch for this node until stopped, mirroring
    /// add/update/delete events into the cache.
    pub async fn run_informer(
        self,
        client: Client,
        node_name: String,
        mut stop: broadcast::Receiver<()>,
    ) {
        let pods: Api<Pod> = Api::all(client);
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        let mut stream = watcher(pods, params).boxed();

        info!(node = %node_name, "starting pod informer");
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("stopping pod informer");
                    return;
                }
                event = stream.try_next() => match event {
                    Ok(Some(Event::Applied(pod))) => self.insert(pod).await,
                    Ok(Some(Event::Deleted(pod))) => self.remove(&pod).await,
                    Ok(Some(Event::Restarted(pods))) => self.replace_all(pods).await,
                    Ok(None) => {
                        warn!("pod watch stream ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "pod watch error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    pub(crate) async fn insert(&self, pod: Pod) {
        if let Some(uid) = pod.metadata.uid.clone() {
            self.pods.write().await.insert(uid, pod);
        }
    }

    async fn remove(&self, pod: &Pod) {
        if let Some(uid) = &pod.metadata.uid {
            self.pods.write().await.remove(uid);
        }
    }

    async fn replace_all(&self, pods: Vec<Pod>) {
        let mut cache = self.pods.write().await;
        cache.clear();
        for pod in pods {
            if let Some(uid) = pod.metadata.uid.clone() {
                cache.insert(uid, pod);
            }
        }
    }

    /// Pods that are neither succeeded nor failed.
    pub async fn active_pods(&self) -> Vec<Pod> {
        self.pods
            .read()
            .await
            .values()
            .filter(|pod| is_active(pod))
            .cloned()
            .collect()
    }

    /// Mirrors an annotation patch into the cached copy of the pod.
    /// Returns false when the pod is not in the cache.
    pub async fn update_annotations(
        &self,
        pod: &Pod,
        annotations: &BTreeMap<String, String>,
    ) -> bool {
        let mut cache = self.pods.write().await;
        for cached in cache.values_mut() {
            if cached.metadata.namespace == pod.metadata.namespace
                && cached.metadata.name == pod.metadata.name
            {
                let target = cached.metadata.annotations.get_or_insert_with(BTreeMap::new);
                for (key, value) in annotations {
                    target.insert(key.clone(), value.clone());
                }
                return true;
            }
        }
        false
    }
}

fn is_active(pod: &Pod) -> bool {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or_default();
    phase != "Succeeded" && phase != "Failed"
}

/// Looks up one annotation on a pod.
pub fn annotation<'a>(pod: &'a Pod, key: &str) -> Option<&'a String> {
    pod.metadata.annotations.as_ref().and_then(|a| a.get(key))
}

/// Pods that admission already gave up on are never allocation candidates.
pub fn should_skip_pod(pod: &Pod) -> bool {
    if pod.metadata.deletion_timestamp.is_some() {
        return true;
    }
    if let Some(status) = &pod.status {
        if status.reason.as_deref() == Some("UnexpectedAdmissionError") {
            return true;
        }
        for container in status.container_statuses.as_deref().unwrap_or_default() {
            if let Some(waiting) = container.state.as_ref().and_then(|s| s.waiting.as_ref()) {
                if waiting
                    .message
                    .as_deref()
                    .map(|m| m.contains("PreStartContainer check failed"))
                    .unwrap_or(false)
                {
                    return true;
                }
            }
        }
    }
    false
}

pub fn filter_pods(pods: Vec<Pod>, condition: impl Fn(&Pod) -> bool) -> Vec<Pod> {
    pods.into_iter()
        .filter(|pod| !should_skip_pod(pod) && condition(pod))
        .collect()
}

/// The volcano predicate timestamp; absent or unparsable reads as
/// `u64::MAX` so such pods sort last.
pub fn predicate_time(pod: &Pod) -> u64 {
    match annotation(pod, POD_PREDICATE_TIME) {
        Some(value) => value.parse().unwrap_or(u64::MAX),
        None => u64::MAX,
    }
}

/// Whether a pod's volcano annotations can satisfy this allocation: an
/// unconsumed predicate timestamp and an assignment of matching size.
pub fn annotation_allocate_valid(request_devices: &[String], pod: &Pod) -> bool {
    if let Some(predicate) = annotation(pod, POD_PREDICATE_TIME) {
        if predicate == &u64::MAX.to_string() {
            warn!(
                pod = %pod.metadata.name.as_deref().unwrap_or_default(),
                "pod already has its devices mounted"
            );
            return false;
        }
    }
    match annotation(pod, POD_VOLCANO_DEVICES) {
        Some(devices) => devices.split(',').count() == request_devices.len(),
        None => false,
    }
}

fn oldest_pod(pods: Vec<Pod>) -> Option<Pod> {
    pods.into_iter().min_by_key(predicate_time)
}

impl KubeClient {
    /// Active pods on this node straight from the API server, bypassing
    /// the cache.
    pub async fn active_pod_list(&self) -> anyhow::Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!(
            "spec.nodeName={},status.phase!=Succeeded,status.phase!=Failed",
            self.node_name
        ));
        Ok(api.list(&params).await?.items)
    }

    /// Finds the pod a volcano allocation belongs to: retries the cache a
    /// few times, then asks the API server directly, and picks the pod
    /// with the oldest predicate timestamp.
    pub async fn matched_pod(
        &self,
        cache: &PodCache,
        request_devices: &[String],
    ) -> anyhow::Result<Option<Pod>> {
        for attempt in 0..GET_POD_FROM_INFORMER_TIMES {
            let pods = if attempt == GET_POD_FROM_INFORMER_TIMES - 1 {
                self.active_pod_list().await?
            } else {
                cache.active_pods().await
            };
            let matching =
                filter_pods(pods, |pod| annotation_allocate_valid(request_devices, pod));
            if !matching.is_empty() {
                return Ok(oldest_pod(matching));
            }
            warn!(
                attempt,
                ?request_devices,
                "no pod passed the volcano filter, retrying"
            );
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, annotations: serde_json::Value) -> Pod {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "uid": format!("uid-{}", name),
                "annotations": annotations,
            },
            "status": { "phase": "Running" }
        }))
        .unwrap()
    }

    #[test]
    fn predicate_time_defaults_to_max() {
        let no_annotation = pod("a", serde_json::json!({}));
        assert_eq!(predicate_time(&no_annotation), u64::MAX);

        let with_time = pod("b", serde_json::json!({ POD_PREDICATE_TIME: "42" }));
        assert_eq!(predicate_time(&with_time), 42);

        let garbage = pod("c", serde_json::json!({ POD_PREDICATE_TIME: "not-a-number" }));
        assert_eq!(predicate_time(&garbage), u64::MAX);
    }

    #[test]
    fn allocation_validity_checks_size_and_consumption() {
        let request: Vec<String> = vec!["A".into(), "B".into()];

        let good = pod(
            "good",
            serde_json::json!({
                POD_PREDICATE_TIME: "10",
                POD_VOLCANO_DEVICES: "X,Y",
            }),
        );
        assert!(annotation_allocate_valid(&request, &good));

        let wrong_size = pod(
            "wrong-size",
            serde_json::json!({
                POD_PREDICATE_TIME: "10",
                POD_VOLCANO_DEVICES: "X",
            }),
        );
        assert!(!annotation_allocate_valid(&request, &wrong_size));

        let consumed = pod(
            "consumed",
            serde_json::json!({
                POD_PREDICATE_TIME: u64::MAX.to_string(),
                POD_VOLCANO_DEVICES: "X,Y",
            }),
        );
        assert!(!annotation_allocate_valid(&request, &consumed));

        let no_volcano = pod("no-volcano", serde_json::json!({ POD_PREDICATE_TIME: "10" }));
        assert!(!annotation_allocate_valid(&request, &no_volcano));
    }

    #[test]
    fn skips_terminating_and_rejected_pods() {
        let mut terminating = pod("terminating", serde_json::json!({}));
        terminating.metadata.deletion_timestamp =
            Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                chrono_free_now(),
            ));
        assert!(should_skip_pod(&terminating));

        let rejected: Pod = serde_json::from_value(serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": "rejected", "uid": "uid-rejected" },
            "status": { "phase": "Pending", "reason": "UnexpectedAdmissionError" }
        }))
        .unwrap();
        assert!(should_skip_pod(&rejected));

        let healthy = pod("healthy", serde_json::json!({}));
        assert!(!should_skip_pod(&healthy));
    }

    #[test]
    fn oldest_pod_wins() {
        let pods = vec![
            pod("late", serde_json::json!({ POD_PREDICATE_TIME: "30" })),
            pod("early", serde_json::json!({ POD_PREDICATE_TIME: "10" })),
            pod("unstamped", serde_json::json!({})),
        ];
        let oldest = oldest_pod(pods).unwrap();
        assert_eq!(oldest.metadata.name.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn cache_tracks_annotations() {
        let cache = PodCache::default();
        let target = pod("target", serde_json::json!({}));
        cache.insert(target.clone()).await;

        let mut annotations = BTreeMap::new();
        annotations.insert("k".to_string(), "v".to_string());
        assert!(cache.update_annotations(&target, &annotations).await);

        let cached = cache.active_pods().await;
        assert_eq!(
            annotation(&cached[0], "k").map(String::as_str),
            Some("v")
        );

        let stranger = pod("stranger", serde_json::json!({}));
        assert!(!cache.update_annotations(&stranger, &annotations).await);
    }

    fn chrono_free_now() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
        k8s_openapi::chrono::Utc::now()
    }
}
