//! Publication of device state to the per-node ConfigMap and pod
//! annotation reconciliation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Patch, PatchParams};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use crate::allocator::DeviceSet;
use crate::config::{
    DEVICE_INFO_CM_DATA_KEY, DEVICE_INFO_CM_NAMESPACE, DEVICE_LIST_CM_DATA_KEY,
    DEVICE_LIST_UPDATE_INTERVAL, PATCH_WAIT_TIME, POD_KLT_PRE_ALLOC, POD_REAL_ALLOC_DEVICES,
    RETRY_UPDATE_COUNT,
};
use crate::dpm::health::DeviceEvent;
use crate::kube::cache::{annotation, filter_pods, PodCache};
use crate::kube::pod_resources;
use crate::kube::types::{unix_now, DeviceInfo, NodeDeviceInfo, NodeDeviceList, P2PLinkInfo};
use crate::kube::KubeClient;

/// Publishes the free-device list under `DeviceListCfg` via strategic
/// merge patch, with bounded retries. A missing ConfigMap is not retried;
/// the event-driven device-info path creates it.
pub async fn write_device_list_to_cm(
    kube: &KubeClient,
    devices: Vec<String>,
) -> anyhow::Result<()> {
    let payload = serde_json::to_string(&NodeDeviceList {
        device_list: devices,
        update_time: unix_now(),
    })?;
    let patch = serde_json::json!({ "data": { DEVICE_LIST_CM_DATA_KEY: payload } });
    let api = kube.config_maps();

    for _ in 0..RETRY_UPDATE_COUNT {
        match api
            .patch(
                &kube.device_info_name,
                &PatchParams::default(),
                &Patch::Strategic(patch.clone()),
            )
            .await
        {
            Ok(_) => return Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                return Err(anyhow::anyhow!(
                    "config map {} not found",
                    kube.device_info_name
                ));
            }
            Err(e) => {
                warn!(error = %e, "patch of the device list failed, trying again");
                tokio::time::sleep(PATCH_WAIT_TIME).await;
            }
        }
    }
    Err(anyhow::anyhow!(
        "patch of the device list exceeded max number of retries"
    ))
}

/// Publishes both the device-info map and the device list, creating the
/// ConfigMap when it does not exist yet.
pub async fn write_device_info_to_cm(
    kube: &KubeClient,
    devices: Vec<String>,
    device_info: HashMap<String, DeviceInfo>,
    verbose: bool,
) -> anyhow::Result<()> {
    let update_time = unix_now();
    let info_payload = serde_json::to_string(&NodeDeviceInfo {
        device_info,
        update_time,
    })?;
    let list_payload = serde_json::to_string(&NodeDeviceList {
        device_list: devices,
        update_time,
    })?;

    let mut data = BTreeMap::new();
    data.insert(DEVICE_INFO_CM_DATA_KEY.to_string(), info_payload);
    data.insert(DEVICE_LIST_CM_DATA_KEY.to_string(), list_payload);
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(kube.device_info_name.clone()),
            namespace: Some(DEVICE_INFO_CM_NAMESPACE.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    };

    if verbose {
        info!(
            config_map = %kube.device_info_name,
            namespace = DEVICE_INFO_CM_NAMESPACE,
            "writing device info"
        );
    }
    kube.create_or_update_config_map(cm).await
}

/// The published topology map: every device with its link matrix in
/// symbolic form.
pub fn device_info_map(set: &DeviceSet) -> HashMap<String, DeviceInfo> {
    set.devices
        .values()
        .map(|dev| {
            let links = dev
                .links
                .iter()
                .map(|(peer, links)| {
                    let entries = links
                        .iter()
                        .map(|link| P2PLinkInfo {
                            type_name: link.link_type.as_str().to_string(),
                            type_index: link.link_type.ordinal(),
                        })
                        .collect();
                    (peer.clone(), entries)
                })
                .collect();
            (
                dev.uuid.clone(),
                DeviceInfo {
                    name: dev.name.clone(),
                    uuid: dev.uuid.clone(),
                    links,
                },
            )
        })
        .collect()
}

/// Replica IDs consumed by active pods, folded from their real-alloc
/// annotations.
pub async fn allocated_devices_from_cache(cache: &PodCache) -> HashSet<String> {
    let mut allocated = HashSet::new();
    for pod in cache.active_pods().await {
        if let Some(devices) = annotation(&pod, POD_REAL_ALLOC_DEVICES) {
            for id in devices.split(',').filter(|id| !id.is_empty()) {
                allocated.insert(id.to_string());
            }
        }
    }
    allocated
}

/// Healthy exposed IDs not currently held by any active pod.
pub async fn free_device_list(set: &Arc<RwLock<DeviceSet>>, cache: &PodCache) -> Vec<String> {
    let allocated = allocated_devices_from_cache(cache).await;
    let set = set.read().await;
    let mut free: Vec<String> = set
        .devices
        .values()
        .flat_map(|dev| dev.exposed.iter())
        .filter(|replica| replica.health.is_healthy() && !allocated.contains(&replica.id))
        .map(|replica| replica.id.clone())
        .collect();
    free.sort();
    free
}

/// Patches a pod's annotations in the API server and mirrors them into
/// the cache.
pub async fn try_update_pod_cache_annotation(
    kube: &KubeClient,
    cache: &PodCache,
    pod: &Pod,
    annotations: BTreeMap<String, String>,
) -> anyhow::Result<()> {
    kube.try_update_pod_annotation(pod, &annotations).await?;
    if !cache.update_annotations(pod, &annotations).await {
        warn!(
            pod = %pod.metadata.name.as_deref().unwrap_or_default(),
            "no pod found in cache when updating annotations"
        );
    }
    Ok(())
}

/// Writes the kubelet-chosen and really-allocated device lists onto pods
/// that the pod-resources API reports but that are not annotated yet.
pub async fn reconcile_pod_annotations(kube: &KubeClient, cache: &PodCache) -> anyhow::Result<()> {
    let pods = filter_pods(cache.active_pods().await, |_| true);
    let infos = pod_resources::klt_and_real_allocate_dev(pods).await?;
    for info in infos {
        if annotation(&info.pod, POD_REAL_ALLOC_DEVICES).is_some() {
            continue;
        }
        let mut annotations = BTreeMap::new();
        annotations.insert(POD_KLT_PRE_ALLOC.to_string(), info.klt_device.join(","));
        annotations.insert(POD_REAL_ALLOC_DEVICES.to_string(), info.real_device.join(","));
        if let Err(e) = try_update_pod_cache_annotation(kube, cache, &info.pod, annotations).await {
            warn!(
                error = %e,
                pod = %info.pod.metadata.name.as_deref().unwrap_or_default(),
                "failed to annotate pod with its allocation"
            );
        }
    }
    Ok(())
}

/// The long-running publication task: the device list (and, with volcano
/// enabled, pod annotations) on a fixed tick, the full device info on
/// every device change event.
pub async fn run_device_info_updater(
    kube: Arc<KubeClient>,
    cache: PodCache,
    set: Arc<RwLock<DeviceSet>>,
    mut events: broadcast::Receiver<DeviceEvent>,
    mut stop: broadcast::Receiver<()>,
    volcano: bool,
) {
    // Publish the initial state before settling into the tick.
    publish_device_info(&kube, &cache, &set, true).await;

    let start = tokio::time::Instant::now() + DEVICE_LIST_UPDATE_INTERVAL;
    let mut ticker = tokio::time::interval_at(start, DEVICE_LIST_UPDATE_INTERVAL);
    loop {
        tokio::select! {
            _ = stop.recv() => {
                info!("stopping device info updater");
                return;
            }
            _ = ticker.tick() => {
                let devices = free_device_list(&set, &cache).await;
                if let Err(e) = write_device_list_to_cm(&kube, devices).await {
                    warn!(error = %e, "failed to publish the device list");
                }
                if volcano {
                    if let Err(e) = reconcile_pod_annotations(&kube, &cache).await {
                        warn!(error = %e, "pod annotation reconciliation failed");
                    }
                }
            }
            event = events.recv() => {
                match event {
                    Ok(event) => debug!(?event, "publishing device info"),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "device event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
                publish_device_info(&kube, &cache, &set, false).await;
            }
        }
    }
}

async fn publish_device_info(
    kube: &KubeClient,
    cache: &PodCache,
    set: &Arc<RwLock<DeviceSet>>,
    verbose: bool,
) {
    let devices = free_device_list(set, cache).await;
    let info = {
        let set = set.read().await;
        device_info_map(&set)
    };
    if let Err(e) = write_device_info_to_cm(kube, devices, info, verbose).await {
        warn!(error = %e, "failed to publish device info");
    }
}
