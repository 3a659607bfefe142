//! Client for the kubelet's pod-resources API, used to learn which device
//! IDs the kubelet really handed to each pod.

use std::collections::HashMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use tonic::Request;
use tracing::warn;

use crate::config::RESOURCE_NAME;
use crate::grpc_sock;
use crate::kube::cache::annotation;
use crate::kube::types::{PodDevice, PodDeviceInfo};
use crate::pod_resources_api::v1alpha1::{
    pod_resources_lister_client::PodResourcesListerClient, ContainerResources,
    ListPodResourcesRequest, PodResources,
};

const POD_RESOURCES_SOCKET: &str = "/var/lib/kubelet/pod-resources/kubelet.sock";
const CALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Lists the devices of this plugin's resource held by each pod, keyed by
/// `namespace_name`. A fresh connection is made per call; the kubelet
/// closes idle pod-resources connections anyway.
pub async fn list_pod_resources() -> anyhow::Result<HashMap<String, PodDevice>> {
    let channel = tokio::time::timeout(
        CALL_TIMEOUT,
        grpc_sock::client::socket_channel(POD_RESOURCES_SOCKET),
    )
    .await
    .map_err(|_| anyhow::anyhow!("timed out dialing the pod resources socket"))??;
    let mut client = PodResourcesListerClient::new(channel);

    let response = tokio::time::timeout(
        CALL_TIMEOUT,
        client.list(Request::new(ListPodResourcesRequest {})),
    )
    .await
    .map_err(|_| anyhow::anyhow!("pod resources list timed out"))??
    .into_inner();

    let mut devices = HashMap::new();
    for pod in response.pod_resources {
        let (resource_name, pod_devices) = devices_from_pod(&pod);
        if resource_name.is_empty() || pod_devices.is_empty() {
            continue;
        }
        devices.insert(
            format!("{}_{}", pod.namespace, pod.name),
            PodDevice {
                resource_name,
                device_ids: pod_devices,
            },
        );
    }
    Ok(devices)
}

fn devices_from_pod(pod: &PodResources) -> (String, Vec<String>) {
    let mut device_ids = Vec::new();
    let mut resource_name = String::new();
    for container in &pod.containers {
        let (container_resource, container_devices) = devices_from_container(container);
        if container_resource.is_empty() {
            continue;
        }
        if resource_name.is_empty() {
            resource_name = container_resource;
        }
        device_ids.extend(container_devices);
    }
    (resource_name, device_ids)
}

fn devices_from_container(container: &ContainerResources) -> (String, Vec<String>) {
    let mut device_ids = Vec::new();
    for device in &container.devices {
        if device.resource_name != RESOURCE_NAME {
            continue;
        }
        device_ids.extend(device.device_ids.iter().cloned());
    }
    if device_ids.is_empty() {
        (String::new(), device_ids)
    } else {
        (RESOURCE_NAME.to_string(), device_ids)
    }
}

/// Joins active pods with the pod-resources view: the kubelet-chosen IDs,
/// and the really-allocated IDs (the volcano annotation when present,
/// otherwise the kubelet's).
pub async fn klt_and_real_allocate_dev(pods: Vec<Pod>) -> anyhow::Result<Vec<PodDeviceInfo>> {
    let pod_devices = list_pod_resources().await?;

    let mut infos = Vec::new();
    for pod in pods {
        let key = format!(
            "{}_{}",
            pod.metadata.namespace.as_deref().unwrap_or_default(),
            pod.metadata.name.as_deref().unwrap_or_default()
        );
        let resource = match pod_devices.get(&key) {
            Some(resource) => resource,
            None => continue,
        };

        let real_device = match annotation(&pod, crate::config::POD_VOLCANO_DEVICES) {
            Some(devices) => devices.split(',').map(str::to_string).collect(),
            None => resource.device_ids.clone(),
        };
        if real_device.is_empty() {
            warn!(pod = %key, "pod holds the resource but has no device ids");
        }

        infos.push(PodDeviceInfo {
            klt_device: resource.device_ids.clone(),
            real_device,
            pod,
        });
    }
    Ok(infos)
}
