//! The device plugin service: the four RPCs the kubelet calls.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use tokio::sync::{broadcast, mpsc, RwLock};
use tonic::{Request, Response, Status};
use tracing::{debug, error, info, warn};

use crate::allocator::{prefix_uuids, AllocateArgs, Device, DeviceSet, Policy};
use crate::config::{
    CONTAINER_PATH_PREFIX, DEVICE_NAME, HOST_PATH_PREFIX, REPLICA_DEVICES_ENV, VISIBLE_DEVICES_ENV,
};
use crate::device_plugin_api::v1beta1::{
    device_plugin_server::DevicePlugin, AllocateRequest, AllocateResponse,
    ContainerAllocateResponse, ContainerPreferredAllocationResponse, DevicePluginOptions,
    DeviceSpec, Empty, ListAndWatchResponse, PreStartContainerRequest, PreStartContainerResponse,
    PreferredAllocationRequest, PreferredAllocationResponse,
};
use crate::dpm::health::DeviceEvent;
use crate::kube::reset::ResetClient;
use crate::kube::VolcanoContext;

/// Implementation of the device plugin protocol for CoreX GPUs.
///
/// Clones share the device set and the event channels, so tonic can hold
/// one instance per connection.
#[derive(Clone)]
pub struct IluvatarDevicePlugin {
    pub(crate) set: Arc<RwLock<DeviceSet>>,
    pub(crate) resource_name: String,
    /// Health/population changes; every ListAndWatch stream subscribes.
    pub(crate) device_events: broadcast::Sender<DeviceEvent>,
    /// Plugin-wide stop signal; ends streams and the health monitor.
    pub(crate) stop: broadcast::Sender<()>,
    pub(crate) volcano: Option<Arc<VolcanoContext>>,
    pub(crate) reset: Option<Arc<ResetClient>>,
}

impl IluvatarDevicePlugin {
    pub fn new(
        set: Arc<RwLock<DeviceSet>>,
        resource_name: impl Into<String>,
        device_events: broadcast::Sender<DeviceEvent>,
        stop: broadcast::Sender<()>,
        volcano: Option<Arc<VolcanoContext>>,
        reset: Option<Arc<ResetClient>>,
    ) -> IluvatarDevicePlugin {
        IluvatarDevicePlugin {
            set,
            resource_name: resource_name.into(),
            device_events,
            stop,
            volcano,
            reset,
        }
    }

    /// Selects the allocation policy for the current replication factor.
    async fn policy(&self) -> Policy {
        let set = self.set.read().await;
        if set.replicas > 0 {
            Policy::Replica {
                devices: set.build_replica_map(),
            }
        } else {
            Policy::BestEffort {
                links: set.link_ordinals(),
            }
        }
    }
}

#[tonic::async_trait]
impl DevicePlugin for IluvatarDevicePlugin {
    async fn get_device_plugin_options(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<DevicePluginOptions>, Status> {
        Ok(Response::new(DevicePluginOptions {
            pre_start_required: false,
            get_preferred_allocation_available: true,
        }))
    }

    type ListAndWatchStream =
        Pin<Box<dyn Stream<Item = Result<ListAndWatchResponse, Status>> + Send + Sync + 'static>>;

    async fn list_and_watch(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListAndWatchStream>, Status> {
        info!("start to list and watch GPU");
        let (tx, rx) = mpsc::channel(16);
        let set = self.set.clone();
        let mut events = self.device_events.subscribe();
        let mut stop = self.stop.subscribe();

        tokio::spawn(async move {
            let devices = set.read().await.cached_devices();
            if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                return;
            }
            loop {
                tokio::select! {
                    _ = stop.recv() => {
                        info!("stopping list and watch GPU");
                        return;
                    }
                    event = events.recv() => {
                        match event {
                            Ok(event) => debug!(?event, "resending device list"),
                            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                                warn!(skipped, "device event stream lagged, resending device list");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        }
                        let devices = set.read().await.cached_devices();
                        if tx.send(Ok(ListAndWatchResponse { devices })).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(Response::new(Box::pin(
            tokio_stream::wrappers::ReceiverStream::new(rx),
        )))
    }

    async fn get_preferred_allocation(
        &self,
        request: Request<PreferredAllocationRequest>,
    ) -> Result<Response<PreferredAllocationResponse>, Status> {
        let request = request.into_inner();
        let policy = self.policy().await;

        let container_responses = request
            .container_requests
            .into_iter()
            .map(|container| {
                let args = AllocateArgs {
                    available: container.available_device_i_ds,
                    required: container.must_include_device_i_ds,
                    size: container.allocation_size.max(0) as usize,
                };
                ContainerPreferredAllocationResponse {
                    device_i_ds: policy.allocate(&args),
                }
            })
            .collect();

        Ok(Response::new(PreferredAllocationResponse {
            container_responses,
        }))
    }

    async fn allocate(
        &self,
        request: Request<AllocateRequest>,
    ) -> Result<Response<AllocateResponse>, Status> {
        let request = request.into_inner();
        info!(?request, "allocate request");

        let mut container_responses = Vec::new();
        for container in request.container_requests {
            let mut ids = container.devices_i_ds;

            // With the volcano scheduler in play the kubelet-chosen IDs are
            // only placeholders; the scheduler's assignment wins.
            if let Some(volcano) = &self.volcano {
                match volcano.assigned_devices(&ids).await {
                    Ok(Some(assigned)) => {
                        info!(?assigned, "using volcano-assigned devices");
                        ids = assigned;
                    }
                    Ok(None) => {
                        warn!("no volcano pod matched the request, keeping kubelet-chosen devices")
                    }
                    Err(e) => {
                        warn!(error = %e, "volcano pod lookup failed, keeping kubelet-chosen devices")
                    }
                }
            }

            let mut response = ContainerAllocateResponse::default();
            let mut device_ids = Vec::new();
            let mut indexes = Vec::new();
            {
                let set = self.set.read().await;
                for id in &ids {
                    if !set.device_exists(id) {
                        return Err(Status::invalid_argument(format!(
                            "Invalid allocation request for '{}': unknown device: {}",
                            self.resource_name, id
                        )));
                    }
                }

                let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
                let full_node = set.replicas == 0
                    && requested.len() == set.devices.len()
                    && set.devices.keys().all(|uuid| requested.contains(uuid.as_str()));

                if full_node {
                    // The whole card set goes to one container; renumber the
                    // device nodes 0..N in host-minor order.
                    let mut devices: Vec<&Device> = set.devices.values().collect();
                    devices.sort_by(|a, b| a.uuid.cmp(&b.uuid));
                    let mut minors = Vec::new();
                    for dev in devices {
                        device_ids.extend(dev.chip_uuids());
                        indexes.push(dev.index);
                        minors.extend(dev.chip_minors());
                    }
                    minors.sort_unstable();
                    for (renumbered, minor) in minors.iter().enumerate() {
                        response.devices.push(DeviceSpec {
                            host_path: format!("{}{}{}", HOST_PATH_PREFIX, DEVICE_NAME, minor),
                            container_path: format!(
                                "{}{}{}",
                                CONTAINER_PATH_PREFIX, DEVICE_NAME, renumbered
                            ),
                            permissions: "rw".to_string(),
                        });
                    }
                } else {
                    // Several replicas may share a physical device; each
                    // device contributes its nodes once.
                    let (prefixes, _) = prefix_uuids(&ids);
                    for prefix in prefixes {
                        if let Some(dev) = set.devices.get(&prefix) {
                            response.devices.extend(dev.device_specs());
                            device_ids.extend(dev.chip_uuids());
                            indexes.push(dev.index);
                        }
                    }
                }
            }

            response
                .envs
                .insert(VISIBLE_DEVICES_ENV.to_string(), device_ids.join(","));
            response
                .envs
                .insert(REPLICA_DEVICES_ENV.to_string(), ids.join(","));

            if let Some(reset) = &self.reset {
                if let Err(e) = reset.reset_gpus(&indexes).await {
                    error!(error = %e, "GPU reset failed, allocation proceeds");
                }
            }

            container_responses.push(response);
        }

        let response = AllocateResponse {
            container_responses,
        };
        info!(?response, "allocate response");
        Ok(Response::new(response))
    }

    async fn pre_start_container(
        &self,
        _request: Request<PreStartContainerRequest>,
    ) -> Result<Response<PreStartContainerResponse>, Status> {
        info!("PreStartContainer");
        Ok(Response::new(PreStartContainerResponse {}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::{Chip, HealthState};
    use crate::config::RESOURCE_NAME;
    use crate::device_plugin_api::v1beta1::ContainerAllocateRequest;
    use ixml::ChipHandle;

    fn chip(uuid: &str, minor: u32) -> Chip {
        Chip {
            uuid: uuid.to_string(),
            name: "MR-V100".to_string(),
            minor,
            index: minor,
            numa_node: None,
            health: HealthState::Healthy,
            handle: ChipHandle::from_raw(minor as u64),
        }
    }

    fn plugin_with(devices: &[(&str, u32)], replicas: usize) -> IluvatarDevicePlugin {
        let mut set = DeviceSet::new(replicas);
        for (uuid, minor) in devices {
            let dev = Device::new(chip(uuid, *minor), replicas);
            set.devices.insert(dev.uuid.clone(), dev);
        }
        set.count = devices.len() as u32;

        let (device_events, _) = broadcast::channel(16);
        let (stop, _) = broadcast::channel(1);
        IluvatarDevicePlugin {
            set: Arc::new(RwLock::new(set)),
            resource_name: RESOURCE_NAME.to_string(),
            device_events,
            stop,
            volcano: None,
            reset: None,
        }
    }

    fn allocate_request(ids: &[&str]) -> Request<AllocateRequest> {
        Request::new(AllocateRequest {
            container_requests: vec![ContainerAllocateRequest {
                devices_i_ds: ids.iter().map(|s| s.to_string()).collect(),
            }],
        })
    }

    #[tokio::test]
    async fn partial_allocation_keeps_host_minors() {
        let plugin = plugin_with(&[("A", 0), ("B", 1)], 0);
        let response = plugin
            .allocate(allocate_request(&["B"]))
            .await
            .unwrap()
            .into_inner();

        let container = &response.container_responses[0];
        assert_eq!(container.devices.len(), 1);
        assert_eq!(container.devices[0].host_path, "/dev/ix1");
        assert_eq!(container.devices[0].container_path, "/dev/ix1");
        assert_eq!(container.devices[0].permissions, "rw");
        assert_eq!(container.envs[VISIBLE_DEVICES_ENV], "B");
        assert_eq!(container.envs[REPLICA_DEVICES_ENV], "B");
    }

    #[tokio::test]
    async fn full_node_allocation_renumbers_minors() {
        let plugin = plugin_with(&[("A", 3), ("B", 1)], 0);
        let response = plugin
            .allocate(allocate_request(&["A", "B"]))
            .await
            .unwrap()
            .into_inner();

        let devices = &response.container_responses[0].devices;
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].host_path, "/dev/ix1");
        assert_eq!(devices[0].container_path, "/dev/ix0");
        assert_eq!(devices[1].host_path, "/dev/ix3");
        assert_eq!(devices[1].container_path, "/dev/ix1");
    }

    #[tokio::test]
    async fn unknown_device_fails_the_allocation() {
        let plugin = plugin_with(&[("A", 0)], 0);
        let status = plugin
            .allocate(allocate_request(&["A", "Z"]))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
        assert!(status.message().contains("unknown device: Z"));
    }

    #[tokio::test]
    async fn replica_request_contributes_each_device_once() {
        let plugin = plugin_with(&[("A", 0)], 4);
        let response = plugin
            .allocate(allocate_request(&["A::0", "A::2"]))
            .await
            .unwrap()
            .into_inner();

        let container = &response.container_responses[0];
        // Two replicas of the same physical device: one device node.
        assert_eq!(container.devices.len(), 1);
        assert_eq!(container.devices[0].host_path, "/dev/ix0");
        assert_eq!(container.envs[VISIBLE_DEVICES_ENV], "A");
        assert_eq!(container.envs[REPLICA_DEVICES_ENV], "A::0,A::2");
    }

    #[tokio::test]
    async fn preferred_allocation_uses_the_replica_policy() {
        let plugin = plugin_with(&[("A", 0), ("B", 1)], 2);
        let request = Request::new(PreferredAllocationRequest {
            container_requests: vec![
                crate::device_plugin_api::v1beta1::ContainerPreferredAllocationRequest {
                    available_device_i_ds: vec![
                        "A::0".to_string(),
                        "A::1".to_string(),
                        "B::0".to_string(),
                        "B::1".to_string(),
                    ],
                    must_include_device_i_ds: vec!["A::0".to_string()],
                    allocation_size: 2,
                },
            ],
        });
        let response = plugin
            .get_preferred_allocation(request)
            .await
            .unwrap()
            .into_inner();

        let ids = &response.container_responses[0].device_i_ds;
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&"A::0".to_string()));
        // The extra comes from the unused device.
        assert!(ids.contains(&"B::0".to_string()));
    }

    #[tokio::test]
    async fn options_advertise_preferred_allocation() {
        let plugin = plugin_with(&[("A", 0)], 0);
        let options = plugin
            .get_device_plugin_options(Request::new(Empty {}))
            .await
            .unwrap()
            .into_inner();
        assert!(options.get_preferred_allocation_available);
        assert!(!options.pre_start_required);
    }
}
