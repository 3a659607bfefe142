//! Wire types published to (and read from) the cluster.
//!
//! Field casing follows what the scheduler-side consumers already parse:
//! PascalCase JSON for the device ConfigMap payloads, lowercase YAML for
//! the reset handshake.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};

/// One link entry inside [`DeviceInfo`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct P2PLinkInfo {
    pub type_name: String,
    pub type_index: u32,
}

/// Per-device topology summary published to the device-info ConfigMap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "UUID")]
    pub uuid: String,
    #[serde(rename = "Links")]
    pub links: HashMap<String, Vec<P2PLinkInfo>>,
}

/// Payload of the `DeviceInfoCfg` ConfigMap field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeviceInfo {
    #[serde(rename = "DeviceInfo")]
    pub device_info: HashMap<String, DeviceInfo>,
    #[serde(rename = "UpdateTime")]
    pub update_time: i64,
}

/// Payload of the `DeviceListCfg` ConfigMap field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDeviceList {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<String>,
    #[serde(rename = "UpdateTime")]
    pub update_time: i64,
}

/// The reset handshake object, stored as YAML in the per-node reset
/// ConfigMap. `occupy` is a bag of `agent name -> in use`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuResetInfo {
    #[serde(rename = "nodename")]
    pub node_name: String,
    pub reset: bool,
    pub occupy: HashMap<String, bool>,
}

/// Devices held by one pod, as reported by the pod-resources API.
#[derive(Debug, Clone)]
pub struct PodDevice {
    pub resource_name: String,
    pub device_ids: Vec<String>,
}

/// A pod joined with both views of its allocation: what the kubelet
/// picked and what was really assigned.
#[derive(Debug, Clone)]
pub struct PodDeviceInfo {
    pub pod: Pod,
    pub klt_device: Vec<String>,
    pub real_device: Vec<String>,
}

/// Seconds since the unix epoch, for the `UpdateTime` stamps.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_list_json_shape() {
        let list = NodeDeviceList {
            device_list: vec!["GPU-1".to_string(), "GPU-2::0".to_string()],
            update_time: 1700000000,
        };
        let json = serde_json::to_value(&list).unwrap();
        assert_eq!(json["DeviceList"][1], "GPU-2::0");
        assert_eq!(json["UpdateTime"], 1700000000);
    }

    #[test]
    fn device_info_json_shape() {
        let mut links = HashMap::new();
        links.insert(
            "GPU-2".to_string(),
            vec![P2PLinkInfo {
                type_name: "P2PLinkSameBoard".to_string(),
                type_index: 6,
            }],
        );
        let info = DeviceInfo {
            name: "MR-V100".to_string(),
            uuid: "GPU-1".to_string(),
            links,
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["UUID"], "GPU-1");
        assert_eq!(json["Links"]["GPU-2"][0]["TypeName"], "P2PLinkSameBoard");
        assert_eq!(json["Links"]["GPU-2"][0]["TypeIndex"], 6);
    }

    #[test]
    fn reset_info_yaml_round_trip() {
        let mut occupy = HashMap::new();
        occupy.insert("ix-device-plugin".to_string(), true);
        occupy.insert("other-agent".to_string(), false);
        let info = GpuResetInfo {
            node_name: "worker-1".to_string(),
            reset: true,
            occupy,
        };
        let yaml = serde_yaml::to_string(&info).unwrap();
        assert!(yaml.contains("nodename: worker-1"));
        let parsed: GpuResetInfo = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed, info);
    }
}
