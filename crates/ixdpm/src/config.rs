//! Runtime configuration and the constants shared across the plugin.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Config schema version this build understands.
pub const VERSION: &str = "v1.0";

/// Extended resource name advertised to the kubelet.
pub const RESOURCE_NAME: &str = "iluvatar.com/gpu";

/// Prefix for all pod annotations written or read by the plugin.
pub const RESOURCE_PREFIX: &str = "iluvatar.com";

/// Directory the kubelet watches for device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";

/// The kubelet's own registration socket.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Name of this plugin's socket inside [`DEVICE_PLUGIN_PATH`].
pub const PLUGIN_SOCKET_NAME: &str = "iluvatar-gpu.sock";

/// Device node prefix: chips appear as `/dev/ix<minor>` on the host.
pub const DEVICE_NAME: &str = "ix";

pub const HOST_PATH_PREFIX: &str = "/dev/";
pub const CONTAINER_PATH_PREFIX: &str = "/dev/";

/// Default location of the plugin configuration file.
pub const CONFIG_FILE: &str = "/etc/ix-device-plugin/config.yaml";

/// Environment variable carrying the physical UUIDs of allocated devices.
pub const VISIBLE_DEVICES_ENV: &str = "IX_VISIBLE_DEVICES";

/// Environment variable carrying the replica IDs exactly as requested.
pub const REPLICA_DEVICES_ENV: &str = "IX_REPLICA_DEVICES";

/// Name this agent registers under in the reset-coordination occupy bag.
pub const DEVICE_PLUGIN_NAME: &str = "ix-device-plugin";

/// Pod annotation keys (all under [`RESOURCE_PREFIX`]).
pub const POD_PREDICATE_TIME: &str = "iluvatar.com/predicate-time";
pub const POD_VOLCANO_DEVICES: &str = "iluvatar.com/volcano-devices";
pub const POD_KLT_PRE_ALLOC: &str = "iluvatar.com/klt-pre-alloc";
pub const POD_REAL_ALLOC_DEVICES: &str = "iluvatar.com/real-alloc-devices";

/// Per-node ConfigMap naming and data keys.
pub const DEVICE_INFO_CM_PREFIX: &str = "iluvatar-device-info-";
pub const RESET_CM_PREFIX: &str = "iluvatar-reset-info-";
pub const DEVICE_INFO_CM_NAMESPACE: &str = "kube-system";
pub const DEVICE_INFO_CM_DATA_KEY: &str = "DeviceInfoCfg";
pub const DEVICE_LIST_CM_DATA_KEY: &str = "DeviceListCfg";
pub const RESET_CM_DATA_KEY: &str = "gpuReset";

/// Bounded retries for API patches, with [`PATCH_WAIT_TIME`] between tries.
pub const RETRY_UPDATE_COUNT: usize = 5;
pub const PATCH_WAIT_TIME: Duration = Duration::from_millis(100);

/// Poll cadence for ConfigMap create-or-update.
pub const UPDATE_INTERVAL: Duration = Duration::from_secs(1);
pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Attempts against the pod cache before falling back to the API server
/// when matching a volcano pod, one second apart.
pub const GET_POD_FROM_INFORMER_TIMES: usize = 5;

/// Maximum accepted length for values read from the kube downward API.
pub const KUBE_ENV_MAX_LENGTH: usize = 253;

/// Quiet window for coalescing hot-plug events into one rescan.
pub const HOTPLUG_DEBOUNCE_WINDOW: Duration = Duration::from_secs(5);

/// Cadence of the per-chip health sampling loop.
pub const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence of the device-list ConfigMap publication.
pub const DEVICE_LIST_UPDATE_INTERVAL: Duration = Duration::from_secs(5);

/// Blocking dial timeout for unix sockets.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// udev subsystem the hot-plug watch subscribes to.
pub const UDEV_SUBSYSTEM: &str = "pci";

/// Reset tool invoked to reset chips by index.
pub const RESET_COMMAND: &str = "/usr/local/corex/bin/ixsmi";

/// Errors produced while loading the configuration file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("error opening config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("error parsing config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("unknown config version: {0}")]
    UnknownVersion(String),
}

/// Boolean switches, settable from the CLI, the environment, or the config
/// file (`flags.board` only).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Flags {
    /// Expose every chip as its own device instead of assembling two-chip
    /// boards.
    #[serde(rename = "board", default)]
    pub split_board: bool,
    /// Enable the volcano scheduler integration.
    #[serde(skip)]
    pub use_volcano: bool,
    /// Coordinate a GPU reset with sibling plugins on every allocation.
    #[serde(skip)]
    pub reset_gpu: bool,
}

impl Flags {
    /// Applies the `SPLIT_BOARD`, `USE_VOLCANO` and `RESET_GPU` environment
    /// mirrors of the CLI flags. An env var only ever turns a flag on.
    pub fn update_from_env(&mut self) {
        self.split_board |= env_flag("SPLIT_BOARD");
        self.use_volcano |= env_flag("USE_VOLCANO");
        self.reset_gpu |= env_flag("RESET_GPU");
    }
}

fn env_flag(name: &str) -> bool {
    match std::env::var(name) {
        Ok(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"),
        Err(_) => false,
    }
}

/// Replication factor for one sharing strategy.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicatedResources {
    #[serde(default)]
    pub replicas: usize,
}

/// The set of sharing strategies that are supported.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sharing {
    /// Replicas made available through time slicing.
    #[serde(default)]
    pub time_slicing: ReplicatedResources,
    /// Replicas shared through MPS. Parsed for forward compatibility; the
    /// plugin currently only acts on time slicing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mps: Option<ReplicatedResources>,
}

/// Versioned configuration for the plugin.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub version: String,
    pub resource_name: String,
    pub flags: Flags,
    pub sharing: Sharing,
}

impl Config {
    /// Reads and validates the configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Config::parse(&contents)
    }

    fn parse(contents: &str) -> Result<Config, ConfigError> {
        let mut cfg: Config = serde_yaml::from_str(contents)?;

        if cfg.version.is_empty() {
            cfg.version = VERSION.to_string();
        }
        if cfg.version != VERSION {
            return Err(ConfigError::UnknownVersion(cfg.version));
        }
        if cfg.resource_name.is_empty() {
            cfg.resource_name = RESOURCE_NAME.to_string();
        }

        Ok(cfg)
    }

    /// The runtime-chosen time-slicing replication factor. Zero means no
    /// replication: devices are exposed one-to-one.
    pub fn replicas(&self) -> usize {
        self.sharing.time_slicing.replicas
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_config() {
        let cfg = Config::parse(
            "version: v1.0\n\
             resourceName: iluvatar.com/gpu\n\
             flags:\n\
             \x20 board: true\n\
             sharing:\n\
             \x20 timeSlicing:\n\
             \x20   replicas: 4\n",
        )
        .unwrap();
        assert_eq!(cfg.version, VERSION);
        assert_eq!(cfg.resource_name, RESOURCE_NAME);
        assert!(cfg.flags.split_board);
        assert_eq!(cfg.replicas(), 4);
        assert!(cfg.sharing.mps.is_none());
    }

    #[test]
    fn missing_version_defaults_to_compiled_in() {
        let cfg = Config::parse("resourceName: iluvatar.com/gpu\n").unwrap();
        assert_eq!(cfg.version, VERSION);
        assert_eq!(cfg.replicas(), 0);
    }

    #[test]
    fn unknown_version_is_rejected() {
        let err = Config::parse("version: v9.9\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownVersion(v) if v == "v9.9"));
    }

    #[test]
    fn env_flags_only_turn_on() {
        let mut flags = Flags {
            split_board: true,
            ..Default::default()
        };
        // No env vars set in the test environment for these names.
        flags.update_from_env();
        assert!(flags.split_board);
        assert!(!flags.use_volcano);
    }
}
