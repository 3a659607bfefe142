//! Coordination of disruptive GPU resets with sibling plugins.
//!
//! All accelerator agents on a node share one ConfigMap holding a
//! [`GpuResetInfo`]. To reset, this plugin flags `reset: true` and drops
//! its own occupy entry, waits until every other agent has dropped
//! theirs, runs the reset tool, then reclaims its entry and waits for the
//! peers to do the same. The waits poll without a hard timeout: a stuck
//! peer is an operator problem, racing it with a reset would be worse.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use ixml::Library;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{ListParams, Patch, PatchParams};
use kube_runtime::watcher;
use kube_runtime::watcher::Event;
use tokio::process::Command;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::{
    DEVICE_INFO_CM_NAMESPACE, DEVICE_PLUGIN_NAME, PATCH_WAIT_TIME, RESET_CM_DATA_KEY,
    RESET_CM_PREFIX, RESET_COMMAND, RETRY_UPDATE_COUNT,
};
use crate::kube::types::GpuResetInfo;
use crate::kube::KubeClient;

const QUIESCE_POLL: Duration = Duration::from_secs(5);
const RECOVER_POLL: Duration = Duration::from_secs(1);
const CONFLICT_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// The node-wide reset handshake client.
pub struct ResetClient {
    kube: Arc<KubeClient>,
    lib: Arc<dyn Library>,
    cm_name: String,
    /// Local snapshot of the handshake object. Peer entries are merged in
    /// by the informer; our own entry is only ever written locally.
    reset_info: RwLock<GpuResetInfo>,
    /// Serializes reset procedures within this agent.
    reset_lock: Mutex<()>,
}

impl ResetClient {
    pub fn new(kube: Arc<KubeClient>, lib: Arc<dyn Library>) -> ResetClient {
        let mut occupy = HashMap::new();
        occupy.insert(DEVICE_PLUGIN_NAME.to_string(), true);
        ResetClient {
            cm_name: format!("{}{}", RESET_CM_PREFIX, kube.node_name),
            reset_info: RwLock::new(GpuResetInfo {
                node_name: kube.node_name.clone(),
                reset: false,
                occupy,
            }),
            kube,
            lib,
            reset_lock: Mutex::new(()),
        }
    }

    /// Follows the reset ConfigMap and merges peer occupy entries into
    /// the local snapshot.
    pub async fn run_informer(self: Arc<Self>, mut stop: broadcast::Receiver<()>) {
        let api = self.kube.config_maps();
        let params = ListParams::default().fields(&format!("metadata.name={}", self.cm_name));
        let mut stream = watcher(api, params).boxed();

        info!(config_map = %self.cm_name, "starting reset config map informer");
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("stopping reset config map informer");
                    return;
                }
                event = stream.try_next() => match event {
                    Ok(Some(Event::Applied(cm))) => self.apply_remote(&cm).await,
                    Ok(Some(Event::Restarted(cms))) => {
                        for cm in cms {
                            self.apply_remote(&cm).await;
                        }
                    }
                    Ok(Some(Event::Deleted(_))) => {
                        info!(config_map = %self.cm_name, "reset config map deleted");
                    }
                    Ok(None) => {
                        warn!("reset config map watch ended");
                        return;
                    }
                    Err(e) => {
                        warn!(error = %e, "reset config map watch error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    /// Merges a remote copy into the snapshot, never letting remote data
    /// overwrite this agent's own occupy entry.
    pub(crate) async fn apply_remote(&self, cm: &ConfigMap) {
        let parsed = match parse_reset_info(cm) {
            Some(parsed) => parsed,
            None => {
                warn!(config_map = %self.cm_name, "reset config map has no parsable payload");
                return;
            }
        };
        let mut info = self.reset_info.write().await;
        for (agent, in_use) in parsed.occupy {
            if agent == DEVICE_PLUGIN_NAME {
                continue;
            }
            info.occupy.insert(agent, in_use);
        }
        debug!(info = ?*info, "updated reset info from config map");
    }

    /// Publishes the initial handshake object, registering this agent in
    /// the occupy bag.
    pub async fn create_reset_info(&self) {
        let snapshot = self.snapshot().await;
        let payload = match serde_yaml::to_string(&snapshot) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to marshal the reset info");
                return;
            }
        };

        let mut data = std::collections::BTreeMap::new();
        data.insert(RESET_CM_DATA_KEY.to_string(), payload);
        let cm = ConfigMap {
            metadata: ObjectMeta {
                name: Some(self.cm_name.clone()),
                namespace: Some(DEVICE_INFO_CM_NAMESPACE.to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        info!(config_map = %self.cm_name, info = ?snapshot, "writing gpu reset info");
        if let Err(e) = self.kube.create_or_update_config_map(cm).await {
            error!(error = %e, "failed to create the reset info config map");
        }
    }

    pub(crate) async fn snapshot(&self) -> GpuResetInfo {
        self.reset_info.read().await.clone()
    }

    /// Patches the handshake payload, pinning the observed
    /// resourceVersion so concurrent peer updates surface as conflicts,
    /// which are retried with exponential backoff.
    async fn update_reset_cm(&self, payload: String) -> anyhow::Result<()> {
        let api = self.kube.config_maps();
        let mut backoff = PATCH_WAIT_TIME;
        for _ in 0..RETRY_UPDATE_COUNT {
            let current = match api.get(&self.cm_name).await {
                Ok(cm) => cm,
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(anyhow::anyhow!("config map {} not found", self.cm_name));
                }
                Err(e) => {
                    warn!(error = %e, "failed to fetch the reset config map");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            };
            let resource_version = current.metadata.resource_version.unwrap_or_default();
            let patch = serde_json::json!({
                "metadata": { "resourceVersion": resource_version },
                "data": { RESET_CM_DATA_KEY: payload.as_str() },
            });

            match api
                .patch(&self.cm_name, &PatchParams::default(), &Patch::Strategic(patch))
                .await
            {
                Ok(_) => {
                    info!(config_map = %self.cm_name, "patched reset info");
                    return Ok(());
                }
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    info!(config_map = %self.cm_name, "patch conflict, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(CONFLICT_BACKOFF_CAP);
                }
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    return Err(anyhow::anyhow!("config map {} not found", self.cm_name));
                }
                Err(e) => {
                    warn!(error = %e, "patch of the reset config map failed, trying again");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        Err(anyhow::anyhow!(
            "patch of config map {} exceeded retries",
            self.cm_name
        ))
    }

    async fn publish(&self) -> anyhow::Result<()> {
        let payload = serde_yaml::to_string(&self.snapshot().await)?;
        self.update_reset_cm(payload).await
    }

    async fn prepare_for_reset(&self) -> anyhow::Result<()> {
        info!("preparing for GPU reset");
        {
            let mut info = self.reset_info.write().await;
            info.reset = true;
            info.occupy.insert(DEVICE_PLUGIN_NAME.to_string(), false);
        }
        self.publish().await
    }

    /// Polls until every agent (ourselves included, already false) has
    /// dropped its occupy entry.
    async fn wait_for_quiesce(&self) {
        loop {
            let holdouts: Vec<String> = self
                .snapshot()
                .await
                .occupy
                .iter()
                .filter(|(_, in_use)| **in_use)
                .map(|(agent, _)| agent.clone())
                .collect();
            if holdouts.is_empty() {
                return;
            }
            info!(?holdouts, "waiting for sibling plugins to quiesce");
            tokio::time::sleep(QUIESCE_POLL).await;
        }
    }

    async fn done_for_reset(&self) -> anyhow::Result<()> {
        {
            let mut info = self.reset_info.write().await;
            info.reset = false;
            info.occupy.insert(DEVICE_PLUGIN_NAME.to_string(), true);
        }
        self.publish().await?;

        loop {
            let still_down: Vec<String> = self
                .snapshot()
                .await
                .occupy
                .iter()
                .filter(|(_, in_use)| !**in_use)
                .map(|(agent, _)| agent.clone())
                .collect();
            if still_down.is_empty() {
                break;
            }
            info!(?still_down, "waiting for sibling plugins to recover");
            tokio::time::sleep(RECOVER_POLL).await;
        }
        info!("GPU reset handshake complete");
        Ok(())
    }

    /// The full reset procedure for a set of chip indexes. The command's
    /// exit status is logged but does not fail the procedure; failing to
    /// bring IXML back up does.
    pub async fn reset_gpus(&self, indexes: &[u32]) -> anyhow::Result<()> {
        let _guard = self.reset_lock.lock().await;
        info!(?indexes, "starting GPU reset");

        info!(
            "shutdown of IXML for GPU reset returned: {:?}",
            self.lib.shutdown()
        );

        self.prepare_for_reset().await?;
        self.wait_for_quiesce().await;

        let joined = indexes
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        match Command::new(RESET_COMMAND)
            .arg("-r")
            .arg("-i")
            .arg(&joined)
            .output()
            .await
        {
            Ok(output) => {
                info!(
                    stdout = %String::from_utf8_lossy(&output.stdout),
                    "reset command output"
                );
                if !output.status.success() {
                    error!(status = ?output.status.code(), "reset command exited nonzero");
                }
            }
            Err(e) => error!(error = %e, command = RESET_COMMAND, "failed to run the reset command"),
        }

        self.done_for_reset().await?;

        info!("loading IXML after reset");
        self.lib
            .init()
            .map_err(|e| anyhow::anyhow!("failed to re-initialize IXML after reset: {}", e))?;
        Ok(())
    }
}

fn parse_reset_info(cm: &ConfigMap) -> Option<GpuResetInfo> {
    let payload = cm.data.as_ref()?.get(RESET_CM_DATA_KEY)?;
    serde_yaml::from_str(payload).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockLibrary;

    fn reset_client() -> ResetClient {
        let client =
            kube::Client::try_from(kube::Config::new("http://127.0.0.1:8080".parse().unwrap()))
                .unwrap();
        let kube = Arc::new(KubeClient::with_client(client, "test-node"));
        ResetClient::new(kube, Arc::new(MockLibrary::new(Vec::new())))
    }

    fn cm_with_payload(payload: &str) -> ConfigMap {
        let mut data = std::collections::BTreeMap::new();
        data.insert(RESET_CM_DATA_KEY.to_string(), payload.to_string());
        ConfigMap {
            data: Some(data),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn remote_updates_never_overwrite_our_own_entry() {
        let client = reset_client();
        let payload = "nodename: test-node\nreset: true\noccupy:\n  ix-device-plugin: false\n  sibling-agent: false\n";
        client.apply_remote(&cm_with_payload(payload)).await;

        let snapshot = client.snapshot().await;
        // Our entry keeps its locally-written value.
        assert_eq!(snapshot.occupy[DEVICE_PLUGIN_NAME], true);
        // The peer's state is merged in.
        assert_eq!(snapshot.occupy["sibling-agent"], false);
        // The local reset flag is not driven by remote data either.
        assert!(!snapshot.reset);
    }

    #[tokio::test]
    async fn malformed_payloads_are_ignored() {
        let client = reset_client();
        client.apply_remote(&cm_with_payload(":-not yaml:")).await;
        let snapshot = client.snapshot().await;
        assert_eq!(snapshot.occupy.len(), 1);
    }

    #[test]
    fn missing_data_key_parses_to_none() {
        assert!(parse_reset_info(&ConfigMap::default()).is_none());
    }
}
