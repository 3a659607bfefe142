//! The device plugin lifecycle.
//!
//! [`Manager`] owns the long-lived pieces (device set, reconciler, kube
//! collaborators) and restarts a [`Server`] incarnation whenever the
//! kubelet recreates its socket.

pub mod health;
pub mod plugin;
pub mod server;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use futures::StreamExt;
use ixml::Library;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

pub use health::{DeviceEvent, HealthMonitor};
pub use plugin::IluvatarDevicePlugin;
pub use server::Server;

use crate::allocator::{HotplugEvent, Reconciler};
use crate::config::{Config, DEVICE_PLUGIN_PATH, KUBELET_SOCKET_NAME};
use crate::fs_watch::FileSystemWatcher;
use crate::kube::cache::PodCache;
use crate::kube::reset::ResetClient;
use crate::kube::{KubeClient, VolcanoContext};

/// The main machinery of the plugin: brings up IXML, the reconciler and the
/// cluster collaborators, then supervises the server across kubelet
/// restarts until told to shut down.
pub struct Manager {
    cfg: Arc<Config>,
    lib: Arc<dyn Library>,
}

impl Manager {
    pub fn new(cfg: Config, lib: Arc<dyn Library>) -> Manager {
        Manager {
            cfg: Arc::new(cfg),
            lib,
        }
    }

    pub async fn run(
        &self,
        hotplug: mpsc::Receiver<HotplugEvent>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()> {
        info!("loading IXML");
        self.lib
            .init()
            .map_err(|e| anyhow::anyhow!("failed to initialize IXML: {}", e))?;
        match (self.lib.driver_version(), self.lib.cuda_version()) {
            (Ok(driver), Ok(cuda)) => info!(%driver, %cuda, "IXML loaded"),
            _ => debug!("IXML loaded, version queries unsupported"),
        }

        let reconciler = Arc::new(Reconciler::new(self.lib.clone(), &self.cfg));
        reconciler
            .rebuild()
            .await
            .map_err(|e| anyhow::anyhow!("initial device scan failed: {}", e))?;
        let set = reconciler.device_set();
        set.read().await.show_layout();
        tokio::spawn(reconciler.clone().run_debounced(hotplug));

        // Health and population changes fan out to every ListAndWatch
        // stream and to the ConfigMap updater; it outlives server restarts.
        let (device_events, _) = broadcast::channel(32);
        // Stop signal for the process-wide background tasks.
        let (task_stop, _) = broadcast::channel::<()>(4);

        let kube = Arc::new(KubeClient::try_new().await.context("failed to create kube client")?);
        let cache = PodCache::default();
        tokio::spawn(cache.clone().run_informer(
            kube.client.clone(),
            kube.node_name.clone(),
            task_stop.subscribe(),
        ));
        tokio::spawn(crate::kube::ops::run_device_info_updater(
            kube.clone(),
            cache.clone(),
            set.clone(),
            device_events.subscribe(),
            task_stop.subscribe(),
            self.cfg.flags.use_volcano,
        ));

        let volcano = if self.cfg.flags.use_volcano {
            info!("volcano scheduler integration enabled");
            Some(Arc::new(VolcanoContext::new(kube.clone(), cache.clone())))
        } else {
            None
        };

        let reset = if self.cfg.flags.reset_gpu {
            info!("GPU reset coordination enabled");
            let reset = Arc::new(ResetClient::new(kube.clone(), self.lib.clone()));
            tokio::spawn(reset.clone().run_informer(task_stop.subscribe()));
            reset.create_reset_info().await;
            Some(reset)
        } else {
            None
        };

        info!("starting FS watcher");
        let plugin_dir = Path::new(DEVICE_PLUGIN_PATH);
        let mut fs_events = FileSystemWatcher::new(plugin_dir)
            .context("failed to create FS watcher")?;
        let kubelet_socket = plugin_dir.join(KUBELET_SOCKET_NAME);

        let mut server = self.new_server(plugin_dir, &set, &device_events, &volcano, &reset);
        server.start().await.context("failed to start plugin")?;

        // 1. Stop the plugin when the kubelet goes away.
        // 2. Restart it when the kubelet socket reappears.
        // 3. Stop everything on a shutdown signal.
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("received shutdown signal, stopping plugin");
                    server.stop().await;
                    break;
                }
                event = fs_events.next() => match event {
                    Some(Ok(event)) if event.paths.iter().any(|p| p == &kubelet_socket) => {
                        if event.kind.is_create() {
                            info!(socket = %kubelet_socket.display(), "kubelet socket created, restarting plugin");
                            server.stop().await;
                            server = self.new_server(plugin_dir, &set, &device_events, &volcano, &reset);
                            server.start().await.context("failed to restart plugin")?;
                        } else if event.kind.is_remove() {
                            info!(socket = %kubelet_socket.display(), "kubelet socket removed, stopping plugin");
                            server.stop().await;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => warn!(error = %e, "filesystem watch error"),
                    None => {
                        warn!("filesystem watch stream ended, shutting down");
                        server.stop().await;
                        break;
                    }
                }
            }
        }

        let _ = task_stop.send(());
        info!("shutdown of IXML returned: {:?}", self.lib.shutdown());
        Ok(())
    }

    fn new_server(
        &self,
        plugin_dir: &Path,
        set: &Arc<tokio::sync::RwLock<crate::allocator::DeviceSet>>,
        device_events: &broadcast::Sender<DeviceEvent>,
        volcano: &Option<Arc<VolcanoContext>>,
        reset: &Option<Arc<ResetClient>>,
    ) -> Server {
        let (stop, _) = broadcast::channel(4);
        let plugin = IluvatarDevicePlugin {
            set: set.clone(),
            resource_name: self.cfg.resource_name.clone(),
            device_events: device_events.clone(),
            stop,
            volcano: volcano.clone(),
            reset: reset.clone(),
        };
        Server::new(plugin_dir, plugin, self.lib.clone())
    }
}
