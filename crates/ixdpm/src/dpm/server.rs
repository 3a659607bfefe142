//! The gRPC server half of the plugin lifecycle: socket creation, the
//! supervised serve loop, kubelet registration, and teardown.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use ixml::Library;
use tokio::sync::broadcast;
use tonic::transport::Channel;
use tonic::transport::Server as TonicServer;
use tonic::Request;
use tracing::{error, info};

use crate::config::{DIAL_TIMEOUT, KUBELET_SOCKET_NAME, PLUGIN_SOCKET_NAME};
use crate::device_plugin_api::v1beta1::{
    device_plugin_server::DevicePluginServer, registration_client::RegistrationClient,
    DevicePluginOptions, RegisterRequest, API_VERSION,
};
use crate::dpm::health::HealthMonitor;
use crate::dpm::plugin::IluvatarDevicePlugin;
use crate::grpc_sock;

/// Maximum crashes of the serve loop per rolling hour before the process
/// gives up.
const MAX_RESTARTS: u32 = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(3600);

/// One incarnation of the plugin server. A new one is built every time the
/// kubelet recreates its socket.
pub struct Server {
    socket_path: PathBuf,
    kubelet_socket: PathBuf,
    plugin: IluvatarDevicePlugin,
    lib: Arc<dyn Library>,
    /// Stops the serve loop, every ListAndWatch stream, and the health
    /// monitor of this incarnation.
    stop: broadcast::Sender<()>,
    started: bool,
}

impl Server {
    pub fn new(plugin_dir: &Path, plugin: IluvatarDevicePlugin, lib: Arc<dyn Library>) -> Server {
        Server {
            socket_path: plugin_dir.join(PLUGIN_SOCKET_NAME),
            kubelet_socket: plugin_dir.join(KUBELET_SOCKET_NAME),
            stop: plugin.stop.clone(),
            plugin,
            lib,
            started: false,
        }
    }

    /// Brings the incarnation up: bind and serve the socket, confirm it
    /// accepts connections, register with the kubelet, start the health
    /// monitor.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        remove_stale_socket(&self.socket_path).await?;
        let socket = grpc_sock::server::Socket::bind(&self.socket_path)
            .with_context(|| format!("failed to bind {}", self.socket_path.display()))?;
        info!(resource = %self.plugin.resource_name, socket = %self.socket_path.display(), "created gRPC server socket");

        self.spawn_serve_loop(socket);

        // Block-dial our own socket so registration only happens once the
        // server actually accepts connections.
        dial(&self.socket_path)
            .await
            .context("plugin socket did not become ready")?;

        self.register().await.context("failed to register with the kubelet")?;
        info!(resource = %self.plugin.resource_name, "registered device plugin with kubelet");

        let monitor = HealthMonitor::new(self.lib.clone(), self.plugin.set.clone());
        tokio::spawn(monitor.run(self.plugin.device_events.clone(), self.stop.subscribe()));

        self.started = true;
        Ok(())
    }

    /// Serves the plugin API, restarting the tonic server on crash. More
    /// than [`MAX_RESTARTS`] crashes within a rolling hour aborts the
    /// process: at that point the node needs an operator.
    fn spawn_serve_loop(&self, socket: grpc_sock::server::Socket) {
        let plugin = self.plugin.clone();
        let stop = self.stop.clone();
        let socket_path = self.socket_path.clone();

        tokio::spawn(async move {
            let mut socket = Some(socket);
            let mut restart_count = 0u32;
            let mut last_crash = Instant::now();
            loop {
                let incoming = match socket.take() {
                    Some(socket) => socket,
                    None => {
                        if let Err(e) = remove_stale_socket(&socket_path).await {
                            error!(error = %e, "cannot clear plugin socket for restart");
                            return;
                        }
                        match grpc_sock::server::Socket::bind(&socket_path) {
                            Ok(socket) => socket,
                            Err(e) => {
                                error!(error = %e, "cannot rebind plugin socket");
                                return;
                            }
                        }
                    }
                };

                info!(resource = %plugin.resource_name, "starting gRPC server");
                let mut shutdown = stop.subscribe();
                let result = TonicServer::builder()
                    .add_service(DevicePluginServer::new(plugin.clone()))
                    .serve_with_incoming_shutdown(incoming, async move {
                        let _ = shutdown.recv().await;
                    })
                    .await;

                match result {
                    Ok(()) => break,
                    Err(e) => {
                        error!(resource = %plugin.resource_name, error = %e, "gRPC server crashed");
                        if restart_count > MAX_RESTARTS {
                            error!("gRPC server has repeatedly crashed recently, quitting");
                            std::process::exit(1);
                        }
                        let since_last_crash = last_crash.elapsed();
                        last_crash = Instant::now();
                        if since_last_crash > RESTART_WINDOW {
                            restart_count = 1;
                        } else {
                            restart_count += 1;
                        }
                    }
                }
            }
        });
    }

    /// Announces the plugin to the kubelet's registration service.
    async fn register(&self) -> anyhow::Result<()> {
        let channel = dial(&self.kubelet_socket).await?;
        let mut client = RegistrationClient::new(channel);
        let endpoint = self
            .socket_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| PLUGIN_SOCKET_NAME.to_string());

        client
            .register(Request::new(RegisterRequest {
                version: API_VERSION.to_string(),
                endpoint,
                resource_name: self.plugin.resource_name.clone(),
                options: Some(DevicePluginOptions {
                    pre_start_required: false,
                    get_preferred_allocation_available: true,
                }),
            }))
            .await?;
        Ok(())
    }

    /// Stops serving and unlinks the socket. Idempotent.
    pub async fn stop(&mut self) {
        if !self.started {
            return;
        }
        info!(socket = %self.socket_path.display(), "stopping device plugin server");
        let _ = self.stop.send(());
        if let Err(e) = remove_stale_socket(&self.socket_path).await {
            error!(error = %e, "failed to remove plugin socket");
        }
        self.started = false;
    }
}

async fn remove_stale_socket(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Dials a unix socket, retrying until it accepts or [`DIAL_TIMEOUT`]
/// elapses.
pub(crate) async fn dial(path: &Path) -> anyhow::Result<Channel> {
    let deadline = Instant::now() + DIAL_TIMEOUT;
    loop {
        match grpc_sock::client::socket_channel(path).await {
            Ok(channel) => return Ok(channel),
            Err(e) if Instant::now() >= deadline => {
                return Err(anyhow::anyhow!(
                    "timed out dialing {}: {}",
                    path.display(),
                    e
                ));
            }
            Err(_) => tokio::time::sleep(Duration::from_millis(100)).await,
        }
    }
}
