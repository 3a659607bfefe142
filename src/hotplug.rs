//! Adapter from kernel uevents to the reconciler's [`HotplugEvent`]s.
//!
//! The udev subscription lives here at the binary edge; the core only
//! ever sees the action strings.

use futures::StreamExt;
use ixdpm::allocator::HotplugEvent;
use ixdpm::config::UDEV_SUBSYSTEM;
use tokio::sync::mpsc;
use tokio_udev::{AsyncMonitorSocket, MonitorBuilder};
use tracing::{info, warn};

/// Subscribes to the kernel uevent stream and forwards every event on the
/// configured subsystem. The task ends when the receiver side is dropped.
///
/// The udev types involved hold raw, non-`Send` pointers, so the watch loop
/// runs on its own thread with a dedicated single-threaded runtime rather
/// than via `tokio::spawn` on the shared multi-threaded runtime.
pub fn spawn(tx: mpsc::Sender<HotplugEvent>) -> anyhow::Result<()> {
    info!(subsystem = UDEV_SUBSYSTEM, "starting hotplug watcher");
    std::thread::spawn(move || {
        let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
            Ok(rt) => rt,
            Err(e) => {
                warn!(error = %e, "unable to start hotplug watcher runtime");
                return;
            }
        };
        rt.block_on(async move {
            let socket = match MonitorBuilder::new()
                .and_then(|b| b.match_subsystem(UDEV_SUBSYSTEM))
                .and_then(|b| b.listen())
            {
                Ok(socket) => socket,
                Err(e) => {
                    warn!(error = %e, "unable to start hotplug watcher");
                    return;
                }
            };
            let mut monitor = match AsyncMonitorSocket::new(socket) {
                Ok(monitor) => monitor,
                Err(e) => {
                    warn!(error = %e, "unable to start hotplug watcher");
                    return;
                }
            };
            while let Some(event) = monitor.next().await {
                match event {
                    Ok(event) => {
                        let action = event.event_type().to_string();
                        if tx.send(HotplugEvent { action }).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!(error = %e, "udev event stream error"),
                }
            }
            warn!("udev event stream ended");
        });
    });
    Ok(())
}
