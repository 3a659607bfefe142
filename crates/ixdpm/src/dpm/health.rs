//! Periodic per-chip health sampling.

use std::sync::Arc;

use ixml::Library;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::allocator::DeviceSet;
use crate::config::HEALTH_CHECK_INTERVAL;
use crate::allocator::HealthState;

/// A change observed by one of the background monitors.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A device's health rollup flipped.
    HealthChanged(String),
    /// The chip population changed; consumers should re-list everything.
    Relist,
}

/// Samples every chip of every device on a fixed cadence, recomputes the
/// device rollups, and emits an event for each flip. A change in the
/// device set's chip count emits a [`DeviceEvent::Relist`].
pub struct HealthMonitor {
    lib: Arc<dyn Library>,
    set: Arc<RwLock<DeviceSet>>,
}

impl HealthMonitor {
    pub fn new(lib: Arc<dyn Library>, set: Arc<RwLock<DeviceSet>>) -> HealthMonitor {
        HealthMonitor { lib, set }
    }

    pub async fn run(
        self,
        events: broadcast::Sender<DeviceEvent>,
        mut stop: broadcast::Receiver<()>,
    ) {
        info!("starting GPU health checking");
        let mut last_count = self.set.read().await.count;

        let start = tokio::time::Instant::now() + HEALTH_CHECK_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, HEALTH_CHECK_INTERVAL);
        loop {
            tokio::select! {
                _ = stop.recv() => {
                    info!("stopping GPU health checking");
                    return;
                }
                _ = ticker.tick() => {}
            }

            let mut flipped = Vec::new();
            let count = {
                let mut set = self.set.write().await;
                for dev in set.devices.values_mut() {
                    for chip in dev.chips.values_mut() {
                        chip.health = match self.lib.health(chip.handle) {
                            Ok(mask) if mask.is_ok() => HealthState::Healthy,
                            Ok(mask) => {
                                warn!(chip = %chip.uuid, "unhealthy chip");
                                for (i, error) in mask.errors().iter().enumerate() {
                                    warn!(chip = %chip.uuid, index = i, %error, "health error");
                                }
                                HealthState::Unhealthy
                            }
                            // A chip that vanished between scan and sample
                            // reads as unhealthy until the next reconcile
                            // purges it.
                            Err(e) => {
                                warn!(chip = %chip.uuid, error = %e, "health sampling failed");
                                HealthState::Unhealthy
                            }
                        };
                    }
                    if dev.update_health() {
                        flipped.push(dev.uuid.clone());
                    }
                }
                set.count
            };

            for uuid in flipped {
                info!(device = %uuid, "device health changed");
                let _ = events.send(DeviceEvent::HealthChanged(uuid));
            }
            if count != last_count {
                info!(previous = last_count, current = count, "chip count changed");
                let _ = events.send(DeviceEvent::Relist);
                last_count = count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::Reconciler;
    use crate::config::Config;
    use crate::test_support::{MockChipSpec, MockLibrary};
    use std::time::Duration;

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn flips_are_emitted_once() {
        let lib = Arc::new(MockLibrary::new(vec![MockChipSpec {
            uuid: "A".to_string(),
            name: "MR-V100".to_string(),
            ..Default::default()
        }]));
        let reconciler = Reconciler::new(lib.clone(), &Config::default());
        reconciler.rebuild().await.unwrap();
        let set = reconciler.device_set();

        let (events_tx, mut events_rx) = broadcast::channel(16);
        let (stop_tx, _) = broadcast::channel(1);
        let monitor = HealthMonitor::new(lib.clone(), set.clone());
        let task = tokio::spawn(monitor.run(events_tx, stop_tx.subscribe()));

        lib.set_health_bits("A", 1 << 4);
        tokio::time::advance(Duration::from_secs(6)).await;
        settle().await;

        match events_rx.try_recv() {
            Ok(DeviceEvent::HealthChanged(uuid)) => assert_eq!(uuid, "A"),
            other => panic!("expected a health change event, got {:?}", other),
        }
        assert_eq!(
            set.read().await.devices["A"].health(),
            HealthState::Unhealthy
        );

        // Still unhealthy on the next sample: no second event.
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;
        assert!(events_rx.try_recv().is_err());

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
