//! The authoritative device model: chips scanned from IXML, one- and
//! two-chip devices assembled from them, and the reconciler that rebuilds
//! the whole set on hot-plug events.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use ixml::{ChipHandle, Library};
use tokio::sync::mpsc;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::allocator::links::{P2PLink, P2PLinkType};
use crate::config::Config;
use crate::device_plugin_api::v1beta1;

/// Separator between a device UUID and a replica ordinal in exposed IDs.
pub const ALIAS_SEPARATOR: &str = "::";

/// Health of a chip or exposed device, mirroring the protocol strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

impl HealthState {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthState::Healthy => "Healthy",
            HealthState::Unhealthy => "Unhealthy",
        }
    }

    pub fn is_healthy(self) -> bool {
        self == HealthState::Healthy
    }
}

/// A composite identifier `<uuid>::<ordinal>`.
///
/// Bare device UUIDs pass through unchanged: `prefix` of a non-alias is the
/// whole string and `suffix` is absent.
#[derive(Debug, Clone, Copy)]
pub struct Alias<'a>(pub &'a str);

impl<'a> Alias<'a> {
    pub fn has_alias(&self) -> bool {
        self.0.split(ALIAS_SEPARATOR).count() == 2
    }

    /// The device UUID part of the identifier.
    pub fn prefix(&self) -> &'a str {
        self.0.split(ALIAS_SEPARATOR).next().unwrap_or(self.0)
    }

    /// The replica ordinal part, when present.
    pub fn suffix(&self) -> Option<&'a str> {
        let mut parts = self.0.split(ALIAS_SEPARATOR);
        let _ = parts.next();
        parts.next()
    }
}

/// The smallest physical unit reported by IXML.
#[derive(Debug, Clone)]
pub struct Chip {
    pub uuid: String,
    pub name: String,
    /// Host device node minor number (`/dev/ix<minor>`).
    pub minor: u32,
    /// Current IXML index; may change across hot-plug events.
    pub index: u32,
    pub numa_node: Option<i64>,
    pub health: HealthState,
    pub handle: ChipHandle,
}

/// One entry of a device's exposed sequence. With replication off this is
/// the device itself; with replication on it is one time-slicing slot.
#[derive(Debug, Clone)]
pub struct ReplicaDevice {
    pub id: String,
    pub health: HealthState,
}

/// The unit exposed to the orchestrator: exactly one chip, or the two
/// chips of a carrier board.
#[derive(Debug, Clone)]
pub struct Device {
    /// Master chip UUID.
    pub uuid: String,
    pub name: String,
    pub minor: u32,
    pub index: u32,
    pub is_multi_chip: bool,
    pub replicas: usize,
    /// Chips bound to this device, keyed by chip UUID.
    pub chips: HashMap<String, Chip>,
    /// Link matrix entries, keyed by peer device UUID.
    pub links: HashMap<String, Vec<P2PLink>>,
    pub exposed: Vec<ReplicaDevice>,
}

impl Device {
    /// Builds a device around its master chip. With `replicas == 0` a
    /// single entry carrying the bare UUID is exposed, otherwise one
    /// composite-ID entry per replica.
    pub fn new(chip: Chip, replicas: usize) -> Device {
        let mut exposed = Vec::new();
        if replicas == 0 {
            exposed.push(ReplicaDevice {
                id: chip.uuid.clone(),
                health: chip.health,
            });
        } else {
            for ordinal in 0..replicas {
                exposed.push(ReplicaDevice {
                    id: format!("{}{}{}", chip.uuid, ALIAS_SEPARATOR, ordinal),
                    health: chip.health,
                });
            }
        }

        let mut chips = HashMap::new();
        let uuid = chip.uuid.clone();
        let name = chip.name.clone();
        let minor = chip.minor;
        let index = chip.index;
        chips.insert(uuid.clone(), chip);

        Device {
            uuid,
            name,
            minor,
            index,
            is_multi_chip: false,
            replicas,
            chips,
            links: HashMap::new(),
            exposed,
        }
    }

    /// The chip whose UUID the device is named after.
    pub fn master_chip(&self) -> Option<&Chip> {
        self.chips.get(&self.uuid)
    }

    /// Current health of the exposed entries.
    pub fn health(&self) -> HealthState {
        self.exposed
            .first()
            .map(|r| r.health)
            .unwrap_or(HealthState::Unhealthy)
    }

    /// Forces every exposed entry to the given health.
    pub fn set_health(&mut self, health: HealthState) {
        for replica in &mut self.exposed {
            replica.health = health;
        }
    }

    /// Recomputes the exposed health from the chip healths, honoring the
    /// two-chip rule for boards. Returns true when the rollup flipped;
    /// flipping the rollup is the only way health propagates outward.
    pub fn update_health(&mut self) -> bool {
        let rollup = self.rollup_health();
        if self.health() != rollup {
            self.set_health(rollup);
            return true;
        }
        false
    }

    fn rollup_health(&self) -> HealthState {
        // A board that lost a sibling chip is an offline card even when the
        // remaining chip samples healthy.
        if self.is_multi_chip && self.chips.len() != 2 {
            return HealthState::Unhealthy;
        }
        if self.chips.values().any(|c| !c.health.is_healthy()) {
            return HealthState::Unhealthy;
        }
        HealthState::Healthy
    }

    /// Host device nodes for this device, one per chip, host path equal to
    /// container path. Sorted by minor for deterministic responses.
    pub fn device_specs(&self) -> Vec<v1beta1::DeviceSpec> {
        let mut minors: Vec<u32> = self.chips.values().map(|c| c.minor).collect();
        minors.sort_unstable();
        minors
            .into_iter()
            .map(|minor| {
                let path = format!(
                    "{}{}{}",
                    crate::config::HOST_PATH_PREFIX,
                    crate::config::DEVICE_NAME,
                    minor
                );
                v1beta1::DeviceSpec {
                    host_path: path.clone(),
                    container_path: path,
                    permissions: "rw".to_string(),
                }
            })
            .collect()
    }

    /// UUIDs of every chip bound to this device, master first.
    pub fn chip_uuids(&self) -> Vec<String> {
        let mut uuids = vec![self.uuid.clone()];
        let mut rest: Vec<String> = self
            .chips
            .keys()
            .filter(|u| **u != self.uuid)
            .cloned()
            .collect();
        rest.sort();
        uuids.extend(rest);
        uuids
    }

    /// Minor numbers of every chip bound to this device.
    pub fn chip_minors(&self) -> Vec<u32> {
        self.chips.values().map(|c| c.minor).collect()
    }
}

/// One entry of a [`ReplicaDeviceMap`]: an exposed replica plus enough
/// about its parent for the replica policy to spread load.
#[derive(Debug, Clone)]
pub struct ReplicaEntry {
    pub id: String,
    pub parent_uuid: String,
    pub parent_replicas: usize,
}

/// Mapping from replica ID to replica, with the set algebra the policies
/// are written in.
#[derive(Debug, Clone, Default)]
pub struct ReplicaDeviceMap(HashMap<String, ReplicaEntry>);

impl ReplicaDeviceMap {
    pub fn contains(&self, id: &str) -> bool {
        self.0.contains_key(id)
    }

    /// The entries of `self` matching `ids`; unknown ids are skipped.
    pub fn subset(&self, ids: &[String]) -> ReplicaDeviceMap {
        ReplicaDeviceMap(
            ids.iter()
                .filter_map(|id| self.0.get(id).map(|e| (id.clone(), e.clone())))
                .collect(),
        )
    }

    /// The entries of `self` not contained in `other`.
    pub fn difference(&self, other: &ReplicaDeviceMap) -> ReplicaDeviceMap {
        ReplicaDeviceMap(
            self.0
                .iter()
                .filter(|(id, _)| !other.contains(id))
                .map(|(id, e)| (id.clone(), e.clone()))
                .collect(),
        )
    }

    /// All replica IDs, sorted for determinism.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.0.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ReplicaEntry)> {
        self.0.iter()
    }

    pub fn insert(&mut self, entry: ReplicaEntry) {
        self.0.insert(entry.id.clone(), entry);
    }
}

/// Process-wide authoritative mapping from device UUID to device.
///
/// Shared as `Arc<RwLock<DeviceSet>>`; the reconciler swaps the whole map
/// under the write half, readers hold the read half for the duration of
/// any multi-step read.
#[derive(Debug)]
pub struct DeviceSet {
    pub devices: HashMap<String, Device>,
    /// Live chip count as of the last reconcile.
    pub count: u32,
    /// Runtime-chosen replication factor.
    pub replicas: usize,
}

impl DeviceSet {
    pub fn new(replicas: usize) -> DeviceSet {
        DeviceSet {
            devices: HashMap::new(),
            count: 0,
            replicas,
        }
    }

    /// The full exposed-device list in wire form, sorted by ID.
    pub fn cached_devices(&self) -> Vec<v1beta1::Device> {
        let mut devices: Vec<v1beta1::Device> = self
            .devices
            .values()
            .flat_map(|dev| {
                let topology = dev.master_chip().and_then(|c| c.numa_node).map(|id| {
                    v1beta1::TopologyInfo {
                        nodes: vec![v1beta1::NumaNode { id }],
                    }
                });
                dev.exposed.iter().map(move |replica| v1beta1::Device {
                    id: replica.id.clone(),
                    health: replica.health.as_str().to_string(),
                    topology: topology.clone(),
                })
            })
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    /// Whether an exposed ID (bare UUID or replica alias) exists.
    pub fn device_exists(&self, id: &str) -> bool {
        match self.devices.get(Alias(id).prefix()) {
            Some(dev) => dev.exposed.iter().any(|r| r.id == id),
            None => false,
        }
    }

    /// The devices matching `uuids`, failing on the first unknown one.
    pub fn filter(&self, uuids: &[String]) -> Result<Vec<&Device>, String> {
        uuids
            .iter()
            .map(|uuid| {
                self.devices
                    .get(uuid)
                    .ok_or_else(|| format!("no device with uuid: {}", uuid))
            })
            .collect()
    }

    /// Number of chips across all devices.
    pub fn total_chip_count(&self) -> usize {
        self.devices.values().map(|d| d.chips.len()).sum()
    }

    /// Builds the replica map over every exposed entry.
    pub fn build_replica_map(&self) -> ReplicaDeviceMap {
        let mut map = ReplicaDeviceMap::default();
        for dev in self.devices.values() {
            for replica in &dev.exposed {
                map.insert(ReplicaEntry {
                    id: replica.id.clone(),
                    parent_uuid: dev.uuid.clone(),
                    parent_replicas: dev.replicas,
                });
            }
        }
        map
    }

    /// Affinity ordinals between devices, for the best-effort policy:
    /// `uuid -> peer uuid -> strongest link ordinal`.
    pub fn link_ordinals(&self) -> HashMap<String, HashMap<String, u32>> {
        self.devices
            .iter()
            .map(|(uuid, dev)| {
                let peers = dev
                    .links
                    .iter()
                    .map(|(peer, links)| {
                        let best = links.iter().map(|l| l.link_type.ordinal()).max().unwrap_or(0);
                        (peer.clone(), best)
                    })
                    .collect();
                (uuid.clone(), peers)
            })
            .collect()
    }

    /// Debug dump of the link matrix.
    pub fn show_layout(&self) {
        for (uuid, dev) in &self.devices {
            debug!(device = %uuid, "device layout");
            for (peer, links) in &dev.links {
                for link in links {
                    debug!(device = %uuid, peer = %peer, link = %link.link_type, "p2p link");
                }
            }
        }
    }
}

/// Groups exposed IDs by their device UUID, preserving first-seen order of
/// the prefixes.
pub fn prefix_uuids(ids: &[String]) -> (Vec<String>, HashMap<String, Vec<String>>) {
    let mut prefixes = Vec::new();
    let mut groups: HashMap<String, Vec<String>> = HashMap::new();
    for id in ids {
        let prefix = Alias(id).prefix().to_string();
        if !groups.contains_key(&prefix) {
            prefixes.push(prefix.clone());
        }
        groups.entry(prefix).or_default().push(id.clone());
    }
    (prefixes, groups)
}

/// A hot-plug notification from the kernel, as delivered by the udev
/// adapter in the binary.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    pub action: String,
}

/// Rebuilds the [`DeviceSet`] by full rescan, on startup and (debounced)
/// on every hot-plug event.
///
/// Owns the debounce state and the carry-over pool of chips whose board
/// siblings have not been seen yet; collaborators receive it explicitly
/// rather than through process globals.
pub struct Reconciler {
    lib: Arc<dyn Library>,
    set: Arc<RwLock<DeviceSet>>,
    split_board: bool,
    debounce_window: Duration,
    /// Chips waiting for their board sibling, keyed by chip UUID.
    unmanaged: StdMutex<HashMap<String, Chip>>,
}

impl Reconciler {
    pub fn new(lib: Arc<dyn Library>, cfg: &Config) -> Reconciler {
        Reconciler {
            lib,
            set: Arc::new(RwLock::new(DeviceSet::new(cfg.replicas()))),
            split_board: cfg.flags.split_board,
            debounce_window: crate::config::HOTPLUG_DEBOUNCE_WINDOW,
            unmanaged: StdMutex::new(HashMap::new()),
        }
    }

    /// Handle to the device set this reconciler maintains.
    pub fn device_set(&self) -> Arc<RwLock<DeviceSet>> {
        self.set.clone()
    }

    /// One full rescan + rebuild + atomic swap. A failure to even count
    /// devices aborts the cycle without touching the published set.
    pub async fn rebuild(&self) -> ixml::Result<()> {
        let count = self.lib.device_count()?;

        let mut chips = Vec::new();
        for index in 0..count {
            if let Some(chip) = self.build_chip(index) {
                chips.push(chip);
            }
        }

        let replicas = self.set.read().await.replicas;
        let mut devices = HashMap::new();
        if self.split_board {
            Self::assemble_single(chips, replicas, &mut devices);
        } else {
            self.assemble_multi(chips, replicas, &mut devices);
        }
        self.reset_topology(&mut devices);

        let mut set = self.set.write().await;
        set.devices = devices;
        set.count = count;
        info!(chips = count, devices = set.devices.len(), "device set rebuilt");
        Ok(())
    }

    /// Reads one chip's attributes. Chips whose UUID cannot be read are
    /// skipped; other per-attribute failures keep the chip with defaults.
    fn build_chip(&self, index: u32) -> Option<Chip> {
        let handle = match self.lib.device_by_index(index) {
            Ok(handle) => handle,
            Err(e) => {
                warn!(index, error = %e, "failed to get device handle");
                return None;
            }
        };
        let uuid = match self.lib.uuid(handle) {
            Ok(uuid) => uuid,
            Err(e) => {
                warn!(index, error = %e, "failed to read chip uuid, skipping");
                return None;
            }
        };
        let name = self.lib.name(handle).unwrap_or_else(|e| {
            warn!(chip = %uuid, error = %e, "failed to read chip name");
            String::new()
        });
        let minor = self.lib.minor_number(handle).unwrap_or_else(|e| {
            warn!(chip = %uuid, error = %e, "failed to read chip minor number");
            0
        });
        let numa_node = self.lib.numa_node(handle).unwrap_or_else(|e| {
            warn!(chip = %uuid, error = %e, "failed to read chip numa node");
            None
        });
        let health = match self.lib.health(handle) {
            Ok(mask) if mask.is_ok() => HealthState::Healthy,
            Ok(mask) => {
                for error in mask.errors() {
                    warn!(chip = %uuid, %error, "chip reported unhealthy");
                }
                HealthState::Unhealthy
            }
            Err(e) => {
                warn!(chip = %uuid, error = %e, "failed to sample chip health");
                HealthState::Unhealthy
            }
        };

        info!(index, chip = %uuid, name = %name, minor, numa = ?numa_node, "detected chip");
        Some(Chip {
            uuid,
            name,
            minor,
            index,
            numa_node,
            health,
            handle,
        })
    }

    /// Split-board mode: one device per chip.
    fn assemble_single(chips: Vec<Chip>, replicas: usize, devices: &mut HashMap<String, Device>) {
        for chip in chips {
            let dev = Device::new(chip, replicas);
            devices.insert(dev.uuid.clone(), dev);
        }
    }

    /// Board mode: chips at board position 0 become multi-chip masters;
    /// their siblings are found in the unmanaged pool through the
    /// same-board predicate.
    fn assemble_multi(
        &self,
        chips: Vec<Chip>,
        replicas: usize,
        devices: &mut HashMap<String, Device>,
    ) {
        let mut unmanaged = match self.unmanaged.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Carry over chips whose partner was missing in earlier cycles.
        let mut pool: Vec<Chip> = unmanaged.values().cloned().collect();

        for chip in chips {
            match self.lib.board_position(chip.handle) {
                Ok(Some(0)) => {
                    let mut dev = Device::new(chip, replicas);
                    dev.is_multi_chip = true;
                    devices.insert(dev.uuid.clone(), dev);
                }
                Ok(Some(_)) => {
                    unmanaged.insert(chip.uuid.clone(), chip.clone());
                    pool.push(chip);
                }
                Ok(None) => {
                    let dev = Device::new(chip, replicas);
                    devices.insert(dev.uuid.clone(), dev);
                }
                Err(e) => {
                    warn!(chip = %chip.uuid, error = %e, "failed to read board position, treating as single-chip");
                    let dev = Device::new(chip, replicas);
                    devices.insert(dev.uuid.clone(), dev);
                }
            }
        }

        // A full rescan sees carried-over chips again.
        pool.sort_by(|a, b| a.uuid.cmp(&b.uuid));
        pool.dedup_by(|a, b| a.uuid == b.uuid);

        let mut consumed: HashSet<String> = HashSet::new();
        for dev in devices.values_mut() {
            if !dev.is_multi_chip {
                continue;
            }
            let master = match dev.master_chip() {
                Some(master) => master.clone(),
                None => continue,
            };
            for candidate in &pool {
                if consumed.contains(&candidate.uuid) {
                    continue;
                }
                if let Ok(true) = self.lib.on_same_board(master.handle, candidate.handle) {
                    if !candidate.health.is_healthy() {
                        dev.set_health(HealthState::Unhealthy);
                    }
                    dev.chips.insert(candidate.uuid.clone(), candidate.clone());
                    consumed.insert(candidate.uuid.clone());
                    unmanaged.remove(&candidate.uuid);
                    break;
                }
            }
            // A board with only one working chip is an offline card.
            if dev.chips.len() != 2 {
                dev.set_health(HealthState::Unhealthy);
            }
        }

        for chip in unmanaged.values() {
            warn!(chip = %chip.uuid, "chip has no recognized board partner yet");
        }
    }

    /// Rebuilds the link matrix from pairwise topology queries between
    /// master chips. A query failure means no link.
    fn reset_topology(&self, devices: &mut HashMap<String, Device>) {
        for dev in devices.values_mut() {
            dev.links.clear();
        }

        let masters: Vec<(String, ChipHandle)> = devices
            .values()
            .filter_map(|d| d.master_chip().map(|c| (d.uuid.clone(), c.handle)))
            .collect();

        for (uuid, handle) in &masters {
            for (peer, peer_handle) in &masters {
                if uuid == peer {
                    continue;
                }
                if let Ok(level) = self.lib.topology_level(*handle, *peer_handle) {
                    let link_type = P2PLinkType::from_topology(level);
                    if let Some(dev) = devices.get_mut(uuid) {
                        dev.links.entry(peer.clone()).or_default().push(P2PLink {
                            peer: peer.clone(),
                            link_type,
                        });
                    }
                }
            }
        }
    }

    /// Consumes hot-plug events, coalescing bursts into a single rescan.
    ///
    /// The first event after an idle period arms a timer for the quiet
    /// window; events arriving while the timer is armed are merged into the
    /// pending rescan. Exits when the event channel closes.
    pub async fn run_debounced(self: Arc<Self>, mut events: mpsc::Receiver<HotplugEvent>) {
        let mut deadline: Option<Instant> = None;
        loop {
            let timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => match event.action.as_str() {
                        "add" | "remove" | "change" => {
                            debug!(action = %event.action, "hotplug event");
                            if deadline.is_none() {
                                deadline = Some(Instant::now() + self.debounce_window);
                            }
                        }
                        action => {
                            debug!(%action, "ignoring hotplug event");
                        }
                    },
                    None => return,
                },
                _ = timer => {
                    deadline = None;
                    match self.rebuild().await {
                        Ok(()) => self.set.read().await.show_layout(),
                        Err(e) => warn!(error = %e, "device rescan failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockChipSpec, MockLibrary};

    fn test_config(split_board: bool, replicas: usize) -> Config {
        let mut cfg = Config::default();
        cfg.flags.split_board = split_board;
        cfg.sharing.time_slicing.replicas = replicas;
        cfg
    }

    fn chip(uuid: &str, minor: u32) -> MockChipSpec {
        MockChipSpec {
            uuid: uuid.to_string(),
            name: "MR-V100".to_string(),
            minor,
            ..Default::default()
        }
    }

    #[test]
    fn alias_round_trip() {
        let alias = Alias("GPU-1::3");
        assert!(alias.has_alias());
        assert_eq!(alias.prefix(), "GPU-1");
        assert_eq!(alias.suffix(), Some("3"));
        assert_eq!(
            format!("{}{}{}", alias.prefix(), ALIAS_SEPARATOR, alias.suffix().unwrap()),
            "GPU-1::3"
        );

        let bare = Alias("GPU-1");
        assert!(!bare.has_alias());
        assert_eq!(bare.prefix(), "GPU-1");
        assert_eq!(bare.suffix(), None);
    }

    #[test]
    fn replica_map_algebra() {
        let mut map = ReplicaDeviceMap::default();
        for id in ["A::0", "A::1", "B::0"] {
            map.insert(ReplicaEntry {
                id: id.to_string(),
                parent_uuid: Alias(id).prefix().to_string(),
                parent_replicas: 2,
            });
        }

        let wanted = vec!["A::0".to_string(), "B::0".to_string(), "C::9".to_string()];
        let subset = map.subset(&wanted);
        // Subset ids are always contained in the requested ids.
        for id in subset.ids() {
            assert!(wanted.contains(&id));
        }
        assert_eq!(subset.len(), 2);

        assert!(map.difference(&map).is_empty());
        let rest = map.difference(&subset);
        assert_eq!(rest.ids(), vec!["A::1".to_string()]);
    }

    #[test]
    fn multi_chip_device_with_one_chip_is_unhealthy() {
        let mut dev = Device::new(
            Chip {
                uuid: "A".into(),
                name: "MR".into(),
                minor: 0,
                index: 0,
                numa_node: None,
                health: HealthState::Healthy,
                handle: ChipHandle::from_raw(0),
            },
            0,
        );
        dev.is_multi_chip = true;
        assert!(dev.update_health());
        assert_eq!(dev.health(), HealthState::Unhealthy);
        // Already unhealthy, no further flip.
        assert!(!dev.update_health());
    }

    #[tokio::test]
    async fn assembles_two_chip_boards() {
        let lib = MockLibrary::new(vec![
            chip("C0", 0).on_board(1, 0),
            chip("C1", 1).on_board(1, 1),
            chip("C2", 2).on_board(2, 0),
            chip("C3", 3).on_board(2, 1),
        ]);
        let lib = Arc::new(lib);
        let reconciler = Reconciler::new(lib, &test_config(false, 0));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        let set = set.read().await;
        assert_eq!(set.devices.len(), 2);
        for dev in set.devices.values() {
            assert!(dev.is_multi_chip);
            assert_eq!(dev.chips.len(), 2);
            assert_eq!(dev.health(), HealthState::Healthy);
        }
        assert_eq!(set.count, 4);
        assert_eq!(set.total_chip_count(), 4);
    }

    #[tokio::test]
    async fn unhealthy_sibling_marks_only_its_board() {
        let lib = Arc::new(MockLibrary::new(vec![
            chip("C0", 0).on_board(1, 0),
            chip("C1", 1).on_board(1, 1).with_health_bits(1),
            chip("C2", 2).on_board(2, 0),
            chip("C3", 3).on_board(2, 1),
        ]));
        let reconciler = Reconciler::new(lib, &test_config(false, 0));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        let set = set.read().await;
        assert_eq!(set.devices["C0"].health(), HealthState::Unhealthy);
        assert_eq!(set.devices["C2"].health(), HealthState::Healthy);
    }

    #[tokio::test]
    async fn split_board_exposes_each_chip() {
        let lib = Arc::new(MockLibrary::new(vec![
            chip("C0", 0).on_board(1, 0),
            chip("C1", 1).on_board(1, 1),
        ]));
        let reconciler = Reconciler::new(lib, &test_config(true, 0));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        let set = set.read().await;
        assert_eq!(set.devices.len(), 2);
        assert!(set.devices.values().all(|d| !d.is_multi_chip));

        let filtered = set
            .filter(&["C0".to_string(), "C1".to_string()])
            .expect("both chips are exposed as devices");
        assert_eq!(filtered.len(), 2);
        assert!(set.filter(&["C7".to_string()]).is_err());
    }

    #[tokio::test]
    async fn chips_without_uuid_are_skipped() {
        let mut bad = chip("C1", 1);
        bad.fail_uuid = true;
        let lib = Arc::new(MockLibrary::new(vec![chip("C0", 0), bad]));
        let reconciler = Reconciler::new(lib, &test_config(false, 0));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        assert_eq!(set.read().await.devices.len(), 1);
    }

    #[tokio::test]
    async fn replication_exposes_composite_ids() {
        let lib = Arc::new(MockLibrary::new(vec![chip("A", 0), chip("B", 1)]));
        let reconciler = Reconciler::new(lib, &test_config(false, 4));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        let set = set.read().await;
        let cached = set.cached_devices();
        assert_eq!(cached.len(), 8);
        assert!(cached.iter().any(|d| d.id == "A::0"));
        assert!(cached.iter().any(|d| d.id == "B::3"));
        assert!(set.device_exists("A::2"));
        assert!(!set.device_exists("A::4"));
        assert!(!set.device_exists("A"));
    }

    #[tokio::test]
    async fn links_are_built_between_devices() {
        let mut lib = MockLibrary::new(vec![chip("A", 0), chip("B", 1)]);
        lib.set_topology("A", "B", ixml::TopologyLevel::Single);
        let lib = Arc::new(lib);
        let reconciler = Reconciler::new(lib, &test_config(false, 0));
        reconciler.rebuild().await.unwrap();

        let set = reconciler.device_set();
        let set = set.read().await;
        let links = &set.devices["A"].links["B"];
        assert_eq!(links[0].link_type, P2PLinkType::SingleSwitch);
        let ordinals = set.link_ordinals();
        assert_eq!(ordinals["A"]["B"], P2PLinkType::SingleSwitch.ordinal());
        // Symmetric entry exists too.
        assert_eq!(ordinals["B"]["A"], P2PLinkType::SingleSwitch.ordinal());
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hotplug_bursts_collapse_into_one_rescan() {
        let lib = Arc::new(MockLibrary::new(vec![chip("A", 0)]));
        let reconciler = Arc::new(Reconciler::new(lib.clone(), &test_config(false, 0)));
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(reconciler.clone().run_debounced(rx));

        let scans_before = lib.scan_count();
        for _ in 0..10 {
            tx.send(HotplugEvent {
                action: "add".to_string(),
            })
            .await
            .unwrap();
            tokio::time::advance(Duration::from_millis(200)).await;
        }
        // Inside the quiet window nothing has happened yet.
        assert_eq!(lib.scan_count(), scans_before);

        tokio::time::advance(Duration::from_secs(4)).await;
        settle().await;
        assert_eq!(lib.scan_count(), scans_before + 1);

        // No further rescan without new events.
        tokio::time::advance(Duration::from_secs(30)).await;
        settle().await;
        assert_eq!(lib.scan_count(), scans_before + 1);

        // Unknown actions never arm the timer.
        tx.send(HotplugEvent {
            action: "bind".to_string(),
        })
        .await
        .unwrap();
        tokio::time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(lib.scan_count(), scans_before + 1);

        drop(tx);
        task.await.unwrap();
    }

    #[test]
    fn prefix_uuid_grouping() {
        let ids = vec![
            "A::0".to_string(),
            "B::1".to_string(),
            "A::2".to_string(),
        ];
        let (prefixes, groups) = prefix_uuids(&ids);
        assert_eq!(prefixes, vec!["A".to_string(), "B".to_string()]);
        assert_eq!(groups["A"].len(), 2);
        assert_eq!(groups["B"], vec!["B::1".to_string()]);
    }
}
