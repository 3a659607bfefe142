//! The device model and the allocation policies over it.

pub mod best_effort;
pub mod device_set;
pub mod links;
pub mod replica;

use std::collections::HashMap;

pub use device_set::{
    prefix_uuids, Alias, Chip, Device, DeviceSet, HealthState, HotplugEvent, Reconciler,
    ReplicaDevice, ReplicaDeviceMap, ReplicaEntry, ALIAS_SEPARATOR,
};
pub use links::{P2PLink, P2PLinkType};

/// Affinity ordinals between devices: `uuid -> peer uuid -> ordinal`.
pub type LinkMap = HashMap<String, HashMap<String, u32>>;

/// Inputs common to both allocation policies.
#[derive(Debug, Clone, Default)]
pub struct AllocateArgs {
    /// IDs the selection may draw from.
    pub available: Vec<String>,
    /// IDs that must be part of the selection.
    pub required: Vec<String>,
    /// Total size of the selection to return.
    pub size: usize,
}

/// An allocation policy. Selected by the replication factor: replicated
/// devices spread load across parents, unreplicated ones optimize
/// peer-to-peer affinity.
///
/// Every failure mode (too many required devices, required not available,
/// not enough candidates) yields an empty selection; the caller decides
/// whether that is an error.
pub enum Policy {
    BestEffort { links: LinkMap },
    Replica { devices: ReplicaDeviceMap },
}

impl Policy {
    pub fn allocate(&self, args: &AllocateArgs) -> Vec<String> {
        match self {
            Policy::BestEffort { links } => best_effort::allocate(links, args),
            Policy::Replica { devices } => replica::allocate(devices, args),
        }
    }
}
