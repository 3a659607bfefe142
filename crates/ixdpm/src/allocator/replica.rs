//! Fair-share selection for time-sliced replicas.
//!
//! Extras are picked one at a time from the parent device with the fewest
//! replicas in use (`total - avail`), re-sorting stably between picks and
//! popping each parent's replica queue in ordinal order, so the result is
//! deterministic.

use std::collections::{BTreeMap, HashSet, VecDeque};

use tracing::warn;

use super::{Alias, AllocateArgs, ReplicaDeviceMap};

struct Slot {
    total: usize,
    avail: usize,
    queue: VecDeque<String>,
}

pub fn allocate(devices: &ReplicaDeviceMap, args: &AllocateArgs) -> Vec<String> {
    if args.required.len() > args.size {
        warn!(
            required = args.required.len(),
            size = args.size,
            "more required replicas than the allocation size"
        );
        return Vec::new();
    }

    let available: HashSet<&str> = args.available.iter().map(String::as_str).collect();
    for id in &args.required {
        if !available.contains(id.as_str()) || !devices.contains(id) {
            warn!(replica = %id, "required replica is not available");
            return Vec::new();
        }
    }

    let candidates = devices
        .subset(&args.available)
        .difference(&devices.subset(&args.required));

    let needed = args.size - args.required.len();
    if candidates.len() < needed {
        warn!(
            candidates = candidates.len(),
            needed, "not enough replicas left to satisfy the allocation"
        );
        return Vec::new();
    }

    // Group the candidates by parent device, replica queues in ordinal
    // order. BTreeMap gives the stable UUID-ordered seed.
    let mut slots: BTreeMap<String, Slot> = BTreeMap::new();
    for (id, entry) in candidates.iter() {
        let slot = slots.entry(entry.parent_uuid.clone()).or_insert(Slot {
            total: entry.parent_replicas,
            avail: 0,
            queue: VecDeque::new(),
        });
        slot.avail += 1;
        slot.queue.push_back(id.clone());
    }
    for slot in slots.values_mut() {
        let mut sorted: Vec<String> = slot.queue.drain(..).collect();
        sorted.sort_by_key(|id| {
            let ordinal = Alias(id).suffix().and_then(|s| s.parse::<usize>().ok());
            (ordinal, id.clone())
        });
        slot.queue = sorted.into();
    }

    let mut order: Vec<String> = slots.keys().cloned().collect();
    let mut result = Vec::with_capacity(args.size);
    for _ in 0..needed {
        order.sort_by_key(|uuid| {
            let slot = &slots[uuid];
            slot.total - slot.avail
        });
        let winner = match order.iter().find(|uuid| !slots[*uuid].queue.is_empty()) {
            Some(uuid) => uuid.clone(),
            None => break,
        };
        if let Some(slot) = slots.get_mut(&winner) {
            if let Some(id) = slot.queue.pop_front() {
                slot.avail -= 1;
                result.push(id);
            }
        }
    }

    result.extend(args.required.iter().cloned());
    result
}
