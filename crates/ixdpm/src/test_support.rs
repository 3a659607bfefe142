//! Shared test doubles for the crate's unit tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use ixml::{ChipHandle, Health, IxmlError, Library, Result, TopologyLevel};

/// Description of one fake chip inside a [`MockLibrary`].
#[derive(Debug, Clone, Default)]
pub struct MockChipSpec {
    pub uuid: String,
    pub name: String,
    pub minor: u32,
    pub numa: Option<i64>,
    pub health_bits: u64,
    /// `(board id, position)`; `None` means board positions unsupported.
    pub board: Option<(u32, u32)>,
    /// Simulate a chip whose UUID cannot be read.
    pub fail_uuid: bool,
}

impl MockChipSpec {
    pub fn on_board(mut self, board: u32, position: u32) -> Self {
        self.board = Some((board, position));
        self
    }

    pub fn with_health_bits(mut self, bits: u64) -> Self {
        self.health_bits = bits;
        self
    }
}

/// In-memory [`Library`] implementation. Chip handles are indexes into the
/// chip table, so they stay valid across "rescans".
pub struct MockLibrary {
    chips: Mutex<Vec<MockChipSpec>>,
    topology: Mutex<HashMap<(String, String), TopologyLevel>>,
    scans: AtomicUsize,
}

impl MockLibrary {
    pub fn new(chips: Vec<MockChipSpec>) -> MockLibrary {
        MockLibrary {
            chips: Mutex::new(chips),
            topology: Mutex::new(HashMap::new()),
            scans: AtomicUsize::new(0),
        }
    }

    /// Declares a symmetric topology level between two chips (by UUID).
    pub fn set_topology(&mut self, a: &str, b: &str, level: TopologyLevel) {
        let mut topology = self.topology.lock().unwrap();
        topology.insert((a.to_string(), b.to_string()), level);
        topology.insert((b.to_string(), a.to_string()), level);
    }

    /// Number of `device_count` calls, i.e. rescans, so far.
    pub fn scan_count(&self) -> usize {
        self.scans.load(Ordering::SeqCst)
    }

    /// Flips a chip's health bits at runtime.
    pub fn set_health_bits(&self, uuid: &str, bits: u64) {
        let mut chips = self.chips.lock().unwrap();
        if let Some(chip) = chips.iter_mut().find(|c| c.uuid == uuid) {
            chip.health_bits = bits;
        }
    }

    fn chip<T>(&self, handle: ChipHandle, f: impl FnOnce(&MockChipSpec) -> T) -> Result<T> {
        let chips = self.chips.lock().unwrap();
        chips
            .get(handle.raw() as usize)
            .map(f)
            .ok_or(IxmlError::Call {
                call: "mock",
                status: -1,
            })
    }

    fn uuid_of(&self, handle: ChipHandle) -> Result<String> {
        self.chip(handle, |c| c.uuid.clone())
    }
}

impl Library for MockLibrary {
    fn init(&self) -> Result<()> {
        Ok(())
    }

    fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    fn device_count(&self) -> Result<u32> {
        self.scans.fetch_add(1, Ordering::SeqCst);
        Ok(self.chips.lock().unwrap().len() as u32)
    }

    fn device_by_index(&self, index: u32) -> Result<ChipHandle> {
        let chips = self.chips.lock().unwrap();
        if (index as usize) < chips.len() {
            Ok(ChipHandle::from_raw(index as u64))
        } else {
            Err(IxmlError::Call {
                call: "mock device_by_index",
                status: -1,
            })
        }
    }

    fn device_by_uuid(&self, uuid: &str) -> Result<ChipHandle> {
        let chips = self.chips.lock().unwrap();
        chips
            .iter()
            .position(|c| c.uuid == uuid)
            .map(|i| ChipHandle::from_raw(i as u64))
            .ok_or(IxmlError::Call {
                call: "mock device_by_uuid",
                status: -1,
            })
    }

    fn driver_version(&self) -> Result<String> {
        Ok("mock-driver".to_string())
    }

    fn cuda_version(&self) -> Result<String> {
        Ok("11.0".to_string())
    }

    fn name(&self, chip: ChipHandle) -> Result<String> {
        self.chip(chip, |c| c.name.clone())
    }

    fn uuid(&self, chip: ChipHandle) -> Result<String> {
        let fail = self.chip(chip, |c| c.fail_uuid)?;
        if fail {
            return Err(IxmlError::Call {
                call: "mock uuid",
                status: -1,
            });
        }
        self.uuid_of(chip)
    }

    fn index(&self, chip: ChipHandle) -> Result<u32> {
        Ok(chip.raw() as u32)
    }

    fn minor_number(&self, chip: ChipHandle) -> Result<u32> {
        self.chip(chip, |c| c.minor)
    }

    fn numa_node(&self, chip: ChipHandle) -> Result<Option<i64>> {
        self.chip(chip, |c| c.numa)
    }

    fn health(&self, chip: ChipHandle) -> Result<Health> {
        self.chip(chip, |c| Health::from_bits(c.health_bits))
    }

    fn topology_level(&self, a: ChipHandle, b: ChipHandle) -> Result<TopologyLevel> {
        let a = self.uuid_of(a)?;
        let b = self.uuid_of(b)?;
        self.topology
            .lock()
            .unwrap()
            .get(&(a, b))
            .copied()
            .ok_or(IxmlError::Call {
                call: "mock topology_level",
                status: -1,
            })
    }

    fn board_position(&self, chip: ChipHandle) -> Result<Option<u32>> {
        self.chip(chip, |c| c.board.map(|(_, position)| position))
    }

    fn on_same_board(&self, a: ChipHandle, b: ChipHandle) -> Result<bool> {
        let board_a = self.chip(a, |c| c.board.map(|(board, _)| board))?;
        let board_b = self.chip(b, |c| c.board.map(|(board, _)| board))?;
        Ok(board_a.is_some() && board_a == board_b)
    }
}
