//! Typed access to the Iluvatar CoreX management library (IXML).
//!
//! IXML is the vendor management library for CoreX accelerators, exposing
//! roughly the same surface as NVML does for NVIDIA hardware. Everything the
//! device plugin needs from it is captured by the [`Library`] trait so that
//! the rest of the code base can run against a mock in tests. The real
//! implementation, [`Ixml`], loads `libixml.so` at runtime and resolves
//! symbols on demand; see the `sys` module.

mod health;
mod sys;
mod topology;

pub use health::{Health, HealthError};
pub use sys::Ixml;
pub use topology::TopologyLevel;

/// Convenience alias for results produced by this crate.
pub type Result<T> = std::result::Result<T, IxmlError>;

/// Errors surfaced by the IXML adapter.
///
/// Per-call failures carry the name of the IXML entry point and the raw
/// status code it returned, which is what ends up in the plugin logs when a
/// chip goes away between a scan and a sample.
#[derive(Debug, thiserror::Error)]
pub enum IxmlError {
    /// The shared library could not be opened at all.
    #[error("IXML library could not be loaded: {0}")]
    LibraryNotFound(String),

    /// The library loaded but is missing an expected entry point.
    #[error("symbol `{0}` not found in the IXML library")]
    SymbolNotFound(String),

    /// An IXML call returned a non-success status.
    #[error("{call} failed with status {status}")]
    Call { call: &'static str, status: i32 },

    /// A string returned by the library was not valid UTF-8.
    #[error("{call} returned a malformed string")]
    MalformedString { call: &'static str },
}

/// An opaque per-chip handle.
///
/// Handles are only meaningful to the [`Library`] that produced them and may
/// be invalidated by hot-plug events; the reconciler re-acquires handles on
/// every rescan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChipHandle(u64);

impl ChipHandle {
    pub fn from_raw(raw: u64) -> Self {
        ChipHandle(raw)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// The capability set the device plugin consumes from IXML.
///
/// Module-level operations (`init`, `shutdown`, counting and handle lookup)
/// and per-chip attribute queries. Implementations must be safe to call from
/// multiple tasks at once; IXML itself is thread-safe after `init`.
pub trait Library: Send + Sync {
    fn init(&self) -> Result<()>;
    fn shutdown(&self) -> Result<()>;

    fn device_count(&self) -> Result<u32>;
    fn device_by_index(&self, index: u32) -> Result<ChipHandle>;
    fn device_by_uuid(&self, uuid: &str) -> Result<ChipHandle>;

    fn driver_version(&self) -> Result<String>;
    fn cuda_version(&self) -> Result<String>;

    fn name(&self, chip: ChipHandle) -> Result<String>;
    fn uuid(&self, chip: ChipHandle) -> Result<String>;
    fn index(&self, chip: ChipHandle) -> Result<u32>;
    fn minor_number(&self, chip: ChipHandle) -> Result<u32>;

    /// NUMA node the chip is attached to, `None` when the platform does not
    /// report one.
    fn numa_node(&self, chip: ChipHandle) -> Result<Option<i64>>;

    /// Raw health bitmask for the chip. Decode with [`Health::errors`].
    fn health(&self, chip: ChipHandle) -> Result<Health>;

    /// P2P topology level between two chips.
    fn topology_level(&self, a: ChipHandle, b: ChipHandle) -> Result<TopologyLevel>;

    /// Position of the chip on its carrier board. `None` when the hardware
    /// has no notion of board positions (single-chip cards).
    fn board_position(&self, chip: ChipHandle) -> Result<Option<u32>>;

    /// Whether two chips sit on the same carrier board.
    fn on_same_board(&self, a: ChipHandle, b: ChipHandle) -> Result<bool>;
}
