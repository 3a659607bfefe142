//! P2P topology levels reported by IXML.

/// Common-ancestor topology level between two chips.
///
/// Discriminants match the library's enum (which mirrors
/// `nvmlGpuTopologyLevel_t`), with gaps left for intermediate levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum TopologyLevel {
    /// Same board, direct interconnect.
    Internal = 0,
    /// A single PCIe bridge between the chips.
    Single = 10,
    /// Multiple PCIe bridges, same host bridge.
    Multiple = 20,
    /// Same host bridge.
    HostBridge = 30,
    /// Same CPU socket (NUMA node).
    Node = 40,
    /// Across CPU sockets.
    System = 50,
}

impl TopologyLevel {
    /// Maps a raw library value back into a level. Unknown values yield
    /// `None`; callers treat that as "no link".
    pub fn from_raw(raw: u32) -> Option<TopologyLevel> {
        match raw {
            0 => Some(TopologyLevel::Internal),
            10 => Some(TopologyLevel::Single),
            20 => Some(TopologyLevel::Multiple),
            30 => Some(TopologyLevel::HostBridge),
            40 => Some(TopologyLevel::Node),
            50 => Some(TopologyLevel::System),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_round_trip() {
        for level in [
            TopologyLevel::Internal,
            TopologyLevel::Single,
            TopologyLevel::Multiple,
            TopologyLevel::HostBridge,
            TopologyLevel::Node,
            TopologyLevel::System,
        ] {
            assert_eq!(TopologyLevel::from_raw(level as u32), Some(level));
        }
        assert_eq!(TopologyLevel::from_raw(15), None);
    }
}
