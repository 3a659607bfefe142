//! The dlopen-based implementation of [`Library`].
//!
//! `libixml.so` ships with the CoreX driver stack and is not present on the
//! build host, so it is opened at runtime. Symbols are resolved on demand;
//! a missing library or entry point surfaces as a startup error.

use std::ffi::CString;
use std::os::raw::{c_char, c_int, c_uint, c_ulonglong, c_void};

use crate::{ChipHandle, Health, IxmlError, Library, Result, TopologyLevel};

const IXML_LIBRARY: &str = "libixml.so";

const IXML_SUCCESS: c_int = 0;
const IXML_ERROR_NOT_SUPPORTED: c_int = 3;

const NAME_BUFFER_SIZE: usize = 96;
const UUID_BUFFER_SIZE: usize = 96;
const VERSION_BUFFER_SIZE: usize = 80;

type RawHandle = *mut c_void;

/// Mirrors the library's `nvmlPciInfo_t` layout.
#[repr(C)]
struct PciInfo {
    bus_id_legacy: [c_char; 16],
    domain: c_uint,
    bus: c_uint,
    device: c_uint,
    pci_device_id: c_uint,
    pci_sub_system_id: c_uint,
    bus_id: [c_char; 32],
}

/// Runtime-loaded IXML library.
pub struct Ixml {
    lib: libloading::Library,
}

// Raw handles are plain pointers into library-owned state; the library is
// documented thread-safe after init.
unsafe impl Send for Ixml {}
unsafe impl Sync for Ixml {}

impl Ixml {
    /// Opens `libixml.so` from the default search path.
    pub fn load() -> Result<Self> {
        Self::load_from(IXML_LIBRARY)
    }

    /// Opens the library from an explicit path.
    pub fn load_from(path: &str) -> Result<Self> {
        let lib = unsafe { libloading::Library::new(path) }
            .map_err(|e| IxmlError::LibraryNotFound(format!("{}: {}", path, e)))?;
        Ok(Ixml { lib })
    }

    fn sym<'a, T>(&'a self, name: &'static [u8]) -> Result<libloading::Symbol<'a, T>> {
        unsafe { self.lib.get(name) }.map_err(|_| {
            IxmlError::SymbolNotFound(
                String::from_utf8_lossy(&name[..name.len() - 1]).into_owned(),
            )
        })
    }

    fn check(call: &'static str, status: c_int) -> Result<()> {
        if status == IXML_SUCCESS {
            Ok(())
        } else {
            Err(IxmlError::Call { call, status })
        }
    }

    fn buffer_to_string(call: &'static str, buf: &[c_char]) -> Result<String> {
        let bytes: Vec<u8> = buf
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        String::from_utf8(bytes).map_err(|_| IxmlError::MalformedString { call })
    }
}

impl Library for Ixml {
    fn init(&self) -> Result<()> {
        let f = self.sym::<unsafe extern "C" fn() -> c_int>(b"ixmlInit\0")?;
        Self::check("ixmlInit", unsafe { f() })
    }

    fn shutdown(&self) -> Result<()> {
        let f = self.sym::<unsafe extern "C" fn() -> c_int>(b"ixmlShutdown\0")?;
        Self::check("ixmlShutdown", unsafe { f() })
    }

    fn device_count(&self) -> Result<u32> {
        let f = self.sym::<unsafe extern "C" fn(*mut c_uint) -> c_int>(b"ixmlDeviceGetCount\0")?;
        let mut count: c_uint = 0;
        Self::check("ixmlDeviceGetCount", unsafe { f(&mut count) })?;
        Ok(count)
    }

    fn device_by_index(&self, index: u32) -> Result<ChipHandle> {
        let f = self.sym::<unsafe extern "C" fn(c_uint, *mut RawHandle) -> c_int>(
            b"ixmlDeviceGetHandleByIndex\0",
        )?;
        let mut handle: RawHandle = std::ptr::null_mut();
        Self::check("ixmlDeviceGetHandleByIndex", unsafe { f(index, &mut handle) })?;
        Ok(ChipHandle::from_raw(handle as u64))
    }

    fn device_by_uuid(&self, uuid: &str) -> Result<ChipHandle> {
        let f = self.sym::<unsafe extern "C" fn(*const c_char, *mut RawHandle) -> c_int>(
            b"ixmlDeviceGetHandleByUUID\0",
        )?;
        let uuid = CString::new(uuid).map_err(|_| IxmlError::MalformedString {
            call: "ixmlDeviceGetHandleByUUID",
        })?;
        let mut handle: RawHandle = std::ptr::null_mut();
        Self::check("ixmlDeviceGetHandleByUUID", unsafe {
            f(uuid.as_ptr(), &mut handle)
        })?;
        Ok(ChipHandle::from_raw(handle as u64))
    }

    fn driver_version(&self) -> Result<String> {
        let f = self.sym::<unsafe extern "C" fn(*mut c_char, c_uint) -> c_int>(
            b"ixmlSystemGetDriverVersion\0",
        )?;
        let mut buf = [0 as c_char; VERSION_BUFFER_SIZE];
        Self::check("ixmlSystemGetDriverVersion", unsafe {
            f(buf.as_mut_ptr(), VERSION_BUFFER_SIZE as c_uint)
        })?;
        Self::buffer_to_string("ixmlSystemGetDriverVersion", &buf)
    }

    fn cuda_version(&self) -> Result<String> {
        let f = self.sym::<unsafe extern "C" fn(*mut c_int) -> c_int>(
            b"ixmlSystemGetCudaDriverVersion\0",
        )?;
        let mut version: c_int = 0;
        Self::check("ixmlSystemGetCudaDriverVersion", unsafe { f(&mut version) })?;
        Ok(format!("{}.{}", version / 1000, version % 1000 / 10))
    }

    fn name(&self, chip: ChipHandle) -> Result<String> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_char, c_uint) -> c_int>(
            b"ixmlDeviceGetName\0",
        )?;
        let mut buf = [0 as c_char; NAME_BUFFER_SIZE];
        Self::check("ixmlDeviceGetName", unsafe {
            f(chip.raw() as RawHandle, buf.as_mut_ptr(), NAME_BUFFER_SIZE as c_uint)
        })?;
        Self::buffer_to_string("ixmlDeviceGetName", &buf)
    }

    fn uuid(&self, chip: ChipHandle) -> Result<String> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_char, c_uint) -> c_int>(
            b"ixmlDeviceGetUUID\0",
        )?;
        let mut buf = [0 as c_char; UUID_BUFFER_SIZE];
        Self::check("ixmlDeviceGetUUID", unsafe {
            f(chip.raw() as RawHandle, buf.as_mut_ptr(), UUID_BUFFER_SIZE as c_uint)
        })?;
        Self::buffer_to_string("ixmlDeviceGetUUID", &buf)
    }

    fn index(&self, chip: ChipHandle) -> Result<u32> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_uint) -> c_int>(
            b"ixmlDeviceGetIndex\0",
        )?;
        let mut index: c_uint = 0;
        Self::check("ixmlDeviceGetIndex", unsafe {
            f(chip.raw() as RawHandle, &mut index)
        })?;
        Ok(index)
    }

    fn minor_number(&self, chip: ChipHandle) -> Result<u32> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_uint) -> c_int>(
            b"ixmlDeviceGetMinorNumber\0",
        )?;
        let mut minor: c_uint = 0;
        Self::check("ixmlDeviceGetMinorNumber", unsafe {
            f(chip.raw() as RawHandle, &mut minor)
        })?;
        Ok(minor)
    }

    fn numa_node(&self, chip: ChipHandle) -> Result<Option<i64>> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut PciInfo) -> c_int>(
            b"ixmlDeviceGetPciInfo\0",
        )?;
        let mut pci = unsafe { std::mem::zeroed::<PciInfo>() };
        Self::check("ixmlDeviceGetPciInfo", unsafe {
            f(chip.raw() as RawHandle, &mut pci)
        })?;
        let bus_id = Self::buffer_to_string("ixmlDeviceGetPciInfo", &pci.bus_id_legacy)?;
        let path = format!("/sys/bus/pci/devices/{}/numa_node", bus_id.to_lowercase());
        let node = match std::fs::read_to_string(&path) {
            Ok(contents) => contents.trim().parse::<i64>().ok(),
            Err(_) => None,
        };
        Ok(node.filter(|&n| n >= 0))
    }

    fn health(&self, chip: ChipHandle) -> Result<Health> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_ulonglong) -> c_int>(
            b"ixmlDeviceGetHealth\0",
        )?;
        let mut mask: c_ulonglong = 0;
        Self::check("ixmlDeviceGetHealth", unsafe {
            f(chip.raw() as RawHandle, &mut mask)
        })?;
        Ok(Health::from_bits(mask))
    }

    fn topology_level(&self, a: ChipHandle, b: ChipHandle) -> Result<TopologyLevel> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, RawHandle, *mut c_uint) -> c_int>(
            b"ixmlDeviceGetTopologyCommonAncestor\0",
        )?;
        let mut level: c_uint = 0;
        Self::check("ixmlDeviceGetTopologyCommonAncestor", unsafe {
            f(a.raw() as RawHandle, b.raw() as RawHandle, &mut level)
        })?;
        TopologyLevel::from_raw(level).ok_or(IxmlError::Call {
            call: "ixmlDeviceGetTopologyCommonAncestor",
            status: level as c_int,
        })
    }

    fn board_position(&self, chip: ChipHandle) -> Result<Option<u32>> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, *mut c_uint) -> c_int>(
            b"ixmlDeviceGetBoardPosition\0",
        )?;
        let mut position: c_uint = 0;
        let status = unsafe { f(chip.raw() as RawHandle, &mut position) };
        if status == IXML_ERROR_NOT_SUPPORTED {
            return Ok(None);
        }
        Self::check("ixmlDeviceGetBoardPosition", status)?;
        Ok(Some(position))
    }

    fn on_same_board(&self, a: ChipHandle, b: ChipHandle) -> Result<bool> {
        let f = self.sym::<unsafe extern "C" fn(RawHandle, RawHandle, *mut c_int) -> c_int>(
            b"ixmlDeviceOnSameBoard\0",
        )?;
        let mut on_same_board: c_int = 0;
        Self::check("ixmlDeviceOnSameBoard", unsafe {
            f(a.raw() as RawHandle, b.raw() as RawHandle, &mut on_same_board)
        })?;
        Ok(on_same_board == 1)
    }
}
