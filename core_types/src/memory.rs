//! # Memory Types
//!
//! This module defines the guest memory vocabulary shared by the kernel,
//! the memory system and CPU backends.
//!
//! ## Key Types
//!
//! - [`VmAddress`]: A 32-bit guest virtual address
//! - [`Protection`]: Read/write/execute flags of a mapping
//! - [`ChunkType`], [`ChunkAccess`], [`ChunkAttrib`]: How a chunk is laid out and who may see it
//! - [`MemoryModelKind`]: Which memory model places the fixed guest regions
//! - [`MemoryError`]: Allocation and translation failures

use crate::ids::{AddressSpaceId, ObjectId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// A guest virtual address
pub type VmAddress = u32;

/// Size of one guest page
pub const PAGE_SIZE: u32 = 0x1000;

/// Start of the process-local data area
pub const LOCAL_DATA: VmAddress = 0x0040_0000;
/// Start of the DLL static data area (moving and multiple models)
pub const DLL_STATIC_DATA: VmAddress = 0x3800_0000;
/// Start of the DLL static data area for the legacy memory map
pub const DLL_STATIC_DATA_EKA1: VmAddress = 0x3C00_0000;
/// Start of the DLL static data area (flexible model)
pub const DLL_STATIC_DATA_FLEXIBLE: VmAddress = 0x3E00_0000;
/// Start of the shared data area
pub const SHARED_DATA: VmAddress = 0x4000_0000;
/// Start of the RAM-loaded code area
pub const RAM_CODE: VmAddress = 0x7000_0000;
/// Offset of the ROM BSS shadow inside the DLL static data area
pub const ROM_BSS_START_OFFSET: VmAddress = 0x1000;
/// Largest ROM BSS shadow a process may carry
pub const MAX_ROM_BSS_SECT_SIZE: u32 = 0x10000;

/// Rounds a size up to a whole number of pages
pub const fn page_align_up(size: u32) -> u32 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// Returns true if the address sits on a page boundary
pub const fn is_page_aligned(addr: VmAddress) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

/// Memory protection flags
///
/// By default, no permissions are granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Protection {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
}

impl Protection {
    /// No permissions
    pub const fn none() -> Self {
        Self {
            read: false,
            write: false,
            execute: false,
        }
    }

    /// Read-only permission
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            execute: false,
        }
    }

    /// Read and write permissions
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            execute: false,
        }
    }

    /// Read and execute permissions (typical for code)
    pub const fn read_execute() -> Self {
        Self {
            read: true,
            write: false,
            execute: true,
        }
    }

    /// All permissions
    pub const fn all() -> Self {
        Self {
            read: true,
            write: true,
            execute: true,
        }
    }

    /// Packs the flags into the low three bits
    pub const fn bits(&self) -> u8 {
        (self.read as u8) | ((self.write as u8) << 1) | ((self.execute as u8) << 2)
    }

    /// Inverse of [`Protection::bits`]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            read: bits & 1 != 0,
            write: bits & 2 != 0,
            execute: bits & 4 != 0,
        }
    }

    /// Check if this has no permissions
    pub fn is_none(&self) -> bool {
        !self.read && !self.write && !self.execute
    }
}

impl fmt::Display for Protection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { "R" } else { "-" },
            if self.write { "W" } else { "-" },
            if self.execute { "X" } else { "-" }
        )
    }
}

/// Layout of a chunk's committed memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChunkType {
    /// Committed from the bottom up
    #[default]
    Normal,
    /// Committed region floats between a bottom and a top offset
    DoubleEnded,
    /// Pages are committed independently
    Disconnected,
}

/// Purpose and visibility of a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChunkAccess {
    /// Private data of one process
    #[default]
    Local,
    /// Shared between processes
    Global,
    /// Loaded code
    Code,
    /// DLL static data and the ROM BSS shadow
    DllStaticData,
    /// Kernel-side mapping
    KernelMapping,
}

/// Extra chunk attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ChunkAttrib {
    #[default]
    None,
    /// The chunk has no name visible to the guest
    Anonymous,
}

/// Memory model of the emulated platform
///
/// The model decides where fixed regions such as the ROM BSS shadow live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MemoryModelKind {
    Moving,
    #[default]
    Multiple,
    Flexible,
}

impl MemoryModelKind {
    /// Fixed address of the ROM BSS shadow chunk of every process
    pub const fn rom_bss_address(&self, eka1_memory_map: bool) -> VmAddress {
        match self {
            MemoryModelKind::Moving | MemoryModelKind::Multiple => {
                (if eka1_memory_map {
                    DLL_STATIC_DATA_EKA1
                } else {
                    DLL_STATIC_DATA
                }) + ROM_BSS_START_OFFSET
            }
            MemoryModelKind::Flexible => DLL_STATIC_DATA_FLEXIBLE + ROM_BSS_START_OFFSET,
        }
    }

    /// Range searched when a chunk is created without a fixed address
    pub const fn local_data_range(&self) -> Range<VmAddress> {
        LOCAL_DATA..DLL_STATIC_DATA
    }

    pub const fn name(&self) -> &'static str {
        match self {
            MemoryModelKind::Moving => "moving",
            MemoryModelKind::Multiple => "multiple",
            MemoryModelKind::Flexible => "flexible",
        }
    }
}

impl fmt::Display for MemoryModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Memory-related errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MemoryError {
    #[error("Address space not found: {0}")]
    AddressSpaceNotFound(AddressSpaceId),

    #[error("Chunk not mapped: {0}")]
    ChunkNotMapped(ObjectId),

    #[error("Invalid chunk size: {0:#x} bytes")]
    InvalidSize(u32),

    #[error("Address {0:#x} is not page aligned")]
    Misaligned(VmAddress),

    #[error("Region [{base:#x}, +{size:#x}) overlaps an existing mapping")]
    Overlap { base: VmAddress, size: u32 },

    #[error("Address space exhausted: no free range of {requested:#x} bytes")]
    Exhausted { requested: u32 },

    #[error("Commit [{offset:#x}, +{size:#x}) outside chunk of {max_size:#x} bytes")]
    CommitOutOfRange { offset: u32, size: u32, max_size: u32 },

    #[error("Address {0:#x} is not mapped")]
    Unmapped(VmAddress),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protection_none() {
        let prot = Protection::none();
        assert!(prot.is_none());
        assert_eq!(prot.to_string(), "---");
    }

    #[test]
    fn test_protection_display() {
        assert_eq!(Protection::read_only().to_string(), "R--");
        assert_eq!(Protection::read_write().to_string(), "RW-");
        assert_eq!(Protection::read_execute().to_string(), "R-X");
        assert_eq!(Protection::all().to_string(), "RWX");
    }

    #[test]
    fn test_protection_bits() {
        let prot = Protection::read_execute();
        assert_eq!(prot.bits(), 0b101);
        assert_eq!(Protection::from_bits(prot.bits()), prot);
    }

    #[test]
    fn test_page_align_up() {
        assert_eq!(page_align_up(0), 0);
        assert_eq!(page_align_up(1), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE), PAGE_SIZE);
        assert_eq!(page_align_up(PAGE_SIZE + 1), 2 * PAGE_SIZE);
        assert!(is_page_aligned(0x2000));
        assert!(!is_page_aligned(0x2004));
    }

    #[test]
    fn test_rom_bss_address_per_model() {
        assert_eq!(
            MemoryModelKind::Multiple.rom_bss_address(false),
            DLL_STATIC_DATA + ROM_BSS_START_OFFSET
        );
        assert_eq!(
            MemoryModelKind::Moving.rom_bss_address(true),
            DLL_STATIC_DATA_EKA1 + ROM_BSS_START_OFFSET
        );
        // The flexible model ignores the legacy map flag
        assert_eq!(
            MemoryModelKind::Flexible.rom_bss_address(true),
            MemoryModelKind::Flexible.rom_bss_address(false)
        );
    }

    #[test]
    fn test_rom_bss_outside_local_data() {
        for model in [
            MemoryModelKind::Moving,
            MemoryModelKind::Multiple,
            MemoryModelKind::Flexible,
        ] {
            let range = model.local_data_range();
            assert!(!range.contains(&model.rom_bss_address(false)));
        }
    }

    #[test]
    fn test_memory_error_display() {
        let err = MemoryError::Overlap {
            base: 0x40_0000,
            size: 0x1000,
        };
        assert!(err.to_string().contains("overlaps"));

        let err = MemoryError::Exhausted { requested: 0x1000 };
        assert!(err.to_string().contains("exhausted"));
    }
}
