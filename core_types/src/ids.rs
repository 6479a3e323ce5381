//! Unique identifiers for kernel entities

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier of a kernel object
///
/// Object ids are handed out by the kernel from a monotonic counter and are
/// never reused for the lifetime of the emulated machine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ObjectId(u64);

impl ObjectId {
    /// The reserved "no object" id
    pub const NONE: ObjectId = ObjectId(0);

    /// Creates an object id from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns true if this is the reserved "no object" id
    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}

/// A small integer naming a kernel object inside one handle table
///
/// Handles with [`Handle::GLOBAL_FLAG`] set live in the kernel-wide table;
/// all other handles are local to the owning process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Handle(u32);

impl Handle {
    /// Marks a handle as belonging to the kernel-wide table
    pub const GLOBAL_FLAG: u32 = 0x8000;

    /// Creates a handle from its raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Creates a handle for the given table slot
    pub const fn new(index: u32, global: bool) -> Self {
        let raw = index + 1;
        if global {
            Self(raw | Self::GLOBAL_FLAG)
        } else {
            Self(raw)
        }
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> u32 {
        self.0
    }

    /// Returns true if the handle lives in the kernel-wide table
    pub const fn is_global(&self) -> bool {
        self.0 & Self::GLOBAL_FLAG != 0
    }

    /// Returns the table slot, or None for the null handle
    pub const fn index(&self) -> Option<u32> {
        let raw = self.0 & !Self::GLOBAL_FLAG;
        if raw == 0 {
            None
        } else {
            Some(raw - 1)
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_global() {
            write!(f, "ghandle:{:#x}", self.0)
        } else {
            write!(f, "handle:{:#x}", self.0)
        }
    }
}

/// Identifier of one virtual address space
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct AddressSpaceId(u32);

impl AddressSpaceId {
    /// Creates an address space id from its raw value
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Returns the raw value
    pub const fn as_raw(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "aspace:{}", self.0)
    }
}

/// Identity of one emulated machine instance
///
/// Written into every state snapshot so a restored stream can tell which
/// machine produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineId(Uuid);

impl MachineId {
    /// Creates a new random machine ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a machine ID from a UUID
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Creates a machine ID from raw UUID bytes
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    /// Returns the inner UUID
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }

    /// Returns the raw UUID bytes
    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for MachineId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MachineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Machine({})", self.0)
    }
}

/// The numeric uid triple identifying a process image
///
/// `uid1` names the image kind (executable), `uid2` the application type
/// and `uid3` the instance (the process uid proper).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProcessUidType {
    pub uid1: u32,
    pub uid2: u32,
    pub uid3: u32,
}

impl ProcessUidType {
    /// uid1 shared by every executable image
    pub const EXECUTABLE_UID1: u32 = 0x1000_007A;
    /// uid2 reported for every running process
    pub const PROCESS_UID2: u32 = 0x1000_39CE;

    pub const fn new(uid1: u32, uid2: u32, uid3: u32) -> Self {
        Self { uid1, uid2, uid3 }
    }

    /// The triple a running process reports for the given process uid
    pub const fn for_process(puid: u32) -> Self {
        Self::new(Self::EXECUTABLE_UID1, Self::PROCESS_UID2, puid)
    }
}

impl fmt::Display for ProcessUidType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:08x}, {:08x}, {:08x}]", self.uid1, self.uid2, self.uid3)
    }
}

/// Kind tag of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectType {
    Process,
    Thread,
    Mutex,
    Chunk,
}

impl ObjectType {
    /// Stable numeric tag used by the state stream
    pub const fn tag(&self) -> u8 {
        match self {
            ObjectType::Process => 1,
            ObjectType::Thread => 2,
            ObjectType::Mutex => 3,
            ObjectType::Chunk => 4,
        }
    }

    /// Inverse of [`ObjectType::tag`]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(ObjectType::Process),
            2 => Some(ObjectType::Thread),
            3 => Some(ObjectType::Mutex),
            4 => Some(ObjectType::Chunk),
            _ => None,
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectType::Process => write!(f, "Process"),
            ObjectType::Thread => write!(f, "Thread"),
            ObjectType::Mutex => write!(f, "Mutex"),
            ObjectType::Chunk => write!(f, "Chunk"),
        }
    }
}

/// Visibility of a kernel object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AccessType {
    /// Only reachable through the owning process's handles
    #[default]
    Local,
    /// Reachable kernel-wide
    Global,
}
