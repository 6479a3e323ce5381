//! # Core Types
//!
//! This crate defines the fundamental types shared by every part of the
//! emulated kernel.
//!
//! ## Key Types
//!
//! - [`ObjectId`]: Unique, never reused identifier of a kernel object
//! - [`Handle`]: Owner-scoped reference to a kernel object
//! - [`ProcessUidType`]: The uid triple identifying a process image
//! - [`Protection`], [`ChunkType`], [`MemoryModelKind`]: Guest memory vocabulary
//! - [`CapabilitySet`], [`SecurityInfo`], [`SecurityPolicy`]: Platform security

pub mod capability;
pub mod ids;
pub mod memory;

pub use capability::{
    capability_to_string, Capability, CapabilityError, CapabilitySet, SecurityInfo,
    SecurityPolicy, CAP_LIMIT,
};
pub use ids::{
    AccessType, AddressSpaceId, Handle, MachineId, ObjectId, ObjectType, ProcessUidType,
};
pub use memory::{
    is_page_aligned, page_align_up, ChunkAccess, ChunkAttrib, ChunkType, MemoryError,
    MemoryModelKind, Protection, VmAddress, PAGE_SIZE,
};
