//! Chunk kernel object
//!
//! A chunk is the kernel-side record of one mapping in a process's address
//! space. The bytes themselves live in the [`MemorySystem`]; the chunk keeps
//! the attributes the guest can query and the committed window.
//!
//! [`MemorySystem`]: crate::address_space::MemorySystem

use crate::kernel::KernelSystem;
use crate::object::ObjectHeader;
use core_types::{
    AddressSpaceId, ChunkAccess, ChunkAttrib, ChunkType, ObjectId, Protection, VmAddress,
};
use kernel_api::KernelError;
use state_stream::StateStream;

/// Where a new chunk should be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// First free range at or above the hint inside the local data area
    Near(VmAddress),
    /// Exactly at the given address, or fail
    Fixed(VmAddress),
}

/// Parameters for creating a chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkCreateInfo {
    pub name: String,
    pub max_size: u32,
    /// Offset of the first committed byte
    pub bottom: u32,
    /// Offset one past the last committed byte
    pub top: u32,
    pub protection: Protection,
    pub chunk_type: ChunkType,
    pub access: ChunkAccess,
    pub attrib: ChunkAttrib,
    pub placement: Placement,
}

impl ChunkCreateInfo {
    /// Read-write normal chunk with nothing committed
    pub fn new(name: impl Into<String>, max_size: u32) -> Self {
        Self {
            name: name.into(),
            max_size,
            bottom: 0,
            top: 0,
            protection: Protection::read_write(),
            chunk_type: ChunkType::Normal,
            access: ChunkAccess::Local,
            attrib: ChunkAttrib::None,
            placement: Placement::Near(0),
        }
    }

    pub fn committed(mut self, bottom: u32, top: u32) -> Self {
        self.bottom = bottom;
        self.top = top;
        self
    }

    pub fn protection(mut self, protection: Protection) -> Self {
        self.protection = protection;
        self
    }

    pub fn chunk_type(mut self, chunk_type: ChunkType) -> Self {
        self.chunk_type = chunk_type;
        self
    }

    pub fn access(mut self, access: ChunkAccess) -> Self {
        self.access = access;
        self
    }

    pub fn attrib(mut self, attrib: ChunkAttrib) -> Self {
        self.attrib = attrib;
        self
    }

    /// Places the chunk at exactly `addr`
    pub fn at(mut self, addr: VmAddress) -> Self {
        self.placement = Placement::Fixed(addr);
        self
    }

    /// Places the chunk at the first free range at or above `hint`
    pub fn near(mut self, hint: VmAddress) -> Self {
        self.placement = Placement::Near(hint);
        self
    }

    /// Size of the initially committed window
    pub fn committed_size(&self) -> u32 {
        self.top.saturating_sub(self.bottom)
    }
}

#[derive(Debug, Clone, Default)]
pub struct Chunk {
    pub header: ObjectHeader,
    pub base: VmAddress,
    pub max_size: u32,
    pub bottom: u32,
    pub top: u32,
    pub protection: Protection,
    pub chunk_type: ChunkType,
    pub access: ChunkAccess,
    pub attrib: ChunkAttrib,
    pub address_space: AddressSpaceId,
}

impl Chunk {
    pub fn new(
        header: ObjectHeader,
        info: &ChunkCreateInfo,
        address_space: AddressSpaceId,
        base: VmAddress,
    ) -> Self {
        Self {
            header,
            base,
            max_size: info.max_size,
            bottom: info.bottom,
            top: info.top,
            protection: info.protection,
            chunk_type: info.chunk_type,
            access: info.access,
            attrib: info.attrib,
            address_space,
        }
    }

    pub fn committed_size(&self) -> u32 {
        self.top.saturating_sub(self.bottom)
    }

    /// Returns true if `addr` falls inside the reserved range
    pub fn contains(&self, addr: VmAddress) -> bool {
        addr >= self.base && addr - self.base < self.max_size
    }

    /// One past the last reserved address
    pub fn end(&self) -> u64 {
        self.base as u64 + self.max_size as u64
    }

    /// Widens the committed window to cover `[offset, end)`
    fn note_commit(&mut self, offset: u32, end: u32) {
        if self.committed_size() == 0 {
            self.bottom = offset;
            self.top = end;
        } else {
            self.bottom = self.bottom.min(offset);
            self.top = self.top.max(end);
        }
    }

    /// Shrinks the committed window after `[offset, end)` was released
    ///
    /// Holes in the middle of the window leave it unchanged.
    fn note_decommit(&mut self, offset: u32, end: u32) {
        if offset <= self.bottom && end >= self.top {
            self.top = self.bottom;
        } else if end >= self.top && offset > self.bottom {
            self.top = self.top.min(offset);
        } else if offset <= self.bottom && end > self.bottom {
            self.bottom = end;
        }
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Chunk", 1, |s| {
            s.absorb(&mut self.base);
            s.absorb(&mut self.max_size);
            s.absorb(&mut self.bottom);
            s.absorb(&mut self.top);

            let mut protection = self.protection.bits();
            s.absorb(&mut protection);
            self.protection = Protection::from_bits(protection);

            let mut chunk_type = match self.chunk_type {
                ChunkType::Normal => 0u8,
                ChunkType::DoubleEnded => 1,
                ChunkType::Disconnected => 2,
            };
            s.absorb(&mut chunk_type);
            self.chunk_type = match chunk_type {
                1 => ChunkType::DoubleEnded,
                2 => ChunkType::Disconnected,
                _ => ChunkType::Normal,
            };

            let mut access = match self.access {
                ChunkAccess::Local => 0u8,
                ChunkAccess::Global => 1,
                ChunkAccess::Code => 2,
                ChunkAccess::DllStaticData => 3,
                ChunkAccess::KernelMapping => 4,
            };
            s.absorb(&mut access);
            self.access = match access {
                1 => ChunkAccess::Global,
                2 => ChunkAccess::Code,
                3 => ChunkAccess::DllStaticData,
                4 => ChunkAccess::KernelMapping,
                _ => ChunkAccess::Local,
            };

            let mut anonymous = self.attrib == ChunkAttrib::Anonymous;
            s.absorb(&mut anonymous);
            self.attrib = if anonymous {
                ChunkAttrib::Anonymous
            } else {
                ChunkAttrib::None
            };

            s.absorb(&mut self.address_space);
        });
    }
}

impl KernelSystem {
    /// Commits `[offset, offset + size)` of a chunk
    pub fn commit_chunk(
        &mut self,
        chunk: ObjectId,
        offset: u32,
        size: u32,
    ) -> Result<(), KernelError> {
        self.get::<Chunk>(chunk)?;
        self.memory.commit(chunk, offset, size)?;
        self.get_mut::<Chunk>(chunk)?
            .note_commit(offset, offset.saturating_add(size));
        Ok(())
    }

    /// Decommits `[offset, offset + size)` of a chunk; the contents are lost
    pub fn decommit_chunk(
        &mut self,
        chunk: ObjectId,
        offset: u32,
        size: u32,
    ) -> Result<(), KernelError> {
        self.get::<Chunk>(chunk)?;
        self.memory.decommit(chunk, offset, size)?;
        self.get_mut::<Chunk>(chunk)?
            .note_decommit(offset, offset.saturating_add(size));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::Process;
    use core_types::{AccessType, MemoryError};

    fn header() -> ObjectHeader {
        ObjectHeader::new(
            ObjectId::from_raw(3),
            "RomBssChunkProcess1",
            ObjectId::from_raw(1),
            AccessType::Local,
        )
    }

    #[test]
    fn test_create_info_builder() {
        let info = ChunkCreateInfo::new("heap", 0x10000)
            .committed(0, 0x2000)
            .access(ChunkAccess::DllStaticData)
            .at(0x3800_1000);
        assert_eq!(info.committed_size(), 0x2000);
        assert_eq!(info.placement, Placement::Fixed(0x3800_1000));
        assert_eq!(info.protection, Protection::read_write());
    }

    #[test]
    fn test_contains() {
        let info = ChunkCreateInfo::new("data", 0x2000);
        let chunk = Chunk::new(header(), &info, AddressSpaceId::from_raw(1), 0x40_0000);
        assert!(chunk.contains(0x40_0000));
        assert!(chunk.contains(0x40_1fff));
        assert!(!chunk.contains(0x40_2000));
        assert!(!chunk.contains(0x3f_ffff));
    }

    #[test]
    fn test_state_round_trip() {
        let info = ChunkCreateInfo::new("code", 0x4000)
            .committed(0, 0x1000)
            .protection(Protection::read_execute())
            .chunk_type(ChunkType::Disconnected)
            .access(ChunkAccess::Code)
            .attrib(ChunkAttrib::Anonymous);
        let mut chunk = Chunk::new(header(), &info, AddressSpaceId::from_raw(2), 0x7000_0000);

        let mut out = StateStream::writer();
        chunk.do_state(&mut out);

        let mut restored = Chunk::default();
        restored.do_state(&mut StateStream::reader(out.into_bytes()));
        assert_eq!(restored.base, 0x7000_0000);
        assert_eq!(restored.protection, Protection::read_execute());
        assert_eq!(restored.chunk_type, ChunkType::Disconnected);
        assert_eq!(restored.access, ChunkAccess::Code);
        assert_eq!(restored.attrib, ChunkAttrib::Anonymous);
        assert_eq!(restored.address_space, AddressSpaceId::from_raw(2));
        assert_eq!(restored.committed_size(), 0x1000);
    }

    #[test]
    fn test_commit_and_decommit_track_window() {
        let mut kern = KernelSystem::new();
        let p = kern.create_process("app", "C:\\app.exe", "").unwrap();
        let space = kern.get::<Process>(p).unwrap().address_space;
        let info = ChunkCreateInfo::new("heap", 0x10000).committed(0, 0x1000);
        let chunk = kern.create_chunk(p, space, &info).unwrap();
        let base = kern.memory().chunk_base(chunk).unwrap();
        assert!(!kern.memory_mut().is_committed(space, base + 0x2000));

        kern.commit_chunk(chunk, 0x1000, 0x2000).unwrap();
        assert!(kern.memory_mut().is_committed(space, base + 0x2000));
        assert_eq!(kern.memory().committed_size(chunk), Some(0x3000));
        let c = kern.get::<Chunk>(chunk).unwrap();
        assert_eq!((c.bottom, c.top), (0, 0x3000));

        kern.decommit_chunk(chunk, 0x2000, 0x1000).unwrap();
        assert!(!kern.memory_mut().is_committed(space, base + 0x2000));
        assert_eq!(kern.get::<Chunk>(chunk).unwrap().top, 0x2000);
    }

    #[test]
    fn test_commit_outside_chunk_fails() {
        let mut kern = KernelSystem::new();
        let p = kern.create_process("app", "C:\\app.exe", "").unwrap();
        let space = kern.get::<Process>(p).unwrap().address_space;
        let chunk = kern
            .create_chunk(p, space, &ChunkCreateInfo::new("data", 0x4000))
            .unwrap();

        assert!(matches!(
            kern.commit_chunk(chunk, 0x3000, 0x2000),
            Err(KernelError::Memory(MemoryError::CommitOutOfRange { .. }))
        ));
        assert_eq!(kern.get::<Chunk>(chunk).unwrap().committed_size(), 0);
        assert!(kern
            .commit_chunk(ObjectId::from_raw(999), 0, 0x1000)
            .unwrap_err()
            .is_not_found());
    }
}
