//! Guest memory system
//!
//! Every process owns one [`AddressSpace`]. A space is a set of
//! non-overlapping mappings, each backing exactly one chunk kernel object.
//! A mapping reserves `max_size` bytes of guest address range and tracks
//! which of its pages are committed; only committed pages are visible
//! through host translation.
//!
//! The memory model decides where fixed regions live (see
//! [`MemoryModelKind::rom_bss_address`]); chunks created without a fixed
//! address are placed first-fit inside the model's local data range.

use crate::chunk::{ChunkCreateInfo, Placement};
use core_types::{
    is_page_aligned, page_align_up, AddressSpaceId, MemoryError, MemoryModelKind, ObjectId,
    Protection, VmAddress, PAGE_SIZE,
};
use hal::AddressTranslator;
use serde::{Deserialize, Serialize};
use state_stream::StateStream;
use std::collections::BTreeMap;

/// Memory system audit events (test-only)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AddressSpaceEvent {
    SpaceCreated {
        space: AddressSpaceId,
        owner: ObjectId,
    },
    ChunkMapped {
        space: AddressSpaceId,
        chunk: ObjectId,
        base: VmAddress,
        max_size: u32,
        protection: Protection,
    },
    ChunkUnmapped {
        space: AddressSpaceId,
        chunk: ObjectId,
    },
    Committed {
        chunk: ObjectId,
        offset: u32,
        size: u32,
    },
    Decommitted {
        chunk: ObjectId,
        offset: u32,
        size: u32,
    },
    /// A mapping request was refused
    MapFailed {
        space: AddressSpaceId,
        error: String,
    },
    SpaceDestroyed {
        space: AddressSpaceId,
    },
}

/// Audit log for memory system operations
#[derive(Debug, Clone)]
pub struct AddressSpaceAuditLog {
    events: Vec<AddressSpaceEvent>,
}

impl AddressSpaceAuditLog {
    pub fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn record(&mut self, event: AddressSpaceEvent) {
        self.events.push(event);
    }

    pub fn events(&self) -> &[AddressSpaceEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    /// Checks if an event matching the predicate exists
    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&AddressSpaceEvent) -> bool,
    {
        self.events.iter().any(predicate)
    }

    /// Counts events matching the predicate
    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&AddressSpaceEvent) -> bool,
    {
        self.events.iter().filter(|e| predicate(e)).count()
    }
}

impl Default for AddressSpaceAuditLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
struct Mapping {
    chunk: ObjectId,
    base: VmAddress,
    /// Reserved size, page aligned
    max_size: u32,
    protection: Protection,
    committed: Vec<bool>,
    /// Backing store, grown to cover the highest committed page
    bytes: Vec<u8>,
}

impl Mapping {
    fn new(chunk: ObjectId, base: VmAddress, max_size: u32, protection: Protection) -> Self {
        let pages = (max_size / PAGE_SIZE) as usize;
        Self {
            chunk,
            base,
            max_size,
            protection,
            committed: vec![false; pages],
            bytes: Vec::new(),
        }
    }

    fn end(&self) -> u64 {
        self.base as u64 + self.max_size as u64
    }

    fn contains(&self, addr: VmAddress) -> bool {
        addr >= self.base && (addr as u64) < self.end()
    }

    fn page_range(&self, offset: u32, size: u32) -> Result<std::ops::Range<usize>, MemoryError> {
        let end = offset as u64 + size as u64;
        if end > self.max_size as u64 {
            return Err(MemoryError::CommitOutOfRange {
                offset,
                size,
                max_size: self.max_size,
            });
        }
        let first = (offset / PAGE_SIZE) as usize;
        let last = end.div_ceil(PAGE_SIZE as u64) as usize;
        Ok(first..last)
    }

    fn commit(&mut self, offset: u32, size: u32) -> Result<(), MemoryError> {
        let pages = self.page_range(offset, size)?;
        for page in pages {
            self.committed[page] = true;
            self.ensure_backed(page);
        }
        Ok(())
    }

    fn decommit(&mut self, offset: u32, size: u32) -> Result<(), MemoryError> {
        let pages = self.page_range(offset, size)?;
        for page in pages {
            if self.committed[page] {
                self.committed[page] = false;
                let start = page * PAGE_SIZE as usize;
                self.bytes[start..start + PAGE_SIZE as usize].fill(0);
            }
        }
        Ok(())
    }

    fn ensure_backed(&mut self, page: usize) {
        let end = (page + 1) * PAGE_SIZE as usize;
        if self.bytes.len() < end {
            self.bytes.resize(end, 0);
        }
    }

    /// Host bytes from `addr` to the end of its committed run
    fn host_slice(&mut self, addr: VmAddress) -> Option<&mut [u8]> {
        let offset = (addr - self.base) as usize;
        let page = offset / PAGE_SIZE as usize;
        if !*self.committed.get(page)? {
            return None;
        }

        let run_pages = self.committed[page..]
            .iter()
            .take_while(|committed| **committed)
            .count();
        let end = (page + run_pages) * PAGE_SIZE as usize;
        Some(&mut self.bytes[offset..end])
    }

    fn committed_bytes(&self) -> u32 {
        self.committed.iter().filter(|c| **c).count() as u32 * PAGE_SIZE
    }

    fn do_state(&mut self, stream: &mut StateStream) {
        stream.absorb(&mut self.chunk);
        stream.absorb(&mut self.base);
        stream.absorb(&mut self.max_size);

        let mut protection = self.protection.bits();
        stream.absorb(&mut protection);
        self.protection = Protection::from_bits(protection);

        let mut pages: Vec<u32> = self
            .committed
            .iter()
            .enumerate()
            .filter(|(_, committed)| **committed)
            .map(|(page, _)| page as u32)
            .collect();
        stream.absorb(&mut pages);

        if stream.is_reading() {
            if stream.is_failed() {
                return;
            }
            if !is_page_aligned(self.max_size) {
                stream.fail_corrupt(format!(
                    "chunk {} has unaligned size {:#x}",
                    self.chunk, self.max_size
                ));
                return;
            }
            *self = Mapping::new(self.chunk, self.base, self.max_size, self.protection);
            if let Some(page) = pages.iter().find(|page| **page as usize >= self.committed.len()) {
                stream.fail_corrupt(format!(
                    "committed page {} outside chunk {}",
                    page, self.chunk
                ));
                return;
            }
        }

        for page in pages {
            let page = page as usize;
            self.committed[page] = true;
            self.ensure_backed(page);
            let start = page * PAGE_SIZE as usize;
            stream.absorb(&mut self.bytes[start..start + PAGE_SIZE as usize]);
        }
    }
}

/// One guest virtual address space
#[derive(Debug, Clone, Default)]
pub struct AddressSpace {
    id: AddressSpaceId,
    /// Owning process
    owner: ObjectId,
    /// Mappings by base address
    mappings: BTreeMap<VmAddress, Mapping>,
}

impl AddressSpace {
    fn new(id: AddressSpaceId, owner: ObjectId) -> Self {
        Self {
            id,
            owner,
            mappings: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> AddressSpaceId {
        self.id
    }

    pub fn owner(&self) -> ObjectId {
        self.owner
    }

    pub fn mapping_count(&self) -> usize {
        self.mappings.len()
    }

    fn mapping_at(&self, addr: VmAddress) -> Option<&Mapping> {
        self.mappings
            .range(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(addr))
    }

    fn mapping_at_mut(&mut self, addr: VmAddress) -> Option<&mut Mapping> {
        self.mappings
            .range_mut(..=addr)
            .next_back()
            .map(|(_, m)| m)
            .filter(|m| m.contains(addr))
    }

    fn is_free(&self, base: VmAddress, size: u32) -> bool {
        let end = base as u64 + size as u64;
        !self
            .mappings
            .values()
            .any(|m| (base as u64) < m.end() && (m.base as u64) < end)
    }

    /// First free, page aligned range of `size` bytes at or above `hint`
    fn find_free(
        &self,
        hint: VmAddress,
        size: u32,
        range: std::ops::Range<VmAddress>,
    ) -> Option<VmAddress> {
        let align = |addr: u64| addr.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        let mut candidate = align(hint.max(range.start) as u64);
        let limit = range.end as u64;

        for m in self.mappings.values() {
            if m.end() <= candidate {
                continue;
            }
            if candidate + size as u64 <= m.base as u64 {
                break;
            }
            candidate = align(m.end());
        }

        if candidate + size as u64 <= limit {
            Some(candidate as VmAddress)
        } else {
            None
        }
    }
}

/// All address spaces of the machine
pub struct MemorySystem {
    model: MemoryModelKind,
    eka1_memory_map: bool,
    spaces: BTreeMap<AddressSpaceId, AddressSpace>,
    /// Where each mapped chunk lives
    chunk_index: BTreeMap<ObjectId, (AddressSpaceId, VmAddress)>,
    next_space: u32,
    /// Audit log (test-only)
    audit_log: AddressSpaceAuditLog,
}

impl MemorySystem {
    pub fn new(model: MemoryModelKind, eka1_memory_map: bool) -> Self {
        Self {
            model,
            eka1_memory_map,
            spaces: BTreeMap::new(),
            chunk_index: BTreeMap::new(),
            next_space: 1,
            audit_log: AddressSpaceAuditLog::new(),
        }
    }

    pub fn model(&self) -> MemoryModelKind {
        self.model
    }

    /// Fixed address of every process's ROM BSS shadow chunk
    pub fn rom_bss_address(&self) -> VmAddress {
        self.model.rom_bss_address(self.eka1_memory_map)
    }

    /// Creates an empty address space for `owner`
    pub fn create_address_space(&mut self, owner: ObjectId) -> AddressSpaceId {
        let id = AddressSpaceId::from_raw(self.next_space);
        self.next_space += 1;
        self.spaces.insert(id, AddressSpace::new(id, owner));

        self.audit_log
            .record(AddressSpaceEvent::SpaceCreated { space: id, owner });
        id
    }

    /// Destroys an address space and every mapping in it
    pub fn destroy_address_space(&mut self, space: AddressSpaceId) -> Result<(), MemoryError> {
        let removed = self
            .spaces
            .remove(&space)
            .ok_or(MemoryError::AddressSpaceNotFound(space))?;
        for mapping in removed.mappings.values() {
            self.chunk_index.remove(&mapping.chunk);
        }

        self.audit_log
            .record(AddressSpaceEvent::SpaceDestroyed { space });
        Ok(())
    }

    pub fn address_space(&self, space: AddressSpaceId) -> Option<&AddressSpace> {
        self.spaces.get(&space)
    }

    pub fn space_count(&self) -> usize {
        self.spaces.len()
    }

    /// Reserves address range for `chunk` and commits its initial window
    ///
    /// Returns the base address. Nothing is mapped on failure.
    pub fn map_chunk(
        &mut self,
        space: AddressSpaceId,
        chunk: ObjectId,
        info: &ChunkCreateInfo,
    ) -> Result<VmAddress, MemoryError> {
        let result = self.try_map_chunk(space, chunk, info);
        if let Err(error) = &result {
            self.audit_log.record(AddressSpaceEvent::MapFailed {
                space,
                error: error.to_string(),
            });
        }
        result
    }

    fn try_map_chunk(
        &mut self,
        space_id: AddressSpaceId,
        chunk: ObjectId,
        info: &ChunkCreateInfo,
    ) -> Result<VmAddress, MemoryError> {
        if info.max_size == 0 || info.max_size > u32::MAX - PAGE_SIZE {
            return Err(MemoryError::InvalidSize(info.max_size));
        }
        if info.bottom > info.top || info.top > info.max_size {
            return Err(MemoryError::CommitOutOfRange {
                offset: info.bottom,
                size: info.top.saturating_sub(info.bottom),
                max_size: info.max_size,
            });
        }

        let size = page_align_up(info.max_size);
        let range = self.model.local_data_range();
        let space = self
            .spaces
            .get_mut(&space_id)
            .ok_or(MemoryError::AddressSpaceNotFound(space_id))?;

        let base = match info.placement {
            Placement::Fixed(addr) => {
                if !is_page_aligned(addr) {
                    return Err(MemoryError::Misaligned(addr));
                }
                if addr as u64 + size as u64 > u32::MAX as u64 + 1 || !space.is_free(addr, size) {
                    return Err(MemoryError::Overlap { base: addr, size });
                }
                addr
            }
            Placement::Near(hint) => space
                .find_free(hint, size, range)
                .ok_or(MemoryError::Exhausted { requested: size })?,
        };

        let mut mapping = Mapping::new(chunk, base, size, info.protection);
        mapping.commit(info.bottom, info.committed_size())?;
        space.mappings.insert(base, mapping);
        self.chunk_index.insert(chunk, (space_id, base));

        self.audit_log.record(AddressSpaceEvent::ChunkMapped {
            space: space_id,
            chunk,
            base,
            max_size: size,
            protection: info.protection,
        });
        if info.committed_size() > 0 {
            self.audit_log.record(AddressSpaceEvent::Committed {
                chunk,
                offset: info.bottom,
                size: info.committed_size(),
            });
        }
        Ok(base)
    }

    fn mapping_mut(&mut self, chunk: ObjectId) -> Result<&mut Mapping, MemoryError> {
        let (space, base) = *self
            .chunk_index
            .get(&chunk)
            .ok_or(MemoryError::ChunkNotMapped(chunk))?;
        self.spaces
            .get_mut(&space)
            .and_then(|s| s.mappings.get_mut(&base))
            .ok_or(MemoryError::ChunkNotMapped(chunk))
    }

    /// Commits `[offset, offset + size)` of a chunk, rounded out to pages
    pub fn commit(&mut self, chunk: ObjectId, offset: u32, size: u32) -> Result<(), MemoryError> {
        self.mapping_mut(chunk)?.commit(offset, size)?;
        self.audit_log
            .record(AddressSpaceEvent::Committed { chunk, offset, size });
        Ok(())
    }

    /// Decommits pages of a chunk; their contents are lost
    pub fn decommit(&mut self, chunk: ObjectId, offset: u32, size: u32) -> Result<(), MemoryError> {
        self.mapping_mut(chunk)?.decommit(offset, size)?;
        self.audit_log
            .record(AddressSpaceEvent::Decommitted { chunk, offset, size });
        Ok(())
    }

    pub fn unmap_chunk(&mut self, chunk: ObjectId) -> Result<(), MemoryError> {
        let (space, base) = self
            .chunk_index
            .remove(&chunk)
            .ok_or(MemoryError::ChunkNotMapped(chunk))?;
        if let Some(s) = self.spaces.get_mut(&space) {
            s.mappings.remove(&base);
        }

        self.audit_log
            .record(AddressSpaceEvent::ChunkUnmapped { space, chunk });
        Ok(())
    }

    /// Base address of a mapped chunk
    pub fn chunk_base(&self, chunk: ObjectId) -> Option<VmAddress> {
        self.chunk_index.get(&chunk).map(|(_, base)| *base)
    }

    /// Bytes currently committed to a chunk
    pub fn committed_size(&self, chunk: ObjectId) -> Option<u32> {
        let (space, base) = self.chunk_index.get(&chunk)?;
        self.spaces
            .get(space)?
            .mappings
            .get(base)
            .map(Mapping::committed_bytes)
    }

    /// Chunk whose reserved range contains `addr`
    pub fn chunk_at(&self, space: AddressSpaceId, addr: VmAddress) -> Option<ObjectId> {
        self.spaces.get(&space)?.mapping_at(addr).map(|m| m.chunk)
    }

    pub fn is_committed(&mut self, space: AddressSpaceId, addr: VmAddress) -> bool {
        self.host_slice(space, addr).is_some()
    }

    /// Copies guest memory out, crossing mapping boundaries as needed
    pub fn read_bytes(
        &mut self,
        space: AddressSpaceId,
        addr: VmAddress,
        len: usize,
    ) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(len);
        let mut cursor = addr;
        while out.len() < len {
            let bytes = self
                .host_slice(space, cursor)
                .ok_or(MemoryError::Unmapped(cursor))?;
            let take = bytes.len().min(len - out.len());
            out.extend_from_slice(&bytes[..take]);
            cursor = cursor.wrapping_add(take as u32);
        }
        Ok(out)
    }

    /// Copies bytes into guest memory, crossing mapping boundaries as needed
    pub fn write_bytes(
        &mut self,
        space: AddressSpaceId,
        addr: VmAddress,
        data: &[u8],
    ) -> Result<(), MemoryError> {
        let mut written = 0;
        let mut cursor = addr;
        while written < data.len() {
            let bytes = self
                .host_slice(space, cursor)
                .ok_or(MemoryError::Unmapped(cursor))?;
            let take = bytes.len().min(data.len() - written);
            bytes[..take].copy_from_slice(&data[written..written + take]);
            written += take;
            cursor = cursor.wrapping_add(take as u32);
        }
        Ok(())
    }

    pub fn audit_log(&self) -> &AddressSpaceAuditLog {
        &self.audit_log
    }

    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }

    /// Saves or loads every space, mapping and committed page
    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Memory", 1, |s| {
            s.absorb(&mut self.eka1_memory_map);
            s.absorb(&mut self.next_space);

            let mut count = self.spaces.len() as u32;
            s.absorb(&mut count);

            if s.is_reading() {
                let mut spaces = BTreeMap::new();
                let mut chunk_index = BTreeMap::new();
                for _ in 0..count {
                    let mut space = AddressSpace::default();
                    absorb_space(&mut space, s);
                    if s.is_failed() {
                        return;
                    }
                    for mapping in space.mappings.values() {
                        chunk_index.insert(mapping.chunk, (space.id, mapping.base));
                    }
                    spaces.insert(space.id, space);
                }
                self.spaces = spaces;
                self.chunk_index = chunk_index;
            } else {
                for space in self.spaces.values_mut() {
                    absorb_space(space, s);
                }
            }
        });
    }
}

fn absorb_space(space: &mut AddressSpace, stream: &mut StateStream) {
    stream.absorb(&mut space.id);
    stream.absorb(&mut space.owner);

    let mut count = space.mappings.len() as u32;
    stream.absorb(&mut count);

    if stream.is_reading() {
        space.mappings.clear();
        for _ in 0..count {
            let mut mapping = Mapping::default();
            mapping.do_state(stream);
            if stream.is_failed() {
                return;
            }
            space.mappings.insert(mapping.base, mapping);
        }
    } else {
        for mapping in space.mappings.values_mut() {
            mapping.do_state(stream);
        }
    }
}

impl AddressTranslator for MemorySystem {
    fn host_slice(&mut self, space: AddressSpaceId, addr: VmAddress) -> Option<&mut [u8]> {
        self.spaces.get_mut(&space)?.mapping_at_mut(addr)?.host_slice(addr)
    }
}
