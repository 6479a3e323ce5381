//! Address translation abstraction

use core_types::{AddressSpaceId, MemoryError, VmAddress};

/// Translates guest virtual addresses into host memory
///
/// Unlike a host MMU, translation is explicit: the caller names the address
/// space and gets back the host bytes from `addr` up to the end of the
/// committed part of the mapping that contains it.
pub trait AddressTranslator {
    /// Host view of the memory at `addr` in `space`
    fn host_slice(&mut self, space: AddressSpaceId, addr: VmAddress) -> Option<&mut [u8]>;

    /// Reads a little-endian word
    fn read_u32(&mut self, space: AddressSpaceId, addr: VmAddress) -> Result<u32, MemoryError> {
        let bytes = self
            .host_slice(space, addr)
            .filter(|bytes| bytes.len() >= 4)
            .ok_or(MemoryError::Unmapped(addr))?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Writes a little-endian word
    fn write_u32(
        &mut self,
        space: AddressSpaceId,
        addr: VmAddress,
        value: u32,
    ) -> Result<(), MemoryError> {
        let bytes = self
            .host_slice(space, addr)
            .filter(|bytes| bytes.len() >= 4)
            .ok_or(MemoryError::Unmapped(addr))?;
        bytes[..4].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }
}
