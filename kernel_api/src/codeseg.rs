//! Loaded-module interface
//!
//! A code segment is an executable image the loader has already parsed. The
//! kernel consumes it as a bag of opaque fields: where the code runs, where
//! execution starts, how big the stack and heap are, and which security
//! identity the image carries. Parsing image formats is the loader's job.

use crate::error::KernelError;
use core_types::{is_page_aligned, ProcessUidType, SecurityInfo, VmAddress};
use serde::{Deserialize, Serialize};

/// A loaded executable image
pub trait CodeSegment {
    /// Image name, used for diagnostics
    fn name(&self) -> &str;

    /// The uid triple stored in the image; `uid3` becomes the process uid
    fn uids(&self) -> ProcessUidType;

    fn security_info(&self) -> SecurityInfo;

    /// Run-time address of the text section
    fn code_run_address(&self) -> VmAddress;

    /// Offset of the entry point from the start of the text section
    fn entry_point_offset(&self) -> u32;

    /// Text section contents
    fn code(&self) -> &[u8];

    /// Run-time address of the initialised data section
    fn data_run_address(&self) -> VmAddress;

    /// Initialised data section contents
    fn data(&self) -> &[u8];

    /// Size of the zero-filled section following the data section
    fn bss_size(&self) -> u32;

    fn heap_size_min(&self) -> u32;
    fn heap_size_max(&self) -> u32;
    fn stack_size(&self) -> u32;

    /// Absolute address of the entry point
    fn entry_point(&self) -> VmAddress {
        self.code_run_address().wrapping_add(self.entry_point_offset())
    }

    /// Rejects images the kernel cannot turn into a process
    fn validate(&self) -> Result<(), KernelError> {
        if !is_page_aligned(self.code_run_address()) {
            return Err(KernelError::LoadFailed(format!(
                "{}: code address {:#x} is not page aligned",
                self.name(),
                self.code_run_address()
            )));
        }

        if self.code().is_empty() {
            return Err(KernelError::LoadFailed(format!(
                "{}: empty text section",
                self.name()
            )));
        }

        // The thumb bit is not part of the offset
        if (self.entry_point_offset() & !1) as usize >= self.code().len() {
            return Err(KernelError::LoadFailed(format!(
                "{}: entry offset {:#x} outside text section of {:#x} bytes",
                self.name(),
                self.entry_point_offset(),
                self.code().len()
            )));
        }

        if self.stack_size() == 0 {
            return Err(KernelError::LoadFailed(format!(
                "{}: zero stack size",
                self.name()
            )));
        }

        if self.heap_size_min() > self.heap_size_max() {
            return Err(KernelError::LoadFailed(format!(
                "{}: minimum heap {:#x} exceeds maximum {:#x}",
                self.name(),
                self.heap_size_min(),
                self.heap_size_max()
            )));
        }

        let has_data = !self.data().is_empty() || self.bss_size() > 0;
        if has_data && !is_page_aligned(self.data_run_address()) {
            return Err(KernelError::LoadFailed(format!(
                "{}: data address {:#x} is not page aligned",
                self.name(),
                self.data_run_address()
            )));
        }

        Ok(())
    }
}

/// Plain in-memory code segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImage {
    pub name: String,
    pub uids: ProcessUidType,
    pub security: SecurityInfo,
    pub code_run_address: VmAddress,
    pub entry_point_offset: u32,
    pub code: Vec<u8>,
    pub data_run_address: VmAddress,
    pub data: Vec<u8>,
    pub bss_size: u32,
    pub heap_size_min: u32,
    pub heap_size_max: u32,
    pub stack_size: u32,
}

impl ModuleImage {
    pub fn new(name: impl Into<String>, uids: ProcessUidType, code_run_address: VmAddress) -> Self {
        Self {
            name: name.into(),
            uids,
            security: SecurityInfo::default(),
            code_run_address,
            entry_point_offset: 0,
            code: Vec::new(),
            data_run_address: 0,
            data: Vec::new(),
            bss_size: 0,
            heap_size_min: 0x1000,
            heap_size_max: 0x10_0000,
            stack_size: 0x2000,
        }
    }

    /// Sets the text section and the entry offset into it
    pub fn with_code(mut self, code: Vec<u8>, entry_point_offset: u32) -> Self {
        self.code = code;
        self.entry_point_offset = entry_point_offset;
        self
    }

    pub fn with_data(mut self, data_run_address: VmAddress, data: Vec<u8>, bss_size: u32) -> Self {
        self.data_run_address = data_run_address;
        self.data = data;
        self.bss_size = bss_size;
        self
    }

    pub fn with_security(mut self, security: SecurityInfo) -> Self {
        self.security = security;
        self
    }

    pub fn with_stack_size(mut self, stack_size: u32) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_heap(mut self, min: u32, max: u32) -> Self {
        self.heap_size_min = min;
        self.heap_size_max = max;
        self
    }
}

impl CodeSegment for ModuleImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn uids(&self) -> ProcessUidType {
        self.uids
    }

    fn security_info(&self) -> SecurityInfo {
        self.security
    }

    fn code_run_address(&self) -> VmAddress {
        self.code_run_address
    }

    fn entry_point_offset(&self) -> u32 {
        self.entry_point_offset
    }

    fn code(&self) -> &[u8] {
        &self.code
    }

    fn data_run_address(&self) -> VmAddress {
        self.data_run_address
    }

    fn data(&self) -> &[u8] {
        &self.data
    }

    fn bss_size(&self) -> u32 {
        self.bss_size
    }

    fn heap_size_min(&self) -> u32 {
        self.heap_size_min
    }

    fn heap_size_max(&self) -> u32 {
        self.heap_size_max
    }

    fn stack_size(&self) -> u32 {
        self.stack_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image() -> ModuleImage {
        ModuleImage::new("app.exe", ProcessUidType::new(0x1000_007A, 0, 0xE000_0001), 0x7000_0000)
            .with_code(vec![0; 64], 0x10)
    }

    #[test]
    fn test_entry_point_is_relative_to_code() {
        assert_eq!(image().entry_point(), 0x7000_0010);
        assert!(image().validate().is_ok());
    }

    #[test]
    fn test_entry_outside_code_rejected() {
        let img = image().with_code(vec![0; 8], 0x10);
        assert!(matches!(img.validate(), Err(KernelError::LoadFailed(_))));
    }

    #[test]
    fn test_empty_code_rejected() {
        let img = image().with_code(Vec::new(), 0);
        assert!(matches!(img.validate(), Err(KernelError::LoadFailed(_))));
    }

    #[test]
    fn test_bad_heap_rejected() {
        let img = image().with_heap(0x2000, 0x1000);
        assert!(matches!(img.validate(), Err(KernelError::LoadFailed(_))));
    }

    #[test]
    fn test_misaligned_data_rejected() {
        let img = image().with_data(0x0060_0010, vec![1, 2, 3], 0);
        assert!(img.validate().is_err());
        let img = image().with_data(0x0060_0000, vec![1, 2, 3], 0x100);
        assert!(img.validate().is_ok());
    }

    #[test]
    fn test_image_json_round_trip() {
        let img = image();
        let json = serde_json::to_string(&img).unwrap();
        let back: ModuleImage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, img);
    }
}
