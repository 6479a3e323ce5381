//! Instruction decoding seam
//!
//! Diagnostics only. Nothing in the execution path requires an analyser;
//! the kernel uses one, when supplied, to describe what the guest is doing.

use core_types::VmAddress;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An ARM core register
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Reg {
    R0,
    R1,
    R2,
    R3,
    R4,
    R5,
    R6,
    R7,
    R8,
    R9,
    R10,
    R11,
    R12,
    R13,
    R14,
    R15,
}

impl Reg {
    pub const SP: Reg = Reg::R13;
    pub const LR: Reg = Reg::R14;
    pub const PC: Reg = Reg::R15;

    const ALL: [Reg; 16] = [
        Reg::R0,
        Reg::R1,
        Reg::R2,
        Reg::R3,
        Reg::R4,
        Reg::R5,
        Reg::R6,
        Reg::R7,
        Reg::R8,
        Reg::R9,
        Reg::R10,
        Reg::R11,
        Reg::R12,
        Reg::R13,
        Reg::R14,
        Reg::R15,
    ];

    /// Register by number
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Register number, usable with [`crate::CpuBackend::reg`]
    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reg::R13 => write!(f, "sp"),
            Reg::R14 => write!(f, "lr"),
            Reg::R15 => write!(f, "pc"),
            other => write!(f, "r{}", other.index()),
        }
    }
}

/// Encoding of a decoded instruction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstructionSet {
    Arm,
    Thumb16,
    Thumb32,
}

impl InstructionSet {
    /// Encoded size in bytes
    pub const fn size(&self) -> u32 {
        match self {
            InstructionSet::Arm | InstructionSet::Thumb32 => 4,
            InstructionSet::Thumb16 => 2,
        }
    }
}

/// One decoded guest instruction
pub trait DecodedInstruction {
    /// Textual mnemonic, e.g. `"ldr"`
    fn mnemonic(&self) -> String;

    /// Registers the instruction reads
    fn regs_read(&self) -> Vec<Reg>;

    /// Registers the instruction writes
    fn regs_written(&self) -> Vec<Reg>;

    fn instruction_set(&self) -> InstructionSet;

    /// Encoded size in bytes
    fn size(&self) -> u32 {
        self.instruction_set().size()
    }
}

/// Decoding/diagnostic service
pub trait InstructionAnalyser {
    /// Decodes the instruction at `addr`
    ///
    /// Returns `None` when analysis cannot continue, for example when the
    /// address lies outside the mapped image.
    fn next_instruction(&mut self, addr: VmAddress) -> Option<Box<dyn DecodedInstruction>>;
}
