//! CPU backend abstraction
//!
//! The kernel drives exactly one instruction-execution engine through the
//! [`CpuBackend`] trait. The engine itself (decoder, interpreter, JIT) is a
//! black box; the kernel only loads and saves thread contexts, asks the
//! engine to run, and asks it to yield at the next safe boundary.

use crate::analyser::InstructionAnalyser;
use crate::memory::AddressTranslator;
use crate::timer::Clock;
use core_types::{AddressSpaceId, MemoryError, VmAddress};
use serde::{Deserialize, Serialize};

/// Index of the stack pointer register
pub const REG_SP: usize = 13;
/// Index of the link register
pub const REG_LR: usize = 14;
/// Index of the program counter register
pub const REG_PC: usize = 15;

/// Processor mode bits for user mode
pub const CPSR_USER_MODE: u32 = 0x10;
/// Thumb state bit
pub const CPSR_THUMB: u32 = 0x20;

/// Saved register state of one guest thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadContext {
    /// General purpose registers R0-R15
    pub cpu_registers: [u32; 16],
    /// Current program status register
    pub cpsr: u32,
    /// Floating point registers D0-D15
    pub fpu_registers: [u64; 16],
    /// Floating point status and control register
    pub fpscr: u32,
}

impl ThreadContext {
    /// Creates a zeroed user-mode context
    pub fn new() -> Self {
        Self {
            cpu_registers: [0; 16],
            cpsr: CPSR_USER_MODE,
            fpu_registers: [0; 16],
            fpscr: 0,
        }
    }

    /// Creates the initial context of a thread starting at `entry`
    ///
    /// An odd entry address selects Thumb state; the bit is stripped from
    /// the program counter.
    pub fn for_entry(entry: VmAddress, stack_top: VmAddress) -> Self {
        let mut ctx = Self::new();
        ctx.cpu_registers[REG_SP] = stack_top;
        ctx.cpu_registers[REG_PC] = entry & !1;
        if entry & 1 != 0 {
            ctx.cpsr |= CPSR_THUMB;
        }
        ctx
    }

    pub fn pc(&self) -> u32 {
        self.cpu_registers[REG_PC]
    }

    pub fn sp(&self) -> u32 {
        self.cpu_registers[REG_SP]
    }

    pub fn lr(&self) -> u32 {
        self.cpu_registers[REG_LR]
    }
}

impl Default for ThreadContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Why a call to [`CpuBackend::run`] returned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    /// The clock slice was used up
    BudgetExhausted,
    /// A cooperative yield was requested via `prepare_rescheduling`
    RescheduleRequested,
    /// `stop` was called
    Stopped,
    /// The engine could not continue (e.g. fetch from unmapped memory)
    Fault,
}

/// The execution engine's dependencies for one run
///
/// The bus is assembled by the execution loop right before each run and
/// gives the engine access to the global clock, the address translation
/// service scoped to the active address space, and an optional analyser
/// for diagnostics.
pub struct CpuBus<'a> {
    pub clock: &'a mut dyn Clock,
    pub memory: &'a mut dyn AddressTranslator,
    pub address_space: AddressSpaceId,
    pub analyser: Option<&'a mut dyn InstructionAnalyser>,
}

impl<'a> CpuBus<'a> {
    pub fn new(
        clock: &'a mut dyn Clock,
        memory: &'a mut dyn AddressTranslator,
        address_space: AddressSpaceId,
    ) -> Self {
        Self {
            clock,
            memory,
            address_space,
            analyser: None,
        }
    }

    /// Attaches a decoding/diagnostic service
    pub fn with_analyser(mut self, analyser: &'a mut dyn InstructionAnalyser) -> Self {
        self.analyser = Some(analyser);
        self
    }

    /// Reads a little-endian word from the active address space
    pub fn read_u32(&mut self, addr: VmAddress) -> Result<u32, MemoryError> {
        self.memory.read_u32(self.address_space, addr)
    }

    /// Writes a little-endian word into the active address space
    pub fn write_u32(&mut self, addr: VmAddress, value: u32) -> Result<(), MemoryError> {
        self.memory.write_u32(self.address_space, addr, value)
    }

    /// Cycles left in the current clock slice
    pub fn budget(&self) -> u64 {
        self.clock.downcount()
    }

    /// Charges executed cycles to the clock
    pub fn consume_cycles(&mut self, cycles: u64) {
        self.clock.consume(cycles);
    }
}

/// Interface of an instruction-execution engine
///
/// # Contract
///
/// Register and context accessors require a loaded context. Calling them
/// while [`CpuBackend::has_context`] is false is a programming error and
/// implementations panic.
pub trait CpuBackend {
    /// Executes until the engine decides to yield
    fn run(&mut self, bus: &mut CpuBus<'_>) -> StopReason;

    /// Executes exactly one instruction
    fn step(&mut self, bus: &mut CpuBus<'_>);

    /// Aborts the current run at the next instruction boundary
    fn stop(&mut self);

    /// Requests a cooperative yield at the next safe instruction boundary
    ///
    /// The request is a flag checked between executed instructions; it is
    /// cleared when the engine honours it.
    fn prepare_rescheduling(&mut self);

    /// Returns true if a cooperative yield has been requested and not yet honoured
    fn reschedule_requested(&self) -> bool;

    fn reg(&self, index: usize) -> u32;
    fn set_reg(&mut self, index: usize, value: u32);

    fn sp(&self) -> u32 {
        self.reg(REG_SP)
    }

    fn set_sp(&mut self, value: u32) {
        self.set_reg(REG_SP, value)
    }

    fn pc(&self) -> u32 {
        self.reg(REG_PC)
    }

    fn set_pc(&mut self, value: u32) {
        self.set_reg(REG_PC, value)
    }

    fn lr(&self) -> u32 {
        self.reg(REG_LR)
    }

    fn set_lr(&mut self, value: u32) {
        self.set_reg(REG_LR, value)
    }

    fn vfp(&self, index: usize) -> u64;
    fn set_vfp(&mut self, index: usize, value: u64);

    fn cpsr(&self) -> u32;
    fn set_cpsr(&mut self, value: u32);

    /// Copies the loaded register state into `ctx`
    fn save_context(&self, ctx: &mut ThreadContext);

    /// Loads `ctx` as the active register state
    fn load_context(&mut self, ctx: &ThreadContext);

    /// Drops the active register state, leaving the engine context-less
    fn unload_context(&mut self);

    /// Returns true if a register state is loaded
    fn has_context(&self) -> bool;

    fn set_entry_point(&mut self, entry: VmAddress);
    fn entry_point(&self) -> VmAddress;

    fn set_stack_top(&mut self, top: VmAddress);
    fn stack_top(&self) -> VmAddress;

    /// Total instructions executed since the engine was created
    fn instructions_executed(&self) -> u64;
}
