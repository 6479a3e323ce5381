//! Test doubles for the execution seams
//!
//! [`ScriptedCpu`] is a deterministic [`CpuBackend`] running a tiny
//! word-sized instruction set, enough to exercise scheduling, the clock and
//! guest memory without a real ARM engine.

use crate::chunk::ChunkCreateInfo;
use crate::kernel::KernelSystem;
use crate::process::Process;
use core_types::{ProcessUidType, SecurityInfo, VmAddress, PAGE_SIZE};
use hal::{
    AddressTranslator, CpuBackend, CpuBus, DecodedInstruction, InstructionAnalyser,
    InstructionSet, Reg, StopReason, ThreadContext,
};
use kernel_api::status::KREQUEST_PENDING;
use kernel_api::ModuleImage;
use std::collections::HashMap;

/// Encoders for the [`ScriptedCpu`] instruction set
///
/// Every instruction is one little-endian word: opcode in the top byte,
/// a 24-bit immediate below it.
pub mod asm {
    pub const OP_NOP: u32 = 0x00;
    pub const OP_ADD: u32 = 0x01;
    pub const OP_JUMP_BACK: u32 = 0x02;
    pub const OP_STORE: u32 = 0x03;
    pub const OP_SWI: u32 = 0xEF;

    const fn encode(op: u32, imm: u32) -> u32 {
        (op << 24) | (imm & 0x00FF_FFFF)
    }

    pub const fn nop() -> u32 {
        encode(OP_NOP, 0)
    }

    /// `r0 += imm`
    pub const fn add(imm: u32) -> u32 {
        encode(OP_ADD, imm)
    }

    /// `pc -= bytes`
    pub const fn jump_back(bytes: u32) -> u32 {
        encode(OP_JUMP_BACK, bytes)
    }

    /// `[r1] = r0`
    pub const fn store() -> u32 {
        encode(OP_STORE, 0)
    }

    /// Stops the run
    pub const fn swi() -> u32 {
        encode(OP_SWI, 0)
    }

    pub fn assemble(words: &[u32]) -> Vec<u8> {
        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }
}

enum Step {
    Continue,
    Trap,
    Fault,
}

/// Deterministic CPU backend
///
/// Executes one word per cycle. A yield request is honoured after the next
/// executed instruction.
#[derive(Debug, Default)]
pub struct ScriptedCpu {
    context: Option<ThreadContext>,
    entry_point: VmAddress,
    stack_top: VmAddress,
    yield_requested: bool,
    stop_requested: bool,
    executed: u64,
    /// Mnemonics reported by the bus analyser, in execution order
    pub traced: Vec<String>,
}

impl ScriptedCpu {
    pub fn new() -> Self {
        Self::default()
    }

    fn ctx(&self) -> &ThreadContext {
        self.context
            .as_ref()
            .expect("ScriptedCpu accessed without a loaded context")
    }

    fn ctx_mut(&mut self) -> &mut ThreadContext {
        self.context
            .as_mut()
            .expect("ScriptedCpu accessed without a loaded context")
    }

    fn execute(&mut self, bus: &mut CpuBus<'_>) -> Step {
        let pc = self.ctx().pc();
        let word = match bus.read_u32(pc) {
            Ok(word) => word,
            Err(_) => return Step::Fault,
        };

        if let Some(analyser) = bus.analyser.as_deref_mut() {
            if let Some(insn) = analyser.next_instruction(pc) {
                self.traced.push(insn.mnemonic());
            }
        }

        let imm = word & 0x00FF_FFFF;
        let ctx = self.ctx_mut();
        let step = match word >> 24 {
            asm::OP_NOP => {
                ctx.cpu_registers[15] = pc.wrapping_add(4);
                Step::Continue
            }
            asm::OP_ADD => {
                ctx.cpu_registers[0] = ctx.cpu_registers[0].wrapping_add(imm);
                ctx.cpu_registers[15] = pc.wrapping_add(4);
                Step::Continue
            }
            asm::OP_JUMP_BACK => {
                ctx.cpu_registers[15] = pc.wrapping_sub(imm);
                Step::Continue
            }
            asm::OP_STORE => {
                let (addr, value) = (ctx.cpu_registers[1], ctx.cpu_registers[0]);
                ctx.cpu_registers[15] = pc.wrapping_add(4);
                if bus.write_u32(addr, value).is_err() {
                    return Step::Fault;
                }
                Step::Continue
            }
            asm::OP_SWI => {
                ctx.cpu_registers[15] = pc.wrapping_add(4);
                Step::Trap
            }
            _ => return Step::Fault,
        };

        bus.consume_cycles(1);
        self.executed += 1;
        step
    }
}

impl CpuBackend for ScriptedCpu {
    fn run(&mut self, bus: &mut CpuBus<'_>) -> StopReason {
        assert!(
            self.has_context(),
            "ScriptedCpu accessed without a loaded context"
        );
        loop {
            if self.stop_requested {
                self.stop_requested = false;
                return StopReason::Stopped;
            }
            if bus.budget() == 0 {
                return StopReason::BudgetExhausted;
            }

            match self.execute(bus) {
                Step::Continue => {}
                Step::Trap => return StopReason::Stopped,
                Step::Fault => return StopReason::Fault,
            }

            if self.yield_requested {
                self.yield_requested = false;
                return StopReason::RescheduleRequested;
            }
        }
    }

    fn step(&mut self, bus: &mut CpuBus<'_>) {
        self.execute(bus);
    }

    fn stop(&mut self) {
        self.stop_requested = true;
    }

    fn prepare_rescheduling(&mut self) {
        self.yield_requested = true;
    }

    fn reschedule_requested(&self) -> bool {
        self.yield_requested
    }

    fn reg(&self, index: usize) -> u32 {
        self.ctx().cpu_registers[index]
    }

    fn set_reg(&mut self, index: usize, value: u32) {
        self.ctx_mut().cpu_registers[index] = value;
    }

    fn vfp(&self, index: usize) -> u64 {
        self.ctx().fpu_registers[index]
    }

    fn set_vfp(&mut self, index: usize, value: u64) {
        self.ctx_mut().fpu_registers[index] = value;
    }

    fn cpsr(&self) -> u32 {
        self.ctx().cpsr
    }

    fn set_cpsr(&mut self, value: u32) {
        self.ctx_mut().cpsr = value;
    }

    fn save_context(&self, ctx: &mut ThreadContext) {
        *ctx = self.ctx().clone();
    }

    /// A stop requested for the previous context does not carry over
    fn load_context(&mut self, ctx: &ThreadContext) {
        self.context = Some(ctx.clone());
        self.stop_requested = false;
    }

    fn unload_context(&mut self) {
        self.context = None;
        self.stop_requested = false;
    }

    fn has_context(&self) -> bool {
        self.context.is_some()
    }

    fn set_entry_point(&mut self, entry: VmAddress) {
        self.entry_point = entry;
    }

    fn entry_point(&self) -> VmAddress {
        self.entry_point
    }

    fn set_stack_top(&mut self, top: VmAddress) {
        self.stack_top = top;
    }

    fn stack_top(&self) -> VmAddress {
        self.stack_top
    }

    fn instructions_executed(&self) -> u64 {
        self.executed
    }
}

/// Analyser answering from a fixed table
#[derive(Debug, Clone, Default)]
pub struct TableAnalyser {
    entries: HashMap<VmAddress, TableInstruction>,
}

#[derive(Debug, Clone)]
struct TableInstruction {
    mnemonic: String,
    read: Vec<Reg>,
    written: Vec<Reg>,
}

impl DecodedInstruction for TableInstruction {
    fn mnemonic(&self) -> String {
        self.mnemonic.clone()
    }

    fn regs_read(&self) -> Vec<Reg> {
        self.read.clone()
    }

    fn regs_written(&self) -> Vec<Reg> {
        self.written.clone()
    }

    fn instruction_set(&self) -> InstructionSet {
        InstructionSet::Arm
    }
}

impl TableAnalyser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, addr: VmAddress, mnemonic: &str, read: &[Reg], written: &[Reg]) -> Self {
        self.entries.insert(
            addr,
            TableInstruction {
                mnemonic: mnemonic.to_string(),
                read: read.to_vec(),
                written: written.to_vec(),
            },
        );
        self
    }
}

impl InstructionAnalyser for TableAnalyser {
    fn next_instruction(&mut self, addr: VmAddress) -> Option<Box<dyn DecodedInstruction>> {
        let insn = self.entries.get(&addr)?.clone();
        Some(Box::new(insn))
    }
}

/// A module whose entry point loops forever incrementing r0
pub fn test_module(uid3: u32) -> ModuleImage {
    let code = asm::assemble(&[asm::add(1), asm::jump_back(4)]);
    ModuleImage::new(
        format!("test{:08x}.exe", uid3),
        ProcessUidType::for_process(uid3),
        core_types::memory::RAM_CODE,
    )
    .with_code(code, 0)
    .with_security(SecurityInfo::new(uid3, 0, Default::default()))
}

/// Allocates a request status word in `process`, set to pending
pub fn status_word(kernel: &mut KernelSystem, process: core_types::ObjectId) -> VmAddress {
    let space = kernel
        .get::<Process>(process)
        .expect("status word owner must be a process")
        .address_space;
    let info = ChunkCreateInfo::new("RequestStatus", PAGE_SIZE).committed(0, PAGE_SIZE);
    let chunk = kernel
        .create_chunk(process, space, &info)
        .expect("status word chunk");
    let addr = kernel
        .memory()
        .chunk_base(chunk)
        .expect("status word chunk is mapped");
    kernel
        .memory_mut()
        .write_u32(space, addr, KREQUEST_PENDING as u32)
        .expect("status word is writable");
    addr
}
