//! Instruction tracing on top of an [`InstructionAnalyser`]
//!
//! Nothing here is needed to execute guest code.

use core_types::VmAddress;
use hal::{InstructionAnalyser, Reg};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One decoded instruction, detached from the analyser
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstructionTrace {
    pub address: VmAddress,
    pub mnemonic: String,
    pub regs_read: Vec<Reg>,
    pub regs_written: Vec<Reg>,
    pub size: u32,
}

fn write_regs(f: &mut fmt::Formatter<'_>, regs: &[Reg]) -> fmt::Result {
    for (i, reg) in regs.iter().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "{}", reg)?;
    }
    Ok(())
}

impl fmt::Display for InstructionTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}: {} [r: ", self.address, self.mnemonic)?;
        write_regs(f, &self.regs_read)?;
        write!(f, "] [w: ")?;
        write_regs(f, &self.regs_written)?;
        write!(f, "]")
    }
}

/// Decodes the instruction at `addr`
///
/// Returns `None` when the analyser cannot continue there.
pub fn trace_instruction(
    analyser: &mut dyn InstructionAnalyser,
    addr: VmAddress,
) -> Option<InstructionTrace> {
    let insn = analyser.next_instruction(addr)?;
    let trace = InstructionTrace {
        address: addr,
        mnemonic: insn.mnemonic(),
        regs_read: insn.regs_read(),
        regs_written: insn.regs_written(),
        size: insn.size(),
    };
    log::trace!("{}", trace);
    Some(trace)
}

/// Decodes up to `max` consecutive instructions starting at `start`
pub fn trace_block(
    analyser: &mut dyn InstructionAnalyser,
    start: VmAddress,
    max: usize,
) -> Vec<InstructionTrace> {
    let mut traces = Vec::new();
    let mut addr = start;
    while traces.len() < max {
        let Some(trace) = trace_instruction(analyser, addr) else {
            break;
        };
        addr = addr.wrapping_add(trace.size);
        traces.push(trace);
    }
    traces
}
