//! # Hardware Abstraction Layer (HAL)
//!
//! This crate defines the seams between the emulated kernel and the
//! machinery that actually executes guest code.
//!
//! ## Philosophy
//!
//! **The execution engine must be fully abstracted and swappable.**
//!
//! The kernel never knows whether instructions are interpreted, recompiled
//! or scripted by a test. Everything it needs from the engine goes through
//! [`CpuBackend`], and everything the engine needs from the machine goes
//! through a [`CpuBus`].
//!
//! ## Design Principles
//!
//! 1. **Trait-based**: Clock, memory and decoding are traits, not globals
//! 2. **Single context**: At most one thread's registers are loaded at a time
//! 3. **Cooperative**: Engines yield at instruction boundaries, never preempted
//! 4. **Testable**: Every seam can be mocked for testing

pub mod analyser;
pub mod cpu;
pub mod memory;
pub mod timer;

pub use analyser::{DecodedInstruction, InstructionAnalyser, InstructionSet, Reg};
pub use cpu::{CpuBackend, CpuBus, StopReason, ThreadContext};
pub use memory::AddressTranslator;
pub use timer::Clock;
