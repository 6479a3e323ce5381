//! # Execution Loop
//!
//! [`System`] owns the whole emulated machine: the global clock, the kernel
//! (and through it the memory system), one CPU backend and an optional
//! instruction analyser.
//!
//! ## Design
//!
//! Each call to [`System::run_once`] is one iteration:
//!
//! 1. Without a current thread the clock advances in idle mode and a
//!    reschedule is requested from the backend.
//! 2. Otherwise the clock opens a new slice and the backend runs the
//!    current thread until it yields.
//! 3. The kernel reschedules and the pending flag is cleared.
//!
//! The clock therefore moves forward once per iteration whether or not
//! anything executed: a run that stops before its first instruction is
//! charged one cycle. A thread that faults takes its process down with a
//! panic exit, so it is never selected again.

use crate::config::{ConfigError, SystemConfig};
use crate::diagnostics::{trace_instruction, InstructionTrace};
use crate::kernel::KernelSystem;
use crate::process::ExitType;
use crate::thread::Thread;
use crate::timer::TimingSystem;
use core_types::{MachineId, ObjectId};
use hal::{Clock, CpuBackend, CpuBus, InstructionAnalyser, StopReason};
use kernel_api::status::KERN_EXEC_EXCEPTION;
use kernel_api::{CodeSegment, KernelError};
use state_stream::{StateStream, StreamError};
use std::path::Path;
use thiserror::Error;

/// First word of every machine snapshot
pub const SNAPSHOT_MAGIC: u32 = 0x4B53_4E50;
/// Layout version of the snapshot as a whole
pub const SNAPSHOT_FORMAT: u32 = 1;

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    /// No thread was current; the clock advanced without executing
    Idle,
    /// The current thread ran until the backend stopped for this reason
    Ran(StopReason),
}

#[derive(Debug, Error)]
pub enum SystemError {
    #[error(transparent)]
    Kernel(#[from] KernelError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Snapshot error: {0}")]
    Snapshot(#[from] StreamError),

    #[error("Not a machine snapshot")]
    BadHeader,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct System {
    timing: TimingSystem,
    kernel: KernelSystem,
    cpu: Box<dyn CpuBackend>,
    analyser: Option<Box<dyn InstructionAnalyser>>,
    machine_id: MachineId,
    /// Machine that wrote the last snapshot loaded into this one
    restored_from: Option<MachineId>,
    reschedule_pending: bool,
    iterations: u64,
}

impl System {
    /// Boots an empty machine
    pub fn new(config: SystemConfig, cpu: Box<dyn CpuBackend>) -> Result<Self, SystemError> {
        config.validate()?;
        log::info!(
            "Booting {:?} kernel on the {} memory model",
            config.kernel.personality,
            config.kernel.memory_model
        );

        Ok(Self {
            timing: TimingSystem::with_config(config.timing),
            kernel: KernelSystem::with_config(config.kernel),
            cpu,
            analyser: None,
            machine_id: MachineId::new(),
            restored_from: None,
            reschedule_pending: false,
            iterations: 0,
        })
    }

    /// Attaches an instruction analyser for tracing
    pub fn with_analyser(mut self, analyser: Box<dyn InstructionAnalyser>) -> Self {
        self.analyser = Some(analyser);
        self
    }

    pub fn kernel(&self) -> &KernelSystem {
        &self.kernel
    }

    pub fn kernel_mut(&mut self) -> &mut KernelSystem {
        &mut self.kernel
    }

    pub fn timing(&self) -> &TimingSystem {
        &self.timing
    }

    pub fn cpu(&self) -> &dyn CpuBackend {
        self.cpu.as_ref()
    }

    pub fn cpu_mut(&mut self) -> &mut dyn CpuBackend {
        self.cpu.as_mut()
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn restored_from(&self) -> Option<MachineId> {
        self.restored_from
    }

    /// Global clock reading
    pub fn ticks(&self) -> u64 {
        self.timing.ticks()
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn reschedule_pending(&self) -> bool {
        self.reschedule_pending
    }

    /// Spawns a process from a loaded module and makes it runnable
    pub fn load(
        &mut self,
        name: &str,
        exe_path: &str,
        cmd_args: &str,
        codeseg: &dyn CodeSegment,
    ) -> Result<ObjectId, KernelError> {
        let process = self
            .kernel
            .spawn_process(name, exe_path, cmd_args, codeseg)?;
        self.kernel.run_process(process)?;
        Ok(process)
    }

    /// Requests a reschedule at the backend's next safe boundary
    pub fn prepare_reschedule(&mut self) {
        self.cpu.prepare_rescheduling();
        self.reschedule_pending = true;
    }

    /// Runs one iteration of the execution loop
    pub fn run_once(&mut self) -> LoopOutcome {
        let before = self.timing.ticks();

        let outcome = match self.kernel.current_thread() {
            None => {
                self.timing.idle();
                self.timing.advance();
                self.prepare_reschedule();
                LoopOutcome::Idle
            }
            Some(thread) => {
                self.timing.advance();
                let reason = self.run_thread(thread);
                if self.timing.ticks() == before {
                    self.timing.consume(1);
                }
                if reason == StopReason::Fault {
                    self.panic_thread_process(thread);
                }
                LoopOutcome::Ran(reason)
            }
        };

        self.kernel.reschedule(self.cpu.as_mut());
        self.reschedule_pending = false;

        let after = self.timing.ticks();
        self.kernel.scheduler_mut().on_tick_advanced(after - before);
        self.iterations += 1;
        outcome
    }

    fn run_thread(&mut self, thread: ObjectId) -> StopReason {
        let space = match self.kernel.thread_address_space(thread) {
            Ok(space) => space,
            Err(e) => {
                log::warn!("Current thread {} has no address space: {}", thread, e);
                return StopReason::Fault;
            }
        };

        let mut bus = CpuBus::new(&mut self.timing, &mut self.kernel.memory, space);
        if let Some(analyser) = self.analyser.as_deref_mut() {
            bus = bus.with_analyser(analyser);
        }
        let reason = self.cpu.run(&mut bus);
        if reason == StopReason::Fault {
            log::warn!("Thread {} faulted at {:#x}", thread, self.cpu.pc());
        }
        reason
    }

    /// Kills the process owning a faulted thread
    fn panic_thread_process(&mut self, thread: ObjectId) {
        let Ok(process) = self.kernel.get::<Thread>(thread).map(|t| t.process) else {
            return;
        };
        if let Err(e) = self
            .kernel
            .kill_process(process, ExitType::Panic, KERN_EXEC_EXCEPTION)
        {
            log::warn!("Could not panic process {}: {}", process, e);
        }
    }

    /// Runs `count` iterations
    pub fn run_iterations(&mut self, count: usize) -> Vec<LoopOutcome> {
        (0..count).map(|_| self.run_once()).collect()
    }

    /// Decodes the instruction the loaded thread is about to execute
    pub fn trace_current(&mut self) -> Option<InstructionTrace> {
        if !self.cpu.has_context() {
            return None;
        }
        let pc = self.cpu.pc();
        let analyser = self.analyser.as_deref_mut()?;
        trace_instruction(analyser, pc)
    }

    fn do_state(&mut self, stream: &mut StateStream) -> Option<MachineId> {
        let mut magic = SNAPSHOT_MAGIC;
        let mut format = SNAPSHOT_FORMAT;
        let mut machine = self.machine_id;
        stream.section("Machine", 1, |s| {
            s.absorb(&mut magic);
            s.absorb(&mut format);
            s.absorb(&mut machine);
        });
        if magic != SNAPSHOT_MAGIC || format > SNAPSHOT_FORMAT {
            return None;
        }

        self.timing.do_state(stream);
        self.kernel.do_state(stream);
        stream.section("System", 1, |s| {
            s.absorb(&mut self.reschedule_pending);
            s.absorb(&mut self.iterations);
        });
        Some(machine)
    }

    /// Serializes the whole machine
    pub fn save_state(&mut self) -> Vec<u8> {
        self.kernel.sync_context(self.cpu.as_ref());
        let mut stream = StateStream::writer();
        self.do_state(&mut stream);
        stream.into_bytes()
    }

    /// Restores a machine saved by [`System::save_state`]
    ///
    /// Sections are read in order; state restored before a failing section
    /// is kept and the error is reported. Either way the backend ends up
    /// holding the context of the thread the scheduler considers current.
    pub fn load_state(&mut self, bytes: &[u8]) -> Result<(), SystemError> {
        self.kernel.sync_context(self.cpu.as_ref());
        let mut stream = StateStream::reader(bytes.to_vec());
        let machine = self.do_state(&mut stream);
        self.restore_cpu_context();

        if let Some(error) = stream.error() {
            return Err(error.clone().into());
        }
        let machine = machine.ok_or(SystemError::BadHeader)?;

        self.restored_from = Some(machine);
        log::info!("Restored machine state saved by {}", machine);
        Ok(())
    }

    /// Puts the loaded thread's registers back into the backend
    fn restore_cpu_context(&mut self) {
        let context = self
            .kernel
            .loaded_thread()
            .and_then(|thread| self.kernel.get::<Thread>(thread).ok())
            .map(|thread| thread.context.clone());

        match context {
            Some(context) => self.cpu.load_context(&context),
            None => {
                if self.cpu.has_context() {
                    self.cpu.unload_context();
                }
            }
        }

        let current = self.kernel.current_thread();
        if current != self.kernel.loaded_thread()
            || (current.is_some() && !self.cpu.has_context())
        {
            log::warn!("Restored scheduler and CPU disagree; rescheduling");
            self.kernel.reschedule(self.cpu.as_mut());
        }
    }

    /// SHA-256 of the serialized machine, as hex
    pub fn state_digest(&mut self) -> String {
        self.kernel.sync_context(self.cpu.as_ref());
        let mut stream = StateStream::writer();
        self.do_state(&mut stream);
        stream.digest_hex()
    }

    pub fn save_to_path(&mut self, path: impl AsRef<Path>) -> Result<(), SystemError> {
        let bytes = self.save_state();
        std::fs::write(path, bytes)?;
        Ok(())
    }

    pub fn load_from_path(&mut self, path: impl AsRef<Path>) -> Result<(), SystemError> {
        let bytes = std::fs::read(path)?;
        self.load_state(&bytes)
    }

    /// Tears the machine down
    pub fn shutdown(&mut self) {
        self.kernel.shutdown();
        if self.cpu.has_context() {
            self.cpu.unload_context();
        }
        self.reschedule_pending = false;
    }
}
