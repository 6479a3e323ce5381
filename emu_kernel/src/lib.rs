//! # Emulated Kernel
//!
//! The execution core of an emulated mobile operating system: processes,
//! threads, mutexes and memory chunks, the scheduler that multiplexes guest
//! threads onto one CPU backend, and the loop that drives it all against a
//! single global clock.
//!
//! ## Philosophy
//!
//! **One logical core, one owner, no globals.**
//!
//! - Every kernel object lives in one arena owned by [`KernelSystem`] and is
//!   referred to by [`core_types::ObjectId`]
//! - Only one thread's registers are ever loaded into the CPU backend
//! - Threads yield cooperatively; nothing is preempted mid-instruction
//! - Every stateful part can be saved and restored through a
//!   [`state_stream::StateStream`]
//!
//! ## Example
//!
//! ```
//! use emu_kernel::config::SystemConfig;
//! use emu_kernel::test_utils::{test_module, ScriptedCpu};
//! use emu_kernel::{LoopOutcome, System};
//!
//! let mut system = System::new(SystemConfig::default(), Box::new(ScriptedCpu::new())).unwrap();
//! assert_eq!(system.run_once(), LoopOutcome::Idle);
//!
//! system
//!     .load("app", "C:\\sys\\bin\\app.exe", "", &test_module(0xE000_0001))
//!     .unwrap();
//! system.run_iterations(2);
//! assert!(system.kernel().current_thread().is_some());
//! ```

pub mod address_space;
pub mod chunk;
pub mod config;
pub mod diagnostics;
pub mod kernel;
pub mod mutex;
pub mod object;
pub mod process;
pub mod scheduler;
pub mod system;
pub mod test_utils;
pub mod thread;
pub mod timer;

pub use address_space::{AddressSpaceEvent, MemorySystem};
pub use chunk::{Chunk, ChunkCreateInfo};
pub use config::{KernelConfig, Personality, SystemConfig};
pub use kernel::KernelSystem;
pub use mutex::{Mutex, MutexWait};
pub use object::{HandleTable, KernelObject, ObjectHeader};
pub use process::{ExitType, MemoryInfo, NotifyRequest, Process};
pub use scheduler::{ScheduleEvent, Scheduler};
pub use system::{LoopOutcome, System, SystemError};
pub use thread::{ProcessPriority, Thread, ThreadPriority, ThreadState, WaitReason};
pub use timer::TimingSystem;
