//! Resilience Test Utilities
//!
//! Shared helpers for the cross-crate integration tests.
//!
//! ## Test Philosophy
//!
//! - **Exactly once**: Every queued notification completes once, never twice
//! - **No partial state**: A failed load leaves nothing behind
//! - **Deterministic time**: The clock only moves when the loop iterates
//! - **Faithful snapshots**: A restored machine is indistinguishable from the saved one

use core_types::{ObjectId, VmAddress};
use emu_kernel::config::{KernelConfig, SystemConfig};
use emu_kernel::test_utils::{test_module, ScriptedCpu};
use emu_kernel::{KernelSystem, NotifyRequest, Process, System};
use hal::AddressTranslator;
use kernel_api::KernelError;

/// Boots a machine with the scripted CPU and scheduler auditing on
pub fn boot_system() -> System {
    let config = SystemConfig {
        kernel: KernelConfig::default().with_audit(true),
        ..SystemConfig::default()
    };
    System::new(config, Box::new(ScriptedCpu::new())).expect("default config is valid")
}

/// Creates a bare kernel with scheduler auditing on
pub fn boot_kernel() -> KernelSystem {
    KernelSystem::with_config(KernelConfig::default().with_audit(true))
}

/// Spawns a looping test application with the given process uid
pub fn spawn_app(kernel: &mut KernelSystem, name: &str, uid3: u32) -> Result<ObjectId, KernelError> {
    kernel.spawn_process(
        name,
        &format!("C:\\sys\\bin\\{}.exe", name),
        "",
        &test_module(uid3),
    )
}

/// Primary thread of a process
pub fn primary_thread(kernel: &KernelSystem, process: ObjectId) -> ObjectId {
    kernel
        .get::<Process>(process)
        .expect("process exists")
        .primary_thread
}

/// A request from `watcher`'s primary thread on a fresh status word
pub fn watcher_request(kernel: &mut KernelSystem, watcher: ObjectId) -> NotifyRequest {
    let status = emu_kernel::test_utils::status_word(kernel, watcher);
    NotifyRequest {
        status,
        requester: primary_thread(kernel, watcher),
    }
}

/// Current value of a request status word
pub fn read_status(kernel: &mut KernelSystem, requester: ObjectId, status: VmAddress) -> i32 {
    let space = kernel
        .thread_address_space(requester)
        .expect("requester exists");
    kernel
        .memory_mut()
        .read_u32(space, status)
        .expect("status word is mapped") as i32
}
