//! # Kernel System
//!
//! The explicit kernel context. Every operation that creates, looks up or
//! links kernel objects takes a `&mut KernelSystem`; there is no global
//! state. Its lifetime is the emulated machine's lifetime.
//!
//! ## Philosophy
//!
//! - **One owner**: The kernel system is the only creator and destroyer of
//!   kernel objects. Everything else holds ids or handles.
//! - **One loaded context**: At most one thread's registers live in the CPU
//!   backend at a time; [`KernelSystem::reschedule`] is the only place that
//!   swaps them.
//! - **Exactly-once completion**: A notification request is completed by
//!   removing it from its queue first, so it cannot be completed twice.
//!
//! Process-specific operations live in [`crate::process`].

use crate::address_space::MemorySystem;
use crate::config::KernelConfig;
use crate::mutex::{Mutex, MutexWait};
use crate::object::{HandleTable, KernelObjectKind, ObjectHeader, ObjectTable};
use crate::process::{NotifyRequest, Process};
use crate::scheduler::Scheduler;
use crate::thread::{Thread, ThreadState, WaitReason};
use core_types::{AccessType, AddressSpaceId, Handle, ObjectId, VmAddress};
use hal::{AddressTranslator, CpuBackend};
use kernel_api::KernelError;
use state_stream::StateStream;

/// Kernel-wide state
pub struct KernelSystem {
    config: KernelConfig,
    pub(crate) objects: ObjectTable,
    global_handles: HandleTable,
    pub(crate) memory: MemorySystem,
    pub(crate) scheduler: Scheduler,
    /// Thread whose context is loaded in the CPU backend
    loaded_thread: Option<ObjectId>,
}

impl KernelSystem {
    pub fn new() -> Self {
        Self::with_config(KernelConfig::default())
    }

    pub fn with_config(config: KernelConfig) -> Self {
        Self {
            memory: MemorySystem::new(config.memory_model, config.eka1_memory_map()),
            scheduler: Scheduler::with_config(config.scheduler.clone()),
            objects: ObjectTable::new(),
            global_handles: HandleTable::global(),
            loaded_thread: None,
            config,
        }
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn is_eka1(&self) -> bool {
        self.config.personality.is_eka1()
    }

    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    pub fn memory(&self) -> &MemorySystem {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemorySystem {
        &mut self.memory
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn scheduler_mut(&mut self) -> &mut Scheduler {
        &mut self.scheduler
    }

    /// Creates and registers a kernel object
    ///
    /// `build` receives the id the object will be registered under.
    pub fn create<T, F>(&mut self, build: F) -> ObjectId
    where
        T: KernelObjectKind,
        F: FnOnce(ObjectId) -> T,
    {
        let uid = self.objects.create(build);
        log::debug!("Created {} {}", T::TYPE, uid);
        uid
    }

    pub fn get<T: KernelObjectKind>(&self, uid: ObjectId) -> Result<&T, KernelError> {
        self.objects.get(uid)
    }

    pub fn get_mut<T: KernelObjectKind>(&mut self, uid: ObjectId) -> Result<&mut T, KernelError> {
        self.objects.get_mut(uid)
    }

    /// Opens a kernel-wide handle
    pub fn open_global_handle(&mut self, object: ObjectId) -> Result<Handle, KernelError> {
        self.objects.object(object)?;
        Ok(self.global_handles.add(object))
    }

    pub fn close_global_handle(&mut self, handle: Handle) -> Result<ObjectId, KernelError> {
        self.global_handles
            .close(handle)
            .ok_or(KernelError::InvalidHandle(handle))
    }

    pub(crate) fn global_handles(&self) -> &HandleTable {
        &self.global_handles
    }

    pub(crate) fn forget_global_handles(&mut self, object: ObjectId) {
        self.global_handles.close_all(object);
    }

    /// Creates a mutex owned by `owner`
    pub fn create_mutex(
        &mut self,
        owner: ObjectId,
        name: impl Into<String>,
        access: AccessType,
    ) -> ObjectId {
        let name = name.into();
        self.create(|uid| Mutex::new(ObjectHeader::new(uid, name, owner, access)))
    }

    /// The running thread, if any
    pub fn current_thread(&self) -> Option<ObjectId> {
        self.scheduler.current()
    }

    /// The process owning the running thread, if any
    pub fn current_process(&self) -> Option<ObjectId> {
        let thread = self.current_thread()?;
        self.get::<Thread>(thread).ok().map(|t| t.process)
    }

    /// A notification request from the running thread for `status`
    pub fn current_request(&self, status: VmAddress) -> Result<NotifyRequest, KernelError> {
        let requester = self.current_thread().ok_or(KernelError::NoCurrentThread)?;
        Ok(NotifyRequest { status, requester })
    }

    /// Address space a thread executes in
    pub fn thread_address_space(&self, thread: ObjectId) -> Result<AddressSpaceId, KernelError> {
        let process = self.get::<Thread>(thread)?.process;
        Ok(self.get::<Process>(process)?.address_space)
    }

    pub fn thread_state(&self, thread: ObjectId) -> Option<ThreadState> {
        self.scheduler.state(thread)
    }

    /// Acquires a mutex for `thread`, blocking it if the mutex is held
    pub fn mutex_wait(&mut self, mutex: ObjectId, thread: ObjectId) -> Result<MutexWait, KernelError> {
        self.get::<Thread>(thread)?;
        let priority = self.scheduler.priority(thread).unwrap_or_default();

        let outcome = self.get_mut::<Mutex>(mutex)?.acquire(thread, priority);
        if outcome == MutexWait::Blocked {
            self.scheduler.block(thread, WaitReason::Mutex(mutex));
        }
        Ok(outcome)
    }

    /// Releases a mutex held by `thread`, waking the next holder
    pub fn mutex_signal(
        &mut self,
        mutex: ObjectId,
        thread: ObjectId,
    ) -> Result<Option<ObjectId>, KernelError> {
        let next = self.get_mut::<Mutex>(mutex)?.release(thread)?;
        if let Some(next) = next {
            self.scheduler.wake(next);
        }
        Ok(next)
    }

    /// Consumes a request signal, blocking the thread if none is pending
    pub fn wait_for_request(&mut self, thread: ObjectId) -> Result<bool, KernelError> {
        let blocks = self.get_mut::<Thread>(thread)?.wait_for_request();
        if blocks {
            self.scheduler.block(thread, WaitReason::Request);
        }
        Ok(blocks)
    }

    /// Signals a thread's request semaphore, waking it if it was waiting
    pub fn signal_request(&mut self, thread: ObjectId) -> Result<bool, KernelError> {
        let releases = self.get_mut::<Thread>(thread)?.signal_request();
        if releases
            && self.scheduler.state(thread) == Some(ThreadState::Blocked(WaitReason::Request))
        {
            self.scheduler.wake(thread);
        }
        Ok(releases)
    }

    /// Completes a notification request with `code`
    ///
    /// The code is written to the status word in the requester's address
    /// space and the requester's request semaphore is signalled. A
    /// requester that no longer exists is skipped.
    pub fn complete_notify(&mut self, request: NotifyRequest, code: i32) {
        let space = match self.thread_address_space(request.requester) {
            Ok(space) => space,
            Err(e) => {
                log::warn!("Dropping completion for {}: {}", request.requester, e);
                return;
            }
        };

        if let Err(e) = self.memory.write_u32(space, request.status, code as u32) {
            log::warn!(
                "Status word {:#x} of {} is not writable: {}",
                request.status,
                request.requester,
                e
            );
        }
        // The requester was resolved above
        let _ = self.signal_request(request.requester);
    }

    /// Selects the next thread and swaps contexts in the CPU backend
    ///
    /// The context of the previously loaded thread is saved back into its
    /// thread object first. When nothing is ready the backend is left
    /// without a context.
    pub fn reschedule(&mut self, cpu: &mut dyn CpuBackend) -> Option<ObjectId> {
        self.sync_context(cpu);
        self.loaded_thread = None;

        let next = self.scheduler.reschedule();
        let Some(next) = next else {
            if cpu.has_context() {
                cpu.unload_context();
            }
            return None;
        };

        match self.objects.get::<Thread>(next) {
            Ok(thread) => {
                log::debug!("Switching to thread {} ({})", thread.header.name, next);
                cpu.load_context(&thread.context);
                self.loaded_thread = Some(next);
                Some(next)
            }
            Err(e) => {
                log::warn!("Scheduled thread vanished: {}", e);
                self.scheduler.unregister(next);
                if cpu.has_context() {
                    cpu.unload_context();
                }
                None
            }
        }
    }

    /// Copies the backend's registers into the loaded thread
    pub fn sync_context(&mut self, cpu: &dyn CpuBackend) {
        let Some(loaded) = self.loaded_thread else {
            return;
        };
        if !cpu.has_context() {
            return;
        }
        if let Ok(thread) = self.objects.get_mut::<Thread>(loaded) {
            cpu.save_context(&mut thread.context);
        }
    }

    /// Thread whose context is in the CPU backend
    pub fn loaded_thread(&self) -> Option<ObjectId> {
        self.loaded_thread
    }

    /// Saves or loads the whole kernel
    ///
    /// Cross references between objects are checked after loading; dangling
    /// ones are dropped with a warning.
    pub fn do_state(&mut self, stream: &mut StateStream) {
        self.memory.do_state(stream);

        stream.section("Kernel", 1, |s| {
            self.objects.do_state(s);
            self.global_handles.do_state(s);
            s.absorb(&mut self.loaded_thread);
        });

        self.scheduler.do_state(stream);

        if stream.is_reading() && !stream.is_failed() {
            self.resolve_references();
        }
    }

    fn resolve_references(&mut self) {
        let threads = self.objects.ids_of::<Thread>();
        let processes = self.objects.ids_of::<Process>();

        for id in processes {
            let Ok(process) = self.objects.get::<Process>(id) else {
                continue;
            };
            let mut live = process.threads.clone();
            live.retain(|t| threads.contains(t));
            if live.len() != process.threads.len() {
                log::warn!("Process {} lists threads that were not restored", id);
            }
            for (what, target) in [
                ("primary thread", process.primary_thread),
                ("dll lock", process.dll_lock),
                ("rom bss chunk", process.rom_bss_chunk),
            ] {
                if !target.is_none() && !self.objects.contains(target) {
                    log::warn!("Process {} refers to missing {} {}", id, what, target);
                }
            }
            if let Ok(process) = self.objects.get_mut::<Process>(id) {
                process.threads = live;
            }
        }

        let known: Vec<ObjectId> = self.scheduler.threads().collect();
        for thread in known {
            if !self.objects.contains(thread) {
                log::warn!("Scheduler tracks missing thread {}", thread);
                self.scheduler.unregister(thread);
            }
        }
        if let Some(loaded) = self.loaded_thread {
            if !self.objects.contains(loaded) {
                self.loaded_thread = None;
            }
        }
    }

    /// Tears down every object and address space
    pub fn shutdown(&mut self) {
        log::info!("Kernel shutting down with {} objects", self.objects.len());
        self.objects.clear();
        self.global_handles = HandleTable::global();
        self.memory = MemorySystem::new(self.config.memory_model, self.config.eka1_memory_map());
        self.scheduler = Scheduler::with_config(self.config.scheduler.clone());
        self.loaded_thread = None;
    }
}

impl Default for KernelSystem {
    fn default() -> Self {
        Self::new()
    }
}
