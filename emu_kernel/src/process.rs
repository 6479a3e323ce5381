//! # Process Entity & Lifecycle
//!
//! A process is one guest address space plus the threads, handles and
//! notification queues that live in it.
//!
//! ## Lifecycle
//!
//! 1. [`KernelSystem::create_process`] makes the address space and the ROM
//!    BSS shadow chunk. The process has no code and no threads yet.
//! 2. [`KernelSystem::construct_with_codeseg`] maps the loaded module,
//!    spawns the primary thread ("Main") at the module's entry point and
//!    creates the DLL lock mutex.
//! 3. [`KernelSystem::run_process`] hands the primary thread to the
//!    scheduler.
//! 4. When the last thread exits, every logon and rendezvous request is
//!    completed with the exit reason.
//! 5. [`KernelSystem::destroy_process`] reaps the exited process.
//!
//! ## Notifications
//!
//! A logon request asks to be told when the process exits; a rendezvous
//! request asks to be told when the process signals that it started. Each
//! request pairs a status word address with the requesting thread. A
//! request is removed from its queue before it is completed, so it is
//! completed exactly once.

use crate::chunk::{Chunk, ChunkCreateInfo};
use crate::kernel::KernelSystem;
use crate::mutex::MutexWait;
use crate::object::{HandleTable, ObjectHeader};
use crate::thread::{ProcessPriority, Thread, ThreadPriority, ThreadState, WaitReason};
use core_types::memory::MAX_ROM_BSS_SECT_SIZE;
use core_types::{
    page_align_up, AccessType, AddressSpaceId, CapabilitySet, ChunkAccess, ChunkType, Handle,
    ObjectId, ProcessUidType, Protection, SecurityInfo, SecurityPolicy, VmAddress,
};
use hal::AddressTranslator;
use kernel_api::status::KERR_CANCEL;
use kernel_api::{CodeSegment, KernelError};
use state_stream::{Absorb, StateStream};

/// Number of argument slots of a process
pub const ARG_SLOT_COUNT: usize = 16;

/// How a process or thread ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ExitType {
    /// Still running
    #[default]
    Pending,
    Kill,
    Terminate,
    Panic,
}

impl ExitType {
    fn to_raw(self) -> u8 {
        match self {
            ExitType::Kill => 0,
            ExitType::Terminate => 1,
            ExitType::Panic => 2,
            ExitType::Pending => 3,
        }
    }

    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => ExitType::Kill,
            1 => ExitType::Terminate,
            2 => ExitType::Panic,
            _ => ExitType::Pending,
        }
    }
}

/// A queued logon or rendezvous request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NotifyRequest {
    /// Guest address of the request status word
    pub status: VmAddress,
    /// Thread to signal on completion
    pub requester: ObjectId,
}

impl Absorb for NotifyRequest {
    fn absorb(&mut self, stream: &mut StateStream) {
        stream.absorb(&mut self.status);
        stream.absorb(&mut self.requester);
    }
}

/// One startup argument slot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassArg {
    pub used: bool,
    pub data: Vec<u8>,
}

impl PassArg {
    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("PassArg", 1, |s| {
            s.absorb(&mut self.used);
            s.absorb(&mut self.data);
        });
    }
}

/// Run-time addresses of the process image
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryInfo {
    pub rt_code_addr: VmAddress,
    pub rt_const_data_addr: VmAddress,
    pub rt_bss_addr: VmAddress,
    pub rt_bss_size: u32,
}

/// What the process keeps of its loaded module
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct CodeSegInfo {
    name: String,
    code_run_address: VmAddress,
    entry_point: VmAddress,
    data_run_address: VmAddress,
    bss_size: u32,
    heap_min: u32,
    heap_max: u32,
    code_chunk: ObjectId,
    data_chunk: ObjectId,
}

impl Absorb for CodeSegInfo {
    fn absorb(&mut self, stream: &mut StateStream) {
        stream.absorb(&mut self.name);
        stream.absorb(&mut self.code_run_address);
        stream.absorb(&mut self.entry_point);
        stream.absorb(&mut self.data_run_address);
        stream.absorb(&mut self.bss_size);
        stream.absorb(&mut self.heap_min);
        stream.absorb(&mut self.heap_max);
        stream.absorb(&mut self.code_chunk);
        stream.absorb(&mut self.data_chunk);
    }
}

#[derive(Debug, Clone, Default)]
pub struct Process {
    pub header: ObjectHeader,
    pub process_name: String,
    pub exe_path: String,
    pub cmd_args: String,
    /// Process uid, the third uid of the image
    pub puid: u32,
    pub image_uids: ProcessUidType,
    pub sec_info: SecurityInfo,
    security_bypass: bool,
    pub priority: ProcessPriority,
    pub exit_type: ExitType,
    pub exit_reason: i32,
    pub flags: u32,
    args: [PassArg; ARG_SLOT_COUNT],
    pub process_handles: HandleTable,
    /// Live threads, in creation order
    pub threads: Vec<ObjectId>,
    pub primary_thread: ObjectId,
    pub thread_count: u32,
    pub dll_lock: ObjectId,
    pub rom_bss_chunk: ObjectId,
    pub address_space: AddressSpaceId,
    logon_requests: Vec<NotifyRequest>,
    rendezvous_requests: Vec<NotifyRequest>,
    code: Option<CodeSegInfo>,
}

impl Process {
    /// Stores `data` in an unused slot
    ///
    /// Writes to a used slot or a slot past the last one are ignored.
    pub fn set_arg_slot(&mut self, slot: usize, data: &[u8]) {
        let Some(arg) = self.args.get_mut(slot) else {
            return;
        };
        if arg.used {
            return;
        }
        arg.data = data.to_vec();
        arg.used = true;
    }

    pub fn get_arg_slot(&self, slot: usize) -> Option<&PassArg> {
        self.args.get(slot)
    }

    pub fn uid_type(&self) -> ProcessUidType {
        ProcessUidType::for_process(self.puid)
    }

    pub fn is_constructed(&self) -> bool {
        self.code.is_some()
    }

    /// True once the process ran and its last thread exited
    pub fn has_exited(&self) -> bool {
        self.is_constructed() && self.thread_count == 0
    }

    pub fn pending_logons(&self) -> usize {
        self.logon_requests.len()
    }

    pub fn pending_rendezvous(&self) -> usize {
        self.rendezvous_requests.len()
    }

    /// Queues a request, or returns the code to complete it with right away
    /// when the process has no threads left
    pub fn logon(&mut self, request: NotifyRequest, rendezvous: bool) -> Option<i32> {
        if self.thread_count == 0 {
            return Some(self.exit_reason);
        }

        if rendezvous {
            self.rendezvous_requests.push(request);
        } else {
            self.logon_requests.push(request);
        }
        None
    }

    /// Removes the first queued request equal to `request`
    pub fn logon_cancel(&mut self, request: NotifyRequest, rendezvous: bool) -> Option<NotifyRequest> {
        let queue = if rendezvous {
            &mut self.rendezvous_requests
        } else {
            &mut self.logon_requests
        };
        let position = queue.iter().position(|r| *r == request)?;
        Some(queue.remove(position))
    }

    /// Records a rendezvous and takes every queued rendezvous request
    pub fn rendezvous(&mut self, reason: i32) -> Vec<NotifyRequest> {
        self.exit_reason = reason;
        self.exit_type = ExitType::Pending;
        std::mem::take(&mut self.rendezvous_requests)
    }

    /// Takes every queued logon, then every queued rendezvous request
    pub fn finish_logons(&mut self) -> Vec<NotifyRequest> {
        let mut requests = std::mem::take(&mut self.logon_requests);
        requests.append(&mut self.rendezvous_requests);
        requests
    }

    /// Checks the process against a security policy
    ///
    /// On failure `missing` receives what the process lacks. Always passes
    /// when the security bypass is on.
    pub fn satisfy(&self, policy: &SecurityPolicy, missing: Option<&mut SecurityInfo>) -> bool {
        if self.security_bypass {
            return true;
        }
        let mut holder = SecurityInfo::default();
        policy.check(&self.sec_info, missing.unwrap_or(&mut holder))
    }

    pub fn has(&self, caps: &CapabilitySet) -> bool {
        if self.security_bypass {
            return true;
        }
        self.sec_info.has(caps)
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Process", 1, |s| {
            s.absorb(&mut self.puid);
            s.absorb(&mut self.primary_thread);
            s.absorb(&mut self.thread_count);
            s.absorb(&mut self.flags);

            let mut priority = self.priority.value();
            s.absorb(&mut priority);
            self.priority = ProcessPriority::from_value(priority).unwrap_or_default();

            s.absorb(&mut self.exit_reason);

            let mut exit_type = self.exit_type.to_raw();
            s.absorb(&mut exit_type);
            self.exit_type = ExitType::from_raw(exit_type);

            s.absorb(&mut self.process_name);
            s.absorb(&mut self.exe_path);
            s.absorb(&mut self.cmd_args);
            self.process_handles.do_state(s);

            for arg in self.args.iter_mut() {
                arg.do_state(s);
            }

            s.absorb(&mut self.threads);
            s.absorb(&mut self.dll_lock);
            s.absorb(&mut self.rom_bss_chunk);
            s.absorb(&mut self.address_space);

            s.absorb(&mut self.image_uids.uid1);
            s.absorb(&mut self.image_uids.uid2);
            s.absorb(&mut self.image_uids.uid3);
            s.absorb(&mut self.sec_info.secure_id);
            s.absorb(&mut self.sec_info.vendor_id);
            let mut caps = self.sec_info.caps.bits();
            s.absorb(&mut caps);
            self.sec_info.caps = CapabilitySet::from_bits(caps);
            s.absorb(&mut self.security_bypass);

            s.absorb(&mut self.logon_requests);
            s.absorb(&mut self.rendezvous_requests);
            s.absorb(&mut self.code);
        });
    }
}

impl KernelSystem {
    /// Creates an empty process with its address space and ROM BSS chunk
    pub fn create_process(
        &mut self,
        name: &str,
        exe_path: &str,
        cmd_args: &str,
    ) -> Result<ObjectId, KernelError> {
        let name = name.strip_suffix('\0').unwrap_or(name).to_string();
        let uid = self.objects.reserve_id();
        let space = self.memory.create_address_space(uid);

        let rom_bss = ChunkCreateInfo::new(
            format!("RomBssChunkProcess{}", uid.as_raw()),
            MAX_ROM_BSS_SECT_SIZE,
        )
        .committed(0, MAX_ROM_BSS_SECT_SIZE)
        .protection(Protection::read_write())
        .chunk_type(ChunkType::Normal)
        .access(ChunkAccess::DllStaticData)
        .at(self.memory.rom_bss_address());

        let rom_bss_chunk = match self.create_chunk(uid, space, &rom_bss) {
            Ok(chunk) => chunk,
            Err(e) => {
                if let Err(unmap) = self.memory.destroy_address_space(space) {
                    log::warn!("Could not release address space {}: {}", space, unmap);
                }
                return Err(e);
            }
        };

        let process = Process {
            header: ObjectHeader::new(uid, name.clone(), ObjectId::NONE, AccessType::Local),
            process_name: name,
            exe_path: exe_path.to_string(),
            cmd_args: cmd_args.to_string(),
            security_bypass: self.config().security_bypass(),
            process_handles: HandleTable::local(),
            rom_bss_chunk,
            address_space: space,
            ..Default::default()
        };
        log::debug!("Created process {} ({})", process.process_name, uid);
        self.objects.insert(uid, crate::object::KernelObject::Process(Box::new(process)));
        Ok(uid)
    }

    /// Maps a chunk into `space` and registers the chunk object
    pub fn create_chunk(
        &mut self,
        owner: ObjectId,
        space: AddressSpaceId,
        info: &ChunkCreateInfo,
    ) -> Result<ObjectId, KernelError> {
        let uid = self.objects.reserve_id();
        let base = self.memory.map_chunk(space, uid, info)?;
        let header = ObjectHeader::new(uid, info.name.clone(), owner, AccessType::Local);
        self.objects.insert(
            uid,
            crate::object::KernelObject::Chunk(Chunk::new(header, info, space, base)),
        );
        Ok(uid)
    }

    /// Unmaps and forgets a chunk
    fn destroy_chunk_or_warn(&mut self, chunk: ObjectId) {
        if let Err(e) = self.destroy_chunk(chunk) {
            log::warn!("Could not destroy chunk {}: {}", chunk, e);
        }
    }

    pub fn destroy_chunk(&mut self, chunk: ObjectId) -> Result<(), KernelError> {
        self.get::<Chunk>(chunk)?;
        self.memory.unmap_chunk(chunk)?;
        self.objects.remove(chunk);
        self.forget_global_handles(chunk);
        Ok(())
    }

    /// Binds a loaded module to a process and spawns its primary thread
    ///
    /// Fails with [`KernelError::AlreadyConstructed`] if the process already
    /// has a module, leaving it untouched. On any other failure everything
    /// this call created is released again.
    pub fn construct_with_codeseg(
        &mut self,
        process: ObjectId,
        codeseg: &dyn CodeSegment,
        priority: ProcessPriority,
    ) -> Result<(), KernelError> {
        let target = self.get::<Process>(process)?;
        if target.is_constructed() {
            return Err(KernelError::AlreadyConstructed(process));
        }
        let space = target.address_space;

        codeseg.validate()?;

        let uids = codeseg.uids();
        let duplicate = self
            .objects
            .ids_of::<Process>()
            .into_iter()
            .filter(|id| *id != process)
            .filter_map(|id| self.get::<Process>(id).ok())
            .any(|p| p.is_constructed() && !p.has_exited() && p.puid == uids.uid3);
        if duplicate {
            return Err(KernelError::AlreadyExists(uids));
        }

        let mut created = Vec::new();
        let result = self.construct_inner(process, space, codeseg, priority, &mut created);
        if result.is_err() {
            self.release_partial(process, &created);
        }
        result
    }

    fn construct_inner(
        &mut self,
        process: ObjectId,
        space: AddressSpaceId,
        codeseg: &dyn CodeSegment,
        priority: ProcessPriority,
        created: &mut Vec<ObjectId>,
    ) -> Result<(), KernelError> {
        let code = codeseg.code();
        let code_size = page_align_up(code.len() as u32);
        let code_info = ChunkCreateInfo::new(format!("{}$Code", codeseg.name()), code_size)
            .committed(0, code_size)
            .protection(Protection::read_execute())
            .access(ChunkAccess::Code)
            .at(codeseg.code_run_address());
        let code_chunk = self.create_chunk(process, space, &code_info)?;
        created.push(code_chunk);
        self.memory
            .write_bytes(space, codeseg.code_run_address(), code)?;

        let mut data_chunk = ObjectId::NONE;
        let data_size = codeseg.data().len() as u32 + codeseg.bss_size();
        if data_size > 0 {
            let size = page_align_up(data_size);
            let data_info = ChunkCreateInfo::new(format!("{}$Data", codeseg.name()), size)
                .committed(0, size)
                .protection(Protection::read_write())
                .at(codeseg.data_run_address());
            data_chunk = self.create_chunk(process, space, &data_info)?;
            created.push(data_chunk);
            self.memory
                .write_bytes(space, codeseg.data_run_address(), codeseg.data())?;
        }

        let uids = codeseg.uids();
        let sec_info = codeseg.security_info();
        let eka1 = self.is_eka1();
        {
            let p = self.get_mut::<Process>(process)?;
            p.puid = uids.uid3;
            p.image_uids = uids;
            p.sec_info = sec_info;
            p.priority = priority;
            p.code = Some(CodeSegInfo {
                name: codeseg.name().to_string(),
                code_run_address: codeseg.code_run_address(),
                entry_point: codeseg.entry_point(),
                data_run_address: codeseg.data_run_address(),
                bss_size: codeseg.bss_size(),
                heap_min: codeseg.heap_size_min(),
                heap_max: codeseg.heap_size_max(),
                code_chunk,
                data_chunk,
            });

            if !eka1 {
                log::info!("Process {} capabilities: {}", p.process_name, sec_info.caps);
            }
        }

        let main = self.create_thread(
            process,
            "Main",
            codeseg.entry_point(),
            codeseg.stack_size(),
            ThreadPriority::AbsoluteForegroundNormal,
        )?;
        created.push(main);

        let puid = uids.uid3;
        let dll_lock = self.create_mutex(
            process,
            format!("dllLockMutexProcess{}", puid),
            AccessType::Local,
        );
        created.push(dll_lock);

        let p = self.get_mut::<Process>(process)?;
        p.primary_thread = main;
        p.dll_lock = dll_lock;
        Ok(())
    }

    /// Undoes a failed construction
    fn release_partial(&mut self, process: ObjectId, created: &[ObjectId]) {
        for id in created.iter().rev() {
            if self.get::<Chunk>(*id).is_ok() {
                self.destroy_chunk_or_warn(*id);
            } else if let Ok(thread) = self.get::<Thread>(*id) {
                let stack = thread.stack_chunk;
                self.scheduler.unregister(*id);
                self.objects.remove(*id);
                self.destroy_chunk_or_warn(stack);
            } else {
                self.objects.remove(*id);
            }
        }

        if let Ok(p) = self.get_mut::<Process>(process) {
            p.threads.clear();
            p.thread_count = 0;
            p.primary_thread = ObjectId::NONE;
            p.dll_lock = ObjectId::NONE;
            p.code = None;
            p.puid = 0;
            p.image_uids = ProcessUidType::default();
            p.sec_info = SecurityInfo::default();
        }
    }

    /// Creates a thread in `process` with its own stack chunk
    ///
    /// The thread is registered with the scheduler but not made ready.
    pub fn create_thread(
        &mut self,
        process: ObjectId,
        name: &str,
        entry_point: VmAddress,
        stack_size: u32,
        priority: ThreadPriority,
    ) -> Result<ObjectId, KernelError> {
        let p = self.get::<Process>(process)?;
        let space = p.address_space;
        let process_priority = p.priority;
        let (heap_min, heap_max) = p
            .code
            .as_ref()
            .map(|c| (c.heap_min, c.heap_max))
            .unwrap_or_default();

        let stack_size = page_align_up(stack_size.max(1));
        let stack_info = ChunkCreateInfo::new(format!("{}Stack", name), stack_size)
            .committed(0, stack_size)
            .protection(Protection::read_write());
        let stack_chunk = self.create_chunk(process, space, &stack_info)?;
        let stack_top = self.memory.chunk_base(stack_chunk).unwrap_or_default() + stack_size;

        let uid = self.objects.reserve_id();
        let mut thread = Thread::new(
            ObjectHeader::new(uid, name, process, AccessType::Local),
            process,
            entry_point,
            stack_top,
            priority,
        );
        thread.stack_chunk = stack_chunk;
        thread.stack_size = stack_size;
        thread.heap_min = heap_min;
        thread.heap_max = heap_max;
        self.objects
            .insert(uid, crate::object::KernelObject::Thread(Box::new(thread)));

        self.scheduler
            .register(uid, priority.effective_priority(process_priority));

        let p = self.get_mut::<Process>(process)?;
        p.threads.push(uid);
        p.thread_count += 1;
        log::debug!("Created thread {} ({}) in {}", name, uid, process);
        Ok(uid)
    }

    /// Creates a process and constructs it from `codeseg`
    ///
    /// A failure leaves no trace of the process behind.
    pub fn spawn_process(
        &mut self,
        name: &str,
        exe_path: &str,
        cmd_args: &str,
        codeseg: &dyn CodeSegment,
    ) -> Result<ObjectId, KernelError> {
        let process = self.create_process(name, exe_path, cmd_args)?;
        if let Err(e) = self.construct_with_codeseg(process, codeseg, ProcessPriority::Foreground) {
            log::warn!("Failed to construct {}: {}", name, e);
            self.discard_process(process);
            return Err(e);
        }
        log::info!("Spawned process {} ({})", name, process);
        Ok(process)
    }

    /// Makes the primary thread ready
    pub fn run_process(&mut self, process: ObjectId) -> Result<bool, KernelError> {
        let p = self.get::<Process>(process)?;
        if !p.is_constructed() {
            return Err(KernelError::NotConstructed(process));
        }
        let primary = p.primary_thread;
        Ok(self.scheduler.schedule(primary))
    }

    /// Registers a logon or rendezvous request on `process`
    ///
    /// Returns false if the process had already exited and the request was
    /// completed immediately with its exit reason.
    pub fn logon(
        &mut self,
        process: ObjectId,
        request: NotifyRequest,
        rendezvous: bool,
    ) -> Result<bool, KernelError> {
        match self.get_mut::<Process>(process)?.logon(request, rendezvous) {
            Some(code) => {
                self.complete_notify(request, code);
                Ok(false)
            }
            None => Ok(true),
        }
    }

    /// Cancels a queued request, completing it with `KErrCancel`
    pub fn logon_cancel(
        &mut self,
        process: ObjectId,
        request: NotifyRequest,
        rendezvous: bool,
    ) -> Result<bool, KernelError> {
        match self
            .get_mut::<Process>(process)?
            .logon_cancel(request, rendezvous)
        {
            Some(removed) => {
                self.complete_notify(removed, KERR_CANCEL);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Completes every queued rendezvous request with `reason`
    pub fn rendezvous(&mut self, process: ObjectId, reason: i32) -> Result<usize, KernelError> {
        let requests = self.get_mut::<Process>(process)?.rendezvous(reason);
        for request in &requests {
            if let Ok(thread) = self.get::<Thread>(request.requester) {
                log::trace!("Rendezvous to: {}", thread.header.name);
            }
            self.complete_notify(*request, reason);
        }
        Ok(requests.len())
    }

    /// Completes every queued logon and rendezvous request with the exit reason
    pub fn finish_logons(&mut self, process: ObjectId) -> Result<usize, KernelError> {
        let p = self.get_mut::<Process>(process)?;
        let reason = p.exit_reason;
        let requests = p.finish_logons();
        for request in &requests {
            self.complete_notify(*request, reason);
        }
        Ok(requests.len())
    }

    pub fn satisfy(
        &self,
        process: ObjectId,
        policy: &SecurityPolicy,
        missing: Option<&mut SecurityInfo>,
    ) -> Result<bool, KernelError> {
        Ok(self.get::<Process>(process)?.satisfy(policy, missing))
    }

    pub fn has(&self, process: ObjectId, caps: &CapabilitySet) -> Result<bool, KernelError> {
        Ok(self.get::<Process>(process)?.has(caps))
    }

    /// Like [`KernelSystem::satisfy`], failing with `PermissionDenied`
    pub fn require(&self, process: ObjectId, policy: &SecurityPolicy) -> Result<(), KernelError> {
        let mut missing = SecurityInfo::default();
        if self.satisfy(process, policy, Some(&mut missing))? {
            return Ok(());
        }
        Err(KernelError::PermissionDenied(format!(
            "process {} is missing capabilities: {}",
            process, missing.caps
        )))
    }

    /// Changes the priority class and re-resolves every thread's priority
    pub fn set_process_priority(
        &mut self,
        process: ObjectId,
        priority: ProcessPriority,
    ) -> Result<(), KernelError> {
        let p = self.get_mut::<Process>(process)?;
        p.priority = priority;
        let threads = p.threads.clone();

        for thread in threads {
            let effective = self.get::<Thread>(thread)?.priority.effective_priority(priority);
            self.scheduler.set_priority(thread, effective);
            if let Some(ThreadState::Blocked(WaitReason::Mutex(mutex))) =
                self.scheduler.state(thread)
            {
                if let Ok(m) = self.get_mut::<crate::mutex::Mutex>(mutex) {
                    m.update_waiter_priority(thread, effective);
                }
            }
        }
        Ok(())
    }

    /// Host view of guest memory in the process's address space
    pub fn process_host_slice(
        &mut self,
        process: ObjectId,
        addr: VmAddress,
    ) -> Result<Option<&mut [u8]>, KernelError> {
        let space = self.get::<Process>(process)?.address_space;
        Ok(self.memory.host_slice(space, addr))
    }

    pub fn wait_dll_lock(&mut self, process: ObjectId, thread: ObjectId) -> Result<MutexWait, KernelError> {
        let lock = self.get::<Process>(process)?.dll_lock;
        self.mutex_wait(lock, thread)
    }

    pub fn signal_dll_lock(&mut self, process: ObjectId, thread: ObjectId) -> Result<(), KernelError> {
        let lock = self.get::<Process>(process)?.dll_lock;
        self.mutex_signal(lock, thread)?;
        Ok(())
    }

    pub fn memory_info(&self, process: ObjectId) -> Result<MemoryInfo, KernelError> {
        let code = self
            .get::<Process>(process)?
            .code
            .as_ref()
            .ok_or(KernelError::NotConstructed(process))?;
        Ok(MemoryInfo {
            rt_code_addr: code.code_run_address,
            rt_const_data_addr: code.data_run_address,
            rt_bss_addr: code.data_run_address,
            rt_bss_size: code.bss_size,
        })
    }

    pub fn entry_point_address(&self, process: ObjectId) -> Result<VmAddress, KernelError> {
        self.get::<Process>(process)?
            .code
            .as_ref()
            .map(|c| c.entry_point)
            .ok_or(KernelError::NotConstructed(process))
    }

    /// Opens a process-local handle to `object`
    pub fn open_handle(&mut self, process: ObjectId, object: ObjectId) -> Result<Handle, KernelError> {
        self.objects.object(object)?;
        Ok(self.get_mut::<Process>(process)?.process_handles.add(object))
    }

    /// Resolves a handle as seen from `process`
    ///
    /// Global handles resolve through the kernel-wide table.
    pub fn get_object(&self, process: ObjectId, handle: Handle) -> Result<ObjectId, KernelError> {
        let resolved = if handle.is_global() {
            self.global_handles().get(handle)
        } else {
            self.get::<Process>(process)?.process_handles.get(handle)
        };
        resolved
            .filter(|id| self.objects.contains(*id))
            .ok_or(KernelError::InvalidHandle(handle))
    }

    /// Ends a thread
    ///
    /// When the last thread of a process exits the process exits too and
    /// its logon and rendezvous requests are completed.
    pub fn exit_thread(&mut self, thread: ObjectId, reason: i32) -> Result<(), KernelError> {
        let t = self.get_mut::<Thread>(thread)?;
        t.exit_reason = reason;
        let process = t.process;
        let stack = t.stack_chunk;

        if let Some(ThreadState::Blocked(WaitReason::Mutex(mutex))) = self.scheduler.state(thread) {
            if let Ok(m) = self.get_mut::<crate::mutex::Mutex>(mutex) {
                m.remove_waiter(thread);
            }
        }
        self.release_held_mutexes(thread);
        self.scheduler.exit(thread);
        self.scheduler.unregister(thread);
        self.objects.remove(thread);
        self.forget_global_handles(thread);
        self.destroy_chunk_or_warn(stack);

        let p = self.get_mut::<Process>(process)?;
        p.threads.retain(|t| *t != thread);
        p.thread_count = p.thread_count.saturating_sub(1);
        if p.thread_count > 0 {
            return Ok(());
        }

        if p.exit_type == ExitType::Pending {
            p.exit_type = ExitType::Kill;
            p.exit_reason = reason;
        }
        log::info!(
            "Process {} exited ({:?}, reason {})",
            p.process_name,
            p.exit_type,
            p.exit_reason
        );
        self.finish_logons(process)?;
        Ok(())
    }

    /// Hands every mutex `thread` holds to its next waiter
    fn release_held_mutexes(&mut self, thread: ObjectId) {
        for mutex in self.objects.ids_of::<crate::mutex::Mutex>() {
            loop {
                let Ok(m) = self.get::<crate::mutex::Mutex>(mutex) else {
                    break;
                };
                if m.holder() != Some(thread) {
                    break;
                }
                if self.mutex_signal(mutex, thread).is_err() {
                    break;
                }
            }
        }
    }

    /// Ends every thread of a process with the given exit type
    pub fn kill_process(
        &mut self,
        process: ObjectId,
        exit_type: ExitType,
        reason: i32,
    ) -> Result<(), KernelError> {
        let p = self.get_mut::<Process>(process)?;
        if p.has_exited() {
            return Ok(());
        }
        p.exit_type = exit_type;
        p.exit_reason = reason;
        let threads = p.threads.clone();

        for thread in threads {
            self.exit_thread(thread, reason)?;
        }
        Ok(())
    }

    /// Reaps an exited process and everything it owns
    pub fn destroy_process(&mut self, process: ObjectId) -> Result<(), KernelError> {
        let p = self.get::<Process>(process)?;
        if p.thread_count > 0 || p.pending_logons() > 0 || p.pending_rendezvous() > 0 {
            return Err(KernelError::ProcessStillAlive(process));
        }
        self.discard_process(process);
        log::debug!("Destroyed process {}", process);
        Ok(())
    }

    /// Removes a process and every object it owns, without checks
    fn discard_process(&mut self, process: ObjectId) {
        let owned: Vec<ObjectId> = self
            .objects
            .iter()
            .filter(|(_, object)| object.header().owner == process)
            .map(|(id, _)| *id)
            .collect();
        for id in owned {
            self.scheduler.unregister(id);
            self.objects.remove(id);
            self.forget_global_handles(id);
        }

        if let Ok(p) = self.get::<Process>(process) {
            let space = p.address_space;
            if let Err(e) = self.memory.destroy_address_space(space) {
                log::warn!("Could not release address space {}: {}", space, e);
            }
        }
        self.objects.remove(process);
        self.forget_global_handles(process);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, Personality};
    use crate::mutex::Mutex;
    use crate::test_utils::{status_word, test_module};
    use core_types::{Capability, MemoryError};
    use kernel_api::status::KREQUEST_PENDING;
    use kernel_api::ModuleImage;

    fn kernel() -> KernelSystem {
        KernelSystem::with_config(KernelConfig::default().with_audit(true))
    }

    fn spawn(kern: &mut KernelSystem, uid3: u32) -> ObjectId {
        kern.spawn_process("app", "C:\\sys\\bin\\app.exe", "-v", &test_module(uid3))
            .unwrap()
    }

    fn read_status(kern: &mut KernelSystem, thread: ObjectId, addr: VmAddress) -> i32 {
        let space = kern.thread_address_space(thread).unwrap();
        kern.memory_mut().read_u32(space, addr).unwrap() as i32
    }

    #[test]
    fn test_create_process_strips_nul() {
        let mut kern = kernel();
        let p = kern.create_process("app\0", "C:\\app.exe", "").unwrap();
        let process = kern.get::<Process>(p).unwrap();
        assert_eq!(process.process_name, "app");
        assert!(!process.is_constructed());
        assert_eq!(process.thread_count, 0);
    }

    #[test]
    fn test_rom_bss_chunk() {
        let mut kern = kernel();
        let p = kern.create_process("app", "C:\\app.exe", "").unwrap();
        let chunk_id = kern.get::<Process>(p).unwrap().rom_bss_chunk;
        let chunk = kern.get::<Chunk>(chunk_id).unwrap();
        assert_eq!(chunk.header.name, format!("RomBssChunkProcess{}", p.as_raw()));
        assert_eq!(chunk.base, kern.memory().rom_bss_address());
        assert_eq!(chunk.max_size, MAX_ROM_BSS_SECT_SIZE);
        assert_eq!(chunk.committed_size(), MAX_ROM_BSS_SECT_SIZE);
        assert_eq!(chunk.access, ChunkAccess::DllStaticData);
    }

    #[test]
    fn test_construct_spawns_primary_thread() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_1000);
        let process = kern.get::<Process>(p).unwrap();
        assert_eq!(process.thread_count, 1);
        assert_eq!(process.puid, 0xE000_1000);
        assert_eq!(process.uid_type(), ProcessUidType::for_process(0xE000_1000));

        let main = kern.get::<Thread>(process.primary_thread).unwrap();
        assert_eq!(main.header.name, "Main");
        assert_eq!(main.priority, ThreadPriority::AbsoluteForegroundNormal);
        assert_eq!(
            main.entry_point,
            kern.entry_point_address(p).unwrap()
        );

        let lock = kern.get::<Mutex>(process.dll_lock).unwrap();
        assert_eq!(lock.header.name, "dllLockMutexProcess3758100480");
    }

    #[test]
    fn test_construct_twice_is_rejected() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_1001);
        let objects = kern.objects().len();
        assert_eq!(
            kern.construct_with_codeseg(p, &test_module(0xE000_1002), ProcessPriority::Foreground),
            Err(KernelError::AlreadyConstructed(p))
        );
        assert_eq!(kern.objects().len(), objects);
        assert_eq!(kern.get::<Process>(p).unwrap().puid, 0xE000_1001);
    }

    #[test]
    fn test_duplicate_uid_is_rejected() {
        let mut kern = kernel();
        spawn(&mut kern, 0xE000_2000);
        let objects = kern.objects().len();
        let spaces = kern.memory().space_count();

        let err = kern
            .spawn_process("twin", "C:\\twin.exe", "", &test_module(0xE000_2000))
            .unwrap_err();
        assert!(matches!(err, KernelError::AlreadyExists(_)));
        assert_eq!(kern.objects().len(), objects);
        assert_eq!(kern.memory().space_count(), spaces);
    }

    #[test]
    fn test_failed_construction_rolls_back() {
        let mut kern = kernel();
        // Data overlapping the code forces the second mapping to fail
        let module = test_module(0xE000_3000).with_data(0x7000_0000, vec![1, 2, 3, 4], 0);
        let p = kern.create_process("bad", "C:\\bad.exe", "").unwrap();
        let objects = kern.objects().len();

        let err = kern
            .construct_with_codeseg(p, &module, ProcessPriority::Foreground)
            .unwrap_err();
        assert!(matches!(
            err,
            KernelError::Memory(MemoryError::Overlap { .. })
        ));
        assert_eq!(kern.objects().len(), objects);
        let process = kern.get::<Process>(p).unwrap();
        assert!(!process.is_constructed());
        assert_eq!(process.thread_count, 0);
    }

    #[test]
    fn test_malformed_module_is_load_failure() {
        let mut kern = kernel();
        let module = ModuleImage::new("empty", ProcessUidType::for_process(0xE000_3001), 0x7000_0000);
        let err = kern
            .spawn_process("empty", "C:\\empty.exe", "", &module)
            .unwrap_err();
        assert!(matches!(err, KernelError::LoadFailed(_)));
        assert!(kern.objects().is_empty());
        assert_eq!(kern.memory().space_count(), 0);
    }

    #[test]
    fn test_code_is_mapped() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_3002);
        let info = kern.memory_info(p).unwrap();
        let module = test_module(0xE000_3002);
        let bytes = kern.process_host_slice(p, info.rt_code_addr).unwrap().unwrap();
        assert_eq!(&bytes[..module.code.len()], module.code.as_slice());
        assert_eq!(info.rt_bss_addr, info.rt_const_data_addr);
    }

    #[test]
    fn test_memory_info_needs_code() {
        let mut kern = kernel();
        let p = kern.create_process("app", "C:\\app.exe", "").unwrap();
        assert_eq!(kern.memory_info(p), Err(KernelError::NotConstructed(p)));
        assert_eq!(kern.run_process(p), Err(KernelError::NotConstructed(p)));
    }

    #[test]
    fn test_run_process_schedules_once() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_3003);
        assert!(kern.run_process(p).unwrap());
        assert!(!kern.run_process(p).unwrap());
    }

    #[test]
    fn test_arg_slots() {
        let mut process = Process::default();
        process.set_arg_slot(3, b"first");
        process.set_arg_slot(3, b"second");
        process.set_arg_slot(16, b"ignored");
        assert_eq!(process.get_arg_slot(3).unwrap().data, b"first");
        assert!(process.get_arg_slot(3).unwrap().used);
        assert!(!process.get_arg_slot(4).unwrap().used);
        assert!(process.get_arg_slot(16).is_none());
    }

    #[test]
    fn test_logon_queues_while_alive() {
        let mut kern = kernel();
        let target = spawn(&mut kern, 0xE000_4000);
        let watcher = spawn(&mut kern, 0xE000_4001);
        let requester = kern.get::<Process>(watcher).unwrap().primary_thread;
        let status = status_word(&mut kern, watcher);

        let request = NotifyRequest { status, requester };
        assert!(kern.logon(target, request, false).unwrap());
        assert_eq!(kern.get::<Process>(target).unwrap().pending_logons(), 1);
        assert_eq!(read_status(&mut kern, requester, status), KREQUEST_PENDING);
    }

    #[test]
    fn test_logon_cancel_completes_with_cancel() {
        let mut kern = kernel();
        let target = spawn(&mut kern, 0xE000_4100);
        let watcher = spawn(&mut kern, 0xE000_4101);
        let requester = kern.get::<Process>(watcher).unwrap().primary_thread;
        let first = status_word(&mut kern, watcher);
        let second = status_word(&mut kern, watcher);

        kern.logon(target, NotifyRequest { status: first, requester }, false)
            .unwrap();
        kern.logon(target, NotifyRequest { status: second, requester }, false)
            .unwrap();

        let cancel = NotifyRequest { status: first, requester };
        assert!(kern.logon_cancel(target, cancel, false).unwrap());
        assert!(!kern.logon_cancel(target, cancel, false).unwrap());
        // Wrong queue
        let other = NotifyRequest { status: second, requester };
        assert!(!kern.logon_cancel(target, other, true).unwrap());

        assert_eq!(read_status(&mut kern, requester, first), KERR_CANCEL);
        assert_eq!(read_status(&mut kern, requester, second), KREQUEST_PENDING);
        assert_eq!(kern.get::<Process>(target).unwrap().pending_logons(), 1);
    }

    #[test]
    fn test_rendezvous_completes_and_clears() {
        let mut kern = kernel();
        let target = spawn(&mut kern, 0xE000_4200);
        let watcher = spawn(&mut kern, 0xE000_4201);
        let requester = kern.get::<Process>(watcher).unwrap().primary_thread;
        let status = status_word(&mut kern, watcher);

        kern.logon(target, NotifyRequest { status, requester }, true)
            .unwrap();
        assert_eq!(kern.rendezvous(target, 0).unwrap(), 1);
        assert_eq!(kern.rendezvous(target, 0).unwrap(), 0);
        assert_eq!(read_status(&mut kern, requester, status), 0);

        let process = kern.get::<Process>(target).unwrap();
        assert_eq!(process.exit_type, ExitType::Pending);
        assert_eq!(process.exit_reason, 0);
        assert_eq!(kern.get::<Thread>(requester).unwrap().request_count, 1);
    }

    #[test]
    fn test_exit_completes_logons_then_logon_is_immediate() {
        let mut kern = kernel();
        let target = spawn(&mut kern, 0xE000_4300);
        let watcher = spawn(&mut kern, 0xE000_4301);
        let requester = kern.get::<Process>(watcher).unwrap().primary_thread;
        let on_exit = status_word(&mut kern, watcher);
        let on_start = status_word(&mut kern, watcher);
        let late = status_word(&mut kern, watcher);

        kern.logon(target, NotifyRequest { status: on_exit, requester }, false)
            .unwrap();
        kern.logon(target, NotifyRequest { status: on_start, requester }, true)
            .unwrap();

        let main = kern.get::<Process>(target).unwrap().primary_thread;
        kern.exit_thread(main, 7).unwrap();

        let process = kern.get::<Process>(target).unwrap();
        assert!(process.has_exited());
        assert_eq!(process.exit_type, ExitType::Kill);
        assert_eq!(process.pending_logons() + process.pending_rendezvous(), 0);
        assert_eq!(read_status(&mut kern, requester, on_exit), 7);
        assert_eq!(read_status(&mut kern, requester, on_start), 7);

        assert!(!kern
            .logon(target, NotifyRequest { status: late, requester }, false)
            .unwrap());
        assert_eq!(read_status(&mut kern, requester, late), 7);
        assert_eq!(kern.get::<Process>(target).unwrap().pending_logons(), 0);
    }

    #[test]
    fn test_kill_process_keeps_exit_type() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_4400);
        kern.create_thread(p, "worker", 0x7000_0000, 0x1000, ThreadPriority::Normal)
            .unwrap();
        kern.kill_process(p, ExitType::Panic, 3).unwrap();

        let process = kern.get::<Process>(p).unwrap();
        assert_eq!(process.exit_type, ExitType::Panic);
        assert_eq!(process.exit_reason, 3);
        assert!(process.threads.is_empty());
    }

    #[test]
    fn test_exit_survives_missing_stack_chunk() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_4600);
        let worker = kern
            .create_thread(p, "worker", 0x7000_0000, 0x1000, ThreadPriority::Normal)
            .unwrap();
        let stack = kern.get::<Thread>(worker).unwrap().stack_chunk;
        kern.destroy_chunk(stack).unwrap();

        kern.exit_thread(worker, 0).unwrap();
        assert!(kern.get::<Thread>(worker).is_err());
        assert!(!kern.get::<Process>(p).unwrap().has_exited());
    }

    #[test]
    fn test_destroy_only_after_exit() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_4500);
        assert_eq!(
            kern.destroy_process(p),
            Err(KernelError::ProcessStillAlive(p))
        );

        kern.kill_process(p, ExitType::Terminate, 0).unwrap();
        kern.destroy_process(p).unwrap();
        assert!(kern.objects().is_empty());
        assert_eq!(kern.memory().space_count(), 0);
    }

    #[test]
    fn test_security_checks() {
        let mut kern = kernel();
        let caps = CapabilitySet::from_caps(&[Capability::ReadUserData]);
        let module = test_module(0xE000_5000).with_security(SecurityInfo::new(0xE000_5000, 0, caps));
        let p = kern.spawn_process("app", "C:\\app.exe", "", &module).unwrap();

        assert!(kern.has(p, &caps).unwrap());
        let policy = SecurityPolicy::caps(&[Capability::ReadUserData, Capability::WriteUserData]);
        let mut missing = SecurityInfo::default();
        assert!(!kern.satisfy(p, &policy, Some(&mut missing)).unwrap());
        assert!(missing.caps.contains(Capability::WriteUserData));
        assert!(matches!(
            kern.require(p, &policy),
            Err(KernelError::PermissionDenied(_))
        ));
    }

    #[test]
    fn test_eka1_bypasses_security() {
        let mut kern = KernelSystem::with_config(KernelConfig::for_personality(Personality::Eka1));
        let p = spawn(&mut kern, 0xE000_5001);
        assert!(kern.satisfy(p, &SecurityPolicy::AlwaysFail, None).unwrap());
        let caps = CapabilitySet::from_caps(&[Capability::AllFiles]);
        assert!(kern.has(p, &caps).unwrap());
    }

    #[test]
    fn test_set_process_priority_updates_threads() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_6000);
        let worker = kern
            .create_thread(p, "worker", 0x7000_0000, 0x1000, ThreadPriority::Normal)
            .unwrap();
        let main = kern.get::<Process>(p).unwrap().primary_thread;
        assert_eq!(kern.scheduler().priority(worker), Some(12));

        kern.set_process_priority(p, ProcessPriority::High).unwrap();
        assert_eq!(kern.scheduler().priority(worker), Some(19));
        // Absolute priorities ignore the class
        assert_eq!(kern.scheduler().priority(main), Some(12));
    }

    #[test]
    fn test_handles() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_7000);
        let lock = kern.get::<Process>(p).unwrap().dll_lock;
        let local = kern.open_handle(p, lock).unwrap();
        let global = kern.open_global_handle(lock).unwrap();
        assert_eq!(kern.get_object(p, local).unwrap(), lock);
        assert_eq!(kern.get_object(p, global).unwrap(), lock);
        assert_eq!(
            kern.get_object(p, Handle::from_raw(40)),
            Err(KernelError::InvalidHandle(Handle::from_raw(40)))
        );
    }

    #[test]
    fn test_dll_lock() {
        let mut kern = kernel();
        let p = spawn(&mut kern, 0xE000_7100);
        let main = kern.get::<Process>(p).unwrap().primary_thread;
        assert_eq!(kern.wait_dll_lock(p, main).unwrap(), MutexWait::Acquired);
        kern.signal_dll_lock(p, main).unwrap();
        assert!(kern.signal_dll_lock(p, main).is_err());
    }

    #[test]
    fn test_process_state_round_trip() {
        let mut kern = kernel();
        let target = spawn(&mut kern, 0xE000_8000);
        let watcher = spawn(&mut kern, 0xE000_8001);
        let requester = kern.get::<Process>(watcher).unwrap().primary_thread;
        let status = status_word(&mut kern, watcher);
        kern.logon(target, NotifyRequest { status, requester }, true)
            .unwrap();
        kern.get_mut::<Process>(target)
            .unwrap()
            .set_arg_slot(1, b"payload");

        let mut out = StateStream::writer();
        kern.get_mut::<Process>(target).unwrap().do_state(&mut out);

        let mut restored = Process::default();
        restored.do_state(&mut StateStream::reader(out.into_bytes()));
        let original = kern.get::<Process>(target).unwrap();
        assert_eq!(restored.puid, original.puid);
        assert_eq!(restored.thread_count, original.thread_count);
        assert_eq!(restored.priority, original.priority);
        assert_eq!(restored.exit_reason, original.exit_reason);
        assert_eq!(restored.exit_type, original.exit_type);
        assert_eq!(restored.process_name, "app");
        assert_eq!(restored.exe_path, "C:\\sys\\bin\\app.exe");
        assert_eq!(restored.cmd_args, "-v");
        assert_eq!(restored.get_arg_slot(1).unwrap().data, b"payload");
        assert_eq!(restored.pending_rendezvous(), 1);
        assert_eq!(restored.primary_thread, original.primary_thread);
    }
}
