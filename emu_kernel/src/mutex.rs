//! Mutex kernel object

use crate::object::ObjectHeader;
use core_types::ObjectId;
use kernel_api::KernelError;
use state_stream::{Absorb, StateStream};

/// Outcome of a mutex acquisition attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutexWait {
    /// The caller now holds the mutex
    Acquired,
    /// The caller was queued and must block
    Blocked,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Waiter {
    thread: ObjectId,
    priority: u8,
}

impl Absorb for Waiter {
    fn absorb(&mut self, stream: &mut StateStream) {
        stream.absorb(&mut self.thread);
        stream.absorb(&mut self.priority);
    }
}

/// Recursive binary lock with a priority-ordered wait queue
///
/// Waiters of equal priority are served first come, first served.
#[derive(Debug, Clone, Default)]
pub struct Mutex {
    pub header: ObjectHeader,
    holder: Option<ObjectId>,
    lock_count: u32,
    waiters: Vec<Waiter>,
}

impl Mutex {
    pub fn new(header: ObjectHeader) -> Self {
        Self {
            header,
            ..Default::default()
        }
    }

    pub fn holder(&self) -> Option<ObjectId> {
        self.holder
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn is_locked(&self) -> bool {
        self.holder.is_some()
    }

    /// Waiting threads, in the order they will be served
    pub fn waiters(&self) -> Vec<ObjectId> {
        self.waiters.iter().map(|w| w.thread).collect()
    }

    /// Tries to take the mutex on behalf of `thread`
    ///
    /// The holder may acquire again; each acquisition needs its own release.
    pub fn acquire(&mut self, thread: ObjectId, priority: u8) -> MutexWait {
        match self.holder {
            None => {
                self.holder = Some(thread);
                self.lock_count = 1;
                MutexWait::Acquired
            }
            Some(holder) if holder == thread => {
                self.lock_count += 1;
                MutexWait::Acquired
            }
            Some(_) => {
                let position = self
                    .waiters
                    .iter()
                    .position(|w| w.priority < priority)
                    .unwrap_or(self.waiters.len());
                self.waiters.insert(position, Waiter { thread, priority });
                MutexWait::Blocked
            }
        }
    }

    /// Releases one acquisition by `thread`
    ///
    /// When the last acquisition is released the mutex passes to the first
    /// waiter, which is returned so the caller can make it ready.
    pub fn release(&mut self, thread: ObjectId) -> Result<Option<ObjectId>, KernelError> {
        if self.holder != Some(thread) {
            return Err(KernelError::NotMutexHolder {
                mutex: self.header.uid,
                thread,
            });
        }

        self.lock_count -= 1;
        if self.lock_count > 0 {
            return Ok(None);
        }

        if self.waiters.is_empty() {
            self.holder = None;
            return Ok(None);
        }

        let next = self.waiters.remove(0).thread;
        self.holder = Some(next);
        self.lock_count = 1;
        Ok(Some(next))
    }

    /// Drops `thread` from the wait queue
    pub fn remove_waiter(&mut self, thread: ObjectId) -> bool {
        let before = self.waiters.len();
        self.waiters.retain(|w| w.thread != thread);
        self.waiters.len() != before
    }

    /// Re-sorts a waiter after its priority changed
    pub fn update_waiter_priority(&mut self, thread: ObjectId, priority: u8) {
        if self.remove_waiter(thread) {
            let position = self
                .waiters
                .iter()
                .position(|w| w.priority < priority)
                .unwrap_or(self.waiters.len());
            self.waiters.insert(position, Waiter { thread, priority });
        }
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Mutex", 1, |s| {
            let mut holder = self.holder.unwrap_or(ObjectId::NONE);
            s.absorb(&mut holder);
            self.holder = if holder.is_none() { None } else { Some(holder) };

            s.absorb(&mut self.lock_count);
            s.absorb(&mut self.waiters);
        });
    }
}
