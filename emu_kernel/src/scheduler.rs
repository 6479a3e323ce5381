//! Thread Scheduler
//!
//! ## Philosophy
//!
//! - **Priority first, then arrival**: The highest effective priority wins;
//!   threads of equal priority run in the order they became ready.
//! - **Determinism first**: Same inputs => same schedule. Every structure
//!   is ordered, nothing depends on hashing or host time.
//! - **No hidden yields**: A thread only leaves the CPU at a reschedule
//!   boundary chosen by the execution loop.
//!
//! ## Design
//!
//! Threads are identified by [`ObjectId`]; the thread objects themselves
//! stay in the kernel's object table. The scheduler only tracks each
//! thread's state and effective priority, plus one FIFO queue per priority
//! band holding the ready threads.
//!
//! When [`Scheduler::reschedule`] runs, the thread that was running goes
//! back to the tail of its band (round robin among equals) and the head of
//! the highest non-empty band becomes current.

use crate::config::SchedulerConfig;
use crate::thread::{ThreadState, WaitReason, PRIORITY_LEVELS};
use core_types::ObjectId;
use serde::{Deserialize, Serialize};
use state_stream::{Absorb, StateStream};
use std::collections::{BTreeMap, VecDeque};

/// Scheduling event for audit trail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScheduleEvent {
    /// Thread entered the ready set for the first time
    ThreadScheduled {
        thread: ObjectId,
        priority: u8,
        timestamp_ticks: u64,
    },
    /// Thread was selected to run
    ThreadSelected {
        thread: ObjectId,
        timestamp_ticks: u64,
    },
    /// Running thread was put back in the ready set
    ThreadPreempted {
        thread: ObjectId,
        timestamp_ticks: u64,
    },
    ThreadBlocked {
        thread: ObjectId,
        reason: WaitReason,
        timestamp_ticks: u64,
    },
    ThreadWoken {
        thread: ObjectId,
        timestamp_ticks: u64,
    },
    ThreadExited {
        thread: ObjectId,
        timestamp_ticks: u64,
    },
    PriorityChanged {
        thread: ObjectId,
        old: u8,
        new: u8,
        timestamp_ticks: u64,
    },
    /// No thread was ready
    Idle { timestamp_ticks: u64 },
}

#[derive(Debug, Clone, Copy)]
struct ThreadInfo {
    state: ThreadState,
    priority: u8,
}

/// Priority scheduler
pub struct Scheduler {
    config: SchedulerConfig,
    /// Ready threads per priority band
    ready: BTreeMap<u8, VecDeque<ObjectId>>,
    threads: BTreeMap<ObjectId, ThreadInfo>,
    current: Option<ObjectId>,
    current_ticks: u64,
    /// Audit log for scheduling events (test-only)
    audit_log: Vec<ScheduleEvent>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        Self {
            config,
            ready: BTreeMap::new(),
            threads: BTreeMap::new(),
            current: None,
            current_ticks: 0,
            audit_log: Vec::new(),
        }
    }

    fn record(&mut self, event: ScheduleEvent) {
        if self.config.audit {
            self.audit_log.push(event);
        }
    }

    fn enqueue(&mut self, thread: ObjectId, priority: u8) {
        self.ready.entry(priority).or_default().push_back(thread);
    }

    fn dequeue(&mut self, thread: ObjectId, priority: u8) {
        if let Some(band) = self.ready.get_mut(&priority) {
            band.retain(|id| *id != thread);
            if band.is_empty() {
                self.ready.remove(&priority);
            }
        }
    }

    /// Starts tracking a thread in the `Created` state
    pub fn register(&mut self, thread: ObjectId, priority: u8) {
        let priority = priority.min(PRIORITY_LEVELS - 1);
        self.threads.insert(
            thread,
            ThreadInfo {
                state: ThreadState::Created,
                priority,
            },
        );
    }

    /// Makes a freshly created thread ready
    ///
    /// Returns false if the thread is unknown or was already scheduled.
    pub fn schedule(&mut self, thread: ObjectId) -> bool {
        let Some(info) = self.threads.get_mut(&thread) else {
            return false;
        };
        if info.state != ThreadState::Created {
            return false;
        }
        info.state = ThreadState::Ready;
        let priority = info.priority;

        self.enqueue(thread, priority);
        self.record(ScheduleEvent::ThreadScheduled {
            thread,
            priority,
            timestamp_ticks: self.current_ticks,
        });
        true
    }

    /// Picks the thread that runs next
    ///
    /// The previously running thread, if still runnable, is requeued at the
    /// tail of its band before the choice is made.
    pub fn reschedule(&mut self) -> Option<ObjectId> {
        if let Some(previous) = self.current.take() {
            if let Some(info) = self.threads.get_mut(&previous) {
                if info.state == ThreadState::Running {
                    info.state = ThreadState::Ready;
                    let priority = info.priority;
                    self.enqueue(previous, priority);
                    self.record(ScheduleEvent::ThreadPreempted {
                        thread: previous,
                        timestamp_ticks: self.current_ticks,
                    });
                }
            }
        }

        let next = self
            .ready
            .iter_mut()
            .next_back()
            .and_then(|(_, band)| band.pop_front());

        let Some(next) = next else {
            self.record(ScheduleEvent::Idle {
                timestamp_ticks: self.current_ticks,
            });
            return None;
        };

        self.ready.retain(|_, band| !band.is_empty());
        if let Some(info) = self.threads.get_mut(&next) {
            info.state = ThreadState::Running;
        }
        self.current = Some(next);
        self.record(ScheduleEvent::ThreadSelected {
            thread: next,
            timestamp_ticks: self.current_ticks,
        });
        Some(next)
    }

    /// Moves a ready or running thread to the blocked state
    pub fn block(&mut self, thread: ObjectId, reason: WaitReason) -> bool {
        let Some(info) = self.threads.get(&thread).copied() else {
            return false;
        };
        match info.state {
            ThreadState::Ready => self.dequeue(thread, info.priority),
            ThreadState::Running => {
                if self.current == Some(thread) {
                    self.current = None;
                }
            }
            _ => return false,
        }

        if let Some(info) = self.threads.get_mut(&thread) {
            info.state = ThreadState::Blocked(reason);
        }
        self.record(ScheduleEvent::ThreadBlocked {
            thread,
            reason,
            timestamp_ticks: self.current_ticks,
        });
        true
    }

    /// Makes a blocked thread ready again, at the tail of its band
    pub fn wake(&mut self, thread: ObjectId) -> bool {
        let Some(info) = self.threads.get_mut(&thread) else {
            return false;
        };
        if !matches!(info.state, ThreadState::Blocked(_)) {
            return false;
        }
        info.state = ThreadState::Ready;
        let priority = info.priority;

        self.enqueue(thread, priority);
        self.record(ScheduleEvent::ThreadWoken {
            thread,
            timestamp_ticks: self.current_ticks,
        });
        true
    }

    /// Marks a thread as exited and removes it from every queue
    pub fn exit(&mut self, thread: ObjectId) -> bool {
        let Some(info) = self.threads.get(&thread).copied() else {
            return false;
        };
        if info.state == ThreadState::Exited {
            return false;
        }
        if info.state == ThreadState::Ready {
            self.dequeue(thread, info.priority);
        }
        if self.current == Some(thread) {
            self.current = None;
        }

        if let Some(info) = self.threads.get_mut(&thread) {
            info.state = ThreadState::Exited;
        }
        self.record(ScheduleEvent::ThreadExited {
            thread,
            timestamp_ticks: self.current_ticks,
        });
        true
    }

    /// Forgets a thread entirely
    pub fn unregister(&mut self, thread: ObjectId) {
        if let Some(info) = self.threads.remove(&thread) {
            self.dequeue(thread, info.priority);
        }
        if self.current == Some(thread) {
            self.current = None;
        }
    }

    /// Changes a thread's effective priority
    ///
    /// A ready thread moves to the tail of its new band. A running thread
    /// keeps running; the new priority applies when it is next requeued.
    pub fn set_priority(&mut self, thread: ObjectId, priority: u8) {
        let priority = priority.min(PRIORITY_LEVELS - 1);
        let Some(info) = self.threads.get(&thread).copied() else {
            return;
        };
        if info.priority == priority {
            return;
        }

        if info.state == ThreadState::Ready {
            self.dequeue(thread, info.priority);
            self.enqueue(thread, priority);
        }
        if let Some(info) = self.threads.get_mut(&thread) {
            info.priority = priority;
        }
        self.record(ScheduleEvent::PriorityChanged {
            thread,
            old: info.priority,
            new: priority,
            timestamp_ticks: self.current_ticks,
        });
    }

    /// Advances the scheduler's notion of time
    pub fn on_tick_advanced(&mut self, delta_ticks: u64) {
        self.current_ticks += delta_ticks;
    }

    pub fn current(&self) -> Option<ObjectId> {
        self.current
    }

    pub fn state(&self, thread: ObjectId) -> Option<ThreadState> {
        self.threads.get(&thread).map(|info| info.state)
    }

    pub fn priority(&self, thread: ObjectId) -> Option<u8> {
        self.threads.get(&thread).map(|info| info.priority)
    }

    /// Number of threads waiting in the ready set
    pub fn ready_count(&self) -> usize {
        self.ready.values().map(VecDeque::len).sum()
    }

    /// Ready threads in the order they would be picked
    pub fn ready_threads(&self) -> Vec<ObjectId> {
        self.ready
            .values()
            .rev()
            .flat_map(|band| band.iter().copied())
            .collect()
    }

    /// Every tracked thread
    pub fn threads(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.threads.keys().copied()
    }

    pub fn audit_log(&self) -> &[ScheduleEvent] {
        &self.audit_log
    }

    pub fn clear_audit_log(&mut self) {
        self.audit_log.clear();
    }

    pub fn has_event<F>(&self, predicate: F) -> bool
    where
        F: Fn(&ScheduleEvent) -> bool,
    {
        self.audit_log.iter().any(predicate)
    }

    pub fn count_events<F>(&self, predicate: F) -> usize
    where
        F: Fn(&ScheduleEvent) -> bool,
    {
        self.audit_log.iter().filter(|e| predicate(e)).count()
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Scheduler", 1, |s| {
            s.absorb(&mut self.current_ticks);

            let mut current = self.current.unwrap_or(ObjectId::NONE);
            s.absorb(&mut current);
            self.current = if current.is_none() { None } else { Some(current) };

            let mut threads: Vec<ThreadRecord> = self
                .threads
                .iter()
                .map(|(id, info)| ThreadRecord::new(*id, info))
                .collect();
            s.absorb(&mut threads);

            let mut ready: Vec<ObjectId> = self.ready_threads();
            s.absorb(&mut ready);

            if s.is_reading() && !s.is_failed() {
                self.threads = threads
                    .iter()
                    .map(|record| (record.thread, record.info()))
                    .collect();
                self.ready.clear();
                for thread in ready {
                    if let Some(info) = self.threads.get(&thread).copied() {
                        self.enqueue(thread, info.priority);
                    }
                }
            }
        });
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

/// Serialized form of one tracked thread
#[derive(Debug, Clone, Copy, Default)]
struct ThreadRecord {
    thread: ObjectId,
    state: u8,
    wait_object: ObjectId,
    priority: u8,
}

impl ThreadRecord {
    fn new(thread: ObjectId, info: &ThreadInfo) -> Self {
        let (state, wait_object) = match info.state {
            ThreadState::Created => (0, ObjectId::NONE),
            ThreadState::Ready => (1, ObjectId::NONE),
            ThreadState::Running => (2, ObjectId::NONE),
            ThreadState::Blocked(WaitReason::Mutex(mutex)) => (3, mutex),
            ThreadState::Blocked(WaitReason::Request) => (4, ObjectId::NONE),
            ThreadState::Exited => (5, ObjectId::NONE),
        };
        Self {
            thread,
            state,
            wait_object,
            priority: info.priority,
        }
    }

    fn info(&self) -> ThreadInfo {
        let state = match self.state {
            0 => ThreadState::Created,
            1 => ThreadState::Ready,
            2 => ThreadState::Running,
            3 => ThreadState::Blocked(WaitReason::Mutex(self.wait_object)),
            4 => ThreadState::Blocked(WaitReason::Request),
            _ => ThreadState::Exited,
        };
        ThreadInfo {
            state,
            priority: self.priority,
        }
    }
}

impl Absorb for ThreadRecord {
    fn absorb(&mut self, stream: &mut StateStream) {
        stream.absorb(&mut self.thread);
        stream.absorb(&mut self.state);
        stream.absorb(&mut self.wait_object);
        stream.absorb(&mut self.priority);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> ObjectId {
        ObjectId::from_raw(n)
    }

    fn audited() -> Scheduler {
        Scheduler::with_config(SchedulerConfig { audit: true })
    }

    #[test]
    fn test_empty_scheduler_idles() {
        let mut scheduler = audited();
        assert_eq!(scheduler.reschedule(), None);
        assert!(scheduler.has_event(|e| matches!(e, ScheduleEvent::Idle { .. })));
    }

    #[test]
    fn test_schedule_only_from_created() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 12);
        assert!(scheduler.schedule(id(1)));
        assert!(!scheduler.schedule(id(1)));
        assert!(!scheduler.schedule(id(2)));
        assert_eq!(scheduler.ready_count(), 1);
    }

    #[test]
    fn test_priority_then_fifo() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 5);
        scheduler.register(id(2), 20);
        scheduler.register(id(3), 20);
        for t in [1, 2, 3] {
            scheduler.schedule(id(t));
        }

        assert_eq!(scheduler.reschedule(), Some(id(2)));
        assert_eq!(scheduler.reschedule(), Some(id(3)));
        assert_eq!(scheduler.reschedule(), Some(id(2)));
        assert_eq!(scheduler.state(id(1)), Some(ThreadState::Ready));
    }

    #[test]
    fn test_low_priority_runs_when_high_blocks() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 5);
        scheduler.register(id(2), 20);
        scheduler.schedule(id(1));
        scheduler.schedule(id(2));

        assert_eq!(scheduler.reschedule(), Some(id(2)));
        assert!(scheduler.block(id(2), WaitReason::Request));
        assert_eq!(scheduler.current(), None);
        assert_eq!(scheduler.reschedule(), Some(id(1)));

        assert!(scheduler.wake(id(2)));
        assert_eq!(scheduler.reschedule(), Some(id(2)));
    }

    #[test]
    fn test_block_ready_thread() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 12);
        scheduler.schedule(id(1));
        assert!(scheduler.block(id(1), WaitReason::Mutex(id(9))));
        assert_eq!(scheduler.ready_count(), 0);
        assert_eq!(
            scheduler.state(id(1)),
            Some(ThreadState::Blocked(WaitReason::Mutex(id(9))))
        );
        assert!(!scheduler.wake(id(2)));
    }

    #[test]
    fn test_exit_removes_thread() {
        let mut scheduler = audited();
        scheduler.register(id(1), 12);
        scheduler.schedule(id(1));
        scheduler.reschedule();
        assert!(scheduler.exit(id(1)));
        assert!(!scheduler.exit(id(1)));
        assert_eq!(scheduler.reschedule(), None);
        assert_eq!(
            scheduler.count_events(|e| matches!(e, ScheduleEvent::ThreadExited { .. })),
            1
        );
    }

    #[test]
    fn test_set_priority_requeues_ready_thread() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 10);
        scheduler.register(id(2), 12);
        scheduler.schedule(id(1));
        scheduler.schedule(id(2));

        scheduler.set_priority(id(1), 30);
        assert_eq!(scheduler.ready_threads(), vec![id(1), id(2)]);
        assert_eq!(scheduler.priority(id(1)), Some(30));
    }

    #[test]
    fn test_set_priority_keeps_running_thread() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 12);
        scheduler.schedule(id(1));
        scheduler.reschedule();

        scheduler.set_priority(id(1), 3);
        assert_eq!(scheduler.current(), Some(id(1)));
        assert_eq!(scheduler.state(id(1)), Some(ThreadState::Running));
        assert_eq!(scheduler.ready_count(), 0);
    }

    #[test]
    fn test_audit_disabled_by_default() {
        let mut scheduler = Scheduler::new();
        scheduler.register(id(1), 12);
        scheduler.schedule(id(1));
        scheduler.reschedule();
        assert!(scheduler.audit_log().is_empty());
    }

    #[test]
    fn test_audit_events_serialize() {
        let mut scheduler = audited();
        scheduler.on_tick_advanced(42);
        scheduler.register(id(1), 12);
        scheduler.schedule(id(1));

        let json = serde_json::to_string(scheduler.audit_log()).unwrap();
        let events: Vec<ScheduleEvent> = serde_json::from_str(&json).unwrap();
        assert_eq!(
            events,
            vec![ScheduleEvent::ThreadScheduled {
                thread: id(1),
                priority: 12,
                timestamp_ticks: 42,
            }]
        );
    }

    #[test]
    fn test_state_round_trip() {
        let mut scheduler = Scheduler::new();
        for (t, pri) in [(1, 5), (2, 20), (3, 20), (4, 12)] {
            scheduler.register(id(t), pri);
            scheduler.schedule(id(t));
        }
        scheduler.reschedule();
        scheduler.block(id(4), WaitReason::Mutex(id(8)));

        let mut out = StateStream::writer();
        scheduler.do_state(&mut out);

        let mut restored = Scheduler::new();
        restored.do_state(&mut StateStream::reader(out.into_bytes()));
        assert_eq!(restored.current(), Some(id(2)));
        assert_eq!(restored.ready_threads(), scheduler.ready_threads());
        assert_eq!(
            restored.state(id(4)),
            Some(ThreadState::Blocked(WaitReason::Mutex(id(8))))
        );
        assert_eq!(restored.reschedule(), Some(id(3)));
    }
}
