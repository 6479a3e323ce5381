//! Thread entity and priority model

use crate::object::ObjectHeader;
use core_types::{ObjectId, VmAddress};
use hal::ThreadContext;
use serde::{Deserialize, Serialize};
use state_stream::StateStream;

/// Number of distinct effective priorities
pub const PRIORITY_LEVELS: u8 = 64;

/// Priority class of a process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ProcessPriority {
    Low,
    Background,
    #[default]
    Foreground,
    High,
    WindowServer,
    FileServer,
    RealTimeServer,
    Supervisor,
}

impl ProcessPriority {
    /// Row of the relative priority table
    const fn band(&self) -> usize {
        match self {
            ProcessPriority::Low => 0,
            ProcessPriority::Background => 1,
            ProcessPriority::Foreground => 2,
            ProcessPriority::High => 3,
            ProcessPriority::WindowServer => 4,
            ProcessPriority::FileServer => 5,
            ProcessPriority::RealTimeServer => 6,
            ProcessPriority::Supervisor => 7,
        }
    }

    pub const fn value(&self) -> u32 {
        match self {
            ProcessPriority::Low => 150,
            ProcessPriority::Background => 250,
            ProcessPriority::Foreground => 350,
            ProcessPriority::High => 450,
            ProcessPriority::WindowServer => 650,
            ProcessPriority::FileServer => 750,
            ProcessPriority::RealTimeServer => 850,
            ProcessPriority::Supervisor => 950,
        }
    }

    pub fn from_value(value: u32) -> Option<Self> {
        [
            ProcessPriority::Low,
            ProcessPriority::Background,
            ProcessPriority::Foreground,
            ProcessPriority::High,
            ProcessPriority::WindowServer,
            ProcessPriority::FileServer,
            ProcessPriority::RealTimeServer,
            ProcessPriority::Supervisor,
        ]
        .into_iter()
        .find(|p| p.value() == value)
    }
}

/// Priority of a thread
///
/// Relative priorities are resolved against the owning process's priority
/// class; absolute priorities ignore it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ThreadPriority {
    Null,
    MuchLess,
    Less,
    #[default]
    Normal,
    More,
    MuchMore,
    RealTime,
    AbsoluteVeryLow,
    AbsoluteLowNormal,
    AbsoluteLow,
    AbsoluteBackgroundNormal,
    AbsoluteBackground,
    AbsoluteForegroundNormal,
    AbsoluteForeground,
    AbsoluteHighNormal,
    AbsoluteHigh,
    AbsoluteRealTime1,
    AbsoluteRealTime2,
    AbsoluteRealTime3,
    AbsoluteRealTime4,
    AbsoluteRealTime5,
    AbsoluteRealTime6,
    AbsoluteRealTime7,
    AbsoluteRealTime8,
}

/// Effective priority of each relative thread priority, per process class
const RELATIVE_PRIORITY_TABLE: [[u8; 7]; 8] = [
    [1, 1, 2, 3, 4, 5, 22],
    [3, 5, 6, 7, 8, 9, 22],
    [3, 10, 11, 12, 13, 14, 22],
    [3, 17, 18, 19, 20, 22, 23],
    [9, 15, 16, 21, 24, 25, 28],
    [9, 15, 16, 21, 24, 25, 28],
    [9, 15, 16, 21, 24, 25, 28],
    [9, 15, 16, 21, 24, 25, 28],
];

impl ThreadPriority {
    pub const fn value(&self) -> i32 {
        match self {
            ThreadPriority::Null => -30,
            ThreadPriority::MuchLess => -20,
            ThreadPriority::Less => -10,
            ThreadPriority::Normal => 0,
            ThreadPriority::More => 10,
            ThreadPriority::MuchMore => 20,
            ThreadPriority::RealTime => 30,
            ThreadPriority::AbsoluteVeryLow => 100,
            ThreadPriority::AbsoluteLowNormal => 150,
            ThreadPriority::AbsoluteLow => 200,
            ThreadPriority::AbsoluteBackgroundNormal => 250,
            ThreadPriority::AbsoluteBackground => 300,
            ThreadPriority::AbsoluteForegroundNormal => 350,
            ThreadPriority::AbsoluteForeground => 400,
            ThreadPriority::AbsoluteHighNormal => 450,
            ThreadPriority::AbsoluteHigh => 500,
            ThreadPriority::AbsoluteRealTime1 => 800,
            ThreadPriority::AbsoluteRealTime2 => 900,
            ThreadPriority::AbsoluteRealTime3 => 1000,
            ThreadPriority::AbsoluteRealTime4 => 1100,
            ThreadPriority::AbsoluteRealTime5 => 1200,
            ThreadPriority::AbsoluteRealTime6 => 1300,
            ThreadPriority::AbsoluteRealTime7 => 1400,
            ThreadPriority::AbsoluteRealTime8 => 1500,
        }
    }

    pub fn from_value(value: i32) -> Option<Self> {
        use ThreadPriority::*;
        [
            Null,
            MuchLess,
            Less,
            Normal,
            More,
            MuchMore,
            RealTime,
            AbsoluteVeryLow,
            AbsoluteLowNormal,
            AbsoluteLow,
            AbsoluteBackgroundNormal,
            AbsoluteBackground,
            AbsoluteForegroundNormal,
            AbsoluteForeground,
            AbsoluteHighNormal,
            AbsoluteHigh,
            AbsoluteRealTime1,
            AbsoluteRealTime2,
            AbsoluteRealTime3,
            AbsoluteRealTime4,
            AbsoluteRealTime5,
            AbsoluteRealTime6,
            AbsoluteRealTime7,
            AbsoluteRealTime8,
        ]
        .into_iter()
        .find(|p| p.value() == value)
    }

    pub const fn is_absolute(&self) -> bool {
        self.value() >= 100
    }

    /// Resolves this priority to a scheduler band in `0..PRIORITY_LEVELS`
    ///
    /// Higher is more urgent.
    pub fn effective_priority(&self, process: ProcessPriority) -> u8 {
        match self {
            ThreadPriority::AbsoluteVeryLow => 1,
            ThreadPriority::AbsoluteLowNormal => 3,
            ThreadPriority::AbsoluteLow => 5,
            ThreadPriority::AbsoluteBackgroundNormal => 7,
            ThreadPriority::AbsoluteBackground => 9,
            ThreadPriority::AbsoluteForegroundNormal => 12,
            ThreadPriority::AbsoluteForeground => 14,
            ThreadPriority::AbsoluteHighNormal => 19,
            ThreadPriority::AbsoluteHigh => 23,
            ThreadPriority::AbsoluteRealTime1 => 24,
            ThreadPriority::AbsoluteRealTime2 => 25,
            ThreadPriority::AbsoluteRealTime3 => 26,
            ThreadPriority::AbsoluteRealTime4 => 27,
            ThreadPriority::AbsoluteRealTime5 => 28,
            ThreadPriority::AbsoluteRealTime6 => 29,
            ThreadPriority::AbsoluteRealTime7 => 30,
            ThreadPriority::AbsoluteRealTime8 => 31,
            relative => {
                let column = ((relative.value() + 30) / 10) as usize;
                RELATIVE_PRIORITY_TABLE[process.band()][column]
            }
        }
    }
}

/// What a blocked thread is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WaitReason {
    Mutex(ObjectId),
    /// The thread's request semaphore
    Request,
}

/// Scheduling state of a thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ThreadState {
    Created,
    Ready,
    Running,
    Blocked(WaitReason),
    Exited,
}

impl ThreadState {
    pub fn is_alive(&self) -> bool {
        !matches!(self, ThreadState::Exited)
    }
}

/// A schedulable execution context
///
/// Scheduling state (ready, blocked, running) lives in the scheduler; the
/// thread object carries what survives a context switch.
#[derive(Debug, Clone, Default)]
pub struct Thread {
    pub header: ObjectHeader,
    /// Owning process
    pub process: ObjectId,
    pub priority: ThreadPriority,
    pub context: ThreadContext,
    pub entry_point: VmAddress,
    pub stack_chunk: ObjectId,
    pub stack_size: u32,
    pub heap_min: u32,
    pub heap_max: u32,
    /// Request semaphore count; negative while the thread waits for a request
    pub request_count: i32,
    pub exit_reason: i32,
}

impl Thread {
    pub fn new(
        header: ObjectHeader,
        process: ObjectId,
        entry_point: VmAddress,
        stack_top: VmAddress,
        priority: ThreadPriority,
    ) -> Self {
        Self {
            header,
            process,
            priority,
            context: ThreadContext::for_entry(entry_point, stack_top),
            entry_point,
            ..Default::default()
        }
    }

    /// Consumes one pending request signal
    ///
    /// Returns true if the thread has to block until the next signal.
    pub fn wait_for_request(&mut self) -> bool {
        self.request_count -= 1;
        self.request_count < 0
    }

    /// Adds one request signal
    ///
    /// Returns true if this signal releases a waiting thread.
    pub fn signal_request(&mut self) -> bool {
        self.request_count += 1;
        self.request_count <= 0
    }

    pub fn do_state(&mut self, stream: &mut StateStream) {
        stream.section("Thread", 1, |s| {
            s.absorb(&mut self.process);

            let mut priority = self.priority.value();
            s.absorb(&mut priority);
            if s.is_reading() {
                self.priority = ThreadPriority::from_value(priority).unwrap_or_default();
            }

            s.absorb(&mut self.context.cpu_registers);
            s.absorb(&mut self.context.cpsr);
            s.absorb(&mut self.context.fpu_registers);
            s.absorb(&mut self.context.fpscr);
            s.absorb(&mut self.entry_point);
            s.absorb(&mut self.stack_chunk);
            s.absorb(&mut self.stack_size);
            s.absorb(&mut self.heap_min);
            s.absorb(&mut self.heap_max);
            s.absorb(&mut self.request_count);
            s.absorb(&mut self.exit_reason);
        });
    }
}
