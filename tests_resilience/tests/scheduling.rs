//! Scheduling and Execution Loop Tests
//!
//! Validates priority ordering, round robin among equals and the clock
//! behaviour of the execution loop.

use core_types::ProcessUidType;
use emu_kernel::{
    ExitType, LoopOutcome, Process, ScheduleEvent, ThreadPriority, ThreadState, WaitReason,
};
use hal::{Clock, StopReason};
use kernel_api::status::KERN_EXEC_EXCEPTION;
use kernel_api::ModuleImage;
use tests_resilience::{boot_kernel, boot_system, primary_thread, spawn_app};

/// Test: {low, high, high} always runs a high thread first, in FIFO order
#[test]
fn test_priority_order_with_fifo_tie_break() {
    let mut kernel = boot_kernel();
    let p = spawn_app(&mut kernel, "sched", 0xE300_0001).unwrap();
    let mut spawn = |name: &str, priority| {
        kernel
            .create_thread(p, name, 0x7000_0000, 0x1000, priority)
            .unwrap()
    };
    let low = spawn("low", ThreadPriority::AbsoluteLow);
    let high1 = spawn("high1", ThreadPriority::AbsoluteHigh);
    let high2 = spawn("high2", ThreadPriority::AbsoluteHigh);

    for thread in [low, high1, high2] {
        assert!(kernel.scheduler_mut().schedule(thread));
    }

    let scheduler = kernel.scheduler_mut();
    assert_eq!(scheduler.reschedule(), Some(high1));
    // Round robin between equals, the low thread never gets in
    assert_eq!(scheduler.reschedule(), Some(high2));
    assert_eq!(scheduler.reschedule(), Some(high1));

    scheduler.block(high1, WaitReason::Request);
    assert_eq!(scheduler.reschedule(), Some(high2));
    scheduler.block(high2, WaitReason::Request);
    assert_eq!(scheduler.reschedule(), Some(low));

    scheduler.wake(high2);
    assert_eq!(scheduler.reschedule(), Some(high2));
    assert_eq!(scheduler.state(low), Some(ThreadState::Ready));
}

/// Test: an idle iteration advances the clock and clears the pending flag
#[test]
fn test_idle_iteration() {
    let mut system = boot_system();
    let before = system.ticks();

    assert_eq!(system.run_once(), LoopOutcome::Idle);
    assert!(system.ticks() > before);
    assert_eq!(
        system.ticks() - before,
        system.timing().config().idle_ticks
    );
    assert!(!system.reschedule_pending());
    assert_eq!(system.cpu().instructions_executed(), 0);
    assert!(system
        .kernel()
        .scheduler()
        .has_event(|e| matches!(e, ScheduleEvent::Idle { .. })));
}

/// Test: the clock advances on every iteration, busy or idle
#[test]
fn test_clock_advances_every_iteration() {
    let mut system = boot_system();
    system
        .load("busy", "C:\\busy.exe", "", &emu_kernel::test_utils::test_module(0xE300_0002))
        .unwrap();

    let mut last = system.ticks();
    for _ in 0..8 {
        system.run_once();
        assert!(system.ticks() > last);
        assert!(!system.reschedule_pending());
        last = system.ticks();
    }
    assert_eq!(system.iterations(), 8);
}

/// Test: a thread that faults is panicked and never stalls the clock
#[test]
fn test_faulting_thread_leaves_the_ready_set() {
    let mut system = boot_system();
    let good = system
        .load("good", "C:\\good.exe", "", &emu_kernel::test_utils::test_module(0xE300_0005))
        .unwrap();
    let module = ModuleImage::new("bad", ProcessUidType::for_process(0xE300_0006), 0x7000_0000)
        .with_code(vec![0x00, 0x00, 0x00, 0xFF], 0);
    let bad = system.load("bad", "C:\\bad.exe", "", &module).unwrap();

    let mut last = system.ticks();
    let mut outcomes = Vec::new();
    for _ in 0..6 {
        outcomes.push(system.run_once());
        assert!(system.ticks() > last, "clock stalled");
        last = system.ticks();
    }

    assert_eq!(
        outcomes
            .iter()
            .filter(|o| **o == LoopOutcome::Ran(StopReason::Fault))
            .count(),
        1
    );
    let bad = system.kernel().get::<Process>(bad).unwrap();
    assert_eq!(bad.exit_type, ExitType::Panic);
    assert_eq!(bad.exit_reason, KERN_EXEC_EXCEPTION);
    assert_eq!(bad.thread_count, 0);

    let good_main = primary_thread(system.kernel(), good);
    assert_eq!(system.kernel().current_thread(), Some(good_main));
}

/// Test: two equal threads share the CPU
#[test]
fn test_equal_threads_alternate_on_cpu() {
    let mut system = boot_system();
    let p = system
        .load("pair", "C:\\pair.exe", "", &emu_kernel::test_utils::test_module(0xE300_0003))
        .unwrap();
    let main = primary_thread(system.kernel(), p);
    let twin = system
        .kernel_mut()
        .create_thread(
            p,
            "twin",
            0x7000_0000,
            0x1000,
            ThreadPriority::AbsoluteForegroundNormal,
        )
        .unwrap();
    system.kernel_mut().scheduler_mut().schedule(twin);

    let mut seen = Vec::new();
    for _ in 0..6 {
        system.run_once();
        seen.extend(system.kernel().current_thread());
    }
    assert!(seen.contains(&main));
    assert!(seen.contains(&twin));
    assert_eq!(
        system.kernel().scheduler().current(),
        system.kernel().loaded_thread()
    );
}

/// Test: the scheduler sees the clock through the loop
#[test]
fn test_scheduler_timestamps_follow_clock() {
    let mut system = boot_system();
    system.run_iterations(3);
    let ticks = system.timing().ticks();

    let last_idle = system
        .kernel()
        .scheduler()
        .audit_log()
        .iter()
        .rev()
        .find_map(|e| match e {
            ScheduleEvent::Idle { timestamp_ticks } => Some(*timestamp_ticks),
            _ => None,
        })
        .unwrap();
    assert!(last_idle < ticks);
    assert_eq!(
        system
            .kernel()
            .scheduler()
            .count_events(|e| matches!(e, ScheduleEvent::Idle { .. })),
        3
    );
}
