//! Logon and Rendezvous Tests
//!
//! Validates that every queued notification is completed exactly once
//! with the right code, written into the requester's address space.

use emu_kernel::{ExitType, Process, Thread};
use kernel_api::status::{KERR_CANCEL, KREQUEST_PENDING};
use tests_resilience::{boot_kernel, primary_thread, read_status, spawn_app, watcher_request};

/// Test: logon after exit completes synchronously and queues nothing
#[test]
fn test_logon_after_exit_is_immediate() {
    let mut kernel = boot_kernel();
    let target = spawn_app(&mut kernel, "target", 0xE200_0001).unwrap();
    let watcher = spawn_app(&mut kernel, "watcher", 0xE200_0002).unwrap();

    kernel.kill_process(target, ExitType::Kill, -7).unwrap();

    let request = watcher_request(&mut kernel, watcher);
    let queued = kernel.logon(target, request, false).unwrap();
    assert!(!queued);
    assert_eq!(read_status(&mut kernel, request.requester, request.status), -7);
    assert_eq!(kernel.get::<Process>(target).unwrap().pending_logons(), 0);
}

/// Test: rendezvous completes every queued request once
///
/// This validates that:
/// 1. Every registrant is completed with the given reason
/// 2. The queue is empty afterwards
/// 3. A second rendezvous completes nothing
/// 4. Logon requests are not touched
#[test]
fn test_rendezvous_completes_each_request_once() {
    let mut kernel = boot_kernel();
    let target = spawn_app(&mut kernel, "target", 0xE200_0003).unwrap();
    let watcher = spawn_app(&mut kernel, "watcher", 0xE200_0004).unwrap();

    let starts: Vec<_> = (0..3)
        .map(|_| watcher_request(&mut kernel, watcher))
        .collect();
    for request in &starts {
        assert!(kernel.logon(target, *request, true).unwrap());
    }
    let exit = watcher_request(&mut kernel, watcher);
    kernel.logon(target, exit, false).unwrap();

    assert_eq!(kernel.rendezvous(target, 0).unwrap(), 3);
    for request in &starts {
        assert_eq!(read_status(&mut kernel, request.requester, request.status), 0);
    }
    let requester = primary_thread(&kernel, watcher);
    assert_eq!(kernel.get::<Thread>(requester).unwrap().request_count, 3);

    assert_eq!(kernel.rendezvous(target, 0).unwrap(), 0);
    assert_eq!(kernel.get::<Thread>(requester).unwrap().request_count, 3);
    assert_eq!(
        read_status(&mut kernel, exit.requester, exit.status),
        KREQUEST_PENDING
    );
    assert_eq!(kernel.get::<Process>(target).unwrap().pending_logons(), 1);
}

/// Test: cancellation removes exactly the matching request
#[test]
fn test_logon_cancel_is_exact() {
    let mut kernel = boot_kernel();
    let target = spawn_app(&mut kernel, "target", 0xE200_0005).unwrap();
    let watcher = spawn_app(&mut kernel, "watcher", 0xE200_0006).unwrap();

    let a = watcher_request(&mut kernel, watcher);
    let b = watcher_request(&mut kernel, watcher);
    kernel.logon(target, a, false).unwrap();
    kernel.logon(target, b, false).unwrap();

    assert!(kernel.logon_cancel(target, a, false).unwrap());
    assert_eq!(read_status(&mut kernel, a.requester, a.status), KERR_CANCEL);
    assert_eq!(read_status(&mut kernel, b.requester, b.status), KREQUEST_PENDING);

    // Already cancelled
    assert!(!kernel.logon_cancel(target, a, false).unwrap());
    assert_eq!(kernel.get::<Process>(target).unwrap().pending_logons(), 1);

    // The survivor still completes on exit
    kernel.kill_process(target, ExitType::Terminate, 3).unwrap();
    assert_eq!(read_status(&mut kernel, b.requester, b.status), 3);
    assert_eq!(read_status(&mut kernel, a.requester, a.status), KERR_CANCEL);
}

/// Test: exit completes logons and rendezvous requests together
#[test]
fn test_exit_completes_both_queues() {
    let mut kernel = boot_kernel();
    let target = spawn_app(&mut kernel, "target", 0xE200_0007).unwrap();
    let watcher = spawn_app(&mut kernel, "watcher", 0xE200_0008).unwrap();

    let on_start = watcher_request(&mut kernel, watcher);
    let on_exit = watcher_request(&mut kernel, watcher);
    kernel.logon(target, on_start, true).unwrap();
    kernel.logon(target, on_exit, false).unwrap();

    let main = primary_thread(&kernel, target);
    kernel.exit_thread(main, 9).unwrap();

    assert_eq!(read_status(&mut kernel, on_start.requester, on_start.status), 9);
    assert_eq!(read_status(&mut kernel, on_exit.requester, on_exit.status), 9);
    // Reaping is allowed once nothing is pending
    kernel.destroy_process(target).unwrap();
}

/// Test: a requester that went away is skipped without failing the others
#[test]
fn test_vanished_requester_is_skipped() {
    let mut kernel = boot_kernel();
    let target = spawn_app(&mut kernel, "target", 0xE200_0009).unwrap();
    let gone = spawn_app(&mut kernel, "gone", 0xE200_000A).unwrap();
    let stays = spawn_app(&mut kernel, "stays", 0xE200_000B).unwrap();

    let lost = watcher_request(&mut kernel, gone);
    let kept = watcher_request(&mut kernel, stays);
    kernel.logon(target, lost, false).unwrap();
    kernel.logon(target, kept, false).unwrap();

    kernel.kill_process(gone, ExitType::Kill, 0).unwrap();
    kernel.kill_process(target, ExitType::Kill, 1).unwrap();
    assert_eq!(read_status(&mut kernel, kept.requester, kept.status), 1);
    assert_eq!(kernel.get::<Process>(target).unwrap().pending_logons(), 0);
}
