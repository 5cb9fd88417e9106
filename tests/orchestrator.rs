//! Locking, sizing, retry and retained-buffer behavior of the service.

mod common;

use std::thread;

use common::*;
use stackshot::kcdata::types::STACKSHOT_CONTAINER_TASK;
use stackshot::records::Record;
use stackshot::sim::synthetic;
use stackshot::{Origin, SnapshotRequest, StackshotFlags, Status, Tunables};

/// Tunables whose estimate is far below what any real system needs.
fn tiny_estimate() -> Tunables {
    Tunables {
        estimate_slack_percent: 0,
        est_task_bytes: 0,
        est_thread_bytes: 0,
        est_uuid_bytes_per_task: 0,
        supplement_bytes: 1024,
        port_label_capacity: 0,
        ..Default::default()
    }
}

fn kernel_request(f: impl FnOnce(&mut StackshotFlags)) -> SnapshotRequest {
    let mut flags = StackshotFlags::default();
    f(&mut flags);
    SnapshotRequest {
        flags,
        origin: Origin::Kernel,
        ..Default::default()
    }
}

#[test]
fn test_small_estimate_grows_until_it_fits() {
    let scenario = synthetic::generate(20, 11);
    let svc = service(&scenario, tiny_estimate());

    let result = svc.stack_snapshot(SnapshotRequest::default());
    let snap = snapshot(&result);
    assert!(svc.kernel().interrupt_disables() > 1);
    assert!(result.bytes_traced > 4096);
    assert!(svc.kernel().interrupts_enabled());
    assert_eq!(snap.containers(STACKSHOT_CONTAINER_TASK).len(), 21);

    let estimate = snap.desc_u64("stackshot_size_estimate");
    assert_eq!(estimate, Some(4096));
    assert!(snap.records().any(|r| matches!(r, Record::Duration(_))));
}

#[test]
fn test_size_hint_avoids_retries() {
    let scenario = synthetic::generate(20, 11);
    let svc = service(&scenario, tiny_estimate());

    let result = svc.stack_snapshot(SnapshotRequest {
        size_hint: 1 << 20,
        ..Default::default()
    });
    assert!(result.status.is_success());
    assert_eq!(svc.kernel().interrupt_disables(), 1);
}

#[test]
fn test_ceiling_exhaustion_is_resource_shortage() {
    let scenario = synthetic::generate(20, 11);
    let tunables = Tunables {
        max_buffer_bytes: Some(4096),
        ..Default::default()
    };
    let svc = service(&scenario, tunables);

    let result = svc.stack_snapshot(SnapshotRequest::default());
    assert_eq!(result.status, Status::ResourceShortage);
    assert!(result.buffer.is_none());
    assert_eq!(svc.kernel().interrupt_disables(), 1);
    assert!(svc.kernel().interrupts_enabled());
}

#[test]
fn test_retained_buffer_protocol() {
    let svc = service(&scenario_with_threads(&[3, 1]), Tunables::default());

    let saved = svc.stack_snapshot(kernel_request(|f| f.set_save_in_kernel_buffer(true)));
    assert_eq!(saved.status, Status::Success);
    assert!(saved.buffer.is_none());
    assert!(saved.bytes_traced > 0);
    assert!(svc.has_retained_buffer());

    let again = svc.stack_snapshot(kernel_request(|f| f.set_save_in_kernel_buffer(true)));
    assert_eq!(again.status, Status::MemoryPresent);

    let retrieved =
        svc.stack_snapshot(kernel_request(|f| f.set_retrieve_existing_buffer(true)));
    assert_eq!(retrieved.bytes_traced, saved.bytes_traced);
    let snap = snapshot(&retrieved);
    assert_eq!(snap.containers(STACKSHOT_CONTAINER_TASK).len(), 2);
    assert!(!svc.has_retained_buffer());

    let empty = svc.stack_snapshot(kernel_request(|f| f.set_retrieve_existing_buffer(true)));
    assert_eq!(empty.status, Status::NotInSet);
}

#[test]
fn test_user_callers_cannot_retain_or_trylock() {
    let svc = service(&scenario_with_threads(&[1]), Tunables::default());
    let setters: [fn(&mut StackshotFlags, bool); 2] = [
        StackshotFlags::set_save_in_kernel_buffer,
        StackshotFlags::set_trylock,
    ];
    for set in setters {
        let mut flags = StackshotFlags::default();
        set(&mut flags, true);
        let result = svc.stack_snapshot(SnapshotRequest::with_flags(flags));
        assert_eq!(result.status, Status::NoAccess);
    }
    assert!(!svc.has_retained_buffer());
}

#[test]
fn test_malformed_requests_are_rejected() {
    let svc = service(&scenario_with_threads(&[1]), Tunables::default());

    let result = svc.stack_snapshot(SnapshotRequest {
        pid: -7,
        ..Default::default()
    });
    assert_eq!(result.status, Status::InvalidArgument);

    let result = svc.stack_snapshot(SnapshotRequest {
        since_timestamp: 10,
        ..Default::default()
    });
    assert_eq!(result.status, Status::InvalidArgument);
    assert_eq!(svc.kernel().interrupt_disables(), 0);
}

#[test]
fn test_concurrent_requests_all_complete() {
    let svc = service(&synthetic::generate(8, 2), Tunables::default());

    let results: Vec<_> = thread::scope(|s| {
        let handles: Vec<_> = (0..4)
            .map(|_| s.spawn(|| svc.stack_snapshot(SnapshotRequest::default())))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    for result in &results {
        let snap = snapshot(result);
        assert_eq!(snap.containers(STACKSHOT_CONTAINER_TASK).len(), 9);
    }
    assert_eq!(svc.kernel().interrupt_disables(), 4);
    assert!(svc.kernel().interrupts_enabled());
}
