//! End-to-end captures over simulated systems.
//!
//! Each test builds a scenario, runs it through the service and decodes the
//! resulting buffer.

mod common;

use std::collections::BTreeMap;

use common::*;
use stackshot::flags::{TaskSsFlags, ThreadSsFlags};
use stackshot::kcdata::types::{
    STACKSHOT_CONTAINER_TASK, STACKSHOT_CONTAINER_THREAD, STACKSHOT_CONTAINER_TRANSITIONING_TASK,
};
use stackshot::kcdata::{Node, Snapshot};
use stackshot::kernel::{BlockHint, WaitTarget, TH_WAIT};
use stackshot::records::{LoadInfo64, Record};
use stackshot::sim::scenario::{LabelSpec, PortSpec, QueueSpec};
use stackshot::sim::synthetic;
use stackshot::{SnapshotRequest, StackshotFlags, Status, Tunables};

fn request(f: impl FnOnce(&mut StackshotFlags)) -> SnapshotRequest {
    let mut flags = StackshotFlags::default();
    f(&mut flags);
    SnapshotRequest::with_flags(flags)
}

fn user_stack(node: &stackshot::kcdata::Node) -> Option<Vec<u64>> {
    find(node, |r| match r {
        Record::UserStack(frames) => Some(frames.clone()),
        _ => None,
    })
}

#[test]
fn test_every_task_and_thread_is_captured() {
    let scenario = scenario_with_threads(&[5, 7, 2]);
    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));

    let tasks = snap.containers(STACKSHOT_CONTAINER_TASK);
    assert_eq!(tasks.len(), 3);
    assert_eq!(snap.containers(STACKSHOT_CONTAINER_THREAD).len(), 14);

    let per_task: Vec<(Option<u64>, usize)> = tasks
        .iter()
        .map(|t| {
            let threads = t
                .children()
                .iter()
                .filter(|c| c.id().is_some())
                .count();
            (t.id(), threads)
        })
        .collect();
    assert_eq!(
        per_task,
        vec![(Some(1001), 5), (Some(1002), 7), (Some(1003), 2)]
    );

    for task in tasks {
        let snap = find(task, |r| match r {
            Record::TaskSnapshot(s) => Some(s.clone()),
            _ => None,
        })
        .unwrap();
        assert_eq!(snap.unique_pid, task.id().unwrap());
        assert!(TaskSsFlags::from_bits(snap.ss_flags).user64());
    }
}

#[test]
fn test_compressed_matches_plain() {
    let scenario = synthetic::generate(12, 5);
    let svc = service(&scenario, Tunables::default());

    let plain = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));
    let packed_result = svc.stack_snapshot(request(|f| f.set_compress(true)));
    let packed = snapshot(&packed_result);
    assert!(packed.compressed);
    assert!(!plain.compressed);
    assert!(packed_result.bytes_uncompressed > 0);

    let tasks = |s: &stackshot::kcdata::Snapshot| {
        serde_json::to_value(s.containers(STACKSHOT_CONTAINER_TASK)).unwrap()
    };
    assert_eq!(tasks(&plain), tasks(&packed));
}

#[test]
fn test_delta_reports_only_recent_threads() {
    let mut recent = thread(101);
    recent.thread.last_run = 999_000;
    let mut stale = thread(102);
    stale.thread.last_run = 500_000;
    let mut idle = thread(103);
    idle.thread.last_run = 400_000;
    let scenario = stackshot::sim::Scenario {
        tasks: vec![task(1, vec![recent, stale]), task(2, vec![idle])],
        ..Default::default()
    };
    let svc = service(&scenario, Tunables::default());

    let mut req = request(|f| f.set_delta(true));
    req.since_timestamp = 900_000;
    let snap = snapshot(&svc.stack_snapshot(req));
    assert!(snap.delta);
    assert!(snap
        .records()
        .any(|r| *r == Record::DeltaSinceTimestamp(900_000)));

    let threads = snap.containers(STACKSHOT_CONTAINER_THREAD);
    assert_eq!(threads.len(), 1);
    assert_eq!(threads[0].id(), Some(101));

    let tasks = snap.containers(STACKSHOT_CONTAINER_TASK);
    assert_eq!(tasks.len(), 2);
    let deltas = |node: &stackshot::kcdata::Node| {
        find(node, |r| match r {
            Record::ThreadDeltaSnapshots(v) => {
                Some(v.iter().map(|d| d.thread_id).collect::<Vec<_>>())
            }
            _ => None,
        })
    };

    assert!(find(tasks[0], |r| matches!(r, Record::TaskSnapshot(_)).then_some(())).is_some());
    assert_eq!(deltas(tasks[0]), Some(vec![102]));

    assert!(find(tasks[1], |r| match r {
        Record::TaskDeltaSnapshot(d) => Some(d.unique_pid),
        _ => None,
    })
    .is_some_and(|id| id == 1002));
    assert!(find(tasks[1], |r| matches!(r, Record::TaskSnapshot(_)).then_some(())).is_none());
    assert_eq!(deltas(tasks[1]), Some(vec![103]));
}

/// Container kinds and ids plus item kinds, in buffer order.
#[derive(Debug, PartialEq, Eq)]
enum Shape {
    Container(u32, u64, Vec<Shape>),
    Item(u32),
}

fn shape(node: &Node) -> Shape {
    match node {
        Node::Container {
            kind, id, children, ..
        } => Shape::Container(*kind, *id, children.iter().map(shape).collect()),
        Node::Item { kind, .. } => Shape::Item(*kind),
    }
}

fn is_thread(node: &Node) -> bool {
    matches!(node, Node::Container { kind, .. } if *kind == STACKSHOT_CONTAINER_THREAD)
}

/// Every thread id reported under each task container, full or delta.
fn threads_by_task(snap: &Snapshot) -> BTreeMap<u64, Vec<u64>> {
    snap.containers(STACKSHOT_CONTAINER_TASK)
        .into_iter()
        .map(|task| {
            let mut tids: Vec<u64> = task
                .children()
                .iter()
                .filter(|c| is_thread(c))
                .filter_map(Node::id)
                .collect();
            for rec in task.records() {
                if let Record::ThreadDeltaSnapshots(deltas) = rec {
                    tids.extend(deltas.iter().map(|d| d.thread_id));
                }
            }
            tids.sort_unstable();
            (task.id().unwrap_or_default(), tids)
        })
        .collect()
}

fn task_ids(snap: &Snapshot) -> Vec<u64> {
    let mut ids: Vec<u64> = snap
        .containers(STACKSHOT_CONTAINER_TASK)
        .into_iter()
        .chain(snap.containers(STACKSHOT_CONTAINER_TRANSITIONING_TASK))
        .filter_map(Node::id)
        .collect();
    ids.sort_unstable();
    ids
}

#[test]
fn test_consecutive_captures_have_the_same_shape() {
    let svc = service(&synthetic::generate(15, 3), Tunables::default());
    let first = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));
    let second = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));

    assert!(!first.nodes.is_empty());
    let first: Vec<Shape> = first.nodes.iter().map(shape).collect();
    let second: Vec<Shape> = second.nodes.iter().map(shape).collect();
    assert_eq!(first, second);
}

#[test]
fn test_delta_since_previous_capture_covers_every_task() {
    let svc = service(&synthetic::generate(15, 3), Tunables::default());
    let full = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));
    let baseline = full
        .records()
        .find_map(|r| match r {
            Record::MachAbsoluteTime(t) => Some(*t),
            _ => None,
        })
        .expect("full capture should carry its absolute time");

    let mut req = request(|f| f.set_delta(true));
    req.since_timestamp = baseline;
    let delta = snapshot(&svc.stack_snapshot(req));
    assert!(delta.delta);

    assert_eq!(task_ids(&delta), task_ids(&full));
    assert_eq!(threads_by_task(&delta), threads_by_task(&full));

    // Nothing ran since the baseline, so only on-core threads are reported in full.
    let full_threads = delta.containers(STACKSHOT_CONTAINER_THREAD);
    assert!(full_threads.len() < full.containers(STACKSHOT_CONTAINER_THREAD).len());
    for th in full_threads {
        assert!(ThreadSsFlags::from_bits(thread_snapshot(th).ss_flags).on_core());
    }
}

#[test]
fn test_delta_with_compression_is_rejected() {
    let svc = service(&scenario_with_threads(&[1]), Tunables::default());
    let result = svc.stack_snapshot(request(|f| {
        f.set_delta(true);
        f.set_compress(true);
    }));
    assert_eq!(result.status, Status::NotSupported);
}

#[test]
fn test_paged_out_stack_is_truncated_without_faulting() {
    let mut th = thread(101);
    th.stack_paged_out = true;
    let scenario = stackshot::sim::Scenario {
        tasks: vec![task(1, vec![th])],
        ..Default::default()
    };

    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));
    let node = snap.containers(STACKSHOT_CONTAINER_THREAD)[0];
    assert_eq!(user_stack(node), Some(vec![USER_TEXT]));
    let ss = ThreadSsFlags::from_bits(thread_snapshot(node).ss_flags);
    assert!(ss.truncated_bt());
    assert!(ss.trunc_user_bt());
    assert!(!ss.faulted_bt());
    assert!(snap
        .all_records()
        .iter()
        .all(|r| !matches!(r, Record::FaultStats(_))));
}

#[test]
fn test_paged_out_stack_is_faulted_in_when_allowed() {
    let mut th = thread(101);
    th.stack_paged_out = true;
    let expected = th.user_stack.clone();
    let scenario = stackshot::sim::Scenario {
        tasks: vec![task(1, vec![th])],
        ..Default::default()
    };

    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(request(|f| f.set_fault_backtraces(true))));
    let node = snap.containers(STACKSHOT_CONTAINER_THREAD)[0];
    assert_eq!(user_stack(node), Some(expected));
    let ss = ThreadSsFlags::from_bits(thread_snapshot(node).ss_flags);
    assert!(ss.faulted_bt());
    assert!(!ss.truncated_bt());

    let stats = snap
        .records()
        .find_map(|r| match r {
            Record::FaultStats(s) => Some(*s),
            _ => None,
        })
        .unwrap();
    assert_eq!(stats.pages_faulted_in, 1);
    assert_eq!(stats.stopped_faulting, 0);
}

#[test]
fn test_fault_budget_stops_faulting() {
    let tasks = (1..=5)
        .map(|pid| {
            let mut th = thread(100 + pid as u64);
            th.stack_paged_out = true;
            task(pid, vec![th])
        })
        .collect();
    let scenario = stackshot::sim::Scenario {
        fault_cost: 600,
        tasks,
        ..Default::default()
    };
    let tunables = Tunables {
        max_fault_time_us: 1,
        ..Default::default()
    };

    let svc = service(&scenario, tunables);
    let snap = snapshot(&svc.stack_snapshot(request(|f| f.set_fault_backtraces(true))));
    let stats = snap
        .records()
        .find_map(|r| match r {
            Record::FaultStats(s) => Some(*s),
            _ => None,
        })
        .unwrap();
    assert_eq!(stats.pages_faulted_in, 2);
    assert_eq!(stats.stopped_faulting, 1);
    assert_eq!(stats.time_spent_faulting, 1200);

    let flags: Vec<ThreadSsFlags> = snap
        .containers(STACKSHOT_CONTAINER_THREAD)
        .iter()
        .map(|n| ThreadSsFlags::from_bits(thread_snapshot(n).ss_flags))
        .collect();
    assert_eq!(flags.iter().filter(|f| f.faulted_bt()).count(), 2);
    assert_eq!(flags.iter().filter(|f| f.truncated_bt()).count(), 3);
}

#[test]
fn test_interrupts_are_masked_and_restored() {
    let svc = service(&synthetic::generate(10, 3), Tunables::default());
    assert!(svc.kernel().interrupts_enabled());

    let result = svc.stack_snapshot(SnapshotRequest::default());
    assert!(result.status.is_success());
    assert!(svc.kernel().interrupts_enabled());
    assert_eq!(svc.kernel().interrupt_disables(), 1);
    assert_eq!(svc.kernel().unmasked_walks(), 0);
}

#[test]
fn test_corrupt_task_fails_the_capture() {
    let mut scenario = scenario_with_threads(&[2, 2, 2]);
    scenario.tasks[1].corrupt = true;
    let svc = service(&scenario, Tunables::default());

    let result = svc.stack_snapshot(SnapshotRequest::default());
    assert_eq!(result.status, Status::Failure);
    assert!(result.buffer.is_none());
    assert!(svc.kernel().interrupts_enabled());
}

#[test]
fn test_fixed_buffer_too_small() {
    let svc = service(&scenario_with_threads(&[5, 7, 2]), Tunables::default());
    let result = svc.capture_fixed(SnapshotRequest::default(), 1024);
    assert_eq!(result.status, Status::InsufficientBufferSize);
    assert!(result.buffer.is_none());

    let result = svc.capture_fixed(SnapshotRequest::default(), 1 << 20);
    let snap = snapshot(&result);
    assert_eq!(snap.containers(STACKSHOT_CONTAINER_THREAD).len(), 14);
}

#[test]
fn test_terminated_task_is_transitioning() {
    let mut scenario = scenario_with_threads(&[1, 1]);
    scenario.tasks[1].terminated = true;
    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));

    assert_eq!(snap.containers(STACKSHOT_CONTAINER_TASK).len(), 1);
    let gone = snap.containers(STACKSHOT_CONTAINER_TRANSITIONING_TASK);
    assert_eq!(gone.len(), 1);
    let rec = find(gone[0], |r| match r {
        Record::TransitioningTaskSnapshot(s) => Some(s.clone()),
        _ => None,
    })
    .unwrap();
    assert_eq!(rec.pid, 2);
    assert!(TaskSsFlags::from_bits(rec.ss_flags).terminated());
}

#[test]
fn test_load_info_and_dispatch_queue() {
    let images = vec![
        LoadInfo64 {
            load_address: USER_TEXT,
            uuid: [0x11; 16],
        },
        LoadInfo64 {
            load_address: USER_TEXT + 0x10_0000,
            uuid: [0x22; 16],
        },
    ];
    let mut th = thread(101);
    th.dispatch_queue = Some(QueueSpec {
        serial: 42,
        label: "com.example.main-queue".to_string(),
    });
    let mut spec = task(1, vec![th]);
    spec.images = images.clone();
    let scenario = stackshot::sim::Scenario {
        tasks: vec![spec],
        ..Default::default()
    };
    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(request(|f| {
        f.set_save_loadinfo(true);
        f.set_get_dispatch_queue(true);
    })));

    let task_node = snap.containers(STACKSHOT_CONTAINER_TASK)[0];
    let loaded = find(task_node, |r| match r {
        Record::LoadInfo(v) => Some(v.clone()),
        _ => None,
    });
    assert_eq!(loaded, Some(images));

    let thread_node = snap.containers(STACKSHOT_CONTAINER_THREAD)[0];
    let label = find(thread_node, |r| match r {
        Record::DispatchQueueLabel(l) => Some(l.clone()),
        _ => None,
    });
    assert_eq!(label.as_deref(), Some("com.example.main-queue"));
    let ts = thread_snapshot(thread_node);
    assert_eq!(ts.dqserialnum, 42);
    assert!(ThreadSsFlags::from_bits(ts.ss_flags).has_dispatch_serial());
}

#[test]
fn test_paged_out_images_are_reported_missing() {
    let mut spec = task(1, vec![thread(101)]);
    spec.images = vec![LoadInfo64 {
        load_address: USER_TEXT,
        uuid: [0x33; 16],
    }];
    spec.images_paged_out = true;
    let scenario = stackshot::sim::Scenario {
        tasks: vec![spec],
        ..Default::default()
    };
    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(request(|f| f.set_save_loadinfo(true))));

    let task_node = snap.containers(STACKSHOT_CONTAINER_TASK)[0];
    let loaded = find(task_node, |r| match r {
        Record::LoadInfo(v) => Some(v.clone()),
        _ => None,
    });
    assert_eq!(loaded, Some(vec![LoadInfo64::default()]));
    let ts = find(task_node, |r| match r {
        Record::TaskSnapshot(s) => Some(s.ss_flags),
        _ => None,
    })
    .unwrap();
    assert!(TaskSsFlags::from_bits(ts).uuid_missing());
}

#[test]
fn test_port_labels_are_shared_across_tasks() {
    let waiter = |tid| {
        let mut th = thread(tid);
        th.thread.state = TH_WAIT;
        th.thread.block_hint = BlockHint::PortSend;
        th.thread.wait = Some(WaitTarget {
            owner: 7,
            ..Default::default()
        });
        th.wait_port = Some("svc".to_string());
        th
    };
    let scenario = stackshot::sim::Scenario {
        ports: vec![PortSpec {
            name: "svc".to_string(),
            label: Some(LabelSpec {
                service_name: Some("com.example.svc".to_string()),
                domain: 1,
                throttled: false,
            }),
        }],
        tasks: vec![task(1, vec![waiter(101)]), task(2, vec![waiter(102)])],
        ..Default::default()
    };
    let svc = service(&scenario, Tunables::default());
    let snap = snapshot(&svc.stack_snapshot(SnapshotRequest::default()));

    let ids: Vec<i16> = snap
        .containers(STACKSHOT_CONTAINER_TASK)
        .iter()
        .map(|t| {
            find(t, |r| match r {
                Record::WaitInfo(v) => Some(v[0].portlabel_id),
                _ => None,
            })
            .unwrap()
        })
        .collect();
    assert_eq!(ids[0], ids[1]);
    assert!(ids[0] > 0);
}
