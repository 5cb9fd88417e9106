//! Common test utilities for stackshot integration tests.

#![allow(dead_code)]

use stackshot::kcdata::{parse, Node, Snapshot};
use stackshot::kernel::{SpaceId, TaskObject, ThreadObject, TH_RUN};
use stackshot::records::Record;
use stackshot::sim::scenario::{Scenario, TaskSpec, ThreadSpec};
use stackshot::sim::SimKernel;
use stackshot::{StackshotResult, StackshotService, Tunables};

pub const USER_TEXT: u64 = 0x1_0000_4000;
pub const KERNEL_TEXT: u64 = 0xffff_ff80_0020_0000;

/// A running user thread with a short user and kernel stack.
pub fn thread(tid: u64) -> ThreadSpec {
    ThreadSpec {
        thread: ThreadObject {
            tid,
            state: TH_RUN,
            last_run: 900_000,
            ..Default::default()
        },
        user_stack: vec![USER_TEXT, USER_TEXT + 0x40, USER_TEXT + 0x80, USER_TEXT + 0xc0],
        kernel_stack: vec![KERNEL_TEXT, KERNEL_TEXT + 0x100],
        ..Default::default()
    }
}

pub fn task(pid: i32, threads: Vec<ThreadSpec>) -> TaskSpec {
    TaskSpec {
        task: TaskObject {
            pid,
            unique_pid: 1000 + pid as u64,
            name: format!("proc{}", pid),
            space: SpaceId(pid as u32),
            active: true,
            user64: true,
            has_pmap: true,
            start_abstime: 100,
            ..Default::default()
        },
        threads,
        ..Default::default()
    }
}

/// One task per entry of `threads`, pids from 1, with that many threads each.
pub fn scenario_with_threads(threads: &[usize]) -> Scenario {
    let mut next_tid = 100;
    let tasks = threads
        .iter()
        .enumerate()
        .map(|(i, &count)| {
            let specs = (0..count)
                .map(|_| {
                    next_tid += 1;
                    thread(next_tid)
                })
                .collect();
            task(i as i32 + 1, specs)
        })
        .collect();
    Scenario {
        tasks,
        ..Default::default()
    }
}

pub fn service(scenario: &Scenario, tunables: Tunables) -> StackshotService<SimKernel> {
    let kernel = SimKernel::from_scenario(scenario).expect("scenario should load");
    StackshotService::new(kernel, tunables)
}

/// Decode the buffer of a successful result.
pub fn snapshot(result: &StackshotResult) -> Snapshot {
    assert!(
        result.status.is_success(),
        "stackshot failed: {}",
        result.status
    );
    let buffer = result.buffer.as_deref().expect("result should carry a buffer");
    assert_eq!(buffer.len() as u64, result.bytes_traced);
    parse(buffer).expect("buffer should decode")
}

/// First record directly inside `node` matching `f`.
pub fn find<T>(node: &Node, f: impl Fn(&Record) -> Option<T>) -> Option<T> {
    node.records().find_map(f)
}

/// The thread snapshot of a thread container.
pub fn thread_snapshot(node: &Node) -> stackshot::records::ThreadSnapshot {
    find(node, |r| match r {
        Record::ThreadSnapshot(s) => Some(s.clone()),
        _ => None,
    })
    .expect("thread container should hold a snapshot")
}
