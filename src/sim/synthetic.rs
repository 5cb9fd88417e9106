//! Seeded generator for plausible systems of arbitrary size.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::scenario::{LabelSpec, PortSpec, QueueSpec, Scenario, TaskSpec, ThreadSpec};
use crate::kernel::{
    BlockHint, SharedCacheMapping, SharedRegion, SpaceId, TaskObject, ThreadObject,
    TurnstileTarget, WaitTarget, TH_RUN, TH_WAIT,
};
use crate::flags::{THREAD_GROUP_UI_APP, TURNSTILE_STATUS_SENDPORT};
use crate::records::{IoStats, JetsamCoalitionSnapshot, LoadInfo64, ThreadGroupSnapshot};

const KERNEL_TEXT: u64 = 0xffff_ff80_0020_0000;
const USER_TEXT: u64 = 0x1_0000_4000;
const SERVICES: &[&str] = &[
    "com.apple.windowserver",
    "com.apple.logd",
    "com.apple.securityd",
    "com.example.indexer",
    "com.example.updater",
];
const NAMES: &[&str] = &[
    "launchd", "logd", "mds", "WindowServer", "coreaudiod", "sshd", "bash", "cc1", "postgres",
    "nginx",
];

fn frames(rng: &mut StdRng, base: u64, max: usize) -> Vec<u64> {
    let depth = rng.random_range(1..=max);
    (0..depth)
        .map(|_| base + rng.random_range(0..0x10_0000u64) * 4)
        .collect()
}

fn uuid(rng: &mut StdRng) -> [u8; 16] {
    let mut out = [0u8; 16];
    rng.fill(&mut out);
    out
}

/// Generate a system with the kernel task plus `tasks` user tasks.
pub fn generate(tasks: usize, seed: u64) -> Scenario {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut scenario = Scenario {
        cpus: rng.random_range(2..=8),
        ..Default::default()
    };
    let clock = scenario.clock_start;

    scenario.ports = SERVICES
        .iter()
        .enumerate()
        .map(|(i, name)| PortSpec {
            name: name.to_string(),
            label: Some(LabelSpec {
                service_name: Some(name.to_string()),
                domain: (i % 3) as u8,
                throttled: i == 3,
            }),
        })
        .collect();
    scenario.system.thread_groups = Some(vec![
        ThreadGroupSnapshot {
            id: 1,
            name: "system".to_string(),
            flags: 0,
        },
        ThreadGroupSnapshot {
            id: 2,
            name: "apps".to_string(),
            flags: THREAD_GROUP_UI_APP,
        },
    ]);
    scenario.system.coalitions = Some(
        (1..=2)
            .map(|id| JetsamCoalitionSnapshot {
                id,
                flags: 0,
                thread_group: id,
                leader_task_uniqueid: 1000 + id,
            })
            .collect(),
    );

    let mut kernel = TaskSpec {
        task: TaskObject {
            pid: 0,
            unique_pid: 0,
            name: "kernel_task".to_string(),
            space: SpaceId::KERNEL,
            is_kernel: true,
            active: true,
            has_pmap: true,
            ..Default::default()
        },
        ..Default::default()
    };
    for i in 0..rng.random_range(2..=6) {
        kernel.threads.push(ThreadSpec {
            thread: ThreadObject {
                tid: 100 + i as u64,
                state: TH_WAIT,
                last_run: clock - rng.random_range(1..1000),
                ..Default::default()
            },
            kernel_stack: frames(&mut rng, KERNEL_TEXT, 12),
            ..Default::default()
        });
    }
    scenario.tasks.push(kernel);

    let mut next_tid = 1000u64;
    let mut free_cpus: Vec<usize> = (0..scenario.cpus as usize).collect();
    for t in 0..tasks {
        let pid = t as i32 + 1;
        let name = NAMES[t % NAMES.len()];
        let mut spec = TaskSpec {
            task: TaskObject {
                pid,
                unique_pid: 1000 + pid as u64,
                name: name.to_string(),
                space: SpaceId(pid as u32),
                active: true,
                user64: true,
                has_pmap: true,
                start_abstime: clock - rng.random_range(1000..100_000),
                proc_start_sec: 1_700_000_000 + rng.random_range(0..86_400),
                phys_footprint: rng.random_range(1..512u64) << 20,
                faults: rng.random_range(0..100_000),
                pageins: rng.random_range(0..1000),
                foreground: rng.random_bool(0.2),
                darwin_bg: rng.random_bool(0.1),
                io: Some(IoStats {
                    disk_reads_count: rng.random_range(0..10_000),
                    disk_writes_count: rng.random_range(0..10_000),
                    ..Default::default()
                }),
                jetsam_coalition: Some(1 + (t % 2) as u64),
                cputype: 0x0100_0007,
                cpusubtype: 3,
                shared_region: SharedRegion::System,
                shared_cache: Some(SharedCacheMapping {
                    slide: rng.random_range(0..0x1000u64) << 12,
                    uuid: [0xca; 16],
                    base: 0x7fff_2000_0000,
                }),
                ..Default::default()
            },
            images: (0..rng.random_range(1..=4))
                .map(|_| LoadInfo64 {
                    load_address: USER_TEXT + rng.random_range(0..0x1000u64) * 0x1000,
                    uuid: uuid(&mut rng),
                })
                .collect(),
            images_paged_out: rng.random_bool(0.1),
            ..Default::default()
        };

        for i in 0..rng.random_range(1..=8) {
            let tid = next_tid;
            next_tid += 1;
            let mut th = ThreadSpec {
                thread: ThreadObject {
                    tid,
                    state: TH_RUN,
                    last_run: clock - rng.random_range(1..50_000),
                    user_time: rng.random_range(0..1_000_000),
                    system_time: rng.random_range(0..1_000_000),
                    precise_user_kernel_time: true,
                    base_priority: 31,
                    sched_priority: 31,
                    main_thread: i == 0,
                    thread_group: Some(1 + (t % 2) as u64),
                    name: if i == 0 { String::new() } else { format!("worker-{}", i) },
                    ..Default::default()
                },
                user_stack: frames(&mut rng, USER_TEXT, 24),
                kernel_stack: frames(&mut rng, KERNEL_TEXT, 8),
                stack_paged_out: rng.random_bool(0.05),
                ..Default::default()
            };
            if rng.random_bool(0.3) {
                th.dispatch_queue = Some(QueueSpec {
                    serial: rng.random_range(1..10_000),
                    label: format!("com.example.{}.queue-{}", name, i),
                });
            }
            match rng.random_range(0..10) {
                0..=2 => {
                    let port = SERVICES[rng.random_range(0..SERVICES.len())];
                    th.thread.state = TH_WAIT;
                    th.thread.block_hint = BlockHint::PortSend;
                    th.thread.wait = Some(WaitTarget {
                        owner: rng.random_range(1..=tasks.max(1)) as u64,
                        context: rng.random(),
                        ..Default::default()
                    });
                    th.wait_port = Some(port.to_string());
                    if rng.random_bool(0.5) {
                        th.thread.turnstile = Some(TurnstileTarget {
                            context: rng.random(),
                            priority: 31,
                            hops: rng.random_range(1..4),
                            flags: TURNSTILE_STATUS_SENDPORT,
                            port: None,
                        });
                        th.turnstile_port = Some(port.to_string());
                    }
                }
                3 => {
                    th.thread.state = TH_WAIT;
                    th.thread.block_hint = BlockHint::KernelMutex;
                    th.thread.wait = Some(WaitTarget {
                        owner: next_tid.saturating_sub(2),
                        context: rng.random(),
                        ..Default::default()
                    });
                }
                4 => {
                    th.thread.state = TH_WAIT;
                    th.thread.block_hint = BlockHint::ParkedWorkQueue;
                }
                _ => {
                    if let Some(cpu) = free_cpus.pop() {
                        th.on_core = Some(cpu);
                    }
                }
            }
            spec.threads.push(th);
        }
        scenario.tasks.push(spec);
    }
    scenario
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::Kernel;
    use crate::sim::SimKernel;

    #[test]
    fn test_same_seed_same_system() {
        let a = serde_json::to_string(&generate(10, 7)).unwrap();
        let b = serde_json::to_string(&generate(10, 7)).unwrap();
        let c = serde_json::to_string(&generate(10, 8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_generated_system_loads() {
        let scenario = generate(25, 1);
        assert_eq!(scenario.tasks.len(), 26);
        let k = SimKernel::from_scenario(&scenario).unwrap();
        assert_eq!(k.task_count(), 26);
        assert_eq!(k.thread_count(), scenario.thread_count());
        let on_core = k
            .processors()
            .iter()
            .filter(|p| p.active_thread.is_some())
            .count();
        assert!(on_core <= scenario.cpus as usize);
    }
}
