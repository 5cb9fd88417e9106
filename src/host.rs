//! Scenario built from the machine we are running on.
//!
//! Only what `sysinfo` and `libc` can see without privileges is filled in:
//! processes, their threads, memory use and io counters. Stacks, ports
//! and image lists of other processes are out of reach, so the resulting
//! tasks carry none.

use std::collections::HashSet;
use std::fs;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{bail, Result};
use sysinfo::{Pid, Process, ProcessStatus, System};
use tracing::debug;

use crate::kernel::{SpaceId, TaskObject, ThreadObject, TH_RUN, TH_SUSP, TH_WAIT};
use crate::records::{IoStats, MemStats, Timebase, MEM_AND_IO_SNAPSHOT_MAGIC};
use crate::sim::scenario::{Scenario, TaskSpec, ThreadSpec};
use crate::sim::SystemInfo;

fn sysconf(name: libc::c_int) -> Result<u64> {
    let value = unsafe { libc::sysconf(name) };
    if value <= 0 {
        bail!("sysconf({}) failed: {}", name, std::io::Error::last_os_error());
    }
    Ok(value as u64)
}

fn monotonic_ns() -> u64 {
    let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
        return 0;
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

fn thread_state(status: ProcessStatus) -> u32 {
    match status {
        ProcessStatus::Run => TH_RUN,
        ProcessStatus::Stop => TH_SUSP,
        _ => TH_WAIT,
    }
}

fn task_for(pid: Pid, process: &Process) -> TaskObject {
    let usage = process.disk_usage();
    let status = process.status();
    TaskObject {
        pid: pid.as_u32() as i32,
        // Pids are reused; the start time keeps the identity unique.
        unique_pid: (process.start_time() << 22) | pid.as_u32() as u64,
        name: process.name().to_string_lossy().into_owned(),
        space: SpaceId(pid.as_u32()),
        active: !matches!(status, ProcessStatus::Zombie | ProcessStatus::Dead),
        user64: cfg!(target_pointer_width = "64"),
        suspended: status == ProcessStatus::Stop,
        proc_start_sec: process.start_time(),
        phys_footprint: process.memory(),
        max_resident: process.memory(),
        io: Some(IoStats {
            disk_reads_size: usage.total_read_bytes,
            disk_writes_size: usage.total_written_bytes,
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Describe the live host as a scenario, keeping at most `limit` processes
/// (lowest pids first).
pub fn scenario(limit: Option<usize>) -> Result<Scenario> {
    let page_size = sysconf(libc::_SC_PAGESIZE)?;
    let cpus = sysconf(libc::_SC_NPROCESSORS_ONLN)? as u32;
    let sys = System::new_all();

    let now = monotonic_ns();
    let wall_us = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0);
    let pages = |bytes: u64| (bytes / page_size).min(u32::MAX as u64) as u32;

    let system = SystemInfo {
        os_version: format!(
            "{} {}",
            System::long_os_version().unwrap_or_else(|| "unknown".to_string()),
            System::kernel_version().unwrap_or_default()
        ),
        boot_args: fs::read_to_string("/proc/cmdline")
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
        total_memory: sys.total_memory(),
        mem_stats: MemStats {
            snapshot_magic: MEM_AND_IO_SNAPSHOT_MAGIC,
            free_pages: pages(sys.free_memory()),
            active_pages: pages(sys.used_memory()),
            ..Default::default()
        },
        timebase: Timebase { numer: 1, denom: 1 },
        has_instr_counters: false,
        calendar_base_us: wall_us.saturating_sub(now / 1000),
        ..Default::default()
    };

    let processes = sys.processes();
    // On Linux threads are listed as processes too; keep thread group
    // leaders only.
    let threads: HashSet<Pid> = processes
        .iter()
        .flat_map(|(pid, p)| {
            p.tasks()
                .into_iter()
                .flatten()
                .filter(move |tid| *tid != pid)
                .copied()
        })
        .collect();
    let mut pids: Vec<Pid> = processes
        .keys()
        .filter(|pid| !threads.contains(*pid))
        .copied()
        .collect();
    pids.sort();
    if let Some(limit) = limit {
        pids.truncate(limit);
    }

    let mut tasks = vec![TaskSpec {
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
    }];
    for pid in pids {
        let Some(process) = processes.get(&pid) else {
            continue;
        };
        let mut tids: Vec<Pid> = match process.tasks() {
            Some(tasks) => tasks.iter().copied().collect(),
            None => Vec::new(),
        };
        if !tids.contains(&pid) {
            tids.push(pid);
        }
        tids.sort();

        let threads = tids
            .into_iter()
            .map(|tid| {
                let (name, status) = match processes.get(&tid) {
                    Some(t) => (t.name().to_string_lossy().into_owned(), t.status()),
                    None => (String::new(), process.status()),
                };
                ThreadSpec {
                    thread: ThreadObject {
                        tid: tid.as_u32() as u64,
                        state: thread_state(status),
                        name,
                        main_thread: tid == pid,
                        ..Default::default()
                    },
                    ..Default::default()
                }
            })
            .collect();
        tasks.push(TaskSpec {
            task: task_for(pid, process),
            threads,
            ..Default::default()
        });
    }
    debug!("host scenario with {} tasks", tasks.len());

    Ok(Scenario {
        page_size,
        clock_start: now,
        fault_cost: 0,
        cpus: cpus.max(1),
        system,
        ports: Vec::new(),
        tasks,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    #[test]
    fn test_host_scenario_loads() {
        let scenario = scenario(Some(8)).unwrap();
        assert!(scenario.page_size.is_power_of_two());
        assert!(scenario.tasks.len() <= 9);
        assert!(scenario.tasks[0].task.is_kernel);
        assert!(SimKernel::from_scenario(&scenario).is_ok());
    }
}
