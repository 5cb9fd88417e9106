//! Record payloads and the closed set of record kinds.
//!
//! Every record the capture routine emits is a [`Record`] variant. The
//! variant knows its item type, its wire shape (single struct, string, or
//! array) and how to encode itself, so the writer only ever sees
//! `push(&record)`.

use serde::{Deserialize, Serialize};

use crate::kcdata::types::*;
use crate::kcdata::{c_string, FieldReader, FieldWriter, KcStruct};

pub const DESC_NAME_LEN: usize = 32;
pub const PROC_NAME_LEN: usize = 32;
/// Thread names are always written as a fixed 64-byte field.
pub const THREAD_NAME_LEN: usize = 64;
/// Upper bound for a dispatch queue label, including the terminator.
pub const QUEUE_LABEL_MAXSIZE: usize = 64;
/// Upper bound for a port label service name, including the terminator.
pub const PORTLABEL_NAME_MAXSIZE: usize = 128;

/// Identity reported when no port label is attached.
pub const PORTLABEL_ID_NONE: i16 = 0;
/// Identity reported when a label exists but could not be interned.
pub const PORTLABEL_ID_MISSING: i16 = -1;

impl KcStruct for u64 {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(*self);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        r.u64()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timebase {
    pub numer: u32,
    pub denom: u32,
}

impl KcStruct for Timebase {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.numer);
        w.u32(self.denom);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            numer: r.u32()?,
            denom: r.u32()?,
        })
    }
}

/// Global memory pressure counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemStats {
    pub snapshot_magic: u32,
    pub free_pages: u32,
    pub active_pages: u32,
    pub inactive_pages: u32,
    pub purgeable_pages: u32,
    pub wired_pages: u32,
    pub speculative_pages: u32,
    pub throttled_pages: u32,
    pub filebacked_pages: u32,
    pub compressions: u32,
    pub decompressions: u32,
    pub compressor_size: u32,
    pub busy_buffer_count: u32,
    pub pages_wanted: u32,
    pub pages_reclaimed: u32,
}

/// Magic stamped into every [`MemStats`] record.
pub const MEM_AND_IO_SNAPSHOT_MAGIC: u32 = 0x6d656d6f;

impl KcStruct for MemStats {
    const SIZE: usize = 60;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        for v in [
            self.snapshot_magic,
            self.free_pages,
            self.active_pages,
            self.inactive_pages,
            self.purgeable_pages,
            self.wired_pages,
            self.speculative_pages,
            self.throttled_pages,
            self.filebacked_pages,
            self.compressions,
            self.decompressions,
            self.compressor_size,
            self.busy_buffer_count,
            self.pages_wanted,
            self.pages_reclaimed,
        ] {
            w.u32(v);
        }
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            snapshot_magic: r.u32()?,
            free_pages: r.u32()?,
            active_pages: r.u32()?,
            inactive_pages: r.u32()?,
            purgeable_pages: r.u32()?,
            wired_pages: r.u32()?,
            speculative_pages: r.u32()?,
            throttled_pages: r.u32()?,
            filebacked_pages: r.u32()?,
            compressions: r.u32()?,
            decompressions: r.u32()?,
            compressor_size: r.u32()?,
            busy_buffer_count: r.u32()?,
            pages_wanted: r.u32()?,
            pages_reclaimed: r.u32()?,
        })
    }
}

/// One loaded image. The layout matches the in-memory image table, so load
/// info arrays can be copied straight from a task's address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadInfo64 {
    pub load_address: u64,
    pub uuid: [u8; 16],
}

impl KcStruct for LoadInfo64 {
    const SIZE: usize = 24;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.load_address);
        w.bytes(&self.uuid);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            load_address: r.u64()?,
            uuid: r.array()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedCacheLoadInfo {
    pub slide: u64,
    pub uuid: [u8; 16],
    pub slid_first_mapping: u64,
}

impl KcStruct for SharedCacheLoadInfo {
    const SIZE: usize = 32;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.slide);
        w.bytes(&self.uuid);
        w.u64(self.slid_first_mapping);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            slide: r.u64()?,
            uuid: r.array()?,
            slid_first_mapping: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskSnapshot {
    pub unique_pid: u64,
    pub ss_flags: u64,
    pub user_time_in_terminated_threads: u64,
    pub system_time_in_terminated_threads: u64,
    pub p_start_sec: u64,
    pub task_size: u64,
    pub max_resident_size: u64,
    pub suspend_count: u32,
    pub faults: u32,
    pub pageins: u32,
    pub cow_faults: u32,
    pub was_throttled: u32,
    pub did_throttle: u32,
    pub latency_qos: u32,
    pub pid: i32,
    pub p_comm: String,
}

impl KcStruct for TaskSnapshot {
    const SIZE: usize = 56 + 32 + PROC_NAME_LEN;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.unique_pid);
        w.u64(self.ss_flags);
        w.u64(self.user_time_in_terminated_threads);
        w.u64(self.system_time_in_terminated_threads);
        w.u64(self.p_start_sec);
        w.u64(self.task_size);
        w.u64(self.max_resident_size);
        w.u32(self.suspend_count);
        w.u32(self.faults);
        w.u32(self.pageins);
        w.u32(self.cow_faults);
        w.u32(self.was_throttled);
        w.u32(self.did_throttle);
        w.u32(self.latency_qos);
        w.i32(self.pid);
        w.fixed_str(&self.p_comm, PROC_NAME_LEN);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            unique_pid: r.u64()?,
            ss_flags: r.u64()?,
            user_time_in_terminated_threads: r.u64()?,
            system_time_in_terminated_threads: r.u64()?,
            p_start_sec: r.u64()?,
            task_size: r.u64()?,
            max_resident_size: r.u64()?,
            suspend_count: r.u32()?,
            faults: r.u32()?,
            pageins: r.u32()?,
            cow_faults: r.u32()?,
            was_throttled: r.u32()?,
            did_throttle: r.u32()?,
            latency_qos: r.u32()?,
            pid: r.i32()?,
            p_comm: r.fixed_str(PROC_NAME_LEN)?,
        })
    }
}

/// Snapshot of a task that is being torn down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TransitioningTaskSnapshot {
    pub unique_pid: u64,
    pub ss_flags: u64,
    pub transition_type: u64,
    pub pid: i32,
    pub p_comm: String,
}

/// Transition type for a task in teardown.
pub const TRANSITION_TERMINATED: u64 = 1;

impl KcStruct for TransitioningTaskSnapshot {
    const SIZE: usize = 28 + PROC_NAME_LEN;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.unique_pid);
        w.u64(self.ss_flags);
        w.u64(self.transition_type);
        w.i32(self.pid);
        w.fixed_str(&self.p_comm, PROC_NAME_LEN);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            unique_pid: r.u64()?,
            ss_flags: r.u64()?,
            transition_type: r.u64()?,
            pid: r.i32()?,
            p_comm: r.fixed_str(PROC_NAME_LEN)?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TaskDeltaSnapshot {
    pub unique_pid: u64,
    pub ss_flags: u64,
    pub user_time_in_terminated_threads: u64,
    pub system_time_in_terminated_threads: u64,
    pub task_size: u64,
    pub max_resident_size: u64,
    pub suspend_count: u32,
    pub faults: u32,
    pub pageins: u32,
    pub cow_faults: u32,
    pub was_throttled: u32,
    pub did_throttle: u32,
    pub latency_qos: u32,
}

impl KcStruct for TaskDeltaSnapshot {
    const SIZE: usize = 48 + 28;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.unique_pid);
        w.u64(self.ss_flags);
        w.u64(self.user_time_in_terminated_threads);
        w.u64(self.system_time_in_terminated_threads);
        w.u64(self.task_size);
        w.u64(self.max_resident_size);
        w.u32(self.suspend_count);
        w.u32(self.faults);
        w.u32(self.pageins);
        w.u32(self.cow_faults);
        w.u32(self.was_throttled);
        w.u32(self.did_throttle);
        w.u32(self.latency_qos);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            unique_pid: r.u64()?,
            ss_flags: r.u64()?,
            user_time_in_terminated_threads: r.u64()?,
            system_time_in_terminated_threads: r.u64()?,
            task_size: r.u64()?,
            max_resident_size: r.u64()?,
            suspend_count: r.u32()?,
            faults: r.u32()?,
            pageins: r.u32()?,
            cow_faults: r.u32()?,
            was_throttled: r.u32()?,
            did_throttle: r.u32()?,
            latency_qos: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuArchitecture {
    pub cputype: i32,
    pub cpusubtype: i32,
}

impl KcStruct for CpuArchitecture {
    const SIZE: usize = 8;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.i32(self.cputype);
        w.i32(self.cpusubtype);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            cputype: r.i32()?,
            cpusubtype: r.i32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IoStats {
    pub disk_reads_count: u64,
    pub disk_reads_size: u64,
    pub disk_writes_count: u64,
    pub disk_writes_size: u64,
    pub paging_count: u64,
    pub paging_size: u64,
    pub non_paging_count: u64,
    pub non_paging_size: u64,
    pub data_count: u64,
    pub data_size: u64,
    pub metadata_count: u64,
    pub metadata_size: u64,
}

impl KcStruct for IoStats {
    const SIZE: usize = 96;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        for v in [
            self.disk_reads_count,
            self.disk_reads_size,
            self.disk_writes_count,
            self.disk_writes_size,
            self.paging_count,
            self.paging_size,
            self.non_paging_count,
            self.non_paging_size,
            self.data_count,
            self.data_size,
            self.metadata_count,
            self.metadata_size,
        ] {
            w.u64(v);
        }
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            disk_reads_count: r.u64()?,
            disk_reads_size: r.u64()?,
            disk_writes_count: r.u64()?,
            disk_writes_size: r.u64()?,
            paging_count: r.u64()?,
            paging_size: r.u64()?,
            non_paging_count: r.u64()?,
            non_paging_size: r.u64()?,
            data_count: r.u64()?,
            data_size: r.u64()?,
            metadata_count: r.u64()?,
            metadata_size: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrsCycles {
    pub instructions: u64,
    pub cycles: u64,
}

impl KcStruct for InstrsCycles {
    const SIZE: usize = 16;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.instructions);
        w.u64(self.cycles);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            instructions: r.u64()?,
            cycles: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadSnapshot {
    pub thread_id: u64,
    pub wait_event: u64,
    pub continuation: u64,
    pub total_syscalls: u64,
    pub voucher_identifier: u64,
    pub dqserialnum: u64,
    pub user_time: u64,
    pub sys_time: u64,
    pub ss_flags: u64,
    pub last_run_time: u64,
    pub last_made_runnable_time: u64,
    pub state: u32,
    pub sched_flags: u32,
    pub base_priority: i16,
    pub sched_priority: i16,
    pub eqos: u8,
    pub rqos: u8,
    pub rqos_override: u8,
    pub io_tier: u8,
    pub thread_t: u64,
    pub requested_policy: u64,
    pub effective_policy: u64,
}

impl KcStruct for ThreadSnapshot {
    const SIZE: usize = 128;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.thread_id);
        w.u64(self.wait_event);
        w.u64(self.continuation);
        w.u64(self.total_syscalls);
        w.u64(self.voucher_identifier);
        w.u64(self.dqserialnum);
        w.u64(self.user_time);
        w.u64(self.sys_time);
        w.u64(self.ss_flags);
        w.u64(self.last_run_time);
        w.u64(self.last_made_runnable_time);
        w.u32(self.state);
        w.u32(self.sched_flags);
        w.i16(self.base_priority);
        w.i16(self.sched_priority);
        w.u8(self.eqos);
        w.u8(self.rqos);
        w.u8(self.rqos_override);
        w.u8(self.io_tier);
        w.u64(self.thread_t);
        w.u64(self.requested_policy);
        w.u64(self.effective_policy);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            thread_id: r.u64()?,
            wait_event: r.u64()?,
            continuation: r.u64()?,
            total_syscalls: r.u64()?,
            voucher_identifier: r.u64()?,
            dqserialnum: r.u64()?,
            user_time: r.u64()?,
            sys_time: r.u64()?,
            ss_flags: r.u64()?,
            last_run_time: r.u64()?,
            last_made_runnable_time: r.u64()?,
            state: r.u32()?,
            sched_flags: r.u32()?,
            base_priority: r.i16()?,
            sched_priority: r.i16()?,
            eqos: r.u8()?,
            rqos: r.u8()?,
            rqos_override: r.u8()?,
            io_tier: r.u8()?,
            thread_t: r.u64()?,
            requested_policy: r.u64()?,
            effective_policy: r.u64()?,
        })
    }
}

/// Minimal record for a thread that has not run since the delta baseline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ThreadDeltaSnapshot {
    pub thread_id: u64,
    pub voucher_identifier: u64,
    pub ss_flags: u64,
    pub last_made_runnable_time: u64,
    pub state: u32,
    pub sched_flags: u32,
    pub base_priority: i16,
    pub sched_priority: i16,
    pub eqos: u8,
    pub rqos: u8,
    pub rqos_override: u8,
    pub io_tier: u8,
    pub requested_policy: u64,
    pub effective_policy: u64,
}

impl KcStruct for ThreadDeltaSnapshot {
    const SIZE: usize = 64;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.thread_id);
        w.u64(self.voucher_identifier);
        w.u64(self.ss_flags);
        w.u64(self.last_made_runnable_time);
        w.u32(self.state);
        w.u32(self.sched_flags);
        w.i16(self.base_priority);
        w.i16(self.sched_priority);
        w.u8(self.eqos);
        w.u8(self.rqos);
        w.u8(self.rqos_override);
        w.u8(self.io_tier);
        w.u64(self.requested_policy);
        w.u64(self.effective_policy);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            thread_id: r.u64()?,
            voucher_identifier: r.u64()?,
            ss_flags: r.u64()?,
            last_made_runnable_time: r.u64()?,
            state: r.u32()?,
            sched_flags: r.u32()?,
            base_priority: r.i16()?,
            sched_priority: r.i16()?,
            eqos: r.u8()?,
            rqos: r.u8()?,
            rqos_override: r.u8()?,
            io_tier: r.u8()?,
            requested_policy: r.u64()?,
            effective_policy: r.u64()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CpuTimes {
    pub user_usec: u64,
    pub system_usec: u64,
    pub runnable_usec: u64,
}

impl KcStruct for CpuTimes {
    const SIZE: usize = 24;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.user_usec);
        w.u64(self.system_usec);
        w.u64(self.runnable_usec);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            user_usec: r.u64()?,
            system_usec: r.u64()?,
            runnable_usec: r.u64()?,
        })
    }
}

/// A blocking edge: `waiter` is blocked on something `owner` holds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WaitInfo {
    pub owner: u64,
    pub waiter: u64,
    pub context: u64,
    pub wait_type: u8,
    pub portlabel_id: i16,
    pub wait_flags: u32,
}

impl KcStruct for WaitInfo {
    const SIZE: usize = 31;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.owner);
        w.u64(self.waiter);
        w.u64(self.context);
        w.u8(self.wait_type);
        w.i16(self.portlabel_id);
        w.u32(self.wait_flags);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            owner: r.u64()?,
            waiter: r.u64()?,
            context: r.u64()?,
            wait_type: r.u8()?,
            portlabel_id: r.i16()?,
            wait_flags: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TurnstileInfo {
    pub waiter: u64,
    pub turnstile_context: u64,
    pub turnstile_priority: u8,
    pub number_of_hops: u8,
    pub turnstile_flags: u64,
    pub portlabel_id: i16,
}

impl KcStruct for TurnstileInfo {
    const SIZE: usize = 28;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.waiter);
        w.u64(self.turnstile_context);
        w.u8(self.turnstile_priority);
        w.u8(self.number_of_hops);
        w.u64(self.turnstile_flags);
        w.i16(self.portlabel_id);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            waiter: r.u64()?,
            turnstile_context: r.u64()?,
            turnstile_priority: r.u8()?,
            number_of_hops: r.u8()?,
            turnstile_flags: r.u64()?,
            portlabel_id: r.i16()?,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PortLabel {
    pub portlabel_id: i16,
    pub portlabel_flags: u16,
    pub portlabel_domain: u8,
}

impl KcStruct for PortLabel {
    const SIZE: usize = 5;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.i16(self.portlabel_id);
        w.u16(self.portlabel_flags);
        w.u8(self.portlabel_domain);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            portlabel_id: r.i16()?,
            portlabel_flags: r.u16()?,
            portlabel_domain: r.u8()?,
        })
    }
}

/// Thread group name is split across two 16-byte fields.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadGroupSnapshot {
    pub id: u64,
    pub name: String,
    pub flags: u64,
}

impl KcStruct for ThreadGroupSnapshot {
    const SIZE: usize = 48;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        let mut name = [0u8; 32];
        let bytes = self.name.as_bytes();
        let take = bytes.len().min(31);
        name[..take].copy_from_slice(&bytes[..take]);
        w.u64(self.id);
        w.bytes(&name[..16]);
        w.u64(self.flags);
        w.bytes(&name[16..]);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        let id = r.u64()?;
        let head: [u8; 16] = r.array()?;
        let flags = r.u64()?;
        let tail: [u8; 16] = r.array()?;
        let mut name = head.to_vec();
        name.extend_from_slice(&tail);
        Some(Self {
            id,
            name: c_string(&name),
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JetsamCoalitionSnapshot {
    pub id: u64,
    pub flags: u64,
    pub thread_group: u64,
    pub leader_task_uniqueid: u64,
}

impl KcStruct for JetsamCoalitionSnapshot {
    const SIZE: usize = 32;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.id);
        w.u64(self.flags);
        w.u64(self.thread_group);
        w.u64(self.leader_task_uniqueid);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            id: r.u64()?,
            flags: r.u64()?,
            thread_group: r.u64()?,
            leader_task_uniqueid: r.u64()?,
        })
    }
}

/// Fault handling summary for one capture.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FaultStatsRecord {
    pub pages_faulted_in: u32,
    pub time_spent_faulting: u64,
    pub system_max_fault_time: u64,
    pub stopped_faulting: u8,
}

impl KcStruct for FaultStatsRecord {
    const SIZE: usize = 21;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u32(self.pages_faulted_in);
        w.u64(self.time_spent_faulting);
        w.u64(self.system_max_fault_time);
        w.u8(self.stopped_faulting);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            pages_faulted_in: r.u32()?,
            time_spent_faulting: r.u64()?,
            system_max_fault_time: r.u64()?,
            stopped_faulting: r.u8()?,
        })
    }
}

/// Port label table statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InternStats {
    pub size: u32,
    pub count: u32,
    pub lookups: u32,
    pub found: u32,
    pub found_depth: u32,
    pub insert: u32,
    pub insert_depth: u32,
    pub bad: u32,
    pub bad_depth: u32,
    pub lookup_send: u32,
    pub lookup_receive: u32,
}

impl KcStruct for InternStats {
    const SIZE: usize = 44;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        for v in [
            self.size,
            self.count,
            self.lookups,
            self.found,
            self.found_depth,
            self.insert,
            self.insert_depth,
            self.bad,
            self.bad_depth,
            self.lookup_send,
            self.lookup_receive,
        ] {
            w.u32(v);
        }
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            size: r.u32()?,
            count: r.u32()?,
            lookups: r.u32()?,
            found: r.u32()?,
            found_depth: r.u32()?,
            insert: r.u32()?,
            insert_depth: r.u32()?,
            bad: r.u32()?,
            bad_depth: r.u32()?,
            lookup_send: r.u32()?,
            lookup_receive: r.u32()?,
        })
    }
}

/// Capture timing. `duration_outer` is filled in by the orchestrator after
/// the atomic section ends, when the buffer is still patchable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DurationRecord {
    pub duration: u64,
    pub duration_outer: u64,
    pub duration_prior: u64,
}

impl DurationRecord {
    /// Offset of `duration_outer` inside the payload.
    pub const OUTER_OFFSET: usize = 8;
}

impl KcStruct for DurationRecord {
    const SIZE: usize = 24;

    fn encode(&self, w: &mut FieldWriter<'_>) {
        w.u64(self.duration);
        w.u64(self.duration_outer);
        w.u64(self.duration_prior);
    }

    fn decode(r: &mut FieldReader<'_>) -> Option<Self> {
        Some(Self {
            duration: r.u64()?,
            duration_outer: r.u64()?,
            duration_prior: r.u64()?,
        })
    }
}

/// Wire shape of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shape {
    /// One item of type `kind` with `len` payload bytes.
    Single { kind: u32, len: usize },
    /// An array item of `count` elements of `elem_kind`.
    Array {
        elem_kind: u32,
        elem_size: usize,
        count: usize,
    },
}

impl Shape {
    pub fn payload_len(&self) -> usize {
        match *self {
            Shape::Single { len, .. } => len,
            Shape::Array {
                elem_size, count, ..
            } => elem_size * count,
        }
    }
}

/// Every record kind a capture can emit.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Record {
    Uint32Desc { name: String, value: u32 },
    Uint64Desc { name: String, value: u64 },
    MachAbsoluteTime(u64),
    UsecsSinceEpoch(u64),
    Timebase(Timebase),
    PageSize(u32),
    OsVersion(String),
    BootArgs(String),
    ThreadPolicyVersion(u32),
    JetsamLevel(u32),
    DeltaSinceTimestamp(u64),
    GlobalMemStats(MemStats),
    SharedCacheLayout(SharedCacheLoadInfo),
    ThreadGroups(Vec<ThreadGroupSnapshot>),
    JetsamCoalitions(Vec<JetsamCoalitionSnapshot>),
    SharedCacheLoadInfo(SharedCacheLoadInfo),
    LoadInfo(Vec<LoadInfo64>),
    TaskSnapshot(TaskSnapshot),
    TransitioningTaskSnapshot(TransitioningTaskSnapshot),
    TaskDeltaSnapshot(TaskDeltaSnapshot),
    CpuArchitecture(CpuArchitecture),
    IoStats(IoStats),
    InstrsCycles(InstrsCycles),
    JetsamCoalitionId(u64),
    PageTables(Vec<u64>),
    ThreadSnapshot(ThreadSnapshot),
    ThreadName(String),
    DispatchQueueLabel(String),
    CpuTimes(CpuTimes),
    UserStack(Vec<u64>),
    KernelStack(Vec<u64>),
    ThreadGroupId(u64),
    ThreadDeltaSnapshots(Vec<ThreadDeltaSnapshot>),
    WaitInfo(Vec<WaitInfo>),
    TurnstileInfo(Vec<TurnstileInfo>),
    PortLabelName(String),
    PortLabel(PortLabel),
    FaultStats(FaultStatsRecord),
    InternStats(InternStats),
    Duration(DurationRecord),
}

fn single(kind: u32, len: usize) -> Shape {
    Shape::Single { kind, len }
}

fn array<T: KcStruct>(elem_kind: u32, items: &[T]) -> Shape {
    Shape::Array {
        elem_kind,
        elem_size: T::SIZE,
        count: items.len(),
    }
}

fn encode_all<T: KcStruct>(items: &[T], out: &mut [u8]) {
    for (item, chunk) in items.iter().zip(out.chunks_mut(T::SIZE)) {
        item.encode_to(chunk);
    }
}

fn decode_all<T: KcStruct>(payload: &[u8], count: usize) -> Option<Vec<T>> {
    let mut out = Vec::with_capacity(count);
    for i in 0..count {
        let start = i * T::SIZE;
        out.push(T::decode_from(payload.get(start..start + T::SIZE)?)?);
    }
    Some(out)
}

fn str_len(s: &str, max: usize) -> usize {
    s.len().min(max - 1) + 1
}

impl Record {
    pub fn u32_desc(name: &str, value: u32) -> Self {
        Record::Uint32Desc {
            name: name.to_string(),
            value,
        }
    }

    pub fn u64_desc(name: &str, value: u64) -> Self {
        Record::Uint64Desc {
            name: name.to_string(),
            value,
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Record::Uint32Desc { .. } => single(TYPE_UINT32_DESC, DESC_NAME_LEN + 4),
            Record::Uint64Desc { .. } => single(TYPE_UINT64_DESC, DESC_NAME_LEN + 8),
            Record::MachAbsoluteTime(_) => single(TYPE_MACH_ABSOLUTE_TIME, 8),
            Record::UsecsSinceEpoch(_) => single(TYPE_USECS_SINCE_EPOCH, 8),
            Record::Timebase(_) => single(TYPE_TIMEBASE, Timebase::SIZE),
            Record::PageSize(_) => single(STACKSHOT_KERN_PAGE_SIZE, 4),
            Record::OsVersion(s) => single(STACKSHOT_OSVERSION, s.len() + 1),
            Record::BootArgs(s) => single(STACKSHOT_BOOTARGS, s.len() + 1),
            Record::ThreadPolicyVersion(_) => single(STACKSHOT_THREAD_POLICY_VERSION, 4),
            Record::JetsamLevel(_) => single(STACKSHOT_JETSAM_LEVEL, 4),
            Record::DeltaSinceTimestamp(_) => single(STACKSHOT_DELTA_SINCE_TIMESTAMP, 8),
            Record::GlobalMemStats(_) => single(STACKSHOT_GLOBAL_MEM_STATS, MemStats::SIZE),
            Record::SharedCacheLayout(_) => {
                single(STACKSHOT_SYS_SHAREDCACHE_LAYOUT, SharedCacheLoadInfo::SIZE)
            }
            Record::ThreadGroups(v) => array(STACKSHOT_THREAD_GROUP_SNAPSHOT, v),
            Record::JetsamCoalitions(v) => array(STACKSHOT_JETSAM_COALITION_SNAPSHOT, v),
            Record::SharedCacheLoadInfo(_) => {
                single(STACKSHOT_SHAREDCACHE_LOADINFO, SharedCacheLoadInfo::SIZE)
            }
            Record::LoadInfo(v) => array(TYPE_LIBRARY_LOADINFO64, v),
            Record::TaskSnapshot(_) => single(STACKSHOT_TASK_SNAPSHOT, TaskSnapshot::SIZE),
            Record::TransitioningTaskSnapshot(_) => single(
                STACKSHOT_TRANSITIONING_TASK_SNAPSHOT,
                TransitioningTaskSnapshot::SIZE,
            ),
            Record::TaskDeltaSnapshot(_) => {
                single(STACKSHOT_TASK_DELTA_SNAPSHOT, TaskDeltaSnapshot::SIZE)
            }
            Record::CpuArchitecture(_) => {
                single(STACKSHOT_TASK_CPU_ARCHITECTURE, CpuArchitecture::SIZE)
            }
            Record::IoStats(_) => single(STACKSHOT_IOSTATS, IoStats::SIZE),
            Record::InstrsCycles(_) => single(STACKSHOT_INSTRS_CYCLES, InstrsCycles::SIZE),
            Record::JetsamCoalitionId(_) => single(STACKSHOT_JETSAM_COALITION, 8),
            Record::PageTables(v) => array(STACKSHOT_PAGE_TABLES, v),
            Record::ThreadSnapshot(_) => single(STACKSHOT_THREAD_SNAPSHOT, ThreadSnapshot::SIZE),
            Record::ThreadName(_) => single(STACKSHOT_THREAD_NAME, THREAD_NAME_LEN),
            Record::DispatchQueueLabel(s) => single(
                STACKSHOT_THREAD_DISPATCH_QUEUE_LABEL,
                str_len(s, QUEUE_LABEL_MAXSIZE),
            ),
            Record::CpuTimes(_) => single(STACKSHOT_CPU_TIMES, CpuTimes::SIZE),
            Record::UserStack(v) => array(STACKSHOT_USER_STACKLR64, v),
            Record::KernelStack(v) => array(STACKSHOT_KERN_STACKLR64, v),
            Record::ThreadGroupId(_) => single(STACKSHOT_THREAD_GROUP, 8),
            Record::ThreadDeltaSnapshots(v) => array(STACKSHOT_THREAD_DELTA_SNAPSHOT, v),
            Record::WaitInfo(v) => array(STACKSHOT_THREAD_WAITINFO, v),
            Record::TurnstileInfo(v) => array(STACKSHOT_THREAD_TURNSTILEINFO, v),
            Record::PortLabelName(s) => single(
                STACKSHOT_PORTLABEL_NAME,
                str_len(s, PORTLABEL_NAME_MAXSIZE),
            ),
            Record::PortLabel(_) => single(STACKSHOT_PORTLABEL, PortLabel::SIZE),
            Record::FaultStats(_) => single(STACKSHOT_FAULT_STATS, FaultStatsRecord::SIZE),
            Record::InternStats(_) => single(STACKSHOT_PORTLABEL_STATS, InternStats::SIZE),
            Record::Duration(_) => single(STACKSHOT_DURATION, DurationRecord::SIZE),
        }
    }

    /// Encode the unpadded payload. `out` is zeroed and exactly
    /// `shape().payload_len()` bytes long.
    pub fn encode_payload(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        match self {
            Record::Uint32Desc { name, value } => {
                w.fixed_str(name, DESC_NAME_LEN);
                w.u32(*value);
            }
            Record::Uint64Desc { name, value } => {
                w.fixed_str(name, DESC_NAME_LEN);
                w.u64(*value);
            }
            Record::MachAbsoluteTime(v)
            | Record::UsecsSinceEpoch(v)
            | Record::DeltaSinceTimestamp(v)
            | Record::JetsamCoalitionId(v)
            | Record::ThreadGroupId(v) => w.u64(*v),
            Record::PageSize(v) | Record::ThreadPolicyVersion(v) | Record::JetsamLevel(v) => {
                w.u32(*v)
            }
            Record::OsVersion(s) | Record::BootArgs(s) => w.bytes(s.as_bytes()),
            Record::ThreadName(s) => w.fixed_str(s, THREAD_NAME_LEN),
            Record::DispatchQueueLabel(s) => {
                w.fixed_str(s, str_len(s, QUEUE_LABEL_MAXSIZE));
            }
            Record::PortLabelName(s) => {
                w.fixed_str(s, str_len(s, PORTLABEL_NAME_MAXSIZE));
            }
            Record::Timebase(v) => v.encode(&mut w),
            Record::GlobalMemStats(v) => v.encode(&mut w),
            Record::SharedCacheLayout(v) | Record::SharedCacheLoadInfo(v) => v.encode(&mut w),
            Record::TaskSnapshot(v) => v.encode(&mut w),
            Record::TransitioningTaskSnapshot(v) => v.encode(&mut w),
            Record::TaskDeltaSnapshot(v) => v.encode(&mut w),
            Record::CpuArchitecture(v) => v.encode(&mut w),
            Record::IoStats(v) => v.encode(&mut w),
            Record::InstrsCycles(v) => v.encode(&mut w),
            Record::ThreadSnapshot(v) => v.encode(&mut w),
            Record::CpuTimes(v) => v.encode(&mut w),
            Record::PortLabel(v) => v.encode(&mut w),
            Record::FaultStats(v) => v.encode(&mut w),
            Record::InternStats(v) => v.encode(&mut w),
            Record::Duration(v) => v.encode(&mut w),
            Record::ThreadGroups(v) => encode_all(v, out),
            Record::JetsamCoalitions(v) => encode_all(v, out),
            Record::LoadInfo(v) => encode_all(v, out),
            Record::PageTables(v) | Record::UserStack(v) | Record::KernelStack(v) => {
                encode_all(v, out)
            }
            Record::ThreadDeltaSnapshots(v) => encode_all(v, out),
            Record::WaitInfo(v) => encode_all(v, out),
            Record::TurnstileInfo(v) => encode_all(v, out),
        }
    }

    /// Decode a single (non-array) item. Returns `None` for unknown types.
    pub fn decode(kind: u32, payload: &[u8]) -> Option<Record> {
        let mut r = FieldReader::new(payload);
        let rec = match kind {
            TYPE_UINT32_DESC => Record::Uint32Desc {
                name: r.fixed_str(DESC_NAME_LEN)?,
                value: r.u32()?,
            },
            TYPE_UINT64_DESC => Record::Uint64Desc {
                name: r.fixed_str(DESC_NAME_LEN)?,
                value: r.u64()?,
            },
            TYPE_MACH_ABSOLUTE_TIME => Record::MachAbsoluteTime(r.u64()?),
            TYPE_USECS_SINCE_EPOCH => Record::UsecsSinceEpoch(r.u64()?),
            TYPE_TIMEBASE => Record::Timebase(Timebase::decode(&mut r)?),
            STACKSHOT_KERN_PAGE_SIZE => Record::PageSize(r.u32()?),
            STACKSHOT_OSVERSION => Record::OsVersion(c_string(payload)),
            STACKSHOT_BOOTARGS => Record::BootArgs(c_string(payload)),
            STACKSHOT_THREAD_POLICY_VERSION => Record::ThreadPolicyVersion(r.u32()?),
            STACKSHOT_JETSAM_LEVEL => Record::JetsamLevel(r.u32()?),
            STACKSHOT_DELTA_SINCE_TIMESTAMP => Record::DeltaSinceTimestamp(r.u64()?),
            STACKSHOT_GLOBAL_MEM_STATS => Record::GlobalMemStats(MemStats::decode(&mut r)?),
            STACKSHOT_SYS_SHAREDCACHE_LAYOUT => {
                Record::SharedCacheLayout(SharedCacheLoadInfo::decode(&mut r)?)
            }
            STACKSHOT_SHAREDCACHE_LOADINFO => {
                Record::SharedCacheLoadInfo(SharedCacheLoadInfo::decode(&mut r)?)
            }
            STACKSHOT_TASK_SNAPSHOT => Record::TaskSnapshot(TaskSnapshot::decode(&mut r)?),
            STACKSHOT_TRANSITIONING_TASK_SNAPSHOT => {
                Record::TransitioningTaskSnapshot(TransitioningTaskSnapshot::decode(&mut r)?)
            }
            STACKSHOT_TASK_DELTA_SNAPSHOT => {
                Record::TaskDeltaSnapshot(TaskDeltaSnapshot::decode(&mut r)?)
            }
            STACKSHOT_TASK_CPU_ARCHITECTURE => {
                Record::CpuArchitecture(CpuArchitecture::decode(&mut r)?)
            }
            STACKSHOT_IOSTATS => Record::IoStats(IoStats::decode(&mut r)?),
            STACKSHOT_INSTRS_CYCLES => Record::InstrsCycles(InstrsCycles::decode(&mut r)?),
            STACKSHOT_JETSAM_COALITION => Record::JetsamCoalitionId(r.u64()?),
            STACKSHOT_THREAD_SNAPSHOT => Record::ThreadSnapshot(ThreadSnapshot::decode(&mut r)?),
            STACKSHOT_THREAD_NAME => Record::ThreadName(c_string(payload)),
            STACKSHOT_THREAD_DISPATCH_QUEUE_LABEL => Record::DispatchQueueLabel(c_string(payload)),
            STACKSHOT_CPU_TIMES => Record::CpuTimes(CpuTimes::decode(&mut r)?),
            STACKSHOT_THREAD_GROUP => Record::ThreadGroupId(r.u64()?),
            STACKSHOT_PORTLABEL_NAME => Record::PortLabelName(c_string(payload)),
            STACKSHOT_PORTLABEL => Record::PortLabel(PortLabel::decode(&mut r)?),
            STACKSHOT_FAULT_STATS => Record::FaultStats(FaultStatsRecord::decode(&mut r)?),
            STACKSHOT_PORTLABEL_STATS => Record::InternStats(InternStats::decode(&mut r)?),
            STACKSHOT_DURATION => Record::Duration(DurationRecord::decode(&mut r)?),
            _ => return None,
        };
        Some(rec)
    }

    /// Decode an array item given its element type and count.
    pub fn decode_array(elem_kind: u32, count: usize, payload: &[u8]) -> Option<Record> {
        let rec = match elem_kind {
            STACKSHOT_THREAD_GROUP_SNAPSHOT => Record::ThreadGroups(decode_all(payload, count)?),
            STACKSHOT_JETSAM_COALITION_SNAPSHOT => {
                Record::JetsamCoalitions(decode_all(payload, count)?)
            }
            TYPE_LIBRARY_LOADINFO64 => Record::LoadInfo(decode_all(payload, count)?),
            STACKSHOT_PAGE_TABLES => Record::PageTables(decode_all(payload, count)?),
            STACKSHOT_USER_STACKLR64 => Record::UserStack(decode_all(payload, count)?),
            STACKSHOT_KERN_STACKLR64 => Record::KernelStack(decode_all(payload, count)?),
            STACKSHOT_THREAD_DELTA_SNAPSHOT => {
                Record::ThreadDeltaSnapshots(decode_all(payload, count)?)
            }
            STACKSHOT_THREAD_WAITINFO => Record::WaitInfo(decode_all(payload, count)?),
            STACKSHOT_THREAD_TURNSTILEINFO => Record::TurnstileInfo(decode_all(payload, count)?),
            _ => return None,
        };
        Some(rec)
    }
}
