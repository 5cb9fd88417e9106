//! The single-pass capture routine.
//!
//! A [`CaptureSession`] owns everything one attempt needs: the output
//! writer, the safe reader with its fault accounting, the port label table
//! and validated access to kernel objects. It walks every task and thread
//! exactly once and never yields. The caller is expected to run it with
//! interrupts masked (see [`crate::kernel::InterruptGuard`]).
//!
//! `BufferFull` propagates unchanged so the orchestrator can retry with a
//! larger buffer. Any other failure means the buffer cannot be trusted.

use std::collections::HashSet;

use crate::backtrace::{self, Backtrace};
use crate::config::Tunables;
use crate::error::CaptureError;
use crate::flags::{
    FaultResult, StackshotFlags, TaskSsFlags, ThreadSsFlags, PORTLABEL_READFAILED,
    PORTLABEL_THROTTLED, TURNSTILE_STATUS_RECEIVEPORT, TURNSTILE_STATUS_SENDPORT,
};
use crate::intern::{LookupKind, PortLabelTable};
use crate::kcdata::types::*;
use crate::kcdata::{Finalized, KcdataWriter, WriterOptions};
use crate::kernel::{
    BlockHint, ForeignMemory, FrameStart, Kernel, Kva, SharedRegion, SpaceId, TaskObject,
    ThreadObject, TH_SUSP, TH_WAIT,
};
use crate::memory::{CopyResult, FaultStats, SafeReader};
use crate::records::*;

/// Image info table header: version, count, array address.
const IMAGE_INFOS_HEADER_LEN: usize = 16;
const SYSTEM_STATE_64BIT: u64 = 0x1;

/// Per-attempt parameters derived from the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureOptions {
    pub flags: StackshotFlags,
    pub pid: i32,
    pub since: u64,
    pub pagetable_mask: u32,
    pub size_estimate: u64,
    pub slack_percent: u64,
    /// Time spent in earlier attempts of the same request.
    pub duration_prior: u64,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            flags: StackshotFlags::default(),
            pid: -1,
            since: 0,
            pagetable_mask: 0,
            size_estimate: 0,
            slack_percent: 0,
            duration_prior: 0,
        }
    }
}

/// A finished buffer.
#[derive(Debug, Clone)]
pub struct CaptureOutcome {
    pub bytes: Vec<u8>,
    pub sizes: Finalized,
    /// Capture time in absolute units.
    pub duration: u64,
    pub fault_stats: FaultStats,
    duration_offset: Option<usize>,
}

impl CaptureOutcome {
    /// Fill in the end-to-end time, when the duration record was written
    /// uncompressed.
    pub fn patch_duration_outer(&mut self, outer: u64) -> bool {
        let Some(off) = self.duration_offset else {
            return false;
        };
        let at = off + DurationRecord::OUTER_OFFSET;
        match self.bytes.get_mut(at..at + 8) {
            Some(dst) => {
                dst.copy_from_slice(&outer.to_le_bytes());
                true
            }
            None => false,
        }
    }
}

pub fn abs_to_usecs(abs: u64, tb: Timebase) -> u64 {
    if tb.denom == 0 {
        return abs / 1000;
    }
    (abs as u128 * tb.numer as u128 / tb.denom as u128 / 1000) as u64
}

pub fn usecs_to_abs(us: u64, tb: Timebase) -> u64 {
    if tb.numer == 0 {
        return us.saturating_mul(1000);
    }
    let abs = us as u128 * 1000 * tb.denom as u128 / tb.numer as u128;
    abs.min(u64::MAX as u128) as u64
}

/// Run one capture into a buffer of `capacity` bytes.
pub fn capture<K: Kernel + ?Sized>(
    kernel: &K,
    capacity: usize,
    opts: &CaptureOptions,
    tunables: &Tunables,
) -> Result<CaptureOutcome, CaptureError> {
    CaptureSession::new(kernel, capacity, opts, tunables)?.run()
}

pub struct CaptureSession<'k, 'o, K: Kernel + ?Sized> {
    kernel: &'k K,
    memory: ForeignMemory<'k, K>,
    reader: SafeReader<'k, K>,
    labels: PortLabelTable,
    writer: KcdataWriter,
    opts: &'o CaptureOptions,
    tunables: &'o Tunables,
    timebase: Timebase,
    on_core: HashSet<Kva>,
    start: u64,
}

impl<'k, 'o, K: Kernel + ?Sized> CaptureSession<'k, 'o, K> {
    pub fn new(
        kernel: &'k K,
        capacity: usize,
        opts: &'o CaptureOptions,
        tunables: &'o Tunables,
    ) -> Result<Self, CaptureError> {
        let start = kernel.absolute_time();
        let begin = if opts.flags.delta() {
            BUFFER_BEGIN_DELTA_STACKSHOT
        } else {
            BUFFER_BEGIN_STACKSHOT
        };
        let mut writer = KcdataWriter::new(
            capacity,
            begin,
            WriterOptions {
                compress: opts.flags.compress(),
                max_depth: tunables.max_container_depth,
            },
        )?;

        // The label table shares the buffer's budget; without room it is
        // simply disabled.
        let capacity = tunables.label_capacity();
        let labels = if capacity > 0
            && writer
                .reserve_tail(PortLabelTable::footprint(capacity))
                .is_ok()
        {
            PortLabelTable::new(capacity)
        } else {
            PortLabelTable::disabled()
        };

        let timebase = kernel.timebase();
        let on_core = kernel
            .processors()
            .iter()
            .filter_map(|p| p.active_thread)
            .collect();

        Ok(Self {
            kernel,
            memory: ForeignMemory::new(kernel),
            reader: SafeReader::new(kernel, usecs_to_abs(tunables.max_fault_time_us, timebase)),
            labels,
            writer,
            opts,
            tunables,
            timebase,
            on_core,
            start,
        })
    }

    fn flags(&self) -> StackshotFlags {
        self.opts.flags
    }

    fn in_container<T>(
        &mut self,
        kind: u32,
        id: u64,
        f: impl FnOnce(&mut Self) -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        self.writer.begin_container(kind, id)?;
        match f(self) {
            Ok(v) => {
                self.writer.end_container(kind, id)?;
                Ok(v)
            }
            Err(err) => {
                self.writer.abandon_container(kind, id);
                Err(err)
            }
        }
    }

    fn in_window<T>(
        &mut self,
        f: impl FnOnce(&mut Self) -> Result<T, CaptureError>,
    ) -> Result<T, CaptureError> {
        self.writer.open_compression_window()?;
        match f(self) {
            Ok(v) => {
                self.writer.close_compression_window()?;
                Ok(v)
            }
            Err(err) => {
                self.writer.abandon_window();
                Err(err)
            }
        }
    }

    fn push(&mut self, rec: Record) -> Result<(), CaptureError> {
        Ok(self.writer.push(&rec)?)
    }

    pub fn run(mut self) -> Result<CaptureOutcome, CaptureError> {
        self.prologue()?;
        self.global_aggregates()?;

        for kva in self.kernel.tasks() {
            self.task(kva, false)?;
        }
        for kva in self.kernel.terminated_tasks() {
            self.task(kva, true)?;
        }

        self.epilogue()
    }

    fn prologue(&mut self) -> Result<(), CaptureError> {
        let flags = self.flags();
        let k = self.kernel;
        self.push(Record::u64_desc("stackshot_in_flags", flags.bits()))?;
        self.push(Record::u32_desc("stackshot_in_pid", self.opts.pid as u32))?;
        self.push(Record::u64_desc("system_state_flags", SYSTEM_STATE_64BIT))?;
        if flags.page_tables() {
            self.push(Record::u32_desc(
                "stackshot_pagetable_mask",
                self.opts.pagetable_mask,
            ))?;
        }
        self.push(Record::u64_desc(
            "stackshot_size_estimate",
            self.opts.size_estimate,
        ))?;
        self.push(Record::u32_desc(
            "stackshot_size_estimate_adj",
            self.opts.slack_percent as u32,
        ))?;
        self.push(Record::JetsamLevel(k.jetsam_level()))?;

        if flags.delta() {
            self.push(Record::DeltaSinceTimestamp(self.opts.since))?;
            self.push(Record::MachAbsoluteTime(k.absolute_time()))?;
            return Ok(());
        }

        self.push(Record::ThreadPolicyVersion(THREAD_POLICY_VERSION))?;
        self.push(Record::PageSize(k.page_size() as u32))?;
        self.push(Record::OsVersion(k.os_version()))?;
        self.push(Record::BootArgs(k.boot_args()))?;
        self.push(Record::Timebase(self.timebase))?;
        self.push(Record::MachAbsoluteTime(k.absolute_time()))?;
        self.push(Record::UsecsSinceEpoch(k.calendar_micros()))?;
        if flags.shared_cache_layout() {
            if let Some(layout) = k.shared_cache_layout() {
                self.push(Record::SharedCacheLayout(layout))?;
            }
        }
        Ok(())
    }

    fn global_aggregates(&mut self) -> Result<(), CaptureError> {
        let flags = self.flags();
        let k = self.kernel;
        if flags.global_mem_stats() {
            self.push(Record::GlobalMemStats(k.memory_stats()))?;
        }
        if flags.thread_groups() {
            if let Some(groups) = k.thread_groups() {
                self.in_window(|s| s.push(Record::ThreadGroups(groups)))?;
            }
        }
        if flags.jetsam_coalitions() {
            if let Some(coalitions) = k.coalitions() {
                self.in_window(|s| s.push(Record::JetsamCoalitions(coalitions)))?;
            }
        }
        Ok(())
    }

    fn task(&mut self, kva: Kva, terminated: bool) -> Result<(), CaptureError> {
        let task = self.memory.task(kva)?;
        if task.pid == -1 {
            return Ok(());
        }
        let transitioning = terminated || task.transitioning;
        if !transitioning && (!task.active || task.corpse) && task.threads.is_empty() {
            return Ok(());
        }
        if self.opts.pid != -1 && task.pid != self.opts.pid {
            return Ok(());
        }

        let delta = self.flags().delta();
        let since = self.opts.since;
        let mut full_threads = Vec::new();
        let mut delta_threads = Vec::new();
        for &th_kva in &task.threads {
            let thread = self.memory.thread(th_kva)?;
            if self.flags().active_kernel_threads_only() && !thread.has_kernel_stack() {
                continue;
            }
            let on_core = self.on_core.contains(&th_kva);
            if !delta || on_core || thread.last_run > since {
                full_threads.push((th_kva, thread));
            } else {
                delta_threads.push((th_kva, thread));
            }
        }
        let full_task = transitioning
            || !delta
            || task.start_abstime == 0
            || task.start_abstime > since
            || !full_threads.is_empty();

        let kind = if transitioning {
            STACKSHOT_CONTAINER_TRANSITIONING_TASK
        } else {
            STACKSHOT_CONTAINER_TASK
        };
        self.in_container(kind, task.unique_pid, |s| {
            if full_task {
                s.full_task(task, transitioning, terminated)?;
            } else {
                s.delta_task(task)?;
            }

            for &(th_kva, thread) in &full_threads {
                s.in_container(STACKSHOT_CONTAINER_THREAD, thread.tid, |s| {
                    s.full_thread(task, th_kva, thread)
                })?;
            }
            if !delta_threads.is_empty() {
                let mut slot = s.writer.array_slot::<ThreadDeltaSnapshot>(
                    STACKSHOT_THREAD_DELTA_SNAPSHOT,
                    delta_threads.len(),
                )?;
                for (i, &(th_kva, thread)) in delta_threads.iter().enumerate() {
                    let flags = base_thread_flags(thread, s.on_core.contains(&th_kva));
                    slot.set(i, &thread_delta(thread, flags));
                }
            }

            let blocked: Vec<&ThreadObject> = full_threads
                .iter()
                .chain(delta_threads.iter())
                .map(|&(_, thread)| thread)
                .collect();
            s.blocking_edges(&blocked)
        })
    }

    fn task_flags(&self, task: &TaskObject, terminated: bool) -> TaskSsFlags {
        let mut ss = TaskSsFlags::default();
        ss.set_user64(task.user64);
        ss.set_terminated(terminated);
        ss.set_pid_suspended(task.suspended);
        ss.set_frozen(task.frozen);
        ss.set_darwin_bg(task.darwin_bg);
        ss.set_foreground(task.foreground);
        ss.set_boosted(task.boosted);
        ss.set_suppressed(task.suppressed);
        ss.set_dirty(task.dirty);
        ss
    }

    fn full_task(
        &mut self,
        task: &'k TaskObject,
        transitioning: bool,
        terminated: bool,
    ) -> Result<(), CaptureError> {
        let flags = self.flags();
        let mut ss = self.task_flags(task, terminated);

        if flags.save_loadinfo() && !task.is_kernel {
            match task.shared_region {
                SharedRegion::System => ss.set_shared_region_system(true),
                SharedRegion::Other => ss.set_shared_region_other(true),
                SharedRegion::None => ss.set_shared_region_none(true),
                SharedRegion::Unavailable => ss.set_shared_region_unavailable(true),
            }
            let mapped = matches!(task.shared_region, SharedRegion::System | SharedRegion::Other);
            if let (true, Some(cache)) = (mapped, task.shared_cache) {
                self.push(Record::SharedCacheLoadInfo(cache.into()))?;
            }
        }
        self.load_info(task, &mut ss)?;

        if transitioning {
            let snap = TransitioningTaskSnapshot {
                unique_pid: task.unique_pid,
                ss_flags: ss.bits(),
                transition_type: TRANSITION_TERMINATED,
                pid: task.pid,
                p_comm: task.name.clone(),
            };
            self.in_window(|s| s.push(Record::TransitioningTaskSnapshot(snap)))?;
        } else {
            let snap = TaskSnapshot {
                unique_pid: task.unique_pid,
                ss_flags: ss.bits(),
                user_time_in_terminated_threads: task.terminated_user_time,
                system_time_in_terminated_threads: task.terminated_system_time,
                p_start_sec: task.proc_start_sec,
                task_size: task.phys_footprint,
                max_resident_size: task.max_resident,
                suspend_count: task.suspend_count,
                faults: task.faults,
                pageins: task.pageins,
                cow_faults: task.cow_faults,
                was_throttled: task.was_throttled,
                did_throttle: task.did_throttle,
                latency_qos: task.latency_qos,
                pid: task.pid,
                p_comm: task.name.clone(),
            };
            self.in_window(|s| s.push(Record::TaskSnapshot(snap)))?;
        }

        if flags.jetsam_coalitions() {
            if let Some(id) = task.jetsam_coalition {
                self.push(Record::JetsamCoalitionId(id))?;
            }
        }
        if flags.page_tables() {
            let k = self.kernel;
            let mask = self.opts.pagetable_mask;
            self.in_window(|s| match k.page_table_entries(task.space, mask) {
                Some(entries) if !entries.is_empty() => s.push(Record::PageTables(entries)),
                _ => Ok(()),
            })?;
        }
        if flags.io_stats() && !flags.delta() {
            if let Some(io) = task.io {
                self.push(Record::IoStats(io))?;
            }
        }
        if flags.instrs_cycles() {
            if let Some(counters) = task.counters {
                self.push(Record::InstrsCycles(counters))?;
            }
        }
        self.push(Record::CpuArchitecture(CpuArchitecture {
            cputype: task.cputype,
            cpusubtype: task.cpusubtype,
        }))
    }

    fn delta_task(&mut self, task: &'k TaskObject) -> Result<(), CaptureError> {
        let ss = self.task_flags(task, false);
        self.push(Record::TaskDeltaSnapshot(TaskDeltaSnapshot {
            unique_pid: task.unique_pid,
            ss_flags: ss.bits(),
            user_time_in_terminated_threads: task.terminated_user_time,
            system_time_in_terminated_threads: task.terminated_system_time,
            task_size: task.phys_footprint,
            max_resident_size: task.max_resident,
            suspend_count: task.suspend_count,
            faults: task.faults,
            pageins: task.pageins,
            cow_faults: task.cow_faults,
            was_throttled: task.was_throttled,
            did_throttle: task.did_throttle,
            latency_qos: task.latency_qos,
        }))?;
        if self.flags().instrs_cycles() {
            if let Some(counters) = task.counters {
                self.push(Record::InstrsCycles(counters))?;
            }
        }
        Ok(())
    }

    /// Copy the task's image list straight into an array item.
    fn load_info(&mut self, task: &TaskObject, ss: &mut TaskSsFlags) -> Result<(), CaptureError> {
        let flags = self.flags();
        if task.is_kernel {
            if flags.save_kext_loadinfo() {
                let images = self.kernel.kernel_images();
                if !images.is_empty() {
                    self.in_window(|s| s.push(Record::LoadInfo(images)))?;
                }
            }
            return Ok(());
        }
        if !flags.save_loadinfo() || !task.active || task.image_infos_addr == 0 {
            return Ok(());
        }

        let allow_fault = flags.fault_uuids();
        let mut fault = FaultResult::default();
        let mut header = [0u8; IMAGE_INFOS_HEADER_LEN];
        let header_read = self.reader.copy(
            task.space,
            task.image_infos_addr,
            &mut header,
            allow_fault,
            &mut fault,
        );
        if header_read.is_complete() {
            let count = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&header[8..16]);
            let array = u64::from_le_bytes(raw);
            let count = count.min(self.tunables.max_loadinfos);
            if count > 0 && array != 0 {
                let mut slot = self
                    .writer
                    .array_slot::<LoadInfo64>(TYPE_LIBRARY_LOADINFO64, count)?;
                let dst = slot.bytes_mut();
                match self.reader.copy(task.space, array, dst, allow_fault, &mut fault) {
                    CopyResult::Complete => {}
                    // Partial image lists are reported as missing.
                    CopyResult::Partial(_) | CopyResult::Failed => {
                        dst.fill(0);
                        ss.set_uuid_missing(true);
                    }
                }
            }
        } else {
            ss.set_uuid_missing(true);
        }
        if fault.faulted_in() {
            ss.set_uuid_faulted_in(true);
        }
        if fault.tried_fault() {
            ss.set_uuid_tried_fault(true);
        }
        Ok(())
    }

    fn full_thread(
        &mut self,
        task: &'k TaskObject,
        kva: Kva,
        thread: &'k ThreadObject,
    ) -> Result<(), CaptureError> {
        let flags = self.flags();
        let mut ss = base_thread_flags(thread, self.on_core.contains(&kva));

        let mut dqserialnum = 0;
        let mut queue_label = None;
        if flags.get_dispatch_queue()
            && !task.is_kernel
            && task.active
            && task.has_pmap
            && thread.dispatch_qaddr != 0
        {
            let mut fault = FaultResult::default();
            let space = task.space;
            let dq = self
                .reader
                .read_u64(space, thread.dispatch_qaddr, false, &mut fault)
                .unwrap_or(0);
            if dq != 0 {
                if let Some(serial) = self.reader.read_u64(
                    space,
                    dq.wrapping_add(task.dq_serialno_offset),
                    false,
                    &mut fault,
                ) {
                    dqserialnum = serial;
                    ss.set_has_dispatch_serial(true);
                }
                let label_addr = self
                    .reader
                    .read_u64(space, dq.wrapping_add(task.dq_label_offset), false, &mut fault)
                    .unwrap_or(0);
                queue_label = self
                    .reader
                    .read_cstring(space, label_addr, QUEUE_LABEL_MAXSIZE, false, &mut fault)
                    .map(|s| s.text)
                    .filter(|s| !s.is_empty());
            }
        }

        let mut user_stack = None;
        if !flags.active_kernel_threads_only() && task.active && !task.is_kernel {
            if let Some(start) = thread.user_frame {
                let bt = self.walk(task.space, start, flags.fault_backtraces())?;
                if task.user64 {
                    ss.set_user64(true);
                }
                if bt.truncated {
                    ss.set_truncated_bt(true);
                    ss.set_trunc_user_bt(true);
                }
                if bt.fault.faulted_in() {
                    ss.set_faulted_bt(true);
                }
                if bt.fault.tried_fault() {
                    ss.set_tried_fault_bt(true);
                }
                user_stack = Some(bt.frames);
            }
        }

        let mut kernel_stack = None;
        if let Some(start) = thread.kernel_frame {
            let bt = self.walk(SpaceId::KERNEL, start, false)?;
            ss.set_kernel64(true);
            if bt.truncated {
                ss.set_truncated_bt(true);
                ss.set_trunc_kern_bt(true);
            }
            kernel_stack = Some(bt.frames);
        }

        let (user_time, sys_time) = if thread.precise_user_kernel_time {
            (thread.user_time, thread.system_time)
        } else {
            (thread.user_time + thread.system_time, 0)
        };

        let snap = ThreadSnapshot {
            thread_id: thread.tid,
            wait_event: thread.wait_event,
            continuation: thread.continuation,
            total_syscalls: thread.total_syscalls,
            voucher_identifier: thread.voucher_id,
            dqserialnum,
            user_time,
            sys_time,
            ss_flags: ss.bits(),
            last_run_time: thread.last_run,
            last_made_runnable_time: thread.last_made_runnable,
            state: thread.state,
            sched_flags: thread.sched_flags,
            base_priority: thread.base_priority,
            sched_priority: thread.sched_priority,
            eqos: thread.eqos,
            rqos: thread.rqos,
            rqos_override: thread.rqos_override,
            io_tier: thread.io_tier,
            thread_t: kva,
            requested_policy: thread.requested_policy,
            effective_policy: thread.effective_policy,
        };
        let tb = self.timebase;
        let times = CpuTimes {
            user_usec: abs_to_usecs(user_time, tb),
            system_usec: abs_to_usecs(sys_time, tb),
            runnable_usec: abs_to_usecs(thread.runnable_time, tb),
        };

        self.in_window(|s| {
            s.push(Record::ThreadSnapshot(snap))?;
            if !thread.name.is_empty() {
                s.push(Record::ThreadName(thread.name.clone()))?;
            }
            if let Some(label) = queue_label {
                s.push(Record::DispatchQueueLabel(label))?;
            }
            s.push(Record::CpuTimes(times))?;
            if let Some(frames) = user_stack {
                s.push(Record::UserStack(frames))?;
            }
            if let Some(frames) = kernel_stack {
                s.push(Record::KernelStack(frames))?;
            }
            if flags.thread_groups() {
                if let Some(group) = thread.thread_group {
                    s.push(Record::ThreadGroupId(group))?;
                }
            }
            if flags.io_stats() && !flags.delta() {
                if let Some(io) = thread.io {
                    s.push(Record::IoStats(io))?;
                }
            }
            if flags.instrs_cycles() {
                if let Some(counters) = thread.counters {
                    s.push(Record::InstrsCycles(counters))?;
                }
            }
            Ok(())
        })
    }

    /// Walk one stack with a frame budget bounded by the space left.
    fn walk(
        &mut self,
        space: SpaceId,
        start: FrameStart,
        allow_fault: bool,
    ) -> Result<Backtrace, CaptureError> {
        let budget = self.tunables.max_frames.min(self.writer.remaining() / 8);
        if budget == 0 {
            return Err(CaptureError::BufferFull);
        }
        Ok(backtrace::walk(
            &mut self.reader,
            space,
            start,
            budget,
            allow_fault,
        ))
    }

    /// Record who each blocked thread is waiting on, then the labels of any
    /// ports involved.
    fn blocking_edges(&mut self, blocked: &[&ThreadObject]) -> Result<(), CaptureError> {
        let waiters: Vec<&ThreadObject> =
            blocked.iter().copied().filter(|t| t.has_waitinfo()).collect();
        let turnstiles: Vec<&ThreadObject> = blocked
            .iter()
            .copied()
            .filter(|t| t.has_turnstileinfo())
            .collect();
        if waiters.is_empty() && turnstiles.is_empty() {
            return Ok(());
        }

        self.labels.advance_generation();
        self.in_window(|s| {
            if !waiters.is_empty() {
                let mut slot = s
                    .writer
                    .array_slot::<WaitInfo>(STACKSHOT_THREAD_WAITINFO, waiters.len())?;
                for (i, thread) in waiters.iter().enumerate() {
                    slot.set(i, &wait_info(&s.memory, &mut s.labels, thread));
                }
            }
            if !turnstiles.is_empty() {
                let mut slot = s.writer.array_slot::<TurnstileInfo>(
                    STACKSHOT_THREAD_TURNSTILEINFO,
                    turnstiles.len(),
                )?;
                for (i, thread) in turnstiles.iter().enumerate() {
                    slot.set(i, &turnstile_info(&s.memory, &mut s.labels, thread));
                }
            }
            Ok(())
        })?;
        self.flush_labels()
    }

    /// Emit a label container for every id touched in this generation.
    fn flush_labels(&mut self) -> Result<(), CaptureError> {
        for (id, ident) in self.labels.touched() {
            let mut label = PortLabel {
                portlabel_id: id,
                ..Default::default()
            };
            let mut name = None;
            if let Some(obj) = self.memory.port_label(ident) {
                label.portlabel_domain = obj.domain;
                if obj.throttled {
                    label.portlabel_flags |= PORTLABEL_THROTTLED;
                }
                let mut fault = FaultResult::default();
                name = self
                    .reader
                    .read_cstring(
                        SpaceId::KERNEL,
                        obj.name_addr,
                        PORTLABEL_NAME_MAXSIZE,
                        false,
                        &mut fault,
                    )
                    .map(|s| s.text)
                    .filter(|s| !s.is_empty());
            }
            if name.is_none() {
                label.portlabel_flags |= PORTLABEL_READFAILED;
            }
            self.in_container(STACKSHOT_CONTAINER_PORTLABEL, id as u64, |s| {
                if let Some(name) = name {
                    s.push(Record::PortLabelName(name))?;
                }
                s.push(Record::PortLabel(label))
            })?;
        }
        Ok(())
    }

    fn epilogue(mut self) -> Result<CaptureOutcome, CaptureError> {
        let flags = self.flags();
        if self.tunables.emit_intern_stats {
            self.push(Record::InternStats(self.labels.stats()))?;
        }
        let fault_stats = self.reader.stats();
        if flags.fault_backtraces() || flags.fault_uuids() {
            self.push(Record::FaultStats(fault_stats.record()))?;
        }

        let duration = self.kernel.absolute_time().saturating_sub(self.start);
        let duration_offset = self.writer.push_patchable(&Record::Duration(DurationRecord {
            duration,
            duration_outer: 0,
            duration_prior: self.opts.duration_prior,
        }))?;

        self.writer.finish_compression()?;
        self.push(Record::u64_desc("stackshot_out_flags", flags.bits()))?;
        let sizes = self.writer.finalize()?;

        Ok(CaptureOutcome {
            bytes: self.writer.into_bytes(),
            sizes,
            duration,
            fault_stats,
            duration_offset,
        })
    }
}

/// Flags that are known without reading any foreign memory.
fn base_thread_flags(thread: &ThreadObject, on_core: bool) -> ThreadSsFlags {
    let mut ss = ThreadSsFlags::default();
    ss.set_main_thread(thread.main_thread);
    ss.set_darwin_bg(thread.darwin_bg);
    ss.set_io_passive(thread.io_passive);
    ss.set_suspended(thread.state & TH_SUSP != 0);
    ss.set_global_forced_idle(thread.global_forced_idle);
    ss.set_on_core(on_core);
    ss.set_idle_worker(
        thread.state & TH_WAIT != 0 && thread.block_hint == BlockHint::ParkedWorkQueue,
    );
    ss
}

fn thread_delta(thread: &ThreadObject, ss: ThreadSsFlags) -> ThreadDeltaSnapshot {
    ThreadDeltaSnapshot {
        thread_id: thread.tid,
        voucher_identifier: thread.voucher_id,
        ss_flags: ss.bits(),
        last_made_runnable_time: thread.last_made_runnable,
        state: thread.state,
        sched_flags: thread.sched_flags,
        base_priority: thread.base_priority,
        sched_priority: thread.sched_priority,
        eqos: thread.eqos,
        rqos: thread.rqos,
        rqos_override: thread.rqos_override,
        io_tier: thread.io_tier,
        requested_policy: thread.requested_policy,
        effective_policy: thread.effective_policy,
    }
}

/// Label identity behind a port, 0 if there is none or it cannot be read.
fn port_label_ident<K: Kernel + ?Sized>(memory: &ForeignMemory<'_, K>, port: Option<Kva>) -> u64 {
    port.and_then(|p| memory.port(p))
        .and_then(|p| p.label)
        .unwrap_or(0)
}

fn wait_info<K: Kernel + ?Sized>(
    memory: &ForeignMemory<'_, K>,
    labels: &mut PortLabelTable,
    thread: &ThreadObject,
) -> WaitInfo {
    let target = thread.wait.unwrap_or_default();
    let kind = match thread.block_hint {
        BlockHint::PortReceive | BlockHint::PortSetReceive => Some(LookupKind::Receive),
        BlockHint::PortSend | BlockHint::PortSendInTransit => Some(LookupKind::Send),
        _ => None,
    };
    let portlabel_id = match kind {
        Some(kind) => labels.lookup(port_label_ident(memory, target.port), kind),
        None => PORTLABEL_ID_NONE,
    };
    WaitInfo {
        owner: target.owner,
        waiter: thread.tid,
        context: target.context,
        wait_type: thread.block_hint.wait_type(),
        portlabel_id,
        wait_flags: target.wait_flags,
    }
}

fn turnstile_info<K: Kernel + ?Sized>(
    memory: &ForeignMemory<'_, K>,
    labels: &mut PortLabelTable,
    thread: &ThreadObject,
) -> TurnstileInfo {
    let ts = thread.turnstile.unwrap_or_default();
    let kind = if ts.flags & TURNSTILE_STATUS_SENDPORT != 0 {
        Some(LookupKind::Send)
    } else if ts.flags & TURNSTILE_STATUS_RECEIVEPORT != 0 {
        Some(LookupKind::Receive)
    } else {
        None
    };
    let portlabel_id = match kind {
        Some(kind) => labels.lookup(port_label_ident(memory, ts.port), kind),
        None => PORTLABEL_ID_NONE,
    };
    TurnstileInfo {
        waiter: thread.tid,
        turnstile_context: ts.context,
        turnstile_priority: ts.priority,
        number_of_hops: ts.hops,
        turnstile_flags: ts.flags,
        portlabel_id,
    }
}
