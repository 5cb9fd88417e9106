//! Bit-level flag words used on the wire and in requests.

use bitfield::bitfield;

bitfield! {
    /// Request flags accepted by [`crate::service::StackshotService::stack_snapshot`].
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct StackshotFlags(u64);
    impl Debug;
    /// Record dispatch queue serial numbers and labels for each thread.
    pub get_dispatch_queue, set_get_dispatch_queue: 1;
    /// Record UUID/load info for user tasks.
    pub save_loadinfo, set_save_loadinfo: 3;
    pub global_mem_stats, set_global_mem_stats: 4;
    /// Record kernel and kext UUIDs for the kernel task.
    pub save_kext_loadinfo, set_save_kext_loadinfo: 5;
    /// Skip threads with no kernel stack.
    pub active_kernel_threads_only, set_active_kernel_threads_only: 8;
    pub compress, set_compress: 10;
    pub save_in_kernel_buffer, set_save_in_kernel_buffer: 14;
    pub retrieve_existing_buffer, set_retrieve_existing_buffer: 15;
    pub fault_backtraces, set_fault_backtraces: 17;
    pub delta, set_delta: 18;
    pub shared_cache_layout, set_shared_cache_layout: 19;
    pub trylock, set_trylock: 20;
    pub fault_uuids, set_fault_uuids: 21;
    pub io_stats, set_io_stats: 23;
    pub thread_groups, set_thread_groups: 25;
    pub jetsam_coalitions, set_jetsam_coalitions: 26;
    pub instrs_cycles, set_instrs_cycles: 27;
    pub page_tables, set_page_tables: 29;
}

impl StackshotFlags {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }
}

bitfield! {
    /// Per-task state bits carried in task snapshot records.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct TaskSsFlags(u64);
    impl Debug;
    pub user64, set_user64: 0;
    pub terminated, set_terminated: 3;
    pub pid_suspended, set_pid_suspended: 4;
    pub frozen, set_frozen: 5;
    pub darwin_bg, set_darwin_bg: 6;
    pub foreground, set_foreground: 10;
    pub boosted, set_boosted: 11;
    pub suppressed, set_suppressed: 12;
    pub dirty, set_dirty: 16;
    pub uuid_faulted_in, set_uuid_faulted_in: 20;
    pub uuid_missing, set_uuid_missing: 21;
    pub uuid_tried_fault, set_uuid_tried_fault: 22;
    pub shared_region_unavailable, set_shared_region_unavailable: 23;
    pub shared_region_none, set_shared_region_none: 29;
    pub shared_region_system, set_shared_region_system: 30;
    pub shared_region_other, set_shared_region_other: 31;
}

impl TaskSsFlags {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn merge(&mut self, other: TaskSsFlags) {
        self.0 |= other.0;
    }
}

bitfield! {
    /// Per-thread state bits carried in thread snapshot records.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct ThreadSsFlags(u64);
    impl Debug;
    pub user64, set_user64: 0;
    pub kernel64, set_kernel64: 1;
    pub has_dispatch_serial, set_has_dispatch_serial: 2;
    pub darwin_bg, set_darwin_bg: 4;
    pub io_passive, set_io_passive: 5;
    pub suspended, set_suspended: 6;
    pub truncated_bt, set_truncated_bt: 7;
    pub global_forced_idle, set_global_forced_idle: 8;
    pub faulted_bt, set_faulted_bt: 9;
    pub tried_fault_bt, set_tried_fault_bt: 10;
    pub on_core, set_on_core: 11;
    pub idle_worker, set_idle_worker: 12;
    pub main_thread, set_main_thread: 13;
    pub trunc_kern_bt, set_trunc_kern_bt: 14;
    pub trunc_user_bt, set_trunc_user_bt: 15;
}

impl ThreadSsFlags {
    pub fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u64 {
        self.0
    }

    pub fn merge(&mut self, other: ThreadSsFlags) {
        self.0 |= other.0;
    }
}

bitfield! {
    /// Outcome of a physical lookup, accumulated across reads.
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct FaultResult(u32);
    impl Debug;
    pub paged_out, set_paged_out: 0;
    pub tried_fault, set_tried_fault: 1;
    pub faulted_in, set_faulted_in: 2;
}

impl FaultResult {
    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn merge(&mut self, other: FaultResult) {
        self.0 |= other.0;
    }
}

/// Port label could not be read.
pub const PORTLABEL_READFAILED: u16 = 0x1;
/// Port label service is throttled.
pub const PORTLABEL_THROTTLED: u16 = 0x2;

pub const TURNSTILE_STATUS_UNKNOWN: u64 = 0x01;
pub const TURNSTILE_STATUS_LOCKED_WAITQ: u64 = 0x02;
pub const TURNSTILE_STATUS_WORKQUEUE: u64 = 0x04;
pub const TURNSTILE_STATUS_THREAD: u64 = 0x08;
pub const TURNSTILE_STATUS_BLOCKED_ON_TASK: u64 = 0x10;
pub const TURNSTILE_STATUS_HELD_IPLOCK: u64 = 0x20;
pub const TURNSTILE_STATUS_SENDPORT: u64 = 0x40;
pub const TURNSTILE_STATUS_RECEIVEPORT: u64 = 0x80;

pub const THREAD_GROUP_EFFICIENT: u64 = 0x1;
pub const THREAD_GROUP_UI_APP: u64 = 0x2;

pub const COALITION_TERM_REQUESTED: u64 = 0x1;
pub const COALITION_TERMINATED: u64 = 0x2;
pub const COALITION_REAPED: u64 = 0x4;
pub const COALITION_PRIVILEGED: u64 = 0x8;

/// Page table dump mask selecting every level.
pub const PAGE_TABLE_MASK_ALL: u32 = 0xf;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_flag_bits() {
        let mut flags = StackshotFlags::default();
        flags.set_delta(true);
        flags.set_compress(true);
        assert_eq!(flags.bits(), (1 << 18) | (1 << 10));
        assert!(flags.delta());
        assert!(!flags.trylock());

        flags.set_compress(false);
        assert_eq!(flags.bits(), 1 << 18);
    }

    #[test]
    fn test_thread_flags_merge() {
        let mut a = ThreadSsFlags::default();
        a.set_on_core(true);
        let mut b = ThreadSsFlags::default();
        b.set_truncated_bt(true);
        a.merge(b);
        assert!(a.on_core());
        assert!(a.truncated_bt());
        assert_eq!(a.bits(), 0x800 | 0x80);
    }
}
