//! The kernel as seen by the capture engine.
//!
//! [`Kernel`] is everything the engine needs from the system it inspects:
//! clocks, task/thread enumeration, address translation and a lightweight
//! fault primitive. Object memory is never touched directly; it goes through
//! [`ForeignMemory`], which validates a kernel address before handing out a
//! typed view of the object behind it.

use std::cell::Cell;

use serde::{Deserialize, Serialize};

use crate::error::CaptureError;
use crate::records::{
    InstrsCycles, IoStats, JetsamCoalitionSnapshot, LoadInfo64, MemStats, SharedCacheLoadInfo,
    ThreadGroupSnapshot, Timebase,
};

/// Kernel virtual address of an object.
pub type Kva = u64;

pub const TH_WAIT: u32 = 0x01;
pub const TH_SUSP: u32 = 0x02;
pub const TH_RUN: u32 = 0x04;
pub const TH_UNINT: u32 = 0x08;
pub const TH_TERMINATE: u32 = 0x10;
pub const TH_IDLE: u32 = 0x80;

/// Bytes that must be mapped behind each object kind before it is read.
pub const TASK_OBJECT_SIZE: u64 = 0x600;
pub const THREAD_OBJECT_SIZE: u64 = 0x500;
pub const PORT_OBJECT_SIZE: u64 = 0x60;
pub const PORT_LABEL_OBJECT_SIZE: u64 = 0x40;

/// An address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SpaceId(pub u32);

impl SpaceId {
    pub const KERNEL: SpaceId = SpaceId(0);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    Resident(u64),
    PagedOut,
    Unmapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharedRegion {
    #[default]
    None,
    System,
    Other,
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockHint {
    #[default]
    None = 0x00,
    KernelMutex = 0x01,
    PortReceive = 0x02,
    PortSetReceive = 0x03,
    PortSend = 0x04,
    PortSendInTransit = 0x05,
    Semaphore = 0x06,
    RwLockRead = 0x07,
    RwLockWrite = 0x08,
    RwLockUpgrade = 0x09,
    UserLock = 0x0a,
    PThreadMutex = 0x0b,
    PThreadRwLockRead = 0x0c,
    PThreadRwLockWrite = 0x0d,
    PThreadCondVar = 0x0e,
    ParkedWorkQueue = 0x0f,
    WorkloopSyncWait = 0x10,
    OnProcess = 0x11,
    SleepWithInheritor = 0x12,
    Eventlink = 0x13,
    Compressor = 0x14,
}

impl BlockHint {
    pub fn wait_type(self) -> u8 {
        self as u8
    }

    pub fn is_pthread(self) -> bool {
        matches!(
            self,
            BlockHint::PThreadMutex
                | BlockHint::PThreadRwLockRead
                | BlockHint::PThreadRwLockWrite
                | BlockHint::PThreadCondVar
        )
    }
}

/// Mapping of the shared library cache into a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SharedCacheMapping {
    pub slide: u64,
    pub uuid: [u8; 16],
    pub base: u64,
}

impl From<SharedCacheMapping> for SharedCacheLoadInfo {
    fn from(m: SharedCacheMapping) -> Self {
        SharedCacheLoadInfo {
            slide: m.slide,
            uuid: m.uuid,
            slid_first_mapping: m.base.wrapping_add(m.slide),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskObject {
    pub pid: i32,
    pub unique_pid: u64,
    pub name: String,
    pub space: SpaceId,
    pub is_kernel: bool,
    pub active: bool,
    pub corpse: bool,
    /// Being torn down; reported as a transitioning task.
    pub transitioning: bool,
    pub user64: bool,
    pub has_pmap: bool,
    pub start_abstime: u64,
    pub proc_start_sec: u64,
    /// Filled in as threads are attached.
    #[serde(skip)]
    pub threads: Vec<Kva>,

    pub suspended: bool,
    pub frozen: bool,
    pub darwin_bg: bool,
    pub foreground: bool,
    pub boosted: bool,
    pub suppressed: bool,
    pub dirty: bool,

    pub terminated_user_time: u64,
    pub terminated_system_time: u64,
    pub phys_footprint: u64,
    pub max_resident: u64,
    pub suspend_count: u32,
    pub faults: u32,
    pub pageins: u32,
    pub cow_faults: u32,
    pub was_throttled: u32,
    pub did_throttle: u32,
    pub latency_qos: u32,

    pub io: Option<IoStats>,
    pub counters: Option<InstrsCycles>,
    pub cputype: i32,
    pub cpusubtype: i32,
    pub jetsam_coalition: Option<u64>,
    pub shared_region: SharedRegion,
    pub shared_cache: Option<SharedCacheMapping>,
    /// User address of the image info table, 0 if none.
    pub image_infos_addr: u64,
    pub dq_serialno_offset: u64,
    pub dq_label_offset: u64,
}

/// Where a blocked thread is waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitTarget {
    pub owner: u64,
    pub context: u64,
    pub wait_flags: u32,
    pub port: Option<Kva>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnstileTarget {
    pub context: u64,
    pub priority: u8,
    pub hops: u8,
    pub flags: u64,
    pub port: Option<Kva>,
}

/// Frame pointer and pc to start a stack walk from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FrameStart {
    pub fp: u64,
    pub pc: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadObject {
    pub tid: u64,
    pub state: u32,
    pub last_run: u64,
    pub last_made_runnable: u64,
    pub wait_event: u64,
    pub continuation: u64,
    pub total_syscalls: u64,
    pub voucher_id: u64,
    pub user_time: u64,
    pub system_time: u64,
    pub runnable_time: u64,
    pub precise_user_kernel_time: bool,
    pub sched_flags: u32,
    pub base_priority: i16,
    pub sched_priority: i16,
    pub eqos: u8,
    pub rqos: u8,
    pub rqos_override: u8,
    pub io_tier: u8,
    pub requested_policy: u64,
    pub effective_policy: u64,
    pub name: String,
    pub main_thread: bool,
    pub darwin_bg: bool,
    pub io_passive: bool,
    pub global_forced_idle: bool,
    /// User address holding the current dispatch queue pointer.
    pub dispatch_qaddr: u64,
    pub block_hint: BlockHint,
    pub wait: Option<WaitTarget>,
    pub turnstile: Option<TurnstileTarget>,
    pub user_frame: Option<FrameStart>,
    pub kernel_frame: Option<FrameStart>,
    pub thread_group: Option<u64>,
    pub io: Option<IoStats>,
    pub counters: Option<InstrsCycles>,
}

impl ThreadObject {
    /// Blocked on something worth describing.
    pub fn has_waitinfo(&self) -> bool {
        if self.state & TH_WAIT == 0 {
            return false;
        }
        match self.block_hint {
            BlockHint::None | BlockHint::ParkedWorkQueue => false,
            hint if hint.is_pthread() => self.wait.is_some(),
            _ => true,
        }
    }

    pub fn has_turnstileinfo(&self) -> bool {
        self.has_waitinfo() && self.turnstile.is_some()
    }

    pub fn has_kernel_stack(&self) -> bool {
        self.kernel_frame.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortObject {
    /// Service label attached to the port, if any.
    pub label: Option<Kva>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PortLabelObject {
    pub domain: u8,
    pub throttled: bool,
    /// Kernel address of the NUL-terminated service name.
    pub name_addr: u64,
}

#[derive(Debug, Clone)]
pub enum KernelObject {
    Task(TaskObject),
    Thread(ThreadObject),
    Port(PortObject),
    PortLabel(PortLabelObject),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Processor {
    pub cpu: u32,
    pub active_thread: Option<Kva>,
}

pub trait Kernel {
    fn page_size(&self) -> u64;
    fn absolute_time(&self) -> u64;
    fn calendar_micros(&self) -> u64;
    fn timebase(&self) -> Timebase;
    fn os_version(&self) -> String;
    fn boot_args(&self) -> String;
    fn total_memory(&self) -> u64;
    fn memory_stats(&self) -> MemStats;
    fn jetsam_level(&self) -> u32;
    fn has_instr_counters(&self) -> bool;
    fn thread_groups(&self) -> Option<Vec<ThreadGroupSnapshot>>;
    fn coalitions(&self) -> Option<Vec<JetsamCoalitionSnapshot>>;
    fn shared_cache_layout(&self) -> Option<SharedCacheLoadInfo>;
    fn kernel_images(&self) -> Vec<LoadInfo64>;

    /// Live tasks in enumeration order.
    fn tasks(&self) -> Vec<Kva>;
    /// Terminated tasks that have not been reaped yet.
    fn terminated_tasks(&self) -> Vec<Kva>;
    fn processors(&self) -> Vec<Processor>;
    fn task_count(&self) -> usize;
    fn thread_count(&self) -> usize;

    /// Whether `[kva, kva + len)` is backed by kernel memory.
    fn kva_mapped(&self, kva: Kva, len: u64) -> bool;
    fn object(&self, kva: Kva) -> Option<&KernelObject>;

    fn translate(&self, space: SpaceId, vaddr: u64) -> PageState;
    /// Try to make one page resident without blocking on I/O.
    fn lightweight_fault(&self, space: SpaceId, vaddr: u64) -> bool;
    /// `len` bytes of physical memory. Never crosses a page.
    fn physical(&self, paddr: u64, len: usize) -> Option<&[u8]>;
    fn page_table_entries(&self, space: SpaceId, mask: u32) -> Option<Vec<u64>>;

    /// Set the interrupt state and return the previous one.
    fn set_interrupts(&self, enabled: bool) -> bool;
}

/// Interrupts stay masked for as long as this lives.
pub struct InterruptGuard<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
    previous: bool,
}

impl<'k, K: Kernel + ?Sized> InterruptGuard<'k, K> {
    pub fn disable(kernel: &'k K) -> Self {
        let previous = kernel.set_interrupts(false);
        Self { kernel, previous }
    }
}

impl<K: Kernel + ?Sized> Drop for InterruptGuard<'_, K> {
    fn drop(&mut self) {
        self.kernel.set_interrupts(self.previous);
    }
}

/// Validated access to kernel objects.
pub struct ForeignMemory<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
    page_size: u64,
    last_valid_page: Cell<Option<u64>>,
}

impl<'k, K: Kernel + ?Sized> ForeignMemory<'k, K> {
    pub fn new(kernel: &'k K) -> Self {
        Self {
            kernel,
            page_size: kernel.page_size().max(1),
            last_valid_page: Cell::new(None),
        }
    }

    /// Check that `[kva, kva + len)` is mapped, one page at a time,
    /// remembering the last good page.
    pub fn validate(&self, kva: Kva, len: u64) -> bool {
        if kva == 0 {
            return false;
        }
        let Some(end) = kva.checked_add(len.max(1)) else {
            return false;
        };
        let mask = !(self.page_size - 1);
        let mut page = kva & mask;
        while page < end {
            if self.last_valid_page.get() != Some(page) {
                if !self.kernel.kva_mapped(page, self.page_size) {
                    return false;
                }
                self.last_valid_page.set(Some(page));
            }
            page += self.page_size;
        }
        true
    }

    fn object(&self, kva: Kva, len: u64) -> Option<&'k KernelObject> {
        if !self.validate(kva, len) {
            return None;
        }
        self.kernel.object(kva)
    }

    pub fn task(&self, kva: Kva) -> Result<&'k TaskObject, CaptureError> {
        match self.object(kva, TASK_OBJECT_SIZE) {
            Some(KernelObject::Task(task)) => Ok(task),
            _ => Err(CaptureError::InvalidObject { kva }),
        }
    }

    pub fn thread(&self, kva: Kva) -> Result<&'k ThreadObject, CaptureError> {
        match self.object(kva, THREAD_OBJECT_SIZE) {
            Some(KernelObject::Thread(thread)) => Ok(thread),
            _ => Err(CaptureError::InvalidObject { kva }),
        }
    }

    pub fn port(&self, kva: Kva) -> Option<&'k PortObject> {
        match self.object(kva, PORT_OBJECT_SIZE) {
            Some(KernelObject::Port(port)) => Some(port),
            _ => None,
        }
    }

    pub fn port_label(&self, kva: Kva) -> Option<&'k PortLabelObject> {
        match self.object(kva, PORT_LABEL_OBJECT_SIZE) {
            Some(KernelObject::PortLabel(label)) => Some(label),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_waitinfo_validity() {
        let mut thread = ThreadObject {
            state: TH_WAIT,
            block_hint: BlockHint::KernelMutex,
            ..Default::default()
        };
        assert!(thread.has_waitinfo());
        assert!(!thread.has_turnstileinfo());

        thread.block_hint = BlockHint::ParkedWorkQueue;
        assert!(!thread.has_waitinfo());

        thread.block_hint = BlockHint::PThreadMutex;
        assert!(!thread.has_waitinfo());
        thread.wait = Some(WaitTarget::default());
        assert!(thread.has_waitinfo());

        thread.state = TH_RUN;
        assert!(!thread.has_waitinfo());
    }

    #[test]
    fn test_block_hint_wire_values() {
        assert_eq!(BlockHint::PortSend.wait_type(), 4);
        assert_eq!(BlockHint::Compressor.wait_type(), 0x14);
    }
}
