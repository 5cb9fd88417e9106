//! A deterministic in-memory kernel.
//!
//! [`SimKernel`] models just enough of a system for the capture engine:
//! per-space page tables over a pool of physical frames (pages may be
//! resident, paged out or unmapped), kernel objects at page-aligned kernel
//! addresses, a clock that only moves when told to (or when a fault is
//! serviced), and an interrupt flag with counters so tests can check that
//! captures run masked.

pub mod scenario;
pub mod synthetic;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::flags::PAGE_TABLE_MASK_ALL;
use crate::kernel::{
    FrameStart, Kernel, KernelObject, Kva, PageState, PortLabelObject, PortObject, Processor,
    SpaceId, TaskObject, ThreadObject,
};
use crate::records::{
    JetsamCoalitionSnapshot, LoadInfo64, MemStats, SharedCacheLoadInfo, ThreadGroupSnapshot,
    Timebase, MEM_AND_IO_SNAPSHOT_MAGIC,
};

pub use scenario::Scenario;

const KVA_BASE: u64 = 0xffff_ff80_0000_0000;
const USER_DATA_BASE: u64 = 0x1_0000_0000;
const KERNEL_DATA_BASE: u64 = 0xffff_ff90_0000_0000;
/// Spacing between frame records in installed stacks.
const FRAME_STRIDE: u64 = 64;

#[derive(Debug, Clone, Copy)]
struct PageEntry {
    frame: usize,
    resident: bool,
    faultable: bool,
}

/// System-wide facts reported by the simulated kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub os_version: String,
    pub boot_args: String,
    pub total_memory: u64,
    pub mem_stats: MemStats,
    pub jetsam_level: u32,
    pub timebase: Timebase,
    pub has_instr_counters: bool,
    pub thread_groups: Option<Vec<ThreadGroupSnapshot>>,
    pub coalitions: Option<Vec<JetsamCoalitionSnapshot>>,
    pub shared_cache_layout: Option<SharedCacheLoadInfo>,
    pub kernel_images: Vec<LoadInfo64>,
    pub calendar_base_us: u64,
}

impl Default for SystemInfo {
    fn default() -> Self {
        Self {
            os_version: "Simulated Kernel Version 1.0".to_string(),
            boot_args: String::new(),
            total_memory: 8 << 30,
            mem_stats: MemStats {
                snapshot_magic: MEM_AND_IO_SNAPSHOT_MAGIC,
                ..Default::default()
            },
            jetsam_level: 0,
            timebase: Timebase { numer: 1, denom: 1 },
            has_instr_counters: true,
            thread_groups: None,
            coalitions: None,
            shared_cache_layout: None,
            kernel_images: Vec::new(),
            calendar_base_us: 1_700_000_000_000_000,
        }
    }
}

#[derive(Debug)]
pub struct SimKernel {
    page_size: u64,
    clock: AtomicU64,
    fault_cost: u64,
    interrupts_enabled: AtomicBool,
    interrupt_disables: AtomicUsize,
    unmasked_walks: AtomicUsize,
    frames: Vec<Box<[u8]>>,
    pages: RwLock<HashMap<(SpaceId, u64), PageEntry>>,
    objects: HashMap<Kva, KernelObject>,
    kernel_pages: HashSet<u64>,
    tasks: Vec<Kva>,
    terminated: Vec<Kva>,
    processors: Vec<Processor>,
    next_kva: u64,
    data_cursor: HashMap<SpaceId, u64>,
    system: SystemInfo,
}

impl SimKernel {
    pub fn new(page_size: u64) -> Self {
        Self {
            page_size: page_size.max(64).next_power_of_two(),
            clock: AtomicU64::new(1_000_000),
            fault_cost: 50,
            interrupts_enabled: AtomicBool::new(true),
            interrupt_disables: AtomicUsize::new(0),
            unmasked_walks: AtomicUsize::new(0),
            frames: Vec::new(),
            pages: RwLock::new(HashMap::new()),
            objects: HashMap::new(),
            kernel_pages: HashSet::new(),
            tasks: Vec::new(),
            terminated: Vec::new(),
            processors: vec![Processor {
                cpu: 0,
                active_thread: None,
            }],
            next_kva: KVA_BASE,
            data_cursor: HashMap::new(),
            system: SystemInfo::default(),
        }
    }

    pub fn system(&self) -> &SystemInfo {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut SystemInfo {
        &mut self.system
    }

    pub fn set_fault_cost(&mut self, cost: u64) {
        self.fault_cost = cost;
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn set_clock(&mut self, now: u64) {
        self.clock.store(now, Ordering::SeqCst);
    }

    pub fn advance_clock(&self, delta: u64) -> u64 {
        self.clock.fetch_add(delta, Ordering::SeqCst) + delta
    }

    pub fn set_cpus(&mut self, count: u32) {
        self.processors = (0..count.max(1))
            .map(|cpu| Processor {
                cpu,
                active_thread: None,
            })
            .collect();
    }

    fn page_base(&self, vaddr: u64) -> u64 {
        vaddr & !(self.page_size - 1)
    }

    fn pages_mut(&mut self) -> &mut HashMap<(SpaceId, u64), PageEntry> {
        self.pages.get_mut().unwrap_or_else(|e| e.into_inner())
    }

    /// Map `bytes` at `vaddr` in `space`, allocating frames as needed.
    pub fn map_user(&mut self, space: SpaceId, vaddr: u64, bytes: &[u8]) {
        let page_size = self.page_size;
        let mut done = 0usize;
        let mut addr = vaddr;
        loop {
            let base = self.page_base(addr);
            let existing = self.pages_mut().get(&(space, base)).map(|e| e.frame);
            let frame = match existing {
                Some(frame) => frame,
                None => {
                    self.frames
                        .push(vec![0u8; page_size as usize].into_boxed_slice());
                    let frame = self.frames.len() - 1;
                    self.pages_mut().insert(
                        (space, base),
                        PageEntry {
                            frame,
                            resident: true,
                            faultable: true,
                        },
                    );
                    frame
                }
            };
            let off = (addr - base) as usize;
            let chunk = (page_size as usize - off).min(bytes.len() - done);
            self.frames[frame][off..off + chunk].copy_from_slice(&bytes[done..done + chunk]);
            done += chunk;
            addr += chunk as u64;
            if done >= bytes.len() {
                break;
            }
        }
    }

    /// Map `bytes` at a fresh page-aligned address and return it.
    pub fn alloc_data(&mut self, space: SpaceId, bytes: &[u8]) -> u64 {
        let start = if space == SpaceId::KERNEL {
            KERNEL_DATA_BASE
        } else {
            USER_DATA_BASE
        };
        let cursor = *self.data_cursor.entry(space).or_insert(start);
        let len = (bytes.len().max(1) as u64).div_ceil(self.page_size) * self.page_size;
        self.data_cursor.insert(space, cursor + len);
        self.map_user(space, cursor, bytes);
        cursor
    }

    pub fn page_out(&mut self, space: SpaceId, vaddr: u64) {
        let base = self.page_base(vaddr);
        if let Some(entry) = self.pages_mut().get_mut(&(space, base)) {
            entry.resident = false;
        }
    }

    /// Page out every page overlapping `[vaddr, vaddr + len)`.
    pub fn page_out_range(&mut self, space: SpaceId, vaddr: u64, len: u64) {
        let mut page = self.page_base(vaddr);
        while page < vaddr + len.max(1) {
            self.page_out(space, page);
            page += self.page_size;
        }
    }

    /// Faults on this page will fail.
    pub fn set_unfaultable(&mut self, space: SpaceId, vaddr: u64) {
        let base = self.page_base(vaddr);
        if let Some(entry) = self.pages_mut().get_mut(&(space, base)) {
            entry.faultable = false;
        }
    }

    pub fn is_resident(&self, space: SpaceId, vaddr: u64) -> bool {
        matches!(self.translate(space, vaddr), PageState::Resident(_))
    }

    fn alloc_object(&mut self, obj: KernelObject) -> Kva {
        let kva = self.next_kva;
        // Every object gets its own run of pages.
        let span = 0x1000u64.max(self.page_size);
        self.next_kva += span;
        let mut page = kva;
        while page < kva + span {
            self.kernel_pages.insert(page);
            page += self.page_size;
        }
        self.objects.insert(kva, obj);
        kva
    }

    pub fn add_task(&mut self, task: TaskObject) -> Kva {
        let kva = self.alloc_object(KernelObject::Task(task));
        self.tasks.push(kva);
        kva
    }

    pub fn add_terminated_task(&mut self, task: TaskObject) -> Kva {
        let kva = self.alloc_object(KernelObject::Task(task));
        self.terminated.push(kva);
        kva
    }

    pub fn add_thread(&mut self, task: Kva, thread: ThreadObject) -> Kva {
        let kva = self.alloc_object(KernelObject::Thread(thread));
        if let Some(t) = self.task_mut(task) {
            t.threads.push(kva);
        }
        kva
    }

    pub fn add_port(&mut self, port: PortObject) -> Kva {
        self.alloc_object(KernelObject::Port(port))
    }

    pub fn add_port_label(&mut self, label: PortLabelObject) -> Kva {
        self.alloc_object(KernelObject::PortLabel(label))
    }

    /// Place `thread` on `cpu`. Returns false if there is no such cpu.
    pub fn set_on_core(&mut self, cpu: usize, thread: Option<Kva>) -> bool {
        match self.processors.get_mut(cpu) {
            Some(p) => {
                p.active_thread = thread;
                true
            }
            None => false,
        }
    }

    /// Unmap the object's backing pages so validation fails.
    pub fn corrupt(&mut self, kva: Kva) {
        let page = self.page_base(kva);
        self.kernel_pages.remove(&page);
    }

    pub fn task_mut(&mut self, kva: Kva) -> Option<&mut TaskObject> {
        match self.objects.get_mut(&kva) {
            Some(KernelObject::Task(t)) => Some(t),
            _ => None,
        }
    }

    pub fn thread_mut(&mut self, kva: Kva) -> Option<&mut ThreadObject> {
        match self.objects.get_mut(&kva) {
            Some(KernelObject::Thread(t)) => Some(t),
            _ => None,
        }
    }

    pub fn task_list(&self) -> &[Kva] {
        &self.tasks
    }

    /// Let a thread run for a tick, making it newer than any earlier
    /// timestamp.
    pub fn run_thread(&mut self, kva: Kva) {
        let now = self.advance_clock(1);
        if let Some(t) = self.thread_mut(kva) {
            t.last_run = now;
            t.last_made_runnable = now;
        }
    }

    /// Lay a frame-pointer chain for `frames` (pc first) into `space`.
    pub fn install_stack(&mut self, space: SpaceId, frames: &[u64]) -> Option<FrameStart> {
        let (&pc, lrs) = frames.split_first()?;
        if lrs.is_empty() {
            return Some(FrameStart { fp: 0, pc });
        }
        let mut bytes = vec![0u8; lrs.len() * FRAME_STRIDE as usize];
        let base = self.alloc_data(space, &bytes);
        for (i, lr) in lrs.iter().enumerate() {
            let off = i * FRAME_STRIDE as usize;
            let next = if i + 1 < lrs.len() {
                base + (i as u64 + 1) * FRAME_STRIDE
            } else {
                0
            };
            bytes[off..off + 8].copy_from_slice(&next.to_le_bytes());
            bytes[off + 8..off + 16].copy_from_slice(&lr.to_le_bytes());
        }
        self.map_user(space, base, &bytes);
        Some(FrameStart { fp: base, pc })
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.interrupts_enabled.load(Ordering::SeqCst)
    }

    /// How many times interrupts went from enabled to disabled.
    pub fn interrupt_disables(&self) -> usize {
        self.interrupt_disables.load(Ordering::SeqCst)
    }

    /// Task enumerations that happened with interrupts enabled.
    pub fn unmasked_walks(&self) -> usize {
        self.unmasked_walks.load(Ordering::SeqCst)
    }

    fn threads_of(&self, kva: Kva) -> usize {
        match self.objects.get(&kva) {
            Some(KernelObject::Task(t)) => t.threads.len(),
            _ => 0,
        }
    }
}

impl Kernel for SimKernel {
    fn page_size(&self) -> u64 {
        self.page_size
    }

    fn absolute_time(&self) -> u64 {
        self.now()
    }

    fn calendar_micros(&self) -> u64 {
        self.system.calendar_base_us + self.now() / 1000
    }

    fn timebase(&self) -> Timebase {
        self.system.timebase
    }

    fn os_version(&self) -> String {
        self.system.os_version.clone()
    }

    fn boot_args(&self) -> String {
        self.system.boot_args.clone()
    }

    fn total_memory(&self) -> u64 {
        self.system.total_memory
    }

    fn memory_stats(&self) -> MemStats {
        self.system.mem_stats.clone()
    }

    fn jetsam_level(&self) -> u32 {
        self.system.jetsam_level
    }

    fn has_instr_counters(&self) -> bool {
        self.system.has_instr_counters
    }

    fn thread_groups(&self) -> Option<Vec<ThreadGroupSnapshot>> {
        self.system.thread_groups.clone()
    }

    fn coalitions(&self) -> Option<Vec<JetsamCoalitionSnapshot>> {
        self.system.coalitions.clone()
    }

    fn shared_cache_layout(&self) -> Option<SharedCacheLoadInfo> {
        self.system.shared_cache_layout
    }

    fn kernel_images(&self) -> Vec<LoadInfo64> {
        self.system.kernel_images.clone()
    }

    fn tasks(&self) -> Vec<Kva> {
        if self.interrupts_enabled() {
            self.unmasked_walks.fetch_add(1, Ordering::SeqCst);
        }
        self.tasks.clone()
    }

    fn terminated_tasks(&self) -> Vec<Kva> {
        self.terminated.clone()
    }

    fn processors(&self) -> Vec<Processor> {
        self.processors.clone()
    }

    fn task_count(&self) -> usize {
        self.tasks.len() + self.terminated.len()
    }

    fn thread_count(&self) -> usize {
        self.tasks
            .iter()
            .chain(self.terminated.iter())
            .map(|&kva| self.threads_of(kva))
            .sum()
    }

    fn kva_mapped(&self, kva: Kva, len: u64) -> bool {
        let mut page = self.page_base(kva);
        let Some(end) = kva.checked_add(len.max(1)) else {
            return false;
        };
        while page < end {
            if !self.kernel_pages.contains(&page) {
                return false;
            }
            page += self.page_size;
        }
        true
    }

    fn object(&self, kva: Kva) -> Option<&KernelObject> {
        self.objects.get(&kva)
    }

    fn translate(&self, space: SpaceId, vaddr: u64) -> PageState {
        let base = self.page_base(vaddr);
        let pages = self.pages.read().unwrap_or_else(|e| e.into_inner());
        match pages.get(&(space, base)) {
            Some(entry) if entry.resident => {
                PageState::Resident(entry.frame as u64 * self.page_size + (vaddr - base))
            }
            Some(_) => PageState::PagedOut,
            None => PageState::Unmapped,
        }
    }

    fn lightweight_fault(&self, space: SpaceId, vaddr: u64) -> bool {
        self.advance_clock(self.fault_cost);
        let base = self.page_base(vaddr);
        let mut pages = self.pages.write().unwrap_or_else(|e| e.into_inner());
        match pages.get_mut(&(space, base)) {
            Some(entry) if entry.faultable => {
                entry.resident = true;
                true
            }
            _ => false,
        }
    }

    fn physical(&self, paddr: u64, len: usize) -> Option<&[u8]> {
        let frame = (paddr / self.page_size) as usize;
        let off = (paddr % self.page_size) as usize;
        if off + len > self.page_size as usize {
            return None;
        }
        self.frames.get(frame)?.get(off..off + len)
    }

    /// Leaf entries are `frame address | valid`, one per mapped page in
    /// address order. Upper levels are reported as one descriptor each.
    fn page_table_entries(&self, space: SpaceId, mask: u32) -> Option<Vec<u64>> {
        let pages = self.pages.read().unwrap_or_else(|e| e.into_inner());
        let mut mapped: Vec<(u64, PageEntry)> = pages
            .iter()
            .filter(|((s, _), _)| *s == space)
            .map(|((_, va), entry)| (*va, *entry))
            .collect();
        if mapped.is_empty() {
            return None;
        }
        mapped.sort_by_key(|(va, _)| *va);

        let mut entries = Vec::new();
        for level in 0..3u64 {
            if mask & (1 << level) != 0 {
                entries.push((level << 56) | space.0 as u64);
            }
        }
        if mask & PAGE_TABLE_MASK_ALL & 0x8 != 0 {
            for (_, entry) in mapped {
                entries.push(entry.frame as u64 * self.page_size | entry.resident as u64);
            }
        }
        Some(entries)
    }

    fn set_interrupts(&self, enabled: bool) -> bool {
        let previous = self.interrupts_enabled.swap(enabled, Ordering::SeqCst);
        if previous && !enabled {
            self.interrupt_disables.fetch_add(1, Ordering::SeqCst);
        }
        previous
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_and_translate() {
        let mut k = SimKernel::new(4096);
        let space = SpaceId(2);
        k.map_user(space, 0x1000 + 4090, b"0123456789");
        match k.translate(space, 0x1000 + 4094) {
            PageState::Resident(pa) => assert_eq!(k.physical(pa, 2).unwrap(), b"45"),
            other => panic!("unexpected {:?}", other),
        }
        assert!(k.is_resident(space, 0x2000 + 3));
        assert_eq!(k.translate(space, 0x9000), PageState::Unmapped);
        assert_eq!(k.translate(SpaceId(9), 0x1000), PageState::Unmapped);
    }

    #[test]
    fn test_fault_costs_time() {
        let mut k = SimKernel::new(4096);
        k.set_fault_cost(25);
        let va = k.alloc_data(SpaceId(1), b"x");
        k.page_out(SpaceId(1), va);
        assert_eq!(k.translate(SpaceId(1), va), PageState::PagedOut);
        let before = k.now();
        assert!(k.lightweight_fault(SpaceId(1), va));
        assert_eq!(k.now() - before, 25);
        assert!(k.is_resident(SpaceId(1), va));
    }

    #[test]
    fn test_corrupt_object_fails_validation() {
        let mut k = SimKernel::new(4096);
        let task = k.add_task(TaskObject::default());
        assert!(k.kva_mapped(task, 0x600));
        k.corrupt(task);
        assert!(!k.kva_mapped(task, 0x600));
    }

    #[test]
    fn test_interrupt_tracking() {
        let k = SimKernel::new(4096);
        assert!(k.set_interrupts(false));
        assert!(!k.interrupts_enabled());
        assert!(!k.set_interrupts(true));
        assert_eq!(k.interrupt_disables(), 1);
    }
}
