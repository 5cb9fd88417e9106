//! Fault-tolerant reads from foreign address spaces.
//!
//! Every read resolves one page at a time. A page that is not resident may
//! be faulted in when the caller allows it, but only while the capture's
//! fault budget lasts; once the budget is spent the reader latches and all
//! later reads in the same capture degrade to best effort.

use crate::flags::FaultResult;
use crate::kernel::{Kernel, PageState, SpaceId};
use crate::records::FaultStatsRecord;

/// Size of the first, optimistic string read.
const CSTRING_WINDOW: usize = 32;

/// Per-capture fault accounting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FaultStats {
    pub pages_faulted_in: u32,
    pub time_spent_faulting: u64,
    pub max_fault_time: u64,
    pub stopped_faulting: bool,
}

impl FaultStats {
    pub fn record(&self) -> FaultStatsRecord {
        FaultStatsRecord {
            pages_faulted_in: self.pages_faulted_in,
            time_spent_faulting: self.time_spent_faulting,
            system_max_fault_time: self.max_fault_time,
            stopped_faulting: self.stopped_faulting as u8,
        }
    }
}

/// Outcome of [`SafeReader::copy`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyResult {
    Complete,
    /// Only the first `n` bytes were copied.
    Partial(usize),
    Failed,
}

impl CopyResult {
    pub fn is_complete(&self) -> bool {
        matches!(self, CopyResult::Complete)
    }
}

/// A string read out of foreign memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignString {
    pub text: String,
    /// No terminator was found within the length limit.
    pub truncated: bool,
}

pub struct SafeReader<'k, K: Kernel + ?Sized> {
    kernel: &'k K,
    page_size: u64,
    stats: FaultStats,
}

impl<'k, K: Kernel + ?Sized> SafeReader<'k, K> {
    /// `max_fault_time` is in absolute time units.
    pub fn new(kernel: &'k K, max_fault_time: u64) -> Self {
        Self {
            kernel,
            page_size: kernel.page_size().max(1),
            stats: FaultStats {
                max_fault_time,
                ..Default::default()
            },
        }
    }

    pub fn kernel(&self) -> &'k K {
        self.kernel
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    pub fn stats(&self) -> FaultStats {
        self.stats
    }

    /// Resolve `vaddr` to a physical address, faulting it in if allowed.
    pub fn find_physical(
        &mut self,
        space: SpaceId,
        vaddr: u64,
        allow_fault: bool,
        fault: &mut FaultResult,
    ) -> Option<u64> {
        match self.kernel.translate(space, vaddr) {
            PageState::Resident(paddr) => return Some(paddr),
            PageState::Unmapped => return None,
            PageState::PagedOut => {}
        }

        if !allow_fault || self.stats.stopped_faulting {
            fault.set_paged_out(true);
            return None;
        }

        let start = self.kernel.absolute_time();
        let ok = self.kernel.lightweight_fault(space, vaddr);
        let elapsed = self.kernel.absolute_time().saturating_sub(start);
        self.stats.time_spent_faulting = self.stats.time_spent_faulting.saturating_add(elapsed);
        if self.stats.time_spent_faulting >= self.stats.max_fault_time {
            self.stats.stopped_faulting = true;
        }

        match (ok, self.kernel.translate(space, vaddr)) {
            (true, PageState::Resident(paddr)) => {
                fault.set_faulted_in(true);
                self.stats.pages_faulted_in += 1;
                Some(paddr)
            }
            _ => {
                fault.set_tried_fault(true);
                fault.set_paged_out(true);
                None
            }
        }
    }

    /// Fill `out` from `vaddr`, stopping at the first page that cannot be
    /// read. Bytes past a partial copy are left untouched.
    pub fn copy(
        &mut self,
        space: SpaceId,
        vaddr: u64,
        out: &mut [u8],
        allow_fault: bool,
        fault: &mut FaultResult,
    ) -> CopyResult {
        let mut done = 0usize;
        while done < out.len() {
            let Some(src) = vaddr
                .checked_add(done as u64)
                .and_then(|addr| self.page_bytes(space, addr, out.len() - done, allow_fault, fault))
            else {
                break;
            };
            let chunk = src.len();
            out[done..done + chunk].copy_from_slice(src);
            done += chunk;
        }
        match done {
            n if n == out.len() => CopyResult::Complete,
            0 => CopyResult::Failed,
            n => CopyResult::Partial(n),
        }
    }

    /// Bytes from `addr` up to the end of its page, at most `want` of them.
    fn page_bytes(
        &mut self,
        space: SpaceId,
        addr: u64,
        want: usize,
        allow_fault: bool,
        fault: &mut FaultResult,
    ) -> Option<&'k [u8]> {
        let in_page = (self.page_size - addr % self.page_size) as usize;
        let paddr = self.find_physical(space, addr, allow_fault, fault)?;
        self.kernel.physical(paddr, in_page.min(want))
    }

    pub fn read_u64(
        &mut self,
        space: SpaceId,
        vaddr: u64,
        allow_fault: bool,
        fault: &mut FaultResult,
    ) -> Option<u64> {
        let mut raw = [0u8; 8];
        if self.copy(space, vaddr, &mut raw, allow_fault, fault).is_complete() {
            Some(u64::from_le_bytes(raw))
        } else {
            None
        }
    }

    /// Read a NUL-terminated string of at most `max_len - 1` characters.
    pub fn read_cstring(
        &mut self,
        space: SpaceId,
        vaddr: u64,
        max_len: usize,
        allow_fault: bool,
        fault: &mut FaultResult,
    ) -> Option<ForeignString> {
        if vaddr == 0 || max_len == 0 {
            return None;
        }
        let limit = max_len - 1;

        let window = CSTRING_WINDOW.min(max_len);
        let mut buf = [0u8; CSTRING_WINDOW];
        if self
            .copy(space, vaddr, &mut buf[..window], allow_fault, fault)
            .is_complete()
        {
            if let Some(len) = buf[..window].iter().position(|&b| b == 0) {
                return Some(ForeignString {
                    text: String::from_utf8_lossy(&buf[..len]).into_owned(),
                    truncated: false,
                });
            }
        }

        // Slow path: byte at a time, one translation per page.
        let mut bytes = Vec::new();
        let mut page: Option<(u64, u64)> = None;
        for i in 0..limit {
            let addr = vaddr.checked_add(i as u64)?;
            let base = addr - addr % self.page_size;
            let paddr_base = match page {
                Some((va, pa)) if va == base => pa,
                _ => {
                    let pa = self.find_physical(space, base, allow_fault, fault)?;
                    page = Some((base, pa));
                    pa
                }
            };
            let byte = self.kernel.physical(paddr_base + (addr - base), 1)?[0];
            if byte == 0 {
                return Some(ForeignString {
                    text: String::from_utf8_lossy(&bytes).into_owned(),
                    truncated: false,
                });
            }
            bytes.push(byte);
        }
        Some(ForeignString {
            text: String::from_utf8_lossy(&bytes).into_owned(),
            truncated: true,
        })
    }
}
