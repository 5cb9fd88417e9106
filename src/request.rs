//! Caller-facing request and result types.

use serde::{Deserialize, Serialize};

use crate::error::Status;
use crate::flags::{StackshotFlags, PAGE_TABLE_MASK_ALL};

pub const REQUEST_VERSION: u32 = 1;

/// Where a request comes from. Kernel callers may retain buffers and
/// use a non-blocking lock; user callers may not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    User,
    Kernel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotRequest {
    pub version: u32,
    /// Target pid, -1 for every task.
    pub pid: i32,
    pub flags: StackshotFlags,
    /// Baseline for delta captures.
    pub since_timestamp: u64,
    pub pagetable_mask: u32,
    pub size_hint: u64,
    pub origin: Origin,
}

impl Default for SnapshotRequest {
    fn default() -> Self {
        Self {
            version: REQUEST_VERSION,
            pid: -1,
            flags: StackshotFlags::default(),
            since_timestamp: 0,
            pagetable_mask: 0,
            size_hint: 0,
            origin: Origin::User,
        }
    }
}

impl SnapshotRequest {
    pub fn with_flags(flags: StackshotFlags) -> Self {
        Self {
            flags,
            ..Default::default()
        }
    }

    /// Reject malformed requests and fill in defaults. Runs before the
    /// service lock is taken.
    pub fn normalize(mut self, has_instr_counters: bool) -> Result<Self, Status> {
        let flags = self.flags;
        if self.version != REQUEST_VERSION || self.pid < -1 {
            return Err(Status::InvalidArgument);
        }
        if self.since_timestamp != 0 && !flags.delta() {
            return Err(Status::InvalidArgument);
        }
        if (flags.delta() || flags.page_tables()) && flags.compress() {
            return Err(Status::NotSupported);
        }
        match self.origin {
            Origin::User => {
                if flags.trylock() || flags.save_in_kernel_buffer() {
                    return Err(Status::NoAccess);
                }
            }
            Origin::Kernel => {
                if !flags.save_in_kernel_buffer() && !flags.retrieve_existing_buffer() {
                    return Err(Status::InvalidArgument);
                }
            }
        }
        if flags.page_tables() && self.pagetable_mask == 0 {
            self.pagetable_mask = PAGE_TABLE_MASK_ALL;
        }
        if flags.instrs_cycles() && !has_instr_counters {
            self.flags.set_instrs_cycles(false);
        }
        Ok(self)
    }
}

/// Outcome of one call into the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackshotResult {
    pub status: Status,
    pub bytes_traced: u64,
    pub bytes_uncompressed: u64,
    #[serde(skip)]
    pub buffer: Option<Vec<u8>>,
}

impl StackshotResult {
    pub fn failed(status: Status) -> Self {
        Self {
            status,
            bytes_traced: 0,
            bytes_uncompressed: 0,
            buffer: None,
        }
    }
}
