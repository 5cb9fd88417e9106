//! Externally callable entry point.
//!
//! [`StackshotService`] owns the kernel handle, the exclusivity lock and the
//! retained-buffer slot. Each call validates the request, takes the lock,
//! sizes a buffer and drives [`crate::capture::capture`] until the output
//! fits or the ceiling is reached.

use std::fmt;
use std::sync::{Mutex, MutexGuard, TryLockError};

use tracing::{debug, info, warn};

use crate::capture::{capture, CaptureOptions, CaptureOutcome};
use crate::config::{Tunables, GIB};
use crate::error::{CaptureError, Status};
use crate::flags::StackshotFlags;
use crate::intern::PortLabelTable;
use crate::kernel::{InterruptGuard, Kernel};
use crate::request::{Origin, SnapshotRequest, StackshotResult};

/// The buffer cannot grow past the ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exhausted;

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buffer size ceiling reached")
    }
}

impl std::error::Error for Exhausted {}

/// Size of the next attempt after `prev` overflowed: double it, clamped to
/// `ceiling`. Always strictly larger than `prev`.
pub fn next_size(prev: u64, ceiling: u64) -> Result<u64, Exhausted> {
    if prev >= ceiling {
        return Err(Exhausted);
    }
    Ok(prev.saturating_mul(2).max(prev + 1).min(ceiling))
}

fn round_up(value: u64, align: u64) -> u64 {
    let align = align.max(1);
    value.div_ceil(align).saturating_mul(align)
}

/// A finished buffer kept for a later retrieve call.
#[derive(Debug)]
pub struct OwnedBuffer {
    bytes: Vec<u8>,
    bytes_uncompressed: u64,
}

impl OwnedBuffer {
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    retained: Option<OwnedBuffer>,
}

pub struct StackshotService<K: Kernel> {
    kernel: K,
    tunables: Tunables,
    state: Mutex<ServiceState>,
}

impl<K: Kernel> StackshotService<K> {
    pub fn new(kernel: K, tunables: Tunables) -> Self {
        Self {
            kernel,
            tunables,
            state: Mutex::new(ServiceState::default()),
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    /// Mutable access between captures, e.g. to let a simulated system run.
    pub fn kernel_mut(&mut self) -> &mut K {
        &mut self.kernel
    }

    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    pub fn has_retained_buffer(&self) -> bool {
        self.lock_state().retained.is_some()
    }

    fn lock_state(&self) -> MutexGuard<'_, ServiceState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Largest buffer any attempt may use.
    pub fn ceiling(&self) -> u64 {
        if let Some(max) = self.tunables.max_buffer_bytes {
            return max;
        }
        let gib = self.kernel.total_memory().div_ceil(GIB);
        self.tunables
            .min_ceiling_bytes
            .max(gib.saturating_mul(self.tunables.ceiling_bytes_per_gib))
    }

    /// Initial buffer size for a request carrying `hint`.
    pub fn estimate_size(&self, hint: u64, ceiling: u64) -> u64 {
        let t = &self.tunables;
        let tasks = self.kernel.task_count() as u64;
        let threads = self.kernel.thread_count() as u64;
        let raw = tasks
            .saturating_mul(t.est_task_bytes.saturating_add(t.est_uuid_bytes_per_task))
            .saturating_add(threads.saturating_mul(t.est_thread_bytes))
            .saturating_add(t.supplement_bytes);
        let mut estimate = raw.saturating_add(raw.saturating_mul(t.slack_percent()) / 100);
        if hint <= ceiling {
            estimate = estimate.max(hint);
        }
        estimate = estimate.saturating_add(PortLabelTable::footprint(t.label_capacity()) as u64);
        round_up(estimate, self.kernel.page_size())
    }

    /// Handle one request end to end.
    pub fn stack_snapshot(&self, req: SnapshotRequest) -> StackshotResult {
        let req = match req.normalize(self.kernel.has_instr_counters()) {
            Ok(req) => req,
            Err(status) => {
                debug!("rejected stackshot request: {}", status);
                return StackshotResult::failed(status);
            }
        };

        let mut state = if req.flags.trylock() {
            match self.state.try_lock() {
                Ok(guard) => guard,
                Err(TryLockError::Poisoned(e)) => e.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    return StackshotResult::failed(Status::AlreadyRunning);
                }
            }
        } else {
            self.lock_state()
        };

        if req.flags.retrieve_existing_buffer() {
            return match state.retained.take() {
                Some(buf) => StackshotResult {
                    status: Status::Success,
                    bytes_traced: buf.bytes.len() as u64,
                    bytes_uncompressed: buf.bytes_uncompressed,
                    buffer: Some(buf.bytes),
                },
                None => StackshotResult::failed(Status::NotInSet),
            };
        }
        if req.flags.save_in_kernel_buffer() && state.retained.is_some() {
            return StackshotResult::failed(Status::MemoryPresent);
        }

        let out = match self.capture_growing(&req) {
            Ok(out) => out,
            Err(status) => return StackshotResult::failed(status),
        };
        let bytes_traced = out.sizes.bytes_used as u64;
        let bytes_uncompressed = out.sizes.bytes_uncompressed as u64;
        info!(
            "stackshot complete: {} bytes ({} uncompressed)",
            bytes_traced, bytes_uncompressed
        );

        if req.flags.save_in_kernel_buffer() {
            state.retained = Some(OwnedBuffer {
                bytes: out.bytes,
                bytes_uncompressed,
            });
            return StackshotResult {
                status: Status::Success,
                bytes_traced,
                bytes_uncompressed,
                buffer: None,
            };
        }
        StackshotResult {
            status: Status::Success,
            bytes_traced,
            bytes_uncompressed,
            buffer: Some(out.bytes),
        }
    }

    /// Capture once into a buffer of exactly `buf_size` bytes.
    ///
    /// This is the debugger path: the system is already stopped, so neither
    /// the lock nor the retained-buffer flags apply, and there is no retry.
    pub fn capture_fixed(&self, req: SnapshotRequest, buf_size: usize) -> StackshotResult {
        let mut req = req;
        req.origin = Origin::User;
        req.flags.set_trylock(false);
        req.flags.set_save_in_kernel_buffer(false);
        req.flags.set_retrieve_existing_buffer(false);
        let req = match req.normalize(self.kernel.has_instr_counters()) {
            Ok(req) => req,
            Err(status) => return StackshotResult::failed(status),
        };

        let opts = self.options(&req, buf_size as u64, 0);
        let begin = self.kernel.absolute_time();
        let result = {
            let _masked = InterruptGuard::disable(&self.kernel);
            capture(&self.kernel, buf_size, &opts, &self.tunables)
        };
        match result {
            Ok(mut out) => {
                out.patch_duration_outer(self.kernel.absolute_time().saturating_sub(begin));
                StackshotResult {
                    status: Status::Success,
                    bytes_traced: out.sizes.bytes_used as u64,
                    bytes_uncompressed: out.sizes.bytes_uncompressed as u64,
                    buffer: Some(out.bytes),
                }
            }
            Err(err) => {
                warn!("fixed-buffer stackshot failed: {}", err);
                StackshotResult::failed(err.into())
            }
        }
    }

    /// Drop flags the kernel cannot honor.
    fn effective_flags(&self, mut flags: StackshotFlags) -> StackshotFlags {
        if flags.thread_groups() && self.kernel.thread_groups().is_none() {
            flags.set_thread_groups(false);
        }
        if flags.jetsam_coalitions() && self.kernel.coalitions().is_none() {
            flags.set_jetsam_coalitions(false);
        }
        flags
    }

    fn options(&self, req: &SnapshotRequest, estimate: u64, prior: u64) -> CaptureOptions {
        CaptureOptions {
            flags: self.effective_flags(req.flags),
            pid: req.pid,
            since: req.since_timestamp,
            pagetable_mask: req.pagetable_mask,
            size_estimate: estimate,
            slack_percent: self.tunables.slack_percent(),
            duration_prior: prior,
        }
    }

    fn capture_growing(&self, req: &SnapshotRequest) -> Result<CaptureOutcome, Status> {
        let ceiling = self.ceiling();
        let estimate = self.estimate_size(req.size_hint, ceiling);
        let mut size = estimate.min(ceiling);
        let mut prior = 0;
        let mut attempt = 1;
        debug!(
            "stackshot estimate {} bytes, ceiling {} bytes",
            estimate, ceiling
        );

        loop {
            let opts = self.options(req, estimate, prior);
            debug!("stackshot attempt {} with {} bytes", attempt, size);
            let begin = self.kernel.absolute_time();
            let result = {
                let _masked = InterruptGuard::disable(&self.kernel);
                let capacity = usize::try_from(size).unwrap_or(usize::MAX);
                capture(&self.kernel, capacity, &opts, &self.tunables)
            };
            let elapsed = self.kernel.absolute_time().saturating_sub(begin);

            match result {
                Ok(mut out) => {
                    out.patch_duration_outer(elapsed);
                    return Ok(out);
                }
                Err(CaptureError::BufferFull) => {
                    prior += elapsed;
                    match next_size(size, ceiling) {
                        Ok(next) => {
                            info!(
                                "stackshot buffer of {} bytes overflowed, retrying with {}",
                                size, next
                            );
                            size = next;
                            attempt += 1;
                        }
                        Err(Exhausted) => {
                            warn!(
                                "stackshot does not fit in the {} byte ceiling after {} attempts",
                                ceiling, attempt
                            );
                            return Err(Status::ResourceShortage);
                        }
                    }
                }
                Err(err) => {
                    warn!("stackshot failed: {}", err);
                    return Err(err.into());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MIB;
    use crate::kernel::{TaskObject, ThreadObject};
    use crate::sim::SimKernel;

    fn service(tasks: usize, threads: usize) -> StackshotService<SimKernel> {
        let mut k = SimKernel::new(4096);
        for t in 0..tasks {
            let task = k.add_task(TaskObject {
                pid: t as i32 + 1,
                unique_pid: 100 + t as u64,
                active: true,
                ..Default::default()
            });
            for i in 0..threads {
                k.add_thread(
                    task,
                    ThreadObject {
                        tid: (t * 1000 + i) as u64,
                        ..Default::default()
                    },
                );
            }
        }
        StackshotService::new(k, Tunables::default())
    }

    #[test]
    fn test_next_size_doubles_then_exhausts() {
        assert_eq!(next_size(4096, 1 << 20), Ok(8192));
        assert_eq!(next_size(600_000, 1 << 20), Ok(1 << 20));
        assert_eq!(next_size(1 << 20, 1 << 20), Err(Exhausted));
        assert_eq!(next_size(0, 10), Ok(1));

        let mut size = 1000;
        let mut steps = 0;
        while let Ok(next) = next_size(size, 1 << 30) {
            assert!(next > size);
            size = next;
            steps += 1;
        }
        assert!(steps < 64);
    }

    #[test]
    fn test_ceiling_from_memory() {
        let mut svc = service(0, 0);
        svc.kernel_mut().system_mut().total_memory = 16 * GIB;
        assert_eq!(svc.ceiling(), 16 * MIB);
        svc.kernel_mut().system_mut().total_memory = GIB / 2;
        assert_eq!(svc.ceiling(), 8 * MIB);
    }

    #[test]
    fn test_estimate_respects_hint_and_page_size() {
        let svc = service(2, 3);
        let ceiling = svc.ceiling();
        let base = svc.estimate_size(0, ceiling);
        assert_eq!(base % 4096, 0);
        assert!(base >= 16 * 1024);

        let hinted = svc.estimate_size(base * 4, ceiling);
        assert!(hinted >= base * 4);

        // Hints beyond the ceiling are ignored.
        assert_eq!(svc.estimate_size(ceiling * 2, ceiling), base);
    }

    #[test]
    fn test_estimate_saturates() {
        let mut svc = service(3, 5);
        svc.tunables.est_task_bytes = u64::MAX / 2;
        svc.tunables.est_uuid_bytes_per_task = u64::MAX / 2;
        svc.tunables.est_thread_bytes = u64::MAX;
        let estimate = svc.estimate_size(0, u64::MAX);
        assert!(estimate >= u64::MAX - 4096);
    }

    #[test]
    fn test_unallocatable_buffer_is_resource_shortage() {
        let mut svc = service(2, 2);
        svc.tunables.max_buffer_bytes = Some(u64::MAX);
        let result = svc.stack_snapshot(SnapshotRequest {
            size_hint: 1 << 63,
            ..Default::default()
        });
        assert_eq!(result.status, Status::ResourceShortage);
        assert!(result.buffer.is_none());
        // No growth attempts after an allocation failure.
        assert_eq!(svc.kernel().interrupt_disables(), 1);
        assert!(svc.kernel().interrupts_enabled());
    }

    #[test]
    fn test_trylock_reports_already_running() {
        let svc = service(1, 1);
        let _held = svc.state.lock().unwrap();
        let mut flags = StackshotFlags::default();
        flags.set_trylock(true);
        flags.set_save_in_kernel_buffer(true);
        let req = SnapshotRequest {
            flags,
            origin: Origin::Kernel,
            ..Default::default()
        };
        assert_eq!(svc.stack_snapshot(req).status, Status::AlreadyRunning);
    }

    #[test]
    fn test_unsupported_aggregates_are_dropped() {
        let svc = service(1, 1);
        let mut flags = StackshotFlags::default();
        flags.set_thread_groups(true);
        flags.set_jetsam_coalitions(true);
        let eff = svc.effective_flags(flags);
        assert!(!eff.thread_groups());
        assert!(!eff.jetsam_coalitions());
    }
}
