//! Frame-pointer stack walks over foreign memory.

use crate::flags::FaultResult;
use crate::kernel::{FrameStart, Kernel, SpaceId};
use crate::memory::SafeReader;

/// A captured stack, innermost frame first.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Backtrace {
    pub frames: Vec<u64>,
    /// The walk stopped early on an unreadable frame or the frame budget.
    pub truncated: bool,
    pub fault: FaultResult,
}

/// Reads stack words, remembering the last translated page.
struct StackCursor<'r, 'k, K: Kernel + ?Sized> {
    reader: &'r mut SafeReader<'k, K>,
    space: SpaceId,
    allow_fault: bool,
    page: Option<(u64, u64)>,
    fault: FaultResult,
}

impl<K: Kernel + ?Sized> StackCursor<'_, '_, K> {
    fn read_word(&mut self, addr: u64) -> Option<u64> {
        if addr % 8 != 0 {
            return None;
        }
        let page_size = self.reader.page_size();
        let base = addr - addr % page_size;
        let paddr = match self.page {
            Some((va, pa)) if va == base => pa,
            _ => {
                let pa = self
                    .reader
                    .find_physical(self.space, base, self.allow_fault, &mut self.fault)?;
                self.page = Some((base, pa));
                pa
            }
        };
        let raw = self.reader.kernel().physical(paddr + (addr - base), 8)?;
        Some(u64::from_le_bytes(raw.try_into().ok()?))
    }
}

/// Walk `[next_fp, lr]` frame records from `start`, collecting at most
/// `budget` return addresses.
pub fn walk<K: Kernel + ?Sized>(
    reader: &mut SafeReader<'_, K>,
    space: SpaceId,
    start: FrameStart,
    budget: usize,
    allow_fault: bool,
) -> Backtrace {
    let mut bt = Backtrace::default();
    if budget == 0 {
        bt.truncated = true;
        return bt;
    }
    bt.frames.push(start.pc);

    let mut cursor = StackCursor {
        reader,
        space,
        allow_fault,
        page: None,
        fault: FaultResult::default(),
    };
    let mut fp = start.fp;
    while fp != 0 && fp % 8 == 0 {
        if bt.frames.len() >= budget {
            bt.truncated = true;
            break;
        }
        let next = cursor.read_word(fp);
        let lr = fp.checked_add(8).and_then(|a| cursor.read_word(a));
        let (Some(next), Some(lr)) = (next, lr) else {
            bt.truncated = true;
            break;
        };
        if lr == 0 {
            break;
        }
        bt.frames.push(lr);
        // Frames must move toward the stack base.
        if next != 0 && next <= fp {
            break;
        }
        fp = next;
    }
    bt.fault = cursor.fault;
    bt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimKernel;

    const SPACE: SpaceId = SpaceId(3);
    const STACK: u64 = 0x7000_0000;

    fn stack_kernel(frames: &[(u64, u64)]) -> (SimKernel, FrameStart) {
        let mut k = SimKernel::new(4096);
        let mut bytes = vec![0u8; 8192];
        // Lay frames 64 bytes apart, growing toward higher addresses.
        for (i, (_, lr)) in frames.iter().enumerate() {
            let off = i * 64;
            let next = if i + 1 < frames.len() {
                STACK + ((i + 1) * 64) as u64
            } else {
                0
            };
            bytes[off..off + 8].copy_from_slice(&next.to_le_bytes());
            bytes[off + 8..off + 16].copy_from_slice(&lr.to_le_bytes());
        }
        k.map_user(SPACE, STACK, &bytes);
        (
            k,
            FrameStart {
                fp: STACK,
                pc: 0x1000,
            },
        )
    }

    #[test]
    fn test_complete_walk() {
        let (k, start) = stack_kernel(&[(0, 0x2000), (0, 0x3000), (0, 0x4000)]);
        let mut reader = SafeReader::new(&k, 1000);
        let bt = walk(&mut reader, SPACE, start, 100, false);
        assert_eq!(bt.frames, vec![0x1000, 0x2000, 0x3000, 0x4000]);
        assert!(!bt.truncated);
    }

    #[test]
    fn test_budget_truncates() {
        let (k, start) = stack_kernel(&[(0, 0x2000), (0, 0x3000), (0, 0x4000)]);
        let mut reader = SafeReader::new(&k, 1000);
        let bt = walk(&mut reader, SPACE, start, 2, false);
        assert_eq!(bt.frames, vec![0x1000, 0x2000]);
        assert!(bt.truncated);
    }

    #[test]
    fn test_paged_out_stack_is_truncated_not_fatal() {
        let (mut k, start) = stack_kernel(&[(0, 0x2000)]);
        k.page_out(SPACE, STACK);
        let mut reader = SafeReader::new(&k, 1000);
        let bt = walk(&mut reader, SPACE, start, 100, false);
        assert_eq!(bt.frames, vec![0x1000]);
        assert!(bt.truncated);
        assert!(bt.fault.paged_out());
    }

    #[test]
    fn test_paged_out_stack_faulted_in() {
        let (mut k, start) = stack_kernel(&[(0, 0x2000)]);
        k.page_out(SPACE, STACK);
        let mut reader = SafeReader::new(&k, 1_000_000);
        let bt = walk(&mut reader, SPACE, start, 100, true);
        assert_eq!(bt.frames, vec![0x1000, 0x2000]);
        assert!(!bt.truncated);
        assert!(bt.fault.faulted_in());
        assert_eq!(reader.stats().pages_faulted_in, 1);
    }

    #[test]
    fn test_misaligned_fp_stops() {
        let (k, _) = stack_kernel(&[(0, 0x2000)]);
        let mut reader = SafeReader::new(&k, 1000);
        let bt = walk(
            &mut reader,
            SPACE,
            FrameStart {
                fp: STACK + 4,
                pc: 0x1000,
            },
            100,
            false,
        );
        assert_eq!(bt.frames, vec![0x1000]);
        assert!(!bt.truncated);
    }
}
