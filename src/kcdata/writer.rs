//! Forward-only kcdata writer.
//!
//! The writer owns one fixed-size buffer for the lifetime of a capture
//! attempt and never grows it. Running out of room is always reported as
//! [`KcdataError::BufferFull`], which is what the orchestrator keys its
//! grow-and-retry loop on.
//!
//! When compression is enabled, items are staged in a pending buffer and run
//! through a zlib stream that writes straight into the remaining capacity.
//! Outside a compression window the pending bytes are flushed at the start
//! of the next operation, so an [`ArraySlot`] can still be filled in place.

use std::marker::PhantomData;

use flate2::{Compress, Compression, FlushCompress, Status as ZStatus};

use crate::error::KcdataError;
use crate::kcdata::types::{
    BUFFER_BEGIN_COMPRESSED, BUFFER_END, COMPRESS_ZLIB, TYPE_ARRAY_PAD0, TYPE_COMPRESS_HEADER,
    TYPE_CONTAINER_BEGIN, TYPE_CONTAINER_END,
};
use crate::kcdata::{padded_len, ItemHeader, KcStruct, ITEM_HEADER_SIZE};
use crate::records::{Record, Shape};

/// Room kept free behind a compressed stream for the trailing items.
const TRAILER_RESERVE: usize = 128;
/// Compress header payload: algorithm, bytes out, bytes in.
const COMPRESS_HEADER_LEN: usize = 24;

#[derive(Debug, Clone, Copy)]
pub struct WriterOptions {
    pub compress: bool,
    pub max_depth: usize,
}

impl Default for WriterOptions {
    fn default() -> Self {
        Self {
            compress: false,
            max_depth: 8,
        }
    }
}

/// Byte counts reported by [`KcdataWriter::finalize`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Finalized {
    pub bytes_used: usize,
    pub bytes_uncompressed: usize,
}

struct Deflate {
    stream: Compress,
    header_payload: usize,
    stream_start: usize,
    pending: Vec<u8>,
    finished: bool,
}

pub struct KcdataWriter {
    buf: Vec<u8>,
    used: usize,
    tail_reserved: usize,
    containers: Vec<(u32, u64)>,
    max_depth: usize,
    windows: usize,
    deflate: Option<Deflate>,
    poisoned: Option<KcdataError>,
}

/// A reserved, zeroed array region filled in place by the caller.
pub struct ArraySlot<'a, T: KcStruct> {
    bytes: &'a mut [u8],
    _marker: PhantomData<T>,
}

impl<'a, T: KcStruct> ArraySlot<'a, T> {
    pub fn len(&self) -> usize {
        self.bytes.len() / T::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Write element `index`. Returns false if the index is out of range.
    pub fn set(&mut self, index: usize, value: &T) -> bool {
        let start = index * T::SIZE;
        match self.bytes.get_mut(start..start + T::SIZE) {
            Some(dst) => {
                value.encode_to(dst);
                true
            }
            None => false,
        }
    }

    /// Raw element storage, for callers that copy foreign memory straight in.
    pub fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes
    }
}

impl KcdataWriter {
    /// Start a buffer of `capacity` bytes whose first item is `begin_kind`.
    pub fn new(capacity: usize, begin_kind: u32, opts: WriterOptions) -> Result<Self, KcdataError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| KcdataError::NoMemory { bytes: capacity })?;
        buf.resize(capacity, 0);
        let mut writer = Self {
            buf,
            used: 0,
            tail_reserved: 0,
            containers: Vec::new(),
            max_depth: opts.max_depth,
            windows: 0,
            deflate: None,
            poisoned: None,
        };

        if !opts.compress {
            writer.reserve_item(begin_kind, 0, 0)?;
            return Ok(writer);
        }

        writer.reserve_item(BUFFER_BEGIN_COMPRESSED, 0, 0)?;
        let (payload, offset) = writer.reserve_item(TYPE_COMPRESS_HEADER, 0, COMPRESS_HEADER_LEN)?;
        payload[..8].copy_from_slice(&COMPRESS_ZLIB.to_le_bytes());
        let header_payload = offset.ok_or(KcdataError::Poisoned)?;
        if writer.remaining() < TRAILER_RESERVE {
            return Err(KcdataError::BufferFull);
        }
        writer.deflate = Some(Deflate {
            stream: Compress::new(Compression::default(), true),
            header_payload,
            stream_start: writer.used,
            pending: Vec::new(),
            finished: false,
        });
        // The inner begin marker is the first thing inside the stream.
        writer.reserve_item(begin_kind, 0, 0)?;
        Ok(writer)
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn is_compressing(&self) -> bool {
        self.streaming()
    }

    /// Bytes still available for items (excluding tail reservations).
    pub fn remaining(&self) -> usize {
        let limit = self.buf.len().saturating_sub(self.tail_reserved);
        let limit = if self.streaming() {
            limit.saturating_sub(TRAILER_RESERVE)
        } else {
            limit
        };
        limit.saturating_sub(self.used)
    }

    /// Carve `bytes` off the end of the buffer for scratch state that must
    /// share the capture's memory budget.
    pub fn reserve_tail(&mut self, bytes: usize) -> Result<(), KcdataError> {
        self.check()?;
        if self.remaining() < bytes {
            return Err(KcdataError::BufferFull);
        }
        self.tail_reserved += bytes;
        Ok(())
    }

    pub fn depth(&self) -> usize {
        self.containers.len()
    }

    /// Append one record.
    pub fn push(&mut self, rec: &Record) -> Result<(), KcdataError> {
        self.push_patchable(rec).map(|_| ())
    }

    /// Append one record and return the offset of its payload when it was
    /// written directly into the buffer (not through the compressor).
    pub fn push_patchable(&mut self, rec: &Record) -> Result<Option<usize>, KcdataError> {
        self.check()?;
        self.settle()?;
        let (payload, offset) = match rec.shape() {
            Shape::Single { kind, len } => {
                let pad = padded_len(len) - len;
                self.reserve_item(kind, pad as u64, len)?
            }
            Shape::Array {
                elem_kind,
                elem_size,
                count,
            } => self.reserve_array(elem_kind, elem_size, count)?,
        };
        rec.encode_payload(payload);
        Ok(offset)
    }

    pub fn begin_container(&mut self, kind: u32, id: u64) -> Result<(), KcdataError> {
        self.check()?;
        if self.containers.len() >= self.max_depth {
            return Err(KcdataError::NestingTooDeep {
                depth: self.max_depth,
            });
        }
        self.settle()?;
        let (payload, _) = self.reserve_item(TYPE_CONTAINER_BEGIN, id, 4)?;
        payload.copy_from_slice(&kind.to_le_bytes());
        self.containers.push((kind, id));
        Ok(())
    }

    pub fn end_container(&mut self, kind: u32, id: u64) -> Result<(), KcdataError> {
        self.check()?;
        if self.containers.last() != Some(&(kind, id)) {
            self.poison(KcdataError::UnbalancedContainer);
            return Err(KcdataError::UnbalancedContainer);
        }
        self.settle()?;
        let (payload, _) = self.reserve_item(TYPE_CONTAINER_END, id, 4)?;
        payload.copy_from_slice(&kind.to_le_bytes());
        self.containers.pop();
        Ok(())
    }

    /// Run `f` inside a container. If `f` fails the container can no
    /// longer be closed and the buffer is poisoned.
    pub fn with_container<T, E, F>(&mut self, kind: u32, id: u64, f: F) -> Result<T, E>
    where
        E: From<KcdataError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.begin_container(kind, id)?;
        match f(self) {
            Ok(v) => {
                self.end_container(kind, id)?;
                Ok(v)
            }
            Err(err) => {
                self.abandon_container(kind, id);
                Err(err)
            }
        }
    }

    /// Give up on an open container after a failure inside it. The buffer
    /// is poisoned: a container without its end marker cannot be trusted.
    pub fn abandon_container(&mut self, kind: u32, id: u64) {
        if self.containers.last() == Some(&(kind, id)) {
            self.containers.pop();
        }
        self.poison(KcdataError::UnbalancedContainer);
    }

    /// Drop the innermost window without flushing it.
    pub fn abandon_window(&mut self) {
        self.windows = self.windows.saturating_sub(1);
    }

    pub fn open_compression_window(&mut self) -> Result<(), KcdataError> {
        self.check()?;
        self.settle()?;
        self.windows += 1;
        Ok(())
    }

    /// Close the innermost window, flushing what it staged. Closing a window
    /// with nothing staged writes nothing.
    pub fn close_compression_window(&mut self) -> Result<(), KcdataError> {
        self.check()?;
        if self.windows == 0 {
            return Err(KcdataError::WindowNotOpen);
        }
        self.windows -= 1;
        self.settle()
    }

    pub fn with_compression_window<T, E, F>(&mut self, f: F) -> Result<T, E>
    where
        E: From<KcdataError>,
        F: FnOnce(&mut Self) -> Result<T, E>,
    {
        self.open_compression_window()?;
        match f(self) {
            Ok(v) => {
                self.close_compression_window()?;
                Ok(v)
            }
            Err(err) => {
                self.abandon_window();
                Err(err)
            }
        }
    }

    /// Reserve an array of `count` `T`s and hand back a cursor into it.
    pub fn array_slot<T: KcStruct>(
        &mut self,
        elem_kind: u32,
        count: usize,
    ) -> Result<ArraySlot<'_, T>, KcdataError> {
        self.check()?;
        self.settle()?;
        let (bytes, _) = self.reserve_array(elem_kind, T::SIZE, count)?;
        Ok(ArraySlot {
            bytes,
            _marker: PhantomData,
        })
    }

    /// End the compressed stream, if any. Items pushed afterwards are
    /// written uncompressed.
    pub fn finish_compression(&mut self) -> Result<(), KcdataError> {
        self.check()?;
        if !self.streaming() {
            return Ok(());
        }
        if self.windows != 0 {
            self.poison(KcdataError::UnbalancedContainer);
            return Err(KcdataError::UnbalancedContainer);
        }
        self.deflate_pending(true)?;

        let Some(deflate) = self.deflate.as_mut() else {
            return Ok(());
        };
        let total_out = deflate.stream.total_out();
        let total_in = deflate.stream.total_in();
        deflate.finished = true;
        let header = deflate.header_payload;
        self.used = deflate.stream_start + padded_len(total_out as usize);
        self.buf[header + 8..header + 16].copy_from_slice(&total_out.to_le_bytes());
        self.buf[header + 16..header + 24].copy_from_slice(&total_in.to_le_bytes());
        Ok(())
    }

    /// Close compression and append the end-of-buffer marker.
    pub fn finalize(&mut self) -> Result<Finalized, KcdataError> {
        self.check()?;
        if !self.containers.is_empty() || self.windows != 0 {
            self.poison(KcdataError::UnbalancedContainer);
            return Err(KcdataError::UnbalancedContainer);
        }
        self.finish_compression()?;
        self.reserve_item(BUFFER_END, 0, 0)?;
        Ok(Finalized {
            bytes_used: self.used,
            bytes_uncompressed: self.uncompressed_len(),
        })
    }

    /// Overwrite a u64 at a payload offset returned by
    /// [`push_patchable`](Self::push_patchable).
    pub fn patch_u64(&mut self, offset: usize, value: u64) -> bool {
        if offset + 8 > self.used {
            return false;
        }
        self.buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
        true
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    /// Hand back the written bytes.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.buf.truncate(self.used);
        self.buf
    }

    fn uncompressed_len(&self) -> usize {
        match &self.deflate {
            Some(d) => {
                let stream = padded_len(d.stream.total_out() as usize);
                self.used - stream + d.stream.total_in() as usize
            }
            None => self.used,
        }
    }

    fn streaming(&self) -> bool {
        self.deflate.as_ref().is_some_and(|d| !d.finished)
    }

    fn check(&self) -> Result<(), KcdataError> {
        match self.poisoned {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn poison(&mut self, err: KcdataError) {
        if self.poisoned.is_none() {
            self.poisoned = Some(err);
        }
    }

    /// Flush staged bytes when no window is open.
    fn settle(&mut self) -> Result<(), KcdataError> {
        let idle = self.windows == 0
            && self
                .deflate
                .as_ref()
                .is_some_and(|d| !d.finished && !d.pending.is_empty());
        if idle {
            self.deflate_pending(false)?;
        }
        Ok(())
    }

    fn reserve_array(
        &mut self,
        elem_kind: u32,
        elem_size: usize,
        count: usize,
    ) -> Result<(&mut [u8], Option<usize>), KcdataError> {
        let len = elem_size * count;
        let pad = (padded_len(len) - len) as u32;
        let flags = ((elem_kind as u64) << 32) | (count as u64 & 0xffff_ffff);
        self.reserve_item(TYPE_ARRAY_PAD0 + pad, flags, len)
    }

    /// Lay down a header and return the zeroed payload region.
    fn reserve_item(
        &mut self,
        kind: u32,
        flags: u64,
        payload_len: usize,
    ) -> Result<(&mut [u8], Option<usize>), KcdataError> {
        let size = padded_len(payload_len);
        let total = ITEM_HEADER_SIZE + size;
        let header = ItemHeader {
            kind,
            size: size as u32,
            flags,
        };

        if self.streaming() {
            return self.reserve_pending(header, total, payload_len);
        }

        let limit = self.buf.len().saturating_sub(self.tail_reserved);
        if self.used + total > limit {
            return Err(KcdataError::BufferFull);
        }
        let start = self.used;
        self.used += total;
        header.encode(&mut self.buf[start..start + ITEM_HEADER_SIZE]);
        let payload_start = start + ITEM_HEADER_SIZE;
        Ok((
            &mut self.buf[payload_start..payload_start + payload_len],
            Some(payload_start),
        ))
    }

    fn reserve_pending(
        &mut self,
        header: ItemHeader,
        total: usize,
        payload_len: usize,
    ) -> Result<(&mut [u8], Option<usize>), KcdataError> {
        let capacity = self.buf.len();
        let Some(deflate) = self.deflate.as_mut() else {
            return Err(KcdataError::Poisoned);
        };
        let start = deflate.pending.len();
        if start + total > capacity {
            return Err(KcdataError::BufferFull);
        }
        deflate.pending.resize(start + total, 0);
        header.encode(&mut deflate.pending[start..start + ITEM_HEADER_SIZE]);
        let payload_start = start + ITEM_HEADER_SIZE;
        Ok((
            &mut deflate.pending[payload_start..payload_start + payload_len],
            None,
        ))
    }

    fn deflate_pending(&mut self, finish: bool) -> Result<(), KcdataError> {
        let limit = self
            .buf
            .len()
            .saturating_sub(self.tail_reserved)
            .saturating_sub(TRAILER_RESERVE);
        let Some(deflate) = self.deflate.as_mut() else {
            return Ok(());
        };
        let mut input = std::mem::take(&mut deflate.pending);
        let flush = if finish {
            FlushCompress::Finish
        } else {
            FlushCompress::None
        };

        let mut consumed = 0usize;
        loop {
            if self.used >= limit {
                self.poisoned.get_or_insert(KcdataError::BufferFull);
                return Err(KcdataError::BufferFull);
            }
            let before_in = deflate.stream.total_in();
            let before_out = deflate.stream.total_out();
            let status = match deflate.stream.compress(
                &input[consumed..],
                &mut self.buf[self.used..limit],
                flush,
            ) {
                Ok(status) => status,
                Err(_) => {
                    self.poisoned.get_or_insert(KcdataError::Compression);
                    return Err(KcdataError::Compression);
                }
            };
            let read = (deflate.stream.total_in() - before_in) as usize;
            let wrote = (deflate.stream.total_out() - before_out) as usize;
            consumed += read;
            self.used += wrote;

            if status == ZStatus::StreamEnd {
                break;
            }
            if !finish && consumed == input.len() && self.used < limit {
                break;
            }
            if read == 0 && wrote == 0 && self.used < limit {
                self.poisoned.get_or_insert(KcdataError::Compression);
                return Err(KcdataError::Compression);
            }
        }

        input.clear();
        deflate.pending = input;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CaptureError;
    use crate::kcdata::reader::parse;
    use crate::kcdata::types::*;
    use crate::records::{CpuTimes, WaitInfo};

    fn writer(capacity: usize, compress: bool) -> KcdataWriter {
        KcdataWriter::new(
            capacity,
            BUFFER_BEGIN_STACKSHOT,
            WriterOptions {
                compress,
                max_depth: 4,
            },
        )
        .unwrap()
    }

    #[test]
    fn test_unallocatable_capacity_is_no_memory() {
        let capacity = usize::MAX / 2 + 1;
        let err =
            KcdataWriter::new(capacity, BUFFER_BEGIN_STACKSHOT, WriterOptions::default()).err();
        assert_eq!(err, Some(KcdataError::NoMemory { bytes: capacity }));
        assert_eq!(
            CaptureError::from(KcdataError::NoMemory { bytes: capacity }),
            CaptureError::NoMemory { bytes: capacity }
        );
    }

    #[test]
    fn test_containers_balance() {
        let mut w = writer(4096, false);
        w.begin_container(STACKSHOT_CONTAINER_TASK, 7).unwrap();
        w.begin_container(STACKSHOT_CONTAINER_THREAD, 8).unwrap();
        assert_eq!(
            w.end_container(STACKSHOT_CONTAINER_TASK, 7),
            Err(KcdataError::UnbalancedContainer)
        );
        // Once poisoned, nothing else goes through.
        assert_eq!(w.finalize(), Err(KcdataError::UnbalancedContainer));
    }

    #[test]
    fn test_finalize_rejects_open_container() {
        let mut w = writer(4096, false);
        w.begin_container(STACKSHOT_CONTAINER_TASK, 1).unwrap();
        assert_eq!(w.finalize(), Err(KcdataError::UnbalancedContainer));
    }

    #[test]
    fn test_nesting_limit() {
        let mut w = writer(4096, false);
        for i in 0..4 {
            w.begin_container(STACKSHOT_CONTAINER_THREAD, i).unwrap();
        }
        assert_eq!(
            w.begin_container(STACKSHOT_CONTAINER_THREAD, 99),
            Err(KcdataError::NestingTooDeep { depth: 4 })
        );
    }

    #[test]
    fn test_buffer_full_is_exact_and_recoverable() {
        // begin marker (16) + one 8-byte record (32) + end marker (16)
        let mut w = writer(64, false);
        w.push(&Record::MachAbsoluteTime(1)).unwrap();
        assert_eq!(w.remaining(), 16);
        assert_eq!(
            w.push(&Record::MachAbsoluteTime(2)),
            Err(KcdataError::BufferFull)
        );
        let done = w.finalize().unwrap();
        assert_eq!(done.bytes_used, 64);
        assert_eq!(done.bytes_uncompressed, 64);
    }

    #[test]
    fn test_with_container_error_poisons() {
        let mut w = writer(4096, false);
        let res: Result<(), KcdataError> = w.with_container(STACKSHOT_CONTAINER_TASK, 3, |_| {
            Err(KcdataError::BufferFull)
        });
        assert_eq!(res, Err(KcdataError::BufferFull));
        assert!(w.finalize().is_err());
    }

    #[test]
    fn test_window_close_without_open() {
        let mut w = writer(4096, true);
        assert_eq!(
            w.close_compression_window(),
            Err(KcdataError::WindowNotOpen)
        );
    }

    #[test]
    fn test_empty_window_writes_nothing() {
        let mut w = writer(4096, false);
        let before = w.used();
        w.open_compression_window().unwrap();
        w.close_compression_window().unwrap();
        assert_eq!(w.used(), before);
    }

    #[test]
    fn test_array_slot_filled_in_place() {
        let mut w = writer(4096, false);
        {
            let mut slot = w
                .array_slot::<WaitInfo>(STACKSHOT_THREAD_WAITINFO, 2)
                .unwrap();
            assert_eq!(slot.len(), 2);
            assert!(slot.set(
                1,
                &WaitInfo {
                    owner: 5,
                    waiter: 6,
                    ..Default::default()
                }
            ));
            assert!(!slot.set(2, &WaitInfo::default()));
        }
        w.finalize().unwrap();
        let snap = parse(&w.into_bytes()).unwrap();
        match snap.nodes[0].record() {
            Some(Record::WaitInfo(infos)) => {
                assert_eq!(infos.len(), 2);
                assert_eq!(infos[0], WaitInfo::default());
                assert_eq!(infos[1].owner, 5);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reserve_tail_shrinks_capacity() {
        let mut w = writer(256, false);
        let before = w.remaining();
        w.reserve_tail(128).unwrap();
        assert_eq!(w.remaining(), before - 128);
        assert_eq!(w.reserve_tail(4096), Err(KcdataError::BufferFull));
    }

    #[test]
    fn test_compressed_buffer_decodes() {
        let mut w = writer(1 << 16, true);
        w.with_container(STACKSHOT_CONTAINER_TASK, 11, |w| {
            w.with_compression_window(|w| {
                for i in 0..50 {
                    w.push(&Record::CpuTimes(CpuTimes {
                        user_usec: i,
                        system_usec: i,
                        runnable_usec: 0,
                    }))?;
                }
                Ok::<(), KcdataError>(())
            })
        })
        .unwrap();
        w.finish_compression().unwrap();
        w.push(&Record::u64_desc("stackshot_out_flags", 1)).unwrap();
        let done = w.finalize().unwrap();
        assert!(done.bytes_uncompressed > done.bytes_used);

        let snap = parse(&w.into_bytes()).unwrap();
        assert!(snap.compressed);
        let tasks = snap.containers(STACKSHOT_CONTAINER_TASK);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].children().len(), 50);
        assert_eq!(snap.desc_u64("stackshot_out_flags"), Some(1));
    }

    #[test]
    fn test_compressed_overflow_is_buffer_full() {
        let mut w = writer(512, true);
        let mut result = Ok(());
        for i in 0..10_000u64 {
            // Incompressible-ish payload.
            let v = i.wrapping_mul(0x9e37_79b9_7f4a_7c15);
            result = w.push(&Record::MachAbsoluteTime(v));
            if result.is_err() {
                break;
            }
        }
        if result.is_ok() {
            result = w.finish_compression();
        }
        assert_eq!(result, Err(KcdataError::BufferFull));
    }
}
