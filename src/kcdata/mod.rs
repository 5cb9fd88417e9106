//! Self-describing tagged buffer format.
//!
//! A kcdata buffer is a flat sequence of items. Each item is a 16-byte
//! little-endian header followed by a payload padded to 16 bytes:
//!
//! ```text
//! +----------+----------+-------------------+----------------------+
//! | type u32 | size u32 | flags u64         | payload (size bytes) |
//! +----------+----------+-------------------+----------------------+
//! ```
//!
//! Containers are bracketed by `CONTAINER_BEGIN`/`CONTAINER_END` items whose
//! payload is the container kind and whose flags carry a 64-bit identity, so
//! a reader can rebuild the tree without any pointers.
//!
//! # Example
//!
//! ```
//! use stackshot::kcdata::{types, KcdataWriter, WriterOptions};
//! use stackshot::records::Record;
//!
//! let mut writer = KcdataWriter::new(4096, types::BUFFER_BEGIN_STACKSHOT, WriterOptions::default())?;
//! writer.with_container(types::STACKSHOT_CONTAINER_TASK, 42, |w| {
//!     w.push(&Record::JetsamCoalitionId(7))
//! })?;
//! let done = writer.finalize()?;
//! assert!(done.bytes_used > 0);
//! # Ok::<(), stackshot::error::KcdataError>(())
//! ```

pub mod reader;
pub mod types;
pub mod writer;

pub use reader::{parse, DecodeError, Item, ItemIter, Node, Snapshot};
pub use writer::{ArraySlot, Finalized, KcdataWriter, WriterOptions};

/// Size of every item header.
pub const ITEM_HEADER_SIZE: usize = 16;
/// Alignment of every item.
pub const ITEM_ALIGN: usize = 16;

/// Round `len` up to the item alignment.
pub fn padded_len(len: usize) -> usize {
    (len + ITEM_ALIGN - 1) & !(ITEM_ALIGN - 1)
}

/// Header preceding every item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHeader {
    pub kind: u32,
    pub size: u32,
    pub flags: u64,
}

impl ItemHeader {
    pub fn encode(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        w.u32(self.kind);
        w.u32(self.size);
        w.u64(self.flags);
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut r = FieldReader::new(bytes);
        Some(Self {
            kind: r.u32()?,
            size: r.u32()?,
            flags: r.u64()?,
        })
    }
}

/// Fixed-layout little-endian payload.
///
/// `SIZE` is the unpadded encoded length; `encode` is handed a slice of
/// exactly that length.
pub trait KcStruct: Sized {
    const SIZE: usize;

    fn encode(&self, w: &mut FieldWriter<'_>);

    fn decode(r: &mut FieldReader<'_>) -> Option<Self>;

    fn encode_to(&self, out: &mut [u8]) {
        let mut w = FieldWriter::new(out);
        self.encode(&mut w);
    }

    fn decode_from(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::SIZE {
            return None;
        }
        Self::decode(&mut FieldReader::new(&bytes[..Self::SIZE]))
    }
}

/// Sequential little-endian writer over a fixed slice. Writes past the end
/// are dropped.
pub struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn bytes(&mut self, src: &[u8]) {
        let end = self.pos + src.len();
        if let Some(dst) = self.buf.get_mut(self.pos..end) {
            dst.copy_from_slice(src);
        }
        self.pos = end;
    }

    pub fn u8(&mut self, v: u8) {
        self.bytes(&[v]);
    }

    pub fn u16(&mut self, v: u16) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn i16(&mut self, v: i16) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn i32(&mut self, v: i32) {
        self.bytes(&v.to_le_bytes());
    }

    pub fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    /// NUL-padded string in a `len`-byte field. Always leaves room for a
    /// terminator.
    pub fn fixed_str(&mut self, s: &str, len: usize) {
        let take = s.len().min(len.saturating_sub(1));
        let start = self.pos;
        self.bytes(&s.as_bytes()[..take]);
        self.pos = start + len;
    }

    pub fn position(&self) -> usize {
        self.pos
    }
}

/// Sequential little-endian reader over a slice.
pub struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let out = self.buf.get(self.pos..self.pos + len)?;
        self.pos += len;
        Some(out)
    }

    pub fn u8(&mut self) -> Option<u8> {
        Some(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Option<u16> {
        Some(u16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    pub fn i16(&mut self) -> Option<i16> {
        Some(i16::from_le_bytes(self.take(2)?.try_into().ok()?))
    }

    pub fn u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    pub fn i32(&mut self) -> Option<i32> {
        Some(i32::from_le_bytes(self.take(4)?.try_into().ok()?))
    }

    pub fn u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.take(8)?.try_into().ok()?))
    }

    pub fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    pub fn fixed_str(&mut self, len: usize) -> Option<String> {
        Some(c_string(self.take(len)?))
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }
}

/// Decode bytes up to the first NUL.
pub fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}
