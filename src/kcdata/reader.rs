//! Decoding of kcdata buffers back into a tree of records.

use std::borrow::Cow;
use std::fmt;
use std::io::Read;

use flate2::read::ZlibDecoder;
use serde::Serialize;

use crate::kcdata::types::{
    type_name, BUFFER_BEGIN_COMPRESSED, BUFFER_BEGIN_DELTA_STACKSHOT, BUFFER_BEGIN_STACKSHOT,
    BUFFER_END, COMPRESS_ZLIB, TYPE_ARRAY_PAD0, TYPE_COMPRESS_HEADER, TYPE_CONTAINER_BEGIN,
    TYPE_CONTAINER_END,
};
use crate::kcdata::{padded_len, ItemHeader, ITEM_HEADER_SIZE};
use crate::records::Record;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    Truncated { offset: usize },
    BadBeginMarker { kind: u32 },
    Unbalanced { offset: usize },
    MissingTerminator,
    BadCompressHeader,
    Decompress(String),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Truncated { offset } => write!(f, "item at offset {} is truncated", offset),
            DecodeError::BadBeginMarker { kind } => {
                write!(f, "buffer does not start with a stackshot marker (0x{:x})", kind)
            }
            DecodeError::Unbalanced { offset } => {
                write!(f, "unbalanced container at offset {}", offset)
            }
            DecodeError::MissingTerminator => write!(f, "buffer has no end marker"),
            DecodeError::BadCompressHeader => write!(f, "malformed compression header"),
            DecodeError::Decompress(msg) => write!(f, "decompression failed: {}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// One raw item.
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    pub offset: usize,
    pub kind: u32,
    pub flags: u64,
    pub payload: &'a [u8],
}

impl<'a> Item<'a> {
    pub fn is_array(&self) -> bool {
        (TYPE_ARRAY_PAD0..TYPE_ARRAY_PAD0 + 0x10).contains(&self.kind)
    }

    /// Element type and count of an array item.
    pub fn array_info(&self) -> (u32, usize) {
        ((self.flags >> 32) as u32, (self.flags & 0xffff_ffff) as usize)
    }

    /// Payload without trailing alignment padding.
    pub fn data(&self) -> &'a [u8] {
        let pad = if self.is_array() {
            (self.kind - TYPE_ARRAY_PAD0) as usize
        } else if self.kind == TYPE_CONTAINER_BEGIN || self.kind == TYPE_CONTAINER_END {
            0
        } else {
            (self.flags & 0xf) as usize
        };
        &self.payload[..self.payload.len().saturating_sub(pad)]
    }

    pub fn record(&self) -> Option<Record> {
        if self.is_array() {
            let (elem, count) = self.array_info();
            Record::decode_array(elem, count, self.data())
        } else {
            Record::decode(self.kind, self.data())
        }
    }
}

/// Iterates items until the end marker or the end of input.
pub struct ItemIter<'a> {
    data: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> ItemIter<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            done: false,
        }
    }
}

impl<'a> Iterator for ItemIter<'a> {
    type Item = Result<Item<'a>, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.data.len() {
            return None;
        }
        let offset = self.pos;
        let header = match self
            .data
            .get(offset..offset + ITEM_HEADER_SIZE)
            .and_then(ItemHeader::decode)
        {
            Some(h) => h,
            None => {
                self.done = true;
                return Some(Err(DecodeError::Truncated { offset }));
            }
        };
        let start = offset + ITEM_HEADER_SIZE;
        let end = start + header.size as usize;
        let Some(payload) = self.data.get(start..end) else {
            self.done = true;
            return Some(Err(DecodeError::Truncated { offset }));
        };
        self.pos = start + padded_len(header.size as usize);
        if header.kind == BUFFER_END {
            self.done = true;
        }
        Some(Ok(Item {
            offset,
            kind: header.kind,
            flags: header.flags,
            payload,
        }))
    }
}

/// Inflate a compressed buffer into its plain equivalent. Plain buffers are
/// returned as-is.
pub fn decompress(buf: &[u8]) -> Result<Cow<'_, [u8]>, DecodeError> {
    let mut items = ItemIter::new(buf);
    match items.next() {
        Some(Ok(item)) if item.kind == BUFFER_BEGIN_COMPRESSED => {}
        Some(Err(e)) => return Err(e),
        _ => return Ok(Cow::Borrowed(buf)),
    }
    let header = match items.next() {
        Some(Ok(item)) if item.kind == TYPE_COMPRESS_HEADER && item.payload.len() >= 24 => item,
        Some(Err(e)) => return Err(e),
        _ => return Err(DecodeError::BadCompressHeader),
    };
    let field = |i: usize| {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header.payload[i * 8..i * 8 + 8]);
        u64::from_le_bytes(raw)
    };
    if field(0) != COMPRESS_ZLIB {
        return Err(DecodeError::BadCompressHeader);
    }
    let stream_start = header.offset + ITEM_HEADER_SIZE + header.payload.len();
    let truncated = DecodeError::Truncated {
        offset: stream_start,
    };
    let total_out = usize::try_from(field(1)).map_err(|_| truncated.clone())?;
    let total_in = field(2);

    let stream_end = stream_start
        .checked_add(total_out)
        .ok_or_else(|| truncated.clone())?;
    let stream = buf.get(stream_start..stream_end).ok_or(truncated)?;
    let trailer = stream_end
        .checked_add(padded_len(total_out) - total_out)
        .and_then(|start| buf.get(start..))
        .unwrap_or(&[]);

    // Never inflate more than one byte past the claimed size.
    let mut out = Vec::new();
    ZlibDecoder::new(stream)
        .take(total_in.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| DecodeError::Decompress(e.to_string()))?;
    if out.len() as u64 != total_in {
        return Err(DecodeError::Decompress(format!(
            "expected {} bytes, got {}",
            total_in,
            out.len()
        )));
    }
    out.extend_from_slice(trailer);
    Ok(Cow::Owned(out))
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Container {
        kind: u32,
        kind_name: &'static str,
        id: u64,
        children: Vec<Node>,
    },
    Item {
        kind: u32,
        kind_name: &'static str,
        record: Option<Record>,
    },
}

impl Node {
    pub fn record(&self) -> Option<&Record> {
        match self {
            Node::Item { record, .. } => record.as_ref(),
            Node::Container { .. } => None,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Node::Container { children, .. } => children,
            Node::Item { .. } => &[],
        }
    }

    pub fn id(&self) -> Option<u64> {
        match self {
            Node::Container { id, .. } => Some(*id),
            Node::Item { .. } => None,
        }
    }

    /// Records directly inside this container.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.children().iter().filter_map(Node::record)
    }
}

/// A decoded buffer.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub delta: bool,
    pub compressed: bool,
    pub nodes: Vec<Node>,
}

fn walk<'a>(nodes: &'a [Node], depth: usize, f: &mut dyn FnMut(usize, &'a Node)) {
    for node in nodes {
        f(depth, node);
        walk(node.children(), depth + 1, f);
    }
}

impl Snapshot {
    /// Every container of `kind`, in buffer order, at any depth.
    pub fn containers(&self, kind: u32) -> Vec<&Node> {
        let mut out = Vec::new();
        walk(&self.nodes, 0, &mut |_, node| {
            if let Node::Container { kind: k, .. } = node {
                if *k == kind {
                    out.push(node);
                }
            }
        });
        out
    }

    /// Every record at any depth.
    pub fn all_records(&self) -> Vec<&Record> {
        let mut out = Vec::new();
        walk(&self.nodes, 0, &mut |_, node| {
            if let Some(rec) = node.record() {
                out.push(rec);
            }
        });
        out
    }

    /// Top-level records.
    pub fn records(&self) -> impl Iterator<Item = &Record> {
        self.nodes.iter().filter_map(Node::record)
    }

    /// Value of a named top-level u64 descriptor.
    pub fn desc_u64(&self, name: &str) -> Option<u64> {
        self.records().find_map(|rec| match rec {
            Record::Uint64Desc { name: n, value } if n == name => Some(*value),
            _ => None,
        })
    }

    pub fn render_tree(&self) -> String {
        let mut out = String::new();
        out.push_str(if self.delta {
            "delta stackshot"
        } else {
            "stackshot"
        });
        if self.compressed {
            out.push_str(" (compressed)");
        }
        out.push('\n');
        walk(&self.nodes, 1, &mut |depth, node| {
            let indent = "  ".repeat(depth);
            match node {
                Node::Container { kind_name, id, .. } => {
                    out.push_str(&format!("{}{} [{}]\n", indent, kind_name, id));
                }
                Node::Item {
                    kind,
                    kind_name,
                    record,
                } => match record {
                    Some(rec) => out.push_str(&format!("{}{}: {:?}\n", indent, kind_name, rec)),
                    None => out.push_str(&format!("{}{} (0x{:x})\n", indent, kind_name, kind)),
                },
            }
        });
        out
    }
}

/// Decode a complete buffer, inflating it first if needed.
pub fn parse(buf: &[u8]) -> Result<Snapshot, DecodeError> {
    let data = decompress(buf)?;
    let compressed = matches!(data, Cow::Owned(_));
    let mut items = ItemIter::new(&data);

    let delta = match items.next() {
        Some(Ok(item)) if item.kind == BUFFER_BEGIN_STACKSHOT => false,
        Some(Ok(item)) if item.kind == BUFFER_BEGIN_DELTA_STACKSHOT => true,
        Some(Ok(item)) => return Err(DecodeError::BadBeginMarker { kind: item.kind }),
        Some(Err(e)) => return Err(e),
        None => return Err(DecodeError::Truncated { offset: 0 }),
    };

    let mut stack: Vec<(u32, u64, Vec<Node>)> = Vec::new();
    let mut nodes = Vec::new();
    let mut terminated = false;

    for item in items {
        let item = item?;
        let kind_of = |item: &Item<'_>| -> Result<u32, DecodeError> {
            let raw: [u8; 4] = item
                .payload
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .ok_or(DecodeError::Truncated {
                    offset: item.offset,
                })?;
            Ok(u32::from_le_bytes(raw))
        };
        match item.kind {
            BUFFER_END => {
                terminated = true;
                break;
            }
            TYPE_CONTAINER_BEGIN => {
                stack.push((kind_of(&item)?, item.flags, Vec::new()));
            }
            TYPE_CONTAINER_END => {
                let kind = kind_of(&item)?;
                let Some((open_kind, id, children)) = stack.pop() else {
                    return Err(DecodeError::Unbalanced {
                        offset: item.offset,
                    });
                };
                if open_kind != kind || id != item.flags {
                    return Err(DecodeError::Unbalanced {
                        offset: item.offset,
                    });
                }
                let node = Node::Container {
                    kind,
                    kind_name: type_name(kind),
                    id,
                    children,
                };
                match stack.last_mut() {
                    Some((_, _, parent)) => parent.push(node),
                    None => nodes.push(node),
                }
            }
            kind => {
                let node = Node::Item {
                    kind: if item.is_array() { item.array_info().0 } else { kind },
                    kind_name: type_name(if item.is_array() {
                        item.array_info().0
                    } else {
                        kind
                    }),
                    record: item.record(),
                };
                match stack.last_mut() {
                    Some((_, _, parent)) => parent.push(node),
                    None => nodes.push(node),
                }
            }
        }
    }

    if !stack.is_empty() {
        return Err(DecodeError::Unbalanced { offset: data.len() });
    }
    if !terminated {
        return Err(DecodeError::MissingTerminator);
    }
    Ok(Snapshot {
        delta,
        compressed,
        nodes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kcdata::writer::{KcdataWriter, WriterOptions};
    use crate::kcdata::types::*;

    fn sample(compress: bool) -> Vec<u8> {
        let mut w = KcdataWriter::new(
            8192,
            BUFFER_BEGIN_STACKSHOT,
            WriterOptions {
                compress,
                ..Default::default()
            },
        )
        .unwrap();
        w.push(&Record::OsVersion("Test OS 1.0".to_string())).unwrap();
        w.with_container(STACKSHOT_CONTAINER_TASK, 100, |w| {
            w.push(&Record::JetsamCoalitionId(4))?;
            w.with_container(STACKSHOT_CONTAINER_THREAD, 200, |w| {
                w.push(&Record::KernelStack(vec![0xffff_0000_1000, 0xffff_0000_2000]))
            })
        })
        .unwrap();
        w.finalize().unwrap();
        w.into_bytes()
    }

    /// A compressed buffer holding only its compress header.
    fn bare_compress_header(total_out: u64, total_in: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 64];
        ItemHeader {
            kind: BUFFER_BEGIN_COMPRESSED,
            size: 0,
            flags: 0,
        }
        .encode(&mut buf[..16]);
        ItemHeader {
            kind: TYPE_COMPRESS_HEADER,
            size: 24,
            flags: 0,
        }
        .encode(&mut buf[16..32]);
        buf[32..40].copy_from_slice(&COMPRESS_ZLIB.to_le_bytes());
        buf[40..48].copy_from_slice(&total_out.to_le_bytes());
        buf[48..56].copy_from_slice(&total_in.to_le_bytes());
        buf
    }

    #[test]
    fn test_bogus_compress_sizes_are_errors() {
        let buf = bare_compress_header(u64::MAX - 8, 0);
        assert!(matches!(
            decompress(&buf),
            Err(DecodeError::Truncated { .. })
        ));

        let buf = bare_compress_header(8, u64::MAX - 8);
        assert!(decompress(&buf).is_err());
        assert!(parse(&buf).is_err());

        // A real stream whose header overstates the inflated size.
        let mut buf = sample(true);
        buf[48..56].copy_from_slice(&(u64::MAX - 8).to_le_bytes());
        assert!(matches!(decompress(&buf), Err(DecodeError::Decompress(_))));
    }

    #[test]
    fn test_parse_builds_tree() {
        let snap = parse(&sample(false)).unwrap();
        assert!(!snap.delta);
        assert!(!snap.compressed);
        assert_eq!(snap.nodes.len(), 2);
        assert_eq!(
            snap.nodes[0].record(),
            Some(&Record::OsVersion("Test OS 1.0".to_string()))
        );
        let threads = snap.containers(STACKSHOT_CONTAINER_THREAD);
        assert_eq!(threads.len(), 1);
        assert_eq!(threads[0].id(), Some(200));
        assert_eq!(
            threads[0].records().next(),
            Some(&Record::KernelStack(vec![0xffff_0000_1000, 0xffff_0000_2000]))
        );
    }

    #[test]
    fn test_compressed_matches_plain() {
        let plain = parse(&sample(false)).unwrap();
        let packed = parse(&sample(true)).unwrap();
        assert!(packed.compressed);
        assert_eq!(plain.all_records(), packed.all_records());
    }

    #[test]
    fn test_missing_terminator() {
        let mut bytes = sample(false);
        bytes.truncate(bytes.len() - ITEM_HEADER_SIZE);
        assert_eq!(parse(&bytes).unwrap_err(), DecodeError::MissingTerminator);
    }

    #[test]
    fn test_truncated_item() {
        let bytes = sample(false);
        let cut = &bytes[..bytes.len() - ITEM_HEADER_SIZE - 4];
        assert!(matches!(
            parse(cut).unwrap_err(),
            DecodeError::Truncated { .. } | DecodeError::Unbalanced { .. }
        ));
    }

    #[test]
    fn test_bad_begin_marker() {
        let mut bytes = sample(false);
        bytes[..4].copy_from_slice(&0x1234u32.to_le_bytes());
        assert_eq!(
            parse(&bytes).unwrap_err(),
            DecodeError::BadBeginMarker { kind: 0x1234 }
        );
    }

    #[test]
    fn test_unknown_items_are_skipped() {
        let mut w =
            KcdataWriter::new(1024, BUFFER_BEGIN_STACKSHOT, WriterOptions::default()).unwrap();
        w.push(&Record::MachAbsoluteTime(5)).unwrap();
        w.finalize().unwrap();
        let mut bytes = w.into_bytes();
        // Retag the record as something unknown.
        bytes[16..20].copy_from_slice(&0x7777u32.to_le_bytes());
        let snap = parse(&bytes).unwrap();
        assert_eq!(snap.nodes.len(), 1);
        assert!(snap.nodes[0].record().is_none());
    }
}
