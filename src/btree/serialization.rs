//! On-disk page layouts
//!
//! Leaf: `prev`, `next`, then per record `klen key vnum (vlen value)*`.
//! Node: `heir`, then per separator `child klen key`.
//! Every number is a [`varint`](crate::varint). Missing links are written as
//! `NODE_ID_MIN - 1`.
//!
//! Leaf decoding is forgiving: it keeps every complete record and drops a
//! truncated tail, which is what lets repair salvage damaged pages.

use super::error::{PageError, PageResult};
use super::node::{Index, LeafId, LeafPage, NodeId, NodePage, PageId, Record};
use super::NODE_ID_MIN;
use crate::varint;

/// Whether page compression is built in
pub const COMPRESSION_AVAILABLE: bool = cfg!(feature = "compression");

const NO_LINK: u32 = NODE_ID_MIN - 1;

struct PageReader<'a> {
    buf: &'a [u8],
}

impl<'a> PageReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.len()
    }

    fn read_num(&mut self) -> i64 {
        let (num, used) = varint::decode(self.buf);
        self.buf = &self.buf[used..];
        num
    }

    /// Take `len` bytes, or `None` when the length is negative or overruns
    fn take(&mut self, len: i64) -> Option<&'a [u8]> {
        let len = usize::try_from(len).ok()?;
        if len > self.buf.len() {
            return None;
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Some(head)
    }
}

fn put_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    varint::encode_into(bytes.len() as u32, buf);
    buf.extend_from_slice(bytes);
}

fn link_from_raw(raw: i64) -> Option<LeafId> {
    if raw >= NO_LINK as i64 {
        return None;
    }
    match PageId::from_raw(raw) {
        Some(PageId::Leaf(id)) => Some(id),
        _ => None,
    }
}

pub fn encode_leaf(leaf: &LeafPage) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::encode_into(leaf.prev.map_or(NO_LINK, LeafId::raw), &mut buf);
    varint::encode_into(leaf.next.map_or(NO_LINK, LeafId::raw), &mut buf);
    for record in &leaf.records {
        put_bytes(&mut buf, &record.key);
        varint::encode_into(record.value_count() as u32, &mut buf);
        for value in record.values() {
            put_bytes(&mut buf, value);
        }
    }
    buf
}

pub fn decode_leaf(id: LeafId, buf: &[u8]) -> LeafPage {
    let mut reader = PageReader::new(buf);
    let mut leaf = LeafPage::new(id, None, None);
    leaf.dirty = false;

    if reader.remaining() > 0 {
        leaf.prev = link_from_raw(reader.read_num());
    }
    if reader.remaining() > 0 {
        leaf.next = link_from_raw(reader.read_num());
    }

    while reader.remaining() > 0 {
        let klen = reader.read_num();
        let Some(key) = reader.take(klen) else {
            break;
        };
        let vnum = reader.read_num();
        if vnum < 1 || reader.remaining() == 0 {
            break;
        }

        let mut values = Vec::new();
        for _ in 0..vnum {
            if reader.remaining() == 0 {
                break;
            }
            let vlen = reader.read_num();
            let Some(value) = reader.take(vlen) else {
                break;
            };
            values.push(value.to_vec());
        }

        let mut values = values.into_iter();
        if let Some(first) = values.next() {
            leaf.records.push(Record {
                key: key.to_vec(),
                first,
                rest: values.collect(),
            });
        }
    }
    leaf
}

pub fn encode_node(node: &NodePage) -> Vec<u8> {
    let mut buf = Vec::new();
    varint::encode_into(node.heir.raw(), &mut buf);
    for index in &node.indices {
        varint::encode_into(index.child.raw(), &mut buf);
        put_bytes(&mut buf, &index.key);
    }
    buf
}

pub fn decode_node(id: NodeId, buf: &[u8]) -> PageResult<NodePage> {
    let corrupt = |msg: String| PageError::CorruptNode(id.raw(), msg);
    let mut reader = PageReader::new(buf);

    if reader.remaining() == 0 {
        return Err(corrupt("missing heir".into()));
    }
    let raw_heir = reader.read_num();
    let heir = PageId::from_raw(raw_heir).ok_or_else(|| corrupt(format!("invalid heir {raw_heir}")))?;

    let mut node = NodePage::new(id, heir);
    node.dirty = false;
    while reader.remaining() > 0 {
        let raw_child = reader.read_num();
        if reader.remaining() == 0 {
            break;
        }
        let klen = reader.read_num();
        let Some(key) = reader.take(klen) else {
            break;
        };
        let child = PageId::from_raw(raw_child).ok_or_else(|| corrupt(format!("invalid child {raw_child}")))?;
        node.indices.push(Index {
            child,
            key: key.to_vec(),
        });
    }
    Ok(node)
}

#[cfg(feature = "compression")]
pub fn compress(buf: &[u8]) -> PageResult<Vec<u8>> {
    snap::raw::Encoder::new()
        .compress_vec(buf)
        .map_err(|e| PageError::Compression(e.to_string()))
}

#[cfg(feature = "compression")]
pub fn decompress(page: PageId, buf: &[u8]) -> PageResult<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(buf)
        .map_err(|e| PageError::Decompression(page.raw(), e.to_string()))
}

#[cfg(not(feature = "compression"))]
pub fn compress(buf: &[u8]) -> PageResult<Vec<u8>> {
    Ok(buf.to_vec())
}

#[cfg(not(feature = "compression"))]
pub fn decompress(_page: PageId, buf: &[u8]) -> PageResult<Vec<u8>> {
    Ok(buf.to_vec())
}
