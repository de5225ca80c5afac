//! B-tree pages and their on-disk format.
//!
//! Pages are immutable once installed under a map root; a mutation copies
//! the page and every ancestor up to the root. Copies share unchanged
//! children with the originals through [`PageRef`], so retained old roots
//! form a DAG over the same page objects. The on-disk position of a page is
//! assigned exactly once, when the page is serialized into a chunk.

use std::io::{Cursor, Read};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, ReadBytesExt};
use bytes::{BufMut, BytesMut};

use crate::codec::fletcher::check16;
use crate::codec::types::{DataType, Value};
use crate::codec::{read_varint, write_varint, Compressor};
use crate::error::{CResult, Error};
use crate::storage::{encode_pos, pos_chunk_id, pos_offset, PAGE_TYPE_LEAF, PAGE_TYPE_NODE};

const TYPE_BIT_NODE: u8 = 1;
const TYPE_BIT_COMPRESSED: u8 = 2;

/// A reference from an interior page to one child: the child's on-disk
/// position (0 while unsaved), the number of entries below it, and the
/// decoded child when it is in memory.
pub struct PageRef {
    pos: AtomicU64,
    count: u64,
    cached: Mutex<Option<Arc<Page>>>,
}

impl PageRef {
    pub fn new(page: Arc<Page>) -> Self {
        Self {
            pos: AtomicU64::new(page.pos()),
            count: page.total_count(),
            cached: Mutex::new(Some(page)),
        }
    }

    pub fn from_pos(pos: u64, count: u64) -> Self {
        Self { pos: AtomicU64::new(pos), count, cached: Mutex::new(None) }
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn cached(&self) -> Option<Arc<Page>> {
        self.cached.lock().unwrap().clone()
    }

    pub fn set_cached(&self, page: Arc<Page>) {
        *self.cached.lock().unwrap() = Some(page);
    }

    fn duplicate(&self) -> Self {
        Self {
            pos: AtomicU64::new(self.pos()),
            count: self.count,
            cached: Mutex::new(self.cached.lock().unwrap().clone()),
        }
    }
}

pub enum PageContent {
    Leaf { values: Vec<Value> },
    Node { children: Vec<PageRef> },
}

pub struct Page {
    map_id: u32,
    version: u64,
    pos: AtomicU64,
    memory: usize,
    keys: Vec<Value>,
    content: PageContent,
}

impl Page {
    pub fn new_leaf(map_id: u32, version: u64, keys: Vec<Value>, values: Vec<Value>) -> Self {
        debug_assert_eq!(keys.len(), values.len());
        let memory = 128
            + keys.iter().map(Value::memory).sum::<usize>()
            + values.iter().map(Value::memory).sum::<usize>();
        Self {
            map_id,
            version,
            pos: AtomicU64::new(0),
            memory,
            keys,
            content: PageContent::Leaf { values },
        }
    }

    pub fn new_node(map_id: u32, version: u64, keys: Vec<Value>, children: Vec<PageRef>) -> Self {
        debug_assert_eq!(keys.len() + 1, children.len());
        let memory =
            128 + keys.iter().map(Value::memory).sum::<usize>() + children.len() * 80;
        Self {
            map_id,
            version,
            pos: AtomicU64::new(0),
            memory,
            keys,
            content: PageContent::Node { children },
        }
    }

    pub fn empty_leaf(map_id: u32, version: u64) -> Self {
        Self::new_leaf(map_id, version, Vec::new(), Vec::new())
    }

    pub fn map_id(&self) -> u32 {
        self.map_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    pub fn set_pos(&self, pos: u64) {
        self.pos.store(pos, Ordering::Release);
    }

    pub fn is_saved(&self) -> bool {
        self.pos() != 0
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self.content, PageContent::Leaf { .. })
    }

    pub fn memory(&self) -> usize {
        self.memory
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }

    pub fn keys(&self) -> &[Value] {
        &self.keys
    }

    pub fn key(&self, i: usize) -> &Value {
        &self.keys[i]
    }

    pub fn values(&self) -> &[Value] {
        match &self.content {
            PageContent::Leaf { values } => values,
            PageContent::Node { .. } => panic!("values of an interior page"),
        }
    }

    pub fn children(&self) -> &[PageRef] {
        match &self.content {
            PageContent::Node { children } => children,
            PageContent::Leaf { .. } => panic!("children of a leaf page"),
        }
    }

    /// Number of entries stored below this page.
    pub fn total_count(&self) -> u64 {
        match &self.content {
            PageContent::Leaf { values } => values.len() as u64,
            PageContent::Node { children } => children.iter().map(PageRef::count).sum(),
        }
    }

    /// A mutable copy at the given version, sharing children with `self`.
    pub fn copy(&self, version: u64) -> Page {
        match &self.content {
            PageContent::Leaf { values } => {
                Page::new_leaf(self.map_id, version, self.keys.clone(), values.clone())
            }
            PageContent::Node { children } => Page::new_node(
                self.map_id,
                version,
                self.keys.clone(),
                children.iter().map(PageRef::duplicate).collect(),
            ),
        }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("map_id", &self.map_id)
            .field("version", &self.version)
            .field("pos", &self.pos())
            .field("leaf", &self.is_leaf())
            .field("keys", &self.keys.len())
            .finish()
    }
}

/// Running totals for the pages serialized into one chunk.
#[derive(Default, Debug, Clone, Copy)]
pub struct WriteStats {
    pub page_count: u32,
    pub max_len: u64,
}

/// Serializes `page` and all of its unsaved descendants into `buf`
/// (children first, so parents know child positions). `buf` is the chunk
/// body; offsets are measured from the chunk start. Assigns and returns
/// the page's position.
pub fn write_page_tree(
    page: &Arc<Page>,
    chunk_id: u32,
    buf: &mut BytesMut,
    key_type: &dyn DataType,
    value_type: &dyn DataType,
    compressor: Option<&dyn Compressor>,
    stats: &mut WriteStats,
) -> CResult<u64> {
    if page.is_saved() {
        return Ok(page.pos());
    }
    if let PageContent::Node { children } = &page.content {
        for child in children {
            if child.pos() == 0 {
                let cached = child.cached().ok_or_else(|| {
                    Error::Internal("unsaved child page not in memory".to_string())
                })?;
                let pos = write_page_tree(
                    &cached, chunk_id, buf, key_type, value_type, compressor, stats,
                )?;
                child.set_pos(pos);
            }
        }
    }
    write_one_page(page, chunk_id, buf, key_type, value_type, compressor, stats)
}

fn write_one_page(
    page: &Arc<Page>,
    chunk_id: u32,
    buf: &mut BytesMut,
    key_type: &dyn DataType,
    value_type: &dyn DataType,
    compressor: Option<&dyn Compressor>,
    stats: &mut WriteStats,
) -> CResult<u64> {
    let offset = buf.len() as u32;

    let mut body = BytesMut::new();
    for k in page.keys() {
        key_type.write(&mut body, k)?;
    }
    match &page.content {
        PageContent::Leaf { values } => {
            for v in values {
                value_type.write(&mut body, v)?;
            }
        }
        PageContent::Node { children } => {
            for c in children {
                body.put_i64(c.pos() as i64);
            }
            for c in children {
                write_varint(&mut body, c.count());
            }
        }
    }

    let mut page_type = if page.is_leaf() { 0 } else { TYPE_BIT_NODE };
    let mut compressed: Option<Vec<u8>> = None;
    if let Some(comp) = compressor {
        if let Some(c) = comp.compress(&body) {
            if c.len() + 4 < body.len() {
                page_type |= TYPE_BIT_COMPRESSED;
                compressed = Some(c);
            }
        }
    }

    let mut head = BytesMut::new();
    write_varint(&mut head, page.map_id() as u64);
    write_varint(&mut head, page.key_count() as u64);
    head.put_u8(page_type);
    if let Some(c) = &compressed {
        write_varint(&mut head, body.len() as u64);
        head.put_slice(c);
    } else {
        head.put_slice(&body);
    }

    let len = (head.len() + 6) as u32;
    let check = check16(chunk_id ^ offset ^ len);
    buf.put_i32(len as i32);
    buf.put_u16(check);
    buf.put_slice(&head);

    let pos = encode_pos(
        chunk_id,
        offset,
        len,
        if page.is_leaf() { PAGE_TYPE_LEAF } else { PAGE_TYPE_NODE },
    );
    page.set_pos(pos);
    stats.page_count += 1;
    stats.max_len += crate::storage::pos_max_length(pos) as u64;
    Ok(pos)
}

/// The total serialized length of the page starting at `data`, read from
/// the length prefix. Used to decide whether a speculative short read got
/// the whole page.
pub fn stored_page_length(data: &[u8]) -> CResult<usize> {
    if data.len() < 4 {
        return Err(Error::FileCorrupt("page shorter than its length field".to_string()));
    }
    let len = i32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    if len < 6 {
        return Err(Error::FileCorrupt(format!("bad page length {}", len)));
    }
    Ok(len as usize)
}

/// Decodes one page from `data` (which must hold the full serialized page).
pub fn read_page(
    data: &[u8],
    pos: u64,
    key_type: &dyn DataType,
    value_type: &dyn DataType,
    compressor: Option<&dyn Compressor>,
) -> CResult<Page> {
    let len = stored_page_length(data)?;
    if data.len() < len {
        return Err(Error::FileCorrupt(format!(
            "page truncated: need {}, have {}",
            len,
            data.len()
        )));
    }
    let corrupt = |e: std::io::Error| Error::FileCorrupt(format!("truncated page: {}", e));
    let mut cur = Cursor::new(&data[..len]);
    let _ = cur.read_i32::<BigEndian>().map_err(corrupt)?;
    let check = cur.read_u16::<BigEndian>().map_err(corrupt)?;
    let expected = check16(pos_chunk_id(pos) ^ pos_offset(pos) ^ len as u32);
    if check != expected {
        return Err(Error::FileCorrupt(format!(
            "page check mismatch at position {:x}",
            pos
        )));
    }
    let map_id = read_varint(&mut cur)? as u32;
    let entries = read_varint(&mut cur)? as usize;
    let mut type_byte = [0u8; 1];
    cur.read_exact(&mut type_byte).map_err(corrupt)?;
    let is_node = type_byte[0] & TYPE_BIT_NODE != 0;

    let body_vec: Vec<u8>;
    let mut body: Cursor<&[u8]> = if type_byte[0] & TYPE_BIT_COMPRESSED != 0 {
        let comp = compressor.ok_or_else(|| {
            Error::UnsupportedFormat("compressed page but no compressor installed".to_string())
        })?;
        let expanded_len = read_varint(&mut cur)? as usize;
        let at = cur.position() as usize;
        body_vec = comp.expand(&data[at..len], expanded_len)?;
        Cursor::new(&body_vec)
    } else {
        let at = cur.position() as usize;
        body_vec = data[at..len].to_vec();
        Cursor::new(&body_vec)
    };

    let mut keys = Vec::with_capacity(entries);
    for _ in 0..entries {
        keys.push(key_type.read_dyn(&mut body)?);
    }
    let page = if is_node {
        let mut positions = Vec::with_capacity(entries + 1);
        for _ in 0..=entries {
            positions.push(
                body.read_i64::<BigEndian>()
                    .map_err(|e| Error::FileCorrupt(format!("truncated page: {}", e)))?
                    as u64,
            );
        }
        let mut children = Vec::with_capacity(entries + 1);
        for child_pos in positions {
            let count = read_varint(&mut body)?;
            children.push(PageRef::from_pos(child_pos, count));
        }
        Page::new_node(map_id, 0, keys, children)
    } else {
        let mut values = Vec::with_capacity(entries);
        for _ in 0..entries {
            values.push(value_type.read_dyn(&mut body)?);
        }
        Page::new_leaf(map_id, 0, keys, values)
    };
    page.set_pos(pos);
    Ok(page)
}
