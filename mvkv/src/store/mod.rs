//! The chunk store: the commit engine over the shared file.
//!
//! Committed snapshots are written as self-describing chunks. A chunk
//! carries the pages of every map changed since the previous store plus a
//! snapshot of the meta map, and ends in a checked footer. Two store
//! headers live in the first two blocks of the file; a third copy follows
//! the newest chunk when it was appended at the end, so recovery can find
//! the latest state by reading the last block. A new header is installed
//! only after its chunk is fully written, which makes commits atomic: a
//! torn write leaves the previous header pair pointing at the previous
//! committed version.

pub mod background;
pub mod chunk;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BytesMut;
use serde_derive::Serialize;

use crate::btree::map::{MvMap, RootRef};
use crate::btree::page::{read_page as decode_page, stored_page_length, write_page_tree, Page, WriteStats};
use crate::btree::PageStore;
use crate::codec::header::{
    format_checked, format_map, get_hex, parse_checked, parse_map, put_hex, HeaderMap,
};
use crate::codec::types::{data_type_by_name, DataType, StringType, Value};
use crate::codec::Compressor;
use crate::error::{CResult, Error};
use crate::storage::cache::LirsCache;
use crate::storage::crypt::cipher_for_password;
use crate::storage::file::FileStore;
use crate::storage::{
    pos_chunk_id, pos_max_length, pos_offset, BLOCK_SIZE, CHUNK_FOOTER_LENGTH, CHUNK_HEADER_AREA,
    FORMAT_READ, FORMAT_WRITE, MAX_HEADER_LENGTH,
};
use self::chunk::{Chunk, UNKNOWN};

pub const DEFAULT_CACHE_SIZE_MB: usize = 16;
pub const DEFAULT_WRITE_BUFFER_MB: usize = 4;
pub const DEFAULT_PAGE_SPLIT_SIZE: usize = 6 * 1024;
pub const DEFAULT_WRITE_DELAY_MS: u64 = 1000;
pub const DEFAULT_RETENTION_MS: u64 = 45_000;

/// Unsaved-page ceiling checked by the transaction layer after commits.
pub const MAX_UNSAVED_PAGES: u64 = 4096;

const META_MAP_ID: u32 = 0;
/// How many committed versions keep their roots in memory.
const VERSIONS_TO_RETAIN: u64 = 5;

pub type BackgroundExceptionHandler = Box<dyn Fn(&Error) + Send + Sync>;

fn now_millis() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// Builds and opens a [`Store`].
#[derive(Default)]
pub struct StoreBuilder {
    file_name: Option<PathBuf>,
    encryption_key: Option<Vec<u8>>,
    read_only: bool,
    cache_size_mb: Option<usize>,
    write_buffer_size_mb: Option<usize>,
    page_split_size: Option<usize>,
    write_delay_ms: Option<u64>,
    retention_time_ms: Option<u64>,
    reuse_space: Option<bool>,
    compressor: Option<Arc<dyn Compressor>>,
    background_exception_handler: Option<BackgroundExceptionHandler>,
    file_store: Option<FileStore>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn file_name(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_name = Some(path.into());
        self
    }

    /// The password used to derive the file cipher. The buffer is zeroed
    /// during key derivation.
    pub fn encryption_key(mut self, key: Vec<u8>) -> Self {
        self.encryption_key = Some(key);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn cache_size(mut self, mb: usize) -> Self {
        self.cache_size_mb = Some(mb);
        self
    }

    pub fn write_buffer_size(mut self, mb: usize) -> Self {
        self.write_buffer_size_mb = Some(mb);
        self
    }

    pub fn page_split_size(mut self, bytes: usize) -> Self {
        self.page_split_size = Some(bytes);
        self
    }

    /// Delay of the background writer in milliseconds; 0 disables it.
    pub fn write_delay(mut self, ms: u64) -> Self {
        self.write_delay_ms = Some(ms);
        self
    }

    pub fn retention_time(mut self, ms: u64) -> Self {
        self.retention_time_ms = Some(ms);
        self
    }

    /// When false, chunks are always appended at the end of the file.
    pub fn reuse_space(mut self, reuse: bool) -> Self {
        self.reuse_space = Some(reuse);
        self
    }

    pub fn compress_data(mut self, compressor: Arc<dyn Compressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    pub fn background_exception_handler(mut self, handler: BackgroundExceptionHandler) -> Self {
        self.background_exception_handler = Some(handler);
        self
    }

    /// Uses an already opened file backend instead of opening `file_name`.
    pub fn file_store(mut self, file_store: FileStore) -> Self {
        self.file_store = Some(file_store);
        self
    }

    pub fn open(self) -> CResult<Store> {
        let read_only = match &self.file_store {
            Some(fs) => fs.is_read_only(),
            None => self.read_only,
        };
        let file = match self.file_store {
            Some(fs) => fs,
            None => {
                let path = self
                    .file_name
                    .ok_or_else(|| Error::Internal("no file name configured".to_string()))?;
                let cipher = match self.encryption_key {
                    Some(key) => Some(cipher_for_password(key)?),
                    None => None,
                };
                FileStore::open(&path, self.read_only, cipher)?
            }
        };
        let cache_bytes = self.cache_size_mb.unwrap_or(DEFAULT_CACHE_SIZE_MB) * 1024 * 1024;
        let write_buffer =
            self.write_buffer_size_mb.unwrap_or(DEFAULT_WRITE_BUFFER_MB) * 1024 * 1024;
        let page_split = self.page_split_size.unwrap_or(DEFAULT_PAGE_SPLIT_SIZE);

        let inner = Arc::new_cyclic(|weak: &std::sync::Weak<StoreInner>| {
            let as_page_store: std::sync::Weak<dyn PageStore> = weak.clone();
            let meta = Arc::new(MvMap::new(
                as_page_store,
                META_MAP_ID,
                "meta".to_string(),
                0,
                Arc::new(StringType),
                Arc::new(StringType),
                false,
                RootRef { version: 0, page: Arc::new(Page::empty_leaf(META_MAP_ID, 0)) },
            ));
            StoreInner {
                self_weak: weak.clone(),
                file,
                cache: LirsCache::new(cache_bytes),
                compressor: self.compressor,
                page_split,
                retention_ms: self.retention_time_ms.unwrap_or(DEFAULT_RETENTION_MS),
                reuse_space: self.reuse_space.unwrap_or(true),
                read_only,
                unsaved_budget: (write_buffer / page_split.max(1)) as u64,
                creation_time: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                version: AtomicU64::new(0),
                last_committed: AtomicU64::new(0),
                last_stored: AtomicU64::new(0),
                last_chunk_id: AtomicU64::new(0),
                last_map_id: AtomicU64::new(0),
                last_store_time: AtomicU64::new(0),
                commit_lock: Mutex::new(()),
                chunks: RwLock::new(HashMap::new()),
                maps: RwLock::new(HashMap::new()),
                meta,
                freed: Mutex::new(BTreeMap::new()),
                unsaved_pages: AtomicU64::new(0),
            }
        });

        if inner.file.size() == 0 {
            if read_only {
                return Err(Error::FileCorrupt("empty store file".to_string()));
            }
            inner.init_new_file()?;
        } else {
            inner.recover()?;
        }

        // a temp chunk flushed before a crash carries this marker
        if let Some(v) = inner.meta.get(&Value::Text("rollbackOnOpen".to_string()))? {
            let v = u64::from_str_radix(v.as_text()?, 16)
                .map_err(|_| Error::FileCorrupt("bad rollbackOnOpen entry".to_string()))?;
            log::info!("rolling back to version {} on open", v);
            inner.rollback_to(v)?;
        }

        let write_delay = self.write_delay_ms.unwrap_or(DEFAULT_WRITE_DELAY_MS);
        let background = if write_delay > 0 && !read_only {
            Some(background::BackgroundWriter::start(
                inner.clone(),
                write_delay,
                self.background_exception_handler,
            ))
        } else {
            None
        };

        Ok(Store { inner, background: Mutex::new(background) })
    }
}

/// Aggregate store statistics.
#[derive(Clone, Debug, Serialize)]
pub struct Status {
    pub file_size: u64,
    pub fill_rate: u8,
    pub chunk_count: usize,
    pub current_version: u64,
    pub last_committed_version: u64,
    pub unsaved_pages: u64,
    pub cache_used_bytes: usize,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub file_reads: u64,
    pub file_writes: u64,
}

/// The public store handle. Dropping it closes the store, committing
/// pending changes.
pub struct Store {
    inner: Arc<StoreInner>,
    background: Mutex<Option<background::BackgroundWriter>>,
}

enum StoreMode {
    /// A durable commit of the current version.
    Commit,
    /// A background flush that may contain uncommitted data; marked so it
    /// is rolled back when the file is reopened.
    Temp,
}

pub(crate) struct StoreInner {
    self_weak: std::sync::Weak<StoreInner>,
    file: FileStore,
    cache: LirsCache<Arc<Page>>,
    compressor: Option<Arc<dyn Compressor>>,
    page_split: usize,
    retention_ms: u64,
    reuse_space: bool,
    read_only: bool,
    unsaved_budget: u64,
    creation_time: AtomicU64,
    closed: AtomicBool,
    /// The version new writes are stamped with.
    version: AtomicU64,
    last_committed: AtomicU64,
    last_stored: AtomicU64,
    last_chunk_id: AtomicU64,
    last_map_id: AtomicU64,
    /// Milliseconds since store creation of the last chunk write.
    last_store_time: AtomicU64,
    /// Serializes commits, compaction, rollback and meta writers.
    commit_lock: Mutex<()>,
    chunks: RwLock<HashMap<u32, Chunk>>,
    maps: RwLock<HashMap<u32, Arc<MvMap>>>,
    meta: Arc<MvMap>,
    /// version -> chunk id -> freed (max_len, pages) deltas.
    freed: Mutex<BTreeMap<u64, HashMap<u32, FreedDelta>>>,
    unsaved_pages: AtomicU64,
}

#[derive(Default, Clone, Copy)]
struct FreedDelta {
    max_len: u64,
    pages: u32,
}

impl StoreInner {
    // ---- header blocks ----------------------------------------------------

    fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("H".to_string(), "3".to_string());
        put_hex(&mut map, "blockSize", BLOCK_SIZE);
        put_hex(&mut map, "format", FORMAT_WRITE);
        put_hex(&mut map, "created", self.creation_time.load(Ordering::Acquire));
        put_hex(&mut map, "chunk", self.last_chunk_id.load(Ordering::Acquire));
        let root_block = self
            .chunks
            .read()
            .unwrap()
            .get(&(self.last_chunk_id.load(Ordering::Acquire) as u32))
            .map(|c| c.block)
            .unwrap_or(0);
        put_hex(&mut map, "rootChunk", root_block);
        put_hex(&mut map, "version", self.last_stored.load(Ordering::Acquire));
        put_hex(&mut map, "lastMapId", self.last_map_id.load(Ordering::Acquire));
        map
    }

    fn encode_header_block(&self) -> Vec<u8> {
        let line = format_checked(&self.header_map());
        let mut out = line.into_bytes();
        debug_assert!(out.len() < MAX_HEADER_LENGTH);
        out.push(b'\n');
        out.resize(BLOCK_SIZE as usize, 0);
        out
    }

    fn parse_header_block(data: &[u8]) -> CResult<HeaderMap> {
        let search = &data[..data.len().min(MAX_HEADER_LENGTH)];
        let end = search
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::FileCorrupt("unterminated store header".to_string()))?;
        let line = std::str::from_utf8(&data[..end])?.trim_end();
        let map = parse_checked(line)?;
        if map.get("H").map(String::as_str) != Some("3") {
            return Err(Error::FileCorrupt("bad store header magic".to_string()));
        }
        if get_hex(&map, "blockSize")? != BLOCK_SIZE {
            return Err(Error::FileCorrupt("unexpected block size".to_string()));
        }
        Ok(map)
    }

    fn write_primary_headers(&self) -> CResult<()> {
        let block = self.encode_header_block();
        self.file.write_fully(0, &block)?;
        self.file.write_fully(BLOCK_SIZE, &block)?;
        Ok(())
    }

    // ---- open paths -------------------------------------------------------

    fn init_new_file(&self) -> CResult<()> {
        self.creation_time.store(now_millis(), Ordering::Release);
        // version 0 is the committed empty state; writes start at 1
        self.version.store(1, Ordering::Release);
        self.write_primary_headers()
    }

    fn recover(&self) -> CResult<()> {
        let size = self.file.size();
        if size < 2 * BLOCK_SIZE {
            return Err(Error::FileCorrupt(format!("store file too short: {} bytes", size)));
        }

        // the primary headers decide whether the file is usable at all
        let mut best: Option<HeaderMap> = None;
        for pos in [0, BLOCK_SIZE] {
            let block = self.file.read_fully(pos, BLOCK_SIZE as usize)?;
            match Self::parse_header_block(&block) {
                Ok(map) => {
                    let chunk = get_hex(&map, "chunk")?;
                    let better = match &best {
                        None => true,
                        Some(b) => chunk > get_hex(b, "chunk")?,
                    };
                    if better {
                        best = Some(map);
                    }
                }
                Err(err) => log::warn!("store header at {} unusable: {}", pos, err),
            }
        }
        let mut header = best.ok_or_else(|| {
            Error::FileCorrupt("both store headers are corrupt".to_string())
        })?;

        let format = get_hex(&header, "format")?;
        if format > FORMAT_WRITE && !self.read_only {
            return Err(Error::UnsupportedFormat(format!(
                "file format {} is newer than supported {}",
                format, FORMAT_WRITE
            )));
        }
        if format > FORMAT_READ {
            return Err(Error::UnsupportedFormat(format!(
                "file format {} cannot be read",
                format
            )));
        }

        // a newer header may follow the newest chunk at the end of the file
        if size >= 3 * BLOCK_SIZE {
            let block = self.file.read_fully(size - BLOCK_SIZE, BLOCK_SIZE as usize)?;
            if let Ok(map) = Self::parse_header_block(&block) {
                if get_hex(&map, "chunk")? > get_hex(&header, "chunk")?
                    && self.verify_chunk_at(get_hex(&map, "rootChunk")?).is_ok()
                {
                    header = map;
                }
            }
        }

        self.creation_time.store(get_hex(&header, "created")?, Ordering::Release);
        self.last_map_id.store(get_hex(&header, "lastMapId")?, Ordering::Release);
        let last_chunk = get_hex(&header, "chunk")?;
        self.last_chunk_id.store(last_chunk, Ordering::Release);
        let stored_version = get_hex(&header, "version")?;
        self.version.store(stored_version + 1, Ordering::Release);
        self.last_committed.store(stored_version, Ordering::Release);
        self.last_stored.store(stored_version, Ordering::Release);

        if last_chunk == 0 {
            // a header pair without chunks: an empty store
            return Ok(());
        }

        let newest = self.read_chunk_header(get_hex(&header, "rootChunk")?)?;
        if newest.id as u64 != last_chunk {
            return Err(Error::FileCorrupt(format!(
                "root chunk id {} does not match header {}",
                newest.id, last_chunk
            )));
        }
        self.chunks.write().unwrap().insert(newest.id, newest.clone());

        // the meta map is readable now: chunk positions resolve through it
        let meta_root =
            self.read_page_typed(META_MAP_ID, newest.meta_root_pos, &self.meta)?;
        self.meta.reset_root(stored_version, meta_root);

        // rebuild the chunk table and mark every extent used
        let mut cursor_key = Value::Text("chunk.".to_string());
        let mut extents: Vec<(u64, u64)> = Vec::new();
        loop {
            let next = match self.meta.higher_key(&cursor_key)? {
                Some(k) => k,
                None => break,
            };
            let text = next.as_text()?.to_string();
            if !text.starts_with("chunk.") {
                break;
            }
            let line = self.meta.get(&next)?.ok_or_else(|| {
                Error::FileCorrupt(format!("meta entry vanished: {}", text))
            })?;
            let mut c = Chunk::from_line(line.as_text()?)?;
            if c.id == newest.id {
                c = newest.clone();
            } else if c.block == UNKNOWN {
                return Err(Error::FileCorrupt(format!(
                    "chunk {} has no file position",
                    c.id
                )));
            }
            extents.push((c.start(), c.length_bytes()));
            self.chunks.write().unwrap().insert(c.id, c);
            cursor_key = next;
        }
        for (start, len) in extents {
            self.file.mark_used(start, len);
        }
        Ok(())
    }

    /// Reads and validates the chunk whose header starts at `block`.
    fn read_chunk_header(&self, block: u64) -> CResult<Chunk> {
        let start = block * BLOCK_SIZE;
        let head = self.file.read_fully(start, CHUNK_HEADER_AREA)?;
        let mut c = Chunk::decode_header(&head)?;
        if c.block == UNKNOWN {
            c.block = block;
        }
        if c.block != block {
            return Err(Error::FileCorrupt(format!(
                "chunk {} header block {} found at {}",
                c.id, c.block, block
            )));
        }
        Ok(c)
    }

    /// Full verification of header and footer consistency at `block`.
    fn verify_chunk_at(&self, block: u64) -> CResult<Chunk> {
        let c = self.read_chunk_header(block)?;
        let footer_pos = c.start() + c.length_bytes() - CHUNK_FOOTER_LENGTH as u64;
        let footer = self.file.read_fully(footer_pos, CHUNK_FOOTER_LENGTH)?;
        let (id, fblock, version) = Chunk::decode_footer(&footer)?;
        if id != c.id || fblock != c.block || version != c.version {
            return Err(Error::FileCorrupt(format!(
                "chunk {} footer does not match its header",
                c.id
            )));
        }
        Ok(c)
    }

    // ---- page and chunk access --------------------------------------------

    fn page_store_weak(&self) -> std::sync::Weak<dyn PageStore> {
        let weak: std::sync::Weak<dyn PageStore> = self.self_weak.clone();
        weak
    }

    /// A detached read-only meta view rooted at an arbitrary stored root.
    fn meta_view(&self, version: u64, root: Arc<Page>) -> MvMap {
        MvMap::new(
            self.page_store_weak(),
            META_MAP_ID,
            "meta".to_string(),
            0,
            Arc::new(StringType),
            Arc::new(StringType),
            true,
            RootRef { version, page: root },
        )
    }

    fn chunk_for_id(&self, id: u32) -> CResult<Chunk> {
        if let Some(c) = self.chunks.read().unwrap().get(&id) {
            return Ok(c.clone());
        }
        // Resolving through the meta map terminates: the record of chunk N
        // is rewritten by the store of chunk N+1, so the lookup path only
        // needs chunks newer than N, and the newest chunk is pre-seeded.
        let line = self
            .meta
            .get(&Value::Text(Chunk::meta_key(id)))?
            .ok_or_else(|| Error::FileCorrupt(format!("unknown chunk {}", id)))?;
        let c = Chunk::from_line(line.as_text()?)?;
        if c.block == UNKNOWN {
            return Err(Error::FileCorrupt(format!("chunk {} has no file position", id)));
        }
        self.chunks.write().unwrap().insert(id, c.clone());
        Ok(c)
    }

    fn read_page_typed(&self, map_id: u32, pos: u64, map: &MvMap) -> CResult<Arc<Page>> {
        PageStore::read_page(self, map_id, pos, map.key_type(), map.value_type())
    }

    // ---- store internals --------------------------------------------------

    fn time_since_creation(&self) -> u64 {
        now_millis().saturating_sub(self.creation_time.load(Ordering::Acquire))
    }

    fn check_writable(&self) -> CResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        if self.read_only {
            return Err(Error::ReadOnly(format!("{}", self.file)));
        }
        Ok(())
    }

    /// True when some change has not reached the file yet.
    fn has_unsaved_changes(&self) -> bool {
        if self.unsaved_pages.load(Ordering::Acquire) > 0 {
            return true;
        }
        let meta_root = self.meta.root_ref();
        if meta_root.page.pos() == 0 && meta_root.page.total_count() > 0 {
            return true;
        }
        let last_stored = self.last_stored.load(Ordering::Acquire);
        for map in self.maps.read().unwrap().values() {
            let r = map.root_ref();
            if r.page.pos() == 0 && (r.version > 0 || r.page.total_count() > 0) {
                return true;
            }
            if r.version > last_stored {
                return true;
            }
        }
        !self.freed.lock().unwrap().is_empty()
    }

    /// Writes one chunk. Caller holds the commit lock.
    fn store_locked(&self, mode: StoreMode) -> CResult<Option<u64>> {
        self.check_writable()?;
        if !self.has_unsaved_changes() {
            return Ok(None);
        }

        let store_version = self.version.load(Ordering::Acquire);
        let freed_up_to = match mode {
            StoreMode::Commit => store_version,
            StoreMode::Temp => self.last_committed.load(Ordering::Acquire),
        };

        let chunk_id = (self.last_chunk_id.load(Ordering::Acquire) + 1) as u32;
        let mut c = Chunk::new(chunk_id, store_version);
        c.time = self.time_since_creation();

        // correct the previous chunk's meta record: its own store left it
        // provisional
        let prev_id = self.last_chunk_id.load(Ordering::Acquire) as u32;
        if prev_id != 0 {
            if let Some(prev) = self.chunks.read().unwrap().get(&prev_id).cloned() {
                self.meta.put(
                    Value::Text(Chunk::meta_key(prev_id)),
                    Value::Text(prev.to_line()),
                )?;
            }
        }
        // provisional record for the chunk being written
        self.meta
            .put(Value::Text(Chunk::meta_key(chunk_id)), Value::Text(c.to_line()))?;

        match mode {
            StoreMode::Temp => {
                let committed = self.last_committed.load(Ordering::Acquire);
                if committed < store_version {
                    self.meta.put(
                        Value::Text("rollbackOnOpen".to_string()),
                        Value::Text(format!("{:x}", committed)),
                    )?;
                }
            }
            StoreMode::Commit => {
                self.meta.remove(&Value::Text("rollbackOnOpen".to_string()))?;
            }
        }

        // apply freed-space records and find reclaimable chunks
        let dead = self.apply_freed_space(freed_up_to, chunk_id)?;

        // serialize changed map roots, children before parents
        let mut buf = BytesMut::new();
        buf.resize(CHUNK_HEADER_AREA, 0);
        let mut stats = WriteStats::default();
        let mut maps: Vec<Arc<MvMap>> = self.maps.read().unwrap().values().cloned().collect();
        maps.sort_by_key(|m| m.id());
        for map in &maps {
            let root = map.root_ref().page;
            if root.pos() == 0 {
                write_page_tree(
                    &root,
                    chunk_id,
                    &mut buf,
                    map.key_type().as_ref(),
                    map.value_type().as_ref(),
                    self.compressor.as_deref(),
                    &mut stats,
                )?;
            }
            let key = Value::Text(format!("root.{:x}", map.id()));
            let recorded = match self.meta.get(&key)? {
                Some(v) => u64::from_str_radix(v.as_text()?, 16).unwrap_or(0),
                None => 0,
            };
            if recorded != root.pos() {
                self.meta.put(key, Value::Text(format!("{:x}", root.pos())))?;
            }
        }

        // the meta map itself goes last; afterwards no meta writes until
        // the next store
        let meta_root = self.meta.root_ref().page;
        write_page_tree(
            &meta_root,
            chunk_id,
            &mut buf,
            self.meta.key_type().as_ref(),
            self.meta.value_type().as_ref(),
            self.compressor.as_deref(),
            &mut stats,
        )?;
        c.meta_root_pos = meta_root.pos();
        c.page_count = stats.page_count;
        c.page_count_live = stats.page_count;
        c.max_len = stats.max_len;
        c.max_len_live = stats.max_len;
        c.map_id = self.last_map_id.load(Ordering::Acquire) as u32;

        // frame the chunk
        let body_len = buf.len();
        let total = ((body_len + CHUNK_FOOTER_LENGTH) as u64).div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
        c.len = (total / BLOCK_SIZE) as u32;

        let tail_before = self.file.free_tail_start().max(2 * BLOCK_SIZE);
        let pos = if self.reuse_space {
            self.file.allocate(total)
        } else {
            self.file.mark_used(tail_before, total);
            tail_before
        };
        let at_end = pos >= tail_before;
        c.block = pos / BLOCK_SIZE;
        c.next = c.block + c.len as u64;

        let header = c.encode_header()?;
        buf[..CHUNK_HEADER_AREA].copy_from_slice(&header);
        buf.resize(total as usize - CHUNK_FOOTER_LENGTH, 0);
        buf.extend_from_slice(&c.encode_footer());

        // publish the chunk before publishing any header that points at it
        let prev_last_stored = self.last_stored.load(Ordering::Acquire);
        let prev_last_committed = self.last_committed.load(Ordering::Acquire);
        self.chunks.write().unwrap().insert(chunk_id, c.clone());
        self.last_chunk_id.store(chunk_id as u64, Ordering::Release);
        self.last_stored.store(store_version, Ordering::Release);
        if let StoreMode::Commit = mode {
            self.last_committed.store(store_version, Ordering::Release);
            self.version.store(store_version + 1, Ordering::Release);
        }

        // Write order is the commit protocol: the chunk (with its tail
        // header when appended at the end) goes first, the primary headers
        // last. A crash in between leaves the primaries pointing at the
        // previous chunk, which is intact.
        let write_result = if at_end {
            let mut out = buf.to_vec();
            out.extend_from_slice(&self.encode_header_block());
            self.file.write_fully(pos, &out)
        } else {
            self.file.write_fully(pos, &buf)
        }
        .and_then(|_| self.write_primary_headers());
        if let Err(err) = write_result {
            // the in-memory commit is undone; disk still holds the previous
            // version because no new header was installed
            self.chunks.write().unwrap().remove(&chunk_id);
            self.last_chunk_id.store(prev_id as u64, Ordering::Release);
            self.last_stored.store(prev_last_stored, Ordering::Release);
            if let StoreMode::Commit = mode {
                self.version.store(store_version, Ordering::Release);
                self.last_committed.store(prev_last_committed, Ordering::Release);
            }
            self.file.free(pos, total);
            return Err(err);
        }

        self.last_store_time.store(c.time, Ordering::Release);
        self.unsaved_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| {
                Some(v.saturating_sub(stats.page_count as u64))
            })
            .ok();

        // release chunks that died and outlived their retention
        if let StoreMode::Commit = mode {
            for dead_id in dead {
                let removed = self.chunks.write().unwrap().remove(&dead_id);
                if let Some(dc) = removed {
                    log::debug!("releasing chunk {} ({} blocks)", dc.id, dc.len);
                    self.file.free(dc.start(), dc.length_bytes());
                    self.meta.remove(&Value::Text(Chunk::meta_key(dead_id)))?;
                }
            }
        }

        for map in &maps {
            map.remove_unused_old_versions()?;
        }
        self.meta.remove_unused_old_versions()?;

        Ok(Some(store_version))
    }

    /// Applies freed-page deltas for versions up to `up_to` and returns the
    /// ids of chunks that can be reclaimed after the coming write.
    fn apply_freed_space(&self, up_to: u64, writing_chunk: u32) -> CResult<Vec<u32>> {
        let mut merged: HashMap<u32, FreedDelta> = HashMap::new();
        {
            let mut freed = self.freed.lock().unwrap();
            let keep = freed.split_off(&(up_to + 1));
            for (_, per_chunk) in std::mem::replace(&mut *freed, keep) {
                for (chunk_id, delta) in per_chunk {
                    let e = merged.entry(chunk_id).or_default();
                    e.max_len += delta.max_len;
                    e.pages += delta.pages;
                }
            }
        }
        let mut touched: Vec<Chunk> = Vec::new();
        {
            let mut chunks = self.chunks.write().unwrap();
            for (chunk_id, delta) in merged {
                if let Some(c) = chunks.get_mut(&chunk_id) {
                    c.max_len_live = c.max_len_live.saturating_sub(delta.max_len);
                    c.page_count_live = c.page_count_live.saturating_sub(delta.pages);
                    touched.push(c.clone());
                }
            }
        }
        for c in &touched {
            self.meta
                .put(Value::Text(Chunk::meta_key(c.id)), Value::Text(c.to_line()))?;
        }

        // reclaim candidates: dead and past retention
        let now = self.time_since_creation();
        let chunks = self.chunks.read().unwrap();
        Ok(chunks
            .values()
            .filter(|c| {
                c.id != writing_chunk
                    && c.max_len_live == 0
                    && c.time + self.retention_ms <= now
            })
            .map(|c| c.id)
            .collect())
    }

    // ---- rollback ---------------------------------------------------------

    /// Rolls the store back to `version`. Caller holds the commit lock.
    fn rollback_to(&self, version: u64) -> CResult<()> {
        if version > self.version.load(Ordering::Acquire) {
            return Err(Error::UnknownVersion(format!("version {}", version)));
        }
        self.cache.clear();
        self.freed.lock().unwrap().clear();

        // drop stored chunks newer than the target
        let newer: Vec<Chunk> = {
            let chunks = self.chunks.read().unwrap();
            chunks.values().filter(|c| c.version > version).cloned().collect()
        };
        if !newer.is_empty() {
            {
                let mut chunks = self.chunks.write().unwrap();
                for c in &newer {
                    chunks.remove(&c.id);
                    self.file.free(c.start(), c.length_bytes());
                }
            }
            let latest = {
                let chunks = self.chunks.read().unwrap();
                chunks.values().max_by_key(|c| c.id).cloned()
            };
            match latest {
                Some(latest) => {
                    self.last_chunk_id.store(latest.id as u64, Ordering::Release);
                    self.last_stored.store(latest.version, Ordering::Release);
                    let meta_root =
                        self.read_page_typed(META_MAP_ID, latest.meta_root_pos, &self.meta)?;
                    self.meta.reset_root(latest.version, meta_root);
                }
                None => {
                    self.last_chunk_id.store(0, Ordering::Release);
                    self.last_stored.store(0, Ordering::Release);
                    self.meta
                        .reset_root(version, Arc::new(Page::empty_leaf(META_MAP_ID, version)));
                }
            }
            // destroy the dropped bytes so recovery cannot resurrect them,
            // then install consistent headers front and back; a read-only
            // open rolls back in memory and leaves the file alone
            self.version.store(version + 1, Ordering::Release);
            let lc = self.last_committed.load(Ordering::Acquire);
            self.last_committed.store(lc.min(version), Ordering::Release);
            if !self.read_only {
                self.write_primary_headers()?;
                let tail = self.file.free_tail_start().max(2 * BLOCK_SIZE);
                self.file.truncate(tail)?;
                self.file.write_fully(tail, &self.encode_header_block())?;
            }
        } else {
            self.version.store(version + 1, Ordering::Release);
            let lc = self.last_committed.load(Ordering::Acquire);
            self.last_committed.store(lc.min(version), Ordering::Release);
            self.meta.rollback_root(version);
        }

        // restore map roots; maps created after the target disappear
        let mut to_remove = Vec::new();
        for (id, map) in self.maps.read().unwrap().iter() {
            if map.rollback_root(version) {
                continue;
            }
            // not retained in memory: reload from the surviving meta
            let key = Value::Text(format!("root.{:x}", id));
            match self.meta.get(&key)? {
                Some(v) => {
                    let pos = u64::from_str_radix(v.as_text()?, 16)
                        .map_err(|_| Error::FileCorrupt("bad root entry".to_string()))?;
                    let page = if pos == 0 {
                        Arc::new(Page::empty_leaf(*id, version))
                    } else {
                        self.read_page_typed(*id, pos, map)?
                    };
                    map.reset_root(version, page);
                }
                None => {
                    map.close();
                    to_remove.push(*id);
                }
            }
        }
        if !to_remove.is_empty() {
            let mut maps = self.maps.write().unwrap();
            for id in to_remove {
                maps.remove(&id);
            }
        }
        Ok(())
    }

    // ---- compaction -------------------------------------------------------

    /// Rewrites live data out of poorly filled chunks. Returns true when
    /// any data was rewritten; the next commit moves it to a fresh chunk.
    fn compact_locked(&self, target_fill_rate: u8) -> CResult<bool> {
        self.check_writable()?;
        let (total_max, total_live, victims) = {
            let chunks = self.chunks.read().unwrap();
            let total_max: u64 = chunks.values().map(|c| c.max_len).sum();
            let total_live: u64 = chunks.values().map(|c| c.max_len_live).sum();
            let now = self.time_since_creation();
            let mut candidates: Vec<&Chunk> =
                chunks.values().filter(|c| c.fill_rate() < target_fill_rate).collect();
            candidates.sort_by_key(|c| c.collect_priority(now));
            let victims: std::collections::HashSet<u32> =
                candidates.iter().take(16).map(|c| c.id).collect();
            (total_max, total_live, victims)
        };
        if total_max == 0 || victims.is_empty() {
            return Ok(false);
        }
        if total_live * 100 / total_max >= target_fill_rate as u64 {
            return Ok(false);
        }
        log::info!(
            "compacting {} chunks (fill rate {}%)",
            victims.len(),
            total_live * 100 / total_max
        );

        let mut rewritten = false;
        let maps: Vec<Arc<MvMap>> = self.maps.read().unwrap().values().cloned().collect();
        for map in maps {
            let root = map.root_ref().page;
            let mut keys = Vec::new();
            self.collect_rewrite_keys(&map, &root, &victims, &mut keys)?;
            for key in keys {
                if let Some(v) = map.remove(&key)? {
                    map.put(key, v)?;
                    rewritten = true;
                }
            }
        }
        Ok(rewritten)
    }

    /// Keys that must be rewritten to lift live data out of `victims`:
    /// every key of a victim leaf, and one probe key per child subtree of a
    /// victim interior page.
    fn collect_rewrite_keys(
        &self,
        map: &MvMap,
        page: &Arc<Page>,
        victims: &std::collections::HashSet<u32>,
        out: &mut Vec<Value>,
    ) -> CResult<()> {
        let in_victim = page.pos() != 0 && victims.contains(&pos_chunk_id(page.pos()));
        if page.is_leaf() {
            if in_victim {
                out.extend(page.keys().iter().cloned());
            }
            return Ok(());
        }
        for i in 0..page.children().len() {
            let child_pos = page.children()[i].pos();
            if in_victim && child_pos != 0 && !victims.contains(&pos_chunk_id(child_pos)) {
                // the child itself stays, but the path through this page
                // must move: rewrite one key below the child
                let child = map.child_page(page, i)?;
                if let Some(first) = self.first_key_below(map, &child)? {
                    out.push(first);
                }
                continue;
            }
            let child = map.child_page(page, i)?;
            self.collect_rewrite_keys(map, &child, victims, out)?;
        }
        Ok(())
    }

    fn first_key_below(&self, map: &MvMap, page: &Arc<Page>) -> CResult<Option<Value>> {
        let mut page = page.clone();
        loop {
            if page.key_count() == 0 && page.is_leaf() {
                return Ok(None);
            }
            if page.is_leaf() {
                return Ok(Some(page.key(0).clone()));
            }
            page = map.child_page(&page, 0)?;
        }
    }

    /// Physically moves chunks toward the start of the file and shrinks it.
    /// Caller holds the commit lock.
    fn compact_move_chunks_locked(&self) -> CResult<()> {
        self.check_writable()?;
        // never reuse extents freed by this pass until headers are durable
        let mut deferred_free: Vec<(u64, u64)> = Vec::new();

        let mut by_block: Vec<Chunk> = self.chunks.read().unwrap().values().cloned().collect();
        by_block.sort_by_key(|c| c.block);
        for mut c in by_block {
            let len = c.length_bytes();
            let new_pos = self.file.allocate(len);
            if new_pos >= c.start() {
                // no better place; undo the reservation
                self.file.free(new_pos, len);
                continue;
            }
            let mut bytes = self.file.read_fully(c.start(), len as usize)?;
            let old_start = c.start();
            c.block = new_pos / BLOCK_SIZE;
            let header = c.encode_header()?;
            bytes[..CHUNK_HEADER_AREA].copy_from_slice(&header);
            let footer = c.encode_footer();
            let at = bytes.len() - CHUNK_FOOTER_LENGTH;
            bytes[at..].copy_from_slice(&footer);
            self.file.write_fully(new_pos, &bytes)?;
            deferred_free.push((old_start, len));
            self.chunks.write().unwrap().insert(c.id, c.clone());
            self.meta
                .put(Value::Text(Chunk::meta_key(c.id)), Value::Text(c.to_line()))?;
            log::debug!("moved chunk {} to block {}", c.id, c.block);
        }

        if !deferred_free.is_empty() {
            // persist the moved layout, then release the old extents
            self.store_locked(StoreMode::Commit)?;
            self.write_primary_headers()?;
            for (pos, len) in deferred_free {
                self.file.free(pos, len);
            }
        }
        let tail = self.file.free_tail_start().max(2 * BLOCK_SIZE);
        self.file.write_fully(tail, &self.encode_header_block())?;
        self.file.truncate(tail + BLOCK_SIZE)?;
        Ok(())
    }

    // ---- map management ---------------------------------------------------

    fn map_by_name(&self, name: &str) -> Option<Arc<MvMap>> {
        self.maps.read().unwrap().values().find(|m| m.name() == name).cloned()
    }

    /// Opens or creates a map. Caller holds the commit lock (map creation
    /// writes to the meta map).
    fn open_map_locked(
        &self,
        name: &str,
        types: Option<(Arc<dyn DataType>, Arc<dyn DataType>)>,
    ) -> CResult<Arc<MvMap>> {
        if let Some(existing) = self.map_by_name(name) {
            return Ok(existing);
        }
        let name_key = Value::Text(format!("name.{}", name));
        let map = match self.meta.get(&name_key)? {
            Some(id_hex) => {
                let id = u32::from_str_radix(id_hex.as_text()?, 16)
                    .map_err(|_| Error::FileCorrupt("bad map id entry".to_string()))?;
                let cfg_line = self
                    .meta
                    .get(&Value::Text(format!("map.{:x}", id)))?
                    .ok_or_else(|| {
                        Error::FileCorrupt(format!("missing configuration for map {:?}", name))
                    })?;
                let cfg = parse_map(cfg_line.as_text()?)?;
                let create_version = get_hex(&cfg, "createVersion")?;
                let stored_key = cfg
                    .get("key")
                    .cloned()
                    .unwrap_or_else(|| "any".to_string());
                let stored_value = cfg
                    .get("value")
                    .cloned()
                    .unwrap_or_else(|| "any".to_string());
                let (key_type, value_type) = match types {
                    Some((k, v)) => {
                        if k.name() != stored_key || v.name() != stored_value {
                            return Err(Error::Internal(format!(
                                "map {:?} stores {}/{} but was opened as {}/{}",
                                name,
                                stored_key,
                                stored_value,
                                k.name(),
                                v.name()
                            )));
                        }
                        (k, v)
                    }
                    None => (data_type_by_name(&stored_key)?, data_type_by_name(&stored_value)?),
                };
                let root_pos = match self.meta.get(&Value::Text(format!("root.{:x}", id)))? {
                    Some(v) => u64::from_str_radix(v.as_text()?, 16)
                        .map_err(|_| Error::FileCorrupt("bad root entry".to_string()))?,
                    None => 0,
                };
                let stored_version = self.last_stored.load(Ordering::Acquire);
                let map = Arc::new(MvMap::new(
                    self.page_store_weak(),
                    id,
                    name.to_string(),
                    create_version,
                    key_type.clone(),
                    value_type.clone(),
                    false,
                    RootRef {
                        version: stored_version,
                        page: Arc::new(Page::empty_leaf(id, stored_version)),
                    },
                ));
                if root_pos != 0 {
                    let page =
                        PageStore::read_page(self, id, root_pos, &key_type, &value_type)?;
                    map.reset_root(stored_version, page);
                }
                map
            }
            None => {
                self.check_writable()?;
                let (key_type, value_type) = match types {
                    Some(t) => t,
                    None => {
                        (Arc::new(crate::codec::types::AnyType) as Arc<dyn DataType>,
                         Arc::new(crate::codec::types::AnyType) as Arc<dyn DataType>)
                    }
                };
                let id = (self.last_map_id.fetch_add(1, Ordering::AcqRel) + 1) as u32;
                let version = self.version.load(Ordering::Acquire);
                let mut cfg = HeaderMap::new();
                put_hex(&mut cfg, "createVersion", version);
                cfg.insert("key".to_string(), key_type.name());
                cfg.insert("value".to_string(), value_type.name());
                self.meta.put(name_key, Value::Text(format!("{:x}", id)))?;
                self.meta
                    .put(Value::Text(format!("map.{:x}", id)), Value::Text(format_map(&cfg)))?;
                Arc::new(MvMap::new(
                    self.page_store_weak(),
                    id,
                    name.to_string(),
                    version,
                    key_type,
                    value_type,
                    false,
                    RootRef { version, page: Arc::new(Page::empty_leaf(id, version)) },
                ))
            }
        };
        self.maps.write().unwrap().insert(map.id(), map.clone());
        Ok(map)
    }

    /// Removes a map and frees its pages. Caller holds the commit lock.
    fn remove_map_locked(&self, map: &Arc<MvMap>) -> CResult<()> {
        self.check_writable()?;
        if map.id() == META_MAP_ID {
            return Err(Error::Internal("the meta map cannot be removed".to_string()));
        }
        map.clear()?;
        map.close();
        self.maps.write().unwrap().remove(&map.id());
        self.meta.remove(&Value::Text(format!("name.{}", map.name())))?;
        self.meta.remove(&Value::Text(format!("map.{:x}", map.id())))?;
        self.meta.remove(&Value::Text(format!("root.{:x}", map.id())))?;
        Ok(())
    }

    /// All map names, registered or only stored.
    fn map_names(&self) -> CResult<Vec<String>> {
        let mut names = Vec::new();
        let mut cursor_key = Value::Text("name.".to_string());
        loop {
            let next = match self.meta.higher_key(&cursor_key)? {
                Some(k) => k,
                None => break,
            };
            let text = next.as_text()?.to_string();
            match text.strip_prefix("name.") {
                Some(suffix) => names.push(suffix.to_string()),
                None => break,
            }
            cursor_key = next;
        }
        Ok(names)
    }

    // ---- background hooks -------------------------------------------------

    pub(crate) fn background_store_due(&self, write_delay_ms: u64) -> bool {
        if self.closed.load(Ordering::Acquire) || self.read_only {
            return false;
        }
        if !self.has_unsaved_changes() {
            return false;
        }
        // memory pressure overrides the delay
        if self.unsaved_pages.load(Ordering::Acquire) > self.unsaved_budget {
            return true;
        }
        self.time_since_creation()
            >= self.last_store_time.load(Ordering::Acquire) + write_delay_ms
    }

    pub(crate) fn store_in_background(&self) -> CResult<()> {
        let _guard = self.commit_lock.lock().unwrap();
        if self.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        self.store_locked(StoreMode::Temp)?;
        Ok(())
    }
}

impl PageStore for StoreInner {
    fn current_version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    fn retain_version(&self) -> u64 {
        self.last_committed.load(Ordering::Acquire).saturating_sub(VERSIONS_TO_RETAIN)
    }

    fn page_split_size(&self) -> usize {
        self.page_split
    }

    fn read_page(
        &self,
        map_id: u32,
        pos: u64,
        key_type: &Arc<dyn DataType>,
        value_type: &Arc<dyn DataType>,
    ) -> CResult<Arc<Page>> {
        if pos == 0 {
            return Err(Error::Internal("read of an unsaved page position".to_string()));
        }
        if let Some(page) = self.cache.get(pos) {
            return Ok(page);
        }
        let chunk = self.chunk_for_id(pos_chunk_id(pos))?;
        let offset = pos_offset(pos) as u64;
        if offset >= chunk.length_bytes() {
            return Err(Error::FileCorrupt(format!(
                "page offset {} outside chunk {}",
                offset, chunk.id
            )));
        }
        let speculative =
            (pos_max_length(pos) as u64).min(chunk.length_bytes() - offset) as usize;
        let mut data = self.file.read_fully(chunk.start() + offset, speculative)?;
        let need = stored_page_length(&data)?;
        if need > data.len() {
            data = self.file.read_fully(chunk.start() + offset, need)?;
        }
        let page = decode_page(
            &data,
            pos,
            key_type.as_ref(),
            value_type.as_ref(),
            self.compressor.as_deref(),
        )?;
        if page.map_id() != map_id {
            return Err(Error::FileCorrupt(format!(
                "page at {:x} belongs to map {}, expected {}",
                pos,
                page.map_id(),
                map_id
            )));
        }
        let page = Arc::new(page);
        self.cache.insert(pos, page.clone(), page.memory());
        Ok(page)
    }

    fn register_freed_page(&self, version: u64, pos: u64) {
        self.cache.remove(pos);
        let mut freed = self.freed.lock().unwrap();
        let delta = freed
            .entry(version)
            .or_default()
            .entry(pos_chunk_id(pos))
            .or_default();
        delta.max_len += pos_max_length(pos) as u64;
        delta.pages += 1;
    }

    fn on_unsaved_page(&self) {
        self.unsaved_pages.fetch_add(1, Ordering::AcqRel);
    }

    fn on_dropped_unsaved_page(&self) {
        self.unsaved_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some(v.saturating_sub(1)))
            .ok();
    }

    fn map_root_for_version(&self, map_id: u32, version: u64) -> CResult<u64> {
        let candidate = {
            let chunks = self.chunks.read().unwrap();
            chunks
                .values()
                .filter(|c| c.version <= version)
                .max_by_key(|c| (c.version, c.id))
                .cloned()
        };
        let chunk = candidate.ok_or_else(|| {
            Error::UnknownVersion(format!("no stored chunk at or before version {}", version))
        })?;
        // a read-only view of the meta map as of that chunk
        let meta_root = self.read_page_typed(META_MAP_ID, chunk.meta_root_pos, &self.meta)?;
        let snapshot = self.meta_view(chunk.version, meta_root);
        match snapshot.get(&Value::Text(format!("root.{:x}", map_id)))? {
            Some(v) => Ok(u64::from_str_radix(v.as_text()?, 16)
                .map_err(|_| Error::FileCorrupt("bad root entry".to_string()))?),
            None => Ok(0),
        }
    }
}

impl Store {
    /// Opens or creates the map with untyped keys and values.
    pub fn open_map(&self, name: &str) -> CResult<Arc<MvMap>> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.open_map_locked(name, None)
    }

    /// Opens or creates the map with explicit key and value types. Opening
    /// an existing map with different types is an error.
    pub fn open_map_with_types(
        &self,
        name: &str,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
    ) -> CResult<Arc<MvMap>> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.open_map_locked(name, Some((key_type, value_type)))
    }

    pub fn has_map(&self, name: &str) -> CResult<bool> {
        if self.inner.map_by_name(name).is_some() {
            return Ok(true);
        }
        Ok(self.inner.meta.get(&Value::Text(format!("name.{}", name)))?.is_some())
    }

    pub fn map_names(&self) -> CResult<Vec<String>> {
        self.inner.map_names()
    }

    /// Removes a map and all of its data.
    pub fn remove_map(&self, map: &Arc<MvMap>) -> CResult<()> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.remove_map_locked(map)
    }

    /// Commits the current version: writes every change as a new chunk and
    /// installs it. Returns the committed version, or the last committed
    /// version when there was nothing to write.
    pub fn commit(&self) -> CResult<u64> {
        self.inner.check_writable()?;
        let _guard = self.inner.commit_lock.lock().unwrap();
        match self.inner.store_locked(StoreMode::Commit)? {
            Some(v) => Ok(v),
            None => Ok(self.inner.last_committed.load(Ordering::Acquire)),
        }
    }

    /// Bumps the current version without writing, retaining the prior
    /// version for in-memory snapshots.
    pub fn increment_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn current_version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    pub fn last_committed_version(&self) -> u64 {
        self.inner.last_committed.load(Ordering::Acquire)
    }

    pub fn last_stored_version(&self) -> u64 {
        self.inner.last_stored.load(Ordering::Acquire)
    }

    pub fn unsaved_pages(&self) -> u64 {
        self.inner.unsaved_pages.load(Ordering::Acquire)
    }

    pub fn is_read_only(&self) -> bool {
        self.inner.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Rolls the store back to an older version: retained roots are
    /// restored and newer stored chunks are discarded.
    pub fn rollback_to(&self, version: u64) -> CResult<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.rollback_to(version)
    }

    /// Discards all changes made after the last commit.
    pub fn rollback(&self) -> CResult<()> {
        self.rollback_to(self.inner.last_committed.load(Ordering::Acquire))
    }

    /// Rewrites live data out of poorly filled chunks when the overall
    /// fill rate is below `target_fill_rate` percent. The rewritten data
    /// reaches a fresh chunk with the next commit.
    pub fn compact(&self, target_fill_rate: u8) -> CResult<bool> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.compact_locked(target_fill_rate)
    }

    /// Physically moves chunks toward the file start and truncates the
    /// file. Page contents are not touched.
    pub fn compact_move_chunks(&self) -> CResult<()> {
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.compact_move_chunks_locked()
    }

    pub fn sync(&self) -> CResult<()> {
        self.inner.file.sync()
    }

    /// The user-defined store version, kept in the meta map.
    pub fn get_store_version(&self) -> CResult<u64> {
        match self.inner.meta.get(&Value::Text("setting.storeVersion".to_string()))? {
            Some(v) => Ok(u64::from_str_radix(v.as_text()?, 16)
                .map_err(|_| Error::FileCorrupt("bad store version entry".to_string()))?),
            None => Ok(0),
        }
    }

    pub fn set_store_version(&self, version: u64) -> CResult<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.meta.put(
            Value::Text("setting.storeVersion".to_string()),
            Value::Text(format!("{:x}", version)),
        )?;
        Ok(())
    }

    /// Opens a stored map by id, resolving its name from the meta map.
    /// Returns None when no such map exists.
    pub(crate) fn open_map_by_id(&self, id: u32) -> CResult<Option<Arc<MvMap>>> {
        if let Some(m) = self.inner.maps.read().unwrap().get(&id) {
            return Ok(Some(m.clone()));
        }
        let suffix = format!("{:x}", id);
        for name in self.map_names()? {
            let name_key = Value::Text(format!("name.{}", name));
            if let Some(v) = self.inner.meta.get(&name_key)? {
                if v.as_text()? == suffix {
                    return Ok(Some(self.open_map(&name)?));
                }
            }
        }
        Ok(None)
    }

    /// Reads a numeric `setting.*` entry from the meta map.
    pub(crate) fn get_meta_setting(&self, key: &str) -> CResult<Option<u64>> {
        match self.inner.meta.get(&Value::Text(format!("setting.{}", key)))? {
            Some(v) => Ok(Some(u64::from_str_radix(v.as_text()?, 16).map_err(|_| {
                Error::FileCorrupt(format!("bad setting entry {:?}", key))
            })?)),
            None => Ok(None),
        }
    }

    /// Writes a numeric `setting.*` entry to the meta map.
    pub(crate) fn set_meta_setting(&self, key: &str, value: u64) -> CResult<()> {
        self.inner.check_writable()?;
        let _guard = self.inner.commit_lock.lock().unwrap();
        self.inner.meta.put(
            Value::Text(format!("setting.{}", key)),
            Value::Text(format!("{:x}", value)),
        )?;
        Ok(())
    }

    pub fn status(&self) -> Status {
        let inner = &self.inner;
        Status {
            file_size: inner.file.size(),
            fill_rate: inner.file.fill_rate(),
            chunk_count: inner.chunks.read().unwrap().len(),
            current_version: inner.version.load(Ordering::Acquire),
            last_committed_version: inner.last_committed.load(Ordering::Acquire),
            unsaved_pages: inner.unsaved_pages.load(Ordering::Acquire),
            cache_used_bytes: inner.cache.used_memory(),
            cache_hits: inner.cache.hits(),
            cache_misses: inner.cache.misses(),
            file_reads: inner.file.read_count(),
            file_writes: inner.file.write_count(),
        }
    }

    /// Commits pending changes, stops the background writer and closes the
    /// store. Idempotent.
    pub fn close(&self) -> CResult<()> {
        if let Some(bg) = self.background.lock().unwrap().take() {
            bg.stop();
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        if !self.inner.read_only {
            let _guard = self.inner.commit_lock.lock().unwrap();
            self.inner.store_locked(StoreMode::Commit)?;
            self.inner.file.sync()?;
        }
        self.inner.closed.store(true, Ordering::Release);
        Ok(())
    }

    /// Closes without committing, ignoring all errors.
    pub fn close_immediately(&self) {
        if let Some(bg) = self.background.lock().unwrap().take() {
            bg.stop();
        }
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl std::fmt::Display for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "store {}", self.inner.file)
    }
}

/// Attempt to commit pending changes when the store handle is dropped.
impl Drop for Store {
    fn drop(&mut self) {
        if let Err(error) = self.close() {
            log::error!("failed to close store: {}", error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn long(v: i64) -> Value {
        Value::Long(v)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn open_store(path: &Path) -> CResult<Store> {
        StoreBuilder::new().file_name(path).write_delay(0).open()
    }

    #[test]
    fn versioned_reads() -> CResult<()> {
        // open a new store, write, bump the version, write again, commit;
        // the old version stays readable through a snapshot
        let dir = tempdir::TempDir::new("mvkv")?;
        let s = open_store(&dir.path().join("data.mv"))?;
        let m = s.open_map("data")?;
        m.put(long(1), text("Hello"))?;
        m.put(long(2), text("World"))?;
        let v0 = s.current_version();
        s.increment_version();
        m.put(long(1), text("Hi"))?;
        m.remove(&long(2))?;
        s.commit()?;

        let snap = m.open_version(v0)?;
        assert_eq!(snap.get(&long(1))?, Some(text("Hello")));
        assert_eq!(snap.get(&long(2))?, Some(text("World")));
        assert_eq!(m.get(&long(1))?, Some(text("Hi")));
        assert_eq!(m.get(&long(2))?, None);
        Ok(())
    }

    #[test]
    fn reopen_round_trip() -> CResult<()> {
        use rand::{Rng, SeedableRng};
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");

        let seed: u64 = rand::thread_rng().gen();
        println!("seed = {}", seed);
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut reference = std::collections::BTreeMap::new();

        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            for _ in 0..800 {
                let k = rng.gen_range(0..300i64);
                if rng.gen_bool(0.7) {
                    let v = rng.gen_range(0..1_000_000i64);
                    m.put(long(k), long(v))?;
                    reference.insert(k, v);
                } else {
                    m.remove(&long(k))?;
                    reference.remove(&k);
                }
                if rng.gen_bool(0.05) {
                    s.commit()?;
                }
            }
            s.commit()?;
            s.close()?;
        }

        let s = open_store(&path)?;
        let m = s.open_map("data")?;
        assert_eq!(m.size(), reference.len() as u64, "seed {}", seed);
        for (k, v) in &reference {
            assert_eq!(m.get(&long(*k))?, Some(long(*v)), "seed {}", seed);
        }
        let entries: Vec<(Value, Value)> = m.cursor(None)?.collect::<CResult<Vec<_>>>()?;
        let expected: Vec<(Value, Value)> =
            reference.iter().map(|(k, v)| (long(*k), long(*v))).collect();
        assert_eq!(entries, expected, "seed {}", seed);
        Ok(())
    }

    #[test]
    fn snapshot_stable_across_commits() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let s = open_store(&dir.path().join("data.mv"))?;
        let m = s.open_map("data")?;
        for i in 0..100 {
            m.put(long(i), text("before"))?;
        }
        let v = s.commit()?;
        let snap = m.open_version(v)?;

        for round in 0..4 {
            for i in 0..100 {
                m.put(long(i), text(&format!("after {}", round)))?;
            }
            s.commit()?;
        }
        for i in 0..100 {
            assert_eq!(snap.get(&long(i))?, Some(text("before")));
        }
        Ok(())
    }

    #[test]
    fn open_version_from_disk_after_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        let v1;
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            m.put(long(1), text("one"))?;
            v1 = s.commit()?;
            m.put(long(1), text("uno"))?;
            m.put(long(2), text("dos"))?;
            s.commit()?;
            s.close()?;
        }
        // no roots are retained in memory after a reopen: the snapshot is
        // materialized from the old chunk's meta
        let s = open_store(&path)?;
        let m = s.open_map("data")?;
        assert_eq!(m.get(&long(1))?, Some(text("uno")));
        let snap = m.open_version(v1)?;
        assert_eq!(snap.get(&long(1))?, Some(text("one")));
        assert_eq!(snap.get(&long(2))?, None);
        Ok(())
    }

    #[test]
    fn crash_prefix_leaves_old_or_new() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        let work = dir.path().join("crash.mv");

        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            for i in 0..30 {
                m.put(long(i), text("v1"))?;
            }
            s.commit()?;
            s.close()?;
        }
        let base = std::fs::read(&path).unwrap();
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            for i in 0..30 {
                m.put(long(i), text("v2"))?;
            }
            s.commit()?;
            s.close()?;
        }
        let full = std::fs::read(&path).unwrap();
        assert!(full.len() > base.len());

        // the second commit overwrote the old tail header block and
        // appended from there, then rewrote the two primary headers
        let region_start = base.len() - BLOCK_SIZE as usize;
        let region_len = full.len() - region_start;

        let check_state = |file: &Path| -> CResult<()> {
            let s = StoreBuilder::new().file_name(file).write_delay(0).read_only().open()?;
            let m = s.open_map("data")?;
            let first = m.get(&long(0))?.expect("key 0 must exist");
            let expect = first.clone();
            assert!(expect == text("v1") || expect == text("v2"));
            for i in 0..30 {
                assert_eq!(m.get(&long(i))?, Some(expect.clone()), "mixed state");
            }
            Ok(())
        };

        // crash during the chunk write
        let mut cuts: Vec<usize> = (0..region_len).step_by(977).collect();
        cuts.push(region_len);
        for cut in cuts {
            let mut crashed = base.clone();
            crashed.resize(crashed.len().max(region_start + cut), 0);
            crashed[region_start..region_start + cut]
                .copy_from_slice(&full[region_start..region_start + cut]);
            std::fs::write(&work, &crashed).unwrap();
            check_state(&work)?;
        }

        // crash between the two primary header writes
        let mut crashed = base.clone();
        crashed.resize(full.len(), 0);
        crashed[region_start..].copy_from_slice(&full[region_start..]);
        crashed[..BLOCK_SIZE as usize].copy_from_slice(&full[..BLOCK_SIZE as usize]);
        std::fs::write(&work, &crashed).unwrap();
        check_state(&work)?;
        Ok(())
    }

    #[test]
    fn corrupt_header_falls_back_to_backup() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            m.put(long(1), text("Hello"))?;
            s.commit()?;
            s.close()?;
        }
        let good = std::fs::read(&path).unwrap();

        let flip_fletcher = |data: &mut Vec<u8>, block: usize| {
            let start = block * BLOCK_SIZE as usize;
            let slice = &data[start..start + BLOCK_SIZE as usize];
            let at = slice
                .windows(9)
                .position(|w| w == &b"fletcher="[..])
                .expect("header has a checksum")
                + 9;
            let i = start + at;
            data[i] = if data[i] == b'0' { b'1' } else { b'0' };
        };

        // one corrupt header: the backup carries the open
        let mut one = good.clone();
        flip_fletcher(&mut one, 0);
        std::fs::write(&path, &one).unwrap();
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            assert_eq!(m.get(&long(1))?, Some(text("Hello")));
            s.close_immediately();
        }

        // both corrupt: the store refuses to open
        let mut both = good.clone();
        flip_fletcher(&mut both, 0);
        flip_fletcher(&mut both, 1);
        std::fs::write(&path, &both).unwrap();
        match open_store(&path) {
            Err(Error::FileCorrupt(_)) => {}
            other => panic!("expected corruption error, got {:?}", other.map(|_| ())),
        }
        Ok(())
    }

    #[test]
    fn encrypted_store() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("secret.mv");
        {
            let s = StoreBuilder::new()
                .file_name(&path)
                .write_delay(0)
                .encryption_key(b"007".to_vec())
                .open()?;
            let m = s.open_map("data")?;
            m.put(long(1), text("Hello"))?;
            s.commit()?;
            s.close()?;
        }
        // wrong key: unreadable
        assert!(StoreBuilder::new()
            .file_name(&path)
            .write_delay(0)
            .encryption_key(b"008".to_vec())
            .open()
            .is_err());
        // right key: readable
        let s = StoreBuilder::new()
            .file_name(&path)
            .write_delay(0)
            .encryption_key(b"007".to_vec())
            .open()?;
        let m = s.open_map("data")?;
        assert_eq!(m.get(&long(1))?, Some(text("Hello")));
        Ok(())
    }

    #[test]
    fn compaction_preserves_data_and_bounds_size() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        let s = StoreBuilder::new()
            .file_name(&path)
            .write_delay(0)
            .retention_time(0)
            .open()?;
        let m = s.open_map("data")?;

        let mut baseline = 0u64;
        for cycle in 0..20i64 {
            for i in 0..100 {
                m.put(long(i), text(&format!("value {} cycle {}", i, cycle)))?;
            }
            s.commit()?;
            s.compact(95)?;
            s.commit()?;
            s.compact_move_chunks()?;
            if cycle == 2 {
                baseline = s.status().file_size;
            }
        }
        // all entries survive
        assert_eq!(m.size(), 100);
        for i in 0..100 {
            assert_eq!(m.get(&long(i))?, Some(text(&format!("value {} cycle 19", i))));
        }
        let final_size = s.status().file_size;
        assert!(baseline > 0);
        assert!(
            final_size <= 3 * baseline,
            "file grew unbounded: {} vs baseline {}",
            final_size,
            baseline
        );
        Ok(())
    }

    #[test]
    fn rollback_to_discards_newer_chunks() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            m.put(long(1), text("one"))?;
            let v1 = s.commit()?;
            m.put(long(1), text("uno"))?;
            m.put(long(2), text("dos"))?;
            s.commit()?;

            s.rollback_to(v1)?;
            assert_eq!(m.get(&long(1))?, Some(text("one")));
            assert_eq!(m.get(&long(2))?, None);
            s.close()?;
        }
        let s = open_store(&path)?;
        let m = s.open_map("data")?;
        assert_eq!(m.get(&long(1))?, Some(text("one")));
        assert_eq!(m.get(&long(2))?, None);
        Ok(())
    }

    #[test]
    fn uncommitted_background_flush_rolls_back_on_open() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            m.put(long(1), text("committed"))?;
            s.commit()?;
            // uncommitted writes flushed by the background path
            m.put(long(1), text("dirty"))?;
            m.put(long(2), text("dirty too"))?;
            s.inner.store_in_background()?;
            s.close_immediately();
        }
        let s = open_store(&path)?;
        let m = s.open_map("data")?;
        assert_eq!(m.get(&long(1))?, Some(text("committed")));
        assert_eq!(m.get(&long(2))?, None);
        Ok(())
    }

    #[test]
    fn map_management() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        {
            let s = open_store(&path)?;
            let a = s.open_map_with_types(
                "alpha",
                Arc::new(StringType),
                Arc::new(StringType),
            )?;
            let b = s.open_map("beta")?;
            a.put(text("k"), text("v"))?;
            b.put(long(1), long(2))?;
            assert!(s.has_map("alpha")?);
            assert!(!s.has_map("gamma")?);
            s.set_store_version(7)?;
            s.commit()?;
            s.remove_map(&b)?;
            s.commit()?;
            s.close()?;
        }
        let s = open_store(&path)?;
        assert_eq!(s.map_names()?, vec!["alpha".to_string()]);
        assert!(!s.has_map("beta")?);
        assert_eq!(s.get_store_version()?, 7);
        // stored types are enforced
        assert!(s
            .open_map_with_types("alpha", Arc::new(StringType), Arc::new(crate::codec::types::LongType))
            .is_err());
        let a = s.open_map("alpha")?;
        assert_eq!(a.get(&text("k"))?, Some(text("v")));
        Ok(())
    }

    #[test]
    fn commit_versions_are_monotonic() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let s = open_store(&dir.path().join("data.mv"))?;
        let m = s.open_map("data")?;
        let mut last = 0;
        for i in 0..10 {
            m.put(long(i), long(i))?;
            let v = s.commit()?;
            assert!(v > last);
            last = v;
        }
        // a commit without changes does not advance the committed version
        assert_eq!(s.commit()?, last);
        Ok(())
    }

    #[test]
    fn second_open_fails_while_locked() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        let s = open_store(&path)?;
        assert!(open_store(&path).is_err());
        drop(s);
        assert!(open_store(&path).is_ok());
        Ok(())
    }

    #[test]
    fn large_values_span_length_classes() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("data.mv");
        {
            let s = open_store(&path)?;
            let m = s.open_map("data")?;
            for size in [10usize, 1000, 10_000, 100_000] {
                m.put(long(size as i64), Value::Bytes(vec![0xabu8; size]))?;
            }
            s.commit()?;
            s.close()?;
        }
        let s = open_store(&path)?;
        let m = s.open_map("data")?;
        for size in [10usize, 1000, 10_000, 100_000] {
            assert_eq!(m.get(&long(size as i64))?, Some(Value::Bytes(vec![0xabu8; size])));
        }
        Ok(())
    }
}
