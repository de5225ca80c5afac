//! Chunk records: the unit of allocation and persistence.
//!
//! A chunk is a page-aligned file segment holding the pages written by one
//! store operation plus a snapshot of the meta map. Its ASCII header sits
//! at the chunk start; a checked footer fills the last
//! [`CHUNK_FOOTER_LENGTH`] bytes. The same ASCII rendering doubles as the
//! chunk's entry in the meta map.

use crate::codec::header::{
    format_checked, format_map, get_hex, get_hex_opt, parse_checked, parse_map, put_hex, HeaderMap,
};
use crate::error::{CResult, Error};
use crate::storage::{BLOCK_SIZE, CHUNK_FOOTER_LENGTH, CHUNK_HEADER_AREA};

/// Placeholder for fields that are unknown while a chunk is provisional.
pub const UNKNOWN: u64 = u64::MAX;

#[derive(Debug, Clone)]
pub struct Chunk {
    /// Monotonic chunk id, starting at 1.
    pub id: u32,
    /// File position in blocks, or [`UNKNOWN`] while provisional.
    pub block: u64,
    /// Length in blocks.
    pub len: u32,
    /// Pages written into this chunk.
    pub page_count: u32,
    /// Pages still referenced by some retained root.
    pub page_count_live: u32,
    /// Sum of the maximum lengths of all pages.
    pub max_len: u64,
    /// Sum of the maximum lengths of live pages.
    pub max_len_live: u64,
    /// Position of the meta map root written with this chunk.
    pub meta_root_pos: u64,
    /// Store version this chunk committed.
    pub version: u64,
    /// Milliseconds since store creation at write time.
    pub time: u64,
    /// Last map id at write time.
    pub map_id: u32,
    /// Predicted block of the next chunk.
    pub next: u64,
}

impl Chunk {
    pub fn new(id: u32, version: u64) -> Self {
        Self {
            id,
            block: UNKNOWN,
            len: 0,
            page_count: 0,
            page_count_live: 0,
            max_len: 0,
            max_len_live: 0,
            meta_root_pos: 0,
            version,
            time: 0,
            map_id: 0,
            next: 0,
        }
    }

    /// The meta map key of this chunk, `chunk.<id hex>`.
    pub fn meta_key(id: u32) -> String {
        format!("chunk.{:x}", id)
    }

    pub fn start(&self) -> u64 {
        self.block * BLOCK_SIZE
    }

    pub fn length_bytes(&self) -> u64 {
        self.len as u64 * BLOCK_SIZE
    }

    /// Fill rate of live data, in percent of the written page data.
    pub fn fill_rate(&self) -> u8 {
        if self.max_len == 0 {
            return 0;
        }
        (self.max_len_live * 100 / self.max_len).min(100) as u8
    }

    /// Priority for compaction: emptier and older chunks first. Lower
    /// values are collected earlier.
    pub fn collect_priority(&self, now: u64) -> u64 {
        let age = now.saturating_sub(self.time).max(1);
        self.fill_rate() as u64 * 1000 / age.min(1000).max(1)
    }

    fn to_map(&self) -> HeaderMap {
        let mut map = HeaderMap::new();
        put_hex(&mut map, "chunk", self.id as u64);
        put_hex(&mut map, "block", self.block);
        put_hex(&mut map, "len", self.len as u64);
        put_hex(&mut map, "pages", self.page_count as u64);
        if self.page_count_live != self.page_count {
            put_hex(&mut map, "livePages", self.page_count_live as u64);
        }
        put_hex(&mut map, "map", self.map_id as u64);
        put_hex(&mut map, "max", self.max_len);
        if self.max_len_live != self.max_len {
            put_hex(&mut map, "liveMax", self.max_len_live);
        }
        if self.next != 0 {
            put_hex(&mut map, "next", self.next);
        }
        put_hex(&mut map, "root", self.meta_root_pos);
        put_hex(&mut map, "time", self.time);
        put_hex(&mut map, "version", self.version);
        map
    }

    /// The ASCII line stored in the meta map and at the chunk start.
    pub fn to_line(&self) -> String {
        format_map(&self.to_map())
    }

    pub fn from_line(line: &str) -> CResult<Self> {
        let map = parse_map(line)?;
        let page_count = get_hex(&map, "pages")? as u32;
        let max_len = get_hex(&map, "max")?;
        Ok(Self {
            id: get_hex(&map, "chunk")? as u32,
            block: get_hex(&map, "block")?,
            len: get_hex(&map, "len")? as u32,
            page_count,
            page_count_live: get_hex_opt(&map, "livePages")?.map_or(page_count, |v| v as u32),
            max_len,
            max_len_live: get_hex_opt(&map, "liveMax")?.unwrap_or(max_len),
            meta_root_pos: get_hex(&map, "root")?,
            version: get_hex_opt(&map, "version")?.unwrap_or(0),
            time: get_hex(&map, "time")?,
            map_id: get_hex(&map, "map")? as u32,
            next: get_hex_opt(&map, "next")?.unwrap_or(0),
        })
    }

    /// Renders the header area written at the chunk start: the ASCII line,
    /// space padding, and a terminating newline.
    pub fn encode_header(&self) -> CResult<Vec<u8>> {
        let line = self.to_line();
        if line.len() + 1 > CHUNK_HEADER_AREA {
            return Err(Error::Internal(format!("chunk header too long: {}", line.len())));
        }
        let mut out = line.into_bytes();
        out.resize(CHUNK_HEADER_AREA - 1, b' ');
        out.push(b'\n');
        Ok(out)
    }

    /// Parses a chunk header area read from the file.
    pub fn decode_header(data: &[u8]) -> CResult<Self> {
        let end = data
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::FileCorrupt("unterminated chunk header".to_string()))?;
        let line = std::str::from_utf8(&data[..end])?.trim_end();
        Self::from_line(line)
    }

    /// Renders the checked footer filling the last bytes of the chunk.
    pub fn encode_footer(&self) -> Vec<u8> {
        let mut map = HeaderMap::new();
        put_hex(&mut map, "chunk", self.id as u64);
        put_hex(&mut map, "block", self.block);
        put_hex(&mut map, "version", self.version);
        let mut out = format_checked(&map).into_bytes();
        debug_assert!(out.len() < CHUNK_FOOTER_LENGTH);
        out.resize(CHUNK_FOOTER_LENGTH - 1, b' ');
        out.push(b'\n');
        out
    }

    /// Parses and verifies a chunk footer; returns `(id, block, version)`.
    pub fn decode_footer(data: &[u8]) -> CResult<(u32, u64, u64)> {
        let end = data
            .iter()
            .position(|b| *b == b'\n')
            .ok_or_else(|| Error::FileCorrupt("unterminated chunk footer".to_string()))?;
        let line = std::str::from_utf8(&data[..end])?.trim_end();
        let map = parse_checked(line)?;
        Ok((
            get_hex(&map, "chunk")? as u32,
            get_hex(&map, "block")?,
            get_hex(&map, "version")?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Chunk {
        let mut c = Chunk::new(7, 42);
        c.block = 3;
        c.len = 2;
        c.page_count = 10;
        c.page_count_live = 8;
        c.max_len = 5000;
        c.max_len_live = 4000;
        c.meta_root_pos = 0xabcdef;
        c.time = 1234;
        c.map_id = 5;
        c.next = 5;
        c
    }

    #[test]
    fn line_round_trip() {
        let c = sample();
        let back = Chunk::from_line(&c.to_line()).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.block, c.block);
        assert_eq!(back.len, c.len);
        assert_eq!(back.page_count, c.page_count);
        assert_eq!(back.page_count_live, c.page_count_live);
        assert_eq!(back.max_len, c.max_len);
        assert_eq!(back.max_len_live, c.max_len_live);
        assert_eq!(back.meta_root_pos, c.meta_root_pos);
        assert_eq!(back.version, c.version);
        assert_eq!(back.time, c.time);
        assert_eq!(back.map_id, c.map_id);
        assert_eq!(back.next, c.next);
    }

    #[test]
    fn live_defaults_to_total() {
        let mut c = sample();
        c.page_count_live = c.page_count;
        c.max_len_live = c.max_len;
        let line = c.to_line();
        assert!(!line.contains("livePages"));
        assert!(!line.contains("liveMax"));
        let back = Chunk::from_line(&line).unwrap();
        assert_eq!(back.page_count_live, c.page_count);
        assert_eq!(back.max_len_live, c.max_len);
    }

    #[test]
    fn header_area_round_trip() {
        let c = sample();
        let area = c.encode_header().unwrap();
        assert_eq!(area.len(), CHUNK_HEADER_AREA);
        assert_eq!(area[CHUNK_HEADER_AREA - 1], b'\n');
        let back = Chunk::decode_header(&area).unwrap();
        assert_eq!(back.id, c.id);
        assert_eq!(back.version, c.version);
    }

    #[test]
    fn footer_round_trip_and_corruption() {
        let c = sample();
        let footer = c.encode_footer();
        assert_eq!(footer.len(), CHUNK_FOOTER_LENGTH);
        assert_eq!(Chunk::decode_footer(&footer).unwrap(), (7, 3, 42));

        let mut bad = footer.clone();
        bad[8] ^= 1;
        assert!(Chunk::decode_footer(&bad).is_err());
    }

    #[test]
    fn fill_rate_and_priority() {
        let mut c = sample();
        assert_eq!(c.fill_rate(), 80);
        c.max_len_live = 0;
        assert_eq!(c.fill_rate(), 0);
        // an old empty chunk collects before a young full one
        let mut full = sample();
        full.max_len_live = full.max_len;
        full.time = 999;
        assert!(c.collect_priority(1000) < full.collect_priority(1000));
    }
}
