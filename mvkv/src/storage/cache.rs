//! A memory-bounded LIRS cache for decoded pages.
//!
//! Entries are keyed by page position and weighted by the decoded page's
//! memory estimate. The cache is split into 16 segments with independent
//! locks; a key always maps to the same segment. Each segment runs the LIRS
//! replacement policy: frequently re-referenced ("hot") entries live on the
//! recency stack, other resident entries wait in a small cold queue from
//! which eviction happens, and evicted keys remain as non-resident ghosts
//! for a while so that a quick re-reference promotes them straight to hot.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const SEGMENT_COUNT: usize = 16;

struct Entry<V> {
    value: Option<V>,
    memory: usize,
    hot: bool,
    in_stack: bool,
}

struct Segment<V> {
    map: HashMap<u64, Entry<V>>,
    /// LIRS stack, front = most recent. May hold stale keys, cleaned lazily.
    stack: VecDeque<u64>,
    /// Resident cold entries, front = most recent; evicted from the back.
    queue: VecDeque<u64>,
    /// Ghost keys in insertion order, oldest first.
    ghosts: VecDeque<u64>,
    used: usize,
    max: usize,
}

impl<V: Clone> Segment<V> {
    fn new(max: usize) -> Self {
        Self {
            map: HashMap::new(),
            stack: VecDeque::new(),
            queue: VecDeque::new(),
            ghosts: VecDeque::new(),
            used: 0,
            max,
        }
    }

    fn touch_stack(&mut self, key: u64) {
        self.stack.push_front(key);
        if let Some(e) = self.map.get_mut(&key) {
            e.in_stack = true;
        }
        // bound the lazy duplicates
        if self.stack.len() > 4 * (self.map.len() + 1) {
            self.rebuild_stack();
        }
    }

    fn rebuild_stack(&mut self) {
        let mut seen = std::collections::HashSet::new();
        let map = &self.map;
        self.stack.retain(|k| map.contains_key(k) && seen.insert(*k));
    }

    /// Drops stale and non-hot keys from the stack bottom so the bottom
    /// entry is always hot.
    fn prune_stack(&mut self) {
        while let Some(&key) = self.stack.back() {
            match self.map.get_mut(&key) {
                Some(e) if e.hot => break,
                Some(e) => {
                    e.in_stack = false;
                    self.stack.pop_back();
                    if e.value.is_none() {
                        // a ghost that fell off the stack is gone for good
                        self.map.remove(&key);
                    }
                }
                None => {
                    self.stack.pop_back();
                }
            }
        }
    }

    fn get(&mut self, key: u64) -> Option<V> {
        let (resident, hot, in_stack) = match self.map.get(&key) {
            Some(e) => (e.value.is_some(), e.hot, e.in_stack),
            None => return None,
        };
        if !resident {
            return None;
        }
        if hot {
            self.touch_stack(key);
            self.prune_stack();
        } else if in_stack {
            // cold entry re-referenced while still on the stack: promote
            self.map.get_mut(&key).unwrap().hot = true;
            self.queue.retain(|k| *k != key);
            self.touch_stack(key);
            self.demote_bottom();
            self.prune_stack();
        } else {
            // cold entry off the stack stays cold but becomes recent
            self.queue.retain(|k| *k != key);
            self.queue.push_front(key);
            self.touch_stack(key);
        }
        self.map.get(&key).and_then(|e| e.value.clone())
    }

    /// Moves the hot entry at the stack bottom into the cold queue.
    fn demote_bottom(&mut self) {
        self.prune_stack();
        if let Some(&key) = self.stack.back() {
            if let Some(e) = self.map.get_mut(&key) {
                if e.hot {
                    e.hot = false;
                    e.in_stack = false;
                    self.stack.pop_back();
                    self.queue.push_front(key);
                }
            }
        }
        self.prune_stack();
    }

    fn insert(&mut self, key: u64, value: V, memory: usize) {
        match self.map.get_mut(&key) {
            Some(e) if e.value.is_some() => {
                // rewrite of a resident entry
                self.used = self.used - e.memory + memory;
                e.memory = memory;
                e.value = Some(value);
                self.evict();
                return;
            }
            Some(e) => {
                // ghost hit: the key deserves hot status
                e.value = Some(value);
                e.memory = memory;
                e.hot = true;
                self.used += memory;
                self.ghosts.retain(|k| *k != key);
                self.touch_stack(key);
                self.demote_bottom();
            }
            None => {
                let hot = self.map.is_empty();
                self.map.insert(
                    key,
                    Entry { value: Some(value), memory, hot, in_stack: false },
                );
                self.used += memory;
                self.touch_stack(key);
                if !hot {
                    self.queue.push_front(key);
                }
            }
        }
        self.evict();
    }

    fn evict(&mut self) {
        while self.used > self.max {
            let victim = match self.queue.pop_back() {
                Some(k) => k,
                None => {
                    // all residents are hot; shed from the stack bottom
                    self.demote_bottom();
                    match self.queue.pop_back() {
                        Some(k) => k,
                        None => break,
                    }
                }
            };
            if let Some(e) = self.map.get_mut(&victim) {
                if let Some(_v) = e.value.take() {
                    self.used -= e.memory;
                }
                if e.in_stack {
                    // keep as ghost
                    self.ghosts.push_back(victim);
                } else {
                    self.map.remove(&victim);
                }
            }
        }
        // bound ghost count
        while self.ghosts.len() > self.map.len().max(16) {
            if let Some(key) = self.ghosts.pop_front() {
                if let Some(e) = self.map.get(&key) {
                    if e.value.is_none() {
                        self.map.remove(&key);
                    }
                }
            }
        }
    }

    fn remove(&mut self, key: u64) {
        if let Some(e) = self.map.remove(&key) {
            if e.value.is_some() {
                self.used -= e.memory;
            }
        }
        self.queue.retain(|k| *k != key);
        self.ghosts.retain(|k| *k != key);
    }

    fn clear(&mut self) {
        self.map.clear();
        self.stack.clear();
        self.queue.clear();
        self.ghosts.clear();
        self.used = 0;
    }
}

pub struct LirsCache<V: Clone> {
    segments: Vec<Mutex<Segment<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> LirsCache<V> {
    pub fn new(max_memory: usize) -> Self {
        let per_segment = (max_memory / SEGMENT_COUNT).max(1);
        Self {
            segments: (0..SEGMENT_COUNT).map(|_| Mutex::new(Segment::new(per_segment))).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    fn segment(&self, key: u64) -> &Mutex<Segment<V>> {
        // positions of pages in the same chunk differ mostly in the middle
        // bits, so mix before picking a segment
        let mut h = key.wrapping_mul(0x9e3779b97f4a7c15);
        h ^= h >> 32;
        &self.segments[(h as usize) & (SEGMENT_COUNT - 1)]
    }

    pub fn get(&self, key: u64) -> Option<V> {
        let got = self.segment(key).lock().unwrap().get(key);
        match got {
            Some(v) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(v)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, key: u64, value: V, memory: usize) {
        self.segment(key).lock().unwrap().insert(key, value, memory);
    }

    pub fn remove(&self, key: u64) {
        self.segment(key).lock().unwrap().remove(key);
    }

    pub fn clear(&self) {
        for s in &self.segments {
            s.lock().unwrap().clear();
        }
    }

    pub fn set_max_memory(&self, max_memory: usize) {
        let per_segment = (max_memory / SEGMENT_COUNT).max(1);
        for s in &self.segments {
            let mut s = s.lock().unwrap();
            s.max = per_segment;
            s.evict();
        }
    }

    pub fn used_memory(&self) -> usize {
        self.segments.iter().map(|s| s.lock().unwrap().used).sum()
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}
