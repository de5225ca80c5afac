//! The copy-on-write B-tree map.
//!
//! A map is an ordered associative store over [`Value`] keys and values.
//! Every mutation copies the pages on the path from the root down and
//! installs a new root stamped with the store's current version; prior
//! roots are retained so snapshot readers can keep traversing old versions.
//! Maps are single-writer: a second concurrent writer is a caller bug and
//! fails immediately.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use crate::btree::cursor::{ChangeCursor, Cursor};
use crate::btree::page::{Page, PageRef};
use crate::btree::PageStore;
use crate::codec::types::{DataType, Value};
use crate::error::{CResult, Error};

/// A root page together with the map version it represents. The version is
/// tracked separately from the page: collapsing the tree can install an
/// untouched older page as the root of a newer version.
#[derive(Clone)]
pub struct RootRef {
    pub version: u64,
    pub page: Arc<Page>,
}

struct MapState {
    root: RootRef,
    /// Previous roots, version ascending.
    old_roots: VecDeque<RootRef>,
}

pub struct MvMap {
    id: u32,
    name: String,
    create_version: u64,
    key_type: Arc<dyn DataType>,
    value_type: Arc<dyn DataType>,
    store: Weak<dyn PageStore>,
    state: RwLock<MapState>,
    writing: AtomicBool,
    closed: AtomicBool,
    read_only: bool,
}

struct WritingGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for WritingGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

enum RemoveResult {
    NotFound,
    /// The page lost its last entry and disappears.
    Emptied(Value),
    Replaced(Page, Value),
}

impl MvMap {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        store: Weak<dyn PageStore>,
        id: u32,
        name: String,
        create_version: u64,
        key_type: Arc<dyn DataType>,
        value_type: Arc<dyn DataType>,
        read_only: bool,
        root: RootRef,
    ) -> Self {
        Self {
            id,
            name,
            create_version,
            key_type,
            value_type,
            store,
            state: RwLock::new(MapState { root, old_roots: VecDeque::new() }),
            writing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            read_only,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn create_version(&self) -> u64 {
        self.create_version
    }

    pub fn key_type(&self) -> &Arc<dyn DataType> {
        &self.key_type
    }

    pub fn value_type(&self) -> &Arc<dyn DataType> {
        &self.value_type
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn store(&self) -> CResult<Arc<dyn PageStore>> {
        self.store.upgrade().ok_or(Error::Closed)
    }

    pub(crate) fn root_ref(&self) -> RootRef {
        self.state.read().unwrap().root.clone()
    }

    /// Number of entries. Constant-time: interior pages carry counts.
    pub fn size(&self) -> u64 {
        self.root_ref().page.total_count()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    // ---- reads ------------------------------------------------------------

    pub fn get(&self, key: &Value) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        self.get_in(&root, key)
    }

    pub(crate) fn get_in(&self, root: &Arc<Page>, key: &Value) -> CResult<Option<Value>> {
        let mut page = root.clone();
        loop {
            let search = self.search(&page, key);
            if page.is_leaf() {
                return Ok(match search {
                    Ok(i) => Some(page.values()[i].clone()),
                    Err(_) => None,
                });
            }
            let idx = match search {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            page = self.child_page(&page, idx)?;
        }
    }

    pub fn contains_key(&self, key: &Value) -> CResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    fn search(&self, page: &Page, key: &Value) -> Result<usize, usize> {
        page.keys().binary_search_by(|probe| self.key_type.compare(probe, key))
    }

    /// Loads the child at `idx`, from memory if it is unsaved or from the
    /// store otherwise.
    pub(crate) fn child_page(&self, page: &Page, idx: usize) -> CResult<Arc<Page>> {
        let child = &page.children()[idx];
        if let Some(p) = child.cached() {
            return Ok(p);
        }
        let pos = child.pos();
        if pos == 0 {
            return Err(Error::Internal("unsaved child page not in memory".to_string()));
        }
        let store = self.store()?;
        store.read_page(self.id, pos, &self.key_type, &self.value_type)
    }

    // ---- navigation -------------------------------------------------------

    pub fn first_key(&self) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        self.key_at_rank_in(&root, 0)
    }

    pub fn last_key(&self) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        let total = root.total_count();
        if total == 0 {
            return Ok(None);
        }
        self.key_at_rank_in(&root, (total - 1) as i64)
    }

    /// Smallest key `>= key`.
    pub fn ceiling_key(&self, key: &Value) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        let rank = self.rank_in(&root, key)?;
        let at = if rank >= 0 { rank } else { -rank - 1 };
        self.key_at_rank_in(&root, at)
    }

    /// Smallest key `> key`.
    pub fn higher_key(&self, key: &Value) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        let rank = self.rank_in(&root, key)?;
        let at = if rank >= 0 { rank + 1 } else { -rank - 1 };
        self.key_at_rank_in(&root, at)
    }

    /// Largest key `<= key`.
    pub fn floor_key(&self, key: &Value) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        let rank = self.rank_in(&root, key)?;
        let at = if rank >= 0 { rank } else { -rank - 2 };
        self.key_at_rank_in(&root, at)
    }

    /// Largest key `< key`.
    pub fn lower_key(&self, key: &Value) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        let rank = self.rank_in(&root, key)?;
        let at = if rank >= 0 { rank - 1 } else { -rank - 2 };
        self.key_at_rank_in(&root, at)
    }

    /// The key at the given rank, or None when out of range.
    pub fn key_at_rank(&self, rank: i64) -> CResult<Option<Value>> {
        let root = self.root_ref().page;
        self.key_at_rank_in(&root, rank)
    }

    pub(crate) fn key_at_rank_in(&self, root: &Arc<Page>, rank: i64) -> CResult<Option<Value>> {
        if rank < 0 || rank as u64 >= root.total_count() {
            return Ok(None);
        }
        let mut remaining = rank as u64;
        let mut page = root.clone();
        loop {
            if page.is_leaf() {
                return Ok(Some(page.key(remaining as usize).clone()));
            }
            let mut idx = 0;
            for child in page.children() {
                if remaining < child.count() {
                    break;
                }
                remaining -= child.count();
                idx += 1;
            }
            page = self.child_page(&page, idx)?;
        }
    }

    /// Rank of `key` if present; otherwise `-(insertion rank) - 1`.
    pub fn rank_of_key(&self, key: &Value) -> CResult<i64> {
        let root = self.root_ref().page;
        self.rank_in(&root, key)
    }

    pub(crate) fn rank_in(&self, root: &Arc<Page>, key: &Value) -> CResult<i64> {
        let mut rank: u64 = 0;
        let mut page = root.clone();
        loop {
            let search = self.search(&page, key);
            if page.is_leaf() {
                return Ok(match search {
                    Ok(i) => (rank + i as u64) as i64,
                    Err(i) => -((rank + i as u64) as i64) - 1,
                });
            }
            let idx = match search {
                Ok(i) => i + 1,
                Err(i) => i,
            };
            for child in &page.children()[..idx] {
                rank += child.count();
            }
            page = self.child_page(&page, idx)?;
        }
    }

    /// An ordered cursor over entries, starting at `from` (or the first
    /// key). Supports `skip(n)` in O(log n) through the per-level counts.
    pub fn cursor(&self, from: Option<&Value>) -> CResult<Cursor<'_>> {
        let root = self.root_ref().page;
        Cursor::new(self, root, from)
    }

    /// Keys whose containing pages differ from the retained root of
    /// `old_version`.
    pub fn changes_since(&self, old_version: u64) -> CResult<ChangeCursor<'_>> {
        let old = self
            .root_for_version(old_version)
            .ok_or_else(|| Error::UnknownVersion(format!("version {}", old_version)))?;
        let new = self.root_ref();
        ChangeCursor::new(self, new.page, old.page)
    }

    // ---- writes -----------------------------------------------------------

    fn begin_write(&self) -> CResult<WritingGuard<'_>> {
        if self.read_only {
            return Err(Error::ReadOnly(format!("map {:?}", self.name)));
        }
        if self.is_closed() {
            return Err(Error::Closed);
        }
        if self.writing.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err()
        {
            return Err(Error::ConcurrentModification(format!("map {:?}", self.name)));
        }
        Ok(WritingGuard { flag: &self.writing })
    }

    /// Adds or replaces an entry, returning the previous value.
    pub fn put(&self, key: Value, value: Value) -> CResult<Option<Value>> {
        let _guard = self.begin_write()?;
        self.put_internal(key, value)
    }

    /// Adds the entry only when the key is absent; returns the existing
    /// value otherwise.
    pub fn put_if_absent(&self, key: Value, value: Value) -> CResult<Option<Value>> {
        let _guard = self.begin_write()?;
        let existing = self.get(&key)?;
        if existing.is_some() {
            return Ok(existing);
        }
        self.put_internal(key, value)?;
        Ok(None)
    }

    /// Replaces the value only when the current value equals `old`.
    pub fn replace(&self, key: &Value, old: &Value, new: Value) -> CResult<bool> {
        let _guard = self.begin_write()?;
        match self.get(key)? {
            Some(current) if &current == old => {
                self.put_internal(key.clone(), new)?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Removes an entry, returning the previous value.
    pub fn remove(&self, key: &Value) -> CResult<Option<Value>> {
        let _guard = self.begin_write()?;
        self.remove_internal(key)
    }

    /// Removes all entries.
    pub fn clear(&self) -> CResult<()> {
        let _guard = self.begin_write()?;
        let store = self.store()?;
        let version = store.current_version();
        let root = self.root_ref().page;
        self.free_tree(&store, &root)?;
        store.on_unsaved_page();
        self.install_root(version, Arc::new(Page::empty_leaf(self.id, version)));
        Ok(())
    }

    /// Registers every page of the subtree as freed.
    fn free_tree(&self, store: &Arc<dyn PageStore>, page: &Arc<Page>) -> CResult<()> {
        if !page.is_leaf() {
            for i in 0..page.children().len() {
                let child = &page.children()[i];
                if child.pos() == 0 || !crate::storage::pos_is_leaf(child.pos()) {
                    let child_page = self.child_page(page, i)?;
                    self.free_tree(store, &child_page)?;
                } else {
                    store.register_freed_page(store.current_version(), child.pos());
                }
            }
        }
        self.remove_page(store, page);
        Ok(())
    }

    fn put_internal(&self, key: Value, value: Value) -> CResult<Option<Value>> {
        if value.is_null() {
            return Err(Error::Internal("value must not be null".to_string()));
        }
        let store = self.store()?;
        let version = store.current_version();
        let root = self.root_ref().page;
        let (mut new_root, old) = self.insert_into(&store, &root, version, &key, &value)?;
        if self.needs_split(&store, &new_root) {
            let (left, sep, right) = self.split_page(&store, new_root, version);
            let left = Arc::new(left);
            let right = Arc::new(right);
            store.on_unsaved_page();
            new_root = Page::new_node(
                self.id,
                version,
                vec![sep],
                vec![PageRef::new(left), PageRef::new(right)],
            );
        }
        self.install_root(version, Arc::new(new_root));
        Ok(old)
    }

    fn needs_split(&self, store: &Arc<dyn PageStore>, page: &Page) -> bool {
        page.key_count() > 1 && page.memory() > store.page_split_size()
    }

    /// Splits a freshly built page around its median key.
    fn split_page(&self, store: &Arc<dyn PageStore>, page: Page, version: u64) -> (Page, Value, Page) {
        store.on_unsaved_page();
        let mut keys = page.keys().to_vec();
        let mid = keys.len() / 2;
        if page.is_leaf() {
            let mut values = page.values().to_vec();
            let right_keys = keys.split_off(mid);
            let right_values = values.split_off(mid);
            let sep = right_keys[0].clone();
            (
                Page::new_leaf(self.id, version, keys, values),
                sep,
                Page::new_leaf(self.id, version, right_keys, right_values),
            )
        } else {
            let mut children: Vec<PageRef> = Vec::with_capacity(page.children().len());
            for c in page.children() {
                children.push(PageRef::from_pos(c.pos(), c.count()));
                if let Some(p) = c.cached() {
                    children.last().unwrap().set_cached(p);
                }
            }
            let mut right_keys = keys.split_off(mid);
            let sep = right_keys.remove(0);
            let right_children = children.split_off(mid + 1);
            (
                Page::new_node(self.id, version, keys, children),
                sep,
                Page::new_node(self.id, version, right_keys, right_children),
            )
        }
    }

    fn insert_into(
        &self,
        store: &Arc<dyn PageStore>,
        page: &Arc<Page>,
        version: u64,
        key: &Value,
        value: &Value,
    ) -> CResult<(Page, Option<Value>)> {
        let search = self.search(page, key);
        if page.is_leaf() {
            let mut keys = page.keys().to_vec();
            let mut values = page.values().to_vec();
            let old = match search {
                Ok(i) => Some(std::mem::replace(&mut values[i], value.clone())),
                Err(i) => {
                    keys.insert(i, key.clone());
                    values.insert(i, value.clone());
                    None
                }
            };
            self.remove_page(store, page);
            store.on_unsaved_page();
            return Ok((Page::new_leaf(self.id, version, keys, values), old));
        }

        let idx = match search {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let child = self.child_page(page, idx)?;
        let (new_child, old) = self.insert_into(store, &child, version, key, value)?;

        let mut keys = page.keys().to_vec();
        let mut children: Vec<PageRef> = page.children().iter().map(|c| {
            let r = PageRef::from_pos(c.pos(), c.count());
            if let Some(p) = c.cached() {
                r.set_cached(p);
            }
            r
        }).collect();

        if self.needs_split(store, &new_child) {
            let (left, sep, right) = self.split_page(store, new_child, version);
            children[idx] = PageRef::new(Arc::new(left));
            keys.insert(idx, sep);
            children.insert(idx + 1, PageRef::new(Arc::new(right)));
        } else {
            children[idx] = PageRef::new(Arc::new(new_child));
        }
        self.remove_page(store, page);
        store.on_unsaved_page();
        Ok((Page::new_node(self.id, version, keys, children), old))
    }

    fn remove_internal(&self, key: &Value) -> CResult<Option<Value>> {
        let store = self.store()?;
        let version = store.current_version();
        let root = self.root_ref().page;
        match self.remove_from(&store, &root, version, key)? {
            RemoveResult::NotFound => Ok(None),
            RemoveResult::Emptied(old) => {
                store.on_unsaved_page();
                self.install_root(version, Arc::new(Page::empty_leaf(self.id, version)));
                Ok(Some(old))
            }
            RemoveResult::Replaced(page, old) => {
                // collapse a root that has a single remaining child
                let new_root = if !page.is_leaf() && page.key_count() == 0 {
                    let page = Arc::new(page);
                    let child = self.child_page(&page, 0)?;
                    self.remove_page(&store, &page);
                    child
                } else {
                    Arc::new(page)
                };
                self.install_root(version, new_root);
                Ok(Some(old))
            }
        }
    }

    fn remove_from(
        &self,
        store: &Arc<dyn PageStore>,
        page: &Arc<Page>,
        version: u64,
        key: &Value,
    ) -> CResult<RemoveResult> {
        let search = self.search(page, key);
        if page.is_leaf() {
            let i = match search {
                Ok(i) => i,
                Err(_) => return Ok(RemoveResult::NotFound),
            };
            if page.key_count() == 1 {
                let old = page.values()[0].clone();
                self.remove_page(store, page);
                return Ok(RemoveResult::Emptied(old));
            }
            let mut keys = page.keys().to_vec();
            let mut values = page.values().to_vec();
            keys.remove(i);
            let old = values.remove(i);
            self.remove_page(store, page);
            store.on_unsaved_page();
            return Ok(RemoveResult::Replaced(Page::new_leaf(self.id, version, keys, values), old));
        }

        let idx = match search {
            Ok(i) => i + 1,
            Err(i) => i,
        };
        let child = self.child_page(page, idx)?;
        let result = self.remove_from(store, &child, version, key)?;
        match result {
            RemoveResult::NotFound => Ok(RemoveResult::NotFound),
            RemoveResult::Emptied(old) => {
                // the child vanished: drop its entry and a separating key
                let mut keys = page.keys().to_vec();
                let mut children: Vec<PageRef> = page.children().iter().map(|c| {
                    let r = PageRef::from_pos(c.pos(), c.count());
                    if let Some(p) = c.cached() {
                        r.set_cached(p);
                    }
                    r
                }).collect();
                children.remove(idx);
                if children.is_empty() {
                    self.remove_page(store, page);
                    return Ok(RemoveResult::Emptied(old));
                }
                if !keys.is_empty() {
                    keys.remove(idx.min(keys.len() - 1));
                }
                self.remove_page(store, page);
                store.on_unsaved_page();
                Ok(RemoveResult::Replaced(
                    Page::new_node(self.id, version, keys, children),
                    old,
                ))
            }
            RemoveResult::Replaced(new_child, old) => {
                let keys = page.keys().to_vec();
                let mut children: Vec<PageRef> = page.children().iter().map(|c| {
                    let r = PageRef::from_pos(c.pos(), c.count());
                    if let Some(p) = c.cached() {
                        r.set_cached(p);
                    }
                    r
                }).collect();
                children[idx] = PageRef::new(Arc::new(new_child));
                self.remove_page(store, page);
                store.on_unsaved_page();
                Ok(RemoveResult::Replaced(
                    Page::new_node(self.id, version, keys, children),
                    old,
                ))
            }
        }
    }

    /// Detaches a page from the tree: unsaved pages adjust the unsaved
    /// counter, stored pages are queued for space accounting.
    fn remove_page(&self, store: &Arc<dyn PageStore>, page: &Arc<Page>) {
        let pos = page.pos();
        if pos == 0 {
            store.on_dropped_unsaved_page();
        } else {
            store.register_freed_page(store.current_version(), pos);
        }
    }

    // ---- roots and versions -----------------------------------------------

    pub(crate) fn install_root(&self, version: u64, page: Arc<Page>) {
        let mut state = self.state.write().unwrap();
        if state.root.version < version {
            let prior = state.root.clone();
            state.old_roots.push_back(prior);
        }
        state.root = RootRef { version, page };
    }

    /// The newest retained root with version at most `version`, if any.
    pub(crate) fn root_for_version(&self, version: u64) -> Option<RootRef> {
        let state = self.state.read().unwrap();
        if state.root.version <= version {
            return Some(state.root.clone());
        }
        // old_roots is sorted ascending by version
        let mut found = None;
        for r in state.old_roots.iter() {
            if r.version <= version {
                found = Some(r.clone());
            } else {
                break;
            }
        }
        found
    }

    /// A read-only view of the map at `version`. Falls back to the store
    /// when the version is no longer retained in memory.
    pub fn open_version(&self, version: u64) -> CResult<Arc<MvMap>> {
        let store = self.store()?;
        if version > store.current_version() {
            return Err(Error::UnknownVersion(format!(
                "version {} is newer than the store", version
            )));
        }
        if version < self.create_version {
            return Err(Error::UnknownVersion(format!(
                "map {:?} did not exist at version {}",
                self.name, version
            )));
        }
        let root = match self.root_for_version(version) {
            Some(r) => r,
            None => {
                let pos = store.map_root_for_version(self.id, version)?;
                let page = if pos == 0 {
                    Arc::new(Page::empty_leaf(self.id, version))
                } else {
                    store.read_page(self.id, pos, &self.key_type, &self.value_type)?
                };
                RootRef { version, page }
            }
        };
        Ok(Arc::new(MvMap::new(
            self.store.clone(),
            self.id,
            self.name.clone(),
            self.create_version,
            self.key_type.clone(),
            self.value_type.clone(),
            true,
            root,
        )))
    }

    /// Drops retained roots older than the store's retain version.
    pub fn remove_unused_old_versions(&self) -> CResult<()> {
        let retain = self.store()?.retain_version();
        let mut state = self.state.write().unwrap();
        while let Some(front) = state.old_roots.front() {
            if front.version < retain {
                state.old_roots.pop_front();
            } else {
                break;
            }
        }
        Ok(())
    }

    /// Installs `page` as the root for `version`, dropping all retained
    /// roots. Used when the root is reloaded from the file.
    pub(crate) fn reset_root(&self, version: u64, page: Arc<Page>) {
        let mut state = self.state.write().unwrap();
        state.old_roots.clear();
        state.root = RootRef { version, page };
    }

    /// Restores the newest root with version at most `version`. Returns
    /// false when the map has no such root (it was created later).
    pub(crate) fn rollback_root(&self, version: u64) -> bool {
        let mut state = self.state.write().unwrap();
        if state.root.version <= version {
            return true;
        }
        while let Some(back) = state.old_roots.back() {
            if back.version <= version {
                state.root = state.old_roots.pop_back().unwrap();
                return true;
            }
            state.old_roots.pop_back();
        }
        false
    }
}

impl std::fmt::Display for MvMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "map {:?} (id {})", self.name, self.id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::codec::types::AnyType;

    /// A store stub: versions tick, nothing ever reaches a file.
    struct StubStore {
        version: AtomicU64,
        split: usize,
    }

    impl StubStore {
        fn bump(&self) -> u64 {
            self.version.fetch_add(1, Ordering::SeqCst) + 1
        }
    }

    impl PageStore for StubStore {
        fn current_version(&self) -> u64 {
            self.version.load(Ordering::SeqCst)
        }

        fn retain_version(&self) -> u64 {
            0
        }

        fn page_split_size(&self) -> usize {
            self.split
        }

        fn read_page(
            &self,
            _map_id: u32,
            pos: u64,
            _key_type: &Arc<dyn DataType>,
            _value_type: &Arc<dyn DataType>,
        ) -> CResult<Arc<Page>> {
            Err(Error::Internal(format!("no file behind position {:x}", pos)))
        }

        fn register_freed_page(&self, _version: u64, _pos: u64) {}

        fn on_unsaved_page(&self) {}

        fn on_dropped_unsaved_page(&self) {}

        fn map_root_for_version(&self, _map_id: u32, version: u64) -> CResult<u64> {
            Err(Error::UnknownVersion(format!("version {}", version)))
        }
    }

    fn setup(split: usize) -> (Arc<StubStore>, MvMap) {
        let store = Arc::new(StubStore { version: AtomicU64::new(0), split });
        let as_dyn: Arc<dyn PageStore> = store.clone();
        let map = MvMap::new(
            Arc::downgrade(&as_dyn),
            1,
            "data".to_string(),
            0,
            Arc::new(AnyType),
            Arc::new(AnyType),
            false,
            RootRef { version: 0, page: Arc::new(Page::empty_leaf(1, 0)) },
        );
        (store, map)
    }

    fn long(v: i64) -> Value {
        Value::Long(v)
    }

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    #[test]
    fn point_ops() -> CResult<()> {
        let (_store, m) = setup(6 * 1024);

        assert_eq!(m.get(&long(1))?, None);
        assert_eq!(m.put(long(1), text("a"))?, None);
        assert_eq!(m.get(&long(1))?, Some(text("a")));
        assert_eq!(m.put(long(1), text("b"))?, Some(text("a")));
        assert_eq!(m.get(&long(1))?, Some(text("b")));
        assert_eq!(m.size(), 1);

        assert_eq!(m.remove(&long(2))?, None);
        assert_eq!(m.remove(&long(1))?, Some(text("b")));
        assert_eq!(m.get(&long(1))?, None);
        assert!(m.is_empty());
        Ok(())
    }

    #[test]
    fn null_value_rejected() {
        let (_store, m) = setup(6 * 1024);
        assert!(m.put(long(1), Value::Null).is_err());
    }

    #[test]
    fn put_if_absent_and_replace() -> CResult<()> {
        let (_store, m) = setup(6 * 1024);
        assert_eq!(m.put_if_absent(long(1), text("a"))?, None);
        assert_eq!(m.put_if_absent(long(1), text("b"))?, Some(text("a")));
        assert_eq!(m.get(&long(1))?, Some(text("a")));

        assert!(!m.replace(&long(1), &text("x"), text("c"))?);
        assert!(m.replace(&long(1), &text("a"), text("c"))?);
        assert_eq!(m.get(&long(1))?, Some(text("c")));
        assert!(!m.replace(&long(2), &text("a"), text("c"))?);
        Ok(())
    }

    #[test]
    fn navigation() -> CResult<()> {
        let (_store, m) = setup(256);
        for i in (0..100).map(|i| i * 2) {
            m.put(long(i), long(i))?;
        }
        // present key
        assert_eq!(m.ceiling_key(&long(10))?, Some(long(10)));
        assert_eq!(m.floor_key(&long(10))?, Some(long(10)));
        assert_eq!(m.higher_key(&long(10))?, Some(long(12)));
        assert_eq!(m.lower_key(&long(10))?, Some(long(8)));
        // absent key between entries
        assert_eq!(m.ceiling_key(&long(11))?, Some(long(12)));
        assert_eq!(m.floor_key(&long(11))?, Some(long(10)));
        assert_eq!(m.higher_key(&long(11))?, Some(long(12)));
        assert_eq!(m.lower_key(&long(11))?, Some(long(10)));
        // boundaries
        assert_eq!(m.first_key()?, Some(long(0)));
        assert_eq!(m.last_key()?, Some(long(198)));
        assert_eq!(m.lower_key(&long(0))?, None);
        assert_eq!(m.higher_key(&long(198))?, None);
        assert_eq!(m.ceiling_key(&long(199))?, None);
        assert_eq!(m.floor_key(&long(-1))?, None);
        Ok(())
    }

    #[test]
    fn rank_and_key() -> CResult<()> {
        let (_store, m) = setup(256);
        let keys: Vec<i64> = (0..500).map(|i| i * 3).collect();
        for &k in &keys {
            m.put(long(k), long(k))?;
        }
        for (rank, &k) in keys.iter().enumerate() {
            assert_eq!(m.rank_of_key(&long(k))?, rank as i64);
            assert_eq!(m.key_at_rank(rank as i64)?, Some(long(k)));
        }
        // absent keys report the negated insertion rank
        assert_eq!(m.rank_of_key(&long(-5))?, -1);
        assert_eq!(m.rank_of_key(&long(1))?, -2);
        assert_eq!(m.rank_of_key(&long(4))?, -3);
        assert_eq!(m.key_at_rank(-1)?, None);
        assert_eq!(m.key_at_rank(keys.len() as i64)?, None);
        Ok(())
    }

    #[test]
    fn cursor_and_skip() -> CResult<()> {
        let (_store, m) = setup(256);
        for i in 0..300 {
            m.put(long(i), long(i * 10))?;
        }
        let mut c = m.cursor(None)?;
        assert_eq!(c.next().unwrap()?, (long(0), long(0)));
        assert_eq!(c.next().unwrap()?, (long(1), long(10)));
        Cursor::skip(&mut c, 100);
        assert_eq!(c.next().unwrap()?, (long(102), long(1020)));

        // bounded start
        let c = m.cursor(Some(&long(250)))?;
        let rest: Vec<_> = c.collect::<CResult<Vec<_>>>()?;
        assert_eq!(rest.len(), 50);
        assert_eq!(rest[0].0, long(250));

        // start between keys
        m.remove(&long(260))?;
        let mut c = m.cursor(Some(&long(260)))?;
        assert_eq!(c.next().unwrap()?.0, long(261));
        Ok(())
    }

    #[test]
    fn snapshot_isolation_in_memory() -> CResult<()> {
        let (store, m) = setup(256);
        for i in 0..50 {
            m.put(long(i), text("v0"))?;
        }
        let v0 = store.current_version();
        store.bump();
        for i in 0..50 {
            m.put(long(i), text("v1"))?;
        }
        m.remove(&long(49))?;

        let snap = m.open_version(v0)?;
        for i in 0..50 {
            assert_eq!(snap.get(&long(i))?, Some(text("v0")));
        }
        assert_eq!(m.get(&long(0))?, Some(text("v1")));
        assert_eq!(m.get(&long(49))?, None);

        // snapshots are read-only
        assert!(matches!(snap.put(long(1), text("x")), Err(Error::ReadOnly(_))));
        Ok(())
    }

    #[test]
    fn rollback_root_restores() -> CResult<()> {
        let (store, m) = setup(256);
        m.put(long(1), text("one"))?;
        let v0 = store.current_version();
        store.bump();
        m.put(long(1), text("uno"))?;
        m.put(long(2), text("dos"))?;

        assert!(m.rollback_root(v0));
        assert_eq!(m.get(&long(1))?, Some(text("one")));
        assert_eq!(m.get(&long(2))?, None);
        Ok(())
    }

    #[test]
    fn changes_since_yields_new_keys() -> CResult<()> {
        let (store, m) = setup(256);
        m.put(long(1), text("a"))?;
        let v0 = store.current_version();
        store.bump();
        m.put(long(2), text("b"))?;

        let changed: Vec<Value> = m.changes_since(v0)?.collect::<CResult<Vec<_>>>()?;
        assert!(changed.contains(&long(2)));
        Ok(())
    }

    #[test]
    fn random_ops_against_reference() -> CResult<()> {
        use rand::{Rng, SeedableRng};

        const NUM_OPS: usize = 2000;
        let seed: u64 = rand::thread_rng().gen();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        println!("seed = {}", seed);

        let (_store, m) = setup(512);
        let mut reference = std::collections::BTreeMap::new();

        for _ in 0..NUM_OPS {
            let key = rng.gen_range(0..500i64);
            match rng.gen_range(0..3) {
                0 | 1 => {
                    let value = rng.gen_range(0..1_000_000i64);
                    let old = m.put(long(key), long(value))?;
                    assert_eq!(old, reference.insert(key, value).map(long), "seed {}", seed);
                }
                _ => {
                    let old = m.remove(&long(key))?;
                    assert_eq!(old, reference.remove(&key).map(long), "seed {}", seed);
                }
            }
        }

        // final state must match exactly, in order
        assert_eq!(m.size(), reference.len() as u64);
        let entries: Vec<(Value, Value)> = m.cursor(None)?.collect::<CResult<Vec<_>>>()?;
        let expected: Vec<(Value, Value)> =
            reference.iter().map(|(k, v)| (long(*k), long(*v))).collect();
        assert_eq!(entries, expected, "seed {}", seed);

        // ranks agree with in-order position
        for (rank, (k, _)) in expected.iter().enumerate() {
            assert_eq!(m.rank_of_key(k)?, rank as i64, "seed {}", seed);
        }
        Ok(())
    }

    #[test]
    fn clear_empties() -> CResult<()> {
        let (_store, m) = setup(256);
        for i in 0..200 {
            m.put(long(i), long(i))?;
        }
        m.clear()?;
        assert!(m.is_empty());
        assert_eq!(m.first_key()?, None);
        Ok(())
    }
}
