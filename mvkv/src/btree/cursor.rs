//! Ordered cursors over a map: the entry cursor with rank-based `skip`,
//! and the change cursor that diffs two versions by page position.

use std::collections::HashSet;
use std::sync::Arc;

use crate::btree::map::MvMap;
use crate::btree::page::Page;
use crate::codec::types::Value;
use crate::error::CResult;
use crate::storage::pos_is_leaf;

/// An ordered cursor over the entries of one root, anchored at creation.
/// Further writes to the map do not affect it.
pub struct Cursor<'a> {
    map: &'a MvMap,
    root: Arc<Page>,
    /// Path from the root to the current leaf; the leaf entry holds the
    /// next key index, interior entries hold the active child index.
    stack: Vec<(Arc<Page>, usize)>,
    next_rank: u64,
    total: u64,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(map: &'a MvMap, root: Arc<Page>, from: Option<&Value>) -> CResult<Self> {
        let total = root.total_count();
        let next_rank = match from {
            None => 0,
            Some(key) => {
                let rank = map.rank_in(&root, key)?;
                if rank >= 0 {
                    rank as u64
                } else {
                    (-rank - 1) as u64
                }
            }
        };
        Ok(Self { map, root, stack: Vec::new(), next_rank, total })
    }

    /// Skips the next `n` entries in O(log n): the path is rebuilt through
    /// the per-level entry counts instead of walking leaves.
    pub fn skip(&mut self, n: u64) {
        self.next_rank = self.next_rank.saturating_add(n);
        self.stack.clear();
    }

    fn build_stack(&mut self) -> CResult<()> {
        self.stack.clear();
        let mut remaining = self.next_rank;
        let mut page = self.root.clone();
        loop {
            if page.is_leaf() {
                self.stack.push((page, remaining as usize));
                return Ok(());
            }
            let mut idx = 0;
            for child in page.children() {
                if remaining < child.count() {
                    break;
                }
                remaining -= child.count();
                idx += 1;
            }
            let child = self.map.child_page(&page, idx)?;
            self.stack.push((page, idx));
            page = child;
        }
    }

    fn advance(&mut self) -> CResult<()> {
        if let Some(top) = self.stack.last_mut() {
            top.1 += 1;
            if top.1 < top.0.key_count() {
                return Ok(());
            }
        }
        self.stack.pop();
        loop {
            let (node, next_idx) = match self.stack.last() {
                None => return Ok(()),
                Some((n, i)) => (n.clone(), i + 1),
            };
            if next_idx < node.children().len() {
                self.stack.last_mut().unwrap().1 = next_idx;
                let mut page = self.map.child_page(&node, next_idx)?;
                loop {
                    if page.is_leaf() {
                        self.stack.push((page, 0));
                        return Ok(());
                    }
                    let child = self.map.child_page(&page, 0)?;
                    self.stack.push((page, 0));
                    page = child;
                }
            }
            self.stack.pop();
        }
    }

    fn try_next(&mut self) -> CResult<Option<(Value, Value)>> {
        if self.next_rank >= self.total {
            return Ok(None);
        }
        if self.stack.is_empty() {
            self.build_stack()?;
        }
        let (leaf, i) = self.stack.last().map(|(p, i)| (p.clone(), *i)).unwrap();
        let key = leaf.key(i).clone();
        let value = leaf.values()[i].clone();
        self.next_rank += 1;
        self.advance()?;
        Ok(Some((key, value)))
    }
}

impl Iterator for Cursor<'_> {
    type Item = CResult<(Value, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}

/// Yields the keys of the current root that live in pages the root of an
/// older version does not share. Subtrees whose page position appears in
/// the old version are pruned without being read.
pub struct ChangeCursor<'a> {
    map: &'a MvMap,
    stack: Vec<(Arc<Page>, usize)>,
    old_positions: HashSet<u64>,
}

impl<'a> ChangeCursor<'a> {
    pub(crate) fn new(map: &'a MvMap, new_root: Arc<Page>, old_root: Arc<Page>) -> CResult<Self> {
        let mut old_positions = HashSet::new();
        Self::collect_positions(map, &old_root, &mut old_positions)?;
        let stack = if new_root.pos() != 0 && old_positions.contains(&new_root.pos()) {
            Vec::new()
        } else {
            vec![(new_root, 0)]
        };
        Ok(Self { map, stack, old_positions })
    }

    /// Collects every page position of the old tree. Only interior pages
    /// are read: leaf positions come from their parents.
    fn collect_positions(
        map: &MvMap,
        page: &Arc<Page>,
        set: &mut HashSet<u64>,
    ) -> CResult<()> {
        if page.pos() != 0 {
            set.insert(page.pos());
        }
        if !page.is_leaf() {
            for i in 0..page.children().len() {
                let pos = page.children()[i].pos();
                if pos != 0 && pos_is_leaf(pos) {
                    set.insert(pos);
                } else {
                    let child = map.child_page(page, i)?;
                    Self::collect_positions(map, &child, set)?;
                }
            }
        }
        Ok(())
    }

    fn try_next(&mut self) -> CResult<Option<Value>> {
        loop {
            let (page, idx) = match self.stack.last() {
                None => return Ok(None),
                Some((p, i)) => (p.clone(), *i),
            };
            if page.is_leaf() {
                if idx < page.key_count() {
                    self.stack.last_mut().unwrap().1 += 1;
                    return Ok(Some(page.key(idx).clone()));
                }
                self.stack.pop();
                continue;
            }
            if idx >= page.children().len() {
                self.stack.pop();
                continue;
            }
            self.stack.last_mut().unwrap().1 += 1;
            let child_pos = page.children()[idx].pos();
            if child_pos != 0 && self.old_positions.contains(&child_pos) {
                continue;
            }
            let child = self.map.child_page(&page, idx)?;
            self.stack.push((child, 0));
        }
    }
}

impl Iterator for ChangeCursor<'_> {
    type Item = CResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.try_next().transpose()
    }
}
