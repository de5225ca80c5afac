//! The copy-on-write B-tree map and its pages and cursors.

pub mod cursor;
pub mod map;
pub mod page;

use std::sync::Arc;

use crate::codec::types::DataType;
use crate::error::CResult;
use self::page::Page;

pub use self::map::MvMap;

/// What a map needs from the store that owns it. Implemented by the chunk
/// store; kept as a trait so the tree can be exercised without a file.
pub trait PageStore: Send + Sync {
    /// The version stamped into pages created by mutations right now.
    fn current_version(&self) -> u64;

    /// Versions below this no longer need to stay readable in memory.
    fn retain_version(&self) -> u64;

    /// Pages larger than this many bytes are split on write.
    fn page_split_size(&self) -> usize;

    /// Reads and decodes the page at `pos`, consulting the page cache.
    fn read_page(
        &self,
        map_id: u32,
        pos: u64,
        key_type: &Arc<dyn DataType>,
        value_type: &Arc<dyn DataType>,
    ) -> CResult<Arc<Page>>;

    /// Records that the stored page at `pos` is no longer referenced by the
    /// tree as of `version`. Space accounting happens at the next store.
    fn register_freed_page(&self, version: u64, pos: u64);

    /// A fresh unsaved page came into existence.
    fn on_unsaved_page(&self);

    /// An unsaved page was dropped before ever being written.
    fn on_dropped_unsaved_page(&self);

    /// Root position of the given map in the newest stored chunk whose
    /// version is at most `version`. Used when a snapshot is requested for
    /// a version no longer retained in memory.
    fn map_root_for_version(&self, map_id: u32, version: u64) -> CResult<u64>;
}
