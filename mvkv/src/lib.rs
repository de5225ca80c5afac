//! `mvkv` is a log-structured, multi-version key-value store.
//! Data lives in a forest of copy-on-write B-tree maps sharing one
//! append-oriented file. Every commit writes the changed pages as a new
//! self-describing chunk and installs it atomically, so the file always
//! holds a consistent committed version, and older versions stay readable
//! as snapshots. An optional transaction layer adds an undo log and
//! per-row version stamps for multi-map transactions with optimistic
//! conflict detection.
//!
//! ## Getting started
//!
//! ```no_run
//! use mvkv::error::CResult;
//! use mvkv::store::StoreBuilder;
//! use mvkv::Value;
//!
//! fn main() -> CResult<()> {
//!     let store = StoreBuilder::new().file_name("data.mv").open()?;
//!     let map = store.open_map("data")?;
//!
//!     map.put(Value::Long(1), Value::Text("Hello".into()))?;
//!     map.put(Value::Long(2), Value::Text("World".into()))?;
//!     let v1 = store.commit()?;
//!
//!     map.put(Value::Long(1), Value::Text("Hi".into()))?;
//!     store.commit()?;
//!
//!     // the old version stays readable as a snapshot
//!     let old = map.open_version(v1)?;
//!     assert_eq!(old.get(&Value::Long(1))?, Some(Value::Text("Hello".into())));
//!     assert_eq!(map.get(&Value::Long(1))?, Some(Value::Text("Hi".into())));
//!
//!     store.close()
//! }
//! ```

pub mod btree;
pub mod codec;
pub mod error;
pub mod mvcc;
pub mod storage;
pub mod store;

pub use btree::MvMap;
pub use codec::types::Value;
pub use error::{CResult, Error};
pub use mvcc::{Transaction, TransactionMap, TransactionStore, TxStatus};
pub use store::{Store, StoreBuilder};

#[cfg(test)]
mod test {
    use crate::error::CResult;
    use crate::store::StoreBuilder;
    use crate::TransactionStore;
    use crate::Value;

    #[test]
    fn run() -> CResult<()> {
        let path = tempdir::TempDir::new("demo")?.path().join("mvdb");

        let store = StoreBuilder::new().file_name(&path).write_delay(0).open()?;
        let map = store.open_map("data")?;
        map.put(Value::Long(1), Value::Text("Hello".into()))?;
        map.put(Value::Long(2), Value::Text("World".into()))?;
        let v1 = store.commit()?;

        map.put(Value::Long(1), Value::Text("Hi".into()))?;
        map.remove(&Value::Long(2))?;
        store.commit()?;

        let old = map.open_version(v1)?;
        assert_eq!(old.get(&Value::Long(1))?, Some(Value::Text("Hello".into())));
        assert_eq!(old.get(&Value::Long(2))?, Some(Value::Text("World".into())));
        assert_eq!(map.get(&Value::Long(1))?, Some(Value::Text("Hi".into())));
        assert_eq!(map.get(&Value::Long(2))?, None);

        // the same store through the transaction layer
        store.close()?;
        drop(old);
        drop(map);
        drop(store);

        let store = StoreBuilder::new().file_name(&path).write_delay(0).open()?;
        let ts = TransactionStore::new(store)?;
        let tx = ts.begin()?;
        let m = tx.open_map("data")?;
        assert_eq!(m.get(&Value::Long(1))?, Some(Value::Text("Hi".into())));
        m.put(Value::Text("greeting".into()), Value::Text("Hello, tx!".into()))?;
        tx.commit()?;

        let check = ts.begin()?.open_map("data")?;
        assert_eq!(
            check.get(&Value::Text("greeting".into()))?,
            Some(Value::Text("Hello, tx!".into()))
        );
        Ok(())
    }
}
