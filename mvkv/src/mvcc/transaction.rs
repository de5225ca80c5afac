//! Transactions, the transactional map view, and the shared transaction
//! store state.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::btree::MvMap;
use crate::codec::types::Value;
use crate::error::{CResult, Error};
use crate::mvcc::{op_id, op_log, op_tx, TxId, OP_REMOVE, OP_SET};
use crate::store::{Store, MAX_UNSAVED_PAGES};

const DEFAULT_LOCK_TIMEOUT_MS: u64 = 2000;
/// Transaction ids are persisted in batches, so a reopen can never reuse
/// an id that was handed out before a crash.
const TX_ID_RESERVE: u64 = 64;

const OPEN_TXNS_MAP: &str = "tx.open";
const UNDO_LOG_MAP: &str = "tx.undoLog";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxStatus {
    Open = 0,
    Prepared = 1,
    Closed = 2,
}

impl TxStatus {
    fn from_i64(v: i64) -> CResult<Self> {
        match v {
            0 => Ok(TxStatus::Open),
            1 => Ok(TxStatus::Prepared),
            2 => Ok(TxStatus::Closed),
            other => Err(Error::FileCorrupt(format!("bad transaction status {}", other))),
        }
    }
}

/// The transaction layer over one store. Undo log and open-transaction
/// registry are ordinary maps of that store, so they share its durability.
pub struct TransactionStore {
    inner: Arc<TxStoreInner>,
}

struct TxStoreInner {
    store: Store,
    open_txns: Arc<MvMap>,
    undo_log: Arc<MvMap>,
    /// Serializes all transactional writes; readers never take it.
    write_lock: Mutex<()>,
    open_ids: Mutex<HashSet<TxId>>,
    last_tx_id: AtomicU64,
    reserved_tx_id: AtomicU64,
    lock_timeout_ms: AtomicU64,
}

struct TxInner {
    id: TxId,
    status: AtomicU8,
    name: Mutex<Option<String>>,
    /// The next undo-log slot of this transaction.
    log_id: AtomicU64,
}

/// A transaction handle. Cheap to clone; all clones share the state.
#[derive(Clone)]
pub struct Transaction {
    store: Arc<TxStoreInner>,
    inner: Arc<TxInner>,
}

/// A transactional view over one underlying map.
#[derive(Clone)]
pub struct TransactionMap {
    store: Arc<TxStoreInner>,
    tx: Arc<TxInner>,
    map: Arc<MvMap>,
    /// Own writes at or above this log id are invisible; `u64::MAX` means
    /// all own writes are visible.
    read_log_id: u64,
}

impl TransactionStore {
    /// Wraps a store and recovers transactions left open by an earlier
    /// session.
    pub fn new(store: Store) -> CResult<Self> {
        let open_txns = store.open_map(OPEN_TXNS_MAP)?;
        let undo_log = store.open_map(UNDO_LOG_MAP)?;

        let mut open_ids = HashSet::new();
        let mut max_open = 0u64;
        let mut cursor_key: Option<Value> = None;
        loop {
            let next = match &cursor_key {
                None => open_txns.first_key()?,
                Some(k) => open_txns.higher_key(k)?,
            };
            let key = match next {
                Some(k) => k,
                None => break,
            };
            let id = key.as_long()? as u64;
            open_ids.insert(id);
            max_open = max_open.max(id);
            cursor_key = Some(key);
        }

        let reserved = store.get_meta_setting("lastTransaction")?.unwrap_or(0);
        let last = reserved.max(max_open);
        Ok(Self {
            inner: Arc::new(TxStoreInner {
                store,
                open_txns,
                undo_log,
                write_lock: Mutex::new(()),
                open_ids: Mutex::new(open_ids),
                last_tx_id: AtomicU64::new(last),
                reserved_tx_id: AtomicU64::new(reserved),
                lock_timeout_ms: AtomicU64::new(DEFAULT_LOCK_TIMEOUT_MS),
            }),
        })
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// How long a conflicting write retries before failing.
    pub fn set_lock_timeout(&self, ms: u64) {
        self.inner.lock_timeout_ms.store(ms, Ordering::Release);
    }

    /// Starts a new transaction.
    pub fn begin(&self) -> CResult<Transaction> {
        let id = self.inner.last_tx_id.fetch_add(1, Ordering::AcqRel) + 1;
        let reserved = self.inner.reserved_tx_id.load(Ordering::Acquire);
        if id >= reserved {
            let new_reserved = id + TX_ID_RESERVE;
            self.inner.store.set_meta_setting("lastTransaction", new_reserved)?;
            self.inner.reserved_tx_id.store(new_reserved, Ordering::Release);
        }
        Ok(Transaction {
            store: self.inner.clone(),
            inner: Arc::new(TxInner {
                id,
                status: AtomicU8::new(TxStatus::Open as u8),
                name: Mutex::new(None),
                log_id: AtomicU64::new(0),
            }),
        })
    }

    /// Transactions that were open (or prepared) when the store was last
    /// written, typically inspected after a reopen.
    pub fn open_transactions(&self) -> CResult<Vec<Transaction>> {
        let mut result = Vec::new();
        let mut cursor_key: Option<Value> = None;
        loop {
            let next = match &cursor_key {
                None => self.inner.open_txns.first_key()?,
                Some(k) => self.inner.open_txns.higher_key(k)?,
            };
            let key = match next {
                Some(k) => k,
                None => break,
            };
            let id = key.as_long()? as u64;
            let entry = self.inner.open_txns.get(&key)?.ok_or_else(|| {
                Error::Internal(format!("open transaction {} vanished", id))
            })?;
            let fields = entry.as_array()?;
            let status = TxStatus::from_i64(fields[0].as_long()?)?;
            let name = match &fields[1] {
                Value::Null => None,
                v => Some(v.as_text()?.to_string()),
            };
            result.push(Transaction {
                store: self.inner.clone(),
                inner: Arc::new(TxInner {
                    id,
                    status: AtomicU8::new(status as u8),
                    name: Mutex::new(name),
                    log_id: AtomicU64::new(self.inner.next_log_id(id)?),
                }),
            });
            cursor_key = Some(key);
        }
        Ok(result)
    }
}

impl TxStoreInner {
    fn is_open(&self, id: TxId) -> bool {
        self.open_ids.lock().unwrap().contains(&id)
    }

    /// The next undo-log slot of `tx`, from the largest persisted entry.
    fn next_log_id(&self, tx: TxId) -> CResult<u64> {
        let bound = Value::Long(op_id(tx + 1, 0));
        match self.undo_log.lower_key(&bound)? {
            Some(Value::Long(op)) if op_tx(op) == tx => Ok(op_log(op) + 1),
            _ => Ok(0),
        }
    }

    fn registry_entry(&self, tx: &TxInner) -> Value {
        let name = match &*tx.name.lock().unwrap() {
            Some(n) => Value::Text(n.clone()),
            None => Value::Null,
        };
        Value::Array(vec![Value::Long(tx.status.load(Ordering::Acquire) as i64), name])
    }

    /// Appends an undo-log entry. The first entry also registers the
    /// transaction in the open registry.
    fn log(&self, tx: &TxInner, op: i64, map_id: u32, key: &Value, old: Option<Value>) -> CResult<()> {
        let log_id = tx.log_id.fetch_add(1, Ordering::AcqRel);
        if log_id == 0 {
            self.open_txns.put(Value::Long(tx.id as i64), self.registry_entry(tx))?;
            self.open_ids.lock().unwrap().insert(tx.id);
        }
        self.undo_log.put(
            Value::Long(op_id(tx.id, log_id)),
            Value::Array(vec![
                Value::Long(op),
                Value::Long(map_id as i64),
                key.clone(),
                old.unwrap_or(Value::Null),
            ]),
        )?;
        Ok(())
    }

    /// Drops the registry entry of a finished transaction.
    fn end_transaction(&self, tx: &TxInner) -> CResult<()> {
        self.open_txns.remove(&Value::Long(tx.id as i64))?;
        self.open_ids.lock().unwrap().remove(&tx.id);
        tx.status.store(TxStatus::Closed as u8, Ordering::Release);
        Ok(())
    }
}

impl Transaction {
    pub fn id(&self) -> TxId {
        self.inner.id
    }

    pub fn status(&self) -> TxStatus {
        match self.inner.status.load(Ordering::Acquire) {
            0 => TxStatus::Open,
            1 => TxStatus::Prepared,
            _ => TxStatus::Closed,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.inner.name.lock().unwrap().clone()
    }

    /// Names the transaction, typically before `prepare`.
    pub fn set_name(&self, name: &str) -> CResult<()> {
        *self.inner.name.lock().unwrap() = Some(name.to_string());
        if self.inner.log_id.load(Ordering::Acquire) > 0 {
            let _guard = self.store.write_lock.lock().unwrap();
            self.store
                .open_txns
                .put(Value::Long(self.inner.id as i64), self.store.registry_entry(&self.inner))?;
        }
        Ok(())
    }

    fn check_open(&self) -> CResult<()> {
        if self.status() == TxStatus::Closed {
            return Err(Error::Internal(format!(
                "transaction {} is already closed",
                self.inner.id
            )));
        }
        Ok(())
    }

    /// A transactional view of the named map.
    pub fn open_map(&self, name: &str) -> CResult<TransactionMap> {
        let map = self.store.store.open_map(name)?;
        Ok(TransactionMap {
            store: self.store.clone(),
            tx: self.inner.clone(),
            map,
            read_log_id: u64::MAX,
        })
    }

    /// The current undo-log position, to be passed to
    /// `rollback_to_savepoint`.
    pub fn set_savepoint(&self) -> u64 {
        self.inner.log_id.load(Ordering::Acquire)
    }

    /// Replays the undo log backwards down to `savepoint`, restoring the
    /// older row triples.
    pub fn rollback_to_savepoint(&self, savepoint: u64) -> CResult<()> {
        self.check_open()?;
        let _guard = self.store.write_lock.lock().unwrap();
        self.rollback_locked(savepoint)
    }

    fn rollback_locked(&self, savepoint: u64) -> CResult<()> {
        let mut log = self.inner.log_id.load(Ordering::Acquire);
        while log > savepoint {
            log -= 1;
            let key = Value::Long(op_id(self.inner.id, log));
            if let Some(entry) = self.store.undo_log.get(&key)? {
                let e = entry.as_array()?;
                let map_id = e[1].as_long()? as u32;
                let row_key = &e[2];
                let old = &e[3];
                if let Some(map) = self.store.store.open_map_by_id(map_id)? {
                    if old.is_null() {
                        map.remove(row_key)?;
                    } else {
                        map.put(row_key.clone(), old.clone())?;
                    }
                }
                self.store.undo_log.remove(&key)?;
            }
            self.inner.log_id.store(log, Ordering::Release);
        }
        Ok(())
    }

    /// Marks the transaction prepared and makes that durable.
    pub fn prepare(&self) -> CResult<()> {
        self.check_open()?;
        {
            let _guard = self.store.write_lock.lock().unwrap();
            self.inner.status.store(TxStatus::Prepared as u8, Ordering::Release);
            self.store
                .open_txns
                .put(Value::Long(self.inner.id as i64), self.store.registry_entry(&self.inner))?;
            self.store.open_ids.lock().unwrap().insert(self.inner.id);
        }
        self.store.store.commit()?;
        Ok(())
    }

    /// Commits: tombstones written by this transaction are physically
    /// removed, the undo log is dropped, and the transaction is closed,
    /// which makes its writes visible to everyone.
    pub fn commit(&self) -> CResult<()> {
        self.check_open()?;
        {
            let _guard = self.store.write_lock.lock().unwrap();
            let count = self.inner.log_id.load(Ordering::Acquire);
            for log in 0..count {
                let key = Value::Long(op_id(self.inner.id, log));
                let entry = match self.store.undo_log.get(&key)? {
                    Some(e) => e,
                    None => continue,
                };
                let e = entry.as_array()?;
                if e[0].as_long()? == OP_REMOVE {
                    let map_id = e[1].as_long()? as u32;
                    let row_key = &e[2];
                    if let Some(map) = self.store.store.open_map_by_id(map_id)? {
                        if let Some(current) = map.get(row_key)? {
                            let t = current.as_array()?;
                            if t[0].as_long()? as u64 == self.inner.id && t[2].is_null() {
                                map.remove(row_key)?;
                            }
                        }
                    }
                }
                self.store.undo_log.remove(&key)?;
            }
            self.store.end_transaction(&self.inner)?;
        }
        if self.store.store.unsaved_pages() > MAX_UNSAVED_PAGES {
            self.store.store.commit()?;
        }
        Ok(())
    }

    /// Rolls back every write and closes the transaction.
    pub fn rollback(&self) -> CResult<()> {
        self.check_open()?;
        let _guard = self.store.write_lock.lock().unwrap();
        self.rollback_locked(0)?;
        self.store.end_transaction(&self.inner)?;
        Ok(())
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish()
    }
}

impl TransactionMap {
    /// A view whose reads ignore own writes at or above `log_id`. Used for
    /// per-statement consistency checks.
    pub fn at_savepoint(&self, log_id: u64) -> Self {
        let mut view = self.clone();
        view.read_log_id = log_id;
        view
    }

    /// Resolves the triple visible to this view: own writes below the read
    /// log id, committed writes of others, otherwise the undo-log history.
    fn resolve(&self, key: &Value, max_log: u64) -> CResult<Option<Value>> {
        let mut data = self.map.get(key)?;
        loop {
            let (txid, logid) = match &data {
                None => return Ok(None),
                Some(v) => {
                    let t = v.as_array()?;
                    (t[0].as_long()? as u64, t[1].as_long()? as u64)
                }
            };
            if txid == self.tx.id && logid < max_log {
                return Ok(data);
            }
            if !self.store.is_open(txid) {
                return Ok(data);
            }
            match self.store.undo_log.get(&Value::Long(op_id(txid, logid)))? {
                // the writer is committing right now; its value stands
                None => return Ok(data),
                Some(entry) => {
                    let e = entry.as_array()?;
                    data = if e[3].is_null() { None } else { Some(e[3].clone()) };
                }
            }
        }
    }

    /// The value visible to this transaction, or None for absent rows and
    /// tombstones.
    pub fn get(&self, key: &Value) -> CResult<Option<Value>> {
        match self.resolve(key, self.read_log_id)? {
            None => Ok(None),
            Some(triple) => {
                let t = triple.as_array()?;
                if t[2].is_null() {
                    Ok(None)
                } else {
                    Ok(Some(t[2].clone()))
                }
            }
        }
    }

    pub fn contains_key(&self, key: &Value) -> CResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Attempts one write. `value` None writes a tombstone. Fails without
    /// waiting when another open transaction owns the row; with
    /// `only_if_unchanged` it also fails when the row changed since this
    /// view's read log id.
    pub fn try_set(
        &self,
        key: &Value,
        value: Option<Value>,
        only_if_unchanged: bool,
    ) -> CResult<bool> {
        if self.tx.status.load(Ordering::Acquire) == TxStatus::Closed as u8 {
            return Err(Error::Internal(format!(
                "transaction {} is already closed",
                self.tx.id
            )));
        }
        let _guard = self.store.write_lock.lock().unwrap();
        let current = self.map.get(key)?;
        if only_if_unchanged {
            let visible = self.resolve(key, self.read_log_id)?;
            if current != visible {
                return Ok(false);
            }
        }
        if let Some(cur) = &current {
            let t = cur.as_array()?;
            let owner = t[0].as_long()? as u64;
            if owner != self.tx.id && self.store.is_open(owner) {
                return Ok(false);
            }
        }
        let op = if value.is_none() { OP_REMOVE } else { OP_SET };
        self.store.log(&self.tx, op, self.map.id(), key, current)?;
        let log_id = self.tx.log_id.load(Ordering::Acquire) - 1;
        self.map.put(
            key.clone(),
            Value::Array(vec![
                Value::Long(self.tx.id as i64),
                Value::Long(log_id as i64),
                value.unwrap_or(Value::Null),
            ]),
        )?;
        Ok(true)
    }

    pub fn try_put(&self, key: &Value, value: Value) -> CResult<bool> {
        self.try_set(key, Some(value), false)
    }

    pub fn try_remove(&self, key: &Value) -> CResult<bool> {
        self.try_set(key, None, false)
    }

    /// Writes with a bounded retry loop, failing with a lock timeout when
    /// the row stays owned by another open transaction.
    fn set_with_retry(&self, key: &Value, value: Option<Value>) -> CResult<()> {
        let timeout = Duration::from_millis(self.store.lock_timeout_ms.load(Ordering::Acquire));
        let started = Instant::now();
        let mut backoff = 1u64;
        loop {
            if self.try_set(key, value.clone(), false)? {
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(Error::LockTimeout(format!(
                    "key {} stayed locked for {:?}",
                    key, timeout
                )));
            }
            std::thread::sleep(Duration::from_millis(backoff));
            backoff = (backoff * 2).min(16);
        }
    }

    pub fn put(&self, key: Value, value: Value) -> CResult<()> {
        self.set_with_retry(&key, Some(value))
    }

    pub fn remove(&self, key: &Value) -> CResult<()> {
        self.set_with_retry(key, None)
    }

    /// Number of visible rows. Linear in the underlying map size.
    pub fn size(&self) -> CResult<u64> {
        let mut n = 0;
        for key in self.key_iterator()? {
            let _ = key?;
            n += 1;
        }
        Ok(n)
    }

    /// Keys visible to this transaction, in order.
    pub fn key_iterator(&self) -> CResult<TxKeyIterator<'_>> {
        Ok(TxKeyIterator { view: self, cursor: self.map.cursor(None)? })
    }
}

/// Iterates the keys of a transactional view, skipping rows that resolve
/// to tombstones or absence.
pub struct TxKeyIterator<'a> {
    view: &'a TransactionMap,
    cursor: crate::btree::cursor::Cursor<'a>,
}

impl Iterator for TxKeyIterator<'_> {
    type Item = CResult<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let (key, _) = match self.cursor.next() {
                None => return None,
                Some(Err(e)) => return Some(Err(e)),
                Some(Ok(kv)) => kv,
            };
            match self.view.get(&key) {
                Err(e) => return Some(Err(e)),
                Ok(Some(_)) => return Some(Ok(key)),
                Ok(None) => continue,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::StoreBuilder;
    use std::path::Path;

    fn text(s: &str) -> Value {
        Value::Text(s.to_string())
    }

    fn open_tx_store(path: &Path) -> CResult<TransactionStore> {
        let store = StoreBuilder::new().file_name(path).write_delay(0).open()?;
        TransactionStore::new(store)
    }

    #[test]
    fn basic_put_get_commit() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        let t = ts.begin()?;
        let m = t.open_map("data")?;
        m.put(text("a"), text("1"))?;
        assert_eq!(m.get(&text("a"))?, Some(text("1")));
        t.commit()?;

        let t2 = ts.begin()?;
        let m2 = t2.open_map("data")?;
        assert_eq!(m2.get(&text("a"))?, Some(text("1")));
        Ok(())
    }

    #[test]
    fn rollback_leaves_no_trace() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        {
            let t = ts.begin()?;
            let m = t.open_map("data")?;
            m.put(text("kept"), text("yes"))?;
            t.commit()?;
        }
        let t = ts.begin()?;
        let m = t.open_map("data")?;
        m.put(text("kept"), text("changed"))?;
        m.put(text("new"), text("x"))?;
        m.remove(&text("kept"))?;
        t.rollback()?;

        let t2 = ts.begin()?;
        let m2 = t2.open_map("data")?;
        assert_eq!(m2.get(&text("kept"))?, Some(text("yes")));
        assert_eq!(m2.get(&text("new"))?, None);
        assert_eq!(m2.size()?, 1);
        Ok(())
    }

    #[test]
    fn conflicting_writers() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        let t1 = ts.begin()?;
        let t2 = ts.begin()?;
        let m1 = t1.open_map("data")?;
        let m2 = t2.open_map("data")?;

        assert!(m1.try_put(&text("k"), text("v1"))?);
        // a second open transaction cannot touch the row
        assert!(!m2.try_put(&text("k"), text("v2"))?);
        assert!(!m2.try_remove(&text("k"))?);

        t1.commit()?;
        // after the owner commits, the row is writable again
        assert!(m2.try_put(&text("k"), text("v2"))?);
        t2.commit()?;

        let t3 = ts.begin()?;
        assert_eq!(t3.open_map("data")?.get(&text("k"))?, Some(text("v2")));
        Ok(())
    }

    #[test]
    fn lock_timeout_expires() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        ts.set_lock_timeout(40);
        let t1 = ts.begin()?;
        let t2 = ts.begin()?;
        let m1 = t1.open_map("data")?;
        let m2 = t2.open_map("data")?;
        m1.put(text("k"), text("v1"))?;
        match m2.put(text("k"), text("v2")) {
            Err(Error::LockTimeout(_)) => {}
            other => panic!("expected lock timeout, got {:?}", other),
        }
        Ok(())
    }

    #[test]
    fn savepoint_replay() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        let t = ts.begin()?;
        let m = t.open_map("data")?;
        m.put(text("a"), text("1"))?;
        let sp = t.set_savepoint();
        m.put(text("a"), text("2"))?;
        m.put(text("b"), text("3"))?;
        m.remove(&text("a"))?;
        t.rollback_to_savepoint(sp)?;

        assert_eq!(m.get(&text("a"))?, Some(text("1")));
        assert_eq!(m.get(&text("b"))?, None);
        // the transaction remains usable
        m.put(text("c"), text("4"))?;
        t.commit()?;
        let check = ts.begin()?.open_map("data")?;
        assert_eq!(check.get(&text("a"))?, Some(text("1")));
        assert_eq!(check.get(&text("c"))?, Some(text("4")));
        Ok(())
    }

    #[test]
    fn multi_statement_conflict_check() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        {
            let setup = ts.begin()?;
            let m = setup.open_map("data")?;
            m.put(text("2"), text("Hello"))?;
            m.put(text("3"), text("World"))?;
            setup.commit()?;
        }
        let t = ts.begin()?;
        let s0 = t.set_savepoint();
        let m = t.open_map("data")?.at_savepoint(s0);

        assert!(m.try_set(&text("1"), None, true)?);
        assert!(m.try_set(&text("2"), Some(text("Hello")), true)?);
        assert!(m.try_set(&text("3"), None, true)?);
        // "1" changed within the statement: the check fails
        assert!(!m.try_set(&text("1"), Some(text("World")), true)?);

        t.rollback_to_savepoint(s0)?;
        let m = t.open_map("data")?;
        assert_eq!(m.get(&text("1"))?, None);
        assert_eq!(m.get(&text("2"))?, Some(text("Hello")));
        assert_eq!(m.get(&text("3"))?, Some(text("World")));
        Ok(())
    }

    #[test]
    fn read_committed_visibility() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        {
            let setup = ts.begin()?;
            let m = setup.open_map("data")?;
            m.put(text("1"), text("Hello"))?;
            m.put(text("2"), text("World"))?;
            setup.commit()?;
        }
        let t1 = ts.begin()?;
        let t2 = ts.begin()?;
        let m1 = t1.open_map("data")?;
        let m2 = t2.open_map("data")?;

        m1.put(text("1"), text("Hallo"))?;
        m1.remove(&text("2"))?;
        m1.put(text("3"), text("!"))?;

        // t2 sees the pre-commit state while t1 is open
        assert_eq!(m2.get(&text("1"))?, Some(text("Hello")));
        assert_eq!(m2.get(&text("2"))?, Some(text("World")));
        assert_eq!(m2.get(&text("3"))?, None);

        t1.commit()?;

        // and the committed state afterwards
        assert_eq!(m2.get(&text("1"))?, Some(text("Hallo")));
        assert_eq!(m2.get(&text("2"))?, None);
        assert_eq!(m2.get(&text("3"))?, Some(text("!")));
        Ok(())
    }

    #[test]
    fn two_phase_commit_across_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("tx.mv");
        let tx_id;
        {
            let ts = open_tx_store(&path)?;
            let a = ts.begin()?;
            tx_id = a.id();
            let m = a.open_map("data")?;
            m.put(text("1"), text("Hello"))?;
            ts.store().close()?;
        }
        {
            let ts = open_tx_store(&path)?;
            let open = ts.open_transactions()?;
            assert_eq!(open.len(), 1);
            let a = &open[0];
            assert_eq!(a.id(), tx_id);
            assert_eq!(a.status(), TxStatus::Open);
            a.prepare()?;
            assert_eq!(a.status(), TxStatus::Prepared);
            ts.store().close()?;
        }
        {
            let ts = open_tx_store(&path)?;
            let open = ts.open_transactions()?;
            assert_eq!(open.len(), 1);
            assert_eq!(open[0].status(), TxStatus::Prepared);
            open[0].commit()?;

            let check = ts.begin()?.open_map("data")?;
            assert_eq!(check.get(&text("1"))?, Some(text("Hello")));
            ts.store().close()?;
        }
        // fresh ids never collide with recovered history
        let ts = open_tx_store(&path)?;
        assert!(ts.begin()?.id() > tx_id);
        Ok(())
    }

    #[test]
    fn open_transaction_rolls_back_cleanly_after_reopen() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let path = dir.path().join("tx.mv");
        {
            let ts = open_tx_store(&path)?;
            let keep = ts.begin()?;
            let m = keep.open_map("data")?;
            m.put(text("committed"), text("yes"))?;
            keep.commit()?;

            let abandoned = ts.begin()?;
            let m = abandoned.open_map("data")?;
            m.put(text("junk"), text("x"))?;
            ts.store().close()?;
        }
        let ts = open_tx_store(&path)?;
        let open = ts.open_transactions()?;
        assert_eq!(open.len(), 1);
        open[0].rollback()?;

        let check = ts.begin()?.open_map("data")?;
        assert_eq!(check.get(&text("committed"))?, Some(text("yes")));
        assert_eq!(check.get(&text("junk"))?, None);
        Ok(())
    }

    #[test]
    fn key_iterator_skips_invisible_rows() -> CResult<()> {
        let dir = tempdir::TempDir::new("mvkv")?;
        let ts = open_tx_store(&dir.path().join("tx.mv"))?;
        {
            let setup = ts.begin()?;
            let m = setup.open_map("data")?;
            m.put(text("a"), text("1"))?;
            m.put(text("b"), text("2"))?;
            setup.commit()?;
        }
        let t = ts.begin()?;
        let m = t.open_map("data")?;
        m.remove(&text("a"))?;
        m.put(text("c"), text("3"))?;

        let keys: Vec<Value> = m.key_iterator()?.collect::<CResult<Vec<_>>>()?;
        assert_eq!(keys, vec![text("b"), text("c")]);
        assert_eq!(m.size()?, 2);

        // an unrelated transaction still sees the committed rows
        let other = ts.begin()?.open_map("data")?;
        let keys: Vec<Value> = other.key_iterator()?.collect::<CResult<Vec<_>>>()?;
        assert_eq!(keys, vec![text("a"), text("b")]);
        Ok(())
    }
}
