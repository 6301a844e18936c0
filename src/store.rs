//! Key-value persistence for the retry ledger and the metadata cache
//!
//! Both caches only need `get` / `put` / `remove` on a keyed store. The
//! backing primitive is not assumed to enumerate keys, so [`IndexedStore`]
//! keeps an ordered key list next to the values:
//!
//! ```text
//! keys        -> ["Qm1", "Qm2", ...]   (insertion order)
//! data/Qm1    -> msgpack(V)
//! data/Qm2    -> msgpack(V)
//! ```
//!
//! The list is updated append-if-absent on insert and remove-if-present on
//! delete, under the same writer lock as the value itself.

use crate::error::Result;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{info, warn};

const KEYS_KEY: &str = "keys";
const DATA_PREFIX: &str = "data/";

/// Minimal keyed byte store.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// No-op if the key is absent.
    fn remove(&self, key: &str) -> Result<()>;

    /// Make previous writes durable.
    fn flush(&self) -> Result<()>;
}

// ============================================================================
// Backends
// ============================================================================

/// sled-backed store, one tree per collection
pub struct SledStore {
    tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) a named tree in an existing database
    pub fn open_tree(db: &sled::Db, name: &str) -> Result<Self> {
        let tree = db.open_tree(name)?;
        Ok(Self { tree })
    }
}

impl KeyValueStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes())?.map(|v| v.to_vec()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.tree.remove(key.as_bytes())?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Open the sled database holding all reconciler state
pub fn open_database<P: AsRef<Path>>(path: P) -> Result<sled::Db> {
    let db = sled::open(path.as_ref())?;
    info!(path = %path.as_ref().display(), "Opened reconciler database");
    Ok(db)
}

/// Non-durable store for tests and throwaway runs
#[derive(Default)]
pub struct MemoryStore {
    entries: DashMap<String, Vec<u8>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.remove(key);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

// ============================================================================
// Indexed collection
// ============================================================================

/// Typed collection with insertion-ordered key enumeration.
///
/// Reads go straight to the backend. Writes go through [`IndexedStore::write`],
/// which serializes all mutations of the collection.
pub struct IndexedStore<V> {
    backend: Arc<dyn KeyValueStore>,
    writer: Mutex<()>,
    _value: PhantomData<fn() -> V>,
}

impl<V> IndexedStore<V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn new(backend: Arc<dyn KeyValueStore>) -> Self {
        Self {
            backend,
            writer: Mutex::new(()),
            _value: PhantomData,
        }
    }

    pub fn get(&self, id: &str) -> Result<Option<V>> {
        read_value(self.backend.as_ref(), id)
    }

    /// All ids in insertion order
    pub fn keys(&self) -> Result<Vec<String>> {
        read_keys(self.backend.as_ref())
    }

    /// All `(id, value)` pairs in key-list order.
    ///
    /// An id listed without a value (interrupted write) is skipped.
    pub fn entries(&self) -> Result<Vec<(String, V)>> {
        let mut entries = Vec::new();
        for id in self.keys()? {
            match self.get(&id)? {
                Some(value) => entries.push((id, value)),
                None => warn!(id = %id, "Key listed without a stored value, skipping"),
            }
        }
        Ok(entries)
    }

    /// Acquire the writer lock for a read-modify-write sequence
    pub async fn write(&self) -> WriteTxn<'_, V> {
        WriteTxn {
            backend: self.backend.as_ref(),
            _guard: self.writer.lock().await,
            _value: PhantomData,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.backend.flush()
    }
}

/// Exclusive write access to an [`IndexedStore`]
pub struct WriteTxn<'a, V> {
    backend: &'a dyn KeyValueStore,
    _guard: MutexGuard<'a, ()>,
    _value: PhantomData<fn() -> V>,
}

impl<V> WriteTxn<'_, V>
where
    V: Serialize + DeserializeOwned,
{
    pub fn get(&self, id: &str) -> Result<Option<V>> {
        read_value(self.backend, id)
    }

    /// Store the value, then append the id to the key list if absent
    pub fn insert(&self, id: &str, value: &V) -> Result<()> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.backend.put(&data_key(id), &bytes)?;

        let mut keys = read_keys(self.backend)?;
        if !keys.iter().any(|k| k == id) {
            keys.push(id.to_string());
            self.backend.put(KEYS_KEY, &rmp_serde::to_vec(&keys)?)?;
        }
        Ok(())
    }

    /// Drop the id from the key list if present, then the value.
    /// Returns whether a value existed.
    pub fn remove(&self, id: &str) -> Result<bool> {
        let mut keys = read_keys(self.backend)?;
        let before = keys.len();
        keys.retain(|k| k != id);
        if keys.len() != before {
            self.backend.put(KEYS_KEY, &rmp_serde::to_vec(&keys)?)?;
        }

        let existed = self.backend.get(&data_key(id))?.is_some();
        if existed {
            self.backend.remove(&data_key(id))?;
        }
        Ok(existed)
    }
}

fn data_key(id: &str) -> String {
    format!("{}{}", DATA_PREFIX, id)
}

fn read_value<V: DeserializeOwned>(backend: &dyn KeyValueStore, id: &str) -> Result<Option<V>> {
    match backend.get(&data_key(id))? {
        Some(bytes) => Ok(Some(rmp_serde::from_slice(&bytes)?)),
        None => Ok(None),
    }
}

fn read_keys(backend: &dyn KeyValueStore) -> Result<Vec<String>> {
    match backend.get(KEYS_KEY)? {
        Some(bytes) => Ok(rmp_serde::from_slice(&bytes)?),
        None => Ok(Vec::new()),
    }
}
