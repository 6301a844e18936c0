//! Blockchain side of the reconciliation
//!
//! The reconciler never talks to a node directly; it consumes a
//! [`ChainClient`] that yields ledger entries and per-id provenance.
//! [`JsonLedgerFile`] serves an exported event log from disk.
//!
//! Reading is two-phase: [`ChainClient::list_pending_entries`] returns the
//! entries past the committed cursor without moving it, and the caller
//! calls [`ChainClient::commit`] once the batch is safely reconciled. A
//! rejected or failed batch is served again on the next read.

use crate::error::{ReconcileError, Result};
use crate::store::KeyValueStore;
use crate::types::{LedgerEntry, Provenance};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

const CURSOR_KEY: &str = "cursor";

/// Entries read past the committed cursor
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatch {
    pub entries: Vec<LedgerEntry>,
    /// Position to commit once `entries` are handled
    pub cursor: u64,
}

/// Upstream producer of ledger entries
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Entries recorded after the committed cursor
    async fn list_pending_entries(&self) -> Result<PendingBatch>;

    /// Mark everything up to `cursor` as handled
    async fn commit(&self, cursor: u64) -> Result<()>;

    /// Provenance of the first ledger occurrence of `id`
    async fn get_metadata(&self, id: &str) -> Result<Provenance>;
}

/// Append-only JSON export of ledger entries
///
/// The file holds a JSON array of entries; the cursor is an index into it.
/// With a cursor store the committed position survives restarts.
pub struct JsonLedgerFile {
    path: PathBuf,
    committed: AtomicU64,
    cursor_store: Option<Arc<dyn KeyValueStore>>,
}

impl JsonLedgerFile {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            committed: AtomicU64::new(0),
            cursor_store: None,
        }
    }

    /// Resume from the cursor persisted in `store`
    pub fn with_cursor_store<P: AsRef<Path>>(path: P, store: Arc<dyn KeyValueStore>) -> Result<Self> {
        let committed = match store.get(CURSOR_KEY)? {
            Some(bytes) => rmp_serde::from_slice(&bytes)?,
            None => 0,
        };
        debug!(path = %path.as_ref().display(), committed, "Restored ledger cursor");

        Ok(Self {
            path: path.as_ref().to_path_buf(),
            committed: AtomicU64::new(committed),
            cursor_store: Some(store),
        })
    }

    pub fn committed(&self) -> u64 {
        self.committed.load(Ordering::SeqCst)
    }

    async fn read_all(&self) -> Result<Vec<LedgerEntry>> {
        let content = tokio::fs::read_to_string(&self.path).await?;
        Ok(serde_json::from_str(&content)?)
    }
}

#[async_trait]
impl ChainClient for JsonLedgerFile {
    async fn list_pending_entries(&self) -> Result<PendingBatch> {
        let entries = self.read_all().await?;
        let committed = self.committed();
        let total = entries.len() as u64;

        if total < committed {
            return Err(ReconcileError::Chain(format!(
                "ledger export {} shrank from {} to {} entries",
                self.path.display(),
                committed,
                total
            )));
        }

        let pending: Vec<_> = entries.into_iter().skip(committed as usize).collect();
        debug!(
            path = %self.path.display(),
            pending = pending.len(),
            "Read ledger export"
        );
        Ok(PendingBatch {
            entries: pending,
            cursor: total,
        })
    }

    async fn commit(&self, cursor: u64) -> Result<()> {
        if let Some(store) = &self.cursor_store {
            store.put(CURSOR_KEY, &rmp_serde::to_vec(&cursor)?)?;
            store.flush()?;
        }
        self.committed.fetch_max(cursor, Ordering::SeqCst);
        debug!(path = %self.path.display(), cursor, "Committed ledger cursor");
        Ok(())
    }

    async fn get_metadata(&self, id: &str) -> Result<Provenance> {
        self.read_all()
            .await?
            .into_iter()
            .filter(|entry| entry.hash == id)
            .find_map(|entry| entry.provenance)
            .ok_or_else(|| ReconcileError::MetadataNotFound(id.to_string()))
    }
}
