//! Write-once cache of on-chain provenance
//!
//! Avoids asking the chain for metadata we already have. The first value
//! stored for an id wins: anyone can submit the same content id to the
//! ledger again with different metadata, and the first occurrence is the
//! authoritative one.
//!
//! Concurrent misses for the same id may both hit the chain; the second
//! write is then a no-op.

use crate::chain::ChainClient;
use crate::error::Result;
use crate::store::{IndexedStore, KeyValueStore};
use crate::types::Provenance;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct MetadataCache {
    entries: IndexedStore<Provenance>,
    source: Arc<dyn ChainClient>,
}

impl MetadataCache {
    pub fn new(backend: Arc<dyn KeyValueStore>, source: Arc<dyn ChainClient>) -> Self {
        Self {
            entries: IndexedStore::new(backend),
            source,
        }
    }

    /// Store `meta` for `id` unless a value is already cached.
    ///
    /// Returns whether the value was written.
    pub async fn save_data_id_meta(&self, id: &str, meta: &Provenance) -> Result<bool> {
        let txn = self.entries.write().await;

        if let Some(existing) = txn.get(id)? {
            if &existing != meta {
                warn!(
                    hash = %id,
                    cached_tx = %existing.transaction_hash,
                    cached_block = existing.block_number,
                    ignored_tx = %meta.transaction_hash,
                    ignored_block = meta.block_number,
                    "Ignoring conflicting metadata for already cached id"
                );
            }
            return Ok(false);
        }

        txn.insert(id, meta)?;
        debug!(hash = %id, block = meta.block_number, "Cached provenance");
        Ok(true)
    }

    /// Cached provenance for `id`, querying the chain on a miss
    pub async fn get_data_id_meta(&self, id: &str) -> Result<Provenance> {
        if let Some(meta) = self.entries.get(id)? {
            return Ok(meta);
        }

        debug!(hash = %id, "Metadata cache miss, querying chain");
        let fetched = self.source.get_metadata(id).await?;
        self.save_data_id_meta(id, &fetched).await?;

        // A concurrent writer may have stored a different value first
        Ok(self.entries.get(id)?.unwrap_or(fetched))
    }

    /// Cached ids in insertion order
    pub fn data_ids(&self) -> Result<Vec<String>> {
        self.entries.keys()
    }
}
