//! Durable retry ledger ("ignore cache")
//!
//! Tracks every ledger entry the pipeline could not resolve:
//!
//! - transient failures (`CONNECTION`) are kept with `to_retry = true` and
//!   come back through [`RetryLedger::data_ids_to_retry`] once their backoff
//!   interval has elapsed; each further failure replaces the record and bumps
//!   `iteration`
//! - permanent failures (`INVALID_CONTENT`, `SIZE_MISMATCH`) are recorded once
//!   with `to_retry = false` and never modified afterwards, so the first
//!   failure stays available for audit
//!
//! A record disappears as soon as its id resolves.

use crate::clock::Clock;
use crate::error::{ReconcileError, Result};
use crate::store::{IndexedStore, KeyValueStore};
use crate::types::{LedgerEntry, RetryRecord};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// Wait before retry `n` is `floor(e^n) * base_interval`, capped at `max_interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_interval: Duration,
    pub max_interval: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_secs(60),
            max_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

impl BackoffPolicy {
    /// Minimum wait after the `iteration`-th failed attempt
    pub fn retry_interval(&self, iteration: u32) -> Duration {
        let factor = f64::from(iteration).exp().floor();
        let base_ms = self.base_interval.as_millis() as f64;
        let max_ms = self.max_interval.as_millis() as f64;
        // exp() overflows to +inf for large iterations; min() clamps it
        let interval_ms = (factor * base_ms).min(max_ms);
        Duration::from_millis(interval_ms as u64)
    }
}

/// Retry ledger over a keyed store
pub struct RetryLedger {
    records: IndexedStore<RetryRecord>,
    clock: Arc<dyn Clock>,
    policy: BackoffPolicy,
}

impl RetryLedger {
    pub fn new(backend: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, policy: BackoffPolicy) -> Self {
        Self {
            records: IndexedStore::new(backend),
            clock,
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Record a failed attempt for `entry`, which must carry its error.
    ///
    /// - no record: create with `iteration = 1`
    /// - retryable record: replace, `iteration + 1`, fresh timestamp, retryability
    ///   recomputed from the new error
    /// - permanent record: no-op
    pub async fn save(&self, entry: &LedgerEntry) -> Result<()> {
        let error = entry
            .error
            .as_ref()
            .ok_or_else(|| ReconcileError::malformed(&entry.hash, "error"))?;

        let txn = self.records.write().await;
        let now = self.clock.now_ms();

        let record = match txn.get(&entry.hash)? {
            None => RetryRecord {
                entry: entry.clone(),
                iteration: 1,
                last_try_timestamp: now,
                to_retry: error.kind.is_transient(),
            },
            Some(existing) if existing.to_retry => RetryRecord {
                entry: entry.clone(),
                iteration: existing.iteration.saturating_add(1),
                last_try_timestamp: now,
                to_retry: error.kind.is_transient(),
            },
            Some(existing) => {
                trace!(
                    hash = %entry.hash,
                    kind = %error.kind,
                    first_failure = ?existing.reason(),
                    "Permanent failure already recorded, keeping first record"
                );
                return Ok(());
            }
        };

        txn.insert(&entry.hash, &record)?;

        debug!(
            hash = %entry.hash,
            kind = %error.kind,
            iteration = record.iteration,
            to_retry = record.to_retry,
            "Saved unresolved entry"
        );
        Ok(())
    }

    /// Remove the record for `id`; no-op if absent
    pub async fn delete(&self, id: &str) -> Result<()> {
        let txn = self.records.write().await;
        if txn.remove(id)? {
            debug!(hash = %id, "Removed resolved entry from retry ledger");
        }
        Ok(())
    }

    /// Last error message recorded for `id`
    pub fn reason(&self, id: &str) -> Result<Option<String>> {
        Ok(self
            .records
            .get(id)?
            .and_then(|record| record.reason().map(str::to_string)))
    }

    pub fn record(&self, id: &str) -> Result<Option<RetryRecord>> {
        self.records.get(id)
    }

    /// All tracked ids, in insertion order
    pub fn data_ids(&self) -> Result<Vec<String>> {
        self.records.keys()
    }

    /// Full dump for inspection
    pub fn data_ids_with_reasons(&self) -> Result<HashMap<String, RetryRecord>> {
        Ok(self.records.entries()?.into_iter().collect())
    }

    /// Entries whose backoff has elapsed, in key-list order, with the previous
    /// error cleared so they can be fed straight back into the pipeline
    pub fn data_ids_to_retry(&self) -> Result<Vec<LedgerEntry>> {
        let now = self.clock.now_ms();
        Ok(self
            .records
            .entries()?
            .into_iter()
            .filter(|(_, record)| self.is_due(record, now))
            .map(|(_, record)| LedgerEntry {
                error: None,
                ..record.entry
            })
            .collect())
    }

    /// Whether `record` is due for another attempt now
    pub fn should_retry(&self, record: &RetryRecord) -> bool {
        self.is_due(record, self.clock.now_ms())
    }

    /// Epoch ms at which `record` becomes due, or `None` if it never will
    pub fn next_retry_at(&self, record: &RetryRecord) -> Option<i64> {
        if !record.to_retry {
            return None;
        }
        let wait_ms = i64::try_from(self.policy.retry_interval(record.iteration).as_millis())
            .unwrap_or(i64::MAX);
        Some(record.last_try_timestamp.saturating_add(wait_ms))
    }

    fn is_due(&self, record: &RetryRecord, now: i64) -> bool {
        self.next_retry_at(record).is_some_and(|due| due <= now)
    }

    /// Make all recorded changes durable
    pub fn flush(&self) -> Result<()> {
        self.records.flush()
    }
}
