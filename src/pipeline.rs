//! Reconciliation pipeline
//!
//! Turns a batch of ledger entries into verified content:
//!
//! ```text
//! entries ──► fetch (≤ concurrency in flight) ──► classify
//!                  ▲                                 │
//!                  └──── CONNECTION, retries left ◄──┤
//!                                                    ├─► INVALID_CONTENT / SIZE_MISMATCH ─► ledger.save
//!                                                    └─► success ─► output, ledger.delete
//! ```
//!
//! Connection failures still pending after the last in-pass attempt are
//! handed to the retry ledger. All ledger writes complete before
//! [`Reconciler::reconcile`] returns.

use crate::clock::Clock;
use crate::content_store::{ContentStore, FetchError};
use crate::error::Result;
use crate::retry_ledger::RetryLedger;
use crate::types::{ErrorKind, LedgerEntry, ResolvedContent};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Share of the declared size allowed on top of it when reading
const READ_MARGIN_RATE: f64 = 0.3;
/// Floor of the read margin, in bytes
const READ_MARGIN_MIN: u64 = 500;

/// Maximum number of bytes to request for an entry declaring `declared_size`
pub fn read_limit(declared_size: u64) -> u64 {
    let margin = ((declared_size as f64) * READ_MARGIN_RATE).ceil() as u64;
    declared_size.saturating_add(margin.max(READ_MARGIN_MIN))
}

/// Knobs of one reconciliation pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOptions {
    /// Maximum fetches in flight; 0 behaves as 1
    pub concurrency: usize,
    /// Extra attempts for connection failures within the pass
    pub max_in_pass_retries: u32,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            max_in_pass_retries: 1,
        }
    }
}

/// Per-pass counts for operators
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub total: usize,
    pub resolved: usize,
    pub resolved_after_retry: usize,
    /// Entries still failing with CONNECTION after the last attempt
    pub connection_errors: usize,
    pub invalid_content: usize,
    pub size_mismatch: usize,
}

#[derive(Debug, Clone)]
pub struct PassOutcome {
    pub resolved: Vec<ResolvedContent>,
    pub summary: PassSummary,
}

struct ReconcilerCounters {
    passes: AtomicU64,
    fetches: AtomicU64,
    resolved: AtomicU64,
    connection_errors: AtomicU64,
    invalid_content: AtomicU64,
    size_mismatch: AtomicU64,
    bytes_resolved: AtomicU64,
}

/// Cumulative statistics since the reconciler was created
#[derive(Debug, Clone, Serialize)]
pub struct ReconcilerStats {
    pub passes: u64,
    pub fetches: u64,
    pub resolved: u64,
    /// Individual fetch attempts that failed with CONNECTION
    pub connection_errors: u64,
    pub invalid_content: u64,
    pub size_mismatch: u64,
    pub bytes_resolved: u64,
}

pub struct Reconciler {
    store: Arc<dyn ContentStore>,
    ledger: Arc<RetryLedger>,
    clock: Arc<dyn Clock>,
    fetch_timeout: Duration,
    stats: ReconcilerCounters,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ContentStore>, ledger: Arc<RetryLedger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            ledger,
            clock,
            fetch_timeout: Duration::from_secs(10),
            stats: ReconcilerCounters {
                passes: AtomicU64::new(0),
                fetches: AtomicU64::new(0),
                resolved: AtomicU64::new(0),
                connection_errors: AtomicU64::new(0),
                invalid_content: AtomicU64::new(0),
                size_mismatch: AtomicU64::new(0),
                bytes_resolved: AtomicU64::new(0),
            },
        }
    }

    /// Bound every individual fetch; an expired fetch counts as a connection failure
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &Arc<RetryLedger> {
        &self.ledger
    }

    /// Resolve `entries`, returning verified content in the order it was resolved.
    ///
    /// Fails without side effects if any entry lacks a hash, declared size
    /// or provenance.
    pub async fn reconcile(
        &self,
        entries: Vec<LedgerEntry>,
        concurrency: usize,
        max_in_pass_retries: u32,
    ) -> Result<Vec<ResolvedContent>> {
        let options = ReconcileOptions {
            concurrency,
            max_in_pass_retries,
        };
        Ok(self.reconcile_pass(entries, options).await?.resolved)
    }

    /// Like [`Reconciler::reconcile`], also returning the pass summary
    pub async fn reconcile_pass(
        &self,
        entries: Vec<LedgerEntry>,
        options: ReconcileOptions,
    ) -> Result<PassOutcome> {
        for entry in &entries {
            entry.required_fields()?;
        }

        let start = Instant::now();
        self.stats.passes.fetch_add(1, Ordering::Relaxed);

        let limiter = Semaphore::new(options.concurrency.max(1));
        let mut summary = PassSummary {
            total: entries.len(),
            ..Default::default()
        };
        let mut resolved: Vec<ResolvedContent> = Vec::new();
        let mut resolved_ids: HashSet<String> = HashSet::new();
        let mut working = entries;

        for try_index in 0..=options.max_in_pass_retries {
            if working.is_empty() {
                break;
            }
            debug!(try_index, entries = working.len(), "Fetching batch");

            let attempts = working
                .iter()
                .map(|entry| self.fetch_entry(entry, &limiter, try_index));
            let outcomes = join_all(attempts).await;

            let mut still_failing = Vec::new();
            for outcome in outcomes {
                match outcome? {
                    Ok(content) => {
                        if resolved_ids.insert(content.id.clone()) {
                            if try_index > 0 {
                                summary.resolved_after_retry += 1;
                            }
                            resolved.push(content);
                        }
                    }
                    Err(failed) => match failed.error.as_ref().map(|e| e.kind) {
                        Some(ErrorKind::InvalidContent) => {
                            summary.invalid_content += 1;
                            self.ledger.save(&failed).await?;
                        }
                        Some(ErrorKind::SizeMismatch) => {
                            summary.size_mismatch += 1;
                            self.ledger.save(&failed).await?;
                        }
                        Some(ErrorKind::Connection) | None => still_failing.push(failed),
                    },
                }
            }
            working = still_failing;
        }

        summary.connection_errors = working.len();
        for failed in &working {
            self.ledger.save(failed).await?;
        }
        for content in &resolved {
            self.ledger.delete(&content.id).await?;
        }
        self.ledger.flush()?;

        summary.resolved = resolved.len();
        info!(
            total = summary.total,
            resolved = summary.resolved,
            resolved_after_retry = summary.resolved_after_retry,
            connection_errors = summary.connection_errors,
            invalid_content = summary.invalid_content,
            size_mismatch = summary.size_mismatch,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Reconciliation pass complete"
        );

        Ok(PassOutcome { resolved, summary })
    }

    /// One fetch attempt. The inner `Err` is the entry with its classified failure.
    async fn fetch_entry(
        &self,
        entry: &LedgerEntry,
        limiter: &Semaphore,
        try_index: u32,
    ) -> Result<std::result::Result<ResolvedContent, LedgerEntry>> {
        let (declared_size, provenance) = entry.required_fields()?;
        let max_bytes = read_limit(declared_size);

        let fetched = {
            let _permit = match limiter.acquire().await {
                Ok(permit) => permit,
                Err(_) => {
                    return Ok(Err(
                        entry.with_error(ErrorKind::Connection, "Fetch limiter closed")
                    ))
                }
            };
            self.stats.fetches.fetch_add(1, Ordering::Relaxed);

            match tokio::time::timeout(self.fetch_timeout, self.store.fetch(&entry.hash, max_bytes)).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::Connection(format!(
                    "Fetch timed out after {}ms",
                    self.fetch_timeout.as_millis()
                ))),
            }
        };

        let failed = match fetched {
            Ok(content) if content.actual_size > declared_size => {
                self.stats.size_mismatch.fetch_add(1, Ordering::Relaxed);
                debug!(
                    hash = %entry.hash,
                    declared_size,
                    actual_size = content.actual_size,
                    "Content larger than declared"
                );
                entry.with_error(ErrorKind::SizeMismatch, "Incorrect declared size")
            }
            Ok(content) => {
                self.stats.resolved.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_resolved
                    .fetch_add(content.actual_size, Ordering::Relaxed);
                return Ok(Ok(ResolvedContent {
                    id: entry.hash.clone(),
                    size: content.actual_size,
                    content: content.content,
                    provenance: provenance.clone(),
                    verified_at: self.clock.now_ms(),
                }));
            }
            Err(err) => {
                let kind = err.kind();
                match kind {
                    ErrorKind::Connection => {
                        self.stats.connection_errors.fetch_add(1, Ordering::Relaxed);
                        debug!(hash = %entry.hash, try_index, error = %err, "Transient fetch failure");
                    }
                    ErrorKind::InvalidContent | ErrorKind::SizeMismatch => {
                        self.stats.invalid_content.fetch_add(1, Ordering::Relaxed);
                        warn!(hash = %entry.hash, error = %err, "Content unreadable");
                    }
                }
                entry.with_error(kind, err.to_string())
            }
        };

        Ok(Err(failed))
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            passes: self.stats.passes.load(Ordering::Relaxed),
            fetches: self.stats.fetches.load(Ordering::Relaxed),
            resolved: self.stats.resolved.load(Ordering::Relaxed),
            connection_errors: self.stats.connection_errors.load(Ordering::Relaxed),
            invalid_content: self.stats.invalid_content.load(Ordering::Relaxed),
            size_mismatch: self.stats.size_mismatch.load(Ordering::Relaxed),
            bytes_resolved: self.stats.bytes_resolved.load(Ordering::Relaxed),
        }
    }
}
