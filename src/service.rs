//! Periodic synchronization between the chain and the content store
//!
//! Each tick:
//! 1. pulls the entries recorded on chain since the previous tick, caches their
//!    provenance (write-once) and reconciles them
//! 2. feeds the retry ledger's due entries back through the pipeline

use crate::chain::ChainClient;
use crate::error::Result;
use crate::metadata_cache::MetadataCache;
use crate::pipeline::{PassOutcome, PassSummary, ReconcileOptions, Reconciler};
use crate::types::Provenance;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info};

/// Summaries of one service tick
#[derive(Debug, Clone, Default, Serialize)]
pub struct SyncReport {
    pub pending: PassSummary,
    pub retried: PassSummary,
}

pub struct SyncService {
    chain: Arc<dyn ChainClient>,
    reconciler: Arc<Reconciler>,
    metadata: Arc<MetadataCache>,
    options: ReconcileOptions,
    interval: Duration,
    shutdown_rx: Option<broadcast::Receiver<()>>,
}

impl SyncService {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        reconciler: Arc<Reconciler>,
        metadata: Arc<MetadataCache>,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            chain,
            reconciler,
            metadata,
            options,
            interval: Duration::from_secs(60),
            shutdown_rx: None,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set shutdown receiver
    pub fn set_shutdown(&mut self, rx: broadcast::Receiver<()>) {
        self.shutdown_rx = Some(rx);
    }

    /// Reconcile entries newly recorded on chain.
    ///
    /// The chain cursor only advances after the pass succeeds, so a rejected
    /// batch is read again on the next call.
    pub async fn sync_pending(&self) -> Result<PassOutcome> {
        let batch = self.chain.list_pending_entries().await?;

        // Reject a malformed batch before caching anything from it
        for entry in &batch.entries {
            entry.required_fields()?;
        }
        for entry in &batch.entries {
            if let Some(provenance) = &entry.provenance {
                self.metadata.save_data_id_meta(&entry.hash, provenance).await?;
            }
        }

        debug!(entries = batch.entries.len(), "Reconciling pending ledger entries");
        let outcome = self.reconciler.reconcile_pass(batch.entries, self.options).await?;
        self.chain.commit(batch.cursor).await?;
        Ok(outcome)
    }

    /// Reconcile entries whose retry backoff has elapsed
    pub async fn retry_due(&self) -> Result<PassOutcome> {
        let due = self.reconciler.ledger().data_ids_to_retry()?;
        debug!(entries = due.len(), "Retrying due entries");
        self.reconciler.reconcile_pass(due, self.options).await
    }

    /// Provenance of a single id, from cache or chain
    pub async fn provenance(&self, id: &str) -> Result<Provenance> {
        self.metadata.get_data_id_meta(id).await
    }

    /// One full synchronization: pending entries, then due retries
    pub async fn tick(&self) -> Result<SyncReport> {
        let pending = self.sync_pending().await?.summary;
        let retried = self.retry_due().await?.summary;
        Ok(SyncReport { pending, retried })
    }

    /// Run ticks every interval until shutdown is signalled
    pub async fn run(&mut self) -> Result<()> {
        info!(interval_secs = self.interval.as_secs(), "Sync service started");

        let mut shutdown_rx = self.shutdown_rx.take();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick().await {
                        Ok(report) => debug!(
                            pending = report.pending.total,
                            retried = report.retried.total,
                            "Sync tick complete"
                        ),
                        Err(e) => error!(error = %e, "Sync tick failed"),
                    }
                }
                _ = wait_for_shutdown(&mut shutdown_rx) => {
                    info!("Sync service shutdown requested");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn wait_for_shutdown(rx: &mut Option<broadcast::Receiver<()>>) {
    match rx {
        // A dropped sender also means shutdown
        Some(rx) => {
            let _ = rx.recv().await;
        }
        None => std::future::pending().await,
    }
}
