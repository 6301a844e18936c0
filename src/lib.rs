//! Ledger Reconciler - verifies on-chain content pointers against IPFS
//!
//! A blockchain records pointers to off-chain content (hash, declared size,
//! block metadata); an IPFS-compatible store holds the bytes. The two fail
//! independently. This crate returns only the content whose declaration and
//! bytes agree, and never loses track of entries it could not resolve.
//!
//! ## Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Reconciler`] | bounded-concurrency fetch, size validation, in-pass retries |
//! | [`RetryLedger`] | durable record of unresolved ids with exponential backoff |
//! | [`MetadataCache`] | write-once provenance cache in front of the chain |
//! | [`SyncService`] | periodic loop tying the three to a [`ChainClient`] |
//!
//! ## Storage Layout
//!
//! ```text
//! ~/.local/share/ledger-reconciler/
//! ├── state.sled/        # retry ledger, metadata cache, ledger cursor (one tree each)
//! └── config.toml        # Configuration
//! ```

pub mod chain;
pub mod clock;
pub mod config;
pub mod content_store;
pub mod error;
pub mod kubo;
pub mod metadata_cache;
pub mod pipeline;
pub mod retry_ledger;
pub mod service;
pub mod store;
pub mod types;

// Re-exports
pub use chain::{ChainClient, JsonLedgerFile, PendingBatch};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use content_store::{ContentStore, FetchError, FetchedContent};
pub use error::{ReconcileError, Result};
pub use kubo::{KuboClient, KuboConfig};
pub use metadata_cache::MetadataCache;
pub use pipeline::{PassOutcome, PassSummary, ReconcileOptions, Reconciler, ReconcilerStats};
pub use retry_ledger::{BackoffPolicy, RetryLedger};
pub use service::{SyncReport, SyncService};
pub use store::{IndexedStore, KeyValueStore, MemoryStore, SledStore};
pub use types::{EntryError, ErrorKind, LedgerEntry, Provenance, ResolvedContent, RetryRecord};
