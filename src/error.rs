//! Error types for ledger-reconciler

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconcileError {
    /// A ledger entry arrived without a field the pipeline cannot do without.
    /// Indicates a broken producer; aborts the whole batch.
    #[error("Malformed ledger entry {hash:?}: missing {field}")]
    MalformedEntry { hash: String, field: &'static str },

    #[error("Metadata not found on chain: {0}")]
    MetadataNotFound(String),

    #[error("Chain client error: {0}")]
    Chain(String),

    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ReconcileError>;

impl ReconcileError {
    pub(crate) fn malformed(hash: &str, field: &'static str) -> Self {
        ReconcileError::MalformedEntry {
            hash: hash.to_string(),
            field,
        }
    }
}
