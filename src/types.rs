//! Data model shared by the pipeline, the retry ledger and the metadata cache

use crate::error::{ReconcileError, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where and when a content pointer was anchored on chain.
///
/// Opaque to the pipeline: it is carried through to [`ResolvedContent`] and
/// cached by [`crate::MetadataCache`], never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Provenance {
    /// Chain / network name (e.g. "mainnet", "sepolia")
    #[serde(default)]
    pub network_name: String,
    /// Contract that recorded the pointer
    #[serde(default)]
    pub smart_contract_address: String,
    #[serde(default)]
    pub transaction_hash: String,
    #[serde(default)]
    pub block_number: u64,
    /// Block timestamp in seconds
    #[serde(default)]
    pub block_timestamp: u64,
    /// Confirmations observed when the entry was read
    #[serde(default)]
    pub block_confirmation: u64,
}

/// Closed set of per-entry failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Content store unreachable or timed out. Transient.
    Connection,
    /// Content store reports the id absent or unreadable. Permanent.
    InvalidContent,
    /// Retrieved content is larger than the declared size. Permanent.
    SizeMismatch,
}

impl ErrorKind {
    /// Only connection failures are worth retrying.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::Connection)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::InvalidContent => "INVALID_CONTENT",
            ErrorKind::SizeMismatch => "SIZE_MISMATCH",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classified failure attached to a ledger entry by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryError {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// One on-chain pointer to off-chain content.
///
/// `declared_size` and `provenance` are optional only because producers are
/// untrusted; the pipeline rejects the whole batch if either is missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerEntry {
    /// Content id, also the retrieval key
    #[serde(default)]
    pub hash: String,
    /// Size in bytes the submitter paid for
    #[serde(default)]
    pub declared_size: Option<u64>,
    #[serde(default)]
    pub provenance: Option<Provenance>,
    /// Set by the pipeline, never by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<EntryError>,
}

impl LedgerEntry {
    pub fn new(hash: impl Into<String>, declared_size: u64, provenance: Provenance) -> Self {
        Self {
            hash: hash.into(),
            declared_size: Some(declared_size),
            provenance: Some(provenance),
            error: None,
        }
    }

    /// Copy of this entry carrying the given failure.
    pub fn with_error(&self, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: Some(EntryError {
                kind,
                message: message.into(),
            }),
            ..self.clone()
        }
    }

    /// Declared size and provenance, or a fatal error naming the missing field.
    pub(crate) fn required_fields(&self) -> Result<(u64, &Provenance)> {
        if self.hash.is_empty() {
            return Err(ReconcileError::malformed(&self.hash, "hash"));
        }
        let declared_size = self
            .declared_size
            .ok_or_else(|| ReconcileError::malformed(&self.hash, "declaredSize"))?;
        let provenance = self
            .provenance
            .as_ref()
            .ok_or_else(|| ReconcileError::malformed(&self.hash, "provenance"))?;
        Ok((declared_size, provenance))
    }
}

/// Content whose bytes matched its on-chain declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedContent {
    pub id: String,
    pub content: Bytes,
    /// Actual size as reported by the content store
    pub size: u64,
    pub provenance: Provenance,
    /// Epoch milliseconds
    pub verified_at: i64,
}

/// Retry ledger record for an unresolved id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryRecord {
    /// Last attempted version of the entry, carrying the last error
    pub entry: LedgerEntry,
    /// Number of recorded attempts, starting at 1
    pub iteration: u32,
    /// Epoch milliseconds of the last attempt
    pub last_try_timestamp: i64,
    /// False once the failure is classified permanent; the record is then frozen
    pub to_retry: bool,
}

impl RetryRecord {
    pub fn reason(&self) -> Option<&str> {
        self.entry.error.as_ref().map(|e| e.message.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_transience() {
        assert!(ErrorKind::Connection.is_transient());
        assert!(!ErrorKind::InvalidContent.is_transient());
        assert!(!ErrorKind::SizeMismatch.is_transient());
    }

    #[test]
    fn test_entry_json_shape() {
        let entry = LedgerEntry::new("QmAbc", 3, Provenance::default())
            .with_error(ErrorKind::SizeMismatch, "Incorrect declared size");
        let json = serde_json::to_value(&entry).unwrap();

        assert_eq!(json["hash"], "QmAbc");
        assert_eq!(json["declaredSize"], 3);
        assert_eq!(json["error"]["type"], "SIZE_MISMATCH");
    }

    #[test]
    fn test_missing_fields_are_reported() {
        let entry: LedgerEntry = serde_json::from_str(r#"{"hash":"QmAbc","declaredSize":3}"#).unwrap();
        match entry.required_fields() {
            Err(ReconcileError::MalformedEntry { field, .. }) => assert_eq!(field, "provenance"),
            other => panic!("expected malformed entry, got {:?}", other),
        }

        let entry: LedgerEntry = serde_json::from_str(r#"{"declaredSize":3,"provenance":{}}"#).unwrap();
        assert!(matches!(
            entry.required_fields(),
            Err(ReconcileError::MalformedEntry { field: "hash", .. })
        ));
    }
}
