//! Off-chain content store interface
//!
//! Adapters report failures as a closed [`FetchError`] so the pipeline can
//! classify every outcome with a plain `match`.

use crate::types::ErrorKind;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Bytes returned by a content store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedContent {
    pub content: Bytes,
    /// Size of the stored object as seen by the store
    pub actual_size: u64,
}

impl FetchedContent {
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content = content.into();
        let actual_size = content.len() as u64;
        Self {
            content,
            actual_size,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// Store unreachable, timed out, or failed mid-transfer. Worth retrying.
    #[error("{0}")]
    Connection(String),

    /// Store answered, and the id is unknown or its payload unreadable.
    #[error("{0}")]
    InvalidContent(String),
}

impl FetchError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            FetchError::Connection(_) => ErrorKind::Connection,
            FetchError::InvalidContent(_) => ErrorKind::InvalidContent,
        }
    }
}

/// Content-addressed byte store (an IPFS node in production)
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Fetch the object `id`, reading at most `max_bytes` bytes of it
    async fn fetch(&self, id: &str, max_bytes: u64) -> Result<FetchedContent, FetchError>;
}
