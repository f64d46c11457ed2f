//! Remote object-storage boundary.
//!
//! The engine never speaks a storage protocol itself. Callers hand it a
//! [`BlobClient`] that can report a blob's length, read byte ranges, stage
//! blocks and commit a block list. [`crate::MemoryBlobStore`] is the
//! in-process implementation used by tests.

use std::future::Future;
use std::pin::Pin;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use mediablob_protocol::BlobHandle;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Boxed future returned by [`BlobClient`] methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// HTTP-style status for "access forbidden".
pub const STATUS_FORBIDDEN: u16 = 403;

/// Errors reported by a blob client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BlobError {
    /// The request failed in the network transport (connection reset,
    /// timeout, or an error status from the service).
    #[error("transport error (status {status:?}): {message}")]
    Transport {
        status: Option<u16>,
        message: String,
    },

    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("{0}")]
    Other(String),
}

impl BlobError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Transport {
            status,
            message: message.into(),
        }
    }

    /// A transport error carrying the "access forbidden" status.
    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::transport(Some(STATUS_FORBIDDEN), message)
    }

    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport { status, .. } => *status,
            _ => None,
        }
    }

    pub fn is_forbidden(&self) -> bool {
        self.status() == Some(STATUS_FORBIDDEN)
    }
}

/// Blob metadata returned by [`BlobClient::get_properties`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlobProperties {
    /// Length of the committed blob in bytes.
    pub length: u64,
}

/// One block staged by [`BlobClient::put_block`].
#[derive(Debug, Clone, Copy)]
pub struct BlockUpload<'a> {
    pub block_id: &'a str,
    pub data: &'a [u8],
    /// SHA-256 hex digest of `data`.
    pub checksum: &'a str,
}

/// Abstract connection to blob storage.
///
/// Implementations own authentication and the wire protocol; the engine
/// only relies on chunked-block semantics: staged blocks are invisible
/// until [`commit_block_list`](Self::commit_block_list) assembles them in
/// the order given.
pub trait BlobClient: Send + Sync {
    /// Fetches blob metadata. Also used as the policy-activation probe.
    fn get_properties<'a>(
        &'a self,
        blob: &'a BlobHandle,
    ) -> BoxFuture<'a, Result<BlobProperties, BlobError>>;

    /// Fills `buf` with the bytes starting at `offset`.
    fn read_range<'a>(
        &'a self,
        blob: &'a BlobHandle,
        offset: u64,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(), BlobError>>;

    /// Stages one block.
    fn put_block<'a>(
        &'a self,
        blob: &'a BlobHandle,
        block: BlockUpload<'a>,
    ) -> BoxFuture<'a, Result<(), BlobError>>;

    /// Assembles the blob from staged blocks, in the order listed.
    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobHandle,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), BlobError>>;
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Builds the block ID for block `index` of one upload.
///
/// Every ID of an upload has the same length, which the storage service
/// requires within a single blob.
pub fn block_id(upload_id: &Uuid, index: usize) -> String {
    STANDARD.encode(format!("{upload_id}-{index:06}"))
}
