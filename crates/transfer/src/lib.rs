//! Chunked, parallel, resumable blob transfers.
//!
//! Uploads read a local file in fixed-size chunks, stage each chunk as a
//! block and commit the block list at the end. Downloads fetch ranges in
//! parallel and write them back strictly in file order. Both bound their
//! memory through a shared [`BufferPoolRegistry`] and can run every chunk
//! through an AES-CTR transform keyed by a per-file IV.

pub mod blob;
pub mod bulk;
pub mod config;
pub mod context;
mod downloader;
pub mod encryption;
mod engine;
mod error;
pub mod memory;
pub mod memory_store;
pub mod planner;
pub mod progress;
pub mod retry;
mod uploader;

pub use blob::{BlobClient, BlobError, BlobProperties, BlockUpload, block_id, checksum_bytes};
pub use bulk::{BulkOptions, DecryptJob, EncryptedFile, FileJob, decrypt_files, encrypt_files};
pub use config::TransferConfig;
pub use encryption::{ContentKey, FileEncryption, IvRegistry};
pub use engine::{
    DownloadRequest, TransferEngine, TransferOptions, TransferReport, UploadRequest,
};
pub use error::TransferError;
pub use memory::{BufferPool, BufferPoolRegistry, LeasedBuffer};
pub use memory_store::{MemoryBlobStore, Operation};
pub use planner::{Chunk, ChunkPlan, ChunkPlanner};
pub use progress::{SpeedCalculator, TransferCompletion, TransferObserver};
pub use retry::{ExponentialRetry, NoRetry, RetryPolicy, wait_for_policy_activation};

pub use mediablob_protocol::{
    BlobHandle, Credential, TransferKind, TransferProgress, TransferStatus,
};
