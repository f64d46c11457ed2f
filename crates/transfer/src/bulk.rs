//! Concurrent encryption and decryption of local files.
//!
//! Files are cut into small local chunks and every chunk of every file
//! goes through one bounded worker set. Each file has its own transform
//! and its own destination handle; a chunk task always takes the
//! transform lock before the destination lock, so workers touching
//! several files at once cannot deadlock.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::config::TransferConfig;
use crate::encryption::{ContentKey, FileEncryption, IvRegistry};
use crate::memory::BufferPool;
use crate::planner::{self, Chunk, ChunkPlanner};
use crate::uploader::read_chunk;

/// One file to transform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileJob {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl FileJob {
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
        }
    }
}

/// A file produced by [`encrypt_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedFile {
    pub source: PathBuf,
    pub destination: PathBuf,
    /// IV the file was encrypted under; needed to decrypt it.
    pub iv: u64,
    pub length: u64,
}

impl EncryptedFile {
    /// Job that decrypts this file into `destination`.
    pub fn decrypt_to(&self, destination: impl Into<PathBuf>) -> DecryptJob {
        DecryptJob {
            source: self.destination.clone(),
            destination: destination.into(),
            iv: self.iv,
        }
    }
}

/// One encrypted file to restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptJob {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub iv: u64,
}

/// Chunking and parallelism of a bulk run.
#[derive(Debug, Clone)]
pub struct BulkOptions {
    pub planner: ChunkPlanner,
    pub threads: usize,
    pub cancel: CancellationToken,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            planner: ChunkPlanner::local(),
            threads: planner::default_threads(),
            cancel: CancellationToken::new(),
        }
    }
}

impl BulkOptions {
    pub fn from_config(config: &TransferConfig) -> Result<Self, TransferError> {
        Ok(Self {
            planner: config.local_planner()?,
            threads: config.threads(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }
}

/// Encrypts every job's source into its destination.
///
/// Each file gets an IV from `ivs` that no other file under the same key
/// uses. Returns `Ok(None)` if cancelled; destinations are then left
/// partially written.
pub async fn encrypt_files(
    key: &ContentKey,
    jobs: &[FileJob],
    ivs: &IvRegistry,
    options: &BulkOptions,
) -> Result<Option<Vec<EncryptedFile>>, TransferError> {
    let mut files = Vec::with_capacity(jobs.len());
    for job in jobs {
        let encryption = FileEncryption::for_new_file(key, ivs)?;
        files.push(FileState::open(&job.source, &job.destination, encryption).await?);
    }

    if !transform_all(&files, options).await? {
        return Ok(None);
    }
    info!(files = files.len(), "bulk encryption finished");

    Ok(Some(
        files
            .iter()
            .map(|f| EncryptedFile {
                source: f.source.clone(),
                destination: f.destination_path.clone(),
                iv: f.encryption.iv(),
                length: f.length,
            })
            .collect(),
    ))
}

/// Decrypts files produced by [`encrypt_files`].
///
/// Returns `Ok(false)` if cancelled.
pub async fn decrypt_files(
    key: &ContentKey,
    jobs: &[DecryptJob],
    options: &BulkOptions,
) -> Result<bool, TransferError> {
    let mut files = Vec::with_capacity(jobs.len());
    for job in jobs {
        let encryption = FileEncryption::new(key, job.iv)?;
        files.push(FileState::open(&job.source, &job.destination, encryption).await?);
    }
    let finished = transform_all(&files, options).await?;
    if finished {
        info!(files = files.len(), "bulk decryption finished");
    }
    Ok(finished)
}

struct FileState {
    source: PathBuf,
    destination_path: PathBuf,
    length: u64,
    encryption: FileEncryption,
    destination: Mutex<File>,
}

impl FileState {
    async fn open(
        source: &Path,
        destination: &Path,
        encryption: FileEncryption,
    ) -> Result<Arc<Self>, TransferError> {
        let length = tokio::fs::metadata(source).await?.len();
        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(destination)
            .await?;
        file.set_len(length).await?;
        Ok(Arc::new(Self {
            source: source.to_path_buf(),
            destination_path: destination.to_path_buf(),
            length,
            encryption,
            destination: Mutex::new(file),
        }))
    }

    async fn transform_chunk(&self, chunk: Chunk, data: &mut [u8]) -> Result<(), TransferError> {
        read_chunk(&self.source, chunk, data).await?;

        let mut transform = self.encryption.lock().await;
        let mut destination = self.destination.lock().await;
        transform.apply(chunk.offset, data)?;
        destination.seek(SeekFrom::Start(chunk.offset)).await?;
        destination.write_all(data).await?;
        Ok(())
    }
}

/// Runs every chunk of every file. Returns `false` if cancelled.
async fn transform_all(
    files: &[Arc<FileState>],
    options: &BulkOptions,
) -> Result<bool, TransferError> {
    let mut queue = VecDeque::new();
    for file in files {
        let plan = options.planner.plan(0, file.length, 1)?;
        queue.extend(plan.chunks.into_iter().map(|chunk| (Arc::clone(file), chunk)));
    }
    let threads = options.threads.max(1).min(queue.len().max(1));
    let pool = BufferPool::new(options.planner.block_size(), threads);
    debug!(files = files.len(), chunks = queue.len(), threads, "bulk transform planned");

    let mut tasks = JoinSet::new();
    let mut errors = Vec::new();
    loop {
        while errors.is_empty() && !options.cancel.is_cancelled() && tasks.len() < threads {
            let Some((file, chunk)) = queue.pop_front() else {
                break;
            };
            let Some(mut buffer) = pool.lease() else {
                queue.push_front((file, chunk));
                break;
            };
            tasks.spawn(async move {
                let result = file.transform_chunk(chunk, &mut buffer[..chunk.length]).await;
                buffer.release();
                result.map_err(|e| TransferError::Chunk {
                    index: chunk.index,
                    offset: chunk.offset,
                    source: Box::new(e),
                })
            });
        }

        match tasks.join_next().await {
            Some(Ok(Ok(()))) => {}
            Some(Ok(Err(e))) => {
                warn!(error = %e, "bulk chunk failed");
                errors.push(e);
            }
            Some(Err(e)) => errors.push(TransferError::Task(e.to_string())),
            None => break,
        }
    }

    for file in files {
        file.destination.lock().await.flush().await?;
    }
    if let Some(error) = TransferError::aggregate(errors) {
        return Err(error);
    }
    Ok(queue.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(seed).wrapping_add(7)).collect()
    }

    fn options(block_size: usize, threads: usize) -> BulkOptions {
        BulkOptions {
            planner: ChunkPlanner::new(block_size, u64::MAX).unwrap(),
            threads,
            cancel: CancellationToken::new(),
        }
    }

    #[tokio::test]
    async fn encrypt_then_decrypt_many_files() {
        let dir = tempfile::tempdir().unwrap();
        let sizes = [0usize, 1, 100, 1000, 4099];
        let mut jobs = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            let source = dir.path().join(format!("plain-{i}"));
            std::fs::write(&source, sample(*size, i as u8 + 3)).unwrap();
            jobs.push(FileJob::new(source, dir.path().join(format!("enc/{i}"))));
        }

        let key = ContentKey::generate();
        let ivs = IvRegistry::new();
        let opts = options(100, 4);
        let encrypted = encrypt_files(&key, &jobs, &ivs, &opts).await.unwrap().unwrap();

        assert_eq!(encrypted.len(), sizes.len());
        assert_eq!(ivs.len(), sizes.len());
        let mut seen: Vec<u64> = encrypted.iter().map(|f| f.iv).collect();
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), sizes.len());

        for (file, size) in encrypted.iter().zip(sizes) {
            let ciphertext = std::fs::read(&file.destination).unwrap();
            assert_eq!(ciphertext.len(), size);
            assert_eq!(file.length, size as u64);
            if size > 16 {
                assert_ne!(ciphertext, std::fs::read(&file.source).unwrap());
            }
        }

        let decrypt: Vec<_> = encrypted
            .iter()
            .enumerate()
            .map(|(i, f)| f.decrypt_to(dir.path().join(format!("dec/{i}"))))
            .collect();
        assert!(decrypt_files(&key, &decrypt, &opts).await.unwrap());

        for (job, restored) in jobs.iter().zip(&decrypt) {
            assert_eq!(
                std::fs::read(&job.source).unwrap(),
                std::fs::read(&restored.destination).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn chunk_size_does_not_change_ciphertext() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("plain");
        std::fs::write(&source, sample(3000, 11)).unwrap();

        let key = ContentKey::generate();
        let mut outputs = Vec::new();
        for (i, block) in [64usize, 100, 4096].into_iter().enumerate() {
            let destination = dir.path().join(format!("enc-{i}"));
            let encryption = FileEncryption::new(&key, 42).unwrap();
            let file = FileState::open(&source, &destination, encryption).await.unwrap();
            assert!(transform_all(&[file], &options(block, 3)).await.unwrap());
            outputs.push(std::fs::read(&destination).unwrap());
        }
        assert_eq!(outputs[0], outputs[1]);
        assert_eq!(outputs[1], outputs[2]);
    }

    #[tokio::test]
    async fn cancelled_run_reports_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("plain");
        std::fs::write(&source, sample(1000, 5)).unwrap();

        let opts = options(10, 2);
        opts.cancel.cancel();
        let result = encrypt_files(
            &ContentKey::generate(),
            &[FileJob::new(&source, dir.path().join("enc"))],
            &IvRegistry::new(),
            &opts,
        )
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn missing_source_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = encrypt_files(
            &ContentKey::generate(),
            &[FileJob::new(dir.path().join("nope"), dir.path().join("enc"))],
            &IvRegistry::new(),
            &BulkOptions::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Io(_)));
    }
}
