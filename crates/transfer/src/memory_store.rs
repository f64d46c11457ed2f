//! In-process [`BlobClient`] with staged-block semantics.
//!
//! Useful for tests: faults can be scripted per operation, latency can be
//! randomized to shuffle completion order, and call counts and peak
//! concurrency are recorded.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use mediablob_protocol::BlobHandle;
use rand::Rng;

use crate::blob::{
    BlobClient, BlobError, BlobProperties, BlockUpload, BoxFuture, checksum_bytes,
};

/// Operations of the [`BlobClient`] interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetProperties,
    ReadRange,
    PutBlock,
    CommitBlockList,
}

struct Fault {
    error: BlobError,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Default)]
struct StoreState {
    blobs: HashMap<String, Vec<u8>>,
    staged: HashMap<String, HashMap<String, Vec<u8>>>,
    commits: HashMap<String, Vec<Vec<String>>>,
    faults: HashMap<Operation, Fault>,
    calls: HashMap<Operation, usize>,
    active: HashMap<Operation, usize>,
    peak: HashMap<Operation, usize>,
}

/// Blob storage held in memory.
#[derive(Default)]
pub struct MemoryBlobStore {
    state: Mutex<StoreState>,
    latency: Option<(Duration, Duration)>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays every range read and block upload by a random duration in
    /// `[min, max]`.
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        self.latency = Some((min, max.max(min)));
        self
    }

    /// Stores a committed blob.
    pub fn insert_blob(&self, uri: &str, data: Vec<u8>) {
        self.lock().blobs.insert(uri.to_string(), data);
    }

    /// Returns a copy of a committed blob.
    pub fn blob(&self, uri: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(uri).cloned()
    }

    /// Number of staged, uncommitted blocks of a blob.
    pub fn staged_blocks(&self, uri: &str) -> usize {
        self.lock().staged.get(uri).map_or(0, HashMap::len)
    }

    /// Every block list committed for a blob, oldest first.
    pub fn commits(&self, uri: &str) -> Vec<Vec<String>> {
        self.lock().commits.get(uri).cloned().unwrap_or_default()
    }

    /// Fails the next `count` calls of `op` with `error`.
    pub fn fail_next(&self, op: Operation, count: usize, error: BlobError) {
        self.lock().faults.insert(
            op,
            Fault {
                error,
                remaining: Some(count),
            },
        );
    }

    /// Fails every call of `op` with `error` until cleared.
    pub fn fail_always(&self, op: Operation, error: BlobError) {
        self.lock().faults.insert(
            op,
            Fault {
                error,
                remaining: None,
            },
        );
    }

    pub fn clear_faults(&self) {
        self.lock().faults.clear();
    }

    /// Number of calls of `op`, failed ones included.
    pub fn calls(&self, op: Operation) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Highest number of concurrently executing calls of `op`.
    pub fn peak_concurrency(&self, op: Operation) -> usize {
        self.lock().peak.get(&op).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call, applies scripted faults and tracks concurrency.
    fn enter(&self, op: Operation) -> Result<ActiveCall<'_>, BlobError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;

        if let Some(fault) = state.faults.get_mut(&op) {
            let error = fault.error.clone();
            match &mut fault.remaining {
                None => return Err(error),
                Some(0) => {
                    state.faults.remove(&op);
                }
                Some(n) => {
                    *n -= 1;
                    if *n == 0 {
                        state.faults.remove(&op);
                    }
                    return Err(error);
                }
            }
        }

        let active = {
            let active = state.active.entry(op).or_default();
            *active += 1;
            *active
        };
        let peak = state.peak.entry(op).or_default();
        *peak = (*peak).max(active);
        Ok(ActiveCall { store: self, op })
    }

    async fn simulate_latency(&self) {
        if let Some((min, max)) = self.latency {
            let delay = if max > min {
                rand::thread_rng().gen_range(min..=max)
            } else {
                min
            };
            tokio::time::sleep(delay).await;
        }
    }
}

struct ActiveCall<'a> {
    store: &'a MemoryBlobStore,
    op: Operation,
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        let mut state = self.store.lock();
        if let Some(active) = state.active.get_mut(&self.op) {
            *active = active.saturating_sub(1);
        }
    }
}

impl BlobClient for MemoryBlobStore {
    fn get_properties<'a>(
        &'a self,
        blob: &'a BlobHandle,
    ) -> BoxFuture<'a, Result<BlobProperties, BlobError>> {
        Box::pin(async move {
            let _call = self.enter(Operation::GetProperties)?;
            let state = self.lock();
            let data = state
                .blobs
                .get(&blob.uri)
                .ok_or_else(|| BlobError::NotFound(blob.uri.clone()))?;
            Ok(BlobProperties {
                length: data.len() as u64,
            })
        })
    }

    fn read_range<'a>(
        &'a self,
        blob: &'a BlobHandle,
        offset: u64,
        buf: &'a mut [u8],
    ) -> BoxFuture<'a, Result<(), BlobError>> {
        Box::pin(async move {
            let _call = self.enter(Operation::ReadRange)?;
            self.simulate_latency().await;

            let state = self.lock();
            let data = state
                .blobs
                .get(&blob.uri)
                .ok_or_else(|| BlobError::NotFound(blob.uri.clone()))?;
            let start = usize::try_from(offset)
                .map_err(|_| BlobError::Other("offset out of range".into()))?;
            let end = start + buf.len();
            if end > data.len() {
                return Err(BlobError::Other(format!(
                    "range {start}..{end} not satisfiable for {} bytes",
                    data.len()
                )));
            }
            buf.copy_from_slice(&data[start..end]);
            Ok(())
        })
    }

    fn put_block<'a>(
        &'a self,
        blob: &'a BlobHandle,
        block: BlockUpload<'a>,
    ) -> BoxFuture<'a, Result<(), BlobError>> {
        Box::pin(async move {
            let _call = self.enter(Operation::PutBlock)?;
            self.simulate_latency().await;

            if checksum_bytes(block.data) != block.checksum {
                return Err(BlobError::Integrity(format!(
                    "block {} checksum mismatch",
                    block.block_id
                )));
            }
            self.lock()
                .staged
                .entry(blob.uri.clone())
                .or_default()
                .insert(block.block_id.to_string(), block.data.to_vec());
            Ok(())
        })
    }

    fn commit_block_list<'a>(
        &'a self,
        blob: &'a BlobHandle,
        block_ids: &'a [String],
    ) -> BoxFuture<'a, Result<(), BlobError>> {
        Box::pin(async move {
            let _call = self.enter(Operation::CommitBlockList)?;

            let mut state = self.lock();
            let staged = state.staged.remove(&blob.uri).unwrap_or_default();
            let mut data = Vec::new();
            for id in block_ids {
                match staged.get(id) {
                    Some(block) => data.extend_from_slice(block),
                    None => {
                        // Leave the staged blocks in place for a later attempt.
                        state.staged.insert(blob.uri.clone(), staged);
                        return Err(BlobError::Other(format!("block {id} was not staged")));
                    }
                }
            }
            state.blobs.insert(blob.uri.clone(), data);
            state
                .commits
                .entry(blob.uri.clone())
                .or_default()
                .push(block_ids.to_vec());
            Ok(())
        })
    }
}
