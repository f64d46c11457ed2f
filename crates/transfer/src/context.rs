//! Shared mutable state of one transfer.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use mediablob_protocol::{BlobHandle, TransferKind};
use tokio_util::sync::CancellationToken;

use crate::TransferError;
use crate::encryption::FileEncryption;
use crate::memory::LeasedBuffer;
use crate::planner::{Chunk, ChunkPlan};

/// State of one upload or download, shared by the scheduling loop and
/// its chunk tasks.
///
/// Counters only grow, and never past `total_length`. Once the transfer
/// is complete (all bytes committed, or a fatal error recorded) no new
/// chunk is handed out.
pub struct TransferContext {
    kind: TransferKind,
    blob: BlobHandle,
    local_path: PathBuf,
    block_size: usize,
    initial_offset: u64,
    total_length: u64,
    chunk_count: usize,
    threads: usize,

    pending: Mutex<VecDeque<Chunk>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    bytes_remote: AtomicU64,
    bytes_local: AtomicU64,

    next_sequential: AtomicUsize,
    completed: Mutex<BTreeMap<usize, (Chunk, LeasedBuffer)>>,

    complete: AtomicBool,
    cancel: CancellationToken,
    errors: Mutex<Vec<TransferError>>,

    encryption: Option<Arc<FileEncryption>>,
}

impl TransferContext {
    pub fn new(
        kind: TransferKind,
        blob: BlobHandle,
        local_path: PathBuf,
        plan: ChunkPlan,
        cancel: CancellationToken,
        encryption: Option<Arc<FileEncryption>>,
    ) -> Self {
        let chunk_count = plan.chunk_count();
        Self {
            kind,
            blob,
            local_path,
            block_size: plan.block_size,
            initial_offset: plan.initial_offset,
            total_length: plan.total_length,
            chunk_count,
            threads: plan.threads,
            pending: Mutex::new(plan.chunks),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            bytes_remote: AtomicU64::new(0),
            bytes_local: AtomicU64::new(0),
            next_sequential: AtomicUsize::new(0),
            completed: Mutex::new(BTreeMap::new()),
            complete: AtomicBool::new(plan.total_length == 0),
            cancel,
            errors: Mutex::new(Vec::new()),
            encryption,
        }
    }

    pub fn kind(&self) -> TransferKind {
        self.kind
    }

    pub fn blob(&self) -> &BlobHandle {
        &self.blob
    }

    pub fn local_path(&self) -> &Path {
        &self.local_path
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn initial_offset(&self) -> u64 {
        self.initial_offset
    }

    pub fn total_length(&self) -> u64 {
        self.total_length
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn encryption(&self) -> Option<&Arc<FileEncryption>> {
        self.encryption.as_ref()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    // -- scheduling ---------------------------------------------------------

    /// `true` while new chunk operations may start: the transfer is not
    /// complete or cancelled, work is pending and a worker slot is free.
    pub fn can_schedule(&self) -> bool {
        !self.is_complete()
            && !self.is_cancelled()
            && self.in_flight() < self.threads
            && self.has_pending()
    }

    pub fn has_pending(&self) -> bool {
        !lock(&self.pending).is_empty()
    }

    /// Takes the next chunk. Each chunk is handed out at most once.
    pub fn next_chunk(&self) -> Option<Chunk> {
        lock(&self.pending).pop_front()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Highest in-flight count observed.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::Acquire)
    }

    pub fn begin_chunk(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        debug_assert!(now <= self.threads, "in-flight count above thread limit");
        self.peak_in_flight.fetch_max(now, Ordering::AcqRel);
    }

    pub fn end_chunk(&self) {
        let prev = self.in_flight.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "chunk ended twice");
    }

    // -- counters -----------------------------------------------------------

    pub fn bytes_remote(&self) -> u64 {
        self.bytes_remote.load(Ordering::Acquire)
    }

    pub fn bytes_local(&self) -> u64 {
        self.bytes_local.load(Ordering::Acquire)
    }

    /// Adds bytes moved over the network. Returns the new total.
    pub fn add_remote(&self, bytes: u64) -> u64 {
        let total = self.bytes_remote.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug_assert!(total <= self.total_length);
        total
    }

    /// Adds bytes committed on the local side and completes the transfer
    /// once every byte is accounted for. Returns the new total.
    pub fn add_local(&self, bytes: u64) -> u64 {
        let total = self.bytes_local.fetch_add(bytes, Ordering::AcqRel) + bytes;
        debug_assert!(total <= self.total_length);
        if total >= self.total_length {
            self.mark_complete();
        }
        total
    }

    // -- ordered write-back -------------------------------------------------

    /// Index of the next chunk eligible for the ordered file write.
    pub fn next_sequential(&self) -> usize {
        self.next_sequential.load(Ordering::Acquire)
    }

    /// Parks a downloaded buffer until its turn to be written.
    pub fn stash_completed(&self, chunk: Chunk, buffer: LeasedBuffer) {
        lock(&self.completed).insert(chunk.index, (chunk, buffer));
    }

    /// Takes the buffer of the next chunk in file order, if it has arrived.
    ///
    /// The caller must write it and then call [`advance_sequential`].
    ///
    /// [`advance_sequential`]: Self::advance_sequential
    pub fn take_next_in_order(&self) -> Option<(Chunk, LeasedBuffer)> {
        let next = self.next_sequential();
        lock(&self.completed).remove(&next)
    }

    pub fn advance_sequential(&self) {
        self.next_sequential.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of downloaded buffers waiting for their turn.
    pub fn parked_buffers(&self) -> usize {
        lock(&self.completed).len()
    }

    /// Releases every parked buffer.
    pub fn discard_parked(&self) {
        lock(&self.completed).clear();
    }

    // -- terminal state -----------------------------------------------------

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }

    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Records a fatal error; the transfer stops scheduling new chunks.
    pub fn record_error(&self, error: TransferError) {
        lock(&self.errors).push(error);
        self.mark_complete();
    }

    pub fn has_errors(&self) -> bool {
        !lock(&self.errors).is_empty()
    }

    /// Drains the accumulated fatal errors.
    pub fn take_errors(&self) -> Vec<TransferError> {
        std::mem::take(&mut *lock(&self.errors))
    }

    /// `true` when every byte has been committed locally and no error or
    /// cancellation interfered.
    pub fn succeeded(&self) -> bool {
        self.bytes_local() == self.total_length && !self.has_errors()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::BufferPool;
    use crate::planner::ChunkPlanner;

    fn context(total: u64, block: usize, threads: usize) -> TransferContext {
        let plan = ChunkPlanner::new(block, 100).unwrap().plan(0, total, threads).unwrap();
        TransferContext::new(
            TransferKind::Download,
            BlobHandle::anonymous("mem://c/b"),
            PathBuf::from("/tmp/out"),
            plan,
            CancellationToken::new(),
            None,
        )
    }

    #[test]
    fn chunks_handed_out_once() {
        let ctx = context(25, 10, 2);
        assert_eq!(ctx.chunk_count(), 3);
        let indices: Vec<usize> = std::iter::from_fn(|| ctx.next_chunk())
            .map(|c| c.index)
            .collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(ctx.next_chunk().is_none());
        assert!(!ctx.has_pending());
    }

    #[test]
    fn scheduling_respects_thread_limit() {
        let ctx = context(30, 10, 2);
        assert!(ctx.can_schedule());
        ctx.begin_chunk();
        ctx.begin_chunk();
        assert!(!ctx.can_schedule());
        ctx.end_chunk();
        assert!(ctx.can_schedule());
        assert_eq!(ctx.peak_in_flight(), 2);
    }

    #[test]
    fn complete_when_all_bytes_local() {
        let ctx = context(25, 10, 1);
        ctx.add_remote(25);
        assert!(!ctx.is_complete());
        ctx.add_local(10);
        ctx.add_local(10);
        assert!(!ctx.is_complete());
        ctx.add_local(5);
        assert!(ctx.is_complete());
        assert!(ctx.succeeded());
        assert!(!ctx.can_schedule());
    }

    #[test]
    fn error_completes_transfer() {
        let ctx = context(25, 10, 1);
        ctx.record_error(TransferError::Task("boom".into()));
        assert!(ctx.is_complete());
        assert!(!ctx.can_schedule());
        assert!(!ctx.succeeded());
        assert_eq!(ctx.take_errors().len(), 1);
        assert!(!ctx.has_errors());
    }

    #[test]
    fn zero_length_starts_complete() {
        let ctx = context(0, 10, 4);
        assert!(ctx.is_complete());
        assert!(ctx.succeeded());
        assert!(!ctx.can_schedule());
    }

    #[test]
    fn ordered_write_back() {
        let ctx = context(30, 10, 3);
        let pool = BufferPool::new(10, 3);
        let chunks: Vec<_> = std::iter::from_fn(|| ctx.next_chunk()).collect();

        ctx.stash_completed(chunks[2], pool.lease().unwrap());
        ctx.stash_completed(chunks[1], pool.lease().unwrap());
        assert!(ctx.take_next_in_order().is_none());

        ctx.stash_completed(chunks[0], pool.lease().unwrap());
        for expected in 0..3 {
            let (chunk, buffer) = ctx.take_next_in_order().unwrap();
            assert_eq!(chunk.index, expected);
            buffer.release();
            ctx.advance_sequential();
        }
        assert_eq!(ctx.parked_buffers(), 0);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn discard_releases_parked_buffers() {
        let ctx = context(30, 10, 3);
        let pool = BufferPool::new(10, 3);
        let chunk = ctx.next_chunk().unwrap();
        let _ = ctx.next_chunk();
        let last = ctx.next_chunk().unwrap();
        ctx.stash_completed(last, pool.lease().unwrap());
        ctx.stash_completed(chunk, pool.lease().unwrap());
        ctx.discard_parked();
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn cancellation_stops_scheduling() {
        let ctx = context(30, 10, 3);
        ctx.cancel_token().cancel();
        assert!(ctx.is_cancelled());
        assert!(!ctx.can_schedule());
    }
}
