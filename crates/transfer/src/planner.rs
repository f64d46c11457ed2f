//! Partitioning of a byte range into fixed-size chunks.

use std::collections::VecDeque;

use crate::TransferError;

/// Block size for remote blob chunks: 4 MiB.
pub const REMOTE_BLOCK_SIZE: usize = 4 * 1024 * 1024;

/// Block size for local on-disk bulk encryption: 64 KiB.
pub const LOCAL_BLOCK_SIZE: usize = 64 * 1024;

/// The storage service rejects blobs made of more blocks than this.
pub const MAX_BLOCK_COUNT: u64 = 50_000;

/// Default worker fan-out per available processor.
pub const THREADS_PER_PROCESSOR: usize = 8;

/// One unit of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Position of the chunk in the plan (0-based, file order).
    pub index: usize,
    /// Absolute byte offset.
    pub offset: u64,
    /// Length in bytes; only the last chunk may be shorter than the block size.
    pub length: usize,
}

impl Chunk {
    /// Offset one past the last byte of the chunk.
    pub fn end(&self) -> u64 {
        self.offset + self.length as u64
    }
}

/// Output of [`ChunkPlanner::plan`].
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    pub block_size: usize,
    pub initial_offset: u64,
    pub total_length: u64,
    /// Chunks in file order.
    pub chunks: VecDeque<Chunk>,
    /// Effective worker count: never more than the number of chunks.
    pub threads: usize,
}

impl ChunkPlan {
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

/// Splits byte ranges into chunks of one block size.
#[derive(Debug, Clone, Copy)]
pub struct ChunkPlanner {
    block_size: usize,
    max_blocks: u64,
}

impl ChunkPlanner {
    pub fn new(block_size: usize, max_blocks: u64) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::InvalidBlockSize);
        }
        Ok(Self {
            block_size,
            max_blocks,
        })
    }

    /// Planner for remote blob chunks.
    pub fn remote() -> Self {
        Self {
            block_size: REMOTE_BLOCK_SIZE,
            max_blocks: MAX_BLOCK_COUNT,
        }
    }

    /// Planner for local bulk encryption. Local files have no block ceiling.
    pub fn local() -> Self {
        Self {
            block_size: LOCAL_BLOCK_SIZE,
            max_blocks: u64::MAX,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of chunks needed for `total_length` bytes.
    pub fn chunk_count(&self, total_length: u64) -> u64 {
        total_length.div_ceil(self.block_size as u64)
    }

    /// Plans `[initial_offset, initial_offset + total_length)`.
    ///
    /// Fails before producing any chunk if the range needs more blocks
    /// than the service accepts or runs past the largest addressable offset.
    pub fn plan(
        &self,
        initial_offset: u64,
        total_length: u64,
        requested_threads: usize,
    ) -> Result<ChunkPlan, TransferError> {
        let end = initial_offset
            .checked_add(total_length)
            .ok_or(TransferError::InvalidRange {
                offset: initial_offset,
                length: total_length,
                available: u64::MAX - initial_offset,
            })?;
        let blocks = self.chunk_count(total_length);
        if blocks > self.max_blocks {
            return Err(TransferError::BlockLimitExceeded {
                total_length,
                block_size: self.block_size,
                blocks,
                max_blocks: self.max_blocks,
            });
        }

        let block = self.block_size as u64;
        let mut chunks = VecDeque::with_capacity(blocks as usize);
        let mut offset = initial_offset;
        while offset < end {
            let length = block.min(end - offset) as usize;
            chunks.push_back(Chunk {
                index: chunks.len(),
                offset,
                length,
            });
            offset += length as u64;
        }

        let threads = requested_threads.max(1).min(chunks.len());

        Ok(ChunkPlan {
            block_size: self.block_size,
            initial_offset,
            total_length,
            chunks,
            threads,
        })
    }
}

/// Default worker count: a multiple of the available processors.
pub fn default_threads() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    cpus * THREADS_PER_PROCESSOR
}
