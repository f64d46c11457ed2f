//! Parallel chunked download with ordered write-back.
//!
//! Chunk tasks fetch ranges into leased buffers in any completion order.
//! Finished buffers are parked in the context until their turn; the
//! scheduling loop alone writes them, strictly by chunk index, so the
//! local file is laid down front to back exactly as a sequential
//! download would.

use std::io::SeekFrom;
use std::sync::Arc;

use mediablob_protocol::TransferStatus;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::context::TransferContext;
use crate::engine::{TransferParts, TransferReport};
use crate::memory::{BufferPool, LeasedBuffer};
use crate::planner::Chunk;
use crate::retry::RetryState;

type ChunkResult = (Chunk, Result<Option<LeasedBuffer>, TransferError>);

pub(crate) struct Downloader {
    parts: TransferParts,
    ctx: Arc<TransferContext>,
    pool: Arc<BufferPool>,
}

impl Downloader {
    pub(crate) fn new(
        parts: TransferParts,
        ctx: Arc<TransferContext>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self { parts, ctx, pool }
    }

    pub(crate) async fn run(self) -> Result<TransferReport, TransferError> {
        let mut file = self.open_target().await?;
        if self.ctx.total_length() == 0 {
            debug!(blob = %self.ctx.blob().uri, "empty range, nothing to fetch");
            return Ok(TransferReport::from_context(&self.ctx, TransferStatus::Completed));
        }

        let mut tasks = JoinSet::new();
        loop {
            if self.may_write() {
                if let Some((chunk, buffer)) = self.ctx.take_next_in_order() {
                    self.write_chunk(&mut file, chunk, buffer).await;
                    continue;
                }
            }

            self.schedule(&mut tasks);

            if tasks.is_empty() {
                if !self.ctx.can_schedule() {
                    break;
                }
                debug!(blob = %self.ctx.blob().uri, "waiting for a free buffer");
                match self.pool.lease_wait(self.ctx.cancel_token()).await {
                    Some(buffer) => self.start_chunk(buffer, &mut tasks),
                    None => break,
                }
                continue;
            }

            if let Some(joined) = tasks.join_next().await {
                self.on_joined(joined);
            }
        }

        self.ctx.discard_parked();
        if let Err(e) = file.flush().await {
            self.ctx.record_error(e.into());
        }
        self.finish()
    }

    /// Creates the target file, keeping existing bytes. The file is grown
    /// to the end of the requested range and never shrunk.
    async fn open_target(&self) -> Result<File, TransferError> {
        let path = self.ctx.local_path();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .await?;
        let end = self.ctx.initial_offset() + self.ctx.total_length();
        let current = file.metadata().await?.len();
        if current < end {
            file.set_len(end).await?;
        }
        Ok(file)
    }

    /// Writes stop at the first error or cancellation.
    fn may_write(&self) -> bool {
        !self.ctx.is_cancelled() && !self.ctx.has_errors()
    }

    fn schedule(&self, tasks: &mut JoinSet<ChunkResult>) {
        while self.ctx.can_schedule() {
            let Some(buffer) = self.pool.lease() else {
                break;
            };
            self.start_chunk(buffer, tasks);
        }
    }

    fn start_chunk(&self, buffer: LeasedBuffer, tasks: &mut JoinSet<ChunkResult>) {
        let Some(chunk) = self.ctx.next_chunk() else {
            return;
        };
        self.ctx.begin_chunk();
        let parts = self.parts.clone();
        let ctx = Arc::clone(&self.ctx);
        tasks.spawn(async move {
            let result = fetch_chunk(&parts, &ctx, chunk, buffer).await;
            (chunk, result)
        });
    }

    fn on_joined(&self, joined: Result<ChunkResult, JoinError>) {
        self.ctx.end_chunk();
        match joined {
            Ok((chunk, Ok(Some(buffer)))) => {
                self.ctx.add_remote(chunk.length as u64);
                if self.ctx.is_cancelled() {
                    return;
                }
                self.ctx.stash_completed(chunk, buffer);
            }
            Ok((chunk, Ok(None))) => {
                debug!(chunk = chunk.index, "range read cancelled");
            }
            Ok((chunk, Err(e))) => {
                warn!(chunk = chunk.index, offset = chunk.offset, error = %e, "range read failed");
                self.ctx.record_error(TransferError::Chunk {
                    index: chunk.index,
                    offset: chunk.offset,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                warn!(error = %e, "download task aborted");
                self.ctx.record_error(TransferError::Task(e.to_string()));
            }
        }
    }

    /// Decrypts and writes the next chunk in file order.
    async fn write_chunk(&self, file: &mut File, chunk: Chunk, mut buffer: LeasedBuffer) {
        let result = async {
            let data = &mut buffer[..chunk.length];
            if let Some(encryption) = self.ctx.encryption() {
                encryption.apply(chunk.offset, data).await?;
            }
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.write_all(data).await?;
            Ok::<_, TransferError>(())
        }
        .await;
        buffer.release();

        match result {
            Ok(()) => {
                self.ctx.advance_sequential();
                let written = self.ctx.add_local(chunk.length as u64);
                self.parts.progress.chunk_done(chunk.length as u64, written);
                debug!(chunk = chunk.index, written, "chunk written");
            }
            Err(e) => {
                warn!(chunk = chunk.index, error = %e, "chunk write failed");
                self.ctx.record_error(TransferError::Chunk {
                    index: chunk.index,
                    offset: chunk.offset,
                    source: Box::new(e),
                });
            }
        }
    }

    fn finish(&self) -> Result<TransferReport, TransferError> {
        if let Some(error) = TransferError::aggregate(self.ctx.take_errors()) {
            return Err(error);
        }
        if self.ctx.is_cancelled() && self.ctx.bytes_local() < self.ctx.total_length() {
            info!(
                blob = %self.ctx.blob().uri,
                written = self.ctx.bytes_local(),
                "download cancelled"
            );
            return Ok(TransferReport::from_context(&self.ctx, TransferStatus::Cancelled));
        }
        if !self.ctx.succeeded() {
            return Err(TransferError::Task(format!(
                "{} of {} bytes written",
                self.ctx.bytes_local(),
                self.ctx.total_length()
            )));
        }
        Ok(TransferReport::from_context(&self.ctx, TransferStatus::Completed))
    }
}

/// Fetches one range, retrying per the classifier. `Ok(None)` means
/// cancelled; the buffer is then back in its pool.
async fn fetch_chunk(
    parts: &TransferParts,
    ctx: &TransferContext,
    chunk: Chunk,
    mut buffer: LeasedBuffer,
) -> Result<Option<LeasedBuffer>, TransferError> {
    let cancel = ctx.cancel_token();
    let mut state = RetryState::default();
    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        let result = parts
            .client
            .read_range(ctx.blob(), chunk.offset, &mut buffer[..chunk.length])
            .await;
        match result {
            Ok(()) => return Ok(Some(buffer)),
            Err(error) => {
                debug!(chunk = chunk.index, offset = chunk.offset, "range read failed");
                if !parts
                    .classifier
                    .backoff("read_range", error, &mut state, cancel)
                    .await?
                {
                    return Ok(None);
                }
            }
        }
    }
}
