//! Parallel chunked upload.
//!
//! Each chunk task reads its byte range from the local file into a leased
//! buffer, applies the optional transform, stages the block, and frees
//! the buffer. The blob is assembled by one block-list commit once every
//! block has been acknowledged.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;

use mediablob_protocol::TransferStatus;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::TransferError;
use crate::blob::{BlockUpload, block_id, checksum_bytes};
use crate::context::TransferContext;
use crate::engine::{TransferParts, TransferReport};
use crate::memory::{BufferPool, LeasedBuffer};
use crate::planner::Chunk;
use crate::retry::with_retry;

type ChunkResult = (Chunk, Result<Option<()>, TransferError>);

pub(crate) struct Uploader {
    parts: TransferParts,
    ctx: Arc<TransferContext>,
    pool: Arc<BufferPool>,
    upload_id: Uuid,
}

impl Uploader {
    pub(crate) fn new(
        parts: TransferParts,
        ctx: Arc<TransferContext>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            parts,
            ctx,
            pool,
            upload_id: Uuid::new_v4(),
        }
    }

    pub(crate) async fn run(self) -> Result<TransferReport, TransferError> {
        let mut tasks = JoinSet::new();
        loop {
            self.schedule(&mut tasks);

            if tasks.is_empty() {
                if !self.ctx.can_schedule() {
                    break;
                }
                // Every buffer of this block size is leased elsewhere.
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

        self.finish().await
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
        let upload_id = self.upload_id;
        tasks.spawn(async move {
            let result = upload_chunk(&parts, &ctx, upload_id, chunk, buffer).await;
            (chunk, result)
        });
    }

    fn on_joined(&self, joined: Result<ChunkResult, JoinError>) {
        self.ctx.end_chunk();
        match joined {
            Ok((chunk, Ok(Some(())))) => {
                let sent = self.ctx.add_remote(chunk.length as u64);
                self.parts.progress.chunk_done(chunk.length as u64, sent);
                debug!(chunk = chunk.index, bytes = chunk.length, "block staged");
            }
            Ok((chunk, Ok(None))) => {
                debug!(chunk = chunk.index, "block upload cancelled");
            }
            Ok((chunk, Err(e))) => {
                warn!(chunk = chunk.index, offset = chunk.offset, error = %e, "block upload failed");
                self.ctx.record_error(TransferError::Chunk {
                    index: chunk.index,
                    offset: chunk.offset,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                warn!(error = %e, "upload task aborted");
                self.ctx.record_error(TransferError::Task(e.to_string()));
            }
        }
    }

    async fn finish(&self) -> Result<TransferReport, TransferError> {
        if let Some(error) = TransferError::aggregate(self.ctx.take_errors()) {
            return Err(error);
        }
        if self.ctx.is_cancelled() {
            info!(blob = %self.ctx.blob().uri, "upload cancelled, nothing committed");
            return Ok(TransferReport::from_context(&self.ctx, TransferStatus::Cancelled));
        }
        if self.ctx.bytes_remote() != self.ctx.total_length() {
            return Err(TransferError::Task(format!(
                "{} of {} bytes acknowledged",
                self.ctx.bytes_remote(),
                self.ctx.total_length()
            )));
        }

        let block_ids: Vec<String> = (0..self.ctx.chunk_count())
            .map(|index| block_id(&self.upload_id, index))
            .collect();
        let committed = with_retry(
            &self.parts.classifier,
            self.ctx.cancel_token(),
            "commit_block_list",
            || {
                self.parts
                    .client
                    .commit_block_list(self.ctx.blob(), &block_ids)
            },
        )
        .await
        .map_err(|e| TransferError::Commit {
            blocks: block_ids.len(),
            source: Box::new(e),
        })?;

        let status = match committed {
            Some(()) => {
                info!(
                    blob = %self.ctx.blob().uri,
                    blocks = block_ids.len(),
                    bytes = self.ctx.total_length(),
                    "block list committed"
                );
                TransferStatus::Completed
            }
            None => TransferStatus::Cancelled,
        };
        let mut report = TransferReport::from_context(&self.ctx, status);
        if status == TransferStatus::Completed {
            report.block_ids = block_ids;
        }
        Ok(report)
    }
}

/// Reads, transforms and stages one chunk. `Ok(None)` means cancelled.
async fn upload_chunk(
    parts: &TransferParts,
    ctx: &TransferContext,
    upload_id: Uuid,
    chunk: Chunk,
    mut buffer: LeasedBuffer,
) -> Result<Option<()>, TransferError> {
    if ctx.is_cancelled() {
        return Ok(None);
    }

    let data = &mut buffer[..chunk.length];
    read_chunk(ctx.local_path(), chunk, data).await?;
    ctx.add_local(chunk.length as u64);
    if let Some(encryption) = ctx.encryption() {
        encryption.apply(chunk.offset, data).await?;
    }

    let data: &[u8] = data;
    let checksum = checksum_bytes(data);
    let block_id = block_id(&upload_id, chunk.index);
    let staged = with_retry(&parts.classifier, ctx.cancel_token(), "put_block", || {
        parts.client.put_block(
            ctx.blob(),
            BlockUpload {
                block_id: &block_id,
                data,
                checksum: &checksum,
            },
        )
    })
    .await?;

    buffer.release();
    Ok(staged)
}

/// Fills `data` from `path` at `chunk.offset`.
pub(crate) async fn read_chunk(
    path: &Path,
    chunk: Chunk,
    data: &mut [u8],
) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(chunk.offset)).await?;

    let mut filled = 0;
    while filled < data.len() {
        let n = file.read(&mut data[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    if filled != data.len() {
        return Err(TransferError::ShortRead {
            path: path.to_path_buf(),
            expected: data.len(),
            actual: filled,
        });
    }
    Ok(())
}
