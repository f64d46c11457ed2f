//! Transfer entry points.
//!
//! A [`TransferEngine`] owns the blob client, the buffer-pool registry and
//! the retry policy. Each call to [`upload`](TransferEngine::upload) or
//! [`download`](TransferEngine::download) plans its chunks, runs a
//! scheduling loop until every chunk has drained, and resolves to a
//! [`TransferReport`]. A registered observer sees exactly one completion,
//! whatever the outcome.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mediablob_protocol::{BlobHandle, TransferKind, TransferStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::blob::BlobClient;
use crate::config::TransferConfig;
use crate::context::TransferContext;
use crate::downloader::Downloader;
use crate::encryption::FileEncryption;
use crate::memory::BufferPoolRegistry;
use crate::progress::{
    DEFAULT_MAX_SAMPLES, ProgressReporter, SpeedCalculator, TransferCompletion, TransferObserver,
};
use crate::retry::{self, FaultClassifier, NoRetry, RetryPolicy, with_retry};
use crate::uploader::Uploader;

/// Per-transfer knobs shared by uploads and downloads.
#[derive(Clone, Default)]
pub struct TransferOptions {
    /// Worker count; falls back to the engine config.
    pub threads: Option<usize>,
    pub cancel: CancellationToken,
    pub observer: Option<Arc<dyn TransferObserver>>,
    /// Counter-mode transform applied to every chunk at its file offset.
    pub encryption: Option<Arc<FileEncryption>>,
    /// Skip the pre-flight policy activation probe for signed URLs.
    pub skip_policy_probe: bool,
}

impl TransferOptions {
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn TransferObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn with_encryption(mut self, encryption: Arc<FileEncryption>) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn without_policy_probe(mut self) -> Self {
        self.skip_policy_probe = true;
        self
    }
}

/// Uploads a local file into a blob.
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub blob: BlobHandle,
    pub options: TransferOptions,
}

impl UploadRequest {
    pub fn new(local_path: impl Into<PathBuf>, blob: BlobHandle) -> Self {
        Self {
            local_path: local_path.into(),
            blob,
            options: TransferOptions::default(),
        }
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// Downloads a blob, or a byte range of it, into a local file.
///
/// Local offsets equal blob offsets, so a partial download resumes by
/// downloading again from the first missing byte.
pub struct DownloadRequest {
    pub blob: BlobHandle,
    pub local_path: PathBuf,
    /// First blob byte to fetch.
    pub offset: u64,
    /// Bytes to fetch; `None` means up to the end of the blob.
    pub length: Option<u64>,
    pub options: TransferOptions,
}

impl DownloadRequest {
    pub fn new(blob: BlobHandle, local_path: impl Into<PathBuf>) -> Self {
        Self {
            blob,
            local_path: local_path.into(),
            offset: 0,
            length: None,
            options: TransferOptions::default(),
        }
    }

    pub fn with_range(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = Some(length);
        self
    }

    /// Continues an interrupted download at `offset`.
    pub fn resume_from(mut self, offset: u64) -> Self {
        self.offset = offset;
        self.length = None;
        self
    }

    pub fn with_options(mut self, options: TransferOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of a transfer that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferReport {
    pub kind: TransferKind,
    /// `Completed` or `Cancelled`.
    pub status: TransferStatus,
    /// Bytes committed to the local file (download) or acknowledged by
    /// the service (upload).
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub chunks: usize,
    pub threads: usize,
    /// Highest number of chunk operations observed in flight.
    pub peak_in_flight: usize,
    pub elapsed: Duration,
    /// Committed block IDs in file order. Empty for downloads.
    pub block_ids: Vec<String>,
}

impl TransferReport {
    pub(crate) fn from_context(ctx: &TransferContext, status: TransferStatus) -> Self {
        let bytes_transferred = match ctx.kind() {
            TransferKind::Upload => ctx.bytes_remote(),
            TransferKind::Download => ctx.bytes_local(),
        };
        Self {
            kind: ctx.kind(),
            status,
            bytes_transferred,
            total_bytes: ctx.total_length(),
            chunks: ctx.chunk_count(),
            threads: ctx.threads(),
            peak_in_flight: ctx.peak_in_flight(),
            elapsed: Duration::ZERO,
            block_ids: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == TransferStatus::Cancelled
    }
}

/// Shared handles a chunk scheduler needs besides its context.
#[derive(Clone)]
pub(crate) struct TransferParts {
    pub client: Arc<dyn BlobClient>,
    pub classifier: FaultClassifier,
    pub progress: Arc<ProgressReporter>,
}

/// Runs uploads and downloads against one blob client.
pub struct TransferEngine {
    client: Arc<dyn BlobClient>,
    buffers: Arc<BufferPoolRegistry>,
    retry_policy: Arc<dyn RetryPolicy>,
    config: TransferConfig,
}

impl TransferEngine {
    /// Creates an engine with the default configuration.
    pub fn new(client: Arc<dyn BlobClient>) -> Self {
        let config = TransferConfig::default();
        Self {
            client,
            buffers: Arc::new(BufferPoolRegistry::new(config.max_buffers_per_pool)),
            retry_policy: Arc::new(NoRetry),
            config,
        }
    }

    /// Creates an engine after validating `config`.
    pub fn with_config(
        client: Arc<dyn BlobClient>,
        config: TransferConfig,
    ) -> Result<Self, TransferError> {
        config.validate()?;
        Ok(Self {
            client,
            buffers: Arc::new(BufferPoolRegistry::new(config.max_buffers_per_pool)),
            retry_policy: Arc::new(NoRetry),
            config,
        })
    }

    /// Shares a buffer-pool registry with other engines.
    pub fn with_buffers(mut self, buffers: Arc<BufferPoolRegistry>) -> Self {
        self.buffers = buffers;
        self
    }

    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn buffers(&self) -> &Arc<BufferPoolRegistry> {
        &self.buffers
    }

    /// Uploads `request.local_path` into `request.blob`.
    ///
    /// The blob becomes visible only when the final block-list commit
    /// succeeds.
    pub async fn upload(&self, request: UploadRequest) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        info!(
            blob = %request.blob.uri,
            path = %request.local_path.display(),
            "upload started"
        );
        let result = self.run_upload(&request).await;
        self.complete(
            TransferKind::Upload,
            &request.blob,
            &request.local_path,
            &request.options,
            started,
            result,
        )
    }

    /// Downloads `request.blob` into `request.local_path`.
    pub async fn download(
        &self,
        request: DownloadRequest,
    ) -> Result<TransferReport, TransferError> {
        let started = Instant::now();
        info!(
            blob = %request.blob.uri,
            path = %request.local_path.display(),
            offset = request.offset,
            "download started"
        );
        let result = self.run_download(&request).await;
        self.complete(
            TransferKind::Download,
            &request.blob,
            &request.local_path,
            &request.options,
            started,
            result,
        )
    }

    async fn run_upload(&self, request: &UploadRequest) -> Result<TransferReport, TransferError> {
        let total_length = tokio::fs::metadata(&request.local_path).await?.len();
        let plan = self.config.remote_planner()?.plan(
            0,
            total_length,
            self.threads(&request.options),
        )?;
        debug!(
            blob = %request.blob.uri,
            total_bytes = total_length,
            chunks = plan.chunk_count(),
            threads = plan.threads,
            "upload planned"
        );

        self.probe_policy(&request.blob, &request.options).await;

        let ctx = Arc::new(TransferContext::new(
            TransferKind::Upload,
            request.blob.clone(),
            request.local_path.clone(),
            plan,
            request.options.cancel.clone(),
            request.options.encryption.clone(),
        ));
        let pool = self.buffers.pool(ctx.block_size());
        Uploader::new(self.parts(&ctx, &request.options), ctx, pool)
            .run()
            .await
    }

    async fn run_download(
        &self,
        request: &DownloadRequest,
    ) -> Result<TransferReport, TransferError> {
        let planner = self.config.remote_planner()?;
        self.probe_policy(&request.blob, &request.options).await;

        let classifier = self.classifier(&request.blob);
        let cancel = &request.options.cancel;
        let Some(properties) = with_retry(&classifier, cancel, "get_properties", || {
            self.client.get_properties(&request.blob)
        })
        .await?
        else {
            return Ok(self.cancelled_before_start(TransferKind::Download));
        };

        let available = properties.length;
        let length = match request.length {
            Some(length) => length,
            None => available.saturating_sub(request.offset),
        };
        let in_range = request
            .offset
            .checked_add(length)
            .is_some_and(|end| end <= available);
        if !in_range {
            return Err(TransferError::InvalidRange {
                offset: request.offset,
                length,
                available,
            });
        }

        let plan = planner.plan(request.offset, length, self.threads(&request.options))?;
        debug!(
            blob = %request.blob.uri,
            offset = request.offset,
            total_bytes = length,
            chunks = plan.chunk_count(),
            threads = plan.threads,
            "download planned"
        );

        let ctx = Arc::new(TransferContext::new(
            TransferKind::Download,
            request.blob.clone(),
            request.local_path.clone(),
            plan,
            request.options.cancel.clone(),
            request.options.encryption.clone(),
        ));
        let pool = self.buffers.pool(ctx.block_size());
        Downloader::new(self.parts(&ctx, &request.options), ctx, pool)
            .run()
            .await
    }

    fn threads(&self, options: &TransferOptions) -> usize {
        options.threads.unwrap_or_else(|| self.config.threads())
    }

    fn classifier(&self, blob: &BlobHandle) -> FaultClassifier {
        FaultClassifier::for_blob(&self.config, Arc::clone(&self.retry_policy), blob)
    }

    fn parts(&self, ctx: &TransferContext, options: &TransferOptions) -> TransferParts {
        let speed = SpeedCalculator::new(self.config.speed_window(), DEFAULT_MAX_SAMPLES);
        TransferParts {
            client: Arc::clone(&self.client),
            classifier: self.classifier(ctx.blob()),
            progress: Arc::new(ProgressReporter::new(
                ctx.kind(),
                ctx.total_length(),
                &ctx.blob().uri,
                ctx.local_path(),
                options.observer.clone(),
                speed,
            )),
        }
    }

    async fn probe_policy(&self, blob: &BlobHandle, options: &TransferOptions) {
        if options.skip_policy_probe || !blob.uses_signed_access() {
            return;
        }
        let active = retry::wait_for_policy_activation(
            self.client.as_ref(),
            blob,
            self.config.policy_activation_budget(),
            self.config.policy_probe_interval(),
        )
        .await;
        if !active {
            warn!(blob = %blob.uri, "continuing without confirmed access policy");
        }
    }

    fn cancelled_before_start(&self, kind: TransferKind) -> TransferReport {
        TransferReport {
            kind,
            status: TransferStatus::Cancelled,
            bytes_transferred: 0,
            total_bytes: 0,
            chunks: 0,
            threads: 0,
            peak_in_flight: 0,
            elapsed: Duration::ZERO,
            block_ids: Vec::new(),
        }
    }

    /// Trims idle buffers and notifies the observer exactly once.
    fn complete(
        &self,
        kind: TransferKind,
        blob: &BlobHandle,
        local_path: &Path,
        options: &TransferOptions,
        started: Instant,
        result: Result<TransferReport, TransferError>,
    ) -> Result<TransferReport, TransferError> {
        let trimmed = self.buffers.release_unused();
        let result = result.map(|mut report| {
            report.elapsed = started.elapsed();
            report
        });

        let (status, error) = match &result {
            Ok(report) => (report.status, None),
            Err(e) => (TransferStatus::Failed, Some(e)),
        };
        match error {
            Some(e) => warn!(
                %kind,
                blob = %blob.uri,
                failures = e.failure_count(),
                error = %e,
                "transfer failed"
            ),
            None => info!(
                %kind,
                blob = %blob.uri,
                ?status,
                elapsed_ms = started.elapsed().as_millis() as u64,
                trimmed_buffers = trimmed,
                "transfer finished"
            ),
        }

        if let Some(observer) = &options.observer {
            observer.on_complete(&TransferCompletion {
                kind,
                status,
                canceled: status == TransferStatus::Cancelled,
                error,
                local_path,
                uri: &blob.uri,
            });
        }
        result
    }
}
