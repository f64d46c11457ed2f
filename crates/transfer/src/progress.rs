use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use mediablob_protocol::{TransferKind, TransferProgress, TransferStatus};

use crate::TransferError;

/// Default sliding window for throughput estimation.
pub const DEFAULT_SPEED_WINDOW: Duration = Duration::from_secs(5);

/// Default number of retained throughput samples.
pub const DEFAULT_MAX_SAMPLES: usize = 100;

/// Terminal notification for one transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferCompletion<'a> {
    pub kind: TransferKind,
    pub status: TransferStatus,
    /// `true` when the transfer stopped because cancellation was requested.
    pub canceled: bool,
    pub error: Option<&'a TransferError>,
    pub local_path: &'a Path,
    pub uri: &'a str,
}

/// Receives progress and completion notifications.
///
/// `on_complete` is invoked exactly once per transfer, after every chunk
/// operation has drained.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, _progress: &TransferProgress) {}

    fn on_complete(&self, _completion: &TransferCompletion<'_>) {}
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Calculates transfer speed using a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_SPEED_WINDOW, DEFAULT_MAX_SAMPLES)
    }
}

impl SpeedCalculator {
    pub fn new(window_size: Duration, max_samples: usize) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.max(2),
                window_size,
            }),
        }
    }

    /// Records `bytes` completed at the current instant.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average speed in bytes/second within the window, 0.0 with fewer
    /// than two samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes were moved before it.
        let total_bytes: u64 = s.samples.iter().skip(1).map(|sample| sample.bytes).sum();
        total_bytes as f64 / elapsed.as_secs_f64()
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// Turns chunk completions into [`TransferProgress`] notifications.
pub struct ProgressReporter {
    kind: TransferKind,
    total_bytes: u64,
    blob_uri: String,
    local_path: String,
    observer: Option<Arc<dyn TransferObserver>>,
    speed: SpeedCalculator,
}

impl ProgressReporter {
    pub fn new(
        kind: TransferKind,
        total_bytes: u64,
        blob_uri: &str,
        local_path: &Path,
        observer: Option<Arc<dyn TransferObserver>>,
        speed: SpeedCalculator,
    ) -> Self {
        speed.add_sample(0);
        Self {
            kind,
            total_bytes,
            blob_uri: blob_uri.to_string(),
            local_path: local_path.to_string_lossy().into_owned(),
            observer,
            speed,
        }
    }

    /// Records `delta` newly finished bytes, `processed` in total, and
    /// notifies the observer.
    pub fn chunk_done(&self, delta: u64, processed: u64) -> TransferProgress {
        self.speed.add_sample(delta);
        let progress = TransferProgress {
            kind: self.kind,
            bytes_processed: processed,
            total_bytes: self.total_bytes,
            percentage: TransferProgress::percent_of(processed, self.total_bytes),
            throughput_bps: self.speed.bytes_per_second(),
            blob_uri: self.blob_uri.clone(),
            local_path: self.local_path.clone(),
        };
        if let Some(observer) = &self.observer {
            observer.on_progress(&progress);
        }
        progress
    }
}
