//! Error types for the transfer engine.

use std::path::PathBuf;

use crate::blob::BlobError;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("block size must be greater than zero")]
    InvalidBlockSize,

    #[error(
        "{total_length} bytes need {blocks} blocks of {block_size} bytes (limit {max_blocks})"
    )]
    BlockLimitExceeded {
        total_length: u64,
        block_size: usize,
        blocks: u64,
        max_blocks: u64,
    },

    #[error("range {offset}+{length} exceeds the {available} bytes available")]
    InvalidRange {
        offset: u64,
        length: u64,
        available: u64,
    },

    #[error("short read from {path}: expected {expected} bytes, got {actual}")]
    ShortRead {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error("blob error: {0}")]
    Blob(#[from] BlobError),

    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        source: BlobError,
    },

    #[error("chunk {index} at offset {offset} failed: {source}")]
    Chunk {
        index: usize,
        offset: u64,
        #[source]
        source: Box<TransferError>,
    },

    #[error("commit of {blocks} blocks failed: {source}")]
    Commit {
        blocks: usize,
        #[source]
        source: Box<TransferError>,
    },

    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("chunk task aborted: {0}")]
    Task(String),

    #[error("{} transfer errors: {}", .0.len(), summarize(.0))]
    Aggregate(Vec<TransferError>),
}

impl TransferError {
    /// Folds the fatal errors of one transfer into a single error.
    ///
    /// Returns `None` when the list is empty.
    pub fn aggregate(mut errors: Vec<TransferError>) -> Option<TransferError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(TransferError::Aggregate(errors)),
        }
    }

    /// Number of underlying failures this error stands for.
    pub fn failure_count(&self) -> usize {
        match self {
            Self::Aggregate(errors) => errors.len(),
            _ => 1,
        }
    }

    /// Returns `true` for errors raised while planning, before any I/O.
    pub fn is_planning(&self) -> bool {
        matches!(
            self,
            Self::InvalidBlockSize | Self::BlockLimitExceeded { .. } | Self::InvalidRange { .. }
        )
    }
}

fn summarize(errors: &[TransferError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_empty_is_none() {
        assert!(TransferError::aggregate(Vec::new()).is_none());
    }

    #[test]
    fn aggregate_single_is_unwrapped() {
        let err = TransferError::aggregate(vec![TransferError::InvalidBlockSize]).unwrap();
        assert!(matches!(err, TransferError::InvalidBlockSize));
        assert_eq!(err.failure_count(), 1);
    }

    #[test]
    fn aggregate_many_keeps_all() {
        let err = TransferError::aggregate(vec![
            TransferError::Encryption("a".into()),
            TransferError::Encryption("b".into()),
        ])
        .unwrap();
        assert_eq!(err.failure_count(), 2);
        let msg = err.to_string();
        assert!(msg.starts_with("2 transfer errors"));
        assert!(msg.contains("encryption error: a; encryption error: b"));
    }

    #[test]
    fn planning_errors_are_flagged() {
        let err = TransferError::BlockLimitExceeded {
            total_length: 1,
            block_size: 1,
            blocks: 2,
            max_blocks: 1,
        };
        assert!(err.is_planning());
        assert!(!TransferError::Task("x".into()).is_planning());
    }
}
