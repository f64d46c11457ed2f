use std::fmt;

use serde::{Deserialize, Serialize};

/// Credential attached to a blob reference.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Credential {
    /// Credential supplied by the environment (account key, managed identity).
    Ambient,
    /// Time-limited signed-access token string appended to the blob URI.
    SignedAccess(String),
    /// No credential; the container allows public access.
    Anonymous,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ambient => f.write_str("Ambient"),
            Self::SignedAccess(_) => f.write_str("SignedAccess(<redacted>)"),
            Self::Anonymous => f.write_str("Anonymous"),
        }
    }
}

/// Opaque reference to a remote blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobHandle {
    pub uri: String,
    pub credential: Credential,
}

impl BlobHandle {
    pub fn new(uri: impl Into<String>, credential: Credential) -> Self {
        Self {
            uri: uri.into(),
            credential,
        }
    }

    /// Shorthand for an anonymous blob reference.
    pub fn anonymous(uri: impl Into<String>) -> Self {
        Self::new(uri, Credential::Anonymous)
    }

    /// Returns `true` when the blob is reached through a signed-access URL.
    ///
    /// Signed URLs may not be active server-side right after the access
    /// policy is created, which changes how "forbidden" responses are
    /// handled.
    pub fn uses_signed_access(&self) -> bool {
        matches!(self.credential, Credential::SignedAccess(_))
    }
}

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Upload,
    Download,
}

impl fmt::Display for TransferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Upload => f.write_str("upload"),
            Self::Download => f.write_str("download"),
        }
    }
}

/// How a transfer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Byte-level progress snapshot emitted at each chunk boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProgress {
    pub kind: TransferKind,
    pub bytes_processed: u64,
    pub total_bytes: u64,
    /// Completion in percent (0-100).
    pub percentage: f64,
    /// Current throughput in bytes per second.
    pub throughput_bps: f64,
    pub blob_uri: String,
    pub local_path: String,
}

impl TransferProgress {
    /// Computes a percentage, treating an empty transfer as complete.
    pub fn percent_of(processed: u64, total: u64) -> f64 {
        if total == 0 {
            return 100.0;
        }
        processed as f64 / total as f64 * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_debug_redacts_token() {
        let cred = Credential::SignedAccess("sv=2024&sig=secret".into());
        let out = format!("{cred:?}");
        assert!(!out.contains("secret"));
        assert!(out.contains("redacted"));
    }

    #[test]
    fn blob_handle_signed_access() {
        let signed = BlobHandle::new(
            "https://acct.blob.example/c/b",
            Credential::SignedAccess("sig=x".into()),
        );
        assert!(signed.uses_signed_access());
        assert!(!BlobHandle::anonymous("https://acct.blob.example/c/b").uses_signed_access());
    }

    #[test]
    fn blob_handle_field_names() {
        let json = r#"{"uri":"u","credential":{"kind":"signed_access","value":"t"}}"#;
        let handle: BlobHandle = serde_json::from_str(json).unwrap();
        assert_eq!(handle.uri, "u");
        assert_eq!(handle.credential, Credential::SignedAccess("t".into()));
    }

    #[test]
    fn transfer_kind_display_and_serde() {
        assert_eq!(TransferKind::Upload.to_string(), "upload");
        assert_eq!(
            serde_json::to_string(&TransferKind::Download).unwrap(),
            "\"download\""
        );
    }

    #[test]
    fn status_wire_names() {
        assert_eq!(
            serde_json::to_string(&TransferStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
        let status: TransferStatus = serde_json::from_str("\"completed\"").unwrap();
        assert_eq!(status, TransferStatus::Completed);
    }

    #[test]
    fn percent_of_empty_transfer_is_complete() {
        assert!((TransferProgress::percent_of(0, 0) - 100.0).abs() < f64::EPSILON);
        assert!((TransferProgress::percent_of(25, 100) - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn progress_field_names() {
        let p = TransferProgress {
            kind: TransferKind::Upload,
            bytes_processed: 5,
            total_bytes: 10,
            percentage: 50.0,
            throughput_bps: 0.0,
            blob_uri: "u".into(),
            local_path: "/tmp/f".into(),
        };
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("bytesProcessed"));
        assert!(json.contains("throughputBps"));
    }
}
