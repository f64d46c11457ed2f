//! Boundary types for the mediablob transfer engine.
//!
//! These types describe the remote side of a transfer (a blob and the
//! credential used to reach it) and the status snapshots the engine hands
//! back to observers. They carry no behavior beyond small helpers and are
//! serializable so callers can persist or forward them.

pub mod types;

pub use types::{BlobHandle, Credential, TransferKind, TransferProgress, TransferStatus};
