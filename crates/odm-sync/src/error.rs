//! Error types for the sync layer.

use crate::store::StoreError;
use thiserror::Error;

/// Errors surfaced by mirror sessions.
///
/// Pushes deliberately never fail their caller (store failures are logged at
/// the throttle-callback boundary), so this surface is small.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("session closed")]
    Closed,
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
