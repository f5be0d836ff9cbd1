//! Error types for the sync engine and its backing-store seam.

use roadmap_types::{CacheKey, RowId, Table};
use thiserror::Error;

/// Errors reported by a [`BackingStore`](crate::store::BackingStore).
///
/// All of them are locally recoverable: the engine rolls back, refetches, or
/// logs. None of them end the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The request never produced an answer (offline, timeout, 5xx).
    #[error("network error: {0}")]
    Network(String),

    #[error("{table} row not found: {id}")]
    NotFound { table: Table, id: RowId },

    /// The store answered and refused the write (constraint, permission).
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The store does not implement an optional capability.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The store has shut down its channels.
    #[error("store closed")]
    Closed,
}

/// Errors from engine entry points.
#[derive(Error, Debug)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Field edits and deletes are refused on append-only collections.
    #[error("{0} is append-only")]
    AppendOnly(Table),

    /// The operation needs a value that has not been fetched yet.
    #[error("{0} is not cached")]
    NotCached(CacheKey),

    #[error("{0} is not a list")]
    NotAList(CacheKey),

    #[error("{0} has no dense order column")]
    NotOrderable(CacheKey),

    /// A reorder request that is not a permutation of the cached rows.
    #[error("invalid permutation for {key}: expected {expected} distinct cached ids, got {got}")]
    InvalidPermutation { key: CacheKey, expected: usize, got: usize },

    #[error("sync engine shut down")]
    Shutdown,
}
