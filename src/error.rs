use std::io;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use thiserror::Error;
use tracing::error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PackTreeError>;

/// The only error kinds the core raises (spec.md §7).
#[derive(Debug, Error)]
pub enum PackTreeError {
    /// Underlying filesystem or pread/pwrite failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// A decode failed in a way that is not corruption (caller passed bad input).
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// A search or delete target does not exist. Recoverable, surfaced to caller.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// Unique constraint violation. Non-fatal; colliding record carried alongside.
    #[error("duplicate key, colliding record {colliding:?}")]
    Duplicate {
        /// Opaque record reference of the record already holding this key.
        colliding: crate::types::RecRef,
    },
    /// Decode failure, impossible page length, misaligned block, dangling pointer.
    /// Marks the table crashed (unless read-only) and hints "retry without quick".
    #[error("corrupt: {0}")]
    Corruption(&'static str),
    /// Fatal to the current operation; the in-memory tree being built is
    /// destroyed, but the on-disk tree is unchanged (the write lock
    /// serializes mutations).
    #[error("out of memory: {0}")]
    OutOfMemory(&'static str),
    /// Data or index file has hit its configured size ceiling.
    #[error("file full: {0}")]
    FileFull(&'static str),
    /// Sticky state-header flag; every subsequent open observes it until repair.
    #[error("table marked crashed: {0}")]
    Crashed(&'static str),
    /// A feature named by the caller is not implemented by this build.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}

impl PackTreeError {
    /// True for the taxonomy entries that must stamp the state header's
    /// crashed bit on the way out (spec.md §7).
    pub fn marks_crashed(&self) -> bool {
        matches!(self, PackTreeError::Corruption(_))
    }
}

/// Lock a [`Mutex`], converting poison into [`PackTreeError::Corruption`] and
/// logging the event, mirroring the teacher crate's `acquire_lock` helper.
pub fn acquire_lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex.lock().map_err(|_| {
        error!("index lock poisoned - fatal error");
        PackTreeError::Corruption("lock poisoned")
    })
}

/// Acquire a read guard on an [`RwLock`], converting poison into corruption.
pub fn acquire_read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| {
        error!("index root lock poisoned on read - fatal error");
        PackTreeError::Corruption("lock poisoned")
    })
}

/// Acquire a write guard on an [`RwLock`], converting poison into corruption.
pub fn acquire_write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| {
        error!("index root lock poisoned on write - fatal error");
        PackTreeError::Corruption("lock poisoned")
    })
}
