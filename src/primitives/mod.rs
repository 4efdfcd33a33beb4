//! Low-level primitives for building the storage engine.
//!
//! Includes I/O operations and concurrency controls.

/// Concurrency primitives and synchronization.
///
/// Thread-safe data structures and coordination mechanisms for concurrent access.
pub mod concurrency;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing data and file operations.
pub mod io;
