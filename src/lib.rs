//! proctab - cached reader library for per-UID CPU time tables.
//!
//! This library provides:
//! - `reader` - cache-aware snapshot access to proc table files, the
//!   filesystem seam and its in-memory mock
//! - `sync` - the read/write lock with writer downgrade backing the reader

pub mod reader;
pub mod sync;
