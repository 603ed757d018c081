//! Cached snapshot access to per-UID CPU time tables.
//!
//! Several statistics collectors poll the same slowly-changing proc files
//! at nearly the same moments. The reader serializes the expensive file
//! reads and shares one buffered snapshot with all of them:
//!
//! ```text
//! ┌───────────────────────────────────────────────────────┐
//! │                   ProcTableReader                     │
//! │   freshness check ── refresh (single writer) ──┐      │
//! │        │                                       │      │
//! │        ▼                                       ▼      │
//! │   ProcFileIterator (read lock)        DowngradeRwLock │
//! └───────────────────────┬───────────────────────────────┘
//!                         │
//!                  ┌──────▼──────┐
//!                  │ FileSystem  │ (trait)
//!                  └──────┬──────┘
//!              ┌──────────┴──────────┐
//!       ┌──────▼──────┐       ┌──────▼──────┐
//!       │   RealFs    │       │   MockFs    │
//!       │ (/proc)     │       │ (testing)   │
//!       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ## Production (Linux)
//!
//! ```ignore
//! use proctab::reader::freq_time_reader;
//!
//! let mut row = [0u64; 32];
//! if let Ok(mut iter) = freq_time_reader().open() {
//!     while let Some(count) = iter.next_line_as_numbers(&mut row) {
//!         // consume row[..count]
//!     }
//! }
//! ```
//!
//! ## Testing (with MockFs)
//!
//! ```
//! use proctab::reader::{MockFs, ProcTableReader};
//!
//! let fs = MockFs::new();
//! fs.add_file("/proc/uid_time_in_state", "uid: 0 123 456\n");
//!
//! let reader = ProcTableReader::with_source(fs, "/proc/uid_time_in_state");
//! let mut iter = reader.open().unwrap();
//! assert_eq!(iter.next_line(), Some("uid: 0 123 456"));
//! ```

pub mod mock;
pub mod proc_table;
pub mod traits;

pub use mock::MockFs;
pub use proc_table::{
    PROC_UID_ACTIVE_TIME, PROC_UID_CLUSTER_TIME, PROC_UID_FREQ_TIME, ProcFileIterator,
    ProcTableReader, ReadError, active_time_reader, cluster_time_reader, freq_time_reader,
};
pub use traits::{FileSystem, RealFs};
