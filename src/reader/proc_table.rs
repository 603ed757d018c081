//! Cache-aware reader for human-readable proc table files.
//!
//! Reading one of the per-UID CPU time tables can take up to ~100ms, and
//! several statistics collectors tend to poll them at the same moments.
//! The reader serializes refreshes behind a write lock and shares the
//! buffered snapshot with any number of concurrent callers through read
//! guards, reusing one growable buffer across refreshes to keep the hot
//! path free of allocations.

use crate::reader::traits::{FileSystem, RealFs};
use crate::sync::{DowngradeRwLock, ReadGuard};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Consecutive read failures after which a reader stops trying for good.
const ERROR_THRESHOLD: u32 = 5;

/// Data read within the last 500ms is considered fresh.
const FRESHNESS: Duration = Duration::from_millis(500);

/// Initial length of the table buffer.
const INITIAL_BUFFER_SIZE: usize = 1024;

/// Hard cap on the table buffer. Files that do not fit are rejected.
const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Per-UID CPU time by frequency.
pub const PROC_UID_FREQ_TIME: &str = "/proc/uid_time_in_state";

/// Per-UID CPU time by number of concurrently active cores.
pub const PROC_UID_ACTIVE_TIME: &str = "/proc/uid_concurrent_active_time";

/// Per-UID CPU time by cluster.
pub const PROC_UID_CLUSTER_TIME: &str = "/proc/uid_concurrent_policy_time";

static FREQ_TIME_READER: LazyLock<ProcTableReader> =
    LazyLock::new(|| ProcTableReader::new(PROC_UID_FREQ_TIME));
static ACTIVE_TIME_READER: LazyLock<ProcTableReader> =
    LazyLock::new(|| ProcTableReader::new(PROC_UID_ACTIVE_TIME));
static CLUSTER_TIME_READER: LazyLock<ProcTableReader> =
    LazyLock::new(|| ProcTableReader::new(PROC_UID_CLUSTER_TIME));

/// Process-wide reader for [`PROC_UID_FREQ_TIME`].
///
/// The singleton accessors are the only sanctioned way to reach the three
/// well-known tables. A duplicate reader for the same path would defeat
/// the single-writer guarantee.
pub fn freq_time_reader() -> &'static ProcTableReader {
    &FREQ_TIME_READER
}

/// Process-wide reader for [`PROC_UID_ACTIVE_TIME`].
pub fn active_time_reader() -> &'static ProcTableReader {
    &ACTIVE_TIME_READER
}

/// Process-wide reader for [`PROC_UID_CLUSTER_TIME`].
pub fn cluster_time_reader() -> &'static ProcTableReader {
    &CLUSTER_TIME_READER
}

/// Error type for snapshot failures.
#[derive(Debug)]
pub enum ReadError {
    /// The backing file does not exist. Normal on kernels that do not
    /// expose the table.
    NotFound,
    /// Any other read failure, including content that is not valid UTF-8.
    Io(io::Error),
    /// The file does not fit in the buffer cap.
    FileTooLarge,
    /// The error threshold was reached; this reader no longer attempts
    /// I/O.
    Disabled,
}

impl std::fmt::Display for ReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReadError::NotFound => write!(f, "proc table file not found"),
            ReadError::Io(e) => write!(f, "I/O error: {}", e),
            ReadError::FileTooLarge => {
                write!(f, "proc table exceeds {} bytes", MAX_BUFFER_SIZE)
            }
            ReadError::Disabled => {
                write!(f, "reader disabled after {} errors", ERROR_THRESHOLD)
            }
        }
    }
}

impl std::error::Error for ReadError {}

impl From<io::Error> for ReadError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            ReadError::NotFound
        } else {
            ReadError::Io(e)
        }
    }
}

/// Lock-protected table contents.
///
/// `buf[..size]` is the committed snapshot and is always valid UTF-8.
/// Refreshes fill `scratch` and swap it in only on success, so a failed
/// refresh never disturbs the committed snapshot.
#[derive(Default)]
struct TableBuf {
    buf: Vec<u8>,
    scratch: Vec<u8>,
    size: usize,
    last_read: Option<Instant>,
}

impl TableBuf {
    fn is_fresh(&self) -> bool {
        self.size > 0 && self.last_read.is_some_and(|t| t.elapsed() < FRESHNESS)
    }
}

/// Thread-safe, cache-aware reader for one proc table file.
///
/// Data fetched within the last 500ms is reused instead of re-read, since
/// the reading lifecycle itself can take up to 100ms. The cache can be
/// bypassed with [`ProcTableReader::open_with`].
///
/// Each reader keeps an error counter; after 5 failed refresh attempts it
/// rejects all further requests with [`ReadError::Disabled`] to save I/O
/// and prevent log spam. The counter never resets.
///
/// A successful open returns a [`ProcFileIterator`] holding a read lock on
/// the snapshot. The caller must drop the iterator when done, otherwise
/// every later refresh of this reader deadlocks.
pub struct ProcTableReader<S: FileSystem = RealFs> {
    source: S,
    path: PathBuf,
    /// Failed refresh attempts. Checked without the lock on the fast
    /// path; the counter only ever increases, so a stale read at worst
    /// allows one redundant attempt.
    errors: AtomicU32,
    table: DowngradeRwLock<TableBuf>,
}

impl ProcTableReader<RealFs> {
    /// Creates a reader for `path` backed by the real filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_source(RealFs::new(), path)
    }
}

impl<S: FileSystem> ProcTableReader<S> {
    /// Creates a reader for `path` backed by `source`.
    pub fn with_source(source: S, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            path: path.into(),
            errors: AtomicU32::new(0),
            table: DowngradeRwLock::new(TableBuf::default()),
        }
    }

    /// Path of the backing proc file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Opens the table, reusing the cached snapshot if it is fresh.
    ///
    /// See [`ProcTableReader::open_with`].
    pub fn open(&self) -> Result<ProcFileIterator<'_>, ReadError> {
        self.open_with(false)
    }

    /// Opens the proc file and buffers its full content, which can be
    /// traversed through the returned [`ProcFileIterator`].
    ///
    /// At most one thread refreshes at a time; concurrent callers either
    /// reuse the resulting snapshot or block until the refresh finishes.
    /// With `ignore_cache` the refresh happens unconditionally, though the
    /// error-threshold gate still applies.
    ///
    /// On failure the snapshot is left untouched, the error counter is
    /// incremented once, and the error is returned. Callers should treat
    /// any error as "no data available" and carry on without it.
    pub fn open_with(&self, ignore_cache: bool) -> Result<ProcFileIterator<'_>, ReadError> {
        if self.errors.load(Ordering::Relaxed) >= ERROR_THRESHOLD {
            return Err(ReadError::Disabled);
        }

        let mut table = if ignore_cache {
            self.table.write()
        } else {
            let table = self.table.read();
            if table.is_fresh() {
                return Ok(ProcFileIterator::new(table));
            }
            drop(table);

            let table = self.table.write();
            if table.is_fresh() {
                // Another thread refreshed between our freshness check and
                // the write acquisition.
                return Ok(ProcFileIterator::new(table.downgrade()));
            }
            table
        };

        match self.refill(&mut table) {
            Ok(()) => Ok(ProcFileIterator::new(table.downgrade())),
            Err(err) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                if matches!(err, ReadError::NotFound) {
                    warn!(
                        path = %self.path.display(),
                        "proc table missing; normal if the kernel does not expose it"
                    );
                } else {
                    error!(
                        path = %self.path.display(),
                        error = %err,
                        "failed to refresh proc table"
                    );
                }
                Err(err)
            }
        }
    }

    /// Reads the whole file into the staging buffer, doubling it as needed
    /// up to [`MAX_BUFFER_SIZE`], and commits the result on success.
    fn refill(&self, table: &mut TableBuf) -> Result<(), ReadError> {
        let mut file = self.source.open(&self.path)?;

        let scratch = &mut table.scratch;
        if scratch.is_empty() {
            scratch.resize(INITIAL_BUFFER_SIZE, 0);
        }

        let mut total = 0;
        loop {
            if total == scratch.len() {
                if scratch.len() >= MAX_BUFFER_SIZE {
                    // The buffer is pinned at the cap and full. A file of
                    // exactly the cap size still fits; only bytes beyond
                    // it make the file too large.
                    if read_is_eof(&mut file)? {
                        break;
                    }
                    return Err(ReadError::FileTooLarge);
                }
                let next = (scratch.len() * 2).min(MAX_BUFFER_SIZE);
                scratch.resize(next, 0);
            }
            match file.read(&mut scratch[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }

        std::str::from_utf8(&scratch[..total])
            .map_err(|e| ReadError::Io(io::Error::new(io::ErrorKind::InvalidData, e)))?;

        std::mem::swap(&mut table.buf, &mut table.scratch);
        table.size = total;
        table.last_read = Some(Instant::now());
        Ok(())
    }
}

/// Probes the stream with a one-byte read. Returns `true` at end of file.
fn read_is_eof(file: &mut impl Read) -> Result<bool, ReadError> {
    let mut probe = [0u8; 1];
    loop {
        match file.read(&mut probe) {
            Ok(0) => return Ok(true),
            Ok(_) => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Line cursor over a cached snapshot.
///
/// Holds the read lock for its whole lifetime; dropping the iterator
/// releases it. A caller that keeps an iterator alive indefinitely blocks
/// every subsequent refresh of the same reader.
pub struct ProcFileIterator<'a> {
    table: ReadGuard<'a, TableBuf>,
    size: usize,
    pos: usize,
}

impl<'a> ProcFileIterator<'a> {
    fn new(table: ReadGuard<'a, TableBuf>) -> Self {
        let size = table.size;
        Self {
            table,
            size,
            pos: 0,
        }
    }

    /// Fetches the next line, without its trailing newline.
    ///
    /// The returned slice borrows the shared snapshot buffer and is only
    /// usable until the next call on this iterator.
    pub fn next_line(&mut self) -> Option<&str> {
        if self.pos >= self.size {
            return None;
        }
        let bytes = &self.table.buf[..self.size];
        let start = self.pos;
        let end = bytes[start..]
            .iter()
            .position(|&b| b == b'\n')
            .map_or(self.size, |i| start + i);
        self.pos = end + 1;
        // Committed snapshots are validated as UTF-8 on refresh, and
        // splitting on an ASCII byte keeps every piece valid.
        std::str::from_utf8(&bytes[start..end]).ok()
    }

    /// Fetches the next line and parses every run of decimal digits in it
    /// as one non-negative integer, treating all non-digit bytes as
    /// separators. Numbers are appended to `out` until it is full; digits
    /// past a full `out` are dropped silently.
    ///
    /// Returns the count written to `out`, or `None` when there is no next
    /// line. To avoid allocation churn, callers should reuse the same
    /// array across calls.
    pub fn next_line_as_numbers(&mut self, out: &mut [u64]) -> Option<usize> {
        let line = self.next_line()?;
        let mut count = 0;
        let mut num: Option<u64> = None;
        for &b in line.as_bytes() {
            if count == out.len() {
                break;
            }
            match (num, b.is_ascii_digit()) {
                (None, true) => num = Some(u64::from(b - b'0')),
                (None, false) => {}
                (Some(n), true) => {
                    num = Some(n.wrapping_mul(10).wrapping_add(u64::from(b - b'0')));
                }
                (Some(n), false) => {
                    out[count] = n;
                    count += 1;
                    num = None;
                }
            }
        }
        if let Some(n) = num {
            if count < out.len() {
                out[count] = n;
                count += 1;
            }
        }
        Some(count)
    }

    /// Total size of the snapshot in bytes, not the remainder.
    pub fn size(&self) -> usize {
        self.size
    }
}
