//! In-memory mock filesystem for testing the reader without a real `/proc`.
//!
//! `MockFs` simulates a filesystem in memory and counts every open
//! attempt, so tests can verify how much I/O a reader actually performed.

use crate::reader::traits::FileSystem;
use std::collections::HashMap;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum MockEntry {
    Content(Vec<u8>),
    Broken,
}

#[derive(Debug, Default)]
struct Inner {
    files: Mutex<HashMap<PathBuf, MockEntry>>,
    opens: AtomicUsize,
}

/// In-memory filesystem for testing.
///
/// Clones share state: a test keeps one handle while the reader under test
/// owns another. Files edited through the test's handle are visible to the
/// reader, and [`MockFs::open_count`] observes the I/O the reader
/// performed.
#[derive(Debug, Clone, Default)]
pub struct MockFs {
    inner: Arc<Inner>,
}

impl MockFs {
    /// Creates a new empty mock filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a file with the given content.
    pub fn add_file(&self, path: impl AsRef<Path>, content: impl Into<Vec<u8>>) {
        self.files()
            .insert(path.as_ref().to_path_buf(), MockEntry::Content(content.into()));
    }

    /// Removes a file; subsequent opens fail with `NotFound`.
    pub fn remove_file(&self, path: impl AsRef<Path>) {
        self.files().remove(path.as_ref());
    }

    /// Marks a file as broken; subsequent opens fail with a generic I/O
    /// error instead of `NotFound`.
    pub fn break_file(&self, path: impl AsRef<Path>) {
        self.files()
            .insert(path.as_ref().to_path_buf(), MockEntry::Broken);
    }

    /// Number of open attempts made so far, successful or not.
    pub fn open_count(&self) -> usize {
        self.inner.opens.load(Ordering::SeqCst)
    }

    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, MockEntry>> {
        self.inner.files.lock().expect("mock filesystem poisoned")
    }
}

impl FileSystem for MockFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        self.inner.opens.fetch_add(1, Ordering::SeqCst);
        match self.files().get(path) {
            Some(MockEntry::Content(bytes)) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Some(MockEntry::Broken) => Err(io::Error::other(format!(
                "injected read failure: {:?}",
                path
            ))),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("file not found: {:?}", path),
            )),
        }
    }
}
