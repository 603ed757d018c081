//! Abstraction for filesystem access to enable testing and mocking.
//!
//! The `FileSystem` trait allows the reader to work with the real `/proc`
//! filesystem on Linux and with an in-memory mock in tests or on other
//! platforms.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Opens files for sequential reading.
pub trait FileSystem: Send + Sync {
    /// Opens the file at `path`, positioned at the start.
    ///
    /// # Returns
    /// A byte stream over the file content, or an I/O error if the file
    /// cannot be opened.
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>>;
}

/// Real filesystem implementation that delegates to `std::fs`.
///
/// Use this in production to read from the actual `/proc` filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFs;

impl RealFs {
    /// Creates a new `RealFs` instance.
    pub fn new() -> Self {
        Self
    }
}

impl FileSystem for RealFs {
    fn open(&self, path: &Path) -> io::Result<Box<dyn Read + '_>> {
        Ok(Box::new(File::open(path)?))
    }
}
