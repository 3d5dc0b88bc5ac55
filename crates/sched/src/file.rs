//! Open files as seen by the process table.
//!
//! The file system lives outside this crate. Processes hold shared handles to anything
//! implementing [`FileSource`]; file-backed mappings read their initial contents
//! through it.

use alloc::sync::Arc;

/// A byte source a process can hold open.
pub trait FileSource {
    /// Reads up to `buf.len()` bytes starting at `offset`, returning how many were read.
    /// Reading at or past the end returns 0.
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize;

    /// Returns whether the file was opened for reading.
    fn is_readable(&self) -> bool {
        true
    }

    /// Returns whether the file was opened for writing.
    fn is_writable(&self) -> bool {
        false
    }
}

/// A shared handle to an open file. Fork duplicates handles by cloning them.
pub type FileRef = Arc<dyn FileSource + Send + Sync>;

impl FileSource for [u8] {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        let Some(rest) = self.get(offset..) else {
            return 0;
        };
        let len = rest.len().min(buf.len());
        buf[..len].copy_from_slice(&rest[..len]);
        len
    }
}

impl FileSource for alloc::vec::Vec<u8> {
    fn read_at(&self, offset: usize, buf: &mut [u8]) -> usize {
        self.as_slice().read_at(offset, buf)
    }
}
