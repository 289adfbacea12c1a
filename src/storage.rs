//! Storage capability
//!
//! Segments are only ever written through a [`StorageHandle`], a revocable
//! grant over a writable location. The writer polls [`StorageHandle::is_valid`]
//! at every rotation and before every write batch; a handle that turns
//! invalid ends the run through `Finalizing` instead of losing data silently.

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::StorageError;

/// Suffix of a segment that is still being written
pub const PARTIAL_SUFFIX: &str = ".part";

/// Byte sink for one output segment
pub trait SegmentSink: Write + Send {
    /// Flush everything and publish the segment under its final name
    fn commit(self: Box<Self>) -> Result<(), StorageError>;

    /// Drop the segment without publishing it
    fn discard(self: Box<Self>);
}

/// Revocable capability over a writable location
pub trait StorageHandle: Send + Sync {
    fn create_segment_sink(&self, name: &str) -> Result<Box<dyn SegmentSink>, StorageError>;

    fn is_valid(&self) -> bool;

    /// Human-readable location for logs
    fn location(&self) -> String;
}

/// Capability over a local directory.
///
/// Clones share the revocation state, so the lifecycle layer can keep one
/// clone and call [`DirectoryHandle::revoke`] when the grant is withdrawn.
#[derive(Clone)]
pub struct DirectoryHandle {
    inner: Arc<DirectoryInner>,
}

struct DirectoryInner {
    root: PathBuf,
    revoked: AtomicBool,
}

impl DirectoryHandle {
    /// Grant access to `root`, creating it if needed
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|e| map_io(e, &root))?;
        let handle = Self {
            inner: Arc::new(DirectoryInner {
                root,
                revoked: AtomicBool::new(false),
            }),
        };
        if !handle.is_valid() {
            return Err(StorageError::Permission(format!(
                "{} is not a writable directory",
                handle.inner.root.display()
            )));
        }
        Ok(handle)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Withdraw the grant. Every clone observes it on its next validity check.
    pub fn revoke(&self) {
        if !self.inner.revoked.swap(true, Ordering::SeqCst) {
            warn!("Storage grant revoked: {}", self.inner.root.display());
        }
    }
}

impl StorageHandle for DirectoryHandle {
    fn create_segment_sink(&self, name: &str) -> Result<Box<dyn SegmentSink>, StorageError> {
        if !self.is_valid() {
            return Err(StorageError::Permission(format!(
                "grant for {} is no longer valid",
                self.inner.root.display()
            )));
        }
        if name.is_empty() || name.contains(['/', '\\']) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid segment name {:?}", name),
            )));
        }

        let final_path = self.inner.root.join(name);
        let part_path = self.inner.root.join(format!("{}{}", name, PARTIAL_SUFFIX));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&part_path)
            .map_err(|e| map_io(e, &part_path))?;

        debug!("Opened segment sink {:?}", part_path);

        Ok(Box::new(FileSink {
            writer: BufWriter::with_capacity(256 * 1024, file),
            part_path,
            final_path,
        }))
    }

    fn is_valid(&self) -> bool {
        if self.inner.revoked.load(Ordering::SeqCst) {
            return false;
        }
        match std::fs::metadata(&self.inner.root) {
            Ok(meta) => meta.is_dir() && !meta.permissions().readonly(),
            Err(_) => false,
        }
    }

    fn location(&self) -> String {
        self.inner.root.display().to_string()
    }
}

fn map_io(err: io::Error, path: &Path) -> StorageError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        StorageError::Permission(format!("{}: {}", path.display(), err))
    } else {
        StorageError::Io(err)
    }
}

/// Segment written as `<name>.part` and renamed on commit
struct FileSink {
    writer: BufWriter<File>,
    part_path: PathBuf,
    final_path: PathBuf,
}

impl Write for FileSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.writer.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

impl SegmentSink for FileSink {
    fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let FileSink {
            writer,
            part_path,
            final_path,
        } = *self;
        let file = writer
            .into_inner()
            .map_err(|e| StorageError::Io(e.into_error()))?;
        file.sync_all().map_err(|e| map_io(e, &part_path))?;
        drop(file);
        std::fs::rename(&part_path, &final_path).map_err(|e| map_io(e, &final_path))?;
        debug!("Committed segment {:?}", final_path);
        Ok(())
    }

    fn discard(self: Box<Self>) {
        let FileSink { writer, part_path, .. } = *self;
        drop(writer);
        if let Err(e) = std::fs::remove_file(&part_path) {
            warn!("Failed to delete discarded segment {:?}: {}", part_path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sink_commit_renames_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DirectoryHandle::open(dir.path()).unwrap();

        let mut sink = handle.create_segment_sink("seg0.mp4").unwrap();
        sink.write_all(b"abc").unwrap();
        sink.write_all(b"def").unwrap();
        assert!(dir.path().join("seg0.mp4.part").exists());

        sink.commit().unwrap();
        assert!(!dir.path().join("seg0.mp4.part").exists());
        assert_eq!(std::fs::read(dir.path().join("seg0.mp4")).unwrap(), b"abcdef");
    }

    #[test]
    fn test_sink_discard_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DirectoryHandle::open(dir.path()).unwrap();

        let mut sink = handle.create_segment_sink("seg1.mp4").unwrap();
        sink.write_all(b"junk").unwrap();
        sink.discard();

        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_revoked_handle_refuses_new_sinks() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DirectoryHandle::open(dir.path()).unwrap();
        let shared = handle.clone();
        assert!(shared.is_valid());

        handle.revoke();

        assert!(!shared.is_valid());
        assert!(matches!(
            shared.create_segment_sink("seg2.mp4"),
            Err(StorageError::Permission(_))
        ));
    }

    #[test]
    fn test_removed_directory_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("grant");
        let handle = DirectoryHandle::open(&root).unwrap();
        std::fs::remove_dir(&root).unwrap();
        assert!(!handle.is_valid());
    }

    #[test]
    fn test_rejects_path_like_names() {
        let dir = tempfile::tempdir().unwrap();
        let handle = DirectoryHandle::open(dir.path()).unwrap();
        assert!(handle.create_segment_sink("../escape.mp4").is_err());
    }
}
