//! The collaborator seam that supplies images to the ingestion pipeline.
//!
//! The pipeline never enumerates the platform filesystem itself; it works
//! against `PhotoSource`, and the surrounding application decides where the
//! entries come from. `FolderSource` is the local-directory implementation
//! used by the CLI.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// One entry of a source listing: a stable identifier plus the display
/// attributes the Photo record carries.
#[derive(Debug, Clone)]
pub struct PhotoEntry {
    pub uri: String,
    pub name: String,
    pub size: u64,
    /// Epoch milliseconds, 0 when unknown.
    pub date: i64,
    pub metadata: HashMap<String, String>,
}

pub trait PhotoSource {
    /// Enumerate entries in a stable order. The pipeline filters by
    /// extension; the source does not.
    fn list(&self) -> std::io::Result<Vec<PhotoEntry>>;

    /// Read the raw bytes behind an identifier previously returned by
    /// `list`.
    fn open(&self, uri: &str) -> std::io::Result<Vec<u8>>;
}

/// Receives `(processed, total)` after every entry of an ingestion run.
pub trait ProgressSink {
    fn report(&mut self, processed: usize, total: usize);
}

impl<F: FnMut(usize, usize)> ProgressSink for F {
    fn report(&mut self, processed: usize, total: usize) {
        self(processed, total)
    }
}

/// Sink for callers that do not care about progress.
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&mut self, _processed: usize, _total: usize) {}
}

/// A local directory of photos. Identifiers are absolute paths, which stay
/// stable across runs as long as the folder itself does not move.
pub struct FolderSource {
    root: PathBuf,
}

impl FolderSource {
    pub fn new(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        if !root.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is not a directory", root.display()),
            ));
        }
        Ok(FolderSource { root })
    }

    fn entry_for(path: &Path) -> Option<PhotoEntry> {
        let name = path.file_name()?.to_string_lossy().to_string();
        let meta = std::fs::metadata(path).ok();

        let size = meta.as_ref().map(|m| m.len()).unwrap_or(0);
        let date = meta
            .as_ref()
            .and_then(|m| m.modified().ok())
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);

        Some(PhotoEntry {
            uri: path.to_string_lossy().to_string(),
            name,
            size,
            date,
            metadata: HashMap::new(),
        })
    }
}

impl PhotoSource for FolderSource {
    fn list(&self) -> std::io::Result<Vec<PhotoEntry>> {
        let mut entries = Vec::new();

        for dir_entry in std::fs::read_dir(&self.root)? {
            let dir_entry = dir_entry?;
            let path = dir_entry.path();
            if !path.is_file() {
                continue;
            }
            if let Some(entry) = Self::entry_for(&path) {
                entries.push(entry);
            }
        }

        // read_dir order is platform-dependent; sort by name so enumeration
        // order (and therefore result order) is stable across runs.
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(entries)
    }

    fn open(&self, uri: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(uri)
    }
}
