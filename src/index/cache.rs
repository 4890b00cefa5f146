//! Persistent URI-keyed embedding cache.
//!
//! File format: embeddings.bin
//!
//! Header (47 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - uri_len: u16 (little-endian)
//! - uri: [u8; uri_len] (UTF-8)
//! - embedding: [f32; dimensions] (little-endian)
//!
//! The cache is best-effort and never fatal: a missing, truncated, or
//! corrupt store degrades to an empty mapping and a full re-embed, not an
//! error. Writes go through a temp file and an atomic rename, so a crash
//! mid-save leaves either the old store or a stray temp file, both of
//! which the next load tolerates.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// Header size in bytes: version(1) + model_id(32) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 47;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid file format: {0}")]
    InvalidFormat(String),

    #[error("version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("model mismatch: store was written by a different model")]
    ModelMismatch,

    #[error("checksum mismatch: store may be corrupted")]
    ChecksumMismatch,

    #[error("dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// In-memory mapping from image URI to embedding vector.
///
/// Every vector in one cache has the same length; entries are replaced
/// whole, never edited in place.
pub struct EmbeddingCache {
    entries: HashMap<String, Vec<f32>>,
    dimensions: usize,
}

impl EmbeddingCache {
    pub fn new(dimensions: usize) -> Self {
        Self {
            entries: HashMap::new(),
            dimensions,
        }
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            entries: HashMap::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, uri: &str) -> bool {
        self.entries.contains_key(uri)
    }

    pub fn get(&self, uri: &str) -> Option<&[f32]> {
        self.entries.get(uri).map(|v| v.as_slice())
    }

    /// Insert or replace the vector for a URI.
    pub fn insert(&mut self, uri: String, embedding: Vec<f32>) -> Result<(), StoreError> {
        if embedding.len() != self.dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        self.entries.insert(uri, embedding);
        Ok(())
    }

    pub fn remove(&mut self, uri: &str) -> Option<Vec<f32>> {
        self.entries.remove(uri)
    }

    pub fn uris(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(|k| k.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[f32])> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Drop every entry whose URI the predicate rejects. Returns the number
    /// of dropped entries. Used by ingestion-time reconciliation.
    pub fn retain<F: Fn(&str) -> bool>(&mut self, keep: F) -> usize {
        let before = self.entries.len();
        self.entries.retain(|uri, _| keep(uri));
        before - self.entries.len()
    }
}

/// Store manager for one embeddings.bin path.
pub struct EmbeddingStore {
    path: PathBuf,
}

impl EmbeddingStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Load the cache, degrading to empty on any failure.
    ///
    /// A missing store is the normal first-run case and loads silently; a
    /// malformed or incompatible one is logged and discarded. Either way
    /// the caller gets a usable cache and ingestion re-embeds what is
    /// missing.
    pub fn load_or_empty(&self, expected_model_id: &[u8; 32], dimensions: usize) -> EmbeddingCache {
        if !self.exists() {
            log::info!("no embedding store at {}, starting fresh", self.path.display());
            return EmbeddingCache::new(dimensions);
        }

        match self.try_load(expected_model_id, dimensions) {
            Ok(cache) => {
                log::info!("loaded {} cached embeddings", cache.len());
                cache
            }
            Err(err) => {
                log::warn!(
                    "discarding embedding store {}: {err}",
                    self.path.display()
                );
                EmbeddingCache::new(dimensions)
            }
        }
    }

    /// Load the cache, surfacing the exact failure.
    pub fn try_load(
        &self,
        expected_model_id: &[u8; 32],
        expected_dimensions: usize,
    ) -> Result<EmbeddingCache, StoreError> {
        let file = File::open(&self.path)?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;

        if header.model_id != *expected_model_id {
            return Err(StoreError::ModelMismatch);
        }
        if header.dimensions as usize != expected_dimensions {
            return Err(StoreError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let mut cache =
            EmbeddingCache::with_capacity(header.dimensions as usize, header.entry_count as usize);

        for _ in 0..header.entry_count {
            let (uri, embedding) = read_entry(&mut reader, header.dimensions as usize)?;
            cache.insert(uri, embedding)?;
        }

        Ok(cache)
    }

    /// Save the full mapping, overwriting any prior content.
    ///
    /// Uses atomic write: temp file -> fsync -> rename
    pub fn save(&self, cache: &EmbeddingCache, model_id: &[u8; 32]) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");

        let result = self.write_to_file(&temp_path, cache, model_id);

        if result.is_err() {
            // Clean up temp file on error
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    fn write_to_file(
        &self,
        path: &Path,
        cache: &EmbeddingCache,
        model_id: &[u8; 32],
    ) -> Result<(), StoreError> {
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions: cache.dimensions() as u16,
            entry_count: cache.len() as u64,
        };
        write_header(&mut writer, &header)?;

        for (uri, embedding) in cache.iter() {
            write_entry(&mut writer, uri, embedding)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        file.sync_all()?;

        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u16,
    entry_count: u64,
}

fn read_header(reader: &mut BufReader<File>) -> Result<Header, StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes)?;

    let version = header_bytes[0];
    if version > FORMAT_VERSION {
        return Err(StoreError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    let dimensions = u16::from_le_bytes([header_bytes[33], header_bytes[34]]);

    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&header_bytes[35..43]);
    let entry_count = u64::from_le_bytes(count_bytes);

    let mut checksum_bytes = [0u8; 4];
    checksum_bytes.copy_from_slice(&header_bytes[43..47]);
    let stored_checksum = u32::from_le_bytes(checksum_bytes);

    // Checksum covers the header without the checksum field itself
    if stored_checksum != crc32fast::hash(&header_bytes[0..43]) {
        return Err(StoreError::ChecksumMismatch);
    }

    Ok(Header {
        version,
        model_id,
        dimensions,
        entry_count,
    })
}

fn write_header(writer: &mut BufWriter<File>, header: &Header) -> Result<(), StoreError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..35].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[35..43].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..43]);
    header_bytes[43..47].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_entry(
    reader: &mut BufReader<File>,
    dimensions: usize,
) -> Result<(String, Vec<f32>), StoreError> {
    let mut len_bytes = [0u8; 2];
    reader.read_exact(&mut len_bytes)?;
    let uri_len = u16::from_le_bytes(len_bytes) as usize;

    let mut uri_bytes = vec![0u8; uri_len];
    reader.read_exact(&mut uri_bytes)?;
    let uri = String::from_utf8(uri_bytes)
        .map_err(|_| StoreError::InvalidFormat("entry key is not valid UTF-8".to_string()))?;

    let mut embedding = Vec::with_capacity(dimensions);
    for _ in 0..dimensions {
        let mut float_bytes = [0u8; 4];
        reader.read_exact(&mut float_bytes)?;
        embedding.push(f32::from_le_bytes(float_bytes));
    }

    Ok((uri, embedding))
}

fn write_entry(
    writer: &mut BufWriter<File>,
    uri: &str,
    embedding: &[f32],
) -> Result<(), StoreError> {
    let uri_bytes = uri.as_bytes();
    if uri_bytes.len() > u16::MAX as usize {
        return Err(StoreError::InvalidFormat(format!(
            "uri exceeds {} bytes",
            u16::MAX
        )));
    }

    writer.write_all(&(uri_bytes.len() as u16).to_le_bytes())?;
    writer.write_all(uri_bytes)?;

    for &value in embedding {
        writer.write_all(&value.to_le_bytes())?;
    }

    Ok(())
}
