//! Cache-first ingestion of a photo source.
//!
//! One run owns the embedding cache end to end: load from the store,
//! mutate in memory, save back. The expensive operation is inference, so
//! the pipeline is built to never run it twice for the same identifier:
//! after the first run over a folder, a re-ingestion is all cache lookups.
//!
//! Per-entry failures (unreadable file, corrupt image, inference error)
//! skip that entry and continue; the progress counter still advances past
//! them so completion is always reached. Only two things abort a run: a
//! model-load failure, which the caller hits while constructing the
//! provider, and a failed source listing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::index::cache::EmbeddingStore;
use crate::index::embedder::{EmbedderError, EmbeddingProvider};
use crate::index::preprocess::{self, PreprocessError};
use crate::photos::Photo;
use crate::source::{PhotoEntry, PhotoSource, ProgressSink};

/// Extensions accepted by ingestion, matched case-insensitively.
const IMAGE_EXTENSIONS: [&str; 3] = [".jpg", ".jpeg", ".png"];

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("failed to list source entries: {0}")]
    List(#[from] std::io::Error),
}

/// Why one entry was skipped. Local to the batch; never aborts it.
#[derive(Debug, thiserror::Error)]
enum EntrySkip {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("{0}")]
    Decode(#[from] PreprocessError),

    #[error("{0}")]
    Embed(#[from] EmbedderError),
}

/// Knobs for one ingestion run.
pub struct IngestOptions {
    /// Drop cache entries absent from this listing after the run.
    pub reconcile: bool,
    /// Flush the cache every N processed entries; 0 disables.
    pub checkpoint_interval: usize,
    /// Cooperative cancellation flag, checked between entries.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            reconcile: true,
            checkpoint_interval: 0,
            cancel: None,
        }
    }
}

/// Outcome of cache reconciliation against the live listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileResult {
    pub kept: usize,
    pub dropped: usize,
}

/// What one ingestion run did.
pub struct IngestReport {
    /// Successfully embedded photos, in enumeration order.
    pub photos: Vec<Photo>,
    /// Entries that matched the extension filter.
    pub total: usize,
    /// Fresh inferences performed.
    pub embedded: usize,
    /// Entries served from the cache without decode or inference.
    pub cache_hits: usize,
    /// Entries skipped on read/decode/inference failure.
    pub skipped: usize,
    /// Whether the run was cancelled before processing every entry.
    pub cancelled: bool,
    /// Present when reconciliation ran.
    pub reconcile: Option<ReconcileResult>,
    /// Whether the final flush reached the store.
    pub persisted: bool,
}

/// Ingest every image entry of `source`, reusing cached embeddings and
/// computing the rest through `provider`.
pub fn ingest(
    source: &dyn PhotoSource,
    provider: &mut dyn EmbeddingProvider,
    store: &EmbeddingStore,
    progress: &mut dyn ProgressSink,
    options: &IngestOptions,
) -> Result<IngestReport, IngestError> {
    let model_id = provider.model_id();
    let mut cache = store.load_or_empty(&model_id, provider.dimensions());

    let entries: Vec<PhotoEntry> = source
        .list()?
        .into_iter()
        .filter(|entry| has_image_extension(&entry.name))
        .collect();
    let total = entries.len();

    progress.report(0, total);

    let mut photos = Vec::with_capacity(total);
    let mut embedded = 0usize;
    let mut cache_hits = 0usize;
    let mut skipped = 0usize;
    let mut cancelled = false;
    let mut dirty = false;

    for (processed_before, entry) in entries.iter().enumerate() {
        if is_cancelled(options) {
            log::info!(
                "ingestion cancelled after {processed_before}/{total} entries, flushing partial progress"
            );
            cancelled = true;
            break;
        }

        if let Some(hit) = cache.get(&entry.uri) {
            cache_hits += 1;
            photos.push(photo_from(entry, hit.to_vec()));
        } else {
            match embed_entry(source, provider, entry) {
                Ok(vector) => {
                    if let Err(err) = cache.insert(entry.uri.clone(), vector.clone()) {
                        log::warn!("skipping {}: {err}", entry.uri);
                        skipped += 1;
                    } else {
                        embedded += 1;
                        dirty = true;
                        photos.push(photo_from(entry, vector));
                    }
                }
                Err(err) => {
                    log::warn!("skipping {}: {err}", entry.uri);
                    skipped += 1;
                }
            }
        }

        let processed = processed_before + 1;
        progress.report(processed, total);

        if options.checkpoint_interval > 0 && processed % options.checkpoint_interval == 0 && dirty
        {
            match store.save(&cache, &model_id) {
                Ok(()) => dirty = false,
                Err(err) => log::warn!("checkpoint save failed: {err}"),
            }
        }
    }

    // A partial run has seen the full listing but not processed it; keep
    // stale entries around and let the next complete run drop them.
    let reconcile = if options.reconcile && !cancelled {
        let listed: std::collections::HashSet<&str> =
            entries.iter().map(|e| e.uri.as_str()).collect();
        let dropped = cache.retain(|uri| listed.contains(uri));
        if dropped > 0 {
            log::info!("reconciliation dropped {dropped} stale cache entries");
        }
        Some(ReconcileResult {
            kept: cache.len(),
            dropped,
        })
    } else {
        None
    };

    // Idempotent flush: always persist, even when every entry was a hit.
    // A failure here means this run's work is re-computed next time, not
    // that ingestion failed.
    let persisted = match store.save(&cache, &model_id) {
        Ok(()) => true,
        Err(err) => {
            log::warn!("embedding store not persisted this run: {err}");
            false
        }
    };

    Ok(IngestReport {
        photos,
        total,
        embedded,
        cache_hits,
        skipped,
        cancelled,
        reconcile,
        persisted,
    })
}

fn has_image_extension(name: &str) -> bool {
    let lower = name.to_lowercase();
    IMAGE_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

fn is_cancelled(options: &IngestOptions) -> bool {
    options
        .cancel
        .as_ref()
        .map(|flag| flag.load(Ordering::Relaxed))
        .unwrap_or(false)
}

fn embed_entry(
    source: &dyn PhotoSource,
    provider: &mut dyn EmbeddingProvider,
    entry: &PhotoEntry,
) -> Result<Vec<f32>, EntrySkip> {
    let bytes = source.open(&entry.uri)?;
    let image = preprocess::decode(&bytes)?;
    Ok(provider.embed_image(&image)?)
}

fn photo_from(entry: &PhotoEntry, embedding: Vec<f32>) -> Photo {
    Photo {
        uri: entry.uri.clone(),
        name: entry.name.clone(),
        size: entry.size,
        date: entry.date,
        metadata: entry.metadata.clone(),
        embedding: Some(embedding),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_filter() {
        assert!(has_image_extension("a.jpg"));
        assert!(has_image_extension("b.JPEG"));
        assert!(has_image_extension("c.Png"));
        assert!(!has_image_extension("notes.txt"));
        assert!(!has_image_extension("clip.gif"));
        assert!(!has_image_extension("jpg"));
    }
}
