//! Integration tests for the embedding index: ingestion over real temp
//! folders, store round-trips, and ranking, using a stub provider so no
//! model artifact is needed.

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use image::{DynamicImage, Rgb, RgbImage};

use crate::index::embedder::{model_id_hash, EmbedderError, EmbeddingProvider};
use crate::index::{ingest, rank_by_similarity, EmbeddingStore, IngestOptions};
use crate::source::FolderSource;

/// Deterministic stand-in for the ONNX backend: embeds an image as its
/// mean RGB plus a constant component, and counts inference calls so
/// tests can assert cache behavior.
struct StubProvider {
    calls: usize,
}

impl StubProvider {
    fn new() -> Self {
        Self { calls: 0 }
    }
}

impl EmbeddingProvider for StubProvider {
    fn dimensions(&self) -> usize {
        4
    }

    fn model_id(&self) -> [u8; 32] {
        model_id_hash("stub-provider")
    }

    fn embed_image(&mut self, image: &DynamicImage) -> Result<Vec<f32>, EmbedderError> {
        self.calls += 1;

        let rgb = image.to_rgb8();
        let pixels = (rgb.width() * rgb.height()).max(1) as f32;
        let mut sums = [0.0f32; 3];
        for pixel in rgb.pixels() {
            for c in 0..3 {
                sums[c] += pixel[c] as f32 / 255.0;
            }
        }

        Ok(vec![sums[0] / pixels, sums[1] / pixels, sums[2] / pixels, 1.0])
    }
}

fn write_png(dir: &Path, name: &str, rgb: [u8; 3]) {
    let img = RgbImage::from_pixel(8, 8, Rgb(rgb));
    img.save(dir.join(name)).unwrap();
}

fn store_in(dir: &Path) -> EmbeddingStore {
    EmbeddingStore::new(dir.join("embeddings.bin"))
}

#[test]
fn test_cold_ingest_embeds_every_image() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "red.png", [255, 0, 0]);
    write_png(photos_dir.path(), "green.jpg", [0, 255, 0]);
    write_png(photos_dir.path(), "blue.jpeg", [0, 0, 255]);
    std::fs::write(photos_dir.path().join("notes.txt"), b"not a photo").unwrap();

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    let mut progress = Vec::new();
    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut |processed: usize, total: usize| progress.push((processed, total)),
        &IngestOptions::default(),
    )
    .unwrap();

    // notes.txt is silently excluded, not an error
    assert_eq!(report.total, 3);
    assert_eq!(report.photos.len(), 3);
    assert_eq!(report.embedded, 3);
    assert_eq!(report.cache_hits, 0);
    assert_eq!(report.skipped, 0);
    assert!(report.persisted);
    assert_eq!(provider.calls, 3);

    // Initial (0, total) report, then one per entry
    assert_eq!(progress.first(), Some(&(0, 3)));
    assert_eq!(progress.last(), Some(&(3, 3)));
    assert_eq!(progress.len(), 4);

    // Enumeration order, not similarity or name-sort of full paths
    let names: Vec<&str> = report.photos.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["blue.jpeg", "green.jpg", "red.png"]);

    // Cache round-trip: the store now holds exactly those three entries
    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert_eq!(reloaded.len(), 3);
    for photo in &report.photos {
        assert_eq!(
            reloaded.get(&photo.uri).unwrap(),
            photo.embedding.as_deref().unwrap()
        );
    }
}

#[test]
fn test_warm_ingest_performs_zero_inferences() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "a.png", [10, 20, 30]);
    write_png(photos_dir.path(), "b.png", [40, 50, 60]);

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let store = store_in(data_dir.path());

    let mut provider = StubProvider::new();
    let first = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions::default(),
    )
    .unwrap();
    assert_eq!(provider.calls, 2);

    let second = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions::default(),
    )
    .unwrap();

    // No new inference on an unchanged folder with a warm cache
    assert_eq!(provider.calls, 2);
    assert_eq!(second.embedded, 0);
    assert_eq!(second.cache_hits, 2);
    assert!(second.persisted);

    // Identical photo set, embeddings included
    let firsts: Vec<_> = first
        .photos
        .iter()
        .map(|p| (p.uri.clone(), p.embedding.clone()))
        .collect();
    let seconds: Vec<_> = second
        .photos
        .iter()
        .map(|p| (p.uri.clone(), p.embedding.clone()))
        .collect();
    assert_eq!(firsts, seconds);
}

#[test]
fn test_corrupt_image_is_skipped_not_fatal() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "a.png", [1, 2, 3]);
    write_png(photos_dir.path(), "b.png", [4, 5, 6]);
    write_png(photos_dir.path(), "c.png", [7, 8, 9]);
    std::fs::write(photos_dir.path().join("broken.jpg"), b"\xff\xd8 garbage").unwrap();

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    let mut final_progress = (0, 0);
    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut |processed: usize, total: usize| final_progress = (processed, total),
        &IngestOptions::default(),
    )
    .unwrap();

    // The corrupt entry counts as processed, just not added
    assert_eq!(final_progress, (4, 4));
    assert_eq!(report.total, 4);
    assert_eq!(report.photos.len(), 3);
    assert_eq!(report.skipped, 1);

    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert_eq!(reloaded.len(), 3);
}

#[test]
fn test_reconcile_drops_entries_missing_from_listing() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "kept.png", [9, 9, 9]);

    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    // Seed the store with an entry for a photo that no longer exists
    {
        let mut cache =
            store.load_or_empty(&provider.model_id(), provider.dimensions());
        cache
            .insert("/gone/deleted.png".to_string(), vec![0.5; 4])
            .unwrap();
        store.save(&cache, &provider.model_id()).unwrap();
    }

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions::default(),
    )
    .unwrap();

    let reconcile = report.reconcile.unwrap();
    assert_eq!(reconcile.dropped, 1);
    assert_eq!(reconcile.kept, 1);

    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert!(!reloaded.contains("/gone/deleted.png"));
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn test_reconcile_can_be_disabled() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "kept.png", [9, 9, 9]);

    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    {
        let mut cache =
            store.load_or_empty(&provider.model_id(), provider.dimensions());
        cache
            .insert("/other-folder/still-wanted.png".to_string(), vec![0.5; 4])
            .unwrap();
        store.save(&cache, &provider.model_id()).unwrap();
    }

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions {
            reconcile: false,
            ..Default::default()
        },
    )
    .unwrap();

    assert!(report.reconcile.is_none());

    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert!(reloaded.contains("/other-folder/still-wanted.png"));
    assert_eq!(reloaded.len(), 2);
}

#[test]
fn test_cancelled_run_still_flushes() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "a.png", [1, 1, 1]);
    write_png(photos_dir.path(), "b.png", [2, 2, 2]);

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    // Cancelled before the first entry: nothing processed, no
    // reconciliation, but the (empty) flush still happens.
    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(report.cancelled);
    assert!(report.photos.is_empty());
    assert!(report.reconcile.is_none());
    assert!(report.persisted);
    assert!(store.exists());
}

#[test]
fn test_malformed_store_degrades_to_full_reembed() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "a.png", [100, 100, 100]);

    let store = store_in(data_dir.path());
    std::fs::write(store.path(), b"this is not an embedding store").unwrap();

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();

    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions::default(),
    )
    .unwrap();

    assert_eq!(report.embedded, 1);
    assert_eq!(report.cache_hits, 0);

    // The rewritten store is valid again
    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert_eq!(reloaded.len(), 1);
}

#[test]
fn test_checkpoint_interval_persists_mid_batch() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "a.png", [1, 0, 0]);
    write_png(photos_dir.path(), "b.png", [0, 1, 0]);
    write_png(photos_dir.path(), "c.png", [0, 0, 1]);

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    // Cancel after the second entry. With checkpointing every entry, the
    // progress sink probes the store from the outside and must see entry
    // counts grow while the run is still in flight.
    let cancel = Arc::new(AtomicBool::new(false));
    let observed = Arc::new(std::sync::Mutex::new(Vec::new()));

    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut {
            let cancel = cancel.clone();
            let observed = observed.clone();
            let probe = store_in(data_dir.path());
            let model_id = model_id_hash("stub-provider");
            move |processed: usize, _total: usize| {
                observed
                    .lock()
                    .unwrap()
                    .push(probe.load_or_empty(&model_id, 4).len());
                if processed == 2 {
                    cancel.store(true, std::sync::atomic::Ordering::Relaxed);
                }
            }
        },
        &IngestOptions {
            checkpoint_interval: 1,
            cancel: Some(cancel),
            ..Default::default()
        },
    )
    .unwrap();

    assert!(report.cancelled);
    assert_eq!(report.photos.len(), 2);

    // Reports fire before the checkpoint of the entry they describe: the
    // probe sees the store one checkpoint behind, already durable mid-run.
    assert_eq!(*observed.lock().unwrap(), vec![0, 0, 1]);

    let reloaded = store.load_or_empty(&provider.model_id(), provider.dimensions());
    assert_eq!(reloaded.len(), 2);
}

#[test]
fn test_similarity_query_finds_matching_photo() {
    let photos_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();

    write_png(photos_dir.path(), "red.png", [250, 5, 5]);
    write_png(photos_dir.path(), "green.png", [5, 250, 5]);
    write_png(photos_dir.path(), "blue.png", [5, 5, 250]);

    let source = FolderSource::new(photos_dir.path()).unwrap();
    let mut provider = StubProvider::new();
    let store = store_in(data_dir.path());

    let report = ingest(
        &source,
        &mut provider,
        &store,
        &mut crate::source::NoProgress,
        &IngestOptions::default(),
    )
    .unwrap();

    // Query with a near-red image that was never ingested
    let query_image = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, Rgb([240, 10, 10])));
    let query = provider.embed_image(&query_image).unwrap();

    let neighbors = rank_by_similarity(&query, &report.photos, 2);
    assert_eq!(neighbors.len(), 2);
    assert!(neighbors[0].uri.ends_with("red.png"));
    assert!(neighbors[0].score > neighbors[1].score);
}
