use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use indicatif::ProgressBar;
use serde_json::json;

mod cli;
mod config;
mod index;
mod lock;
mod photos;
mod source;
#[cfg(test)]
mod tests;

use config::Config;
use index::{
    decode, ingest, model_id_for_path, rank_by_similarity, ClipVision, EmbeddingCache,
    EmbeddingProvider, EmbeddingStore, IngestOptions, EMBEDDING_DIM,
};
use lock::FileLock;
use photos::Photo;
use source::{FolderSource, ProgressSink};

/// Store file name inside the data directory
const STORE_FILE_NAME: &str = "embeddings.bin";

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = cli::Args::parse();

    let base_path = resolve_base_path()?;
    let mut config = Config::load_with(&base_path);

    match args.command {
        cli::Command::Ingest {
            folder,
            no_reconcile,
        } => {
            let folder = match folder.or_else(|| config.last_folder.clone().map(PathBuf::from)) {
                Some(folder) => folder,
                None => bail!("no folder given and no previous ingestion to repeat"),
            };

            run_ingest(&mut config, &folder, no_reconcile)
        }

        cli::Command::Similar { image, uri, top } => {
            let k = top.unwrap_or(config.index.default_top_k);
            run_similar(&config, image.as_deref(), uri.as_deref(), k)
        }

        cli::Command::Status { filter } => run_status(&config, filter.as_deref()),
    }
}

fn resolve_base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("SNAPDEX_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("couldnt find home dir")?
        .context("couldnt find home dir")?;
    Ok(home.join(".local/share/snapdex"))
}

fn run_ingest(config: &mut Config, folder: &Path, no_reconcile: bool) -> anyhow::Result<()> {
    // Single-writer invariant: hold the lock for the whole
    // load -> mutate -> save cycle.
    let _lock = FileLock::try_acquire(config.base_path())
        .context("another ingestion is already running")?;

    let source = FolderSource::new(folder)
        .with_context(|| format!("cannot read folder {}", folder.display()))?;

    // A model-load failure disables the whole subsystem; surface it before
    // touching the cache.
    let mut provider = ClipVision::load(&config.model_path())
        .context("embedding model unavailable, cannot ingest")?;

    let store = EmbeddingStore::new(config.base_path().join(STORE_FILE_NAME));

    let cancel = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let cancel = cancel.clone();
        move || {
            tracing::info!("received shutdown signal, finishing current entry");
            cancel.store(true, Ordering::Relaxed);
        }
    })
    .context("failed to set Ctrl+C handler")?;

    let options = IngestOptions {
        reconcile: config.index.reconcile && !no_reconcile,
        checkpoint_interval: config.index.checkpoint_interval,
        cancel: Some(cancel),
    };

    let mut bar = BarSink::new();
    let report = ingest(&source, &mut provider, &store, &mut bar, &options)?;
    bar.finish();

    config.last_folder = Some(folder.to_string_lossy().to_string());
    config.save();

    let summary = json!({
        "folder": folder.to_string_lossy(),
        "total": report.total,
        "indexed": report.photos.len(),
        "embedded": report.embedded,
        "cache_hits": report.cache_hits,
        "skipped": report.skipped,
        "cancelled": report.cancelled,
        "persisted": report.persisted,
        "reconcile": report.reconcile.map(|r| json!({
            "kept": r.kept,
            "dropped": r.dropped,
        })),
    });
    println!("{}", serde_json::to_string_pretty(&summary).unwrap());

    Ok(())
}

fn run_similar(
    config: &Config,
    image: Option<&Path>,
    uri: Option<&str>,
    k: usize,
) -> anyhow::Result<()> {
    let model_path = config.model_path();
    let store = EmbeddingStore::new(config.base_path().join(STORE_FILE_NAME));
    let cache = store.load_or_empty(&model_id_for_path(&model_path), EMBEDDING_DIM);

    if cache.is_empty() {
        bail!("index is empty, run `snapdex ingest` first");
    }

    let query = match (image, uri) {
        (Some(image_path), None) => {
            let mut provider = ClipVision::load(&model_path)
                .context("embedding model unavailable, cannot embed query image")?;
            let bytes = std::fs::read(image_path)
                .with_context(|| format!("cannot read {}", image_path.display()))?;
            let decoded = decode(&bytes)
                .with_context(|| format!("cannot decode {}", image_path.display()))?;
            provider.embed_image(&decoded)?
        }
        (None, Some(uri)) => match cache.get(uri) {
            Some(vector) => vector.to_vec(),
            None => bail!("{uri} is not in the index"),
        },
        _ => bail!("pass exactly one of --image or --uri"),
    };

    let photos = photos_from_cache(&cache);
    let neighbors = rank_by_similarity(&query, &photos, k);

    println!("{}", serde_json::to_string_pretty(&neighbors).unwrap());
    Ok(())
}

fn run_status(config: &Config, filter: Option<&str>) -> anyhow::Result<()> {
    let store = EmbeddingStore::new(config.base_path().join(STORE_FILE_NAME));
    let cache = store.load_or_empty(&model_id_for_path(&config.model_path()), EMBEDDING_DIM);

    let mut photos = photos_from_cache(&cache);
    if let Some(filter) = filter {
        photos.retain(|photo| photo.matches_text(filter));
    }
    let mut uris: Vec<&str> = photos.iter().map(|p| p.uri.as_str()).collect();
    uris.sort_unstable();

    let status = json!({
        "store": store.path().to_string_lossy(),
        "entries": cache.len(),
        "dimensions": cache.dimensions(),
        "last_folder": config.last_folder.clone(),
        "photos": uris,
    });
    println!("{}", serde_json::to_string_pretty(&status).unwrap());

    Ok(())
}

/// Rebuild ranked-population photo records from the bare cache. Display
/// attributes beyond the name are unknown here; similarity only needs the
/// identifier and the vector.
fn photos_from_cache(cache: &EmbeddingCache) -> Vec<Photo> {
    cache
        .iter()
        .map(|(uri, embedding)| Photo {
            uri: uri.to_string(),
            name: Path::new(uri)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| uri.to_string()),
            embedding: Some(embedding.to_vec()),
            ..Default::default()
        })
        .collect()
}

/// Progress sink rendering an indicatif bar. The listing size is only
/// known at the first report, so the length is set there.
struct BarSink {
    bar: ProgressBar,
}

impl BarSink {
    fn new() -> Self {
        Self {
            bar: ProgressBar::new(0),
        }
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarSink {
    fn report(&mut self, processed: usize, total: usize) {
        self.bar.set_length(total as u64);
        self.bar.set_position(processed as u64);
    }
}
