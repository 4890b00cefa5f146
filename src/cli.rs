use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Index a folder of photos, reusing cached embeddings
    Ingest {
        /// Folder to ingest. Defaults to the folder of the previous run.
        folder: Option<PathBuf>,

        /// Keep cache entries for photos no longer present in the folder
        #[clap(long, default_value = "false")]
        no_reconcile: bool,
    },

    /// Rank indexed photos by visual similarity to a query
    Similar {
        /// Query image file to embed
        #[clap(short, long)]
        image: Option<PathBuf>,

        /// Reuse the embedding of an already-indexed photo
        #[clap(short, long)]
        uri: Option<String>,

        /// Number of neighbors to return
        #[clap(short = 'k', long)]
        top: Option<usize>,
    },

    /// Show index contents and configuration
    Status {
        /// Only list photos whose name matches this substring
        #[clap(short, long)]
        filter: Option<String>,
    },
}
