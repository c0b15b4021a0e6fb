use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "chunkyard",
    version,
    about = "Resumable chunked uploads into a local object directory",
    long_about = None
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "JSON manager configuration file")]
    pub config: Option<PathBuf>,

    #[arg(
        long,
        global = true,
        default_value = ".chunkyard",
        help = "Directory holding resumable upload records"
    )]
    pub state_dir: PathBuf,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Upload one or more files.
    Upload {
        #[arg(required = true, help = "Files to upload")]
        files: Vec<PathBuf>,

        #[arg(long, help = "Object directory the bucket lives in")]
        root: PathBuf,

        #[arg(long, help = "Destination bucket")]
        bucket: String,

        #[arg(long, help = "Key prefix prepended to each file name")]
        key_prefix: Option<String>,

        #[arg(long, help = "Chunk size in bytes (overrides the config)")]
        chunk_size: Option<u64>,

        #[arg(long, help = "Uploads running at once (overrides the config)")]
        concurrency: Option<usize>,

        #[arg(long, help = "Chunks in flight per upload (overrides the config)")]
        chunk_concurrency: Option<usize>,
    },

    /// Continue every interrupted or failed upload found in the state directory.
    Resume {
        #[arg(long, help = "Object directory the uploads were targeting")]
        root: PathBuf,
    },

    /// List persisted uploads.
    Status,
}
