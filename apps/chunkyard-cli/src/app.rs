//! Command implementations.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, anyhow, bail};
use chunkyard_uploader::{
    ByteSource, Destination, FileSource, LocalTransport, ManagerConfig, ProgressEvent,
    RecordStore, SubmitOptions, UploadId, UploadManager, UploadProgress, UploadStatus,
};
use tracing::{info, warn};

use crate::cli::{Cli, Commands};

/// Runs one CLI command to completion.
pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => ManagerConfig::load(path)?,
        None => ManagerConfig::default(),
    };

    match cli.command {
        Commands::Upload {
            files,
            root,
            bucket,
            key_prefix,
            chunk_size,
            concurrency,
            chunk_concurrency,
        } => {
            if let Some(size) = chunk_size {
                config.chunk_size = size;
            }
            if let Some(limit) = concurrency {
                config.concurrency_limit = limit;
            }
            if let Some(chunks) = chunk_concurrency {
                config.chunk_concurrency = chunks;
            }
            config.validate()?;
            let manager = open_manager(config, &root, &cli.state_dir)?;

            let mut uploads = Vec::with_capacity(files.len());
            for file in &files {
                let destination = destination_for(file, &bucket, key_prefix.as_deref())?;
                let id = submit_file(&manager, file, destination)?;
                uploads.push((id, file.display().to_string()));
            }
            wait_all(&manager, &uploads).await
        }

        Commands::Resume { root } => {
            let records = RecordStore::open(&cli.state_dir)?.load_all().await?;
            let manager = open_manager(config, &root, &cli.state_dir)?;

            let mut uploads = Vec::new();
            for record in &records {
                let Some(label) = record.label.as_deref() else {
                    warn!(upload = %record.upload_id, "record has no source path, skipping");
                    continue;
                };
                let source = match FileSource::open(Path::new(label)) {
                    Ok(source) => source,
                    Err(e) => {
                        warn!(
                            upload = %record.upload_id,
                            path = label,
                            error = %e,
                            "cannot reopen source, skipping"
                        );
                        continue;
                    }
                };
                match manager.restore(record, Arc::new(source), SubmitOptions::default()) {
                    Ok(id) => uploads.push((id, label.to_string())),
                    Err(e) => {
                        warn!(
                            upload = %record.upload_id,
                            error = %e,
                            "cannot restore upload, skipping"
                        );
                    }
                }
            }
            if uploads.is_empty() {
                println!("nothing to resume in {}", cli.state_dir.display());
                return Ok(());
            }
            info!(count = uploads.len(), "resuming uploads");
            wait_all(&manager, &uploads).await
        }

        Commands::Status => {
            let store = RecordStore::open(&cli.state_dir)?;
            let records = store.load_all().await?;
            if records.is_empty() {
                println!("no pending uploads");
            }
            for record in records {
                println!(
                    "{}  {:<9}  {}/{} chunks  {}  {}",
                    record.upload_id,
                    record.status.to_string(),
                    record.completed_chunks(),
                    record.chunks.len(),
                    record.destination,
                    record.label.as_deref().unwrap_or("-"),
                );
            }
            Ok(())
        }
    }
}

fn open_manager(
    config: ManagerConfig,
    root: &Path,
    state_dir: &Path,
) -> anyhow::Result<UploadManager> {
    let store = RecordStore::open(state_dir)?;
    let manager =
        UploadManager::with_store(config, Arc::new(LocalTransport::new(root)), store)?;
    manager.on_progress(log_progress);
    Ok(manager)
}

/// `<prefix>/<file name>` in `bucket`.
fn destination_for(
    file: &Path,
    bucket: &str,
    key_prefix: Option<&str>,
) -> anyhow::Result<Destination> {
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| anyhow!("{} has no usable file name", file.display()))?;
    let key = match key_prefix.map(|p| p.trim_matches('/')) {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}/{name}"),
        _ => name.to_string(),
    };
    Ok(Destination::new(bucket, key))
}

fn submit_file(
    manager: &UploadManager,
    file: &Path,
    destination: Destination,
) -> anyhow::Result<UploadId> {
    let source = FileSource::open(file).with_context(|| format!("opening {}", file.display()))?;
    let total = source.len();
    // Absolute path so `resume` works from any directory.
    let label = std::fs::canonicalize(file)
        .unwrap_or_else(|_| PathBuf::from(file))
        .display()
        .to_string();
    let id = manager.submit(
        Arc::new(source),
        destination,
        total,
        SubmitOptions::default().label(label),
    )?;
    Ok(id)
}

fn log_progress(event: &ProgressEvent) {
    let p = &event.progress;
    if event.chunk_index.is_some() {
        info!(
            upload = %p.upload_id,
            percent = p.percentage().round() as u64,
            rate_kib = (event.bytes_per_second / 1024.0) as u64,
            eta_secs = event.eta.map(|d| d.as_secs()),
            "progress"
        );
    } else {
        info!(upload = %p.upload_id, status = %p.status, "status changed");
    }
}

/// Waits for every upload; on Ctrl-C pauses them so `resume` can continue.
async fn wait_all(manager: &UploadManager, uploads: &[(UploadId, String)]) -> anyhow::Result<()> {
    let waits = async {
        let mut results = Vec::with_capacity(uploads.len());
        for (id, name) in uploads {
            results.push((name.as_str(), manager.wait(id).await?));
        }
        Ok::<_, chunkyard_uploader::UploadError>(results)
    };

    tokio::select! {
        results = waits => report(&results?),
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted, pausing uploads");
            for (id, _) in uploads {
                manager.pause(id).await?;
            }
            println!("uploads paused; run `chunkyard resume` to continue");
            Ok(())
        }
    }
}

fn report(results: &[(&str, UploadProgress)]) -> anyhow::Result<()> {
    let mut failed = 0;
    for (name, progress) in results {
        match progress.status {
            UploadStatus::Completed => println!("done    {name} ({} bytes)", progress.total_bytes),
            status => {
                failed += 1;
                println!(
                    "{:<7} {name}: {}",
                    status.to_string(),
                    progress.error.as_deref().unwrap_or("no error recorded")
                );
            }
        }
    }
    if failed > 0 {
        bail!("{failed} of {} uploads did not complete", results.len());
    }
    Ok(())
}
