//! JSON persistence of upload records, one file per upload.

use std::path::{Path, PathBuf};

use chunkyard_protocol::{UploadId, UploadRecord};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::UploadError;

/// Directory of `<upload-id>.json` records.
///
/// Writes go through a temporary file and a rename, so a crash leaves either
/// the previous record or the new one.
#[derive(Debug)]
pub struct RecordStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

fn store_err(context: &str, err: impl std::fmt::Display) -> UploadError {
    UploadError::Store(format!("{context}: {err}"))
}

impl RecordStore {
    /// Opens (and creates if needed) the state directory.
    pub fn open(dir: &Path) -> Result<Self, UploadError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| store_err(&format!("cannot create {}", dir.display()), e))?;
        Ok(Self {
            dir: dir.to_path_buf(),
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, id: &UploadId) -> Result<PathBuf, UploadError> {
        let valid = !id.as_str().is_empty()
            && id
                .as_str()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            return Err(UploadError::Store(format!(
                "upload id {id:?} cannot be used as a file name"
            )));
        }
        Ok(self.dir.join(format!("{}.json", id.as_str())))
    }

    pub async fn save(&self, record: &UploadRecord) -> Result<(), UploadError> {
        let path = self.path_for(&record.upload_id)?;
        let json = serde_json::to_vec_pretty(record).map_err(|e| store_err("serialize", e))?;
        let tmp = path.with_extension("json.tmp");

        let _guard = self.write_lock.lock().await;
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| store_err(&format!("write {}", tmp.display()), e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| store_err(&format!("rename to {}", path.display()), e))?;
        Ok(())
    }

    pub async fn load(&self, id: &UploadId) -> Result<Option<UploadRecord>, UploadError> {
        let path = self.path_for(id)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| store_err(&format!("parse {}", path.display()), e)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(store_err(&format!("read {}", path.display()), e)),
        }
    }

    /// Deletes a record; missing records are not an error.
    pub async fn remove(&self, id: &UploadId) -> Result<(), UploadError> {
        let path = self.path_for(id)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(store_err(&format!("remove {}", path.display()), e)),
        }
    }

    /// Every readable record in the directory. Unparseable files are skipped
    /// with a warning.
    pub async fn load_all(&self) -> Result<Vec<UploadRecord>, UploadError> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| store_err(&format!("list {}", self.dir.display()), e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| store_err(&format!("list {}", self.dir.display()), e))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = match tokio::fs::read(&path).await {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read upload record");
                    continue;
                }
            };
            match serde_json::from_slice::<UploadRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping malformed upload record");
                }
            }
        }
        records.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(records)
    }
}
