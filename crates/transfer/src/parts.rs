use std::io::Write;
use std::path::{Path, PathBuf};

use chunkyard_protocol::Destination;
use tracing::debug;

use crate::{TransferError, checksum_bytes, validate_destination};

const STAGING_DIR: &str = ".staging";

/// Directory-backed object storage with multipart semantics.
///
/// Parts are staged under `<root>/.staging/<bucket>/<key>/<index>.part` and
/// concatenated into `<root>/<bucket>/<key>` by [`PartStore::assemble`]. The
/// acknowledgment for a part is the SHA-256 of its bytes, which assembly
/// re-verifies.
#[derive(Debug, Clone)]
pub struct PartStore {
    root: PathBuf,
}

impl PartStore {
    /// Creates a store rooted at `root`.
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    /// Final location of an object.
    pub fn object_path(&self, dest: &Destination) -> PathBuf {
        self.root.join(&dest.bucket).join(&dest.key)
    }

    fn staging_dir(&self, dest: &Destination) -> PathBuf {
        self.root
            .join(STAGING_DIR)
            .join(&dest.bucket)
            .join(&dest.key)
    }

    fn part_path(&self, dest: &Destination, index: usize) -> PathBuf {
        self.staging_dir(dest).join(format!("{index}.part"))
    }

    /// Stages one part and returns its acknowledgment token.
    ///
    /// Writing the same index again replaces the earlier part.
    pub fn write_part(
        &self,
        dest: &Destination,
        index: usize,
        data: &[u8],
    ) -> Result<String, TransferError> {
        validate_destination(dest)?;
        let path = self.part_path(dest, index);
        write_atomically(&path, data)?;
        debug!(destination = %dest, part = index, bytes = data.len(), "staged part");
        Ok(checksum_bytes(data))
    }

    /// Concatenates staged parts in the order of `ack_tokens` into the final
    /// object and removes the staging directory. Returns the object size.
    pub fn assemble(
        &self,
        dest: &Destination,
        ack_tokens: &[String],
    ) -> Result<u64, TransferError> {
        validate_destination(dest)?;
        let final_path = self.object_path(dest);
        let tmp_path = tmp_path_for(&final_path);
        if let Some(parent) = final_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&tmp_path)?;
        let mut total = 0u64;
        for (index, token) in ack_tokens.iter().enumerate() {
            let part = match std::fs::read(self.part_path(dest, index)) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    let _ = std::fs::remove_file(&tmp_path);
                    return Err(TransferError::MissingPart(index));
                }
                Err(e) => return Err(e.into()),
            };
            if checksum_bytes(&part) != *token {
                let _ = std::fs::remove_file(&tmp_path);
                return Err(TransferError::ChecksumMismatch(index));
            }
            out.write_all(&part)?;
            total += part.len() as u64;
        }
        out.sync_all()?;
        drop(out);

        std::fs::rename(&tmp_path, &final_path)?;
        self.discard(dest)?;
        debug!(destination = %dest, parts = ack_tokens.len(), bytes = total, "assembled object");
        Ok(total)
    }

    /// Writes a whole object in one step.
    pub fn write_whole(&self, dest: &Destination, data: &[u8]) -> Result<(), TransferError> {
        validate_destination(dest)?;
        write_atomically(&self.object_path(dest), data)
    }

    /// Drops any staged parts for `dest`.
    pub fn discard(&self, dest: &Destination) -> Result<(), TransferError> {
        match std::fs::remove_dir_all(self.staging_dir(dest)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomically(path: &Path, data: &[u8]) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = tmp_path_for(path);
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
