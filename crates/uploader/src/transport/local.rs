use std::path::Path;

use chunkyard_protocol::Destination;
use chunkyard_transfer::{PartStore, TransferError, checksum_bytes};
use tracing::debug;

use super::{AckToken, ChunkPart, Transport, TransportFuture};
use crate::error::TransportError;

/// Transport that stores objects in a local directory.
///
/// Chunks are staged as part files and concatenated on finalize; the ack
/// token is the part's SHA-256, re-checked during assembly.
#[derive(Debug, Clone)]
pub struct LocalTransport {
    store: PartStore,
}

impl LocalTransport {
    pub fn new(root: &Path) -> Self {
        Self {
            store: PartStore::new(root),
        }
    }

    /// Where `destination` ends up once uploaded.
    pub fn object_path(&self, destination: &Destination) -> std::path::PathBuf {
        self.store.object_path(destination)
    }
}

fn classify(err: TransferError) -> TransportError {
    match err {
        TransferError::Io(e) => TransportError::transient(format!("I/O error: {e}")),
        other => TransportError::permanent(other.to_string()),
    }
}

async fn blocking<T, F>(f: F) -> Result<T, TransportError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, TransferError> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransportError::transient(format!("task join error: {e}")))?
        .map_err(classify)
}

impl Transport for LocalTransport {
    fn send_chunk(&self, part: ChunkPart) -> TransportFuture<'_, AckToken> {
        let store = self.store.clone();
        Box::pin(async move {
            if checksum_bytes(&part.data) != part.checksum {
                return Err(TransportError::transient(format!(
                    "checksum mismatch on part {}",
                    part.index
                )));
            }
            debug!(
                destination = %part.destination,
                part = part.index,
                total = part.total_chunks,
                offset = part.range.offset,
                bytes = part.range.length,
                "writing part"
            );
            let token = blocking(move || {
                store.write_part(&part.destination, part.index, &part.data)
            })
            .await?;
            Ok(AckToken::new(token))
        })
    }

    fn finalize<'a>(
        &'a self,
        destination: &'a Destination,
        ack_tokens: &'a [AckToken],
    ) -> TransportFuture<'a, ()> {
        let store = self.store.clone();
        let dest = destination.clone();
        let tokens: Vec<String> = ack_tokens.iter().map(|t| t.as_str().to_string()).collect();
        Box::pin(async move {
            blocking(move || store.assemble(&dest, &tokens)).await?;
            Ok(())
        })
    }

    fn send_whole<'a>(
        &'a self,
        destination: &'a Destination,
        data: Vec<u8>,
    ) -> TransportFuture<'a, ()> {
        let store = self.store.clone();
        let dest = destination.clone();
        Box::pin(async move { blocking(move || store.write_whole(&dest, &data)).await })
    }
}
