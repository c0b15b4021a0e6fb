//! Resumable chunked upload manager.
//!
//! [`UploadManager`] accepts uploads (a [`ByteSource`], a [`Destination`] and
//! a size), splits them into chunks, sends the chunks through a caller
//! supplied [`Transport`], and commits the object once every chunk is
//! acknowledged. At most `concurrency_limit` uploads are active at a time;
//! the rest wait in a FIFO queue. Transient chunk failures are retried with
//! capped exponential backoff. Uploads can be paused, resumed and cancelled,
//! and with a [`RecordStore`] their chunk state survives a restart.

mod config;
mod driver;
mod error;
mod manager;
mod reporter;
mod retry;
mod scheduler;
mod store;
mod task;
pub mod transport;

pub use config::{
    DEFAULT_ATTEMPT_TIMEOUT, DEFAULT_CHUNK_CONCURRENCY, DEFAULT_CONCURRENCY_LIMIT, ManagerConfig,
};
pub use error::{TransportError, UploadError};
pub use manager::{SubmitOptions, UploadManager};
pub use reporter::{ProgressCallback, ProgressEvent};
pub use retry::{RetryDecision, RetryPolicy};
pub use store::RecordStore;
pub use transport::{AckToken, ChunkPart, LocalTransport, Transport, TransportFuture};

pub use chunkyard_protocol::{
    ByteRange, ChunkStatus, Destination, UploadId, UploadProgress, UploadRecord, UploadStatus,
};
pub use chunkyard_transfer::{ByteSource, DEFAULT_CHUNK_SIZE, FileSource, MemorySource};
