use chunkyard_protocol::ByteRange;

use crate::TransferError;

/// Splits a payload of `total_bytes` into ordered ranges of `chunk_size`.
///
/// Returns `ceil(total_bytes / chunk_size)` ranges, the last one possibly
/// shorter. An empty payload yields one zero-length range so it can still be
/// sent as a single no-op request.
pub fn plan(total_bytes: u64, chunk_size: u64) -> Result<Vec<ByteRange>, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidChunkSize);
    }
    if total_bytes == 0 {
        return Ok(vec![ByteRange::new(0, 0)]);
    }

    let count = total_bytes.div_ceil(chunk_size) as usize;
    let mut ranges = Vec::with_capacity(count);
    let mut offset = 0u64;
    while offset < total_bytes {
        let length = chunk_size.min(total_bytes - offset);
        ranges.push(ByteRange::new(offset, length));
        offset += length;
    }
    Ok(ranges)
}
