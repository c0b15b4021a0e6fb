use chunkyard_protocol::Destination;

use crate::TransferError;

/// Validates a bucket/key pair before anything is sent or written.
///
/// The bucket is a single segment of ASCII letters, digits, `-`, `_` and
/// `.` that does not start with `.` (the part store keeps its staging area
/// under `.staging`). The key is a relative, `/`-separated object name that
/// cannot climb out of its bucket: no leading `/`, no `..` segment, no
/// backslashes and no drive or stream prefixes such as `C:`.
pub fn validate_destination(dest: &Destination) -> Result<(), TransferError> {
    check_bucket(&dest.bucket)?;
    check_key(&dest.key)
}

fn invalid(dest_part: &str, reason: &str) -> TransferError {
    TransferError::InvalidDestination(format!("{reason}: {dest_part:?}"))
}

fn check_bucket(bucket: &str) -> Result<(), TransferError> {
    if bucket.is_empty() {
        return Err(invalid(bucket, "empty bucket"));
    }
    if bucket.starts_with('.') {
        return Err(invalid(bucket, "bucket may not start with '.'"));
    }
    if !bucket
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid(bucket, "invalid character in bucket"));
    }
    Ok(())
}

fn check_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() {
        return Err(invalid(key, "empty object key"));
    }
    if key.starts_with('/') {
        return Err(invalid(key, "object key must be relative"));
    }
    if key.contains('\\') {
        return Err(invalid(key, "object key uses '\\' as a separator"));
    }
    for segment in key.split('/') {
        if segment == ".." {
            return Err(invalid(key, "object key leaves its bucket"));
        }
        if segment.contains(':') {
            return Err(invalid(key, "drive or stream prefix in object key"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_ok(key: &str) -> bool {
        validate_destination(&Destination::new("media", key)).is_ok()
    }

    #[test]
    fn accepts_nested_keys() {
        assert!(key_ok("video.mp4"));
        assert!(key_ok("2024/06/video.mp4"));
        assert!(key_ok(".hidden/config.json"));
        assert!(key_ok("./video.mp4"));
        assert!(key_ok("notes..txt"));
    }

    #[test]
    fn rejects_keys_leaving_the_bucket() {
        assert!(!key_ok(""));
        assert!(!key_ok(".."));
        assert!(!key_ok("../../../etc/passwd"));
        assert!(!key_ok("sub/../../escape"));
        assert!(!key_ok("/tmp/malicious"));
        assert!(!key_ok("..\\windows\\system32"));
        assert!(!key_ok("C:/boot.ini"));
    }

    #[test]
    fn bucket_rules() {
        assert!(validate_destination(&Destination::new("media-01", "a.bin")).is_ok());
        assert!(validate_destination(&Destination::new("my_bucket.v2", "a.bin")).is_ok());

        assert!(validate_destination(&Destination::new("", "a.bin")).is_err());
        assert!(validate_destination(&Destination::new("..", "a.bin")).is_err());
        assert!(validate_destination(&Destination::new(".staging", "a.bin")).is_err());
        assert!(validate_destination(&Destination::new("a/b", "a.bin")).is_err());
        assert!(validate_destination(&Destination::new("a b", "a.bin")).is_err());
    }

    #[test]
    fn errors_name_the_offending_part() {
        let err = validate_destination(&Destination::new("media", "../x")).unwrap_err();
        assert!(matches!(
            err,
            TransferError::InvalidDestination(ref msg) if msg.contains("\"../x\"")
        ));
    }
}
