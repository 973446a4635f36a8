//! Represents the metadata record stored alongside every uploaded file.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Epoch value persisted for files that never expire.
///
/// `i64::MAX` seconds lies outside the range chrono can represent, so it can
/// never be produced by a real timestamp (including the epoch itself).
pub const NEVER_EXPIRES_EPOCH: i64 = i64::MAX;

/// When a stored file stops being served.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Never,
    At(DateTime<Utc>),
}

impl Expiry {
    /// Decode a persisted epoch value. Returns `None` for values that are
    /// neither the sentinel nor a representable timestamp.
    pub fn from_epoch(secs: i64) -> Option<Self> {
        if secs == NEVER_EXPIRES_EPOCH {
            return Some(Expiry::Never);
        }
        DateTime::from_timestamp(secs, 0).map(Expiry::At)
    }

    pub fn to_epoch(self) -> i64 {
        match self {
            Expiry::Never => NEVER_EXPIRES_EPOCH,
            Expiry::At(ts) => ts.timestamp(),
        }
    }

    pub fn is_expired_at(self, now: DateTime<Utc>) -> bool {
        match self {
            Expiry::Never => false,
            Expiry::At(ts) => now >= ts,
        }
    }

    pub fn is_expired(self) -> bool {
        self.is_expired_at(Utc::now())
    }
}

impl Serialize for Expiry {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.to_epoch())
    }
}

/// Metadata describing one stored file.
///
/// `content_hash`, `mimetype` and `size` are computed by the storage backend
/// from the bytes it actually wrote; they are never taken from the client.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// Display name supplied by the uploader (or the key when none survived sanitizing).
    pub original_name: String,

    /// Secret required to delete the file.
    pub delete_key: String,

    /// Secret required to view the file; empty means public.
    pub access_key: String,

    /// Lowercase hex SHA-256 of the full content.
    pub content_hash: String,

    /// MIME type sniffed from the leading bytes.
    pub mimetype: String,

    /// Size in bytes.
    pub size: u64,

    pub expiry: Expiry,

    /// Sorted entry names when the file is a recognized archive.
    pub archive_entries: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn never_sentinel_round_trips_and_differs_from_epoch_zero() {
        assert_eq!(Expiry::from_epoch(NEVER_EXPIRES_EPOCH), Some(Expiry::Never));
        assert_eq!(Expiry::Never.to_epoch(), NEVER_EXPIRES_EPOCH);

        let zero = Expiry::from_epoch(0).unwrap();
        assert_ne!(zero, Expiry::Never);
        assert!(zero.is_expired());
    }

    #[test]
    fn unrepresentable_epoch_is_rejected() {
        assert_eq!(Expiry::from_epoch(i64::MAX - 1), None);
    }

    #[test]
    fn expiry_boundaries() {
        let now = Utc::now();
        assert!(!Expiry::Never.is_expired_at(now));
        assert!(Expiry::At(now).is_expired_at(now));
        assert!(Expiry::At(now - Duration::seconds(1)).is_expired_at(now));
        assert!(!Expiry::At(now + Duration::seconds(1)).is_expired_at(now));
    }
}
