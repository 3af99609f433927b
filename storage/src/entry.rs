use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// TTL value meaning "never expires".
pub const NO_EXPIRY: i64 = -1;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Expiry as written by a client, before it is pinned to an absolute deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Expiry {
    None,
    /// Relative, in seconds (`EX`).
    In(i64),
    /// Absolute deadline in epoch milliseconds (`EXAT`). `-1` means no expiry.
    At(i64),
}

impl Expiry {
    pub fn to_ttl(self, now: i64) -> i64 {
        match self {
            Expiry::None => NO_EXPIRY,
            Expiry::In(secs) => now.saturating_add(secs.saturating_mul(1000)),
            Expiry::At(ms) => ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    /// Absolute deadline in epoch milliseconds, or [`NO_EXPIRY`].
    pub ttl: i64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, ttl: i64) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ttl,
        }
    }

    pub fn persistent(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self::new(key, value, NO_EXPIRY)
    }

    pub fn is_expired_at(&self, now: i64) -> bool {
        self.ttl != NO_EXPIRY && now > self.ttl
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(now_ms())
    }

    pub fn value_string(&self) -> String {
        String::from_utf8_lossy(&self.value).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_expiry_never_expires() {
        let entry = CacheEntry::persistent("k", "v");
        assert!(!entry.is_expired_at(i64::MAX));
    }

    #[test]
    fn expires_strictly_after_deadline() {
        let entry = CacheEntry::new("k", "v", 1_000);
        assert!(!entry.is_expired_at(999));
        assert!(!entry.is_expired_at(1_000));
        assert!(entry.is_expired_at(1_001));
    }

    #[test]
    fn expiry_resolves_to_absolute_deadline() {
        assert_eq!(Expiry::None.to_ttl(5_000), NO_EXPIRY);
        assert_eq!(Expiry::In(2).to_ttl(5_000), 7_000);
        assert_eq!(Expiry::At(9_999).to_ttl(5_000), 9_999);
        assert_eq!(Expiry::At(NO_EXPIRY).to_ttl(5_000), NO_EXPIRY);
    }
}
