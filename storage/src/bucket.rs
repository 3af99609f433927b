use async_trait::async_trait;
use dashmap::DashMap;

use crate::entry::{now_ms, CacheEntry};

/// Destination for a bucket's contents during replica bootstrap.
#[async_trait]
pub trait BucketSink: Send + Sync {
    async fn put_batch(&self, bucket_id: &str, entries: Vec<CacheEntry>) -> anyhow::Result<()>;
}

/// One shard of the key space.
///
/// Keys live in a `DashMap`, so operations on the same key are serialized by
/// the shard lock while different keys proceed independently. Expired entries
/// are evicted lazily on `get`.
#[derive(Debug)]
pub struct Bucket {
    id: String,
    entries: DashMap<String, CacheEntry>,
}

impl Bucket {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: DashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn put(&self, entry: CacheEntry) {
        if entry.is_expired() {
            tracing::trace!("Dropping already expired entry for key {}", entry.key);
            return;
        }
        self.entries.insert(entry.key.clone(), entry);
    }

    pub fn put_all(&self, entries: impl IntoIterator<Item = CacheEntry>) {
        for entry in entries {
            self.put(entry);
        }
    }

    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let now = now_ms();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired_at(now) {
                return Some(entry.clone());
            }
        }
        // a concurrent put may have replaced the value since the read above
        self.entries.remove_if(key, |_, entry| entry.is_expired_at(now));
        None
    }

    pub fn delete(&self, key: &str) -> Option<CacheEntry> {
        self.entries.remove(key).map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live entries at the time of the call. Writes racing with the scan may
    /// or may not be included.
    pub fn snapshot(&self) -> Vec<CacheEntry> {
        let now = now_ms();
        self.entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Pushes every live entry to `sink`. Local reads and writes keep running
    /// while the stream is in flight.
    pub async fn stream_to(&self, sink: &dyn BucketSink) -> bool {
        let entries = self.snapshot();
        let count = entries.len();
        match sink.put_batch(&self.id, entries).await {
            Ok(()) => {
                tracing::debug!("Streamed {} entries from bucket {}", count, self.id);
                true
            }
            Err(e) => {
                tracing::warn!("Failed to stream bucket {}: {}", self.id, e);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::NO_EXPIRY;
    use std::sync::{Arc, Mutex};

    struct Collect(Mutex<Vec<CacheEntry>>);

    #[async_trait]
    impl BucketSink for Collect {
        async fn put_batch(
            &self,
            _bucket_id: &str,
            entries: Vec<CacheEntry>,
        ) -> anyhow::Result<()> {
            self.0.lock().unwrap().extend(entries);
            Ok(())
        }
    }

    struct Refuse;

    #[async_trait]
    impl BucketSink for Refuse {
        async fn put_batch(
            &self,
            _bucket_id: &str,
            _entries: Vec<CacheEntry>,
        ) -> anyhow::Result<()> {
            anyhow::bail!("peer unreachable")
        }
    }

    #[test]
    fn put_get_delete() {
        let bucket = Bucket::new("b1");
        bucket.put(CacheEntry::persistent("a", "1"));
        assert_eq!(bucket.get("a").unwrap().value_string(), "1");

        bucket.put(CacheEntry::persistent("a", "2"));
        assert_eq!(bucket.get("a").unwrap().value_string(), "2");

        assert!(bucket.delete("a").is_some());
        assert!(bucket.get("a").is_none());
        assert!(bucket.delete("a").is_none());
    }

    #[test]
    fn expired_put_is_a_no_op() {
        let bucket = Bucket::new("b1");
        bucket.put(CacheEntry::new("gone", "v", now_ms() - 10));
        assert!(bucket.get("gone").is_none());
        assert!(bucket.is_empty());
    }

    #[tokio::test]
    async fn expired_entries_are_evicted_on_get() {
        let bucket = Bucket::new("b1");
        bucket.put(CacheEntry::new("short", "v", now_ms() + 30));
        bucket.put(CacheEntry::new("long", "v", NO_EXPIRY));
        assert!(bucket.get("short").is_some());

        tokio::time::sleep(std::time::Duration::from_millis(60)).await;

        assert!(bucket.get("short").is_none());
        assert_eq!(bucket.len(), 1);
        assert!(bucket.get("long").is_some());
    }

    #[tokio::test]
    async fn concurrent_writers_on_distinct_keys() {
        let bucket = Arc::new(Bucket::new("b1"));
        let mut handles = Vec::new();
        for t in 0..8 {
            let bucket = bucket.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..100 {
                    bucket.put(CacheEntry::persistent(format!("{}-{}", t, i), "v"));
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(bucket.len(), 800);
    }

    #[tokio::test]
    async fn stream_sends_live_entries() {
        let bucket = Bucket::new("b1");
        bucket.put_all(vec![
            CacheEntry::persistent("a", "1"),
            CacheEntry::persistent("b", "2"),
        ]);

        let sink = Collect(Mutex::new(Vec::new()));
        assert!(bucket.stream_to(&sink).await);

        let mut keys: Vec<_> = sink.0.lock().unwrap().iter().map(|e| e.key.clone()).collect();
        keys.sort();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn stream_reports_sink_failure() {
        let bucket = Bucket::new("b1");
        bucket.put(CacheEntry::persistent("a", "1"));
        assert!(!bucket.stream_to(&Refuse).await);
    }
}
