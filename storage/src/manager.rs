use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::bucket::Bucket;
use crate::bucket_map::{BucketInfo, BucketMap};
use crate::entry::CacheEntry;
use crate::router::bucket_index;
use crate::{Result, StorageError};

/// Owns this node's buckets and its view of cluster-wide bucket ownership.
pub struct BucketManager {
    node_id: String,
    bucket_map: RwLock<BucketMap>,
    buckets: RwLock<HashMap<String, Arc<Bucket>>>,
}

impl BucketManager {
    /// Allocates `number_of_buckets` fresh buckets owned by `node_id`.
    pub fn new(node_id: impl Into<String>, number_of_buckets: usize) -> Self {
        let node_id = node_id.into();

        let mut bucket_map = BucketMap::new();
        let mut buckets = HashMap::with_capacity(number_of_buckets);
        let mut infos = Vec::with_capacity(number_of_buckets);
        for _ in 0..number_of_buckets {
            // v7 ids sort by creation time
            let bucket_id = Uuid::now_v7().to_string();
            buckets.insert(bucket_id.clone(), Arc::new(Bucket::new(bucket_id.clone())));
            infos.push(BucketInfo::new(bucket_id, node_id.clone()));
        }
        bucket_map.add_buckets(infos);

        tracing::info!(
            "Bucket manager for node {} created with {} buckets",
            node_id,
            number_of_buckets
        );

        Self {
            node_id,
            bucket_map: RwLock::new(bucket_map),
            buckets: RwLock::new(buckets),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.bucket_for(key).await?.get(key))
    }

    pub async fn put(&self, entry: CacheEntry) -> Result<()> {
        self.bucket_for(&entry.key).await?.put(entry);
        Ok(())
    }

    /// Groups entries by bucket first so a routing failure leaves nothing
    /// half-applied.
    pub async fn put_all(&self, entries: Vec<CacheEntry>) -> Result<()> {
        let mut grouped: HashMap<String, (Arc<Bucket>, Vec<CacheEntry>)> = HashMap::new();
        for entry in entries {
            let bucket = self.bucket_for(&entry.key).await?;
            grouped
                .entry(bucket.id().to_string())
                .or_insert_with(|| (bucket, Vec::new()))
                .1
                .push(entry);
        }
        for (bucket, batch) in grouped.into_values() {
            bucket.put_all(batch);
        }
        Ok(())
    }

    pub async fn delete(&self, key: &str) -> Result<Option<CacheEntry>> {
        Ok(self.bucket_for(key).await?.delete(key))
    }

    /// Routes a key to its bucket's ownership record.
    pub async fn route(&self, key: &str) -> Result<BucketInfo> {
        let map = self.bucket_map.read().await;
        let index = bucket_index(key, map.active_bucket_count() as i64)?;
        map.bucket_at(index).cloned()
    }

    /// Groups keys by the node owning their bucket.
    pub async fn key_to_node_map(&self, keys: &[String]) -> Result<HashMap<String, Vec<String>>> {
        let map = self.bucket_map.read().await;
        let count = map.active_bucket_count() as i64;
        let mut grouped: HashMap<String, Vec<String>> = HashMap::new();
        for key in keys {
            let info = map.bucket_at(bucket_index(key, count)?)?;
            grouped
                .entry(info.node_id.clone())
                .or_default()
                .push(key.clone());
        }
        Ok(grouped)
    }

    /// Replaces local buckets and the whole bucket map with the primary's
    /// layout, dropping anything adopted from an earlier primary. Data
    /// arrives later through bootstrap streaming and replicated writes.
    pub async fn create_from_primary(&self, primary_buckets: Vec<BucketInfo>) {
        let mut map = self.bucket_map.write().await;
        let mut buckets = self.buckets.write().await;

        let incoming: HashSet<&str> = primary_buckets
            .iter()
            .map(|info| info.bucket_id.as_str())
            .collect();
        let stale: Vec<String> = map
            .ordered_buckets()
            .iter()
            .filter(|info| !incoming.contains(info.bucket_id.as_str()))
            .map(|info| info.bucket_id.clone())
            .collect();
        map.remove_buckets(stale.iter().map(String::as_str));

        buckets.clear();
        for info in &primary_buckets {
            buckets
                .entry(info.bucket_id.clone())
                .or_insert_with(|| Arc::new(Bucket::new(info.bucket_id.clone())));
        }
        let count = primary_buckets.len();
        map.add_buckets(primary_buckets);

        tracing::info!(
            "Adopted {} buckets from primary ({} active)",
            count,
            map.active_bucket_count()
        );
    }

    /// Buckets physically held by this node.
    pub async fn local_buckets(&self) -> Vec<Arc<Bucket>> {
        self.buckets.read().await.values().cloned().collect()
    }

    /// Every bucket in the cluster, in router order.
    pub async fn all_buckets(&self) -> Vec<BucketInfo> {
        self.bucket_map.read().await.ordered_buckets().to_vec()
    }

    pub async fn bucket_map(&self) -> BucketMap {
        self.bucket_map.read().await.clone()
    }

    async fn bucket_for(&self, key: &str) -> Result<Arc<Bucket>> {
        let info = self.route(key).await?;
        self.buckets
            .read()
            .await
            .get(&info.bucket_id)
            .cloned()
            .ok_or(StorageError::BucketNotHosted {
                bucket_id: info.bucket_id,
                owner: info.node_id,
            })
    }
}
