use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::{Result, StorageError};

/// Which node owns a bucket. Replaced wholesale on ownership transfer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketInfo {
    pub bucket_id: String,
    pub node_id: String,
}

impl BucketInfo {
    pub fn new(bucket_id: impl Into<String>, node_id: impl Into<String>) -> Self {
        Self {
            bucket_id: bucket_id.into(),
            node_id: node_id.into(),
        }
    }
}

/// Cluster-wide bucket ownership.
///
/// `ordered_buckets` is kept sorted by bucket id; the router's index points
/// into it, so every node holding the same set of buckets resolves a key to
/// the same owner.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMap {
    active_bucket_count: usize,
    node_to_buckets: BTreeMap<String, BTreeSet<String>>,
    ordered_buckets: Vec<BucketInfo>,
}

impl BucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn active_bucket_count(&self) -> usize {
        self.active_bucket_count
    }

    pub fn ordered_buckets(&self) -> &[BucketInfo] {
        &self.ordered_buckets
    }

    /// Adds buckets, replacing the owner of any bucket id already present.
    pub fn add_buckets(&mut self, buckets: impl IntoIterator<Item = BucketInfo>) {
        for info in buckets {
            match self
                .ordered_buckets
                .binary_search_by(|b| b.bucket_id.cmp(&info.bucket_id))
            {
                Ok(pos) => {
                    let previous = std::mem::replace(&mut self.ordered_buckets[pos], info.clone());
                    self.unlink(&previous);
                }
                Err(pos) => self.ordered_buckets.insert(pos, info.clone()),
            }
            self.node_to_buckets
                .entry(info.node_id)
                .or_default()
                .insert(info.bucket_id);
        }
        self.active_bucket_count = self.ordered_buckets.len();
    }

    pub fn remove_buckets<'a>(&mut self, bucket_ids: impl IntoIterator<Item = &'a str>) {
        for bucket_id in bucket_ids {
            if let Ok(pos) = self
                .ordered_buckets
                .binary_search_by(|b| b.bucket_id.as_str().cmp(bucket_id))
            {
                let removed = self.ordered_buckets.remove(pos);
                self.unlink(&removed);
            }
        }
        self.active_bucket_count = self.ordered_buckets.len();
    }

    pub fn bucket_at(&self, index: usize) -> Result<&BucketInfo> {
        self.ordered_buckets
            .get(index)
            .ok_or(StorageError::BucketIndexOutOfRange {
                index,
                count: self.active_bucket_count,
            })
    }

    fn unlink(&mut self, info: &BucketInfo) {
        if let Some(ids) = self.node_to_buckets.get_mut(&info.node_id) {
            ids.remove(&info.bucket_id);
            if ids.is_empty() {
                self.node_to_buckets.remove(&info.node_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(map: &BucketMap) -> Vec<&str> {
        map.ordered_buckets()
            .iter()
            .map(|info| info.bucket_id.as_str())
            .collect()
    }

    fn owned_by<'a>(map: &'a BucketMap, node_id: &str) -> Vec<&'a str> {
        map.node_to_buckets
            .get(node_id)
            .map(|ids| ids.iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    #[test]
    fn keeps_buckets_sorted_by_id() {
        let mut map = BucketMap::new();
        map.add_buckets(vec![
            BucketInfo::new("c", "n1"),
            BucketInfo::new("a", "n1"),
            BucketInfo::new("b", "n2"),
        ]);

        assert_eq!(ids(&map), vec!["a", "b", "c"]);
        assert_eq!(map.active_bucket_count(), 3);
        assert_eq!(map.bucket_at(1).unwrap().node_id, "n2");
        assert!(matches!(
            map.bucket_at(3),
            Err(StorageError::BucketIndexOutOfRange { index: 3, count: 3 })
        ));
    }

    #[test]
    fn re_adding_a_bucket_transfers_ownership() {
        let mut map = BucketMap::new();
        map.add_buckets(vec![BucketInfo::new("a", "n1"), BucketInfo::new("b", "n1")]);
        map.add_buckets(vec![BucketInfo::new("a", "n2")]);

        assert_eq!(map.active_bucket_count(), 2);
        assert_eq!(owned_by(&map, "n1"), vec!["b"]);
        assert_eq!(owned_by(&map, "n2"), vec!["a"]);
    }

    #[test]
    fn remove_unlinks_owners() {
        let mut map = BucketMap::new();
        map.add_buckets(vec![
            BucketInfo::new("a", "n1"),
            BucketInfo::new("b", "n2"),
            BucketInfo::new("c", "n1"),
        ]);

        map.remove_buckets(["b", "missing"]);
        assert_eq!(ids(&map), vec!["a", "c"]);
        assert_eq!(map.active_bucket_count(), 2);
        assert!(owned_by(&map, "n2").is_empty());
        assert!(!map.node_to_buckets.contains_key("n2"));

        map.remove_buckets(["a", "c"]);
        assert_eq!(map.active_bucket_count(), 0);
        assert!(map.node_to_buckets.is_empty());
    }

    #[test]
    fn serializes_as_json() {
        let mut map = BucketMap::new();
        map.add_buckets(vec![BucketInfo::new("a", "n1")]);
        let json = serde_json::to_string(&map).unwrap();
        let back: BucketMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
