use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::node::NodeInfo;

/// This node's view of the primary/replica topology, tagged with an epoch.
///
/// Invariants kept by every mutator:
/// - every key of `primary_to_replicas` and every value of
///   `replica_to_primary` is in `primaries`
/// - a node is the replica of at most one primary
/// - no node is both a primary and a replica
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterMap {
    epoch: u64,
    primaries: BTreeSet<String>,
    primary_to_replicas: BTreeMap<String, BTreeSet<String>>,
    replica_to_primary: BTreeMap<String, String>,
    all_nodes: BTreeMap<String, NodeInfo>,
}

impl ClusterMap {
    pub fn new(epoch: u64) -> Self {
        Self {
            epoch,
            ..Self::default()
        }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn increment_epoch(&mut self) -> u64 {
        self.epoch += 1;
        tracing::info!("Cluster epoch incremented to {}: {}", self.epoch, self);
        self.epoch
    }

    /// Lifts the epoch to `epoch` if it is currently lower.
    pub fn raise_epoch(&mut self, epoch: u64) {
        self.epoch = self.epoch.max(epoch);
    }

    pub fn primaries(&self) -> impl Iterator<Item = &String> {
        self.primaries.iter()
    }

    pub fn is_primary(&self, node_id: &str) -> bool {
        self.primaries.contains(node_id)
    }

    pub fn node(&self, node_id: &str) -> Option<&NodeInfo> {
        self.all_nodes.get(node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.all_nodes.values()
    }

    /// Refreshes the stored copy of a node already in the map.
    pub fn update_node(&mut self, node: &NodeInfo) {
        if let Some(stored) = self.all_nodes.get_mut(&node.node_id) {
            *stored = node.clone();
        }
    }

    pub fn add_primary(&mut self, primary: NodeInfo) {
        let primary_id = primary.node_id.clone();
        self.detach_replica(&primary_id);
        self.all_nodes.insert(primary_id.clone(), primary);
        self.primaries.insert(primary_id);
    }

    /// Removes a primary along with its replica relationships.
    pub fn remove_primary(&mut self, primary_id: &str) {
        self.primaries.remove(primary_id);
        if let Some(replicas) = self.primary_to_replicas.remove(primary_id) {
            for replica in replicas {
                self.replica_to_primary.remove(&replica);
            }
        }
        if !self.replica_to_primary.contains_key(primary_id) {
            self.all_nodes.remove(primary_id);
        }
    }

    /// Records `replica` as following `primary`, moving it off any previous
    /// primary. Returns false if the relationship already existed.
    pub fn add_replica(&mut self, primary: &NodeInfo, replica: NodeInfo) -> bool {
        let primary_id = primary.node_id.clone();
        let replica_id = replica.node_id.clone();

        if self.is_replica_of(&replica_id, &primary_id) {
            self.all_nodes.insert(replica_id, replica);
            return false;
        }

        if !self.primaries.contains(&primary_id) {
            self.add_primary(primary.clone());
        }

        // a demoted primary gives up its own replica set
        if self.primaries.remove(&replica_id) {
            if let Some(orphans) = self.primary_to_replicas.remove(&replica_id) {
                for orphan in orphans {
                    self.replica_to_primary.remove(&orphan);
                }
            }
        }
        self.detach_replica(&replica_id);

        self.primary_to_replicas
            .entry(primary_id.clone())
            .or_default()
            .insert(replica_id.clone());
        self.replica_to_primary.insert(replica_id.clone(), primary_id);
        self.all_nodes.insert(replica_id, replica);
        true
    }

    pub fn primary_of(&self, replica_id: &str) -> Option<&NodeInfo> {
        self.replica_to_primary
            .get(replica_id)
            .and_then(|primary_id| self.all_nodes.get(primary_id))
    }

    pub fn replicas_of(&self, primary_id: &str) -> Vec<NodeInfo> {
        self.primary_to_replicas
            .get(primary_id)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.all_nodes.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_replica_of(&self, replica_id: &str, primary_id: &str) -> bool {
        self.replica_to_primary.get(replica_id).map(String::as_str) == Some(primary_id)
    }

    /// Folds a peer's view into this one.
    ///
    /// A higher epoch wins outright. At equal epochs the views are unioned;
    /// anything this map already records is kept, so conflicting assignments
    /// resolve in favour of the local view. A lower epoch is ignored.
    pub fn merge(&mut self, other: ClusterMap) {
        if other.epoch > self.epoch {
            tracing::info!(
                "Adopting cluster map at epoch {} (local epoch {})",
                other.epoch,
                self.epoch
            );
            *self = other;
            return;
        }
        if other.epoch < self.epoch {
            tracing::debug!(
                "Ignoring stale cluster map at epoch {} (local epoch {})",
                other.epoch,
                self.epoch
            );
            return;
        }

        for (node_id, node) in other.all_nodes.iter() {
            self.all_nodes
                .entry(node_id.clone())
                .or_insert_with(|| node.clone());
        }

        for primary_id in other.primaries.iter() {
            if !self.replica_to_primary.contains_key(primary_id) {
                self.primaries.insert(primary_id.clone());
            }
        }

        for (replica_id, primary_id) in other.replica_to_primary.iter() {
            if self.replica_to_primary.contains_key(replica_id)
                || self.primaries.contains(replica_id)
                || !self.primaries.contains(primary_id)
            {
                continue;
            }
            self.replica_to_primary
                .insert(replica_id.clone(), primary_id.clone());
            self.primary_to_replicas
                .entry(primary_id.clone())
                .or_default()
                .insert(replica_id.clone());
        }
    }

    fn detach_replica(&mut self, replica_id: &str) {
        if let Some(previous) = self.replica_to_primary.remove(replica_id) {
            if let Some(replicas) = self.primary_to_replicas.get_mut(&previous) {
                replicas.remove(replica_id);
                if replicas.is_empty() {
                    self.primary_to_replicas.remove(&previous);
                }
            }
        }
    }
}

impl fmt::Display for ClusterMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "epoch={} primaries={:?} replicas={:?}",
            self.epoch, self.primaries, self.primary_to_replicas
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use network::NodeAddress;

    fn node(id: &str, port: u16) -> NodeInfo {
        NodeInfo::new(id, NodeAddress::new("127.0.0.1", port))
    }

    fn assert_invariants(map: &ClusterMap) {
        for primary in map.primary_to_replicas.keys() {
            assert!(map.primaries.contains(primary), "{} not a primary", primary);
        }
        for (replica, primary) in &map.replica_to_primary {
            assert!(map.primaries.contains(primary), "{} not a primary", primary);
            assert!(!map.primaries.contains(replica), "{} is both", replica);
            assert!(map.primary_to_replicas[primary].contains(replica));
        }
        let listed: usize = map.primary_to_replicas.values().map(BTreeSet::len).sum();
        assert_eq!(listed, map.replica_to_primary.len());
    }

    #[test]
    fn add_replica_links_both_directions() {
        let (a, b) = (node("a", 1), node("b", 2));
        let mut map = ClusterMap::new(0);
        map.add_primary(a.clone());

        assert!(map.add_replica(&a, b.clone()));
        assert!(!map.add_replica(&a, b.clone()));

        assert_eq!(map.primary_of("b").unwrap().node_id, "a");
        assert_eq!(map.replicas_of("a"), vec![b]);
        assert!(map.is_replica_of("b", "a"));
        assert_invariants(&map);
    }

    #[test]
    fn replica_moves_between_primaries() {
        let (a, b, c) = (node("a", 1), node("b", 2), node("c", 3));
        let mut map = ClusterMap::new(0);
        map.add_replica(&a, c.clone());
        map.add_replica(&b, c.clone());

        assert!(map.replicas_of("a").is_empty());
        assert_eq!(map.primary_of("c").unwrap().node_id, "b");
        assert_invariants(&map);
    }

    #[test]
    fn demoting_a_primary_drops_its_replicas() {
        let (a, b, c) = (node("a", 1), node("b", 2), node("c", 3));
        let mut map = ClusterMap::new(0);
        map.add_replica(&a, b.clone());
        map.add_replica(&c, a.clone());

        assert!(!map.is_primary("a"));
        assert!(map.primary_of("b").is_none());
        assert_eq!(map.primary_of("a").unwrap().node_id, "c");
        assert_invariants(&map);
    }

    #[test]
    fn remove_primary_clears_relationships() {
        let (a, b) = (node("a", 1), node("b", 2));
        let mut map = ClusterMap::new(0);
        map.add_replica(&a, b.clone());
        map.remove_primary("a");

        assert!(!map.is_primary("a"));
        assert!(map.node("a").is_none());
        assert!(map.primary_of("b").is_none());
        assert_invariants(&map);
    }

    #[test]
    fn higher_epoch_replaces_local_state() {
        let mut local = ClusterMap::new(3);
        local.add_primary(node("a", 1));

        let mut remote = ClusterMap::new(4);
        remote.add_replica(&node("b", 2), node("c", 3));

        local.merge(remote.clone());
        assert_eq!(local, remote);
        assert!(!local.is_primary("a"));
    }

    #[test]
    fn lower_epoch_is_ignored() {
        let mut local = ClusterMap::new(4);
        local.add_primary(node("a", 1));
        let before = local.clone();

        let mut remote = ClusterMap::new(2);
        remote.add_primary(node("b", 2));
        local.merge(remote);

        assert_eq!(local, before);
    }

    #[test]
    fn equal_epoch_disjoint_primaries_union() {
        let mut left = ClusterMap::new(5);
        left.add_primary(node("A", 1));
        let mut right = ClusterMap::new(5);
        right.add_primary(node("B", 2));

        let mut l = left.clone();
        l.merge(right.clone());
        let mut r = right.clone();
        r.merge(left.clone());

        for map in [&l, &r] {
            assert_eq!(map.epoch(), 5);
            assert_eq!(
                map.primaries().cloned().collect::<Vec<_>>(),
                vec!["A".to_string(), "B".to_string()]
            );
        }
    }

    #[test]
    fn equal_epoch_merge_is_idempotent() {
        let mut left = ClusterMap::new(2);
        left.add_replica(&node("a", 1), node("b", 2));
        let mut right = ClusterMap::new(2);
        right.add_replica(&node("c", 3), node("d", 4));
        right.add_replica(&node("c", 3), node("b", 2));

        let mut once = left.clone();
        once.merge(right.clone());
        let mut twice = once.clone();
        twice.merge(right.clone());

        assert_eq!(once, twice);
        assert_invariants(&once);
    }

    #[test]
    fn equal_epoch_keeps_local_assignments() {
        let mut left = ClusterMap::new(1);
        left.add_replica(&node("a", 1), node("r", 9));
        let mut right = ClusterMap::new(1);
        right.add_replica(&node("b", 2), node("r", 9));
        right.add_replica(&node("r", 9), node("s", 10));

        left.merge(right);

        assert_eq!(left.primary_of("r").unwrap().node_id, "a");
        assert!(left.is_primary("b"));
        // r is a replica here, so it cannot lead s
        assert!(!left.is_primary("r"));
        assert!(left.primary_of("s").is_none());
        assert_invariants(&left);
    }

    #[test]
    fn json_round_trip() {
        let mut map = ClusterMap::new(7);
        map.add_replica(&node("a", 1), node("b", 2));
        let json = serde_json::to_string(&map).unwrap();
        let back: ClusterMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }

    #[test]
    fn display_summarises_topology() {
        let mut map = ClusterMap::new(3);
        map.add_replica(&node("a", 1), node("b", 2));
        assert_eq!(
            map.to_string(),
            r#"epoch=3 primaries={"a"} replicas={"a": {"b"}}"#
        );
    }
}
