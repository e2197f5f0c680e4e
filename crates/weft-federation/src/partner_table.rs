//! The partner table: every node this site node has heard about.
//!
//! Reads (closest-node lookup, enumeration) are concurrent; writes take
//! the exclusive side of the lock. For each node id the stored
//! incarnation only ever goes up; stale announcements are dropped.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::node_id::NodeId;
use crate::proto::PartnerNodeInfo;

#[derive(Debug, Default)]
pub(crate) struct PartnerTable {
    partners: RwLock<BTreeMap<NodeId, PartnerNodeInfo>>,
    version: AtomicU64,
}

impl PartnerTable {
    /// Applies a partner announcement. Returns the stored info and
    /// whether the node was new, or `None` when the announcement lost
    /// to a newer incarnation already in the table.
    pub(crate) fn update(&self, info: &PartnerNodeInfo) -> Option<(PartnerNodeInfo, bool)> {
        let id = info.instance.id;

        let mut partners = self.partners.write();
        let is_new = match partners.get(&id) {
            Some(existing) if existing.instance.instance_id >= info.instance.instance_id => {
                return None;
            }
            Some(_) => false,
            None => true,
        };
        partners.insert(id, info.clone());
        self.version.fetch_add(1, Ordering::Relaxed);
        Some((info.clone(), is_new))
    }

    /// Snapshot of the partners passing `filter`.
    pub(crate) fn known(
        &self,
        filter: impl Fn(&PartnerNodeInfo) -> bool,
    ) -> Vec<PartnerNodeInfo> {
        self.partners.read().values().filter(|p| filter(p)).cloned().collect()
    }

    /// The partner minimizing `(target - partner) mod 2^128`, excluding
    /// `exclude`. Ties break toward the lower raw id.
    pub(crate) fn closest(&self, target: NodeId, exclude: NodeId) -> Option<PartnerNodeInfo> {
        let partners = self.partners.read();
        let mut best: Option<(u128, &PartnerNodeInfo)> = None;

        for (id, partner) in partners.iter() {
            if *id == exclude {
                continue;
            }
            let distance = target.ring_distance_from(*id);
            // Ascending iteration makes strict less-than break ties
            // toward the lower id.
            if best.is_none_or(|(best_distance, _)| distance < best_distance) {
                best = Some((distance, partner));
            }
        }

        best.map(|(_, partner)| partner.clone())
    }

    /// Monotonic counter bumped on every accepted update.
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::PartnerTable;
    use crate::node_id::{NodeId, NodeInstance};
    use crate::proto::PartnerNodeInfo;

    fn partner(id: u128, instance_id: u64) -> PartnerNodeInfo {
        PartnerNodeInfo {
            instance: NodeInstance { id: NodeId(id), instance_id },
            ..PartnerNodeInfo::default()
        }
    }

    #[test]
    fn stale_incarnations_are_dropped() {
        let table = PartnerTable::default();
        assert!(table.update(&partner(1, 5)).is_some());
        assert!(table.update(&partner(1, 4)).is_none());
        assert!(table.update(&partner(1, 5)).is_none());
        assert!(table.update(&partner(1, 6)).is_some());

        let known = table.known(|_| true);
        assert_eq!(known.len(), 1);
        assert_eq!(known[0].instance.instance_id, 6);
    }

    #[test]
    fn update_reports_newness() {
        let table = PartnerTable::default();
        let (_, is_new) = table.update(&partner(2, 1)).unwrap();
        assert!(is_new);
        let (_, is_new) = table.update(&partner(2, 2)).unwrap();
        assert!(!is_new);
    }

    #[test]
    fn closest_minimizes_ring_distance_from_target() {
        let table = PartnerTable::default();
        for id in [10u128, 20, 30] {
            table.update(&partner(id, 1)).unwrap();
        }

        // Walking backwards from 25: node 20 is distance 5, node 10 is
        // 15, node 30 wraps nearly all the way around.
        let best = table.closest(NodeId(25), NodeId(0)).unwrap();
        assert_eq!(best.instance.id, NodeId(20));

        // Exact hit.
        let best = table.closest(NodeId(30), NodeId(0)).unwrap();
        assert_eq!(best.instance.id, NodeId(30));

        // Wrap-around: target below every partner selects the highest.
        let best = table.closest(NodeId(5), NodeId(0)).unwrap();
        assert_eq!(best.instance.id, NodeId(30));
    }

    #[test]
    fn closest_excludes_self() {
        let table = PartnerTable::default();
        table.update(&partner(10, 1)).unwrap();
        table.update(&partner(20, 1)).unwrap();

        let best = table.closest(NodeId(10), NodeId(10)).unwrap();
        assert_eq!(best.instance.id, NodeId(20));

        assert!(table.closest(NodeId(10), NodeId(10)).is_some());
        let table = PartnerTable::default();
        table.update(&partner(10, 1)).unwrap();
        assert!(table.closest(NodeId(10), NodeId(10)).is_none());
    }
}
