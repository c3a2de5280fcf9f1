//! Reachability bookkeeping and next-hop tree construction.
//!
//! Each neighbor announces which peers it can reach and at what hop
//! count; the table keeps every announcement and answers "best next hop"
//! queries. On equal hop counts the lower `PeerId` wins, so two peers with
//! the same table always make the same choice.

use std::collections::{BTreeMap, BTreeSet};

use trellis_link::{PeerId, Tree};

use crate::error::MeshError;

/// Best route to one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteEntry {
    pub next_hop: PeerId,
    pub hop_count: u32,
}

/// Per-destination reachability as announced by direct neighbors.
#[derive(Debug)]
pub struct RoutingTable {
    local: PeerId,
    /// destination → (neighbor → hop count through that neighbor).
    reachability: BTreeMap<PeerId, BTreeMap<PeerId, u32>>,
}

impl RoutingTable {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            reachability: BTreeMap::new(),
        }
    }

    pub fn local(&self) -> PeerId {
        self.local
    }

    /// A direct link to `neighbor` came up: it reaches itself in one hop.
    pub fn neighbor_up(&mut self, neighbor: PeerId) {
        self.reachability
            .entry(neighbor)
            .or_default()
            .insert(neighbor, 1);
    }

    /// A direct link went down. Every route through that neighbor is gone.
    /// Returns the destinations that lost their last route.
    pub fn neighbor_down(&mut self, neighbor: PeerId) -> Vec<PeerId> {
        let mut lost = Vec::new();
        self.reachability.retain(|destination, via| {
            via.remove(&neighbor);
            if via.is_empty() {
                lost.push(*destination);
                false
            } else {
                true
            }
        });
        lost
    }

    /// Apply a reachability update from `neighbor`. Hop counts are as seen
    /// by the neighbor; one hop to reach it is added here.
    pub fn apply_update(
        &mut self,
        neighbor: PeerId,
        added: &[(PeerId, u32)],
        removed: &[PeerId],
    ) {
        for (destination, hops) in added {
            if *destination == self.local {
                continue;
            }
            self.reachability
                .entry(*destination)
                .or_default()
                .insert(neighbor, hops.saturating_add(1));
        }
        for destination in removed {
            if let Some(via) = self.reachability.get_mut(destination) {
                via.remove(&neighbor);
                if via.is_empty() {
                    self.reachability.remove(destination);
                }
            }
        }
    }

    /// Best next hop for a destination. Equal hop counts break toward the
    /// lower neighbor identifier.
    pub fn next_hop(&self, destination: PeerId) -> Option<RouteEntry> {
        let via = self.reachability.get(&destination)?;
        via.iter()
            .map(|(neighbor, hops)| (*hops, *neighbor))
            .min()
            .map(|(hop_count, next_hop)| RouteEntry {
                next_hop,
                hop_count,
            })
    }

    /// Destinations currently reachable, with their best hop counts.
    pub fn reachable(&self) -> Vec<(PeerId, u32)> {
        self.reachability
            .keys()
            .filter_map(|d| self.next_hop(*d).map(|entry| (*d, entry.hop_count)))
            .collect()
    }

    /// The reachability vector to announce to `neighbor`: ourselves at hop
    /// zero plus every destination whose best route does not lead back
    /// through `neighbor` (split horizon).
    pub fn vector_for(&self, neighbor: PeerId) -> BTreeMap<PeerId, u32> {
        let mut vector = BTreeMap::from([(self.local, 0)]);
        for (destination, entry) in self
            .reachability
            .keys()
            .filter_map(|d| self.next_hop(*d).map(|e| (*d, e)))
        {
            if destination != neighbor && entry.next_hop != neighbor {
                vector.insert(destination, entry.hop_count);
            }
        }
        vector
    }

    /// Build the next-hop tree rooted at the local peer for a destination
    /// set: each destination hangs under its best next hop, equal prefixes
    /// merged. Deterministic for a given table. Fails if no destination is
    /// routable; unroutable members are returned alongside the tree.
    pub fn build_next_hop_tree(
        &self,
        destinations: &BTreeSet<PeerId>,
    ) -> Result<(Tree<PeerId>, Vec<PeerId>), MeshError> {
        let mut root = Tree::leaf(self.local);
        let mut unroutable = Vec::new();
        let mut routable = 0usize;

        for &destination in destinations {
            if destination == self.local {
                continue;
            }
            match self.next_hop(destination) {
                Some(entry) if entry.next_hop == destination => {
                    root.insert_path(&[destination]);
                    routable += 1;
                }
                Some(entry) => {
                    root.insert_path(&[entry.next_hop, destination]);
                    routable += 1;
                }
                None => unroutable.push(destination),
            }
        }

        if routable == 0 {
            let peer = unroutable
                .first()
                .copied()
                .unwrap_or(self.local);
            return Err(MeshError::NoRouteForDestination { peer });
        }
        Ok((root, unroutable))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(seed: u8) -> PeerId {
        PeerId::from_bytes([seed; 16])
    }

    #[test]
    fn neighbor_up_gives_one_hop_route() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));

        let entry = table.next_hop(peer(2)).unwrap();
        assert_eq!(entry.next_hop, peer(2));
        assert_eq!(entry.hop_count, 1);
    }

    #[test]
    fn update_adds_remote_destinations() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));
        table.apply_update(peer(2), &[(peer(5), 1)], &[]);

        let entry = table.next_hop(peer(5)).unwrap();
        assert_eq!(entry.next_hop, peer(2));
        assert_eq!(entry.hop_count, 2);
    }

    #[test]
    fn equal_hops_break_toward_lower_id() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(3));
        table.neighbor_up(peer(2));
        table.apply_update(peer(3), &[(peer(9), 1)], &[]);
        table.apply_update(peer(2), &[(peer(9), 1)], &[]);

        let entry = table.next_hop(peer(9)).unwrap();
        assert_eq!(entry.next_hop, peer(2), "lower PeerId wins the tie");
    }

    #[test]
    fn shorter_route_beats_lower_id() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));
        table.neighbor_up(peer(3));
        table.apply_update(peer(2), &[(peer(9), 5)], &[]);
        table.apply_update(peer(3), &[(peer(9), 1)], &[]);

        assert_eq!(table.next_hop(peer(9)).unwrap().next_hop, peer(3));
    }

    #[test]
    fn removal_drops_route_and_falls_back() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));
        table.neighbor_up(peer(3));
        table.apply_update(peer(2), &[(peer(9), 1)], &[]);
        table.apply_update(peer(3), &[(peer(9), 3)], &[]);

        table.apply_update(peer(2), &[], &[peer(9)]);
        let entry = table.next_hop(peer(9)).unwrap();
        assert_eq!(entry.next_hop, peer(3));
        assert_eq!(entry.hop_count, 4);

        table.apply_update(peer(3), &[], &[peer(9)]);
        assert!(table.next_hop(peer(9)).is_none());
    }

    #[test]
    fn neighbor_down_reports_lost_destinations() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));
        table.apply_update(peer(2), &[(peer(8), 1), (peer(9), 2)], &[]);

        let mut lost = table.neighbor_down(peer(2));
        lost.sort();
        assert_eq!(lost, vec![peer(2), peer(8), peer(9)]);
        assert!(table.next_hop(peer(8)).is_none());
    }

    #[test]
    fn split_horizon_vector_excludes_routes_via_recipient() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));
        table.neighbor_up(peer(3));
        table.apply_update(peer(2), &[(peer(8), 1)], &[]);

        let vector = table.vector_for(peer(2));
        // Ourselves at hop zero, neighbor 3 at one; nothing learned from 2.
        assert_eq!(vector.get(&peer(1)), Some(&0));
        assert_eq!(vector.get(&peer(3)), Some(&1));
        assert!(!vector.contains_key(&peer(8)));
        assert!(!vector.contains_key(&peer(2)));

        let vector = table.vector_for(peer(3));
        assert_eq!(vector.get(&peer(8)), Some(&2));
    }

    #[test]
    fn next_hop_tree_merges_shared_first_hops() {
        // Routing table {D → via X, E → via X, F → via Y} at peer A.
        let a = peer(1);
        let x = peer(2);
        let y = peer(3);
        let d = peer(4);
        let e = peer(5);
        let f = peer(6);

        let mut table = RoutingTable::new(a);
        table.neighbor_up(x);
        table.neighbor_up(y);
        table.apply_update(x, &[(d, 1), (e, 1)], &[]);
        table.apply_update(y, &[(f, 1)], &[]);

        let (tree, unroutable) = table
            .build_next_hop_tree(&BTreeSet::from([d, e, f]))
            .unwrap();
        assert!(unroutable.is_empty());

        assert_eq!(*tree.value(), a);
        assert_eq!(tree.children().len(), 2);

        let via_x = tree.child(&x).unwrap();
        assert!(via_x.child(&d).is_some());
        assert!(via_x.child(&e).is_some());
        let via_y = tree.child(&y).unwrap();
        assert!(via_y.child(&f).is_some());
    }

    #[test]
    fn direct_destination_hangs_off_root() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));

        let (tree, _) = table
            .build_next_hop_tree(&BTreeSet::from([peer(2)]))
            .unwrap();
        let child = tree.child(&peer(2)).unwrap();
        assert!(child.is_leaf());
    }

    #[test]
    fn unroutable_destinations_reported() {
        let mut table = RoutingTable::new(peer(1));
        table.neighbor_up(peer(2));

        let (tree, unroutable) = table
            .build_next_hop_tree(&BTreeSet::from([peer(2), peer(9)]))
            .unwrap();
        assert!(tree.child(&peer(2)).is_some());
        assert_eq!(unroutable, vec![peer(9)]);
    }

    #[test]
    fn all_unroutable_is_an_error() {
        let table = RoutingTable::new(peer(1));
        let result = table.build_next_hop_tree(&BTreeSet::from([peer(9)]));
        assert!(matches!(
            result,
            Err(MeshError::NoRouteForDestination { .. })
        ));
    }

    #[test]
    fn identical_tables_build_identical_trees() {
        let build = || {
            let mut table = RoutingTable::new(peer(1));
            table.neighbor_up(peer(3));
            table.neighbor_up(peer(2));
            table.apply_update(peer(3), &[(peer(7), 2), (peer(8), 1)], &[]);
            table.apply_update(peer(2), &[(peer(7), 2)], &[]);
            table
                .build_next_hop_tree(&BTreeSet::from([peer(7), peer(8), peer(2)]))
                .unwrap()
                .0
        };
        assert_eq!(build(), build());
    }
}
