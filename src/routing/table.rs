//! The routing table: a dynamic sequence of buckets indexed by common-prefix
//! length with the owning node's ID, with Kademlia's "split only the last
//! bucket" rule.

use crate::node_id::{NodeId, NodeInfo};
use crate::routing::bucket::Bucket;

/// The maximum number of buckets a 160-bit ID space can ever produce.
const MAX_BUCKETS: usize = crate::node_id::NODE_ID_LEN * 8;

pub struct RoutingTable {
    own_id: NodeId,
    bucket_capacity: usize,
    buckets: Vec<Bucket>,
}

impl RoutingTable {
    pub fn new(own_id: NodeId, bucket_capacity: usize) -> Self {
        RoutingTable {
            own_id,
            bucket_capacity,
            buckets: vec![Bucket::new(bucket_capacity)],
        }
    }

    pub fn own_id(&self) -> &NodeId {
        &self.own_id
    }

    /// Number of buckets currently in the table.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    /// Observes `contact`. Never fails: a full, non-splittable bucket simply
    /// drops the contact.
    pub fn add(&mut self, contact: NodeInfo) {
        if contact.id == self.own_id {
            return;
        }
        self.add_inner(contact);
    }

    fn add_inner(&mut self, contact: NodeInfo) {
        let max_index = self.buckets.len() - 1;
        let prefix_len = self.own_id.common_prefix_len(&contact.id);
        let idx = prefix_len.min(max_index);

        if self.buckets[idx].add(contact) {
            return;
        }

        // Bucket full. Only the last bucket (max_index) may be split.
        if prefix_len < max_index {
            return; // Dropped: can't improve this table.
        }

        if self.buckets.len() >= MAX_BUCKETS {
            return; // Already as deep as the ID space allows.
        }

        let (zero, one) = self.buckets[idx].split_at(idx);
        if self.own_id.bit(idx) {
            self.buckets[idx] = zero;
            self.buckets.push(one);
        } else {
            self.buckets[idx] = one;
            self.buckets.push(zero);
        }

        self.add_inner(contact);
    }

    /// Finds up to `K` contacts closest to `target`. If `target` is `own_id`,
    /// returns the conceptual self-contact at `addr` with `exact = true`.
    pub fn find(&self, target: &NodeId, own_contact: NodeInfo) -> (Vec<NodeInfo>, bool) {
        if target == &self.own_id {
            return (vec![own_contact], true);
        }
        self.find_excluding_self(target)
    }

    fn find_excluding_self(&self, target: &NodeId) -> (Vec<NodeInfo>, bool) {
        let max_index = self.buckets.len() - 1;
        let prefix_len = self.own_id.common_prefix_len(target);
        let start = prefix_len.min(max_index);

        let mut result: Vec<NodeInfo> = Vec::with_capacity(self.bucket_capacity);
        let mut offset = 0usize;

        loop {
            let lo_in_range = offset <= start;
            let hi_in_range = start + offset <= max_index;
            if !lo_in_range && !hi_in_range {
                break;
            }

            if lo_in_range {
                let i = start - offset;
                if let Some(found) = self.visit_bucket(i, target, &mut result) {
                    return (found, true);
                }
            }

            if offset > 0 && hi_in_range {
                let i = start + offset;
                if let Some(found) = self.visit_bucket(i, target, &mut result) {
                    return (found, true);
                }
            }

            if result.len() >= self.bucket_capacity {
                break;
            }
            offset += 1;
        }

        (result, false)
    }

    /// Looks up `target` in bucket `i`, appending any inexact matches into
    /// `result`. Returns `Some` with the exact match if bucket `i` has one.
    fn visit_bucket(
        &self,
        i: usize,
        target: &NodeId,
        result: &mut Vec<NodeInfo>,
    ) -> Option<Vec<NodeInfo>> {
        let (entries, exact) = self.buckets[i].lookup(target);
        if exact {
            return Some(entries);
        }
        let room = self.bucket_capacity - result.len();
        result.extend(entries.into_iter().take(room));
        None
    }
}
