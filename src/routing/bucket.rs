//! A single k-bucket: a capacity-bounded, insertion-ordered set of contacts.
//!
//! A plain `Vec`-backed form, not a fixed-size array with in-place
//! compaction: simpler to keep provably correct.

use crate::node_id::{NodeId, NodeInfo};

/// A bounded set of contacts sharing a common distance range from the
/// owning node.
#[derive(Debug, Clone)]
pub struct Bucket {
    capacity: usize,
    entries: Vec<NodeInfo>,
}

impl Bucket {
    pub fn new(capacity: usize) -> Self {
        Bucket {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[NodeInfo] {
        &self.entries
    }

    /// Inserts `contact`. A duplicate `NodeId` is a no-op success. Returns
    /// `false` only when the bucket is full and `contact.id` is new.
    pub fn add(&mut self, contact: NodeInfo) -> bool {
        if self.contains(&contact.id) {
            return true;
        }
        if self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.push(contact);
        true
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.entries.iter().any(|e| &e.id == id)
    }

    /// If `id` matches an entry, returns that single entry with `exact =
    /// true`. Otherwise returns every entry in the bucket with `exact =
    /// false`.
    pub fn lookup(&self, id: &NodeId) -> (Vec<NodeInfo>, bool) {
        if let Some(entry) = self.entries.iter().find(|e| &e.id == id) {
            (vec![*entry], true)
        } else {
            (self.entries.clone(), false)
        }
    }

    /// Partitions entries by bit `bit_pos` into `(zero, one)`, preserving
    /// insertion order within each side.
    pub fn split_at(&self, bit_pos: usize) -> (Bucket, Bucket) {
        assert!(bit_pos <= 159, "split bit position out of range");
        let mut zero = Bucket::new(self.capacity);
        let mut one = Bucket::new(self.capacity);
        for entry in &self.entries {
            if entry.id.bit(bit_pos) {
                one.add(*entry);
            } else {
                zero.add(*entry);
            }
        }
        (zero, one)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    fn contact(id_byte: u8) -> NodeInfo {
        NodeInfo::new(
            NodeId::from_bytes([id_byte; 20]),
            SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 6881),
        )
    }

    #[test]
    fn add_is_idempotent_for_duplicate_id() {
        let mut bucket = Bucket::new(2);
        assert!(bucket.add(contact(1)));
        assert!(bucket.add(contact(1)));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn add_fails_once_full() {
        let mut bucket = Bucket::new(1);
        assert!(bucket.add(contact(1)));
        assert!(!bucket.add(contact(2)));
        assert_eq!(bucket.len(), 1);
    }

    #[test]
    fn lookup_returns_exact_match() {
        let mut bucket = Bucket::new(4);
        bucket.add(contact(1));
        bucket.add(contact(2));
        let (found, exact) = bucket.lookup(&NodeId::from_bytes([2u8; 20]));
        assert!(exact);
        assert_eq!(found, vec![contact(2)]);
    }

    #[test]
    fn lookup_returns_all_entries_when_no_match() {
        let mut bucket = Bucket::new(4);
        bucket.add(contact(1));
        bucket.add(contact(2));
        let (found, exact) = bucket.lookup(&NodeId::from_bytes([9u8; 20]));
        assert!(!exact);
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn split_preserves_insertion_order_per_side() {
        let mut bucket = Bucket::new(4);
        // bit 0 is the MSB of byte 0: 0x00.. has bit 0 clear, 0x80.. has it set.
        bucket.add(contact(0x00));
        bucket.add(contact(0x80));
        bucket.add(contact(0x01));
        bucket.add(contact(0xff));
        let (zero, one) = bucket.split_at(0);
        assert_eq!(zero.entries(), &[contact(0x00), contact(0x01)]);
        assert_eq!(one.entries(), &[contact(0x80), contact(0xff)]);
    }
}
