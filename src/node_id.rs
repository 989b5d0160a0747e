//! 160-bit node identifiers and IPv4 contacts.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::ParseError;

pub const NODE_ID_LEN: usize = 20;
const COMPACT_CONTACT_LEN: usize = NODE_ID_LEN + 6;

/// An opaque 160-bit identifier: a node's own ID, or the ID of a peer.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId([u8; NODE_ID_LEN]);

impl NodeId {
    pub const fn from_bytes(bytes: [u8; NODE_ID_LEN]) -> Self {
        NodeId(bytes)
    }

    /// Draws a fresh random ID. When to mint one and how to persist it is
    /// left to the caller; this is a thin convenience the CLI binary and
    /// tests lean on.
    pub fn random() -> Self {
        use rand::RngCore;
        let mut bytes = [0u8; NODE_ID_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        NodeId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; NODE_ID_LEN] {
        &self.0
    }

    /// Bit at `index`, 0 <= index < 160, where bit 0 is the MSB of byte 0.
    pub fn bit(&self, index: usize) -> bool {
        debug_assert!(index < NODE_ID_LEN * 8);
        let mask = 1u8 << (7 - (index % 8));
        (self.0[index / 8] & mask) != 0
    }

    /// Number of leading bits `self` and `other` agree on, in [0, 160].
    pub fn common_prefix_len(&self, other: &NodeId) -> usize {
        for i in 0..NODE_ID_LEN {
            let xor = self.0[i] ^ other.0[i];
            if xor != 0 {
                return i * 8 + xor.leading_zeros() as usize;
            }
        }
        NODE_ID_LEN * 8
    }

    /// Parses a 40-character lowercase (or uppercase) hex string.
    pub fn from_hex(s: &str) -> Result<Self, ParseError> {
        if s.len() != NODE_ID_LEN * 2 {
            return Err(ParseError::WrongHexLength(s.len()));
        }
        let mut bytes = [0u8; NODE_ID_LEN];
        hex::decode_to_slice(s, &mut bytes).map_err(|_| ParseError::InvalidHex)?;
        Ok(NodeId(bytes))
    }

    /// Renders as 40 lowercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl TryFrom<&[u8]> for NodeId {
    type Error = ParseError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        if bytes.len() != NODE_ID_LEN {
            return Err(ParseError::WrongLength {
                expected: NODE_ID_LEN,
                got: bytes.len(),
            });
        }
        let mut fixed = [0u8; NODE_ID_LEN];
        fixed.copy_from_slice(bytes);
        Ok(NodeId(fixed))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A peer contact: a [`NodeId`] paired with its IPv4 UDP endpoint.
///
/// IPv6 compact encoding isn't supported, so `NodeInfo` only ever holds an
/// IPv4 address.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct NodeInfo {
    pub id: NodeId,
    pub addr: SocketAddrV4,
}

impl NodeInfo {
    pub fn new(id: NodeId, addr: SocketAddrV4) -> Self {
        NodeInfo { id, addr }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(self.addr)
    }

    /// Encodes as the 26-byte compact form: id ‖ ipv4 (BE) ‖ port (BE).
    pub fn encode_compact(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(COMPACT_CONTACT_LEN);
        buf.put_slice(self.id.as_bytes());
        buf.put_slice(&self.addr.ip().octets());
        buf.put_u16(self.addr.port());
        buf.freeze()
    }

    /// Decodes a single 26-byte compact contact. Fails on any other length.
    pub fn decode_compact(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() != COMPACT_CONTACT_LEN {
            return Err(ParseError::WrongLength {
                expected: COMPACT_CONTACT_LEN,
                got: bytes.len(),
            });
        }
        let id = NodeId::try_from(&bytes[..NODE_ID_LEN])?;
        let ip = Ipv4Addr::new(
            bytes[NODE_ID_LEN],
            bytes[NODE_ID_LEN + 1],
            bytes[NODE_ID_LEN + 2],
            bytes[NODE_ID_LEN + 3],
        );
        let port = u16::from_be_bytes([bytes[NODE_ID_LEN + 4], bytes[NODE_ID_LEN + 5]]);
        Ok(NodeInfo::new(id, SocketAddrV4::new(ip, port)))
    }

    /// Decodes a concatenation of 26-byte compact contacts (the `nodes`
    /// field of a `find_node`/`get_peers` response).
    pub fn decode_compact_list(bytes: &[u8]) -> Result<Vec<Self>, ParseError> {
        if bytes.len() % COMPACT_CONTACT_LEN != 0 {
            return Err(ParseError::WrongLength {
                expected: COMPACT_CONTACT_LEN,
                got: bytes.len() % COMPACT_CONTACT_LEN,
            });
        }
        bytes
            .chunks(COMPACT_CONTACT_LEN)
            .map(Self::decode_compact)
            .collect()
    }

    pub fn encode_compact_list(contacts: &[Self]) -> Bytes {
        let mut buf = BytesMut::with_capacity(contacts.len() * COMPACT_CONTACT_LEN);
        for c in contacts {
            buf.put(c.encode_compact());
        }
        buf.freeze()
    }
}
