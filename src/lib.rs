//! A Kademlia-style BitTorrent DHT node: Bencode codec, KRPC message model,
//! routing table, and an async request/response runtime over UDP.
//!
//! The binary crate (`dht-node`) wires these pieces into a long-running
//! node; this library only concerns itself with the protocol and data
//! structures, so it can be embedded, fuzzed, or driven from tests without
//! pulling in a CLI.

pub mod bencode;
pub mod error;
pub mod krpc;
pub mod methods;
pub mod node_id;
pub mod routing;
pub mod runtime;

pub use bencode::Value;
pub use error::{Error, ParseError, Result};
pub use krpc::Message;
pub use node_id::{NodeId, NodeInfo, NODE_ID_LEN};
pub use routing::{Bucket, RoutingTable};
pub use runtime::{MethodArgs, MethodOutcome, MethodRegistry, Runtime};
