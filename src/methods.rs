//! Extension methods layered on the runtime's built-in `ping`, exercising
//! the [`MethodRegistry`](crate::runtime::MethodRegistry) extension point
//! end to end: `find_node`, backed by the routing table and compact contact
//! encoding.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::bencode::Value;
use crate::error::Error;
use crate::node_id::{NodeId, NodeInfo};
use crate::routing::RoutingTable;
use crate::runtime::{MethodArgs, MethodOutcome, MethodRegistry};

/// Builds the `{id, target}` argument dict for an outbound `find_node`.
pub fn encode_find_node_args(own_id: NodeId, target: NodeId) -> MethodArgs {
    let mut args = BTreeMap::new();
    args.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(own_id.as_bytes())),
    );
    args.insert(
        Bytes::from_static(b"target"),
        Value::Bytes(Bytes::copy_from_slice(target.as_bytes())),
    );
    args
}

/// Decodes the `nodes` field of a `find_node` response into contacts.
pub fn decode_find_node_reply(values: &MethodArgs) -> Result<Vec<NodeInfo>, Error> {
    let nodes = values
        .get(&Bytes::from_static(b"nodes"))
        .ok_or_else(|| Error::Protocol("missing 'nodes' field".into()))?
        .as_bytes()
        .map_err(|_| Error::Protocol("invalid 'nodes' field".into()))?;
    Ok(NodeInfo::decode_compact_list(nodes)?)
}

/// Registers `find_node` on `registry`, answering from `table` as seen from
/// `own_contact`.
pub fn register_find_node(
    registry: &mut MethodRegistry,
    table: Arc<Mutex<RoutingTable>>,
    own_contact: NodeInfo,
) {
    registry.register("find_node", move |args, _sender, _addr| {
        let table = table.clone();
        async move { handle_find_node(args, table, own_contact).await }
    });
}

async fn handle_find_node(
    args: MethodArgs,
    table: Arc<Mutex<RoutingTable>>,
    own_contact: NodeInfo,
) -> MethodOutcome {
    let target_bytes = args
        .get(&Bytes::from_static(b"target"))
        .ok_or_else(|| Error::Protocol("missing 'target' argument".into()))?
        .as_bytes()
        .map_err(|_| Error::Protocol("invalid 'target' argument".into()))?;
    let target = NodeId::try_from(target_bytes.as_ref())
        .map_err(|_| Error::Protocol("invalid 'target' argument".into()))?;

    let (contacts, _exact) = {
        let table = table.lock().await;
        table.find(&target, own_contact)
    };

    let mut reply = BTreeMap::new();
    reply.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(own_contact.id.as_bytes())),
    );
    reply.insert(
        Bytes::from_static(b"nodes"),
        Value::Bytes(NodeInfo::encode_compact_list(&contacts)),
    );
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn find_node_handler_answers_from_table() {
        let own_id = NodeId::from_bytes([0u8; 20]);
        let own_contact = NodeInfo::new(own_id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881));
        let mut table = RoutingTable::new(own_id, 8);
        let peer = NodeInfo::new(
            NodeId::from_bytes([0x12; 20]),
            SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6882),
        );
        table.add(peer);
        let table = Arc::new(Mutex::new(table));

        let args = encode_find_node_args(own_id, peer.id);
        let values = handle_find_node(args, table, own_contact).await.unwrap();
        let nodes = decode_find_node_reply(&values).unwrap();
        assert_eq!(nodes, vec![peer]);
    }

    #[tokio::test]
    async fn find_node_rejects_missing_target() {
        let own_id = NodeId::from_bytes([0u8; 20]);
        let own_contact = NodeInfo::new(own_id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6881));
        let table = Arc::new(Mutex::new(RoutingTable::new(own_id, 8)));
        let result = handle_find_node(BTreeMap::new(), table, own_contact).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
