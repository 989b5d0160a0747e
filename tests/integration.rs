//! End-to-end tests exercising the public API as an embedding application
//! would: bind two runtimes over real loopback UDP, wire a routing table
//! behind `find_node`, and drive a bootstrap-style exchange between them.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use kadem::node_id::NodeInfo;
use kadem::routing::RoutingTable;
use kadem::runtime::MethodRegistry;
use kadem::{krpc, methods, Message, NodeId, Runtime};
use tokio::sync::Mutex;

async fn bind(id: NodeId) -> Runtime {
    Runtime::bind(
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
        id,
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn bootstrap_ping_then_find_node_discovers_neighbors() {
    let own_id = NodeId::from_bytes([1u8; 20]);
    let bootstrap_id = NodeId::from_bytes([2u8; 20]);
    let neighbor_id = NodeId::from_bytes([3u8; 20]);

    let own = bind(own_id).await;

    let bootstrap = bind(bootstrap_id).await;
    let bootstrap_addr = match bootstrap.local_addr().unwrap() {
        SocketAddr::V4(a) => a,
        _ => unreachable!(),
    };
    let bootstrap_contact = NodeInfo::new(bootstrap_id, bootstrap_addr);
    let bootstrap_table = Arc::new(Mutex::new(RoutingTable::new(bootstrap_id, 8)));
    bootstrap_table.lock().await.add(NodeInfo::new(
        neighbor_id,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 6881),
    ));
    let mut bootstrap_registry = MethodRegistry::new(bootstrap_id);
    methods::register_find_node(&mut bootstrap_registry, bootstrap_table, bootstrap_contact);
    let _bootstrap_handle = bootstrap.start(bootstrap_registry);

    let replied_id = own.ping(bootstrap_addr.into()).await.unwrap();
    assert_eq!(replied_id, bootstrap_id);

    let nodes = own
        .find_node(bootstrap_addr.into(), own_id)
        .await
        .unwrap();
    assert_eq!(nodes, vec![NodeInfo::new(
        neighbor_id,
        SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 9), 6881),
    )]);

    own.shutdown();
    bootstrap.shutdown();
}

#[tokio::test]
async fn two_nodes_converge_their_routing_tables_via_find_node() {
    let a_id = NodeId::from_bytes([0x10; 20]);
    let b_id = NodeId::from_bytes([0x20; 20]);

    let a = bind(a_id).await;
    let b = bind(b_id).await;
    let a_addr = match a.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };
    let b_addr = match b.local_addr().unwrap() {
        SocketAddr::V4(addr) => addr,
        _ => unreachable!(),
    };

    let a_table = Arc::new(Mutex::new(RoutingTable::new(a_id, 8)));
    let b_table = Arc::new(Mutex::new(RoutingTable::new(b_id, 8)));

    let mut a_registry = MethodRegistry::new(a_id);
    methods::register_find_node(&mut a_registry, a_table.clone(), NodeInfo::new(a_id, a_addr));
    let mut b_registry = MethodRegistry::new(b_id);
    methods::register_find_node(&mut b_registry, b_table.clone(), NodeInfo::new(b_id, b_addr));

    let _a_handle = a.start(a_registry);
    let _b_handle = b.start(b_registry);

    // a discovers b by pinging it directly, then records it.
    let discovered = a.ping(b_addr.into()).await.unwrap();
    assert_eq!(discovered, b_id);
    a_table.lock().await.add(NodeInfo::new(b_id, b_addr));

    // b now knows about a by querying a's table for a's own id - a trivial
    // find_node that exercises the "target == own_id" exact-match path.
    let nodes = b.find_node(a_addr.into(), a_id).await.unwrap();
    assert_eq!(nodes, vec![NodeInfo::new(a_id, a_addr)]);

    a.shutdown();
    b.shutdown();
}

#[tokio::test]
async fn unroutable_destination_times_out_quickly() {
    let own_id = NodeId::from_bytes([9u8; 20]);
    let runtime = Runtime::bind_with_timeout(
        SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 0),
        own_id,
        Duration::from_millis(100),
    )
    .await
    .unwrap();

    // Port 0 on send is never a valid destination; nothing will ever reply.
    let dead_end = SocketAddr::new(Ipv4Addr::LOCALHOST.into(), 1);
    let result = runtime.ping(dead_end).await;
    assert!(matches!(result, Err(kadem::Error::Timeout)));
}

#[test]
fn wire_vector_error_message_matches_reference_encoding() {
    let msg = Message::error(bytes::Bytes::from_static(b"aa"), krpc::ERROR_GENERIC, "An Error");
    assert_eq!(msg.encode(), b"d1:eli201e8:An Errore1:t2:aa1:y1:ee");
    assert_eq!(Message::decode(&msg.encode()).unwrap(), msg);
}
