//! The KRPC runtime: a datagram receive loop, transaction-ID allocator,
//! pending-request correlator, and concurrent query dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bencode::Value;
use crate::error::Error;
use crate::krpc::Message;
use crate::node_id::{NodeId, NodeInfo};

/// Default `send_query` deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_BUF_LEN: usize = 65_535;

pub type MethodArgs = BTreeMap<Bytes, Value>;
pub type MethodOutcome = Result<MethodArgs, Error>;
type MethodFuture = Pin<Box<dyn Future<Output = MethodOutcome> + Send>>;
type MethodFn = Arc<dyn Fn(MethodArgs, NodeId, SocketAddr) -> MethodFuture + Send + Sync>;

/// Maps method names to handlers. Pre-populated with `ping`; applications
/// register additional methods (`find_node`, `get_peers`, `announce_peer`,
/// ...) by calling [`MethodRegistry::register`] without touching the
/// runtime itself.
#[derive(Clone)]
pub struct MethodRegistry {
    methods: HashMap<Bytes, MethodFn>,
}

impl MethodRegistry {
    /// A registry with only the built-in `ping` method.
    pub fn new(own_id: NodeId) -> Self {
        let mut registry = MethodRegistry {
            methods: HashMap::new(),
        };
        registry.register("ping", move |args, _sender, _addr| {
            async move { handle_ping(args, own_id) }
        });
        registry
    }

    /// Registers `name`, replacing any existing handler under that name.
    pub fn register<F, Fut>(&mut self, name: &str, handler: F)
    where
        F: Fn(MethodArgs, NodeId, SocketAddr) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = MethodOutcome> + Send + 'static,
    {
        let key = Bytes::copy_from_slice(name.as_bytes());
        let wrapped: MethodFn =
            Arc::new(move |args, sender, addr| Box::pin(handler(args, sender, addr)) as MethodFuture);
        self.methods.insert(key, wrapped);
    }

    fn get(&self, name: &[u8]) -> Option<MethodFn> {
        self.methods.get(name).cloned()
    }
}

fn handle_ping(args: MethodArgs, own_id: NodeId) -> MethodOutcome {
    let id = args
        .get(&Bytes::from_static(b"id"))
        .ok_or_else(|| Error::Protocol("Invalid 'id' argument".into()))?
        .as_bytes()
        .map_err(|_| Error::Protocol("Invalid 'id' argument".into()))?;
    if id.len() != crate::node_id::NODE_ID_LEN {
        return Err(Error::Protocol("Invalid 'id' argument".into()));
    }

    let mut reply = BTreeMap::new();
    reply.insert(
        Bytes::from_static(b"id"),
        Value::Bytes(Bytes::copy_from_slice(own_id.as_bytes())),
    );
    Ok(reply)
}

type PendingTable = Arc<StdMutex<HashMap<Bytes, oneshot::Sender<Message>>>>;

/// A bound UDP socket plus the KRPC request/response correlator over it.
pub struct Runtime {
    socket: Arc<UdpSocket>,
    own_id: NodeId,
    pending: PendingTable,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Runtime {
    pub async fn bind(addr: SocketAddr, own_id: NodeId) -> Result<Self, Error> {
        Self::bind_with_timeout(addr, own_id, DEFAULT_TIMEOUT).await
    }

    pub async fn bind_with_timeout(
        addr: SocketAddr,
        own_id: NodeId,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Runtime {
            socket: Arc::new(socket),
            own_id,
            pending: Arc::new(StdMutex::new(HashMap::new())),
            timeout,
            cancel: CancellationToken::new(),
        })
    }

    pub fn own_id(&self) -> NodeId {
        self.own_id
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Spawns the receive loop against `registry`, returning its
    /// [`JoinHandle`]. Dropping or awaiting the handle after [`shutdown`]
    /// observes the loop's exit.
    ///
    /// [`shutdown`]: Runtime::shutdown
    pub fn start(&self, registry: MethodRegistry) -> JoinHandle<()> {
        let socket = self.socket.clone();
        let pending = self.pending.clone();
        let own_id = self.own_id;
        let cancel = self.cancel.clone();
        tokio::spawn(receive_loop(socket, pending, registry, own_id, cancel))
    }

    /// Cancels the receive loop spawned by [`start`](Runtime::start). Does
    /// not wait for in-flight query handler tasks.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Sends `method(args)` to `dest` and waits (bounded by the runtime's
    /// timeout) for the correlated response or error.
    pub async fn send_query(
        &self,
        dest: SocketAddr,
        method: &str,
        args: MethodArgs,
    ) -> Result<Message, Error> {
        let (tid, rx) = self.register_pending();
        let query = Message::Query {
            tid: tid.clone(),
            method: Bytes::copy_from_slice(method.as_bytes()),
            args,
        };

        if let Err(e) = self.socket.send_to(&query.encode(), dest).await {
            self.pending.lock().unwrap().remove(&tid);
            return Err(Error::Transport(e));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(_)) => {
                // The sender half was dropped without sending, which only
                // happens if the runtime itself was torn down mid-flight.
                self.pending.lock().unwrap().remove(&tid);
                Err(Error::Server("runtime shut down while request was pending".into()))
            }
            Err(_elapsed) => {
                self.pending.lock().unwrap().remove(&tid);
                Err(Error::Timeout)
            }
        }
    }

    /// Convenience wrapper over `send_query("ping", ...)`.
    pub async fn ping(&self, dest: SocketAddr) -> Result<NodeId, Error> {
        let mut args = BTreeMap::new();
        args.insert(
            Bytes::from_static(b"id"),
            Value::Bytes(Bytes::copy_from_slice(self.own_id.as_bytes())),
        );
        match self.send_query(dest, "ping", args).await? {
            Message::Response { values, .. } => {
                let id = values
                    .get(&Bytes::from_static(b"id"))
                    .ok_or_else(|| Error::Protocol("missing 'id' in pong".into()))?
                    .as_bytes()
                    .map_err(|_| Error::Protocol("invalid 'id' in pong".into()))?;
                Ok(NodeId::try_from(id.as_ref())?)
            }
            Message::Error { code, message, .. } => {
                Err(Error::Protocol(format!("ping rejected ({code}): {message}")))
            }
            Message::Query { .. } => Err(Error::Protocol("peer replied with a query".into())),
        }
    }

    /// Convenience wrapper over `send_query("find_node", ...)`.
    pub async fn find_node(
        &self,
        dest: SocketAddr,
        target: NodeId,
    ) -> Result<Vec<NodeInfo>, Error> {
        let args = crate::methods::encode_find_node_args(self.own_id, target);
        match self.send_query(dest, "find_node", args).await? {
            Message::Response { values, .. } => crate::methods::decode_find_node_reply(&values),
            Message::Error { code, message, .. } => Err(Error::Protocol(format!(
                "find_node rejected ({code}): {message}"
            ))),
            Message::Query { .. } => Err(Error::Protocol("peer replied with a query".into())),
        }
    }

    fn register_pending(&self) -> (Bytes, oneshot::Receiver<Message>) {
        let mut pending = self.pending.lock().unwrap();
        loop {
            let tid = allocate_tid();
            if !pending.contains_key(&tid) {
                let (tx, rx) = oneshot::channel();
                pending.insert(tid.clone(), tx);
                return (tid, rx);
            }
        }
    }
}

/// Two bytes of random letters.
fn allocate_tid() -> Bytes {
    fn alpha() -> u8 {
        let n: u8 = rand::thread_rng().gen_range(0..52);
        if n >= 26 {
            n - 26 + b'a'
        } else {
            n + b'A'
        }
    }
    Bytes::copy_from_slice(&[alpha(), alpha()])
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    pending: PendingTable,
    registry: MethodRegistry,
    own_id: NodeId,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; RECV_BUF_LEN];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("krpc runtime shutting down");
                return;
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, src)) => {
                        handle_datagram(&buf[..len], src, &socket, &pending, &registry, own_id);
                    }
                    Err(e) => {
                        warn!(error = %e, "socket read failed");
                    }
                }
            }
        }
    }
}

fn handle_datagram(
    buf: &[u8],
    src: SocketAddr,
    socket: &Arc<UdpSocket>,
    pending: &PendingTable,
    registry: &MethodRegistry,
    own_id: NodeId,
) {
    let value = match Value::decode(buf) {
        Ok((v, _)) => v,
        Err(e) => {
            warn!(peer = %src, error = %e, "malformed bencode datagram, dropping");
            return;
        }
    };

    let msg = match Message::from_value(&value) {
        Ok(m) => m,
        Err(e) => {
            warn!(peer = %src, error = %e, "malformed krpc message");
            if let Some(tid) = extract_tid(&value) {
                send_best_effort(socket.clone(), src, Message::error_from(tid, &e));
            }
            return;
        }
    };

    match msg {
        Message::Response { .. } | Message::Error { .. } => {
            let tid = msg.tid().clone();
            let sender = pending.lock().unwrap().remove(&tid);
            match sender {
                Some(sender) => {
                    let _ = sender.send(msg);
                }
                None => debug!(peer = %src, "reply for unknown or expired transaction, dropping"),
            }
        }
        Message::Query { tid, method, args } => {
            let registry = registry.clone();
            let socket = socket.clone();
            tokio::spawn(async move {
                dispatch_query(socket, src, tid, method, args, registry, own_id).await;
            });
        }
    }
}

fn extract_tid(value: &Value) -> Option<Bytes> {
    value.as_dict().ok()?.get(b"t".as_slice())?.as_bytes().ok().cloned()
}

async fn dispatch_query(
    socket: Arc<UdpSocket>,
    src: SocketAddr,
    tid: Bytes,
    method: Bytes,
    args: MethodArgs,
    registry: MethodRegistry,
    own_id: NodeId,
) {
    let outcome = match registry.get(&method) {
        None => Err(Error::UnknownMethod(String::from_utf8_lossy(&method).into_owned())),
        Some(handler) => {
            let sender_id = extract_sender_id(&args).unwrap_or(own_id);
            // Isolate the handler in its own task so a panic there becomes
            // an Error 202 reply instead of taking down the receive loop.
            match tokio::spawn(handler(args, sender_id, src)).await {
                Ok(result) => result,
                Err(_join_error) => Err(Error::Server("handler panicked".into())),
            }
        }
    };

    let reply = match outcome {
        Ok(values) => Message::Response { tid, values },
        Err(e) => Message::error_from(tid, &e),
    };

    debug!(peer = %src, method = %String::from_utf8_lossy(&method), "dispatched query");
    send_best_effort(socket, src, reply).await;
}

fn extract_sender_id(args: &MethodArgs) -> Option<NodeId> {
    let id = args.get(&Bytes::from_static(b"id"))?.as_bytes().ok()?;
    NodeId::try_from(id.as_ref()).ok()
}

async fn send_best_effort(socket: Arc<UdpSocket>, dest: SocketAddr, msg: Message) {
    if let Err(e) = socket.send_to(&msg.encode(), dest).await {
        warn!(peer = %dest, error = %e, "failed to send reply");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    async fn bound_runtime(own_id: NodeId) -> Runtime {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        Runtime::bind(addr, own_id).await.unwrap()
    }

    #[tokio::test]
    async fn ping_roundtrip_between_two_runtimes() {
        let a_id = NodeId::from_bytes([1u8; 20]);
        let b_id = NodeId::from_bytes([2u8; 20]);
        let a = bound_runtime(a_id).await;
        let b = bound_runtime(b_id).await;
        let b_addr = b.local_addr().unwrap();

        let _a_handle = a.start(MethodRegistry::new(a_id));
        let _b_handle = b.start(MethodRegistry::new(b_id));

        let replied_id = a.ping(b_addr).await.unwrap();
        assert_eq!(replied_id, b_id);

        a.shutdown();
        b.shutdown();
    }

    #[tokio::test]
    async fn ping_rejects_missing_id() {
        let own_id = NodeId::from_bytes([3u8; 20]);
        let server = bound_runtime(own_id).await;
        let server_addr = server.local_addr().unwrap();
        let _handle = server.start(MethodRegistry::new(own_id));

        let client = bound_runtime(NodeId::from_bytes([4u8; 20])).await;
        let reply = client
            .send_query(server_addr, "ping", BTreeMap::new())
            .await
            .unwrap();
        match reply {
            Message::Error { code, .. } => assert_eq!(code, crate::krpc::ERROR_PROTOCOL),
            other => panic!("expected error reply, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test]
    async fn unknown_method_yields_error_204() {
        let own_id = NodeId::from_bytes([5u8; 20]);
        let server = bound_runtime(own_id).await;
        let server_addr = server.local_addr().unwrap();
        let _handle = server.start(MethodRegistry::new(own_id));

        let client = bound_runtime(NodeId::from_bytes([6u8; 20])).await;
        let reply = client
            .send_query(server_addr, "no_such_method", BTreeMap::new())
            .await
            .unwrap();
        match reply {
            Message::Error { code, .. } => assert_eq!(code, crate::krpc::ERROR_UNKNOWN_METHOD),
            other => panic!("expected error reply, got {other:?}"),
        }
        server.shutdown();
    }

    #[tokio::test(start_paused = true)]
    async fn send_query_times_out_with_no_responder() {
        let own_id = NodeId::from_bytes([7u8; 20]);
        let client = Runtime::bind_with_timeout(
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            own_id,
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        // No responder is bound on this address, so it's correctly silent.
        let unreachable = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 1);
        let call = client.send_query(unreachable, "ping", BTreeMap::new());
        tokio::pin!(call);

        tokio::time::advance(Duration::from_millis(60)).await;
        let result = call.await;
        assert!(matches!(result, Err(Error::Timeout)));
        assert!(client.pending.lock().unwrap().is_empty());
    }
}
