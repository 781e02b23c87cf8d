use crate::{
    error::{DecodeError, QueryError},
    handler::QueryHandler,
    id::NodeId,
    message::{Envelope, Method, Payload, Query, RawResponse, RemoteError, Request, Response},
    model::ErrorCode,
};

use std::{
    collections::HashMap,
    convert::TryInto,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

use tokio::{
    net::{ToSocketAddrs, UdpSocket},
    sync::{oneshot, Mutex, OnceCell},
    task::JoinHandle,
};
use tracing::{debug, error, trace};

const RECV_BUF: usize = 2000;
pub const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

type TransactionId = [u8; 2];
type Transactions = Mutex<HashMap<TransactionId, Outstanding>>;

struct Outstanding {
    method: Method,
    addr: SocketAddr,
    done: oneshot::Sender<Result<Response, QueryError>>,
    timer: JoinHandle<()>,
}

/// KRPC over one UDP socket. Every outbound query is tracked by its
/// transaction id until exactly one of response, error or timeout removes
/// it and completes the caller's [`PendingQuery`].
pub struct Krpc {
    id: NodeId,
    // emptied by `stop`, which closes the socket
    socket: parking_lot::Mutex<Option<Arc<UdpSocket>>>,
    tx: Arc<Transactions>,
    timeout: Duration,
    version: Option<Vec<u8>>,
    external: OnceCell<SocketAddr>,
    listener: parking_lot::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Krpc {
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        id: NodeId,
        timeout: Duration,
        version: Option<Vec<u8>>,
    ) -> io::Result<Arc<Self>> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Arc::new(Self {
            id,
            socket: parking_lot::Mutex::new(Some(Arc::new(socket))),
            tx: Arc::new(Mutex::new(HashMap::new())),
            timeout,
            version,
            external: OnceCell::new(),
            listener: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        match &*self.socket.lock() {
            Some(socket) => socket.local_addr(),
            None => Err(io::Error::new(io::ErrorKind::NotConnected, "transport stopped")),
        }
    }

    fn socket(&self) -> Result<Arc<UdpSocket>, QueryError> {
        self.socket.lock().clone().ok_or(QueryError::Closed)
    }

    /// Our address as first reported back by a remote in a response `ip`.
    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.external.get().copied()
    }

    pub fn is_running(&self) -> bool {
        self.listener.lock().is_some() && !self.closed.load(Ordering::SeqCst)
    }

    /// Spawns the receive loop. Does nothing once the transport is stopped.
    pub fn start_listener(self: &Arc<Self>, handler: Arc<QueryHandler>) {
        let socket = match self.socket() {
            Ok(socket) => socket,
            Err(_) => {
                debug!("transport stopped, not starting receive loop");
                return;
            }
        };
        self.closed.store(false, Ordering::SeqCst);
        let krpc = Arc::clone(self);
        let task = tokio::spawn(async move {
            if let Err(e) = krpc.listen(socket, handler).await {
                error!(error = %e, "receive loop terminated");
            }
            krpc.closed.store(true, Ordering::SeqCst);
        });
        if let Some(old) = self.listener.lock().replace(task) {
            old.abort();
        }
    }

    /// Stops the receive loop and closes the socket. Queries already in
    /// flight resolve by timeout.
    pub async fn stop(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.socket.lock().take();
        let task = self.listener.lock().take();
        if let Some(task) = task {
            task.abort();
            // the loop holds the socket until it is dropped
            let _ = task.await;
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.tx.lock().await.len()
    }

    pub async fn send_query(
        &self,
        request: Request,
        addr: SocketAddr,
    ) -> Result<PendingQuery, QueryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueryError::Closed);
        }

        let method = request.method();
        let (done, rx) = oneshot::channel();
        let txid = {
            let mut tx = self.tx.lock().await;
            // check for collisions
            let mut txid = rand::random::<TransactionId>();
            while tx.contains_key(&txid) {
                txid = rand::random();
            }
            let timer = tokio::spawn(expire(Arc::downgrade(&self.tx), txid, self.timeout));
            tx.insert(
                txid,
                Outstanding {
                    method,
                    addr,
                    done,
                    timer,
                },
            );
            txid
        };

        let envelope = self.envelope(
            txid.to_vec(),
            Payload::Query(Query {
                sender: self.id,
                request,
            }),
        );
        trace!(%addr, method = method.name(), txid = %hex::encode(txid), "sending query");
        if let Err(e) = self.send(&envelope, addr).await {
            if let Some(outstanding) = self.tx.lock().await.remove(&txid) {
                outstanding.timer.abort();
            }
            return Err(e);
        }

        Ok(PendingQuery {
            transaction_id: txid,
            rx,
            tx: Arc::downgrade(&self.tx),
        })
    }

    pub async fn query(&self, request: Request, addr: SocketAddr) -> Result<Response, QueryError> {
        self.send_query(request, addr).await?.response().await
    }

    /// Answers the query `transaction_id`, telling the requester the address
    /// we saw it at.
    pub async fn send_response(
        &self,
        transaction_id: &[u8],
        response: Response,
        to: SocketAddr,
    ) -> Result<(), QueryError> {
        let mut envelope = self.envelope(transaction_id.to_vec(), Payload::Response(response.into()));
        envelope.ip = Some(to);
        self.send(&envelope, to).await
    }

    pub async fn send_error(
        &self,
        transaction_id: &[u8],
        error: RemoteError,
        to: SocketAddr,
    ) -> Result<(), QueryError> {
        let envelope = self.envelope(transaction_id.to_vec(), Payload::Error(error));
        self.send(&envelope, to).await
    }

    fn envelope(&self, transaction_id: Vec<u8>, payload: Payload) -> Envelope {
        let mut envelope = Envelope::new(transaction_id, payload);
        envelope.version = self.version.clone();
        envelope
    }

    async fn send(&self, envelope: &Envelope, to: SocketAddr) -> Result<(), QueryError> {
        let bytes = envelope.encode()?;
        self.socket()?.send_to(&bytes, to).await?;
        Ok(())
    }

    async fn listen(self: &Arc<Self>, socket: Arc<UdpSocket>, handler: Arc<QueryHandler>) -> io::Result<()> {
        let mut buf = vec![0u8; RECV_BUF];
        loop {
            let (len, addr) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                // ICMP unreachable for an earlier send, reported on the next read
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => continue,
                Err(e) => return Err(e),
            };
            self.dispatch(&buf[..len], addr, &handler).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, bytes: &[u8], from: SocketAddr, handler: &Arc<QueryHandler>) {
        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(DecodeError::UnknownMethod {
                transaction_id,
                method,
            }) => {
                debug!(%from, %method, "unknown method");
                let error = RemoteError::new(ErrorCode::MethodUnknown, "Method Unknown");
                if let Err(e) = self.send_error(&transaction_id, error, from).await {
                    debug!(%from, error = %e, "failed to send error");
                }
                return;
            }
            Err(e) => {
                debug!(%from, error = %e, "dropping malformed datagram");
                return;
            }
        };

        match envelope.payload {
            Payload::Query(query) => {
                let krpc = Arc::clone(self);
                let handler = Arc::clone(handler);
                let txid = envelope.transaction_id;
                tokio::spawn(async move {
                    if let Some(response) = handler.handle(query, from).await {
                        if let Err(e) = krpc.send_response(&txid, response, from).await {
                            debug!(%from, error = %e, "failed to send response");
                        }
                    }
                });
            }
            Payload::Response(raw) => {
                if let Some(ip) = envelope.ip {
                    if self.external.set(ip).is_ok() {
                        debug!(external = %ip, "learned external address");
                    }
                }
                self.complete(&envelope.transaction_id, from, Ok(raw)).await;
            }
            Payload::Error(remote) => {
                self.complete(&envelope.transaction_id, from, Err(remote)).await;
            }
        }
    }

    async fn complete(
        &self,
        transaction_id: &[u8],
        from: SocketAddr,
        result: Result<RawResponse, RemoteError>,
    ) {
        let txid: Result<TransactionId, _> = transaction_id.try_into();
        let outstanding = match txid {
            Ok(txid) => {
                let mut tx = self.tx.lock().await;
                match tx.get(&txid) {
                    Some(o) if o.addr == from => tx.remove(&txid),
                    _ => None,
                }
            }
            Err(_) => None,
        };
        let outstanding = match outstanding {
            Some(outstanding) => outstanding,
            None => {
                debug!(%from, txid = %hex::encode(transaction_id), "no outstanding query");
                return;
            }
        };
        outstanding.timer.abort();

        let result = match result {
            Ok(raw) => raw.typed(outstanding.method).map_err(QueryError::from),
            Err(RemoteError { code, message }) => Err(QueryError::Remote { code, message }),
        };
        let _ = outstanding.done.send(result);
    }
}

async fn expire(tx: Weak<Transactions>, txid: TransactionId, timeout: Duration) {
    tokio::time::sleep(timeout).await;
    let tx = match tx.upgrade() {
        Some(tx) => tx,
        None => return,
    };
    let outstanding = tx.lock().await.remove(&txid);
    if let Some(outstanding) = outstanding {
        trace!(addr = %outstanding.addr, txid = %hex::encode(txid), "query timed out");
        let _ = outstanding.done.send(Err(QueryError::Timeout));
    }
}

/// Handle to one outbound query.
pub struct PendingQuery {
    transaction_id: TransactionId,
    rx: oneshot::Receiver<Result<Response, QueryError>>,
    tx: Weak<Transactions>,
}

impl PendingQuery {
    pub fn transaction_id(&self) -> &[u8] {
        &self.transaction_id
    }

    pub async fn response(self) -> Result<Response, QueryError> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Closed),
        }
    }

    /// Forgets the query; a late response is dropped as unmatched.
    pub async fn cancel(self) {
        if let Some(tx) = self.tx.upgrade() {
            if let Some(outstanding) = tx.lock().await.remove(&self.transaction_id) {
                outstanding.timer.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        message::ResponseKind, node::NodeContactInfo, registry::NodeRegistry, storage::PeerStore,
        table::RoutingTable,
    };

    use tokio::time::Instant;

    fn handler(id: NodeId) -> Arc<QueryHandler> {
        Arc::new(QueryHandler::new(
            id,
            Arc::new(Mutex::new(RoutingTable::new(id))),
            Arc::new(NodeRegistry::new(64)),
            PeerStore::new(Duration::from_secs(1800), 100),
            Duration::from_secs(600),
        ))
    }

    async fn krpc(id: NodeId) -> Arc<Krpc> {
        Krpc::bind("127.0.0.1:0", id, QUERY_TIMEOUT, Some(b"TD01".to_vec()))
            .await
            .unwrap()
    }

    async fn recv_envelope(socket: &UdpSocket) -> (Envelope, SocketAddr) {
        let mut buf = vec![0u8; RECV_BUF];
        let (len, from) = socket.recv_from(&mut buf).await.unwrap();
        (Envelope::decode(&buf[..len]).unwrap(), from)
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out() {
        let krpc = krpc(NodeId::random()).await;
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let start = Instant::now();
        let result = krpc.query(Request::Ping, silent.local_addr().unwrap()).await;
        assert!(matches!(result, Err(QueryError::Timeout)));
        let elapsed = start.elapsed();
        assert!(elapsed >= QUERY_TIMEOUT && elapsed < QUERY_TIMEOUT + Duration::from_millis(5));
        assert_eq!(krpc.outstanding().await, 0);
    }

    #[tokio::test]
    async fn response_matched_by_transaction_id() {
        let krpc = krpc(NodeId([1u8; 20])).await;
        krpc.start_listener(handler(krpc.id()));
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let remote_addr = remote.local_addr().unwrap();

        let pending = krpc
            .send_query(Request::FindNode { target: NodeId([3u8; 20]) }, remote_addr)
            .await
            .unwrap();
        let (query, from) = recv_envelope(&remote).await;
        assert_eq!(query.transaction_id.as_slice(), pending.transaction_id());
        assert_eq!(query.version.as_deref(), Some(&b"TD01"[..]));

        // an unrelated transaction id is dropped, the real one completes
        let contact = NodeContactInfo::new(NodeId([4u8; 20]), SocketAddr::from(([10, 0, 0, 4], 4000)));
        let answer = Response {
            id: NodeId([2u8; 20]),
            kind: ResponseKind::FindNode { nodes: vec![contact] },
        };
        for txid in &[vec![0xff, 0xff, 0xff], query.transaction_id.clone()] {
            let mut envelope = Envelope::new(txid.clone(), Payload::Response(answer.clone().into()));
            envelope.ip = Some(from);
            remote.send_to(&envelope.encode().unwrap(), from).await.unwrap();
        }

        assert_eq!(pending.response().await.unwrap(), answer);
        assert_eq!(krpc.external_addr(), Some(from));
        assert_eq!(krpc.outstanding().await, 0);
    }

    #[tokio::test]
    async fn error_reply_fails_query() {
        let krpc = krpc(NodeId([1u8; 20])).await;
        krpc.start_listener(handler(krpc.id()));
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let pending = krpc
            .send_query(Request::Ping, remote.local_addr().unwrap())
            .await
            .unwrap();
        let (query, from) = recv_envelope(&remote).await;
        let reply = Envelope::new(
            query.transaction_id,
            Payload::Error(RemoteError::new(ErrorCode::ServerError, "busy")),
        );
        remote.send_to(&reply.encode().unwrap(), from).await.unwrap();

        match pending.response().await {
            Err(QueryError::Remote { code, message }) => {
                assert_eq!(code, 202);
                assert_eq!(message, "busy");
            }
            other => panic!("unexpected {:?}", other.map(|r| r.id)),
        }
    }

    #[tokio::test]
    async fn malformed_datagram_does_not_stop_loop() {
        let krpc = krpc(NodeId([1u8; 20])).await;
        krpc.start_listener(handler(krpc.id()));
        let addr = krpc.local_addr().unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        remote.send_to(b"d1:y1:q", addr).await.unwrap();
        remote.send_to(b"garbage", addr).await.unwrap();

        let ping = Envelope::new(
            vec![9, 9],
            Payload::Query(Query {
                sender: NodeId([5u8; 20]),
                request: Request::Ping,
            }),
        );
        remote.send_to(&ping.encode().unwrap(), addr).await.unwrap();

        let (reply, _) = recv_envelope(&remote).await;
        assert_eq!(reply.transaction_id, vec![9, 9]);
        assert_eq!(reply.ip, Some(remote.local_addr().unwrap()));
        match reply.payload {
            Payload::Response(raw) => assert_eq!(raw.id, NodeId([1u8; 20])),
            other => panic!("unexpected {:?}", other),
        }
        assert!(krpc.is_running());
    }

    #[tokio::test]
    async fn unknown_method_answered_with_204() {
        let krpc = krpc(NodeId([1u8; 20])).await;
        krpc.start_listener(handler(krpc.id()));
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        // d1:ad2:id20:...e1:q4:vote1:t2:ab1:y1:qe
        let mut bytes = b"d1:ad2:id20:".to_vec();
        bytes.extend_from_slice(&[7u8; 20]);
        bytes.extend_from_slice(b"e1:q4:vote1:t2:ab1:y1:qe");
        remote.send_to(&bytes, krpc.local_addr().unwrap()).await.unwrap();

        let (reply, _) = recv_envelope(&remote).await;
        assert_eq!(reply.transaction_id, b"ab".to_vec());
        assert_eq!(
            reply.payload,
            Payload::Error(RemoteError {
                code: 204,
                message: "Method Unknown".into()
            })
        );
    }

    #[tokio::test]
    async fn stopped_transport_rejects_queries() {
        let krpc = krpc(NodeId::random()).await;
        krpc.start_listener(handler(krpc.id()));
        assert!(krpc.is_running());
        krpc.stop().await;
        assert!(!krpc.is_running());
        let target = SocketAddr::from(([127, 0, 0, 1], 9));
        assert!(matches!(
            krpc.send_query(Request::Ping, target).await,
            Err(QueryError::Closed)
        ));
    }

    #[tokio::test]
    async fn stop_closes_socket() {
        let krpc = krpc(NodeId::random()).await;
        krpc.start_listener(handler(krpc.id()));
        let addr = krpc.local_addr().unwrap();

        krpc.stop().await;
        assert!(krpc.local_addr().is_err());
        let rebound = UdpSocket::bind(addr).await.unwrap();
        assert_eq!(rebound.local_addr().unwrap(), addr);

        // a stopped transport stays stopped
        krpc.start_listener(handler(krpc.id()));
        assert!(!krpc.is_running());
        assert!(matches!(
            krpc.send_response(&[1, 2], Response { id: krpc.id(), kind: ResponseKind::Ping }, addr)
                .await,
            Err(QueryError::Closed)
        ));
    }

    #[tokio::test]
    async fn cancelled_query_drops_late_response() {
        let krpc = krpc(NodeId([1u8; 20])).await;
        krpc.start_listener(handler(krpc.id()));
        let addr = krpc.local_addr().unwrap();
        let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let pending = krpc
            .send_query(Request::Ping, remote.local_addr().unwrap())
            .await
            .unwrap();
        let (query, from) = recv_envelope(&remote).await;
        assert_eq!(krpc.outstanding().await, 1);
        pending.cancel().await;
        assert_eq!(krpc.outstanding().await, 0);

        let late = Envelope::new(
            query.transaction_id,
            Payload::Response(
                Response {
                    id: NodeId([2u8; 20]),
                    kind: ResponseKind::Ping,
                }
                .into(),
            ),
        );
        remote.send_to(&late.encode().unwrap(), from).await.unwrap();

        // the loop keeps serving after dropping the unmatched answer
        let ping = Envelope::new(
            vec![7, 7],
            Payload::Query(Query {
                sender: NodeId([5u8; 20]),
                request: Request::Ping,
            }),
        );
        remote.send_to(&ping.encode().unwrap(), addr).await.unwrap();
        let (reply, _) = recv_envelope(&remote).await;
        assert_eq!(reply.transaction_id, vec![7, 7]);
        assert!(krpc.is_running());
        assert_eq!(krpc.outstanding().await, 0);
    }
}
