use torrent_dht::{
    BootstrapFailure, DhtConfig, DhtError, Envelope, InfoHash, Krpc, MainlineDht, Node, NodeContactInfo,
    NodeId, NodeRegistry, Payload, PeerContactInfo, PeerStore, QueryError, QueryHandler, Request, Response,
    ResponseKind, RoutingTable, Token,
};

use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    net::UdpSocket,
    sync::{mpsc, Mutex},
    time::{timeout, Instant},
};

/// Scripted remote node on a loopback socket. Answers `find_node` and
/// `get_peers` with fixed contacts, and `get_peers` with fixed peers when
/// it has any.
struct MockNode {
    id: NodeId,
    socket: Arc<UdpSocket>,
    announces: Arc<AtomicUsize>,
}

impl MockNode {
    async fn bind() -> MockNode {
        MockNode {
            id: NodeId::random(),
            socket: Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap()),
            announces: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    fn contact(&self) -> NodeContactInfo {
        NodeContactInfo::new(self.id, self.addr())
    }

    fn serve(&self, nodes: Vec<NodeContactInfo>, peers: Vec<PeerContactInfo>) {
        let id = self.id;
        let socket = Arc::clone(&self.socket);
        let announces = Arc::clone(&self.announces);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 2000];
            loop {
                let (len, from) = match socket.recv_from(&mut buf).await {
                    Ok(received) => received,
                    Err(_) => return,
                };
                let envelope = match Envelope::decode(&buf[..len]) {
                    Ok(envelope) => envelope,
                    Err(_) => continue,
                };
                let query = match envelope.payload {
                    Payload::Query(query) => query,
                    _ => continue,
                };
                let kind = match query.request {
                    Request::Ping => ResponseKind::Ping,
                    Request::FindNode { .. } => ResponseKind::FindNode {
                        nodes: nodes.clone(),
                    },
                    Request::GetPeers { .. } => ResponseKind::GetPeers {
                        token: Token::from(id.0[..4].to_vec()),
                        peers: peers.clone(),
                        nodes: nodes.clone(),
                    },
                    Request::AnnouncePeer { .. } => {
                        announces.fetch_add(1, Ordering::SeqCst);
                        ResponseKind::AnnouncePeer
                    }
                };
                let reply = Envelope::new(
                    envelope.transaction_id,
                    Payload::Response(Response { id, kind }.into()),
                );
                let _ = socket.send_to(&reply.encode().unwrap(), from).await;
            }
        });
    }
}

fn loopback_config() -> DhtConfig {
    DhtConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        query_timeout: Duration::from_millis(500),
        ..DhtConfig::default()
    }
}

async fn started_dht() -> Arc<MainlineDht> {
    let dht = MainlineDht::bind(loopback_config()).await.unwrap();
    dht.start();
    dht
}

#[tokio::test]
async fn bootstrap_fills_table_and_schedules_refresh() {
    let mut leaves = Vec::new();
    for _ in 0..5 {
        let leaf = MockNode::bind().await;
        leaf.serve(Vec::new(), Vec::new());
        leaves.push(leaf);
    }
    let router = MockNode::bind().await;
    router.serve(leaves.iter().map(MockNode::contact).collect(), Vec::new());

    let dht = started_dht().await;
    dht.add_bootstrap_node_address(router.addr()).await.unwrap();

    assert!(dht.routing_table_size().await >= 5);
    assert!(dht.scheduled_refreshes().await >= 1);

    // a second bootstrap is a no-op once the table has nodes
    let size = dht.routing_table_size().await;
    dht.add_bootstrap_node_address(router.addr()).await.unwrap();
    assert_eq!(dht.routing_table_size().await, size);
    dht.stop().await;
}

#[tokio::test]
async fn bootstrap_keeps_contacts_that_never_answer() {
    // bound but silent, so every query to them times out
    let mut silent = Vec::new();
    let mut contacts = Vec::new();
    for _ in 0..5 {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        contacts.push(NodeContactInfo::new(NodeId::random(), socket.local_addr().unwrap()));
        silent.push(socket);
    }
    let router = MockNode::bind().await;
    router.serve(contacts.clone(), Vec::new());

    let dht = MainlineDht::bind(DhtConfig {
        query_timeout: Duration::from_millis(200),
        ..loopback_config()
    })
    .await
    .unwrap();
    dht.start();
    dht.add_bootstrap_node_address(router.addr()).await.unwrap();

    assert!(dht.routing_table_size().await >= 5);
    assert!(dht.scheduled_refreshes().await >= 1);
    dht.stop().await;
}

#[tokio::test]
async fn bootstrap_without_new_nodes_fails() {
    let lonely = MockNode::bind().await;
    lonely.serve(Vec::new(), Vec::new());

    let dht = started_dht().await;
    let result = dht.add_bootstrap_node_address(lonely.addr()).await;
    assert!(matches!(
        result,
        Err(DhtError::Bootstrap(BootstrapFailure::NoNodes(addr))) if addr == lonely.addr()
    ));
    assert_eq!(dht.routing_table_size().await, 0);
    dht.stop().await;
}

async fn three_node_network() -> Vec<MockNode> {
    let mut nodes = Vec::new();
    for _ in 0..3 {
        nodes.push(MockNode::bind().await);
    }
    for (i, node) in nodes.iter().enumerate() {
        let others = nodes
            .iter()
            .enumerate()
            .filter(|(j, _)| *j != i)
            .map(|(_, n)| n.contact())
            .collect();
        node.serve(others, Vec::new());
    }
    nodes
}

#[tokio::test]
async fn get_peers_with_no_peers_returns_closest_nodes() {
    let network = three_node_network().await;
    let dht = started_dht().await;
    dht.add_bootstrap_node_address(network[0].addr()).await.unwrap();
    assert_eq!(dht.routing_table_size().await, 3);

    let outcome = dht.find_peers(NodeId::random()).await;
    assert!(outcome.peers.is_empty());
    assert!(!outcome.closest.is_empty());
    for node in &outcome.closest {
        assert!(outcome.tokens.contains_key(&node.contact()));
    }
    dht.stop().await;
}

#[tokio::test]
async fn registered_info_hash_reports_peers_and_announces() {
    let peer = PeerContactInfo::new([10, 0, 0, 1].into(), 51413);
    let seeder = MockNode::bind().await;
    seeder.serve(Vec::new(), vec![peer]);
    let router = MockNode::bind().await;
    router.serve(vec![seeder.contact()], Vec::new());

    let dht = started_dht().await;
    dht.add_bootstrap_node_address(router.addr()).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel::<(InfoHash, Vec<PeerContactInfo>)>();
    dht.add_peer_discovery_listener(Arc::new(tx));
    let info_hash = NodeId::random();
    dht.register_info_hash(info_hash).await;

    let (found_hash, peers) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found_hash, info_hash);
    assert_eq!(peers, vec![peer]);

    let deadline = Instant::now() + Duration::from_secs(5);
    while seeder.announces.load(Ordering::SeqCst) == 0 || router.announces.load(Ordering::SeqCst) == 0 {
        assert!(Instant::now() < deadline, "announce_peer was never sent");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    dht.deregister_info_hash(&info_hash).await;
    dht.stop().await;
}

#[tokio::test(start_paused = true)]
async fn unanswered_query_times_out_and_counts_failure() {
    let krpc = Krpc::bind("127.0.0.1:0", NodeId::random(), Duration::from_secs(3), None)
        .await
        .unwrap();
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let node = Node::new(NodeContactInfo::new(NodeId::random(), silent.local_addr().unwrap()));

    let start = Instant::now();
    let result = node.ping(&krpc).await;
    let elapsed = start.elapsed();

    assert!(matches!(result, Err(QueryError::Timeout)));
    assert!(elapsed >= Duration::from_secs(3) && elapsed < Duration::from_millis(3005));
    assert_eq!(node.failed_queries(), 1);
    assert!(node.last_seen().is_none());
}

fn client_handler(id: NodeId) -> Arc<QueryHandler> {
    Arc::new(QueryHandler::new(
        id,
        Arc::new(Mutex::new(RoutingTable::new(id))),
        Arc::new(NodeRegistry::new(16)),
        PeerStore::new(Duration::from_secs(1800), 16),
        Duration::from_secs(600),
    ))
}

#[tokio::test]
async fn announce_round_trip_against_live_dht() {
    let server = started_dht().await;
    let server_contact = NodeContactInfo::new(server.local_id(), server.local_addr().unwrap());

    let client_id = NodeId::random();
    let client = Krpc::bind("127.0.0.1:0", client_id, Duration::from_secs(2), None)
        .await
        .unwrap();
    client.start_listener(client_handler(client_id));

    let node = Node::new(server_contact);
    let hash: InfoHash = NodeId::random();

    let first = node.get_peers(&client, hash).await.unwrap();
    assert!(first.peers.is_empty());
    assert_eq!(client.external_addr(), Some(client.local_addr().unwrap()));

    // a forged token is silently dropped, so the query times out
    let forged = node
        .announce_peer(&client, hash, Some(6881), Token::from(b"nope".to_vec()))
        .await;
    assert!(matches!(forged, Err(QueryError::Timeout)));

    node.announce_peer(&client, hash, Some(6881), first.token).await.unwrap();

    let second = node.get_peers(&client, hash).await.unwrap();
    assert_eq!(
        second.peers,
        vec![PeerContactInfo::new(client.local_addr().unwrap().ip(), 6881)]
    );
    assert_eq!(server.routing_table_size().await, 1);
    server.stop().await;
}
