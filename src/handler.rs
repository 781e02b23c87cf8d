use crate::{
    bucket::K,
    id::{InfoHash, NodeId},
    message::{Query, Request, Response, ResponseKind},
    node::NodeContactInfo,
    registry::NodeRegistry,
    storage::{PeerContactInfo, PeerStore},
    table::RoutingTable,
    token::TokenStore,
};

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Most peers returned in one `get_peers` answer.
pub const MAX_PEERS_PER_RESPONSE: usize = 50;

/// Answers inbound queries from the shared routing table, peer store and
/// token store.
pub struct QueryHandler {
    local_id: NodeId,
    table: Arc<Mutex<RoutingTable>>,
    registry: Arc<NodeRegistry>,
    peers: Mutex<PeerStore>,
    tokens: TokenStore,
}

impl QueryHandler {
    pub fn new(
        local_id: NodeId,
        table: Arc<Mutex<RoutingTable>>,
        registry: Arc<NodeRegistry>,
        peers: PeerStore,
        token_ttl: Duration,
    ) -> Self {
        Self {
            local_id,
            table,
            registry,
            peers: Mutex::new(peers),
            tokens: TokenStore::new(token_ttl),
        }
    }

    /// The response to send back, or `None` when the query must go
    /// unanswered.
    pub async fn handle(&self, query: Query, from: SocketAddr) -> Option<Response> {
        let contact = NodeContactInfo::new(query.sender, from);
        let node = self.registry.get_or_create(contact);
        node.mark_seen();
        self.table.lock().await.insert(node);

        trace!(%contact, method = query.request.method().name(), "inbound query");
        let kind = match query.request {
            Request::Ping => ResponseKind::Ping,
            Request::FindNode { target } => ResponseKind::FindNode {
                nodes: self.closest(&target, &contact).await,
            },
            Request::GetPeers { info_hash } => {
                let token = self.tokens.issue(contact).await;
                let peers = self
                    .peers
                    .lock()
                    .await
                    .peers(&info_hash, MAX_PEERS_PER_RESPONSE);
                let nodes = if peers.is_empty() {
                    self.closest(&info_hash, &contact).await
                } else {
                    Vec::new()
                };
                ResponseKind::GetPeers {
                    token,
                    peers,
                    nodes,
                }
            }
            Request::AnnouncePeer {
                info_hash,
                port,
                implied_port,
                token,
            } => {
                if !self.tokens.verify(&contact, &token).await {
                    debug!(%contact, "announce with invalid token");
                    return None;
                }
                let port = if implied_port { from.port() } else { port };
                let peer = PeerContactInfo::new(from.ip(), port);
                if !self.peers.lock().await.add(info_hash, peer) {
                    debug!(%peer, %info_hash, "peer store full");
                }
                ResponseKind::AnnouncePeer
            }
        };

        Some(Response {
            id: self.local_id,
            kind,
        })
    }

    /// Peers announced to us for `info_hash`.
    pub async fn stored_peers(&self, info_hash: &InfoHash) -> Vec<PeerContactInfo> {
        self.peers.lock().await.peers(info_hash, MAX_PEERS_PER_RESPONSE)
    }

    async fn closest(&self, target: &NodeId, requester: &NodeContactInfo) -> Vec<NodeContactInfo> {
        let table = self.table.lock().await;
        table
            .closest_nodes(target, K + 1)
            .into_iter()
            .map(|node| node.contact())
            .filter(|c| c != requester)
            .take(K)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::Token;

    fn handler(local: NodeId) -> QueryHandler {
        QueryHandler::new(
            local,
            Arc::new(Mutex::new(RoutingTable::new(local))),
            Arc::new(NodeRegistry::new(64)),
            PeerStore::new(Duration::from_secs(1800), 100),
            Duration::from_secs(600),
        )
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn query(sender: NodeId, request: Request) -> Query {
        Query { sender, request }
    }

    async fn token_for(handler: &QueryHandler, sender: NodeId, from: SocketAddr, hash: InfoHash) -> Token {
        match handler
            .handle(query(sender, Request::GetPeers { info_hash: hash }), from)
            .await
            .map(|r| r.kind)
        {
            Some(ResponseKind::GetPeers { token, .. }) => token,
            other => panic!("unexpected {:?}", other),
        }
    }

    fn announce(hash: InfoHash, token: Token) -> Request {
        Request::AnnouncePeer {
            info_hash: hash,
            port: 51413,
            implied_port: false,
            token,
        }
    }

    #[tokio::test]
    async fn ping_adds_sender_to_table() {
        let local = NodeId([1u8; 20]);
        let handler = handler(local);
        let response = handler.handle(query(NodeId([2u8; 20]), Request::Ping), addr(2000)).await;

        assert_eq!(
            response,
            Some(Response {
                id: local,
                kind: ResponseKind::Ping
            })
        );
        let table = handler.table.lock().await;
        assert!(table.contains(&NodeContactInfo::new(NodeId([2u8; 20]), addr(2000))));
    }

    #[tokio::test]
    async fn find_node_returns_closest_without_requester() {
        let handler = handler(NodeId([0u8; 20]));
        for i in 1..=12u8 {
            handler.handle(query(NodeId([i; 20]), Request::Ping), addr(3000 + i as u16)).await;
        }

        let target = NodeId([3u8; 20]);
        let response = handler
            .handle(query(NodeId([3u8; 20]), Request::FindNode { target }), addr(3003))
            .await;
        let nodes = match response.map(|r| r.kind) {
            Some(ResponseKind::FindNode { nodes }) => nodes,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(nodes.len(), K);
        assert!(nodes.iter().all(|c| c.id != NodeId([3u8; 20])));
        assert_eq!(nodes[0].id, NodeId([2u8; 20]));
    }

    #[tokio::test]
    async fn announce_requires_matching_token() {
        let handler = handler(NodeId([1u8; 20]));
        let sender = NodeId([9u8; 20]);
        let hash = NodeId([0xaa; 20]);
        let token = token_for(&handler, sender, addr(4000), hash).await;

        // wrong token, and right token from another address, are ignored
        let forged = handler
            .handle(query(sender, announce(hash, Token::from(b"forged".to_vec()))), addr(4000))
            .await;
        assert!(forged.is_none());
        let elsewhere = handler
            .handle(query(sender, announce(hash, token.clone())), addr(4001))
            .await;
        assert!(elsewhere.is_none());
        assert!(handler.stored_peers(&hash).await.is_empty());

        let ok = handler.handle(query(sender, announce(hash, token)), addr(4000)).await;
        assert_eq!(ok.map(|r| r.kind), Some(ResponseKind::AnnouncePeer));
        assert_eq!(
            handler.stored_peers(&hash).await,
            vec![PeerContactInfo::new(addr(4000).ip(), 51413)]
        );

        // announced peers are served instead of nodes
        let other = NodeId([8u8; 20]);
        match handler
            .handle(query(other, Request::GetPeers { info_hash: hash }), addr(4002))
            .await
            .map(|r| r.kind)
        {
            Some(ResponseKind::GetPeers { peers, nodes, .. }) => {
                assert_eq!(peers.len(), 1);
                assert!(nodes.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_token_rejected() {
        let handler = handler(NodeId([1u8; 20]));
        let sender = NodeId([9u8; 20]);
        let hash = NodeId([0xbb; 20]);
        let token = token_for(&handler, sender, addr(5000), hash).await;

        tokio::time::sleep(Duration::from_secs(601)).await;
        let late = handler.handle(query(sender, announce(hash, token)), addr(5000)).await;
        assert!(late.is_none());
    }

    #[tokio::test]
    async fn implied_port_uses_source_port() {
        let handler = handler(NodeId([1u8; 20]));
        let sender = NodeId([7u8; 20]);
        let hash = NodeId([0xcc; 20]);
        let token = token_for(&handler, sender, addr(6000), hash).await;

        let request = Request::AnnouncePeer {
            info_hash: hash,
            port: 0,
            implied_port: true,
            token,
        };
        assert!(handler.handle(query(sender, request), addr(6000)).await.is_some());
        assert_eq!(
            handler.stored_peers(&hash).await,
            vec![PeerContactInfo::new(addr(6000).ip(), 6000)]
        );
    }
}
