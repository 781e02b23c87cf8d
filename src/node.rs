use crate::{
    error::QueryError,
    id::{InfoHash, NodeId, ID_BYTES},
    krpc::Krpc,
    message::{encode_compact_addr, Request, Response, ResponseKind, COMPACT_NODE_LEN},
    storage::PeerContactInfo,
    token::Token,
};

use std::{
    convert::TryInto,
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

/// Consecutive failed queries after which a node is considered bad.
pub const MAX_FAILED_QUERIES: u32 = 3;

/// A node not heard from for this long becomes questionable.
pub const QUESTIONABLE_AFTER: Duration = Duration::from_secs(15 * 60);

/// Identity of a remote node: two contacts are the same node iff both the
/// id and the address match.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeContactInfo {
    pub id: NodeId,
    pub addr: SocketAddr,
}

impl NodeContactInfo {
    pub fn new(id: NodeId, addr: SocketAddr) -> Self {
        Self { id, addr }
    }

    pub fn to_compact(&self) -> Option<[u8; COMPACT_NODE_LEN]> {
        let addr = encode_compact_addr(self.addr)?;
        let mut out = [0u8; COMPACT_NODE_LEN];
        out[..ID_BYTES].copy_from_slice(&self.id.0);
        out[ID_BYTES..].copy_from_slice(&addr);
        Some(out)
    }

    pub fn from_compact(bytes: &[u8]) -> Result<Self, String> {
        if bytes.len() != COMPACT_NODE_LEN {
            return Err(format!(
                "compact node must be {} bytes, got {}",
                COMPACT_NODE_LEN,
                bytes.len()
            ));
        }
        let id: [u8; ID_BYTES] = bytes[..ID_BYTES]
            .try_into()
            .map_err(|_| "bad node id".to_string())?;
        let ip = IpAddr::from([bytes[20], bytes[21], bytes[22], bytes[23]]);
        let port = u16::from_be_bytes([bytes[24], bytes[25]]);

        Ok(Self {
            id: NodeId(id),
            addr: SocketAddr::new(ip, port),
        })
    }
}

impl fmt::Display for NodeContactInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeState {
    Good,
    Questionable,
    Bad,
}

#[derive(Debug, Default)]
struct Health {
    last_seen: Option<Instant>,
    failed_queries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GetPeersReply {
    pub token: Token,
    pub peers: Vec<PeerContactInfo>,
    pub nodes: Vec<NodeContactInfo>,
}

/// A remote participant. Shared between buckets, lookups and the registry;
/// its health is updated in place from whichever task observes an outcome.
#[derive(Debug)]
pub struct Node {
    contact: NodeContactInfo,
    health: Mutex<Health>,
}

impl Node {
    pub fn new(contact: NodeContactInfo) -> Self {
        Self {
            contact,
            health: Mutex::new(Health::default()),
        }
    }

    pub fn contact(&self) -> NodeContactInfo {
        self.contact
    }

    pub fn id(&self) -> NodeId {
        self.contact.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.contact.addr
    }

    pub fn last_seen(&self) -> Option<Instant> {
        self.health.lock().last_seen
    }

    pub fn failed_queries(&self) -> u32 {
        self.health.lock().failed_queries
    }

    pub fn state(&self) -> NodeState {
        self.state_at(Instant::now())
    }

    pub fn state_at(&self, now: Instant) -> NodeState {
        let health = self.health.lock();
        if health.failed_queries >= MAX_FAILED_QUERIES {
            return NodeState::Bad;
        }
        match health.last_seen {
            Some(seen) if now.saturating_duration_since(seen) < QUESTIONABLE_AFTER => NodeState::Good,
            _ => NodeState::Questionable,
        }
    }

    /// The node sent us a query. Refreshes `last_seen` but leaves the failure
    /// counter alone: only an answered query of ours clears it.
    pub fn mark_seen(&self) {
        self.health.lock().last_seen = Some(Instant::now());
    }

    pub fn record_success(&self) {
        let mut health = self.health.lock();
        health.failed_queries = 0;
        health.last_seen = Some(Instant::now());
    }

    pub fn record_failure(&self) {
        let mut health = self.health.lock();
        health.failed_queries = health.failed_queries.saturating_add(1);
    }

    async fn query(&self, krpc: &Krpc, request: Request) -> Result<Response, QueryError> {
        let result = match krpc.send_query(request, self.addr()).await {
            Ok(pending) => pending.response().await,
            Err(e) => Err(e),
        };
        match &result {
            Ok(_) => self.record_success(),
            Err(e) => {
                trace!(node = %self.contact, error = %e, "query failed");
                self.record_failure();
            }
        }
        result
    }

    pub async fn ping(&self, krpc: &Krpc) -> Result<NodeId, QueryError> {
        let response = self.query(krpc, Request::Ping).await?;
        Ok(response.id)
    }

    pub async fn find_node(
        &self,
        krpc: &Krpc,
        target: NodeId,
    ) -> Result<Vec<NodeContactInfo>, QueryError> {
        match self.query(krpc, Request::FindNode { target }).await?.kind {
            ResponseKind::FindNode { nodes } => Ok(nodes),
            _ => Ok(Vec::new()),
        }
    }

    pub async fn get_peers(
        &self,
        krpc: &Krpc,
        info_hash: InfoHash,
    ) -> Result<GetPeersReply, QueryError> {
        match self.query(krpc, Request::GetPeers { info_hash }).await?.kind {
            ResponseKind::GetPeers {
                token,
                peers,
                nodes,
            } => Ok(GetPeersReply {
                token,
                peers,
                nodes,
            }),
            _ => Ok(GetPeersReply {
                token: Token::default(),
                peers: Vec::new(),
                nodes: Vec::new(),
            }),
        }
    }

    /// Announces that we serve `info_hash`. With no explicit port the
    /// receiver takes the UDP source port.
    pub async fn announce_peer(
        &self,
        krpc: &Krpc,
        info_hash: InfoHash,
        port: Option<u16>,
        token: Token,
    ) -> Result<(), QueryError> {
        let request = Request::AnnouncePeer {
            info_hash,
            port: port.unwrap_or(0),
            implied_port: port.is_none(),
            token,
        };
        self.query(krpc, request).await.map(|_| ())
    }
}
