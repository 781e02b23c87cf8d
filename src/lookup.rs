//! Iterative Kademlia lookup.
//!
//! Rounds are strictly sequential: a round's queries all settle before the
//! next round is picked. The round width is [`ALPHA`] while the best
//! distance keeps shrinking and widens to [`K`] once a round stalls.

use crate::{
    bucket::K,
    error::QueryError,
    id::{Distance, InfoHash, NodeId},
    krpc::Krpc,
    node::{GetPeersReply, Node, NodeContactInfo, NodeState},
    registry::NodeRegistry,
    storage::PeerContactInfo,
    table::RoutingTable,
    token::Token,
};

use std::{
    cmp::{Ordering, Reverse},
    collections::{BinaryHeap, HashMap, HashSet},
    sync::Arc,
};

use futures::future::{join_all, BoxFuture, FutureExt};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Queries per round while the lookup is making progress.
pub const ALPHA: usize = 3;

/// The per-method half of a lookup: how to query a node and what to make of
/// its answer.
pub trait LookupQuery {
    type Response: Send + 'static;
    type Output;

    fn query(&self, node: Arc<Node>) -> BoxFuture<'static, Result<Self::Response, QueryError>>;

    /// Consumes one answer and returns the next-hop candidates it named.
    fn handle_response(&mut self, node: &Arc<Node>, response: Self::Response) -> Vec<NodeContactInfo>;

    fn finish(self, closest: Vec<Arc<Node>>) -> Self::Output;
}

struct Candidate {
    distance: Distance,
    node: Arc<Node>,
}

impl Candidate {
    fn key(&self) -> (Distance, NodeContactInfo) {
        (self.distance, self.node.contact())
    }
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

pub struct Lookup<Q: LookupQuery> {
    target: NodeId,
    local_id: NodeId,
    strategy: Q,
    registry: Arc<NodeRegistry>,
    table: Option<Arc<Mutex<RoutingTable>>>,
    seen: HashSet<NodeId>,
    queried: HashSet<NodeContactInfo>,
    responded: HashSet<NodeContactInfo>,
    discarded: HashSet<NodeContactInfo>,
    // max-heap, farthest on top so it is evicted first
    closest: BinaryHeap<Candidate>,
    backup: BinaryHeap<Reverse<Candidate>>,
    min_distance: Distance,
}

impl<Q: LookupQuery> Lookup<Q> {
    pub fn new(target: NodeId, local_id: NodeId, strategy: Q, registry: Arc<NodeRegistry>) -> Self {
        Self {
            target,
            local_id,
            strategy,
            registry,
            table: None,
            seen: HashSet::new(),
            queried: HashSet::new(),
            responded: HashSet::new(),
            discarded: HashSet::new(),
            closest: BinaryHeap::new(),
            backup: BinaryHeap::new(),
            min_distance: Distance::MAX,
        }
    }

    /// Responders and the contacts they name are added to `table`, and
    /// failed nodes are reported to it.
    pub fn with_table(mut self, table: Arc<Mutex<RoutingTable>>) -> Self {
        self.table = Some(table);
        self
    }

    pub fn seed<I: IntoIterator<Item = Arc<Node>>>(mut self, nodes: I) -> Self {
        for node in nodes {
            self.offer(node);
        }
        self
    }

    pub async fn run(self) -> Q::Output {
        self.run_traced().await.0
    }

    /// Like [`run`](Self::run), also returning the size of every round.
    pub async fn run_traced(mut self) -> (Q::Output, Vec<usize>) {
        let mut rounds = Vec::new();
        let mut improved = true;

        loop {
            let width = if improved { ALPHA } else { K };
            let batch = self.next_batch(width);
            if batch.is_empty() {
                break;
            }
            rounds.push(batch.len());
            for node in &batch {
                self.queried.insert(node.contact());
            }

            let strategy = &self.strategy;
            let results = join_all(batch.iter().map(|node| strategy.query(Arc::clone(node)))).await;

            let before = self.min_distance;
            let mut learned = Vec::new();
            let mut responders = Vec::new();
            let mut failed = Vec::new();
            for (node, result) in batch.into_iter().zip(results) {
                match result {
                    Ok(response) => {
                        self.responded.insert(node.contact());
                        for contact in self.strategy.handle_response(&node, response) {
                            let distance = self.target.distance(&contact.id);
                            let candidate = self.registry.get_or_create(contact);
                            if self.offer(Arc::clone(&candidate)) {
                                if distance < self.min_distance {
                                    self.min_distance = distance;
                                }
                                learned.push(candidate);
                            }
                        }
                        responders.push(node);
                    }
                    Err(e) => {
                        trace!(node = %node.contact(), error = %e, "lookup query failed");
                        self.discard(&node);
                        failed.push(node);
                    }
                }
            }
            if !failed.is_empty() {
                self.min_distance = self
                    .closest
                    .iter()
                    .map(|c| c.distance)
                    .min()
                    .unwrap_or(Distance::MAX);
            }
            improved = self.min_distance < before;

            self.update_table(learned, responders, failed).await;
        }

        debug!(
            target = %self.target,
            rounds = rounds.len(),
            responded = self.responded.len(),
            "lookup finished"
        );
        let closest = self.closest_sorted();
        (self.strategy.finish(closest), rounds)
    }

    /// Adds a node never seen before by this lookup to `closest`, pushing the
    /// farthest member out to `backup` once there are more than `K`.
    fn offer(&mut self, node: Arc<Node>) -> bool {
        let id = node.id();
        if id == self.local_id || !self.seen.insert(id) {
            return false;
        }
        self.closest.push(Candidate {
            distance: self.target.distance(&id),
            node,
        });
        if self.closest.len() > K {
            if let Some(farthest) = self.closest.pop() {
                self.backup.push(Reverse(farthest));
            }
        }
        true
    }

    fn discard(&mut self, node: &Arc<Node>) {
        let contact = node.contact();
        self.discarded.insert(contact);

        let closest = std::mem::take(&mut self.closest).into_vec();
        self.closest = closest
            .into_iter()
            .filter(|c| c.node.contact() != contact)
            .collect();

        while self.closest.len() < K {
            match self.backup.pop() {
                Some(Reverse(candidate)) if self.discarded.contains(&candidate.node.contact()) => {}
                Some(Reverse(candidate)) => self.closest.push(candidate),
                None => break,
            }
        }
    }

    fn next_batch(&self, width: usize) -> Vec<Arc<Node>> {
        let mut pending: Vec<&Candidate> = self
            .closest
            .iter()
            .filter(|c| !self.queried.contains(&c.node.contact()))
            .collect();
        pending.sort();
        pending
            .into_iter()
            .take(width)
            .map(|c| Arc::clone(&c.node))
            .collect()
    }

    fn closest_sorted(&self) -> Vec<Arc<Node>> {
        let mut closest: Vec<&Candidate> = self.closest.iter().collect();
        closest.sort();
        closest.into_iter().map(|c| Arc::clone(&c.node)).collect()
    }

    async fn update_table(&self, learned: Vec<Arc<Node>>, responders: Vec<Arc<Node>>, failed: Vec<Arc<Node>>) {
        let table = match &self.table {
            Some(table) => table,
            None => return,
        };
        let mut table = table.lock().await;
        // unverified until they answer; a bucket's bad members make way for them
        for node in learned {
            if node.state() != NodeState::Bad && !table.contains(&node.contact()) {
                table.insert(node);
            }
        }
        for node in responders {
            table.insert(node);
        }
        for node in failed {
            table.node_failed(&node);
        }
    }
}

/// `find_node` lookup; yields the closest nodes that answered.
pub struct FindNode {
    krpc: Arc<Krpc>,
    target: NodeId,
}

impl FindNode {
    pub fn new(krpc: Arc<Krpc>, target: NodeId) -> Self {
        Self { krpc, target }
    }
}

impl LookupQuery for FindNode {
    type Response = Vec<NodeContactInfo>;
    type Output = Vec<Arc<Node>>;

    fn query(&self, node: Arc<Node>) -> BoxFuture<'static, Result<Self::Response, QueryError>> {
        let krpc = Arc::clone(&self.krpc);
        let target = self.target;
        async move { node.find_node(&krpc, target).await }.boxed()
    }

    fn handle_response(&mut self, _node: &Arc<Node>, nodes: Self::Response) -> Vec<NodeContactInfo> {
        nodes
    }

    fn finish(self, closest: Vec<Arc<Node>>) -> Self::Output {
        closest
    }
}

#[derive(Debug, Default)]
pub struct GetPeersOutcome {
    /// Every distinct peer any node returned.
    pub peers: Vec<PeerContactInfo>,
    /// The final closest set, nearest first.
    pub closest: Vec<Arc<Node>>,
    /// Tokens from members of `closest`, for a later `announce_peer`.
    pub tokens: HashMap<NodeContactInfo, Token>,
}

/// `get_peers` lookup; gathers peers and announce tokens on the way.
pub struct GetPeers {
    krpc: Arc<Krpc>,
    info_hash: InfoHash,
    peers: Vec<PeerContactInfo>,
    known_peers: HashSet<PeerContactInfo>,
    tokens: HashMap<NodeContactInfo, Token>,
}

impl GetPeers {
    pub fn new(krpc: Arc<Krpc>, info_hash: InfoHash) -> Self {
        Self {
            krpc,
            info_hash,
            peers: Vec::new(),
            known_peers: HashSet::new(),
            tokens: HashMap::new(),
        }
    }
}

impl LookupQuery for GetPeers {
    type Response = GetPeersReply;
    type Output = GetPeersOutcome;

    fn query(&self, node: Arc<Node>) -> BoxFuture<'static, Result<Self::Response, QueryError>> {
        let krpc = Arc::clone(&self.krpc);
        let info_hash = self.info_hash;
        async move { node.get_peers(&krpc, info_hash).await }.boxed()
    }

    fn handle_response(&mut self, node: &Arc<Node>, reply: Self::Response) -> Vec<NodeContactInfo> {
        self.tokens.insert(node.contact(), reply.token);
        for peer in reply.peers {
            if self.known_peers.insert(peer) {
                self.peers.push(peer);
            }
        }
        reply.nodes
    }

    fn finish(mut self, closest: Vec<Arc<Node>>) -> Self::Output {
        let tokens = closest
            .iter()
            .filter_map(|node| {
                let contact = node.contact();
                self.tokens.remove(&contact).map(|token| (contact, token))
            })
            .collect();
        GetPeersOutcome {
            peers: self.peers,
            closest,
            tokens,
        }
    }
}
