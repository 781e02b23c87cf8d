use crate::{
    id::{NodeId, Prefix},
    node::{Node, NodeContactInfo, NodeState},
};

use std::sync::Arc;

use tokio::time::Instant;

/// Maximum number of nodes that should reside in any bucket.
pub const K: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The node is in the bucket (newly added, already present, or it
    /// displaced a bad member).
    Accepted,
    /// The bucket is full and may not split.
    RejectedFull,
    /// The bucket is full but covers the local id; split it and retry.
    SplitRequired,
    /// The node can never live in the table: it is us, or its id is already
    /// known under another address.
    Ignored,
}

/// Nodes whose ids fall within one prefix range of the identifier space.
#[derive(Debug, Clone)]
pub struct Bucket {
    prefix: Prefix,
    nodes: Vec<Arc<Node>>,
    // Candidates that did not fit, nearest to the local id first.
    replacements: Vec<Arc<Node>>,
    last_updated: Instant,
}

impl Bucket {
    pub fn new(prefix: Prefix) -> Self {
        Self {
            prefix,
            nodes: Vec::with_capacity(K),
            replacements: Vec::new(),
            last_updated: Instant::now(),
        }
    }

    pub fn prefix(&self) -> Prefix {
        self.prefix
    }

    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    pub fn replacements(&self) -> &[Arc<Node>] {
        &self.replacements
    }

    pub fn last_updated(&self) -> Instant {
        self.last_updated
    }

    pub fn touch(&mut self) {
        self.last_updated = Instant::now();
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.nodes.len() >= K
    }

    pub fn contains(&self, contact: &NodeContactInfo) -> bool {
        self.nodes.iter().any(|n| n.contact() == *contact)
    }

    /// Decides where `node` goes without ever splitting; see [`split`].
    pub fn insert(&mut self, node: Arc<Node>, local_id: &NodeId) -> InsertOutcome {
        if self.contains(&node.contact()) {
            self.touch();
            return InsertOutcome::Accepted;
        }

        if !self.is_full() {
            self.nodes.push(node);
            self.touch();
            return InsertOutcome::Accepted;
        }

        if let Some(index) = self.nodes.iter().position(|n| n.state() == NodeState::Bad) {
            self.nodes[index] = node;
            self.touch();
            return InsertOutcome::Accepted;
        }

        if self.prefix.contains(local_id) && self.prefix.can_split() {
            InsertOutcome::SplitRequired
        } else {
            InsertOutcome::RejectedFull
        }
    }

    /// Keeps `node` as a backup for this bucket, ordered by distance to the
    /// local id and capped at `capacity`.
    pub fn add_replacement(&mut self, node: Arc<Node>, local_id: &NodeId, capacity: usize) {
        let contact = node.contact();
        if self.replacements.iter().any(|n| n.contact() == contact) {
            return;
        }
        let distance = local_id.distance(&node.id());
        let index = self
            .replacements
            .iter()
            .position(|n| local_id.distance(&n.id()) > distance)
            .unwrap_or_else(|| self.replacements.len());
        self.replacements.insert(index, node);
        self.replacements.truncate(capacity);
    }

    /// Swaps a member for the nearest replacement that is not bad. Without
    /// such a replacement the member keeps its slot.
    pub fn evict(&mut self, contact: &NodeContactInfo) -> Option<Arc<Node>> {
        let index = self.nodes.iter().position(|n| n.contact() == *contact)?;

        self.replacements.retain(|n| n.state() != NodeState::Bad);
        if self.replacements.is_empty() {
            return None;
        }
        let promoted = self.replacements.remove(0);
        let evicted = std::mem::replace(&mut self.nodes[index], promoted);
        self.touch();
        Some(evicted)
    }

    pub(crate) fn remove(&mut self, contact: &NodeContactInfo) -> Option<Arc<Node>> {
        let index = self.nodes.iter().position(|n| n.contact() == *contact)?;
        Some(self.nodes.remove(index))
    }
}

/// Splits a bucket on the next bit of its prefix, handing every node and
/// replacement to the half that covers it.
pub fn split(bucket: Bucket) -> (Bucket, Bucket) {
    let (low_prefix, high_prefix) = bucket.prefix.split();
    let mut low = Bucket::new(low_prefix);
    let mut high = Bucket::new(high_prefix);

    for node in bucket.nodes {
        if low_prefix.contains(&node.id()) {
            low.nodes.push(node);
        } else {
            high.nodes.push(node);
        }
    }
    for node in bucket.replacements {
        if low_prefix.contains(&node.id()) {
            low.replacements.push(node);
        } else {
            high.replacements.push(node);
        }
    }

    low.last_updated = bucket.last_updated;
    high.last_updated = bucket.last_updated;
    (low, high)
}
