use crate::{
    bucket::{self, Bucket, InsertOutcome},
    id::{NodeId, Prefix},
    node::{Node, NodeContactInfo, NodeState},
};

use std::sync::Arc;

use tracing::debug;

const DEFAULT_REPLACEMENTS: usize = bucket::K;

/// Buckets ordered by the start of their prefix range; together they cover
/// the whole identifier space. Only the bucket holding our own id may split.
pub struct RoutingTable {
    local_id: NodeId,
    buckets: Vec<Bucket>,
    replacement_capacity: usize,
}

impl RoutingTable {
    pub fn new(local_id: NodeId) -> Self {
        Self {
            local_id,
            buckets: vec![Bucket::new(Prefix::root())],
            replacement_capacity: DEFAULT_REPLACEMENTS,
        }
    }

    pub fn with_replacement_capacity(mut self, capacity: usize) -> Self {
        self.replacement_capacity = capacity;
        self
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    pub fn buckets(&self) -> &[Bucket] {
        &self.buckets
    }

    pub fn bucket_for(&self, prefix: &Prefix) -> Option<&Bucket> {
        self.buckets.iter().find(|b| b.prefix() == *prefix)
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(Bucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Bucket::is_empty)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Arc<Node>> {
        self.buckets.iter().flat_map(|b| b.nodes().iter())
    }

    pub fn contains(&self, contact: &NodeContactInfo) -> bool {
        self.buckets[self.bucket_index(&contact.id)].contains(contact)
    }

    fn bucket_index(&self, id: &NodeId) -> usize {
        self.buckets
            .iter()
            .position(|b| b.prefix().contains(id))
            .unwrap_or(0)
    }

    pub fn insert(&mut self, node: Arc<Node>) -> InsertOutcome {
        let id = node.id();
        if id == self.local_id {
            return InsertOutcome::Ignored;
        }

        loop {
            let index = self.bucket_index(&id);
            let bucket = &mut self.buckets[index];

            if !bucket.contains(&node.contact()) && bucket.nodes().iter().any(|n| n.id() == id) {
                return InsertOutcome::Ignored;
            }

            match bucket.insert(Arc::clone(&node), &self.local_id) {
                InsertOutcome::SplitRequired => {
                    let (low, high) = bucket::split(self.buckets.remove(index));
                    debug!(low = %low.prefix(), high = %high.prefix(), "split bucket");
                    self.buckets.insert(index, high);
                    self.buckets.insert(index, low);
                }
                InsertOutcome::RejectedFull => {
                    bucket.add_replacement(node, &self.local_id, self.replacement_capacity);
                    return InsertOutcome::RejectedFull;
                }
                outcome => return outcome,
            }
        }
    }

    /// Called after a query to `node` failed. Once it has gone bad the
    /// nearest replacement takes its slot; with no replacement it stays until
    /// a newcomer displaces it.
    pub fn node_failed(&mut self, node: &Arc<Node>) {
        if node.state() != NodeState::Bad {
            return;
        }
        let index = self.bucket_index(&node.id());
        if self.buckets[index].evict(&node.contact()).is_some() {
            debug!(node = %node.contact(), "evicted bad node");
        }
    }

    pub fn remove(&mut self, contact: &NodeContactInfo) -> Option<Arc<Node>> {
        let index = self.bucket_index(&contact.id);
        self.buckets[index].remove(contact)
    }

    pub fn touch(&mut self, prefix: &Prefix) {
        if let Some(bucket) = self.buckets.iter_mut().find(|b| b.prefix() == *prefix) {
            bucket.touch();
        }
    }

    /// Up to `n` nodes ordered by ascending distance to `target`.
    pub fn closest_nodes(&self, target: &NodeId, n: usize) -> Vec<Arc<Node>> {
        let mut nodes: Vec<Arc<Node>> = self.nodes().cloned().collect();
        nodes.sort_by_key(|node| target.distance(&node.id()));
        nodes.truncate(n);
        nodes
    }
}
