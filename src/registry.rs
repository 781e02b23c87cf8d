//! Process-wide map from contact to shared `Node`, so that repeated contact
//! with the same remote reuses its health state.
use crate::node::{Node, NodeContactInfo};

use std::{num::NonZeroUsize, sync::Arc};

use lru::LruCache;
use parking_lot::Mutex;

pub struct NodeRegistry {
    nodes: Mutex<LruCache<NodeContactInfo, Arc<Node>>>,
}

impl NodeRegistry {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            nodes: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, contact: &NodeContactInfo) -> Option<Arc<Node>> {
        self.nodes.lock().get(contact).cloned()
    }

    pub fn get_or_create(&self, contact: NodeContactInfo) -> Arc<Node> {
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get(&contact) {
            return Arc::clone(node);
        }

        if nodes.len() >= nodes.cap().get() {
            // Prefer dropping a node nobody else holds; fall back to plain LRU.
            let idle = nodes
                .iter()
                .rev()
                .find(|(_, node)| Arc::strong_count(node) == 1)
                .map(|(contact, _)| *contact);
            match idle {
                Some(idle) => {
                    nodes.pop(&idle);
                }
                None => {
                    nodes.pop_lru();
                }
            }
        }

        let node = Arc::new(Node::new(contact));
        nodes.put(contact, Arc::clone(&node));
        node
    }

    pub fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
