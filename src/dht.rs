use crate::{
    bucket::K,
    config::DhtConfig,
    error::{BootstrapFailure, DhtError, Result},
    handler::QueryHandler,
    id::{InfoHash, NodeId, Prefix},
    krpc::Krpc,
    lookup::{FindNode, GetPeers, GetPeersOutcome, Lookup, ALPHA},
    message::Request,
    node::{Node, NodeContactInfo},
    registry::NodeRegistry,
    storage::{PeerContactInfo, PeerStore},
    table::RoutingTable,
};

use std::{
    collections::{hash_map::Entry, HashMap},
    net::SocketAddr,
    sync::Arc,
};

use futures::future::join_all;
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// Receives the peers found by the periodic search for a registered
/// info-hash.
pub trait PeerDiscoveryListener: Send + Sync {
    fn on_peers_discovered(&self, info_hash: InfoHash, peers: &[PeerContactInfo]);
}

impl PeerDiscoveryListener for mpsc::UnboundedSender<(InfoHash, Vec<PeerContactInfo>)> {
    fn on_peers_discovered(&self, info_hash: InfoHash, peers: &[PeerContactInfo]) {
        let _ = self.send((info_hash, peers.to_vec()));
    }
}

pub struct MainlineDht {
    config: DhtConfig,
    id: NodeId,
    krpc: Arc<Krpc>,
    table: Arc<Mutex<RoutingTable>>,
    registry: Arc<NodeRegistry>,
    handler: Arc<QueryHandler>,
    bootstrap_lock: Mutex<()>,
    refreshes: Mutex<HashMap<Prefix, JoinHandle<()>>>,
    searches: Mutex<HashMap<InfoHash, JoinHandle<()>>>,
    listeners: parking_lot::Mutex<Vec<Arc<dyn PeerDiscoveryListener>>>,
}

impl MainlineDht {
    pub async fn bind(config: DhtConfig) -> Result<Arc<Self>> {
        let id = match (config.node_id, config.external_ip) {
            (Some(id), _) => id,
            (None, Some(ip)) => NodeId::secure(ip, rand::random::<u8>() & 0x7),
            (None, None) => NodeId::random(),
        };

        let krpc = Krpc::bind(
            config.bind_addr,
            id,
            config.query_timeout,
            config.client_version.clone(),
        )
        .await?;
        let table = Arc::new(Mutex::new(
            RoutingTable::new(id).with_replacement_capacity(config.replacement_capacity),
        ));
        let registry = Arc::new(NodeRegistry::new(config.registry_capacity));
        let handler = Arc::new(QueryHandler::new(
            id,
            Arc::clone(&table),
            Arc::clone(&registry),
            PeerStore::new(config.peer_ttl, config.max_stored_peers),
            config.token_ttl,
        ));

        info!(%id, addr = %krpc.local_addr()?, "dht bound");
        Ok(Arc::new(Self {
            config,
            id,
            krpc,
            table,
            registry,
            handler,
            bootstrap_lock: Mutex::new(()),
            refreshes: Mutex::new(HashMap::new()),
            searches: Mutex::new(HashMap::new()),
            listeners: parking_lot::Mutex::new(Vec::new()),
        }))
    }

    pub fn start(&self) {
        self.krpc.start_listener(Arc::clone(&self.handler));
    }

    /// Closes the transport and stops every periodic task. A search round or
    /// refresh already under way runs to completion.
    pub async fn stop(&self) {
        self.krpc.stop().await;
        for (_, task) in self.refreshes.lock().await.drain() {
            task.abort();
        }
        for (_, task) in self.searches.lock().await.drain() {
            task.abort();
        }
        info!(id = %self.id, "dht stopped");
    }

    pub fn local_id(&self) -> NodeId {
        self.id
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.krpc.local_addr()?)
    }

    pub fn external_addr(&self) -> Option<SocketAddr> {
        self.krpc.external_addr()
    }

    pub async fn routing_table_size(&self) -> usize {
        self.table.lock().await.len()
    }

    pub async fn scheduled_refreshes(&self) -> usize {
        self.refreshes.lock().await.len()
    }

    pub fn add_peer_discovery_listener(&self, listener: Arc<dyn PeerDiscoveryListener>) {
        self.listeners.lock().push(listener);
    }

    /// Populates an empty routing table starting from `addr`. Does nothing
    /// once the table has nodes.
    pub async fn add_bootstrap_node_address(self: &Arc<Self>, addr: SocketAddr) -> Result<()> {
        if !self.krpc.is_running() {
            return Err(DhtError::Stopped);
        }
        if !self.table.lock().await.is_empty() {
            return Ok(());
        }

        let result = {
            let _guard = self
                .bootstrap_lock
                .try_lock()
                .map_err(|_| BootstrapFailure::InProgress)?;
            // another attempt may have finished while we waited on the table
            if !self.table.lock().await.is_empty() {
                return Ok(());
            }
            self.bootstrap(addr).await
        };

        match result {
            Ok(size) => {
                info!(%addr, nodes = size, "bootstrap complete");
                self.schedule_refreshes().await;
                Ok(())
            }
            Err(e) => {
                warn!(%addr, error = %e, "bootstrap failed");
                Err(e.into())
            }
        }
    }

    async fn bootstrap(&self, addr: SocketAddr) -> std::result::Result<usize, BootstrapFailure> {
        let response = self
            .krpc
            .query(Request::Ping, addr)
            .await
            .map_err(|source| BootstrapFailure::Unreachable { addr, source })?;
        let entry = self
            .registry
            .get_or_create(NodeContactInfo::new(response.id, addr));
        entry.record_success();
        self.table.lock().await.insert(Arc::clone(&entry));

        let mut size = self.routing_table_size().await;
        for round in 0..self.config.max_bootstrap_rounds {
            self.find_node(self.id).await;
            self.find_node(NodeId::random()).await;

            let now = self.routing_table_size().await;
            debug!(round, nodes = now, "bootstrap round");
            if now == size {
                break;
            }
            size = now;
        }

        if size <= 1 {
            self.table.lock().await.remove(&entry.contact());
            return Err(BootstrapFailure::NoNodes(addr));
        }
        Ok(size)
    }

    /// A peer told us (PORT message) where its DHT node listens.
    pub async fn on_dht_node_discovered(self: &Arc<Self>, addr: SocketAddr) {
        if self.table.lock().await.is_empty() {
            if let Err(e) = self.add_bootstrap_node_address(addr).await {
                debug!(%addr, error = %e, "bootstrap from discovered node failed");
            }
            return;
        }

        match self.krpc.query(Request::Ping, addr).await {
            Ok(response) => {
                let node = self
                    .registry
                    .get_or_create(NodeContactInfo::new(response.id, addr));
                node.record_success();
                self.table.lock().await.insert(node);
            }
            Err(e) => debug!(%addr, error = %e, "discovered node did not answer"),
        }
    }

    pub async fn find_node(&self, target: NodeId) -> Vec<Arc<Node>> {
        let seeds = self.table.lock().await.closest_nodes(&target, K);
        Lookup::new(
            target,
            self.id,
            FindNode::new(Arc::clone(&self.krpc), target),
            Arc::clone(&self.registry),
        )
        .with_table(Arc::clone(&self.table))
        .seed(seeds)
        .run()
        .await
    }

    pub async fn find_peers(&self, info_hash: InfoHash) -> GetPeersOutcome {
        let seeds = self.table.lock().await.closest_nodes(&info_hash, ALPHA);
        Lookup::new(
            info_hash,
            self.id,
            GetPeers::new(Arc::clone(&self.krpc), info_hash),
            Arc::clone(&self.registry),
        )
        .with_table(Arc::clone(&self.table))
        .seed(seeds)
        .run()
        .await
    }

    /// Starts searching for `info_hash` every `search_interval`, announcing
    /// ourselves to the nodes that handed out tokens.
    pub async fn register_info_hash(self: &Arc<Self>, info_hash: InfoHash) {
        let mut searches = self.searches.lock().await;
        let slot = match searches.entry(info_hash) {
            Entry::Occupied(_) => return,
            Entry::Vacant(slot) => slot,
        };

        let dht = Arc::downgrade(self);
        let interval = self.config.search_interval;
        slot.insert(tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let strong = match dht.upgrade() {
                    Some(strong) => strong,
                    None => break,
                };
                let round = tokio::spawn(async move { strong.search_round(info_hash).await });
                if let Err(e) = round.await {
                    warn!(%info_hash, error = %e, "search round failed");
                }
            }
        }));
        debug!(%info_hash, "registered info hash");
    }

    pub async fn deregister_info_hash(&self, info_hash: &InfoHash) {
        if let Some(task) = self.searches.lock().await.remove(info_hash) {
            task.abort();
            debug!(%info_hash, "deregistered info hash");
        }
    }

    async fn search_round(&self, info_hash: InfoHash) {
        let outcome = self.find_peers(info_hash).await;
        debug!(
            %info_hash,
            peers = outcome.peers.len(),
            closest = outcome.closest.len(),
            "search round"
        );

        if !outcome.peers.is_empty() {
            let listeners = self.listeners.lock().clone();
            for listener in listeners {
                listener.on_peers_discovered(info_hash, &outcome.peers);
            }
        }

        let port = self.config.announce_port;
        let announces = outcome.tokens.into_iter().map(|(contact, token)| {
            let node = self.registry.get_or_create(contact);
            let krpc = Arc::clone(&self.krpc);
            async move {
                if let Err(e) = node.announce_peer(&krpc, info_hash, port, token).await {
                    debug!(node = %node.contact(), error = %e, "announce failed");
                }
            }
        });
        join_all(announces).await;
    }

    async fn schedule_refreshes(self: &Arc<Self>) {
        let prefixes: Vec<Prefix> = self
            .table
            .lock()
            .await
            .buckets()
            .iter()
            .map(|b| b.prefix())
            .collect();

        let mut refreshes = self.refreshes.lock().await;
        for prefix in prefixes {
            if let Entry::Vacant(slot) = refreshes.entry(prefix) {
                slot.insert(self.spawn_refresh(prefix));
            }
        }
    }

    /// Keeps the bucket for `prefix` fresh: whenever it has gone
    /// `bucket_refresh_interval` without change, looks up a random id in its
    /// range. Once the bucket has split the task hands over to its halves.
    fn spawn_refresh(self: &Arc<Self>, prefix: Prefix) -> JoinHandle<()> {
        let dht = Arc::downgrade(self);
        let interval = self.config.bucket_refresh_interval;
        tokio::spawn(async move {
            loop {
                let strong = match dht.upgrade() {
                    Some(strong) => strong,
                    None => return,
                };
                let last_updated = strong
                    .table
                    .lock()
                    .await
                    .bucket_for(&prefix)
                    .map(|b| b.last_updated());

                let elapsed = match last_updated {
                    Some(last_updated) => last_updated.elapsed(),
                    None => {
                        strong.refreshes.lock().await.remove(&prefix);
                        strong.schedule_refreshes().await;
                        return;
                    }
                };

                if elapsed < interval {
                    drop(strong);
                    time::sleep(interval - elapsed).await;
                    continue;
                }

                let round = tokio::spawn(async move {
                    strong.refresh_bucket(prefix).await;
                });
                if let Err(e) = round.await {
                    warn!(%prefix, error = %e, "bucket refresh failed");
                    time::sleep(interval).await;
                }
            }
        })
    }

    async fn refresh_bucket(&self, prefix: Prefix) {
        let target = prefix.random_id();
        let found = self.find_node(target).await;
        debug!(%prefix, found = found.len(), "refreshed bucket");
        self.table.lock().await.touch(&prefix);
    }
}
