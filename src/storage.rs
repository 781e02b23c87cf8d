use crate::{
    id::InfoHash,
    message::{decode_compact_addr, encode_compact_addr, COMPACT_PEER_LEN},
};

use std::{
    collections::HashMap,
    fmt,
    net::{IpAddr, SocketAddr},
    time::Duration,
};

use tokio::time::Instant;

/// A BitTorrent peer serving some info-hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerContactInfo {
    pub ip: IpAddr,
    pub port: u16,
}

impl PeerContactInfo {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    pub fn to_compact(&self) -> Option<[u8; COMPACT_PEER_LEN]> {
        encode_compact_addr(self.addr())
    }

    pub fn from_compact(bytes: &[u8]) -> Result<Self, String> {
        let addr = decode_compact_addr(bytes)?;
        Ok(Self::new(addr.ip(), addr.port()))
    }
}

impl From<SocketAddr> for PeerContactInfo {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip(), addr.port())
    }
}

impl fmt::Display for PeerContactInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.addr().fmt(f)
    }
}

struct AnnounceItem {
    peer: PeerContactInfo,
    expires: Instant,
}

/// Announced peers per info-hash. Items expire `ttl` after their last
/// announce and the store never holds more than `capacity` of them.
pub struct PeerStore {
    items: HashMap<InfoHash, Vec<AnnounceItem>>,
    ttl: Duration,
    capacity: usize,
    count: usize,
}

impl PeerStore {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            items: HashMap::new(),
            ttl,
            capacity,
            count: 0,
        }
    }

    /// Returns false when the store is full and the peer is new.
    pub fn add(&mut self, info_hash: InfoHash, peer: PeerContactInfo) -> bool {
        let now = Instant::now();
        self.remove_expired(now);
        let expires = now + self.ttl;

        let items = self.items.entry(info_hash).or_insert_with(Vec::new);
        if let Some(item) = items.iter_mut().find(|i| i.peer == peer) {
            item.expires = expires;
            return true;
        }
        if self.count >= self.capacity {
            if items.is_empty() {
                self.items.remove(&info_hash);
            }
            return false;
        }

        items.push(AnnounceItem { peer, expires });
        self.count += 1;
        true
    }

    pub fn peers(&mut self, info_hash: &InfoHash, limit: usize) -> Vec<PeerContactInfo> {
        self.remove_expired(Instant::now());
        self.items
            .get(info_hash)
            .map(|items| items.iter().take(limit).map(|i| i.peer).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn remove_expired(&mut self, now: Instant) {
        let mut removed = 0;
        self.items.retain(|_, items| {
            let before = items.len();
            items.retain(|i| i.expires > now);
            removed += before - items.len();
            !items.is_empty()
        });
        self.count -= removed;
    }
}
