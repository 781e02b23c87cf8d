use crate::id::NodeId;

use std::{
    net::{Ipv4Addr, SocketAddr},
    time::Duration,
};

use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 6881;

/// Settings for a [`MainlineDht`](crate::MainlineDht). Durations are given
/// in seconds when deserialized.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DhtConfig {
    pub bind_addr: SocketAddr,
    /// Fixed node id, otherwise one is derived from `external_ip` or drawn
    /// at random.
    pub node_id: Option<NodeId>,
    /// Known public address, used to build a BEP 42 secure id.
    pub external_ip: Option<Ipv4Addr>,
    #[serde(with = "seconds")]
    pub query_timeout: Duration,
    #[serde(with = "seconds")]
    pub token_ttl: Duration,
    #[serde(with = "seconds")]
    pub bucket_refresh_interval: Duration,
    #[serde(with = "seconds")]
    pub search_interval: Duration,
    pub registry_capacity: usize,
    pub replacement_capacity: usize,
    #[serde(with = "seconds")]
    pub peer_ttl: Duration,
    pub max_stored_peers: usize,
    /// Port sent in `announce_peer`; `None` asks receivers to use our UDP
    /// source port.
    pub announce_port: Option<u16>,
    pub client_version: Option<Vec<u8>>,
    /// Upper bound on find_node sweeps during one bootstrap.
    pub max_bootstrap_rounds: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            node_id: None,
            external_ip: None,
            query_timeout: Duration::from_secs(3),
            token_ttl: Duration::from_secs(10 * 60),
            bucket_refresh_interval: Duration::from_secs(15 * 60),
            search_interval: Duration::from_secs(60),
            registry_capacity: 4096,
            replacement_capacity: 8,
            peer_ttl: Duration::from_secs(30 * 60),
            max_stored_peers: 500,
            announce_port: None,
            client_version: None,
            max_bootstrap_rounds: 8,
        }
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = DhtConfig::default();
        assert_eq!(config.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.query_timeout, Duration::from_secs(3));
        assert_eq!(config.token_ttl, Duration::from_secs(600));
        assert_eq!(config.bucket_refresh_interval, Duration::from_secs(900));
        assert_eq!(config.search_interval, Duration::from_secs(60));
    }
}
