//! BitTorrent mainline DHT (BEP 5) for trackerless peer discovery.

mod bucket;
mod config;
mod dht;
mod error;
mod handler;
mod id;
mod krpc;
mod lookup;
mod message;
mod model;
mod node;
mod registry;
mod storage;
mod table;
mod token;

pub use bucket::{Bucket, InsertOutcome, K};
pub use config::DhtConfig;
pub use dht::{MainlineDht, PeerDiscoveryListener};
pub use error::{BootstrapFailure, DecodeError, DhtError, EncodeError, IdError, QueryError, Result};
pub use handler::QueryHandler;
pub use id::{Distance, InfoHash, NodeId, Prefix, ID_BITS, ID_BYTES};
pub use krpc::{Krpc, PendingQuery, QUERY_TIMEOUT};
pub use lookup::{FindNode, GetPeers, GetPeersOutcome, Lookup, LookupQuery, ALPHA};
pub use message::{Envelope, Method, Payload, Query, RawResponse, RemoteError, Request, Response, ResponseKind};
pub use model::ErrorCode;
pub use node::{GetPeersReply, Node, NodeContactInfo, NodeState};
pub use registry::NodeRegistry;
pub use storage::{PeerContactInfo, PeerStore};
pub use table::RoutingTable;
pub use token::{Token, TokenStore};
