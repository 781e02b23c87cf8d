//! Typed KRPC messages.
//!
//! A datagram decodes into an [`Envelope`] whose [`Payload`] is one of a
//! closed set of records, discriminated by the wire `y` and `q` keys.
//! Responses carry no method name on the wire, so they stay a
//! [`RawResponse`] until the transport pairs them with the query they answer.

use crate::{
    error::{DecodeError, EncodeError},
    id::{InfoHash, NodeId},
    model::{Arguments, ErrorCode, Errors, Message, Returns},
    node::NodeContactInfo,
    storage::PeerContactInfo,
    token::Token,
};

use std::{
    convert::{TryFrom, TryInto},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
};

use bencode::{decode::from_bytes, encode};
use serde_bytes::ByteBuf;

pub const COMPACT_NODE_LEN: usize = 26;
pub const COMPACT_PEER_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Method {
    Ping,
    FindNode,
    GetPeers,
    AnnouncePeer,
}

impl Method {
    pub fn name(self) -> &'static str {
        match self {
            Method::Ping => "ping",
            Method::FindNode => "find_node",
            Method::GetPeers => "get_peers",
            Method::AnnouncePeer => "announce_peer",
        }
    }

    pub fn from_name(name: &[u8]) -> Option<Method> {
        match name {
            b"ping" => Some(Method::Ping),
            b"find_node" => Some(Method::FindNode),
            b"get_peers" => Some(Method::GetPeers),
            b"announce_peer" => Some(Method::AnnouncePeer),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Ping,
    FindNode {
        target: NodeId,
    },
    GetPeers {
        info_hash: InfoHash,
    },
    AnnouncePeer {
        info_hash: InfoHash,
        port: u16,
        implied_port: bool,
        token: Token,
    },
}

impl Request {
    pub fn method(&self) -> Method {
        match self {
            Request::Ping => Method::Ping,
            Request::FindNode { .. } => Method::FindNode,
            Request::GetPeers { .. } => Method::GetPeers,
            Request::AnnouncePeer { .. } => Method::AnnouncePeer,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Query {
    pub sender: NodeId,
    pub request: Request,
}

/// A response already matched to the method it answers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub id: NodeId,
    pub kind: ResponseKind,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseKind {
    Ping,
    FindNode {
        nodes: Vec<NodeContactInfo>,
    },
    GetPeers {
        token: Token,
        peers: Vec<PeerContactInfo>,
        nodes: Vec<NodeContactInfo>,
    },
    AnnouncePeer,
}

/// Response dictionary as it came off the wire.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawResponse {
    pub id: NodeId,
    pub nodes: Option<Vec<NodeContactInfo>>,
    pub token: Option<Token>,
    pub values: Option<Vec<PeerContactInfo>>,
}

impl RawResponse {
    pub fn typed(self, method: Method) -> Result<Response, DecodeError> {
        let kind = match method {
            Method::Ping => ResponseKind::Ping,
            Method::AnnouncePeer => ResponseKind::AnnouncePeer,
            Method::FindNode => ResponseKind::FindNode {
                nodes: self.nodes.ok_or(DecodeError::MissingKey("nodes"))?,
            },
            Method::GetPeers => {
                let token = self.token.ok_or(DecodeError::MissingKey("token"))?;
                if self.values.is_none() && self.nodes.is_none() {
                    return Err(DecodeError::MissingKey("values"));
                }
                ResponseKind::GetPeers {
                    token,
                    peers: self.values.unwrap_or_default(),
                    nodes: self.nodes.unwrap_or_default(),
                }
            }
        };
        Ok(Response { id: self.id, kind })
    }
}

impl From<Response> for RawResponse {
    fn from(response: Response) -> Self {
        let mut raw = RawResponse {
            id: response.id,
            ..RawResponse::default()
        };
        match response.kind {
            ResponseKind::Ping | ResponseKind::AnnouncePeer => {}
            ResponseKind::FindNode { nodes } => raw.nodes = Some(nodes),
            ResponseKind::GetPeers {
                token,
                peers,
                nodes,
            } => {
                raw.token = Some(token);
                if peers.is_empty() {
                    raw.nodes = Some(nodes);
                } else {
                    raw.values = Some(peers);
                }
            }
        }
        raw
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteError {
    pub code: i64,
    pub message: String,
}

impl RemoteError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        RemoteError {
            code: code.code(),
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    Query(Query),
    Response(RawResponse),
    Error(RemoteError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub transaction_id: Vec<u8>,
    pub version: Option<Vec<u8>>,
    /// BEP 42: the address the sender saw us at.
    pub ip: Option<SocketAddr>,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(transaction_id: Vec<u8>, payload: Payload) -> Self {
        Envelope {
            transaction_id,
            version: None,
            ip: None,
            payload,
        }
    }

    pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
        let msg = from_bytes::<Message>(bytes).map_err(|e| DecodeError::Bencode(e.to_string()))?;
        let transaction_id = msg.t.into_vec();

        let payload = match msg.y.as_slice() {
            b"q" => {
                let q = msg.q.ok_or(DecodeError::MissingKey("q"))?;
                let method = match Method::from_name(&q) {
                    Some(method) => method,
                    None => {
                        return Err(DecodeError::UnknownMethod {
                            transaction_id,
                            method: String::from_utf8_lossy(&q).into_owned(),
                        })
                    }
                };
                let a = msg.a.ok_or(DecodeError::MissingKey("a"))?;
                Payload::Query(decode_query(method, a)?)
            }
            b"r" => Payload::Response(decode_returns(msg.r.ok_or(DecodeError::MissingKey("r"))?)?),
            b"e" => {
                let Errors(code, message) = msg.e.ok_or(DecodeError::MissingKey("e"))?;
                Payload::Error(RemoteError {
                    code,
                    message: String::from_utf8_lossy(&message).into_owned(),
                })
            }
            other => return Err(DecodeError::UnknownType(other.to_vec())),
        };

        let ip = match msg.ip {
            Some(ip) => Some(decode_compact_addr(&ip).map_err(|e| DecodeError::invalid("ip", e))?),
            None => None,
        };

        Ok(Envelope {
            transaction_id,
            version: msg.v.map(ByteBuf::into_vec),
            ip,
            payload,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>, EncodeError> {
        let mut msg = Message {
            t: ByteBuf::from(self.transaction_id.clone()),
            v: self.version.clone().map(ByteBuf::from),
            ip: self.ip.and_then(encode_compact_addr).map(ByteBuf::from),
            ..Message::default()
        };

        match &self.payload {
            Payload::Query(query) => {
                msg.y = ByteBuf::from(b"q".to_vec());
                msg.q = Some(ByteBuf::from(query.request.method().name().as_bytes().to_vec()));
                msg.a = Some(encode_query(query));
            }
            Payload::Response(raw) => {
                msg.y = ByteBuf::from(b"r".to_vec());
                msg.r = Some(Returns {
                    id: ByteBuf::from(raw.id.0.to_vec()),
                    nodes: raw.nodes.as_deref().map(|n| ByteBuf::from(encode_nodes(n))),
                    token: raw.token.as_ref().map(|t| ByteBuf::from(t.as_ref().to_vec())),
                    values: raw.values.as_ref().map(|peers| {
                        peers
                            .iter()
                            .filter_map(PeerContactInfo::to_compact)
                            .map(|p| ByteBuf::from(p.to_vec()))
                            .collect()
                    }),
                });
            }
            Payload::Error(err) => {
                msg.y = ByteBuf::from(b"e".to_vec());
                msg.e = Some(Errors(err.code, ByteBuf::from(err.message.as_bytes().to_vec())));
            }
        }

        encode::to_bytes(&msg).map_err(|e| EncodeError(format!("{:?}", e)))
    }
}

fn decode_id(key: &'static str, bytes: Option<ByteBuf>) -> Result<NodeId, DecodeError> {
    let bytes = bytes.ok_or(DecodeError::MissingKey(key))?;
    NodeId::try_from(bytes.as_slice()).map_err(|e| DecodeError::invalid(key, e))
}

fn decode_query(method: Method, a: Arguments) -> Result<Query, DecodeError> {
    let sender = decode_id("id", Some(a.id))?;

    let request = match method {
        Method::Ping => Request::Ping,
        Method::FindNode => Request::FindNode {
            target: decode_id("target", a.target)?,
        },
        Method::GetPeers => Request::GetPeers {
            info_hash: decode_id("info_hash", a.info_hash)?,
        },
        Method::AnnouncePeer => {
            let implied_port = a.implied_port.unwrap_or(0) != 0;
            let port = match a.port {
                Some(port) => u16::try_from(port).map_err(|e| DecodeError::invalid("port", e))?,
                // the port is ignored in favour of the source port
                None if implied_port => 0,
                None => return Err(DecodeError::MissingKey("port")),
            };
            Request::AnnouncePeer {
                info_hash: decode_id("info_hash", a.info_hash)?,
                port,
                implied_port,
                token: Token::from(a.token.ok_or(DecodeError::MissingKey("token"))?.into_vec()),
            }
        }
    };

    Ok(Query { sender, request })
}

fn encode_query(query: &Query) -> Arguments {
    let mut args = Arguments {
        id: ByteBuf::from(query.sender.0.to_vec()),
        ..Arguments::default()
    };
    match &query.request {
        Request::Ping => {}
        Request::FindNode { target } => args.target = Some(ByteBuf::from(target.0.to_vec())),
        Request::GetPeers { info_hash } => {
            args.info_hash = Some(ByteBuf::from(info_hash.0.to_vec()))
        }
        Request::AnnouncePeer {
            info_hash,
            port,
            implied_port,
            token,
        } => {
            args.info_hash = Some(ByteBuf::from(info_hash.0.to_vec()));
            args.port = Some(i64::from(*port));
            args.implied_port = Some(i64::from(*implied_port as u8));
            args.token = Some(ByteBuf::from(token.as_ref().to_vec()));
        }
    }
    args
}

fn decode_returns(r: Returns) -> Result<RawResponse, DecodeError> {
    let id = decode_id("id", Some(r.id))?;

    let nodes = match r.nodes {
        Some(nodes) => Some(decode_nodes(&nodes)?),
        None => None,
    };

    let values = match r.values {
        Some(values) => Some(
            values
                .iter()
                .map(|v| PeerContactInfo::from_compact(v).map_err(|e| DecodeError::invalid("values", e)))
                .collect::<Result<Vec<_>, _>>()?,
        ),
        None => None,
    };

    Ok(RawResponse {
        id,
        nodes,
        token: r.token.map(|t| Token::from(t.into_vec())),
        values,
    })
}

/// Packs contacts into the 26-byte-per-node compact format. IPv6 contacts
/// have no compact form and are left out.
pub fn encode_nodes(nodes: &[NodeContactInfo]) -> Vec<u8> {
    let mut out = Vec::with_capacity(nodes.len() * COMPACT_NODE_LEN);
    for compact in nodes.iter().filter_map(NodeContactInfo::to_compact) {
        out.extend_from_slice(&compact);
    }
    out
}

pub fn decode_nodes(bytes: &[u8]) -> Result<Vec<NodeContactInfo>, DecodeError> {
    if bytes.len() % COMPACT_NODE_LEN != 0 {
        return Err(DecodeError::invalid(
            "nodes",
            format!("length {} is not a multiple of {}", bytes.len(), COMPACT_NODE_LEN),
        ));
    }
    bytes
        .chunks(COMPACT_NODE_LEN)
        .map(|chunk| NodeContactInfo::from_compact(chunk).map_err(|e| DecodeError::invalid("nodes", e)))
        .collect()
}

pub fn encode_compact_addr(addr: SocketAddr) -> Option<[u8; COMPACT_PEER_LEN]> {
    match addr {
        SocketAddr::V4(v4) => {
            let mut out = [0u8; COMPACT_PEER_LEN];
            out[..4].copy_from_slice(&v4.ip().octets());
            out[4..].copy_from_slice(&v4.port().to_be_bytes());
            Some(out)
        }
        SocketAddr::V6(_) => None,
    }
}

pub fn decode_compact_addr(bytes: &[u8]) -> Result<SocketAddr, String> {
    let bytes: [u8; COMPACT_PEER_LEN] = bytes
        .try_into()
        .map_err(|_| format!("compact address must be {} bytes, got {}", COMPACT_PEER_LEN, bytes.len()))?;
    let ip = Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]);
    let port = u16::from_be_bytes([bytes[4], bytes[5]]);
    Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}
