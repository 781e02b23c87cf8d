use std::{io, net::SocketAddr};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("identifier must be {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("invalid hex identifier: {0}")]
    InvalidHex(String),
}

/// A datagram that could not be turned into a KRPC message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("bencode: {0}")]
    Bencode(String),

    #[error("missing key `{0}`")]
    MissingKey(&'static str),

    #[error("invalid value for `{key}`: {reason}")]
    InvalidValue { key: &'static str, reason: String },

    #[error("unknown message type {0:?}")]
    UnknownType(Vec<u8>),

    #[error("unknown method {method:?}")]
    UnknownMethod { transaction_id: Vec<u8>, method: String },
}

impl DecodeError {
    pub(crate) fn invalid(key: &'static str, reason: impl ToString) -> Self {
        DecodeError::InvalidValue {
            key,
            reason: reason.to_string(),
        }
    }
}

impl From<IdError> for DecodeError {
    fn from(e: IdError) -> Self {
        DecodeError::invalid("id", e)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("encode failed: {0}")]
pub struct EncodeError(pub String);

/// Outcome of a single outbound query that did not produce a response.
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("query timed out")]
    Timeout,

    #[error("remote error {code}: {message}")]
    Remote { code: i64, message: String },

    #[error("send failed: {0}")]
    Send(#[from] io::Error),

    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error("response did not match the query: {0}")]
    Decode(#[from] DecodeError),

    #[error("transport is closed")]
    Closed,
}

#[derive(Error, Debug)]
pub enum BootstrapFailure {
    #[error("bootstrap node {addr} unreachable: {source}")]
    Unreachable {
        addr: SocketAddr,
        #[source]
        source: QueryError,
    },

    #[error("bootstrap from {0} discovered no nodes")]
    NoNodes(SocketAddr),

    #[error("another bootstrap is already running")]
    InProgress,
}

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error("bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapFailure),

    #[error("dht is stopped")]
    Stopped,
}

pub type Result<T, E = DhtError> = std::result::Result<T, E>;
