//! Model for KRPC Messages
//!
//! Field order follows bencode's sorted-key rule so the encoder emits
//! canonical dictionaries.
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub a: Option<Arguments>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Errors>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub q: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Returns>,

    pub t: ByteBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub v: Option<ByteBuf>,

    pub y: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Arguments {
    pub id: ByteBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub implied_port: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,
}

#[derive(Serialize, Deserialize, Debug, Default, Clone, PartialEq)]
pub struct Returns {
    pub id: ByteBuf,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<ByteBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Errors(pub i64, pub ByteBuf);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    GenericError = 201,
    ServerError = 202,
    ProtocolError = 203,
    MethodUnknown = 204,
}

impl ErrorCode {
    pub fn code(self) -> i64 {
        self as i64
    }
}
