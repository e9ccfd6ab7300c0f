//! KRPC: bencoded queries and responses over udp (BEP 5). Transaction
//! ids are two bytes, echoed verbatim in responses.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use super::id::NodeId;

pub const ERROR_GENERIC: i64 = 201;
pub const ERROR_SERVER: i64 = 202;
pub const ERROR_PROTOCOL: i64 = 203;
pub const ERROR_METHOD_UNKNOWN: i64 = 204;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KrpcMessage {
    #[serde(rename = "t")]
    pub transaction_id: Bytes,
    #[serde(rename = "y")]
    pub message_type: String,
    #[serde(flatten)]
    pub payload: KrpcPayload,
    #[serde(rename = "v", skip_serializing_if = "Option::is_none")]
    pub client_version: Option<Bytes>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum KrpcPayload {
    Query {
        #[serde(rename = "q")]
        method: String,
        #[serde(rename = "a")]
        arguments: DhtQuery,
    },
    Response {
        #[serde(rename = "r")]
        response: DhtResponse,
    },
    Error {
        #[serde(rename = "e")]
        error: (i64, String),
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields)]
pub enum DhtQuery {
    AnnouncePeer {
        id: Bytes,
        #[serde(skip_serializing_if = "Option::is_none")]
        implied_port: Option<i64>,
        info_hash: Bytes,
        port: u16,
        token: Bytes,
    },
    FindNode {
        id: Bytes,
        target: Bytes,
    },
    GetPeers {
        id: Bytes,
        info_hash: Bytes,
    },
    Ping {
        id: Bytes,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged, deny_unknown_fields)]
pub enum DhtResponse {
    GetPeers {
        id: Bytes,
        token: Bytes,
        #[serde(flatten)]
        values: GetPeersValues,
    },
    FindNode {
        id: Bytes,
        nodes: Bytes,
    },
    /// Ping and announce responses have the same shape and are
    /// indistinguishable on the wire
    PingOrAnnounce {
        id: Bytes,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GetPeersValues {
    /// Compact peers that announced this info hash
    Values(Vec<Bytes>),
    /// Compact nodes closer to the target
    Nodes(Bytes),
}

impl KrpcMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn to_bytes(&self) -> Bytes {
        serde_bencode::to_bytes(self)
            .expect("krpc messages serialize")
            .into()
    }

    pub fn query(transaction_id: Bytes, method: &str, arguments: DhtQuery) -> Self {
        Self {
            transaction_id,
            message_type: "q".into(),
            payload: KrpcPayload::Query {
                method: method.into(),
                arguments,
            },
            client_version: Some(Bytes::from_static(b"RP01")),
        }
    }

    pub fn response(transaction_id: Bytes, response: DhtResponse) -> Self {
        Self {
            transaction_id,
            message_type: "r".into(),
            payload: KrpcPayload::Response { response },
            client_version: Some(Bytes::from_static(b"RP01")),
        }
    }

    pub fn error(transaction_id: Bytes, code: i64, message: &str) -> Self {
        Self {
            transaction_id,
            message_type: "e".into(),
            payload: KrpcPayload::Error {
                error: (code, message.into()),
            },
            client_version: None,
        }
    }

    /// The sender's node id, regardless of message shape
    pub fn sender_id(&self) -> Option<NodeId> {
        let bytes = match &self.payload {
            KrpcPayload::Query { arguments, .. } => match arguments {
                DhtQuery::AnnouncePeer { id, .. }
                | DhtQuery::FindNode { id, .. }
                | DhtQuery::GetPeers { id, .. }
                | DhtQuery::Ping { id } => id,
            },
            KrpcPayload::Response { response } => match response {
                DhtResponse::GetPeers { id, .. }
                | DhtResponse::FindNode { id, .. }
                | DhtResponse::PingOrAnnounce { id } => id,
            },
            KrpcPayload::Error { .. } => return None,
        };
        bytes[..].try_into().ok()
    }
}

/// Compact peer: 4 ipv4 bytes and 2 port bytes, big endian
pub fn encode_compact_peer(addr: SocketAddr) -> Option<[u8; 6]> {
    let SocketAddr::V4(addr) = addr else {
        return None;
    };
    let mut out = [0u8; 6];
    out[..4].copy_from_slice(&addr.ip().octets());
    out[4..].copy_from_slice(&addr.port().to_be_bytes());
    Some(out)
}

pub fn decode_compact_peer(bytes: &[u8]) -> Option<SocketAddr> {
    if bytes.len() != 6 {
        return None;
    }
    let ip = Ipv4Addr::from_bits(u32::from_be_bytes(bytes[..4].try_into().unwrap()));
    let port = u16::from_be_bytes(bytes[4..].try_into().unwrap());
    Some(SocketAddr::V4(SocketAddrV4::new(ip, port)))
}

/// Compact node: 20 byte id followed by a compact peer, 26 bytes
pub fn encode_compact_nodes(nodes: &[(NodeId, SocketAddr)]) -> Bytes {
    let mut out = BytesMut::with_capacity(nodes.len() * 26);
    for (id, addr) in nodes {
        let Some(peer) = encode_compact_peer(*addr) else {
            continue;
        };
        out.put_slice(id);
        out.put_slice(&peer);
    }
    out.freeze()
}

pub fn decode_compact_nodes(bytes: &[u8]) -> Vec<(NodeId, SocketAddr)> {
    bytes
        .chunks_exact(26)
        .filter_map(|chunk| {
            let id: NodeId = chunk[..20].try_into().unwrap();
            let addr = decode_compact_peer(&chunk[20..])?;
            Some((id, addr))
        })
        .collect()
}
