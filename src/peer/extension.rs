use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// If the client supporting the extensions can decide which numbers the messages it receives will have,
/// it means they are constants within that client. i.e. they can be used in match statements.
pub trait Extension<'a>: Into<bytes::Bytes> + TryFrom<&'a [u8]> {
    const NAME: &'static str;
    const CLIENT_ID: u8;
}

/// Extension ids we advertise in the `m` dictionary (BEP 10)
pub const CLIENT_EXTENSIONS: [(&str, u8); 2] = [
    (
        super::ut_metadata::UtMessage::NAME,
        super::ut_metadata::UtMessage::CLIENT_ID,
    ),
    (
        super::pex::PexMessage::NAME,
        super::pex::PexMessage::CLIENT_ID,
    ),
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtensionHandshake {
    #[serde(rename = "m")]
    pub dict: HashMap<String, u8>,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_bencode::value::Value>,
}

impl ExtensionHandshake {
    pub fn from_bytes(bytes: &[u8]) -> serde_bencode::Result<Self> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Bytes {
        serde_bencode::to_bytes(self).unwrap().into()
    }

    pub fn ours(client_name: &str, request_queue_size: usize) -> Self {
        let mut dict = HashMap::with_capacity(CLIENT_EXTENSIONS.len());
        let mut fields = HashMap::new();
        for (name, id) in CLIENT_EXTENSIONS {
            dict.insert(name.into(), id);
        }

        fields.insert(
            "reqq".to_string(),
            serde_bencode::value::Value::Int(request_queue_size as i64),
        );
        fields.insert(
            "v".to_string(),
            serde_bencode::value::Value::Bytes(client_name.as_bytes().to_vec()),
        );

        Self { dict, fields }
    }

    pub fn set_metadata_size(&mut self, size: usize) {
        self.fields.insert(
            "metadata_size".to_string(),
            serde_bencode::value::Value::Int(size as i64),
        );
    }

    /// Metadata size if it supports ut_metadata
    pub fn ut_metadata_size(&self) -> Option<usize> {
        self.fields
            .get("metadata_size")
            .and_then(|size| match size {
                serde_bencode::value::Value::Int(size) => usize::try_from(*size).ok(),
                _ => None,
            })
    }

    /// Pex's extension id if handshake supports it
    pub fn pex_id(&self) -> Option<u8> {
        self.dict.get(super::pex::PexMessage::NAME).copied()
    }

    /// Ut_metadata's extension id if handshake supports it
    pub fn ut_metadata_id(&self) -> Option<u8> {
        self.dict
            .get(super::ut_metadata::UtMessage::NAME)
            .copied()
    }

    /// A string containing the compact representation of the ip address this peer sees you as.
    pub fn your_ip(&self) -> Option<std::net::IpAddr> {
        let serde_bencode::value::Value::Bytes(bytes) = self.fields.get("yourip")? else {
            return None;
        };
        match bytes.len() {
            4 => {
                let octets: [u8; 4] = bytes[..].try_into().unwrap();
                Some(std::net::IpAddr::from(octets))
            }
            16 => {
                let octets: [u8; 16] = bytes[..].try_into().unwrap();
                Some(std::net::IpAddr::from(octets))
            }
            _ => None,
        }
    }

    pub fn set_your_ip(&mut self, peer_ip: std::net::IpAddr) {
        let ip_bytes = match peer_ip {
            std::net::IpAddr::V4(ipv4_addr) => ipv4_addr.octets().to_vec(),
            std::net::IpAddr::V6(ipv6_addr) => ipv6_addr.octets().to_vec(),
        };
        self.fields.insert(
            "yourip".to_owned(),
            serde_bencode::value::Value::Bytes(ip_bytes),
        );
    }

    /// The maximum number of outstanding request messages this client
    /// supports without dropping any
    pub fn request_queue_size(&self) -> Option<i64> {
        let serde_bencode::value::Value::Int(size) = self.fields.get("reqq")? else {
            return None;
        };
        Some(*size)
    }

    /// Client name and version (as a utf-8 string).
    /// This is a much more reliable way of identifying the client than relying on the peer id encoding.
    pub fn client_name(&self) -> Option<&str> {
        let serde_bencode::value::Value::Bytes(bytes) = self.fields.get("v")? else {
            return None;
        };
        std::str::from_utf8(bytes).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::ExtensionHandshake;

    #[test]
    fn parse_extension_handshake() {
        let data = b"d1:md11:LT_metadatai1e6:qT_PEXi2ee1:pi6881e1:v13:\xc2\xb5Torreet 1.2e";
        let handshake = ExtensionHandshake::from_bytes(data).unwrap();
        assert_eq!(*handshake.dict.get("LT_metadata").unwrap(), 1);
        assert_eq!(*handshake.dict.get("qT_PEX").unwrap(), 2);
        assert_eq!(handshake.client_name().unwrap(), "\u{b5}Torreet 1.2");
        assert!(handshake.pex_id().is_none());
    }

    #[test]
    fn our_handshake_advertises_extensions() {
        let handshake = ExtensionHandshake::ours("riptide 0.1", 500);
        assert_eq!(handshake.ut_metadata_id(), Some(1));
        assert_eq!(handshake.pex_id(), Some(2));
        assert_eq!(handshake.request_queue_size(), Some(500));
        let round_trip =
            ExtensionHandshake::from_bytes(&handshake.as_bytes()).unwrap();
        assert_eq!(round_trip, handshake);
    }

    #[test]
    fn your_ip_round_trip() {
        let mut handshake = ExtensionHandshake::ours("riptide 0.1", 500);
        let ip: std::net::IpAddr = "10.1.2.3".parse().unwrap();
        handshake.set_your_ip(ip);
        assert_eq!(handshake.your_ip(), Some(ip));
        assert!(handshake.ut_metadata_size().is_none());
        handshake.set_metadata_size(31234);
        assert_eq!(handshake.ut_metadata_size(), Some(31234));
    }
}
