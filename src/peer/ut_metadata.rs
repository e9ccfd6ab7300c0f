//! Extension for Peers to Send Metadata Files (BEP 9)
//!
//! Lets a client that joined a swarm through a magnet link download the
//! info dictionary from its peers instead of a .torrent file. The same
//! block store serves our metadata out once it is known.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::Visitor, ser::SerializeMap, Deserialize, Serialize};

use crate::metainfo::Info;

use super::extension::{Extension, ExtensionHandshake};

const METADATA_BLOCK_SIZE: usize = 1024 * 16;

#[derive(Debug, Clone, Copy)]
pub enum UtMessage {
    Request { piece: usize },
    Data { piece: usize, total_size: usize },
    Reject { piece: usize },
}

impl UtMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_bencode::Error> {
        serde_bencode::from_bytes(bytes)
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        serde_bencode::to_bytes(self).expect("serialization is infallible")
    }

    /// Data messages carry the block right after the bencoded dict
    pub fn with_trailer(self, block: &[u8]) -> Bytes {
        let dict = self.as_bytes();
        let mut payload = BytesMut::with_capacity(dict.len() + block.len());
        payload.put_slice(&dict);
        payload.put_slice(block);
        payload.freeze()
    }
}

struct UtMessageVisitor;

impl<'v> Visitor<'v> for UtMessageVisitor {
    type Value = UtMessage;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "bencoded map")
    }

    fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
    where
        A: serde::de::MapAccess<'v>,
    {
        let mut msg_type: Option<u8> = None;
        let mut piece: Option<usize> = None;
        let mut total_size: Option<usize> = None;
        while let Some(key) = map.next_key::<String>()? {
            match key.as_ref() {
                "msg_type" => msg_type = Some(map.next_value()?),
                "piece" => piece = Some(map.next_value()?),
                "total_size" => total_size = Some(map.next_value()?),
                _ => {
                    return Err(serde::de::Error::unknown_variant(
                        &key,
                        &["msg_type", "piece", "total_size"],
                    ))
                }
            };
        }
        let msg_type = msg_type.ok_or(serde::de::Error::missing_field("msg_type"))?;
        let piece = piece.ok_or(serde::de::Error::missing_field("piece"))?;
        match msg_type {
            0 => Ok(UtMessage::Request { piece }),
            1 => Ok(UtMessage::Data {
                piece,
                total_size: total_size.ok_or(serde::de::Error::missing_field("total_size"))?,
            }),
            2 => Ok(UtMessage::Reject { piece }),
            rest => Err(serde::de::Error::custom(format!(
                "unknown msg_type: {rest}"
            ))),
        }
    }
}

impl<'de> Deserialize<'de> for UtMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        deserializer.deserialize_map(UtMessageVisitor)
    }
}

impl Serialize for UtMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let length_hint = match self {
            UtMessage::Request { .. } => 2,
            UtMessage::Data { .. } => 3,
            UtMessage::Reject { .. } => 2,
        };
        let mut map = serializer.serialize_map(Some(length_hint))?;

        match self {
            UtMessage::Request { piece } => {
                map.serialize_entry("msg_type", &0)?;
                map.serialize_entry("piece", piece)?;
            }
            UtMessage::Data { piece, total_size } => {
                map.serialize_entry("msg_type", &1)?;
                map.serialize_entry("piece", piece)?;
                map.serialize_entry("total_size", total_size)?;
            }
            UtMessage::Reject { piece } => {
                map.serialize_entry("msg_type", &2)?;
                map.serialize_entry("piece", piece)?;
            }
        };
        map.end()
    }
}

impl From<UtMessage> for bytes::Bytes {
    fn from(value: UtMessage) -> Self {
        value.as_bytes().into()
    }
}

impl TryFrom<&[u8]> for UtMessage {
    type Error = anyhow::Error;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        Ok(Self::from_bytes(value)?)
    }
}

impl Extension<'_> for UtMessage {
    const CLIENT_ID: u8 = 1;
    const NAME: &'static str = "ut_metadata";
}

/// Metadata blocks in flight, both when fetching from a peer and when
/// serving our own
#[derive(Debug, Clone)]
pub struct UtMetadata {
    pub size: usize,
    /// The peer's extension id for ut_metadata
    pub metadata_id: u8,
    blocks: Vec<Option<Bytes>>,
    downloaded: usize,
}

impl UtMetadata {
    pub fn empty_from_handshake(handshake: &ExtensionHandshake) -> Option<Self> {
        let metadata_id = handshake.ut_metadata_id()?;
        let size = handshake.ut_metadata_size()?;
        if size == 0 {
            return None;
        }
        let total_blocks = size.div_ceil(METADATA_BLOCK_SIZE);
        Some(Self {
            size,
            metadata_id,
            blocks: vec![None; total_blocks],
            downloaded: 0,
        })
    }

    /// Create full metadata from existing Info
    pub fn full_from_info(info: &Info) -> Self {
        let bytes = info.as_bytes();
        let size = bytes.len();
        let total_blocks = size.div_ceil(METADATA_BLOCK_SIZE);
        let mut blocks = Vec::with_capacity(total_blocks);
        for i in 0..total_blocks {
            let start = i * METADATA_BLOCK_SIZE;
            let end = std::cmp::min(start + METADATA_BLOCK_SIZE, size);
            blocks.push(Some(bytes.slice(start..end)));
        }

        Self {
            size,
            metadata_id: UtMessage::CLIENT_ID,
            downloaded: total_blocks,
            blocks,
        }
    }

    pub fn block_len(&self, block_i: usize) -> usize {
        if block_i == self.blocks.len() - 1 {
            self.size - block_i * METADATA_BLOCK_SIZE
        } else {
            METADATA_BLOCK_SIZE
        }
    }

    pub fn is_full(&self) -> bool {
        self.downloaded == self.blocks.len()
    }

    pub fn as_bytes(self) -> Bytes {
        let iter = self.blocks.into_iter().flat_map(|x| x.unwrap());
        Bytes::from_iter(iter)
    }

    pub fn request_next_block(&mut self) -> Option<UtMessage> {
        let piece = self.blocks.iter().position(Option::is_none)?;
        Some(UtMessage::Request { piece })
    }

    pub fn save_block(&mut self, piece: usize, data: Bytes) -> Option<()> {
        let expected_len = self.block_len(piece);
        let block = self.blocks.get_mut(piece)?;
        if block.is_none() {
            if data.len() != expected_len {
                return None;
            }
            *block = Some(data);
            self.downloaded += 1;
        }
        Some(())
    }

    pub fn get_block(&self, piece: usize) -> Option<Bytes> {
        self.blocks.get(piece).cloned()?
    }
}

#[cfg(test)]
mod tests {
    use super::UtMessage;

    #[test]
    fn ut_metadata_message() {
        // {'msg_type': 2, 'piece': 0}
        let request = b"d8:msg_typei2e5:piecei0ee";
        // {'msg_type': 9, 'piece': 0}
        let unsupported_request = b"d8:msg_typei9e5:piecei0ee";
        // {'msg_type': 1, 'piece': 0} followed by the block bytes
        let data_request = b"d8:msg_typei1e5:piecei0e10:total_sizei34256eexxxxxxxx";

        let message: UtMessage = serde_bencode::from_bytes(request).unwrap();
        let data_message: UtMessage = serde_bencode::from_bytes(data_request).unwrap();
        assert!(serde_bencode::from_bytes::<UtMessage>(unsupported_request).is_err());
        assert_eq!(
            serde_bencode::to_string(&message).unwrap(),
            String::from_utf8(request.to_vec()).unwrap()
        );
        assert!(String::from_utf8(data_request.to_vec())
            .unwrap()
            .starts_with(&serde_bencode::to_string(&data_message).unwrap()));
    }

    #[test]
    fn metadata_blocks_round_trip() {
        use super::{ExtensionHandshake, UtMetadata};
        let mut handshake = ExtensionHandshake::ours("riptide 0.1", 500);
        handshake.set_metadata_size(40_000);
        let mut metadata = UtMetadata::empty_from_handshake(&handshake).unwrap();
        assert_eq!(metadata.blocks.len(), 3);
        assert_eq!(metadata.block_len(0), 16384);
        assert_eq!(metadata.block_len(2), 40_000 - 2 * 16384);

        assert!(matches!(
            metadata.request_next_block(),
            Some(UtMessage::Request { piece: 0 })
        ));
        metadata
            .save_block(0, vec![1u8; 16384].into())
            .unwrap();
        assert!(matches!(
            metadata.request_next_block(),
            Some(UtMessage::Request { piece: 1 })
        ));
        metadata.save_block(1, vec![2u8; 16384].into()).unwrap();
        // wrong sized last block is rejected
        assert!(metadata.save_block(2, vec![3u8; 100].into()).is_none());
        metadata
            .save_block(2, vec![3u8; 40_000 - 2 * 16384].into())
            .unwrap();
        assert!(metadata.is_full());
        assert_eq!(metadata.as_bytes().len(), 40_000);
    }
}
