use std::{fmt::Display, io::Read};

use anyhow::{anyhow, ensure, Context};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::bitfield::BitField;

use super::extension::ExtensionHandshake;

pub const PSTR: &[u8; 19] = b"BitTorrent protocol";

/// `19 "BitTorrent protocol" reserved[8] info_hash[20] peer_id[20]`
#[derive(Debug, Clone)]
pub struct HandShake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl HandShake {
    pub const SIZE: usize = 68;

    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        let mut reserved = [0_u8; 8];
        // extension protocol
        reserved[5] = 0x10;
        // dht port messages
        reserved[7] |= 0x01;

        Self {
            info_hash,
            reserved,
            peer_id,
        }
    }

    pub fn supports_extensions(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    pub fn supports_dht(&self) -> bool {
        self.reserved[7] & 0x01 != 0
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let length = bytes.first().context("length byte is not set")?;
        ensure!(*length == 19, "unexpected pstr length {length}");

        ensure!(bytes.len() >= Self::SIZE, "handshake is too short");
        ensure!(&bytes[1..20] == PSTR, "unknown protocol string");
        let mut bytes = &bytes[20..];

        let mut reserved = [0; 8];
        let mut info_hash = [0; 20];
        let mut peer_id = [0; 20];
        bytes.read_exact(&mut reserved).context("reserved bytes")?;
        bytes.read_exact(&mut info_hash).context("hash bytes")?;
        bytes.read_exact(&mut peer_id).context("peer_id bytes")?;

        Ok(Self {
            reserved,
            peer_id,
            info_hash,
        })
    }

    pub fn as_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0_u8; Self::SIZE];
        out[0] = 19;
        out[1..20].copy_from_slice(PSTR);
        out[20..28].copy_from_slice(&self.reserved);
        out[28..48].copy_from_slice(&self.info_hash);
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }
}

/// Length prefixed wire messages. Ids follow BEP 3 with BEP 5 port and
/// BEP 10 extended on top; anything else decodes as [PeerMessage::Unknown]
/// and is dropped by the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerMessage {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        index: u32,
    },
    Bitfield {
        payload: BitField,
    },
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// Dht listen port (BEP 5)
    Port {
        port: u16,
    },
    ExtensionHandshake {
        payload: ExtensionHandshake,
    },
    Extension {
        extension_id: u8,
        payload: Bytes,
    },
    Unknown {
        id: u8,
    },
}

impl Display for PeerMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerMessage::KeepAlive => write!(f, "KeepAlive"),
            PeerMessage::Choke => write!(f, "Choke"),
            PeerMessage::Unchoke => write!(f, "Unchoke"),
            PeerMessage::Interested => write!(f, "Interested"),
            PeerMessage::NotInterested => write!(f, "NotInterested"),
            PeerMessage::Have { index } => write!(f, "Have {}", index),
            PeerMessage::Bitfield { payload } => {
                write!(f, "Bitfield with length {}", payload.0.len())
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => write!(
                f,
                "Request for piece {index} with offset {begin} and length {length}"
            ),
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => write!(
                f,
                "Block for piece {index} with offset {begin} and length {}",
                block.len()
            ),
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => write!(
                f,
                "Cancel for piece {index} with offset {begin} and length {length}",
            ),
            PeerMessage::Port { port } => write!(f, "Dht port {port}"),
            PeerMessage::ExtensionHandshake { .. } => write!(f, "Extension handshake"),
            PeerMessage::Extension { extension_id, .. } => {
                write!(f, "Extension message with id {extension_id}")
            }
            PeerMessage::Unknown { id } => write!(f, "Unknown message with id {id}"),
        }
    }
}

impl PeerMessage {
    pub fn from_frame(frame: Bytes) -> anyhow::Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let request_payload = |mut b: &[u8]| -> anyhow::Result<_> {
            let mut index_buffer = [0; 4];
            let mut begin_buffer = [0; 4];
            let mut length_buffer = [0; 4];
            b.read_exact(&mut index_buffer).context("index buffer")?;
            b.read_exact(&mut begin_buffer).context("begin buffer")?;
            b.read_exact(&mut length_buffer).context("length buffer")?;
            Ok((
                u32::from_be_bytes(index_buffer),
                u32::from_be_bytes(begin_buffer),
                u32::from_be_bytes(length_buffer),
            ))
        };
        let tag = frame[0];
        let payload = &frame[1..];
        match tag {
            0 => Ok(PeerMessage::Choke),
            1 => Ok(PeerMessage::Unchoke),
            2 => Ok(PeerMessage::Interested),
            3 => Ok(PeerMessage::NotInterested),
            4 => {
                let index_buffer = payload
                    .get(0..4)
                    .context("have payload")?
                    .try_into()
                    .unwrap();
                Ok(PeerMessage::Have {
                    index: u32::from_be_bytes(index_buffer),
                })
            }
            5 => Ok(PeerMessage::Bitfield {
                payload: BitField::new(payload),
            }),
            6 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Request {
                    index,
                    begin,
                    length,
                })
            }
            7 => {
                ensure!(payload.len() >= 8, "piece payload is too short");
                let index = u32::from_be_bytes(payload[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(payload[4..8].try_into().unwrap());
                let block = frame.slice(9..);
                Ok(PeerMessage::Piece {
                    index,
                    begin,
                    block,
                })
            }
            8 => {
                let (index, begin, length) = request_payload(payload)?;
                Ok(PeerMessage::Cancel {
                    index,
                    begin,
                    length,
                })
            }
            9 => {
                let port_buffer = payload
                    .get(0..2)
                    .context("port payload")?
                    .try_into()
                    .unwrap();
                Ok(PeerMessage::Port {
                    port: u16::from_be_bytes(port_buffer),
                })
            }
            20 => {
                let extension_id = *payload.first().context("extension id")?;
                if extension_id == 0 {
                    Ok(PeerMessage::ExtensionHandshake {
                        payload: ExtensionHandshake::from_bytes(&payload[1..])?,
                    })
                } else {
                    Ok(PeerMessage::Extension {
                        extension_id,
                        payload: frame.slice(2..),
                    })
                }
            }
            id => Ok(PeerMessage::Unknown { id }),
        }
    }

    /// Append the length prefixed frame to `dst`
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            PeerMessage::KeepAlive => dst.put_u32(0),
            PeerMessage::Choke => {
                dst.put_u32(1);
                dst.put_u8(0);
            }
            PeerMessage::Unchoke => {
                dst.put_u32(1);
                dst.put_u8(1);
            }
            PeerMessage::Interested => {
                dst.put_u32(1);
                dst.put_u8(2);
            }
            PeerMessage::NotInterested => {
                dst.put_u32(1);
                dst.put_u8(3);
            }
            PeerMessage::Have { index } => {
                dst.put_u32(1 + 4);
                dst.put_u8(4);
                dst.put_u32(*index);
            }
            PeerMessage::Bitfield { payload } => {
                dst.put_u32(1 + payload.0.len() as u32);
                dst.put_u8(5);
                dst.put_slice(&payload.0);
            }
            PeerMessage::Request {
                index,
                begin,
                length,
            } => {
                dst.put_u32(1 + 12);
                dst.put_u8(6);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            PeerMessage::Piece {
                index,
                begin,
                block,
            } => {
                dst.put_u32(1 + 8 + block.len() as u32);
                dst.put_u8(7);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_slice(block);
            }
            PeerMessage::Cancel {
                index,
                begin,
                length,
            } => {
                dst.put_u32(1 + 12);
                dst.put_u8(8);
                dst.put_u32(*index);
                dst.put_u32(*begin);
                dst.put_u32(*length);
            }
            PeerMessage::Port { port } => {
                dst.put_u32(1 + 2);
                dst.put_u8(9);
                dst.put_u16(*port);
            }
            PeerMessage::ExtensionHandshake { payload } => {
                let payload = payload.as_bytes();
                dst.put_u32(1 + 1 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(0);
                dst.put_slice(&payload);
            }
            PeerMessage::Extension {
                extension_id,
                payload,
            } => {
                dst.put_u32(1 + 1 + payload.len() as u32);
                dst.put_u8(20);
                dst.put_u8(*extension_id);
                dst.put_slice(payload);
            }
            PeerMessage::Unknown { .. } => unreachable!("unknown messages are never sent"),
        }
    }
}

#[derive(Debug)]
pub struct MessageFramer;

/// Protects against payloads that are over the block size
const MAX: usize = (1 << 16) + 1024;

impl Decoder for MessageFramer {
    type Item = PeerMessage;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 4 {
            // Not enough data to read length marker.
            return Ok(None);
        }

        let length = u32::from_be_bytes(src[..4].try_into().unwrap()) as usize;

        if length == 0 {
            src.advance(4);
            return Ok(Some(PeerMessage::KeepAlive));
        }

        // Check that the length is not too large to avoid a denial of
        // service attack where the server runs out of memory.
        if length > MAX {
            return Err(anyhow!("length({}) is higher than allowed({})", length, MAX));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(4 + length);
        frame.advance(4);
        let frame = frame.freeze();
        PeerMessage::from_frame(frame)
            .map(Some)
            .map_err(|e| anyhow!("failed to construct peer message: {e}"))
    }
}
