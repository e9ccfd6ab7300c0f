use std::{fmt::Display, net::SocketAddr, str::FromStr};

use anyhow::Context;
use reqwest::Url;

use crate::error::{Error, ErrorKind};

/// `magnet:?xt=urn:btih:<hex40|base32>&dn=...&tr=...&x.pe=host:port`
///
/// The info hash is normalized to lowercase hex regardless of the encoding
/// used in the link.
#[derive(Debug, Clone)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub name: Option<String>,
    pub announce_list: Option<Vec<Url>>,
    /// `x.pe` direct peer hints
    pub peers: Vec<SocketAddr>,
}

impl Display for MagnetLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        let mut url = Url::parse(&format!("magnet:?xt=urn:btih:{}", self.hex_hash())).unwrap();
        {
            let mut query = url.query_pairs_mut();
            if let Some(name) = &self.name {
                query.append_pair("dn", name);
            };
            if let Some(announce_list) = &self.announce_list {
                for tracker in announce_list {
                    query.append_pair("tr", tracker.as_str());
                }
            }
            for peer in &self.peers {
                query.append_pair("x.pe", &peer.to_string());
            }
            query.finish();
        }

        write!(f, "{}", url)
    }
}

impl FromStr for MagnetLink {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).map_err(|e| Error::new(ErrorKind::MagnetInvalid, e.to_string()))
    }
}

impl MagnetLink {
    fn parse(s: &str) -> anyhow::Result<Self> {
        let url = Url::from_str(s)?;
        anyhow::ensure!(url.scheme() == "magnet");
        let mut info_hash = None;
        let mut name = None;
        let mut trackers = Vec::new();
        let mut peers = Vec::new();
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                // info_hash
                "xt" => {
                    let mut split = value.splitn(3, ':');
                    let urn = split.next().context("urn string is not found in xt")?;
                    let hash_indicator =
                        split.next().context("hash indicator is not found in xt")?;
                    anyhow::ensure!(urn == "urn");
                    anyhow::ensure!(hash_indicator == "btih");
                    let hash = split.next().context("hash is not found in xt")?;
                    info_hash = Some(decode_info_hash(hash)?);
                }
                // torrent name
                "dn" => {
                    name = Some(value.to_string());
                }
                // tracker
                "tr" => {
                    if let Ok(url) = Url::from_str(&value) {
                        trackers.push(url)
                    } else {
                        tracing::warn!("Failed to parse magnet tracker: {}", value);
                    }
                }
                // direct peer hint
                "x.pe" => {
                    if let Ok(addr) = SocketAddr::from_str(&value) {
                        peers.push(addr);
                    } else {
                        tracing::warn!("Failed to parse magnet peer hint: {}", value);
                    }
                }
                _ => {}
            }
        }
        let trackers = (!trackers.is_empty()).then_some(trackers);
        Ok(Self {
            info_hash: info_hash.context("magnet link does not contain info_hash")?,
            name,
            announce_list: trackers,
            peers,
        })
    }

    pub fn hash(&self) -> [u8; 20] {
        self.info_hash
    }

    pub fn hex_hash(&self) -> String {
        hex::encode(self.info_hash)
    }

    pub fn all_trackers(&self) -> Option<Vec<Url>> {
        self.announce_list.clone()
    }
}

fn decode_info_hash(hash: &str) -> anyhow::Result<[u8; 20]> {
    match hash.len() {
        40 => {
            let bytes = hex::decode(hash).context("decode hex info hash")?;
            Ok(bytes.try_into().expect("40 hex chars are 20 bytes"))
        }
        32 => {
            let bytes = base32_decode(hash).context("decode base32 info hash")?;
            bytes
                .try_into()
                .map_err(|_| anyhow::anyhow!("base32 info hash is not 20 bytes"))
        }
        len => anyhow::bail!("info hash must be 40 hex or 32 base32 chars, got {len}"),
    }
}

/// RFC 4648 base32 without padding, as used by old magnet links
fn base32_decode(input: &str) -> anyhow::Result<Vec<u8>> {
    let mut acc: u64 = 0;
    let mut acc_bits = 0u32;
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    for c in input.bytes() {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => anyhow::bail!("invalid base32 character: {}", c as char),
        };
        acc = (acc << 5) | value as u64;
        acc_bits += 5;
        if acc_bits >= 8 {
            acc_bits -= 8;
            out.push((acc >> acc_bits) as u8);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {

    use super::MagnetLink;

    use std::str::FromStr;

    #[test]
    fn parse_magnet_link() {
        let contents = "magnet:?xt=urn:btih:be2d7cd9f6b0fdfc035edfee4ebd567003ebc254&dn=Rick.and.Morty.S07E01.1080p.WEB.H264-NHTFS%5BTGx%5D&tr=udp%3A%2F%2Ftracker.opentrackr.org%3A1337&tr=udp%3A%2F%2Fopen.stealth.si%3A80%2Fannounce&tr=udp%3A%2F%2Ftracker.torrent.eu.org%3A451%2Fannounce&tr=udp%3A%2F%2Fexodus.desync.com%3A6969&tr=udp%3A%2F%2Fopen.demonii.com%3A1337%2Fannounce";
        let expected_trackers = [
            "udp://tracker.opentrackr.org:1337",
            "udp://open.stealth.si:80/announce",
            "udp://tracker.torrent.eu.org:451/announce",
            "udp://exodus.desync.com:6969",
            "udp://open.demonii.com:1337/announce",
        ];
        let expected_info_hash = "be2d7cd9f6b0fdfc035edfee4ebd567003ebc254";
        let expected_name = "Rick.and.Morty.S07E01.1080p.WEB.H264-NHTFS[TGx]";
        let magnet_link = MagnetLink::from_str(contents).unwrap();
        let magnet_link_copy = magnet_link.clone();
        assert_eq!(magnet_link.hex_hash(), expected_info_hash);
        assert_eq!(magnet_link.name.unwrap(), expected_name);
        let announce_list = magnet_link.announce_list.unwrap();
        assert_eq!(announce_list.len(), expected_trackers.len());
        for (actual_url, expected_url) in announce_list.iter().zip(expected_trackers) {
            assert_eq!(actual_url.to_string(), expected_url);
        }
        assert_eq!(contents, magnet_link_copy.to_string())
    }

    #[test]
    fn parse_base32_info_hash() {
        // same 20 bytes in both encodings
        let hex_link = "magnet:?xt=urn:btih:be2d7cd9f6b0fdfc035edfee4ebd567003ebc254";
        let base32_link = "magnet:?xt=urn:btih:XYWXZWPWWD67YA2637XE5PKWOAB6XQSU";
        let from_hex = MagnetLink::from_str(hex_link).unwrap();
        let from_base32 = MagnetLink::from_str(base32_link).unwrap();
        assert_eq!(from_hex.hash(), from_base32.hash());
        assert_eq!(from_base32.hex_hash(), "be2d7cd9f6b0fdfc035edfee4ebd567003ebc254");
    }

    #[test]
    fn parse_peer_hints() {
        let link = "magnet:?xt=urn:btih:be2d7cd9f6b0fdfc035edfee4ebd567003ebc254&x.pe=10.0.0.2%3A6881&x.pe=192.168.1.4%3A51413";
        let magnet_link = MagnetLink::from_str(link).unwrap();
        assert_eq!(magnet_link.peers.len(), 2);
        assert_eq!(magnet_link.peers[0].to_string(), "10.0.0.2:6881");
        assert_eq!(magnet_link.peers[1].to_string(), "192.168.1.4:51413");
        assert_eq!(link, magnet_link.to_string());
    }

    #[test]
    fn reject_bad_links() {
        assert!(MagnetLink::from_str("http://not-a-magnet").is_err());
        assert!(MagnetLink::from_str("magnet:?dn=missing-xt").is_err());
        assert!(MagnetLink::from_str("magnet:?xt=urn:btih:tooshort").is_err());
    }
}
