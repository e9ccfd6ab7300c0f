//! HTTP(S) tracker announces: bencoded GET per BEP 3, compact peers per
//! BEP 23.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

use reqwest::Url;
use serde::{Deserialize, Serialize};

use super::{AnnounceResult, DownloadStat};
use crate::tracker::udp::AnnounceEvent;

#[derive(Serialize, Debug, Clone)]
struct HttpAnnounceParams {
    /// A string of length 20 which this downloader uses as its id.
    peer_id: String,
    /// The port number this peer is listening on.
    port: u16,
    /// The total amount uploaded so far, encoded in base ten ascii.
    uploaded: u64,
    /// The total amount downloaded so far, encoded in base ten ascii.
    downloaded: u64,
    /// The number of bytes this peer still has to download.
    /// Note that this can't be computed from downloaded and the file length since it might be a resume,
    /// and there's a chance that some of the downloaded data failed an integrity check and had to be re-downloaded.
    left: u64,
    compact: u8,
    #[serde(skip_serializing_if = "str::is_empty")]
    event: &'static str,
}

/// `info_hash` needs raw percent encoding which serde_urlencoded cannot
/// produce, so it is appended by hand
fn urlencode_hash(t: &[u8; 20]) -> String {
    let mut encoded = String::with_capacity(3 * t.len());
    for &byte in t {
        encoded.push('%');
        encoded.push_str(&hex::encode([byte]));
    }
    encoded
}

pub async fn announce(
    announce_url: &Url,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
    stat: DownloadStat,
    event: AnnounceEvent,
) -> anyhow::Result<AnnounceResult> {
    tracing::debug!("Announcing tracker {announce_url} via HTTP");
    let params = HttpAnnounceParams {
        peer_id: String::from_utf8_lossy(&peer_id).into_owned(),
        port,
        uploaded: stat.uploaded,
        downloaded: stat.downloaded,
        left: stat.left,
        compact: 1,
        event: event.as_str(),
    };
    let separator = if announce_url.query().is_some() { '&' } else { '?' };
    let tracker_url = format!(
        "{}{}{}&info_hash={}",
        announce_url,
        separator,
        serde_urlencoded::to_string(&params)?,
        urlencode_hash(&info_hash)
    );
    let response = reqwest::get(tracker_url).await?;
    let announce_bytes = response.bytes().await?;
    let response: HttpAnnounceResponse = serde_bencode::from_bytes(&announce_bytes)?;
    if let Some(reason) = response.failure_reason {
        anyhow::bail!("tracker failure: {reason}");
    }
    Ok(response.into())
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct HttpFullPeer {
    ip: String,
    port: u16,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(untagged)]
enum HttpPeerList {
    Full(Vec<HttpFullPeer>),
    Compact(bytes::Bytes),
}

#[derive(Deserialize, Serialize, Debug, Clone)]
struct HttpAnnounceResponse {
    #[serde(default)]
    interval: Option<u32>,
    #[serde(rename = "min interval", default)]
    min_interval: Option<u32>,
    #[serde(default)]
    peers: Option<HttpPeerList>,
    #[serde(default)]
    complete: Option<u32>,
    #[serde(default)]
    incomplete: Option<u32>,
    #[serde(rename = "failure reason", default)]
    failure_reason: Option<String>,
}

impl From<HttpAnnounceResponse> for AnnounceResult {
    fn from(val: HttpAnnounceResponse) -> AnnounceResult {
        AnnounceResult {
            interval: val.min_interval.or(val.interval),
            seeders: val.complete,
            leechers: val.incomplete,
            peers: val.peer_addrs(),
        }
    }
}

impl HttpAnnounceResponse {
    fn peer_addrs(&self) -> Vec<SocketAddr> {
        let mut result = Vec::new();
        match &self.peers {
            Some(HttpPeerList::Full(peers)) => {
                for peer in peers {
                    let Ok(ip) = IpAddr::from_str(&peer.ip) else {
                        continue;
                    };
                    result.push(SocketAddr::new(ip, peer.port));
                }
            }
            Some(HttpPeerList::Compact(bytes)) => {
                for chunk in bytes.chunks_exact(6) {
                    let ip = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
                    let port = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
                    result.push(SocketAddr::new(Ipv4Addr::from_bits(ip).into(), port));
                }
            }
            None => {}
        };
        result
    }
}
