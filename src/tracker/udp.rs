//! UDP tracker protocol (BEP 15): connect then announce, with 32 bit
//! transaction ids echoed in every response.

use std::{
    collections::HashMap,
    io::{Cursor, Read},
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    time::Duration,
};

use anyhow::Context;
use bytes::{BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::caps::UdpChannel;

pub const CONNECT_MAGIC: u64 = 0x41727101980;
/// Base step timeout; doubles on every retry
pub const STEP_TIMEOUT: Duration = Duration::from_secs(15);
pub const MAX_RETRIES: u32 = 4;

#[derive(Debug, Clone, Copy)]
pub enum AnnounceEvent {
    None,
    Completed,
    Started,
    Stopped,
}

impl AnnounceEvent {
    fn as_u32(&self) -> u32 {
        match self {
            AnnounceEvent::None => 0,
            AnnounceEvent::Completed => 1,
            AnnounceEvent::Started => 2,
            AnnounceEvent::Stopped => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AnnounceEvent::None => "",
            AnnounceEvent::Completed => "completed",
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone)]
pub enum UdpRequestBody {
    Connect,
    Announce {
        connection_id: u64,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        downloaded: u64,
        left: u64,
        uploaded: u64,
        event: AnnounceEvent,
        key: u32,
        num_want: i32,
        port: u16,
    },
}

#[derive(Debug)]
pub struct UdpRequest {
    pub transaction_id: u32,
    pub body: UdpRequestBody,
    pub tracker_addr: SocketAddr,
    pub response: oneshot::Sender<UdpResponse>,
}

impl UdpRequest {
    pub fn as_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        match &self.body {
            UdpRequestBody::Connect => {
                out.put_u64(CONNECT_MAGIC);
                out.put_u32(0);
                out.put_u32(self.transaction_id);
            }
            UdpRequestBody::Announce {
                connection_id,
                info_hash,
                peer_id,
                downloaded,
                left,
                uploaded,
                event,
                key,
                num_want,
                port,
            } => {
                out.put_u64(*connection_id);
                out.put_u32(1);
                out.put_u32(self.transaction_id);
                out.put_slice(info_hash);
                out.put_slice(peer_id);
                out.put_u64(*downloaded);
                out.put_u64(*left);
                out.put_u64(*uploaded);
                out.put_u32(event.as_u32());
                out.put_u32(0); // ip, 0 means use the sender address
                out.put_u32(*key);
                out.put_i32(*num_want);
                out.put_u16(*port);
            }
        }
        out.freeze()
    }
}

#[derive(Debug, Clone)]
pub struct UdpResponse {
    pub transaction_id: u32,
    pub body: UdpResponseBody,
}

#[derive(Debug, Clone)]
pub enum UdpResponseBody {
    Connect {
        connection_id: u64,
    },
    Announce {
        interval: u32,
        leechers: u32,
        seeders: u32,
        peers: Vec<SocketAddr>,
    },
    Error {
        message: String,
    },
}

fn read_u32(reader: &mut impl Read) -> Option<u32> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf).ok()?;
    Some(u32::from_be_bytes(buf))
}

fn read_u64(reader: &mut impl Read) -> Option<u64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf).ok()?;
    Some(u64::from_be_bytes(buf))
}

impl UdpResponse {
    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut cursor = Cursor::new(bytes);

        let action = read_u32(&mut cursor).context("read action")?;
        let transaction_id = read_u32(&mut cursor).context("read transaction id")?;

        let body = match action {
            0 => {
                let connection_id = read_u64(&mut cursor).context("read connection id")?;
                UdpResponseBody::Connect { connection_id }
            }
            1 => {
                let interval = read_u32(&mut cursor).context("read interval")?;
                let leechers = read_u32(&mut cursor).context("read leechers")?;
                let seeders = read_u32(&mut cursor).context("read seeders")?;
                let rest = &bytes[cursor.position() as usize..];
                let mut peers = Vec::with_capacity(rest.len() / 6);
                for chunk in rest.chunks_exact(6) {
                    let ip = u32::from_be_bytes(chunk[0..4].try_into().unwrap());
                    let port = u16::from_be_bytes(chunk[4..6].try_into().unwrap());
                    peers.push(SocketAddr::V4(SocketAddrV4::new(
                        Ipv4Addr::from_bits(ip),
                        port,
                    )));
                }
                UdpResponseBody::Announce {
                    interval,
                    leechers,
                    seeders,
                    peers,
                }
            }
            3 => {
                let rest = &bytes[cursor.position() as usize..];
                UdpResponseBody::Error {
                    message: String::from_utf8_lossy(rest).into_owned(),
                }
            }
            rest => anyhow::bail!("action {rest} is not recognized"),
        };
        Ok(UdpResponse {
            transaction_id,
            body,
        })
    }
}

/// Handle to the single udp tracker socket worker
#[derive(Debug, Clone)]
pub struct UdpTrackerChannel {
    sender: mpsc::Sender<UdpRequest>,
}

impl UdpTrackerChannel {
    /// Send one request and wait for its matching response with the BEP
    /// 15 retry schedule
    pub async fn request(
        &self,
        body: UdpRequestBody,
        addr: SocketAddr,
    ) -> anyhow::Result<UdpResponse> {
        for attempt in 0..MAX_RETRIES {
            let transaction_id = rand::random();
            let (tx, rx) = oneshot::channel();
            let request = UdpRequest {
                transaction_id,
                body: body.clone(),
                tracker_addr: addr,
                response: tx,
            };
            self.sender.send(request).await.context("udp worker is gone")?;
            let step = STEP_TIMEOUT * 2u32.pow(attempt);
            match tokio::time::timeout(step, rx).await {
                Ok(Ok(response)) => return Ok(response),
                Ok(Err(_)) => anyhow::bail!("udp worker dropped the transaction"),
                Err(_) => {
                    tracing::debug!(%addr, attempt, "Udp tracker request timed out");
                }
            }
        }
        anyhow::bail!("udp tracker did not respond after {MAX_RETRIES} attempts")
    }

    pub async fn connect(&self, addr: SocketAddr) -> anyhow::Result<u64> {
        let response = self.request(UdpRequestBody::Connect, addr).await?;
        match response.body {
            UdpResponseBody::Connect { connection_id } => Ok(connection_id),
            UdpResponseBody::Error { message } => anyhow::bail!("tracker error: {message}"),
            _ => anyhow::bail!("expected connect response"),
        }
    }
}

/// Owns the udp tracker socket, multiplexes transactions over it
pub struct UdpTrackerWorker {
    channel: Box<dyn UdpChannel>,
    datagrams: flume::Receiver<(SocketAddr, Bytes)>,
}

impl UdpTrackerWorker {
    pub fn new(
        channel: Box<dyn UdpChannel>,
        datagrams: flume::Receiver<(SocketAddr, Bytes)>,
    ) -> Self {
        Self { channel, datagrams }
    }

    pub fn spawn(
        self,
        task_tracker: &TaskTracker,
        cancellation_token: CancellationToken,
    ) -> UdpTrackerChannel {
        let (request_tx, mut request_rx) = mpsc::channel::<UdpRequest>(100);
        task_tracker.spawn(async move {
            let mut pending: HashMap<u32, oneshot::Sender<UdpResponse>> = HashMap::new();
            loop {
                tokio::select! {
                    incoming = self.datagrams.recv_async() => {
                        let Ok((addr, bytes)) = incoming else { break };
                        let response = match UdpResponse::from_bytes(&bytes) {
                            Ok(response) => response,
                            Err(e) => {
                                tracing::debug!(%addr, "Failed to parse udp tracker response: {e}");
                                continue;
                            }
                        };
                        if let Some(reply) = pending.remove(&response.transaction_id) {
                            let _ = reply.send(response);
                        } else {
                            tracing::debug!(
                                transaction_id = response.transaction_id,
                                "Response for unknown transaction"
                            );
                        }
                    }
                    request = request_rx.recv() => {
                        let Some(request) = request else { break };
                        self.channel.send_to(request.tracker_addr, request.as_bytes());
                        pending.insert(request.transaction_id, request.response);
                    }
                    _ = cancellation_token.cancelled() => break,
                }
            }
            tracing::debug!("Udp tracker worker closed");
        });
        UdpTrackerChannel { sender: request_tx }
    }
}
