use std::{
    collections::HashSet,
    net::SocketAddr,
    time::Duration,
};

use anyhow::Context;
use reqwest::Url;
use tokio::sync::oneshot;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use crate::{bitfield::BitField, metainfo::Info};

pub mod http;
pub mod udp;

use udp::{AnnounceEvent, UdpRequestBody, UdpResponseBody};
pub use udp::UdpTrackerChannel;

pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);
pub const MIN_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(60);
pub const ANNOUNCE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AnnounceResult {
    /// Seconds until the next announce, when the tracker cares
    pub interval: Option<u32>,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

/// Transfer totals reported to trackers
#[derive(Clone, Copy, Debug)]
pub struct DownloadStat {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

impl DownloadStat {
    pub fn empty(left: u64) -> Self {
        Self {
            downloaded: 0,
            uploaded: 0,
            left,
        }
    }

    pub fn new(bitfield: &BitField, info: &Info) -> Self {
        let total_len = info.total_size();
        let mut downloaded = 0;
        for piece_i in bitfield.pieces() {
            downloaded += info.piece_size(piece_i) as u64;
        }
        Self {
            downloaded,
            uploaded: 0,
            left: total_len - downloaded,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TrackerStatus {
    #[default]
    Idle,
    Announcing,
    Ok,
    Error(String),
}

#[derive(Debug)]
pub enum TrackerKind {
    Http,
    Udp(UdpTrackerChannel),
}

impl TrackerKind {
    pub fn from_url(url: &Url, channel: &UdpTrackerChannel) -> anyhow::Result<Self> {
        match url.scheme() {
            "https" | "http" => Ok(Self::Http),
            "udp" => Ok(Self::Udp(channel.clone())),
            rest => Err(anyhow::anyhow!("url scheme {rest} is not supported")),
        }
    }
}

/// One announce url and its cadence state
#[derive(Debug)]
pub struct Tracker {
    pub url: Url,
    kind: TrackerKind,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listen_port: u16,
    pub status: TrackerStatus,
    pub announce_interval: Duration,
    pub seeders: Option<u32>,
    pub leechers: Option<u32>,
    pub last_error: Option<String>,
    last_announced_at: Option<Duration>,
    sent_started: bool,
    sent_completed: bool,
    /// Connection ids are valid for two minutes on the tracker side
    udp_connection: Option<(u64, Duration)>,
    pending: Option<oneshot::Receiver<anyhow::Result<AnnounceOutcome>>>,
    discovered: HashSet<SocketAddr>,
}

impl Tracker {
    pub fn new(
        url: Url,
        kind: TrackerKind,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listen_port: u16,
    ) -> Self {
        Self {
            url,
            kind,
            info_hash,
            peer_id,
            listen_port,
            status: TrackerStatus::default(),
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            seeders: None,
            leechers: None,
            last_error: None,
            last_announced_at: None,
            sent_started: false,
            sent_completed: false,
            udp_connection: None,
            pending: None,
            discovered: HashSet::new(),
        }
    }

    pub fn unique_peers_discovered(&self) -> usize {
        self.discovered.len()
    }

    fn is_due(&self, now: Duration) -> bool {
        match self.last_announced_at {
            Some(at) => now.saturating_sub(at) >= self.announce_interval,
            None => true,
        }
    }

    fn next_event(&mut self, completed_now: bool) -> AnnounceEvent {
        if !self.sent_started {
            self.sent_started = true;
            return AnnounceEvent::Started;
        }
        if completed_now && !self.sent_completed {
            self.sent_completed = true;
            return AnnounceEvent::Completed;
        }
        AnnounceEvent::None
    }

    /// Advance the tracker: poll the in-flight announce and start a new
    /// one when due. Returns freshly discovered peers.
    pub fn tick(
        &mut self,
        now: Duration,
        stat: DownloadStat,
        completed_now: bool,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) -> Vec<SocketAddr> {
        let mut new_peers = Vec::new();

        if let Some(pending) = &mut self.pending {
            match pending.try_recv() {
                Ok(Ok(outcome)) => {
                    self.pending = None;
                    self.status = TrackerStatus::Ok;
                    self.last_error = None;
                    if let Some(connection_id) = outcome.udp_connection_id {
                        self.udp_connection = Some((connection_id, now));
                    }
                    let result = outcome.result;
                    self.seeders = result.seeders;
                    self.leechers = result.leechers;
                    if let Some(interval) = result.interval {
                        self.announce_interval = Duration::from_secs(interval as u64)
                            .clamp(MIN_ANNOUNCE_INTERVAL, DEFAULT_ANNOUNCE_INTERVAL);
                    }
                    for peer in result.peers {
                        if self.discovered.insert(peer) {
                            new_peers.push(peer);
                        }
                    }
                }
                Ok(Err(e)) => {
                    self.pending = None;
                    tracing::warn!(url = %self.url, "Announce request failed: {e}");
                    self.last_error = Some(e.to_string());
                    self.status = TrackerStatus::Error(e.to_string());
                }
                Err(oneshot::error::TryRecvError::Empty) => {}
                Err(oneshot::error::TryRecvError::Closed) => {
                    self.pending = None;
                    self.status = TrackerStatus::Error("announce task vanished".into());
                }
            }
        }

        if self.pending.is_none() && self.is_due(now) {
            let event = self.next_event(completed_now);
            self.start_announce(now, stat, event, task_tracker, cancellation_token);
        }

        new_peers
    }

    fn start_announce(
        &mut self,
        now: Duration,
        stat: DownloadStat,
        event: AnnounceEvent,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) {
        self.last_announced_at = Some(now);
        self.status = TrackerStatus::Announcing;
        let (reply, response) = oneshot::channel();
        self.pending = Some(response);

        let url = self.url.clone();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;
        let listen_port = self.listen_port;
        let connection = self.udp_connection.filter(|(_, at)| {
            now.saturating_sub(*at) < Duration::from_secs(110)
        });
        let kind = match &self.kind {
            TrackerKind::Http => None,
            TrackerKind::Udp(channel) => Some(channel.clone()),
        };
        let cancellation_token = cancellation_token.clone();
        task_tracker.spawn(async move {
            let announce = async {
                tokio::time::timeout(
                    ANNOUNCE_TIMEOUT,
                    run_announce(
                        &url,
                        kind,
                        connection.map(|(id, _)| id),
                        info_hash,
                        peer_id,
                        listen_port,
                        stat,
                        event,
                    ),
                )
                .await
                .unwrap_or_else(|_| Err(anyhow::anyhow!("announce timed out")))
            };
            tokio::select! {
                result = announce => {
                    let _ = reply.send(result);
                }
                _ = cancellation_token.cancelled() => {}
            }
        });
    }

    /// Fire-and-forget `stopped` on shutdown or removal
    pub fn announce_stopped(
        &mut self,
        stat: DownloadStat,
        task_tracker: &TaskTracker,
    ) {
        if !self.sent_started {
            return;
        }
        let url = self.url.clone();
        let info_hash = self.info_hash;
        let peer_id = self.peer_id;
        let listen_port = self.listen_port;
        let kind = match &self.kind {
            TrackerKind::Http => None,
            TrackerKind::Udp(channel) => Some(channel.clone()),
        };
        task_tracker.spawn(async move {
            let result = tokio::time::timeout(
                Duration::from_secs(2),
                run_announce(
                    &url,
                    kind,
                    None,
                    info_hash,
                    peer_id,
                    listen_port,
                    stat,
                    AnnounceEvent::Stopped,
                ),
            )
            .await;
            if result.is_err() {
                tracing::debug!(%url, "Stopped announce timed out");
            }
        });
    }
}

/// What an announce task reports back to the tick loop
#[derive(Debug)]
struct AnnounceOutcome {
    result: AnnounceResult,
    /// Fresh udp connection id, reusable for roughly two minutes
    udp_connection_id: Option<u64>,
}

#[allow(clippy::too_many_arguments)]
async fn run_announce(
    url: &Url,
    udp: Option<UdpTrackerChannel>,
    connection_id: Option<u64>,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    listen_port: u16,
    stat: DownloadStat,
    event: AnnounceEvent,
) -> anyhow::Result<AnnounceOutcome> {
    match udp {
        None => Ok(AnnounceOutcome {
            result: http::announce(url, info_hash, peer_id, listen_port, stat, event).await?,
            udp_connection_id: None,
        }),
        Some(channel) => {
            let addrs = url.socket_addrs(|| None)?;
            let addr = *addrs.first().context("domain resolved in 0 addrs")?;
            let connection_id = match connection_id {
                Some(id) => id,
                None => channel.connect(addr).await?,
            };
            let response = channel
                .request(
                    UdpRequestBody::Announce {
                        connection_id,
                        info_hash,
                        peer_id,
                        downloaded: stat.downloaded,
                        left: stat.left,
                        uploaded: stat.uploaded,
                        event,
                        key: rand::random(),
                        num_want: -1,
                        port: listen_port,
                    },
                    addr,
                )
                .await?;
            match response.body {
                UdpResponseBody::Announce {
                    interval,
                    leechers,
                    seeders,
                    peers,
                } => Ok(AnnounceOutcome {
                    result: AnnounceResult {
                        interval: Some(interval),
                        seeders: Some(seeders),
                        leechers: Some(leechers),
                        peers,
                    },
                    udp_connection_id: Some(connection_id),
                }),
                UdpResponseBody::Error { message } => {
                    Err(anyhow::anyhow!("tracker error: {message}"))
                }
                _ => Err(anyhow::anyhow!("expected announce response")),
            }
        }
    }
}

/// All trackers of one torrent
#[derive(Debug)]
pub struct TrackerManager {
    trackers: Vec<Tracker>,
}

impl TrackerManager {
    pub fn new(
        urls: Vec<Url>,
        udp_channel: &UdpTrackerChannel,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listen_port: u16,
    ) -> Self {
        let mut trackers = Vec::with_capacity(urls.len());
        for url in urls {
            let Ok(kind) = TrackerKind::from_url(&url, udp_channel) else {
                tracing::warn!(%url, "Skipping tracker with unsupported scheme");
                continue;
            };
            trackers.push(Tracker::new(url, kind, info_hash, peer_id, listen_port));
        }
        Self { trackers }
    }

    pub fn add_tracker(
        &mut self,
        url: Url,
        udp_channel: &UdpTrackerChannel,
        info_hash: [u8; 20],
        peer_id: [u8; 20],
        listen_port: u16,
    ) {
        if self.trackers.iter().any(|t| t.url == url) {
            return;
        }
        if let Ok(kind) = TrackerKind::from_url(&url, udp_channel) {
            self.trackers
                .push(Tracker::new(url, kind, info_hash, peer_id, listen_port));
        }
    }

    pub fn tick(
        &mut self,
        now: Duration,
        stat: DownloadStat,
        completed_now: bool,
        task_tracker: &TaskTracker,
        cancellation_token: &CancellationToken,
    ) -> Vec<SocketAddr> {
        let mut peers = Vec::new();
        for tracker in &mut self.trackers {
            peers.extend(tracker.tick(now, stat, completed_now, task_tracker, cancellation_token));
        }
        peers
    }

    pub fn announce_stopped(&mut self, stat: DownloadStat, task_tracker: &TaskTracker) {
        for tracker in &mut self.trackers {
            tracker.announce_stopped(stat, task_tracker);
        }
    }

    pub fn trackers(&self) -> &[Tracker] {
        &self.trackers
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;
    use tokio_util::{sync::CancellationToken, task::TaskTracker};

    use super::{
        AnnounceResult, DownloadStat, Tracker, TrackerKind, TrackerStatus,
    };

    fn http_tracker() -> Tracker {
        Tracker::new(
            "http://tracker.example/announce".parse().unwrap(),
            TrackerKind::Http,
            [1; 20],
            [2; 20],
            6881,
        )
    }

    #[tokio::test]
    async fn announce_result_updates_state() {
        let mut tracker = http_tracker();
        // fake an in-flight announce and resolve it by hand
        let (reply, response) = oneshot::channel();
        tracker.pending = Some(response);
        tracker.last_announced_at = Some(Duration::from_secs(1));
        tracker.announce_interval = Duration::from_secs(1800);
        reply
            .send(Ok(super::AnnounceOutcome {
                result: AnnounceResult {
                    interval: Some(300),
                    seeders: Some(12),
                    leechers: Some(7),
                    peers: vec!["10.0.0.1:6881".parse().unwrap()],
                },
                udp_connection_id: None,
            }))
            .unwrap();

        let task_tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let peers = tracker.tick(
            Duration::from_secs(2),
            DownloadStat::empty(100),
            false,
            &task_tracker,
            &token,
        );
        assert_eq!(peers.len(), 1);
        assert_eq!(tracker.status, TrackerStatus::Ok);
        assert_eq!(tracker.seeders, Some(12));
        assert_eq!(tracker.leechers, Some(7));
        assert_eq!(tracker.announce_interval, Duration::from_secs(300));
        assert_eq!(tracker.unique_peers_discovered(), 1);

        // the same peer twice is not new
        let (reply, response) = oneshot::channel();
        tracker.pending = Some(response);
        reply
            .send(Ok(super::AnnounceOutcome {
                result: AnnounceResult {
                    interval: None,
                    seeders: None,
                    leechers: None,
                    peers: vec!["10.0.0.1:6881".parse().unwrap()],
                },
                udp_connection_id: None,
            }))
            .unwrap();
        let peers = tracker.tick(
            Duration::from_secs(3),
            DownloadStat::empty(100),
            false,
            &task_tracker,
            &token,
        );
        assert!(peers.is_empty());
        assert_eq!(tracker.unique_peers_discovered(), 1);
    }

    #[tokio::test]
    async fn announce_failure_keeps_torrent_alive() {
        let mut tracker = http_tracker();
        let (reply, response) = oneshot::channel();
        tracker.pending = Some(response);
        tracker.last_announced_at = Some(Duration::from_secs(1));
        reply.send(Err(anyhow::anyhow!("connection refused"))).unwrap();

        let task_tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let peers = tracker.tick(
            Duration::from_secs(2),
            DownloadStat::empty(100),
            false,
            &task_tracker,
            &token,
        );
        assert!(peers.is_empty());
        assert!(matches!(tracker.status, TrackerStatus::Error(_)));
        assert_eq!(tracker.last_error.as_deref(), Some("connection refused"));
    }

    #[test]
    fn event_sequence_is_started_completed_once() {
        let mut tracker = http_tracker();
        assert!(matches!(
            tracker.next_event(false),
            super::AnnounceEvent::Started
        ));
        assert!(matches!(tracker.next_event(false), super::AnnounceEvent::None));
        assert!(matches!(
            tracker.next_event(true),
            super::AnnounceEvent::Completed
        ));
        assert!(matches!(tracker.next_event(true), super::AnnounceEvent::None));
    }
}
