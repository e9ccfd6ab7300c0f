//! Typed view over the session store. Every engine-owned key lives under
//! the `session:` prefix; corrupt entries are logged and treated as
//! absent so a damaged session never prevents startup.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::caps::{self, SessionStore};

pub const TORRENTS_KEY: &str = "session:torrents";
pub const DHT_STATE_KEY: &str = "session:dht:state";

pub fn torrent_state_key(info_hash_hex: &str) -> String {
    format!("session:torrent:{info_hash_hex}:state")
}

pub fn torrent_meta_key(info_hash_hex: &str) -> String {
    format!("session:torrent:{info_hash_hex}:meta")
}

pub fn config_key(name: &str) -> String {
    format!("session:config:{name}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserState {
    Started,
    Paused,
}

/// One row of `session:torrents`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionTorrent {
    pub info_hash_hex: String,
    pub name: String,
    pub magnet: Option<String>,
    #[serde(default)]
    pub trackers: Vec<String>,
    pub added_at: u64,
    pub user_state: UserState,
}

/// `session:torrent:<hex>:state`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorrentState {
    pub bitfield_hex: String,
    pub total_downloaded: u64,
    pub total_uploaded: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<u64>,
}

pub async fn load_torrents(store: &dyn SessionStore) -> Vec<SessionTorrent> {
    let Some(raw) = store.get(TORRENTS_KEY).await else {
        return Vec::new();
    };
    match serde_json::from_slice(&raw) {
        Ok(torrents) => torrents,
        Err(e) => {
            tracing::error!("Session torrent list is corrupt, starting empty: {e}");
            Vec::new()
        }
    }
}

pub async fn save_torrents(store: &dyn SessionStore, torrents: &[SessionTorrent]) {
    caps::set_json(store, TORRENTS_KEY, &torrents).await;
}

pub async fn load_torrent_state(
    store: &dyn SessionStore,
    info_hash_hex: &str,
) -> Option<TorrentState> {
    let raw = store.get(&torrent_state_key(info_hash_hex)).await?;
    match serde_json::from_slice(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::error!(info_hash_hex, "Torrent session state is corrupt: {e}");
            None
        }
    }
}

pub async fn save_torrent_state(
    store: &dyn SessionStore,
    info_hash_hex: &str,
    state: &TorrentState,
) {
    caps::set_json(store, &torrent_state_key(info_hash_hex), state).await;
}

pub async fn load_metainfo(store: &dyn SessionStore, info_hash_hex: &str) -> Option<Bytes> {
    store.get(&torrent_meta_key(info_hash_hex)).await
}

pub async fn save_metainfo(store: &dyn SessionStore, info_hash_hex: &str, raw: Bytes) {
    store.set(&torrent_meta_key(info_hash_hex), raw).await;
}

pub async fn forget_torrent(store: &dyn SessionStore, info_hash_hex: &str) {
    store.delete(&torrent_state_key(info_hash_hex)).await;
    store.delete(&torrent_meta_key(info_hash_hex)).await;
}

pub async fn load_dht_state(store: &dyn SessionStore) -> Option<crate::dht::PersistedDht> {
    let raw = store.get(DHT_STATE_KEY).await?;
    match serde_json::from_slice(&raw) {
        Ok(state) => Some(state),
        Err(e) => {
            tracing::error!("Dht session state is corrupt: {e}");
            None
        }
    }
}

pub async fn save_dht_state(store: &dyn SessionStore, state: &crate::dht::PersistedDht) {
    caps::set_json(store, DHT_STATE_KEY, state).await;
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::caps::{memory::MemorySessionStore, SessionStore};

    use super::*;

    #[tokio::test]
    async fn torrent_list_round_trip() {
        let store = MemorySessionStore::new();
        assert!(load_torrents(&store).await.is_empty());

        let torrents = vec![SessionTorrent {
            info_hash_hex: "aa".repeat(20),
            name: "debian.iso".into(),
            magnet: None,
            trackers: vec!["http://tracker.example/announce".into()],
            added_at: 1_700_000_000_000,
            user_state: UserState::Started,
        }];
        save_torrents(&store, &torrents).await;
        let loaded = load_torrents(&store).await;
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "debian.iso");
        assert_eq!(loaded[0].user_state, UserState::Started);
    }

    #[tokio::test]
    async fn corrupt_session_starts_empty() {
        let store = MemorySessionStore::new();
        store
            .set(TORRENTS_KEY, Bytes::from_static(b"{{{not json"))
            .await;
        assert!(load_torrents(&store).await.is_empty());

        store
            .set(&torrent_state_key("ff"), Bytes::from_static(b"broken"))
            .await;
        assert!(load_torrent_state(&store, "ff").await.is_none());
    }

    #[tokio::test]
    async fn torrent_state_and_meta_are_forgotten_together() {
        let store = MemorySessionStore::new();
        let hex = "ab".repeat(20);
        save_torrent_state(
            &store,
            &hex,
            &TorrentState {
                bitfield_hex: "0f".into(),
                total_downloaded: 100,
                total_uploaded: 50,
                completed_at: None,
            },
        )
        .await;
        save_metainfo(&store, &hex, Bytes::from_static(b"d4:infod...e")).await;

        assert!(load_torrent_state(&store, &hex).await.is_some());
        assert!(load_metainfo(&store, &hex).await.is_some());
        forget_torrent(&store, &hex).await;
        assert!(load_torrent_state(&store, &hex).await.is_none());
        assert!(load_metainfo(&store, &hex).await.is_none());
    }
}
