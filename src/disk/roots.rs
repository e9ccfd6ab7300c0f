use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Mutex,
};

use crate::caps::RootKey;

/// One user-chosen download destination. The engine only ever sees the
/// opaque key; the real path stays inside the provider layer.
#[derive(Debug, Clone)]
pub struct StorageRoot {
    pub key: RootKey,
    pub label: String,
    pub path: Option<PathBuf>,
}

/// Source of truth for storage roots. Roots can be pushed from outside
/// (the host application owns the user's folder choices); everything
/// else only reads.
#[derive(Debug)]
pub struct StorageRootManager {
    salt: Vec<u8>,
    roots: Mutex<HashMap<RootKey, StorageRoot>>,
}

impl StorageRootManager {
    pub fn new(salt: Vec<u8>) -> Self {
        Self {
            salt,
            roots: Mutex::new(HashMap::new()),
        }
    }

    fn key_for(&self, path: &std::path::Path) -> RootKey {
        let mut keyed = self.salt.clone();
        keyed.extend_from_slice(path.to_string_lossy().as_bytes());
        hex::encode(crate::utils::sha1(&keyed))
    }

    /// Register a root and return its key. Re-adding the same path yields
    /// the same key.
    pub fn add_root(&self, label: &str, path: PathBuf) -> RootKey {
        let key = self.key_for(&path);
        let root = StorageRoot {
            key: key.clone(),
            label: label.to_owned(),
            path: Some(path),
        };
        self.roots.lock().unwrap().insert(key.clone(), root);
        key
    }

    /// Adopt a root pushed from outside with a precomputed key
    pub fn push_root(&self, root: StorageRoot) {
        self.roots.lock().unwrap().insert(root.key.clone(), root);
    }

    pub fn remove_root(&self, key: &str) -> Option<StorageRoot> {
        self.roots.lock().unwrap().remove(key)
    }

    pub fn resolve(&self, key: &str) -> Option<PathBuf> {
        self.roots.lock().unwrap().get(key)?.path.clone()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.roots.lock().unwrap().contains_key(key)
    }

    pub fn list(&self) -> Vec<StorageRoot> {
        let mut roots: Vec<_> = self.roots.lock().unwrap().values().cloned().collect();
        roots.sort_by(|a, b| a.key.cmp(&b.key));
        roots
    }
}
