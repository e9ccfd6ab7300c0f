use std::{io, num::NonZeroUsize, path::Path, path::PathBuf, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::{
    fs,
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::Mutex,
};

use super::{FileStat, FileSystem};
use crate::disk::roots::StorageRootManager;

const OPEN_FILES: usize = 10;

/// Local disk provider. Root keys resolve to real directories through the
/// storage root manager; file handles are cached lru-style like the
/// download storage keeps its output files open.
pub struct LocalFileSystem {
    roots: Arc<StorageRootManager>,
    handles: Mutex<lru::LruCache<PathBuf, Arc<Mutex<fs::File>>>>,
}

impl std::fmt::Debug for LocalFileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalFileSystem").finish()
    }
}

impl LocalFileSystem {
    pub fn new(roots: Arc<StorageRootManager>) -> Self {
        Self {
            roots,
            handles: Mutex::new(lru::LruCache::new(NonZeroUsize::new(OPEN_FILES).unwrap())),
        }
    }

    fn resolve(&self, root: &str, path: &Path) -> io::Result<PathBuf> {
        let base = self.roots.resolve(root).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, format!("unknown storage root {root}"))
        })?;
        Ok(base.join(path))
    }

    async fn open_rw(&self, full_path: &PathBuf) -> io::Result<Arc<Mutex<fs::File>>> {
        let mut handles = self.handles.lock().await;
        if let Some(file) = handles.get(full_path) {
            return Ok(file.clone());
        }
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        tracing::debug!("Creating file handle: {}", full_path.display());
        let file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&full_path)
            .await?;
        let file = Arc::new(Mutex::new(file));
        handles.put(full_path.clone(), file.clone());
        Ok(file)
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    async fn write_at(
        &self,
        root: &str,
        path: &Path,
        offset: u64,
        data: &[u8],
    ) -> io::Result<u64> {
        let full_path = self.resolve(root, path)?;
        let file = self.open_rw(&full_path).await?;
        let mut file = file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        Ok(data.len() as u64)
    }

    async fn read_at(
        &self,
        root: &str,
        path: &Path,
        offset: u64,
        length: usize,
    ) -> io::Result<Bytes> {
        let full_path = self.resolve(root, path)?;
        let file = self.open_rw(&full_path).await?;
        let mut file = file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0; length];
        file.read_exact(&mut buffer).await?;
        Ok(buffer.into())
    }

    async fn set_len(&self, root: &str, path: &Path, length: u64) -> io::Result<()> {
        let full_path = self.resolve(root, path)?;
        let file = self.open_rw(&full_path).await?;
        let file = file.lock().await;
        file.set_len(length).await
    }

    async fn stat(&self, root: &str, path: &Path) -> io::Result<FileStat> {
        let full_path = self.resolve(root, path)?;
        let meta = fs::metadata(&full_path).await?;
        Ok(FileStat {
            size: meta.len(),
            is_file: meta.is_file(),
        })
    }

    async fn exists(&self, root: &str, path: &Path) -> bool {
        let Ok(full_path) = self.resolve(root, path) else {
            return false;
        };
        fs::try_exists(&full_path).await.unwrap_or(false)
    }

    async fn remove(&self, root: &str, path: &Path) -> io::Result<()> {
        let full_path = self.resolve(root, path)?;
        self.handles.lock().await.pop(&full_path);
        fs::remove_file(&full_path).await
    }

    async fn sync(&self, root: &str, path: &Path) -> io::Result<()> {
        let full_path = self.resolve(root, path)?;
        let file = self.open_rw(&full_path).await?;
        let file = file.lock().await;
        file.sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use std::{path::Path, sync::Arc};

    use crate::disk::roots::StorageRootManager;

    use super::{FileSystem, LocalFileSystem};

    #[tokio::test]
    async fn write_read_round_trip() {
        let dir = std::env::temp_dir().join(format!("riptide-fs-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        let roots = Arc::new(StorageRootManager::new(b"salt".to_vec()));
        let key = roots.add_root("downloads", dir.clone());
        let fs = LocalFileSystem::new(roots);

        let path = Path::new("a/b.bin");
        fs.write_at(&key, path, 4, b"world").await.unwrap();
        fs.write_at(&key, path, 0, b"hell").await.unwrap();
        let read = fs.read_at(&key, path, 0, 9).await.unwrap();
        assert_eq!(&read[..], b"hellworld");
        assert!(fs.exists(&key, path).await);
        let stat = fs.stat(&key, path).await.unwrap();
        assert_eq!(stat.size, 9);
        assert!(stat.is_file);

        fs.remove(&key, path).await.unwrap();
        assert!(!fs.exists(&key, path).await);
        assert!(fs.read_at("missing-root", path, 0, 1).await.is_err());
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
