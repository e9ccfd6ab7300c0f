use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use tokio::sync::{oneshot, Notify};
use tokio_util::task::TaskTracker;

use crate::caps::{FileSystem, RootKey};

pub mod hashing;
pub mod roots;

use hashing::HasherPool;

/// Final word on one queued write. Fires exactly once per job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Success { bytes_written: u64 },
    HashMismatch,
    IoError(String),
    InvalidArgs,
}

/// One contiguous byte range inside one file
#[derive(Debug, Clone)]
pub struct Segment {
    pub path: PathBuf,
    pub offset: u64,
    pub data: Bytes,
}

/// Write request covering one verified piece. Multi segment when the
/// piece spans file boundaries; the hash always covers the whole
/// concatenated payload.
#[derive(Debug, Clone)]
pub struct VerifiedWrite {
    pub root: RootKey,
    pub segments: Vec<Segment>,
    pub expected_sha1: [u8; 20],
}

impl VerifiedWrite {
    /// Single file single range convenience constructor
    pub fn single(
        root: RootKey,
        path: PathBuf,
        offset: u64,
        data: Bytes,
        expected_sha1: [u8; 20],
    ) -> Self {
        Self {
            root,
            segments: vec![Segment { path, offset, data }],
            expected_sha1,
        }
    }

    pub fn total_len(&self) -> u64 {
        self.segments.iter().map(|s| s.data.len() as u64).sum()
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DiskMetrics {
    pub pending_jobs: usize,
    pub pending_bytes: u64,
    pub batches_flushed: u64,
    pub jobs_completed: u64,
}

#[derive(Debug, Default)]
struct InFlight {
    jobs: AtomicU64,
    bytes: AtomicU64,
    completed: AtomicU64,
    drained: Notify,
}

/// Batched disk writer. Jobs pile up during a tick and flush as one
/// batch at tick end; hashing runs on the blocking pool and bytes only
/// reach the filesystem when the hash matches. Writes to the same file
/// are serialised by a per file lock, which covers the spec's same
/// region guarantee.
pub struct DiskQueue {
    fs: Arc<dyn FileSystem>,
    hasher: HasherPool,
    task_tracker: TaskTracker,
    pending: Vec<(VerifiedWrite, oneshot::Sender<WriteOutcome>)>,
    in_flight: Arc<InFlight>,
    file_locks: Arc<Mutex<HashMap<(RootKey, PathBuf), Arc<tokio::sync::Mutex<()>>>>>,
    batches_flushed: u64,
}

impl std::fmt::Debug for DiskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskQueue")
            .field("pending", &self.pending.len())
            .field("batches_flushed", &self.batches_flushed)
            .finish()
    }
}

impl DiskQueue {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        hasher: Arc<dyn crate::caps::Hasher>,
        hash_workers: usize,
        task_tracker: TaskTracker,
    ) -> Self {
        Self {
            fs,
            hasher: HasherPool::new(hash_workers, hasher),
            task_tracker,
            pending: Vec::new(),
            in_flight: Arc::new(InFlight::default()),
            file_locks: Arc::new(Mutex::new(HashMap::new())),
            batches_flushed: 0,
        }
    }

    /// Queue a hash-and-write. The returned receiver resolves exactly
    /// once, after the batch containing this job is flushed.
    pub fn queue_verified_write(&mut self, write: VerifiedWrite) -> oneshot::Receiver<WriteOutcome> {
        let (reply, response) = oneshot::channel();
        self.pending.push((write, reply));
        response
    }

    /// Bytes that are queued or being written; feeds backpressure
    pub fn outstanding_bytes(&self) -> u64 {
        let pending: u64 = self.pending.iter().map(|(w, _)| w.total_len()).sum();
        pending + self.in_flight.bytes.load(Ordering::Acquire)
    }

    pub fn metrics(&self) -> DiskMetrics {
        DiskMetrics {
            pending_jobs: self.pending.len()
                + self.in_flight.jobs.load(Ordering::Acquire) as usize,
            pending_bytes: self.outstanding_bytes(),
            batches_flushed: self.batches_flushed,
            jobs_completed: self.in_flight.completed.load(Ordering::Acquire),
        }
    }

    /// Kick off everything queued since the last flush. Called once per
    /// engine tick.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.batches_flushed += 1;
        let batch = std::mem::take(&mut self.pending);
        tracing::trace!(jobs = batch.len(), "Flushing disk batch");
        for (write, reply) in batch {
            let bytes = write.total_len();
            self.in_flight.jobs.fetch_add(1, Ordering::AcqRel);
            self.in_flight.bytes.fetch_add(bytes, Ordering::AcqRel);
            let fs = self.fs.clone();
            let hasher = self.hasher.clone();
            let locks = self.file_locks.clone();
            let in_flight = self.in_flight.clone();
            self.task_tracker.spawn(async move {
                let outcome = run_job(fs, hasher, locks, write).await;
                let _ = reply.send(outcome);
                in_flight.jobs.fetch_sub(1, Ordering::AcqRel);
                in_flight.bytes.fetch_sub(bytes, Ordering::AcqRel);
                in_flight.completed.fetch_add(1, Ordering::AcqRel);
                in_flight.drained.notify_waiters();
            });
        }
    }

    /// Flush and wait until every completion has fired
    pub async fn drain(&mut self) {
        self.flush();
        loop {
            if self.in_flight.jobs.load(Ordering::Acquire) == 0 {
                return;
            }
            let notified = self.in_flight.drained.notified();
            if self.in_flight.jobs.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Present for interface parity with paused transports; there is no
    /// pause mechanism in the queue itself
    pub fn resume(&self) {}
}

async fn run_job(
    fs: Arc<dyn FileSystem>,
    hasher: HasherPool,
    locks: Arc<Mutex<HashMap<(RootKey, PathBuf), Arc<tokio::sync::Mutex<()>>>>>,
    write: VerifiedWrite,
) -> WriteOutcome {
    if write.segments.is_empty() || write.segments.iter().any(|s| s.data.is_empty()) {
        return WriteOutcome::InvalidArgs;
    }

    let data: Vec<Bytes> = write.segments.iter().map(|s| s.data.clone()).collect();
    if !hasher.verify(write.expected_sha1, data).await {
        return WriteOutcome::HashMismatch;
    }

    let mut bytes_written = 0;
    for segment in &write.segments {
        let lock = {
            let mut locks = locks.lock().unwrap();
            locks
                .entry((write.root.clone(), segment.path.clone()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;
        match fs
            .write_at(&write.root, &segment.path, segment.offset, &segment.data)
            .await
        {
            Ok(written) => bytes_written += written,
            Err(e) => return WriteOutcome::IoError(e.to_string()),
        }
    }
    WriteOutcome::Success { bytes_written }
}

#[cfg(test)]
mod tests {
    use std::{path::PathBuf, sync::Arc};

    use bytes::Bytes;
    use tokio_util::task::TaskTracker;

    use crate::caps::memory::MemoryFileSystem;

    use super::{DiskQueue, Segment, VerifiedWrite, WriteOutcome};

    fn queue(fs: &MemoryFileSystem) -> DiskQueue {
        DiskQueue::new(
            Arc::new(fs.clone()),
            Arc::new(crate::caps::Sha1Hasher),
            2,
            TaskTracker::new(),
        )
    }

    #[tokio::test]
    async fn verified_write_hits_disk_on_match() {
        let fs = MemoryFileSystem::new();
        let mut queue = queue(&fs);
        let data = Bytes::from_static(b"piece content");
        let hash = crate::utils::sha1(&data);
        let completion = queue.queue_verified_write(VerifiedWrite::single(
            "root".into(),
            PathBuf::from("out.bin"),
            4,
            data.clone(),
            hash,
        ));
        assert_eq!(queue.metrics().pending_jobs, 1);
        queue.drain().await;
        assert_eq!(
            completion.await.unwrap(),
            WriteOutcome::Success { bytes_written: 13 }
        );
        let on_disk = fs.contents("root", std::path::Path::new("out.bin")).unwrap();
        assert_eq!(&on_disk[4..], &data[..]);
        assert_eq!(queue.metrics().jobs_completed, 1);
    }

    #[tokio::test]
    async fn hash_mismatch_never_writes() {
        let fs = MemoryFileSystem::new();
        let mut queue = queue(&fs);
        let completion = queue.queue_verified_write(VerifiedWrite::single(
            "root".into(),
            PathBuf::from("out.bin"),
            0,
            Bytes::from_static(b"corrupted"),
            [0; 20],
        ));
        queue.drain().await;
        assert_eq!(completion.await.unwrap(), WriteOutcome::HashMismatch);
        assert!(fs.contents("root", std::path::Path::new("out.bin")).is_none());
    }

    #[tokio::test]
    async fn spanning_piece_writes_every_segment() {
        let fs = MemoryFileSystem::new();
        let mut queue = queue(&fs);
        let piece = Bytes::from_static(b"aaaaabbbbbbbbbb");
        let hash = crate::utils::sha1(&piece);
        let completion = queue.queue_verified_write(VerifiedWrite {
            root: "root".into(),
            segments: vec![
                Segment {
                    path: PathBuf::from("a.bin"),
                    offset: 0,
                    data: piece.slice(0..5),
                },
                Segment {
                    path: PathBuf::from("b.bin"),
                    offset: 0,
                    data: piece.slice(5..),
                },
            ],
            expected_sha1: hash,
        });
        queue.drain().await;
        assert_eq!(
            completion.await.unwrap(),
            WriteOutcome::Success { bytes_written: 15 }
        );
        assert_eq!(
            fs.contents("root", std::path::Path::new("a.bin")).unwrap(),
            b"aaaaa"
        );
        assert_eq!(
            fs.contents("root", std::path::Path::new("b.bin")).unwrap(),
            b"bbbbbbbbbb"
        );
    }

    #[tokio::test]
    async fn empty_jobs_are_invalid() {
        let fs = MemoryFileSystem::new();
        let mut queue = queue(&fs);
        let completion = queue.queue_verified_write(VerifiedWrite {
            root: "root".into(),
            segments: vec![],
            expected_sha1: [0; 20],
        });
        queue.drain().await;
        assert_eq!(completion.await.unwrap(), WriteOutcome::InvalidArgs);
    }

    #[tokio::test]
    async fn jobs_batch_until_flush() {
        let fs = MemoryFileSystem::new();
        let mut queue = queue(&fs);
        let data = Bytes::from_static(b"x");
        let hash = crate::utils::sha1(&data);
        let mut completions = Vec::new();
        for i in 0..3 {
            completions.push(queue.queue_verified_write(VerifiedWrite::single(
                "root".into(),
                PathBuf::from(format!("f{i}.bin")),
                0,
                data.clone(),
                hash,
            )));
        }
        assert_eq!(queue.outstanding_bytes(), 3);
        assert_eq!(queue.metrics().batches_flushed, 0);
        queue.drain().await;
        assert_eq!(queue.metrics().batches_flushed, 1);
        for completion in completions {
            assert!(matches!(
                completion.await.unwrap(),
                WriteOutcome::Success { .. }
            ));
        }
        assert_eq!(queue.outstanding_bytes(), 0);
    }
}
