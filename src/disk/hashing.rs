use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;

use crate::caps::Hasher;

/// One piece to verify. `data` may be scattered across several buffers.
#[derive(Debug)]
pub struct Payload {
    pub hash: [u8; 20],
    pub data: Vec<Bytes>,
    pub reply: oneshot::Sender<bool>,
}

/// Pool of blocking verification workers over the injected hasher.
/// Hashing a full piece is a good chunk of cpu which must not run on the
/// tick task.
#[derive(Clone)]
pub struct HasherPool {
    job_tx: flume::Sender<Payload>,
}

impl std::fmt::Debug for HasherPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HasherPool").finish()
    }
}

impl HasherPool {
    pub fn new(workers_amount: usize, hasher: Arc<dyn Hasher>) -> Self {
        debug_assert!(workers_amount > 0);
        tracing::debug!("Spawning {} hasher workers", workers_amount);
        let (job_tx, job_rx) = flume::unbounded::<Payload>();
        for idx in 0..workers_amount {
            let job_rx = job_rx.clone();
            let hasher = hasher.clone();
            tokio::task::spawn_blocking(move || worker(idx, job_rx, hasher));
        }
        Self { job_tx }
    }

    pub async fn verify(&self, hash: [u8; 20], data: Vec<Bytes>) -> bool {
        let (reply, response) = oneshot::channel();
        let payload = Payload { hash, data, reply };
        if self.job_tx.send_async(payload).await.is_err() {
            return false;
        }
        response.await.unwrap_or(false)
    }
}

fn worker(idx: usize, job_rx: flume::Receiver<Payload>, hasher: Arc<dyn Hasher>) {
    while let Ok(job) = job_rx.recv() {
        let actual = if job.data.len() == 1 {
            hasher.sha1(&job.data[0])
        } else {
            let total: usize = job.data.iter().map(|d| d.len()).sum();
            let mut contiguous = Vec::with_capacity(total);
            for chunk in &job.data {
                contiguous.extend_from_slice(chunk);
            }
            hasher.sha1(&contiguous)
        };
        let is_verified = actual == job.hash;
        if !is_verified {
            tracing::trace!("Worker {idx} failed to verify piece hash");
        }
        let _ = job.reply.send(is_verified);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use crate::caps::Sha1Hasher;

    use super::HasherPool;

    #[tokio::test]
    async fn verifies_scattered_payloads() {
        let pool = HasherPool::new(2, Arc::new(Sha1Hasher));
        let data = Bytes::from_static(b"piece payload bytes");
        let hash = crate::utils::sha1(&data);
        let parts = vec![data.slice(0..6), data.slice(6..)];
        assert!(pool.verify(hash, parts.clone()).await);
        assert!(!pool.verify([0; 20], parts).await);
    }
}
