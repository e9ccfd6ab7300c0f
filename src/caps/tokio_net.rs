use std::{
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream, UdpSocket},
    sync::{mpsc, Notify},
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use super::{ConnId, SocketFactory, TcpLink, TransportEvent, UdpChannel};

const READ_CHUNK: usize = 64 * 1024;
const SEND_QUEUE: usize = 256;

/// Production socket provider. Every link runs a small reader and writer
/// task pair that shovel bytes between the socket and the engine's
/// transport queue.
#[derive(Debug)]
pub struct TokioNet {
    next_conn: Arc<AtomicU64>,
    backpressure: Arc<Gate>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

/// Flag that async readers can park on until it clears
#[derive(Debug, Default)]
struct Gate {
    active: AtomicBool,
    changed: Notify,
}

impl Gate {
    fn set(&self, active: bool) {
        self.active.store(active, Ordering::Release);
        self.changed.notify_waiters();
    }

    async fn wait_clear(&self) {
        while self.active.load(Ordering::Acquire) {
            self.changed.notified().await;
        }
    }
}

impl TokioNet {
    pub fn new(task_tracker: TaskTracker, cancellation_token: CancellationToken) -> Self {
        Self {
            next_conn: Arc::new(AtomicU64::new(1)),
            backpressure: Arc::new(Gate::default()),
            task_tracker,
            cancellation_token,
        }
    }

    fn next_id(&self) -> ConnId {
        self.next_conn.fetch_add(1, Ordering::Relaxed)
    }
}

fn spawn_link_tasks(
    task_tracker: &TaskTracker,
    cancellation_token: CancellationToken,
    backpressure: Arc<Gate>,
    conn: ConnId,
    stream: TcpStream,
    events: flume::Sender<TransportEvent>,
) -> TokioLink {
    let (mut read_half, mut write_half) = stream.into_split();
    let (send_tx, mut send_rx) = mpsc::channel::<Bytes>(SEND_QUEUE);
    let paused = Arc::new(Gate::default());

    {
        let paused = paused.clone();
        let token = cancellation_token.clone();
        task_tracker.spawn(async move {
            let mut buffer = BytesMut::with_capacity(READ_CHUNK);
            loop {
                paused.wait_clear().await;
                backpressure.wait_clear().await;
                buffer.reserve(READ_CHUNK);
                tokio::select! {
                    read = read_half.read_buf(&mut buffer) => match read {
                        Ok(0) => {
                            let _ = events.send(TransportEvent::Closed { conn, error: None });
                            break;
                        }
                        Ok(_) => {
                            let data = buffer.split().freeze();
                            if events.send(TransportEvent::Data { conn, data }).is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            let _ = events.send(TransportEvent::Closed {
                                conn,
                                error: Some(e.to_string()),
                            });
                            break;
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
    }

    task_tracker.spawn(async move {
        while let Some(data) = send_rx.recv().await {
            if write_half.write_all(&data).await.is_err() {
                break;
            }
        }
        let _ = write_half.shutdown().await;
    });

    TokioLink { send_tx, paused }
}

#[derive(Debug)]
pub struct TokioLink {
    send_tx: mpsc::Sender<Bytes>,
    paused: Arc<Gate>,
}

impl TcpLink for TokioLink {
    fn send(&mut self, data: Bytes) {
        // Queue overflow means the remote stopped reading; the connection
        // dies on its own timeout.
        let _ = self.send_tx.try_send(data);
    }

    fn close(&mut self) {
        // Writer task exits once the queue sender is gone and shuts the
        // socket down; the reader then observes eof.
    }

    fn set_paused(&mut self, paused: bool) {
        self.paused.set(paused);
    }
}

#[async_trait]
impl SocketFactory for TokioNet {
    fn connect_tcp(&self, addr: SocketAddr, events: flume::Sender<TransportEvent>) -> ConnId {
        let conn = self.next_id();
        let token = self.cancellation_token.clone();
        let tracker = self.task_tracker.clone();
        let backpressure = self.backpressure.clone();
        self.task_tracker.spawn(async move {
            tokio::select! {
                connected = TcpStream::connect(addr) => match connected {
                    Ok(stream) => {
                        let link =
                            spawn_link_tasks(&tracker, token, backpressure, conn, stream, events.clone());
                        let _ = events.send(TransportEvent::Connected {
                            conn,
                            link: Box::new(link),
                        });
                    }
                    Err(e) => {
                        let _ = events.send(TransportEvent::Closed {
                            conn,
                            error: Some(e.to_string()),
                        });
                    }
                },
                _ = token.cancelled() => {}
            }
        });
        conn
    }

    async fn listen_tcp(
        &self,
        port: u16,
        events: flume::Sender<TransportEvent>,
    ) -> io::Result<u16> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let local_port = listener.local_addr()?.port();
        let token = self.cancellation_token.clone();
        let tracker = self.task_tracker.clone();
        let backpressure = self.backpressure.clone();
        let ids = self.next_conn.clone();
        self.task_tracker.spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((stream, addr)) => {
                            let conn = ids.fetch_add(1, Ordering::Relaxed);
                            let link = spawn_link_tasks(
                                &tracker,
                                token.clone(),
                                backpressure.clone(),
                                conn,
                                stream,
                                events.clone(),
                            );
                            if events
                                .send(TransportEvent::Accepted {
                                    conn,
                                    link: Box::new(link),
                                    addr,
                                })
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!("Tcp accept failed: {e}");
                        }
                    },
                    _ = token.cancelled() => break,
                }
            }
        });
        Ok(local_port)
    }

    async fn bind_udp(
        &self,
        port: u16,
        datagrams: flume::Sender<(SocketAddr, Bytes)>,
    ) -> io::Result<Box<dyn UdpChannel>> {
        let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
        let local_port = socket.local_addr()?.port();
        let (send_tx, mut send_rx) = mpsc::channel::<(SocketAddr, Bytes)>(SEND_QUEUE);
        let token = self.cancellation_token.clone();
        {
            let socket = socket.clone();
            self.task_tracker.spawn(async move {
                let mut buffer = vec![0u8; 64 * 1024];
                loop {
                    tokio::select! {
                        received = socket.recv_from(&mut buffer) => match received {
                            Ok((read, from)) => {
                                let data = Bytes::copy_from_slice(&buffer[..read]);
                                if datagrams.send((from, data)).is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!("Udp recv failed: {e}");
                            }
                        },
                        outgoing = send_rx.recv() => match outgoing {
                            Some((addr, data)) => {
                                let _ = socket.send_to(&data, addr).await;
                            }
                            None => break,
                        },
                        _ = token.cancelled() => break,
                    }
                }
            });
        }
        Ok(Box::new(TokioUdp {
            send_tx,
            local_port,
        }))
    }

    fn set_backpressure(&self, active: bool) {
        self.backpressure.set(active);
    }
}

#[derive(Debug)]
struct TokioUdp {
    send_tx: mpsc::Sender<(SocketAddr, Bytes)>,
    local_port: u16,
}

impl UdpChannel for TokioUdp {
    fn send_to(&self, addr: SocketAddr, data: Bytes) {
        let _ = self.send_tx.try_send((addr, data));
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}
