//! TCP transport: one listener per node, cached outbound connections.
//!
//! Every packet travels as one frame:
//!
//! ```text
//! len:u32 (big-endian) | packet[len]
//! ```
//!
//! Frames longer than the 15 KiB read buffer are refused on both ends.
//! Outbound connections are write-only: a node answers a peer by connecting
//! to the peer's advertised listener, never over the inbound stream. Each
//! peer gets its own writer task, so a peer that is slow to connect only
//! holds up its own frames.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use dashmap::DashMap;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use tandem_core::wire::READ_BUFFER_SIZE;
use tandem_core::ClientNode;

use crate::error::TransportError;

const INBOUND_QUEUE: usize = 1024;

/// One received frame and the remote address of the connection it came on.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub from: SocketAddr,
    pub data: Bytes,
}

type Connection = Arc<Mutex<TcpStream>>;

pub struct TransportCommunicator {
    local_addr: SocketAddr,
    connections: DashMap<ClientNode, Connection>,
    writers: DashMap<ClientNode, mpsc::UnboundedSender<Bytes>>,
    /// Frames handed to writer tasks and not yet written or failed.
    pending: AtomicUsize,
    inbound: Mutex<mpsc::Receiver<Inbound>>,
    connect_timeout: Duration,
    cancel: CancellationToken,
}

impl TransportCommunicator {
    /// Bind the listener and start accepting. Port 0 picks a free port; see
    /// [`TransportCommunicator::local_addr`].
    pub async fn bind(
        node: &ClientNode,
        connect_timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind((node.host.as_str(), node.port))
            .await
            .map_err(|source| TransportError::Bind {
                addr: node.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: node.to_string(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE);
        tokio::spawn(accept_loop(listener, tx, cancel.clone()));
        tracing::info!(addr = %local_addr, "transport listening");

        Ok(Self {
            local_addr,
            connections: DashMap::new(),
            writers: DashMap::new(),
            pending: AtomicUsize::new(0),
            inbound: Mutex::new(rx),
            connect_timeout,
            cancel,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next received frame. `None` once the transport is closed.
    ///
    /// Accepts and peer hang-ups are handled internally and never surface
    /// here.
    pub async fn receive_data(&self) -> Option<Inbound> {
        let mut rx = self.inbound.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => None,
            msg = rx.recv() => msg,
        }
    }

    /// Write one frame to `dest`, connecting first if no connection is cached.
    ///
    /// A failed write drops the cached connection so the next send reconnects.
    /// Nothing is retried here.
    pub async fn send_data(&self, data: &[u8], dest: &ClientNode) -> Result<(), TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if data.len() > READ_BUFFER_SIZE {
            return Err(TransportError::FrameTooLarge(data.len()));
        }

        let connection = self.connection(dest).await?;
        let mut frame = BytesMut::with_capacity(4 + data.len());
        frame.put_u32(data.len() as u32);
        frame.put_slice(data);

        let result = connection.lock().await.write_all(&frame).await;
        if let Err(source) = result {
            self.connections.remove(dest);
            return Err(TransportError::Write {
                peer: dest.clone(),
                source,
            });
        }
        tracing::trace!(peer = %dest, len = data.len(), "frame sent");
        Ok(())
    }

    /// Queue one frame on `dest`'s writer task without waiting for the write.
    /// Failures are logged by the writer.
    pub fn queue_data(self: &Arc<Self>, data: Bytes, dest: ClientNode) {
        let tx = self
            .writers
            .entry(dest.clone())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::unbounded_channel();
                tokio::spawn(self.clone().write_loop(dest.clone(), rx));
                tx
            })
            .clone();
        self.pending.fetch_add(1, Ordering::AcqRel);
        if tx.send(data).is_err() {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!(peer = %dest, "writer stopped, frame dropped");
        }
    }

    /// Frames queued with [`TransportCommunicator::queue_data`] that are
    /// still waiting to be written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    async fn write_loop(self: Arc<Self>, dest: ClientNode, mut rx: mpsc::UnboundedReceiver<Bytes>) {
        loop {
            let data = tokio::select! {
                _ = self.cancel.cancelled() => return,
                data = rx.recv() => match data {
                    Some(data) => data,
                    None => return,
                },
            };
            let result = self.send_data(&data, &dest).await;
            self.pending.fetch_sub(1, Ordering::AcqRel);
            if let Err(e) = result {
                tracing::warn!(peer = %dest, error = %e, "send failed, packet dropped");
            }
        }
    }

    /// Drop the cached connection to `dest`, if any. Its writer finishes the
    /// frames already queued, then exits.
    pub fn close_socket(&self, dest: &ClientNode) -> bool {
        self.writers.remove(dest);
        self.connections.remove(dest).is_some()
    }

    /// Stop accepting and reading, and drop every outbound connection.
    /// Safe to call more than once.
    pub fn close(&self) {
        if !self.cancel.is_cancelled() {
            tracing::info!(addr = %self.local_addr, "transport closing");
        }
        self.cancel.cancel();
        self.writers.clear();
        self.connections.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn connection(&self, dest: &ClientNode) -> Result<Connection, TransportError> {
        if let Some(existing) = self.connections.get(dest) {
            return Ok(existing.value().clone());
        }

        let connect = TcpStream::connect((dest.host.as_str(), dest.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(TransportError::Connect {
                    peer: dest.clone(),
                    source,
                })
            }
            Err(_) => {
                return Err(TransportError::ConnectTimeout {
                    peer: dest.clone(),
                    timeout_ms: self.connect_timeout.as_millis() as u64,
                })
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(peer = %dest, error = %e, "failed to set TCP_NODELAY");
        }
        let keepalive = TcpKeepalive::new()
            .with_time(Duration::from_secs(10))
            .with_interval(Duration::from_secs(5));
        if let Err(e) = SockRef::from(&stream).set_tcp_keepalive(&keepalive) {
            tracing::warn!(peer = %dest, error = %e, "failed to enable TCP keepalive");
        }

        tracing::debug!(peer = %dest, "outbound connection established");
        let connection = Arc::new(Mutex::new(stream));
        // Another task may have connected concurrently; keep whichever landed first.
        let kept = self
            .connections
            .entry(dest.clone())
            .or_insert(connection)
            .value()
            .clone();
        Ok(kept)
    }
}

impl Drop for TransportCommunicator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(listener: TcpListener, tx: mpsc::Sender<Inbound>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "inbound connection accepted");
                    tokio::spawn(read_loop(stream, peer, tx.clone(), cancel.clone()));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
        }
    }
}

async fn read_loop(mut stream: TcpStream, peer: SocketAddr, tx: mpsc::Sender<Inbound>, cancel: CancellationToken) {
    tokio::select! {
        _ = cancel.cancelled() => {}
        result = read_frames(&mut stream, peer, &tx) => {
            if let Err(e) = result {
                tracing::warn!(%peer, error = %e, "inbound connection dropped");
            } else {
                tracing::debug!(%peer, "peer closed connection");
            }
        }
    }
}

/// Read frames until end-of-stream. A clean close between frames is `Ok`.
async fn read_frames(
    stream: &mut TcpStream,
    peer: SocketAddr,
    tx: &mpsc::Sender<Inbound>,
) -> Result<(), TransportError> {
    let mut len_buf = [0u8; 4];
    loop {
        match stream.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(source) => return Err(TransportError::Read { peer, source }),
        }

        let len = u32::from_be_bytes(len_buf) as usize;
        if len > READ_BUFFER_SIZE {
            return Err(TransportError::FrameTooLarge(len));
        }

        let mut data = vec![0u8; len];
        stream
            .read_exact(&mut data)
            .await
            .map_err(|source| TransportError::Read { peer, source })?;

        if tx
            .send(Inbound {
                from: peer,
                data: Bytes::from(data),
            })
            .await
            .is_err()
        {
            return Err(TransportError::Closed);
        }
    }
}
