// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::frame::{Frame, FrameDecoder};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

pub type ConnectionId = u64;

/// Called once, after the connection reached `Closed`.
pub type OnClosed = Box<dyn FnOnce(ConnectionId, SocketAddr) + Send + 'static>;

/// Lifecycle of a connection. Transitions only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Open,
            2 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A decoded frame tagged with the connection it arrived on.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub source: SocketAddr,
    pub connection_id: ConnectionId,
    pub frame: Frame,
}

/// Per-connection knobs, taken from the network section of the config.
#[derive(Debug, Copy, Clone)]
pub struct ConnectionSettings {
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub max_frame_size: usize,
    pub outbound_queue_capacity: usize,
    pub max_frame_errors: u32,
}

impl From<&NetworkConfig> for ConnectionSettings {
    fn from(config: &NetworkConfig) -> Self {
        ConnectionSettings {
            read_timeout: config.read_timeout(),
            write_timeout: config.write_timeout(),
            max_frame_size: config.max_frame_size,
            outbound_queue_capacity: config.outbound_queue_capacity,
            max_frame_errors: config.max_frame_errors,
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        ConnectionSettings::from(&NetworkConfig::default())
    }
}

/// Read half of the socket plus the buffer frames are peeled off.
#[derive(Debug)]
struct FrameReader {
    reader: OwnedReadHalf,
    buffer: BytesMut,
    decoder: FrameDecoder,
}

impl FrameReader {
    /// Reads until one complete frame can be parsed.
    ///
    /// Returns `None` when the peer closed the stream between two frames and
    /// an error if it closed in the middle of one. A `FrameError` consumes the
    /// offending frame only; the next call continues with the following one.
    ///
    /// Cancel safe: buffered bytes and decoder state survive a dropped call.
    async fn read_frame(&mut self) -> AppResult<Option<Frame>> {
        loop {
            if let Some(frame) = self.decoder.parse(&mut self.buffer)? {
                return Ok(Some(frame));
            }
            if 0 == self.reader.read_buf(&mut self.buffer).await? {
                return if self.buffer.is_empty() && self.decoder.discarding() == 0 {
                    Ok(None)
                } else {
                    Err(
                        io::Error::new(ErrorKind::ConnectionReset, "connection reset by peer")
                            .into(),
                    )
                };
            }
        }
    }
}

/// One client socket.
///
/// Inbound frames are pushed by a read task into the shared ingest queue;
/// outbound bytes go through a bounded queue drained by a single write task,
/// so a slow peer only ever blocks its own queue. The socket halves are owned
/// by those two tasks and are released when both have exited.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    state: AtomicU8,
    stop: CancellationToken,
    closed: CancellationToken,
    outbound_tx: mpsc::Sender<Bytes>,
}

impl Connection {
    /// Takes ownership of the socket and starts its read and write tasks.
    ///
    /// Must be called from within a tokio runtime. Spawning is synchronous,
    /// so a caller holding a lock keeps the connection unobservable until it
    /// releases it.
    pub fn open(
        socket: TcpStream,
        id: ConnectionId,
        settings: ConnectionSettings,
        ingest_tx: async_channel::Sender<InboundFrame>,
        permit: Option<OwnedSemaphorePermit>,
        on_closed: OnClosed,
    ) -> AppResult<Arc<Connection>> {
        let peer = socket.peer_addr()?;
        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, "set nodelay failed: {}", e);
        }
        let (reader, writer) = socket.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(settings.outbound_queue_capacity);

        let connection = Arc::new(Connection {
            id,
            peer,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            stop: CancellationToken::new(),
            closed: CancellationToken::new(),
            outbound_tx,
        });

        let frame_reader = FrameReader {
            reader,
            buffer: BytesMut::with_capacity(4 * 1024),
            decoder: FrameDecoder::new(settings.max_frame_size),
        };
        let read_task = tokio::spawn(connection.clone().read_loop(
            frame_reader,
            ingest_tx,
            settings.read_timeout,
            settings.max_frame_errors,
        ));
        let write_task = tokio::spawn(connection.clone().write_loop(
            BufWriter::new(writer),
            outbound_rx,
            settings.write_timeout,
        ));

        let lifecycle = connection.clone();
        tokio::spawn(async move {
            let _ = tokio::join!(read_task, write_task);
            lifecycle.set_state(ConnectionState::Closed);
            on_closed(lifecycle.id, lifecycle.peer);
            drop(permit);
            lifecycle.closed.cancel();
            info!(peer = %lifecycle.peer, id = lifecycle.id, "connection closed");
        });

        connection.transition(ConnectionState::Connecting, ConnectionState::Open);
        debug!(%peer, id, "connection open");
        Ok(connection)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn set_state(&self, to: ConnectionState) {
        self.state.store(to as u8, Ordering::Release);
    }

    /// Queues bytes for the write task. Waits while the queue is full.
    pub async fn send(&self, bytes: Bytes) -> AppResult<()> {
        if self.state() >= ConnectionState::Closing {
            return Err(AppError::IllegalStateError(format!(
                "connection {} is closing",
                self.peer
            )));
        }
        tokio::select! {
            _ = self.stop.cancelled() => Err(AppError::IllegalStateError(format!(
                "connection {} is closing",
                self.peer
            ))),
            res = self.outbound_tx.send(bytes) => res.map_err(|e| {
                AppError::ChannelSendError(format!("outbound queue of {}: {}", self.peer, e))
            }),
        }
    }

    /// Signals both tasks to stop. Idempotent and safe to call from any
    /// task at any time; the connection reaches `Closed` asynchronously.
    pub fn close(&self) {
        let mut current = self.state.load(Ordering::Acquire);
        while current < ConnectionState::Closing as u8 {
            match self.state.compare_exchange(
                current,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(peer = %self.peer, id = self.id, "connection closing");
                    break;
                }
                Err(actual) => current = actual,
            }
        }
        self.stop.cancel();
    }

    /// Resolves once the socket has been released.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }

    async fn read_loop(
        self: Arc<Self>,
        mut reader: FrameReader,
        ingest_tx: async_channel::Sender<InboundFrame>,
        read_timeout: Duration,
        max_frame_errors: u32,
    ) {
        let mut frame_errors = 0;
        loop {
            let read = tokio::select! {
                _ = self.stop.cancelled() => break,
                read = time::timeout(read_timeout, reader.read_frame()) => read,
            };
            match read {
                Err(_) => {
                    trace!(peer = %self.peer, "read deadline passed, connection idle");
                }
                Ok(Ok(Some(frame))) => {
                    frame_errors = 0;
                    let inbound = InboundFrame {
                        source: self.peer,
                        connection_id: self.id,
                        frame,
                    };
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        res = ingest_tx.send(inbound) => {
                            if res.is_err() {
                                debug!(peer = %self.peer, "ingest queue closed, stop reading");
                                break;
                            }
                        }
                    }
                }
                Ok(Ok(None)) => {
                    debug!(peer = %self.peer, "peer closed the connection");
                    break;
                }
                Ok(Err(e)) if e.is_frame_error() => {
                    frame_errors += 1;
                    warn!(peer = %self.peer, frame_errors, "dropped bad frame: {}", e);
                    if frame_errors >= max_frame_errors {
                        warn!(peer = %self.peer, "too many bad frames, closing connection");
                        break;
                    }
                }
                Ok(Err(e)) => {
                    info!(peer = %self.peer, "read failed: {}", e);
                    break;
                }
            }
        }
        self.close();
    }

    async fn write_loop(
        self: Arc<Self>,
        mut writer: BufWriter<OwnedWriteHalf>,
        mut outbound_rx: mpsc::Receiver<Bytes>,
        write_timeout: Duration,
    ) {
        loop {
            let bytes = tokio::select! {
                _ = self.stop.cancelled() => break,
                bytes = outbound_rx.recv() => match bytes {
                    Some(bytes) => bytes,
                    None => break,
                },
            };
            // a blocked write must not outlive close()
            let write = tokio::select! {
                _ = self.stop.cancelled() => break,
                write = time::timeout(write_timeout, async {
                    writer.write_all(&bytes).await?;
                    // coalesce whatever else is already queued into the same flush
                    while let Ok(more) = outbound_rx.try_recv() {
                        writer.write_all(&more).await?;
                    }
                    writer.flush().await
                }) => write,
            };
            match write {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(peer = %self.peer, "write failed, closing connection: {}", e);
                    break;
                }
                Err(_) => {
                    warn!(peer = %self.peer, "write deadline passed, closing connection");
                    break;
                }
            }
        }
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::protocol::{Message, MessageType};

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    fn open(
        socket: TcpStream,
        settings: ConnectionSettings,
    ) -> (Arc<Connection>, async_channel::Receiver<InboundFrame>) {
        let (ingest_tx, ingest_rx) = async_channel::bounded(16);
        let connection =
            Connection::open(socket, 1, settings, ingest_tx, None, Box::new(|_, _| {})).unwrap();
        (connection, ingest_rx)
    }

    #[tokio::test]
    async fn test_frames_reach_ingest_in_order() {
        let (server, mut client) = socket_pair().await;
        let (connection, ingest_rx) = open(server, ConnectionSettings::default());
        assert!(connection.is_open());

        for body in ["one", "two", "three"] {
            let frame = Message::new(MessageType::Chat, &b"h"[..], body.as_bytes()).to_frame();
            client.write_all(&frame).await.unwrap();
        }
        for body in ["one", "two", "three"] {
            let inbound = ingest_rx.recv().await.unwrap();
            assert_eq!(&inbound.frame.message.body[..], body.as_bytes());
            assert_eq!(inbound.connection_id, 1);
        }
        connection.close();
    }

    #[tokio::test]
    async fn test_send_writes_to_socket() {
        let (server, mut client) = socket_pair().await;
        let (connection, _ingest_rx) = open(server, ConnectionSettings::default());
        connection.send(Bytes::from_static(b"abc")).await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"abc");
        connection.close();
    }

    #[tokio::test]
    async fn test_read_timeout_is_not_fatal() {
        let (server, mut client) = socket_pair().await;
        let settings = ConnectionSettings {
            read_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let (connection, ingest_rx) = open(server, settings);
        time::sleep(Duration::from_millis(100)).await;
        assert!(connection.is_open());

        let frame = Message::new(MessageType::Chat, &b"h"[..], &b"late"[..]).to_frame();
        client.write_all(&frame).await.unwrap();
        let inbound = ingest_rx.recv().await.unwrap();
        assert_eq!(&inbound.frame.message.body[..], b"late");
        connection.close();
    }

    #[tokio::test]
    async fn test_peer_eof_closes() {
        let (server, client) = socket_pair().await;
        let (connection, _ingest_rx) = open(server, ConnectionSettings::default());
        drop(client);
        time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (server, _client) = socket_pair().await;
        let (tx, rx) = std::sync::mpsc::channel();
        let (ingest_tx, _ingest_rx) = async_channel::bounded(1);
        let connection = Connection::open(
            server,
            7,
            ConnectionSettings::default(),
            ingest_tx,
            None,
            Box::new(move |id, _| tx.send(id).unwrap()),
        )
        .unwrap();
        connection.close();
        connection.close();
        time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        connection.close();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(rx.try_recv().unwrap(), 7);
        // the close hook runs exactly once
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_repeated_bad_frames_close() {
        let (server, mut client) = socket_pair().await;
        let settings = ConnectionSettings {
            max_frame_errors: 2,
            ..Default::default()
        };
        let (connection, _ingest_rx) = open(server, settings);
        // two frames with an unknown envelope type
        client
            .write_all(&[0, 0, 0, 1, 9, 0, 0, 0, 1, 9])
            .await
            .unwrap();
        time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
    }

    /// Large enough to fill the loopback socket buffers of a peer that
    /// never reads.
    const STALLING_PAYLOAD: usize = 64 * 1024 * 1024;

    #[tokio::test]
    async fn test_write_deadline_closes() {
        let (server, _silent_client) = socket_pair().await;
        let settings = ConnectionSettings {
            write_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (tx, rx) = std::sync::mpsc::channel();
        let (ingest_tx, _ingest_rx) = async_channel::bounded(1);
        let connection = Connection::open(
            server,
            3,
            settings,
            ingest_tx,
            None,
            Box::new(move |id, _| tx.send(id).unwrap()),
        )
        .unwrap();

        connection
            .send(Bytes::from(vec![0u8; STALLING_PAYLOAD]))
            .await
            .unwrap();
        time::timeout(Duration::from_secs(5), connection.closed())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(rx.try_recv().unwrap(), 3);
        assert!(connection.send(Bytes::from_static(b"x")).await.is_err());
    }

    #[tokio::test]
    async fn test_close_interrupts_blocked_write() {
        let (server, _silent_client) = socket_pair().await;
        let settings = ConnectionSettings {
            write_timeout: Duration::from_secs(60),
            ..Default::default()
        };
        let (connection, _ingest_rx) = open(server, settings);
        connection
            .send(Bytes::from(vec![0u8; STALLING_PAYLOAD]))
            .await
            .unwrap();
        // let the write task block on the full socket
        time::sleep(Duration::from_millis(100)).await;
        assert!(connection.is_open());

        connection.close();
        time::timeout(Duration::from_secs(2), connection.closed())
            .await
            .unwrap();
        assert_eq!(connection.state(), ConnectionState::Closed);
    }
}
