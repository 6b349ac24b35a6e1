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

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::connection::{Connection, ConnectionId, ConnectionSettings, InboundFrame};
use crate::service::NetworkConfig;
use crate::{AppError, AppResult};

/// Notified after a connection has been removed from the registry.
pub trait DisconnectListener: Send + Sync {
    fn on_disconnect(&self, addr: SocketAddr);
}

struct RegistryInner {
    connections: RwLock<HashMap<SocketAddr, Arc<Connection>>>,
    listeners: RwLock<Vec<Arc<dyn DisconnectListener>>>,
    ingest_tx: async_channel::Sender<InboundFrame>,
    ingest_rx: async_channel::Receiver<InboundFrame>,
    settings: ConnectionSettings,
    config: NetworkConfig,
    limit_connections: Arc<Semaphore>,
    next_connection_id: AtomicU64,
    stop: CancellationToken,
}

/// The authoritative table of live connections, keyed by peer address.
///
/// Every connection's read task feeds the single ingest queue returned by
/// [`ConnectionRegistry::ingest`]. Lookups hand out `Arc<Connection>` clones;
/// the map lock is never held across an await.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(config: &NetworkConfig, ingest_capacity: usize) -> Self {
        let (ingest_tx, ingest_rx) = async_channel::bounded(ingest_capacity);
        ConnectionRegistry {
            inner: Arc::new(RegistryInner {
                connections: RwLock::new(HashMap::new()),
                listeners: RwLock::new(Vec::new()),
                ingest_tx,
                ingest_rx,
                settings: ConnectionSettings::from(config),
                config: config.clone(),
                limit_connections: Arc::new(Semaphore::new(config.max_connection)),
                next_connection_id: AtomicU64::new(1),
                stop: CancellationToken::new(),
            }),
        }
    }

    pub fn add_disconnect_listener(&self, listener: Arc<dyn DisconnectListener>) {
        self.inner.listeners.write().push(listener);
    }

    /// Binds `listen_address` and runs the accept loop on its own task.
    ///
    /// A bind failure is returned to the caller; errors on individual
    /// accepts are logged and retried with backoff.
    pub async fn start(&self, listen_address: &str) -> AppResult<SocketAddr> {
        let listener = TcpListener::bind(listen_address).await.map_err(|err| {
            let error_msg = format!(
                "Failed to bind server to address: {} - Error: {}",
                listen_address, err
            );
            error!(error_msg);
            AppError::IllegalStateError(error_msg)
        })?;
        let local_addr = listener.local_addr()?;
        info!("tcp server binding to {} for listening", local_addr);

        let registry = self.clone();
        tokio::spawn(async move {
            registry.accept_loop(listener).await;
            debug!("accept loop exited");
        });
        Ok(local_addr)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        let stop = self.inner.stop.clone();
        loop {
            let permit = tokio::select! {
                _ = stop.cancelled() => return,
                permit = self.inner.limit_connections.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            let socket = tokio::select! {
                _ = stop.cancelled() => return,
                socket = self.accept(&listener) => socket,
            };
            if let Err(e) = self.register_with_permit(socket, Some(permit)) {
                warn!("failed to register accepted connection: {}", e);
            }
        }
    }

    async fn accept(&self, listener: &TcpListener) -> TcpStream {
        let max_backoff = Duration::from_millis(self.inner.config.accept_backoff_max_ms.max(1));
        let mut backoff = Duration::from_millis(1);
        loop {
            match listener.accept().await {
                Ok((socket, _)) => return socket,
                Err(err) => {
                    error!("accept tcp connection failed, retry in {:?}: {}", backoff, err);
                }
            }
            time::sleep(backoff).await;
            backoff = (backoff * 2).min(max_backoff);
        }
    }

    /// Opens a connection over an already established socket and makes it
    /// reachable under its peer address.
    pub fn register(&self, socket: TcpStream) -> AppResult<Arc<Connection>> {
        self.register_with_permit(socket, None)
    }

    fn register_with_permit(
        &self,
        socket: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> AppResult<Arc<Connection>> {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let weak = Arc::downgrade(&self.inner);
        let on_closed = Box::new(move |id: ConnectionId, addr: SocketAddr| {
            if let Some(inner) = weak.upgrade() {
                ConnectionRegistry { inner }.deregister(id, addr);
            }
        });

        // Opening happens under the write lock: the read task may already be
        // running, but nobody can address the connection until it is in the map,
        // and its close hook cannot remove it before it was inserted.
        let mut connections = self.inner.connections.write();
        // checked under the lock: stop() cancels before it snapshots the map
        if self.inner.stop.is_cancelled() {
            return Err(AppError::IllegalStateError(
                "connection registry is stopped".to_string(),
            ));
        }
        let connection = Connection::open(
            socket,
            id,
            self.inner.settings,
            self.inner.ingest_tx.clone(),
            permit,
            on_closed,
        )?;
        let addr = connection.peer_addr();
        if let Some(previous) = connections.insert(addr, connection.clone()) {
            warn!(%addr, "replacing connection {} with {}", previous.id(), id);
            previous.close();
        }
        drop(connections);
        info!(%addr, id, "connection registered");
        Ok(connection)
    }

    fn deregister(&self, id: ConnectionId, addr: SocketAddr) {
        let removed = {
            let mut connections = self.inner.connections.write();
            match connections.get(&addr) {
                Some(current) if current.id() == id => connections.remove(&addr).is_some(),
                _ => false,
            }
        };
        if !removed {
            // already replaced by a newer connection under the same address
            return;
        }
        debug!(%addr, id, "connection deregistered");
        let listeners = self.inner.listeners.read().clone();
        for listener in listeners {
            listener.on_disconnect(addr);
        }
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<Arc<Connection>> {
        self.inner.connections.read().get(addr).cloned()
    }

    pub fn contains(&self, addr: &SocketAddr) -> bool {
        self.inner.connections.read().contains_key(addr)
    }

    /// Whether `addr` is still served by the connection `id`, and not by a
    /// later one that reused the address.
    pub fn contains_connection(&self, addr: &SocketAddr, id: ConnectionId) -> bool {
        self.inner
            .connections
            .read()
            .get(addr)
            .is_some_and(|connection| connection.id() == id)
    }

    pub fn len(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn addresses(&self) -> Vec<SocketAddr> {
        self.inner.connections.read().keys().copied().collect()
    }

    /// The fan-in stream of every connection's frames. Frames of one
    /// connection keep their arrival order.
    pub fn ingest(&self) -> async_channel::Receiver<InboundFrame> {
        self.inner.ingest_rx.clone()
    }

    /// Best-effort send. Returns whether the bytes were queued; an unknown
    /// or closing address is logged and reported as `false`.
    pub async fn send_to(&self, addr: &SocketAddr, bytes: Bytes) -> bool {
        let Some(connection) = self.get(addr) else {
            debug!(%addr, "send to unknown connection dropped");
            return false;
        };
        match connection.send(bytes).await {
            Ok(()) => true,
            Err(e) => {
                debug!(%addr, "send dropped: {}", e);
                false
            }
        }
    }

    /// Sends to every connection registered when the call started. Returns
    /// how many connections the bytes were queued for.
    pub async fn broadcast(&self, bytes: Bytes) -> usize {
        let snapshot: Vec<Arc<Connection>> =
            self.inner.connections.read().values().cloned().collect();
        let mut delivered = 0;
        for connection in snapshot {
            match connection.send(bytes.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => debug!(addr = %connection.peer_addr(), "broadcast skipped: {}", e),
            }
        }
        delivered
    }

    /// Closes one connection and waits until it is out of the map.
    pub async fn close(&self, addr: &SocketAddr) -> bool {
        let Some(connection) = self.get(addr) else {
            return false;
        };
        connection.close();
        connection.closed().await;
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    /// Stops accepting, closes every connection, waits for them to release
    /// their sockets (bounded by `grace`), then closes the ingest queue.
    /// Safe to call more than once and concurrently with connections closing
    /// on their own.
    pub async fn stop(&self, grace: Duration) {
        self.inner.stop.cancel();
        let snapshot: Vec<Arc<Connection>> =
            self.inner.connections.read().values().cloned().collect();
        info!("stopping connection registry, {} connections", snapshot.len());
        for connection in &snapshot {
            connection.close();
        }
        let all_closed = async {
            for connection in &snapshot {
                connection.closed().await;
            }
        };
        if time::timeout(grace, all_closed).await.is_err() {
            warn!("some connections did not close within {:?}", grace);
        }
        self.inner.ingest_tx.close();
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        debug!("connection registry dropped");
    }
}
