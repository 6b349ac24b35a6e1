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

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tokio::time;
use tracing::{debug, error, info, trace, warn};

use super::{AppResult, RelayConfig, Shutdown};
use crate::directory::{PresenceIndex, UserDirectory};
use crate::network::ConnectionRegistry;
use crate::request::{RequestProcessor, Router};

/// How long shutdown waits for connections and loops to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Wires the registry, the router and the request processor together.
pub struct Relay {
    config: RelayConfig,
}

impl Relay {
    pub fn new(config: RelayConfig) -> Self {
        Relay { config }
    }

    /// Binds the listen address and starts every loop on the current runtime.
    pub async fn start(&self) -> AppResult<RelayHandle> {
        let (notify_shutdown, _) = broadcast::channel(1);
        let (shutdown_complete_tx, shutdown_complete_rx) = mpsc::channel::<()>(1);

        let presence = Arc::new(PresenceIndex::new());
        let users = Arc::new(UserDirectory::new(self.config.general.id_step));

        let registry =
            ConnectionRegistry::new(&self.config.network, self.config.router.ingest_capacity);
        registry.add_disconnect_listener(presence.clone());
        let local_addr = registry
            .start(&self.config.network.listen_address())
            .await?;

        let (metadata_tx, metadata_rx) =
            async_channel::bounded(self.config.router.metadata_capacity);
        let router = Router::new(registry.clone(), presence.clone(), metadata_tx);
        let processor = RequestProcessor::new(
            users.clone(),
            presence.clone(),
            registry.clone(),
            router.responder(),
        );

        let shutdown = Shutdown::subscribe(&notify_shutdown);
        let complete = shutdown_complete_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = router.run(shutdown).await {
                error!("router stopped with error: {}", e);
            }
            drop(complete);
        });

        let shutdown = Shutdown::subscribe(&notify_shutdown);
        let complete = shutdown_complete_tx;
        tokio::spawn(async move {
            if let Err(e) = processor.run(metadata_rx, shutdown).await {
                error!("request processor stopped with error: {}", e);
            }
            drop(complete);
        });

        info!("chat relay started on {}", local_addr);
        Ok(RelayHandle {
            local_addr,
            registry,
            presence,
            users,
            notify_shutdown,
            shutdown_complete_rx,
        })
    }

    /// Runs until ctrl-c, then shuts down gracefully.
    pub async fn run(&self) -> AppResult<()> {
        let handle = self.start().await?;
        match signal::ctrl_c().await {
            Ok(()) => info!("get shutdown signal"),
            Err(e) => error!("failed to listen for ctrl-c, shutting down: {}", e),
        }
        handle.shutdown().await;
        Ok(())
    }
}

/// A started relay.
pub struct RelayHandle {
    local_addr: SocketAddr,
    registry: ConnectionRegistry,
    presence: Arc<PresenceIndex>,
    users: Arc<UserDirectory>,
    notify_shutdown: broadcast::Sender<()>,
    shutdown_complete_rx: mpsc::Receiver<()>,
}

impl RelayHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn presence(&self) -> Arc<PresenceIndex> {
        self.presence.clone()
    }

    pub fn users(&self) -> Arc<UserDirectory> {
        self.users.clone()
    }

    /// Stops the loops, then every connection, and waits for both.
    pub async fn shutdown(mut self) {
        // no receiver left only means the loops are already gone
        let _ = self.notify_shutdown.send(());
        self.registry.stop(SHUTDOWN_GRACE).await;

        // every loop task holds a sender, recv returns None once all have exited
        trace!("waiting for relay loops to exit...");
        if time::timeout(SHUTDOWN_GRACE, self.shutdown_complete_rx.recv())
            .await
            .is_err()
        {
            warn!("relay loops did not exit within {:?}", SHUTDOWN_GRACE);
        }
        debug!("relay shutdown complete");
    }
}

impl std::fmt::Debug for RelayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayHandle")
            .field("local_addr", &self.local_addr)
            .field("registry", &self.registry)
            .finish()
    }
}
