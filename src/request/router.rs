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
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use crate::directory::PresenceStore;
use crate::network::{ConnectionId, ConnectionRegistry, Frame, InboundFrame};
use crate::protocol::{Message, MessageType, RequestHeader, ResponseHeader, StatusCode};
use crate::service::Shutdown;
use crate::AppResult;

/// A `Request` frame handed to the application layer, tagged with the
/// transport address and connection it came from. Responses go back to
/// `peer`.
#[derive(Debug, Clone)]
pub struct MetadataRequest {
    pub peer: SocketAddr,
    pub connection_id: ConnectionId,
    pub header: RequestHeader,
    pub message: Message,
}

/// What the router did with one ingested frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// handed to the application layer
    Metadata,
    ChatDelivered(SocketAddr),
    /// no presence entry, or no live connection behind it
    ChatUnreachable,
    Dropped,
}

/// Outbound side of the seam: turns application answers into `Response`
/// frames and sends them through the registry.
#[derive(Debug, Clone)]
pub struct Responder {
    registry: ConnectionRegistry,
    sequence: Arc<AtomicI32>,
}

impl Responder {
    pub fn new(registry: ConnectionRegistry) -> Self {
        Responder {
            registry,
            sequence: Arc::new(AtomicI32::new(0)),
        }
    }

    fn next_sequence(&self) -> i32 {
        // wraps on overflow
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Sends a response addressed by `header.destination_address`. An
    /// unparsable or unknown address is logged and reported as `false`.
    pub async fn send_response(&self, header: &ResponseHeader, body: Bytes) -> bool {
        let addr: SocketAddr = match header.destination_address.parse() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(
                    destination = %header.destination_address,
                    "response destination is not a socket address: {}", e
                );
                return false;
            }
        };
        let frame = Message::response(header, body).to_frame();
        self.registry.send_to(&addr, frame).await
    }

    /// Numbers and sends the answer to one request.
    pub async fn respond(
        &self,
        peer: SocketAddr,
        operation: u8,
        status: StatusCode,
        body: Bytes,
    ) -> bool {
        let header = ResponseHeader {
            operation,
            sequence: self.next_sequence(),
            status,
            destination_address: peer.to_string(),
        };
        trace!(%peer, ?header, "sending response");
        self.send_response(&header, body).await
    }
}

/// Classifies every ingested frame and routes it without decoding bodies.
///
/// Requests go to the application layer through a bounded handoff queue,
/// chat frames are forwarded byte for byte to the recipient's connection,
/// anything else is dropped.
pub struct Router {
    registry: ConnectionRegistry,
    presence: Arc<dyn PresenceStore>,
    metadata_tx: async_channel::Sender<MetadataRequest>,
    responder: Responder,
}

impl Router {
    pub fn new(
        registry: ConnectionRegistry,
        presence: Arc<dyn PresenceStore>,
        metadata_tx: async_channel::Sender<MetadataRequest>,
    ) -> Self {
        let responder = Responder::new(registry.clone());
        Router {
            registry,
            presence,
            metadata_tx,
            responder,
        }
    }

    pub fn responder(&self) -> Responder {
        self.responder.clone()
    }

    /// Consumes the registry's ingest queue until shutdown or until the
    /// queue is closed, then closes the handoff queue.
    pub async fn run(&self, mut shutdown: Shutdown) -> AppResult<()> {
        let ingest = self.registry.ingest();
        loop {
            let inbound = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("router received shutdown signal");
                    break;
                }
                inbound = ingest.recv() => match inbound {
                    Ok(inbound) => inbound,
                    Err(_) => {
                        debug!("ingest queue closed, router exits");
                        break;
                    }
                }
            };
            let outcome = self.route(inbound).await;
            trace!(?outcome, "frame routed");
        }
        self.metadata_tx.close();
        Ok(())
    }

    pub async fn route(&self, inbound: InboundFrame) -> RouteOutcome {
        let InboundFrame {
            source,
            connection_id,
            frame,
        } = inbound;
        match frame.message.msg_type {
            MessageType::Request => self.route_request(source, connection_id, frame).await,
            MessageType::Chat => self.route_chat(source, frame).await,
            MessageType::Response => {
                warn!(%source, connection_id, "client sent a response frame, dropped");
                RouteOutcome::Dropped
            }
        }
    }

    async fn route_request(
        &self,
        source: SocketAddr,
        connection_id: ConnectionId,
        frame: Frame,
    ) -> RouteOutcome {
        let header = match frame.message.request_header() {
            Ok(header) => header,
            Err(e) => {
                warn!(%source, "undecodable request header: {}", e);
                let operation = frame.message.body.first().copied().unwrap_or_default();
                self.responder
                    .respond(source, operation, StatusCode::Failed, Bytes::new())
                    .await;
                return RouteOutcome::Dropped;
            }
        };
        let request = MetadataRequest {
            peer: source,
            connection_id,
            header,
            message: frame.message,
        };
        if self.deliver_metadata(request).await {
            RouteOutcome::Metadata
        } else {
            RouteOutcome::Dropped
        }
    }

    async fn route_chat(&self, source: SocketAddr, frame: Frame) -> RouteOutcome {
        let header = match frame.message.chat_header() {
            Ok(header) => header,
            Err(e) => {
                debug!(%source, "undecodable chat header, dropped: {}", e);
                return RouteOutcome::Dropped;
            }
        };
        let Some(addr) = self.presence.get(&header.destination_user_id) else {
            debug!(
                from = %header.source_user_id,
                to = %header.destination_user_id,
                "chat recipient has no presence"
            );
            return RouteOutcome::ChatUnreachable;
        };
        if self.registry.send_to(&addr, frame.into_raw()).await {
            RouteOutcome::ChatDelivered(addr)
        } else {
            debug!(
                to = %header.destination_user_id,
                %addr,
                "chat recipient connection is gone"
            );
            RouteOutcome::ChatUnreachable
        }
    }

    /// Inbound side of the seam. Waits while the application layer is
    /// behind; returns `false` once the handoff queue is closed.
    pub async fn deliver_metadata(&self, request: MetadataRequest) -> bool {
        match self.metadata_tx.send(request).await {
            Ok(()) => true,
            Err(e) => {
                debug!(peer = %e.0.peer, "metadata handoff closed, request dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::directory::PresenceIndex;
    use crate::network::Client;
    use crate::protocol::{ChatHeader, ServerMetadata, WireFormat, LENGTH_FIELD_SIZE};
    use crate::service::NetworkConfig;

    const WAIT: Duration = Duration::from_secs(2);

    struct Fixture {
        registry: ConnectionRegistry,
        presence: Arc<PresenceIndex>,
        router: Router,
        metadata_rx: async_channel::Receiver<MetadataRequest>,
        addr: SocketAddr,
    }

    async fn fixture() -> Fixture {
        let registry = ConnectionRegistry::new(&NetworkConfig::default(), 16);
        let addr = registry.start("127.0.0.1:0").await.unwrap();
        let presence = Arc::new(PresenceIndex::new());
        let (metadata_tx, metadata_rx) = async_channel::bounded(16);
        let router = Router::new(registry.clone(), presence.clone(), metadata_tx);
        Fixture {
            registry,
            presence,
            router,
            metadata_rx,
            addr,
        }
    }

    async fn connect(fixture: &Fixture) -> Client {
        let client = Client::connect(fixture.addr, WAIT, 1024 * 1024).await.unwrap();
        let local = client.local_addr();
        tokio::time::timeout(WAIT, async {
            while !fixture.registry.contains(&local) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        client
    }

    fn inbound(source: SocketAddr, message: Message) -> InboundFrame {
        InboundFrame {
            source,
            connection_id: 0,
            frame: Frame::from_message(message),
        }
    }

    #[tokio::test]
    async fn test_chat_forwarded_unchanged() {
        let fixture = fixture().await;
        let mut bob = connect(&fixture).await;
        fixture.presence.set("bob", bob.local_addr());

        let header = ChatHeader::new("127.0.0.1:1", "alice", "bob");
        let message = Message::chat(&header, "hi bob");
        let outcome = fixture
            .router
            .route(inbound("127.0.0.1:1".parse().unwrap(), message.clone()))
            .await;
        assert_eq!(outcome, RouteOutcome::ChatDelivered(bob.local_addr()));

        let received = bob.recv_timeout(WAIT).await.unwrap().unwrap();
        assert_eq!(received, message);
        assert_eq!(received.to_frame().len(), LENGTH_FIELD_SIZE + message.encoded_len());
    }

    #[tokio::test]
    async fn test_chat_without_presence() {
        let fixture = fixture().await;
        let header = ChatHeader::new("127.0.0.1:1", "alice", "nobody");
        let outcome = fixture
            .router
            .route(inbound("127.0.0.1:1".parse().unwrap(), Message::chat(&header, "x")))
            .await;
        assert_eq!(outcome, RouteOutcome::ChatUnreachable);
    }

    #[tokio::test]
    async fn test_request_handed_off() {
        let fixture = fixture().await;
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let message = Message::request(
            &RequestHeader::new(peer.to_string()),
            &ServerMetadata::logout("1"),
        );
        let outcome = fixture
            .router
            .route(InboundFrame {
                source: peer,
                connection_id: 42,
                frame: Frame::from_message(message.clone()),
            })
            .await;
        assert_eq!(outcome, RouteOutcome::Metadata);

        let request = fixture.metadata_rx.recv().await.unwrap();
        assert_eq!(request.peer, peer);
        assert_eq!(request.connection_id, 42);
        assert_eq!(request.header.source_address, peer.to_string());
        assert_eq!(request.message, message);
    }

    #[tokio::test]
    async fn test_response_from_client_dropped() {
        let fixture = fixture().await;
        let header = ResponseHeader {
            operation: 1,
            sequence: 1,
            status: StatusCode::Ok,
            destination_address: "server".into(),
        };
        let outcome = fixture
            .router
            .route(inbound(
                "127.0.0.1:1".parse().unwrap(),
                Message::response(&header, Bytes::new()),
            ))
            .await;
        assert_eq!(outcome, RouteOutcome::Dropped);
        assert!(fixture.metadata_rx.is_empty());
    }

    #[tokio::test]
    async fn test_malformed_request_answered_failed() {
        let fixture = fixture().await;
        let mut client = connect(&fixture).await;
        let message = Message::new(
            MessageType::Request,
            Bytes::from_static(b"\x00\x00"),
            ServerMetadata::logout("1").to_bytes(),
        );
        let outcome = fixture
            .router
            .route(inbound(client.local_addr(), message))
            .await;
        assert_eq!(outcome, RouteOutcome::Dropped);

        let response = client.recv_timeout(WAIT).await.unwrap().unwrap();
        let header = response.response_header().unwrap();
        assert_eq!(header.status, StatusCode::Failed);
        assert_eq!(header.operation, 3);
    }

    #[tokio::test]
    async fn test_response_sequence_increases() {
        let fixture = fixture().await;
        let mut client = connect(&fixture).await;
        let responder = fixture.router.responder();
        for _ in 0..3 {
            assert!(
                responder
                    .respond(client.local_addr(), 8, StatusCode::Ok, Bytes::new())
                    .await
            );
        }
        let mut sequences = Vec::new();
        for _ in 0..3 {
            let message = client.recv_timeout(WAIT).await.unwrap().unwrap();
            sequences.push(message.response_header().unwrap().sequence);
        }
        assert_eq!(sequences, vec![1, 2, 3]);

        let bogus = ResponseHeader {
            operation: 8,
            sequence: 0,
            status: StatusCode::Ok,
            destination_address: "not an address".into(),
        };
        assert!(!responder.send_response(&bogus, Bytes::new()).await);
    }
}
