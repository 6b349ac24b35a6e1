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

use bytes::Bytes;
use tracing::{debug, info, trace, warn};

use super::router::{MetadataRequest, Responder};
use crate::directory::{PresenceStore, UserDirectory};
use crate::network::{ConnectionId, ConnectionRegistry};
use crate::protocol::{
    BriefUser, Operation, ServerMetadata, StatusCode, UserList, UserState, WireFormat,
};
use crate::service::Shutdown;
use crate::{AppError, AppResult};

/// Answer to one request, before it is framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub operation: u8,
    pub status: StatusCode,
    pub body: Bytes,
}

impl Reply {
    fn empty(operation: u8, status: StatusCode) -> Self {
        Reply {
            operation,
            status,
            body: Bytes::new(),
        }
    }
}

/// The application layer behind the router: user accounts, login state and
/// friend lists.
pub struct RequestProcessor {
    users: Arc<UserDirectory>,
    presence: Arc<dyn PresenceStore>,
    registry: ConnectionRegistry,
    responder: Responder,
}

impl RequestProcessor {
    pub fn new(
        users: Arc<UserDirectory>,
        presence: Arc<dyn PresenceStore>,
        registry: ConnectionRegistry,
        responder: Responder,
    ) -> Self {
        RequestProcessor {
            users,
            presence,
            registry,
            responder,
        }
    }

    /// Answers requests from the handoff queue, one at a time, until
    /// shutdown or until the router closes the queue.
    pub async fn run(
        &self,
        requests: async_channel::Receiver<MetadataRequest>,
        mut shutdown: Shutdown,
    ) -> AppResult<()> {
        loop {
            let request = tokio::select! {
                _ = shutdown.recv() => {
                    debug!("request processor received shutdown signal");
                    return Ok(());
                }
                request = requests.recv() => match request {
                    Ok(request) => request,
                    Err(_) => {
                        debug!("metadata handoff closed, request processor exits");
                        return Ok(());
                    }
                }
            };
            self.process_request(request).await;
        }
    }

    pub async fn process_request(&self, request: MetadataRequest) {
        let peer = request.peer;
        let reply = self.handle(&request);
        if !self
            .responder
            .respond(peer, reply.operation, reply.status, reply.body)
            .await
        {
            debug!(%peer, "response not delivered, peer is gone");
        }
    }

    /// Decodes and executes one request. Never fails: every outcome is a
    /// status in the reply.
    pub fn handle(&self, request: &MetadataRequest) -> Reply {
        let metadata = match request.message.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(peer = %request.peer, "undecodable request metadata: {}", e);
                let operation = request.message.body.first().copied().unwrap_or_default();
                return Reply::empty(operation, StatusCode::Failed);
            }
        };
        let operation = match metadata.operation() {
            Ok(operation) => operation,
            Err(e) => {
                debug!(peer = %request.peer, "{}", e);
                return Reply::empty(metadata.operation, StatusCode::InvalidOperation);
            }
        };
        trace!(peer = %request.peer, ?operation, "processing request");
        match self.execute(operation, &metadata, request.peer, request.connection_id) {
            Ok(body) => Reply {
                operation: metadata.operation,
                status: StatusCode::Ok,
                body,
            },
            Err(e) => {
                debug!(peer = %request.peer, ?operation, "request failed: {}", e);
                Reply::empty(metadata.operation, StatusCode::Failed)
            }
        }
    }

    fn execute(
        &self,
        operation: Operation,
        metadata: &ServerMetadata,
        peer: SocketAddr,
        connection_id: ConnectionId,
    ) -> AppResult<Bytes> {
        match operation {
            Operation::Register => {
                let id = self.users.register(&metadata.username, &metadata.password)?;
                info!(user_id = %id, username = %metadata.username, "user registered");
                Ok(Bytes::from(id))
            }
            Operation::Login => {
                self.users
                    .authenticate(&metadata.user_id, &metadata.password)?;
                self.ensure_live(peer, connection_id)?;
                self.presence.set(&metadata.user_id, peer);
                // a deregister after the set evicts the entry itself, one that
                // slipped in between the check and the set is undone here
                if let Err(e) = self.ensure_live(peer, connection_id) {
                    self.presence.remove_if_at(&metadata.user_id, peer);
                    return Err(e);
                }
                info!(user_id = %metadata.user_id, %peer, "user logged in");
                Ok(Bytes::new())
            }
            Operation::Logout => {
                self.ensure_user(&metadata.user_id)?;
                self.presence.remove(&metadata.user_id);
                info!(user_id = %metadata.user_id, "user logged out");
                Ok(Bytes::new())
            }
            Operation::Delete => {
                self.users.delete(&metadata.user_id)?;
                self.presence.remove(&metadata.user_id);
                info!(user_id = %metadata.user_id, "user deleted");
                Ok(Bytes::new())
            }
            Operation::SearchFriend => self.search(metadata),
            Operation::MakeFriend => {
                self.users
                    .add_friend(&metadata.user_id, &metadata.dest_user_id)?;
                self.friend_list(&metadata.user_id)
            }
            Operation::DeleteFriend => {
                self.users
                    .remove_friend(&metadata.user_id, &metadata.dest_user_id)?;
                self.friend_list(&metadata.user_id)
            }
            Operation::ListFriend => self.friend_list(&metadata.user_id),
        }
    }

    fn ensure_live(&self, peer: SocketAddr, connection_id: ConnectionId) -> AppResult<()> {
        if self.registry.contains_connection(&peer, connection_id) {
            Ok(())
        } else {
            Err(AppError::IllegalStateError(format!(
                "connection {} from {} closed before login completed",
                connection_id, peer
            )))
        }
    }

    fn ensure_user(&self, user_id: &str) -> AppResult<()> {
        if self.users.contains(user_id) {
            Ok(())
        } else {
            Err(AppError::UserNotFound(user_id.to_string()))
        }
    }

    fn search(&self, metadata: &ServerMetadata) -> AppResult<Bytes> {
        if let Some(name) = self.users.name_of(&metadata.user_id) {
            let list = self.user_list(vec![(metadata.user_id.clone(), name)]);
            return Ok(list.to_bytes());
        }
        if metadata.username.is_empty() {
            return Err(AppError::InvalidValue(
                "search needs a user id or a name".to_string(),
            ));
        }
        Ok(self.user_list(self.users.search(&metadata.username)).to_bytes())
    }

    fn friend_list(&self, user_id: &str) -> AppResult<Bytes> {
        let friends = self.users.friends(user_id)?;
        Ok(self.user_list(friends).to_bytes())
    }

    fn user_list(&self, users: Vec<(String, String)>) -> UserList {
        let mut list = UserList(
            users
                .into_iter()
                .map(|(id, name)| {
                    let state = if self.presence.get(&id).is_some() {
                        UserState::Online
                    } else {
                        UserState::Offline
                    };
                    BriefUser { id, name, state }
                })
                .collect(),
        );
        list.sort_by_presence();
        list
    }
}
