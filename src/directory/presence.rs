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

use dashmap::DashMap;
use tracing::debug;

use crate::network::DisconnectListener;

/// Presence lookup capability consumed by the router and written by the
/// request processor on login.
pub trait PresenceStore: Send + Sync {
    /// Last write wins.
    fn set(&self, user_id: &str, addr: SocketAddr);
    fn get(&self, user_id: &str) -> Option<SocketAddr>;
    fn remove(&self, user_id: &str) -> Option<SocketAddr>;
    /// Removes the entry only while it still points at `addr`.
    fn remove_if_at(&self, user_id: &str, addr: SocketAddr) -> bool;
    /// Drops every entry pointing at `addr`, returning the affected users.
    fn evict_address(&self, addr: SocketAddr) -> Vec<String>;
}

/// In-memory user id to transport address map.
#[derive(Debug, Default)]
pub struct PresenceIndex {
    entries: DashMap<String, SocketAddr>,
}

impl PresenceIndex {
    pub fn new() -> Self {
        PresenceIndex::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PresenceStore for PresenceIndex {
    fn set(&self, user_id: &str, addr: SocketAddr) {
        if let Some(previous) = self.entries.insert(user_id.to_string(), addr) {
            if previous != addr {
                debug!(user_id, %previous, %addr, "presence moved");
            }
        }
    }

    fn get(&self, user_id: &str) -> Option<SocketAddr> {
        self.entries.get(user_id).map(|entry| *entry.value())
    }

    fn remove(&self, user_id: &str) -> Option<SocketAddr> {
        self.entries.remove(user_id).map(|(_, addr)| addr)
    }

    fn remove_if_at(&self, user_id: &str, addr: SocketAddr) -> bool {
        self.entries
            .remove_if(user_id, |_, current| *current == addr)
            .is_some()
    }

    fn evict_address(&self, addr: SocketAddr) -> Vec<String> {
        let mut evicted = Vec::new();
        self.entries.retain(|user_id, entry| {
            if *entry == addr {
                evicted.push(user_id.clone());
                false
            } else {
                true
            }
        });
        evicted
    }
}

impl DisconnectListener for PresenceIndex {
    fn on_disconnect(&self, addr: SocketAddr) {
        let evicted = self.evict_address(addr);
        if !evicted.is_empty() {
            debug!(%addr, ?evicted, "presence evicted after disconnect");
        }
    }
}
