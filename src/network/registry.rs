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
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::network::Connection;

/// Live connections of a server, keyed by connection id.
///
/// Lookups clone the `Arc` out of the map and release the lock before touching
/// the connection, so a handler reacting to a close may remove itself from the
/// registry while a broadcast or close is in flight.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<u32, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `conn` under its id, replacing any previous entry with that id.
    pub fn add_con(&self, conn: &Arc<Connection>) -> u32 {
        let id = conn.id();
        let total = {
            let mut connections = self.connections.write();
            connections.insert(id, conn.clone());
            connections.len()
        };
        debug!(
            "connection[{}] id {} registered, total: {}",
            conn.remote_addr(),
            id,
            total
        );
        id
    }

    pub fn remove_con(&self, conn: &Connection) -> Option<Arc<Connection>> {
        self.remove(conn.id())
    }

    pub fn remove(&self, id: u32) -> Option<Arc<Connection>> {
        let removed = self.connections.write().remove(&id);
        if let Some(conn) = &removed {
            debug!("connection[{}] id {} unregistered", conn.remote_addr(), id);
        }
        removed
    }

    pub fn get(&self, id: u32) -> Option<Arc<Connection>> {
        self.connections.read().get(&id).cloned()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.connections.read().contains_key(&id)
    }

    pub fn size(&self) -> usize {
        self.connections.read().len()
    }

    /// Writes `msg` to one connection, unknown ids are logged and ignored.
    pub fn send(&self, id: u32, msg: BytesMut) {
        match self.get(id) {
            Some(conn) => conn.write(msg),
            None => warn!("connection id {} not registered, drop {} bytes", id, msg.len()),
        }
    }

    /// Writes a copy of `msg` to every connection registered at call time.
    pub fn broadcast(&self, msg: &BytesMut) {
        let targets: Vec<Arc<Connection>> = self.connections.read().values().cloned().collect();
        for conn in targets {
            conn.write(msg.clone());
        }
    }

    /// Closes one connection. It stays registered until its own handler removes it.
    pub fn close(&self, id: u32) {
        match self.get(id) {
            Some(conn) => conn.close(),
            None => debug!("close unknown connection id {}", id),
        }
    }

    pub fn remote_addr(&self, id: u32) -> Option<String> {
        self.get(id).map(|conn| conn.remote_addr())
    }
}
