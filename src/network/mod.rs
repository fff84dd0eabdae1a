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

//! Network Module Implementation
//!
//! TCP endpoints built on tokio's async I/O primitives.
//!
//! # Components
//!
//! - `Connection`: one socket, a read loop feeding its filter chain and a write
//!   loop draining its bounded send queue
//! - `Acceptor`: listens, wraps every accepted socket in a connection carrying a
//!   fresh clone of the template chain
//! - `Connector`: dials one peer at a time and binds its own chain to it
//! - `ConnectionRegistry`: id keyed table of live connections for unicast and
//!   broadcast
//!
//! Acceptor and connector each own a broadcast exit signal and an mpsc
//! completion group shared with the connections they create, which is how
//! `stop` and `wait_for_stop` reach every running task.

pub use acceptor::{Acceptor, AcceptorState};
pub use connection::{Connection, ConnectionOptions, ConnectionState};
pub use connector::Connector;
pub use registry::ConnectionRegistry;

mod acceptor;
mod connection;
mod connector;
mod registry;
