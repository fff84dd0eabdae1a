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

use std::ops::BitOr;

use bytes::BytesMut;

use super::FilterContext;

/// Directions a handler takes part in. Inbound covers opened, closed and
/// message-received events, outbound covers writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Bound(u8);

impl Bound {
    pub const INBOUND: Bound = Bound(1);
    pub const OUTBOUND: Bound = Bound(2);
    pub const DUPLEX: Bound = Bound(1 | 2);

    pub fn is_inbound(self) -> bool {
        self.0 & Self::INBOUND.0 != 0
    }

    pub fn is_outbound(self) -> bool {
        self.0 & Self::OUTBOUND.0 != 0
    }
}

impl BitOr for Bound {
    type Output = Bound;

    fn bitor(self, rhs: Self) -> Self::Output {
        Bound(self.0 | rhs.0)
    }
}

/// One stage of a [`FilterChain`](super::FilterChain).
///
/// Every event method receives the context of the filter the handler sits in.
/// The default implementations pass the event on unchanged, a handler that
/// wants to stop propagation simply does not call the matching `fire_*` method.
///
/// Handlers are shared between the read loop and the tasks writing to the
/// connection, so any per-connection state lives behind interior mutability.
/// `bound` must return the same value for the lifetime of the instance.
pub trait IoHandler: Send + Sync + 'static {
    fn bound(&self) -> Bound;

    fn conn_opened(&self, ctx: &FilterContext<'_>) {
        ctx.fire_conn_opened();
    }

    fn conn_closed(&self, ctx: &FilterContext<'_>) {
        ctx.fire_conn_closed();
    }

    fn message_received(&self, ctx: &FilterContext<'_>, msg: &mut BytesMut) {
        ctx.fire_message_received(msg);
    }

    fn filter_write(&self, ctx: &FilterContext<'_>, msg: BytesMut) {
        ctx.fire_write(msg);
    }

    /// Fresh instance for a new connection. State such as a half decoded frame
    /// must not be carried over.
    fn clone_handler(&self) -> Box<dyn IoHandler>;
}
