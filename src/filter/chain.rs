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

use std::fmt;
use std::sync::{Arc, Weak};

use bytes::BytesMut;
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::network::Connection;

use super::{Bound, IoHandler};

const HEAD_NAME: &str = "head";
const TAIL_NAME: &str = "tail";

#[derive(Clone)]
struct Filter {
    name: Arc<str>,
    bound: Bound,
    handler: Arc<dyn IoHandler>,
}

/// Ordered pipeline bound to one connection.
///
/// Filters are kept in a vector bracketed by two sentinels: the head at index 0
/// (outbound only, hands framed bytes to the connection's send queue) and the
/// tail at the last index (inbound only, clears whatever buffer reaches it).
/// Inbound events walk forward from the head, writes walk backward from the
/// tail, each hop landing on the nearest filter declaring that direction.
///
/// No lock is held while a handler runs, so handlers may write to the
/// connection or close it from inside an inbound event.
pub struct FilterChain {
    filters: RwLock<Vec<Filter>>,
    conn: RwLock<Weak<Connection>>,
}

impl FilterChain {
    /// Creates an empty template chain that is not bound to any connection.
    pub fn new() -> FilterChain {
        let head = Filter {
            name: Arc::from(HEAD_NAME),
            bound: Bound::OUTBOUND,
            handler: Arc::new(HeadHandler),
        };
        let tail = Filter {
            name: Arc::from(TAIL_NAME),
            bound: Bound::INBOUND,
            handler: Arc::new(TailHandler),
        };
        FilterChain {
            filters: RwLock::new(vec![head, tail]),
            conn: RwLock::new(Weak::new()),
        }
    }

    pub fn with_connection(conn: &Arc<Connection>) -> FilterChain {
        let chain = FilterChain::new();
        chain.set_con(conn);
        chain
    }

    /// Builds a chain bound to `conn` holding a fresh clone of every interior
    /// handler of this one, same names and same order.
    pub fn new_instance_and_clone(&self, conn: &Arc<Connection>) -> Arc<FilterChain> {
        let chain = FilterChain::with_connection(conn);
        let interior: Vec<Filter> = {
            let filters = self.filters.read();
            filters[1..filters.len() - 1].to_vec()
        };
        for filter in interior {
            chain.push_filter(filter.name, Arc::from(filter.handler.clone_handler()));
        }
        Arc::new(chain)
    }

    /// Inserts a filter right before the tail. Insertion order is the inbound
    /// traversal order and the reverse of the outbound one.
    pub fn add_last<H: IoHandler>(&self, name: impl Into<String>, handler: H) {
        self.push_filter(Arc::from(name.into()), Arc::new(handler));
    }

    pub fn add_last_boxed(&self, name: impl Into<String>, handler: Box<dyn IoHandler>) {
        self.push_filter(Arc::from(name.into()), Arc::from(handler));
    }

    fn push_filter(&self, name: Arc<str>, handler: Arc<dyn IoHandler>) {
        let bound = handler.bound();
        let mut filters = self.filters.write();
        let tail_index = filters.len() - 1;
        trace!("add filter {} at position {}", name, tail_index);
        filters.insert(
            tail_index,
            Filter {
                name,
                bound,
                handler,
            },
        );
    }

    /// Removes the first interior filter named `name`. Sentinels are never removed.
    pub fn remove(&self, name: &str) -> bool {
        let mut filters = self.filters.write();
        let last = filters.len() - 1;
        match (1..last).find(|&i| &*filters[i].name == name) {
            Some(index) => {
                filters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Names of the interior filters in insertion order.
    pub fn filter_names(&self) -> Vec<String> {
        let filters = self.filters.read();
        filters[1..filters.len() - 1]
            .iter()
            .map(|f| f.name.to_string())
            .collect()
    }

    /// Number of interior filters.
    pub fn len(&self) -> usize {
        self.filters.read().len() - 2
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.read().upgrade()
    }

    /// Rebinds the chain. Every filter, sentinels included, sees the new
    /// connection through its context from the next event on.
    pub(crate) fn set_con(&self, conn: &Arc<Connection>) {
        *self.conn.write() = Arc::downgrade(conn);
    }

    pub fn get_head_filter(&self) -> FilterContext<'_> {
        self.context_at(0, Arc::from(HEAD_NAME))
    }

    pub fn get_tail_filter(&self) -> FilterContext<'_> {
        let last = self.filters.read().len() - 1;
        self.context_at(last, Arc::from(TAIL_NAME))
    }

    fn context_at(&self, index: usize, name: Arc<str>) -> FilterContext<'_> {
        FilterContext {
            chain: self,
            index,
            name,
            conn: self.connection(),
        }
    }

    pub fn fire_conn_opened(&self) {
        self.get_head_filter().fire_conn_opened();
    }

    pub fn fire_conn_closed(&self) {
        self.get_head_filter().fire_conn_closed();
    }

    pub fn fire_message_received(&self, msg: &mut BytesMut) {
        self.get_head_filter().fire_message_received(msg);
    }

    pub fn fire_write(&self, msg: BytesMut) {
        self.get_tail_filter().fire_write(msg);
    }

    fn next_inbound(&self, from: usize) -> Option<(usize, Filter)> {
        let filters = self.filters.read();
        filters
            .iter()
            .enumerate()
            .skip(from + 1)
            .find(|(_, f)| f.bound.is_inbound())
            .map(|(i, f)| (i, f.clone()))
    }

    fn prev_outbound(&self, from: usize) -> Option<(usize, Filter)> {
        let filters = self.filters.read();
        let from = from.min(filters.len());
        filters[..from]
            .iter()
            .enumerate()
            .rev()
            .find(|(_, f)| f.bound.is_outbound())
            .map(|(i, f)| (i, f.clone()))
    }
}

impl Default for FilterChain {
    fn default() -> Self {
        FilterChain::new()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .filters
            .read()
            .iter()
            .map(|filter| filter.name.to_string())
            .collect();
        f.debug_struct("FilterChain")
            .field("filters", &names)
            .field("bound", &self.connection().is_some())
            .finish()
    }
}

/// Position of a handler inside a chain, handed to every handler call.
///
/// The `fire_*` methods continue propagation from this position: inbound events
/// to the next inbound filter, writes to the previous outbound filter.
pub struct FilterContext<'a> {
    chain: &'a FilterChain,
    index: usize,
    name: Arc<str>,
    conn: Option<Arc<Connection>>,
}

impl FilterContext<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The connection the chain is bound to, `None` on a template chain.
    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.conn.as_ref()
    }

    pub fn chain(&self) -> &FilterChain {
        self.chain
    }

    fn hop(&self, index: usize, filter: &Filter) -> FilterContext<'_> {
        FilterContext {
            chain: self.chain,
            index,
            name: filter.name.clone(),
            conn: self.conn.clone(),
        }
    }

    pub fn fire_conn_opened(&self) {
        if let Some((index, filter)) = self.chain.next_inbound(self.index) {
            filter.handler.conn_opened(&self.hop(index, &filter));
        }
    }

    pub fn fire_conn_closed(&self) {
        if let Some((index, filter)) = self.chain.next_inbound(self.index) {
            filter.handler.conn_closed(&self.hop(index, &filter));
        }
    }

    pub fn fire_message_received(&self, msg: &mut BytesMut) {
        if let Some((index, filter)) = self.chain.next_inbound(self.index) {
            filter.handler.message_received(&self.hop(index, &filter), msg);
        }
    }

    pub fn fire_write(&self, msg: BytesMut) {
        if let Some((index, filter)) = self.chain.prev_outbound(self.index) {
            filter.handler.filter_write(&self.hop(index, &filter), msg);
        }
    }
}

/// Terminal outbound stage: framed bytes go to the send queue without waiting.
struct HeadHandler;

impl IoHandler for HeadHandler {
    fn bound(&self) -> Bound {
        Bound::OUTBOUND
    }

    fn filter_write(&self, ctx: &FilterContext<'_>, msg: BytesMut) {
        match ctx.connection() {
            Some(conn) => {
                let len = msg.len();
                if let Err(e) = conn.try_flush(msg) {
                    warn!(
                        "connection[{}] drop {} bytes on flush: {}",
                        conn.remote_addr(),
                        len,
                        e
                    );
                }
            }
            None => warn!("filter chain not bound to a connection, drop {} bytes", msg.len()),
        }
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(HeadHandler)
    }
}

/// Terminal inbound stage: whatever buffer gets this far has been consumed.
struct TailHandler;

impl IoHandler for TailHandler {
    fn bound(&self) -> Bound {
        Bound::INBOUND
    }

    fn conn_opened(&self, _ctx: &FilterContext<'_>) {}

    fn conn_closed(&self, _ctx: &FilterContext<'_>) {}

    fn message_received(&self, _ctx: &FilterContext<'_>, msg: &mut BytesMut) {
        msg.clear();
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(TailHandler)
    }
}
