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

//! Codec handlers for the filter chain.
//!
//! A [`Decoder`] pulls complete messages off the connection's accumulation
//! buffer, an [`Encoder`] turns an outbound payload into wire bytes. The
//! [`ProtocolDecoder`] and [`ProtocolEncoder`] adapters plug them into a chain.

use bytes::BytesMut;
use parking_lot::Mutex;
use tracing::error;

use crate::filter::{Bound, FilterContext, IoHandler};
use crate::AppResult;

pub use frame::{FrameDecoder, FrameEncoder, MAX_FRAME_SIZE};

mod frame;

pub trait Decoder: Send + 'static {
    /// Takes at most one message from the front of `buffer`.
    ///
    /// `Ok(None)` means more bytes are needed, unconsumed bytes must stay in the
    /// buffer. An error is a protocol violation and ends the connection.
    fn decode(&mut self, buffer: &mut BytesMut) -> AppResult<Option<BytesMut>>;

    /// Forgets any partially decoded message.
    fn reset(&mut self);

    /// Same configuration, fresh state.
    fn new_instance(&self) -> Self
    where
        Self: Sized;
}

pub trait Encoder: Send + Sync + 'static {
    fn encode(&self, msg: BytesMut) -> AppResult<BytesMut>;

    fn new_instance(&self) -> Self
    where
        Self: Sized;
}

/// Inbound handler running a [`Decoder`] until it yields nothing, so every
/// message contained in one read is dispatched on its own and in order.
pub struct ProtocolDecoder<D> {
    decoder: Mutex<D>,
}

impl<D: Decoder> ProtocolDecoder<D> {
    pub fn new(decoder: D) -> Self {
        ProtocolDecoder {
            decoder: Mutex::new(decoder),
        }
    }
}

impl<D: Decoder> IoHandler for ProtocolDecoder<D> {
    fn bound(&self) -> Bound {
        Bound::INBOUND
    }

    fn conn_opened(&self, ctx: &FilterContext<'_>) {
        self.decoder.lock().reset();
        ctx.fire_conn_opened();
    }

    fn message_received(&self, ctx: &FilterContext<'_>, msg: &mut BytesMut) {
        loop {
            // the guard is released before the message travels on
            let decoded = self.decoder.lock().decode(msg);
            match decoded {
                Ok(Some(mut message)) => ctx.fire_message_received(&mut message),
                Ok(None) => break,
                Err(e) => {
                    match ctx.connection() {
                        Some(conn) => {
                            error!(
                                "{} of connection[{}] force close the connection: {}",
                                ctx.name(),
                                conn.remote_addr(),
                                e
                            );
                            conn.close();
                        }
                        None => error!("{} decode error: {}", ctx.name(), e),
                    }
                    break;
                }
            }
        }
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(ProtocolDecoder::new(self.decoder.lock().new_instance()))
    }
}

/// Outbound handler running an [`Encoder`] on every write.
pub struct ProtocolEncoder<E> {
    encoder: E,
}

impl<E: Encoder> ProtocolEncoder<E> {
    pub fn new(encoder: E) -> Self {
        ProtocolEncoder { encoder }
    }
}

impl<E: Encoder> IoHandler for ProtocolEncoder<E> {
    fn bound(&self) -> Bound {
        Bound::OUTBOUND
    }

    fn filter_write(&self, ctx: &FilterContext<'_>, msg: BytesMut) {
        match self.encoder.encode(msg) {
            Ok(frame) => ctx.fire_write(frame),
            Err(e) => error!("{} drop outbound message: {}", ctx.name(), e),
        }
    }

    fn clone_handler(&self) -> Box<dyn IoHandler> {
        Box::new(ProtocolEncoder::new(self.encoder.new_instance()))
    }
}
