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

//! Filter chain pipeline.
//!
//! Every connection owns one [`FilterChain`], cloned from a template held by the
//! acceptor or connector. Bytes read from the socket travel inbound through the
//! chain (decoders, then application handlers); application writes travel
//! outbound (encoders) until the head sentinel queues them for the socket.

pub use chain::{FilterChain, FilterContext};
pub use handler::{Bound, IoHandler};

mod chain;
mod handler;
