// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! An experimental, multithreaded server implementation of the Constrained
//! Application Protocol (CoAP, [IETF-RFC7252]).
//!
//! This crate provides the protocol core of a CoAP-over-UDP server: the
//! [message codec](message::codec), the reliability layer (deduplication,
//! ACK/RST matching, exponential-backoff retransmission), [block-wise
//! transfers][IETF-RFC7959], and [observe][IETF-RFC7641] relation tracking.
//! Resource storage and per-resource behavior stay outside the core, behind
//! the [`ResourceRegistry`] trait; a [`MemoryRegistry`] is included for
//! simple servers and tests.
//!
//! [IETF-RFC7252]: https://tools.ietf.org/html/rfc7252
//! [IETF-RFC7959]: https://tools.ietf.org/html/rfc7959
//! [IETF-RFC7641]: https://tools.ietf.org/html/rfc7641
//!
//! ## Example
//!
//! ```no_run
//! use coap_server::{CoapServer, MemoryRegistry, Resource, ServerConfig};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(MemoryRegistry::new());
//!
//! let server = CoapServer::start("[::]:5683", registry, ServerConfig::default())
//!     .expect("UDP bind failed");
//!
//! let temp = server.add_resource(
//!     "/temp",
//!     Resource::new("/temp").with_payload("20 C").observable(true),
//! );
//!
//! // ... later, after a measurement:
//! temp.set_payload("21 C");
//! server.notify(&temp);
//! # server.stop();
//! ```
//!
//! ## Concurrency model
//!
//! One receive thread feeds a bounded worker pool over a channel; each
//! datagram is handled synchronously by one worker. A single scheduler
//! thread owns a min-heap of deadlines and fires retransmissions, deferred
//! empty ACKs, and the exchange-lifetime purge. Shared state lives in a
//! handful of independently locked tables, and transmission status is an
//! atomic cell shared between the ACK path and the scheduler.

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::all)]
#![warn(missing_docs)]

#[macro_use]
extern crate log;

pub mod message;
pub mod option;

mod content_format;
pub use content_format::ContentFormat;

mod block;
pub use block::*;

pub mod consts;
#[doc(hidden)]
pub use consts::*;

mod error;
pub use error::*;

mod util;

pub mod link_format;

mod registry;
pub use registry::{MemoryRegistry, Resource, ResourceRegistry};

pub mod server;
pub use server::{CoapServer, DatagramSocket, ServerConfig};
