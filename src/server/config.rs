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

//! Server tunables.

use crate::block::BlockInfo;
use std::time::Duration;

/// Tunables for a [`CoapServer`](crate::server::CoapServer).
///
/// The defaults match the behavior described by RFC7252 and are appropriate
/// for most deployments; tests and constrained links are the usual reasons
/// to deviate.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Number of worker threads handling inbound datagrams.
    pub workers: usize,

    /// How long a `recv_from` call may block before re-checking for
    /// shutdown.
    pub receive_timeout: Duration,

    /// Preferred block size exponent for Block2 transfers (0..=6, sizes 16
    /// to 1024 bytes). A client asking for a smaller size wins.
    pub preferred_block_szx: u8,

    /// Initial message id. Drawn randomly from `[1, 1000]` when `None`.
    pub starting_msg_id: Option<u16>,

    /// Applies multicast-friendly socket options and joins the bound group
    /// address when it is a multicast address.
    pub multicast: bool,

    /// Every n-th observe notification per observer is sent confirmable so
    /// dead observers are eventually detected and dropped.
    pub notify_con_interval: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            workers: 10,
            receive_timeout: Duration::from_secs(10),
            preferred_block_szx: BlockInfo::SZX_MAX,
            starting_msg_id: None,
            multicast: false,
            notify_con_interval: 8,
        }
    }
}
