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

//! Protocol constants and [transmission parameters][tp] from
//! [IETF-RFC7252] and [IETF-RFC7641].
//!
//! [tp]: https://tools.ietf.org/html/rfc7252#section-4.8
//! [IETF-RFC7252]: https://tools.ietf.org/html/rfc7252
//! [IETF-RFC7641]: https://tools.ietf.org/html/rfc7641

use std::time::Duration;

/// The standard default IP port number used for CoAP-over-UDP.
pub const DEFAULT_PORT_COAP_UDP: u16 = 5683;

/// The only CoAP version number this implementation speaks.
pub const COAP_VERSION: u8 = 1;

/// The byte separating the option sequence from the payload.
pub const PAYLOAD_MARKER: u8 = 0xFF;

/// The discovery path described by [IETF-RFC6690](https://tools.ietf.org/html/rfc6690).
pub const WELL_KNOWN_CORE_PATH: &str = "/.well-known/core";

/// `ACK_TIMEOUT` from RFC7252: the lower bound for the initial
/// retransmission timeout of a confirmable message.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(2);

/// `ACK_RANDOM_FACTOR` from RFC7252: the initial timeout is drawn uniformly
/// from `ACK_TIMEOUT` to `ACK_TIMEOUT * ACK_RANDOM_FACTOR`.
pub const ACK_RANDOM_FACTOR: f32 = 1.5;

/// `MAX_RETRANSMIT` from RFC7252: the maximum number of retransmissions of a
/// confirmable message. A message is therefore put on the wire at most
/// `MAX_RETRANSMIT + 1` times.
pub const MAX_RETRANSMIT: u32 = 4;

/// From RFC7252:
///
/// > `EXCHANGE_LIFETIME` is the time from starting to send a Confirmable
/// > message to the time when an acknowledgement is no longer expected,
/// > i.e., message-layer information about the message exchange can be
/// > purged.
///
/// 247 seconds with the default transmission parameters.
pub const EXCHANGE_LIFETIME: Duration = Duration::from_secs(247);

/// Threshold above which an outbound response payload is carried block-wise
/// per [IETF-RFC7959](https://tools.ietf.org/html/rfc7959).
pub const MAX_PAYLOAD: usize = 1024;

/// Upper bound on the size of a block-wise assembled request body. Bodies
/// that grow past this draw 4.13 Request Entity Too Large.
pub const MAX_REQUEST_BODY: usize = 16 * 1024;

/// How long a confirmable request may stay unanswered before the server
/// sends an empty ACK and switches to a separate response
/// ([RFC7252 Section 5.2.2](https://tools.ietf.org/html/rfc7252#section-5.2.2)).
///
/// We assume the node will attempt to send an ACK well before the sender's
/// first retransmission, so this is half of `ACK_TIMEOUT`.
pub const EMPTY_ACK_DELAY: Duration = Duration::from_secs(1);

/// Size of the receive buffer handed to `recv_from`.
pub const MAX_INBOUND_PACKET_LENGTH: usize = 4096;

/// Value for `OptionNumber::OBSERVE` when registering an observer.
///
/// Note that this is only for requests, replies have entirely different
/// semantics.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_REGISTER: u32 = 0;

/// Value for `OptionNumber::OBSERVE` when deregistering an observer.
///
/// Defined by [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
pub const OBSERVE_DEREGISTER: u32 = 1;

/// Calculates the jittered initial retransmission timeout: a duration drawn
/// uniformly from `ACK_TIMEOUT` to `ACK_TIMEOUT * ACK_RANDOM_FACTOR`.
/// Each retransmission then doubles the previous timeout.
pub fn initial_retransmit_timeout() -> Duration {
    let base = ACK_TIMEOUT.as_millis() as u64;

    const JDIV: u64 = 512u64;
    let rmod: u64 = (JDIV as f32 * (ACK_RANDOM_FACTOR - 1.0)) as u64;
    let jmul = JDIV + rand::random::<u64>() % rmod;

    Duration::from_millis(base * jmul / JDIV)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_timeout_is_within_the_mandated_range() {
        for _ in 0..100 {
            let timeout = initial_retransmit_timeout();
            assert!(timeout >= ACK_TIMEOUT);
            assert!(timeout <= Duration::from_millis(3000));
        }
    }
}
