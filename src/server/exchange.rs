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

//! Per-exchange bookkeeping: typed table keys and the atomic transmission
//! state shared between the ACK-handling path and the retransmit scheduler.

use crate::message::{Message, MsgId};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Key of the `received` and `sent` exchange tables: peer address plus
/// message id.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) struct ExchangeKey {
    pub addr: SocketAddr,
    pub msg_id: MsgId,
}

impl ExchangeKey {
    pub fn new(addr: SocketAddr, msg_id: MsgId) -> ExchangeKey {
        ExchangeKey { addr, msg_id }
    }
}

/// The lifecycle phase of a tracked message.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub(crate) enum TransmitStatus {
    /// No terminal event yet. For an inbound request: the handler is still
    /// running. For an outbound CON: retransmission is still live.
    Pending = 0,

    /// The peer acknowledged an outbound CON, or (for an inbound request)
    /// the scheduler emitted an empty ACK and the eventual response must be
    /// sent separately.
    Acknowledged = 1,

    /// The peer reset the exchange.
    Rejected = 2,

    /// Retransmission attempts were exhausted.
    TimedOut = 3,

    /// The handler produced a piggy-backed response before the empty-ACK
    /// deadline.
    Responded = 4,
}

/// An atomic [`TransmitStatus`] cell.
///
/// Written by the ACK/RST path and by workers; read by the retransmit
/// scheduler and the purger. All transitions go through compare-exchange so
/// the first terminal event wins.
#[derive(Debug)]
pub(crate) struct TransmitState(AtomicU8);

impl TransmitState {
    pub fn new() -> Arc<TransmitState> {
        Arc::new(TransmitState(AtomicU8::new(TransmitStatus::Pending as u8)))
    }

    pub fn load(&self) -> TransmitStatus {
        match self.0.load(Ordering::SeqCst) {
            0 => TransmitStatus::Pending,
            1 => TransmitStatus::Acknowledged,
            2 => TransmitStatus::Rejected,
            3 => TransmitStatus::TimedOut,
            _ => TransmitStatus::Responded,
        }
    }

    /// Moves from `Pending` to `to`; returns false if some other transition
    /// happened first.
    pub fn settle(&self, to: TransmitStatus) -> bool {
        self.0
            .compare_exchange(
                TransmitStatus::Pending as u8,
                to as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.load() == TransmitStatus::Pending
    }
}

/// What the server remembers about the last request it saw from a peer
/// under a given message id.
#[derive(Debug)]
pub(crate) struct ReceivedEntry {
    /// Snapshot of the request, kept so notifications and diagnostics can
    /// consult it.
    pub request: Message,

    /// `Pending` while the handler runs; `Acknowledged` once an empty ACK
    /// went out; `Responded` once a piggy-backed response went out.
    pub state: Arc<TransmitState>,

    /// Set when a duplicate of this request arrives.
    pub duplicated: bool,

    /// Insertion time, for exchange-lifetime purging.
    pub at: Instant,
}

/// What the server remembers about a response (or notification) it sent:
/// the encoded frame for duplicate replay, and the shared transmission
/// state for ACK/RST matching.
#[derive(Debug, Clone)]
pub(crate) struct SentEntry {
    pub frame: Arc<Vec<u8>>,
    pub state: Arc<TransmitState>,
    pub at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_transition_wins() {
        let state = TransmitState::new();
        assert!(state.is_pending());
        assert!(state.settle(TransmitStatus::Acknowledged));
        assert!(!state.settle(TransmitStatus::Rejected));
        assert_eq!(state.load(), TransmitStatus::Acknowledged);
    }

    #[test]
    fn keys_distinguish_peers_and_mids() {
        let a: SocketAddr = "10.0.0.1:5683".parse().unwrap();
        let b: SocketAddr = "10.0.0.2:5683".parse().unwrap();

        assert_eq!(ExchangeKey::new(a, 7), ExchangeKey::new(a, 7));
        assert_ne!(ExchangeKey::new(a, 7), ExchangeKey::new(b, 7));
        assert_ne!(ExchangeKey::new(a, 7), ExchangeKey::new(a, 8));
    }
}
