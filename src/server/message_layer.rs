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

//! The message layer: message id allocation, duplicate detection with
//! idempotent response replay, ACK/RST matching, and exchange-lifetime
//! purging.

use super::exchange::{ExchangeKey, ReceivedEntry, SentEntry, TransmitState, TransmitStatus};
use crate::message::{Message, MsgId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What to do with an inbound request after consulting the dedup tables.
#[derive(Debug)]
pub(crate) enum InboundDisposition {
    /// First sighting: process it. The state cell is shared with the new
    /// `received` entry.
    New(Arc<TransmitState>),

    /// Duplicate with a cached response: resend these exact bytes.
    Replay(Arc<Vec<u8>>),

    /// Duplicate of a request we have empty-ACKed but not yet answered:
    /// resend an empty ACK.
    EmptyAck,

    /// Duplicate of a request we reset: resend RST.
    Reset,

    /// Duplicate and no response is ready: drop it silently.
    Drop,
}

/// The server-wide `received`/`sent` exchange tables and the message id
/// counter.
#[derive(Debug)]
pub(crate) struct MessageLayer {
    next_msg_id: AtomicU16,
    received: Mutex<HashMap<ExchangeKey, ReceivedEntry>>,
    sent: Mutex<HashMap<ExchangeKey, SentEntry>>,
}

impl MessageLayer {
    /// Creates the layer. The message id counter starts at `starting_msg_id`
    /// when given, otherwise at a random value in `[1, 1000]`.
    pub fn new(starting_msg_id: Option<MsgId>) -> MessageLayer {
        let seed = starting_msg_id.unwrap_or_else(|| 1 + rand::random::<u16>() % 1000);
        MessageLayer {
            next_msg_id: AtomicU16::new(seed),
            received: Mutex::new(HashMap::new()),
            sent: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates the next message id. Wraps at 2^16.
    pub fn next_msg_id(&self) -> MsgId {
        self.next_msg_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers an inbound request, or classifies it as a duplicate.
    ///
    /// The check and the insertion happen under one lock so two workers
    /// racing on the same duplicate cannot both see "new".
    pub fn register_inbound(&self, key: ExchangeKey, request: &Message) -> InboundDisposition {
        let mut received = self.received.lock().expect("Lock failed");

        if let Some(entry) = received.get_mut(&key) {
            if !entry.duplicated {
                entry.duplicated = true;
            }
            debug!(
                "Duplicate {} request MID:{:04X} from {}",
                entry.request.code(),
                key.msg_id,
                key.addr
            );

            if let Some(sent) = self.sent.lock().expect("Lock failed").get(&key) {
                return InboundDisposition::Replay(sent.frame.clone());
            }

            return match entry.state.load() {
                TransmitStatus::Acknowledged => InboundDisposition::EmptyAck,
                TransmitStatus::Rejected => InboundDisposition::Reset,
                _ => InboundDisposition::Drop,
            };
        }

        let state = TransmitState::new();
        received.insert(
            key,
            ReceivedEntry {
                request: request.clone(),
                state: state.clone(),
                duplicated: false,
                at: Instant::now(),
            },
        );

        InboundDisposition::New(state)
    }

    /// Caches an outbound frame under `key` for duplicate replay and
    /// ACK/RST matching.
    pub fn record_sent(&self, key: ExchangeKey, frame: Arc<Vec<u8>>, state: Arc<TransmitState>) {
        self.sent.lock().expect("Lock failed").insert(
            key,
            SentEntry {
                frame,
                state,
                at: Instant::now(),
            },
        );
    }

    /// Handles an inbound empty ACK: settles the matching outbound frame.
    /// Returns true if something matched.
    pub fn handle_ack(&self, key: ExchangeKey) -> bool {
        match self.sent.lock().expect("Lock failed").get(&key) {
            Some(entry) => {
                entry.state.settle(TransmitStatus::Acknowledged);
                true
            }
            None => false,
        }
    }

    /// Handles an inbound RST: settles the matching outbound frame and, for
    /// piggy-backed exchanges, the stored request. Returns true if
    /// something matched.
    pub fn handle_rst(&self, key: ExchangeKey) -> bool {
        let matched = match self.sent.lock().expect("Lock failed").get(&key) {
            Some(entry) => {
                entry.state.settle(TransmitStatus::Rejected);
                true
            }
            None => false,
        };

        if let Some(entry) = self.received.lock().expect("Lock failed").get(&key) {
            entry.state.settle(TransmitStatus::Rejected);
        }

        matched
    }

    /// Drops the cached frame for `key`, e.g. when retransmission gave up.
    pub fn forget_sent(&self, key: ExchangeKey) {
        self.sent.lock().expect("Lock failed").remove(&key);
    }

    /// Deletes entries older than `lifetime` from both tables. Sent entries
    /// with live retransmit jobs are skipped.
    pub fn purge(&self, lifetime: Duration) {
        let now = Instant::now();

        let mut received = self.received.lock().expect("Lock failed");
        let before = received.len();
        received.retain(|_, entry| now.duration_since(entry.at) < lifetime);
        let purged = before - received.len();
        drop(received);

        let mut sent = self.sent.lock().expect("Lock failed");
        let before = sent.len();
        sent.retain(|_, entry| {
            entry.state.is_pending() || now.duration_since(entry.at) < lifetime
        });
        let purged = purged + before - sent.len();
        drop(sent);

        if purged > 0 {
            debug!("Purged {} expired exchange entries", purged);
        }
    }

    #[cfg(test)]
    pub fn backdate(&self, key: ExchangeKey, age: Duration) {
        if let Some(entry) = self.received.lock().unwrap().get_mut(&key) {
            entry.at = Instant::now() - age;
        }
        if let Some(entry) = self.sent.lock().unwrap().get_mut(&key) {
            entry.at = Instant::now() - age;
        }
    }

    #[cfg(test)]
    pub fn table_sizes(&self) -> (usize, usize) {
        (
            self.received.lock().unwrap().len(),
            self.sent.lock().unwrap().len(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consts::EXCHANGE_LIFETIME;
    use crate::message::{MsgCode, MsgType};
    use std::net::SocketAddr;

    fn peer() -> SocketAddr {
        "192.0.2.2:40000".parse().unwrap()
    }

    fn get_request(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.set_msg_id(msg_id);
        msg
    }

    #[test]
    fn msg_ids_are_monotonic_modulo_wrap() {
        let layer = MessageLayer::new(Some(0xFFFE));
        assert_eq!(layer.next_msg_id(), 0xFFFE);
        assert_eq!(layer.next_msg_id(), 0xFFFF);
        assert_eq!(layer.next_msg_id(), 0x0000);
    }

    #[test]
    fn random_seed_is_in_range() {
        for _ in 0..50 {
            let layer = MessageLayer::new(None);
            let seed = layer.next_msg_id();
            assert!(seed >= 1 && seed <= 1000, "seed {} out of range", seed);
        }
    }

    #[test]
    fn first_sighting_is_new_then_duplicates_ladder() {
        let layer = MessageLayer::new(Some(1));
        let key = ExchangeKey::new(peer(), 0x10);
        let request = get_request(0x10);

        let state = match layer.register_inbound(key, &request) {
            InboundDisposition::New(state) => state,
            other => panic!("expected new, got {:?}", other),
        };

        // No response yet: duplicates are dropped.
        match layer.register_inbound(key, &request) {
            InboundDisposition::Drop => {}
            other => panic!("expected drop, got {:?}", other),
        }

        // After the empty ACK went out, duplicates draw an empty ACK.
        state.settle(TransmitStatus::Acknowledged);
        match layer.register_inbound(key, &request) {
            InboundDisposition::EmptyAck => {}
            other => panic!("expected empty ack, got {:?}", other),
        }

        // Once a response frame is cached, duplicates replay it.
        let frame = Arc::new(vec![0x60, 0x45, 0x00, 0x10]);
        layer.record_sent(key, frame.clone(), TransmitState::new());
        match layer.register_inbound(key, &request) {
            InboundDisposition::Replay(cached) => assert_eq!(cached, frame),
            other => panic!("expected replay, got {:?}", other),
        }
    }

    #[test]
    fn rejected_requests_draw_reset() {
        let layer = MessageLayer::new(Some(1));
        let key = ExchangeKey::new(peer(), 0x11);
        let request = get_request(0x11);

        match layer.register_inbound(key, &request) {
            InboundDisposition::New(state) => {
                state.settle(TransmitStatus::Rejected);
            }
            other => panic!("expected new, got {:?}", other),
        }

        match layer.register_inbound(key, &request) {
            InboundDisposition::Reset => {}
            other => panic!("expected reset, got {:?}", other),
        }
    }

    #[test]
    fn ack_settles_the_sent_state() {
        let layer = MessageLayer::new(Some(1));
        let key = ExchangeKey::new(peer(), 0x12);

        let state = TransmitState::new();
        layer.record_sent(key, Arc::new(vec![]), state.clone());

        assert!(layer.handle_ack(key));
        assert_eq!(state.load(), TransmitStatus::Acknowledged);

        // A reset arriving second loses.
        assert!(layer.handle_rst(key));
        assert_eq!(state.load(), TransmitStatus::Acknowledged);

        assert!(!layer.handle_ack(ExchangeKey::new(peer(), 0x99)));
    }

    #[test]
    fn purge_removes_expired_entries() {
        let layer = MessageLayer::new(Some(1));
        let old = ExchangeKey::new(peer(), 0x20);
        let fresh = ExchangeKey::new(peer(), 0x21);

        layer.register_inbound(old, &get_request(0x20));
        layer.register_inbound(fresh, &get_request(0x21));

        let old_state = TransmitState::new();
        old_state.settle(TransmitStatus::Acknowledged);
        layer.record_sent(old, Arc::new(vec![]), old_state);

        layer.backdate(old, EXCHANGE_LIFETIME + Duration::from_secs(1));

        layer.purge(EXCHANGE_LIFETIME);
        assert_eq!(layer.table_sizes(), (1, 0));
    }

    #[test]
    fn purge_skips_pending_retransmissions() {
        let layer = MessageLayer::new(Some(1));
        let key = ExchangeKey::new(peer(), 0x30);

        layer.record_sent(key, Arc::new(vec![]), TransmitState::new());
        layer.backdate(key, EXCHANGE_LIFETIME + Duration::from_secs(1));

        layer.purge(EXCHANGE_LIFETIME);
        assert_eq!(layer.table_sizes(), (0, 1));
    }
}
