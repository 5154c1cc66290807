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

//! Observe relation bookkeeping, per
//! [IETF-RFC7641](https://tools.ietf.org/html/rfc7641).
//!
//! This module only tracks who is watching what; building and sending the
//! notifications is the server core's job.

use crate::message::{Message, MsgId, MsgToken};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

/// Identity of an observer: the peer address and the registration token,
/// compared as opaque bytes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ObserverId {
    /// The observer's address.
    pub addr: SocketAddr,

    /// The token of the registration GET; every notification echoes it.
    pub token: MsgToken,
}

impl ObserverId {
    /// Creates a new observer identity.
    pub fn new(addr: SocketAddr, token: MsgToken) -> ObserverId {
        ObserverId { addr, token }
    }
}

/// Sequence numbers in the Observe option are 24 bits wide.
const SEQ_MASK: u32 = 0x00FF_FFFF;

#[derive(Debug, Clone)]
struct Observer {
    /// Snapshot of the registration request; notifications are produced by
    /// re-running the resource handler against it.
    request: Message,

    /// The last sequence number sent to this observer. The registration
    /// reply carries 0.
    seq: u32,

    /// Message id of the last notification, for matching an inbound RST.
    last_msg_id: MsgId,
}

/// Everything the core needs to emit one notification to one observer.
#[derive(Debug)]
pub(crate) struct NotifySlot {
    /// Who to notify.
    pub id: ObserverId,

    /// The sequence number to carry in the Observe option.
    pub seq: u32,

    /// The message id allocated for this notification.
    pub msg_id: MsgId,

    /// Clone of the registration request.
    pub request: Message,
}

/// The observe relation table: resource path to its set of observers.
#[derive(Debug, Default)]
pub(crate) struct ObserveLayer {
    relations: Mutex<HashMap<String, HashMap<ObserverId, Observer>>>,
}

impl ObserveLayer {
    pub fn new() -> ObserveLayer {
        ObserveLayer::default()
    }

    /// Stores a relation for `id` under `path`, seq 0. Re-registration with
    /// the same token resets the relation.
    pub fn register(&self, path: &str, id: ObserverId, request: &Message) {
        let mut relations = self.relations.lock().expect("Lock failed");
        relations.entry(path.to_string()).or_default().insert(
            id,
            Observer {
                request: request.clone(),
                seq: 0,
                last_msg_id: request.msg_id(),
            },
        );
    }

    /// Removes the relation for `id` under `path`. Returns true if one
    /// existed.
    pub fn deregister(&self, path: &str, id: &ObserverId) -> bool {
        let mut relations = self.relations.lock().expect("Lock failed");
        let removed = match relations.get_mut(path) {
            Some(observers) => observers.remove(id).is_some(),
            None => false,
        };
        if removed {
            debug!("Observer {}@{} left {}", id.token, id.addr, path);
        }
        if relations.get(path).map(|o| o.is_empty()).unwrap_or(false) {
            relations.remove(path);
        }
        removed
    }

    /// Finds and removes the observer whose last notification used
    /// `msg_id`, if any. This is how an inbound RST tears a relation down.
    pub fn remove_by_msg_id(&self, addr: SocketAddr, msg_id: MsgId) -> Option<(String, ObserverId)> {
        let mut relations = self.relations.lock().expect("Lock failed");

        let mut found: Option<(String, ObserverId)> = None;
        for (path, observers) in relations.iter() {
            for (id, observer) in observers.iter() {
                if id.addr == addr && observer.last_msg_id == msg_id {
                    found = Some((path.clone(), *id));
                    break;
                }
            }
        }

        if let Some((path, id)) = &found {
            if let Some(observers) = relations.get_mut(path) {
                observers.remove(id);
                if observers.is_empty() {
                    relations.remove(path);
                }
            }
        }

        found
    }

    /// Removes every relation under `path`, returning the identities and
    /// their registration requests so deletion notices can be sent.
    pub fn remove_path(&self, path: &str) -> Vec<(ObserverId, Message)> {
        let mut relations = self.relations.lock().expect("Lock failed");
        match relations.remove(path) {
            Some(observers) => observers
                .into_iter()
                .map(|(id, observer)| (id, observer.request))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Advances every observer of `path` by one sequence number (24-bit
    /// wrap), allocating a message id for each through `next_msg_id`, and
    /// returns the emission slots.
    pub fn advance<F: FnMut() -> MsgId>(&self, path: &str, mut next_msg_id: F) -> Vec<NotifySlot> {
        let mut relations = self.relations.lock().expect("Lock failed");

        let observers = match relations.get_mut(path) {
            Some(observers) => observers,
            None => return Vec::new(),
        };

        let mut slots = Vec::with_capacity(observers.len());
        for (id, observer) in observers.iter_mut() {
            observer.seq = (observer.seq + 1) & SEQ_MASK;
            observer.last_msg_id = next_msg_id();
            slots.push(NotifySlot {
                id: *id,
                seq: observer.seq,
                msg_id: observer.last_msg_id,
                request: observer.request.clone(),
            });
        }

        slots
    }

    /// Number of observers registered under `path`.
    pub fn count(&self, path: &str) -> usize {
        self.relations
            .lock()
            .expect("Lock failed")
            .get(path)
            .map(|observers| observers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MsgCode, MsgType};

    fn observer(port: u16) -> ObserverId {
        ObserverId::new(
            format!("10.0.0.1:{}", port).parse().unwrap(),
            MsgToken::new(b"ob"),
        )
    }

    fn registration(msg_id: MsgId) -> Message {
        let mut msg = Message::new(MsgType::Con, MsgCode::GET);
        msg.set_msg_id(msg_id);
        msg.set_token(MsgToken::new(b"ob"));
        msg
    }

    #[test]
    fn register_advance_deregister() {
        let layer = ObserveLayer::new();
        let id = observer(1000);
        layer.register("/temp", id, &registration(7));
        assert_eq!(layer.count("/temp"), 1);

        let mut mid = 100u16;
        let slots = layer.advance("/temp", || {
            mid += 1;
            mid
        });
        assert_eq!(slots.len(), 1);
        assert_eq!(slots[0].seq, 1);
        assert_eq!(slots[0].msg_id, 101);

        let slots = layer.advance("/temp", || 200);
        assert_eq!(slots[0].seq, 2);

        assert!(layer.deregister("/temp", &id));
        assert!(!layer.deregister("/temp", &id));
        assert_eq!(layer.count("/temp"), 0);
    }

    #[test]
    fn rst_matching_uses_the_last_msg_id() {
        let layer = ObserveLayer::new();
        let id = observer(2000);
        layer.register("/temp", id, &registration(7));

        layer.advance("/temp", || 0xBEEF);

        // A reset from a different peer does not match.
        let stranger: SocketAddr = "10.9.9.9:5683".parse().unwrap();
        assert_eq!(layer.remove_by_msg_id(stranger, 0xBEEF), None);

        let removed = layer.remove_by_msg_id(id.addr, 0xBEEF).unwrap();
        assert_eq!(removed.0, "/temp");
        assert_eq!(removed.1, id);
        assert_eq!(layer.count("/temp"), 0);
    }

    #[test]
    fn sequence_numbers_wrap_at_24_bits() {
        let layer = ObserveLayer::new();
        let id = observer(3000);
        layer.register("/temp", id, &registration(1));

        // Push the stored sequence number to the wrap boundary.
        {
            let mut relations = layer.relations.lock().unwrap();
            relations
                .get_mut("/temp")
                .unwrap()
                .get_mut(&id)
                .unwrap()
                .seq = SEQ_MASK;
        }

        let slots = layer.advance("/temp", || 1);
        assert_eq!(slots[0].seq, 0);
    }

    #[test]
    fn deletion_returns_every_observer() {
        let layer = ObserveLayer::new();
        layer.register("/temp", observer(1), &registration(1));
        layer.register("/temp", observer(2), &registration(2));

        let removed = layer.remove_path("/temp");
        assert_eq!(removed.len(), 2);
        assert_eq!(layer.count("/temp"), 0);
        assert!(layer.remove_path("/temp").is_empty());
    }
}
