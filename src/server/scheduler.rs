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

//! The deadline scheduler: a min-heap of timer jobs owned by a single
//! thread. Retransmissions, deferred empty ACKs, and the periodic purge all
//! run through here.

use super::exchange::{ExchangeKey, TransmitState};
use super::observe::ObserverId;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// A scheduled retransmission of an unacknowledged confirmable frame.
#[derive(Debug)]
pub(crate) struct RetransmitJob {
    /// Table key of the tracked exchange (peer + message id of the frame).
    pub key: ExchangeKey,

    /// The encoded frame, resent verbatim.
    pub frame: Arc<Vec<u8>>,

    /// Shared with the `sent` table entry; the ACK/RST path settles it.
    pub state: Arc<TransmitState>,

    /// The timeout that was waited before this firing. Doubles on each
    /// retransmission.
    pub timeout: Duration,

    /// How many retransmissions have already been sent.
    pub attempt: u32,

    /// When the frame is an observe notification: the relation to tear down
    /// if the peer never acknowledges.
    pub observer: Option<(String, ObserverId)>,
}

/// A deferred empty ACK for a confirmable request whose handler is slow
/// (RFC7252 Section 5.2.2).
#[derive(Debug)]
pub(crate) struct EmptyAckJob {
    /// Table key of the inbound request.
    pub key: ExchangeKey,

    /// The encoded empty ACK.
    pub frame: Vec<u8>,

    /// Shared with the `received` table entry. Whichever of this job and
    /// the worker settles it first decides piggy-backed versus separate
    /// response.
    pub state: Arc<TransmitState>,
}

/// A job with a deadline.
#[derive(Debug)]
pub(crate) enum TimerJob {
    /// Resend a confirmable frame, or give up on it.
    Retransmit(RetransmitJob),

    /// Send an empty ACK if the request is still unanswered.
    EmptyAck(EmptyAckJob),

    /// Sweep the exchange tables and block-wise sessions.
    Purge,
}

#[derive(Debug)]
struct Entry {
    at: Instant,
    seq: u64,
    job: TimerJob,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    // Reversed so the BinaryHeap yields the earliest deadline first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Queue {
    heap: BinaryHeap<Entry>,
    next_seq: u64,
    shutdown: bool,
}

/// A deadline queue drained by a single scheduler thread.
#[derive(Debug)]
pub(crate) struct Scheduler {
    queue: Mutex<Queue>,
    cond: Condvar,
}

impl Scheduler {
    pub fn new() -> Scheduler {
        Scheduler {
            queue: Mutex::new(Queue {
                heap: BinaryHeap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enqueues a job to fire at `at`.
    pub fn schedule_at(&self, at: Instant, job: TimerJob) {
        let mut queue = self.queue.lock().expect("Lock failed");
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(Entry { at, seq, job });
        self.cond.notify_one();
    }

    /// Enqueues a job to fire after `delay`.
    pub fn schedule_after(&self, delay: Duration, job: TimerJob) {
        self.schedule_at(Instant::now() + delay, job);
    }

    /// Wakes the scheduler thread and makes [`Scheduler::next`] return
    /// `None`. Pending jobs are dropped.
    pub fn shutdown(&self) {
        let mut queue = self.queue.lock().expect("Lock failed");
        queue.shutdown = true;
        queue.heap.clear();
        self.cond.notify_all();
    }

    /// Blocks until the earliest job is due and returns it, or returns
    /// `None` after [`Scheduler::shutdown`].
    pub fn next(&self) -> Option<TimerJob> {
        let mut queue = self.queue.lock().expect("Lock failed");

        loop {
            if queue.shutdown {
                return None;
            }

            let now = Instant::now();
            let wait = match queue.heap.peek() {
                Some(entry) if entry.at <= now => {
                    let entry = queue.heap.pop().expect("Heap is empty");
                    return Some(entry.job);
                }
                Some(entry) => Some(entry.at - now),
                None => None,
            };

            queue = match wait {
                Some(duration) => {
                    self.cond
                        .wait_timeout(queue, duration)
                        .expect("Lock failed")
                        .0
                }
                None => self.cond.wait(queue).expect("Lock failed"),
            };
        }
    }

    /// Pops the earliest job if it is already due, without blocking. Tests
    /// drive the scheduler with this.
    #[cfg(test)]
    pub fn try_next(&self) -> Option<TimerJob> {
        let mut queue = self.queue.lock().expect("Lock failed");
        match queue.heap.peek() {
            Some(entry) if entry.at <= Instant::now() => {
                Some(queue.heap.pop().expect("Heap is empty").job)
            }
            _ => None,
        }
    }

    /// Pops the earliest job regardless of its deadline. Tests use this to
    /// fast-forward time.
    #[cfg(test)]
    pub fn force_next(&self) -> Option<TimerJob> {
        let mut queue = self.queue.lock().expect("Lock failed");
        queue.heap.pop().map(|entry| entry.job)
    }

    /// Number of jobs currently queued.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.queue.lock().expect("Lock failed").heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn due_now() -> Instant {
        Instant::now() - Duration::from_millis(1)
    }

    #[test]
    fn jobs_pop_in_deadline_order() {
        let scheduler = Scheduler::new();
        let base = due_now();

        scheduler.schedule_at(base, TimerJob::Purge);
        scheduler.schedule_at(base - Duration::from_millis(5), TimerJob::Purge);
        assert_eq!(scheduler.pending(), 2);

        assert!(scheduler.try_next().is_some());
        assert!(scheduler.try_next().is_some());
        assert!(scheduler.try_next().is_none());
    }

    #[test]
    fn equal_deadlines_pop_in_insertion_order() {
        let scheduler = Scheduler::new();
        let at = due_now();

        let key_a = ExchangeKey::new("10.0.0.1:1111".parse().unwrap(), 1);
        let key_b = ExchangeKey::new("10.0.0.1:1111".parse().unwrap(), 2);

        scheduler.schedule_at(
            at,
            TimerJob::EmptyAck(EmptyAckJob {
                key: key_a,
                frame: vec![],
                state: TransmitState::new(),
            }),
        );
        scheduler.schedule_at(
            at,
            TimerJob::EmptyAck(EmptyAckJob {
                key: key_b,
                frame: vec![],
                state: TransmitState::new(),
            }),
        );

        match scheduler.try_next() {
            Some(TimerJob::EmptyAck(job)) => assert_eq!(job.key, key_a),
            other => panic!("unexpected job: {:?}", other),
        }
        match scheduler.try_next() {
            Some(TimerJob::EmptyAck(job)) => assert_eq!(job.key, key_b),
            other => panic!("unexpected job: {:?}", other),
        }
    }

    #[test]
    fn future_jobs_are_not_due() {
        let scheduler = Scheduler::new();
        scheduler.schedule_after(Duration::from_secs(60), TimerJob::Purge);
        assert!(scheduler.try_next().is_none());
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn shutdown_unblocks_next() {
        let scheduler = Arc::new(Scheduler::new());
        let other = scheduler.clone();

        let thread = std::thread::spawn(move || other.next());
        scheduler.shutdown();
        assert!(thread.join().unwrap().is_none());
    }
}
