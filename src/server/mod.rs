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

//! The server core: socket loop, worker pool, timer scheduler, and the
//! per-datagram handling that wires the codec, message, request,
//! block-wise, and observe layers together.

use crate::consts::{
    EMPTY_ACK_DELAY, EXCHANGE_LIFETIME, MAX_INBOUND_PACKET_LENGTH, MAX_RETRANSMIT,
    initial_retransmit_timeout,
};
use crate::message::{codec, InboundMessage, Message, Method, MsgCode, MsgType};
use crate::option::OptionNumber;
use crate::registry::{Resource, ResourceRegistry};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};

pub mod config;
pub mod observe;
pub mod socket;

pub(crate) mod blockwise;
pub(crate) mod exchange;
pub(crate) mod message_layer;
pub(crate) mod request_layer;
pub(crate) mod scheduler;

pub use config::ServerConfig;
pub use socket::DatagramSocket;

use blockwise::{BlockwiseLayer, RequestDisposition};
use exchange::{ExchangeKey, TransmitState, TransmitStatus};
use message_layer::{InboundDisposition, MessageLayer};
use observe::ObserveLayer;
use scheduler::{EmptyAckJob, RetransmitJob, Scheduler, TimerJob};

/// A running CoAP server.
///
/// Create one with [`CoapServer::start`], populate the resource tree with
/// [`CoapServer::add_resource`], and push resource changes to observers
/// with [`CoapServer::notify`]. Shut it down with [`CoapServer::stop`].
#[derive(Debug)]
pub struct CoapServer<S: DatagramSocket = UdpSocket> {
    inner: Arc<CoapServerInner<S>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Debug)]
pub(crate) struct CoapServerInner<S: DatagramSocket> {
    socket: S,
    config: ServerConfig,
    registry: Arc<dyn ResourceRegistry>,
    messages: MessageLayer,
    blockwise: BlockwiseLayer,
    observe: ObserveLayer,
    scheduler: Scheduler,
    running: AtomicBool,
}

impl CoapServer<UdpSocket> {
    /// Binds a UDP socket to `addr` and starts serving `registry` on it.
    pub fn start<A: ToSocketAddrs>(
        addr: A,
        registry: Arc<dyn ResourceRegistry>,
        config: ServerConfig,
    ) -> io::Result<CoapServer<UdpSocket>> {
        let addr = addr.to_socket_addrs()?.next().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "No address to bind")
        })?;

        let socket = socket::bind_udp(addr, &config)?;
        Ok(CoapServer::start_with_socket(socket, registry, config))
    }
}

impl<S: DatagramSocket> CoapServer<S> {
    /// Starts serving on an already-constructed socket. The socket's
    /// receive path must block with a timeout so shutdown can be polled.
    pub fn start_with_socket(
        socket: S,
        registry: Arc<dyn ResourceRegistry>,
        config: ServerConfig,
    ) -> CoapServer<S> {
        let workers = config.workers.max(1);
        let inner = Arc::new(CoapServerInner::new(socket, registry, config));

        inner
            .scheduler
            .schedule_after(EXCHANGE_LIFETIME, TimerJob::Purge);

        let mut threads = Vec::with_capacity(workers + 2);
        let (tx, rx) = mpsc::channel::<(Vec<u8>, SocketAddr)>();
        let rx = Arc::new(Mutex::new(rx));

        {
            let inner = inner.clone();
            threads.push(
                thread::Builder::new()
                    .name("coap-recv".to_string())
                    .spawn(move || receive_loop(inner, tx))
                    .expect("Thread spawn failed"),
            );
        }

        for index in 0..workers {
            let inner = inner.clone();
            let rx = rx.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("coap-worker-{}", index))
                    .spawn(move || worker_loop(inner, rx))
                    .expect("Thread spawn failed"),
            );
        }

        {
            let inner = inner.clone();
            threads.push(
                thread::Builder::new()
                    .name("coap-timer".to_string())
                    .spawn(move || scheduler_loop(inner))
                    .expect("Thread spawn failed"),
            );
        }

        if let Ok(addr) = inner.socket.local_addr() {
            info!("CoAP server listening on {}", addr);
        }

        CoapServer {
            inner,
            threads: Mutex::new(threads),
        }
    }

    /// Stops the server: wakes the scheduler, drains the workers, and joins
    /// every thread. Returns once the socket is quiet; may block up to the
    /// configured receive timeout.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.scheduler.shutdown();

        let threads = {
            let mut guard = match self.threads.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    debug!("Recovering from mutex poisoning");
                    poisoned.into_inner()
                }
            };
            std::mem::replace(&mut *guard, Vec::new())
        };

        for thread in threads {
            let _ = thread.join();
        }

        info!("CoAP server stopped");
    }

    /// The address the serving socket is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.socket.local_addr()
    }

    /// Adds a resource at `path` to the registry, returning the shared
    /// handle.
    pub fn add_resource(&self, path: &str, mut resource: Resource) -> Arc<Resource> {
        resource.rewrite_path(path);
        self.inner.registry.insert(resource)
    }

    /// Notifies every observer of `resource` that it changed.
    pub fn notify(&self, resource: &Resource) {
        self.inner.notify(resource);
    }

    /// Notifies every observer of `resource` that it was deleted (4.04) and
    /// drops the relations.
    pub fn notify_deletion(&self, resource: &Resource) {
        self.inner.notify_deletion(resource);
    }
}

fn receive_loop<S: DatagramSocket>(
    inner: Arc<CoapServerInner<S>>,
    tx: mpsc::Sender<(Vec<u8>, SocketAddr)>,
) {
    let mut buffer = [0u8; MAX_INBOUND_PACKET_LENGTH];

    while inner.running.load(Ordering::SeqCst) {
        match inner.socket.recv_from(&mut buffer) {
            Ok((len, peer)) => {
                if tx.send((buffer[..len].to_vec(), peer)).is_err() {
                    break;
                }
            }
            Err(ref e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                // Receive timeout: re-check for shutdown.
            }
            Err(e) => {
                error!("recv_from: io error: {:?}", e);
            }
        }
    }
    // Dropping `tx` here lets the workers drain and exit.
}

fn worker_loop<S: DatagramSocket>(
    inner: Arc<CoapServerInner<S>>,
    rx: Arc<Mutex<mpsc::Receiver<(Vec<u8>, SocketAddr)>>>,
) {
    loop {
        let datagram = {
            let guard = match rx.lock() {
                Ok(guard) => guard,
                Err(poisoned) => {
                    debug!("Recovering from mutex poisoning");
                    poisoned.into_inner()
                }
            };
            guard.recv()
        };

        match datagram {
            Ok((data, peer)) => {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    inner.handle_datagram(&data, peer)
                }));
                if result.is_err() {
                    error!("Worker recovered from a panic while handling {}", peer);
                }
            }
            Err(_) => break,
        }
    }
}

fn scheduler_loop<S: DatagramSocket>(inner: Arc<CoapServerInner<S>>) {
    while let Some(job) = inner.scheduler.next() {
        inner.execute_job(job);
    }
}

impl<S: DatagramSocket> CoapServerInner<S> {
    fn new(
        socket: S,
        registry: Arc<dyn ResourceRegistry>,
        config: ServerConfig,
    ) -> CoapServerInner<S> {
        CoapServerInner {
            socket,
            messages: MessageLayer::new(config.starting_msg_id),
            blockwise: BlockwiseLayer::new(config.preferred_block_szx),
            observe: ObserveLayer::new(),
            scheduler: Scheduler::new(),
            running: AtomicBool::new(true),
            registry,
            config,
        }
    }

    fn send_frame(&self, frame: &[u8], dest: SocketAddr) {
        if let Err(e) = self.socket.send_to(frame, dest) {
            error!("send_to: io error: {:?} (dest={})", e, dest);
        }
    }

    /// Routes one inbound datagram. This is the entry point the workers
    /// call; tests drive it directly.
    pub(crate) fn handle_datagram(&self, data: &[u8], peer: SocketAddr) {
        match codec::decode(data) {
            Err(err) => self.handle_decode_error(err, peer),
            Ok(InboundMessage::Request(request)) => {
                debug!("INBOUND request from {}: {}", peer, request);
                self.handle_request(request, peer);
            }
            Ok(InboundMessage::Response(response)) => {
                debug!("Stray response from {}; resetting", peer);
                self.send_frame(&codec::encode(&Message::rst(response.msg_id())), peer);
            }
            Ok(InboundMessage::Empty(msg)) => match msg.msg_type() {
                MsgType::Con => {
                    // CoAP ping.
                    debug!("Ping from {}", peer);
                    self.send_frame(&codec::encode(&Message::rst(msg.msg_id())), peer);
                }
                MsgType::Ack => {
                    let matched = self
                        .messages
                        .handle_ack(ExchangeKey::new(peer, msg.msg_id()));
                    if !matched {
                        debug!("ACK MID:{:04X} from {} matched nothing", msg.msg_id(), peer);
                    }
                }
                MsgType::Rst => self.handle_reset(peer, msg.msg_id()),
                MsgType::Non => debug!("Ignoring empty NON from {}", peer),
            },
        }
    }

    fn handle_decode_error(&self, err: codec::DecodeError, peer: SocketAddr) {
        let header = match err.header {
            Some(header) => header,
            None => {
                warn!("Undecodable datagram from {}; dropping", peer);
                return;
            }
        };

        // Never answer a broken ACK or RST with an error response.
        if header.msg_type.is_ack() || header.msg_type.is_rst() {
            warn!("Broken {:?} from {}; dropping", header.msg_type, peer);
            return;
        }

        let mut response = Message::new(MsgType::Non, err.response_code());
        response.set_token(header.token);

        if header.msg_type.is_con() {
            response.set_msg_type(MsgType::Ack);
            response.set_msg_id(header.msg_id);
        } else {
            response.set_msg_id(self.messages.next_msg_id());
        }

        debug!("Rejecting broken datagram from {} with {}", peer, response.code());
        self.send_frame(&codec::encode(&response), peer);
    }

    fn handle_reset(&self, peer: SocketAddr, msg_id: u16) {
        self.messages.handle_rst(ExchangeKey::new(peer, msg_id));

        if let Some((path, id)) = self.observe.remove_by_msg_id(peer, msg_id) {
            debug!("RST from {} cancels observation of {}", peer, path);
            if let Some(resource) = self.registry.lookup(&path) {
                self.registry.unsubscribe(&resource, &id);
            }
        }
    }

    fn handle_request(&self, request: Message, peer: SocketAddr) {
        let key = ExchangeKey::new(peer, request.msg_id());

        let state = match self.messages.register_inbound(key, &request) {
            InboundDisposition::New(state) => state,
            InboundDisposition::Replay(frame) => {
                self.send_frame(&frame, peer);
                return;
            }
            InboundDisposition::EmptyAck => {
                self.send_frame(&codec::encode(&Message::ack(key.msg_id)), peer);
                return;
            }
            InboundDisposition::Reset => {
                self.send_frame(&codec::encode(&Message::rst(key.msg_id)), peer);
                return;
            }
            InboundDisposition::Drop => return,
        };

        // If the handler is still busy when this fires, the request is
        // acknowledged empty and the response goes out separately.
        if request.msg_type().is_con() {
            self.scheduler.schedule_after(
                EMPTY_ACK_DELAY,
                TimerJob::EmptyAck(EmptyAckJob {
                    key,
                    frame: codec::encode(&Message::ack(key.msg_id)),
                    state: state.clone(),
                }),
            );
        }

        let response = match self.blockwise.intercept_request(peer, &request) {
            RequestDisposition::Respond(response) => response,
            RequestDisposition::Forward {
                request: forwarded,
                block1_echo,
            } => {
                // For a DELETE, hold on to the resource so observers can be
                // told after it is gone.
                let doomed = match Method::from_code(forwarded.code()) {
                    Some(Method::Delete) => self.registry.lookup(&forwarded.uri_path()),
                    _ => None,
                };

                let dispatched = panic::catch_unwind(AssertUnwindSafe(|| {
                    request_layer::dispatch(
                        self.registry.as_ref(),
                        &self.observe,
                        peer,
                        &forwarded,
                    )
                }))
                .unwrap_or_else(|_| {
                    error!("Handler panicked; responding 5.00");
                    Message::new(MsgType::Non, MsgCode::INTERNAL_SERVER_ERROR)
                });

                if dispatched.code() == MsgCode::DELETED {
                    if let Some(resource) = doomed {
                        self.notify_deletion(&resource);
                    }
                }

                self.blockwise
                    .intercept_response(peer, &forwarded, dispatched, block1_echo)
            }
        };

        self.finalize_and_send(&request, key, &state, response);
    }

    /// Gives the response its type, message id, and token, then records and
    /// sends it. Confirmable requests get a piggy-backed ACK when the
    /// handler beat the empty-ACK deadline, a separate CON otherwise.
    fn finalize_and_send(
        &self,
        request: &Message,
        key: ExchangeKey,
        request_state: &Arc<TransmitState>,
        mut response: Message,
    ) {
        response.set_token(request.token());

        if request.msg_type().is_con() {
            if request_state.settle(TransmitStatus::Responded) {
                response.set_msg_type(MsgType::Ack);
                response.set_msg_id(request.msg_id());

                let frame = Arc::new(codec::encode(&response));
                let state = TransmitState::new();
                state.settle(TransmitStatus::Responded);
                self.messages.record_sent(key, frame.clone(), state);
                self.send_frame(&frame, key.addr);
            } else {
                // The scheduler already acknowledged the request; send a
                // separate confirmable response under a fresh message id.
                response.set_msg_type(MsgType::Con);
                response.set_msg_id(self.messages.next_msg_id());
                debug!(
                    "Separate response MID:{:04X} for request MID:{:04X}",
                    response.msg_id(),
                    request.msg_id()
                );
                self.send_reliable(response, key.addr, None);
            }
        } else {
            response.set_msg_type(MsgType::Non);
            response.set_msg_id(self.messages.next_msg_id());

            let frame = Arc::new(codec::encode(&response));
            let state = TransmitState::new();
            state.settle(TransmitStatus::Responded);
            // Cached under the request key so duplicates replay it.
            self.messages.record_sent(key, frame.clone(), state);
            self.send_frame(&frame, key.addr);
        }
    }

    /// Sends a confirmable frame and schedules its retransmission job.
    fn send_reliable(
        &self,
        message: Message,
        dest: SocketAddr,
        observer: Option<(String, observe::ObserverId)>,
    ) {
        let key = ExchangeKey::new(dest, message.msg_id());
        let state = TransmitState::new();
        let frame = Arc::new(codec::encode(&message));

        self.messages.record_sent(key, frame.clone(), state.clone());
        self.send_frame(&frame, dest);

        let timeout = initial_retransmit_timeout();
        self.scheduler.schedule_after(
            timeout,
            TimerJob::Retransmit(RetransmitJob {
                key,
                frame,
                state,
                timeout,
                attempt: 0,
                observer,
            }),
        );
    }

    pub(crate) fn execute_job(&self, job: TimerJob) {
        match job {
            TimerJob::Purge => {
                self.messages.purge(EXCHANGE_LIFETIME);
                self.blockwise.purge_stale(EXCHANGE_LIFETIME);
                self.scheduler
                    .schedule_after(EXCHANGE_LIFETIME, TimerJob::Purge);
            }
            TimerJob::EmptyAck(job) => {
                if job.state.settle(TransmitStatus::Acknowledged) {
                    debug!(
                        "Handler still busy; empty ACK for MID:{:04X}",
                        job.key.msg_id
                    );
                    self.send_frame(&job.frame, job.key.addr);
                }
            }
            TimerJob::Retransmit(job) => self.execute_retransmit(job),
        }
    }

    fn execute_retransmit(&self, job: RetransmitJob) {
        if !job.state.is_pending() {
            // Acknowledged, rejected, or otherwise settled; the entry stays
            // cached for deduplication until the purger reaps it.
            return;
        }

        if job.attempt < MAX_RETRANSMIT {
            debug!(
                "Retransmit MID:{:04X} to {} (attempt {})",
                job.key.msg_id,
                job.key.addr,
                job.attempt + 1
            );
            self.send_frame(&job.frame, job.key.addr);

            let timeout = job.timeout * 2;
            self.scheduler.schedule_after(
                timeout,
                TimerJob::Retransmit(RetransmitJob {
                    timeout,
                    attempt: job.attempt + 1,
                    ..job
                }),
            );
            return;
        }

        warn!(
            "Giving up on MID:{:04X} to {} after {} transmissions",
            job.key.msg_id,
            job.key.addr,
            job.attempt + 1
        );
        job.state.settle(TransmitStatus::TimedOut);
        self.messages.forget_sent(job.key);

        if let Some((path, id)) = job.observer {
            if self.observe.deregister(&path, &id) {
                debug!("Dropping unresponsive observer of {}", path);
                if let Some(resource) = self.registry.lookup(&path) {
                    self.registry.unsubscribe(&resource, &id);
                }
            }
        }
    }

    fn notify(&self, resource: &Resource) {
        let path = resource.path();
        let slots = self.observe.advance(path, || self.messages.next_msg_id());

        for slot in slots {
            let representation = panic::catch_unwind(AssertUnwindSafe(|| {
                self.registry.get(resource, &slot.request)
            }));

            let mut notification = match representation {
                Ok(Ok((payload, content_format))) => {
                    let mut msg = Message::new(MsgType::Non, MsgCode::CONTENT);
                    msg.insert_option_uint(OptionNumber::CONTENT_FORMAT, content_format.0 as u32);
                    msg.set_payload(payload);
                    msg
                }
                Ok(Err(code)) => Message::new(MsgType::Non, code),
                Err(_) => {
                    error!("Handler panicked while notifying {}", path);
                    Message::new(MsgType::Non, MsgCode::INTERNAL_SERVER_ERROR)
                }
            };

            notification.insert_option_uint(OptionNumber::OBSERVE, slot.seq);
            notification.set_token(slot.id.token);
            notification.set_msg_id(slot.msg_id);

            let confirmable = slot.seq % self.config.notify_con_interval == 0;
            if confirmable {
                notification.set_msg_type(MsgType::Con);
                self.send_reliable(notification, slot.id.addr, Some((path.to_string(), slot.id)));
            } else {
                let frame = Arc::new(codec::encode(&notification));
                let state = TransmitState::new();
                state.settle(TransmitStatus::Responded);
                self.messages
                    .record_sent(ExchangeKey::new(slot.id.addr, slot.msg_id), frame.clone(), state);
                self.send_frame(&frame, slot.id.addr);
            }
        }
    }

    fn notify_deletion(&self, resource: &Resource) {
        for (id, _registration) in self.observe.remove_path(resource.path()) {
            self.registry.unsubscribe(resource, &id);

            let mut notice = Message::new(MsgType::Non, MsgCode::NOT_FOUND);
            notice.set_token(id.token);
            notice.set_msg_id(self.messages.next_msg_id());
            self.send_frame(&codec::encode(&notice), id.addr);
        }
    }
}
