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

//! The datagram transport seam and the UDP socket construction used by the
//! default backend.

use super::config::ServerConfig;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// The datagram transport the server runs over.
///
/// The production implementation is [`std::net::UdpSocket`] in blocking mode
/// with a read timeout; tests substitute an in-memory capture.
pub trait DatagramSocket: Send + Sync + 'static {
    /// Sends a single datagram to the given address.
    fn send_to(&self, buffer: &[u8], addr: SocketAddr) -> io::Result<usize>;

    /// Receives a single datagram, blocking up to the configured receive
    /// timeout.
    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// The local address this socket is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buffer: &[u8], addr: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buffer, addr)
    }

    fn recv_from(&self, buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buffer)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Binds a UDP socket for serving: `SO_REUSEADDR`, optional
/// multicast-friendly options and group membership, and the configured
/// receive timeout.
pub(crate) fn bind_udp(addr: SocketAddr, config: &ServerConfig) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_reuse_address(true)?;

    if config.multicast {
        socket.set_multicast_ttl_v4(20)?;
        socket.set_multicast_loop_v4(true)?;
    }

    socket.bind(&addr.into())?;

    let socket: UdpSocket = socket.into();

    if config.multicast {
        match addr.ip() {
            IpAddr::V4(group) if group.is_multicast() => {
                socket.join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)?;
            }
            IpAddr::V6(group) if group.is_multicast() => {
                socket.join_multicast_v6(&group, 0)?;
            }
            _ => {}
        }
    }

    socket.set_read_timeout(Some(config.receive_timeout))?;

    Ok(socket)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// A socket double that captures every outbound frame and never
    /// produces inbound traffic. Tests drive the server through its
    /// per-datagram entry point instead.
    #[derive(Debug, Default)]
    pub(crate) struct CaptureSocket {
        sent: Mutex<Vec<(Vec<u8>, SocketAddr)>>,
    }

    impl CaptureSocket {
        pub fn new() -> CaptureSocket {
            CaptureSocket::default()
        }

        /// Removes and returns every frame sent so far.
        pub fn take_sent(&self) -> Vec<(Vec<u8>, SocketAddr)> {
            std::mem::replace(&mut *self.sent.lock().expect("Lock failed"), Vec::new())
        }

        /// The number of frames sent so far.
        pub fn sent_count(&self) -> usize {
            self.sent.lock().expect("Lock failed").len()
        }
    }

    impl DatagramSocket for CaptureSocket {
        fn send_to(&self, buffer: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.sent
                .lock()
                .expect("Lock failed")
                .push((buffer.to_vec(), addr));
            Ok(buffer.len())
        }

        fn recv_from(&self, _buffer: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            Err(io::Error::new(io::ErrorKind::WouldBlock, "no traffic"))
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:5683".parse().unwrap())
        }
    }
}
