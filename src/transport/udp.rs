//! Datagram transport over UDP.
//!
//! Stands in for a production fabric backend: one serialized image per
//! datagram, non-blocking receive. Images larger than the configured
//! message budget cannot be shipped through this transport.

use crate::error;
use crate::transport::{NodeAddr, Transport, TransportError};
use bytes::Bytes;
use std::io::ErrorKind;
use std::net::{SocketAddrV4, UdpSocket};

/// Configuration for a [`UdpTransport`].
#[derive(Clone, Debug)]
pub struct UdpConfig {
    /// Local address to bind.
    pub listen: SocketAddrV4,
    /// Largest receivable message in bytes.
    pub max_msg_size: usize,
}

impl UdpConfig {
    pub fn new(listen: SocketAddrV4) -> Self {
        Self {
            listen,
            max_msg_size: 64 * 1024,
        }
    }
}

/// UDP transport endpoint.
pub struct UdpTransport {
    socket: UdpSocket,
    addr: NodeAddr,
    recv_buf: Vec<u8>,
}

impl UdpTransport {
    /// Binds the local socket and switches it to non-blocking receives.
    pub fn new(cfg: UdpConfig) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(cfg.listen)?;
        socket.set_nonblocking(true)?;
        let addr = match socket.local_addr()? {
            std::net::SocketAddr::V4(v4) => NodeAddr::from_socket_addr(v4),
            std::net::SocketAddr::V6(_) => NodeAddr::from_socket_addr(cfg.listen),
        };
        Ok(Self {
            socket,
            addr,
            recv_buf: vec![0; cfg.max_msg_size],
        })
    }
}

impl Transport for UdpTransport {
    fn send(&mut self, dst: NodeAddr, payload: Bytes) -> Result<usize, TransportError> {
        Ok(self.socket.send_to(&payload, dst.to_socket_addr())?)
    }

    fn poll(&mut self) -> Option<Bytes> {
        match self.socket.recv_from(&mut self.recv_buf) {
            Ok((len, _)) => Some(Bytes::copy_from_slice(&self.recv_buf[..len])),
            Err(e) if e.kind() == ErrorKind::WouldBlock => None,
            Err(e) => {
                error!("udp receive failed: {}", e);
                None
            }
        }
    }

    fn local_addr(&self) -> NodeAddr {
        self.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bind_any() -> UdpTransport {
        let cfg = UdpConfig::new("127.0.0.1:0".parse().unwrap());
        UdpTransport::new(cfg).unwrap()
    }

    #[test]
    fn datagram_round_trip() {
        let mut a = bind_any();
        let mut b = bind_any();

        let sent = a
            .send(b.local_addr(), Bytes::from_static(b"image-bytes"))
            .unwrap();
        assert_eq!(sent, 11);

        // non-blocking receive may need a moment for loopback delivery
        let mut received = None;
        for _ in 0..100 {
            if let Some(msg) = b.poll() {
                received = Some(msg);
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert_eq!(received.unwrap().as_ref(), b"image-bytes");
    }

    #[test]
    fn poll_without_traffic_returns_none() {
        let mut a = bind_any();
        assert!(a.poll().is_none());
    }
}
