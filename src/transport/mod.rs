//! Transport abstractions for moving VM images between nodes.
//!
//! The executor treats its transport as an opaque, possibly-blocking
//! collaborator: `send` ships one serialized image to a destination and
//! reports the byte count it managed, `poll` performs one non-blocking
//! receive. There is no retry policy here; migration is at-most-once with
//! no delivery guarantee.
//!
//! Destination addresses come out of guest memory as 32-byte records
//! (an access key the core ignores, then `ip`/`port`), decoded into
//! [`NodeAddr`] routing keys the transport interprets.

use bytes::Bytes;
use std::fmt::Display;
use std::net::{Ipv4Addr, SocketAddrV4};

pub mod local;
pub mod udp;

pub use local::LocalTransport;
pub use udp::{UdpConfig, UdpTransport};

/// Byte size of a destination-address record in guest memory.
pub const ADDR_RECORD_SIZE: u64 = 32;

/// Offset of the `ip` field within an address record.
pub const ADDR_RECORD_IP: u64 = 8;

/// Offset of the `port` field within an address record.
pub const ADDR_RECORD_PORT: u64 = 12;

/// Opaque routing key for a destination node.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct NodeAddr {
    pub ip: u32,
    pub port: u16,
}

impl NodeAddr {
    /// Builds a routing key from a socket address.
    pub fn from_socket_addr(addr: SocketAddrV4) -> Self {
        Self {
            ip: u32::from(*addr.ip()),
            port: addr.port(),
        }
    }

    /// The socket address this routing key names.
    pub fn to_socket_addr(self) -> SocketAddrV4 {
        SocketAddrV4::new(Ipv4Addr::from(self.ip), self.port)
    }
}

impl Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_socket_addr())
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Destination is not reachable through this transport.
    #[error("peer not found: {0}")]
    PeerNotFound(NodeAddr),

    /// The message could not be handed to the destination.
    #[error("failed to send message to {0}")]
    SendFailed(NodeAddr),

    /// Socket-level failure.
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Synchronous transport for serialized VM images.
///
/// Construction plays the role of `init`; dropping the value releases its
/// resources. A buffer returned by `poll` is owned by the caller and is
/// released by dropping it.
pub trait Transport {
    /// Sends one message to `dst`, returning the number of bytes sent.
    fn send(&mut self, dst: NodeAddr, payload: Bytes) -> Result<usize, TransportError>;

    /// One non-blocking receive; `None` when nothing is pending.
    fn poll(&mut self) -> Option<Bytes>;

    /// The address this transport answers on.
    fn local_addr(&self) -> NodeAddr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_addr_socket_round_trip() {
        let sock: SocketAddrV4 = "127.0.0.1:18515".parse().unwrap();
        let addr = NodeAddr::from_socket_addr(sock);
        assert_eq!(addr.to_socket_addr(), sock);
        assert_eq!(addr.to_string(), "127.0.0.1:18515");
    }
}
