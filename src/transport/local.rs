//! In-memory transport for local testing and single-process simulations.
//!
//! Routes messages directly between connected endpoints through channels,
//! without network I/O. Each endpoint keeps its own peer registry; a single
//! [`LocalTransport::connect`] call wires both directions.

use crate::transport::{NodeAddr, Transport, TransportError};
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

/// In-memory transport endpoint.
pub struct LocalTransport {
    addr: NodeAddr,
    peers: Arc<DashMap<NodeAddr, Sender<Bytes>>>,
    tx: Sender<Bytes>,
    rx: Receiver<Bytes>,
}

impl LocalTransport {
    /// Creates a new endpoint answering on `addr`.
    pub fn new(addr: NodeAddr) -> Self {
        let (tx, rx) = channel();
        Self {
            addr,
            peers: Arc::new(DashMap::new()),
            tx,
            rx,
        }
    }

    /// Establishes a bidirectional connection to another endpoint.
    pub fn connect(&self, other: &LocalTransport) {
        self.peers.insert(other.addr, other.tx.clone());
        other.peers.insert(self.addr, self.tx.clone());
    }
}

impl Transport for LocalTransport {
    fn send(&mut self, dst: NodeAddr, payload: Bytes) -> Result<usize, TransportError> {
        let len = payload.len();
        let peer = self
            .peers
            .get(&dst)
            .ok_or(TransportError::PeerNotFound(dst))?;
        peer.send(payload)
            .map_err(|_| TransportError::SendFailed(dst))?;
        Ok(len)
    }

    fn poll(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    fn local_addr(&self) -> NodeAddr {
        self.addr
    }
}
