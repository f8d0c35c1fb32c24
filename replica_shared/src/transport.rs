//! Transport abstraction.
//!
//! The replication layer only decides what to send and on which channel;
//! delivery, retransmission and connection lifecycle belong to a
//! [`Transport`]. [`LoopbackTransport`] is an in-process implementation backed
//! by tokio channels, one receiver per connected peer.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Identifies a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PeerId(pub u32);

/// One delivered message and the channel it came in on.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub reliable: bool,
    pub bytes: Bytes,
}

/// Byte-oriented send side of a transport. Sends never block.
pub trait Transport: Send + Sync {
    /// Currently connected peers.
    fn peers(&self) -> Vec<PeerId>;

    /// Sends to one peer on the reliable or unreliable channel.
    fn send(&self, peer: PeerId, reliable: bool, bytes: Bytes) -> anyhow::Result<()>;

    /// Sends to every peer; a failing peer is logged and skipped.
    /// Returns how many peers accepted the message.
    fn broadcast(&self, reliable: bool, bytes: Bytes) -> usize {
        let mut sent = 0;
        for peer in self.peers() {
            match self.send(peer, reliable, bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => warn!(peer = ?peer, reliable, error = %e, "send failed"),
            }
        }
        sent
    }
}

impl<T: Transport + ?Sized> Transport for Arc<T> {
    fn peers(&self) -> Vec<PeerId> {
        (**self).peers()
    }

    fn send(&self, peer: PeerId, reliable: bool, bytes: Bytes) -> anyhow::Result<()> {
        (**self).send(peer, reliable, bytes)
    }
}

#[derive(Default)]
struct LoopbackInner {
    next_peer: u32,
    peers: BTreeMap<PeerId, mpsc::UnboundedSender<Datagram>>,
}

/// In-process transport. Clones share the same peer set.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Mutex<LoopbackInner>>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a new peer and returns its receiving end.
    pub fn connect(&self) -> LoopbackPeer {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.lock();
        let id = PeerId(inner.next_peer);
        inner.next_peer += 1;
        inner.peers.insert(id, tx);
        debug!(peer = ?id, "loopback peer connected");
        LoopbackPeer { id, rx }
    }

    pub fn disconnect(&self, peer: PeerId) {
        self.lock().peers.remove(&peer);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Transport for LoopbackTransport {
    fn peers(&self) -> Vec<PeerId> {
        self.lock().peers.keys().copied().collect()
    }

    fn send(&self, peer: PeerId, reliable: bool, bytes: Bytes) -> anyhow::Result<()> {
        let inner = self.lock();
        let tx = inner
            .peers
            .get(&peer)
            .with_context(|| format!("unknown peer {peer:?}"))?;
        tx.send(Datagram { reliable, bytes })
            .ok()
            .with_context(|| format!("peer {peer:?} receiver closed"))
    }
}

/// Receiving end of one loopback peer.
pub struct LoopbackPeer {
    pub id: PeerId,
    rx: mpsc::UnboundedReceiver<Datagram>,
}

impl LoopbackPeer {
    /// Takes everything delivered so far, in delivery order.
    pub fn drain(&mut self) -> Vec<Datagram> {
        let mut out = Vec::new();
        while let Ok(d) = self.rx.try_recv() {
            out.push(d);
        }
        out
    }

    /// Waits for the next datagram; `None` once the transport side is gone.
    pub async fn recv(&mut self) -> Option<Datagram> {
        self.rx.recv().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_reaches_every_peer() {
        let transport = LoopbackTransport::new();
        let mut a = transport.connect();
        let mut b = transport.connect();
        assert_ne!(a.id, b.id);

        let sent = transport.broadcast(false, Bytes::from_static(b"x"));
        assert_eq!(sent, 2);
        assert_eq!(a.drain().len(), 1);
        let got = b.drain();
        assert_eq!(
            got,
            vec![Datagram {
                reliable: false,
                bytes: Bytes::from_static(b"x")
            }]
        );
    }

    #[test]
    fn closed_peer_does_not_stop_broadcast() {
        let transport = LoopbackTransport::new();
        let gone = transport.connect();
        let mut alive = transport.connect();
        drop(gone);

        let sent = transport.broadcast(true, Bytes::from_static(b"y"));
        assert_eq!(sent, 1);
        assert_eq!(alive.drain().len(), 1);
    }

    #[test]
    fn send_to_unknown_peer_fails() {
        let transport = LoopbackTransport::new();
        let peer = transport.connect();
        transport.disconnect(peer.id);
        assert!(transport.send(peer.id, true, Bytes::new()).is_err());
        assert!(transport.peers().is_empty());
    }

    #[tokio::test]
    async fn recv_waits_for_delivery() {
        let transport = LoopbackTransport::new();
        let mut peer = transport.connect();
        let id = peer.id;
        let sender = transport.clone();
        tokio::spawn(async move {
            sender.send(id, true, Bytes::from_static(b"z")).unwrap();
        });
        let d = peer.recv().await.unwrap();
        assert!(d.reliable);
    }
}
