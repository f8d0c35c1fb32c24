//! Network host.
//!
//! Binds TCP and UDP on the same address, performs the handshake with each
//! connecting peer and plugs it into a [`NetTransport`] that the scheduler
//! sends through:
//! - reliable: frames are queued to a per-peer writer task owning the TCP
//!   write half.
//! - unreliable: `try_send_to` on the shared UDP socket; a full socket buffer
//!   loses the datagram, which the protocol tolerates.
//!
//! A peer is detached when either its TCP half closes or a write fails.

use std::{
    collections::BTreeMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::{bail, Context};
use bytes::Bytes;
use replica_shared::{
    clock::Clock,
    codec::FieldCodec,
    config::ReplicationConfig,
    net::{
        ControlMsg, FrameSource, ReliableListener, ReliableReader, ReliableWriter,
        PROTOCOL_VERSION,
    },
    transport::{PeerId, Transport},
};
use tokio::{net::UdpSocket, sync::mpsc};
use tracing::{debug, info, warn};

use crate::scheduler::HostScheduler;

/// Scheduler type driven by the network host.
pub type NetScheduler = HostScheduler<NetTransport, FieldCodec>;

struct PeerLink {
    reliable: mpsc::UnboundedSender<Bytes>,
    udp_addr: SocketAddr,
}

struct NetInner {
    udp: UdpSocket,
    peers: Mutex<BTreeMap<PeerId, PeerLink>>,
}

/// Socket-backed [`Transport`]. Clones share the same peers.
#[derive(Clone)]
pub struct NetTransport {
    inner: Arc<NetInner>,
}

impl NetTransport {
    fn new(udp: UdpSocket) -> Self {
        Self {
            inner: Arc::new(NetInner {
                udp,
                peers: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    fn peers_lock(&self) -> MutexGuard<'_, BTreeMap<PeerId, PeerLink>> {
        self.inner
            .peers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn attach(&self, peer: PeerId, link: PeerLink) {
        self.peers_lock().insert(peer, link);
    }

    /// Forgets `peer`; its writer task winds down once the queue drains.
    pub fn detach(&self, peer: PeerId) -> bool {
        let removed = self.peers_lock().remove(&peer).is_some();
        if removed {
            info!(peer = ?peer, "peer detached");
        }
        removed
    }
}

impl Transport for NetTransport {
    fn peers(&self) -> Vec<PeerId> {
        self.peers_lock().keys().copied().collect()
    }

    fn send(&self, peer: PeerId, reliable: bool, bytes: Bytes) -> anyhow::Result<()> {
        let peers = self.peers_lock();
        let link = peers
            .get(&peer)
            .with_context(|| format!("unknown peer {peer:?}"))?;
        if reliable {
            link.reliable
                .send(bytes)
                .ok()
                .context("reliable writer closed")
        } else {
            self.inner
                .udp
                .try_send_to(&bytes, link.udp_addr)
                .context("udp send")?;
            Ok(())
        }
    }
}

/// Accepts peers and wires them to a [`NetScheduler`].
pub struct HostServer {
    listener: ReliableListener,
    transport: NetTransport,
    scheduler: Arc<NetScheduler>,
    next_peer: AtomicU32,
}

impl HostServer {
    /// Binds TCP on `cfg.server_addr`, then UDP on the resulting address, so
    /// port 0 picks one ephemeral port for both.
    pub async fn bind(cfg: &ReplicationConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        let addr: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        let listener = ReliableListener::bind(addr).await?;
        let local = listener.local_addr()?;
        let udp = UdpSocket::bind(local).await.context("udp bind")?;

        let transport = NetTransport::new(udp);
        let scheduler = Arc::new(HostScheduler::new(
            transport.clone(),
            FieldCodec,
            cfg,
            clock,
        ));
        Ok(Self {
            listener,
            transport,
            scheduler,
            next_peer: AtomicU32::new(1),
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn scheduler(&self) -> &Arc<NetScheduler> {
        &self.scheduler
    }

    pub fn peer_count(&self) -> usize {
        self.transport.peers().len()
    }

    /// Accepts one connection, runs the handshake and sends the peer its
    /// initial snapshot.
    pub async fn accept_one(&self) -> anyhow::Result<PeerId> {
        let (mut conn, remote) = self.listener.accept().await?;

        match conn.recv_control().await? {
            ControlMsg::Hello { protocol } if protocol == PROTOCOL_VERSION => {}
            other => bail!("unexpected handshake msg: {other:?}"),
        }
        let udp_port = match conn.recv_control().await? {
            ControlMsg::UdpHello { udp_port } => udp_port,
            other => bail!("expected UdpHello, got {other:?}"),
        };

        let peer = PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed));
        conn.send_control(&ControlMsg::Welcome { peer_id: peer })
            .await?;

        let udp_addr = SocketAddr::new(remote.ip(), udp_port);
        let (reader, writer) = conn.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        self.transport.attach(
            peer,
            PeerLink {
                reliable: tx,
                udp_addr,
            },
        );
        tokio::spawn(write_loop(peer, writer, rx, self.transport.clone()));
        tokio::spawn(watch_loop(peer, reader, self.transport.clone()));

        self.scheduler.on_peer_connected(peer);
        info!(peer = ?peer, %remote, %udp_addr, "peer connected");
        Ok(peer)
    }

    /// Accepts peers until the listener fails permanently.
    pub async fn run_accept_loop(self: Arc<Self>) {
        loop {
            if let Err(e) = self.accept_one().await {
                warn!(error = %e, "handshake failed");
            }
        }
    }
}

async fn write_loop(
    peer: PeerId,
    mut writer: ReliableWriter,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    transport: NetTransport,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = writer.send_frame(&frame).await {
            warn!(peer = ?peer, error = %e, "reliable write failed");
            break;
        }
    }
    transport.detach(peer);
}

async fn watch_loop(peer: PeerId, mut reader: ReliableReader, transport: NetTransport) {
    loop {
        match reader.next_frame().await {
            Ok(Some(frame)) => match ControlMsg::decode(&frame) {
                Ok(ControlMsg::Disconnect { reason }) => {
                    info!(peer = ?peer, %reason, "peer disconnecting");
                    break;
                }
                other => debug!(peer = ?peer, ?other, "ignoring inbound frame"),
            },
            Ok(None) => break,
            Err(e) => {
                debug!(peer = ?peer, error = %e, "reliable read failed");
                break;
            }
        }
    }
    transport.detach(peer);
}
