//! Network peer.
//!
//! The peer maintains:
//! - A reliable stream (handshake, then `Create`/`Destroy` envelopes)
//! - An unreliable datagram socket (`Delta` envelopes)
//!
//! Each channel gets its own pump task feeding raw frames into the shared
//! [`PeerReconciler`]. The application keeps calling
//! [`PeerReconciler::tick`] from its own loop; the pumps never touch shadow
//! entities.

use std::{
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use anyhow::{bail, Context};
use replica_shared::{
    codec::FieldCodec,
    config::ReplicationConfig,
    net::{ControlMsg, FrameSource, ReliableConn, ReliableWriter, UnreliableConn, PROTOCOL_VERSION},
    transport::PeerId,
};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::reconciler::PeerReconciler;

/// Reconciler type fed by the network peer.
pub type NetReconciler = PeerReconciler<FieldCodec>;

/// Connection to one host.
pub struct PeerClient {
    peer_id: PeerId,
    server: SocketAddr,
    writer: ReliableWriter,
    connected: Arc<AtomicBool>,
    pumps: Vec<JoinHandle<()>>,
}

impl PeerClient {
    /// Connects to `cfg.server_addr`, performs the handshake and starts
    /// pumping both channels into `reconciler`.
    pub async fn connect(
        cfg: &ReplicationConfig,
        reconciler: Arc<NetReconciler>,
    ) -> anyhow::Result<Self> {
        let server: SocketAddr = cfg.server_addr.parse().context("parse server_addr")?;
        info!(%server, "Connecting to host");

        // The host replies to the address it saw on TCP plus this port.
        let bind_ip = match server.ip() {
            ip if ip.is_loopback() => ip,
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        let unreliable = UnreliableConn::connect(SocketAddr::new(bind_ip, 0), server).await?;
        let udp_port = unreliable.local_addr().context("udp local_addr")?.port();

        let mut reliable = ReliableConn::connect(server).await?;
        reliable
            .send_control(&ControlMsg::Hello {
                protocol: PROTOCOL_VERSION,
            })
            .await?;
        reliable
            .send_control(&ControlMsg::UdpHello { udp_port })
            .await?;

        let peer_id = match reliable.recv_control().await? {
            ControlMsg::Welcome { peer_id } => peer_id,
            other => bail!("expected Welcome, got {other:?}"),
        };
        info!(peer_id = ?peer_id, udp_port, "Connected to host");

        let (reader, writer) = reliable.into_split();
        let connected = Arc::new(AtomicBool::new(true));
        let pumps = vec![
            tokio::spawn(pump(reader, reconciler.clone(), connected.clone())),
            tokio::spawn(pump(unreliable, reconciler, connected.clone())),
        ];

        Ok(Self {
            peer_id,
            server,
            writer,
            connected,
            pumps,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// False once the host closed the reliable stream.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Tells the host we are leaving and stops both pumps.
    pub async fn shutdown(mut self, reason: &str) -> anyhow::Result<()> {
        let msg = ControlMsg::Disconnect {
            reason: reason.to_string(),
        };
        let sent = if self.is_connected() {
            self.writer.send_frame(&msg.encode()?).await
        } else {
            Ok(())
        };
        for pump in self.pumps.drain(..) {
            pump.abort();
        }
        self.connected.store(false, Ordering::Relaxed);
        info!(peer_id = ?self.peer_id, %reason, "Disconnected");
        sent
    }
}

impl Drop for PeerClient {
    fn drop(&mut self) {
        for pump in &self.pumps {
            pump.abort();
        }
    }
}

async fn pump<S: FrameSource>(
    mut source: S,
    reconciler: Arc<NetReconciler>,
    connected: Arc<AtomicBool>,
) {
    let reliable = source.reliable();
    loop {
        match source.next_frame().await {
            Ok(Some(frame)) => {
                if let Err(e) = reconciler.on_data(reliable, frame) {
                    debug!(reliable, error = %e, "dropping undecodable frame");
                }
            }
            Ok(None) => {
                info!("Host closed the reliable stream");
                break;
            }
            Err(e) if reliable => {
                warn!(error = %e, "reliable read failed");
                break;
            }
            Err(e) => debug!(error = %e, "udp receive failed"),
        }
    }
    connected.store(false, Ordering::Relaxed);
}
