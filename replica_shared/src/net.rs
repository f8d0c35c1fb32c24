//! Networking primitives.
//!
//! - Reliable channel: TCP with 4-byte big-endian length-prefixed frames.
//! - Unreliable channel: one UDP datagram per frame.
//! - Handshake: JSON [`ControlMsg`]s on the reliable channel. Afterwards every
//!   frame on either channel is one encoded envelope.
//!
//! [`FrameSource`] is the receive seam: the peer runs one pump per channel
//! over it.

use std::net::SocketAddr;

use anyhow::{ensure, Context};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream, UdpSocket,
    },
};

use crate::transport::PeerId;

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a reliable frame. Guards allocation against bad prefixes.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Receive buffer for one datagram.
pub const MAX_DATAGRAM_SIZE: usize = 64 * 1024;

/// Connection handshake messages.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ControlMsg {
    Hello { protocol: u32 },
    /// Peer announces where it receives unreliable traffic.
    UdpHello { udp_port: u16 },
    Welcome { peer_id: PeerId },
    Disconnect { reason: String },
}

impl ControlMsg {
    pub fn encode(&self) -> anyhow::Result<Bytes> {
        let payload = serde_json::to_vec(self).context("serialize control msg")?;
        Ok(Bytes::from(payload))
    }

    pub fn decode(b: &[u8]) -> anyhow::Result<Self> {
        serde_json::from_slice(b).context("deserialize control msg")
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, payload: &[u8]) -> anyhow::Result<()> {
    ensure!(
        payload.len() <= MAX_FRAME_SIZE as usize,
        "frame too large: {} bytes (max {MAX_FRAME_SIZE})",
        payload.len()
    );
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(payload);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

/// Reads one length-prefixed frame; `None` on a clean close between frames.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("tcp read len"),
    }
    let len = u32::from_be_bytes(len_buf);
    ensure!(len <= MAX_FRAME_SIZE, "frame too large: {len} bytes");
    let mut payload = vec![0u8; len as usize];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Some(Bytes::from(payload)))
}

/// Inbound frames from one channel.
#[async_trait]
pub trait FrameSource: Send {
    /// Whether frames from this source arrived on the reliable channel.
    fn reliable(&self) -> bool;

    /// Next frame, or `None` when the channel is closed.
    async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>>;
}

/// Reliable connection over TCP.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub async fn send_control(&mut self, msg: &ControlMsg) -> anyhow::Result<()> {
        write_frame(&mut self.stream, &msg.encode()?).await
    }

    pub async fn recv_control(&mut self) -> anyhow::Result<ControlMsg> {
        let frame = read_frame(&mut self.stream)
            .await?
            .context("connection closed during handshake")?;
        ControlMsg::decode(&frame)
    }

    /// Splits into independently owned read/write halves.
    pub fn into_split(self) -> (ReliableReader, ReliableWriter) {
        let (read, write) = self.stream.into_split();
        (ReliableReader { half: read }, ReliableWriter { half: write })
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableReader {
    half: OwnedReadHalf,
}

#[async_trait]
impl FrameSource for ReliableReader {
    fn reliable(&self) -> bool {
        true
    }

    async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct ReliableWriter {
    half: OwnedWriteHalf,
}

impl ReliableWriter {
    pub async fn send_frame(&mut self, payload: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.half, payload).await
    }
}

/// Receive side of the unreliable channel, a UDP socket connected to the host.
#[derive(Debug)]
pub struct UnreliableConn {
    socket: UdpSocket,
    buf: Vec<u8>,
}

impl UnreliableConn {
    pub async fn connect(bind_addr: SocketAddr, peer: SocketAddr) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind(bind_addr).await.context("udp bind")?;
        socket.connect(peer).await.context("udp connect")?;
        Ok(Self {
            socket,
            buf: vec![0u8; MAX_DATAGRAM_SIZE],
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

#[async_trait]
impl FrameSource for UnreliableConn {
    fn reliable(&self) -> bool {
        false
    }

    async fn next_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        let n = self.socket.recv(&mut self.buf).await.context("udp recv")?;
        Ok(Some(Bytes::copy_from_slice(&self.buf[..n])))
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
