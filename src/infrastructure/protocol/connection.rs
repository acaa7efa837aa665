//! Framed request/response channel over any ordered byte stream.

use serde::Serialize;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

use crate::domain::errors::{DomainError, DomainResult};
use crate::infrastructure::protocol::packet::{Header, Packet, PacketType, HEADER_LEN};

/// Byte stream a [`Connection`] can run over.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

pub struct Connection {
    stream: Box<dyn Transport>,
    chunk_size: usize,
    next_id: u64,
    peer: Option<SocketAddr>,
    /// A request was sent and its reply has not been matched yet. Still set
    /// when the next request starts means the previous one was abandoned.
    awaiting_reply: bool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub fn new(stream: impl Transport + 'static, chunk_size: usize) -> Self {
        Self {
            stream: Box::new(stream),
            chunk_size: chunk_size.max(1),
            next_id: 1,
            peer: None,
            awaiting_reply: false,
        }
    }

    pub fn from_tcp(stream: TcpStream, chunk_size: usize) -> Self {
        let peer = stream.peer_addr().ok();
        let mut conn = Self::new(stream, chunk_size);
        conn.peer = peer;
        conn
    }

    pub const fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Replies can no longer be matched to requests on this connection.
    pub const fn is_out_of_step(&self) -> bool {
        self.awaiting_reply
    }

    fn allocate_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    /// Send one message under a fresh id; stream types are split into frames.
    pub async fn send(&mut self, kind: PacketType, payload: &[u8]) -> DomainResult<u64> {
        let id = self.allocate_id();
        self.write_packet(id, kind, payload).await?;
        Ok(id)
    }

    /// Answer the request with header id `request`.
    pub async fn reply(&mut self, request: u64, kind: PacketType, payload: &[u8]) -> DomainResult<()> {
        self.write_packet(request, kind, payload).await
    }

    pub async fn reply_empty(&mut self, request: u64, kind: PacketType) -> DomainResult<()> {
        self.reply(request, kind, &[]).await
    }

    pub async fn reply_json<T: Serialize + ?Sized>(
        &mut self,
        request: u64,
        kind: PacketType,
        value: &T,
    ) -> DomainResult<()> {
        let payload = serde_json::to_vec(value)?;
        self.reply(request, kind, &payload).await
    }

    /// Report to the peer that `request` failed.
    pub async fn reply_failure(&mut self, request: u64, message: &str) -> DomainResult<()> {
        self.reply(request, PacketType::Failure, message.as_bytes()).await
    }

    async fn write_packet(&mut self, id: u64, kind: PacketType, payload: &[u8]) -> DomainResult<()> {
        let header = Header {
            id,
            size: payload.len() as u64,
            kind,
        };
        self.stream.write_all(&header.encode()).await?;
        if kind.is_stream() {
            for (seq, chunk) in payload.chunks(self.chunk_size).enumerate() {
                self.stream.write_all(&(seq as u64).to_le_bytes()).await?;
                self.stream.write_all(&(chunk.len() as u64).to_le_bytes()).await?;
                self.stream.write_all(chunk).await?;
            }
        } else {
            self.stream.write_all(payload).await?;
        }
        self.stream.flush().await?;
        trace!(id, kind = %kind, size = payload.len(), "packet sent");
        Ok(())
    }

    pub async fn send_empty(&mut self, kind: PacketType) -> DomainResult<u64> {
        self.send(kind, &[]).await
    }

    pub async fn send_json<T: Serialize + ?Sized>(
        &mut self,
        kind: PacketType,
        value: &T,
    ) -> DomainResult<u64> {
        let payload = serde_json::to_vec(value)?;
        self.send(kind, &payload).await
    }

    /// Receive the next message, reassembling streams.
    pub async fn recv(&mut self) -> DomainResult<Packet> {
        let mut raw = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut raw).await?;
        let header = Header::decode(&raw)?;
        let size = usize::try_from(header.size)
            .map_err(|_| DomainError::Protocol(format!("payload size {} overflows", header.size)))?;

        let payload = if header.kind.is_stream() {
            self.read_frames(header.kind, size).await?
        } else {
            let mut payload = vec![0u8; size];
            self.stream.read_exact(&mut payload).await?;
            payload
        };
        trace!(id = header.id, kind = %header.kind, size, "packet received");
        Ok(Packet { header, payload })
    }

    async fn read_frames(&mut self, kind: PacketType, total: usize) -> DomainResult<Vec<u8>> {
        let mut payload = Vec::with_capacity(total.min(1 << 24));
        let mut expected_seq = 0u64;
        while payload.len() < total {
            let seq = self.stream.read_u64_le().await?;
            let len = self.stream.read_u64_le().await?;
            if seq != expected_seq {
                return Err(DomainError::Protocol(format!(
                    "{kind} frame {seq} arrived, expected {expected_seq}"
                )));
            }
            let len = usize::try_from(len)
                .ok()
                .filter(|l| *l > 0 && payload.len() + l <= total)
                .ok_or_else(|| {
                    DomainError::Protocol(format!("{kind} frame {seq} has invalid length {len}"))
                })?;
            let start = payload.len();
            payload.resize(start + len, 0);
            self.stream.read_exact(&mut payload[start..]).await?;
            expected_seq += 1;
        }
        Ok(payload)
    }

    /// Receive a message of `kind` that is not a reply, such as the second
    /// half of a two-part request. A failure packet becomes
    /// [`DomainError::Remote`]; anything else is a protocol error.
    pub async fn expect(&mut self, kind: PacketType) -> DomainResult<Packet> {
        let packet = self.recv().await?;
        classify(packet, kind)
    }

    /// Receive the reply to `request`. A reply carrying another id is a
    /// protocol error.
    pub async fn expect_reply(&mut self, request: u64, kind: PacketType) -> DomainResult<Packet> {
        let packet = self.recv().await?;
        if packet.header.id != request {
            return Err(DomainError::Protocol(format!(
                "{} answers request {}, expected a reply to {request}",
                packet.kind(),
                packet.header.id
            )));
        }
        classify(packet, kind)
    }

    /// Open a request. Fails when an earlier request was never answered.
    pub fn begin(&mut self) -> DomainResult<()> {
        if self.awaiting_reply {
            return Err(DomainError::Protocol(
                "an abandoned request left the connection out of step".into(),
            ));
        }
        self.awaiting_reply = true;
        Ok(())
    }

    /// Close the request opened by [`Self::begin`] by matching its reply.
    /// Only a well-formed answer, success or failure, keeps the connection
    /// usable.
    pub async fn finish(&mut self, request: u64, kind: PacketType) -> DomainResult<Packet> {
        let result = self.expect_reply(request, kind).await;
        if matches!(result, Ok(_) | Err(DomainError::Remote(_))) {
            self.awaiting_reply = false;
        }
        result
    }

    /// Send a request and wait for its `reply`.
    pub async fn request(
        &mut self,
        kind: PacketType,
        payload: &[u8],
        reply: PacketType,
    ) -> DomainResult<Packet> {
        self.begin()?;
        let id = self.send(kind, payload).await?;
        self.finish(id, reply).await
    }

    /// Send a request and wait for its acknowledgement.
    pub async fn call(&mut self, kind: PacketType, payload: &[u8]) -> DomainResult<()> {
        self.request(kind, payload, PacketType::Ack).await?;
        Ok(())
    }
}

fn classify(packet: Packet, kind: PacketType) -> DomainResult<Packet> {
    match packet.kind() {
        k if k == kind => Ok(packet),
        PacketType::Failure => Err(DomainError::Remote(packet.text())),
        other => Err(DomainError::UnexpectedPacket {
            expected: kind.to_string(),
            received: other.to_string(),
        }),
    }
}
