//! Packet header and the closed set of message types.
//!
//! Every message starts with a 24-byte header of three little-endian `u64`
//! values: `id`, `size` and `type`. Stream messages are followed by frames of
//! `u64 sequence`, `u64 length` and `length` bytes until `size` bytes have
//! been delivered; other messages carry `size` payload bytes directly.

use serde::de::DeserializeOwned;

use crate::domain::errors::{DomainError, DomainResult};

/// Encoded header length.
pub const HEADER_LEN: usize = 24;

/// Upper bound on a single payload.
pub const MAX_PAYLOAD: u64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    RegisterConcrete,
    RegisterSymbolic,
    RegisterAck,
    StatusRequest,
    Status,
    Commence,
    Ack,
    Failure,
    ImageInfoRequest,
    ImageInfo,
    ImageUpdate,
    ImageData,
    GuestDataRequest,
    GuestData,
    ExecuteTest,
    StoreTrace,
    TraceData,
    Translate,
    Solve,
    CollectTests,
    TestBatch,
    Clean,
    Reset,
    Shutdown,
}

impl PacketType {
    pub const ALL: [Self; 24] = [
        Self::RegisterConcrete,
        Self::RegisterSymbolic,
        Self::RegisterAck,
        Self::StatusRequest,
        Self::Status,
        Self::Commence,
        Self::Ack,
        Self::Failure,
        Self::ImageInfoRequest,
        Self::ImageInfo,
        Self::ImageUpdate,
        Self::ImageData,
        Self::GuestDataRequest,
        Self::GuestData,
        Self::ExecuteTest,
        Self::StoreTrace,
        Self::TraceData,
        Self::Translate,
        Self::Solve,
        Self::CollectTests,
        Self::TestBatch,
        Self::Clean,
        Self::Reset,
        Self::Shutdown,
    ];

    pub const fn code(self) -> u64 {
        match self {
            Self::RegisterConcrete => 1,
            Self::RegisterSymbolic => 2,
            Self::RegisterAck => 3,
            Self::StatusRequest => 4,
            Self::Status => 5,
            Self::Commence => 6,
            Self::Ack => 7,
            Self::Failure => 8,
            Self::ImageInfoRequest => 9,
            Self::ImageInfo => 10,
            Self::ImageUpdate => 11,
            Self::ImageData => 12,
            Self::GuestDataRequest => 13,
            Self::GuestData => 14,
            Self::ExecuteTest => 15,
            Self::StoreTrace => 16,
            Self::TraceData => 17,
            Self::Translate => 18,
            Self::Solve => 19,
            Self::CollectTests => 20,
            Self::TestBatch => 21,
            Self::Clean => 22,
            Self::Reset => 23,
            Self::Shutdown => 24,
        }
    }

    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.code() == code)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RegisterConcrete => "register-concrete",
            Self::RegisterSymbolic => "register-symbolic",
            Self::RegisterAck => "register-ack",
            Self::StatusRequest => "status-request",
            Self::Status => "status",
            Self::Commence => "commence",
            Self::Ack => "ack",
            Self::Failure => "failure",
            Self::ImageInfoRequest => "image-info-request",
            Self::ImageInfo => "image-info",
            Self::ImageUpdate => "image-update",
            Self::ImageData => "image-data",
            Self::GuestDataRequest => "guest-data-request",
            Self::GuestData => "guest-data",
            Self::ExecuteTest => "execute-test",
            Self::StoreTrace => "store-trace",
            Self::TraceData => "trace-data",
            Self::Translate => "translate",
            Self::Solve => "solve",
            Self::CollectTests => "collect-tests",
            Self::TestBatch => "test-batch",
            Self::Clean => "clean",
            Self::Reset => "reset",
            Self::Shutdown => "shutdown",
        }
    }

    /// Whether the payload travels as sequenced frames.
    pub const fn is_stream(self) -> bool {
        matches!(self, Self::ImageData | Self::TraceData | Self::Translate)
    }
}

impl std::fmt::Display for PacketType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u64,
    pub size: u64,
    pub kind: PacketType,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..8].copy_from_slice(&self.id.to_le_bytes());
        out[8..16].copy_from_slice(&self.size.to_le_bytes());
        out[16..].copy_from_slice(&self.kind.code().to_le_bytes());
        out
    }

    pub fn decode(raw: &[u8; HEADER_LEN]) -> DomainResult<Self> {
        let word = |i: usize| {
            let mut w = [0u8; 8];
            w.copy_from_slice(&raw[i * 8..(i + 1) * 8]);
            u64::from_le_bytes(w)
        };
        let code = word(2);
        let kind = PacketType::from_code(code)
            .ok_or_else(|| DomainError::Protocol(format!("unknown packet type {code}")))?;
        let size = word(1);
        if size > MAX_PAYLOAD {
            return Err(DomainError::Protocol(format!(
                "{kind} payload of {size} bytes exceeds {MAX_PAYLOAD}"
            )));
        }
        Ok(Self {
            id: word(0),
            size,
            kind,
        })
    }
}

/// A received message with its fully reassembled payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Packet {
    pub const fn kind(&self) -> PacketType {
        self.header.kind
    }

    pub fn json<T: DeserializeOwned>(&self) -> DomainResult<T> {
        serde_json::from_slice(&self.payload).map_err(|e| {
            DomainError::Protocol(format!("malformed {} payload: {e}", self.header.kind))
        })
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}
