//! # sbx-ipc
//!
//! Messages exchanged with the virtual permission store (`sbx-vpermd`), the
//! one process of a session allowed to write simulated inode records.
//!
//! Every message is an `IpcHeader` frame followed by a bincode payload.
//! Clients inside interposed processes use the blocking `VpermClient`; the
//! daemon speaks the same frames over tokio.

use serde::{Deserialize, Serialize};

pub mod client;

pub use client::VpermClient;

/// Bumped when a request or response variant changes shape.
pub const VPERM_PROTOCOL_VERSION: u32 = 1;

/// Permission store requests. All mutations are keyed by (dev, ino).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpermRequest {
    Handshake {
        client_version: String,
        protocol: u32,
    },
    Status,
    SetIds {
        dev: u64,
        ino: u64,
        set_uid: bool,
        uid: u32,
        set_gid: bool,
        gid: u32,
    },
    ReleaseIds {
        dev: u64,
        ino: u64,
        release_uid: bool,
        release_gid: bool,
    },
    SetMode {
        dev: u64,
        ino: u64,
        real_mode: u32,
        virt_mode: u32,
        suid_sgid: u32,
    },
    ReleaseMode {
        dev: u64,
        ino: u64,
    },
    SetDevNode {
        dev: u64,
        ino: u64,
        mode: u32,
        rdev: u64,
    },
    Clear {
        dev: u64,
        ino: u64,
    },
}

impl VpermRequest {
    /// Name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            VpermRequest::Handshake { .. } => "handshake",
            VpermRequest::Status => "status",
            VpermRequest::SetIds { .. } => "vperm_set_ids",
            VpermRequest::ReleaseIds { .. } => "vperm_release_ids",
            VpermRequest::SetMode { .. } => "vperm_set_mode",
            VpermRequest::ReleaseMode { .. } => "vperm_release_mode",
            VpermRequest::SetDevNode { .. } => "vperm_set_dev_node",
            VpermRequest::Clear { .. } => "vperm_clear",
        }
    }

    /// The inode a mutation applies to.
    pub fn inode(&self) -> Option<(u64, u64)> {
        match *self {
            VpermRequest::SetIds { dev, ino, .. }
            | VpermRequest::ReleaseIds { dev, ino, .. }
            | VpermRequest::SetMode { dev, ino, .. }
            | VpermRequest::ReleaseMode { dev, ino }
            | VpermRequest::SetDevNode { dev, ino, .. }
            | VpermRequest::Clear { dev, ino } => Some((dev, ino)),
            VpermRequest::Handshake { .. } | VpermRequest::Status => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VpermResponse {
    HandshakeAck { server_version: String, protocol: u32 },
    StatusAck { status: String, active_inodestats: u64 },
    Ack,
    Error(String),
}

// ---------------------------------------------------------------------------
// Frame header
// ---------------------------------------------------------------------------

/// Frame header, 8 bytes little-endian:
/// ```text
/// offset  field     size
///  0      magic     2   (0x5853 "SX")
///  2      version   1
///  3      kind      1   (1 = request, 2 = response)
///  4      length    2   (payload bytes)
///  6      seq_id    2   (response echoes the request's)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcHeader {
    pub magic: u16,
    pub version: u8,
    pub kind: u8,
    pub length: u16,
    pub seq_id: u16,
}

impl IpcHeader {
    pub const SIZE: usize = 8;
    pub const MAGIC: u16 = 0x5853;
    pub const VERSION: u8 = 1;
    pub const MAX_LENGTH: usize = u16::MAX as usize;

    pub const KIND_REQUEST: u8 = 1;
    pub const KIND_RESPONSE: u8 = 2;

    pub fn new_request(length: u16, seq_id: u16) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            kind: Self::KIND_REQUEST,
            length,
            seq_id,
        }
    }

    pub fn new_response(length: u16, seq_id: u16) -> Self {
        Self {
            kind: Self::KIND_RESPONSE,
            ..Self::new_request(length, seq_id)
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.magic.to_le_bytes());
        buf[2] = self.version;
        buf[3] = self.kind;
        buf[4..6].copy_from_slice(&self.length.to_le_bytes());
        buf[6..8].copy_from_slice(&self.seq_id.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; Self::SIZE]) -> Self {
        Self {
            magic: u16::from_le_bytes([buf[0], buf[1]]),
            version: buf[2],
            kind: buf[3],
            length: u16::from_le_bytes([buf[4], buf[5]]),
            seq_id: u16::from_le_bytes([buf[6], buf[7]]),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid frame header")]
    BadHeader,

    #[error("message too large: {0} bytes")]
    TooLarge(usize),

    #[error("response for request {got}, expected {expected}")]
    SeqMismatch { expected: u16, got: u16 },

    #[error("permission store error: {0}")]
    Remote(String),

    #[error("unexpected response: {0:?}")]
    Unexpected(VpermResponse),
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Serialize `msg` into a complete frame (header + payload).
pub fn encode_frame<T: Serialize>(msg: &T, kind: u8, seq_id: u16) -> Result<Vec<u8>> {
    let payload = bincode::serialize(msg)?;
    let length = u16::try_from(payload.len()).map_err(|_| IpcError::TooLarge(payload.len()))?;
    let header = IpcHeader {
        kind,
        ..IpcHeader::new_request(length, seq_id)
    };
    let mut frame = Vec::with_capacity(IpcHeader::SIZE + payload.len());
    frame.extend_from_slice(&header.to_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}
