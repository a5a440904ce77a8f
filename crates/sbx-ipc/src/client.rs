//! Blocking client for interposed processes.

use crate::{encode_frame, IpcError, IpcHeader, Result, VpermRequest, VpermResponse};
use sbx_config::{log_ipc_debug, log_ipc_warn};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;

/// How long a call may wait for the store before giving up.
pub const CALL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct VpermClient {
    stream: UnixStream,
    seq: u16,
}

impl VpermClient {
    pub fn connect(socket_path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)?;
        stream.set_read_timeout(Some(CALL_TIMEOUT))?;
        stream.set_write_timeout(Some(CALL_TIMEOUT))?;
        log_ipc_debug!(socket = %socket_path.display(), "connected to permission store");
        Ok(Self { stream, seq: 0 })
    }

    /// Send one request and wait for its response.
    pub fn call(&mut self, request: &VpermRequest) -> Result<VpermResponse> {
        self.seq = self.seq.wrapping_add(1);
        let frame = encode_frame(request, IpcHeader::KIND_REQUEST, self.seq)?;
        self.stream.write_all(&frame)?;

        let mut head = [0u8; IpcHeader::SIZE];
        self.stream.read_exact(&mut head)?;
        let head = IpcHeader::from_bytes(&head);
        if !head.is_valid() || head.kind != IpcHeader::KIND_RESPONSE {
            return Err(IpcError::BadHeader);
        }
        if head.seq_id != self.seq {
            return Err(IpcError::SeqMismatch {
                expected: self.seq,
                got: head.seq_id,
            });
        }

        let mut payload = vec![0u8; head.length as usize];
        self.stream.read_exact(&mut payload)?;
        let response = bincode::deserialize(&payload)?;
        log_ipc_debug!(request = request.name(), ?response, "vperm call");
        Ok(response)
    }

    /// Send a mutation and map anything but `Ack` to an error.
    pub fn apply(&mut self, request: &VpermRequest) -> Result<()> {
        match self.call(request)? {
            VpermResponse::Ack => Ok(()),
            VpermResponse::Error(e) => Err(IpcError::Remote(e)),
            other => Err(IpcError::Unexpected(other)),
        }
    }

    /// Returns the server version.
    pub fn handshake(&mut self) -> Result<String> {
        let request = VpermRequest::Handshake {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: crate::VPERM_PROTOCOL_VERSION,
        };
        match self.call(&request)? {
            VpermResponse::HandshakeAck {
                server_version,
                protocol,
            } => {
                if protocol != crate::VPERM_PROTOCOL_VERSION {
                    log_ipc_warn!(
                        server = protocol,
                        client = crate::VPERM_PROTOCOL_VERSION,
                        "permission store protocol differs"
                    );
                }
                Ok(server_version)
            }
            VpermResponse::Error(e) => Err(IpcError::Remote(e)),
            other => Err(IpcError::Unexpected(other)),
        }
    }

    /// Returns the status line and the number of active inode records.
    pub fn status(&mut self) -> Result<(String, u64)> {
        match self.call(&VpermRequest::Status)? {
            VpermResponse::StatusAck {
                status,
                active_inodestats,
            } => Ok((status, active_inodestats)),
            VpermResponse::Error(e) => Err(IpcError::Remote(e)),
            other => Err(IpcError::Unexpected(other)),
        }
    }
}
