//! Unix Domain Socket listener for sbx-vpermd
//!
//! Uses the IpcHeader frame protocol; requests from all clients are applied
//! one at a time through a shared `CommandHandler`.

use crate::commands::CommandHandler;
use anyhow::Result;
use sbx_config::{log_daemon_debug, log_daemon_error, log_daemon_info, log_daemon_warn};
use sbx_ipc::{encode_frame, IpcHeader, VpermRequest, VpermResponse};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

/// Bind the socket, replacing a stale one.
pub fn bind(socket_path: &Path) -> Result<UnixListener> {
    if socket_path.exists() {
        std::fs::remove_file(socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let listener = UnixListener::bind(socket_path)?;
    log_daemon_info!(socket = %socket_path.display(), "Listening for connections");
    Ok(listener)
}

/// Accept loop; runs until the task is dropped.
pub async fn serve(listener: UnixListener, handler: Arc<Mutex<CommandHandler>>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, handler).await {
                        log_daemon_warn!(error = %e, "Client handler error");
                    }
                });
            }
            Err(e) => {
                log_daemon_error!(error = %e, "Accept failed");
            }
        }
    }
}

async fn handle_client(mut stream: UnixStream, handler: Arc<Mutex<CommandHandler>>) -> Result<()> {
    log_daemon_debug!("New client connected");

    loop {
        let mut header_buf = [0u8; IpcHeader::SIZE];
        match stream.read_exact(&mut header_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                log_daemon_debug!("Client disconnected");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let header = IpcHeader::from_bytes(&header_buf);
        if !header.is_valid() || header.kind != IpcHeader::KIND_REQUEST {
            log_daemon_warn!("Invalid IPC header, dropping client");
            return Ok(());
        }

        let mut payload = vec![0u8; header.length as usize];
        stream.read_exact(&mut payload).await?;

        let response = match bincode::deserialize::<VpermRequest>(&payload) {
            Ok(request) => {
                log_daemon_debug!(?request, "Received request");
                handler.lock().await.handle_request(request)
            }
            Err(e) => {
                log_daemon_warn!(error = %e, "Failed to deserialize request");
                VpermResponse::Error(format!("Deserialize error: {}", e))
            }
        };

        send_response(&mut stream, &response, header.seq_id).await?;
    }
}

async fn send_response(stream: &mut UnixStream, response: &VpermResponse, seq_id: u16) -> Result<()> {
    let frame = encode_frame(response, IpcHeader::KIND_RESPONSE, seq_id)?;
    stream.write_all(&frame).await?;
    Ok(())
}
