//! Request handling for sbx-vpermd

use sbx_config::{log_daemon_debug, log_daemon_info, log_daemon_warn};
use sbx_ipc::{VpermRequest, VpermResponse, VPERM_PROTOCOL_VERSION};
use sbx_ruletree::RuleTree;
use sbx_vperm::apply_request;
use std::sync::Arc;

/// Prefix of the per-device inode catalogs.
const DEVICE_CATALOG_PREFIX: &str = "vperm.";

/// Applies requests to the session's rule tree, one at a time.
pub struct CommandHandler {
    tree: Arc<RuleTree>,
    applied: u64,
}

impl CommandHandler {
    pub fn new(tree: Arc<RuleTree>) -> Self {
        Self { tree, applied: 0 }
    }

    /// Mutations applied since start.
    pub fn applied(&self) -> u64 {
        self.applied
    }

    pub fn handle_request(&mut self, request: VpermRequest) -> VpermResponse {
        match request {
            VpermRequest::Handshake {
                client_version,
                protocol,
            } => {
                if protocol != VPERM_PROTOCOL_VERSION {
                    log_daemon_warn!(
                        client = protocol,
                        server = VPERM_PROTOCOL_VERSION,
                        "client speaks a different protocol"
                    );
                }
                log_daemon_info!(client_version = %client_version, "Handshake");
                VpermResponse::HandshakeAck {
                    server_version: env!("CARGO_PKG_VERSION").to_string(),
                    protocol: VPERM_PROTOCOL_VERSION,
                }
            }

            VpermRequest::Status => VpermResponse::StatusAck {
                status: self.status_line(),
                active_inodestats: self.tree.num_active_inodestats(),
            },

            mutation => match apply_request(&self.tree, &mutation) {
                Ok(_) => {
                    self.applied += 1;
                    log_daemon_debug!(request = mutation.name(), inode = ?mutation.inode(), "applied");
                    VpermResponse::Ack
                }
                Err(e) => {
                    log_daemon_warn!(request = mutation.name(), error = %e, "request failed");
                    VpermResponse::Error(e.to_string())
                }
            },
        }
    }

    fn status_line(&self) -> String {
        let devices: Vec<_> = self
            .tree
            .catalog_iter(self.tree.root_catalog())
            .filter_map(|item| item.name)
            .filter(|name| name.starts_with(DEVICE_CATALOG_PREFIX))
            .collect();
        let records: usize = devices
            .iter()
            .map(|name| self.tree.catalog_entries(name).len())
            .sum();
        format!(
            "ready: {} inode records on {} devices, {} requests applied",
            records,
            devices.len(),
            self.applied
        )
    }
}
