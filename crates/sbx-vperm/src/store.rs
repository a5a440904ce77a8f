//! Access to the simulated inode attribute store.
//!
//! Reads go straight to the shared rule tree mapping. Mutations are
//! requests: the permission store owner applies them, so they travel over
//! RPC in sandboxed processes and are applied in place by the owner itself.
//! Either way they are fire-and-forget; failures are logged, never retried
//! and never reported to the gate's caller.

use sbx_config::{log_vperm_debug, log_vperm_warn, SessionConfig};
use sbx_ipc::{VpermClient, VpermRequest};
use sbx_ruletree::{InodeSimu, RuleTree};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

pub trait VpermStore {
    /// Records with active overrides, across the whole session.
    fn num_active_inodestats(&self) -> u64;

    fn find_inodestat(&self, dev: u64, ino: u64) -> Option<InodeSimu>;

    fn submit(&self, request: VpermRequest);
}

/// Apply one mutation to a writable rule tree.
///
/// Returns `Ok(false)` for requests that are not mutations.
pub fn apply_request(tree: &RuleTree, request: &VpermRequest) -> sbx_ruletree::Result<bool> {
    match *request {
        VpermRequest::SetIds {
            dev,
            ino,
            set_uid,
            uid,
            set_gid,
            gid,
        } => tree.set_ids(dev, ino, set_uid, uid, set_gid, gid)?,
        VpermRequest::ReleaseIds {
            dev,
            ino,
            release_uid,
            release_gid,
        } => tree.release_ids(dev, ino, release_uid, release_gid)?,
        VpermRequest::SetMode {
            dev,
            ino,
            real_mode,
            virt_mode,
            suid_sgid,
        } => tree.set_mode(dev, ino, real_mode, virt_mode, suid_sgid)?,
        VpermRequest::ReleaseMode { dev, ino } => tree.release_mode(dev, ino)?,
        VpermRequest::SetDevNode {
            dev,
            ino,
            mode,
            rdev,
        } => tree.set_dev_node(dev, ino, mode, rdev)?,
        VpermRequest::Clear { dev, ino } => tree.clear_inodestat(dev, ino)?,
        VpermRequest::Handshake { .. } | VpermRequest::Status => return Ok(false),
    }
    Ok(true)
}

/// Store backed by a rule tree this process may write.
pub struct LocalStore {
    tree: Arc<RuleTree>,
}

impl LocalStore {
    pub fn new(tree: Arc<RuleTree>) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &Arc<RuleTree> {
        &self.tree
    }
}

impl VpermStore for LocalStore {
    fn num_active_inodestats(&self) -> u64 {
        self.tree.num_active_inodestats()
    }

    fn find_inodestat(&self, dev: u64, ino: u64) -> Option<InodeSimu> {
        self.tree.find_inodestat(dev, ino)
    }

    fn submit(&self, request: VpermRequest) {
        if let Err(e) = apply_request(&self.tree, &request) {
            log_vperm_warn!(request = request.name(), error = %e, "vperm update failed");
        }
    }
}

/// Store of a sandboxed process: reads the shared mapping, sends mutations
/// to the permission store owner.
pub struct RpcStore {
    tree: Arc<RuleTree>,
    socket: PathBuf,
    client: Mutex<Option<VpermClient>>,
}

impl RpcStore {
    /// The connection is opened on the first mutation.
    pub fn new(tree: Arc<RuleTree>, socket: impl Into<PathBuf>) -> Self {
        Self {
            tree,
            socket: socket.into(),
            client: Mutex::new(None),
        }
    }

    pub fn from_config(config: &SessionConfig, tree: Arc<RuleTree>) -> Self {
        Self::new(tree, config.vperm_socket())
    }
}

impl VpermStore for RpcStore {
    fn num_active_inodestats(&self) -> u64 {
        self.tree.num_active_inodestats()
    }

    fn find_inodestat(&self, dev: u64, ino: u64) -> Option<InodeSimu> {
        self.tree.find_inodestat(dev, ino)
    }

    fn submit(&self, request: VpermRequest) {
        // The lock only guards the idle connection, never a round-trip.
        let idle = self.client.lock().ok().and_then(|mut guard| guard.take());
        let mut client = match idle {
            Some(client) => client,
            None => match VpermClient::connect(&self.socket) {
                Ok(client) => client,
                Err(e) => {
                    log_vperm_warn!(
                        socket = %self.socket.display(),
                        request = request.name(),
                        error = %e,
                        "permission store unreachable"
                    );
                    return;
                }
            },
        };
        match client.apply(&request) {
            Ok(()) => {
                log_vperm_debug!(request = request.name(), "vperm update sent");
                if let Ok(mut guard) = self.client.lock() {
                    if guard.is_none() {
                        *guard = Some(client);
                    }
                }
            }
            // The stream may be out of sync; it is dropped here.
            Err(e) => log_vperm_warn!(request = request.name(), error = %e, "vperm update failed"),
        }
    }
}
