//! # sbx-vperm
//!
//! Virtual permissions for unprivileged sandboxes.
//!
//! A sandboxed build may chown files to root, set SUID bits or create
//! device nodes. None of that is possible for real, so the gates in this
//! crate try the real call and, when it fails with `EPERM`, record the
//! requested attributes per (device, inode) in the session's rule tree.
//! Stat results are then overlaid with the recorded values.
//!
//! - `real`: the unfiltered calls (`RealFs`, `HostFs`)
//! - `store`: reading and updating simulated inode records
//! - `gates`: the per-call decision logic

pub mod gates;
pub mod real;
pub mod store;

pub use gates::{fopen_flags, virtualize_stat, VirtualOwner, VpermGates};
pub use real::{Dir, FileStat, HostFs, RealFs};
pub use store::{apply_request, LocalStore, RpcStore, VpermStore};

use sbx_config::SessionConfig;
use sbx_ruletree::RuleTree;
use std::sync::Arc;

/// Gates of a sandboxed process: host calls, records read from `tree`,
/// mutations sent to the session's permission store.
pub fn host_gates(config: &SessionConfig, tree: Arc<RuleTree>) -> VpermGates<HostFs, RpcStore> {
    VpermGates::new(
        HostFs,
        RpcStore::from_config(config, tree),
        VirtualOwner::from_config(config),
    )
}
