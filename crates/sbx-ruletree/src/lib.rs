//! # sbx-ruletree
//!
//! The rule tree: a self-describing binary arena shared by every process of
//! a sandbox session through a memory mapping of `<session_dir>/RuleTree.bin`.
//!
//! ## Layout
//!
//! A file header at offset 0 is followed by a stream of typed objects, each
//! prefixed by an object header (magic + type tag). Objects reference each
//! other only through byte offsets from the start of the file; every offset
//! is validated (bounds, magic, type) before it is trusted.
//!
//! ## Concurrency
//!
//! Readers never lock. New objects are appended through the backing file
//! descriptor by a single writer at a time (the rule compiler for rules, the
//! permission store owner for simulated inode records). The only bytes ever
//! rewritten in place are the mutable slots of catalog entries, object lists,
//! simulated inode records and the header counters, all accessed atomically.

pub mod arena;
pub mod catalog;
pub mod fsrule;
pub mod inodestat;
pub mod layout;
pub mod objectlist;

pub use arena::{AttachOutcome, ObjectRef, RuleTree};
pub use catalog::CatalogItem;
pub use fsrule::{Action, Condition, FsRule, Selector};
pub use inodestat::InodeSimu;
pub use layout::{ObjectOffset, ObjectType, RULETREE_VERSION};

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RuleTreeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("rule tree {0} is empty and creation was not requested")]
    Empty(PathBuf),

    #[error("faulty rule tree header in {0}")]
    BadHeader(PathBuf),

    #[error("ruletree version mismatch: got {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("rule tree attachment does not allow writes")]
    ReadOnly,

    #[error("rule tree is full: {needed} bytes needed, {available} available")]
    Full { needed: u64, available: u64 },

    #[error("no {expected:?} object at offset {offset}")]
    NotFound { offset: ObjectOffset, expected: ObjectType },

    #[error("index {index} out of range for object list of size {size}")]
    IndexOutOfRange { index: u32, size: u32 },
}

pub type Result<T> = std::result::Result<T, RuleTreeError>;

impl RuleTreeError {
    /// True for errors that must end the whole sandbox session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, RuleTreeError::VersionMismatch { .. })
    }
}
