//! # sbx-mapping
//!
//! Path mapping protocol between interposed functions and a rule evaluator.
//!
//! A lookup is two calls: `get_mapping_requirements` selects the rule for a
//! virtual path, `translate_path` applies it. The host path an evaluator
//! returns must be absolute; it is cleaned (`.`, `..`, `//`) and the
//! decision is logged as one "pass:" or "mapped:" line.
//!
//! `SandboxContext` bundles the evaluator with the session it belongs to;
//! `with_thread_context` gives every thread its own.

pub mod context;
pub mod evaluator;
pub mod flags;
pub mod path;
pub mod protocol;
pub mod ruletree_eval;

pub use context::{fatal, or_fatal, with_thread_context, RuleTreeEvaluatorFactory, SandboxContext, Session};
pub use evaluator::{
    EvaluatorFactory, MappingRequirements, MappingRule, ReverseOutcome, RuleEvaluator,
    TranslateOutcome, MAPPING_INTERFACE_VERSION,
};
pub use protocol::{MappingCall, Translation};
pub use ruletree_eval::RuleTreeEvaluator;

/// Errors that end the mapping setup of a process.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error(transparent)]
    Config(#[from] sbx_config::ConfigError),

    #[error(transparent)]
    RuleTree(#[from] sbx_ruletree::RuleTreeError),

    #[error("evaluator bootstrap failed: {0}")]
    EvaluatorBootstrap(String),

    #[error("evaluator interface version mismatch: evaluator provides '{found}', but '{expected}' was expected")]
    InterfaceVersion { found: String, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, ContextError>;
