//! The rule evaluator interface.
//!
//! An evaluator decides how a virtual path maps to a host path. The
//! protocol layer in `crate::protocol` validates, cleans and logs whatever
//! it returns.

use crate::Result;
use sbx_config::SessionConfig;
use sbx_ruletree::{FsRule, ObjectOffset, RuleTree};
use std::sync::Arc;

/// Interface version an evaluator must report to be usable.
pub const MAPPING_INTERFACE_VERSION: &str = "sbx-mapping-1";

/// The rule selected by `get_mapping_requirements`, handed back to
/// `translate_path` for the same path. Owned by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingRule {
    /// Arena offset of the rule (0 for rules not stored in an arena)
    pub offset: ObjectOffset,
    pub rule: FsRule,
    /// Length of the path prefix the selector matched
    pub match_len: usize,
}

/// Answer of `get_mapping_requirements`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MappingRequirements {
    pub rule: Option<MappingRule>,
    /// Shortest path prefix the resolver must keep when walking the path
    pub min_path_len: usize,
    pub flags: u32,
}

impl MappingRequirements {
    pub fn rule_found(&self) -> bool {
        self.rule.is_some()
    }

    pub fn call_translate_for_all(&self) -> bool {
        self.flags & crate::flags::CALL_TRANSLATE_FOR_ALL != 0
    }
}

/// Raw answer of `translate_path`, before validation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranslateOutcome {
    pub exec_policy_name: Option<String>,
    pub host_path: Option<String>,
    pub flags: u32,
}

/// Raw answer of `reverse_path`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReverseOutcome {
    pub virtual_path: Option<String>,
    pub flags: u32,
}

pub trait RuleEvaluator {
    /// Must equal `MAPPING_INTERFACE_VERSION`.
    fn interface_version(&self) -> &str;

    fn get_mapping_requirements(
        &mut self,
        binary_name: &str,
        func_name: &str,
        virtual_path: &str,
    ) -> MappingRequirements;

    fn translate_path(
        &mut self,
        rule: &MappingRule,
        binary_name: &str,
        func_name: &str,
        virtual_path: &str,
    ) -> TranslateOutcome;

    fn reverse_path(&mut self, binary_name: &str, func_name: &str, host_path: &str) -> ReverseOutcome;
}

/// Builds the evaluator of a context. Called at most once per context.
pub trait EvaluatorFactory: Send + Sync {
    fn create(
        &self,
        config: &SessionConfig,
        ruletree: Option<Arc<RuleTree>>,
    ) -> Result<Box<dyn RuleEvaluator>>;
}

impl<F> EvaluatorFactory for F
where
    F: Fn(&SessionConfig, Option<Arc<RuleTree>>) -> Result<Box<dyn RuleEvaluator>> + Send + Sync,
{
    fn create(
        &self,
        config: &SessionConfig,
        ruletree: Option<Arc<RuleTree>>,
    ) -> Result<Box<dyn RuleEvaluator>> {
        self(config, ruletree)
    }
}
