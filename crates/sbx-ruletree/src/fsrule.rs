//! Path mapping rules stored in the rule tree.
//!
//! Rules are written once by the rule compiler and only read afterwards.
//! On disk the selector, action and condition are (type code, offset)
//! pairs; in memory they are sum types so that, for example, a `MapTo`
//! without a target cannot be expressed.

use crate::layout::{FsRuleRecord, ObjectHeader, ObjectOffset, ObjectType};
use crate::{Result, RuleTree};
use sbx_config::{log_ruletree_debug, DEFAULT_MODE};

// Function classes a rule can be restricted to (0 = any function).
pub const FUNC_CLASS_OPEN: u32 = 0x0001;
pub const FUNC_CLASS_STAT: u32 = 0x0002;
pub const FUNC_CLASS_EXEC: u32 = 0x0004;
pub const FUNC_CLASS_SOCKADDR: u32 = 0x0008;
pub const FUNC_CLASS_FTSOPEN: u32 = 0x0010;
pub const FUNC_CLASS_GLOB: u32 = 0x0020;
pub const FUNC_CLASS_GETCWD: u32 = 0x0040;
pub const FUNC_CLASS_REALPATH: u32 = 0x0080;
pub const FUNC_CLASS_SET_TIMES: u32 = 0x0100;
pub const FUNC_CLASS_MKNOD: u32 = 0x0200;
pub const FUNC_CLASS_RENAME: u32 = 0x0400;
pub const FUNC_CLASS_SYMLINK: u32 = 0x0800;
pub const FUNC_CLASS_CREAT: u32 = 0x1000;
pub const FUNC_CLASS_REMOVE: u32 = 0x2000;
pub const FUNC_CLASS_CHROOT: u32 = 0x4000;

/// Which paths a rule applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selector {
    /// Plain string prefix
    Prefix(String),
    /// Directory and everything below it
    Dir(String),
    /// Exactly this path
    Path(String),
}

impl Selector {
    fn code(&self) -> u32 {
        match self {
            Selector::Prefix(_) => 1,
            Selector::Dir(_) => 2,
            Selector::Path(_) => 3,
        }
    }

    pub fn value(&self) -> &str {
        match self {
            Selector::Prefix(s) | Selector::Dir(s) | Selector::Path(s) => s,
        }
    }

    fn decode(code: u32, value: String) -> Option<Self> {
        Some(match code {
            1 => Selector::Prefix(value),
            2 => Selector::Dir(value),
            3 => Selector::Path(value),
            _ => return None,
        })
    }
}

/// What a matching rule does with the path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    UseOrigPath,
    ForceOrigPath,
    ForceOrigPathUnlessChroot,
    /// Prepend this directory to the whole virtual path
    MapTo(String),
    /// Replace the selector-matched prefix with this path
    ReplaceBy(String),
    /// Use exactly this path
    SetPath(String),
    /// `MapTo` with the directory taken from an environment variable
    MapToValueOfEnvVar(String),
    /// `ReplaceBy` with the replacement taken from an environment variable
    ReplaceByValueOfEnvVar(String),
    /// Try the rules of this object list in order
    ConditionalActions(ObjectOffset),
    /// Descend into the rules of this object list
    Subtree(ObjectOffset),
}

impl Action {
    fn code(&self) -> u32 {
        match self {
            Action::UseOrigPath => 1,
            Action::ForceOrigPath => 2,
            Action::ForceOrigPathUnlessChroot => 3,
            Action::MapTo(_) => 4,
            Action::ReplaceBy(_) => 5,
            Action::SetPath(_) => 6,
            Action::MapToValueOfEnvVar(_) => 7,
            Action::ReplaceByValueOfEnvVar(_) => 8,
            Action::ConditionalActions(_) => 9,
            Action::Subtree(_) => 10,
        }
    }

    fn text(&self) -> Option<&str> {
        match self {
            Action::MapTo(s)
            | Action::ReplaceBy(s)
            | Action::SetPath(s)
            | Action::MapToValueOfEnvVar(s)
            | Action::ReplaceByValueOfEnvVar(s) => Some(s),
            _ => None,
        }
    }

    fn decode(tree: &RuleTree, code: u32, offset: ObjectOffset) -> Option<Self> {
        let text = || tree.opt_string(offset);
        Some(match code {
            1 => Action::UseOrigPath,
            2 => Action::ForceOrigPath,
            3 => Action::ForceOrigPathUnlessChroot,
            4 => Action::MapTo(text()?),
            5 => Action::ReplaceBy(text()?),
            6 => Action::SetPath(text()?),
            7 => Action::MapToValueOfEnvVar(text()?),
            8 => Action::ReplaceByValueOfEnvVar(text()?),
            9 => Action::ConditionalActions(tree.list_size(offset).map(|_| offset)?),
            10 => Action::Subtree(tree.list_size(offset).map(|_| offset)?),
            _ => return None,
        })
    }
}

/// Extra requirement checked before a rule is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    IfActiveExecPolicyIs(String),
    IfRedirectIgnoreIsActive(String),
    IfRedirectForceIsActive(String),
    IfEnvVarIsNotEmpty(String),
    IfEnvVarIsEmpty(String),
    IfExistsIn(String),
}

impl Condition {
    fn code(&self) -> u32 {
        match self {
            Condition::IfActiveExecPolicyIs(_) => 1,
            Condition::IfRedirectIgnoreIsActive(_) => 2,
            Condition::IfRedirectForceIsActive(_) => 3,
            Condition::IfEnvVarIsNotEmpty(_) => 4,
            Condition::IfEnvVarIsEmpty(_) => 5,
            Condition::IfExistsIn(_) => 6,
        }
    }

    fn value(&self) -> &str {
        match self {
            Condition::IfActiveExecPolicyIs(s)
            | Condition::IfRedirectIgnoreIsActive(s)
            | Condition::IfRedirectForceIsActive(s)
            | Condition::IfEnvVarIsNotEmpty(s)
            | Condition::IfEnvVarIsEmpty(s)
            | Condition::IfExistsIn(s) => s,
        }
    }

    fn decode(code: u32, value: String) -> Option<Self> {
        Some(match code {
            1 => Condition::IfActiveExecPolicyIs(value),
            2 => Condition::IfRedirectIgnoreIsActive(value),
            3 => Condition::IfRedirectForceIsActive(value),
            4 => Condition::IfEnvVarIsNotEmpty(value),
            5 => Condition::IfEnvVarIsEmpty(value),
            6 => Condition::IfExistsIn(value),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsRule {
    pub name: Option<String>,
    pub selector: Option<Selector>,
    pub action: Action,
    pub condition: Option<Condition>,
    /// Rule to fall through to (0 = none)
    pub next: ObjectOffset,
    /// Mapping flags (readonly, call-translate-for-all, ...)
    pub flags: u32,
    /// Only applies when the running binary has this name
    pub binary_name: Option<String>,
    /// FUNC_CLASS_* mask, 0 = all functions
    pub func_class: u32,
    pub exec_policy_name: Option<String>,
}

impl FsRule {
    pub fn new(selector: Selector, action: Action) -> Self {
        Self {
            name: None,
            selector: Some(selector),
            action,
            condition: None,
            next: 0,
            flags: 0,
            binary_name: None,
            func_class: 0,
            exec_policy_name: None,
        }
    }
}

fn fsrules_catalog(mode: &str) -> String {
    let mode = if mode.is_empty() { DEFAULT_MODE } else { mode };
    format!("fs_rules.{mode}")
}

impl RuleTree {
    /// Store a rule, returning its offset.
    pub fn add_rule(&self, rule: &FsRule) -> Result<ObjectOffset> {
        let name = self.append_opt_string(rule.name.as_deref())?;
        let selector = self.append_opt_string(rule.selector.as_ref().map(Selector::value))?;
        let action = match &rule.action {
            Action::ConditionalActions(list) | Action::Subtree(list) => *list,
            other => self.append_opt_string(other.text())?,
        };
        let condition = self.append_opt_string(rule.condition.as_ref().map(Condition::value))?;
        let binary_name = self.append_opt_string(rule.binary_name.as_deref())?;
        let exec_policy_name = self.append_opt_string(rule.exec_policy_name.as_deref())?;

        let record = FsRuleRecord {
            obj: ObjectHeader::new(ObjectType::FsRule),
            name,
            selector_type: rule.selector.as_ref().map_or(0, Selector::code),
            action_type: rule.action.code(),
            selector,
            action,
            condition_type: rule.condition.as_ref().map_or(0, Condition::code),
            flags: rule.flags,
            condition,
            rule_list_link: rule.next,
            binary_name,
            exec_policy_name,
            func_class: rule.func_class,
            _pad: 0,
        };
        let offset = self.append_record(&record, &[])?;
        log_ruletree_debug!(name = ?rule.name, offset, "add_rule_to_ruletree");
        Ok(offset)
    }

    /// Decode the rule at `offset`. Unknown type codes or dangling strings
    /// make the whole rule absent.
    pub fn rule_at(&self, offset: ObjectOffset) -> Option<FsRule> {
        let rec = self.record::<FsRuleRecord>(offset)?;

        let selector = match rec.selector_type {
            0 => None,
            code => Some(Selector::decode(code, self.opt_string(rec.selector)?)?),
        };
        let condition = match rec.condition_type {
            0 => None,
            code => Some(Condition::decode(code, self.opt_string(rec.condition)?)?),
        };
        let Some(action) = Action::decode(self, rec.action_type, rec.action) else {
            log_ruletree_debug!(offset, action_type = rec.action_type, "bad rule action");
            return None;
        };

        Some(FsRule {
            name: self.opt_string(rec.name),
            selector,
            action,
            condition,
            next: rec.rule_list_link,
            flags: rec.flags,
            binary_name: self.opt_string(rec.binary_name),
            func_class: rec.func_class,
            exec_policy_name: self.opt_string(rec.exec_policy_name),
        })
    }

    /// Register the rule list `rules` as `ruleset_name` for mapping `mode`.
    pub fn set_fsrules(&self, mode: &str, ruleset_name: &str, rules: ObjectOffset) -> Result<()> {
        self.catalog_set(&fsrules_catalog(mode), ruleset_name, rules)
    }

    /// Rule list registered for `mode`/`ruleset_name`.
    pub fn fsrules(&self, mode: &str, ruleset_name: &str) -> Option<ObjectOffset> {
        self.catalog_get(&fsrules_catalog(mode), ruleset_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tree() -> (tempfile::TempDir, RuleTree) {
        let temp = tempdir().unwrap();
        let (tree, _) = RuleTree::attach(&temp.path().join("rt"), true, true).unwrap();
        (temp, tree)
    }

    #[test]
    fn test_rule_roundtrip_all_fields() {
        let (_temp, tree) = tree();
        let rule = FsRule {
            name: Some("usr".into()),
            selector: Some(Selector::Dir("/usr".into())),
            action: Action::MapTo("/opt/target".into()),
            condition: Some(Condition::IfEnvVarIsNotEmpty("SBOX_TARGET".into())),
            next: 0,
            flags: 0o1,
            binary_name: Some("gcc".into()),
            func_class: FUNC_CLASS_OPEN | FUNC_CLASS_STAT,
            exec_policy_name: Some("Target".into()),
        };
        let off = tree.add_rule(&rule).unwrap();
        assert_eq!(tree.rule_at(off), Some(rule));
    }

    #[test]
    fn test_minimal_rule() {
        let (_temp, tree) = tree();
        let rule = FsRule {
            selector: None,
            ..FsRule::new(Selector::Prefix(String::new()), Action::UseOrigPath)
        };
        let off = tree.add_rule(&rule).unwrap();
        let back = tree.rule_at(off).unwrap();
        assert_eq!(back.selector, None);
        assert_eq!(back.action, Action::UseOrigPath);
        assert_eq!(back.name, None);
    }

    #[test]
    fn test_rule_list_actions_keep_their_list() {
        let (_temp, tree) = tree();
        let inner = tree
            .add_rule(&FsRule::new(Selector::Prefix("/a".into()), Action::ForceOrigPath))
            .unwrap();
        let list = tree.create_list(1).unwrap();
        tree.list_set(list, 0, inner).unwrap();

        let outer = tree
            .add_rule(&FsRule::new(
                Selector::Dir("/".into()),
                Action::ConditionalActions(list),
            ))
            .unwrap();
        assert_eq!(
            tree.rule_at(outer).unwrap().action,
            Action::ConditionalActions(list)
        );
    }

    #[test]
    fn test_rule_list_action_pointing_elsewhere_is_rejected() {
        let (_temp, tree) = tree();
        let s = tree.append_string("not a list").unwrap();
        let off = tree
            .add_rule(&FsRule::new(Selector::Dir("/".into()), Action::Subtree(s)))
            .unwrap();
        assert_eq!(tree.rule_at(off), None);
    }

    #[test]
    fn test_rule_at_wrong_object() {
        let (_temp, tree) = tree();
        let list = tree.create_list(1).unwrap();
        assert_eq!(tree.rule_at(list), None);
        assert!(tree.resolve(list, Some(ObjectType::FsRule)).is_none());
    }

    #[test]
    fn test_fsrules_by_mode() {
        let (_temp, tree) = tree();
        let list = tree.create_list(0).unwrap();
        let other = tree.create_list(0).unwrap();

        tree.set_fsrules("", "fs_rules", list).unwrap();
        tree.set_fsrules("emulate", "fs_rules", other).unwrap();

        assert_eq!(tree.fsrules("Default", "fs_rules"), Some(list));
        assert_eq!(tree.fsrules("emulate", "fs_rules"), Some(other));
        assert_eq!(tree.fsrules("tools", "fs_rules"), None);
    }
}
