//! Evaluator that interprets the FS rules stored in the session's rule tree.
//!
//! Rules are read from the object list registered as `fs_rules` for the
//! session mode. The first rule whose filters, selector and condition all
//! accept the path wins. A rule's `next` link is tried before moving on to
//! the following list item.

use crate::evaluator::{
    MappingRequirements, MappingRule, ReverseOutcome, RuleEvaluator, TranslateOutcome,
    MAPPING_INTERFACE_VERSION,
};
use crate::flags;
use sbx_config::{log_mapping_debug, log_mapping_trace};
use sbx_ruletree::fsrule::*;
use sbx_ruletree::{Action, Condition, FsRule, ObjectOffset, RuleTree, Selector};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Name of the rule list inside a mode's catalog.
pub const FS_RULES_NAME: &str = "fs_rules";

/// Colon separated list of active "redirect ignore" names.
pub const ENV_REDIRECT_IGNORE: &str = "SBOX_REDIRECT_IGNORE";
/// Colon separated list of active "redirect force" names.
pub const ENV_REDIRECT_FORCE: &str = "SBOX_REDIRECT_FORCE";

const MAX_DEPTH: usize = 16;
const MAX_CHAIN: usize = 256;

/// Length of the prefix of `path` matched by `selector`, if it matches.
///
/// A directory selector matches the directory itself and everything below
/// it (`/` matches every absolute path). An exact path selector also
/// accepts the path with one trailing slash.
pub fn test_path_match(path: &str, selector: &Selector) -> Option<usize> {
    let result = match selector {
        Selector::Dir(dir) if !dir.is_empty() && path.starts_with(dir.as_str()) => {
            let next = path.as_bytes().get(dir.len());
            let root = dir.len() == 1 && path.starts_with('/');
            (root || matches!(next, None | Some(b'/'))).then_some(dir.len())
        }
        Selector::Prefix(prefix) if !prefix.is_empty() && path.starts_with(prefix.as_str()) => {
            Some(prefix.len())
        }
        Selector::Path(exact) if path == exact => Some(exact.len()),
        Selector::Path(exact) => {
            let trailing = path.len() > 2
                && path.ends_with('/')
                && path.len() == exact.len() + 1
                && path.starts_with(exact.as_str());
            trailing.then_some(exact.len())
        }
        _ => None,
    };
    log_mapping_trace!(path, ?selector, ?result, "test_path_match");
    result
}

/// Function class of a wrapped function, for rules restricted with
/// `func_class`. Unknown functions get 0 and only match unrestricted rules.
pub fn func_class_of(func_name: &str) -> u32 {
    let name = func_name.trim_start_matches('_');
    match name {
        n if n.starts_with("creat") => FUNC_CLASS_CREAT | FUNC_CLASS_OPEN,
        n if n.starts_with("open") || n.starts_with("fopen") || n.starts_with("freopen") => {
            FUNC_CLASS_OPEN
        }
        n if n.contains("stat") || n.starts_with("access") || n == "faccessat" => FUNC_CLASS_STAT,
        n if n.starts_with("exec") || n.starts_with("posix_spawn") => FUNC_CLASS_EXEC,
        "bind" | "connect" => FUNC_CLASS_SOCKADDR,
        n if n.starts_with("fts_open") => FUNC_CLASS_FTSOPEN,
        n if n.starts_with("glob") => FUNC_CLASS_GLOB,
        n if n.starts_with("getcwd") || n == "get_current_dir_name" || n == "getwd" => {
            FUNC_CLASS_GETCWD
        }
        n if n.contains("realpath") => FUNC_CLASS_REALPATH,
        n if n.starts_with("utime") || n.starts_with("futimesat") || n == "lutimes" => {
            FUNC_CLASS_SET_TIMES
        }
        n if n.starts_with("mknod") || n.starts_with("xmknod") => FUNC_CLASS_MKNOD,
        n if n.starts_with("rename") => FUNC_CLASS_RENAME,
        n if n.starts_with("symlink") => FUNC_CLASS_SYMLINK,
        n if n.starts_with("unlink") || n == "remove" || n == "rmdir" => FUNC_CLASS_REMOVE,
        "chroot" => FUNC_CLASS_CHROOT,
        _ => 0,
    }
}

/// `host` below (or equal to) directory `dir`: the part after `dir`.
fn strip_dir<'a>(host: &'a str, dir: &str) -> Option<&'a str> {
    let rest = host.strip_prefix(dir)?;
    (rest.is_empty() || rest.starts_with('/')).then_some(rest)
}

pub struct RuleTreeEvaluator {
    tree: Arc<RuleTree>,
    mode: String,
    active_exec_policy: Option<String>,
    env_overrides: HashMap<String, String>,
}

impl RuleTreeEvaluator {
    pub fn new(tree: Arc<RuleTree>, mode: impl Into<String>) -> Self {
        Self {
            tree,
            mode: mode.into(),
            active_exec_policy: None,
            env_overrides: HashMap::new(),
        }
    }

    /// Exec policy checked by `IfActiveExecPolicyIs` conditions.
    pub fn set_active_exec_policy(&mut self, name: Option<String>) {
        self.active_exec_policy = name;
    }

    /// Value used instead of the process environment for `name`.
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_overrides.insert(name.into(), value.into());
        self
    }

    fn env(&self, name: &str) -> Option<String> {
        match self.env_overrides.get(name) {
            Some(v) => Some(v.clone()),
            None => std::env::var(name).ok(),
        }
    }

    fn env_list_contains(&self, var: &str, name: &str) -> bool {
        self.env(var)
            .map(|list| list.split(':').any(|item| item == name))
            .unwrap_or(false)
    }

    fn rules(&self) -> Option<ObjectOffset> {
        let list = self.tree.fsrules(&self.mode, FS_RULES_NAME);
        if list.is_none() {
            log_mapping_debug!(mode = %self.mode, "no fs rules for mode");
        }
        list
    }

    fn condition_holds(&self, condition: &Condition, virtual_path: &str) -> bool {
        match condition {
            Condition::IfActiveExecPolicyIs(name) => {
                self.active_exec_policy.as_deref() == Some(name.as_str())
            }
            Condition::IfRedirectIgnoreIsActive(name) => {
                self.env_list_contains(ENV_REDIRECT_IGNORE, name)
            }
            Condition::IfRedirectForceIsActive(name) => {
                self.env_list_contains(ENV_REDIRECT_FORCE, name)
            }
            Condition::IfEnvVarIsNotEmpty(var) => self.env(var).is_some_and(|v| !v.is_empty()),
            Condition::IfEnvVarIsEmpty(var) => self.env(var).map_or(true, |v| v.is_empty()),
            Condition::IfExistsIn(dir) => {
                let candidate = format!("{}{}", dir.trim_end_matches('/'), virtual_path);
                Path::new(&candidate).symlink_metadata().is_ok()
            }
        }
    }

    /// Selector match length if every filter of `rule` accepts the call.
    fn rule_applies(&self, rule: &FsRule, binary_name: &str, func_class: u32, path: &str) -> Option<usize> {
        if let Some(binary) = &rule.binary_name {
            if binary != binary_name {
                return None;
            }
        }
        if rule.func_class != 0 && rule.func_class & func_class == 0 {
            return None;
        }
        let len = match &rule.selector {
            Some(selector) => test_path_match(path, selector)?,
            None => 0,
        };
        match &rule.condition {
            Some(cond) if !self.condition_holds(cond, path) => None,
            _ => Some(len),
        }
    }

    /// First alternative of a conditional action whose condition holds.
    fn pick_conditional(&self, list: ObjectOffset, path: &str) -> Option<(ObjectOffset, FsRule)> {
        self.tree.list_items(list).into_iter().find_map(|off| {
            let rule = self.tree.rule_at(off)?;
            let holds = rule
                .condition
                .as_ref()
                .map_or(true, |c| self.condition_holds(c, path));
            let leaf = !matches!(rule.action, Action::ConditionalActions(_) | Action::Subtree(_));
            (holds && leaf).then_some((off, rule))
        })
    }

    fn find_rule(
        &self,
        list: ObjectOffset,
        binary_name: &str,
        func_class: u32,
        path: &str,
        depth: usize,
    ) -> Option<MappingRule> {
        if depth > MAX_DEPTH {
            log_mapping_debug!(depth, "rule nesting too deep");
            return None;
        }
        for item in self.tree.list_items(list) {
            let mut link = item;
            let mut hops = 0;
            while link != 0 && hops < MAX_CHAIN {
                let Some(rule) = self.tree.rule_at(link) else {
                    log_mapping_debug!(offset = link, "unreadable rule skipped");
                    break;
                };
                if let Some(match_len) = self.rule_applies(&rule, binary_name, func_class, path) {
                    match rule.action {
                        Action::Subtree(sub) => {
                            let found = self.find_rule(sub, binary_name, func_class, path, depth + 1);
                            if found.is_some() {
                                return found;
                            }
                        }
                        Action::ConditionalActions(alternatives) => {
                            if let Some((offset, rule)) = self.pick_conditional(alternatives, path) {
                                return Some(MappingRule {
                                    offset,
                                    rule,
                                    match_len,
                                });
                            }
                        }
                        _ => {
                            return Some(MappingRule {
                                offset: link,
                                rule,
                                match_len,
                            })
                        }
                    }
                }
                link = rule.next;
                hops += 1;
            }
        }
        None
    }

    fn reverse_in(&self, list: ObjectOffset, binary_name: &str, host: &str, depth: usize) -> Option<(String, u32)> {
        if depth > MAX_DEPTH {
            return None;
        }
        for item in self.tree.list_items(list) {
            let mut link = item;
            let mut hops = 0;
            while link != 0 && hops < MAX_CHAIN {
                let Some(rule) = self.tree.rule_at(link) else {
                    break;
                };
                let binary_ok = rule.binary_name.as_deref().map_or(true, |b| b == binary_name);
                if binary_ok {
                    if let Some(vpath) = self.reverse_rule(&rule, binary_name, host, depth) {
                        return Some(vpath);
                    }
                }
                link = rule.next;
                hops += 1;
            }
        }
        None
    }

    fn reverse_rule(&self, rule: &FsRule, binary_name: &str, host: &str, depth: usize) -> Option<(String, u32)> {
        let selects = |vpath: &str| {
            rule.selector
                .as_ref()
                .map_or(true, |s| test_path_match(vpath, s).is_some())
        };
        let vpath = match &rule.action {
            Action::MapTo(dir) if dir != "/" => {
                let rest = strip_dir(host, dir.trim_end_matches('/'))?;
                let vpath = if rest.is_empty() { "/" } else { rest };
                selects(vpath).then(|| vpath.to_string())?
            }
            Action::MapTo(_)
            | Action::UseOrigPath
            | Action::ForceOrigPath
            | Action::ForceOrigPathUnlessChroot => selects(host).then(|| host.to_string())?,
            Action::ReplaceBy(replacement) => {
                let selector = rule.selector.as_ref()?;
                let rest = strip_dir(host, replacement.trim_end_matches('/'))?;
                format!("{}{}", selector.value().trim_end_matches('/'), rest)
            }
            Action::SetPath(target) if target == host => match &rule.selector {
                Some(Selector::Path(vpath)) => vpath.clone(),
                _ => return None,
            },
            Action::Subtree(sub) => return self.reverse_in(*sub, binary_name, host, depth + 1),
            _ => return None,
        };
        Some((vpath, rule.flags))
    }

    fn apply_action(&self, rule: &FsRule, match_len: usize, virtual_path: &str) -> (Option<String>, u32) {
        let rest = virtual_path.get(match_len..).unwrap_or("");
        let map_to = |dir: &str| {
            if dir == "/" {
                virtual_path.to_string()
            } else {
                format!("{dir}{virtual_path}")
            }
        };
        match &rule.action {
            Action::UseOrigPath => (Some(virtual_path.to_string()), rule.flags),
            Action::ForceOrigPath => (
                Some(virtual_path.to_string()),
                rule.flags | flags::FORCE_ORIG_PATH,
            ),
            Action::ForceOrigPathUnlessChroot => (
                Some(virtual_path.to_string()),
                rule.flags | flags::FORCE_ORIG_PATH_UNLESS_CHROOT,
            ),
            Action::MapTo(dir) => (Some(map_to(dir)), rule.flags),
            Action::ReplaceBy(replacement) => (Some(format!("{replacement}{rest}")), rule.flags),
            Action::SetPath(path) => (Some(path.clone()), rule.flags),
            Action::MapToValueOfEnvVar(var) => (self.env(var).map(|dir| map_to(&dir)), rule.flags),
            Action::ReplaceByValueOfEnvVar(var) => (
                self.env(var).map(|replacement| format!("{replacement}{rest}")),
                rule.flags,
            ),
            Action::ConditionalActions(_) | Action::Subtree(_) => (None, rule.flags),
        }
    }
}

impl RuleEvaluator for RuleTreeEvaluator {
    fn interface_version(&self) -> &str {
        MAPPING_INTERFACE_VERSION
    }

    fn get_mapping_requirements(
        &mut self,
        binary_name: &str,
        func_name: &str,
        virtual_path: &str,
    ) -> MappingRequirements {
        let Some(list) = self.rules() else {
            return MappingRequirements::default();
        };
        match self.find_rule(list, binary_name, func_class_of(func_name), virtual_path, 0) {
            Some(found) => MappingRequirements {
                min_path_len: found.match_len,
                flags: found.rule.flags,
                rule: Some(found),
            },
            None => MappingRequirements::default(),
        }
    }

    fn translate_path(
        &mut self,
        rule: &MappingRule,
        _binary_name: &str,
        _func_name: &str,
        virtual_path: &str,
    ) -> TranslateOutcome {
        let (host_path, flags) = self.apply_action(&rule.rule, rule.match_len, virtual_path);
        TranslateOutcome {
            exec_policy_name: rule.rule.exec_policy_name.clone(),
            host_path,
            flags,
        }
    }

    fn reverse_path(&mut self, binary_name: &str, _func_name: &str, host_path: &str) -> ReverseOutcome {
        let found = self
            .rules()
            .and_then(|list| self.reverse_in(list, binary_name, host_path, 0));
        match found {
            Some((virtual_path, flags)) => ReverseOutcome {
                virtual_path: Some(virtual_path),
                flags,
            },
            None => ReverseOutcome::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_dir_match() {
        let usr = Selector::Dir("/usr".into());
        assert_eq!(test_path_match("/usr", &usr), Some(4));
        assert_eq!(test_path_match("/usr/lib", &usr), Some(4));
        assert_eq!(test_path_match("/usrlocal", &usr), None);

        let root = Selector::Dir("/".into());
        assert_eq!(test_path_match("/anything/at/all", &root), Some(1));
    }

    #[test]
    fn test_prefix_and_exact_match() {
        let prefix = Selector::Prefix("/usr/lib".into());
        assert_eq!(test_path_match("/usr/lib64", &prefix), Some(8));

        let exact = Selector::Path("/etc/passwd".into());
        assert_eq!(test_path_match("/etc/passwd", &exact), Some(11));
        assert_eq!(test_path_match("/etc/passwd/", &exact), Some(11));
        assert_eq!(test_path_match("/etc/passwd//", &exact), None);
        assert_eq!(test_path_match("/etc/passwdx", &exact), None);
        assert_eq!(test_path_match("/a/", &Selector::Path("/a".into())), Some(2));
        assert_eq!(test_path_match("//", &Selector::Path("/".into())), None);
    }

    #[test]
    fn test_empty_selectors_never_match() {
        assert_eq!(test_path_match("/x", &Selector::Dir(String::new())), None);
        assert_eq!(test_path_match("/x", &Selector::Prefix(String::new())), None);
    }

    #[test]
    fn test_func_classes() {
        assert_eq!(func_class_of("open"), FUNC_CLASS_OPEN);
        assert_eq!(func_class_of("__xstat64"), FUNC_CLASS_STAT);
        assert_eq!(func_class_of("creat64"), FUNC_CLASS_CREAT | FUNC_CLASS_OPEN);
        assert_eq!(func_class_of("unlinkat"), FUNC_CLASS_REMOVE);
        assert_eq!(func_class_of("frobnicate"), 0);
    }

    fn session(rules: &[FsRule]) -> (tempfile::TempDir, Arc<RuleTree>) {
        let temp = tempdir().unwrap();
        let (tree, _) = RuleTree::attach(&temp.path().join("rt"), true, true).unwrap();
        let list = tree.create_list(rules.len() as u32).unwrap();
        for (i, rule) in rules.iter().enumerate() {
            let off = tree.add_rule(rule).unwrap();
            tree.list_set(list, i as u32, off).unwrap();
        }
        tree.set_fsrules("Default", FS_RULES_NAME, list).unwrap();
        (temp, Arc::new(tree))
    }

    fn translate(ev: &mut RuleTreeEvaluator, func: &str, path: &str) -> Option<String> {
        let req = ev.get_mapping_requirements("gcc", func, path);
        let rule = req.rule?;
        ev.translate_path(&rule, "gcc", func, path).host_path
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let (_temp, tree) = session(&[
            FsRule::new(Selector::Dir("/proc".into()), Action::UseOrigPath),
            FsRule::new(Selector::Dir("/usr/lib".into()), Action::ReplaceBy("/opt/lib".into())),
            FsRule::new(Selector::Dir("/".into()), Action::MapTo("/target".into())),
        ]);
        let mut ev = RuleTreeEvaluator::new(tree, "Default");

        assert_eq!(translate(&mut ev, "open", "/proc/self").as_deref(), Some("/proc/self"));
        assert_eq!(translate(&mut ev, "open", "/usr/lib/libc.so").as_deref(), Some("/opt/lib/libc.so"));
        assert_eq!(translate(&mut ev, "open", "/etc/hosts").as_deref(), Some("/target/etc/hosts"));
    }

    #[test]
    fn test_requirements() {
        let (_temp, tree) = session(&[FsRule {
            flags: flags::READONLY | flags::CALL_TRANSLATE_FOR_ALL,
            ..FsRule::new(Selector::Dir("/usr".into()), Action::UseOrigPath)
        }]);
        let mut ev = RuleTreeEvaluator::new(tree, "Default");

        let req = ev.get_mapping_requirements("sh", "stat", "/usr/bin");
        assert!(req.rule_found());
        assert_eq!(req.min_path_len, 4);
        assert!(req.call_translate_for_all());

        let none = ev.get_mapping_requirements("sh", "stat", "/home");
        assert!(!none.rule_found());
        assert_eq!(none.flags, 0);
    }

    #[test]
    fn test_unknown_mode_has_no_rules() {
        let (_temp, tree) = session(&[FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath)]);
        let mut ev = RuleTreeEvaluator::new(tree, "emulate");
        assert!(!ev.get_mapping_requirements("sh", "open", "/x").rule_found());
    }

    #[test]
    fn test_filters_binary_and_function_class() {
        let (_temp, tree) = session(&[
            FsRule {
                binary_name: Some("make".into()),
                ..FsRule::new(Selector::Dir("/".into()), Action::SetPath("/make-only".into()))
            },
            FsRule {
                func_class: FUNC_CLASS_EXEC,
                ..FsRule::new(Selector::Dir("/".into()), Action::SetPath("/exec-only".into()))
            },
            FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath),
        ]);
        let mut ev = RuleTreeEvaluator::new(tree, "Default");

        assert_eq!(translate(&mut ev, "open", "/bin/sh").as_deref(), Some("/bin/sh"));
        assert_eq!(translate(&mut ev, "execve", "/bin/sh").as_deref(), Some("/exec-only"));
    }

    #[test]
    fn test_env_condition_and_env_action() {
        let (_temp, tree) = session(&[
            FsRule {
                condition: Some(Condition::IfEnvVarIsNotEmpty("SBX_TEST_TOOLS".into())),
                ..FsRule::new(
                    Selector::Dir("/tools".into()),
                    Action::MapToValueOfEnvVar("SBX_TEST_TOOLS".into()),
                )
            },
            FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath),
        ]);

        let mut plain = RuleTreeEvaluator::new(Arc::clone(&tree), "Default").with_env("SBX_TEST_TOOLS", "");
        assert_eq!(translate(&mut plain, "open", "/tools/bin").as_deref(), Some("/tools/bin"));

        let mut tools = RuleTreeEvaluator::new(tree, "Default").with_env("SBX_TEST_TOOLS", "/opt/t");
        assert_eq!(translate(&mut tools, "open", "/tools/bin").as_deref(), Some("/opt/t/tools/bin"));
    }

    #[test]
    fn test_conditional_actions() {
        let temp = tempdir().unwrap();
        let (tree, _) = RuleTree::attach(&temp.path().join("rt"), true, true).unwrap();

        let by_policy = tree
            .add_rule(&FsRule {
                selector: None,
                condition: Some(Condition::IfActiveExecPolicyIs("Host".into())),
                ..FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath)
            })
            .unwrap();
        let fallback = tree
            .add_rule(&FsRule {
                selector: None,
                ..FsRule::new(Selector::Dir("/".into()), Action::MapTo("/target".into()))
            })
            .unwrap();
        let alternatives = tree.create_list(2).unwrap();
        tree.list_set(alternatives, 0, by_policy).unwrap();
        tree.list_set(alternatives, 1, fallback).unwrap();

        let top = tree
            .add_rule(&FsRule::new(
                Selector::Dir("/lib".into()),
                Action::ConditionalActions(alternatives),
            ))
            .unwrap();
        let list = tree.create_list(1).unwrap();
        tree.list_set(list, 0, top).unwrap();
        tree.set_fsrules("Default", FS_RULES_NAME, list).unwrap();

        let mut ev = RuleTreeEvaluator::new(Arc::new(tree), "Default");
        assert_eq!(translate(&mut ev, "open", "/lib/a").as_deref(), Some("/target/lib/a"));
        ev.set_active_exec_policy(Some("Host".into()));
        assert_eq!(translate(&mut ev, "open", "/lib/a").as_deref(), Some("/lib/a"));
    }

    #[test]
    fn test_subtree_and_chain_fallthrough() {
        let temp = tempdir().unwrap();
        let (tree, _) = RuleTree::attach(&temp.path().join("rt"), true, true).unwrap();

        let inner = tree
            .add_rule(&FsRule::new(Selector::Dir("/opt/x".into()), Action::SetPath("/inner".into())))
            .unwrap();
        let sub = tree.create_list(1).unwrap();
        tree.list_set(sub, 0, inner).unwrap();

        let fallback = tree
            .add_rule(&FsRule::new(Selector::Dir("/".into()), Action::MapTo("/chained".into())))
            .unwrap();
        let head = tree
            .add_rule(&FsRule {
                next: fallback,
                ..FsRule::new(Selector::Dir("/opt".into()), Action::Subtree(sub))
            })
            .unwrap();
        let list = tree.create_list(1).unwrap();
        tree.list_set(list, 0, head).unwrap();
        tree.set_fsrules("Default", FS_RULES_NAME, list).unwrap();

        let mut ev = RuleTreeEvaluator::new(Arc::new(tree), "Default");
        assert_eq!(translate(&mut ev, "open", "/opt/x/y").as_deref(), Some("/inner"));
        assert_eq!(translate(&mut ev, "open", "/opt/z").as_deref(), Some("/chained/opt/z"));
    }

    #[test]
    fn test_exists_in_condition() {
        let overlay = tempdir().unwrap();
        std::fs::create_dir_all(overlay.path().join("etc")).unwrap();
        std::fs::write(overlay.path().join("etc/motd"), b"hi").unwrap();
        let dir = overlay.path().to_str().unwrap().to_string();

        let (_temp, tree) = session(&[
            FsRule {
                condition: Some(Condition::IfExistsIn(dir.clone())),
                ..FsRule::new(Selector::Dir("/".into()), Action::MapTo(dir.clone()))
            },
            FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath),
        ]);
        let mut ev = RuleTreeEvaluator::new(tree, "Default");
        assert_eq!(translate(&mut ev, "open", "/etc/motd"), Some(format!("{dir}/etc/motd")));
        assert_eq!(translate(&mut ev, "open", "/etc/issue").as_deref(), Some("/etc/issue"));
    }

    #[test]
    fn test_reverse() {
        let (_temp, tree) = session(&[
            FsRule::new(Selector::Dir("/usr/lib".into()), Action::ReplaceBy("/opt/lib".into())),
            FsRule::new(Selector::Dir("/proc".into()), Action::UseOrigPath),
            FsRule {
                flags: flags::READONLY,
                ..FsRule::new(Selector::Dir("/".into()), Action::MapTo("/target".into()))
            },
        ]);
        let mut ev = RuleTreeEvaluator::new(tree, "Default");

        let r = ev.reverse_path("sh", "getcwd", "/opt/lib/libm.so");
        assert_eq!(r.virtual_path.as_deref(), Some("/usr/lib/libm.so"));

        let r = ev.reverse_path("sh", "getcwd", "/proc/1");
        assert_eq!(r.virtual_path.as_deref(), Some("/proc/1"));

        let r = ev.reverse_path("sh", "getcwd", "/target/home/u");
        assert_eq!(r.virtual_path.as_deref(), Some("/home/u"));
        assert_eq!(r.flags, flags::READONLY);

        let r = ev.reverse_path("sh", "getcwd", "/target");
        assert_eq!(r.virtual_path.as_deref(), Some("/"));

        assert_eq!(ev.reverse_path("sh", "getcwd", "/elsewhere").virtual_path, None);
    }
}
