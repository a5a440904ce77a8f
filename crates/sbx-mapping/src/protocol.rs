//! Calls into the evaluator and post-processing of its answers.
//!
//! The "pass:"/"mapped:" lines are read verbatim by log post-processing
//! tools; their text must not change.

use crate::evaluator::{MappingRequirements, MappingRule, RuleEvaluator};
use crate::flags::{check_mapping_flags, READONLY};
use crate::path::clean_host_path;
use sbx_config::logging::LogLevel;
use sbx_config::{
    log_mapping_debug, log_mapping_error, log_mapping_info, log_mapping_trace, log_mapping_warn,
};
use std::fmt;

/// Who is asking: the running binary and the wrapped function.
#[derive(Debug, Clone, Copy)]
pub struct MappingCall<'a> {
    pub binary_name: &'a str,
    pub func_name: &'a str,
}

/// A validated, cleaned translation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Translation {
    pub host_path: String,
    pub flags: u32,
    pub exec_policy_name: Option<String>,
}

impl Translation {
    pub fn is_readonly(&self) -> bool {
        self.flags & READONLY != 0
    }
}

/// The result line of one translation.
pub struct ResultLine<'a> {
    pub func_name: &'a str,
    pub virtual_path: &'a str,
    pub host_path: &'a str,
    pub readonly: bool,
}

impl fmt::Display for ResultLine<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ro = if self.readonly { " (readonly)" } else { "" };
        if self.host_path == self.virtual_path {
            write!(f, "pass: {} '{}'{}", self.func_name, self.virtual_path, ro)
        } else {
            write!(
                f,
                "mapped: {} '{}' -> '{}'{}",
                self.func_name, self.virtual_path, self.host_path, ro
            )
        }
    }
}

fn log_result(level: LogLevel, line: &ResultLine<'_>) {
    match level {
        LogLevel::Error => log_mapping_error!("{}", line),
        LogLevel::Warn => log_mapping_warn!("{}", line),
        LogLevel::Info => log_mapping_info!("{}", line),
        LogLevel::Debug => log_mapping_debug!("{}", line),
        LogLevel::Trace => log_mapping_trace!("{}", line),
    }
}

/// Ask the evaluator which rule applies to `virtual_path`.
///
/// The returned rule stays owned by the caller and is passed to
/// `translate_path` for the same path.
pub fn get_mapping_requirements(
    evaluator: &mut dyn RuleEvaluator,
    call: MappingCall<'_>,
    virtual_path: &str,
) -> MappingRequirements {
    log_mapping_trace!(
        "calling sbox_get_mapping_requirements for {}({})",
        call.func_name,
        virtual_path
    );
    let req = evaluator.get_mapping_requirements(call.binary_name, call.func_name, virtual_path);
    check_mapping_flags(req.flags, "sbox_get_mapping_requirements");
    log_mapping_debug!(
        "sbox_get_mapping_requirements -> {},{},0{:o}",
        req.rule_found() as i32,
        req.min_path_len,
        req.flags
    );
    req
}

/// Translate an absolute, clean virtual path to a host path.
///
/// `None` means "no mapping"; the caller denies the operation.
pub fn translate_path(
    evaluator: &mut dyn RuleEvaluator,
    rule: &MappingRule,
    call: MappingCall<'_>,
    virtual_path: &str,
    result_log_level: LogLevel,
) -> Option<Translation> {
    log_mapping_trace!("calling sbox_translate_path for {}({})", call.func_name, virtual_path);
    let outcome = evaluator.translate_path(rule, call.binary_name, call.func_name, virtual_path);
    check_mapping_flags(outcome.flags, "sbox_translate_path");

    let host_path = match outcome.host_path {
        Some(host) if !host.starts_with('/') => {
            log_mapping_error!(
                "Mapping failed: Result is not absolute ('{}'->'{}')",
                virtual_path,
                host
            );
            None
        }
        other => other,
    };

    let Some(host_path) = host_path else {
        log_mapping_error!(
            "No result from sbox_translate_path for: {} '{}'",
            call.func_name,
            virtual_path
        );
        return None;
    };

    let cleaned = clean_host_path(&host_path);
    let line = ResultLine {
        func_name: call.func_name,
        virtual_path,
        host_path: &cleaned,
        readonly: outcome.flags & READONLY != 0,
    };
    log_result(result_log_level, &line);

    Some(Translation {
        host_path: cleaned,
        flags: outcome.flags,
        exec_policy_name: outcome.exec_policy_name,
    })
}

/// Map a host path back to its virtual path. The host path is used as is.
pub fn reverse_path(
    evaluator: &mut dyn RuleEvaluator,
    call: MappingCall<'_>,
    host_path: &str,
) -> Option<String> {
    log_mapping_trace!("calling sbox_reverse_path for {}({})", call.func_name, host_path);
    let outcome = evaluator.reverse_path(call.binary_name, call.func_name, host_path);
    check_mapping_flags(outcome.flags, "sbox_reverse_path");

    match outcome.virtual_path {
        Some(virtual_path) => {
            log_mapping_debug!("virtual_path='{}'", virtual_path);
            Some(virtual_path)
        }
        None => {
            log_mapping_info!(
                "No result from sbox_reverse_path for: {} '{}'",
                call.func_name,
                host_path
            );
            None
        }
    }
}

/// Requirements and translation in one step, for callers that do not walk
/// the path themselves.
pub fn map_path(
    evaluator: &mut dyn RuleEvaluator,
    call: MappingCall<'_>,
    virtual_path: &str,
    result_log_level: LogLevel,
) -> Option<Translation> {
    let req = get_mapping_requirements(evaluator, call, virtual_path);
    let Some(rule) = req.rule else {
        log_mapping_error!(
            "No result from sbox_translate_path for: {} '{}'",
            call.func_name,
            virtual_path
        );
        return None;
    };
    translate_path(evaluator, &rule, call, virtual_path, result_log_level)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ReverseOutcome, TranslateOutcome, MAPPING_INTERFACE_VERSION};
    use crate::flags::CALL_TRANSLATE_FOR_ALL;
    use sbx_ruletree::{Action, FsRule, Selector};

    /// Returns canned answers and counts calls.
    #[derive(Default)]
    struct Canned {
        host: Option<String>,
        flags: u32,
        reverse: Option<String>,
        translate_calls: usize,
    }

    impl RuleEvaluator for Canned {
        fn interface_version(&self) -> &str {
            MAPPING_INTERFACE_VERSION
        }

        fn get_mapping_requirements(&mut self, _: &str, _: &str, path: &str) -> MappingRequirements {
            MappingRequirements {
                rule: Some(rule()),
                min_path_len: path.len(),
                flags: self.flags,
            }
        }

        fn translate_path(&mut self, _: &MappingRule, _: &str, _: &str, _: &str) -> TranslateOutcome {
            self.translate_calls += 1;
            TranslateOutcome {
                exec_policy_name: Some("Target".into()),
                host_path: self.host.clone(),
                flags: self.flags,
            }
        }

        fn reverse_path(&mut self, _: &str, _: &str, _: &str) -> ReverseOutcome {
            ReverseOutcome {
                virtual_path: self.reverse.clone(),
                flags: self.flags,
            }
        }
    }

    fn rule() -> MappingRule {
        MappingRule {
            offset: 0,
            rule: FsRule::new(Selector::Dir("/".into()), Action::UseOrigPath),
            match_len: 1,
        }
    }

    const CALL: MappingCall<'static> = MappingCall {
        binary_name: "sh",
        func_name: "open",
    };

    fn canned(host: &str, flags: u32) -> Canned {
        Canned {
            host: Some(host.into()),
            flags,
            ..Canned::default()
        }
    }

    #[test]
    fn test_result_line_pass_and_mapped() {
        let pass = ResultLine {
            func_name: "open",
            virtual_path: "/etc/hosts",
            host_path: "/etc/hosts",
            readonly: false,
        };
        assert_eq!(pass.to_string(), "pass: open '/etc/hosts'");

        let mapped = ResultLine {
            func_name: "stat",
            virtual_path: "/usr",
            host_path: "/opt/target/usr",
            readonly: true,
        };
        assert_eq!(
            mapped.to_string(),
            "mapped: stat '/usr' -> '/opt/target/usr' (readonly)"
        );
    }

    #[test]
    fn test_translate_cleans_result() {
        let mut ev = canned("/a/./b/../c", 0);
        let t = translate_path(&mut ev, &rule(), CALL, "/x", LogLevel::Info).unwrap();
        assert_eq!(t.host_path, "/a/c");
        assert_eq!(t.exec_policy_name.as_deref(), Some("Target"));

        let mut ev = canned("/a//b", 0);
        let t = translate_path(&mut ev, &rule(), CALL, "/x", LogLevel::Info).unwrap();
        assert_eq!(t.host_path, "/a/b");
    }

    #[test]
    fn test_clean_result_passes_through() {
        let mut ev = canned("/usr/bin/env", READONLY);
        let t = translate_path(&mut ev, &rule(), CALL, "/usr/bin/env", LogLevel::Debug).unwrap();
        assert_eq!(t.host_path, "/usr/bin/env");
        assert!(t.is_readonly());
    }

    #[test]
    fn test_relative_result_is_discarded() {
        let mut ev = canned("relative/path", 0);
        assert_eq!(translate_path(&mut ev, &rule(), CALL, "/x", LogLevel::Info), None);
    }

    #[test]
    fn test_missing_result() {
        let mut ev = Canned::default();
        assert_eq!(translate_path(&mut ev, &rule(), CALL, "/x", LogLevel::Info), None);
    }

    #[test]
    fn test_unknown_flags_are_kept() {
        let mut ev = canned("/x", 0o200 | READONLY);
        let t = translate_path(&mut ev, &rule(), CALL, "/x", LogLevel::Info).unwrap();
        assert_eq!(t.flags, 0o200 | READONLY);
    }

    #[test]
    fn test_requirements_pass_through() {
        let mut ev = canned("/x", CALL_TRANSLATE_FOR_ALL);
        let req = get_mapping_requirements(&mut ev, CALL, "/usr/lib");
        assert!(req.rule_found());
        assert_eq!(req.min_path_len, 8);
        assert!(req.call_translate_for_all());
    }

    #[test]
    fn test_reverse() {
        let mut ev = Canned {
            reverse: Some("/home/u".into()),
            ..Canned::default()
        };
        assert_eq!(reverse_path(&mut ev, CALL, "/target/home/u").as_deref(), Some("/home/u"));

        let mut ev = Canned::default();
        assert_eq!(reverse_path(&mut ev, CALL, "/nowhere"), None);
    }

    #[test]
    fn test_map_path_uses_rule_from_requirements() {
        let mut ev = canned("/target/x", 0);
        let t = map_path(&mut ev, CALL, "/x", LogLevel::Info).unwrap();
        assert_eq!(t.host_path, "/target/x");
        assert_eq!(ev.translate_calls, 1);
    }
}
