//! Session and per-thread mapping context.
//!
//! A `Session` is shared by every thread of a process: it holds the
//! configuration and the rule tree mapping, attached on first use. A
//! `SandboxContext` adds the evaluator, which is stateful and therefore
//! owned by exactly one thread. `with_thread_context` hands each thread its
//! own context and returns the same one on every call from that thread.

use crate::evaluator::{
    EvaluatorFactory, MappingRequirements, MappingRule, RuleEvaluator, MAPPING_INTERFACE_VERSION,
};
use crate::protocol::{self, MappingCall, Translation};
use crate::ruletree_eval::RuleTreeEvaluator;
use crate::{ContextError, Result};
use once_cell::sync::OnceCell;
use once_cell::unsync::OnceCell as LocalOnceCell;
use sbx_config::{log_mapping_debug, log_mapping_error, log_mapping_info, SessionConfig};
use sbx_ruletree::{RuleTree, RuleTreeError};
use std::cell::RefCell;
use std::sync::Arc;

pub struct Session {
    config: SessionConfig,
    ruletree: OnceCell<Option<Arc<RuleTree>>>,
}

impl Session {
    pub fn new(config: SessionConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            ruletree: OnceCell::new(),
        })
    }

    /// Session named by `SBOX_SESSION_DIR`, using the process-wide config.
    pub fn from_env() -> Result<Arc<Self>> {
        Ok(Self::new(sbx_config::config()?))
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The session's rule tree, attached on first use without keeping the
    /// descriptor open (appends are refused).
    ///
    /// A missing or unreadable file gives `None`; a version mismatch is an
    /// error the caller must treat as fatal.
    pub fn ruletree(&self) -> Result<Option<Arc<RuleTree>>> {
        self.ruletree
            .get_or_try_init(|| {
                let path = self.config.ruletree_path();
                let map_size = self.config.settings.ruletree.map_size;
                match RuleTree::attach_sized(&path, false, false, map_size) {
                    Ok((tree, outcome)) => {
                        log_mapping_debug!(path = %path.display(), ?outcome, "rule tree attached");
                        Ok(Some(Arc::new(tree)))
                    }
                    Err(e) if e.is_fatal() => Err(ContextError::RuleTree(e)),
                    Err(e) => {
                        log_mapping_info!(path = %path.display(), error = %e, "no rule tree");
                        Ok(None)
                    }
                }
            })
            .cloned()
    }
}

/// Builds the built-in rule tree evaluator for the session mode.
pub struct RuleTreeEvaluatorFactory;

impl EvaluatorFactory for RuleTreeEvaluatorFactory {
    fn create(
        &self,
        config: &SessionConfig,
        ruletree: Option<Arc<RuleTree>>,
    ) -> Result<Box<dyn RuleEvaluator>> {
        let tree = ruletree.ok_or_else(|| {
            ContextError::EvaluatorBootstrap(format!(
                "rule tree {} is not available",
                config.ruletree_path().display()
            ))
        })?;
        Ok(Box::new(RuleTreeEvaluator::new(tree, config.mode())))
    }
}

/// Mapping state of one thread.
pub struct SandboxContext {
    session: Arc<Session>,
    factory: Arc<dyn EvaluatorFactory>,
    evaluator: LocalOnceCell<RefCell<Box<dyn RuleEvaluator>>>,
    binary_name: String,
}

impl SandboxContext {
    pub fn new(session: Arc<Session>, factory: Arc<dyn EvaluatorFactory>) -> Self {
        Self {
            session,
            factory,
            evaluator: LocalOnceCell::new(),
            binary_name: current_binary_name(),
        }
    }

    pub fn with_binary_name(mut self, name: impl Into<String>) -> Self {
        self.binary_name = name.into();
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn binary_name(&self) -> &str {
        &self.binary_name
    }

    /// The evaluator, created on first use.
    fn evaluator(&self) -> Result<&RefCell<Box<dyn RuleEvaluator>>> {
        self.evaluator.get_or_try_init(|| {
            let config = self.session.config();
            log_mapping_info!("Loading '{}'", config.evaluator_entry_point().display());
            let evaluator = self.factory.create(config, self.session.ruletree()?)?;
            let version = evaluator.interface_version();
            if version != MAPPING_INTERFACE_VERSION {
                return Err(ContextError::InterfaceVersion {
                    found: version.to_string(),
                    expected: MAPPING_INTERFACE_VERSION,
                });
            }
            log_mapping_info!("evaluator initialized.");
            Ok(RefCell::new(evaluator))
        })
    }

    fn call<'a>(&'a self, func_name: &'a str) -> MappingCall<'a> {
        MappingCall {
            binary_name: &self.binary_name,
            func_name,
        }
    }

    pub fn get_mapping_requirements(&self, func_name: &str, virtual_path: &str) -> Result<MappingRequirements> {
        let mut ev = self.evaluator()?.borrow_mut();
        Ok(protocol::get_mapping_requirements(
            ev.as_mut(),
            self.call(func_name),
            virtual_path,
        ))
    }

    pub fn translate_path(
        &self,
        rule: &MappingRule,
        func_name: &str,
        virtual_path: &str,
    ) -> Result<Option<Translation>> {
        let level = self.session.config().settings.mapping.result_log_level;
        let mut ev = self.evaluator()?.borrow_mut();
        Ok(protocol::translate_path(
            ev.as_mut(),
            rule,
            self.call(func_name),
            virtual_path,
            level,
        ))
    }

    pub fn map_path(&self, func_name: &str, virtual_path: &str) -> Result<Option<Translation>> {
        let level = self.session.config().settings.mapping.result_log_level;
        let mut ev = self.evaluator()?.borrow_mut();
        Ok(protocol::map_path(ev.as_mut(), self.call(func_name), virtual_path, level))
    }

    pub fn reverse_path(&self, func_name: &str, host_path: &str) -> Result<Option<String>> {
        let mut ev = self.evaluator()?.borrow_mut();
        Ok(protocol::reverse_path(ev.as_mut(), self.call(func_name), host_path))
    }
}

fn current_binary_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_default()
}

static PROCESS_SESSION: OnceCell<Arc<Session>> = OnceCell::new();

thread_local! {
    static THREAD_CONTEXT: LocalOnceCell<SandboxContext> = const { LocalOnceCell::new() };
}

/// Run `f` with this thread's context, creating it on first use from the
/// process session (`SBOX_SESSION_DIR`). Without a session the process
/// cannot continue and exits.
pub fn with_thread_context<R>(f: impl FnOnce(&SandboxContext) -> R) -> R {
    let session = match PROCESS_SESSION.get_or_try_init(Session::from_env) {
        Ok(session) => Arc::clone(session),
        Err(e) => fatal(&e),
    };
    THREAD_CONTEXT.with(|cell| {
        let ctx = cell.get_or_init(|| {
            log_mapping_debug!("creating thread context");
            SandboxContext::new(session, Arc::new(RuleTreeEvaluatorFactory))
        });
        f(ctx)
    })
}

/// Report an unrecoverable error and exit.
pub fn fatal(err: &ContextError) -> ! {
    log_mapping_error!("FATAL: {}", err);
    eprintln!("sbx: FATAL: {err}");
    std::process::exit(err.exit_code())
}

/// Unwrap a context result, exiting on fatal errors.
pub fn or_fatal<T>(result: Result<T>) -> T {
    result.unwrap_or_else(|e| fatal(&e))
}

impl ContextError {
    /// Process exit status for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            ContextError::RuleTree(RuleTreeError::VersionMismatch { .. }) => 44,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluator::{ReverseOutcome, TranslateOutcome};
    use crate::ruletree_eval::FS_RULES_NAME;
    use sbx_config::testing::TestEnvironment;
    use sbx_ruletree::{Action, FsRule, Selector};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn write_rules(env: &TestEnvironment) {
        let cfg = env.session_config();
        let (tree, _) = RuleTree::attach(&cfg.ruletree_path(), true, true).unwrap();
        let rule = tree
            .add_rule(&FsRule::new(Selector::Dir("/".into()), Action::MapTo("/target".into())))
            .unwrap();
        let list = tree.create_list(1).unwrap();
        tree.list_set(list, 0, rule).unwrap();
        tree.set_fsrules(cfg.mode(), FS_RULES_NAME, list).unwrap();
    }

    #[test]
    fn test_context_maps_with_builtin_evaluator() {
        let env = TestEnvironment::new().unwrap();
        write_rules(&env);

        let session = Session::new(env.session_config());
        let ctx = SandboxContext::new(session, Arc::new(RuleTreeEvaluatorFactory)).with_binary_name("sh");
        let t = ctx.map_path("open", "/etc/hosts").unwrap().unwrap();
        assert_eq!(t.host_path, "/target/etc/hosts");
        assert_eq!(ctx.reverse_path("getcwd", "/target/etc").unwrap().as_deref(), Some("/etc"));
    }

    #[test]
    fn test_missing_ruletree_fails_bootstrap() {
        let env = TestEnvironment::new().unwrap();
        let session = Session::new(env.session_config());
        assert!(session.ruletree().unwrap().is_none());

        let ctx = SandboxContext::new(session, Arc::new(RuleTreeEvaluatorFactory));
        let err = ctx.map_path("open", "/x").unwrap_err();
        assert!(matches!(err, ContextError::EvaluatorBootstrap(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[test]
    fn test_version_mismatch_exit_code() {
        let env = TestEnvironment::new().unwrap();
        let path = env.session_config().ruletree_path();
        RuleTree::attach(&path, true, true).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[8..12].copy_from_slice(&99u32.to_ne_bytes());
        std::fs::write(&path, &bytes).unwrap();

        let session = Session::new(env.session_config());
        let err = session.ruletree().unwrap_err();
        assert_eq!(err.exit_code(), 44);
    }

    struct WrongVersion;

    impl RuleEvaluator for WrongVersion {
        fn interface_version(&self) -> &str {
            "lua-2.0"
        }
        fn get_mapping_requirements(&mut self, _: &str, _: &str, _: &str) -> MappingRequirements {
            MappingRequirements::default()
        }
        fn translate_path(&mut self, _: &MappingRule, _: &str, _: &str, _: &str) -> TranslateOutcome {
            TranslateOutcome::default()
        }
        fn reverse_path(&mut self, _: &str, _: &str, _: &str) -> ReverseOutcome {
            ReverseOutcome::default()
        }
    }

    #[test]
    fn test_interface_version_is_checked() {
        let env = TestEnvironment::new().unwrap();
        let factory = |_: &SessionConfig, _: Option<Arc<RuleTree>>| -> Result<Box<dyn RuleEvaluator>> {
            Ok(Box::new(WrongVersion))
        };
        let ctx = SandboxContext::new(Session::new(env.session_config()), Arc::new(factory));
        assert!(matches!(
            ctx.reverse_path("f", "/x"),
            Err(ContextError::InterfaceVersion { .. })
        ));
    }

    #[test]
    fn test_evaluator_created_once() {
        static CREATED: AtomicUsize = AtomicUsize::new(0);
        let env = TestEnvironment::new().unwrap();
        write_rules(&env);

        let factory = |cfg: &SessionConfig, tree: Option<Arc<RuleTree>>| -> Result<Box<dyn RuleEvaluator>> {
            CREATED.fetch_add(1, Ordering::SeqCst);
            RuleTreeEvaluatorFactory.create(cfg, tree)
        };
        let session = Session::new(env.session_config());
        let ctx = SandboxContext::new(Arc::clone(&session), Arc::new(factory));
        for _ in 0..3 {
            ctx.map_path("open", "/a").unwrap();
        }
        assert_eq!(CREATED.load(Ordering::SeqCst), 1);

        // A second context on the same session shares the rule tree
        let tree_a = session.ruletree().unwrap().unwrap();
        let tree_b = session.ruletree().unwrap().unwrap();
        assert!(Arc::ptr_eq(&tree_a, &tree_b));
    }
}
