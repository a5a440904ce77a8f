//! Rule tree shared between the processes of one session: a rule compiler
//! writing rules, a permission store owner writing inode records, and
//! interposed processes whose attachments refuse writes.

use sbx_ruletree::layout::{INODESIMU_GID, INODESIMU_UID};
use sbx_ruletree::{Action, AttachOutcome, FsRule, RuleTree, RuleTreeError, Selector};
use tempfile::tempdir;

#[test]
fn test_attach_is_idempotent() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("RuleTree.bin");

    let (first, outcome) = RuleTree::attach(&path, true, true).unwrap();
    assert_eq!(outcome, AttachOutcome::Created);
    let size = first.file_size();

    let (second, outcome) = RuleTree::attach(&path, true, true).unwrap();
    assert_eq!(outcome, AttachOutcome::Attached);
    assert_eq!(second.file_size(), size);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), size);
}

#[test]
fn test_compiled_rules_visible_to_readers() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("RuleTree.bin");
    let (compiler, _) = RuleTree::attach(&path, true, true).unwrap();

    let rules = [
        FsRule::new(Selector::Dir("/proc".into()), Action::UseOrigPath),
        FsRule::new(Selector::Prefix("/usr".into()), Action::MapTo("/opt/tools".into())),
        FsRule {
            flags: 0o1,
            ..FsRule::new(Selector::Dir("/".into()), Action::MapTo("/opt/target".into()))
        },
    ];
    let list = compiler.create_list(rules.len() as u32).unwrap();
    for (i, rule) in rules.iter().enumerate() {
        let off = compiler.add_rule(rule).unwrap();
        compiler.list_set(list, i as u32, off).unwrap();
    }
    compiler.set_fsrules("Default", "fs_rules", list).unwrap();

    let (reader, _) = RuleTree::attach(&path, false, false).unwrap();
    let list = reader.fsrules("Default", "fs_rules").unwrap();
    let decoded: Vec<_> = reader
        .list_items(list)
        .into_iter()
        .map(|off| reader.rule_at(off).unwrap())
        .collect();
    assert_eq!(decoded, rules);
}

#[test]
fn test_inode_records_across_attachments() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("RuleTree.bin");
    let (owner, _) = RuleTree::attach(&path, true, true).unwrap();
    let (client, _) = RuleTree::attach(&path, false, false).unwrap();

    assert_eq!(client.num_active_inodestats(), 0);
    owner.set_ids(0x803, 1234, true, 0, true, 0).unwrap();

    let seen = client.find_inodestat(0x803, 1234).unwrap();
    assert!(seen.has(INODESIMU_UID | INODESIMU_GID));
    assert_eq!(client.num_active_inodestats(), 1);

    owner.clear_inodestat(0x803, 1234).unwrap();
    assert!(!client.find_inodestat(0x803, 1234).unwrap().is_active());
    assert_eq!(client.num_active_inodestats(), 0);
}

#[test]
fn test_version_mismatch_is_fatal() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("RuleTree.bin");
    RuleTree::attach(&path, true, true).unwrap();

    // Bump the on-disk version in place (offset 8, host byte order)
    let mut bytes = std::fs::read(&path).unwrap();
    let bumped = (sbx_ruletree::RULETREE_VERSION + 7).to_ne_bytes();
    bytes[8..12].copy_from_slice(&bumped);
    std::fs::write(&path, &bytes).unwrap();

    let err = RuleTree::attach(&path, true, true).unwrap_err();
    assert!(matches!(err, RuleTreeError::VersionMismatch { .. }));
    assert!(err.is_fatal());
}
