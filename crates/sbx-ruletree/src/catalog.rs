//! Catalogs: named association lists stored as singly linked entries.
//!
//! The root catalog hangs off the file header. Each root entry names a
//! sub-catalog and its value is the head of that sub-catalog's list, giving
//! a two-level namespace `catalog_name -> object_name -> value`.
//!
//! Entries are never removed or reordered. Lookup returns the first entry
//! with a matching name, so when a caller bypasses `catalog_set` and appends
//! a duplicate name directly, the older entry keeps shadowing it.

use crate::layout::{CatalogEntry, FileHeader, ObjectHeader, ObjectOffset, ObjectType};
use crate::{Result, RuleTree, RuleTreeError};
use sbx_config::{log_ruletree_debug, log_ruletree_trace};
use std::mem::offset_of;
use std::sync::atomic::{AtomicU64, Ordering};

/// One entry as seen by `CatalogIter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogItem<'a> {
    pub offset: ObjectOffset,
    pub name: Option<&'a str>,
    pub value: ObjectOffset,
}

/// Forward traversal of one catalog list.
///
/// Stops at the end of the list or at the first invalid entry. Entries are
/// always appended after their predecessor, so a `next` link pointing
/// backwards is treated as corruption and ends the walk.
pub struct CatalogIter<'a> {
    tree: &'a RuleTree,
    next: ObjectOffset,
}

impl<'a> Iterator for CatalogIter<'a> {
    type Item = CatalogItem<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next;
        if offset == 0 {
            return None;
        }
        let Some(entry) = self.tree.catalog_entry(offset) else {
            log_ruletree_debug!(offset, "not a catalog entry");
            self.next = 0;
            return None;
        };
        self.next = if entry.next > offset { entry.next } else { 0 };
        Some(CatalogItem {
            offset,
            name: if entry.name == 0 {
                None
            } else {
                self.tree.string_at(entry.name)
            },
            value: entry.value,
        })
    }
}

impl RuleTree {
    /// Snapshot of the entry at `offset`, links read atomically.
    fn catalog_entry(&self, offset: ObjectOffset) -> Option<CatalogEntry> {
        let mut entry = self.record::<CatalogEntry>(offset)?;
        entry.value = self.entry_value_slot(offset)?.load(Ordering::Acquire);
        entry.next = self.entry_next_slot(offset)?.load(Ordering::Acquire);
        Some(entry)
    }

    fn entry_value_slot(&self, offset: ObjectOffset) -> Option<&AtomicU64> {
        self.slot_u64::<CatalogEntry>(offset, offset_of!(CatalogEntry, value))
    }

    fn entry_next_slot(&self, offset: ObjectOffset) -> Option<&AtomicU64> {
        self.slot_u64::<CatalogEntry>(offset, offset_of!(CatalogEntry, next))
    }

    fn root_catalog_slot(&self) -> Option<&AtomicU64> {
        self.slot_u64::<FileHeader>(0, offset_of!(FileHeader, root_catalog))
    }

    /// Head of the root catalog, 0 if none.
    pub fn root_catalog(&self) -> ObjectOffset {
        self.root_catalog_slot()
            .map(|slot| slot.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Iterate a catalog list starting at `head`.
    pub fn catalog_iter(&self, head: ObjectOffset) -> CatalogIter<'_> {
        CatalogIter {
            tree: self,
            next: head,
        }
    }

    /// Entries of the sub-catalog `catalog_name`, in list order.
    pub fn catalog_entries(&self, catalog_name: &str) -> Vec<CatalogItem<'_>> {
        match self.find_entry(self.root_catalog(), catalog_name) {
            Some(cat) => self.catalog_iter(cat.value).collect(),
            None => Vec::new(),
        }
    }

    /// First entry named `name` in the list starting at `head`.
    pub fn find_entry(&self, head: ObjectOffset, name: &str) -> Option<CatalogItem<'_>> {
        self.catalog_iter(head).find(|item| item.name == Some(name))
    }

    fn new_entry(&self, name: Option<&str>, value: ObjectOffset) -> Result<ObjectOffset> {
        let name = self.append_opt_string(name)?;
        let entry = CatalogEntry {
            obj: ObjectHeader::new(ObjectType::CatalogEntry),
            name,
            value,
            next: 0,
        };
        self.append_record(&entry, &[])
    }

    /// Append a new entry at the end of the list starting at `head`.
    ///
    /// No duplicate check is done here; use `catalog_set` for find-or-create.
    pub fn append_catalog_entry(
        &self,
        head: ObjectOffset,
        name: Option<&str>,
        value: ObjectOffset,
    ) -> Result<ObjectOffset> {
        let not_a_catalog = RuleTreeError::NotFound {
            offset: head,
            expected: ObjectType::CatalogEntry,
        };
        let tail = self.catalog_iter(head).last().ok_or(not_a_catalog)?;
        let entry = self.new_entry(name, value)?;
        if let Some(next) = self.entry_next_slot(tail.offset) {
            next.store(entry, Ordering::Release);
        }
        log_ruletree_trace!(tail = tail.offset, entry, "linked catalog entry");
        Ok(entry)
    }

    /// Two-level lookup. `None` on any failure.
    pub fn catalog_get(&self, catalog_name: &str, object_name: &str) -> Option<ObjectOffset> {
        log_ruletree_trace!(catalog_name, object_name, "catalog_get");
        let root = self.root_catalog();
        if root == 0 {
            log_ruletree_trace!("catalog_get: no root catalog");
            return None;
        }
        let cat = self.find_entry(root, catalog_name)?;
        if cat.value == 0 {
            log_ruletree_trace!("catalog_get: nothing in the subcatalog");
            return None;
        }
        let item = self.find_entry(cat.value, object_name)?;
        log_ruletree_trace!(value = item.value, "catalog_get: found");
        (item.value != 0).then_some(item.value)
    }

    /// Find-or-create `catalog_name -> object_name` and set its value.
    pub fn catalog_set(&self, catalog_name: &str, object_name: &str, value: ObjectOffset) -> Result<()> {
        log_ruletree_debug!(catalog_name, object_name, value, "catalog_set");
        let root_slot = self.root_catalog_slot().ok_or(RuleTreeError::NotFound {
            offset: 0,
            expected: ObjectType::FileHeader,
        })?;

        let root = root_slot.load(Ordering::Acquire);
        let cat_offset = if root == 0 {
            log_ruletree_debug!(catalog_name, "catalog_set: create root catalog");
            let entry = self.new_entry(Some(catalog_name), 0)?;
            root_slot.store(entry, Ordering::Release);
            entry
        } else {
            match self.find_entry(root, catalog_name) {
                Some(cat) => cat.offset,
                None => self.append_catalog_entry(root, Some(catalog_name), 0)?,
            }
        };

        let cat_value = self.entry_value_slot(cat_offset).ok_or(RuleTreeError::NotFound {
            offset: cat_offset,
            expected: ObjectType::CatalogEntry,
        })?;
        let head = cat_value.load(Ordering::Acquire);
        if head == 0 {
            log_ruletree_debug!(object_name, value, "catalog_set: add first entry");
            let entry = self.new_entry(Some(object_name), value)?;
            cat_value.store(entry, Ordering::Release);
            return Ok(());
        }

        match self.find_entry(head, object_name) {
            Some(item) => {
                let slot = self.entry_value_slot(item.offset).ok_or(RuleTreeError::NotFound {
                    offset: item.offset,
                    expected: ObjectType::CatalogEntry,
                })?;
                slot.store(value, Ordering::Release);
            }
            None => {
                self.append_catalog_entry(head, Some(object_name), value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::RuleTree;
    use tempfile::tempdir;

    fn tree() -> (tempfile::TempDir, RuleTree) {
        let temp = tempdir().unwrap();
        let (tree, _) = RuleTree::attach(&temp.path().join("rt"), true, true).unwrap();
        (temp, tree)
    }

    #[test]
    fn test_set_then_get() {
        let (_temp, tree) = tree();
        let a = tree.append_string("a").unwrap();
        let b = tree.append_string("b").unwrap();
        let c = tree.append_string("c").unwrap();

        tree.catalog_set("fs_rules.Default", "main", a).unwrap();
        tree.catalog_set("fs_rules.Default", "extra", b).unwrap();
        tree.catalog_set("exec_rules", "main", c).unwrap();

        assert_eq!(tree.catalog_get("fs_rules.Default", "main"), Some(a));
        assert_eq!(tree.catalog_get("fs_rules.Default", "extra"), Some(b));
        assert_eq!(tree.catalog_get("exec_rules", "main"), Some(c));
        assert_eq!(tree.catalog_get("exec_rules", "extra"), None);
        assert_eq!(tree.catalog_get("nope", "main"), None);
    }

    #[test]
    fn test_get_on_empty_tree() {
        let (_temp, tree) = tree();
        assert_eq!(tree.root_catalog(), 0);
        assert_eq!(tree.catalog_get("any", "thing"), None);
        assert!(tree.catalog_entries("any").is_empty());
    }

    #[test]
    fn test_set_updates_in_place() {
        let (_temp, tree) = tree();
        tree.catalog_set("cat", "obj", 100).unwrap();
        let size_before = tree.file_size();
        tree.catalog_set("cat", "obj", 200).unwrap();

        assert_eq!(tree.catalog_get("cat", "obj"), Some(200));
        assert_eq!(tree.file_size(), size_before);
        assert_eq!(tree.catalog_entries("cat").len(), 1);
    }

    #[test]
    fn test_entries_keep_insertion_order() {
        let (_temp, tree) = tree();
        for (i, name) in ["one", "two", "three"].iter().enumerate() {
            tree.catalog_set("cat", name, (i as u64 + 1) * 8).unwrap();
        }
        let names: Vec<_> = tree
            .catalog_entries("cat")
            .iter()
            .map(|e| e.name.unwrap())
            .collect();
        assert_eq!(names, ["one", "two", "three"]);
    }

    #[test]
    fn test_first_duplicate_wins() {
        let (_temp, tree) = tree();
        tree.catalog_set("cat", "dup", 8).unwrap();
        let root = tree.root_catalog();
        let head = tree.find_entry(root, "cat").unwrap().value;

        tree.append_catalog_entry(head, Some("dup"), 16).unwrap();
        assert_eq!(tree.catalog_entries("cat").len(), 2);
        assert_eq!(tree.catalog_get("cat", "dup"), Some(8));

        // catalog_set keeps updating the first one
        tree.catalog_set("cat", "dup", 24).unwrap();
        assert_eq!(tree.catalog_get("cat", "dup"), Some(24));
        assert_eq!(tree.catalog_entries("cat")[1].value, 16);
    }

    #[test]
    fn test_anonymous_entries_are_skipped_by_lookup() {
        let (_temp, tree) = tree();
        tree.catalog_set("cat", "named", 8).unwrap();
        let head = tree.find_entry(tree.root_catalog(), "cat").unwrap().value;
        tree.append_catalog_entry(head, None, 16).unwrap();

        let entries = tree.catalog_entries("cat");
        assert_eq!(entries[1].name, None);
        assert_eq!(entries[1].value, 16);
        assert_eq!(tree.catalog_get("cat", "named"), Some(8));
    }

    #[test]
    fn test_reader_process_sees_catalog() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rt");
        let (writer, _) = RuleTree::attach(&path, true, true).unwrap();
        writer.catalog_set("cat", "obj", 8).unwrap();

        let (reader, _) = RuleTree::attach(&path, false, false).unwrap();
        assert_eq!(reader.catalog_get("cat", "obj"), Some(8));

        writer.catalog_set("cat", "later", 16).unwrap();
        assert_eq!(reader.catalog_get("cat", "later"), Some(16));
    }
}
