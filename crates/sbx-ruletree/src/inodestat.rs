//! Simulated inode attributes ("inodesimu").
//!
//! One record per (device, inode) pair, found through the catalog
//! `vperm.<dev>` / `<ino>` (both lower-case hex). Records are created on
//! first use and never removed; clearing only resets the active mask.
//!
//! Only the permission store owner writes these records. Readers in other
//! processes use a sequence lock on `generation` to get a consistent
//! snapshot without blocking the writer.

use crate::layout::*;
use crate::{Result, RuleTree, RuleTreeError};
use sbx_config::{log_ruletree_debug, log_ruletree_trace, log_ruletree_warn};
use std::mem::offset_of;
use std::sync::atomic::{fence, AtomicU32, AtomicU64, Ordering};

const SEQLOCK_SPIN: u32 = 64;
/// Yields before a reader gives up on a record whose writer never finished.
const SEQLOCK_MAX_YIELDS: u32 = 4096;

const S_IFMT: u32 = 0o170000;
const S_ISUID: u32 = 0o4000;
const S_ISGID: u32 = 0o2000;

/// Decoded snapshot of a simulated inode record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InodeSimu {
    pub dev: u64,
    pub ino: u64,
    /// INODESIMU_* bits
    pub active_fields: u32,
    pub uid: u32,
    pub gid: u32,
    /// Permission bits without SUID/SGID
    pub mode: u32,
    /// Simulated S_ISUID/S_ISGID bits
    pub suid_sgid: u32,
    /// File type and permissions of a simulated device node
    pub devmode: u32,
    pub rdev: u64,
}

impl InodeSimu {
    pub fn has(&self, field: u32) -> bool {
        self.active_fields & field != 0
    }

    pub fn is_active(&self) -> bool {
        self.active_fields != 0
    }
}

/// Mutable slots of one record in the mapping.
struct Slots<'a> {
    generation: &'a AtomicU64,
    active_fields: &'a AtomicU32,
    uid: &'a AtomicU32,
    gid: &'a AtomicU32,
    mode: &'a AtomicU32,
    suid_sgid: &'a AtomicU32,
    devmode: &'a AtomicU32,
    rdev: &'a AtomicU64,
}

impl Slots<'_> {
    fn load(&self, snap: &mut InodeSimu) {
        snap.active_fields = self.active_fields.load(Ordering::Relaxed);
        snap.uid = self.uid.load(Ordering::Relaxed);
        snap.gid = self.gid.load(Ordering::Relaxed);
        snap.mode = self.mode.load(Ordering::Relaxed);
        snap.suid_sgid = self.suid_sgid.load(Ordering::Relaxed);
        snap.devmode = self.devmode.load(Ordering::Relaxed);
        snap.rdev = self.rdev.load(Ordering::Relaxed);
    }

    fn store(&self, snap: &InodeSimu) {
        self.active_fields.store(snap.active_fields, Ordering::Relaxed);
        self.uid.store(snap.uid, Ordering::Relaxed);
        self.gid.store(snap.gid, Ordering::Relaxed);
        self.mode.store(snap.mode, Ordering::Relaxed);
        self.suid_sgid.store(snap.suid_sgid, Ordering::Relaxed);
        self.devmode.store(snap.devmode, Ordering::Relaxed);
        self.rdev.store(snap.rdev, Ordering::Relaxed);
    }
}

fn inodestat_catalog(dev: u64) -> String {
    format!("vperm.{dev:x}")
}

fn inodestat_key(ino: u64) -> String {
    format!("{ino:x}")
}

impl RuleTree {
    fn inode_slots(&self, offset: ObjectOffset) -> Option<Slots<'_>> {
        let u32_at = |field| self.slot_u32::<InodeSimuRecord>(offset, field);
        let u64_at = |field| self.slot_u64::<InodeSimuRecord>(offset, field);
        Some(Slots {
            generation: u64_at(offset_of!(InodeSimuRecord, generation))?,
            active_fields: u32_at(offset_of!(InodeSimuRecord, active_fields))?,
            uid: u32_at(offset_of!(InodeSimuRecord, uid))?,
            gid: u32_at(offset_of!(InodeSimuRecord, gid))?,
            mode: u32_at(offset_of!(InodeSimuRecord, mode))?,
            suid_sgid: u32_at(offset_of!(InodeSimuRecord, suid_sgid))?,
            devmode: u32_at(offset_of!(InodeSimuRecord, devmode))?,
            rdev: u64_at(offset_of!(InodeSimuRecord, rdev))?,
        })
    }

    fn active_counter(&self) -> Option<&AtomicU64> {
        self.slot_u64::<FileHeader>(0, offset_of!(FileHeader, active_inodestats))
    }

    /// Records with a non-empty active mask. Gates skip all bookkeeping
    /// while this is 0.
    pub fn num_active_inodestats(&self) -> u64 {
        self.active_counter()
            .map(|c| c.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    fn inodestat_offset(&self, dev: u64, ino: u64) -> Option<ObjectOffset> {
        self.catalog_get(&inodestat_catalog(dev), &inodestat_key(ino))
    }

    /// Consistent snapshot of the record for (dev, ino), if one exists.
    ///
    /// Returns `None` when the generation stays odd for too long, e.g. the
    /// writer died mid-update. Callers then see the real attributes.
    pub fn find_inodestat(&self, dev: u64, ino: u64) -> Option<InodeSimu> {
        let offset = self.inodestat_offset(dev, ino)?;
        let slots = self.inode_slots(offset)?;
        let mut snap = InodeSimu {
            dev,
            ino,
            ..InodeSimu::default()
        };

        let mut spins = 0u32;
        loop {
            let before = slots.generation.load(Ordering::Acquire);
            if before % 2 == 0 {
                slots.load(&mut snap);
                fence(Ordering::Acquire);
                if slots.generation.load(Ordering::Relaxed) == before {
                    log_ruletree_trace!(dev, ino, active = snap.active_fields, "find_inodestat");
                    return Some(snap);
                }
            }
            spins += 1;
            if spins % SEQLOCK_SPIN == 0 {
                if spins / SEQLOCK_SPIN >= SEQLOCK_MAX_YIELDS {
                    log_ruletree_warn!(dev, ino, generation = before, "inodestat stuck mid-update, ignoring record");
                    return None;
                }
                std::thread::yield_now();
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Apply `f` to the record for (dev, ino) under the sequence lock.
    ///
    /// Without `create`, a missing record is left missing. Keeps the
    /// header's active counter in step with the record's active mask.
    fn update_inodestat(
        &self,
        dev: u64,
        ino: u64,
        create: bool,
        f: impl FnOnce(&mut InodeSimu),
    ) -> Result<()> {
        let offset = match self.inodestat_offset(dev, ino) {
            Some(offset) => offset,
            None if !create => {
                log_ruletree_trace!(dev, ino, "no inodestat to update");
                return Ok(());
            }
            None => {
                let record = InodeSimuRecord {
                    obj: ObjectHeader::new(ObjectType::InodeSimu),
                    dev,
                    ino,
                    generation: 0,
                    active_fields: 0,
                    uid: 0,
                    gid: 0,
                    mode: 0,
                    suid_sgid: 0,
                    devmode: 0,
                    rdev: 0,
                };
                let offset = self.append_record(&record, &[])?;
                self.catalog_set(&inodestat_catalog(dev), &inodestat_key(ino), offset)?;
                log_ruletree_debug!(dev, ino, offset, "created inodestat");
                offset
            }
        };
        if !self.is_writable() {
            return Err(RuleTreeError::ReadOnly);
        }
        let not_found = RuleTreeError::NotFound {
            offset,
            expected: ObjectType::InodeSimu,
        };
        let slots = self.inode_slots(offset).ok_or(not_found)?;

        slots.generation.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);

        let mut snap = InodeSimu {
            dev,
            ino,
            ..InodeSimu::default()
        };
        slots.load(&mut snap);
        let was_active = snap.is_active();
        f(&mut snap);
        slots.store(&snap);

        slots.generation.fetch_add(1, Ordering::Release);

        if let Some(counter) = self.active_counter() {
            match (was_active, snap.is_active()) {
                (false, true) => {
                    counter.fetch_add(1, Ordering::AcqRel);
                }
                (true, false) => {
                    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        Some(n.saturating_sub(1))
                    });
                }
                _ => {}
            }
        }
        log_ruletree_debug!(dev, ino, active = snap.active_fields, "inodestat updated");
        Ok(())
    }

    /// Override the owner and/or group.
    pub fn set_ids(
        &self,
        dev: u64,
        ino: u64,
        set_uid: bool,
        uid: u32,
        set_gid: bool,
        gid: u32,
    ) -> Result<()> {
        if !set_uid && !set_gid {
            return Ok(());
        }
        self.update_inodestat(dev, ino, true, |s| {
            if set_uid {
                s.uid = uid;
                s.active_fields |= INODESIMU_UID;
            }
            if set_gid {
                s.gid = gid;
                s.active_fields |= INODESIMU_GID;
            }
        })
    }

    /// Drop the owner and/or group overrides.
    pub fn release_ids(&self, dev: u64, ino: u64, release_uid: bool, release_gid: bool) -> Result<()> {
        self.update_inodestat(dev, ino, false, |s| {
            if release_uid {
                s.active_fields &= !INODESIMU_UID;
            }
            if release_gid {
                s.active_fields &= !INODESIMU_GID;
            }
        })
    }

    /// Override the permission bits; `suid_sgid` holds the simulated
    /// S_ISUID/S_ISGID bits (0 = none).
    pub fn set_mode(
        &self,
        dev: u64,
        ino: u64,
        real_mode: u32,
        virt_mode: u32,
        suid_sgid: u32,
    ) -> Result<()> {
        log_ruletree_trace!(dev, ino, real_mode, virt_mode, suid_sgid, "set_mode");
        self.update_inodestat(dev, ino, true, |s| {
            s.mode = virt_mode & !(S_IFMT | S_ISUID | S_ISGID);
            s.active_fields |= INODESIMU_MODE;
            s.suid_sgid = suid_sgid & (S_ISUID | S_ISGID);
            if s.suid_sgid != 0 {
                s.active_fields |= INODESIMU_SUIDSGID;
            } else {
                s.active_fields &= !INODESIMU_SUIDSGID;
            }
        })
    }

    pub fn release_mode(&self, dev: u64, ino: u64) -> Result<()> {
        self.update_inodestat(dev, ino, false, |s| {
            s.active_fields &= !(INODESIMU_MODE | INODESIMU_SUIDSGID);
        })
    }

    /// Turn the placeholder file (dev, ino) into a simulated device node.
    /// `mode` carries the file type (S_IFCHR or S_IFBLK) and permissions.
    pub fn set_dev_node(&self, dev: u64, ino: u64, mode: u32, rdev: u64) -> Result<()> {
        self.update_inodestat(dev, ino, true, |s| {
            s.devmode = mode;
            s.rdev = rdev;
            s.mode = mode & 0o7777 & !(S_ISUID | S_ISGID);
            s.active_fields |= INODESIMU_DEVNODE | INODESIMU_MODE;
        })
    }

    /// Forget every override of (dev, ino).
    pub fn clear_inodestat(&self, dev: u64, ino: u64) -> Result<()> {
        self.update_inodestat(dev, ino, false, |s| {
            s.active_fields = 0;
        })
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
    fn test_missing_record() {
        let (_temp, tree) = tree();
        assert_eq!(tree.find_inodestat(1, 2), None);
        assert_eq!(tree.num_active_inodestats(), 0);
    }

    #[test]
    fn test_set_ids_creates_and_counts() {
        let (_temp, tree) = tree();
        tree.set_ids(0x801, 42, true, 0, false, 0).unwrap();

        let s = tree.find_inodestat(0x801, 42).unwrap();
        assert!(s.has(INODESIMU_UID));
        assert!(!s.has(INODESIMU_GID));
        assert_eq!(s.uid, 0);
        assert_eq!(tree.num_active_inodestats(), 1);

        tree.set_ids(0x801, 42, false, 0, true, 5).unwrap();
        let s = tree.find_inodestat(0x801, 42).unwrap();
        assert!(s.has(INODESIMU_UID | INODESIMU_GID));
        assert_eq!(s.gid, 5);
        assert_eq!(tree.num_active_inodestats(), 1);

        assert!(tree.catalog_get("vperm.801", "2a").is_some());
    }

    #[test]
    fn test_release_ids_deactivates() {
        let (_temp, tree) = tree();
        tree.set_ids(1, 1, true, 0, true, 0).unwrap();
        tree.release_ids(1, 1, true, false).unwrap();
        assert_eq!(tree.num_active_inodestats(), 1);
        tree.release_ids(1, 1, false, true).unwrap();

        let s = tree.find_inodestat(1, 1).unwrap();
        assert!(!s.is_active());
        assert_eq!(tree.num_active_inodestats(), 0);
    }

    #[test]
    fn test_release_without_record_creates_nothing() {
        let (_temp, tree) = tree();
        let size = tree.file_size();
        tree.release_ids(3, 3, true, true).unwrap();
        tree.release_mode(3, 3).unwrap();
        tree.clear_inodestat(3, 3).unwrap();
        assert_eq!(tree.file_size(), size);
        assert_eq!(tree.find_inodestat(3, 3), None);
    }

    #[test]
    fn test_set_mode_tracks_suid_sgid() {
        let (_temp, tree) = tree();
        tree.set_mode(1, 7, 0o100644, 0o100755, S_ISUID).unwrap();
        let s = tree.find_inodestat(1, 7).unwrap();
        assert_eq!(s.mode, 0o755);
        assert!(s.has(INODESIMU_MODE | INODESIMU_SUIDSGID));
        assert_eq!(s.suid_sgid, S_ISUID);

        tree.set_mode(1, 7, 0o100644, 0o600, 0).unwrap();
        let s = tree.find_inodestat(1, 7).unwrap();
        assert_eq!(s.mode, 0o600);
        assert!(!s.has(INODESIMU_SUIDSGID));

        tree.release_mode(1, 7).unwrap();
        assert!(!tree.find_inodestat(1, 7).unwrap().is_active());
        assert_eq!(tree.num_active_inodestats(), 0);
    }

    #[test]
    fn test_dev_node() {
        let (_temp, tree) = tree();
        let chr = 0o020000;
        tree.set_dev_node(2, 9, chr | 0o4660, 0x0501).unwrap();
        let s = tree.find_inodestat(2, 9).unwrap();
        assert!(s.has(INODESIMU_DEVNODE | INODESIMU_MODE));
        assert_eq!(s.devmode, chr | 0o4660);
        assert_eq!(s.mode, 0o660);
        assert_eq!(s.rdev, 0x0501);
    }

    #[test]
    fn test_clear_resets_and_reuses_record() {
        let (_temp, tree) = tree();
        tree.set_ids(4, 4, true, 0, true, 0).unwrap();
        tree.set_mode(4, 4, 0o644, 0o600, 0).unwrap();
        tree.clear_inodestat(4, 4).unwrap();
        assert_eq!(tree.num_active_inodestats(), 0);
        assert!(!tree.find_inodestat(4, 4).unwrap().is_active());

        // Inode number reused by a new file
        let size = tree.file_size();
        tree.set_ids(4, 4, false, 0, true, 100).unwrap();
        assert_eq!(tree.file_size(), size);
        assert_eq!(tree.num_active_inodestats(), 1);
    }

    #[test]
    fn test_reader_sees_writer_updates() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rt");
        let (writer, _) = RuleTree::attach(&path, true, true).unwrap();
        let (reader, _) = RuleTree::attach(&path, false, false).unwrap();

        writer.set_ids(8, 8, true, 1000, false, 0).unwrap();
        assert_eq!(reader.find_inodestat(8, 8).unwrap().uid, 1000);
        assert_eq!(reader.num_active_inodestats(), 1);

        writer.set_ids(8, 8, true, 0, false, 0).unwrap();
        assert_eq!(reader.find_inodestat(8, 8).unwrap().uid, 0);

        assert!(matches!(
            reader.set_ids(8, 8, true, 1, false, 0),
            Err(RuleTreeError::ReadOnly)
        ));
    }

    #[test]
    fn test_concurrent_reads_stay_consistent() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rt");
        let (writer, _) = RuleTree::attach(&path, true, true).unwrap();
        writer.set_ids(5, 5, true, 0, true, 0).unwrap();

        let reader_path = path.clone();
        let reader = std::thread::spawn(move || {
            let (reader, _) = RuleTree::attach(&reader_path, false, false).unwrap();
            for _ in 0..2000 {
                let s = reader.find_inodestat(5, 5).unwrap();
                // uid and gid are always written together
                assert_eq!(s.uid, s.gid);
            }
        });
        for i in 0..2000 {
            writer.set_ids(5, 5, true, i, true, i).unwrap();
        }
        reader.join().unwrap();
    }

    #[test]
    fn test_stuck_writer_does_not_hang_reader() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("rt");
        let (writer, _) = RuleTree::attach(&path, true, true).unwrap();
        writer.set_ids(1, 2, true, 0, false, 0).unwrap();

        // A writer that died between the two generation bumps
        let offset = writer.inodestat_offset(1, 2).unwrap();
        writer
            .inode_slots(offset)
            .unwrap()
            .generation
            .fetch_add(1, Ordering::AcqRel);

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let (reader, _) = RuleTree::attach(&path, false, false).unwrap();
            let _ = tx.send(reader.find_inodestat(1, 2));
        });
        let found = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("find_inodestat did not return");
        assert_eq!(found, None);
    }
}
