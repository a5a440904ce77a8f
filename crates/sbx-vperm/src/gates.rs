//! Gates for calls that change or report ownership and permissions.
//!
//! Every gate first runs the real call on the mapped path. A call that
//! fails with `EPERM` is simulated in the inode store and reported as a
//! success; every other failure is returned unchanged. After a successful
//! call the store is reconciled, but only while the session has active
//! records at all.

use crate::real::{Dir, FileStat, RealFs, Result, S_IFBLK, S_IFCHR, S_IFMT, S_ISGID, S_ISUID};
use crate::store::VpermStore;
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag};
use sbx_config::{log_vperm_debug, SessionConfig};
use sbx_ipc::VpermRequest;
use sbx_ruletree::layout::{
    INODESIMU_DEVNODE, INODESIMU_GID, INODESIMU_MODE, INODESIMU_SUIDSGID, INODESIMU_UID,
};
use sbx_ruletree::InodeSimu;
use std::os::unix::io::RawFd;
use std::path::Path;

const SUID_SGID: u32 = S_ISUID | S_ISGID;

/// Owner and group given to files the sandbox creates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VirtualOwner {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl VirtualOwner {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            uid: config.settings.vperm.virtual_uid,
            gid: config.settings.vperm.virtual_gid,
        }
    }

    pub fn is_active(&self) -> bool {
        self.uid.is_some() || self.gid.is_some()
    }

    /// Simulated effective ids; the real ones where nothing is simulated.
    pub fn effective_ids(&self) -> (u32, u32) {
        (
            self.uid.unwrap_or_else(|| nix::unistd::geteuid().as_raw()),
            self.gid.unwrap_or_else(|| nix::unistd::getegid().as_raw()),
        )
    }
}

/// Apply the overrides of `record` to a real stat result.
pub fn virtualize_stat(real: &FileStat, record: &InodeSimu) -> FileStat {
    let mut st = *real;
    if record.has(INODESIMU_UID) {
        st.uid = record.uid;
    }
    if record.has(INODESIMU_GID) {
        st.gid = record.gid;
    }
    if record.has(INODESIMU_MODE) {
        st.mode = (st.mode & (S_IFMT | SUID_SGID)) | (record.mode & !(S_IFMT | SUID_SGID));
    }
    if record.has(INODESIMU_SUIDSGID) {
        st.mode = (st.mode & !SUID_SGID) | (record.suid_sgid & SUID_SGID);
    } else if record.has(INODESIMU_MODE) {
        st.mode &= !SUID_SGID;
    }
    if record.has(INODESIMU_DEVNODE) {
        st.mode = (record.devmode & S_IFMT) | (st.mode & !S_IFMT);
        st.rdev = record.rdev;
    }
    st
}

/// What a gate operates on.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    At {
        dir: Dir,
        path: &'a Path,
        flags: AtFlags,
    },
    Fd(RawFd),
}

impl<'a> Target<'a> {
    fn path(path: &'a Path) -> Self {
        Target::At {
            dir: Dir::Cwd,
            path,
            flags: AtFlags::empty(),
        }
    }

    fn following(self) -> Self {
        match self {
            Target::At { dir, path, .. } => Target::At {
                dir,
                path,
                flags: AtFlags::empty(),
            },
            fd => fd,
        }
    }

    fn stat(self, fs: &impl RealFs) -> Result<FileStat> {
        match self {
            Target::At { dir, path, flags } => fs.stat_at(dir, path, flags),
            Target::Fd(fd) => fs.fstat(fd),
        }
    }
}

/// Translate a stdio mode string into open(2) flags.
pub fn fopen_flags(mode: &str) -> Result<OFlag> {
    let mut chars = mode.chars();
    let mut flags = match chars.next() {
        Some('r') => OFlag::O_RDONLY,
        Some('w') => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_TRUNC,
        Some('a') => OFlag::O_WRONLY | OFlag::O_CREAT | OFlag::O_APPEND,
        _ => return Err(Errno::EINVAL),
    };
    for c in chars {
        match c {
            '+' => {
                flags.remove(OFlag::O_RDONLY | OFlag::O_WRONLY);
                flags.insert(OFlag::O_RDWR);
            }
            'x' => flags.insert(OFlag::O_EXCL),
            'e' => flags.insert(OFlag::O_CLOEXEC),
            'b' | 't' | 'm' | 'c' => {}
            _ => return Err(Errno::EINVAL),
        }
    }
    Ok(flags)
}

/// The gates of one process. Paths handed to the gates are host paths,
/// already mapped.
pub struct VpermGates<F: RealFs, S: VpermStore> {
    real: F,
    store: S,
    owner: VirtualOwner,
}

impl<F: RealFs, S: VpermStore> VpermGates<F, S> {
    pub fn new(real: F, store: S, owner: VirtualOwner) -> Self {
        Self { real, store, owner }
    }

    pub fn real(&self) -> &F {
        &self.real
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn owner(&self) -> VirtualOwner {
        self.owner
    }

    fn active(&self) -> bool {
        self.store.num_active_inodestats() > 0
    }

    // =================== stat ===================

    /// Overlay the simulated attributes of `st`'s inode, if any.
    pub fn virtualize(&self, st: FileStat) -> FileStat {
        if !self.active() {
            return st;
        }
        match self.store.find_inodestat(st.dev, st.ino) {
            Some(rec) if rec.is_active() => virtualize_stat(&st, &rec),
            _ => st,
        }
    }

    pub fn stat(&self, path: &Path) -> Result<FileStat> {
        self.fstatat(Dir::Cwd, path, AtFlags::empty())
    }

    pub fn lstat(&self, path: &Path) -> Result<FileStat> {
        self.fstatat(Dir::Cwd, path, AtFlags::AT_SYMLINK_NOFOLLOW)
    }

    pub fn fstat(&self, fd: RawFd) -> Result<FileStat> {
        self.real.fstat(fd).map(|st| self.virtualize(st))
    }

    pub fn fstatat(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<FileStat> {
        self.real
            .stat_at(dir, path, flags)
            .map(|st| self.virtualize(st))
    }

    // =================== chown ===================

    pub fn chown(&self, path: &Path, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        self.chown_target("chown", Target::path(path), owner, group)
    }

    pub fn lchown(&self, path: &Path, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        let target = Target::At {
            dir: Dir::Cwd,
            path,
            flags: AtFlags::AT_SYMLINK_NOFOLLOW,
        };
        self.chown_target("lchown", target, owner, group)
    }

    pub fn fchown(&self, fd: RawFd, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        self.chown_target("fchown", Target::Fd(fd), owner, group)
    }

    pub fn fchownat(
        &self,
        dir: Dir,
        path: &Path,
        owner: Option<u32>,
        group: Option<u32>,
        flags: AtFlags,
    ) -> Result<()> {
        self.chown_target("fchownat", Target::At { dir, path, flags }, owner, group)
    }

    fn chown_target(
        &self,
        func: &'static str,
        target: Target<'_>,
        owner: Option<u32>,
        group: Option<u32>,
    ) -> Result<()> {
        let res = match target {
            Target::At { dir, path, flags } => self.real.chown_at(dir, path, owner, group, flags),
            Target::Fd(fd) => self.real.fchown(fd, owner, group),
        };
        match res {
            Ok(()) => {
                // A real owner change makes a matching override redundant.
                if self.active() {
                    if let Ok(st) = target.stat(&self.real) {
                        self.vperm_chown(func, &st, owner, group);
                    }
                }
                Ok(())
            }
            Err(Errno::EPERM) => {
                let st = target.stat(&self.real).map_err(|_| Errno::EPERM)?;
                self.vperm_chown(func, &st, owner, group);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Record the requested ids: an override where they differ from the
    /// real ones, a release where they match.
    fn vperm_chown(&self, func: &str, st: &FileStat, owner: Option<u32>, group: Option<u32>) {
        log_vperm_debug!(
            func,
            uid = st.uid,
            gid = st.gid,
            ?owner,
            ?group,
            "virtualize owner"
        );
        let set_uid = owner.is_some_and(|uid| uid != st.uid);
        let set_gid = group.is_some_and(|gid| gid != st.gid);
        let release_uid = owner.is_some_and(|uid| uid == st.uid);
        let release_gid = group.is_some_and(|gid| gid == st.gid);

        if set_uid || set_gid {
            self.store.submit(VpermRequest::SetIds {
                dev: st.dev,
                ino: st.ino,
                set_uid,
                uid: owner.unwrap_or(st.uid),
                set_gid,
                gid: group.unwrap_or(st.gid),
            });
        }
        if release_uid || release_gid {
            self.store.submit(VpermRequest::ReleaseIds {
                dev: st.dev,
                ino: st.ino,
                release_uid,
                release_gid,
            });
        }
    }

    // =================== chmod ===================

    pub fn chmod(&self, path: &Path, mode: u32) -> Result<()> {
        self.chmod_target("chmod", Target::path(path), mode)
    }

    pub fn fchmod(&self, fd: RawFd, mode: u32) -> Result<()> {
        self.chmod_target("fchmod", Target::Fd(fd), mode)
    }

    pub fn fchmodat(&self, dir: Dir, path: &Path, mode: u32, flags: AtFlags) -> Result<()> {
        self.chmod_target("fchmodat", Target::At { dir, path, flags }, mode)
    }

    fn chmod_target(&self, func: &'static str, target: Target<'_>, mode: u32) -> Result<()> {
        // SUID and SGID exist only in simulation.
        let suid_sgid = mode & SUID_SGID;
        let mode = mode & !SUID_SGID;

        if self.active() {
            if let Ok(st) = target.following().stat(&self.real) {
                if self.chmod_if_simulated_device(func, &st, mode, suid_sgid) {
                    return Ok(());
                }
            }
        }

        let res = match target {
            Target::At { dir, path, flags } => self.real.chmod_at(dir, path, mode, flags),
            Target::Fd(fd) => self.real.fchmod(fd, mode),
        };

        let update = match res {
            Ok(()) => suid_sgid != 0 || self.active(),
            Err(Errno::EPERM) => true,
            Err(_) => false,
        };
        if !update {
            return res;
        }
        match target.stat(&self.real) {
            Ok(st) => {
                self.vperm_chmod(func, &st, mode, suid_sgid);
                Ok(())
            }
            Err(stat_err) => Err(res.err().unwrap_or(stat_err)),
        }
    }

    /// The real mode of a simulated device node stays 0; only the
    /// simulated mode changes.
    fn chmod_if_simulated_device(&self, func: &str, st: &FileStat, mode: u32, suid_sgid: u32) -> bool {
        match self.store.find_inodestat(st.dev, st.ino) {
            Some(rec) if rec.has(INODESIMU_DEVNODE) => {
                log_vperm_debug!(func, "set mode of simulated device");
                self.vperm_chmod(func, st, mode, suid_sgid);
                true
            }
            _ => false,
        }
    }

    fn vperm_chmod(&self, func: &str, st: &FileStat, virt_mode: u32, suid_sgid: u32) {
        log_vperm_debug!(
            func,
            "virtualize stat (real mode=0{:o}, new virtual mode=0{:o}, suid/sgid=0{:o})",
            st.mode,
            virt_mode,
            suid_sgid
        );
        let perms = !(S_IFMT | SUID_SGID);
        if st.mode & perms != virt_mode & perms || st.mode & SUID_SGID != suid_sgid {
            self.store.submit(VpermRequest::SetMode {
                dev: st.dev,
                ino: st.ino,
                real_mode: st.mode,
                virt_mode: virt_mode & perms,
                suid_sgid: suid_sgid & SUID_SGID,
            });
        } else {
            self.store.submit(VpermRequest::ReleaseMode {
                dev: st.dev,
                ino: st.ino,
            });
        }
    }

    // =================== mknod ===================

    pub fn mknod(&self, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        self.mknodat(Dir::Cwd, path, mode, rdev)
    }

    pub fn mknodat(&self, dir: Dir, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        match self.real.mknod_at(dir, path, mode, rdev) {
            Ok(()) => {
                // The real inode is authoritative now.
                if self.active() {
                    if let Ok(st) = self.real.stat_at(dir, path, AtFlags::empty()) {
                        self.clear_all_if_virtualized("mknod", &st);
                    }
                }
                Ok(())
            }
            Err(Errno::EPERM) => self.simulate_mknod(dir, path, mode, rdev),
            Err(e) => Err(e),
        }
    }

    /// Create a placeholder file with no permissions and register it as a
    /// device node. Only character and block devices can be simulated.
    fn simulate_mknod(&self, dir: Dir, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        match mode & S_IFMT {
            S_IFCHR => log_vperm_debug!("Creating simulated character device node"),
            S_IFBLK => log_vperm_debug!("Creating simulated block device node"),
            other => {
                log_vperm_debug!("not a device node, can't simulate (type=0{:o})", other);
                return Err(Errno::EPERM);
            }
        }

        let flags = OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC;
        let fd = self.real.open_at(dir, path, flags, 0).map_err(|e| {
            log_vperm_debug!(path = %path.display(), error = %e, "failed to create as a file");
            Errno::EPERM
        })?;
        let st = self.real.fstat(fd);
        self.real.close(fd);
        let st = st.map_err(|_| Errno::EPERM)?;

        self.store.submit(VpermRequest::SetDevNode {
            dev: st.dev,
            ino: st.ino,
            mode,
            rdev,
        });
        Ok(())
    }

    // =================== removal ===================

    fn stat_if_active(&self, dir: Dir, path: &Path, flags: AtFlags) -> Option<FileStat> {
        if self.active() {
            self.real.stat_at(dir, path, flags).ok()
        } else {
            None
        }
    }

    pub fn unlink(&self, path: &Path) -> Result<()> {
        self.unlinkat(Dir::Cwd, path, AtFlags::empty())
    }

    pub fn unlinkat(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<()> {
        let before = self.stat_if_active(dir, path, AtFlags::empty());
        self.real.unlink_at(dir, path, flags)?;
        if let Some(st) = before {
            let last_link = if flags.contains(AtFlags::AT_REMOVEDIR) {
                true
            } else {
                st.nlink == 1
            };
            if last_link {
                self.clear_all_if_virtualized("unlinkat", &st);
            }
        }
        Ok(())
    }

    /// `unlink` for files, `rmdir` for directories.
    pub fn remove(&self, path: &Path) -> Result<()> {
        let before = self.stat_if_active(Dir::Cwd, path, AtFlags::empty());
        let res = match self.real.unlink_at(Dir::Cwd, path, AtFlags::empty()) {
            Err(Errno::EISDIR) => self.real.unlink_at(Dir::Cwd, path, AtFlags::AT_REMOVEDIR),
            other => other,
        };
        res?;
        if let Some(st) = before {
            if st.nlink == 1 || st.is_dir() {
                self.clear_all_if_virtualized("remove", &st);
            }
        }
        Ok(())
    }

    pub fn rmdir(&self, path: &Path) -> Result<()> {
        let before = self.stat_if_active(Dir::Cwd, path, AtFlags::empty());
        self.real.unlink_at(Dir::Cwd, path, AtFlags::AT_REMOVEDIR)?;
        if let Some(st) = before {
            self.clear_all_if_virtualized("rmdir", &st);
        }
        Ok(())
    }

    pub fn rename(&self, old_path: &Path, new_path: &Path) -> Result<()> {
        self.renameat(Dir::Cwd, old_path, Dir::Cwd, new_path)
    }

    /// A rename may replace, and so remove, the inode at `new_path`.
    pub fn renameat(&self, old_dir: Dir, old_path: &Path, new_dir: Dir, new_path: &Path) -> Result<()> {
        let before = self.stat_if_active(new_dir, new_path, AtFlags::AT_SYMLINK_NOFOLLOW);
        self.real.rename_at(old_dir, old_path, new_dir, new_path)?;
        if let Some(st) = before {
            // Directories have at least two links.
            if st.nlink == 1 || (st.is_dir() && st.nlink == 2) {
                self.clear_all_if_virtualized("rename", &st);
            }
        }
        Ok(())
    }

    /// Drop every override of `st`'s inode.
    pub fn clear_all_if_virtualized(&self, func: &str, st: &FileStat) {
        match self.store.find_inodestat(st.dev, st.ino) {
            Some(rec) if rec.is_active() => {
                log_vperm_debug!(func, dev = st.dev, ino = st.ino, "clear");
                self.store.submit(VpermRequest::Clear {
                    dev: st.dev,
                    ino: st.ino,
                });
            }
            _ => {}
        }
    }

    // =================== creation ===================

    fn set_owner_and_group(&self, func: &str, dir: Dir, path: &Path) {
        match self.real.stat_at(dir, path, AtFlags::empty()) {
            Ok(st) => {
                let (uid, gid) = self.owner.effective_ids();
                self.vperm_chown(func, &st, Some(uid), Some(gid));
            }
            Err(_) => log_vperm_debug!(func, "stat failed"),
        }
    }

    pub fn mkdir(&self, path: &Path, mode: u32) -> Result<()> {
        self.mkdirat(Dir::Cwd, path, mode)
    }

    pub fn mkdirat(&self, dir: Dir, path: &Path, mode: u32) -> Result<()> {
        self.real.mkdir_at(dir, path, mode)?;
        if self.owner.is_active() {
            self.set_owner_and_group("mkdir", dir, path);
        }
        Ok(())
    }

    pub fn open(&self, path: &Path, flags: OFlag, mode: u32) -> Result<RawFd> {
        self.openat(Dir::Cwd, path, flags, mode)
    }

    /// New files get the simulated owner and group.
    pub fn openat(&self, dir: Dir, path: &Path, flags: OFlag, mode: u32) -> Result<RawFd> {
        let created_by_us = self.owner.is_active() && !self.real.exists_at(dir, path);
        let fd = self.real.open_at(dir, path, flags, mode)?;
        if created_by_us {
            self.set_owner_and_group("open", dir, path);
        }
        Ok(fd)
    }

    pub fn creat(&self, path: &Path, mode: u32) -> Result<RawFd> {
        self.open(path, OFlag::O_CREAT | OFlag::O_WRONLY | OFlag::O_TRUNC, mode)
    }

    /// `fopen` with a stdio mode string; returns the descriptor.
    pub fn fopen(&self, path: &Path, mode: &str) -> Result<RawFd> {
        let flags = fopen_flags(mode)?;
        self.open(path, flags, 0o666)
    }
}
