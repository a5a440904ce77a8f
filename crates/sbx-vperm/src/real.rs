//! Real, unfiltered file system calls.
//!
//! The gates never touch the host directly; they go through `RealFs` so a
//! test double can count calls or force `EPERM`. `HostFs` is the libc
//! implementation used in production.

use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag};
use std::ffi::CString;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::RawFd;
use std::path::Path;

pub type Result<T> = std::result::Result<T, Errno>;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_ISUID: u32 = 0o4000;
pub const S_ISGID: u32 = 0o2000;

/// Directory a relative path is resolved against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    Cwd,
    Fd(RawFd),
}

impl Dir {
    fn raw(self) -> RawFd {
        match self {
            Dir::Cwd => libc::AT_FDCWD,
            Dir::Fd(fd) => fd,
        }
    }
}

/// The subset of `struct stat` the gates look at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileStat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub nlink: u64,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: i64,
}

impl FileStat {
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }
}

impl From<libc::stat> for FileStat {
    #[allow(clippy::unnecessary_cast)]
    fn from(st: libc::stat) -> Self {
        Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
            mode: st.st_mode as u32,
            nlink: st.st_nlink as u64,
            uid: st.st_uid as u32,
            gid: st.st_gid as u32,
            rdev: st.st_rdev as u64,
            size: st.st_size as i64,
        }
    }
}

pub trait RealFs {
    fn stat_at(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<FileStat>;

    fn fstat(&self, fd: RawFd) -> Result<FileStat>;

    /// `None` leaves the owner or group unchanged.
    fn chown_at(
        &self,
        dir: Dir,
        path: &Path,
        owner: Option<u32>,
        group: Option<u32>,
        flags: AtFlags,
    ) -> Result<()>;

    fn fchown(&self, fd: RawFd, owner: Option<u32>, group: Option<u32>) -> Result<()>;

    fn chmod_at(&self, dir: Dir, path: &Path, mode: u32, flags: AtFlags) -> Result<()>;

    fn fchmod(&self, fd: RawFd, mode: u32) -> Result<()>;

    fn mknod_at(&self, dir: Dir, path: &Path, mode: u32, rdev: u64) -> Result<()>;

    fn open_at(&self, dir: Dir, path: &Path, flags: OFlag, mode: u32) -> Result<RawFd>;

    fn close(&self, fd: RawFd);

    /// `AT_REMOVEDIR` in `flags` removes a directory.
    fn unlink_at(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<()>;

    fn rename_at(&self, old_dir: Dir, old_path: &Path, new_dir: Dir, new_path: &Path) -> Result<()>;

    fn mkdir_at(&self, dir: Dir, path: &Path, mode: u32) -> Result<()>;

    /// `faccessat(F_OK)`
    fn exists_at(&self, dir: Dir, path: &Path) -> bool;
}

/// The host file system through libc.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostFs;

fn c_path(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno::EINVAL)
}

fn raw_id(id: Option<u32>) -> u32 {
    id.unwrap_or(u32::MAX)
}

impl RealFs for HostFs {
    fn stat_at(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<FileStat> {
        let p = c_path(path)?;
        let mut st = MaybeUninit::<libc::stat>::uninit();
        // SAFETY: p is NUL-terminated and st is written on success.
        let rc = unsafe { libc::fstatat(dir.raw(), p.as_ptr(), st.as_mut_ptr(), flags.bits()) };
        Errno::result(rc)?;
        Ok(FileStat::from(unsafe { st.assume_init() }))
    }

    fn fstat(&self, fd: RawFd) -> Result<FileStat> {
        let mut st = MaybeUninit::<libc::stat>::uninit();
        let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
        Errno::result(rc)?;
        Ok(FileStat::from(unsafe { st.assume_init() }))
    }

    fn chown_at(
        &self,
        dir: Dir,
        path: &Path,
        owner: Option<u32>,
        group: Option<u32>,
        flags: AtFlags,
    ) -> Result<()> {
        let p = c_path(path)?;
        let rc = unsafe {
            libc::fchownat(
                dir.raw(),
                p.as_ptr(),
                raw_id(owner) as libc::uid_t,
                raw_id(group) as libc::gid_t,
                flags.bits(),
            )
        };
        Errno::result(rc).map(drop)
    }

    fn fchown(&self, fd: RawFd, owner: Option<u32>, group: Option<u32>) -> Result<()> {
        let rc = unsafe { libc::fchown(fd, raw_id(owner) as libc::uid_t, raw_id(group) as libc::gid_t) };
        Errno::result(rc).map(drop)
    }

    fn chmod_at(&self, dir: Dir, path: &Path, mode: u32, flags: AtFlags) -> Result<()> {
        let p = c_path(path)?;
        let rc = unsafe { libc::fchmodat(dir.raw(), p.as_ptr(), mode as libc::mode_t, flags.bits()) };
        Errno::result(rc).map(drop)
    }

    fn fchmod(&self, fd: RawFd, mode: u32) -> Result<()> {
        let rc = unsafe { libc::fchmod(fd, mode as libc::mode_t) };
        Errno::result(rc).map(drop)
    }

    fn mknod_at(&self, dir: Dir, path: &Path, mode: u32, rdev: u64) -> Result<()> {
        let p = c_path(path)?;
        let rc = unsafe {
            libc::mknodat(dir.raw(), p.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t)
        };
        Errno::result(rc).map(drop)
    }

    fn open_at(&self, dir: Dir, path: &Path, flags: OFlag, mode: u32) -> Result<RawFd> {
        let p = c_path(path)?;
        let rc = unsafe { libc::openat(dir.raw(), p.as_ptr(), flags.bits(), mode as libc::c_uint) };
        Errno::result(rc)
    }

    fn close(&self, fd: RawFd) {
        unsafe {
            libc::close(fd);
        }
    }

    fn unlink_at(&self, dir: Dir, path: &Path, flags: AtFlags) -> Result<()> {
        let p = c_path(path)?;
        let rc = unsafe { libc::unlinkat(dir.raw(), p.as_ptr(), flags.bits()) };
        Errno::result(rc).map(drop)
    }

    fn rename_at(&self, old_dir: Dir, old_path: &Path, new_dir: Dir, new_path: &Path) -> Result<()> {
        let old = c_path(old_path)?;
        let new = c_path(new_path)?;
        let rc = unsafe { libc::renameat(old_dir.raw(), old.as_ptr(), new_dir.raw(), new.as_ptr()) };
        Errno::result(rc).map(drop)
    }

    fn mkdir_at(&self, dir: Dir, path: &Path, mode: u32) -> Result<()> {
        let p = c_path(path)?;
        let rc = unsafe { libc::mkdirat(dir.raw(), p.as_ptr(), mode as libc::mode_t) };
        Errno::result(rc).map(drop)
    }

    fn exists_at(&self, dir: Dir, path: &Path) -> bool {
        let Ok(p) = c_path(path) else {
            return false;
        };
        unsafe { libc::faccessat(dir.raw(), p.as_ptr(), libc::F_OK, 0) == 0 }
    }
}
