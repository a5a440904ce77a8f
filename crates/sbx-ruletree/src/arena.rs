//! Arena store: attach, append and validated resolve.
//!
//! The arena is a single file mapped read-write shared at a fixed size.
//! New objects are appended through the file descriptor, never through
//! the mapping; the mapping only ever sees in-place updates of the mutable
//! slots (catalog links, list items, simulated inode fields, counters).

use crate::layout::*;
use crate::{Result, RuleTreeError};
use memmap2::{MmapMut, MmapOptions};
use sbx_config::{log_ruletree_debug, log_ruletree_error, log_ruletree_trace};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::mem::size_of;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Result of a successful attach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    /// The file was empty and a fresh header was written: this process is
    /// the first writer of the session.
    Created,
    /// Joined an existing, valid arena.
    Attached,
}

/// A mapped rule tree.
#[derive(Debug)]
pub struct RuleTree {
    mmap: MmapMut,
    map_size: usize,
    /// Present only for writers (`keep_open`)
    file: Option<File>,
    /// Bytes known to be backed by the file
    file_size: AtomicU64,
    path: PathBuf,
}

/// A validated object inside the arena.
#[derive(Debug, Clone, Copy)]
pub struct ObjectRef<'a> {
    pub offset: ObjectOffset,
    pub obj_type: u32,
    bytes: &'a [u8],
}

impl<'a> ObjectRef<'a> {
    pub fn kind(&self) -> Option<ObjectType> {
        ObjectType::from_u32(self.obj_type)
    }

    /// Bytes following the object header, up to the current end of file.
    pub fn payload(&self) -> &'a [u8] {
        &self.bytes[ObjectHeader::SIZE..]
    }
}

impl RuleTree {
    /// Attach the rule tree at `path` using the default map size.
    pub fn attach(
        path: &Path,
        create_if_missing: bool,
        keep_open: bool,
    ) -> Result<(Self, AttachOutcome)> {
        Self::attach_sized(path, create_if_missing, keep_open, sbx_config::RULETREE_MAP_SIZE)
    }

    /// Attach with an explicit mapping size.
    ///
    /// The file is always opened read-write and mapped shared. Without
    /// `keep_open` the descriptor is dropped after mapping, so appends and
    /// record updates fail with `RuleTreeError::ReadOnly`.
    ///
    /// A version mismatch is reported as `RuleTreeError::VersionMismatch`;
    /// callers must treat it as fatal for the whole session.
    pub fn attach_sized(
        path: &Path,
        create_if_missing: bool,
        keep_open: bool,
        map_size: usize,
    ) -> Result<(Self, AttachOutcome)> {
        log_ruletree_debug!(path = %path.display(), create_if_missing, keep_open, "attach_ruletree");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create_if_missing)
            .truncate(false)
            .mode(0o600)
            .open(path)?;
        let file_size = file.metadata()?.len();

        let mmap = unsafe { MmapOptions::new().len(map_size).map_mut(&file)? };

        let mut tree = Self {
            mmap,
            map_size,
            file: Some(file),
            file_size: AtomicU64::new(file_size.min(map_size as u64)),
            path: path.to_path_buf(),
        };

        let outcome = if file_size < size_of::<FileHeader>() as u64 {
            if !create_if_missing {
                log_ruletree_debug!("empty - not initializing");
                return Err(RuleTreeError::Empty(path.to_path_buf()));
            }
            log_ruletree_debug!("empty - initializing");
            tree.init_header()?;
            AttachOutcome::Created
        } else {
            match tree.record::<FileHeader>(0) {
                Some(hdr) if hdr.version == RULETREE_VERSION => {
                    log_ruletree_debug!("header & magic ok");
                    AttachOutcome::Attached
                }
                Some(hdr) => {
                    log_ruletree_error!(
                        "Fatal: ruletree version mismatch: Got {}, expected {}",
                        hdr.version,
                        RULETREE_VERSION
                    );
                    return Err(RuleTreeError::VersionMismatch {
                        found: hdr.version,
                        expected: RULETREE_VERSION,
                    });
                }
                None => {
                    log_ruletree_error!(path = %path.display(), "Faulty ruletree header");
                    return Err(RuleTreeError::BadHeader(path.to_path_buf()));
                }
            }
        };

        if !keep_open {
            tree.file = None;
            log_ruletree_debug!("rule tree file has been closed");
        }

        log_ruletree_debug!(?outcome, "attach_ruletree done");
        Ok((tree, outcome))
    }

    fn init_header(&self) -> Result<()> {
        let file = self.file.as_ref().ok_or(RuleTreeError::ReadOnly)?;
        // A short file can only hold the remains of an interrupted create.
        file.set_len(0)?;
        self.file_size.store(0, Ordering::Release);

        let hdr = FileHeader {
            obj: ObjectHeader::new(ObjectType::FileHeader),
            version: RULETREE_VERSION,
            _pad: 0,
            root_catalog: 0,
            active_inodestats: 0,
        };
        let offset = self.append_record(&hdr, &[])?;
        debug_assert_eq!(offset, 0);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if this attachment can append.
    pub fn is_writable(&self) -> bool {
        self.file.is_some()
    }

    /// Current end of the arena as seen by this process.
    pub fn file_size(&self) -> u64 {
        self.file_size.load(Ordering::Acquire)
    }

    pub fn header(&self) -> Option<FileHeader> {
        self.record::<FileHeader>(0)
    }

    /// Append a typed object: object header followed by `payload`, padded to
    /// the record alignment. Returns the offset of the object header.
    pub fn append_object(&self, obj_type: ObjectType, payload: &[u8]) -> Result<ObjectOffset> {
        let hdr = ObjectHeader::new(obj_type);
        let mut buf = Vec::with_capacity(padded_len(ObjectHeader::SIZE + payload.len()));
        buf.extend_from_slice(&hdr.magic.to_ne_bytes());
        buf.extend_from_slice(&hdr.obj_type.to_ne_bytes());
        buf.extend_from_slice(payload);
        buf.resize(padded_len(buf.len()), 0);
        self.append_bytes(&buf)
    }

    /// Append a fixed-size record followed by `trailer`.
    pub(crate) fn append_record<T: Record>(&self, record: &T, trailer: &[u8]) -> Result<ObjectOffset> {
        // SAFETY: Record types are repr(C) without implicit padding.
        let head =
            unsafe { std::slice::from_raw_parts(record as *const T as *const u8, size_of::<T>()) };
        let mut buf = Vec::with_capacity(padded_len(head.len() + trailer.len()));
        buf.extend_from_slice(head);
        buf.extend_from_slice(trailer);
        buf.resize(padded_len(buf.len()), 0);
        self.append_bytes(&buf)
    }

    fn append_bytes(&self, buf: &[u8]) -> Result<ObjectOffset> {
        let mut file = self.file.as_ref().ok_or(RuleTreeError::ReadOnly)?;
        let start = file.seek(SeekFrom::End(0))?;
        let end = start + buf.len() as u64;
        if end > self.map_size as u64 {
            log_ruletree_error!(needed = end, map_size = self.map_size, "rule tree is full");
            return Err(RuleTreeError::Full {
                needed: end,
                available: self.map_size as u64,
            });
        }
        file.write_all(buf)?;
        self.file_size.store(end, Ordering::Release);
        log_ruletree_trace!(offset = start, len = buf.len(), "appended object");
        Ok(start)
    }

    /// Pick up objects appended by other processes.
    pub fn refresh(&self) -> u64 {
        let len = match &self.file {
            Some(f) => f.metadata().map(|m| m.len()),
            None => std::fs::metadata(&self.path).map(|m| m.len()),
        };
        if let Ok(len) = len {
            self.file_size.fetch_max(len.min(self.map_size as u64), Ordering::AcqRel);
        }
        self.file_size()
    }

    fn visible_end(&self, needed: u64) -> Option<u64> {
        let mut size = self.file_size();
        if needed > size {
            size = self.refresh();
        }
        (needed <= size).then_some(size)
    }

    /// Validate the object at `offset`: bounds, magic and (if requested)
    /// type tag. Any failure yields `None`.
    pub fn resolve(&self, offset: ObjectOffset, expected: Option<ObjectType>) -> Option<ObjectRef<'_>> {
        let size = self.check_object(offset, expected, ObjectHeader::SIZE)?;
        let hdr = self.read_at::<ObjectHeader>(offset);
        Some(ObjectRef {
            offset,
            obj_type: hdr.obj_type,
            bytes: &self.mmap[offset as usize..size as usize],
        })
    }

    /// Bounds + magic + type check for an object of at least `min_len`
    /// bytes. Returns the visible end of the arena.
    fn check_object(&self, offset: ObjectOffset, expected: Option<ObjectType>, min_len: usize) -> Option<u64> {
        let end = offset.checked_add(min_len as u64)?;
        let Some(size) = self.visible_end(end) else {
            log_ruletree_trace!(offset, "offset beyond end of rule tree");
            return None;
        };
        let hdr = self.read_at::<ObjectHeader>(offset);
        if hdr.magic != RULETREE_MAGIC {
            log_ruletree_trace!(offset, magic = hdr.magic, "bad magic");
            return None;
        }
        if let Some(t) = expected {
            if hdr.obj_type != t as u32 {
                log_ruletree_trace!(offset, found = hdr.obj_type, expected = ?t, "wrong object type");
                return None;
            }
        }
        Some(size)
    }

    /// Caller has checked the bounds.
    fn read_at<T: Copy>(&self, offset: ObjectOffset) -> T {
        // SAFETY: offset + size_of::<T>() is inside the mapping.
        unsafe { std::ptr::read_unaligned(self.mmap.as_ptr().add(offset as usize) as *const T) }
    }

    /// Copy out the record at `offset` if it has the right type.
    pub(crate) fn record<T: Record>(&self, offset: ObjectOffset) -> Option<T> {
        self.check_object(offset, Some(T::TYPE), size_of::<T>())?;
        Some(self.read_at::<T>(offset))
    }

    /// Mutable 8-byte slot at `record_offset + field_offset` of a record of
    /// type `T`.
    pub(crate) fn slot_u64<T: Record>(&self, record_offset: ObjectOffset, field_offset: usize) -> Option<&AtomicU64> {
        self.check_object(record_offset, Some(T::TYPE), size_of::<T>())?;
        self.atomic_u64(record_offset + field_offset as u64)
    }

    pub(crate) fn slot_u32<T: Record>(&self, record_offset: ObjectOffset, field_offset: usize) -> Option<&AtomicU32> {
        self.check_object(record_offset, Some(T::TYPE), size_of::<T>())?;
        let at = record_offset + field_offset as u64;
        if at % 4 != 0 || self.visible_end(at + 4).is_none() {
            return None;
        }
        // SAFETY: aligned and inside the mapping; all access to mutable
        // slots goes through atomics.
        Some(unsafe { &*(self.mmap.as_ptr().add(at as usize) as *const AtomicU32) })
    }

    pub(crate) fn atomic_u64(&self, at: u64) -> Option<&AtomicU64> {
        if at % 8 != 0 || self.visible_end(at + 8).is_none() {
            return None;
        }
        // SAFETY: see slot_u32.
        Some(unsafe { &*(self.mmap.as_ptr().add(at as usize) as *const AtomicU64) })
    }

    /// Raw bytes `[start, start + len)` if they are inside the file.
    pub(crate) fn bytes(&self, start: u64, len: usize) -> Option<&[u8]> {
        let end = start.checked_add(len as u64)?;
        self.visible_end(end)?;
        Some(&self.mmap[start as usize..end as usize])
    }

    // =================== strings ===================

    pub fn append_string(&self, s: &str) -> Result<ObjectOffset> {
        let size = u32::try_from(s.len()).map_err(|_| RuleTreeError::Full {
            needed: s.len() as u64,
            available: u32::MAX as u64,
        })?;
        let hdr = StringHeader {
            obj: ObjectHeader::new(ObjectType::String),
            size,
            _pad: 0,
        };
        let mut trailer = Vec::with_capacity(s.len() + 1);
        trailer.extend_from_slice(s.as_bytes());
        trailer.push(0);
        self.append_record(&hdr, &trailer)
    }

    /// The string stored at `offset`, if it is a valid, NUL-terminated,
    /// UTF-8 string object.
    pub fn string_at(&self, offset: ObjectOffset) -> Option<&str> {
        let hdr = self.record::<StringHeader>(offset)?;
        let start = offset + size_of::<StringHeader>() as u64;
        let with_nul = self.bytes(start, hdr.size as usize + 1)?;
        let (text, nul) = with_nul.split_at(hdr.size as usize);
        if nul != [0] {
            log_ruletree_trace!(offset, "string is not terminated");
            return None;
        }
        std::str::from_utf8(text).ok()
    }

    /// Optional string: 0 means "not set".
    pub(crate) fn opt_string(&self, offset: ObjectOffset) -> Option<String> {
        if offset == 0 {
            None
        } else {
            self.string_at(offset).map(str::to_owned)
        }
    }

    pub(crate) fn append_opt_string(&self, s: Option<&str>) -> Result<ObjectOffset> {
        match s {
            Some(s) => self.append_string(s),
            None => Ok(0),
        }
    }

    /// Flush mmap to disk
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
