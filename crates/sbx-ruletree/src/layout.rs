//! Rule tree on-disk layout, shared by the rule compiler (writer), the
//! permission store owner (writer) and every interposed process (reader).
//!
//! All integers are host byte order. Every record is a multiple of 8 bytes
//! long and starts on an 8-byte boundary, so offsets of the mutable `u64`
//! slots (catalog links, object-list items, counters) can be accessed
//! atomically through the shared mapping.
//! Any field change here MUST bump `RULETREE_VERSION`.

/// Object magic: "SBRT" in little-endian
pub const RULETREE_MAGIC: u32 = 0x5452_4253;

/// Rule tree format version. Bump on incompatible changes.
pub const RULETREE_VERSION: u32 = 1;

/// Byte position inside the arena. 0 is never a valid object reference
/// (the file header lives there), so it doubles as "absent".
pub type ObjectOffset = u64;

/// Record alignment inside the arena
pub const RECORD_ALIGN: usize = 8;

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    FileHeader = 1,
    String = 2,
    ObjectList = 3,
    CatalogEntry = 4,
    FsRule = 5,
    InodeSimu = 6,
}

impl ObjectType {
    pub fn from_u32(raw: u32) -> Option<Self> {
        Some(match raw {
            1 => ObjectType::FileHeader,
            2 => ObjectType::String,
            3 => ObjectType::ObjectList,
            4 => ObjectType::CatalogEntry,
            5 => ObjectType::FsRule,
            6 => ObjectType::InodeSimu,
            _ => return None,
        })
    }
}

// ---------------------------------------------------------------------------
// ObjectHeader: prefix of every record
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub magic: u32,
    pub obj_type: u32,
}

const _: () = assert!(std::mem::size_of::<ObjectHeader>() == 8);

impl ObjectHeader {
    pub const SIZE: usize = std::mem::size_of::<ObjectHeader>();

    pub fn new(obj_type: ObjectType) -> Self {
        Self {
            magic: RULETREE_MAGIC,
            obj_type: obj_type as u32,
        }
    }
}

// ---------------------------------------------------------------------------
// FileHeader: offset 0
// ---------------------------------------------------------------------------

/// Layout (32 bytes total):
/// ```text
/// offset  field               size
/// ------  ------------------  ----
///  0      obj                  8   (magic + FileHeader type)
///  8      version              4
/// 12      _pad                 4
/// 16      root_catalog         8   (offset of first root catalog entry, 0 = none)
/// 24      active_inodestats    8   (records with a non-empty active mask)
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub obj: ObjectHeader,
    pub version: u32,
    pub _pad: u32,
    pub root_catalog: ObjectOffset,
    pub active_inodestats: u64,
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == 32);

// ---------------------------------------------------------------------------
// Variable-length records: fixed header + trailer
// ---------------------------------------------------------------------------

/// Followed by `size` bytes of text and a NUL, padded to `RECORD_ALIGN`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct StringHeader {
    pub obj: ObjectHeader,
    pub size: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<StringHeader>() == 16);

/// Followed by `size` object offsets, zero at creation.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ObjectListHeader {
    pub obj: ObjectHeader,
    pub size: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<ObjectListHeader>() == 16);

// ---------------------------------------------------------------------------
// CatalogEntry: singly linked list node
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CatalogEntry {
    pub obj: ObjectHeader,
    /// String offset, 0 = anonymous
    pub name: ObjectOffset,
    /// Anything; a sub-catalog head for entries of the root catalog
    pub value: ObjectOffset,
    /// Next entry, 0 = end of list
    pub next: ObjectOffset,
}

const _: () = assert!(std::mem::size_of::<CatalogEntry>() == 32);

// ---------------------------------------------------------------------------
// FsRuleRecord
// ---------------------------------------------------------------------------

/// One path mapping rule. Type codes are decoded by `crate::fsrule`.
/// Every `ObjectOffset` field except `rule_list_link` points to a String
/// (0 = not set); `action` may point to an ObjectList for rule-list actions.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FsRuleRecord {
    pub obj: ObjectHeader,
    pub name: ObjectOffset,
    pub selector_type: u32,
    pub action_type: u32,
    pub selector: ObjectOffset,
    pub action: ObjectOffset,
    pub condition_type: u32,
    pub flags: u32,
    pub condition: ObjectOffset,
    pub rule_list_link: ObjectOffset,
    pub binary_name: ObjectOffset,
    pub exec_policy_name: ObjectOffset,
    pub func_class: u32,
    pub _pad: u32,
}

const _: () = assert!(std::mem::size_of::<FsRuleRecord>() == 88);

// ---------------------------------------------------------------------------
// InodeSimuRecord
// ---------------------------------------------------------------------------

/// Simulated uid is active
pub const INODESIMU_UID: u32 = 0x01;
/// Simulated gid is active
pub const INODESIMU_GID: u32 = 0x02;
/// Simulated permission bits are active
pub const INODESIMU_MODE: u32 = 0x04;
/// Simulated SUID/SGID bits are active
pub const INODESIMU_SUIDSGID: u32 = 0x08;
/// The inode is a simulated device node
pub const INODESIMU_DEVNODE: u32 = 0x10;

/// Layout (64 bytes total):
/// ```text
/// offset  field          size
/// ------  -------------  ----
///  0      obj             8
///  8      dev             8
/// 16      ino             8
/// 24      generation      8   (seqlock: odd while a write is in progress)
/// 32      active_fields   4   (INODESIMU_* bits)
/// 36      uid             4
/// 40      gid             4
/// 44      mode            4   (permission bits only)
/// 48      suid_sgid       4
/// 52      devmode         4   (S_IFCHR/S_IFBLK | perms)
/// 56      rdev            8
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct InodeSimuRecord {
    pub obj: ObjectHeader,
    pub dev: u64,
    pub ino: u64,
    pub generation: u64,
    pub active_fields: u32,
    pub uid: u32,
    pub gid: u32,
    pub mode: u32,
    pub suid_sgid: u32,
    pub devmode: u32,
    pub rdev: u64,
}

const _: () = assert!(std::mem::size_of::<InodeSimuRecord>() == 64);

/// Fixed-size arena records, readable by value from any offset whose
/// object header carries `TYPE`.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, start with an `ObjectHeader`, contain
/// no implicit padding and be valid for any bit pattern.
pub unsafe trait Record: Copy {
    const TYPE: ObjectType;
}

unsafe impl Record for FileHeader {
    const TYPE: ObjectType = ObjectType::FileHeader;
}
unsafe impl Record for StringHeader {
    const TYPE: ObjectType = ObjectType::String;
}
unsafe impl Record for ObjectListHeader {
    const TYPE: ObjectType = ObjectType::ObjectList;
}
unsafe impl Record for CatalogEntry {
    const TYPE: ObjectType = ObjectType::CatalogEntry;
}
unsafe impl Record for FsRuleRecord {
    const TYPE: ObjectType = ObjectType::FsRule;
}
unsafe impl Record for InodeSimuRecord {
    const TYPE: ObjectType = ObjectType::InodeSimu;
}

/// Round `len` up to the record alignment.
#[inline]
pub const fn padded_len(len: usize) -> usize {
    (len + RECORD_ALIGN - 1) & !(RECORD_ALIGN - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_type_codes_roundtrip() {
        for t in [
            ObjectType::FileHeader,
            ObjectType::String,
            ObjectType::ObjectList,
            ObjectType::CatalogEntry,
            ObjectType::FsRule,
            ObjectType::InodeSimu,
        ] {
            assert_eq!(ObjectType::from_u32(t as u32), Some(t));
        }
        assert_eq!(ObjectType::from_u32(0), None);
        assert_eq!(ObjectType::from_u32(99), None);
    }

    #[test]
    fn test_padding() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 8);
        assert_eq!(padded_len(8), 8);
        assert_eq!(padded_len(17), 24);
    }
}
