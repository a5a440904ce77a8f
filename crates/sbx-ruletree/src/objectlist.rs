//! Object lists: fixed-size arrays of offsets, mutable in place by index.

use crate::layout::{ObjectHeader, ObjectListHeader, ObjectOffset, ObjectType};
use crate::{Result, RuleTree, RuleTreeError};
use sbx_config::log_ruletree_debug;
use std::mem::size_of;
use std::sync::atomic::{AtomicU64, Ordering};

impl RuleTree {
    /// Create a list of `size` slots, all 0.
    pub fn create_list(&self, size: u32) -> Result<ObjectOffset> {
        log_ruletree_debug!(size, "objectlist_create_list");
        let hdr = ObjectListHeader {
            obj: ObjectHeader::new(ObjectType::ObjectList),
            size,
            _pad: 0,
        };
        let slots = vec![0u8; size as usize * size_of::<ObjectOffset>()];
        self.append_record(&hdr, &slots)
    }

    /// Number of slots, or `None` if `list` is not an object list.
    pub fn list_size(&self, list: ObjectOffset) -> Option<u32> {
        self.record::<ObjectListHeader>(list).map(|h| h.size)
    }

    fn list_slot(&self, list: ObjectOffset, index: u32) -> Result<&AtomicU64> {
        let size = self.list_size(list).ok_or(RuleTreeError::NotFound {
            offset: list,
            expected: ObjectType::ObjectList,
        })?;
        if index >= size {
            return Err(RuleTreeError::IndexOutOfRange { index, size });
        }
        let at = list
            + size_of::<ObjectListHeader>() as u64
            + index as u64 * size_of::<ObjectOffset>() as u64;
        self.atomic_u64(at).ok_or(RuleTreeError::NotFound {
            offset: list,
            expected: ObjectType::ObjectList,
        })
    }

    pub fn list_set(&self, list: ObjectOffset, index: u32, value: ObjectOffset) -> Result<()> {
        self.list_slot(list, index)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Item `index`; `None` for a bad list or an out-of-range index.
    pub fn list_get(&self, list: ObjectOffset, index: u32) -> Option<ObjectOffset> {
        self.list_slot(list, index)
            .ok()
            .map(|slot| slot.load(Ordering::Acquire))
    }

    /// All items in order.
    pub fn list_items(&self, list: ObjectOffset) -> Vec<ObjectOffset> {
        let size = self.list_size(list).unwrap_or(0);
        (0..size).filter_map(|i| self.list_get(list, i)).collect()
    }
}
