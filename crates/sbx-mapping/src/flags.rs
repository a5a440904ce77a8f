//! Mapping rule flags returned by evaluators.

use sbx_config::log_mapping_warn;

pub const READONLY: u32 = 0o1;
pub const CALL_TRANSLATE_FOR_ALL: u32 = 0o2;
pub const FORCE_ORIG_PATH: u32 = 0o4;
pub const READONLY_FS_IF_NOT_ROOT: u32 = 0o10;
pub const READONLY_FS_ALWAYS: u32 = 0o20;
pub const FORCE_ORIG_PATH_UNLESS_CHROOT: u32 = 0o40;

pub const ALL_FLAGS: u32 = READONLY
    | CALL_TRANSLATE_FOR_ALL
    | FORCE_ORIG_PATH
    | READONLY_FS_IF_NOT_ROOT
    | READONLY_FS_ALWAYS
    | FORCE_ORIG_PATH_UNLESS_CHROOT;

/// Warn about bits outside `ALL_FLAGS`. Returns the unknown bits.
pub fn check_mapping_flags(flags: u32, func: &str) -> u32 {
    let unknown = flags & !ALL_FLAGS;
    if unknown != 0 {
        log_mapping_warn!("{} returned unknown flags (0{:o})", func, unknown);
    }
    unknown
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_known_flags() {
        assert_eq!(check_mapping_flags(READONLY | CALL_TRANSLATE_FOR_ALL, "f"), 0);
        assert_eq!(check_mapping_flags(ALL_FLAGS, "f"), 0);
    }

    #[test]
    fn test_unknown_flags() {
        assert_eq!(check_mapping_flags(0o100 | READONLY, "sbox_translate_path"), 0o100);
    }
}
