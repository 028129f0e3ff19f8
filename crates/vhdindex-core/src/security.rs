//! Validation limits and checked-arithmetic helpers guarding against malicious
//! or corrupt on-disk structures.

use crate::Error;
use std::path::{Path, PathBuf};

/// Maximum sector size we accept for a block-size / bitmap computation (4 KB).
pub const MAX_SECTOR_SIZE: u32 = 4096;

/// Maximum number of sectors per block we're willing to allocate a bitmap or
/// entry table for (guards against a corrupt `block_size` field turning into
/// an enormous allocation).
pub const MAX_SECTORS_PER_BLOCK: u32 = 1 << 20;

/// Maximum single allocation for an index block's entry table or a VHD
/// bitmap (256 MB).
pub const MAX_ALLOCATION_SIZE: usize = 256 * 1024 * 1024;

/// Maximum length of a stored path field's declared byte count (matches the
/// on-disk `vhdi_path_t` capacity of 1024 bytes).
pub const MAX_PATH_BYTES: usize = 1024;

/// Maximum number of file-table entries accepted when loading `.files`.
pub const MAX_FILE_TABLE_ENTRIES: usize = 1_000_000;

/// Maximum number of blocks accepted when loading a `.bat`.
pub const MAX_BAT_BLOCKS: usize = 1_000_000;

/// Validate that a size is within allocation limits.
pub fn validate_allocation_size(size: u64, limit: usize, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(Error::invalid_argument(format!(
            "{context} size {size} exceeds limit {limit}"
        )));
    }

    size.try_into()
        .map_err(|_| Error::invalid_argument(format!("{context} size exceeds platform limits")))
}

/// Safely multiply two u64 values with overflow checking.
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::invalid_argument(format!("{context}: multiplication overflow")))
}

/// Safely multiply u32 values and return u64.
pub fn checked_multiply_u32_to_u64(a: u32, b: u32, context: &str) -> crate::Result<u64> {
    (a as u64)
        .checked_mul(b as u64)
        .ok_or_else(|| Error::invalid_argument(format!("{context}: multiplication overflow")))
}

/// Safely convert u64 to usize with platform checking.
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::invalid_argument(format!(
            "{context}: value {value} exceeds platform usize limit"
        ))
    })
}

/// Validate a block size: nonzero, power of two, and within
/// `MAX_SECTOR_SIZE * MAX_SECTORS_PER_BLOCK`.
pub fn validate_block_size(block_size: u32) -> crate::Result<()> {
    if block_size == 0 {
        return Err(Error::invalid_argument("block size must be nonzero"));
    }
    if !block_size.is_power_of_two() {
        return Err(Error::invalid_argument(format!(
            "block size {block_size} is not a power of 2"
        )));
    }
    let spb = block_size as u64 / crate::types::SECTOR_SIZE;
    if spb == 0 || spb > MAX_SECTORS_PER_BLOCK as u64 {
        return Err(Error::invalid_argument(format!(
            "block size {block_size} yields an unreasonable sectors-per-block count"
        )));
    }
    Ok(())
}

/// Sanitize and canonicalize a path for safe access; rejects empty paths,
/// embedded NULs, and control characters before resolving symlinks.
pub fn validate_file_path(path: &str) -> crate::Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::no_such_entity("empty path"));
    }

    if path.contains('\0') {
        return Err(Error::invalid_argument("path contains null byte"));
    }

    if path.chars().any(|c| c.is_control() && c != '\t') {
        return Err(Error::invalid_argument(
            "path contains invalid control characters",
        ));
    }

    let path_obj = Path::new(path);

    path_obj
        .canonicalize()
        .map_err(|e| Error::no_such_entity(format!("path does not exist or is inaccessible: {e}")))
}

/// Validate a stored path field's declared byte length against its capacity.
pub fn validate_path_field_len(declared_len: usize) -> crate::Result<()> {
    if declared_len >= MAX_PATH_BYTES {
        return Err(Error::name_too_long(format!(
            "path length {declared_len} reaches the {MAX_PATH_BYTES}-byte field capacity"
        )));
    }
    Ok(())
}
