//! Decoding of raw instrumentation map values.
//!
//! Map values arrive as fixed-size byte arrays laid out like the C structs
//! in the instrumentation program. Lengths are checked once per value, then
//! fields are read as little-endian integers at fixed offsets.

use thiserror::Error;

use super::event::{AllocationRecord, CombinedStackCounter, KernelCacheCounter, SyscallCounter};

/// `struct alloc_info_t { u64 size; u64 timestamp_ns; s64 stack_id; }`
pub const ALLOC_INFO_SIZE: usize = 24;

/// `struct combined_alloc_info_t { u64 alloc_size; u64 free_size;
/// u64 number_of_allocs; u64 number_of_frees; }`
pub const COMBINED_ALLOC_INFO_SIZE: usize = 32;

/// `struct kernel_cache_t { u64 alloc_count; u64 free_count;
/// u64 alloc_size; u64 free_size; }`
pub const KERNEL_CACHE_INFO_SIZE: usize = 32;

/// `struct syscall_info_t { u64 count; u64 total_ns; }`
pub const SYSCALL_INFO_SIZE: usize = 16;

/// Cache name key: `char name[32]`, NUL padded.
pub const CACHE_NAME_LEN: usize = 32;

/// Errors that can occur while decoding a map value.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("reading {value_name}: need {need} bytes, got {size}")]
    Truncated {
        value_name: &'static str,
        need: usize,
        size: usize,
    },

    #[error("empty kernel cache name")]
    EmptyCacheName,
}

/// Decode an `allocs` map value.
pub fn parse_alloc_info(address: u64, data: &[u8]) -> Result<AllocationRecord, ParseError> {
    ensure_len(data, ALLOC_INFO_SIZE, "alloc info")?;
    Ok(AllocationRecord {
        address,
        size: read_u64_le(data, 0),
        timestamp_ns: read_u64_le(data, 8),
        stack_id: read_i64_le(data, 16),
    })
}

/// Decode a `combined_allocs` map value.
pub fn parse_combined_alloc(
    stack_id: i64,
    data: &[u8],
) -> Result<CombinedStackCounter, ParseError> {
    ensure_len(data, COMBINED_ALLOC_INFO_SIZE, "combined alloc info")?;
    Ok(CombinedStackCounter {
        stack_id,
        alloc_size: read_u64_le(data, 0),
        free_size: read_u64_le(data, 8),
        number_of_allocs: read_u64_le(data, 16),
        number_of_frees: read_u64_le(data, 24),
    })
}

/// Decode a `kernel_cache_counts` entry from its name key and value.
pub fn parse_kernel_cache(name: &[u8], data: &[u8]) -> Result<KernelCacheCounter, ParseError> {
    ensure_len(data, KERNEL_CACHE_INFO_SIZE, "kernel cache info")?;
    Ok(KernelCacheCounter {
        name: parse_cache_name(name)?,
        alloc_count: read_u64_le(data, 0),
        free_count: read_u64_le(data, 8),
        alloc_size: read_u64_le(data, 16),
        free_size: read_u64_le(data, 24),
    })
}

/// Decode a `syscall_counts` map value.
pub fn parse_syscall(syscall_id: u32, data: &[u8]) -> Result<SyscallCounter, ParseError> {
    ensure_len(data, SYSCALL_INFO_SIZE, "syscall info")?;
    Ok(SyscallCounter {
        syscall_id,
        count: read_u64_le(data, 0),
        total_ns: read_u64_le(data, 8),
    })
}

/// Decode a NUL-padded cache name. Invalid UTF-8 is replaced, not rejected;
/// slab names come from the kernel and are ASCII in practice.
pub fn parse_cache_name(raw: &[u8]) -> Result<String, ParseError> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    let bytes = raw.get(..end).unwrap_or_default();
    if bytes.is_empty() {
        return Err(ParseError::EmptyCacheName);
    }
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

fn ensure_len(data: &[u8], need: usize, value_name: &'static str) -> Result<(), ParseError> {
    if data.len() < need {
        Err(ParseError::Truncated {
            value_name,
            need,
            size: data.len(),
        })
    } else {
        Ok(())
    }
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_i64_le(data: &[u8], offset: usize) -> i64 {
    read_u64_le(data, offset) as i64
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}
