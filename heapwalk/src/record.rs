// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Canonical allocation records.

use heapwalk_common::format::{NtGlobalFlags, HEAP_ENTRY};
use heapwalk_common::traits::TargetAccess;

use crate::layout::HeapLayout;
use crate::target::TargetAccessExt;
use crate::Error;

/// One busy allocation discovered in a target heap.
///
/// `address`/`size` describe the raw block including allocator metadata;
/// `user_address`/`user_size` the region handed to the application. For any
/// record, `user_address + user_size <= address + size` and `user_size <=
/// size`. `ust_address` is the stack-trace-database entry recorded at
/// allocation time, or 0 when no diagnostic mode supplies one.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapRecord {
    pub ust_address: u64,
    pub size: u64,
    pub address: u64,
    pub user_size: u64,
    pub user_address: u64,
}

/// Compute the record for the busy entry at `address`.
///
/// Where the user region starts and how its size is recovered depends on
/// which diagnostic mode put metadata behind the header: page heap wins over
/// the stack-trace database when both are enabled, matching the guard bytes
/// it inserts. The bound checks are deliberately asymmetric (strict for page
/// heap, non-strict for the stack-trace extra) to match the allocator.
pub(crate) fn parse_busy_entry<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    address: u64,
    entry: &HEAP_ENTRY,
    flags: NtGlobalFlags,
) -> Result<HeapRecord, Error> {
    let size = u64::from(entry.size) * layout.block_unit;
    let header_end = address + layout.entry_size;

    if flags.intersects(NtGlobalFlags::USER_STACK_TRACE_DB | NtGlobalFlags::HEAP_PAGE_ALLOCS) {
        if flags.contains(NtGlobalFlags::HEAP_PAGE_ALLOCS) {
            let ust_address =
                target.read_ptr(header_end + layout.ust_offset_page_heap, layout.pointer_size)?;
            let user_size =
                u64::from(target.read_u16(header_end + layout.user_size_offset_page_heap)?);
            if user_size >= size {
                return Err(Error::SizeInvariantViolated {
                    kind: "page-heap user size",
                    observed: user_size,
                    bound: size,
                });
            }
            Ok(HeapRecord {
                ust_address,
                size,
                address,
                user_size,
                user_address: header_end + layout.user_offset_page_heap,
            })
        } else {
            let ust_address = target.read_ptr(header_end, layout.pointer_size)?;
            let extra = u64::from(target.read_u16(header_end + layout.extra_offset_ust)?);
            if extra > size {
                return Err(Error::SizeInvariantViolated {
                    kind: "stack-trace extra",
                    observed: extra,
                    bound: size,
                });
            }
            Ok(HeapRecord {
                ust_address,
                size,
                address,
                user_size: size - extra,
                user_address: header_end + layout.user_offset_ust,
            })
        }
    } else {
        // The signature byte holds the block's unused-byte count here. LFH
        // blocks keep their busy marker in the same byte, which can exceed a
        // small block's size; clamp rather than wrap.
        let unused = u64::from(entry.extended_block_signature);
        Ok(HeapRecord {
            ust_address: 0,
            size,
            address,
            user_size: size.saturating_sub(unused),
            user_address: header_end,
        })
    }
}
