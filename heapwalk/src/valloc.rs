// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The virtually-allocated large-block list.
//!
//! Blocks too large for any segment are served straight from the OS
//! allocator and chained off `_HEAP::VirtualAllocdBlocks`. Each list entry
//! is the block itself: a header holding the committed size, a masked entry
//! header whose first decoded word is the unused-byte count, and then the
//! user region.

use tracing::debug;

use heapwalk_common::format::NtGlobalFlags;
use heapwalk_common::traits::TargetAccess;

use crate::entry::EncodingKey;
use crate::layout::HeapLayout;
use crate::record::HeapRecord;
use crate::target::TargetAccessExt;
use crate::Error;

/// Collect the virtually-allocated blocks of the heap at `heap_address`.
pub(crate) fn collect_valloc_records<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    heap_address: u64,
    key: &EncodingKey,
) -> Result<Vec<HeapRecord>, Error> {
    let mut records = Vec::new();
    let head = heap_address + layout.heap_virtual_allocd_blocks;
    let mut flink = target.read_ptr(head, layout.pointer_size)?;
    while flink != head {
        let address = flink;

        let size = target.read_ptr(address + layout.valloc_size, layout.pointer_size)?;

        let mut raw = [0u8; 16];
        let len = layout.entry_size as usize;
        target.read_exact(address + layout.valloc_entry, &mut raw[..len])?;
        let entry = key.decode(address + layout.valloc_entry, &raw[..len])?;

        // First word of the decoded tail: bytes the committed size exceeds
        // the user request by.
        let extra = u64::from(entry.size);
        if extra >= size {
            return Err(Error::SizeInvariantViolated {
                kind: "virtual-alloc extra",
                observed: extra,
                bound: size,
            });
        }

        let record = if flags.contains(NtGlobalFlags::USER_STACK_TRACE_DB) {
            HeapRecord {
                ust_address: target.read_ptr(address + layout.valloc_ust, layout.pointer_size)?,
                size,
                address,
                user_size: size - extra,
                user_address: address + layout.valloc_user_ust,
            }
        } else {
            HeapRecord {
                ust_address: 0,
                size,
                address,
                user_size: size - extra,
                user_address: address + layout.valloc_user,
            }
        };
        debug!(
            "valloc block ust:{:#x} userPtr:{:#x} userSize:{:#x}",
            record.ust_address, record.user_address, record.user_size
        );
        records.push(record);

        flink = target.read_ptr(flink, layout.pointer_size)?;
    }
    Ok(records)
}
