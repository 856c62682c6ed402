// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The low-fragmentation-heap frontend.
//!
//! LFH subsegments live inside backend blocks, so their user blocks never
//! carry the backend busy flag; they are discovered here instead and merged
//! into the segment scan by address. The zone list is circular; subsegment
//! headers are allocated linearly from each zone until its `FreePointer`.

use num_traits::FromPrimitive;
use tracing::debug;

use heapwalk_common::format::{
    FrontEndHeapType, NtGlobalFlags, LFH_BLOCK_BUSY, LFH_BLOCK_BUSY_UST,
};
use heapwalk_common::traits::TargetAccess;

use crate::entry::read_raw_entry;
use crate::layout::HeapLayout;
use crate::record::{parse_busy_entry, HeapRecord};
use crate::target::TargetAccessExt;
use crate::Error;

/// Collect the busy LFH user blocks of the heap at `heap_address`.
///
/// Returns an empty set when the heap has no LFH frontend. Records come back
/// in discovery order; the caller sorts.
pub(crate) fn collect_lfh_records<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    heap_address: u64,
) -> Result<Vec<HeapRecord>, Error> {
    let mut records = Vec::new();

    let front_end_type = target.read_u8(heap_address + layout.heap_front_end_heap_type)?;
    if FrontEndHeapType::from_u8(front_end_type) != Some(FrontEndHeapType::LowFragmentation) {
        return Ok(records);
    }
    let front_end_heap =
        target.read_ptr(heap_address + layout.heap_front_end_heap, layout.pointer_size)?;
    if front_end_heap == 0 {
        return Ok(records);
    }
    debug!("_LFH_HEAP {front_end_heap:#x}");

    let anchor = front_end_heap + layout.lfh_sub_segment_zones;
    let mut zone = anchor;
    loop {
        zone = target.read_ptr(zone, layout.pointer_size)?;
        if zone == anchor {
            break;
        }
        walk_zone(target, layout, flags, zone, &mut records)?;
    }
    Ok(records)
}

fn walk_zone<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    zone: u64,
    records: &mut Vec<HeapRecord>,
) -> Result<(), Error> {
    debug!("_LFH_BLOCK_ZONE {zone:#x}");
    let free_pointer = target.read_ptr(zone + layout.zone_free_pointer, layout.pointer_size)?;

    let mut subsegment = zone + layout.zone_header_size;
    while subsegment + layout.subsegment_size <= free_pointer {
        debug!("_HEAP_SUBSEGMENT {subsegment:#x}");
        let block_size = target.read_u16(subsegment + layout.subsegment_block_size)?;
        if block_size == 0 {
            // rest are unused subsegments
            break;
        }
        let block_count = target.read_u16(subsegment + layout.subsegment_block_count)?;
        let user_blocks =
            target.read_ptr(subsegment + layout.subsegment_user_blocks, layout.pointer_size)?;
        if user_blocks != 0 {
            let first = if layout.win8 {
                let offset = target
                    .read_u16(user_blocks + layout.user_blocks_first_allocation_offset)?;
                user_blocks + u64::from(offset)
            } else {
                user_blocks + layout.zone_header_size
            };
            walk_user_blocks(target, layout, flags, first, block_size, block_count, records)?;
        }
        subsegment += layout.subsegment_size;
    }
    Ok(())
}

fn walk_user_blocks<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    first: u64,
    block_size: u16,
    block_count: u16,
    records: &mut Vec<HeapRecord>,
) -> Result<(), Error> {
    let busy = if flags.contains(NtGlobalFlags::USER_STACK_TRACE_DB) {
        LFH_BLOCK_BUSY_UST
    } else {
        LFH_BLOCK_BUSY
    };
    let mut address = first;
    for _ in 0..block_count {
        // LFH headers are never masked, and their size field is dead; the
        // subsegment's block size applies to every block in it.
        let mut entry = read_raw_entry(target, layout, address)?;
        entry.size = block_size;
        if entry.extended_block_signature == busy {
            let record = parse_busy_entry(target, layout, address, &entry, flags)?;
            debug!(
                "lfh block ust:{:#x} userPtr:{:#x} userSize:{:#x}",
                record.ust_address, record.user_address, record.user_size
            );
            records.push(record);
        }
        address += u64::from(block_size) * layout.block_unit;
    }
    Ok(())
}
