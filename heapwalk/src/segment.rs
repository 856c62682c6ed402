// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Backend segment scanning.
//!
//! A heap is its own first segment; further segments hang off a circular
//! list. Within a segment, entries are laid out back to back from
//! `first_entry`, each header giving the stride to the next. Regions the LFH
//! carved up appear here as single non-busy blocks, so the frontend records
//! gathered beforehand are interleaved by address as the scan passes them.

use std::collections::VecDeque;

use tracing::debug;

use heapwalk_common::format::{
    NtGlobalFlags, HEAP_ENTRY_BUSY, HEAP_ENTRY_BUSY_PAGE_HEAP, HEAP_ENTRY_SENTINEL,
    HEAP_SEGMENT, HEAP_SEGMENT64, HEAP_SEGMENT64_SIZE, HEAP_SEGMENT_SIZE, PAGE_SIZE,
};
use heapwalk_common::traits::TargetAccess;

use crate::entry::{read_decoded_entry, EncodingKey};
use crate::layout::HeapLayout;
use crate::processor::HeapProcessor;
use crate::record::{parse_busy_entry, HeapRecord};
use crate::target::{pread_struct, TargetAccessExt};
use crate::Error;

/// The segment-header fields the scan needs, bitness-independent.
struct SegmentView {
    first_entry: u64,
    last_valid_entry: u64,
    number_of_uncommitted_pages: u64,
    segment_list_flink: u64,
}

fn read_segment<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    base: u64,
) -> Result<SegmentView, Error> {
    if layout.pointer_size == 8 {
        let mut buf = [0u8; HEAP_SEGMENT64_SIZE];
        target.read_exact(base, &mut buf)?;
        let segment: HEAP_SEGMENT64 = pread_struct(&buf, base)?;
        Ok(SegmentView {
            first_entry: segment.first_entry,
            last_valid_entry: segment.last_valid_entry,
            number_of_uncommitted_pages: u64::from(segment.number_of_uncommitted_pages),
            segment_list_flink: segment.segment_list_entry.flink,
        })
    } else {
        let mut buf = [0u8; HEAP_SEGMENT_SIZE];
        target.read_exact(base, &mut buf)?;
        let segment: HEAP_SEGMENT = pread_struct(&buf, base)?;
        Ok(SegmentView {
            first_entry: u64::from(segment.first_entry),
            last_valid_entry: u64::from(segment.last_valid_entry),
            number_of_uncommitted_pages: u64::from(segment.number_of_uncommitted_pages),
            segment_list_flink: u64::from(segment.segment_list_entry.flink),
        })
    }
}

/// Scan every segment of the heap at `heap_address`, emitting busy blocks
/// and the heap's LFH records to `processor` in ascending address order.
///
/// `lfh_records` must be sorted by address.
pub(crate) fn walk_segments<T, P>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    heap_address: u64,
    key: &EncodingKey,
    lfh_records: &[HeapRecord],
    processor: &mut P,
) -> Result<(), Error>
where
    T: TargetAccess + ?Sized,
    P: HeapProcessor + ?Sized,
{
    let diagnostic = flags
        .intersects(NtGlobalFlags::USER_STACK_TRACE_DB | NtGlobalFlags::HEAP_PAGE_ALLOCS);
    let busy = if flags.contains(NtGlobalFlags::HEAP_PAGE_ALLOCS) {
        HEAP_ENTRY_BUSY_PAGE_HEAP
    } else {
        HEAP_ENTRY_BUSY
    };

    // Segment bases share the heap's 64-KiB alignment; the chain's return to
    // the list head lands the cursor on an unaligned address, ending the loop.
    let mut segment_base = heap_address;
    while (segment_base & 0xffff) == 0 {
        let segment = read_segment(target, layout, segment_base)?;
        debug!(
            "segment at {segment_base:#x} to {:#x}, {} uncommitted pages",
            segment.last_valid_entry, segment.number_of_uncommitted_pages
        );
        processor.start_segment(segment_base, segment.last_valid_entry);

        let mut in_segment: VecDeque<HeapRecord> = lfh_records
            .iter()
            .filter(|r| segment.first_entry < r.address && r.address < segment.last_valid_entry)
            .copied()
            .collect();
        debug!("{} LFH records in segment {segment_base:#x}", in_segment.len());

        let committed_end = segment
            .last_valid_entry
            .saturating_sub(segment.number_of_uncommitted_pages * PAGE_SIZE);

        let mut address = segment.first_entry;
        while address < segment.last_valid_entry {
            let entry = read_decoded_entry(target, layout, key, address)?;
            let size = u64::from(entry.size) * layout.block_unit;
            if size == 0 {
                // A genuine entry is at least its own header; a zero here
                // would stall the scan.
                return Err(Error::SizeInvariantViolated {
                    kind: "backend entry size",
                    observed: 0,
                    bound: layout.block_unit,
                });
            }

            // The tail of the segment is reserved but unreadable.
            if address + size >= committed_end {
                debug!("uncommitted bytes follow");
                break;
            }

            debug!(
                "addr:{address:#x} size:{:#06x} flags:{:#04x} signature:{:#04x}",
                entry.size, entry.flags, entry.extended_block_signature
            );
            if diagnostic && entry.extended_block_signature == HEAP_ENTRY_SENTINEL {
                break;
            }
            if entry.flags == busy {
                let record = parse_busy_entry(target, layout, address, &entry, flags)?;
                while let Some(front) = in_segment.front().copied() {
                    if front.address >= record.address {
                        break;
                    }
                    processor.register(&front);
                    in_segment.pop_front();
                }
                processor.register(&record);
            }
            address += size;
        }

        for record in in_segment.drain(..) {
            processor.register(&record);
        }
        processor.finish_segment(segment_base, segment.last_valid_entry);

        segment_base = segment
            .segment_list_flink
            .wrapping_sub(layout.heap_segment_list_entry);
    }
    Ok(())
}
