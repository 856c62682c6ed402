// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! The per-process orchestrator.

use tracing::{debug, warn};

use heapwalk_common::format::NtGlobalFlags;
use heapwalk_common::traits::TargetAccess;

use crate::entry::EncodingKey;
use crate::layout::HeapLayout;
use crate::processor::HeapProcessor;
use crate::segment::walk_segments;
use crate::target::TargetAccessExt;
use crate::{lfh, valloc, Error};

/// Walk every heap of the target process, emitting to `processor`.
///
/// Heaps are enumerated through the PEB's `ProcessHeaps` array and walked in
/// index order. Each heap is bracketed by `start_heap`/`finish_heap`; within
/// it, segments are scanned in chain order with LFH records interleaved by
/// address, and the virtually-allocated blocks follow all segments. The
/// first error aborts the run — later heaps would decode with the same
/// wrong key or layout.
pub fn walk_process_heaps<T, P>(target: &T, processor: &mut P) -> Result<(), Error>
where
    T: TargetAccess + ?Sized,
    P: HeapProcessor + ?Sized,
{
    let layout = HeapLayout::resolve(target)?;
    let flags = NtGlobalFlags::from_bits_truncate(target.nt_global_flag());
    if flags.contains(NtGlobalFlags::HEAP_PAGE_ALLOCS) {
        debug!("page heap enabled");
    } else if flags.contains(NtGlobalFlags::USER_STACK_TRACE_DB) {
        debug!("stack trace database enabled");
    } else {
        warn!("neither ust nor hpa is set; records carry no backtraces");
    }

    let mut index = 0;
    while let Some(heap_address) = heap_at(target, &layout, index)? {
        debug!("heap[{index}] at {heap_address:#x}");
        processor.start_heap(heap_address);
        walk_heap(target, &layout, flags, heap_address, processor)?;
        processor.finish_heap(heap_address);
        index += 1;
    }
    Ok(())
}

/// Address of the `index`th process heap, or `None` past the end.
fn heap_at<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    index: u32,
) -> Result<Option<u64>, Error> {
    let peb = target.adjusted_peb_address()?;
    let number_of_heaps = target.read_u32(peb + layout.peb_number_of_heaps)?;
    if index >= number_of_heaps {
        return Ok(None);
    }
    let process_heaps = target.read_ptr(peb + layout.peb_process_heaps, layout.pointer_size)?;
    let heap = target.read_ptr(
        process_heaps + layout.pointer_size * u64::from(index),
        layout.pointer_size,
    )?;
    Ok(if heap == 0 { None } else { Some(heap) })
}

fn walk_heap<T, P>(
    target: &T,
    layout: &HeapLayout,
    flags: NtGlobalFlags,
    heap_address: u64,
    processor: &mut P,
) -> Result<(), Error>
where
    T: TargetAccess + ?Sized,
    P: HeapProcessor + ?Sized,
{
    let mut lfh_records = lfh::collect_lfh_records(target, layout, flags, heap_address)?;
    lfh_records.sort_by_key(|r| r.address);
    debug!(
        "found {} LFH records in heap {heap_address:#x}",
        lfh_records.len()
    );

    let key = EncodingKey::read(target, layout, heap_address)?;

    let mut valloc_records =
        valloc::collect_valloc_records(target, layout, flags, heap_address, &key)?;
    valloc_records.sort_by_key(|r| r.address);
    debug!(
        "found {} valloc records in heap {heap_address:#x}",
        valloc_records.len()
    );

    walk_segments(
        target,
        layout,
        flags,
        heap_address,
        &key,
        &lfh_records,
        processor,
    )?;

    for record in &valloc_records {
        processor.register(record);
    }
    Ok(())
}
