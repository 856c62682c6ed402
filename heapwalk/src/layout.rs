// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Per-target layout descriptors.
//!
//! Rather than carrying parallel 32- and 64-bit walkers, every stage is
//! layout-agnostic and reads its offsets from a [`HeapLayout`] resolved once
//! per walk. For 64-bit targets the heap-internal offsets come from debug
//! symbols, because they move between OS releases; for 32-bit (WOW) targets
//! symbol coverage is unreliable and the tables below carry the offsets known
//! for the supported versions. The record-parser and virtual-alloc offsets
//! are fixed per bitness on every supported OS and are baked in directly.

use heapwalk_common::format::{OS_VERSION_VISTA, OS_VERSION_WIN8};
use heapwalk_common::traits::TargetAccess;

use crate::target::TargetAccessExt;
use crate::Error;

/// Offsets and unit sizes for one supported bitness × OS-version flavor.
///
/// All `heap_*` fields are relative to the heap base, `zone_*` to a
/// `_LFH_BLOCK_ZONE`, `subsegment_*` to a `_HEAP_SUBSEGMENT`. The record and
/// `valloc_*` offsets are relative to the end of the entry header and to a
/// virtual-alloc list entry respectively.
#[derive(Debug, Clone)]
pub struct HeapLayout {
    pub pointer_size: u64,
    /// Bytes covered by one `HEAP_ENTRY::size` unit.
    pub block_unit: u64,
    /// On-wire size of the entry header.
    pub entry_size: u64,
    /// Whether the target is Windows 8 or later.
    pub win8: bool,

    // PEB
    pub peb_number_of_heaps: u64,
    pub peb_process_heaps: u64,

    // _HEAP
    pub heap_encoding: u64,
    pub heap_front_end_heap_type: u64,
    pub heap_front_end_heap: u64,
    pub heap_virtual_allocd_blocks: u64,
    /// Offset of `_HEAP_SEGMENT::segment_list_entry`; subtracted from a
    /// `Flink` to recover the next segment base.
    pub heap_segment_list_entry: u64,

    // LFH frontend
    pub lfh_sub_segment_zones: u64,
    pub zone_free_pointer: u64,
    /// Size of `_LFH_BLOCK_ZONE`; also the pre-Win8 offset of the first
    /// block inside a user-blocks region.
    pub zone_header_size: u64,
    pub subsegment_size: u64,
    pub subsegment_user_blocks: u64,
    pub subsegment_block_size: u64,
    pub subsegment_block_count: u64,
    /// Offset of `_HEAP_USERDATA_HEADER::FirstAllocationOffset` (Win8+ only).
    pub user_blocks_first_allocation_offset: u64,

    // Record parser, relative to the end of the entry header.
    pub ust_offset_page_heap: u64,
    pub user_size_offset_page_heap: u64,
    pub user_offset_page_heap: u64,
    pub extra_offset_ust: u64,
    pub user_offset_ust: u64,

    // Virtual-alloc blocks, relative to the list entry.
    pub valloc_size: u64,
    pub valloc_entry: u64,
    pub valloc_ust: u64,
    pub valloc_user_ust: u64,
    pub valloc_user: u64,
}

impl HeapLayout {
    /// Build the layout for `target`, consulting debug symbols on 64-bit.
    pub fn resolve<T: TargetAccess + ?Sized>(target: &T) -> Result<HeapLayout, Error> {
        let os_version = target.os_version();
        if os_version < OS_VERSION_VISTA {
            return Err(Error::UnsupportedOsVersion { os_version });
        }
        let win8 = os_version >= OS_VERSION_WIN8;
        if target.is_target_64bit() {
            HeapLayout::resolve64(target, win8)
        } else {
            Ok(HeapLayout::fixed32(win8))
        }
    }

    fn fixed32(win8: bool) -> HeapLayout {
        HeapLayout {
            pointer_size: 4,
            block_unit: 8,
            entry_size: 8,
            win8,

            peb_number_of_heaps: 0x88,
            peb_process_heaps: 0x90,

            heap_encoding: 0x50,
            heap_front_end_heap_type: if win8 { 0xd6 } else { 0xda },
            heap_front_end_heap: if win8 { 0xd0 } else { 0xd4 },
            heap_virtual_allocd_blocks: if win8 { 0x9c } else { 0xa0 },
            heap_segment_list_entry: 0x10,

            lfh_sub_segment_zones: if win8 { 0x4 } else { 0x18 },
            zone_free_pointer: 0x8,
            zone_header_size: 0x10,
            subsegment_size: if win8 { 0x28 } else { 0x20 },
            subsegment_user_blocks: 0x4,
            subsegment_block_size: if win8 { 0x14 } else { 0x10 },
            subsegment_block_count: if win8 { 0x18 } else { 0x14 },
            user_blocks_first_allocation_offset: 0x10,

            ust_offset_page_heap: 0x18,
            user_size_offset_page_heap: 0x8,
            user_offset_page_heap: 0x20,
            extra_offset_ust: 0xc,
            user_offset_ust: 0x10,

            valloc_size: 0x10,
            valloc_entry: 0x18,
            valloc_ust: 0x20,
            valloc_user_ust: 0x30,
            valloc_user: 0x20,
        }
    }

    fn resolve64<T: TargetAccess + ?Sized>(
        target: &T,
        win8: bool,
    ) -> Result<HeapLayout, Error> {
        // Only resolved on Win8+, where the first block of a user-blocks
        // region is found through its header rather than a fixed offset.
        let first_allocation_offset = if win8 {
            target.offset_of("ntdll!_HEAP_USERDATA_HEADER", "FirstAllocationOffset")?
        } else {
            0
        };
        Ok(HeapLayout {
            pointer_size: 8,
            block_unit: 16,
            entry_size: 16,
            win8,

            peb_number_of_heaps: target.offset_of("ntdll!_PEB", "NumberOfHeaps")?,
            peb_process_heaps: target.offset_of("ntdll!_PEB", "ProcessHeaps")?,

            heap_encoding: target.offset_of("ntdll!_HEAP", "Encoding")?,
            heap_front_end_heap_type: target.offset_of("ntdll!_HEAP", "FrontEndHeapType")?,
            heap_front_end_heap: target.offset_of("ntdll!_HEAP", "FrontEndHeap")?,
            heap_virtual_allocd_blocks: target
                .offset_of("ntdll!_HEAP", "VirtualAllocdBlocks")?,
            heap_segment_list_entry: 0x18,

            lfh_sub_segment_zones: target.offset_of("ntdll!_LFH_HEAP", "SubSegmentZones")?,
            zone_free_pointer: target.offset_of("ntdll!_LFH_BLOCK_ZONE", "FreePointer")?,
            zone_header_size: target.size_of_type("ntdll!_LFH_BLOCK_ZONE")?,
            subsegment_size: target.size_of_type("ntdll!_HEAP_SUBSEGMENT")?,
            subsegment_user_blocks: target.offset_of("ntdll!_HEAP_SUBSEGMENT", "UserBlocks")?,
            subsegment_block_size: target.offset_of("ntdll!_HEAP_SUBSEGMENT", "BlockSize")?,
            subsegment_block_count: target.offset_of("ntdll!_HEAP_SUBSEGMENT", "BlockCount")?,
            user_blocks_first_allocation_offset: first_allocation_offset,

            ust_offset_page_heap: 0x30,
            user_size_offset_page_heap: 0x10,
            user_offset_page_heap: 0x40,
            extra_offset_ust: 0x1c,
            user_offset_ust: 0x20,

            valloc_size: 0x20,
            valloc_entry: 0x30,
            valloc_ust: 0x40,
            valloc_user_ust: 0x60,
            valloc_user: 0x40,
        })
    }
}
