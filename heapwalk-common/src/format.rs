// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! NT heap structure definitions.
//!
//! The user-mode heap has no public headers; the layouts here are the
//! reverse-engineered shapes ntdll actually writes, and they shift between
//! OS releases and bitnesses. Types named in SCREAMING_SNAKE match the
//! conventional debugger names (`dt ntdll!_HEAP_SEGMENT`) for the structures
//! they describe. Offsets that are not stable enough to bake into a struct
//! live in `heapwalk`'s layout tables instead.
#![allow(non_camel_case_types)]

use bitflags::bitflags;
use enum_primitive_derive::Primitive;
use scroll::{Pread, SizeWith};

/// Page size used for the uncommitted-range arithmetic of a segment.
pub const PAGE_SIZE: u64 = 0x1000;

/// Distance of the WOW64 `PEB32` below the native PEB reported for a 32-bit
/// target observed from a 64-bit host.
pub const PEB32_OFFSET: u64 = 0x1000;

/// OS versions are `(major << 8) | minor`; this is the Windows 8 boundary at
/// which several heap-internal offsets moved.
pub const OS_VERSION_WIN8: u32 = 0x0602;

/// Oldest version the fixed 32-bit offset tables are known for. Older
/// allocators do not encode their entry headers at all.
pub const OS_VERSION_VISTA: u32 = 0x0600;

/// Bytes covered by one `HEAP_ENTRY::size` unit on a 32-bit target.
pub const BLOCK_UNIT32: u64 = 8;
/// Bytes covered by one `HEAP_ENTRY::size` unit on a 64-bit target.
pub const BLOCK_UNIT64: u64 = 16;

bitflags! {
    /// The two `NtGlobalFlag` bits the walker reacts to.
    ///
    /// Neither implies the other; both change where an allocation's metadata
    /// lives relative to its entry header.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NtGlobalFlags: u32 {
        /// `FLG_USER_STACK_TRACE_DB` ("ust"): every allocation carries a
        /// pointer to an entry in the stack-trace database.
        const USER_STACK_TRACE_DB = 0x1000;
        /// `FLG_HEAP_PAGE_ALLOCS` ("hpa"): page heap inserts an extended
        /// header and guard pages around the user region.
        const HEAP_PAGE_ALLOCS = 0x0200_0000;
    }
}

/// `_HEAP::FrontEndHeapType` values.
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Debug, Primitive)]
pub enum FrontEndHeapType {
    /// No frontend; everything is served by the backend segments.
    Backend = 0x00,
    /// The pre-Vista lookaside lists. Never walked here.
    LookAside = 0x01,
    /// The low-fragmentation heap.
    LowFragmentation = 0x02,
}

/// `HEAP_ENTRY::flags` marker for a busy backend block.
pub const HEAP_ENTRY_BUSY: u8 = 0x01;
/// Busy marker when page heap is enabled (the guard metadata sets an extra bit).
pub const HEAP_ENTRY_BUSY_PAGE_HEAP: u8 = 0x03;
/// `extended_block_signature` value that terminates a backend scan when a
/// diagnostic mode is active.
pub const HEAP_ENTRY_SENTINEL: u8 = 0x03;
/// `extended_block_signature` of a busy LFH user block.
pub const LFH_BLOCK_BUSY: u8 = 0x88;
/// `extended_block_signature` of a busy LFH user block when the stack-trace
/// database is enabled.
pub const LFH_BLOCK_BUSY_UST: u8 = 0xc2;

/// A doubly-linked list link pair, 32-bit flavor.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct LIST_ENTRY32 {
    pub flink: u32,
    pub blink: u32,
}

/// A doubly-linked list link pair, 64-bit flavor.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct LIST_ENTRY64 {
    pub flink: u64,
    pub blink: u64,
}

/// The 8-byte heap-entry header every block starts with.
///
/// On 64-bit targets this is the tail of [`HEAP_ENTRY64`]; the walker decodes
/// both shapes into this struct. On the wire the four leading bytes are
/// XOR-obfuscated with the owning heap's encoding key and must XOR to zero
/// after unmasking (`small_tag_index` is the checksum byte).
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pread, SizeWith)]
pub struct HEAP_ENTRY {
    /// Block size in [`BLOCK_UNIT32`]/[`BLOCK_UNIT64`] units, header included.
    pub size: u16,
    pub flags: u8,
    /// XOR of the first three bytes of the decoded header.
    pub small_tag_index: u8,
    pub previous_size: u16,
    pub segment_offset: u8,
    /// Busy/free discriminator for LFH blocks, unused-byte count for plain
    /// busy blocks, sentinel marker for diagnostic modes.
    pub extended_block_signature: u8,
}

/// The 16-byte heap-entry header of a 64-bit target.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct HEAP_ENTRY64 {
    pub previous_block_private_data: u64,
    pub size: u16,
    pub flags: u8,
    pub small_tag_index: u8,
    pub previous_size: u16,
    pub segment_offset: u8,
    pub extended_block_signature: u8,
}

/// `_HEAP_SEGMENT` of a 32-bit target. A heap is also its own first segment,
/// so this doubles as the prefix of `_HEAP`.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct HEAP_SEGMENT {
    pub entry: HEAP_ENTRY,
    pub segment_signature: u32,
    pub segment_flags: u32,
    pub segment_list_entry: LIST_ENTRY32,
    pub heap: u32,
    pub base_address: u32,
    pub number_of_pages: u32,
    pub first_entry: u32,
    pub last_valid_entry: u32,
    pub number_of_uncommitted_pages: u32,
    pub number_of_uncommitted_ranges: u32,
    pub segment_allocator_back_trace_index: u16,
    pub reserved: u16,
    pub ucr_segment_list: LIST_ENTRY32,
}

/// `_HEAP_SEGMENT` of a 64-bit target.
#[derive(Debug, Copy, Clone, Default, Pread, SizeWith)]
pub struct HEAP_SEGMENT64 {
    pub entry: HEAP_ENTRY64,
    pub segment_signature: u32,
    pub segment_flags: u32,
    pub segment_list_entry: LIST_ENTRY64,
    pub heap: u64,
    pub base_address: u64,
    pub number_of_pages: u32,
    pub padding1: u32,
    pub first_entry: u64,
    pub last_valid_entry: u64,
    pub number_of_uncommitted_pages: u32,
    pub number_of_uncommitted_ranges: u32,
    pub segment_allocator_back_trace_index: u16,
    pub reserved: u16,
    pub padding2: u32,
    pub ucr_segment_list: LIST_ENTRY64,
}

/// Byte size of [`HEAP_ENTRY`] on the wire.
pub const HEAP_ENTRY_SIZE: u64 = 8;
/// Byte size of [`HEAP_ENTRY64`] on the wire.
pub const HEAP_ENTRY64_SIZE: u64 = 16;
/// Byte size of [`HEAP_SEGMENT`] on the wire.
pub const HEAP_SEGMENT_SIZE: usize = 64;
/// Byte size of [`HEAP_SEGMENT64`] on the wire.
pub const HEAP_SEGMENT64_SIZE: usize = 112;
