// Copyright 2016 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Synthetic heap targets for testing.
//!
//! This intentionally does not share any layout code with `heapwalk` itself,
//! so that tests catch incorrect changes to the walker's offset tables.
//! Basic usage is to build each structure as a little-endian
//! [`test_assembler::Section`], [`place`][SynthTarget::place] it at its
//! target address, and hand the finished [`SynthTarget`] to the walker as
//! its memory/symbol oracle.

// Some test_assembler types do not have Debug, so be a bit more lenient here.
#![allow(missing_debug_implementations)]

use std::collections::HashMap;

use heapwalk_common::traits::TargetAccess;
use test_assembler::Section;

/// `(major << 8) | minor` for Windows 7, the newest pre-Win8 layout.
pub const OS_VERSION_WIN7: u32 = 0x0601;

/// A sparse target address space plus a fake symbol table.
///
/// Reads succeed only within a single placed region; everything else fails
/// the way an uncommitted page would.
pub struct SynthTarget {
    target64: bool,
    host64: bool,
    os_version: u32,
    nt_global_flag: u32,
    peb_address: Option<u64>,
    regions: Vec<(u64, Vec<u8>)>,
    field_offsets: HashMap<(String, String), u32>,
    type_sizes: HashMap<String, u32>,
}

impl SynthTarget {
    /// A 32-bit target observed by a 32-bit host.
    pub fn target32(os_version: u32) -> SynthTarget {
        SynthTarget {
            target64: false,
            host64: false,
            os_version,
            nt_global_flag: 0,
            peb_address: None,
            regions: Vec::new(),
            field_offsets: HashMap::new(),
            type_sizes: HashMap::new(),
        }
    }

    /// A 64-bit target observed by a 64-bit host.
    pub fn target64(os_version: u32) -> SynthTarget {
        SynthTarget {
            target64: true,
            host64: true,
            ..SynthTarget::target32(os_version)
        }
    }

    /// Override the host bitness (for WOW64 setups).
    pub fn host64(mut self, host64: bool) -> SynthTarget {
        self.host64 = host64;
        self
    }

    /// Set the target's raw `NtGlobalFlag`.
    pub fn nt_global_flag(mut self, flags: u32) -> SynthTarget {
        self.nt_global_flag = flags;
        self
    }

    /// Set the PEB address the oracle reports (the native one; the walker
    /// compensates for WOW64 itself).
    pub fn peb(mut self, address: u64) -> SynthTarget {
        self.peb_address = Some(address);
        self
    }

    /// Materialize `section` into the address space at `address`.
    pub fn place(self, address: u64, section: Section) -> SynthTarget {
        let bytes = section
            .get_contents()
            .expect("section contains undefined labels");
        self.place_bytes(address, bytes)
    }

    /// Place raw bytes at `address`.
    pub fn place_bytes(mut self, address: u64, bytes: Vec<u8>) -> SynthTarget {
        self.regions.push((address, bytes));
        self
    }

    /// Teach the symbol oracle one field offset.
    pub fn field_offset(mut self, type_name: &str, field_name: &str, offset: u32) -> SynthTarget {
        self.field_offsets
            .insert((type_name.to_string(), field_name.to_string()), offset);
        self
    }

    /// Teach the symbol oracle one type size.
    pub fn type_size(mut self, type_name: &str, size: u32) -> SynthTarget {
        self.type_sizes.insert(type_name.to_string(), size);
        self
    }

    /// Install the standard x64 symbol table (see [`sym`]).
    pub fn x64_symbols(self, win8: bool) -> SynthTarget {
        let (front_end_type, front_end, zones, subsegment_size) = if win8 {
            (
                sym::HEAP_FRONT_END_HEAP_TYPE_WIN8,
                sym::HEAP_FRONT_END_HEAP_WIN8,
                sym::HEAP_SUB_SEGMENT_ZONES_WIN8,
                sym::HEAP_SUBSEGMENT_SIZE_WIN8,
            )
        } else {
            (
                sym::HEAP_FRONT_END_HEAP_TYPE_WIN7,
                sym::HEAP_FRONT_END_HEAP_WIN7,
                sym::HEAP_SUB_SEGMENT_ZONES_WIN7,
                sym::HEAP_SUBSEGMENT_SIZE_WIN7,
            )
        };
        self.field_offset("ntdll!_PEB", "NumberOfHeaps", sym::PEB_NUMBER_OF_HEAPS)
            .field_offset("ntdll!_PEB", "ProcessHeaps", sym::PEB_PROCESS_HEAPS)
            .field_offset("ntdll!_HEAP", "Encoding", sym::HEAP_ENCODING)
            .field_offset("ntdll!_HEAP", "FrontEndHeapType", front_end_type)
            .field_offset("ntdll!_HEAP", "FrontEndHeap", front_end)
            .field_offset(
                "ntdll!_HEAP",
                "VirtualAllocdBlocks",
                sym::HEAP_VIRTUAL_ALLOCD_BLOCKS,
            )
            .field_offset("ntdll!_LFH_HEAP", "SubSegmentZones", zones)
            .field_offset(
                "ntdll!_LFH_BLOCK_ZONE",
                "FreePointer",
                sym::LFH_BLOCK_ZONE_FREE_POINTER,
            )
            .type_size("ntdll!_LFH_BLOCK_ZONE", sym::LFH_BLOCK_ZONE_SIZE)
            .field_offset(
                "ntdll!_HEAP_SUBSEGMENT",
                "UserBlocks",
                sym::HEAP_SUBSEGMENT_USER_BLOCKS,
            )
            .field_offset(
                "ntdll!_HEAP_SUBSEGMENT",
                "BlockSize",
                sym::HEAP_SUBSEGMENT_BLOCK_SIZE,
            )
            .field_offset(
                "ntdll!_HEAP_SUBSEGMENT",
                "BlockCount",
                sym::HEAP_SUBSEGMENT_BLOCK_COUNT,
            )
            .type_size("ntdll!_HEAP_SUBSEGMENT", subsegment_size)
            .field_offset(
                "ntdll!_HEAP_USERDATA_HEADER",
                "FirstAllocationOffset",
                sym::USERDATA_FIRST_ALLOCATION_OFFSET,
            )
    }
}

impl TargetAccess for SynthTarget {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> bool {
        for (base, bytes) in &self.regions {
            if address >= *base {
                let offset = (address - base) as usize;
                if offset + buf.len() <= bytes.len() {
                    buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
                    return true;
                }
            }
        }
        false
    }

    fn field_offset(&self, type_name: &str, field_name: &str) -> Option<u32> {
        self.field_offsets
            .get(&(type_name.to_string(), field_name.to_string()))
            .copied()
    }

    fn type_size(&self, type_name: &str) -> Option<u32> {
        self.type_sizes.get(type_name).copied()
    }

    fn peb_address(&self) -> Option<u64> {
        self.peb_address
    }

    fn is_target_64bit(&self) -> bool {
        self.target64
    }

    fn is_host_64bit(&self) -> bool {
        self.host64
    }

    fn os_version(&self) -> u32 {
        self.os_version
    }

    fn nt_global_flag(&self) -> u32 {
        self.nt_global_flag
    }
}

/// Field offsets served by [`SynthTarget::x64_symbols`], shaped like the
/// public Win7/Win8 x64 ntdll layouts.
pub mod sym {
    pub const PEB_NUMBER_OF_HEAPS: u32 = 0xe8;
    pub const PEB_PROCESS_HEAPS: u32 = 0xf0;
    pub const HEAP_ENCODING: u32 = 0x80;
    pub const HEAP_FRONT_END_HEAP_TYPE_WIN7: u32 = 0x182;
    pub const HEAP_FRONT_END_HEAP_WIN7: u32 = 0x178;
    pub const HEAP_SUB_SEGMENT_ZONES_WIN7: u32 = 0x28;
    pub const HEAP_FRONT_END_HEAP_TYPE_WIN8: u32 = 0x17a;
    pub const HEAP_FRONT_END_HEAP_WIN8: u32 = 0x170;
    pub const HEAP_SUB_SEGMENT_ZONES_WIN8: u32 = 0x18;
    pub const HEAP_VIRTUAL_ALLOCD_BLOCKS: u32 = 0x118;
    pub const LFH_BLOCK_ZONE_FREE_POINTER: u32 = 0x10;
    pub const LFH_BLOCK_ZONE_SIZE: u32 = 0x20;
    pub const HEAP_SUBSEGMENT_USER_BLOCKS: u32 = 0x8;
    pub const HEAP_SUBSEGMENT_BLOCK_SIZE: u32 = 0x18;
    pub const HEAP_SUBSEGMENT_BLOCK_COUNT: u32 = 0x1c;
    pub const HEAP_SUBSEGMENT_SIZE_WIN7: u32 = 0x28;
    pub const HEAP_SUBSEGMENT_SIZE_WIN8: u32 = 0x30;
    pub const USERDATA_FIRST_ALLOCATION_OFFSET: u32 = 0x20;
}

/// Build the 8-byte entry tail, computing the checksum byte so the decoded
/// header validates.
pub fn entry_tail(
    size: u16,
    flags: u8,
    previous_size: u16,
    segment_offset: u8,
    extended_block_signature: u8,
) -> [u8; 8] {
    let size_bytes = size.to_le_bytes();
    let previous = previous_size.to_le_bytes();
    [
        size_bytes[0],
        size_bytes[1],
        flags,
        size_bytes[0] ^ size_bytes[1] ^ flags,
        previous[0],
        previous[1],
        segment_offset,
        extended_block_signature,
    ]
}

/// Mask a 32-bit entry tail with `key` the way the allocator stores it.
pub fn encode_entry32(tail: [u8; 8], key: [u8; 8]) -> [u8; 8] {
    let mut wire = [0u8; 8];
    for i in 0..8 {
        wire[i] = tail[i] ^ key[i];
    }
    wire
}

/// Build and mask a 64-bit entry (zero `previous_block_private_data`).
pub fn encode_entry64(tail: [u8; 8], key: [u8; 16]) -> [u8; 16] {
    let mut wire = [0u8; 16];
    for i in 0..8 {
        wire[i] = key[i];
        wire[8 + i] = tail[i] ^ key[8 + i];
    }
    wire
}

/// An unmasked 64-bit entry, as LFH user blocks store them.
pub fn raw_entry64(tail: [u8; 8]) -> [u8; 16] {
    let mut wire = [0u8; 16];
    wire[8..].copy_from_slice(&tail);
    wire
}

/// Zero-pad `section` out to `offset` bytes from its start.
pub fn pad_to(section: Section, offset: u64) -> Section {
    let size = section.size();
    assert!(
        offset >= size,
        "section already {size:#x} bytes, cannot pad to {offset:#x}"
    );
    section.append_repeated(0, (offset - size) as usize)
}

#[cfg(test)]
mod test {
    use super::*;
    use test_assembler::{Endian, Section};

    #[test]
    fn test_read_memory_bounds() {
        let target = SynthTarget::target32(OS_VERSION_WIN7)
            .place(0x1000, Section::with_endian(Endian::Little).D32(0xaabbccdd));
        let mut buf = [0u8; 4];
        assert!(target.read_memory(0x1000, &mut buf));
        assert_eq!(buf, [0xdd, 0xcc, 0xbb, 0xaa]);
        assert!(!target.read_memory(0x1002, &mut buf));
        assert!(!target.read_memory(0x2000, &mut buf));
    }

    #[test]
    fn test_entry_tail_checksum() {
        let tail = entry_tail(0x15e, 0x01, 0x20, 0, 0x08);
        assert_eq!(tail[0] ^ tail[1] ^ tail[2] ^ tail[3], 0);
        assert_eq!(u16::from_le_bytes([tail[0], tail[1]]), 0x15e);
        assert_eq!(tail[7], 0x08);
    }

    #[test]
    fn test_encode_is_involutive() {
        let key = [0xaa, 0x55, 0x10, 0x20, 0x99, 0x77, 0x33, 0x44];
        let tail = entry_tail(0x4, 0x01, 0, 0, 0);
        let wire = encode_entry32(tail, key);
        assert_eq!(encode_entry32(wire, key), tail);
    }
}
