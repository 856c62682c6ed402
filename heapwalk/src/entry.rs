// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Heap-entry header decoding.
//!
//! Every backend and virtual-alloc entry header is stored XOR-masked with a
//! per-heap key so that heap corruption is detectable: after unmasking, the
//! four leading bytes of the 8-byte tail must XOR to zero. LFH user-block
//! headers are the exception and are read raw.

use heapwalk_common::format::HEAP_ENTRY;
use heapwalk_common::traits::TargetAccess;

use crate::layout::HeapLayout;
use crate::target::{pread_struct, TargetAccessExt};
use crate::Error;

/// A heap's per-entry XOR mask: the entry-sized block stored in
/// `_HEAP::Encoding` (at heap+0x50 on 32-bit targets).
#[derive(Debug, Clone)]
pub struct EncodingKey {
    bytes: [u8; 16],
    len: usize,
}

impl EncodingKey {
    /// Read the encoding key of the heap at `heap_address`.
    pub fn read<T: TargetAccess + ?Sized>(
        target: &T,
        layout: &HeapLayout,
        heap_address: u64,
    ) -> Result<EncodingKey, Error> {
        let len = layout.entry_size as usize;
        let mut bytes = [0u8; 16];
        target.read_exact(heap_address + layout.heap_encoding, &mut bytes[..len])?;
        Ok(EncodingKey { bytes, len })
    }

    /// Build a key from raw bytes (8 for 32-bit heaps, 16 for 64-bit ones).
    pub fn from_bytes(key: &[u8]) -> EncodingKey {
        let mut bytes = [0u8; 16];
        let len = key.len().min(16);
        bytes[..len].copy_from_slice(&key[..len]);
        EncodingKey { bytes, len }
    }

    /// Unmask the entry header read from `address` and validate its checksum.
    ///
    /// `raw` must hold the full on-wire header (8 or 16 bytes matching this
    /// key); the decoded 8-byte tail is returned. A checksum mismatch means
    /// the heap is corrupt or the key was read from the wrong place, and is
    /// fatal for the walk.
    pub fn decode(&self, address: u64, raw: &[u8]) -> Result<HEAP_ENTRY, Error> {
        if raw.len() != self.len {
            return Err(Error::MemoryReadFailed {
                address,
                width: self.len,
            });
        }
        let mut bytes = [0u8; 16];
        for (i, b) in raw.iter().enumerate() {
            bytes[i] = b ^ self.bytes[i];
        }
        let tail = &bytes[self.len - 8..self.len];
        if tail[0] ^ tail[1] ^ tail[2] ^ tail[3] != 0 {
            return Err(Error::DecodeChecksumFailed { address });
        }
        pread_struct(tail, address)
    }
}

/// Read and decode the entry header at `address`.
pub(crate) fn read_decoded_entry<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    key: &EncodingKey,
    address: u64,
) -> Result<HEAP_ENTRY, Error> {
    let mut raw = [0u8; 16];
    let len = layout.entry_size as usize;
    target.read_exact(address, &mut raw[..len])?;
    key.decode(address, &raw[..len])
}

/// Read the never-masked entry tail of an LFH user block at `address`.
pub(crate) fn read_raw_entry<T: TargetAccess + ?Sized>(
    target: &T,
    layout: &HeapLayout,
    address: u64,
) -> Result<HEAP_ENTRY, Error> {
    let mut raw = [0u8; 16];
    let len = layout.entry_size as usize;
    target.read_exact(address, &mut raw[..len])?;
    pread_struct(&raw[len - 8..len], address)
}

#[cfg(test)]
mod test {
    use super::*;

    fn tail(size: u16, flags: u8, ext: u8) -> [u8; 8] {
        let s = size.to_le_bytes();
        [s[0], s[1], flags, s[0] ^ s[1] ^ flags, 0, 0, 0, ext]
    }

    #[test]
    fn test_decode_roundtrip_32() {
        let key = EncodingKey::from_bytes(&[0xaa, 0x55, 0x10, 0x20, 0x99, 0x77, 0x33, 0x44]);
        let plain = tail(0x15e, 0x01, 0x08);
        let mut wire = [0u8; 8];
        for i in 0..8 {
            wire[i] = plain[i] ^ [0xaa, 0x55, 0x10, 0x20, 0x99, 0x77, 0x33, 0x44][i];
        }
        let entry = key.decode(0x150480, &wire).unwrap();
        assert_eq!(entry.size, 0x15e);
        assert_eq!(entry.flags, 0x01);
        assert_eq!(entry.extended_block_signature, 0x08);
    }

    #[test]
    fn test_decode_roundtrip_64() {
        let mut keybytes = [0u8; 16];
        for (i, b) in keybytes.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(0x1f) ^ 0x5a;
        }
        let key = EncodingKey::from_bytes(&keybytes);
        let t = tail(0x40, 0x03, 0x00);
        let mut wire = [0u8; 16];
        for i in 0..8 {
            wire[i] = keybytes[i]; // prefix decodes to zero
            wire[8 + i] = t[i] ^ keybytes[8 + i];
        }
        let entry = key.decode(0x15000500, &wire).unwrap();
        assert_eq!(entry.size, 0x40);
        assert_eq!(entry.flags, 0x03);
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let keybytes = [0u8; 8];
        let key = EncodingKey::from_bytes(&keybytes);
        let mut plain = tail(0x10, 0x01, 0x00);
        plain[3] ^= 0xff;
        assert_eq!(
            key.decode(0x1000, &plain),
            Err(Error::DecodeChecksumFailed { address: 0x1000 })
        );
    }

    #[test]
    fn test_decode_checksum_lane_is_tail_only_on_64() {
        // Garbage in the 8-byte prefix must not affect the checksum.
        let key = EncodingKey::from_bytes(&[0u8; 16]);
        let t = tail(0x2, 0x01, 0x88);
        let mut wire = [0xffu8; 16];
        wire[8..].copy_from_slice(&t);
        let entry = key.decode(0x2000, &wire).unwrap();
        assert_eq!(entry.size, 0x2);
        assert_eq!(entry.extended_block_signature, 0x88);
    }
}
