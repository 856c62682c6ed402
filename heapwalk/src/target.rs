// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Width-checked reads over the raw [`TargetAccess`] oracle.

use heapwalk_common::format::PEB32_OFFSET;
use heapwalk_common::traits::TargetAccess;
use scroll::ctx::TryFromCtx;
use scroll::Pread;

use crate::Error;

/// Typed convenience reads every walker stage goes through. Each failure is
/// converted into an [`Error`] carrying the offending address, so a bad read
/// deep in a list traversal still names the spot.
pub(crate) trait TargetAccessExt: TargetAccess {
    fn read_exact(&self, address: u64, buf: &mut [u8]) -> Result<(), Error> {
        if self.read_memory(address, buf) {
            Ok(())
        } else {
            Err(Error::MemoryReadFailed {
                address,
                width: buf.len(),
            })
        }
    }

    fn read_u8(&self, address: u64) -> Result<u8, Error> {
        let mut buf = [0u8; 1];
        self.read_exact(address, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, address: u64) -> Result<u16, Error> {
        let mut buf = [0u8; 2];
        self.read_exact(address, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, address: u64) -> Result<u32, Error> {
        let mut buf = [0u8; 4];
        self.read_exact(address, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, address: u64) -> Result<u64, Error> {
        let mut buf = [0u8; 8];
        self.read_exact(address, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a pointer-width value, zero-extended to 64 bits.
    fn read_ptr(&self, address: u64, pointer_size: u64) -> Result<u64, Error> {
        if pointer_size == 8 {
            self.read_u64(address)
        } else {
            self.read_u32(address).map(u64::from)
        }
    }

    fn offset_of(
        &self,
        type_name: &'static str,
        field_name: &'static str,
    ) -> Result<u64, Error> {
        self.field_offset(type_name, field_name)
            .map(u64::from)
            .ok_or(Error::SymbolLookupFailed {
                type_name,
                field_name,
            })
    }

    fn size_of_type(&self, type_name: &'static str) -> Result<u64, Error> {
        self.type_size(type_name)
            .map(u64::from)
            .ok_or(Error::SymbolLookupFailed {
                type_name,
                field_name: "",
            })
    }

    /// PEB address, compensating for a 32-bit target observed by a 64-bit
    /// host, whose reported (native) PEB sits [`PEB32_OFFSET`] above the
    /// PEB32 the fixed offset tables describe.
    fn adjusted_peb_address(&self) -> Result<u64, Error> {
        let peb = self.peb_address().ok_or(Error::PebInaccessible)?;
        if !self.is_target_64bit() && self.is_host_64bit() {
            Ok(peb - PEB32_OFFSET)
        } else {
            Ok(peb)
        }
    }
}

impl<T: TargetAccess + ?Sized> TargetAccessExt for T {}

/// Parse a wire struct out of `buf`, blaming `address` on failure.
pub(crate) fn pread_struct<'a, S>(buf: &'a [u8], address: u64) -> Result<S, Error>
where
    S: TryFromCtx<'a, scroll::Endian, Error = scroll::Error>,
{
    buf.pread_with(0, scroll::LE)
        .map_err(|_| Error::MemoryReadFailed {
            address,
            width: buf.len(),
        })
}
