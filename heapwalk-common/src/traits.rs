// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

/// Read access to a quiesced target process.
///
/// Implementations wrap whatever is actually behind the target — a live
/// debuggee at a break-in, a crash dump, or a synthetic image in tests — and
/// expose the few facts the walker needs about it. The walker never writes
/// and never caches across calls, so implementations are free to be lazy.
///
/// The symbol queries back the 64-bit code path, where structure layouts
/// shift between OS releases and the debugger's type information is the only
/// reliable source. The 32-bit path runs from fixed offset tables and may be
/// used with an implementation whose symbol queries always return `None`.
pub trait TargetAccess {
    /// Fill `buf` from target memory starting at `address`.
    ///
    /// Returns `false` when any byte of the range cannot be read; partial
    /// reads are not surfaced.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> bool;

    /// Byte offset of `field_name` within the type `type_name`
    /// (e.g. `"ntdll!_HEAP"`, `"FrontEndHeap"`), from debug information.
    fn field_offset(&self, type_name: &str, field_name: &str) -> Option<u32>;

    /// Size in bytes of the type `type_name`, from debug information.
    fn type_size(&self, type_name: &str) -> Option<u32>;

    /// Address of the process-environment block.
    ///
    /// For a 32-bit target observed by a 64-bit host this is the native
    /// (64-bit) PEB; the caller compensates.
    fn peb_address(&self) -> Option<u64>;

    /// Whether the target process is 64-bit.
    fn is_target_64bit(&self) -> bool;

    /// Whether the observing host is 64-bit.
    fn is_host_64bit(&self) -> bool;

    /// Target OS version as `(major << 8) | minor`.
    fn os_version(&self) -> u32;

    /// Raw `NtGlobalFlag` value of the target process.
    fn nt_global_flag(&self) -> u32;
}
