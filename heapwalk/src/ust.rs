// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Stack-trace-database records.
//!
//! When the `ust` diagnostic is on, ntdll keeps every allocation backtrace
//! in a process-wide database; heap records carry the address of their
//! `RTL_STACK_TRACE_ENTRY`. The record is a depth-prefixed array of frame
//! pointers.

use heapwalk_common::traits::TargetAccess;

use crate::target::TargetAccessExt;
use crate::Error;

// RTL_STACK_TRACE_ENTRY: HashChain, TraceCount, Index, then the depth and
// the frame array.
const DEPTH_OFFSET32: u64 = 0xa;
const FRAMES_OFFSET32: u64 = 0xc;
const DEPTH_OFFSET64: u64 = 0xe;
const FRAMES_OFFSET64: u64 = 0x10;

/// The database stores at most this many frames per entry.
pub const MAX_TRACE_DEPTH: u16 = 32;

/// Read the frame pointers of the stack-trace record at `ust_address`,
/// outermost last.
pub fn read_stack_trace<T: TargetAccess + ?Sized>(
    target: &T,
    ust_address: u64,
) -> Result<Vec<u64>, Error> {
    let (depth_offset, frames_offset, pointer_size) = if target.is_target_64bit() {
        (DEPTH_OFFSET64, FRAMES_OFFSET64, 8)
    } else {
        (DEPTH_OFFSET32, FRAMES_OFFSET32, 4)
    };
    let depth = target.read_u16(ust_address + depth_offset)?.min(MAX_TRACE_DEPTH);
    let mut frames = Vec::with_capacity(usize::from(depth));
    for index in 0..u64::from(depth) {
        frames.push(target.read_ptr(
            ust_address + frames_offset + index * pointer_size,
            pointer_size,
        )?);
    }
    Ok(frames)
}
