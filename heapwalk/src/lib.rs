// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! A library for walking the user-mode heaps of a Windows target.
//!
//! Given read access to a quiesced process — a live debuggee at a break-in or
//! a crash dump — this crate enumerates every busy allocation across all of
//! the process's NT heaps: the backend segment chains, the
//! low-fragmentation-heap frontend, and the virtually-allocated large-block
//! lists. Each allocation is surfaced as a [`HeapRecord`] to a
//! [`HeapProcessor`] sink, in ascending address order within each segment.
//!
//! The walker understands both bitnesses and the layout changes around
//! Windows 8, and it honors the two diagnostic modes that relocate an
//! allocation's metadata: the user-mode stack-trace database (`ust`) and the
//! page heap (`hpa`). The access boundary is the
//! [`TargetAccess`] trait; nothing here touches a live process directly.
//!
//! # Examples
//!
//! ```no_run
//! use heapwalk::{walk_process_heaps, SummaryProcessor};
//! # fn walk(target: &impl heapwalk::TargetAccess) -> Result<(), heapwalk::Error> {
//! let mut summary = SummaryProcessor::new();
//! walk_process_heaps(target, &mut summary)?;
//! summary.write_report(&mut std::io::stdout()).ok();
//! # Ok(())
//! # }
//! ```

mod entry;
mod layout;
mod lfh;
mod processor;
mod record;
mod segment;
mod target;
mod ust;
mod valloc;
mod walker;

pub use heapwalk_common::format::NtGlobalFlags;
pub use heapwalk_common::traits::TargetAccess;

pub use crate::entry::EncodingKey;
pub use crate::layout::HeapLayout;
pub use crate::processor::{HeapProcessor, SummaryProcessor, UmdhProcessor, UstRecord};
pub use crate::record::HeapRecord;
pub use crate::ust::read_stack_trace;
pub use crate::walker::walk_process_heaps;

/// Errors encountered while walking a target's heaps.
///
/// Any of these aborts the walk of the current heap, and the orchestrator
/// halts the whole run rather than continuing to later heaps: a checksum or
/// layout failure almost always means the encoding key or the offset tables
/// are wrong for this target, and every subsequent heap would decode to
/// garbage.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// A read of target memory could not be satisfied at the requested width.
    #[error("memory read of {width} bytes at {address:#x} failed")]
    MemoryReadFailed { address: u64, width: usize },
    /// Debug information had no answer for a type or field the 64-bit layout
    /// tables need. An empty `field_name` denotes a whole-type size query.
    #[error("symbol lookup of {type_name} {field_name} failed")]
    SymbolLookupFailed {
        type_name: &'static str,
        field_name: &'static str,
    },
    /// A heap-entry header failed its checksum after unmasking.
    #[error("heap entry checksum mismatch at {address:#x}")]
    DecodeChecksumFailed { address: u64 },
    /// A size field read from the target contradicts the block it belongs to.
    #[error("invalid {kind} {observed:#x} (bound {bound:#x})")]
    SizeInvariantViolated {
        kind: &'static str,
        observed: u64,
        bound: u64,
    },
    /// The target's OS predates the layouts this walker knows.
    #[error("unsupported target OS version {os_version:#x}")]
    UnsupportedOsVersion { os_version: u32 },
    /// The process-environment block could not be located or read.
    #[error("process environment block is not accessible")]
    PebInaccessible,
}

impl Error {
    /// Returns just the name of the error, as a more human-friendly version
    /// of an error-code for error logging.
    pub fn name(&self) -> &'static str {
        match self {
            Error::MemoryReadFailed { .. } => "MemoryReadFailed",
            Error::SymbolLookupFailed { .. } => "SymbolLookupFailed",
            Error::DecodeChecksumFailed { .. } => "DecodeChecksumFailed",
            Error::SizeInvariantViolated { .. } => "SizeInvariantViolated",
            Error::UnsupportedOsVersion { .. } => "UnsupportedOsVersion",
            Error::PebInaccessible => "PebInaccessible",
        }
    }
}
