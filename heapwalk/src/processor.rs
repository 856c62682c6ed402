// Copyright 2015 Ted Mielczarek. See the COPYRIGHT
// file at the top-level directory of this distribution.

//! Consumers of the walk.
//!
//! The walker pushes every discovery through [`HeapProcessor`]; the two
//! implementations here cover the usual questions — "what is using the heap"
//! ([`SummaryProcessor`]) and "give me a diffable log" ([`UmdhProcessor`]).

use std::collections::BTreeMap;
use std::io::{self, Write};

use heapwalk_common::traits::TargetAccess;

use crate::record::HeapRecord;
use crate::ust::read_stack_trace;

/// A sink for the walker's discoveries.
///
/// Calls arrive in a fixed shape per heap: `start_heap`, then for each
/// segment `start_segment`, zero or more `register` in strictly ascending
/// block address, `finish_segment`; after all segments the heap's
/// virtually-allocated blocks are `register`ed in ascending address, then
/// `finish_heap`. No ordering is promised across heaps. Records are not
/// mutated after emission.
pub trait HeapProcessor {
    fn start_heap(&mut self, heap_address: u64) {
        let _ = heap_address;
    }

    fn start_segment(&mut self, segment_base: u64, last_valid_entry: u64) {
        let _ = (segment_base, last_valid_entry);
    }

    /// One busy allocation.
    fn register(&mut self, record: &HeapRecord);

    fn finish_segment(&mut self, segment_base: u64, last_valid_entry: u64) {
        let _ = (segment_base, last_valid_entry);
    }

    fn finish_heap(&mut self, heap_address: u64) {
        let _ = heap_address;
    }
}

/// Aggregated statistics for one allocation site (stack-trace-database
/// entry). Allocations with no backtrace pool under `ust_address == 0`.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct UstRecord {
    pub ust_address: u64,
    pub count: u64,
    pub total_size: u64,
    pub max_size: u64,
    /// Block address of the largest allocation seen for this site.
    pub largest_entry: u64,
}

/// Per-allocation-site usage statistics over a whole walk.
#[derive(Debug, Default)]
pub struct SummaryProcessor {
    records: BTreeMap<u64, UstRecord>,
}

impl SummaryProcessor {
    pub fn new() -> SummaryProcessor {
        SummaryProcessor::default()
    }

    /// The aggregated statistics, heaviest sites first.
    pub fn records(&self) -> Vec<UstRecord> {
        let mut records: Vec<UstRecord> = self.records.values().copied().collect();
        records.sort_by(|a, b| {
            b.total_size
                .cmp(&a.total_size)
                .then(a.ust_address.cmp(&b.ust_address))
        });
        records
    }

    /// Write the usage table. Whatever was accumulated before an aborted
    /// walk is still reported.
    pub fn write_report<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writeln!(
            writer,
            "{:>18} {:>10} {:>14} {:>14} {:>18}",
            "ust address", "count", "total bytes", "max bytes", "largest entry"
        )?;
        for record in self.records() {
            writeln!(
                writer,
                "{:>#18x} {:>10} {:>#14x} {:>#14x} {:>#18x}",
                record.ust_address,
                record.count,
                record.total_size,
                record.max_size,
                record.largest_entry
            )?;
        }
        Ok(())
    }
}

impl HeapProcessor for SummaryProcessor {
    fn register(&mut self, record: &HeapRecord) {
        let stats = self
            .records
            .entry(record.ust_address)
            .or_insert_with(|| UstRecord {
                ust_address: record.ust_address,
                ..UstRecord::default()
            });
        stats.count += 1;
        stats.total_size += record.user_size;
        if record.user_size > stats.max_size {
            stats.max_size = record.user_size;
            stats.largest_entry = record.address;
        }
    }
}

/// Writes a UMDH-style heap log: per-heap banners, one grouped line per
/// allocation site, optionally followed by that site's raw frame addresses
/// read from the stack-trace database.
///
/// Write errors are sticky and surfaced by [`UmdhProcessor::finish`], so the
/// walk itself never stops over a full disk.
pub struct UmdhProcessor<'a, W: Write> {
    writer: W,
    target: Option<&'a dyn TargetAccess>,
    buckets: BTreeMap<u64, (u64, u64)>,
    error: Option<io::Error>,
}

impl<'a, W: Write> UmdhProcessor<'a, W> {
    /// A log without backtrace bodies.
    pub fn new(writer: W) -> UmdhProcessor<'a, W> {
        UmdhProcessor {
            writer,
            target: None,
            buckets: BTreeMap::new(),
            error: None,
        }
    }

    /// A log whose allocation sites are expanded into frame addresses read
    /// back from `target`'s stack-trace database.
    pub fn with_traces(writer: W, target: &'a dyn TargetAccess) -> UmdhProcessor<'a, W> {
        UmdhProcessor {
            writer,
            target: Some(target),
            buckets: BTreeMap::new(),
            error: None,
        }
    }

    /// Flush and hand back the writer, or the first write error.
    pub fn finish(mut self) -> io::Result<W> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    fn emit(&mut self, args: std::fmt::Arguments) {
        if self.error.is_none() {
            if let Err(error) = self.writer.write_fmt(args) {
                self.error = Some(error);
            }
        }
    }
}

impl<W: Write> HeapProcessor for UmdhProcessor<'_, W> {
    fn start_heap(&mut self, heap_address: u64) {
        self.buckets.clear();
        self.emit(format_args!(
            "*- - - - - - - - - - Start of data for heap @ {heap_address:x} - - - - - - - - - -\n"
        ));
    }

    fn register(&mut self, record: &HeapRecord) {
        let bucket = self.buckets.entry(record.ust_address).or_insert((0, 0));
        bucket.0 += 1;
        bucket.1 += record.user_size;
    }

    fn finish_heap(&mut self, heap_address: u64) {
        let mut sites: Vec<(u64, u64, u64)> = self
            .buckets
            .iter()
            .map(|(&ust, &(count, total))| (total, count, ust))
            .collect();
        sites.sort_by(|a, b| b.cmp(a));
        for (total, count, ust) in sites {
            self.emit(format_args!(
                "{:08x} bytes in {:x} allocations (@ {:08x}) by: BackTrace{:08x}\n",
                total,
                count,
                total / count,
                ust
            ));
            if ust != 0 {
                if let Some(target) = self.target {
                    if let Ok(frames) = read_stack_trace(target, ust) {
                        for frame in frames {
                            self.emit(format_args!("\t{frame:x}\n"));
                        }
                    }
                }
            }
            self.emit(format_args!("\n"));
        }
        self.emit(format_args!(
            "*- - - - - - - - - - End of data for heap @ {heap_address:x} - - - - - - - - - -\n"
        ));
        self.buckets.clear();
    }
}
