//! Conservative leak detection.
//!
//! Every allocated unit starts out white. Pointer-sized words read from global objects claim the
//! white unit they point into, which then turns grey; grey units are scanned in turn, in the order
//! they were claimed, until no unscanned grey unit is left. Whatever is still white at the end is
//! not reachable from any global object.
//!
//! Any word whose value points into the heap counts as a reference, so a leak can hide behind a
//! stale value that merely looks like a pointer. Nothing reachable is ever reported.

use std::collections::BTreeMap;
use std::time::Instant;

use crate::config::Region;
use crate::error::{Error, Result};
use crate::inspect::Inspector;
use crate::liveness::Liveness;
use crate::memory::{Memory, TargetReader};
use crate::pool::Arenas;
use crate::report::{LeakReport, Totals, Unit};
use crate::symbols::{GlobalSymbol, Symbols};

/// Parameters of [`Inspector::leaks`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LeakRequest {
    /// One row per leaked unit instead of one row per allocation site.
    pub detail: bool,
    /// Keep raw return addresses, skip symbol resolution.
    pub simple: bool,
}

/// An allocated unit not proven reachable yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WhiteEntry {
    /// First payload byte.
    pub address: u64,
    /// Payload length.
    pub size: u64,
    pub unit: Unit,
}

/// Allocated units keyed by payload address.
#[derive(Debug, Default)]
pub struct WhiteSet {
    entries: BTreeMap<u64, WhiteEntry>,
}

impl WhiteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entry: WhiteEntry) {
        self.entries.insert(entry.address, entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|entry| entry.size).sum()
    }

    /// Removes and returns the entry whose payload contains `pointer`.
    pub fn claim(&mut self, pointer: u64) -> Option<WhiteEntry> {
        let (&address, entry) = self.entries.range(..=pointer).next_back()?;
        if pointer - address >= entry.size {
            return None;
        }
        self.entries.remove(&address)
    }

    /// Remaining entries in address order.
    pub fn into_entries(self) -> Vec<WhiteEntry> {
        self.entries.into_values().collect()
    }
}

/// Reachable entries in the order they were claimed, with a cursor over the ones already scanned.
#[derive(Debug, Default)]
pub struct GreyQueue {
    entries: Vec<WhiteEntry>,
    cursor: usize,
}

impl GreyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: WhiteEntry) {
        self.entries.push(entry);
    }

    /// Payload range of the oldest entry not scanned yet.
    pub fn next_unscanned(&mut self) -> Option<(u64, u64)> {
        let entry = self.entries.get(self.cursor)?;
        self.cursor += 1;
        Some((entry.address, entry.size))
    }

    /// Entries pushed so far, scanned or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Outcome of [`Reachability::scan`].
#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// Global objects that were scanned.
    pub roots: usize,
    /// Units moved out of the white set.
    pub reachable: usize,
    pub diagnostics: Vec<Error>,
}

/// Pointer chasing over target memory.
pub struct Reachability<'a, M: ?Sized> {
    reader: TargetReader<'a, M>,
    /// Only words pointing into these ranges are looked up.
    ranges: Vec<Region>,
}

impl<'a, M: Memory + ?Sized> Reachability<'a, M> {
    pub fn new(reader: TargetReader<'a, M>, ranges: Vec<Region>) -> Self {
        Self { reader, ranges }
    }

    /// Moves every unit reachable from `roots` out of `white`.
    pub fn scan(&self, white: &mut WhiteSet, roots: &[GlobalSymbol]) -> ScanOutcome {
        let word = self.reader.width().bytes();
        let mut grey = GreyQueue::new();
        let mut outcome = ScanOutcome::default();

        for root in roots.iter().filter(|root| root.size >= word) {
            outcome.roots += 1;
            if let Err(error) = self.scan_range(root.address, root.size, white, &mut grey) {
                tracing::warn!(%error, symbol = %root.name, "cannot read global object");
                outcome.diagnostics.push(error);
            }
        }
        tracing::debug!(roots = outcome.roots, claimed = grey.len(), "global objects scanned");

        while let Some((address, size)) = grey.next_unscanned() {
            if let Err(error) = self.scan_range(address, size, white, &mut grey) {
                tracing::warn!(%error, address, "cannot read reachable unit");
                outcome.diagnostics.push(error);
            }
        }

        outcome.reachable = grey.len();
        tracing::debug!(reachable = outcome.reachable, left = white.len(), "worklist drained");
        outcome
    }

    fn scan_range(
        &self,
        address: u64,
        size: u64,
        white: &mut WhiteSet,
        grey: &mut GreyQueue,
    ) -> Result<()> {
        let word = self.reader.width().bytes();
        let len = size / word * word;
        if len == 0 {
            return Ok(());
        }

        let bytes = self.reader.bytes(address, len)?;
        for chunk in bytes.chunks_exact(word as usize) {
            let value = self.reader.decode_word(chunk, 0);
            if !self.ranges.iter().any(|range| range.contains(value)) {
                continue;
            }
            if let Some(entry) = white.claim(value) {
                grey.push(entry);
            }
        }
        Ok(())
    }
}

impl<M, S, L> Inspector<'_, M, S, L>
where
    M: Memory + ?Sized,
    S: Symbols + ?Sized,
    L: Liveness + ?Sized,
{
    /// Reports the allocated units that no global object leads to.
    pub fn leaks(&self, request: &LeakRequest) -> LeakReport {
        let _span = tracing::info_span!("leaks").entered();
        let started = Instant::now();
        let mut diagnostics = Vec::new();

        let mut white = self.white_set(&mut diagnostics);
        let candidates = white.len();
        let globals = self.symbols.globals();
        let outcome = Reachability::new(
            TargetReader::new(self.memory, self.target),
            self.candidate_ranges(),
        )
        .scan(&mut white, &globals);
        diagnostics.extend(outcome.diagnostics);

        let grouped = self.target.tracking().groups_by_site() && !request.detail;
        let mut totals = Totals::default();
        let items = white
            .into_entries()
            .into_iter()
            .map(|entry| {
                totals.add(entry.size);
                (entry.unit, entry.size)
            })
            .collect();
        let rows = self.rows(items, grouped, request.simple);
        let elapsed = started.elapsed();

        tracing::info!(
            candidates,
            leaked = totals.count,
            bytes = totals.bytes,
            ?elapsed,
            "leak scan finished"
        );
        LeakReport {
            grouped,
            rows,
            totals,
            roots: outcome.roots,
            reachable: outcome.reachable,
            elapsed,
            diagnostics,
        }
    }

    /// Allocated heap nodes plus allocated pool blocks.
    ///
    /// Nodes backing pool arenas are left out: their blocks stand for them.
    fn white_set(&self, diagnostics: &mut Vec<Error>) -> WhiteSet {
        let mut white = WhiteSet::new();

        for node in self.collect_nodes(diagnostics) {
            if !node.allocated || node.is_pool_backing() {
                continue;
            }
            white.insert(WhiteEntry {
                address: node.payload,
                size: node.payload_size(),
                unit: Unit::Node(node),
            });
        }

        for index in 0..self.target.pools().len() {
            let Some(blocks) = self.pool_blocks(index) else {
                continue;
            };
            for block in blocks {
                match block {
                    Ok(block) if block.is_allocated() => white.insert(WhiteEntry {
                        address: block.base,
                        size: block.block_size,
                        unit: Unit::Block(block),
                    }),
                    Ok(_) => {}
                    Err(error) => diagnostics.push(error),
                }
            }
        }

        white
    }

    /// Heap regions and pool arenas; words outside them are not pointers to units.
    fn candidate_ranges(&self) -> Vec<Region> {
        let mut ranges = self.target.regions().to_vec();
        for pool in self.target.pools() {
            let stride = self.target.pool_stride(pool);
            ranges.extend(
                Arenas::new(self.memory, self.target, pool)
                    .flatten()
                    .map(|arena| Region::new(arena.base, arena.base + arena.blocks * stride)),
            );
        }
        ranges
    }
}

#[cfg(test)]
mod test {

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::{PoolDescriptor, Tracking};
    use crate::fixture::{DATA_BASE, HeapImage, Image, Slot};
    use crate::symbols::SymbolTable;

    fn leaks(image: &Image, globals: &[(u64, u64)], request: LeakRequest) -> LeakReport {
        let mut symbols = SymbolTable::new();
        for (index, (address, size)) in globals.iter().enumerate() {
            symbols.add_global(format!("g_{index}"), *address, *size);
        }
        let liveness = |_: i32| true;
        let inspector = Inspector::new(&image.target, &image.memory, &symbols, &liveness).unwrap();
        inspector.leaks(&request)
    }

    fn leaked(report: &LeakReport) -> Vec<u64> {
        report.rows.iter().map(|row| row.unit.address()).collect()
    }

    fn detail() -> LeakRequest {
        LeakRequest {
            detail: true,
            simple: true,
        }
    }

    fn entry(address: u64, size: u64) -> WhiteEntry {
        WhiteEntry {
            address,
            size,
            unit: Unit::FreeBlock(crate::pool::FreeBlock {
                pool: 0,
                address,
                block_size: size,
                stride: size,
                interrupt: false,
            }),
        }
    }

    #[test]
    fn test_should_claim_containing_entry() {
        let mut white = WhiteSet::new();
        white.insert(entry(0x100, 0x20));
        white.insert(entry(0x200, 0x10));
        assert_eq!(white.total_bytes(), 0x30);

        assert!(white.claim(0x0ff).is_none());
        assert!(white.claim(0x120).is_none());
        assert_eq!(white.claim(0x11f).map(|entry| entry.address), Some(0x100));
        // claimed entries are gone
        assert!(white.claim(0x100).is_none());
        assert_eq!(white.claim(0x200).map(|entry| entry.address), Some(0x200));
        assert!(white.is_empty());
    }

    #[test]
    fn test_should_drain_grey_queue_in_order() {
        let mut grey = GreyQueue::new();
        grey.push(entry(0x100, 8));
        grey.push(entry(0x200, 8));
        assert_eq!(grey.next_unscanned(), Some((0x100, 8)));
        grey.push(entry(0x300, 8));
        assert_eq!(grey.next_unscanned(), Some((0x200, 8)));
        assert_eq!(grey.next_unscanned(), Some((0x300, 8)));
        assert_eq!(grey.next_unscanned(), None);
        assert_eq!(grey.len(), 3);
    }

    #[test]
    fn test_should_not_report_referenced_unit() {
        let mut image = HeapImage::new(0x200);
        let a = image.alloc(0x80, 1, 1, &[0x100]);
        let b = image.alloc(0x80, 1, 2, &[0x200]);
        let (a, b) = (image.payload(a), image.payload(b));
        let mut image = image.finish();
        // interior pointer
        image.map_words(DATA_BASE, &[a + 8]);

        let report = leaks(&image, &[(DATA_BASE, 8)], detail());
        assert_eq!(leaked(&report), vec![b]);
        assert_eq!(report.roots, 1);
        assert_eq!(report.reachable, 1);
        assert!(report.diagnostics.is_empty());
    }

    #[test]
    fn test_should_follow_references_transitively() {
        let mut image = HeapImage::new(0x200);
        let a = image.alloc(0x80, 1, 1, &[]);
        let b = image.alloc(0x80, 1, 2, &[]);
        let c = image.alloc(0x80, 1, 3, &[]);
        let (a, b, c) = (image.payload(a), image.payload(b), image.payload(c));
        image.write_word(b + 0x10, a);
        let mut image = image.finish();
        image.map_words(DATA_BASE, &[0, b]);

        let report = leaks(&image, &[(DATA_BASE, 16)], detail());
        assert_eq!(leaked(&report), vec![c]);
        assert_eq!(report.reachable, 2);
    }

    #[test]
    fn test_should_terminate_on_reference_cycle() {
        let mut image = HeapImage::new(0x200);
        let a = image.alloc(0x80, 1, 1, &[]);
        let b = image.alloc(0x80, 1, 2, &[]);
        let (a, b) = (image.payload(a), image.payload(b));
        image.write_word(a, b);
        image.write_word(b, a);
        let mut image = image.finish();
        image.map_words(DATA_BASE, &[a]);

        let report = leaks(&image, &[(DATA_BASE, 8)], detail());
        assert!(report.is_clean());
        assert_eq!(report.reachable, 2);
    }

    #[test]
    fn test_should_report_everything_without_roots() {
        let mut image = HeapImage::new(0x400);
        image.alloc(0x80, 1, 1, &[0x100]);
        image.free(0x40);
        image.alloc(0xc0, 2, 2, &[0x200]);
        let image = image.finish();

        let report = leaks(&image, &[], detail());
        assert_eq!(report.roots, 0);
        assert_eq!(report.totals.count, 2);
        assert_eq!(report.totals.bytes, 0x40 + 0x80);
        assert_eq!(report.rows.iter().map(|row| row.bytes).sum::<u64>(), report.totals.bytes);
    }

    #[test]
    fn test_should_skip_small_and_unreadable_roots() {
        let mut image = HeapImage::new(0x200);
        let a = image.alloc(0x80, 1, 1, &[]);
        let a = image.payload(a);
        let mut image = image.finish();
        image.map_words(DATA_BASE, &[a]);

        let report = leaks(&image, &[(DATA_BASE, 4), (0xdead_0000, 8)], detail());
        assert_eq!(report.roots, 1);
        assert_eq!(report.totals.count, 1);
        assert!(matches!(
            report.diagnostics[..],
            [Error::UnreadableMemory {
                address: 0xdead_0000,
                ..
            }]
        ));
    }

    #[test]
    fn test_should_group_leaks_by_site() {
        let mut image = HeapImage::new(0x400);
        for sequence in 0..3 {
            image.alloc(0x80, 4, sequence, &[0x0800_1000, 0x0800_2000]);
        }
        image.alloc(0x40, 4, 3, &[0x0800_3000]);
        let image = image.finish();

        let report = leaks(&image, &[], LeakRequest::default());
        assert!(report.grouped);
        assert_eq!(report.rows.len(), 2);
        assert_eq!(report.rows[0].count, 3);
        assert_eq!(report.rows[0].bytes, 3 * 0x40);
        assert_eq!(report.totals.count, 4);

        let report = leaks(&image, &[], LeakRequest { detail: true, simple: false });
        assert!(!report.grouped);
        assert_eq!(report.rows.len(), 4);
    }

    #[test]
    fn test_should_not_group_without_backtrace() {
        let target = crate::fixture::target().with_tracking(Tracking::Owner);
        let mut image = HeapImage::with_target(target, 0x200);
        image.alloc(0x40, 1, 1, &[]);
        image.alloc(0x40, 1, 2, &[]);
        let image = image.finish();

        let report = leaks(&image, &[], LeakRequest::default());
        assert!(!report.grouped);
        assert_eq!(report.rows.len(), 2);
    }

    #[test]
    fn test_should_scan_pool_blocks() {
        let mut image = HeapImage::new(0x1000);
        let mut pool = PoolDescriptor::new("pool-32", 32);
        let blocks = image.pool_arena(
            &mut pool,
            &[Slot::used(1, 1, &[]), Slot::Free, Slot::used(1, 2, &[])],
            false,
        );
        let node = image.alloc(0x80, 1, 3, &[]);
        let node = image.payload(node);
        // the first block holds the only reference to the heap node
        image.write_word(blocks[0], node);
        image.add_pool(pool);
        let mut image = image.finish();
        image.map_words(DATA_BASE, &[blocks[0] + 4]);

        let report = leaks(&image, &[(DATA_BASE, 8)], detail());
        assert_eq!(leaked(&report), vec![blocks[2]]);
        assert_eq!(report.reachable, 2);
    }
}
