//! Classification and aggregation of heap nodes and pool blocks.

use std::collections::BTreeMap;
use std::collections::btree_map::Entry;
use std::ops::RangeInclusive;

use crate::error::Error;
use crate::heap::HeapNode;
use crate::inspect::Inspector;
use crate::liveness::Liveness;
use crate::memory::Memory;
use crate::pool::{self, Arenas, PoolStats};
use crate::report::{
    AddressOwner, AggregateKey, DumpReport, FragmentationReport, PoolReport, Totals, Unit,
};
use crate::symbols::Symbols;

/// Default number of nodes listed by [`DumpMode::Biggest`].
pub const DEFAULT_TOP: usize = 30;

/// What a dump lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpMode {
    /// Every allocated node and pool block.
    #[default]
    Allocated,
    /// Allocated nodes and pool blocks of one owner.
    Owner(i32),
    /// Free nodes and the pools' free queue entries.
    Free,
    /// The `n` biggest allocated nodes, smallest first.
    Biggest(usize),
    /// Allocated nodes adjacent to a free node.
    Orphans,
    /// Heap nodes that back pool arenas.
    PoolBacking,
    /// The node or block containing an address.
    Address(u64),
}

impl DumpMode {
    /// [`DumpMode::Biggest`] with the default count.
    pub fn biggest() -> Self {
        DumpMode::Biggest(DEFAULT_TOP)
    }

    fn lists_pool_blocks(self) -> bool {
        matches!(self, DumpMode::Allocated | DumpMode::Owner(_))
    }

    fn accepts_owner(self, owner: i32) -> bool {
        match self {
            DumpMode::Owner(wanted) => owner == wanted,
            _ => true,
        }
    }
}

/// Parameters of [`Inspector::dump`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRequest {
    pub mode: DumpMode,
    /// Allocated units outside this sequence range are skipped.
    pub sequence: RangeInclusive<u64>,
    /// One row per unit instead of one row per allocation site.
    pub detail: bool,
    /// Keep raw return addresses, skip symbol resolution.
    pub simple: bool,
}

impl Default for DumpRequest {
    fn default() -> Self {
        Self::new(DumpMode::default())
    }
}

impl DumpRequest {
    pub fn new(mode: DumpMode) -> Self {
        Self {
            mode,
            sequence: 0..=u64::MAX,
            detail: false,
            simple: false,
        }
    }

    pub fn with_sequence(mut self, sequence: RangeInclusive<u64>) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_detail(mut self, detail: bool) -> Self {
        self.detail = detail;
        self
    }

    pub fn with_simple(mut self, simple: bool) -> Self {
        self.simple = simple;
        self
    }
}

/// Units sharing one [`AggregateKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub key: AggregateKey,
    /// Member with the lowest address.
    pub representative: Unit,
    pub count: usize,
    pub bytes: u64,
}

/// Groups `(unit, bytes)` pairs by site, most frequent site first.
///
/// The result does not depend on the input order: ties on the count are broken by key.
pub fn aggregate<I>(items: I) -> Vec<Aggregate>
where
    I: IntoIterator<Item = (Unit, u64)>,
{
    let mut groups: BTreeMap<AggregateKey, Aggregate> = BTreeMap::new();
    for (unit, bytes) in items {
        match groups.entry(AggregateKey::of(&unit)) {
            Entry::Vacant(entry) => {
                let key = entry.key().clone();
                entry.insert(Aggregate {
                    key,
                    representative: unit,
                    count: 1,
                    bytes,
                });
            }
            Entry::Occupied(mut entry) => {
                let group = entry.get_mut();
                group.count += 1;
                group.bytes += bytes;
                if unit.address() < group.representative.address() {
                    group.representative = unit;
                }
            }
        }
    }

    let mut groups: Vec<_> = groups.into_values().collect();
    groups.sort_by(|a, b| b.count.cmp(&a.count));
    groups
}

/// The `top` biggest nodes, in ascending size; equal sizes keep their input order.
pub fn biggest(nodes: &[HeapNode], top: usize) -> Vec<&HeapNode> {
    let mut sorted: Vec<&HeapNode> = nodes.iter().collect();
    sorted.sort_by_key(|node| node.size);
    let skip = sorted.len().saturating_sub(top);
    sorted.split_off(skip)
}

/// Fragmentation rate of a free list, in per-mille.
///
/// Free nodes are taken largest first; each contributes `(1 - size / remaining) * size / total`
/// where `remaining` is the free space not yet accounted for. One contiguous free area scores 0,
/// many small fragments score close to 1000.
pub fn fragmentation_rate(free_sizes: &[u64]) -> f64 {
    let mut sizes: Vec<u64> = free_sizes.iter().copied().filter(|size| *size > 0).collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));

    let total: u64 = sizes.iter().sum();
    if total == 0 {
        return 0.0;
    }

    let total = total as f64;
    let mut remaining = total;
    let mut rate = 0.0;
    for size in sizes {
        let size = size as f64;
        rate += (1.0 - size / remaining) * (size / total);
        remaining -= size;
    }
    rate * 1000.0
}

impl<M, S, L> Inspector<'_, M, S, L>
where
    M: Memory + ?Sized,
    S: Symbols + ?Sized,
    L: Liveness + ?Sized,
{
    /// Lists heap nodes and pool blocks according to `request`.
    ///
    /// Pool blocks come first, then heap nodes in address order. Corrupt or unreadable parts of
    /// the target end up in the report diagnostics.
    pub fn dump(&self, request: &DumpRequest) -> DumpReport {
        let _span = tracing::info_span!("dump", mode = ?request.mode).entered();
        let mode = request.mode;
        let grouped =
            self.target.tracking().groups_by_site() && !request.detail && mode != DumpMode::Free;
        let mut report = DumpReport::new(mode, grouped);

        if let DumpMode::Address(address) = mode {
            report.owner = self.locate(address, request.simple, &mut report.diagnostics);
            if report.owner.is_none() {
                tracing::debug!(address, "address does not belong to any allocation");
            }
            return report;
        }

        let mut units = Vec::new();
        for (index, pool) in self.target.pools().iter().enumerate() {
            if mode == DumpMode::Free {
                let (capacity, errors) = pool::capacity(self.memory, self.target, pool);
                report.diagnostics.extend(errors);
                for entry in pool::free_blocks(self.memory, self.target, index, capacity) {
                    match entry {
                        Ok(block) => units.push(Unit::FreeBlock(block)),
                        Err(error) => report.diagnostics.push(error),
                    }
                }
            } else if mode.lists_pool_blocks() {
                let Some(blocks) = self.pool_blocks(index) else {
                    tracing::debug!(pool = %pool.name, "pool blocks carry no trailer");
                    continue;
                };
                for block in blocks {
                    match block {
                        Ok(block)
                            if block.is_allocated()
                                && block.in_sequence(&request.sequence)
                                && mode.accepts_owner(block.owner) =>
                        {
                            units.push(Unit::Block(block));
                        }
                        Ok(_) => {}
                        Err(error) => report.diagnostics.push(error),
                    }
                }
            }
        }

        let nodes = self.collect_nodes(&mut report.diagnostics);
        let in_use = |node: &HeapNode| {
            node.allocated && !node.is_pool_backing() && node.in_sequence(&request.sequence)
        };
        let selected: Vec<HeapNode> = match mode {
            DumpMode::Free => nodes.into_iter().filter(|node| !node.allocated).collect(),
            DumpMode::Allocated => nodes.into_iter().filter(in_use).collect(),
            DumpMode::Owner(owner) => nodes
                .into_iter()
                .filter(|node| in_use(node) && node.owner == owner)
                .collect(),
            DumpMode::Biggest(top) => {
                let allocated: Vec<HeapNode> = nodes.into_iter().filter(in_use).collect();
                biggest(&allocated, top).into_iter().cloned().collect()
            }
            DumpMode::Orphans => nodes
                .into_iter()
                .filter(|node| in_use(node) && node.is_orphan())
                .collect(),
            DumpMode::PoolBacking => nodes
                .into_iter()
                .filter(|node| node.is_pool_backing() && node.in_sequence(&request.sequence))
                .collect(),
            DumpMode::Address(_) => Vec::new(),
        };
        units.extend(selected.into_iter().map(Unit::Node));

        for unit in &units {
            report.totals.add(unit.footprint());
        }
        let items = units
            .into_iter()
            .map(|unit| {
                let size = unit.size();
                (unit, size)
            })
            .collect();
        report.rows = self.rows(items, grouped, request.simple);
        report
    }

    fn owner_of(&self, address: u64, unit: Unit, simple: bool) -> AddressOwner {
        let bytes = match &unit {
            Unit::Block(block) => block.block_size,
            _ => unit.size(),
        };
        AddressOwner {
            address,
            row: self.row(unit, 1, bytes, simple),
        }
    }

    /// Finds the allocated pool block, or else the heap node, whose payload contains `address`.
    ///
    /// Pool blocks are searched first: their arenas live inside heap nodes owned by the pool.
    fn locate(
        &self,
        address: u64,
        simple: bool,
        diagnostics: &mut Vec<Error>,
    ) -> Option<AddressOwner> {
        for index in 0..self.target.pools().len() {
            let Some(blocks) = self.pool_blocks(index) else {
                continue;
            };
            for block in blocks {
                match block {
                    Ok(block) if block.is_allocated() => {
                        let unit = Unit::Block(block);
                        if unit.contains(address) {
                            return Some(self.owner_of(address, unit, simple));
                        }
                    }
                    Ok(_) => {}
                    Err(error) => diagnostics.push(error),
                }
            }
        }

        for node in self.heap_nodes() {
            match node {
                Ok(node) => {
                    let unit = Unit::Node(node);
                    if unit.contains(address) {
                        return Some(self.owner_of(address, unit, simple));
                    }
                }
                Err(error) => diagnostics.push(error),
            }
        }

        None
    }

    /// Measures how scattered the free space of the heap is.
    pub fn fragmentation(&self) -> FragmentationReport {
        let mut diagnostics = Vec::new();
        let mut free: Vec<HeapNode> = self
            .collect_nodes(&mut diagnostics)
            .into_iter()
            .filter(|node| !node.allocated)
            .collect();
        free.sort_by(|a, b| b.size.cmp(&a.size));

        let sizes: Vec<u64> = free.iter().map(|node| node.size).collect();
        FragmentationReport {
            rate: fragmentation_rate(&sizes),
            heap_size: self.target.heap_size(),
            free_size: sizes.iter().sum(),
            free_blocks: free.len(),
            largest: sizes.first().copied().unwrap_or_default(),
            free,
            diagnostics,
        }
    }

    /// Summarizes every pool of the target.
    pub fn pool_stats(&self) -> PoolReport {
        let mut report = PoolReport {
            pools: Vec::new(),
            diagnostics: Vec::new(),
        };
        let link = self.target.pointer_width().bytes();

        for (index, pool) in self.target.pools().iter().enumerate() {
            let stride = self.target.pool_stride(pool);
            let mut capacity = 0;
            let mut expansions = 0;
            for arena in Arenas::new(self.memory, self.target, pool) {
                match arena {
                    Ok(arena) => {
                        capacity += arena.blocks;
                        if arena.expansion {
                            expansions += 1;
                        }
                    }
                    Err(error) => report.diagnostics.push(error),
                }
            }

            let mut free = Totals::default();
            let mut interrupt_free = Totals::default();
            for entry in pool::free_blocks(self.memory, self.target, index, capacity) {
                match entry {
                    Ok(block) if block.interrupt => interrupt_free.add(block.stride),
                    Ok(block) => free.add(block.stride),
                    Err(error) => report.diagnostics.push(error),
                }
            }

            let (free, interrupt_free) = (free.count as u64, interrupt_free.count as u64);
            report.pools.push(PoolStats {
                name: pool.name.clone(),
                arena_bytes: expansions * link + (pool.allocated + free + interrupt_free) * stride,
                stride,
                used: pool.allocated,
                free,
                interrupt_free,
                expansions,
                waiters: pool.waiters,
            });
        }

        report
    }
}
