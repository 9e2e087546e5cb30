//! Result structures consumed by presentation code.

use std::time::Duration;

use crate::classify::DumpMode;
use crate::error::Error;
use crate::heap::HeapNode;
use crate::pool::{FreeBlock, PoolBlock, PoolStats};
use crate::symbols::Frame;

/// One allocation unit found in the target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unit {
    Node(HeapNode),
    Block(PoolBlock),
    FreeBlock(FreeBlock),
}

impl Unit {
    /// Address handed out to the user of the allocation.
    pub fn address(&self) -> u64 {
        match self {
            Unit::Node(node) => node.payload,
            Unit::Block(block) => block.base,
            Unit::FreeBlock(block) => block.address,
        }
    }

    /// Size as recorded by the allocator: the whole node, or the block payload.
    pub fn size(&self) -> u64 {
        match self {
            Unit::Node(node) => node.size,
            Unit::Block(block) => block.block_size,
            Unit::FreeBlock(block) => block.block_size,
        }
    }

    /// Memory the unit takes from its allocator, trailer and padding included.
    pub fn footprint(&self) -> u64 {
        match self {
            Unit::Node(node) => node.size,
            Unit::Block(block) => block.stride,
            Unit::FreeBlock(block) => block.stride,
        }
    }

    pub fn is_allocated(&self) -> bool {
        match self {
            Unit::Node(node) => node.allocated,
            Unit::Block(block) => block.is_allocated(),
            Unit::FreeBlock(_) => false,
        }
    }

    /// Owner id; `None` for free units.
    pub fn owner(&self) -> Option<i32> {
        match self {
            Unit::Node(node) if node.allocated => Some(node.owner),
            Unit::Block(block) if block.is_allocated() => Some(block.owner),
            _ => None,
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            Unit::Node(node) if node.allocated => Some(node.sequence),
            Unit::Block(block) if block.is_allocated() => Some(block.sequence),
            _ => None,
        }
    }

    pub fn backtrace(&self) -> &[u64] {
        match self {
            Unit::Node(node) => &node.backtrace,
            Unit::Block(block) => &block.backtrace,
            Unit::FreeBlock(_) => &[],
        }
    }

    /// Whether `address` lies inside the unit's payload.
    pub fn contains(&self, address: u64) -> bool {
        match self {
            Unit::Node(node) => address >= node.payload && address < node.end(),
            Unit::Block(block) => block.contains(address),
            Unit::FreeBlock(block) => {
                address >= block.address && address < block.address + block.block_size
            }
        }
    }
}

/// Units with the same call stack and owner are the same allocation site.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AggregateKey {
    pub backtrace: Vec<u64>,
    pub owner: i32,
}

impl AggregateKey {
    pub fn of(unit: &Unit) -> Self {
        Self {
            backtrace: unit.backtrace().to_vec(),
            owner: unit.owner().unwrap_or_default(),
        }
    }
}

/// One report line: a single unit, or a group of units sharing an [`AggregateKey`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// The unit itself, or the group representative (lowest address).
    pub unit: Unit,
    pub count: usize,
    /// Bytes over all units of the row.
    pub bytes: u64,
    /// Whether the owner still exists; always true for free units.
    pub alive: bool,
    pub callstack: Vec<Frame>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Totals {
    pub count: usize,
    pub bytes: u64,
}

impl Totals {
    pub fn add(&mut self, bytes: u64) {
        self.count += 1;
        self.bytes += bytes;
    }
}

/// The unit an address query landed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressOwner {
    pub address: u64,
    pub row: Row,
}

/// Result of [`crate::Inspector::dump`].
#[derive(Debug, Clone, PartialEq)]
pub struct DumpReport {
    pub mode: DumpMode,
    /// Rows are per site rather than per unit.
    pub grouped: bool,
    pub rows: Vec<Row>,
    pub totals: Totals,
    /// Set by address queries when the address was found.
    pub owner: Option<AddressOwner>,
    pub diagnostics: Vec<Error>,
}

impl DumpReport {
    pub(crate) fn new(mode: DumpMode, grouped: bool) -> Self {
        Self {
            mode,
            grouped,
            rows: Vec::new(),
            totals: Totals::default(),
            owner: None,
            diagnostics: Vec::new(),
        }
    }
}

/// Result of [`crate::Inspector::leaks`].
#[derive(Debug, Clone, PartialEq)]
pub struct LeakReport {
    pub grouped: bool,
    pub rows: Vec<Row>,
    /// Leaked units and bytes.
    pub totals: Totals,
    /// Root symbols that were scanned.
    pub roots: usize,
    /// Units proven reachable.
    pub reachable: usize,
    pub elapsed: Duration,
    pub diagnostics: Vec<Error>,
}

impl LeakReport {
    /// Every allocation is referenced from somewhere.
    pub fn is_clean(&self) -> bool {
        self.totals.count == 0
    }
}

/// Result of [`crate::Inspector::fragmentation`].
#[derive(Debug, Clone, PartialEq)]
pub struct FragmentationReport {
    /// Fragmentation rate in per-mille.
    pub rate: f64,
    pub heap_size: u64,
    pub free_size: u64,
    pub free_blocks: usize,
    pub largest: u64,
    /// Free nodes, biggest first.
    pub free: Vec<HeapNode>,
    pub diagnostics: Vec<Error>,
}

/// Result of [`crate::Inspector::pool_stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolReport {
    pub pools: Vec<PoolStats>,
    pub diagnostics: Vec<Error>,
}
