#![crate_name = "heapscope"]
#![crate_type = "lib"]

//! # Heapscope
//!
//! Inspect the heap allocator and memory pool metadata of a target image to report usage,
//! fragmentation and leaks.
//!
//! ## Introduction
//!
//! Firmware and small operating systems often ship an allocator that keeps its bookkeeping right
//! next to the memory it hands out: a packed header in front of every heap node, a trailer after
//! every pool block. When the allocator is built with allocation tracking, those records also say
//! who allocated the memory, when, and from which call stack.
//!
//! Heapscope reads that metadata out of a memory image (a core dump, a debugger connection, or the
//! current process) and turns it into reports:
//!
//! - a **dump** of allocated, free, orphan or pool-backing nodes, optionally grouped by call site;
//! - the **biggest** allocations and the node containing an **address**;
//! - the **fragmentation** rate of the free space;
//! - **pool** statistics;
//! - a conservative **leak** scan, which chases pointers from global objects and reports whatever
//!   is not reachable.
//!
//! The target is never written to and nothing is cached between reports.
//!
//! ## Usage
//!
//! ### Cargo.toml
//!
//! ```toml
//! [dependencies]
//! heapscope = "0.1"
//! ```
//!
//! ### Describing the target
//!
//! A [`TargetConfig`] describes the pointer width, byte order and tracking level of the target,
//! together with its heap regions and pools:
//!
//! ```rust
//! use heapscope::{PointerWidth, PoolDescriptor, Region, TargetConfig, Tracking};
//!
//! let target = TargetConfig::new(PointerWidth::Four)
//!     .with_tracking(Tracking::Backtrace(8))
//!     .with_region(Region::new(0x2000_0000, 0x2004_0000))
//!     .with_pool(PoolDescriptor::new("pool-64", 64).with_expansions(1024, 0));
//!
//! assert!(target.validate().is_ok());
//! ```
//!
//! ### Reading reports
//!
//! Memory is accessed through the [`Memory`] trait; [`Snapshot`] holds a set of memory segments.
//! Global objects and function names come from a [`Symbols`] implementation, the liveness of owners
//! from a [`Liveness`] one:
//!
//! ```rust
//! use heapscope::{
//!     DumpMode, DumpRequest, Inspector, LeakRequest, LiveOwners, PointerWidth, Region, Snapshot,
//!     SymbolTable, TargetConfig,
//! };
//!
//! let target = TargetConfig::new(PointerWidth::Eight).with_region(Region::new(0x1000, 0x1000));
//! let memory = Snapshot::new();
//! let symbols = SymbolTable::new();
//! let owners: LiveOwners = [1, 2, 3].into_iter().collect();
//!
//! let inspector = Inspector::new(&target, &memory, &symbols, &owners).unwrap();
//!
//! let dump = inspector.dump(&DumpRequest::new(DumpMode::biggest()));
//! for row in &dump.rows {
//!     println!("{:#x} {} bytes x{}", row.unit.address(), row.bytes, row.count);
//! }
//!
//! let leaks = inspector.leaks(&LeakRequest::default());
//! assert!(leaks.is_clean());
//! ```
//!
//! ## Damaged targets
//!
//! The target may be live, or simply broken. Corrupt heap regions and pools never abort a report:
//! the walk skips to the next region or pool and the problem is recorded in the report's
//! `diagnostics`. Only an invalid [`TargetConfig`] is refused, by [`Inspector::new`].
//!

#![doc(html_playground_url = "https://play.rust-lang.org")]

mod classify;
mod codec;
mod config;
mod error;
#[cfg(test)]
mod fixture;
mod heap;
mod inspect;
mod leak;
mod liveness;
mod memory;
mod pool;
mod report;
mod symbols;

pub use self::classify::{
    Aggregate, DEFAULT_TOP, DumpMode, DumpRequest, aggregate, biggest, fragmentation_rate,
};
pub use self::codec::{
    ALLOC_BIT, NodeHeader, POOL_MAGIC_ALLOC, PREV_FREE_BIT, align_up, decode_heap_header,
    encode_heap_header, encode_word, pool_block_stride,
};
pub use self::config::{
    Endian, NodeLayout, POOL_OWNER, PointerWidth, PoolDescriptor, Region, TargetConfig,
    TrailerLayout, Tracking,
};
pub use self::error::{Error, Result};
pub use self::heap::{HeapNode, HeapWalker};
pub use self::inspect::Inspector;
pub use self::leak::{GreyQueue, LeakRequest, Reachability, ScanOutcome, WhiteEntry, WhiteSet};
pub use self::liveness::{LiveOwners, Liveness};
pub use self::memory::{Memory, Snapshot, TargetReader};
pub use self::pool::{Arena, Arenas, Chain, FreeBlock, PoolBlock, PoolStats, PoolWalker};
pub use self::report::{
    AddressOwner, AggregateKey, DumpReport, FragmentationReport, LeakReport, PoolReport, Row,
    Totals, Unit,
};
pub use self::symbols::{Frame, GlobalSymbol, Location, ProcessSymbols, SymbolTable, Symbols};
