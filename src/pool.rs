//! Traversal of fixed-size block pools.
//!
//! Every block is followed by a trailer that records who allocated it:
//!
//! ```text
//!   arena:  ┌─────────────┬─────────┬─────┬─────────────┬─────────┬─────┐
//!           │  payload    │ trailer │ pad │  payload    │ trailer │ pad │ ...
//!           └─────────────┴─────────┴─────┴─────────────┴─────────┴─────┘
//!           ◄──────────── stride ────────►
//! ```
//!
//! A pool owns an optional interrupt arena plus expansion arenas linked through a queue whose
//! link entry sits right after the last block of each arena. Free blocks are linked through
//! their first word, so their trailer is only meaningful while the magic says "allocated".

mod chain;

use std::ops::RangeInclusive;

pub use self::chain::Chain;
use crate::codec::POOL_MAGIC_ALLOC;
use crate::config::{PoolDescriptor, TargetConfig, TrailerLayout};
use crate::error::{Error, Result};
use crate::memory::{Memory, TargetReader};

/// Expansion queue bound used when the heap size gives no better estimate.
const MAX_EXPANSIONS: u64 = 1 << 16;

/// Decoded view of one block slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolBlock {
    /// Index of the pool in the target's pool table.
    pub pool: usize,
    /// Address of the first payload byte.
    pub base: u64,
    pub block_size: u64,
    pub stride: u64,
    pub magic: u32,
    pub owner: i32,
    pub sequence: u64,
    pub backtrace: Vec<u64>,
}

impl PoolBlock {
    /// Whether the block is handed out; other blocks sit in a free queue.
    pub fn is_allocated(&self) -> bool {
        self.magic == POOL_MAGIC_ALLOC
    }

    pub fn end(&self) -> u64 {
        self.base + self.block_size
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.end()
    }

    pub fn in_sequence(&self, range: &RangeInclusive<u64>) -> bool {
        range.contains(&self.sequence)
    }
}

/// A block found in one of the pool's free queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreeBlock {
    pub pool: usize,
    pub address: u64,
    pub block_size: u64,
    pub stride: u64,
    /// Found in the interrupt free queue.
    pub interrupt: bool,
}

/// A contiguous run of block slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Arena {
    pub base: u64,
    pub blocks: u64,
    pub expansion: bool,
}

/// Summary of one pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub name: String,
    /// Bytes spent on blocks and expansion links.
    pub arena_bytes: u64,
    pub stride: u64,
    pub used: u64,
    pub free: u64,
    pub interrupt_free: u64,
    pub expansions: u64,
    pub waiters: u64,
}

/// Iterates over the arenas of a pool: the interrupt arena first, then the expansion queue.
pub struct Arenas<'a, M: ?Sized> {
    pool: &'a PoolDescriptor,
    interrupt: Option<Arena>,
    chain: Chain<'a, M>,
    stride: u64,
    link: u64,
    failed: bool,
}

impl<'a, M: Memory + ?Sized> Arenas<'a, M> {
    pub fn new(memory: &'a M, target: &'a TargetConfig, pool: &'a PoolDescriptor) -> Self {
        let reader = TargetReader::new(memory, target);
        let stride = target.pool_stride(pool).max(1);
        let heap_size = target.heap_size();
        let limit = if heap_size > 0 && pool.expand_size > 0 {
            heap_size / pool.expand_size + 1
        } else {
            MAX_EXPANSIONS
        };

        Self {
            pool,
            interrupt: pool.interrupt_arena.map(|arena| Arena {
                base: arena.start,
                blocks: arena.len() / stride,
                expansion: false,
            }),
            chain: Chain::new(reader, &pool.name, pool.expansion_head, limit),
            stride,
            link: target.pointer_width().bytes(),
            failed: false,
        }
    }

    fn corrupt(&mut self, address: u64, reason: &'static str) -> Option<Result<Arena>> {
        self.failed = true;
        let error = Error::CorruptPool {
            pool: self.pool.name.clone(),
            address,
            reason,
        };
        tracing::warn!(%error, "pool arena walk aborted");
        Some(Err(error))
    }
}

impl<M: Memory + ?Sized> Iterator for Arenas<'_, M> {
    type Item = Result<Arena>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(arena) = self.interrupt.take() {
            return Some(Ok(arena));
        }
        if self.failed {
            return None;
        }

        let entry = match self.chain.next()? {
            Ok(entry) => entry,
            Err(error) => {
                self.failed = true;
                return Some(Err(error));
            }
        };

        let Some(usable) = self.pool.expand_size.checked_sub(self.link) else {
            return self.corrupt(entry, "expansion arena smaller than its queue link");
        };
        let blocks = usable / self.stride;
        let Some(base) = entry.checked_sub(blocks * self.stride) else {
            return self.corrupt(entry, "expansion arena starts below address zero");
        };

        tracing::debug!(pool = %self.pool.name, base, blocks, "found expansion arena");
        Some(Ok(Arena {
            base,
            blocks,
            expansion: true,
        }))
    }
}

/// Walks every block slot of a pool, allocated or not, arena by arena.
pub struct PoolWalker<'a, M: ?Sized> {
    reader: TargetReader<'a, M>,
    trailer: TrailerLayout,
    depth: usize,
    index: usize,
    block_size: u64,
    stride: u64,
    arenas: Arenas<'a, M>,
    current: Option<(Arena, u64)>,
}

impl<'a, M: Memory + ?Sized> PoolWalker<'a, M> {
    /// Returns `None` when the pool does not exist or its blocks carry no trailer.
    pub fn new(memory: &'a M, target: &'a TargetConfig, index: usize) -> Option<Self> {
        let pool = target.pools().get(index)?;
        let trailer = target.trailer_layout()?;

        Some(Self {
            reader: TargetReader::new(memory, target),
            trailer,
            depth: target.tracking().depth(),
            index,
            block_size: pool.block_size,
            stride: target.pool_stride(pool),
            arenas: Arenas::new(memory, target, pool),
            current: None,
        })
    }

    fn decode(&self, base: u64) -> Result<PoolBlock> {
        let bytes = self
            .reader
            .bytes(base + self.block_size, self.trailer.size)?;

        Ok(PoolBlock {
            pool: self.index,
            base,
            block_size: self.block_size,
            stride: self.stride,
            magic: self.reader.decode_u32(&bytes, self.trailer.magic),
            owner: self.reader.decode_i32(&bytes, self.trailer.owner),
            sequence: self.reader.decode_word(&bytes, self.trailer.sequence),
            backtrace: self
                .reader
                .decode_backtrace(&bytes, self.trailer.backtrace, self.depth),
        })
    }
}

impl<M: Memory + ?Sized> Iterator for PoolWalker<'_, M> {
    type Item = Result<PoolBlock>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some((arena, slot)) = self.current {
                if slot < arena.blocks {
                    self.current = Some((arena, slot + 1));
                    let base = arena.base + slot * self.stride;
                    return match self.decode(base) {
                        Ok(block) => Some(Ok(block)),
                        Err(error) => {
                            tracing::warn!(%error, base, "cannot read pool block trailer");
                            Some(Err(error))
                        }
                    };
                }
                self.current = None;
            }

            match self.arenas.next()? {
                Ok(arena) => self.current = Some((arena, 0)),
                Err(error) => return Some(Err(error)),
            }
        }
    }
}

/// Counts block slots over every readable arena of a pool.
pub fn capacity<M: Memory + ?Sized>(
    memory: &M,
    target: &TargetConfig,
    pool: &PoolDescriptor,
) -> (u64, Vec<Error>) {
    let mut blocks = 0;
    let mut errors = Vec::new();
    for arena in Arenas::new(memory, target, pool) {
        match arena {
            Ok(arena) => blocks += arena.blocks,
            Err(error) => errors.push(error),
        }
    }
    (blocks, errors)
}

/// Walks the free queue followed by the interrupt free queue of a pool.
///
/// `capacity` bounds each queue; see [`capacity`].
pub fn free_blocks<'a, M: Memory + ?Sized>(
    memory: &'a M,
    target: &'a TargetConfig,
    index: usize,
    capacity: u64,
) -> impl Iterator<Item = Result<FreeBlock>> {
    let reader = TargetReader::new(memory, target);
    let pool = target.pools().get(index);
    let stride = pool.map(|pool| target.pool_stride(pool)).unwrap_or_default();

    let queue = move |interrupt: bool| {
        let head = pool
            .map(|pool| {
                if interrupt {
                    pool.interrupt_free_head
                } else {
                    pool.free_head
                }
            })
            .unwrap_or_default();
        let name = pool.map(|pool| pool.name.as_str()).unwrap_or_default();
        let block_size = pool.map(|pool| pool.block_size).unwrap_or_default();

        Chain::new(reader, name, head, capacity).map(move |entry| {
            entry.map(|address| FreeBlock {
                pool: index,
                address,
                block_size,
                stride,
                interrupt,
            })
        })
    };

    queue(false).chain(queue(true))
}
