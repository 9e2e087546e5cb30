//! Synthetic target images for unit tests.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt as _};

use crate::codec::{self, NodeHeader, POOL_MAGIC_ALLOC};
use crate::config::{
    Endian, POOL_OWNER, PointerWidth, PoolDescriptor, Region, TargetConfig, Tracking,
};
use crate::memory::Snapshot;

pub const HEAP_BASE: u64 = 0x2000_0000;
pub const SECOND_BASE: u64 = 0x3000_0000;
pub const DATA_BASE: u64 = 0x1000_0000;

const WIDTH: PointerWidth = PointerWidth::Eight;
const ENDIAN: Endian = Endian::Little;

pub fn target() -> TargetConfig {
    TargetConfig::new(WIDTH).with_tracking(Tracking::Backtrace(4))
}

/// State of one pool block.
#[derive(Debug, Clone)]
pub enum Slot {
    Used {
        owner: i32,
        sequence: u64,
        backtrace: Vec<u64>,
    },
    Free,
    InterruptFree,
}

impl Slot {
    pub fn used(owner: i32, sequence: u64, backtrace: &[u64]) -> Self {
        Slot::Used {
            owner,
            sequence,
            backtrace: backtrace.to_vec(),
        }
    }
}

/// A finished image.
pub struct Image {
    pub target: TargetConfig,
    pub memory: Snapshot,
}

impl Image {
    /// Maps a data segment holding `words` at `base`.
    pub fn map_words(&mut self, base: u64, words: &[u64]) {
        let mut bytes = Vec::new();
        for word in words {
            bytes.extend(codec::encode_word(*word, WIDTH, ENDIAN));
        }
        self.memory.add_segment(base, bytes);
    }
}

/// Lays out heap nodes back to back, region by region.
pub struct HeapImage {
    target: TargetConfig,
    memory: Snapshot,
    pools: Vec<PoolDescriptor>,
    start: u64,
    cursor: u64,
    end: Option<u64>,
    prev_free: bool,
}

impl HeapImage {
    pub fn new(capacity: usize) -> Self {
        Self::with_target(target(), capacity)
    }

    pub fn with_target(target: TargetConfig, capacity: usize) -> Self {
        let mut memory = Snapshot::new();
        memory.add_zeroed(HEAP_BASE, capacity);
        Self {
            target,
            memory,
            pools: Vec::new(),
            start: HEAP_BASE,
            cursor: HEAP_BASE,
            end: None,
            prev_free: false,
        }
    }

    pub fn header_size(&self) -> u64 {
        self.target.node_layout().header_size
    }

    pub fn payload(&self, node: u64) -> u64 {
        node + self.header_size()
    }

    /// Writes an allocated node of `size` bytes (header included) and returns its base.
    pub fn alloc(&mut self, size: u64, owner: i32, sequence: u64, backtrace: &[u64]) -> u64 {
        let base = self.cursor;
        let layout = self.target.node_layout();
        self.write_header(size, true);
        if self.target.tracking().records_owner() {
            self.memory
                .write_u32(base + layout.owner, owner as u32, ENDIAN)
                .expect("header is mapped");
            self.write_word(base + layout.sequence, sequence);
            for (index, pc) in backtrace.iter().take(self.target.tracking().depth()).enumerate() {
                self.write_word(base + layout.backtrace + index as u64 * WIDTH.bytes(), *pc);
            }
        }
        self.prev_free = false;
        self.cursor += size;
        base
    }

    /// Writes a free node of `size` bytes and returns its base.
    pub fn free(&mut self, size: u64) -> u64 {
        let base = self.cursor;
        self.write_header(size, false);
        self.prev_free = true;
        self.cursor += size;
        base
    }

    /// Overrides the end of the current region, which otherwise ends after the last node.
    pub fn set_region_end(&mut self, end: u64) {
        self.end = Some(end);
    }

    /// Closes the current region and starts a new one at `start`.
    pub fn region(&mut self, start: u64, capacity: usize) {
        self.close_region();
        self.memory.add_zeroed(start, capacity);
        self.start = start;
        self.cursor = start;
        self.prev_free = false;
    }

    /// Carves a pool arena out of the heap and fills its blocks; returns the block addresses.
    ///
    /// Every expansion arena of a pool must hold the same number of slots, as the pool keeps a
    /// single expansion size.
    pub fn pool_arena(
        &mut self,
        pool: &mut PoolDescriptor,
        slots: &[Slot],
        interrupt: bool,
    ) -> Vec<u64> {
        let stride = self.target.pool_stride(pool);
        let blocks_len = slots.len() as u64 * stride;
        let arena_len = if interrupt {
            blocks_len
        } else {
            blocks_len + WIDTH.bytes()
        };
        let node = self.alloc(self.header_size() + arena_len, POOL_OWNER, 0, &[]);
        let base = self.payload(node);

        if interrupt {
            pool.interrupt_arena = Some(Region::new(base, base + blocks_len));
        } else {
            assert!(
                pool.expand_size == 0 || pool.expand_size == arena_len,
                "expansion arenas of one pool share a single size"
            );
            let entry = base + blocks_len;
            self.write_word(entry, pool.expansion_head);
            pool.expansion_head = entry;
            pool.expand_size = arena_len;
        }

        let trailer = self.target.trailer_layout().expect("pools need tracking");
        let mut blocks = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            let block = base + index as u64 * stride;
            let tail = block + pool.block_size;
            match slot {
                Slot::Used {
                    owner,
                    sequence,
                    backtrace,
                } => {
                    self.memory
                        .write_u32(tail + trailer.magic, POOL_MAGIC_ALLOC, ENDIAN)
                        .expect("trailer is mapped");
                    self.memory
                        .write_u32(tail + trailer.owner, *owner as u32, ENDIAN)
                        .expect("trailer is mapped");
                    self.write_word(tail + trailer.sequence, *sequence);
                    for (depth, pc) in backtrace.iter().enumerate() {
                        let slot = tail + trailer.backtrace + depth as u64 * WIDTH.bytes();
                        self.write_word(slot, *pc);
                    }
                    pool.allocated += 1;
                }
                Slot::Free => {
                    self.write_word(block, pool.free_head);
                    pool.free_head = block;
                }
                Slot::InterruptFree => {
                    self.write_word(block, pool.interrupt_free_head);
                    pool.interrupt_free_head = block;
                }
            }
            blocks.push(block);
        }
        blocks
    }

    pub fn add_pool(&mut self, pool: PoolDescriptor) {
        self.pools.push(pool);
    }

    pub fn write_word(&mut self, address: u64, value: u64) {
        self.memory
            .write_word(address, value, WIDTH, ENDIAN)
            .expect("address is mapped");
    }

    pub fn finish(mut self) -> Image {
        self.close_region();
        let mut target = self.target;
        for pool in self.pools {
            target = target.with_pool(pool);
        }
        Image {
            target,
            memory: self.memory,
        }
    }

    fn close_region(&mut self) {
        let end = self.end.take().unwrap_or(self.cursor);
        self.target = self.target.clone().with_region(Region::new(self.start, end));
    }

    fn write_header(&mut self, size: u64, allocated: bool) {
        let layout = self.target.node_layout();
        let raw = codec::encode_heap_header(NodeHeader {
            size,
            allocated,
            prev_free: self.prev_free,
        });
        self.write_word(self.cursor + layout.size, raw);
    }
}

/// Runs `f` and counts the `WARN` events it emits.
pub fn count_warnings<R>(f: impl FnOnce() -> R) -> (R, usize) {
    let counter = WarnCounter::default();
    let subscriber = tracing_subscriber::registry().with(counter.clone());
    let result = tracing::subscriber::with_default(subscriber, f);
    (result, counter.0.load(Ordering::Relaxed))
}

#[derive(Clone, Default)]
struct WarnCounter(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }
}
