//! Target capability descriptor.
//!
//! Everything the traversal needs to know about the target build lives in [`TargetConfig`]. It is
//! read once at the start of a report, so no record is ever checked for optional fields on its own.

use crate::codec::{align_up, pool_block_stride};
use crate::error::{Error, Result};

/// Owner id the allocator assigns to heap nodes that back a pool arena.
pub const POOL_OWNER: i32 = -1;

/// Size of a target pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerWidth {
    Four,
    Eight,
}

impl PointerWidth {
    /// Width in bytes.
    pub fn bytes(self) -> u64 {
        match self {
            PointerWidth::Four => 4,
            PointerWidth::Eight => 8,
        }
    }
}

/// Byte order of the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endian {
    #[default]
    Little,
    Big,
}

/// How much allocation context the target allocator records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Tracking {
    /// Nodes carry their size only; pool blocks have no trailer.
    #[default]
    Disabled,
    /// Owner id and sequence number are recorded, without a call stack.
    Owner,
    /// Owner id, sequence number and up to `depth` return addresses.
    Backtrace(usize),
}

impl Tracking {
    /// Whether nodes and blocks carry an owner id and a sequence number.
    pub fn records_owner(self) -> bool {
        !matches!(self, Tracking::Disabled)
    }

    /// Number of backtrace slots per record.
    pub fn depth(self) -> usize {
        match self {
            Tracking::Backtrace(depth) => depth,
            _ => 0,
        }
    }

    /// Whether records can be grouped by call site.
    pub fn groups_by_site(self) -> bool {
        self.depth() > 0
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub start: u64,
    pub end: u64,
}

impl Region {
    pub const fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }
}

/// A fixed-size block pool, as read from the target's pool table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolDescriptor {
    pub name: String,
    /// Payload size of one block.
    pub block_size: u64,
    /// Contiguous arena reserved for interrupt context, if any.
    pub interrupt_arena: Option<Region>,
    /// Size of each expansion arena, link entry included.
    pub expand_size: u64,
    /// First entry of the expansion queue, `0` when empty.
    pub expansion_head: u64,
    /// First entry of the free queue, `0` when empty.
    pub free_head: u64,
    /// First entry of the interrupt free queue, `0` when empty.
    pub interrupt_free_head: u64,
    /// Allocation counter kept by the pool.
    pub allocated: u64,
    /// Tasks blocked waiting for a block.
    pub waiters: u64,
}

impl PoolDescriptor {
    pub fn new(name: impl Into<String>, block_size: u64) -> Self {
        Self {
            name: name.into(),
            block_size,
            interrupt_arena: None,
            expand_size: 0,
            expansion_head: 0,
            free_head: 0,
            interrupt_free_head: 0,
            allocated: 0,
            waiters: 0,
        }
    }

    pub fn with_interrupt_arena(mut self, arena: Region) -> Self {
        self.interrupt_arena = Some(arena);
        self
    }

    pub fn with_expansions(mut self, expand_size: u64, head: u64) -> Self {
        self.expand_size = expand_size;
        self.expansion_head = head;
        self
    }

    pub fn with_free_queue(mut self, head: u64) -> Self {
        self.free_head = head;
        self
    }

    pub fn with_interrupt_free_queue(mut self, head: u64) -> Self {
        self.interrupt_free_head = head;
        self
    }

    pub fn with_counters(mut self, allocated: u64, waiters: u64) -> Self {
        self.allocated = allocated;
        self.waiters = waiters;
        self
    }
}

/// Field offsets inside a heap node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeLayout {
    pub size: u64,
    pub owner: u64,
    pub sequence: u64,
    pub backtrace: u64,
    pub header_size: u64,
}

/// Field offsets inside the trailer that follows each pool block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrailerLayout {
    pub magic: u64,
    pub owner: u64,
    pub sequence: u64,
    pub backtrace: u64,
    pub size: u64,
}

/// Describes the target: its word format, allocator options, heap regions and pools.
///
/// ```rust
/// use heapscope::{PointerWidth, Region, TargetConfig, Tracking};
///
/// let target = TargetConfig::new(PointerWidth::Four)
///     .with_tracking(Tracking::Backtrace(8))
///     .with_region(Region::new(0x2000_0000, 0x2004_0000));
/// assert!(target.validate().is_ok());
/// assert_eq!(target.alignment(), 8);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pointer_width: PointerWidth,
    endian: Endian,
    alignment: Option<u64>,
    tracking: Tracking,
    regions: Vec<Region>,
    pools: Vec<PoolDescriptor>,
}

impl TargetConfig {
    pub fn new(pointer_width: PointerWidth) -> Self {
        Self {
            pointer_width,
            endian: Endian::default(),
            alignment: None,
            tracking: Tracking::default(),
            regions: Vec::new(),
            pools: Vec::new(),
        }
    }

    pub fn with_endian(mut self, endian: Endian) -> Self {
        self.endian = endian;
        self
    }

    /// Overrides the allocator alignment, which otherwise defaults to two pointers.
    pub fn with_alignment(mut self, alignment: u64) -> Self {
        self.alignment = Some(alignment);
        self
    }

    pub fn with_tracking(mut self, tracking: Tracking) -> Self {
        self.tracking = tracking;
        self
    }

    pub fn with_region(mut self, region: Region) -> Self {
        self.regions.push(region);
        self
    }

    pub fn with_pool(mut self, pool: PoolDescriptor) -> Self {
        self.pools.push(pool);
        self
    }

    pub fn pointer_width(&self) -> PointerWidth {
        self.pointer_width
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn alignment(&self) -> u64 {
        self.alignment.unwrap_or(2 * self.pointer_width.bytes())
    }

    pub fn tracking(&self) -> Tracking {
        self.tracking
    }

    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    pub fn pools(&self) -> &[PoolDescriptor] {
        &self.pools
    }

    /// Sum of all heap region lengths.
    pub fn heap_size(&self) -> u64 {
        self.regions.iter().map(Region::len).sum()
    }

    /// Layout of a heap node header for this target.
    pub fn node_layout(&self) -> NodeLayout {
        let word = self.pointer_width.bytes();
        let owner = 2 * word;
        if !self.tracking.records_owner() {
            return NodeLayout {
                size: word,
                owner,
                sequence: owner,
                backtrace: owner,
                header_size: owner,
            };
        }

        let sequence = align_up(owner + 4, word);
        let backtrace = sequence + word;
        NodeLayout {
            size: word,
            owner,
            sequence,
            backtrace,
            header_size: backtrace + self.tracking.depth() as u64 * word,
        }
    }

    /// Layout of the pool block trailer, `None` when blocks carry no trailer.
    pub fn trailer_layout(&self) -> Option<TrailerLayout> {
        if !self.tracking.records_owner() {
            return None;
        }

        let word = self.pointer_width.bytes();
        let sequence = align_up(8, word);
        let backtrace = sequence + word;
        Some(TrailerLayout {
            magic: 0,
            owner: 4,
            sequence,
            backtrace,
            size: backtrace + self.tracking.depth() as u64 * word,
        })
    }

    /// Stride between two blocks of `pool`.
    pub fn pool_stride(&self, pool: &PoolDescriptor) -> u64 {
        pool_block_stride(
            pool.block_size,
            self.trailer_layout().map(|trailer| trailer.size),
            self.alignment(),
        )
    }

    /// Checks the descriptor for settings the traversal cannot work with.
    pub fn validate(&self) -> Result<()> {
        let alignment = self.alignment();
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(Error::MisconfiguredTarget(format!(
                "alignment {alignment} is not a power of two"
            )));
        }

        if let Some(region) = self.regions.iter().find(|region| region.start > region.end) {
            return Err(Error::MisconfiguredTarget(format!(
                "heap region {:#x}..{:#x} ends before it starts",
                region.start, region.end
            )));
        }

        for pool in &self.pools {
            if pool.block_size == 0 {
                return Err(Error::MisconfiguredTarget(format!(
                    "pool `{}` has a zero block size",
                    pool.name
                )));
            }
            if pool.expansion_head != 0 && pool.expand_size < self.pointer_width.bytes() {
                return Err(Error::MisconfiguredTarget(format!(
                    "pool `{}` expansion size {} cannot hold the queue link",
                    pool.name, pool.expand_size
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_lay_out_tracked_node_header() {
        let target = TargetConfig::new(PointerWidth::Eight).with_tracking(Tracking::Backtrace(4));
        let layout = target.node_layout();
        assert_eq!(layout.size, 8);
        assert_eq!(layout.owner, 16);
        assert_eq!(layout.sequence, 24);
        assert_eq!(layout.backtrace, 32);
        assert_eq!(layout.header_size, 64);

        let target = TargetConfig::new(PointerWidth::Four).with_tracking(Tracking::Owner);
        let layout = target.node_layout();
        assert_eq!(layout.owner, 8);
        assert_eq!(layout.sequence, 12);
        assert_eq!(layout.header_size, 16);
    }

    #[test]
    fn test_should_lay_out_bare_node_header() {
        let target = TargetConfig::new(PointerWidth::Four);
        assert_eq!(target.node_layout().header_size, 8);
        assert!(target.trailer_layout().is_none());
    }

    #[test]
    fn test_should_compute_stride_from_trailer() {
        let pool = PoolDescriptor::new("pool-32", 32);
        let target = TargetConfig::new(PointerWidth::Eight).with_tracking(Tracking::Backtrace(4));
        // trailer: magic, owner, sequence, 4 return addresses
        assert_eq!(target.trailer_layout().map(|t| t.size), Some(48));
        assert_eq!(target.pool_stride(&pool), 80);

        let target = TargetConfig::new(PointerWidth::Eight);
        assert_eq!(target.pool_stride(&pool), 32);
    }

    #[test]
    fn test_should_default_alignment_to_two_pointers() {
        assert_eq!(TargetConfig::new(PointerWidth::Four).alignment(), 8);
        assert_eq!(TargetConfig::new(PointerWidth::Eight).alignment(), 16);
        assert_eq!(
            TargetConfig::new(PointerWidth::Eight)
                .with_alignment(64)
                .alignment(),
            64
        );
    }

    #[test]
    fn test_should_reject_bad_alignment() {
        let error = TargetConfig::new(PointerWidth::Eight)
            .with_alignment(24)
            .validate()
            .unwrap_err();
        assert!(error.is_fatal());
        assert!(error.to_string().contains("alignment 24"));
    }

    #[test]
    fn test_should_reject_inverted_region_and_empty_pool() {
        let target = TargetConfig::new(PointerWidth::Eight).with_region(Region::new(0x200, 0x100));
        assert!(target.validate().is_err());

        let target =
            TargetConfig::new(PointerWidth::Eight).with_pool(PoolDescriptor::new("empty", 0));
        assert!(target.validate().is_err());
    }

    #[test]
    fn test_should_sum_heap_size() {
        let target = TargetConfig::new(PointerWidth::Eight)
            .with_region(Region::new(0x1000, 0x2000))
            .with_region(Region::new(0x8000, 0x8100));
        assert_eq!(target.heap_size(), 0x1100);
        assert!(target.regions()[0].contains(0x1fff));
        assert!(!target.regions()[0].contains(0x2000));
    }
}
