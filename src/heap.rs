//! Traversal of the general heap.
//!
//! Nodes sit back to back inside each region, so the next node is always found at
//! `base + size`:
//!
//! ```text
//!   region.start                                                         region.end
//!   ┌────────┬──────────┬────────┬──────────────┬────────┬───────────────┐
//!   │ header │ payload  │ header │   (free)     │ header │   payload     │
//!   └────────┴──────────┴────────┴──────────────┴────────┴───────────────┘
//!   ◄───── size ───────►◄──────── size ────────►◄──────── size ─────────►
//! ```

use std::ops::RangeInclusive;

use crate::codec;
use crate::config::{NodeLayout, POOL_OWNER, Region, TargetConfig, Tracking};
use crate::error::{Error, Result};
use crate::memory::{Memory, TargetReader};

/// Decoded view of one heap node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapNode {
    /// Index of the region the node was found in.
    pub region: usize,
    /// Address of the node header.
    pub base: u64,
    /// Address of the first payload byte.
    pub payload: u64,
    /// Node size, header included.
    pub size: u64,
    pub allocated: bool,
    /// The previous node in address order is free.
    pub prev_free: bool,
    /// The following node in address order is free.
    pub next_free: bool,
    pub owner: i32,
    pub sequence: u64,
    pub backtrace: Vec<u64>,
}

impl HeapNode {
    pub fn end(&self) -> u64 {
        self.base.saturating_add(self.size)
    }

    /// Payload length.
    pub fn payload_size(&self) -> u64 {
        self.end().saturating_sub(self.payload)
    }

    /// An allocated node sitting next to a free one.
    pub fn is_orphan(&self) -> bool {
        self.allocated && (self.prev_free || self.next_free)
    }

    /// Whether the node backs a pool arena.
    pub fn is_pool_backing(&self) -> bool {
        self.allocated && self.owner == POOL_OWNER
    }

    /// Free nodes carry no sequence number and always match.
    pub fn in_sequence(&self, range: &RangeInclusive<u64>) -> bool {
        !self.allocated || range.contains(&self.sequence)
    }
}

/// Lazily walks every heap region in order, yielding nodes in ascending address order.
///
/// A corrupt or unreadable node ends its region with an `Err` item; the walk then carries on with
/// the next region.
pub struct HeapWalker<'a, M: ?Sized> {
    reader: TargetReader<'a, M>,
    layout: NodeLayout,
    tracking: Tracking,
    regions: &'a [Region],
    next_region: usize,
    cursor: Option<RegionCursor>,
    pending: Option<HeapNode>,
    deferred: Option<Error>,
}

impl<'a, M: Memory + ?Sized> HeapWalker<'a, M> {
    pub fn new(memory: &'a M, target: &'a TargetConfig) -> Self {
        Self {
            reader: TargetReader::new(memory, target),
            layout: target.node_layout(),
            tracking: target.tracking(),
            regions: target.regions(),
            next_region: 0,
            cursor: None,
            pending: None,
            deferred: None,
        }
    }

    fn decode(&self, region: usize, base: u64) -> Result<HeapNode> {
        let bytes = self.reader.bytes(base, self.layout.header_size)?;
        let header = codec::decode_heap_header(self.reader.decode_word(&bytes, self.layout.size));

        // free nodes reuse the tracking fields for their free-list links
        let tracked = header.allocated && self.tracking.records_owner();
        let (owner, sequence, backtrace) = if tracked {
            (
                self.reader.decode_i32(&bytes, self.layout.owner),
                self.reader.decode_word(&bytes, self.layout.sequence),
                self.reader
                    .decode_backtrace(&bytes, self.layout.backtrace, self.tracking.depth()),
            )
        } else {
            (0, 0, Vec::new())
        };

        Ok(HeapNode {
            region,
            base,
            payload: base + self.layout.header_size,
            size: header.size,
            allocated: header.allocated,
            prev_free: header.prev_free,
            next_free: false,
            owner,
            sequence,
            backtrace,
        })
    }

    fn step(&mut self) -> Option<Result<HeapNode>> {
        let cursor = self.cursor.as_mut()?;
        if cursor.done || cursor.current >= cursor.region.end {
            return None;
        }

        if cursor.steps >= cursor.max_steps {
            cursor.done = true;
            return Some(Err(Error::CorruptHeap {
                address: cursor.current,
                reason: "node chain longer than its region",
            }));
        }
        cursor.steps += 1;

        let (index, base) = (cursor.index, cursor.current);
        let node = match self.decode(index, base) {
            Ok(node) => node,
            Err(error) => {
                self.stop_region();
                return Some(Err(error));
            }
        };

        match base.checked_add(node.size) {
            Some(next) if next > base => {
                if let Some(cursor) = self.cursor.as_mut() {
                    cursor.current = next;
                }
                Some(Ok(node))
            }
            _ => {
                self.stop_region();
                Some(Err(Error::CorruptHeap {
                    address: base,
                    reason: "node size does not advance the walk",
                }))
            }
        }
    }

    fn stop_region(&mut self) {
        if let Some(cursor) = self.cursor.as_mut() {
            cursor.done = true;
        }
    }

    fn open_next_region(&mut self) -> bool {
        let Some(region) = self.regions.get(self.next_region).copied() else {
            return false;
        };
        tracing::debug!(
            index = self.next_region,
            start = region.start,
            end = region.end,
            "walking heap region"
        );

        // the smallest possible node is the size and preceding words
        let min_node = 2 * self.reader.width().bytes();
        self.cursor = Some(RegionCursor {
            index: self.next_region,
            region,
            current: region.start,
            steps: 0,
            max_steps: region.len() / min_node + 1,
            done: false,
        });
        self.next_region += 1;
        true
    }
}

impl<M: Memory + ?Sized> Iterator for HeapWalker<'_, M> {
    type Item = Result<HeapNode>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(error) = self.deferred.take() {
                tracing::warn!(%error, "heap region walk aborted");
                return Some(Err(error));
            }

            if self.cursor.is_none() && !self.open_next_region() {
                return self.pending.take().map(Ok);
            }

            match self.step() {
                Some(Ok(node)) => {
                    let next_free = !node.allocated;
                    if let Some(mut previous) = self.pending.replace(node) {
                        previous.next_free = next_free;
                        return Some(Ok(previous));
                    }
                }
                Some(Err(error)) => {
                    self.cursor = None;
                    self.deferred = Some(error);
                    if let Some(previous) = self.pending.take() {
                        return Some(Ok(previous));
                    }
                }
                None => {
                    self.cursor = None;
                    if let Some(previous) = self.pending.take() {
                        return Some(Ok(previous));
                    }
                }
            }
        }
    }
}

struct RegionCursor {
    index: usize,
    region: Region,
    current: u64,
    steps: u64,
    max_steps: u64,
    done: bool,
}
