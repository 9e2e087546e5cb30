//! Access to target memory.

use std::collections::BTreeMap;

use crate::codec;
use crate::config::{Endian, PointerWidth, TargetConfig};
use crate::error::{Error, Result};

/// Reads raw bytes out of the target.
///
/// Implemented by the debugger layer; [`Snapshot`] is the in-memory implementation used for
/// core dumps and tests.
pub trait Memory {
    /// Reads `len` bytes at `address`, failing with [`Error::UnreadableMemory`] when the range is
    /// not mapped.
    fn read(&self, address: u64, len: u64) -> Result<Vec<u8>>;
}

impl<M: Memory + ?Sized> Memory for &M {
    fn read(&self, address: u64, len: u64) -> Result<Vec<u8>> {
        (**self).read(address, len)
    }
}

/// A memory image made of non-overlapping segments.
///
/// A read must be satisfied by a single segment; ranges that straddle two segments, even
/// adjacent ones, are reported unreadable.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    segments: BTreeMap<u64, Vec<u8>>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `bytes` at `base`.
    pub fn add_segment(&mut self, base: u64, bytes: Vec<u8>) {
        self.segments.insert(base, bytes);
    }

    /// Maps `len` zero bytes at `base`.
    pub fn add_zeroed(&mut self, base: u64, len: usize) {
        self.add_segment(base, vec![0; len]);
    }

    /// Overwrites mapped bytes at `address`.
    pub fn write(&mut self, address: u64, bytes: &[u8]) -> Result<()> {
        let unreadable = Error::UnreadableMemory {
            address,
            len: bytes.len() as u64,
        };
        let (base, segment) = self
            .segments
            .range_mut(..=address)
            .next_back()
            .ok_or_else(|| unreadable.clone())?;
        let offset = usize::try_from(address - base).map_err(|_| unreadable.clone())?;
        let target = segment
            .get_mut(offset..offset + bytes.len())
            .ok_or(unreadable)?;
        target.copy_from_slice(bytes);
        Ok(())
    }

    pub fn write_u32(&mut self, address: u64, value: u32, endian: Endian) -> Result<()> {
        let bytes = match endian {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        };
        self.write(address, &bytes)
    }

    pub fn write_word(
        &mut self,
        address: u64,
        value: u64,
        width: PointerWidth,
        endian: Endian,
    ) -> Result<()> {
        self.write(address, &codec::encode_word(value, width, endian))
    }
}

impl Memory for Snapshot {
    fn read(&self, address: u64, len: u64) -> Result<Vec<u8>> {
        let unreadable = || Error::UnreadableMemory { address, len };
        let (base, segment) = self
            .segments
            .range(..=address)
            .next_back()
            .ok_or_else(unreadable)?;
        let start = usize::try_from(address - base).map_err(|_| unreadable())?;
        let len = usize::try_from(len).map_err(|_| unreadable())?;
        let end = start.checked_add(len).ok_or_else(unreadable)?;
        segment
            .get(start..end)
            .map(<[u8]>::to_vec)
            .ok_or_else(unreadable)
    }
}

/// Typed reads on top of a [`Memory`], using the target's word format.
pub struct TargetReader<'a, M: ?Sized> {
    memory: &'a M,
    width: PointerWidth,
    endian: Endian,
}

impl<M: ?Sized> Clone for TargetReader<'_, M> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<M: ?Sized> Copy for TargetReader<'_, M> {}

impl<'a, M: Memory + ?Sized> TargetReader<'a, M> {
    pub fn new(memory: &'a M, target: &TargetConfig) -> Self {
        Self {
            memory,
            width: target.pointer_width(),
            endian: target.endian(),
        }
    }

    pub fn width(&self) -> PointerWidth {
        self.width
    }

    pub fn bytes(&self, address: u64, len: u64) -> Result<Vec<u8>> {
        self.memory.read(address, len)
    }

    /// Reads one pointer-width word.
    pub fn word(&self, address: u64) -> Result<u64> {
        let len = self.width.bytes();
        let bytes = self.memory.read(address, len)?;
        codec::read_word(&bytes, 0, self.width, self.endian)
            .ok_or(Error::UnreadableMemory { address, len })
    }

    /// Decodes the pointer-width word at `offset` of an already read buffer.
    pub fn decode_word(&self, bytes: &[u8], offset: u64) -> u64 {
        codec::read_word(bytes, offset as usize, self.width, self.endian).unwrap_or_default()
    }

    pub fn decode_u32(&self, bytes: &[u8], offset: u64) -> u32 {
        codec::read_u32(bytes, offset as usize, self.endian).unwrap_or_default()
    }

    pub fn decode_i32(&self, bytes: &[u8], offset: u64) -> i32 {
        codec::read_i32(bytes, offset as usize, self.endian).unwrap_or_default()
    }

    pub fn decode_backtrace(&self, bytes: &[u8], offset: u64, depth: usize) -> Vec<u64> {
        codec::read_backtrace(bytes, offset as usize, depth, self.width, self.endian)
    }
}
