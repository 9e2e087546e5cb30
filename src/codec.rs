//! Decoding of the packed allocator metadata.
//!
//! A heap node header stores its size with two flag bits folded into the low bits:
//!
//! ```text
//!   size word:  ┌──────────────────────────────┬──────┬───────┐
//!               │        real size (bytes)     │ PREV │ ALLOC │
//!               └──────────────────────────────┴──────┴───────┘
//!                                                 bit 1   bit 0
//! ```
//!
//! The raw word never leaves this module: callers get a [`NodeHeader`] with named fields.

use crate::config::{Endian, PointerWidth};

/// Node is allocated.
pub const ALLOC_BIT: u64 = 0x1;
/// The node right before this one (in address order) is free.
pub const PREV_FREE_BIT: u64 = 0x2;
const FLAG_MASK: u64 = ALLOC_BIT | PREV_FREE_BIT;

/// Value stored in a pool block trailer while the block is handed out.
pub const POOL_MAGIC_ALLOC: u32 = 0x5555_5555;

/// Decoded heap node size word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    pub size: u64,
    pub allocated: bool,
    pub prev_free: bool,
}

/// Splits a raw size word into the real size and its flags.
pub fn decode_heap_header(raw_size: u64) -> NodeHeader {
    NodeHeader {
        size: raw_size & !FLAG_MASK,
        allocated: raw_size & ALLOC_BIT != 0,
        prev_free: raw_size & PREV_FREE_BIT != 0,
    }
}

/// Packs a [`NodeHeader`] back into a raw size word.
///
/// The low bits of `size` are dropped, as the allocator never produces sizes that use them.
pub fn encode_heap_header(header: NodeHeader) -> u64 {
    let mut raw = header.size & !FLAG_MASK;
    if header.allocated {
        raw |= ALLOC_BIT;
    }
    if header.prev_free {
        raw |= PREV_FREE_BIT;
    }
    raw
}

/// Rounds `n` up to the next multiple of `align`, which must be a power of two.
pub fn align_up(n: u64, align: u64) -> u64 {
    n.wrapping_add(align - 1) & !(align - 1)
}

/// Distance between two consecutive blocks of a pool arena.
///
/// When allocation tracking is compiled in every block is followed by a trailer of
/// `trailer_size` bytes and the pair is padded to `alignment`.
pub fn pool_block_stride(block_size: u64, trailer_size: Option<u64>, alignment: u64) -> u64 {
    match trailer_size {
        Some(trailer) => align_up(block_size + trailer, alignment),
        None => block_size,
    }
}

/// Reads a pointer-width word at `offset`, or `None` if `bytes` is too short.
pub fn read_word(bytes: &[u8], offset: usize, width: PointerWidth, endian: Endian) -> Option<u64> {
    match width {
        PointerWidth::Four => read_u32(bytes, offset, endian).map(u64::from),
        PointerWidth::Eight => {
            let raw: [u8; 8] = bytes.get(offset..offset.checked_add(8)?)?.try_into().ok()?;
            Some(match endian {
                Endian::Little => u64::from_le_bytes(raw),
                Endian::Big => u64::from_be_bytes(raw),
            })
        }
    }
}

/// Reads a `u32` at `offset`.
pub fn read_u32(bytes: &[u8], offset: usize, endian: Endian) -> Option<u32> {
    let raw: [u8; 4] = bytes.get(offset..offset.checked_add(4)?)?.try_into().ok()?;
    Some(match endian {
        Endian::Little => u32::from_le_bytes(raw),
        Endian::Big => u32::from_be_bytes(raw),
    })
}

/// Reads an `i32` at `offset`.
pub fn read_i32(bytes: &[u8], offset: usize, endian: Endian) -> Option<i32> {
    read_u32(bytes, offset, endian).map(|value| value as i32)
}

/// Reads up to `depth` return addresses starting at `offset`; a zero entry ends the list.
pub fn read_backtrace(
    bytes: &[u8],
    offset: usize,
    depth: usize,
    width: PointerWidth,
    endian: Endian,
) -> Vec<u64> {
    let step = width.bytes() as usize;
    (0..depth)
        .map_while(|index| read_word(bytes, offset + index * step, width, endian))
        .take_while(|pc| *pc != 0)
        .collect()
}

/// Encodes a pointer-width word. Values wider than the target word are truncated.
pub fn encode_word(value: u64, width: PointerWidth, endian: Endian) -> Vec<u8> {
    match (width, endian) {
        (PointerWidth::Four, Endian::Little) => (value as u32).to_le_bytes().to_vec(),
        (PointerWidth::Four, Endian::Big) => (value as u32).to_be_bytes().to_vec(),
        (PointerWidth::Eight, Endian::Little) => value.to_le_bytes().to_vec(),
        (PointerWidth::Eight, Endian::Big) => value.to_be_bytes().to_vec(),
    }
}

#[cfg(test)]
mod test {

    use super::*;

    #[test]
    fn test_should_mask_flags_out_of_size() {
        let header = decode_heap_header(0x130 | ALLOC_BIT | PREV_FREE_BIT);
        assert_eq!(header.size, 0x130);
        assert!(header.allocated);
        assert!(header.prev_free);

        let header = decode_heap_header(0x40);
        assert_eq!(header.size, 0x40);
        assert!(!header.allocated);
        assert!(!header.prev_free);
    }

    #[test]
    fn test_should_encode_flags() {
        let raw = encode_heap_header(NodeHeader {
            size: 0x80,
            allocated: true,
            prev_free: false,
        });
        assert_eq!(raw, 0x81);
    }

    #[test]
    fn test_should_align_up() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 8), 24);
    }

    #[test]
    fn test_should_compute_pool_stride() {
        assert_eq!(pool_block_stride(32, None, 16), 32);
        assert_eq!(pool_block_stride(32, Some(48), 16), 80);
        assert_eq!(pool_block_stride(20, Some(28), 16), 48);
        assert_eq!(pool_block_stride(20, Some(30), 16), 64);
    }

    #[test]
    fn test_should_read_words_in_both_byte_orders() {
        let bytes = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        assert_eq!(
            read_word(&bytes, 0, PointerWidth::Eight, Endian::Little),
            Some(0x0807_0605_0403_0201)
        );
        assert_eq!(
            read_word(&bytes, 4, PointerWidth::Four, Endian::Big),
            Some(0x0506_0708)
        );
        assert_eq!(read_word(&bytes, 4, PointerWidth::Eight, Endian::Little), None);
    }

    #[test]
    fn test_should_stop_backtrace_at_zero_entry() {
        let mut bytes = Vec::new();
        for pc in [0x1000u64, 0x2000, 0, 0x3000] {
            bytes.extend(encode_word(pc, PointerWidth::Eight, Endian::Little));
        }
        let backtrace = read_backtrace(&bytes, 0, 4, PointerWidth::Eight, Endian::Little);
        assert_eq!(backtrace, vec![0x1000, 0x2000]);
    }
}
