//! Growable byte store partitioned into power-of-two blocks.
//!
//! Offsets decompose as `(offset >> block_bits, offset & in_block_mask)`.
//! Any read or write within the valid extent touches at most two adjacent
//! blocks; reads that stay inside one block are served zero-copy.

use crate::error::{QuiverError, Result};
use std::borrow::Cow;
use std::io::{Read, Write};

/// Default block granularity: 128 MiB.
pub const DEFAULT_BLOCK_SIZE: u64 = 128 * 1024 * 1024;

/// Alignment of every block's base address in bytes.
pub const BLOCK_ALIGN: usize = 64;

/// One cache line of payload; blocks are arrays of these so their base
/// address is always 64-byte aligned and typed views into them stay sound.
#[derive(Clone, Copy)]
#[repr(C, align(64))]
struct AlignedCell([u8; BLOCK_ALIGN]);

struct Block(Box<[AlignedCell]>);

impl Block {
    fn alloc(size: usize) -> Result<Self> {
        debug_assert_eq!(size % BLOCK_ALIGN, 0);
        let cells = size / BLOCK_ALIGN;
        let mut buf = Vec::new();
        buf.try_reserve_exact(cells)
            .map_err(|_| QuiverError::out_of_memory(size))?;
        buf.resize(cells, AlignedCell([0u8; BLOCK_ALIGN]));
        Ok(Self(buf.into_boxed_slice()))
    }

    #[inline]
    fn as_bytes(&self) -> &[u8] {
        // SAFETY: AlignedCell is a repr(C) wrapper around [u8; 64] with no
        // padding, so the cell array is one contiguous byte run.
        unsafe {
            std::slice::from_raw_parts(self.0.as_ptr() as *const u8, self.0.len() * BLOCK_ALIGN)
        }
    }

    #[inline]
    fn as_bytes_mut(&mut self) -> &mut [u8] {
        // SAFETY: same layout argument as as_bytes.
        unsafe {
            std::slice::from_raw_parts_mut(
                self.0.as_mut_ptr() as *mut u8,
                self.0.len() * BLOCK_ALIGN,
            )
        }
    }
}

/// A growable byte array made of fixed-size, power-of-two blocks.
///
/// Block base addresses are 64-byte aligned, so a borrowing read at an
/// offset aligned to `align_of::<T>()` may be reinterpreted as `&[T]` for
/// plain-old-data `T`.
pub struct BlockStore {
    block_size: u64,
    block_bits: u32,
    in_block_mask: u64,
    blocks: Vec<Block>,
}

impl BlockStore {
    /// Create an empty store. `block_size` is rounded down to the nearest
    /// power of two; values below 1 KiB are clamped up to 1 KiB.
    pub fn new(block_size: u64) -> Self {
        let block_size = prev_power_of_two(block_size.max(1024));
        let block_bits = block_size.trailing_zeros();
        Self {
            block_size,
            block_bits,
            in_block_mask: block_size - 1,
            blocks: Vec::new(),
        }
    }

    /// Block granularity in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    /// Current capacity in bytes (block count times block size).
    pub fn capacity(&self) -> u64 {
        (self.blocks.len() as u64) << self.block_bits
    }

    #[inline]
    fn in_bounds(&self, end: u64) -> bool {
        end <= self.capacity()
    }

    #[inline]
    fn in_one_block(&self, off1: u64, off2: u64) -> bool {
        (off1 ^ off2) < self.block_size
    }

    fn grow_to(&mut self, size: u64) -> Result<()> {
        if self.in_bounds(size) {
            return Ok(());
        }
        let want = ((size + self.block_size - 1) >> self.block_bits) as usize;
        while self.blocks.len() < want {
            self.blocks.push(Block::alloc(self.block_size as usize)?);
        }
        Ok(())
    }

    /// Write `data` at `offset`, growing the store as needed. Writes that
    /// cross block boundaries are split.
    pub fn write(&mut self, data: &[u8], offset: u64) -> Result<()> {
        self.grow_to(offset + data.len() as u64)?;
        let mut written = 0usize;
        let mut block_no = (offset >> self.block_bits) as usize;
        let mut block_off = (offset & self.in_block_mask) as usize;
        while written < data.len() {
            let room = self.block_size as usize - block_off;
            let len = room.min(data.len() - written);
            self.blocks[block_no].as_bytes_mut()[block_off..block_off + len]
                .copy_from_slice(&data[written..written + len]);
            written += len;
            block_no += 1;
            block_off = 0;
        }
        Ok(())
    }

    /// Read `dst.len()` bytes starting at `offset` into `dst`. Returns false
    /// iff the range exceeds the current extent, in which case `dst` is left
    /// untouched.
    pub fn read(&self, offset: u64, dst: &mut [u8]) -> bool {
        if !self.in_bounds(offset + dst.len() as u64) {
            return false;
        }
        let mut filled = 0usize;
        let mut block_no = (offset >> self.block_bits) as usize;
        let mut block_off = (offset & self.in_block_mask) as usize;
        while filled < dst.len() {
            let room = self.block_size as usize - block_off;
            let len = room.min(dst.len() - filled);
            dst[filled..filled + len]
                .copy_from_slice(&self.blocks[block_no].as_bytes()[block_off..block_off + len]);
            filled += len;
            block_no += 1;
            block_off = 0;
        }
        true
    }

    /// Borrow `size` bytes at `offset` without copying when the range lies
    /// in a single block; otherwise copy into an owned scratch buffer.
    /// Returns `None` iff the range exceeds the current extent.
    pub fn direct_read(&self, offset: u64, size: u64) -> Option<Cow<'_, [u8]>> {
        if !self.in_bounds(offset + size) {
            return None;
        }
        if size == 0 || self.in_one_block(offset, offset + size - 1) {
            let block_no = (offset >> self.block_bits) as usize;
            let block_off = (offset & self.in_block_mask) as usize;
            Some(Cow::Borrowed(
                &self.blocks[block_no].as_bytes()[block_off..block_off + size as usize],
            ))
        } else {
            let mut buf = vec![0u8; size as usize];
            self.read(offset, &mut buf);
            Some(Cow::Owned(buf))
        }
    }

    /// Read multiple `(offset, size)` ranges, logically concatenated into
    /// `dst`. Returns false iff any range is invalid; valid prefixes may
    /// still have been copied.
    pub fn multi_read(&self, ranges: &[(u64, u64)], dst: &mut [u8]) -> bool {
        let mut cursor = 0usize;
        for &(offset, size) in ranges {
            let end = cursor + size as usize;
            if end > dst.len() || !self.read(offset, &mut dst[cursor..end]) {
                return false;
            }
            cursor = end;
        }
        true
    }

    /// Hint the cache that bytes at `offset` will be accessed soon.
    #[inline]
    pub fn prefetch(&self, offset: u64) {
        if !self.in_bounds(offset + 1) {
            return;
        }
        let block_no = (offset >> self.block_bits) as usize;
        let block_off = (offset & self.in_block_mask) as usize;
        let ptr = &self.blocks[block_no].as_bytes()[block_off] as *const u8;
        #[cfg(target_arch = "x86_64")]
        // SAFETY: prefetch is a cache hint and never dereferences.
        unsafe {
            std::arch::x86_64::_mm_prefetch(ptr as *const i8, std::arch::x86_64::_MM_HINT_T0);
        }
        #[cfg(not(target_arch = "x86_64"))]
        let _ = ptr;
    }

    /// Emit `u64 block_size`, `u64 block_count`, then raw block bytes in
    /// order.
    pub fn serialize<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.block_size.to_le_bytes())?;
        writer.write_all(&(self.blocks.len() as u64).to_le_bytes())?;
        for block in &self.blocks {
            writer.write_all(block.as_bytes())?;
        }
        Ok(())
    }

    /// Rebuild a store from the [`serialize`](Self::serialize) layout.
    pub fn deserialize<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; 8];
        reader.read_exact(&mut buf)?;
        let block_size = u64::from_le_bytes(buf);
        if !block_size.is_power_of_two() {
            return Err(QuiverError::corrupt(format!(
                "block size {block_size} is not a power of two"
            )));
        }
        reader.read_exact(&mut buf)?;
        let block_count = u64::from_le_bytes(buf);

        let mut store = Self::new(block_size);
        if store.block_size != block_size {
            return Err(QuiverError::corrupt(format!(
                "block size {block_size} below minimum granularity"
            )));
        }
        for _ in 0..block_count {
            let mut block = Block::alloc(block_size as usize)?;
            reader.read_exact(block.as_bytes_mut())?;
            store.blocks.push(block);
        }
        Ok(store)
    }
}

fn prev_power_of_two(value: u64) -> u64 {
    debug_assert!(value > 0);
    1u64 << (63 - value.leading_zeros())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> BlockStore {
        // 1 KiB blocks keep boundary cases cheap to exercise.
        BlockStore::new(1024)
    }

    #[test]
    fn test_block_size_rounds_down() {
        let store = BlockStore::new(3000);
        assert_eq!(store.block_size(), 2048);

        let store = BlockStore::new(4096);
        assert_eq!(store.block_size(), 4096);
    }

    #[test]
    fn test_write_read_roundtrip() {
        let mut store = small_store();
        let data: Vec<u8> = (0..=255).collect();
        store.write(&data, 100).unwrap();

        let mut out = vec![0u8; data.len()];
        assert!(store.read(100, &mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn test_write_across_block_boundary() {
        let mut store = small_store();
        let data: Vec<u8> = (0..100).collect();
        // Straddles the 1024-byte block boundary.
        store.write(&data, 1000).unwrap();

        let mut out = vec![0u8; 100];
        assert!(store.read(1000, &mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn test_read_out_of_bounds() {
        let mut store = small_store();
        store.write(&[1, 2, 3], 0).unwrap();

        let mut out = vec![0u8; 4];
        assert!(!store.read(1022, &mut out));
        // dst untouched on failure
        assert_eq!(out, vec![0u8; 4]);
    }

    #[test]
    fn test_direct_read_zero_copy_within_block() {
        let mut store = small_store();
        store.write(&[7u8; 64], 0).unwrap();

        match store.direct_read(8, 32).unwrap() {
            Cow::Borrowed(slice) => assert_eq!(slice, &[7u8; 32][..]),
            Cow::Owned(_) => panic!("single-block read should borrow"),
        }
    }

    #[test]
    fn test_direct_read_copies_across_blocks() {
        let mut store = small_store();
        let data: Vec<u8> = (0..100).collect();
        store.write(&data, 1000).unwrap();

        match store.direct_read(1000, 100).unwrap() {
            Cow::Owned(buf) => assert_eq!(buf, data),
            Cow::Borrowed(_) => panic!("boundary-spanning read should copy"),
        }
    }

    #[test]
    fn test_multi_read_concatenates() {
        let mut store = small_store();
        store.write(&[1u8; 8], 0).unwrap();
        store.write(&[2u8; 8], 512).unwrap();

        let mut out = vec![0u8; 16];
        assert!(store.multi_read(&[(0, 8), (512, 8)], &mut out));
        assert_eq!(&out[..8], &[1u8; 8]);
        assert_eq!(&out[8..], &[2u8; 8]);

        // Any invalid range fails the whole call.
        assert!(!store.multi_read(&[(0, 8), (1_000_000, 8)], &mut out));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let mut store = small_store();
        let data: Vec<u8> = (0..200).map(|x| (x * 7) as u8).collect();
        store.write(&data, 900).unwrap();

        let mut bytes = Vec::new();
        store.serialize(&mut bytes).unwrap();

        let restored = BlockStore::deserialize(&mut bytes.as_slice()).unwrap();
        assert_eq!(restored.block_size(), store.block_size());
        assert_eq!(restored.capacity(), store.capacity());

        let mut out = vec![0u8; data.len()];
        assert!(restored.read(900, &mut out));
        assert_eq!(out, data);
    }

    #[test]
    fn test_deserialize_rejects_bad_block_size() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&3000u64.to_le_bytes());
        bytes.extend_from_slice(&0u64.to_le_bytes());
        assert!(matches!(
            BlockStore::deserialize(&mut bytes.as_slice()),
            Err(QuiverError::CorruptData(_))
        ));
    }

    #[test]
    fn test_capacity_grows_monotonically() {
        let mut store = small_store();
        assert_eq!(store.capacity(), 0);
        store.write(&[0u8], 0).unwrap();
        assert_eq!(store.capacity(), 1024);
        store.write(&[0u8], 5000).unwrap();
        assert_eq!(store.capacity(), 5120);
    }
}
