//! First-fit allocator over VRAM.
//!
//! Free space is a list of blocks sorted by address. Allocations split the
//! first block that fits (after aligning its start) and frees merge the
//! chunk back with its neighbours.

use std::collections::BTreeMap;

use tracing::debug;

use crate::{
    error::{Error, Result},
    hardware::mem::{VRAM_BASE, VRAM_SIZE},
};

/// Alignment of [`VramAllocator::alloc_default`], what the PPF wants.
pub const DEFAULT_ALIGN: u32 = 0x80;
const MIN_ALIGN: u32 = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    base: u32,
    size: u32,
}

impl Block {
    const fn end(self) -> u32 {
        self.base + self.size
    }
}

#[derive(Debug)]
pub struct VramAllocator {
    free: Vec<Block>,
    used: BTreeMap<u32, u32>,
}

impl Default for VramAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl VramAllocator {
    /// All of VRAM free.
    #[must_use]
    pub fn new() -> Self {
        Self::with_range(VRAM_BASE, VRAM_SIZE as u32)
    }

    #[must_use]
    pub fn with_range(base: u32, size: u32) -> Self {
        Self {
            free: vec![Block { base, size }],
            used: BTreeMap::new(),
        }
    }

    /// Allocates `size` bytes aligned to `align`, a power of two. Alignments
    /// below 16 are raised to 16 and the size is padded to the alignment.
    ///
    /// # Errors
    /// [`Error::InvalidArg`] for a zero size or an alignment that is not a
    /// power of two, [`Error::OutOfVram`] if no free block fits.
    pub fn alloc(&mut self, size: usize, align: u32) -> Result<u32> {
        if size == 0 {
            return Err(Error::InvalidArg("zero sized VRAM allocation"));
        }
        if !align.is_power_of_two() {
            return Err(Error::InvalidArg("VRAM alignment must be a power of two"));
        }
        let align = align.max(MIN_ALIGN);
        let mask = align - 1;
        let size = u32::try_from(size)
            .ok()
            .and_then(|s| s.checked_add(mask))
            .map(|s| s & !mask)
            .ok_or(Error::OutOfVram(size))?;

        let (idx, addr) = self
            .free
            .iter()
            .enumerate()
            .find_map(|(i, b)| {
                let addr = b.base.checked_add(mask)? & !mask;
                (addr.checked_add(size)? <= b.end()).then_some((i, addr))
            })
            .ok_or(Error::OutOfVram(size as usize))?;

        let block = self.free[idx];
        let head = Block {
            base: block.base,
            size: addr - block.base,
        };
        let tail = Block {
            base: addr + size,
            size: block.end() - (addr + size),
        };
        self.free.remove(idx);
        for part in [tail, head] {
            if part.size != 0 {
                self.free.insert(idx, part);
            }
        }
        self.used.insert(addr, size);

        debug!("VRAM: allocated 0x{size:X} bytes at 0x{addr:08X}");
        Ok(addr)
    }

    pub fn alloc_default(&mut self, size: usize) -> Result<u32> {
        self.alloc(size, DEFAULT_ALIGN)
    }

    /// Returns the allocation at `addr` to the free list. Unknown addresses
    /// are ignored.
    pub fn free(&mut self, addr: u32) {
        let Some(size) = self.used.remove(&addr) else {
            return;
        };
        let idx = self.free.partition_point(|b| b.base < addr);
        self.free.insert(idx, Block { base: addr, size });

        // Merge with the right neighbour, then the left one.
        if idx + 1 < self.free.len() && self.free[idx].end() == self.free[idx + 1].base {
            self.free[idx].size += self.free.remove(idx + 1).size;
        }
        if idx > 0 && self.free[idx - 1].end() == self.free[idx].base {
            self.free[idx - 1].size += self.free.remove(idx).size;
        }
        debug!("VRAM: freed 0x{size:X} bytes at 0x{addr:08X}");
    }

    /// Size of the allocation at `addr` after padding.
    #[must_use]
    pub fn size_of(&self, addr: u32) -> Option<usize> {
        self.used.get(&addr).map(|&s| s as usize)
    }

    #[must_use]
    pub fn free_space(&self) -> usize {
        self.free.iter().map(|b| b.size as usize).sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::RngExt;

    use super::*;

    #[test]
    fn first_fit_with_padding() {
        let mut vram = VramAllocator::new();
        let a = vram.alloc_default(400 * 240 * 3).unwrap();
        let b = vram.alloc_default(1).unwrap();
        assert_eq!(a, VRAM_BASE);
        assert_eq!(b, VRAM_BASE + 400 * 240 * 3);
        assert_eq!(vram.size_of(b), Some(0x80));
        assert_eq!(vram.free_space(), VRAM_SIZE - 400 * 240 * 3 - 0x80);
    }

    #[test]
    fn alignment_leaves_a_hole_that_is_reused() {
        let mut vram = VramAllocator::new();
        let small = vram.alloc(0x10, 16).unwrap();
        let big = vram.alloc(0x100, 0x1000).unwrap();
        assert_eq!(big, VRAM_BASE + 0x1000);
        // The hole between both is found first.
        let again = vram.alloc(0x20, 16).unwrap();
        assert_eq!(again, small + 0x10);
    }

    #[test]
    fn free_coalesces_back_to_one_block() {
        let mut vram = VramAllocator::new();
        let addrs: Vec<u32> = (0..4).map(|_| vram.alloc_default(0x1000).unwrap()).collect();
        for &a in [addrs[1], addrs[3], addrs[0], addrs[2]].iter() {
            vram.free(a);
        }
        assert_eq!(vram.free, vec![Block {
            base: VRAM_BASE,
            size: VRAM_SIZE as u32
        }]);
        // Double free is ignored.
        vram.free(addrs[0]);
        assert_eq!(vram.free_space(), VRAM_SIZE);
    }

    #[test]
    fn rejects_bad_requests() {
        let mut vram = VramAllocator::with_range(VRAM_BASE, 0x1000);
        assert!(matches!(vram.alloc(0, 16), Err(Error::InvalidArg(_))));
        assert!(matches!(vram.alloc(16, 24), Err(Error::InvalidArg(_))));
        assert!(matches!(vram.alloc(0x2000, 16), Err(Error::OutOfVram(0x2000))));
        vram.alloc(0x1000, 16).unwrap();
        assert!(matches!(vram.alloc(16, 16), Err(Error::OutOfVram(_))));
    }

    #[test]
    fn random_churn_keeps_accounting() {
        let mut rng = rand::rng();
        let mut vram = VramAllocator::with_range(VRAM_BASE, 0x10_0000);
        let mut live = Vec::new();
        for _ in 0..500 {
            if live.is_empty() || rng.random_bool(0.6) {
                if let Ok(a) = vram.alloc(rng.random_range(1..0x4000), 1 << rng.random_range(4..10)) {
                    live.push(a);
                }
            } else {
                let i = rng.random_range(0..live.len());
                vram.free(live.swap_remove(i));
            }
            let used: usize = live.iter().map(|&a| vram.size_of(a).unwrap()).sum();
            assert_eq!(vram.free_space() + used, 0x10_0000);
        }
        for a in live {
            vram.free(a);
        }
        assert_eq!(vram.free.len(), 1);
    }
}
