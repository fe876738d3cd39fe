//! Physical address space as seen by the DMA engines, the GPU and both CPUs.
//!
//! ```text
//!  0x0800_0000  ARM9 RAM      1 MiB   (save buffer at 0x0808_0000)
//!  0x1800_0000  VRAM          6 MiB   (render buffer, capture textures, framebuffers)
//!  0x1FF0_0000  DSP memory  512 KiB   (color lookup table)
//!  0x1FF8_0000  AXI WRAM    512 KiB   (DMA programs, IPC scratch buffers)
//! ```

use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

pub const ARM9_RAM_BASE: u32 = 0x0800_0000;
pub const ARM9_RAM_SIZE: usize = 0x10_0000;
pub const VRAM_BASE: u32 = 0x1800_0000;
pub const VRAM_SIZE: usize = 0x60_0000;
pub const DSP_MEM_BASE: u32 = 0x1FF0_0000;
pub const DSP_MEM_SIZE: usize = 0x8_0000;
pub const AXI_WRAM_BASE: u32 = 0x1FF8_0000;
pub const AXI_WRAM_SIZE: usize = 0x8_0000;

/// Where the ARM9 keeps the live GBA save while the title runs.
pub const SAVE_LOC: u32 = 0x0808_0000;
pub const SAVE_MAX_SIZE: usize = 0x2_0000;

// AXI WRAM as the ARM11 firmware carves it up.
pub const DMA_SCRATCH_ADDR: u32 = AXI_WRAM_BASE;
pub const DMA_SCRATCH_SIZE: usize = 0x100;
pub const CAPTURE_PROG_ADDR: u32 = AXI_WRAM_BASE + 0x1000;
pub const CAPTURE_PROG_SIZE: usize = 0x100;
pub const GPU_INIT_LIST_ADDR: u32 = AXI_WRAM_BASE + 0x2000;
pub const GPU_FRAME_LIST_ADDR: u32 = AXI_WRAM_BASE + 0x3000;
pub const GPU_LIST_SIZE: usize = 0x1000;
/// Buffers the ARM11 hands to the ARM9 with PXI commands.
pub const IPC_SCRATCH_ADDR: u32 = AXI_WRAM_BASE + 0x4000;
pub const IPC_SCRATCH_SIZE: usize = 0x1000;

struct Region {
    base: u32,
    size: usize,
    data: Mutex<Box<[u8]>>,
}

impl Region {
    fn new(base: u32, size: usize) -> Self {
        Self {
            base,
            size,
            data: Mutex::new(vec![0; size].into_boxed_slice()),
        }
    }

    fn contains(&self, addr: u32, len: usize) -> bool {
        addr >= self.base && (addr - self.base) as usize + len <= self.size
    }
}

pub struct PhysMem {
    regions: [Region; 4],
}

impl Default for PhysMem {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysMem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            regions: [
                Region::new(ARM9_RAM_BASE, ARM9_RAM_SIZE),
                Region::new(VRAM_BASE, VRAM_SIZE),
                Region::new(DSP_MEM_BASE, DSP_MEM_SIZE),
                Region::new(AXI_WRAM_BASE, AXI_WRAM_SIZE),
            ],
        }
    }

    /// Locks the region holding the range. Closures passed to the slice
    /// accessors must not access the same region again.
    fn locate(&self, addr: u32, len: usize) -> Result<(MutexGuard<'_, Box<[u8]>>, usize)> {
        let region = self
            .regions
            .iter()
            .find(|r| r.contains(addr, len))
            .ok_or(Error::OutOfRange { addr, len })?;
        let data = region.data.lock().unwrap_or_else(PoisonError::into_inner);

        Ok((data, (addr - region.base) as usize))
    }

    /// Runs `f` on `len` bytes starting at `addr`.
    ///
    /// # Errors
    /// If the range is not fully inside one memory region.
    pub fn with_slice<R>(&self, addr: u32, len: usize, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        let (data, off) = self.locate(addr, len)?;
        Ok(f(&data[off..off + len]))
    }

    /// Mutable variant of [`PhysMem::with_slice`].
    ///
    /// # Errors
    /// If the range is not fully inside one memory region.
    pub fn with_slice_mut<R>(
        &self,
        addr: u32,
        len: usize,
        f: impl FnOnce(&mut [u8]) -> R,
    ) -> Result<R> {
        let (mut data, off) = self.locate(addr, len)?;
        Ok(f(&mut data[off..off + len]))
    }

    /// # Errors
    /// If the range is not mapped.
    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<()> {
        self.with_slice(addr, buf.len(), |src| buf.copy_from_slice(src))
    }

    /// # Errors
    /// If the range is not mapped.
    pub fn write(&self, addr: u32, data: &[u8]) -> Result<()> {
        self.with_slice_mut(addr, data.len(), |dst| dst.copy_from_slice(data))
    }

    /// # Errors
    /// If the range is not mapped.
    pub fn read_vec(&self, addr: u32, len: usize) -> Result<Vec<u8>> {
        self.with_slice(addr, len, <[u8]>::to_vec)
    }

    /// # Errors
    /// If the range is not mapped.
    pub fn fill(&self, addr: u32, len: usize, value: u8) -> Result<()> {
        self.with_slice_mut(addr, len, |dst| dst.fill(value))
    }

    /// # Errors
    /// If the word is not mapped.
    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        let mut b = [0; 4];
        self.read(addr, &mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    /// # Errors
    /// If the word is not mapped.
    pub fn write_u32(&self, addr: u32, value: u32) -> Result<()> {
        self.write(addr, &value.to_le_bytes())
    }
}
