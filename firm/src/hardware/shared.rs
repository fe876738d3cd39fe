//! Memory shared between CPUs and bus masters.
//!
//! On hardware the CPU data cache sits between software and the physical
//! memory the DMA engines and the other CPU see, so every hand-off needs a
//! clean, flush or invalidate of the range. Host memory is coherent, the
//! maintenance operations only order accesses here, but every driver still
//! calls them at the point the firmware has to.

use std::sync::{
    Arc,
    atomic::{Ordering, fence},
};

use super::mem::PhysMem;
use crate::error::Result;

/// Writes dirty lines back and discards them.
pub fn flush_dcache_range(_addr: u32, _len: usize) {
    fence(Ordering::Release);
}

/// Writes dirty lines back, keeping them cached.
pub fn clean_dcache_range(_addr: u32, _len: usize) {
    fence(Ordering::Release);
}

/// Discards cached lines so the next read fetches from memory.
pub fn invalidate_dcache_range(_addr: u32, _len: usize) {
    fence(Ordering::Acquire);
}

/// Data memory barrier, used before telling another core a buffer is ready.
pub fn data_memory_barrier() {
    fence(Ordering::SeqCst);
}

/// A physical range whose accessors always do the cache maintenance.
///
/// Writes go to memory and are flushed, reads invalidate first, so no stale
/// line is ever observed by either side.
#[derive(Clone)]
pub struct SharedRegion {
    mem: Arc<PhysMem>,
    addr: u32,
    len: usize,
}

impl SharedRegion {
    #[must_use]
    pub const fn new(mem: Arc<PhysMem>, addr: u32, len: usize) -> Self {
        Self { mem, addr, len }
    }

    #[must_use]
    pub const fn addr(&self) -> u32 {
        self.addr
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[must_use]
    pub fn mem(&self) -> &Arc<PhysMem> {
        &self.mem
    }

    fn check(&self, offset: usize, len: usize) -> Result<u32> {
        if offset + len > self.len {
            return Err(crate::error::Error::OutOfRange {
                addr: self.addr.wrapping_add(offset as u32),
                len,
            });
        }
        Ok(self.addr + offset as u32)
    }

    /// # Errors
    /// If `offset + data.len()` is past the end of the region.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
        let addr = self.check(offset, data.len())?;
        self.mem.write(addr, data)?;
        flush_dcache_range(addr, data.len());
        fence(Ordering::Release);
        Ok(())
    }

    /// # Errors
    /// If `offset + buf.len()` is past the end of the region.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<()> {
        let addr = self.check(offset, buf.len())?;
        invalidate_dcache_range(addr, buf.len());
        fence(Ordering::Acquire);
        self.mem.read(addr, buf)
    }

    /// Reads the whole region.
    ///
    /// # Errors
    /// If the region is not mapped.
    pub fn read_all(&self) -> Result<Vec<u8>> {
        let mut buf = vec![0; self.len];
        self.read(0, &mut buf)?;
        Ok(buf)
    }

    /// Runs `f` on the region contents after invalidating it.
    ///
    /// # Errors
    /// If the region is not mapped.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R> {
        invalidate_dcache_range(self.addr, self.len);
        fence(Ordering::Acquire);
        self.mem.with_slice(self.addr, self.len, f)
    }

    /// Runs `f` on the region contents and flushes them afterwards.
    ///
    /// # Errors
    /// If the region is not mapped.
    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> Result<R> {
        let r = self.mem.with_slice_mut(self.addr, self.len, f)?;
        flush_dcache_range(self.addr, self.len);
        fence(Ordering::Release);
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hardware::mem::AXI_WRAM_BASE;

    #[test]
    fn bounds_are_checked() {
        let mem = Arc::new(PhysMem::new());
        let region = SharedRegion::new(mem, AXI_WRAM_BASE, 16);

        region.write(12, &[1, 2, 3, 4]).unwrap();
        assert!(region.write(13, &[1, 2, 3, 4]).is_err());

        let mut buf = [0; 4];
        region.read(12, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        assert_eq!(region.read_all().unwrap().len(), 16);
    }

    #[test]
    fn visible_to_other_thread() {
        let mem = Arc::new(PhysMem::new());
        let region = SharedRegion::new(Arc::clone(&mem), AXI_WRAM_BASE, 4);
        let other = region.clone();

        std::thread::spawn(move || other.write(0, &0x1234_5678_u32.to_le_bytes()).unwrap())
            .join()
            .unwrap();

        let mut buf = [0; 4];
        region.read(0, &mut buf).unwrap();
        assert_eq!(u32::from_le_bytes(buf), 0x1234_5678);
    }
}
