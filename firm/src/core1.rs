//! Color correction on the second ARM11 core.
//!
//! Core 1 is booted with the lookup table already in place and then does
//! nothing but wait for a captured frame, remap every pixel of the capture
//! texture through the table into the RGBA8 texture the GPU samples and
//! raise IPI 15. The barrier before the IPI makes the converted frame
//! visible to core 0 before it starts the GPU.
//!
//! Both textures share the same tiling, so pixel `i` of the source is pixel
//! `i` of the destination and the conversion never looks at coordinates.

use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

use tracing::{debug, error, info};

use crate::{
    color::{COLOR_LUT_ADDR, COLOR_LUT_ENTRIES},
    drivers::gx::cmdlist::{GPU_TEXTURE_ADDR, GPU_TEXTURE2_ADDR, TEXTURE_WIDTH},
    error::{Error, Result},
    hardware::{
        mem::PhysMem,
        shared::{data_memory_barrier, invalidate_dcache_range},
    },
    kernel::{Event, Irq, IrqController},
};

/// Remaps A1BGR5 pixels in `src` to RGBA8 words in `dst`. Transparent
/// pixels (texture padding) stay fully transparent.
///
/// `dst` must hold twice as many bytes as `src`.
pub fn convert_frame(lut: &[u32], src: &[u8], dst: &mut [u8]) {
    for (px, out) in src.chunks_exact(2).zip(dst.chunks_exact_mut(4)) {
        let v = u16::from_le_bytes([px[0], px[1]]);
        let word = if v & 1 == 0 {
            0
        } else {
            lut[usize::from(v >> 1)]
        };
        out.copy_from_slice(&word.to_le_bytes());
    }
}

/// Reads the lookup table the video init wrote to [`COLOR_LUT_ADDR`].
///
/// # Errors
/// If the table area is not mapped.
pub fn load_lut(mem: &PhysMem) -> Result<Vec<u32>> {
    invalidate_dcache_range(COLOR_LUT_ADDR, COLOR_LUT_ENTRIES * 4);
    mem.with_slice(COLOR_LUT_ADDR, COLOR_LUT_ENTRIES * 4, |bytes| {
        bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    })
}

/// Handle of the running core 1 loop. It ends once the frame-ready event is
/// deleted.
pub struct Core1 {
    handle: Option<JoinHandle<()>>,
}

impl Core1 {
    /// Starts converting frames of `lines` lines (160 or 240) every time
    /// `frame_ready` fires.
    ///
    /// # Errors
    /// If the lookup table cannot be read or the thread cannot be spawned.
    pub fn boot(mem: Arc<PhysMem>, irq: Arc<IrqController>, frame_ready: Arc<Event>, lines: u32) -> Result<Self> {
        let lut = load_lut(&mem)?;
        let src_len = (TEXTURE_WIDTH * lines * 2) as usize;
        let mut out = vec![0; src_len * 2];

        let handle = thread::Builder::new().name("core1".into()).spawn(move || {
            info!("core 1: converting {lines}p frames");
            let mut frames = 0_u64;
            while frame_ready.wait().is_ok() {
                frame_ready.clear();

                invalidate_dcache_range(GPU_TEXTURE_ADDR, src_len);
                let res = mem
                    .with_slice(GPU_TEXTURE_ADDR, src_len, |src| convert_frame(&lut, src, &mut out))
                    .and_then(|()| mem.write(GPU_TEXTURE2_ADDR, &out));
                if let Err(e) = res {
                    error!("core 1: {e}");
                    break;
                }
                frames += 1;
                debug!("core 1: frame {frames} converted");

                data_memory_barrier();
                irq.raise(Irq::Ipi15);
            }
            info!("core 1: stopped after {frames} frames");
        })?;

        Ok(Self { handle: Some(handle) })
    }

    /// Waits for the loop to end. Delete the frame-ready event first.
    ///
    /// # Errors
    /// [`Error::Halted`] if the loop panicked.
    pub fn join(mut self) -> Result<()> {
        match self.handle.take().map(JoinHandle::join) {
            Some(Err(_)) => Err(Error::Halted("core 1 panicked".into())),
            _ => Ok(()),
        }
    }
}

impl Drop for Core1 {
    fn drop(&mut self) {
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use rand::RngExt;

    use super::*;
    use crate::{
        color::{lut_bytes, make_color_lut, profile},
        config::OafConfig,
    };

    #[test]
    fn lut_index_is_the_color_without_alpha() {
        let lut: Vec<u32> = (0..COLOR_LUT_ENTRIES as u32).map(|i| i << 8 | 0xFF).collect();
        let mut rng = rand::rng();
        let src: Vec<u16> = (0..64).map(|_| rng.random::<u16>() | 1).collect();
        let bytes: Vec<u8> = src.iter().flat_map(|p| p.to_le_bytes()).collect();
        let mut out = vec![0; bytes.len() * 2];

        convert_frame(&lut, &bytes, &mut out);
        for (p, o) in src.iter().zip(out.chunks_exact(4)) {
            let word = u32::from_le_bytes([o[0], o[1], o[2], o[3]]);
            assert_eq!(word, u32::from(p >> 1) << 8 | 0xFF);
        }
    }

    #[test]
    fn padding_stays_transparent() {
        let lut = vec![0xFFFF_FFFF; COLOR_LUT_ENTRIES];
        let mut out = vec![0xAA; 8];
        convert_frame(&lut, &[0xFE, 0xFF, 0xFF, 0xFF], &mut out);
        assert_eq!(out, [0, 0, 0, 0, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn converts_each_frame_and_raises_ipi() {
        let mem = Arc::new(PhysMem::new());
        let irq = IrqController::new("arm11");
        let lut = make_color_lut(profile(8).unwrap(), &OafConfig::default());
        mem.write(COLOR_LUT_ADDR, &lut_bytes(&lut)).unwrap();

        // White with alpha in the first texture row.
        mem.fill(GPU_TEXTURE_ADDR, 16, 0xFF).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        let finished = Event::one_shot();
        let _ipi = {
            let (done, finished) = (Arc::clone(&done), Arc::clone(&finished));
            irq.register(Irq::Ipi15, move |_| {
                done.fetch_add(1, Ordering::SeqCst);
                finished.signal();
            })
            .unwrap()
        };

        let frame_ready = Event::new();
        let core1 = Core1::boot(Arc::clone(&mem), Arc::clone(&irq), Arc::clone(&frame_ready), 160).unwrap();
        for n in 1..=3 {
            frame_ready.signal();
            finished.wait().unwrap();
            assert_eq!(done.load(Ordering::SeqCst), n);
        }
        assert_eq!(mem.read_u32(GPU_TEXTURE2_ADDR).unwrap(), 0xFFFF_FFFF);
        assert_eq!(mem.read_u32(GPU_TEXTURE2_ADDR + 32).unwrap(), 0);

        frame_ready.delete();
        core1.join().unwrap();
    }
}
