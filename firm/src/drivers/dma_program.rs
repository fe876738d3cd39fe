//! Hand-assembled DMA-330 programs.
//!
//! The legacy capture program is a fixed byte template. Switching between
//! the 240x160 and 360x240 capture modes only changes a handful of immediate
//! operands, which are patched in place through typed setters instead of
//! raw offset pokes. Offsets are checked against the template in the tests.

use crate::{bitwise::Bits, hardware::shared::SharedRegion};

/// Peripheral id of the top screen LgyCap FIFO.
pub const LGYCAP_TOP_PERIPH: u8 = 14;
/// Where the DMA engine reads the top screen capture FIFO.
pub const LGYCAP_TOP_FIFO: u32 = 0x1031_1000;
/// Capture texture the program writes, 512 pixels wide, A1BGR5, tiled.
pub const CAPTURE_TEXTURE: u32 = 0x1820_0000;

const CCR_IMM: usize = 2;
const OUTER_LOOP_IMM: usize = 21;
const INNER_LOOP_IMM: usize = 25;
const DST_GAP_IMM: usize = 34;

/// Bytes in one row of 8x8 tiles of the 512 pixel wide capture texture.
pub const TEXTURE_TILE_ROW: u32 = 512 * 8 * 2;

/// Capture FIFO to texture program, one frame per run.
///
/// ```text
/// MOV CCR, SB15 SS64 SAF DB15 DS64 DAI
/// MOV SAR, 0x10311000
/// MOV DAR, 0x18200000
/// FLUSHP 14
/// LP 30                 ; one iteration per 8 line block
///   WFP 14, burst
///   LP 47
///     LD
///     ST
///   LPEND
///   LDPB 14             ; last burst of the block
///   ST
///   ADDH DAR, 0x980     ; skip the rest of the 512 pixel tile row
/// LPEND
/// WMB
/// SEV 0
/// END
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CaptureProgram {
    bytes: [u8; 42],
}

impl Default for CaptureProgram {
    fn default() -> Self {
        Self::new()
    }
}

impl CaptureProgram {
    /// Template set up for 360x240 capture.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bytes: [
                0xBC, 0x01, 0xE6, 0xC2, 0xB9, 0x00, // MOV CCR
                0xBC, 0x00, 0x00, 0x10, 0x31, 0x10, // MOV SAR, 0x10311000
                0xBC, 0x02, 0x00, 0x00, 0x20, 0x18, // MOV DAR, 0x18200000
                0x35, 0x70, // FLUSHP 14
                0x20, 0x1D, // LP 30
                0x32, 0x70, // WFP 14, burst
                0x22, 0x2E, // LP 47
                0x04, // LD
                0x08, // ST
                0x3C, 0x02, // LPEND
                0x27, 0x70, // LDPB 14
                0x08, // ST
                0x56, 0x80, 0x09, // ADDH DAR, 0x980
                0x38, 0x0E, // LPEND
                0x13, // WMB
                0x34, 0x00, // SEV 0
                0x00, // END
            ],
        }
    }

    /// Program for a capture of `width`x`height` A1BGR5 pixels.
    #[must_use]
    pub fn for_capture(width: u32, height: u32) -> Self {
        let mut prog = Self::new();
        if width == 240 && height == 160 {
            prog.set_burst_len(16);
        }
        let block_bytes = width * 8 * 2;
        let bursts = block_bytes / prog.burst_bytes();
        prog.set_outer_loops(height / 8);
        // The last burst of each block goes through LDPB.
        prog.set_inner_loops(bursts - 1);
        prog.set_dst_gap(TEXTURE_TILE_ROW - block_bytes);
        prog
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn ccr(&self) -> u32 {
        u32::from_le_bytes([
            self.bytes[CCR_IMM],
            self.bytes[CCR_IMM + 1],
            self.bytes[CCR_IMM + 2],
            self.bytes[CCR_IMM + 3],
        ])
    }

    fn set_ccr(&mut self, ccr: u32) {
        self.bytes[CCR_IMM..CCR_IMM + 4].copy_from_slice(&ccr.to_le_bytes());
    }

    /// Beats per burst on both sides (1..=16).
    pub fn set_burst_len(&mut self, beats: u32) {
        let field = beats.clamp(1, 16) - 1;
        let mut ccr = self.ccr();
        ccr.set_bits(4..=7, field);
        ccr.set_bits(18..=21, field);
        self.set_ccr(ccr);
    }

    #[must_use]
    pub fn burst_len(&self) -> u32 {
        self.ccr().get_bits(4..=7) + 1
    }

    /// Bytes moved by one burst.
    #[must_use]
    pub fn burst_bytes(&self) -> u32 {
        let ccr = self.ccr();
        (1 << ccr.get_bits(1..=3)) * self.burst_len()
    }

    /// Number of 8 line blocks per frame (1..=256).
    pub fn set_outer_loops(&mut self, n: u32) {
        self.bytes[OUTER_LOOP_IMM] = (n.clamp(1, 256) - 1) as u8;
    }

    /// Bursts per block before the final peripheral burst (1..=256).
    pub fn set_inner_loops(&mut self, n: u32) {
        self.bytes[INNER_LOOP_IMM] = (n.clamp(1, 256) - 1) as u8;
    }

    /// Bytes the destination skips after each block.
    pub fn set_dst_gap(&mut self, gap: u32) {
        let gap = gap.min(u32::from(u16::MAX)) as u16;
        self.bytes[DST_GAP_IMM..DST_GAP_IMM + 2].copy_from_slice(&gap.to_le_bytes());
    }

    /// Copies the program to memory the DMA engine fetches from and makes it
    /// visible to it.
    ///
    /// # Errors
    /// If the region is too small or unmapped.
    pub fn install(&self, region: &SharedRegion) -> crate::error::Result<u32> {
        region.write(0, &self.bytes)?;
        Ok(region.addr())
    }
}

/// Bootstrap program flushing the request state of every peripheral,
/// as little-endian halfwords: `DMAFLUSHP i` for each peripheral, then `DMAEND`.
#[must_use]
pub fn flush_peripherals_program(peripherals: u8) -> Vec<u8> {
    let mut prog = Vec::with_capacity(usize::from(peripherals) * 2 + 2);
    for i in 0..peripherals {
        let inst = u16::from(i) << 11 | 0x35;
        prog.extend(inst.to_le_bytes());
    }
    prog.extend(0_u16.to_le_bytes());
    prog
}
