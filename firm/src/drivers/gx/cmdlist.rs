//! Pre-recorded 3D pipeline command lists for the legacy frame.
//!
//! A list is a run of `[parameter, header]` word pairs. The header holds the
//! register id, a byte write mask, the number of extra parameters that
//! follow and whether they go to consecutive registers. Two lists exist: the
//! init list sets the whole pipeline state and draws, the per-frame list only
//! invalidates the texture cache and draws again. Switching scaler or color
//! correction rewrites the affected parameters in place.

use crate::{
    drivers::dma_program::CAPTURE_TEXTURE,
    error::Result,
    hardware::{gpu::p3d_reg, shared::SharedRegion},
};

/// Tiled BGR8 render target, 240x400 in portrait orientation.
pub const GPU_RENDER_BUF_ADDR: u32 = 0x1818_0000;
/// Texture the capture DMA writes, A1BGR5.
pub const GPU_TEXTURE_ADDR: u32 = CAPTURE_TEXTURE;
/// Texture core 1 writes the color corrected frame to, RGBA8.
pub const GPU_TEXTURE2_ADDR: u32 = 0x1828_0000;
pub const TEXTURE_WIDTH: u32 = 512;
pub const TEXTURE_HEIGHT: u32 = 256;
pub const RENDER_WIDTH: u32 = 240;
pub const RENDER_HEIGHT: u32 = 400;

const TEXTURE_TYPE_RGBA8: u32 = 0;
const TEXTURE_TYPE_A1BGR5: u32 = 2;
const COLORBUFFER_BGR8: u32 = 1;
const FINALIZE_MAGIC: u32 = 0x1234_5678;
const WRITE_ALL: u32 = 0xF;

const fn header(id: u16, mask: u32, extra: usize, consecutive: bool) -> u32 {
    (consecutive as u32) << 31 | (extra as u32 & 0xFF) << 20 | (mask & 0xF) << 16 | id as u32
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandList {
    words: Vec<u32>,
}

impl CommandList {
    #[must_use]
    pub const fn new() -> Self {
        Self { words: Vec::new() }
    }

    pub fn write(&mut self, id: u16, value: u32) -> &mut Self {
        self.write_masked(id, WRITE_ALL, value)
    }

    pub fn write_masked(&mut self, id: u16, mask: u32, value: u32) -> &mut Self {
        self.words.extend([value, header(id, mask, 0, false)]);
        self
    }

    /// Writes `values` to `id`, `id + 1`, ...
    pub fn write_seq(&mut self, id: u16, values: &[u32]) -> &mut Self {
        let Some((&first, rest)) = values.split_first() else {
            return self;
        };
        self.words.extend([first, header(id, WRITE_ALL, rest.len(), true)]);
        self.words.extend(rest);
        if rest.len() % 2 == 1 {
            self.words.push(0);
        }
        self
    }

    /// Ends the list. The pipeline raises its interrupt here.
    pub fn finalize(&mut self) -> &mut Self {
        self.write(p3d_reg::FINALIZE, FINALIZE_MAGIC)
    }

    /// Calls `f` with every register written and a mutable reference to the
    /// parameter written to it.
    fn for_each_param(&mut self, mut f: impl FnMut(u16, &mut u32)) {
        let mut i = 0;
        while i + 1 < self.words.len() {
            let header = self.words[i + 1];
            let id = (header & 0xFFFF) as u16;
            let extra = (header >> 20 & 0xFF) as usize;
            let consecutive = header >> 31 != 0;

            f(id, &mut self.words[i]);
            for n in 0..extra {
                let reg = if consecutive { id + 1 + n as u16 } else { id };
                if let Some(word) = self.words.get_mut(i + 2 + n) {
                    f(reg, word);
                }
            }
            i += 2 + extra + extra % 2;
        }
    }

    /// Rewrites every write to `id`. Returns how many were patched.
    pub fn patch(&mut self, id: u16, value: u32) -> usize {
        let mut patched = 0;
        self.for_each_param(|reg, word| {
            if reg == id {
                *word = value;
                patched += 1;
            }
        });
        patched
    }

    /// Last value the list writes to `id`.
    #[must_use]
    pub fn value_of(&self, id: u16) -> Option<u32> {
        let mut copy = self.clone();
        let mut found = None;
        copy.for_each_param(|reg, word| {
            if reg == id {
                found = Some(*word);
            }
        });
        found
    }

    #[must_use]
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.words.len() * 4
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    /// Copies the list to memory the GPU fetches from.
    ///
    /// # Errors
    /// If the region is too small or unmapped.
    pub fn install(&self, region: &SharedRegion) -> Result<u32> {
        region.write(0, &self.to_bytes())?;
        Ok(region.addr())
    }
}

/// Texture and viewport setup of one scaler mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Placement {
    /// Landscape viewport on the top screen.
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    /// Texture area stretched over the viewport.
    src_width: u32,
    src_height: u32,
    linear: bool,
}

impl Placement {
    const fn for_scaler(scaler: u8) -> Self {
        match scaler {
            // 1:1 in the middle of the screen, room for a border.
            0 => Self {
                x: 80,
                y: 40,
                width: 240,
                height: 160,
                src_width: 240,
                src_height: 160,
                linear: false,
            },
            // 1.5x with bilinear filtering on the GPU.
            1 => Self {
                x: 20,
                y: 0,
                width: 360,
                height: 240,
                src_width: 240,
                src_height: 160,
                linear: true,
            },
            // The capture unit already scaled to 360x240.
            _ => Self {
                x: 20,
                y: 0,
                width: 360,
                height: 240,
                src_width: 360,
                src_height: 240,
                linear: false,
            },
        }
    }
}

const fn texture_params(linear: bool) -> u32 {
    if linear { p3d_reg::TEXUNIT_MAG_LINEAR } else { 0 }
}

/// The init and per-frame list of the legacy frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GbaLists {
    pub init: CommandList,
    pub frame: CommandList,
}

impl Default for GbaLists {
    fn default() -> Self {
        Self::new()
    }
}

impl GbaLists {
    /// Lists for the hardware scaler without color correction.
    #[must_use]
    pub fn new() -> Self {
        let p = Placement::for_scaler(2);
        let mut init = CommandList::new();
        init.write(p3d_reg::COLORBUFFER_FORMAT, COLORBUFFER_BGR8)
            .write(p3d_reg::COLORBUFFER_LOC, GPU_RENDER_BUF_ADDR >> 3)
            .write(
                p3d_reg::FRAMEBUFFER_DIM,
                RENDER_WIDTH & 0x7FF | (RENDER_HEIGHT - 1) << 12,
            )
            .write(p3d_reg::TEXUNIT0_CONFIG, 1 | p3d_reg::TEXUNIT_CONFIG_CLEAR_CACHE)
            .write(p3d_reg::TEXUNIT0_DIM, TEXTURE_WIDTH << 16 | TEXTURE_HEIGHT)
            .write(p3d_reg::TEXUNIT0_PARAM, texture_params(p.linear))
            .write(p3d_reg::TEXUNIT0_ADDR, GPU_TEXTURE_ADDR >> 3)
            .write(p3d_reg::TEXUNIT0_TYPE, TEXTURE_TYPE_A1BGR5)
            .write(p3d_reg::VIEWPORT_WIDTH, p.width)
            .write(p3d_reg::VIEWPORT_HEIGHT, p.height)
            .write(p3d_reg::VIEWPORT_XY, p.y << 16 | p.x)
            .write(p3d_reg::TEXCOORD_RECT, p.src_height << 16 | p.src_width)
            .write(p3d_reg::DRAW_ARRAYS, 1)
            .write(p3d_reg::FRAMEBUFFER_FLUSH, 1)
            .finalize();

        let mut frame = CommandList::new();
        frame
            .write(p3d_reg::TEXUNIT0_CONFIG, 1 | p3d_reg::TEXUNIT_CONFIG_CLEAR_CACHE)
            .write(p3d_reg::DRAW_ARRAYS, 1)
            .write(p3d_reg::FRAMEBUFFER_FLUSH, 1)
            .finalize();

        Self { init, frame }
    }

    /// Points the texture unit at the capture texture (or the color corrected
    /// copy) and sets filter and viewport for `scaler`.
    pub fn patch_for_scaler(&mut self, scaler: u8, color_corrected: bool) {
        let p = Placement::for_scaler(scaler);
        let (addr, ty) = if color_corrected {
            (GPU_TEXTURE2_ADDR, TEXTURE_TYPE_RGBA8)
        } else {
            (GPU_TEXTURE_ADDR, TEXTURE_TYPE_A1BGR5)
        };

        let list = &mut self.init;
        list.patch(p3d_reg::TEXUNIT0_ADDR, addr >> 3);
        list.patch(p3d_reg::TEXUNIT0_TYPE, ty);
        list.patch(p3d_reg::TEXUNIT0_PARAM, texture_params(p.linear));
        list.patch(p3d_reg::VIEWPORT_WIDTH, p.width);
        list.patch(p3d_reg::VIEWPORT_HEIGHT, p.height);
        list.patch(p3d_reg::VIEWPORT_XY, p.y << 16 | p.x);
        list.patch(p3d_reg::TEXCOORD_RECT, p.src_height << 16 | p.src_width);
    }
}
