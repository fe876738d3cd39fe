//! Color correction tables.
//!
//! Two tables live here: the 32768 entry lookup table core 1 uses to map
//! every BGR555 color of a captured frame to a corrected RGBA8 color, and
//! the 256 entry gamma table of the top LCD.

use crate::{config::OafConfig, hardware::gpu::five2eight};

pub const COLOR_LUT_ENTRIES: usize = 32768;
/// Where the lookup table is kept, core 1 reads it from there.
pub const COLOR_LUT_ADDR: u32 = 0x1FF0_0000;

/// A color correction profile: gamma of the emulated screen, luminance, a
/// 3x3 color matrix and the gamma the result is encoded with.
///
/// ```text
///  correction      input
///  [ r][gr][br]     [r]
///  [rg][ g][bg]  x  [g]
///  [rb][gb][ b]     [b]
/// ```
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ColorProfile {
    pub name: &'static str,
    pub target_gamma: f32,
    pub lum: f32,
    pub r: f32,
    pub gr: f32,
    pub br: f32,
    pub rg: f32,
    pub g: f32,
    pub bg: f32,
    pub rb: f32,
    pub gb: f32,
    pub b: f32,
    pub display_gamma: f32,
}

/// Profile `n` of the config is `PROFILES[n - 1]`.
pub const PROFILES: [ColorProfile; 8] = [
    ColorProfile {
        name: "gba",
        // Darkened a bit on top of 2.2.
        target_gamma: 2.2 + 0.3 * 1.6,
        lum: 0.91,
        r: 0.905,
        gr: 0.195,
        br: -0.1,
        rg: 0.1,
        g: 0.65,
        bg: 0.25,
        rb: 0.1575,
        gb: 0.1425,
        b: 0.7,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "gb micro",
        target_gamma: 2.2,
        lum: 0.9,
        r: 0.8025,
        gr: 0.31,
        br: -0.1125,
        rg: 0.1,
        g: 0.6875,
        bg: 0.2125,
        rb: 0.1225,
        gb: 0.1125,
        b: 0.765,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "gba sp",
        target_gamma: 2.2,
        lum: 0.935,
        r: 0.96,
        gr: 0.11,
        br: -0.07,
        rg: 0.0325,
        g: 0.89,
        bg: 0.0775,
        rb: 0.001,
        gb: -0.03,
        b: 1.029,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "nds",
        target_gamma: 2.2,
        lum: 0.905,
        r: 0.835,
        gr: 0.27,
        br: -0.105,
        rg: 0.1,
        g: 0.6375,
        bg: 0.2625,
        rb: 0.105,
        gb: 0.175,
        b: 0.72,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "nds lite",
        target_gamma: 2.2,
        lum: 0.935,
        r: 0.93,
        gr: 0.14,
        br: -0.07,
        rg: 0.025,
        g: 0.9,
        bg: 0.075,
        rb: 0.008,
        gb: -0.03,
        b: 1.022,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "nso",
        target_gamma: 2.2 + 0.8,
        lum: 1.0,
        r: 0.865,
        gr: 0.1225,
        br: 0.0125,
        rg: 0.0575,
        g: 0.925,
        bg: 0.0125,
        rb: 0.0575,
        gb: 0.1225,
        b: 0.82,
        display_gamma: 1.0 / 2.2,
    },
    ColorProfile {
        name: "vba",
        target_gamma: 1.45 + 1.0,
        lum: 1.0,
        r: 0.73,
        gr: 0.27,
        br: 0.0,
        rg: 0.0825,
        g: 0.6775,
        bg: 0.24,
        rb: 0.0825,
        gb: 0.24,
        b: 0.6775,
        display_gamma: 1.0 / 1.45,
    },
    ColorProfile {
        name: "identity",
        target_gamma: 1.0,
        lum: 1.0,
        r: 1.0,
        gr: 0.0,
        br: 0.0,
        rg: 0.0,
        g: 1.0,
        bg: 0.0,
        rb: 0.0,
        gb: 0.0,
        b: 1.0,
        display_gamma: 1.0,
    },
];

/// Profile selected by a config value, `None` for 0 (off) and unknown values.
#[must_use]
pub fn profile(n: u8) -> Option<&'static ColorProfile> {
    usize::from(n).checked_sub(1).and_then(|i| PROFILES.get(i))
}

// Rec. 709 luminance.
const LUMA_R: f32 = 0.2126;
const LUMA_G: f32 = 0.7152;
const LUMA_B: f32 = 0.0722;

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn denormalize(x: f32) -> u32 {
    (x * 255.0).round().clamp(0.0, 255.0) as u32
}

/// Builds the lookup table for `p` with the user's contrast, brightness and
/// saturation. Index bits are `r << 10 | g << 5 | b`, entries are RGBA8
/// words (`r << 24 | g << 16 | b << 8 | 0xFF`).
#[must_use]
#[allow(clippy::many_single_char_names, clippy::cast_possible_truncation)]
pub fn make_color_lut(p: &ColorProfile, cfg: &OafConfig) -> Vec<u32> {
    let contrast = cfg.contrast;
    let brightness = cfg.brightness / contrast;
    let target_contrast = contrast.powf(p.target_gamma);

    let sat = cfg.saturation;
    let rw = (1.0 - sat) * LUMA_R;
    let gw = (1.0 - sat) * LUMA_G;
    let bw = (1.0 - sat) * LUMA_B;

    let to_linear = |c: u32| -> f32 {
        let x = f32::from(five2eight((c & 31) as u8)) / 255.0;
        ((x + brightness).powf(p.target_gamma) * p.lum).clamp(0.0, 1.0)
    };
    let to_display = |x: f32| -> u32 { denormalize((target_contrast * x.max(0.0)).powf(p.display_gamma)) };

    (0..COLOR_LUT_ENTRIES as u32)
        .map(|i| {
            let b = to_linear(i);
            let g = to_linear(i >> 5);
            let r = to_linear(i >> 10);

            let tmp_b = p.rb.mul_add(r, p.gb.mul_add(g, p.b * b));
            let tmp_g = p.rg.mul_add(r, p.g.mul_add(g, p.bg * b));
            let tmp_r = p.r.mul_add(r, p.gr.mul_add(g, p.br * b));

            let b = rw.mul_add(tmp_r, gw.mul_add(tmp_g, (bw + sat) * tmp_b));
            let g = rw.mul_add(tmp_r, (gw + sat).mul_add(tmp_g, bw * tmp_b));
            let r = (rw + sat).mul_add(tmp_r, gw.mul_add(tmp_g, bw * tmp_b));

            to_display(r) << 24 | to_display(g) << 16 | to_display(b) << 8 | 0xFF
        })
        .collect()
}

/// Lookup table as the little-endian bytes stored in memory.
#[must_use]
pub fn lut_bytes(lut: &[u32]) -> Vec<u8> {
    lut.iter().flat_map(|e| e.to_le_bytes()).collect()
}

/// Run-length encoded curve taking the top LCD to a 2.2 gamma. Each entry
/// holds `count - 1` in the top byte and the first `0xBBGGRR` value, every
/// following entry adds 1 to each channel.
const TOP_LCD_CURVE: [u32; 73] = [
    0x0100_0000, 0x0302_0102, 0x0006_0406, 0x0106_0507, 0x0308_0608, 0x020B_090C, 0x010E_0B0F, 0x010F_0D10,
    0x0111_0E12, 0x0112_1014, 0x0014_1116, 0x0015_1216, 0x0115_1317, 0x0117_1419, 0x0118_161B, 0x011A_171C,
    0x021B_191E, 0x001E_1B21, 0x011E_1C22, 0x0120_1E23, 0x0321_1F25, 0x0124_2329, 0x0226_242B, 0x0028_272E,
    0x0229_282E, 0x002B_2B31, 0x042C_2B32, 0x0430_3037, 0x0034_353C, 0x0535_353D, 0x073A_3B43, 0x0A41_434B,
    0x034B_4E56, 0x084F_525B, 0x0D57_5B64, 0x0365_6973, 0x1268_6D77, 0x017B_818A, 0x167C_838C, 0x0393_9AA4,
    0x0E97_9FA8, 0x01A6_AFB7, 0x06A9_B1B9, 0x01B0_B9C0, 0x00B2_BBC3, 0x04B4_BCC4, 0x00B9_C2C9, 0x04BB_C3CA,
    0x00C1_C8CF, 0x00C2_CAD0, 0x02C3_CBD2, 0x01C7_CED5, 0x00C9_D1D7, 0x03CB_D2D8, 0x00D0_D7DC, 0x01D1_D8DE,
    0x01D4_DAE0, 0x00D6_DDE2, 0x02D8_DEE3, 0x00DC_E1E6, 0x01DD_E3E7, 0x02E0_E5EA, 0x01E4_E9ED, 0x02E7_EBEF,
    0x01EB_EFF2, 0x01EE_F1F4, 0x00F1_F3F6, 0x01F2_F5F7, 0x01F5_F7F9, 0x01F8_F9FB, 0x00FA_FCFD, 0x01FC_FDFD,
    0x00FF_FFFF,
];

/// The expanded top LCD gamma table. Bits 24..=31 are don't care.
#[must_use]
pub fn top_lcd_gamma_table() -> Vec<u32> {
    let mut out = Vec::with_capacity(256);
    for &entry in &TOP_LCD_CURVE {
        let steps = (entry >> 24) + 1;
        out.extend((0..steps).map(|s| entry + s * 0x01_0101));
        if out.len() >= 256 {
            break;
        }
    }
    out.truncate(256);
    out
}
