//! Scale matrices of the LgyCap scaler.
//!
//! Each axis has 6 taps over a sliding window of input pixels and up to 8
//! pattern positions. `matrix[tap][position]` is an s1.14 coefficient with
//! bits 0..=3 ignored by the hardware; tap 3 is the pixel under the window
//! head. A pattern bit of 1 moves the window one pixel forward after the
//! output of that position, so the scale factor is `len / popcount(patt)`.
//!
//! Two on-disk forms exist:
//! - text, `hPatt hLen hMatrix[48] vPatt vLen vMatrix[48]`, patterns in
//!   binary, the rest as C integer literals, separated by whitespace or
//!   commas;
//! - binary, `gba_scaler_matrix.bin`: 96 little-endian i16, vertical 6x8
//!   then horizontal 6x8. Patterns are fixed by the capture mode.

use std::fmt::Write as _;

use tracing::{info, warn};

use crate::{
    error::{Error, Result},
    fs::FileSystem,
};

pub const SCALER_TAPS: usize = 6;
pub const SCALER_POSITIONS: usize = 8;
/// Coefficient sum that passes a pixel at full brightness.
pub const SCALER_UNITY: i32 = 0x4000;
pub const MATRIX_FILE: &str = "gba_scaler_matrix.bin";
pub const MATRIX_FILE_SIZE: usize = 2 * SCALER_TAPS * SCALER_POSITIONS * 2;

/// Pattern of the 1.5x capture mode: advance, advance, hold.
pub const PATTERN_1_5X: u8 = 0b0001_1011;
pub const PATTERN_1_5X_LEN: u8 = 6;

/// Hardware range of each tap, oldest input first.
const TAP_LIMITS: [i32; SCALER_TAPS] = [0x400, 0x1000, 0x8000, 0x8000, 0x1000, 0x400];

/// Slack for the ignored low bits of every tap in a column.
const SUM_TOLERANCE: i32 = 0x10 * SCALER_TAPS as i32;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Axis {
    Horizontal,
    Vertical,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalerAxis {
    pub patt: u8,
    /// Pattern length, 1..=8.
    pub len: u8,
    pub matrix: [[i16; SCALER_POSITIONS]; SCALER_TAPS],
}

impl ScalerAxis {
    fn reject(axis: Axis, reason: &str) -> Error {
        Error::InvalidScaler(format!("{axis:?}: {reason}"))
    }

    /// Checks what the hardware needs to stay in sync and avoid clipping.
    ///
    /// # Errors
    /// [`Error::InvalidScaler`] naming the first violated rule.
    pub fn validate(&self, axis: Axis) -> Result<()> {
        let len = usize::from(self.len);
        if !(1..=SCALER_POSITIONS).contains(&len) {
            return Err(Self::reject(axis, "pattern length must be 1..=8"));
        }
        if len < 8 && self.patt >> len != 0 {
            return Err(Self::reject(axis, "pattern bits beyond its length"));
        }
        let advances = self.patt.count_ones() as usize;
        if advances == 0 || advances > len.min(SCALER_TAPS) {
            return Err(Self::reject(axis, "pattern must advance between 1 and the tap count times"));
        }
        // The vertical scaler loses sync with the legacy output otherwise.
        if axis == Axis::Vertical && (self.patt & 1 == 0 || self.patt >> (len - 1) & 1 != 0) {
            return Err(Self::reject(axis, "vertical pattern must start with 1 and end with 0"));
        }

        for (tap, row) in self.matrix.iter().enumerate() {
            if row[..len].iter().any(|&c| i32::from(c).abs() > TAP_LIMITS[tap]) {
                return Err(Self::reject(axis, &format!("tap {tap} out of range")));
            }
        }
        if self.matrix.iter().filter(|row| row[0] & !0xF != 0).count() > 1 {
            return Err(Self::reject(axis, "first column allows only one non-zero tap"));
        }
        for pos in 0..len {
            let sum: i32 = self.matrix.iter().map(|row| i32::from(row[pos] & !0xF)).sum();
            if (sum - SCALER_UNITY).abs() > SUM_TOLERANCE {
                return Err(Self::reject(axis, &format!("column {pos} sums to 0x{sum:X}")));
            }
        }
        Ok(())
    }

    /// Output pixels per input pixel.
    #[must_use]
    pub fn scale_factor(&self) -> f32 {
        f32::from(self.len) / self.patt.count_ones().max(1) as f32
    }

    /// Coefficients as seen by the hardware, low bits dropped.
    #[must_use]
    pub fn coefficients(&self) -> [[i32; SCALER_POSITIONS]; SCALER_TAPS] {
        self.matrix.map(|row| row.map(|c| i32::from(c & !0xF)))
    }
}

/// Both axes of the scaler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScalerMatrix {
    pub v: ScalerAxis,
    pub h: ScalerAxis,
}

impl Default for ScalerMatrix {
    fn default() -> Self {
        Self::sharp_edge_enhance()
    }
}

impl ScalerMatrix {
    /// Built-in 1.5x matrix: sharp interpolation with a slight edge boost.
    #[must_use]
    pub const fn sharp_edge_enhance() -> Self {
        Self {
            v: ScalerAxis {
                patt: PATTERN_1_5X,
                len: PATTERN_1_5X_LEN,
                matrix: [
                    [0; 8],
                    [0; 8],
                    [0, 0x24B0, 0x4000, 0, 0x24B0, 0x4000, 0, 0],
                    [0x4000, 0x2000, 0, 0x4000, 0x2000, 0, 0, 0],
                    [0, -0x4B0, 0, 0, -0x4B0, 0, 0, 0],
                    [0; 8],
                ],
            },
            h: ScalerAxis {
                patt: PATTERN_1_5X,
                len: PATTERN_1_5X_LEN,
                matrix: [
                    [0; 8],
                    [0; 8],
                    [0, 0, 0x24B0, 0, 0, 0x24B0, 0, 0],
                    [0x4000, 0x4000, 0x2000, 0x4000, 0x4000, 0x2000, 0, 0],
                    [0, 0, -0x4B0, 0, 0, -0x4B0, 0, 0],
                    [0; 8],
                ],
            },
        }
    }

    /// # Errors
    /// If either axis fails [`ScalerAxis::validate`].
    pub fn validate(&self) -> Result<()> {
        self.h.validate(Axis::Horizontal)?;
        self.v.validate(Axis::Vertical)
    }

    /// Parses the text form and validates it.
    ///
    /// # Errors
    /// [`Error::InvalidScaler`] on missing or malformed numbers and on
    /// matrices [`Self::validate`] rejects.
    pub fn parse(text: &str) -> Result<Self> {
        let mut tokens = text
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty());
        let h = parse_axis(&mut tokens, Axis::Horizontal)?;
        let v = parse_axis(&mut tokens, Axis::Vertical)?;
        if let Some(extra) = tokens.next() {
            return Err(Error::InvalidScaler(format!("trailing token {extra:?}")));
        }

        let m = Self { v, h };
        m.validate()?;
        Ok(m)
    }

    /// Binary override form, vertical first.
    #[must_use]
    pub fn to_bin(&self) -> Vec<u8> {
        self.v
            .matrix
            .iter()
            .chain(&self.h.matrix)
            .flatten()
            .flat_map(|c| c.to_le_bytes())
            .collect()
    }

    /// Reads the coefficients of the binary form. Patterns and lengths are
    /// taken from `self`.
    ///
    /// # Errors
    /// [`Error::InvalidScaler`] if `bytes` is not exactly
    /// [`MATRIX_FILE_SIZE`] long or the result does not validate.
    pub fn with_bin(mut self, bytes: &[u8]) -> Result<Self> {
        if bytes.len() != MATRIX_FILE_SIZE {
            return Err(Error::InvalidScaler(format!(
                "{} bytes, expected {MATRIX_FILE_SIZE}",
                bytes.len()
            )));
        }
        let mut coefs = bytes.chunks_exact(2).map(|b| i16::from_le_bytes([b[0], b[1]]));
        for row in self.v.matrix.iter_mut().chain(self.h.matrix.iter_mut()) {
            for c in row.iter_mut() {
                *c = coefs.next().unwrap_or_default();
            }
        }
        self.validate()?;
        Ok(self)
    }

    /// The built-in matrix, overridden by [`MATRIX_FILE`] if present. A
    /// missing file is silent, any other problem is logged and ignored.
    pub fn load(fs: &dyn FileSystem) -> Self {
        let builtin = Self::sharp_edge_enhance();
        let mut buf = vec![0; MATRIX_FILE_SIZE + 1];
        let loaded = match fs.quick_read(MATRIX_FILE, &mut buf) {
            Ok(n) => builtin.with_bin(&buf[..n]),
            Err(Error::NoFile(_)) => return builtin,
            Err(e) => Err(e),
        };
        match loaded {
            Ok(m) => {
                info!("scaler: using {MATRIX_FILE}");
                m
            }
            Err(e) => {
                warn!("failed to load hardware scaling matrix: {e}");
                builtin
            }
        }
    }

    /// Text form accepted by [`Self::parse`].
    #[must_use]
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for axis in [&self.h, &self.v] {
            let _ = writeln!(out, "{:0width$b} {}", axis.patt, axis.len, width = usize::from(axis.len));
            for row in &axis.matrix {
                let cols: Vec<String> = row.iter().map(|&c| fmt_coef(c)).collect();
                let _ = writeln!(out, "{}", cols.join(", "));
            }
        }
        out
    }
}

fn fmt_coef(c: i16) -> String {
    match c {
        0 => "0".to_owned(),
        c if c < 0 => format!("-0x{:X}", -i32::from(c)),
        c => format!("0x{c:X}"),
    }
}

fn parse_axis<'a>(tokens: &mut impl Iterator<Item = &'a str>, axis: Axis) -> Result<ScalerAxis> {
    let missing = || Error::InvalidScaler(format!("{axis:?}: unexpected end of input"));

    let patt_tok = tokens.next().ok_or_else(missing)?;
    let digits = patt_tok.strip_prefix("0b").unwrap_or(patt_tok);
    let patt = u8::from_str_radix(digits, 2)
        .map_err(|_| Error::InvalidScaler(format!("{axis:?}: bad pattern {patt_tok:?}")))?;

    let len_tok = tokens.next().ok_or_else(missing)?;
    let len: u8 = len_tok
        .parse()
        .map_err(|_| Error::InvalidScaler(format!("{axis:?}: bad length {len_tok:?}")))?;

    let mut matrix = [[0; SCALER_POSITIONS]; SCALER_TAPS];
    for c in matrix.iter_mut().flatten() {
        let tok = tokens.next().ok_or_else(missing)?;
        *c = parse_int(tok).ok_or_else(|| Error::InvalidScaler(format!("{axis:?}: bad coefficient {tok:?}")))?;
    }
    Ok(ScalerAxis { patt, len, matrix })
}

/// C integer literal: decimal, `0x` hex or leading-zero octal, optional sign.
fn parse_int(tok: &str) -> Option<i16> {
    let (neg, body) = tok.strip_prefix('-').map_or((false, tok), |b| (true, b));
    let v = if let Some(hex) = body.strip_prefix("0x").or_else(|| body.strip_prefix("0X")) {
        i32::from_str_radix(hex, 16).ok()?
    } else if body.len() > 1 && body.starts_with('0') {
        i32::from_str_radix(&body[1..], 8).ok()?
    } else {
        body.parse::<i32>().ok()?
    };
    i16::try_from(if neg { -v } else { v }).ok()
}
