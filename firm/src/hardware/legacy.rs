//! Video output of the legacy core.
//!
//! The GBA runs on real hardware, here it is replaced by a frame source that
//! feeds the capture unit. Frames are 240x160 BGR555 (red in the low bits).

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use tracing::info;

use super::lgycap::{LEGACY_HEIGHT, LEGACY_WIDTH, LgyCap};

/// 16.78 MHz / (228 lines * 1232 cycles).
pub const LEGACY_REFRESH_HZ: f64 = 59.7275;

pub const FRAME_PIXELS: usize = LEGACY_WIDTH * LEGACY_HEIGHT;

#[must_use]
pub const fn bgr555(r: u8, g: u8, b: u8) -> u16 {
    (r as u16 & 31) | (g as u16 & 31) << 5 | (b as u16 & 31) << 10
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pattern {
    Solid(u16),
    /// One lit pixel on black.
    Dot { x: usize, y: usize, color: u16 },
    /// Eight vertical color bars, scrolled by one pixel every frame.
    Bars,
    /// Frames taken from a raw dump, cycled.
    Raw(Vec<u16>),
}

#[derive(Debug)]
pub struct LegacyVideo {
    pattern: Pattern,
    frame: u64,
}

const BARS: [u16; 8] = [
    bgr555(31, 31, 31),
    bgr555(31, 31, 0),
    bgr555(0, 31, 31),
    bgr555(0, 31, 0),
    bgr555(31, 0, 31),
    bgr555(31, 0, 0),
    bgr555(0, 0, 31),
    bgr555(0, 0, 0),
];

impl LegacyVideo {
    #[must_use]
    pub const fn new(pattern: Pattern) -> Self {
        Self { pattern, frame: 0 }
    }

    /// Reads a raw dump of back to back frames. A trailing partial frame is
    /// dropped, an empty dump gives black frames.
    #[must_use]
    pub fn from_raw(bytes: &[u8]) -> Self {
        let words: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        let whole = words.len() / FRAME_PIXELS * FRAME_PIXELS;
        if whole == 0 {
            return Self::new(Pattern::Solid(0));
        }
        Self::new(Pattern::Raw(words[..whole].to_vec()))
    }

    #[must_use]
    pub const fn frames_produced(&self) -> u64 {
        self.frame
    }

    /// The next frame of the source.
    pub fn next_frame(&mut self) -> Vec<u16> {
        let n = self.frame;
        self.frame += 1;

        match &self.pattern {
            Pattern::Solid(c) => vec![*c; FRAME_PIXELS],
            Pattern::Dot { x, y, color } => {
                let mut f = vec![0; FRAME_PIXELS];
                if *x < LEGACY_WIDTH && *y < LEGACY_HEIGHT {
                    f[y * LEGACY_WIDTH + x] = *color;
                }
                f
            }
            Pattern::Bars => (0..FRAME_PIXELS)
                .map(|i| {
                    let x = (i % LEGACY_WIDTH + n as usize) % LEGACY_WIDTH;
                    BARS[x / (LEGACY_WIDTH / BARS.len())]
                })
                .collect(),
            Pattern::Raw(words) => {
                let frames = words.len() / FRAME_PIXELS;
                let i = (n as usize % frames) * FRAME_PIXELS;
                words[i..i + FRAME_PIXELS].to_vec()
            }
        }
    }

    /// Outputs one frame into the capture unit.
    pub fn step(&mut self, cap: &LgyCap) {
        let frame = self.next_frame();
        cap.push_frame(&frame);
    }

    /// Free running source paced at the legacy refresh rate.
    #[must_use]
    pub fn spawn(self, cap: Arc<LgyCap>) -> LegacyThread {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);

        let handle = thread::spawn(move || {
            let mut src = self;
            let period = Duration::from_secs_f64(1.0 / LEGACY_REFRESH_HZ);
            let mut next = Instant::now();
            while !stop_flag.load(Ordering::Relaxed) {
                src.step(&cap);
                next += period;
                if let Some(wait) = next.checked_duration_since(Instant::now()) {
                    thread::sleep(wait);
                }
            }
            info!("legacy video stopped after {} frames", src.frames_produced());
            src
        });

        LegacyThread {
            stop,
            handle: Some(handle),
        }
    }
}

/// Handle of a running [`LegacyVideo`], stops the source on drop.
#[derive(Debug)]
pub struct LegacyThread {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<LegacyVideo>>,
}

impl LegacyThread {
    /// Stops the source and returns it.
    #[must_use]
    pub fn stop(mut self) -> Option<LegacyVideo> {
        self.stop.store(true, Ordering::Relaxed);
        self.handle.take().and_then(|h| h.join().ok())
    }
}

impl Drop for LegacyThread {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(h) = self.handle.take() {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn dot_pattern() {
        let mut src = LegacyVideo::new(Pattern::Dot {
            x: 3,
            y: 2,
            color: 0x7FFF,
        });
        let f = src.next_frame();
        assert_eq!(f[2 * LEGACY_WIDTH + 3], 0x7FFF);
        assert_eq!(f.iter().filter(|&&p| p != 0).count(), 1);
        assert_eq!(src.frames_produced(), 1);
    }

    #[test]
    fn raw_frames_cycle() {
        let mut bytes = vec![0_u8; FRAME_PIXELS * 2 * 2 + 10];
        bytes[FRAME_PIXELS * 2] = 0x1F;
        let mut src = LegacyVideo::from_raw(&bytes);
        assert_eq!(src.next_frame()[0], 0);
        assert_eq!(src.next_frame()[0], 0x1F);
        assert_eq!(src.next_frame()[0], 0);
    }

    #[test]
    fn bars_scroll() {
        let mut src = LegacyVideo::new(Pattern::Bars);
        let a = src.next_frame();
        let b = src.next_frame();
        assert_eq!(a[1], b[0]);
        assert_eq!(a[0], BARS[0]);
    }
}
