//! 8x8 Morton tiling used by GPU textures and render buffers.
//!
//! Tiles are stored row by row, tile row 0 holds lines 0..=7. Inside a tile
//! the pixel order interleaves the x and y bits (x in the even bits).

/// Index of pixel (`x`, `y`) inside its 8x8 tile.
#[must_use]
pub const fn morton_index(x: usize, y: usize) -> usize {
    (x & 1) | (y & 1) << 1 | (x & 2) << 1 | (y & 2) << 2 | (x & 4) << 2 | (y & 4) << 3
}

/// Pixel index of (`x`, `y`) in a tiled surface `width` pixels wide.
#[must_use]
pub const fn tiled_index(x: usize, y: usize, width: usize) -> usize {
    let tile = (y / 8) * (width / 8) + x / 8;
    tile * 64 + morton_index(x % 8, y % 8)
}

/// Converts a linear `width`x`height` surface of `bpp` byte pixels to tiled.
#[must_use]
pub fn tile(linear: &[u8], width: usize, height: usize, bpp: usize) -> Vec<u8> {
    let mut out = vec![0; width * height * bpp];
    for y in 0..height {
        for x in 0..width {
            let src = (y * width + x) * bpp;
            let dst = tiled_index(x, y, width) * bpp;
            out[dst..dst + bpp].copy_from_slice(&linear[src..src + bpp]);
        }
    }
    out
}

/// Inverse of [`tile`].
#[must_use]
pub fn untile(tiled: &[u8], width: usize, height: usize, bpp: usize) -> Vec<u8> {
    let mut out = vec![0; width * height * bpp];
    for y in 0..height {
        for x in 0..width {
            let src = tiled_index(x, y, width) * bpp;
            let dst = (y * width + x) * bpp;
            out[dst..dst + bpp].copy_from_slice(&tiled[src..src + bpp]);
        }
    }
    out
}
