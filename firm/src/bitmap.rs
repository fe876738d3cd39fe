//! BMP headers for screenshots.

/// `BI_BITFIELDS` compression: pixel layout given by the color masks.
pub const BI_BITFIELDS: u32 = 3;

/// File header, 14 bytes packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BmpHeader {
    pub magic: u16,
    pub file_size: u32,
    pub reserved: u16,
    pub reserved2: u16,
    /// From file start.
    pub pixel_offset: u32,
}

/// `BITMAPINFOHEADER`, 40 bytes packed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BitmapInfoHeader {
    pub header_size: u32,
    pub width: i32,
    /// Negative for top to bottom line order.
    pub height: i32,
    pub color_planes: u16,
    pub bits_per_pixel: u16,
    pub compression: u32,
    pub image_size: u32,
    pub x_pixels_per_meter: i32,
    pub y_pixels_per_meter: i32,
    pub colors_used: u32,
    pub colors_important: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BmpV1WithMasks {
    pub header: BmpHeader,
    pub dib: BitmapInfoHeader,
    pub r_mask: u32,
    pub g_mask: u32,
    pub b_mask: u32,
}

impl BmpV1WithMasks {
    pub const SIZE: usize = 0x42;

    /// Header of a top-down A1BGR5 image whose pixels start at
    /// `pixel_offset` (alpha is ignored by viewers).
    #[must_use]
    pub const fn a1bgr5(width: u32, height: u32, pixel_offset: u32) -> Self {
        let image_size = width * height * 2;
        Self {
            header: BmpHeader {
                magic: 0x4D42,
                file_size: pixel_offset + image_size,
                reserved: 0,
                reserved2: 0,
                pixel_offset,
            },
            dib: BitmapInfoHeader {
                header_size: 40,
                width: width as i32,
                height: -(height as i32),
                color_planes: 1,
                bits_per_pixel: 16,
                compression: BI_BITFIELDS,
                image_size,
                x_pixels_per_meter: 0,
                y_pixels_per_meter: 0,
                colors_used: 0,
                colors_important: 0,
            },
            r_mask: 0xF800,
            g_mask: 0x07C0,
            b_mask: 0x003E,
        }
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = Vec::with_capacity(Self::SIZE);
        let h = &self.header;
        out.extend(h.magic.to_le_bytes());
        out.extend(h.file_size.to_le_bytes());
        out.extend(h.reserved.to_le_bytes());
        out.extend(h.reserved2.to_le_bytes());
        out.extend(h.pixel_offset.to_le_bytes());

        let d = &self.dib;
        out.extend(d.header_size.to_le_bytes());
        out.extend(d.width.to_le_bytes());
        out.extend(d.height.to_le_bytes());
        out.extend(d.color_planes.to_le_bytes());
        out.extend(d.bits_per_pixel.to_le_bytes());
        out.extend(d.compression.to_le_bytes());
        out.extend(d.image_size.to_le_bytes());
        out.extend(d.x_pixels_per_meter.to_le_bytes());
        out.extend(d.y_pixels_per_meter.to_le_bytes());
        out.extend(d.colors_used.to_le_bytes());
        out.extend(d.colors_important.to_le_bytes());

        out.extend(self.r_mask.to_le_bytes());
        out.extend(self.g_mask.to_le_bytes());
        out.extend(self.b_mask.to_le_bytes());

        let mut bytes = [0; Self::SIZE];
        bytes.copy_from_slice(&out);
        bytes
    }
}
