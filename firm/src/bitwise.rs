use std::ops::RangeInclusive;

/// Contains some helper methods to manipulate register bits,
/// the index (`bit_idx`) is supposed to be from lsb to msb (right to left)
pub trait Bits: Copy {
    fn is_bit_on(&self, bit_idx: u8) -> bool;

    fn set_bit(&mut self, bit_idx: u8, value: bool);

    /// Extracts the field covered by `bits_range`, shifted down to bit 0.
    fn get_bits(&self, bits_range: RangeInclusive<u8>) -> Self;

    /// Replaces the field covered by `bits_range` with the low bits of `value`.
    fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self);

    fn get_byte(&self, byte_nth: u8) -> u8;

    fn set_byte(&mut self, byte_nth: u8, value: u8);
}

macro_rules! impl_bits {
    ($($t:ty),*) => {
        $(
            impl Bits for $t {
                fn is_bit_on(&self, bit_idx: u8) -> bool {
                    debug_assert!(u32::from(bit_idx) < <$t>::BITS);
                    (*self >> bit_idx) & 1 != 0
                }

                fn set_bit(&mut self, bit_idx: u8, value: bool) {
                    debug_assert!(u32::from(bit_idx) < <$t>::BITS);
                    let mask: $t = 1 << bit_idx;
                    if value {
                        *self |= mask;
                    } else {
                        *self &= !mask;
                    }
                }

                fn get_bits(&self, bits_range: RangeInclusive<u8>) -> Self {
                    let start = *bits_range.start();
                    let length = u32::from(*bits_range.end() - start) + 1;
                    debug_assert!(u32::from(start) + length <= <$t>::BITS);

                    // `length` ones, then moved to bit 0 together with the field.
                    let mask = <$t>::MAX >> (<$t>::BITS - length);
                    (*self >> start) & mask
                }

                fn set_bits(&mut self, bits_range: RangeInclusive<u8>, value: Self) {
                    let start = *bits_range.start();
                    let length = u32::from(*bits_range.end() - start) + 1;
                    debug_assert!(u32::from(start) + length <= <$t>::BITS);

                    let mask = (<$t>::MAX >> (<$t>::BITS - length)) << start;
                    *self = (*self & !mask) | ((value << start) & mask);
                }

                fn get_byte(&self, byte_nth: u8) -> u8 {
                    debug_assert!(u32::from(byte_nth) * 8 < <$t>::BITS);
                    (*self >> (byte_nth * 8)) as u8
                }

                fn set_byte(&mut self, byte_nth: u8, value: u8) {
                    self.set_bits(byte_nth * 8..=byte_nth * 8 + 7, <$t>::from(value));
                }
            }
        )*
    };
}

impl_bits!(u8, u16, u32);

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rand::RngExt;

    use super::*;

    #[test]
    fn test_is_bit_on() {
        let b = 0b1010_u8;
        assert!(b.is_bit_on(1));
        assert!(b.is_bit_on(3));
        assert!(!b.is_bit_on(0));
        assert!(!b.is_bit_on(2));
    }

    #[test]
    fn test_set_bit() {
        let mut b = 0_u32;
        b.set_bit(31, true);
        assert_eq!(b, 0x8000_0000);
        b.set_bit(31, false);
        assert_eq!(b, 0);
    }

    #[test]
    fn test_get_bits() {
        // DMAMOV CCR operand: burst length field is bits 4..=7.
        let ccr = 0x00B9_C2E6_u32;
        assert_eq!(ccr.get_bits(4..=7), 0xE);
        assert_eq!(ccr.get_bits(18..=21), 0xE);
        assert_eq!(ccr.get_bits(0..=31), ccr);
    }

    #[test]
    fn test_set_bits() {
        let mut ccr = 0x00B9_C2E6_u32;
        ccr.set_bits(4..=7, 0xF);
        ccr.set_bits(18..=21, 0xF);
        assert_eq!(ccr, 0x00BD_C2F6);

        // Oversized values are cut to the field width.
        let mut v = 0_u16;
        v.set_bits(0..=3, 0xFF);
        assert_eq!(v, 0xF);
    }

    #[test]
    fn test_bytes() {
        let mut sync = 0_u32;
        sync.set_byte(1, 0x99);
        sync.set_byte(3, 0x80);
        assert_eq!(sync, 0x8000_9900);
        assert_eq!(sync.get_byte(1), 0x99);
        assert_eq!(sync.get_byte(0), 0);
    }

    #[test]
    fn test_set_get_random_bits() {
        let mut rng = rand::rng();
        for _ in 0..1000 {
            let start: u8 = rng.random_range(0..32);
            let end: u8 = rng.random_range(start..32);
            let value: u32 = rng.random();
            let mut reg: u32 = rng.random();
            let before = reg;

            reg.set_bits(start..=end, value);
            let width = u32::from(end - start) + 1;
            let field_mask = u32::MAX >> (32 - width);
            assert_eq!(reg.get_bits(start..=end), value & field_mask);

            // Bits outside the field are untouched.
            let outside = !(field_mask << start);
            assert_eq!(reg & outside, before & outside);
        }
    }
}
