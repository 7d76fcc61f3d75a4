// Small numeric helpers shared by the asset decoders.

pub fn cv3_to_8(v: u8) -> u8 {
    (v << 5) | (v << 2) | (v >> 1)
}

pub fn cv5_to_8(v: u8) -> u8 {
    (v << 3) | (v >> 2)
}

// 3:5 weighted blend used by the 4x4 compressed texture color tables.
pub fn s3tc_blend(a: u8, b: u8) -> u8 {
    (((a as u16 * 3) + (b as u16 * 5)) >> 3) as u8
}

// 1.19.12 fixed point
pub fn fixed(n: i32) -> f32 {
    n as f32 / 4096.0
}

pub fn pad(x: u32, align: u32) -> u32 {
    (x + (align - 1)) & !(align - 1)
}

pub fn sign_extend(v: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((v << shift) as i32) >> shift
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_expansion_covers_full_range() {
        assert_eq!(cv5_to_8(0x00), 0x00);
        assert_eq!(cv5_to_8(0x1F), 0xFF);
        assert_eq!(cv3_to_8(0x00), 0x00);
        assert_eq!(cv3_to_8(0x07), 0xFF);
    }

    #[test]
    fn padding_is_idempotent_on_aligned_values() {
        assert_eq!(pad(0, 4), 0);
        assert_eq!(pad(1, 4), 4);
        assert_eq!(pad(4, 4), 4);
        assert_eq!(pad(0x201, 0x200), 0x400);
    }

    #[test]
    fn sign_extension_matches_bit_width() {
        assert_eq!(sign_extend(0x3FF, 10), -1);
        assert_eq!(sign_extend(0x1FF, 10), 511);
        assert_eq!(sign_extend(0x8000, 16), i16::MIN as i32);
    }
}
