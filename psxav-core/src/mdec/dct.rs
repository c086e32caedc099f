//! Integer 8x8 forward DCT and quantization tables
//!
//! The transform is two passes of a one-dimensional DCT using a Q14 cosine table, with 13-bit
//! renormalization after each pass. Output scaling matches the JPEG convention the MDEC expects:
//! the DC coefficient of a uniform block of value `c` is `8c`.

/// Quantization matrix baked into the MDEC, in row-major order.
#[rustfmt::skip]
pub const QUANT_TABLE: [u8; 64] = [
     2, 16, 19, 22, 26, 27, 29, 34,
    16, 16, 22, 24, 27, 29, 34, 37,
    19, 22, 26, 27, 29, 34, 34, 38,
    22, 22, 26, 27, 29, 34, 37, 40,
    22, 26, 27, 29, 32, 35, 40, 48,
    26, 27, 29, 32, 35, 40, 48, 58,
    26, 27, 29, 34, 38, 46, 56, 69,
    27, 29, 35, 38, 46, 56, 69, 83,
];

/// Maps zig-zag transmission position -> row-major block index.
#[rustfmt::skip]
pub const ZAGZIG_TABLE: [usize; 64] = [
     0,  1,  8, 16,  9,  2,  3, 10,
    17, 24, 32, 25, 18, 11,  4,  5,
    12, 19, 26, 33, 40, 48, 41, 34,
    27, 20, 13,  6,  7, 14, 21, 28,
    35, 42, 49, 56, 57, 50, 43, 36,
    29, 22, 15, 23, 30, 37, 44, 51,
    58, 59, 52, 45, 38, 31, 39, 46,
    53, 60, 61, 54, 47, 55, 62, 63,
];

// Q14 of sqrt(2) for row 0 and 2*cos(k*pi/16) for the rest
const SF0: i32 = 0x5A82;
const SF1: i32 = 0x7D8A;
const SF2: i32 = 0x7641;
const SF3: i32 = 0x6A6D;
const SF4: i32 = 0x5A82;
const SF5: i32 = 0x471C;
const SF6: i32 = 0x30FB;
const SF7: i32 = 0x18F8;

#[rustfmt::skip]
const DCT_SCALE_TABLE: [i32; 64] = [
    SF0,  SF0,  SF0,  SF0,  SF0,  SF0,  SF0,  SF0,
    SF1,  SF3,  SF5,  SF7, -SF7, -SF5, -SF3, -SF1,
    SF2,  SF6, -SF6, -SF2, -SF2, -SF6,  SF6,  SF2,
    SF3, -SF7, -SF1, -SF5,  SF5,  SF1,  SF7, -SF3,
    SF4, -SF4, -SF4,  SF4,  SF4, -SF4, -SF4,  SF4,
    SF5, -SF1,  SF7,  SF3, -SF3, -SF7,  SF1, -SF5,
    SF6, -SF2,  SF2, -SF6, -SF6,  SF2, -SF2,  SF6,
    SF7, -SF5,  SF3, -SF1,  SF1, -SF3,  SF5, -SF7,
];

/// Forward DCT of one 8x8 block in place.
pub fn forward_dct(block: &mut [i16]) {
    debug_assert_eq!(block.len(), 64);

    let mut midblock = [0_i32; 64];

    for i in 0..8 {
        for j in 0..8 {
            let mut v = 0;
            for k in 0..8 {
                v += i32::from(block[8 * j + k]) * DCT_SCALE_TABLE[8 * i + k] / 8;
            }
            midblock[8 * i + j] = (v + 0xFFF) >> 13;
        }
    }

    for i in 0..8 {
        for j in 0..8 {
            let mut v = 0;
            for k in 0..8 {
                v += midblock[8 * j + k] * DCT_SCALE_TABLE[8 * i + k] / 8;
            }
            block[8 * i + j] = ((v + 0xFFF) >> 13) as i16;
        }
    }
}

/// Build the quantization table for a scale. The DC entry is always scaled by 8, not by the
/// quantization scale.
#[must_use]
pub fn scaled_quant_table(quant_scale: i32) -> [i16; 64] {
    let mut table = [0_i16; 64];
    table[0] = i16::from(QUANT_TABLE[0]) * 8;
    for i in 1..64 {
        table[i] = i16::from(QUANT_TABLE[i]) * quant_scale as i16;
    }
    table
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_block_transforms_to_zero() {
        let mut block = [0_i16; 64];
        forward_dct(&mut block);
        assert_eq!(block, [0; 64]);
    }

    #[test]
    fn uniform_block_concentrates_energy_in_dc() {
        let mut block = [100_i16; 64];
        forward_dct(&mut block);

        let dc = i32::from(block[0]);
        assert!((dc - 800).abs() <= 8, "DC of uniform 100 block was {dc}");

        for (i, &coefficient) in block.iter().enumerate().skip(1) {
            assert!(coefficient.abs() <= 2, "AC coefficient {i} was {coefficient}");
        }
    }

    #[test]
    fn horizontal_cosine_maps_to_single_coefficient() {
        // One cycle of the second horizontal basis function across each row
        let mut block = [0_i16; 64];
        for y in 0..8 {
            for x in 0..8 {
                let phase = (2.0 * x as f64 + 1.0) * 2.0 * std::f64::consts::PI / 16.0;
                block[8 * y + x] = (100.0 * phase.cos()) as i16;
            }
        }
        forward_dct(&mut block);

        // Energy lands in (u=2, v=0), everything else stays near zero
        let target = i32::from(block[2]);
        assert!(target.abs() > 300, "expected strong coefficient, got {target}");
        for (i, &coefficient) in block.iter().enumerate() {
            if i != 2 {
                assert!(
                    coefficient.abs() < 16,
                    "coefficient {i} was {coefficient}, expected near zero"
                );
            }
        }
    }

    #[test]
    fn zagzig_table_is_a_permutation() {
        let mut seen = [false; 64];
        for &index in &ZAGZIG_TABLE {
            assert!(!seen[index]);
            seen[index] = true;
        }

        // Low frequencies come first: the first entries stay in the top-left corner
        assert_eq!(&ZAGZIG_TABLE[..4], &[0, 1, 8, 16]);
    }

    #[test]
    fn dc_quant_entry_ignores_scale() {
        let table = scaled_quant_table(20);
        assert_eq!(table[0], 16);
        assert_eq!(table[1], i16::from(QUANT_TABLE[1]) * 20);
    }
}
