//! MDEC "BS" compressed video frame encoder
//!
//! A BS frame is an 8-byte header followed by Huffman-coded DCT coefficients for every 8x8 block
//! of the frame, in macroblock order Cr, Cb, Y1, Y2, Y3, Y4 with macroblocks walked column by
//! column. Frames must fit a caller-supplied byte budget; the encoder searches for the smallest
//! quantization scale that fits rather than ever truncating.
//!
//! Three codec variants are supported. v2 stores each DC coefficient as a raw 10-bit value. v3
//! delta-codes DC per coefficient class (Cr/Cb/Y) through dedicated Huffman tables. v3dc
//! additionally folds large deltas through the decoder's 10-bit wraparound, which shortens the
//! codes for extreme DC jumps.

mod bits;
mod dct;
mod huffman;

use crate::mdec::bits::BitWriter;
use crate::mdec::dct::{forward_dct, scaled_quant_table, ZAGZIG_TABLE};
use crate::mdec::huffman::{HuffmanTables, CLASS_Y};
use thiserror::Error;

pub const BS_HEADER_SIZE: usize = 8;

const MAX_QUANT_SCALE: i32 = 63;
const BLOCKS_PER_MACROBLOCK: usize = 6;

/// Emitted when a frame cannot fit its byte budget; expected control flow while searching for a
/// usable quantization scale, fatal once the scale is exhausted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("encoded frame data overflowed its byte budget")]
pub struct FrameOverflow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BsCodec {
    V2,
    V3,
    /// v3 with DC deltas folded through the decoder's modular wraparound
    V3Dc,
}

impl BsCodec {
    fn version_byte(self) -> u8 {
        match self {
            Self::V2 => 0x02,
            Self::V3 | Self::V3Dc => 0x03,
        }
    }

    fn end_of_frame_code(self) -> u32 {
        // 0x1FF is unusable as a v2 coefficient for exactly this reason
        match self {
            Self::V2 => 0x1FF,
            Self::V3 | Self::V3Dc => 0x3FF,
        }
    }
}

#[derive(Debug)]
pub struct MdecEncoder {
    codec: BsCodec,
    width: usize,
    height: usize,
    mb_cols: usize,
    mb_rows: usize,
    tables: HuffmanTables,
    dct_block_lists: [Vec<i16>; BLOCKS_PER_MACROBLOCK],
    writer: BitWriter,
    block_type: usize,
    last_dc_values: [i32; 3],
    uncomp_hwords_used: u32,
    blocks_used: u32,
    quant_scale: i32,
    quant_scale_sum: u64,
    frames_encoded: u32,
}

impl MdecEncoder {
    /// # Panics
    ///
    /// Panics if the dimensions are zero or not multiples of 16.
    #[must_use]
    pub fn new(codec: BsCodec, width: usize, height: usize) -> Self {
        assert!(width > 0 && height > 0, "frame dimensions must be non-zero");
        assert!(width % 16 == 0 && height % 16 == 0, "frame dimensions must be multiples of 16");

        let mb_cols = width / 16;
        let mb_rows = height / 16;
        let coefficients = mb_cols * mb_rows * 64;

        Self {
            codec,
            width,
            height,
            mb_cols,
            mb_rows,
            tables: HuffmanTables::new(),
            dct_block_lists: std::array::from_fn(|_| vec![0; coefficients]),
            writer: BitWriter::with_capacity(0x10000),
            block_type: 0,
            last_dc_values: [0; 3],
            uncomp_hwords_used: 0,
            blocks_used: 0,
            quant_scale: 0,
            quant_scale_sum: 0,
            frames_encoded: 0,
        }
    }

    #[must_use]
    pub fn width(&self) -> usize {
        self.width
    }

    #[must_use]
    pub fn height(&self) -> usize {
        self.height
    }

    /// Size in bytes of one NV21 input frame.
    #[must_use]
    pub fn frame_size(&self) -> usize {
        self.width * self.height * 3 / 2
    }

    /// Encode one NV21 frame into the staging buffer, trying quantization scales from 1 upward
    /// until the result fits in `max_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`FrameOverflow`] if the frame does not fit the budget even at the coarsest scale.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is shorter than [`Self::frame_size`].
    pub fn encode_frame(&mut self, frame: &[u8], max_size: usize) -> Result<(), FrameOverflow> {
        self.load_macroblocks(frame);

        for quant_scale in 1..=MAX_QUANT_SCALE {
            if self.try_encode(quant_scale, max_size).is_err() {
                continue;
            }

            self.quant_scale = quant_scale;
            self.quant_scale_sum += quant_scale as u64;
            self.frames_encoded += 1;
            self.finalize_frame();

            log::trace!(
                "Encoded frame {}: quant scale {quant_scale}, {} bytes of {max_size}",
                self.frames_encoded,
                self.writer.len()
            );
            return Ok(());
        }

        Err(FrameOverflow)
    }

    /// The finished frame: BS header plus coefficient data, padded to a multiple of 4 bytes.
    #[must_use]
    pub fn frame_data(&self) -> &[u8] {
        self.writer.data()
    }

    #[must_use]
    pub fn bytes_used(&self) -> usize {
        self.writer.len()
    }

    #[must_use]
    pub fn bs_header(&self) -> [u8; BS_HEADER_SIZE] {
        self.writer.data()[..BS_HEADER_SIZE].try_into().unwrap()
    }

    #[must_use]
    pub fn quant_scale(&self) -> i32 {
        self.quant_scale
    }

    /// Mean quantization scale across all frames encoded so far, for quality reporting.
    #[must_use]
    pub fn average_quant_scale(&self) -> f64 {
        if self.frames_encoded == 0 {
            return 0.0;
        }
        self.quant_scale_sum as f64 / f64::from(self.frames_encoded)
    }

    #[must_use]
    pub fn frames_encoded(&self) -> u32 {
        self.frames_encoded
    }

    /// Split the frame into 8x8 blocks in Cr/Cb/Y1-Y4 order, center values around zero, and
    /// apply the forward DCT. The chroma plane interleaves Cr into even and Cb into odd bytes.
    fn load_macroblocks(&mut self, frame: &[u8]) {
        let pitch = self.width;
        let y_plane = &frame[..self.width * self.height];
        let c_plane = &frame[self.width * self.height..self.frame_size()];

        for fx in 0..self.mb_cols {
            for fy in 0..self.mb_rows {
                let block_offs = 64 * (fy * self.mb_cols + fx);

                for y in 0..8 {
                    for x in 0..8 {
                        let k = y * 8 + x;
                        let cx = fx * 8 + x;
                        let cy = fy * 8 + y;
                        let lx = fx * 16 + x;
                        let ly = fy * 16 + y;

                        self.dct_block_lists[0][block_offs + k] =
                            i16::from(c_plane[pitch * cy + 2 * cx]) - 128;
                        self.dct_block_lists[1][block_offs + k] =
                            i16::from(c_plane[pitch * cy + 2 * cx + 1]) - 128;
                        self.dct_block_lists[2][block_offs + k] =
                            i16::from(y_plane[pitch * ly + lx]) - 128;
                        self.dct_block_lists[3][block_offs + k] =
                            i16::from(y_plane[pitch * ly + lx + 8]) - 128;
                        self.dct_block_lists[4][block_offs + k] =
                            i16::from(y_plane[pitch * (ly + 8) + lx]) - 128;
                        self.dct_block_lists[5][block_offs + k] =
                            i16::from(y_plane[pitch * (ly + 8) + lx + 8]) - 128;
                    }
                }

                for list in &mut self.dct_block_lists {
                    forward_dct(&mut list[block_offs..block_offs + 64]);
                }
            }
        }
    }

    fn try_encode(&mut self, quant_scale: i32, max_size: usize) -> Result<(), FrameOverflow> {
        let quant_table = scaled_quant_table(quant_scale);

        self.writer.reset(BS_HEADER_SIZE, max_size);
        self.block_type = 0;
        self.last_dc_values = [0; 3];
        self.uncomp_hwords_used = 0;

        let Self {
            codec,
            tables,
            writer,
            dct_block_lists,
            block_type,
            last_dc_values,
            uncomp_hwords_used,
            mb_cols,
            mb_rows,
            ..
        } = self;

        // Macroblocks are transmitted column by column
        for fx in 0..*mb_cols {
            for fy in 0..*mb_rows {
                let block_offs = 64 * (fy * *mb_cols + fx);
                for list in dct_block_lists.iter() {
                    encode_dct_block(
                        *codec,
                        tables,
                        writer,
                        &list[block_offs..block_offs + 64],
                        &quant_table,
                        block_type,
                        last_dc_values,
                        uncomp_hwords_used,
                    )?;
                }
            }
        }

        writer.write_bits(10, codec.end_of_frame_code())?;
        writer.flush()?;
        *uncomp_hwords_used += 2;

        Ok(())
    }

    fn finalize_frame(&mut self) {
        // MDEC DMA transfers run in 32-word chunks, so the decompressed halfword count is
        // reported rounded up to a multiple of 64
        let uncomp_hwords = (self.uncomp_hwords_used + 0x3F) & !0x3F;
        self.blocks_used = (uncomp_hwords + 1) >> 1;

        let padded_len = (self.writer.len() + 0x3) & !0x3;
        self.writer.pad_to(padded_len);

        let quant_scale = self.quant_scale;
        let version = self.codec.version_byte();
        let blocks_used = self.blocks_used;

        // Word 0 is the MDEC command that starts decoding: 0x3800 in the high halfword, the
        // decompressed data length in 32-bit words in the low halfword
        let header = self.writer.data_mut();
        header[0x0..0x2].copy_from_slice(&(blocks_used as u16).to_le_bytes());
        header[0x2] = 0x00;
        header[0x3] = 0x38;
        header[0x4..0x6].copy_from_slice(&(quant_scale as u16).to_le_bytes());
        header[0x6] = version;
        header[0x7] = 0x00;
    }
}

/// Rounded division matching C `round()`: halves round away from zero.
fn divide_rounded(numerator: i32, denominator: i32) -> i32 {
    (f64::from(numerator) / f64::from(denominator)).round() as i32
}

/// Fold a DC delta through the decoder's 10-bit wraparound. Decoders that compute
/// `(last + delta * 4) & 0x3FF` reconstruct the same coefficient from the folded delta, and the
/// smaller magnitude takes a shorter Huffman code.
fn fold_dc_delta(delta: i32) -> i32 {
    if delta < -0x80 {
        delta + 0x100
    } else if delta > 0x80 {
        delta - 0x100
    } else {
        delta
    }
}

#[allow(clippy::too_many_arguments)]
fn encode_dct_block(
    codec: BsCodec,
    tables: &HuffmanTables,
    writer: &mut BitWriter,
    block: &[i16],
    quant_table: &[i16; 64],
    block_type: &mut usize,
    last_dc_values: &mut [i32; 3],
    uncomp_hwords_used: &mut u32,
) -> Result<(), FrameOverflow> {
    let dc = divide_rounded(i32::from(block[0]), i32::from(quant_table[0]));
    let dc = i32::from(tables.coeff_clamp_map[(dc & 0xFFFF) as usize]);

    if codec == BsCodec::V2 {
        writer.write_bits(10, (dc & 0x3FF) as u32)?;
    } else {
        let class = (*block_type).min(CLASS_Y);

        let mut delta = divide_rounded(dc - last_dc_values[class], 4);
        last_dc_values[class] += delta * 4;

        if codec == BsCodec::V3Dc {
            delta = fold_dc_delta(delta);
        }

        let word = tables.dc_map[(class << 9) | ((delta & 0x1FF) as usize)];
        writer.write_bits(word >> 24, word & 0xFF_FFFF)?;
    }

    let mut zeroes = 0_usize;
    for i in 1..64 {
        let ri = ZAGZIG_TABLE[i];
        let ac = divide_rounded(i32::from(block[ri]), i32::from(quant_table[ri]));
        let ac = i32::from(tables.coeff_clamp_map[(ac & 0xFFFF) as usize]);

        if ac == 0 {
            zeroes += 1;
        } else {
            let word = tables.ac_map[(zeroes << 10) | ((ac & 0x3FF) as usize)];
            writer.write_bits(word >> 24, word & 0xFF_FFFF)?;

            zeroes = 0;
            *uncomp_hwords_used += 1;
        }
    }

    writer.write_bits(2, 0b10)?;

    *block_type = (*block_type + 1) % BLOCKS_PER_MACROBLOCK;
    *uncomp_hwords_used += 2;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn flat_frame(width: usize, height: usize, value: u8) -> Vec<u8> {
        vec![value; width * height * 3 / 2]
    }

    #[test]
    fn uniform_gray_16x16_frame_v2() {
        let mut encoder = MdecEncoder::new(BsCodec::V2, 16, 16);
        let frame = flat_frame(16, 16, 128);

        encoder.encode_frame(&frame, 2016).unwrap();

        // Six blocks of a zero DC (10 bits) + EOB (2 bits), then the 10-bit end-of-frame code:
        // 82 bits -> 6 emitted words -> 8-byte header + 12 bytes of data
        assert_eq!(encoder.bytes_used(), 20);
        assert_eq!(encoder.quant_scale(), 1);

        let data = encoder.frame_data();
        // 14 used halfwords round up to 64, i.e. 32 32-bit words in the MDEC command
        assert_eq!(&data[0..8], &[0x20, 0x00, 0x00, 0x38, 0x01, 0x00, 0x02, 0x00]);
        // First coefficient word: ten DC zero bits then the EOB code "10"
        assert_eq!(&data[8..10], &[0x20, 0x00]);
    }

    #[test]
    fn uniform_gray_16x16_frame_v3() {
        let mut encoder = MdecEncoder::new(BsCodec::V3, 16, 16);
        let frame = flat_frame(16, 16, 128);

        encoder.encode_frame(&frame, 2016).unwrap();

        // DC codes 2+2+3+3+3+3 bits, six 2-bit EOBs, one 10-bit end-of-frame: 38 bits
        assert_eq!(encoder.bytes_used(), 16);

        let data = encoder.frame_data();
        assert_eq!(data[4], 0x01);
        assert_eq!(data[6], 0x03);
    }

    #[test]
    fn frame_fit_invariant_holds() {
        let width = 32;
        let height = 32;
        let mut frame = vec![0_u8; width * height * 3 / 2];
        // Deterministic noise so every block carries AC energy
        let mut state = 0x12345678_u32;
        for byte in &mut frame {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            *byte = (state >> 24) as u8;
        }

        let mut encoder = MdecEncoder::new(BsCodec::V2, width, height);
        encoder.encode_frame(&frame, 512).unwrap();

        assert!(encoder.bytes_used() <= 512);
        assert_eq!(encoder.bytes_used() % 4, 0);
        // Noise cannot fit 512 bytes at the finest quantization
        assert!(encoder.quant_scale() > 1);

        // blocks_used * 4 >= uncomp_hwords_used * 2
        let uncomp_hwords = (encoder.uncomp_hwords_used + 0x3F) & !0x3F;
        assert!(encoder.blocks_used * 4 >= uncomp_hwords * 2);
    }

    #[test]
    fn impossible_budget_reports_overflow() {
        let mut encoder = MdecEncoder::new(BsCodec::V2, 16, 16);
        let frame = flat_frame(16, 16, 128);

        assert_eq!(encoder.encode_frame(&frame, 16), Err(FrameOverflow));
    }

    #[test]
    fn dc_delta_folding_is_strict() {
        assert_eq!(fold_dc_delta(0x80), 0x80);
        assert_eq!(fold_dc_delta(-0x80), -0x80);
        assert_eq!(fold_dc_delta(0x81), 0x81 - 0x100);
        assert_eq!(fold_dc_delta(-0x81), 0x100 - 0x81);
        assert_eq!(fold_dc_delta(0), 0);
    }

    // MSB-first reader over little-endian 16-bit words, mirroring the MDEC's input order
    struct BitReader<'a> {
        data: &'a [u8],
        word_index: usize,
        bits_left: u32,
        current: u16,
    }

    impl<'a> BitReader<'a> {
        fn new(data: &'a [u8]) -> Self {
            Self { data, word_index: 0, bits_left: 0, current: 0 }
        }

        fn read_bit(&mut self) -> u32 {
            if self.bits_left == 0 {
                self.current = u16::from_le_bytes([
                    self.data[self.word_index],
                    self.data[self.word_index + 1],
                ]);
                self.word_index += 2;
                self.bits_left = 16;
            }
            self.bits_left -= 1;
            u32::from((self.current >> self.bits_left) & 1)
        }

        fn read_bits(&mut self, count: u32) -> u32 {
            (0..count).fold(0, |acc, _| (acc << 1) | self.read_bit())
        }
    }

    fn sign_extend_10(value: u32) -> i32 {
        ((value as i32) << 22) >> 22
    }

    /// Invert the AC map into a (bits, code) -> key table for decoding
    fn build_ac_decode_table(tables: &HuffmanTables) -> HashMap<(u32, u32), usize> {
        let mut decode = HashMap::new();
        for (key, &word) in tables.ac_map.iter().enumerate() {
            let bits = word >> 24;
            if bits != 22 {
                decode.insert((bits, word & 0xFF_FFFF), key);
            }
        }
        decode
    }

    #[test]
    fn v2_bitstream_round_trips_through_reference_decoder() {
        let width = 32;
        let height = 32;

        // Smooth gradient with some chroma variation
        let mut frame = vec![0_u8; width * height * 3 / 2];
        for y in 0..height {
            for x in 0..width {
                frame[y * width + x] = ((x * 4 + y * 2) & 0xFF) as u8;
            }
        }
        for i in 0..width * height / 2 {
            frame[width * height + i] = (96 + (i & 0x3F)) as u8;
        }

        let mut encoder = MdecEncoder::new(BsCodec::V2, width, height);
        encoder.encode_frame(&frame, 0x8000).unwrap();

        let quant_table = scaled_quant_table(encoder.quant_scale());
        let decode_table = build_ac_decode_table(&encoder.tables);

        let mut reader = BitReader::new(&encoder.frame_data()[8..]);
        let block_count = (width / 16) * (height / 16) * BLOCKS_PER_MACROBLOCK;

        let mut decoded_blocks: Vec<Vec<(usize, i32)>> = Vec::new();
        for _ in 0..block_count {
            let dc = sign_extend_10(reader.read_bits(10));
            let mut coefficients = vec![(0, dc)];

            let mut zigzag_pos = 0_usize;
            loop {
                // Try codes from shortest to longest; 2 bits is the EOB "10"
                let mut code = reader.read_bits(2);
                if code == 0b10 {
                    break;
                }

                let mut bits = 2;
                let key = loop {
                    if bits == 6 && code == 0x1 {
                        // Escape: raw 6-bit run + 10-bit level
                        break reader.read_bits(16) as usize;
                    }
                    if let Some(&key) = decode_table.get(&(bits, code)) {
                        break key;
                    }
                    code = (code << 1) | reader.read_bit();
                    bits += 1;
                    assert!(bits <= 22, "failed to decode AC code");
                };

                let run = key >> 10;
                let level = sign_extend_10((key & 0x3FF) as u32);
                zigzag_pos += run + 1;
                assert!(zigzag_pos < 64);
                coefficients.push((zigzag_pos, level));
            }

            decoded_blocks.push(coefficients);
        }

        // The decoded coefficients must match re-quantizing the encoder's DCT output
        let mut expected_blocks: Vec<Vec<(usize, i32)>> = Vec::new();
        for fx in 0..width / 16 {
            for fy in 0..height / 16 {
                let block_offs = 64 * (fy * (width / 16) + fx);
                for list in &encoder.dct_block_lists {
                    let block = &list[block_offs..block_offs + 64];

                    let dc = divide_rounded(i32::from(block[0]), i32::from(quant_table[0]));
                    let dc = i32::from(encoder.tables.coeff_clamp_map[(dc & 0xFFFF) as usize]);
                    let mut coefficients = vec![(0, dc)];

                    for i in 1..64 {
                        let ri = ZAGZIG_TABLE[i];
                        let ac =
                            divide_rounded(i32::from(block[ri]), i32::from(quant_table[ri]));
                        let ac =
                            i32::from(encoder.tables.coeff_clamp_map[(ac & 0xFFFF) as usize]);
                        if ac != 0 {
                            coefficients.push((i, ac));
                        }
                    }
                    expected_blocks.push(coefficients);
                }
            }
        }

        assert_eq!(decoded_blocks, expected_blocks);
    }
}
