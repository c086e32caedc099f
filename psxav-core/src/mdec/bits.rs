//! MSB-first bit packing for BS frames
//!
//! BS bitstreams are consumed by the MDEC as a sequence of little-endian 16-bit words, with
//! Huffman codes packed from the most significant bit down. The writer owns the staging buffer
//! for one frame and fails (without writing past the budget) when a code does not fit, which is
//! the signal for the quantization scale search to retry.

use crate::mdec::FrameOverflow;

#[derive(Debug)]
pub struct BitWriter {
    output: Vec<u8>,
    bits_value: u16,
    bits_left: u32,
    max_size: usize,
}

impl BitWriter {
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self { output: Vec::with_capacity(capacity), bits_value: 0, bits_left: 16, max_size: 0 }
    }

    /// Clear the buffer for a new encode attempt, reserving `header_len` zero bytes at the start
    /// and refusing to grow past `max_size` bytes total.
    pub fn reset(&mut self, header_len: usize, max_size: usize) {
        self.output.clear();
        self.output.resize(header_len, 0);
        self.bits_value = 0;
        self.bits_left = 16;
        self.max_size = max_size;
    }

    /// Emit the accumulator as a little-endian byte pair if it holds any bits.
    pub fn flush(&mut self) -> Result<(), FrameOverflow> {
        if self.bits_left < 16 {
            if self.output.len() + 2 > self.max_size {
                return Err(FrameOverflow);
            }
            self.output.extend_from_slice(&self.bits_value.to_le_bytes());
        }

        self.bits_left = 16;
        self.bits_value = 0;
        Ok(())
    }

    /// Append `bits` bits of `value`, most significant first. Codes wider than 16 bits are split
    /// and written high part first.
    pub fn write_bits(&mut self, bits: u32, value: u32) -> Result<(), FrameOverflow> {
        debug_assert!(bits >= 32 || value < (1 << bits));

        let mut bits = bits;
        let mut value = value;
        if bits > 16 {
            self.write_bits(bits - 16, value >> 16)?;
            bits = 16;
            value &= 0xFFFF;
        }

        if self.bits_left == 0 {
            self.flush()?;
        }

        while bits > self.bits_left {
            let out_value = value >> (bits - self.bits_left);
            debug_assert!(self.bits_value & (out_value as u16) == 0);
            self.bits_value |= out_value as u16;

            bits -= self.bits_left;
            value &= (1 << bits) - 1;
            self.flush()?;
        }

        if bits >= 1 {
            let out_value = value << (self.bits_left - bits);
            debug_assert!(self.bits_value & (out_value as u16) == 0);
            self.bits_value |= out_value as u16;
            self.bits_left -= bits;
        }

        Ok(())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.output.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.output.is_empty()
    }

    /// Zero-pad the buffer up to `len` bytes.
    pub fn pad_to(&mut self, len: usize) {
        debug_assert!(len >= self.output.len());
        self.output.resize(len, 0);
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.output
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_pack_msb_first_into_le_words() {
        let mut writer = BitWriter::with_capacity(64);
        writer.reset(0, 64);

        // 1010 1100 0011 0101 packed from the top
        writer.write_bits(4, 0b1010).unwrap();
        writer.write_bits(4, 0b1100).unwrap();
        writer.write_bits(8, 0b0011_0101).unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.data(), &[0x35, 0xAC]);
    }

    #[test]
    fn partial_word_flushes_with_zero_fill() {
        let mut writer = BitWriter::with_capacity(64);
        writer.reset(0, 64);

        writer.write_bits(10, 0x1FF).unwrap();
        writer.flush().unwrap();

        // 0111 1111 11 followed by six zero bits
        assert_eq!(writer.data(), &[0xC0, 0x7F]);
    }

    #[test]
    fn wide_codes_split_high_part_first() {
        let mut writer = BitWriter::with_capacity(64);
        writer.reset(0, 64);

        // The 22-bit AC escape: 000001 followed by a 16-bit payload
        writer.write_bits(22, (0x1 << 16) | 0xBEEF).unwrap();
        writer.write_bits(10, 0).unwrap();
        writer.flush().unwrap();

        let data = writer.data();
        assert_eq!(data.len(), 4);
        let word0 = u16::from_le_bytes([data[0], data[1]]);
        let word1 = u16::from_le_bytes([data[2], data[3]]);
        assert_eq!(word0, 0b0000_0110_1111_1011); // 000001 + top 10 bits of 0xBEEF
        assert_eq!(word1, 0b1011_1100_0000_0000); // low 6 bits of 0xBEEF + 10 zero bits
    }

    #[test]
    fn overflow_reported_before_writing_past_budget() {
        let mut writer = BitWriter::with_capacity(64);
        writer.reset(0, 4);

        // The accumulator lags a word behind, so the two words that fit are accepted eagerly
        writer.write_bits(16, 0x1234).unwrap();
        writer.write_bits(16, 0x5678).unwrap();
        writer.write_bits(16, 0x9ABC).unwrap();
        assert_eq!(writer.write_bits(16, 0xDEF0), Err(FrameOverflow));
        assert_eq!(writer.len(), 4);
    }

    #[test]
    fn header_space_is_reserved() {
        let mut writer = BitWriter::with_capacity(64);
        writer.reset(8, 64);

        writer.write_bits(16, 0xFFFF).unwrap();
        writer.flush().unwrap();

        assert_eq!(writer.data(), &[0, 0, 0, 0, 0, 0, 0, 0, 0xFF, 0xFF]);
    }
}
