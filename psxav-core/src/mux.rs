//! STR container plumbing: the fractional sectors-per-frame budget and the video sub-chunk
//! stream that slices encoded BS frames into 2016-byte sector payloads.

use crate::mdec::{FrameOverflow, MdecEncoder, BS_HEADER_SIZE};

pub const STR_CHUNK_MAGIC: u16 = 0x0160;
pub const CHUNK_HEADER_SIZE: usize = 32;
pub const CHUNK_DATA_SIZE: usize = 2016;

/// Default chunk type tag for video sectors.
pub const DEFAULT_VIDEO_ID: u16 = 0x8001;
/// Default chunk type tag for SPU audio sectors (reserved; the SPU-in-STR variant is not
/// implemented).
pub const DEFAULT_AUDIO_ID: u16 = 0x0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrFormat {
    /// 2336-byte Mode 2 payloads
    Str,
    /// Full 2352-byte raw sectors
    StrCd,
    /// Video-only 2048-byte data payloads
    StrV,
}

impl StrFormat {
    #[must_use]
    pub fn sector_size(self) -> usize {
        match self {
            Self::Str => cd_sector::MODE_2_PAYLOAD_LEN,
            Self::StrCd => cd_sector::BYTES_PER_SECTOR,
            Self::StrV => cd_sector::FORM_1_DATA_LEN,
        }
    }
}

/// Integer accumulator distributing a fractional sectors-per-frame ratio exactly across frames:
/// at 8.75 sectors per frame the per-frame budgets run 8, 9, 9, 9, 8, 9, 9, 9, ...
#[derive(Debug)]
pub struct FrameBudget {
    base: u32,
    den: u32,
    num: u32,
}

impl FrameBudget {
    /// `base` / `den` is the sectors-per-frame ratio.
    #[must_use]
    pub fn new(base: u32, den: u32) -> Self {
        Self { base, den, num: 0 }
    }

    #[must_use]
    pub fn sectors_per_frame(&self) -> f64 {
        f64::from(self.base) / f64::from(self.den)
    }

    /// Byte budget for the next frame.
    pub fn next_frame_max_size(&mut self) -> usize {
        self.num += self.base;
        let sectors = (self.num / self.den) as usize;
        self.num %= self.den;
        sectors * CHUNK_DATA_SIZE
    }
}

/// Turns a sequence of input frames into a sequence of video sector payloads: each call emits
/// one 32-byte sub-chunk header plus 2016 bytes of BS data, encoding the next frame whenever the
/// staged one is exhausted.
#[derive(Debug)]
pub struct StrVideoStream {
    encoder: MdecEncoder,
    budget: FrameBudget,
    video_id: u16,
    frame_index: u32,
    frame_data_offset: usize,
    frame_max_size: usize,
}

impl StrVideoStream {
    #[must_use]
    pub fn new(encoder: MdecEncoder, budget: FrameBudget, video_id: u16) -> Self {
        Self { encoder, budget, video_id, frame_index: 0, frame_data_offset: 0, frame_max_size: 0 }
    }

    #[must_use]
    pub fn encoder(&self) -> &MdecEncoder {
        &self.encoder
    }

    /// Whether part of the staged frame still awaits emission.
    #[must_use]
    pub fn has_staged_data(&self) -> bool {
        self.frame_data_offset < self.frame_max_size
    }

    #[must_use]
    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    /// Fill one video sector's 2048-byte data area from the staged frame, pulling and encoding
    /// new frames from `frames` as needed. Returns the number of input frames consumed.
    ///
    /// # Errors
    ///
    /// Returns [`FrameOverflow`] when a frame cannot fit its sector budget at any quantization
    /// scale.
    ///
    /// # Panics
    ///
    /// Panics if a new frame must be encoded but `frames` holds less than one whole frame; the
    /// muxer only calls this while frames or staged data remain.
    pub fn fill_sector(&mut self, frames: &[u8], out: &mut [u8]) -> Result<usize, FrameOverflow> {
        let frame_size = self.encoder.frame_size();
        let mut frames_used = 0;

        while self.frame_data_offset >= self.frame_max_size {
            self.frame_index += 1;
            self.frame_max_size = self.budget.next_frame_max_size();
            self.frame_data_offset = 0;

            let offset = frames_used * frame_size;
            self.encoder.encode_frame(&frames[offset..offset + frame_size], self.frame_max_size)?;
            frames_used += 1;

            log::debug!(
                "Frame {}: {} bytes in {} sectors at quant scale {}",
                self.frame_index,
                self.encoder.bytes_used(),
                self.frame_max_size / CHUNK_DATA_SIZE,
                self.encoder.quant_scale()
            );
        }

        self.write_chunk_header(&mut out[..CHUNK_HEADER_SIZE]);

        // Bytes past the encoded frame data stay zero within the frame's sector allocation
        let staged = self.encoder.frame_data();
        let start = self.frame_data_offset.min(staged.len());
        let end = (self.frame_data_offset + CHUNK_DATA_SIZE).min(staged.len());
        let chunk = &mut out[CHUNK_HEADER_SIZE..CHUNK_HEADER_SIZE + CHUNK_DATA_SIZE];
        chunk.fill(0);
        chunk[..end - start].copy_from_slice(&staged[start..end]);

        self.frame_data_offset += CHUNK_DATA_SIZE;
        Ok(frames_used)
    }

    fn write_chunk_header(&self, header: &mut [u8]) {
        let chunk_index = (self.frame_data_offset / CHUNK_DATA_SIZE) as u16;
        let chunk_count = (self.frame_max_size / CHUNK_DATA_SIZE) as u16;

        header.fill(0);
        header[0x00..0x02].copy_from_slice(&STR_CHUNK_MAGIC.to_le_bytes());
        header[0x02..0x04].copy_from_slice(&self.video_id.to_le_bytes());
        header[0x04..0x06].copy_from_slice(&chunk_index.to_le_bytes());
        header[0x06..0x08].copy_from_slice(&chunk_count.to_le_bytes());
        header[0x08..0x0C].copy_from_slice(&self.frame_index.to_le_bytes());
        header[0x0C..0x10].copy_from_slice(&(self.encoder.bytes_used() as u32).to_le_bytes());
        header[0x10..0x12].copy_from_slice(&(self.encoder.width() as u16).to_le_bytes());
        header[0x12..0x14].copy_from_slice(&(self.encoder.height() as u16).to_le_bytes());
        header[0x14..0x14 + BS_HEADER_SIZE].copy_from_slice(&self.encoder.bs_header());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mdec::BsCodec;

    #[test]
    fn fractional_budget_distributes_exactly() {
        // 2x speed, 15 fps, interleave 8 with 7 video sectors per block: 8.75 sectors per frame
        let mut budget = FrameBudget::new(150 * 7, 8 * 15);

        let sizes: Vec<usize> =
            (0..8).map(|_| budget.next_frame_max_size() / CHUNK_DATA_SIZE).collect();
        assert_eq!(sizes, [8, 9, 9, 9, 8, 9, 9, 9]);

        assert!((budget.sectors_per_frame() - 8.75).abs() < 1e-9);
    }

    #[test]
    fn integral_budget_is_constant() {
        let mut budget = FrameBudget::new(150, 15);
        for _ in 0..10 {
            assert_eq!(budget.next_frame_max_size(), 10 * CHUNK_DATA_SIZE);
        }
    }

    #[test]
    fn chunk_headers_track_frame_slicing() {
        let width = 16;
        let height = 16;
        let encoder = MdecEncoder::new(BsCodec::V2, width, height);
        // Every frame gets exactly 2 sectors
        let budget = FrameBudget::new(2, 1);
        let mut stream = StrVideoStream::new(encoder, budget, DEFAULT_VIDEO_ID);

        let frame = vec![128_u8; width * height * 3 / 2];
        let mut sector_data = vec![0_u8; CHUNK_HEADER_SIZE + CHUNK_DATA_SIZE];

        // First sector encodes frame 1 and emits chunk 0 of 2
        let used = stream.fill_sector(&frame, &mut sector_data).unwrap();
        assert_eq!(used, 1);
        assert_eq!(&sector_data[0..2], &[0x60, 0x01]);
        assert_eq!(&sector_data[2..4], &[0x01, 0x80]);
        assert_eq!(u16::from_le_bytes([sector_data[4], sector_data[5]]), 0);
        assert_eq!(u16::from_le_bytes([sector_data[6], sector_data[7]]), 2);
        assert_eq!(u32::from_le_bytes(sector_data[8..12].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes([sector_data[0x10], sector_data[0x11]]), 16);
        assert_eq!(u16::from_le_bytes([sector_data[0x12], sector_data[0x13]]), 16);
        // BS header copy: MDEC command low halfword + 0x3800, quant scale 1, version 2
        assert_eq!(&sector_data[0x14..0x1C], &[0x20, 0x00, 0x00, 0x38, 0x01, 0x00, 0x02, 0x00]);
        assert!(stream.has_staged_data());

        // Second sector consumes no frame and emits chunk 1 of 2
        let used = stream.fill_sector(&[], &mut sector_data).unwrap();
        assert_eq!(used, 0);
        assert_eq!(u16::from_le_bytes([sector_data[4], sector_data[5]]), 1);
        assert!(!stream.has_staged_data());

        // Third sector starts frame 2
        let used = stream.fill_sector(&frame, &mut sector_data).unwrap();
        assert_eq!(used, 1);
        assert_eq!(u32::from_le_bytes(sector_data[8..12].try_into().unwrap()), 2);
    }

    #[test]
    fn chunk_data_beyond_frame_bytes_is_zero() {
        let width = 16;
        let height = 16;
        let encoder = MdecEncoder::new(BsCodec::V2, width, height);
        let budget = FrameBudget::new(1, 1);
        let mut stream = StrVideoStream::new(encoder, budget, DEFAULT_VIDEO_ID);

        let frame = vec![128_u8; width * height * 3 / 2];
        let mut sector_data = vec![0xFF_u8; CHUNK_HEADER_SIZE + CHUNK_DATA_SIZE];

        stream.fill_sector(&frame, &mut sector_data).unwrap();

        // A uniform frame encodes to 20 bytes; the rest of the chunk must be zero-filled
        let bytes_used =
            u32::from_le_bytes(sector_data[0x0C..0x10].try_into().unwrap()) as usize;
        assert_eq!(bytes_used, 20);
        assert!(sector_data[CHUNK_HEADER_SIZE + bytes_used..].iter().all(|&b| b == 0));
    }
}
