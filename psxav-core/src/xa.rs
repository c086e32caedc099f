//! XA-ADPCM sector assembly
//!
//! An XA audio sector is a Mode 2 Form 2 sector whose data area holds 18 sound groups of 128
//! bytes. Each group carries 8 four-bit (or 4 eight-bit) ADPCM blocks: block headers in bytes
//! 0-3 and 8-11, each duplicated into the following 4 bytes (a hardware-required redundancy),
//! and 112 bytes of sample data with the blocks interleaved by byte column.

use crate::adpcm::{
    self, ChannelState, SAMPLES_PER_BLOCK, SHIFT_RANGE_4BPS, SHIFT_RANGE_8BPS, XA_FILTER_COUNT,
};
use cd_sector::sector::{coding, submode};
use cd_sector::{Sector, SectorType, XaSubheader, MODE_2_PAYLOAD_LEN};

pub const XA_FREQ_SINGLE: u32 = 18900;
pub const XA_FREQ_DOUBLE: u32 = 37800;

const SOUND_GROUPS_PER_SECTOR: usize = 18;
const SOUND_GROUP_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XaFormat {
    /// 2336-byte sectors (no sync/header), `.xa` files
    Xa,
    /// Full raw 2352-byte sectors
    XaCd,
}

#[derive(Debug, Clone, Copy)]
pub struct XaSettings {
    pub format: XaFormat,
    pub stereo: bool,
    pub frequency: u32,
    pub bits_per_sample: u32,
    pub file_number: u8,
    pub channel_number: u8,
}

impl XaSettings {
    #[must_use]
    pub fn sector_size(&self) -> usize {
        match self.format {
            XaFormat::Xa => MODE_2_PAYLOAD_LEN,
            XaFormat::XaCd => cd_sector::BYTES_PER_SECTOR,
        }
    }

    /// Samples per sector, per channel.
    #[must_use]
    pub fn samples_per_sector(&self) -> usize {
        let per_group = if self.bits_per_sample == 8 { 112 } else { 224 };
        (per_group >> u32::from(self.stereo)) * SOUND_GROUPS_PER_SECTOR
    }

    /// How many sectors apart consecutive sectors of this stream are placed on a 1x disc; e.g.
    /// 37800 Hz 4-bit stereo fills 1 of every 4 sectors.
    #[must_use]
    pub fn sector_interleave(&self) -> u32 {
        let mut interleave = if self.stereo { 2 } else { 4 };
        if self.frequency == XA_FREQ_SINGLE {
            interleave <<= 1;
        }
        if self.bits_per_sample == 4 {
            interleave <<= 1;
        }
        interleave
    }

    fn subheader(&self) -> XaSubheader {
        let mut coding_info =
            if self.stereo { coding::STEREO } else { coding::MONO };
        coding_info |= if self.frequency == XA_FREQ_DOUBLE {
            coding::FREQ_DOUBLE
        } else {
            coding::FREQ_SINGLE
        };
        coding_info |= if self.bits_per_sample == 8 { coding::BITS_8 } else { coding::BITS_4 };

        XaSubheader {
            file: self.file_number,
            channel: self.channel_number,
            submode: submode::AUDIO | submode::FORM2 | submode::REAL_TIME,
            coding: coding_info,
        }
    }
}

/// Streaming XA encoder; owns the per-channel predictor state so it can be fed one sector's
/// worth of samples at a time.
#[derive(Debug)]
pub struct XaEncoder {
    settings: XaSettings,
    left: ChannelState,
    right: ChannelState,
    sector: Sector,
}

impl XaEncoder {
    #[must_use]
    pub fn new(settings: XaSettings) -> Self {
        Self {
            settings,
            left: ChannelState::new(),
            right: ChannelState::new(),
            sector: Sector::new(),
        }
    }

    #[must_use]
    pub fn settings(&self) -> &XaSettings {
        &self.settings
    }

    /// Encode `samples` (channel-interleaved; the slice length is the valid sample count) into
    /// whole sectors appended to `out`, zero-padding the last sound groups past the end of the
    /// input. Returns the number of sectors emitted. `lba` stamps the first sector's timecode;
    /// subsequent sectors increment it.
    pub fn encode_sectors(&mut self, samples: &[i16], lba: u32, out: &mut Vec<u8>) -> usize {
        let slots_per_group = if self.settings.bits_per_sample == 8 { 112 } else { 224 };
        let total_slots = samples.len();
        let sector_size = self.settings.sector_size();

        let mut lba = lba;
        let mut sectors = 0;
        let mut group = 0;
        let mut slot = 0;
        while slot < total_slots || group % SOUND_GROUPS_PER_SECTOR != 0 {
            if group % SOUND_GROUPS_PER_SECTOR == 0 {
                self.init_sector(lba);
            }

            let group_offset = (group % SOUND_GROUPS_PER_SECTOR) * SOUND_GROUP_LEN;
            let base = slot.min(total_slots);
            let remaining = total_slots as i32 - slot as i32;
            {
                let data = &mut self.sector.mode_2_data_mut()
                    [group_offset..group_offset + SOUND_GROUP_LEN];
                encode_sound_group(
                    &self.settings,
                    &mut self.left,
                    &mut self.right,
                    &samples[base..],
                    remaining,
                    data,
                );
            }

            group += 1;
            slot += slots_per_group;

            if group % SOUND_GROUPS_PER_SECTOR == 0 {
                self.sector.compute_checksums(SectorType::Mode2Form2);
                out.extend_from_slice(self.sector.trailing(sector_size));
                sectors += 1;
                lba += 1;
            }
        }

        sectors
    }

    fn init_sector(&mut self, lba: u32) {
        self.sector.init(lba, SectorType::Mode2Form2);
        self.sector.set_subheader(self.settings.subheader());
    }

    /// Mark the last emitted sector as the end of the stream by setting the EOF submode bit in
    /// both subheader copies. The EDC is left as computed; readers do not verify Form 2 audio
    /// sectors against the submode byte.
    pub fn finalize(out: &mut [u8]) {
        if out.len() < MODE_2_PAYLOAD_LEN {
            return;
        }

        // The subheader of the last sector sits 2336 bytes from the end for both sector sizes
        let subheader_offset = out.len() - MODE_2_PAYLOAD_LEN;
        out[subheader_offset + 2] |= submode::EOF;
        out[subheader_offset + 6] |= submode::EOF;
    }
}

/// Encode one 128-byte sound group. `samples` starts at the group's first sample slot and
/// `slot_limit` counts the valid channel-interleaved slots remaining (may be negative when
/// zero-padding a sector tail).
fn encode_sound_group(
    settings: &XaSettings,
    left: &mut ChannelState,
    right: &mut ChannelState,
    samples: &[i16],
    slot_limit: i32,
    data: &mut [u8],
) {
    // Sub-slice starting at slot `offset`, without running off the valid samples
    fn at(samples: &[i16], offset: usize) -> &[i16] {
        &samples[offset.min(samples.len())..]
    }

    let block = SAMPLES_PER_BLOCK as i32;

    let mut headers = [0_u8; 8];
    if settings.bits_per_sample == 4 {
        if settings.stereo {
            // Blocks alternate L/R; each L/R pair consumes 56 slots. Paired blocks share data
            // byte columns: left in the low nibbles, right in the high nibbles.
            let limit_l = (slot_limit + 1) / 2;
            let limit_r = slot_limit / 2;
            for pair in 0..4 {
                let offset = 56 * pair;
                let limit_l = limit_l - block * pair as i32;
                let limit_r = limit_r - block * pair as i32;
                let column = &mut data[0x10 + pair..];
                headers[2 * pair] = adpcm::encode_block(
                    left, at(samples, offset), limit_l, 2, column, 0, 4,
                    XA_FILTER_COUNT, SHIFT_RANGE_4BPS,
                );
                let column = &mut data[0x10 + pair..];
                headers[2 * pair + 1] = adpcm::encode_block(
                    right, at(samples, offset + 1), limit_r, 2, column, 4, 4,
                    XA_FILTER_COUNT, SHIFT_RANGE_4BPS,
                );
            }
        } else {
            for b in 0..8 {
                let offset = SAMPLES_PER_BLOCK * b;
                let limit = slot_limit - block * b as i32;
                let column = &mut data[0x10 + b / 2..];
                headers[b] = adpcm::encode_block(
                    left, at(samples, offset), limit, 1, column, 4 * (b as u32 & 1), 4,
                    XA_FILTER_COUNT, SHIFT_RANGE_4BPS,
                );
            }
        }
    } else if settings.stereo {
        let limit_l = (slot_limit + 1) / 2;
        let limit_r = slot_limit / 2;
        for pair in 0..2 {
            let offset = 56 * pair;
            let limit_l = limit_l - block * pair as i32;
            let limit_r = limit_r - block * pair as i32;
            let column = &mut data[0x10 + 2 * pair..];
            headers[2 * pair] = adpcm::encode_block(
                left, at(samples, offset), limit_l, 2, column, 0, 4,
                XA_FILTER_COUNT, SHIFT_RANGE_8BPS,
            );
            let column = &mut data[0x10 + 2 * pair + 1..];
            headers[2 * pair + 1] = adpcm::encode_block(
                right, at(samples, offset + 1), limit_r, 2, column, 0, 4,
                XA_FILTER_COUNT, SHIFT_RANGE_8BPS,
            );
        }
    } else {
        for b in 0..4 {
            let offset = SAMPLES_PER_BLOCK * b;
            let limit = slot_limit - block * b as i32;
            let column = &mut data[0x10 + b..];
            headers[b] = adpcm::encode_block(
                left, at(samples, offset), limit, 1, column, 0, 4,
                XA_FILTER_COUNT, SHIFT_RANGE_8BPS,
            );
        }
    }

    // Header bytes plus their hardware-required duplicates
    data[0..4].copy_from_slice(&headers[0..4]);
    data[4..8].copy_from_slice(&headers[0..4]);
    data[8..12].copy_from_slice(&headers[4..8]);
    data[12..16].copy_from_slice(&headers[4..8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::TAU;

    fn stereo_sine(seconds: f64, frequency: u32) -> Vec<i16> {
        let sample_count = (seconds * f64::from(frequency)) as usize;
        let mut samples = Vec::with_capacity(2 * sample_count);
        for n in 0..sample_count {
            let value = (4000.0 * (TAU * 1000.0 * n as f64 / f64::from(frequency)).sin()) as i16;
            samples.push(value);
            samples.push(value);
        }
        samples
    }

    fn test_settings(format: XaFormat, stereo: bool) -> XaSettings {
        XaSettings {
            format,
            stereo,
            frequency: XA_FREQ_DOUBLE,
            bits_per_sample: 4,
            file_number: 0,
            channel_number: 0,
        }
    }

    #[test]
    fn stereo_sine_sector_count_and_subheader() {
        let settings = test_settings(XaFormat::XaCd, true);
        let samples = stereo_sine(2.0, XA_FREQ_DOUBLE);

        let mut encoder = XaEncoder::new(settings);
        let mut out = Vec::new();
        let sectors = encoder.encode_sectors(&samples, 0, &mut out);

        let samples_per_sector = settings.samples_per_sector();
        let expected_sectors = (2 * 37800 + samples_per_sector - 1) / samples_per_sector;
        assert_eq!(sectors, expected_sectors);
        assert_eq!(out.len(), expected_sectors * 2352);

        for sector in out.chunks_exact(2352) {
            // submode = AUDIO | FORM2 | RT
            assert_eq!(sector[0x12], 0x64);
            assert_eq!(sector[0x16], 0x64);
            // coding = stereo, double rate, 4-bit
            assert_eq!(sector[0x13], 0x01);
        }
    }

    #[test]
    fn sound_group_headers_are_duplicated() {
        let settings = test_settings(XaFormat::Xa, false);
        let samples: Vec<i16> = (0..settings.samples_per_sector())
            .map(|n| ((n * 37) % 2048) as i16 - 1024)
            .collect();

        let mut encoder = XaEncoder::new(settings);
        let mut out = Vec::new();
        encoder.encode_sectors(&samples, 0, &mut out);

        assert_eq!(out.len(), 2336);
        for group in out[8..8 + 18 * 128].chunks_exact(128) {
            assert_eq!(&group[0..4], &group[4..8]);
            assert_eq!(&group[8..12], &group[12..16]);
        }
    }

    #[test]
    fn finalize_sets_eof_in_both_subheader_copies() {
        let settings = test_settings(XaFormat::XaCd, true);
        let samples = stereo_sine(0.1, XA_FREQ_DOUBLE);

        let mut encoder = XaEncoder::new(settings);
        let mut out = Vec::new();
        encoder.encode_sectors(&samples, 0, &mut out);
        XaEncoder::finalize(&mut out);

        let last = out.len() - 2352;
        assert_eq!(out[last + 0x12], 0x64 | 0x80);
        assert_eq!(out[last + 0x16], 0x64 | 0x80);
        // Earlier sectors are untouched
        assert_eq!(out[0x12], 0x64);
    }

    #[test]
    fn lba_advances_across_sectors() {
        let settings = test_settings(XaFormat::XaCd, true);
        let samples = stereo_sine(0.5, XA_FREQ_DOUBLE);

        let mut encoder = XaEncoder::new(settings);
        let mut out = Vec::new();
        let sectors = encoder.encode_sectors(&samples, 0, &mut out);
        assert!(sectors > 1);

        for (i, sector) in out.chunks_exact(2352).enumerate() {
            let expected = cd_sector::time::lba_to_bcd_timecode(i as u32);
            assert_eq!(&sector[12..15], &expected);
        }
    }

    // Decoder model matching the XA hardware's data block layout
    fn decode_mono_group(group: &[u8], prev: &mut [i32; 2], out: &mut Vec<i16>) {
        const K1: [i32; 4] = [0, 60, 115, 98];
        const K2: [i32; 4] = [0, 0, -52, -55];

        for block in 0..8 {
            let header = group[4 + block];
            let shift = u32::from(header & 0x0F);
            let filter = usize::from((header >> 4) & 0x3);

            for i in 0..28 {
                let byte = group[16 + 4 * i + block / 2];
                let nibble = byte >> (4 * (block & 1));
                let extended = i32::from(((nibble << 4) as i8) >> 4);
                let shifted = (extended << 12) >> shift;
                let predicted = (K1[filter] * prev[0] + K2[filter] * prev[1] + 32) >> 6;
                let decoded = (shifted + predicted).clamp(i16::MIN.into(), i16::MAX.into());
                prev[1] = prev[0];
                prev[0] = decoded;
                out.push(decoded as i16);
            }
        }
    }

    #[test]
    fn mono_sector_round_trips_through_reference_decoder() {
        let settings = test_settings(XaFormat::Xa, false);
        let frequency = settings.frequency;
        let sample_count = settings.samples_per_sector();
        let samples: Vec<i16> = (0..sample_count)
            .map(|n| (4000.0 * (TAU * 440.0 * n as f64 / f64::from(frequency)).sin()) as i16)
            .collect();

        let mut encoder = XaEncoder::new(settings);
        let mut out = Vec::new();
        encoder.encode_sectors(&samples, 0, &mut out);

        let mut decoded = Vec::new();
        let mut prev = [0_i32; 2];
        for group in out[8..8 + 18 * 128].chunks_exact(128) {
            decode_mono_group(group, &mut prev, &mut decoded);
        }

        assert_eq!(decoded.len(), sample_count);
        for (i, (&d, &s)) in decoded.iter().zip(&samples).enumerate() {
            let error = (i32::from(d) - i32::from(s)).abs();
            assert!(error < 1024, "sample {i}: decoded {d}, input {s}");
        }
    }
}
