//! Raw sector layout: sync pattern, header, CD-XA subheader
//!
//! A raw 2352-byte sector is laid out as 12 sync bytes, a 4-byte header (BCD timecode + mode),
//! and for Mode 2 an 8-byte subheader (two identical 4-byte copies, a redundancy required by the
//! CD-ROM XA specification) followed by the data area.

use crate::{edc, time, BYTES_PER_SECTOR, MODE_2_DATA_OFFSET, SUBHEADER_OFFSET};

/// Submode byte bits (subheader byte 2).
pub mod submode {
    pub const EOR: u8 = 0x01;
    pub const VIDEO: u8 = 0x02;
    pub const AUDIO: u8 = 0x04;
    pub const DATA: u8 = 0x08;
    pub const TRIGGER: u8 = 0x10;
    pub const FORM2: u8 = 0x20;
    pub const REAL_TIME: u8 = 0x40;
    pub const EOF: u8 = 0x80;
}

/// Coding information byte bits (subheader byte 3); only meaningful for audio sectors.
pub mod coding {
    pub const MONO: u8 = 0x00;
    pub const STEREO: u8 = 0x01;
    pub const CHANNEL_MASK: u8 = 0x03;
    pub const FREQ_DOUBLE: u8 = 0x00;
    pub const FREQ_SINGLE: u8 = 0x04;
    pub const FREQ_MASK: u8 = 0x0C;
    pub const BITS_4: u8 = 0x00;
    pub const BITS_8: u8 = 0x10;
    pub const BITS_MASK: u8 = 0x30;
    pub const EMPHASIS: u8 = 0x40;
}

/// Only the low 5 bits of the subheader channel number are valid.
pub const XA_CHANNEL_MASK: u8 = 0x1F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorType {
    Mode1,
    Mode2Form1,
    Mode2Form2,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XaSubheader {
    pub file: u8,
    pub channel: u8,
    pub submode: u8,
    pub coding: u8,
}

impl XaSubheader {
    #[must_use]
    pub fn to_bytes(self) -> [u8; 4] {
        [self.file, self.channel & XA_CHANNEL_MASK, self.submode, self.coding]
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; 4]) -> Self {
        Self { file: bytes[0], channel: bytes[1], submode: bytes[2], coding: bytes[3] }
    }
}

/// A raw 2352-byte sector under construction.
#[derive(Debug, Clone)]
pub struct Sector {
    bytes: Box<[u8; BYTES_PER_SECTOR]>,
}

impl Sector {
    #[must_use]
    pub fn new() -> Self {
        Self { bytes: Box::new([0; BYTES_PER_SECTOR]) }
    }

    /// Clear the sector and write the sync pattern, BCD timecode, and mode byte. Mode 2 sectors
    /// also get a zeroed subheader with the DATA bit set (+FORM2 for Form 2), duplicated into the
    /// second subheader slot.
    pub fn init(&mut self, lba: u32, sector_type: SectorType) {
        log::trace!("Initializing {sector_type:?} sector at LBA {lba}");

        self.bytes.fill(0);

        // Sync sequence: 00, then ten FF bytes, then 00
        self.bytes[1..11].fill(0xFF);

        let timecode = time::lba_to_bcd_timecode(lba);
        self.bytes[12..15].copy_from_slice(&timecode);

        match sector_type {
            SectorType::Mode1 => {
                self.bytes[15] = 0x01;
            }
            SectorType::Mode2Form1 | SectorType::Mode2Form2 => {
                self.bytes[15] = 0x02;

                let mut submode = submode::DATA;
                if sector_type == SectorType::Mode2Form2 {
                    submode |= submode::FORM2;
                }
                self.set_subheader(XaSubheader { submode, ..XaSubheader::default() });
            }
        }
    }

    /// Write the subheader into both 4-byte slots.
    pub fn set_subheader(&mut self, subheader: XaSubheader) {
        let bytes = subheader.to_bytes();
        self.bytes[SUBHEADER_OFFSET..SUBHEADER_OFFSET + 4].copy_from_slice(&bytes);
        self.bytes[SUBHEADER_OFFSET + 4..SUBHEADER_OFFSET + 8].copy_from_slice(&bytes);
    }

    #[must_use]
    pub fn subheader(&self) -> XaSubheader {
        XaSubheader::from_bytes(self.bytes[SUBHEADER_OFFSET..SUBHEADER_OFFSET + 4].try_into().unwrap())
    }

    /// The Mode 2 data area following the subheader.
    pub fn mode_2_data_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[MODE_2_DATA_OFFSET..]
    }

    /// Compute and store the EDC for the given sector type.
    pub fn compute_checksums(&mut self, sector_type: SectorType) {
        edc::compute_checksums(self.bytes.as_mut_slice(), sector_type);
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; BYTES_PER_SECTOR] {
        &self.bytes
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; BYTES_PER_SECTOR] {
        &mut self.bytes
    }

    /// The trailing `size` bytes; emitting a 2336-byte Mode 2 payload means skipping sync and
    /// header, and a 2048-byte data payload additionally skips the subheader.
    ///
    /// # Panics
    ///
    /// Panics if `size` is larger than a raw sector.
    #[must_use]
    pub fn trailing(&self, size: usize) -> &[u8] {
        &self.bytes[BYTES_PER_SECTOR - size..]
    }
}

impl Default for Sector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_pattern_and_mode() {
        let mut sector = Sector::new();
        sector.init(0, SectorType::Mode2Form2);

        let bytes = sector.as_bytes();
        assert_eq!(bytes[0], 0x00);
        assert_eq!(&bytes[1..11], &[0xFF; 10]);
        assert_eq!(bytes[11], 0x00);
        assert_eq!(&bytes[12..15], &[0x00, 0x02, 0x00]);
        assert_eq!(bytes[15], 0x02);
    }

    #[test]
    fn form_2_subheader_defaults() {
        let mut sector = Sector::new();
        sector.init(10, SectorType::Mode2Form2);

        let subheader = sector.subheader();
        assert_eq!(subheader.submode, submode::DATA | submode::FORM2);
        assert_eq!(subheader.coding, 0);
    }

    #[test]
    fn subheader_is_duplicated() {
        let mut sector = Sector::new();
        sector.init(0, SectorType::Mode2Form1);
        sector.set_subheader(XaSubheader {
            file: 1,
            channel: 0x25,
            submode: submode::AUDIO | submode::REAL_TIME | submode::FORM2,
            coding: coding::STEREO,
        });

        let bytes = sector.as_bytes();
        assert_eq!(&bytes[16..20], &bytes[20..24]);
        // Channel number is masked to 5 bits
        assert_eq!(bytes[17], 0x05);
    }

    #[test]
    fn trailing_slice_skips_sync_and_header() {
        let mut sector = Sector::new();
        sector.init(0, SectorType::Mode2Form2);
        sector.set_subheader(XaSubheader { file: 0x42, ..XaSubheader::default() });

        assert_eq!(sector.trailing(2336)[0], 0x42);
    }
}
