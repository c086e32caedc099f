//! EDC (Error Detection Code) computation
//!
//! Every sector type ends its data area with a 32-bit CRC over a type-specific byte range,
//! using the CD-ROM polynomial 0xD8018001 processed LSB-first. The ECC parity bytes that follow
//! the EDC in Mode 1 and Mode 2 Form 1 sectors are left as zeroes.

use crate::sector::SectorType;
use crate::BYTES_PER_SECTOR;
use crc::Crc;
use std::ops::Range;

const CD_ROM_CRC: Crc<u32> = Crc::<u32>::new(&crc::CRC_32_CD_ROM_EDC);

const MODE_1_DIGEST_RANGE: Range<usize> = 0..2064;
const MODE_1_CHECKSUM_LOCATION: usize = 2064;
const MODE_1_RESERVED_RANGE: Range<usize> = 2068..2076;

const MODE_2_FORM_1_DIGEST_RANGE: Range<usize> = 16..2072;
const MODE_2_FORM_1_CHECKSUM_LOCATION: usize = 2072;

const MODE_2_FORM_2_DIGEST_RANGE: Range<usize> = 16..2348;
const MODE_2_FORM_2_CHECKSUM_LOCATION: usize = 2348;

/// Compute the EDC for a raw 2352-byte sector and store it little-endian at the location
/// appropriate for the sector type.
///
/// # Panics
///
/// Panics if `sector` is shorter than 2352 bytes.
pub fn compute_checksums(sector: &mut [u8], sector_type: SectorType) {
    assert!(sector.len() >= BYTES_PER_SECTOR, "sector buffer must be at least 2352 bytes");

    let (digest_range, checksum_location) = match sector_type {
        SectorType::Mode1 => (MODE_1_DIGEST_RANGE, MODE_1_CHECKSUM_LOCATION),
        SectorType::Mode2Form1 => (MODE_2_FORM_1_DIGEST_RANGE, MODE_2_FORM_1_CHECKSUM_LOCATION),
        SectorType::Mode2Form2 => (MODE_2_FORM_2_DIGEST_RANGE, MODE_2_FORM_2_CHECKSUM_LOCATION),
    };

    let edc = CD_ROM_CRC.checksum(&sector[digest_range]);
    sector[checksum_location..checksum_location + 4].copy_from_slice(&edc.to_le_bytes());

    if sector_type == SectorType::Mode1 {
        sector[MODE_1_RESERVED_RANGE].fill(0);
    }
}
