//! Code for building CD-ROM sectors
//!
//! This crate produces the raw 2352-byte sectors that make up a CD-ROM track: the sync pattern,
//! the BCD timecode header, the CD-XA subheader for Mode 2 sectors, and the EDC checksum. ECC
//! parity bytes are *not* computed; a disc image builder is expected to regenerate them.

pub mod edc;
pub mod sector;
pub mod time;

pub use sector::{Sector, SectorType, XaSubheader};

/// Size of a raw sector including sync and header.
pub const BYTES_PER_SECTOR: usize = 2352;

/// Size of a Mode 2 sector without sync and header (subheader + data + EDC).
pub const MODE_2_PAYLOAD_LEN: usize = 2336;

/// Size of the user data area of a Mode 2 Form 1 sector.
pub const FORM_1_DATA_LEN: usize = 2048;

pub const SYNC_AND_HEADER_LEN: usize = 16;
pub const SUBHEADER_OFFSET: usize = 16;
pub const MODE_2_DATA_OFFSET: usize = 24;
