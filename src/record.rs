// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Checksummed records stored through a `PageCache`.
//!
//! Raw cached flash has no framing at all: whatever bytes are at an address
//! are the data. Configuration and calibration blocks usually want more than
//! that, so a record puts a small header in front of its payload:
//!
//! ```text
//! +-------+------+-----+--------+-------+----------------------+
//! | magic | kind | pad | length | crc32 | payload (length B)   |
//! |  u16  |  u8  | u8  |  u16   |  u32  |                      |
//! +-------+------+-----+--------+-------+----------------------+
//! ```
//!
//! All multi-byte fields are little-endian. The CRC covers the header fields
//! before it and the payload.

use core::mem::size_of;
use num_traits::FromPrimitive;
use zerocopy::{AsBytes, FromBytes, Unaligned};
use crate::PageCache;
use crate::low_level::{self, AccessError, Flash};

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Header written at the start of every record.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned)]
#[repr(C)]
pub struct RecordHeader {
    /// Magic number (`EXPECTED_MAGIC`) distinguishing this from arbitrary
    /// data.
    pub magic: U16LE,
    /// What the payload holds. See `RecordKind`.
    pub kind: u8,
    /// Reserved, must be zero.
    pub pad: u8,
    /// Payload length in bytes.
    pub length: U16LE,
    /// CRC32 of the fields above followed by the payload.
    pub crc: U32LE,
}

impl RecordHeader {
    /// Bits we expect to find in the `magic` field.
    pub const EXPECTED_MAGIC: u16 = 0x4E_56;
    /// Size of the header, in bytes.
    pub const SIZE: usize = size_of::<Self>();

    /// Builds the header for `payload`, computing its CRC. The caller must
    /// ensure the payload length fits in a `u16`.
    fn new(kind: RecordKind, length: u16, payload: &[u8]) -> Self {
        let mut header = Self {
            magic: Self::EXPECTED_MAGIC.into(),
            kind: kind as u8,
            pad: 0,
            length: length.into(),
            crc: 0.into(),
        };
        header.crc = header.expected_crc(payload).into();
        header
    }

    /// Compute the _expected_ CRC given the other header fields and the
    /// payload.
    pub fn expected_crc(&self, payload: &[u8]) -> u32 {
        let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
        let mut digest = algo.digest();
        digest.update(self.magic.as_bytes());
        digest.update(self.kind.as_bytes());
        digest.update(self.pad.as_bytes());
        digest.update(self.length.as_bytes());
        digest.update(payload);

        digest.finalize()
    }
}

/// Defined values for the `RecordHeader::kind` field.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordKind {
    // Note: 0 is reserved.

    /// User-adjustable settings.
    Settings = 0x01,
    /// Factory or field calibration constants.
    Calibration = 0x02,

    // Note: 0xFF is reserved, since that's what erased flash reads as.
}

/// Result of successfully loading a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RecordInfo {
    pub kind: RecordKind,
    /// Number of payload bytes copied out.
    pub length: u16,
}

/// Things that can go wrong storing or loading a record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RecordError<E> {
    /// The header reads as erased flash; nothing was ever stored here.
    Erased,
    /// Magic number (given) was wrong.
    BadMagic(u16),
    /// Kind byte (given) is not a known `RecordKind`.
    UnknownKind(u8),
    /// The output buffer is too small for the stored payload (given length).
    BufferTooSmall(u16),
    /// The checksum did not match the stored data.
    BadCrc,
    /// The payload is too long to describe in the header.
    TooLong,
    /// The record would extend into a protected page, starting at the given
    /// address.
    Protected(u32),
    /// Moving bytes through the cache failed.
    Access(AccessError<E>),
}

impl<E> From<AccessError<E>> for RecordError<E> {
    fn from(e: AccessError<E>) -> Self {
        Self::Access(e)
    }
}

/// Writes a record holding `payload` at `addr` through `cache`.
///
/// This only updates the cache. The record is not durable until the cache is
/// flushed, which will happen by itself once an access moves to another page.
pub fn store<F: Flash>(
    cache: &mut PageCache<'_, F>,
    addr: u32,
    kind: RecordKind,
    payload: &[u8],
) -> Result<(), RecordError<F::Error>> {
    let length = u16::try_from(payload.len())
        .map_err(|_| RecordError::TooLong)?;
    let total = RecordHeader::SIZE + payload.len();
    if !low_level::is_writable_range::<F>(addr, total) {
        return Err(RecordError::Protected(addr));
    }

    let header = RecordHeader::new(kind, length, payload);
    cache.write_block(addr, header.as_bytes())?;
    cache.write_block(addr + RecordHeader::SIZE as u32, payload)?;
    Ok(())
}

/// Reads the record at `addr` through `cache`, copying its payload into the
/// front of `out`.
pub fn load<F: Flash>(
    cache: &PageCache<'_, F>,
    addr: u32,
    out: &mut [u8],
) -> Result<RecordInfo, RecordError<F::Error>> {
    let mut raw = [0u8; RecordHeader::SIZE];
    cache.read_block(addr, &mut raw)?;
    if raw.iter().all(|&b| b == 0xFF) {
        return Err(RecordError::Erased);
    }

    let header = cast_header(&raw);
    if header.magic.get() != RecordHeader::EXPECTED_MAGIC {
        return Err(RecordError::BadMagic(header.magic.get()));
    }
    let kind = RecordKind::from_u8(header.kind)
        .ok_or(RecordError::UnknownKind(header.kind))?;
    let length = header.length.get();
    let payload = out.get_mut(..usize::from(length))
        .ok_or(RecordError::BufferTooSmall(length))?;

    let payload_addr = addr.checked_add(RecordHeader::SIZE as u32)
        .ok_or(RecordError::Access(AccessError::OutOfBounds))?;
    cache.read_block(payload_addr, payload)?;
    if header.crc.get() != header.expected_crc(payload) {
        return Err(RecordError::BadCrc);
    }

    Ok(RecordInfo { kind, length })
}

fn cast_header(bytes: &[u8; RecordHeader::SIZE]) -> RecordHeader {
    let lv = zerocopy::LayoutVerified::<_, RecordHeader>::new_unaligned(&bytes[..])
        .expect("buffer is exactly one header");
    *lv
}
