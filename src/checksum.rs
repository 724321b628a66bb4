//! Page checksum validation for data integrity
//!
//! CRC32 over the page contents, stored in the first header field. The
//! space id field and the 8-byte tail area are excluded: the space id may
//! be rewritten in place during the one-time format migration without
//! recomputing checksums, and the trailing LSN copy is its own detector.

use crate::error::{Error, PageId, Result};
use crate::page::{
    self, OFFSET_PAGE_NO, OFFSET_PAGE_TYPE, OFFSET_SPACE_ID, OFFSET_TRAILER_LSN, PAGE_SIZE,
};
use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

/// Checksum type (CRC32)
pub type Checksum = u32;

/// Calculate the checksum of a page
pub fn calculate(bytes: &[u8]) -> Checksum {
    let mut hasher = Hasher::new();
    hasher.update(&bytes[OFFSET_PAGE_NO..OFFSET_SPACE_ID]);
    hasher.update(&bytes[OFFSET_PAGE_TYPE..OFFSET_TRAILER_LSN]);
    hasher.finalize()
}

/// Read the stored checksum
pub fn stored(bytes: &[u8]) -> Checksum {
    LittleEndian::read_u32(&bytes[page::OFFSET_CHECKSUM..])
}

/// Recompute and store the checksum
pub fn update(bytes: &mut [u8]) {
    let sum = calculate(bytes);
    LittleEndian::write_u32(&mut bytes[page::OFFSET_CHECKSUM..], sum);
}

/// Validate a page read from disk against the identity it was read from.
///
/// A page is valid when its stored checksum matches the recomputed one,
/// its two LSN copies agree, and its page number field matches the
/// location it was read from.
pub fn validate(bytes: &[u8], expected: PageId) -> Result<()> {
    debug_assert_eq!(bytes.len(), PAGE_SIZE);

    let expected_sum = stored(bytes);
    let actual_sum = calculate(bytes);
    if expected_sum != actual_sum {
        return Err(Error::Corruption {
            details: format!(
                "Checksum mismatch: expected 0x{:08x}, got 0x{:08x}",
                expected_sum, actual_sum
            ),
            page_id: Some(expected),
        });
    }

    let head = page::lsn(bytes) as u32;
    let tail = page::trailer_lsn(bytes);
    if head != tail {
        return Err(Error::Corruption {
            details: format!(
                "LSN copies disagree: header 0x{:08x}, trailer 0x{:08x}",
                head, tail
            ),
            page_id: Some(expected),
        });
    }

    let no = page::page_no(bytes);
    if no != expected.page_no {
        return Err(Error::Corruption {
            details: format!("page number field {} does not match location", no),
            page_id: Some(expected),
        });
    }

    Ok(())
}

/// Whether a page read from disk is intact at the given identity
pub fn is_valid(bytes: &[u8], expected: PageId) -> bool {
    validate(bytes, expected).is_ok()
}
