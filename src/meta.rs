//! Persistent staging layout metadata
//!
//! The layout of the doublewrite staging area is recorded inside the
//! system space header page at fixed byte offsets: a magic marker, the
//! first page number of each staging extent, and the legacy space-id
//! migration marker. These offsets must remain stable across versions so
//! that recovery of old data files keeps working.

use crate::error::{Error, PageNo, Result};
use crate::page::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

/// Page number of the system space header page
pub const HEADER_PAGE_NO: PageNo = PageNo(0);

/// Byte offset of the staging layout area within the header page
pub const LAYOUT_OFFSET: usize = 64;

/// Relative offset of the magic field
const FIELD_MAGIC: usize = 0;
/// Relative offset of the extent-1 start page number
const FIELD_BLOCK1: usize = 4;
/// Relative offset of the extent-2 start page number
const FIELD_BLOCK2: usize = 8;
/// Relative offset of the space-id-stored marker
const FIELD_SPACE_ID_STORED: usize = 12;

/// Magic value marking the presence of a doublewrite buffer
pub const MAGIC: u32 = 0x4442_5752; // "DBWR"

/// Marker value meaning staged pages carry per-page space ids
pub const SPACE_ID_STORED: u32 = 0x5349_4453;

const_assert!(LAYOUT_OFFSET + FIELD_SPACE_ID_STORED + 4 <= PAGE_SIZE);

/// On-disk description of the two staging extents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingLayout {
    /// First page number of staging extent 1
    pub block1: PageNo,
    /// First page number of staging extent 2
    pub block2: PageNo,
    /// Whether staged pages carry per-page space ids (false only for
    /// files written by the pre-migration format)
    pub space_ids_stored: bool,
}

impl StagingLayout {
    /// Decode the layout from the header page, if the magic is present
    pub fn read_from(header_page: &[u8]) -> Option<Self> {
        let area = &header_page[LAYOUT_OFFSET..];
        if LittleEndian::read_u32(&area[FIELD_MAGIC..]) != MAGIC {
            return None;
        }
        Some(Self {
            block1: PageNo(LittleEndian::read_u32(&area[FIELD_BLOCK1..])),
            block2: PageNo(LittleEndian::read_u32(&area[FIELD_BLOCK2..])),
            space_ids_stored: LittleEndian::read_u32(&area[FIELD_SPACE_ID_STORED..])
                == SPACE_ID_STORED,
        })
    }

    /// Encode the layout into the header page, including the magic
    pub fn write_to(&self, header_page: &mut [u8]) {
        let area = &mut header_page[LAYOUT_OFFSET..];
        LittleEndian::write_u32(&mut area[FIELD_MAGIC..], MAGIC);
        LittleEndian::write_u32(&mut area[FIELD_BLOCK1..], self.block1.0);
        LittleEndian::write_u32(&mut area[FIELD_BLOCK2..], self.block2.0);
        let marker = if self.space_ids_stored { SPACE_ID_STORED } else { 0 };
        LittleEndian::write_u32(&mut area[FIELD_SPACE_ID_STORED..], marker);
    }

    /// Validate the loaded layout against the configured extent length
    pub fn validate(&self, pages_per_block: u32) -> Result<()> {
        if self.block1 == self.block2 {
            return Err(Error::Corruption {
                details: "staging extents overlap: block1 == block2".into(),
                page_id: None,
            });
        }
        let (lo, hi) = if self.block1 < self.block2 {
            (self.block1, self.block2)
        } else {
            (self.block2, self.block1)
        };
        if hi.0 - lo.0 < pages_per_block {
            return Err(Error::Corruption {
                details: format!(
                    "staging extents overlap: blocks at {} and {} with {} pages each",
                    self.block1, self.block2, pages_per_block
                ),
                page_id: None,
            });
        }
        Ok(())
    }

    /// Whether a system-space page number falls inside either staging extent
    pub fn contains(&self, page_no: PageNo, pages_per_block: u32) -> bool {
        let in_block = |start: PageNo| {
            page_no.0 >= start.0 && page_no.0 < start.0 + pages_per_block
        };
        in_block(self.block1) || in_block(self.block2)
    }
}
