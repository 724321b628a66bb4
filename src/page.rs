//! Page wire format
//!
//! Pages are the fundamental unit of storage. Every page carries a small
//! fixed-offset header (checksum, page number, space id, page type, LSN)
//! and repeats the low half of the header LSN just before the end of the
//! page. A mismatch between the two LSN copies marks a torn write even
//! before the checksum is consulted.

use crate::error::{Error, Lsn, PageId, PageNo, Result, SpaceId};
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert;

/// Page size in bytes
pub const PAGE_SIZE: usize = 4096;

const_assert!(PAGE_SIZE >= 512);
const_assert!(PAGE_SIZE.is_power_of_two());

/// Byte offset of the CRC32 checksum
pub const OFFSET_CHECKSUM: usize = 0;
/// Byte offset of the page number
pub const OFFSET_PAGE_NO: usize = 4;
/// Byte offset of the space id (excluded from the checksum)
pub const OFFSET_SPACE_ID: usize = 8;
/// Byte offset of the page type
pub const OFFSET_PAGE_TYPE: usize = 12;
/// Byte offset of the 8-byte LSN
pub const OFFSET_LSN: usize = 16;
/// Start of the page payload
pub const HEADER_SIZE: usize = 24;
/// Byte offset of the trailing LSN copy (low 32 bits of the header LSN)
pub const OFFSET_TRAILER_LSN: usize = PAGE_SIZE - 8;

const_assert!(OFFSET_LSN + 8 <= HEADER_SIZE);
const_assert!(OFFSET_TRAILER_LSN + 4 < PAGE_SIZE);

/// Page type discriminants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    /// Freshly allocated, never written with payload
    Allocated,
    /// Ordinary B-tree index page
    Index,
    /// Engine metadata page
    Meta,
    /// Doublewrite staging page (diagnostic marker)
    Staging,
    /// Unrecognized type value
    Unknown(u16),
}

impl PageType {
    /// Decode from the raw on-disk value
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => PageType::Allocated,
            1 => PageType::Index,
            2 => PageType::Meta,
            3 => PageType::Staging,
            other => PageType::Unknown(other),
        }
    }

    /// Encode to the raw on-disk value
    pub fn to_raw(self) -> u16 {
        match self {
            PageType::Allocated => 0,
            PageType::Index => 1,
            PageType::Meta => 2,
            PageType::Staging => 3,
            PageType::Unknown(other) => other,
        }
    }
}

/// Read the page number field
pub fn page_no(bytes: &[u8]) -> PageNo {
    PageNo(LittleEndian::read_u32(&bytes[OFFSET_PAGE_NO..]))
}

/// Read the space id field
pub fn space_id(bytes: &[u8]) -> SpaceId {
    SpaceId(LittleEndian::read_u32(&bytes[OFFSET_SPACE_ID..]))
}

/// Read the full page identity
pub fn page_id(bytes: &[u8]) -> PageId {
    PageId::new(space_id(bytes), page_no(bytes))
}

/// Read the page type field
pub fn page_type(bytes: &[u8]) -> PageType {
    PageType::from_raw(LittleEndian::read_u16(&bytes[OFFSET_PAGE_TYPE..]))
}

/// Read the header LSN
pub fn lsn(bytes: &[u8]) -> Lsn {
    LittleEndian::read_u64(&bytes[OFFSET_LSN..])
}

/// Read the trailing LSN copy
pub fn trailer_lsn(bytes: &[u8]) -> u32 {
    LittleEndian::read_u32(&bytes[OFFSET_TRAILER_LSN..])
}

/// Write the page number field
pub fn set_page_no(bytes: &mut [u8], page_no: PageNo) {
    LittleEndian::write_u32(&mut bytes[OFFSET_PAGE_NO..], page_no.0);
}

/// Write the space id field
pub fn set_space_id(bytes: &mut [u8], space: SpaceId) {
    LittleEndian::write_u32(&mut bytes[OFFSET_SPACE_ID..], space.0);
}

/// Write the page type field
pub fn set_page_type(bytes: &mut [u8], page_type: PageType) {
    LittleEndian::write_u16(&mut bytes[OFFSET_PAGE_TYPE..], page_type.to_raw());
}

/// Write the LSN to the header and its low half to the trailer
pub fn set_lsn(bytes: &mut [u8], lsn: Lsn) {
    LittleEndian::write_u64(&mut bytes[OFFSET_LSN..], lsn);
    LittleEndian::write_u32(&mut bytes[OFFSET_TRAILER_LSN..], lsn as u32);
}

/// Whether every byte of the page is zero
pub fn is_all_zero(bytes: &[u8]) -> bool {
    bytes.iter().all(|&b| b == 0)
}

/// Check the invariants a page must satisfy before it may be written to
/// its real location: a recognized page type and agreeing LSN copies.
/// Writing a page that fails this check would put known-bad bytes on disk.
pub fn verify_write_sanity(bytes: &[u8], id: PageId) -> Result<()> {
    match page_type(bytes) {
        PageType::Unknown(raw) => {
            return Err(Error::Corruption {
                details: format!("page has unrecognized type value {}", raw),
                page_id: Some(id),
            });
        }
        PageType::Allocated
        | PageType::Index
        | PageType::Meta
        | PageType::Staging => {}
    }

    let head = lsn(bytes) as u32;
    let tail = trailer_lsn(bytes);
    if head != tail {
        return Err(Error::Corruption {
            details: format!(
                "LSN copies disagree: header 0x{:08x}, trailer 0x{:08x}",
                head, tail
            ),
            page_id: Some(id),
        });
    }

    Ok(())
}

/// An owned page-sized buffer
pub struct PageBuf {
    bytes: Box<[u8]>,
}

impl PageBuf {
    /// Create a zeroed page
    pub fn zeroed() -> Self {
        Self { bytes: vec![0u8; PAGE_SIZE].into_boxed_slice() }
    }

    /// Create a page initialized with identity, type and LSN
    pub fn init(id: PageId, page_type: PageType, lsn: Lsn) -> Self {
        let mut page = Self::zeroed();
        set_page_no(&mut page.bytes, id.page_no);
        set_space_id(&mut page.bytes, id.space);
        set_page_type(&mut page.bytes, page_type);
        set_lsn(&mut page.bytes, lsn);
        page
    }

    /// Create from raw bytes; must be exactly one page long
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::InvalidParameter("page buffer must be PAGE_SIZE bytes"));
        }
        Ok(Self { bytes: bytes.to_vec().into_boxed_slice() })
    }
}

impl std::ops::Deref for PageBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes
    }
}

impl std::ops::DerefMut for PageBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl AsRef<[u8]> for PageBuf {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}
