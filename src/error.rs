//! Error types for the doublewrite subsystem

use std::borrow::Cow;
use std::fmt;
use std::io;
use thiserror::Error;

/// The main error type for doublewrite operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// I/O error occurred
    #[error("I/O error: {0}")]
    Io(String),

    /// The system space cannot host the staging extents
    #[error(
        "Cannot create doublewrite buffer: the system space needs {required_pages} pages \
         but is limited to {available_pages}"
    )]
    Capacity {
        /// Pages the staging area needs (header page plus both extents)
        required_pages: u64,
        /// Pages the system space may grow to
        available_pages: u64,
    },

    /// Page corruption detected
    #[error("Corruption detected: {details}")]
    Corruption {
        /// Description of the corruption
        details: String,
        /// Page where corruption was detected
        page_id: Option<PageId>,
    },

    /// Tablespace is not registered
    #[error("Space {0} not found")]
    SpaceNotFound(SpaceId),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// Custom error
    #[error("{0}")]
    Custom(Cow<'static, str>),
}

/// Tablespace identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpaceId(pub u32);

impl fmt::Display for SpaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Page number within a tablespace
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageNo(pub u32);

impl fmt::Display for PageNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Full page identity: tablespace plus page number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageId {
    /// Tablespace the page belongs to
    pub space: SpaceId,
    /// Page number within the space
    pub page_no: PageNo,
}

impl PageId {
    /// Create a page identity
    pub const fn new(space: SpaceId, page_no: PageNo) -> Self {
        Self { space, page_no }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[space {}, page {}]", self.space, self.page_no)
    }
}

/// Log sequence number of a page's most recent modification
pub type Lsn = u64;

/// Result type alias for doublewrite operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err.to_string())
    }
}
