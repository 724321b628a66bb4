//! Torn-page protection for page-based storage engines
//!
//! This crate implements a doublewrite buffer: a fixed-size, pre-allocated
//! staging area inside the system space that makes page writes atomic with
//! respect to crash recovery. Every page is written twice: first
//! contiguously into one of two staging extents, which are fsynced, and
//! only then to its real location. If the process crashes while a real
//! location write is in flight, startup recovery finds an intact copy in
//! the staging extents and repairs the torn page.

#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod error;
pub mod page;
pub mod checksum;
pub mod meta;
pub mod io;
pub mod space;
pub mod dispatch;
pub mod dblwr;
pub mod recovery;

// Re-exports
pub use dblwr::{Config, DoublewriteBuffer, DEFAULT_PAGES_PER_BLOCK};
pub use error::{Error, Lsn, PageId, PageNo, Result, SpaceId};
pub use page::PAGE_SIZE;
pub use recovery::{init_or_load_pages, process, CandidateSet, LogScanState};
pub use space::{Space, SpaceManager, SYSTEM_SPACE};

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
