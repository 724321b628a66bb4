//! Tablespace registry
//!
//! A `Space` is one data file addressed by page number; the
//! `SpaceManager` maps space ids to open spaces. Space 0 is the system
//! space: its header page records the staging layout and it hosts the two
//! staging extents.

use crate::error::{Error, PageId, PageNo, Result, SpaceId};
use crate::io::{FileIo, PageIo};
use crate::page::{PageBuf, PAGE_SIZE};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// The system space id
pub const SYSTEM_SPACE: SpaceId = SpaceId(0);

/// One open data file
pub struct Space {
    id: SpaceId,
    io: Box<dyn PageIo>,
    /// Truncatable spaces (undo-class) may legitimately shrink, so a
    /// staged copy past their current end is not reported as suspicious.
    truncatable: bool,
}

impl Space {
    /// Open or create a space backed by a file, at least one page long
    pub fn open(id: SpaceId, path: impl AsRef<Path>) -> Result<Self> {
        let io = FileIo::open(path)?;
        if io.size_in_pages() == 0 {
            io.grow(1)?;
        }
        Ok(Self { id, io: Box::new(io), truncatable: false })
    }

    /// Open a truncatable space
    pub fn open_truncatable(id: SpaceId, path: impl AsRef<Path>) -> Result<Self> {
        let mut space = Self::open(id, path)?;
        space.truncatable = true;
        Ok(space)
    }

    /// The space id
    pub fn id(&self) -> SpaceId {
        self.id
    }

    /// Whether the space may be truncated in place
    pub fn is_truncatable(&self) -> bool {
        self.truncatable
    }

    /// Current size in pages
    pub fn size_in_pages(&self) -> u64 {
        self.io.size_in_pages()
    }

    /// Read one page
    pub fn read_page(&self, page_no: PageNo) -> Result<PageBuf> {
        let mut page = PageBuf::zeroed();
        self.io.read_pages(page_no, &mut page)?;
        Ok(page)
    }

    /// Read `count` consecutive pages into one buffer
    pub fn read_pages(&self, first: PageNo, count: u32) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; count as usize * PAGE_SIZE];
        self.io.read_pages(first, &mut buf)?;
        Ok(buf)
    }

    /// Write one page
    pub fn write_page(&self, page_no: PageNo, bytes: &[u8]) -> Result<()> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::InvalidParameter("page write must be PAGE_SIZE bytes"));
        }
        self.io.write_pages(page_no, bytes)
    }

    /// Write consecutive pages from one buffer
    pub fn write_pages(&self, first: PageNo, bytes: &[u8]) -> Result<()> {
        self.io.write_pages(first, bytes)
    }

    /// Flush written data to stable storage
    pub fn sync(&self) -> Result<()> {
        self.io.sync()
    }

    /// Extend the space by `pages` pages and return the first new page number
    pub fn allocate_extent(&self, pages: u32) -> Result<PageNo> {
        let first = self.size_in_pages();
        if first + pages as u64 > u32::MAX as u64 {
            return Err(Error::InvalidParameter("space would exceed the page number range"));
        }
        self.io.grow(first + pages as u64)?;
        Ok(PageNo(first as u32))
    }
}

/// Registry of open spaces keyed by space id
pub struct SpaceManager {
    spaces: RwLock<HashMap<SpaceId, Arc<Space>>>,
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceManager {
    /// Create an empty registry
    pub fn new() -> Self {
        Self { spaces: RwLock::new(HashMap::new()) }
    }

    /// Register an open space; replaces any previous entry for the id
    pub fn register(&self, space: Space) -> Arc<Space> {
        let space = Arc::new(space);
        self.spaces.write().insert(space.id(), space.clone());
        space
    }

    /// Look up a space; `None` when it has been dropped or never existed
    pub fn get(&self, id: SpaceId) -> Option<Arc<Space>> {
        self.spaces.read().get(&id).cloned()
    }

    /// The system space
    pub fn system(&self) -> Result<Arc<Space>> {
        self.get(SYSTEM_SPACE).ok_or(Error::SpaceNotFound(SYSTEM_SPACE))
    }

    /// Remove a space from the registry
    pub fn drop_space(&self, id: SpaceId) -> Option<Arc<Space>> {
        self.spaces.write().remove(&id)
    }

    /// Read the page at the given identity
    pub fn read_page(&self, id: PageId) -> Result<PageBuf> {
        let space = self.get(id.space).ok_or(Error::SpaceNotFound(id.space))?;
        space.read_page(id.page_no)
    }

    /// Fsync every registered space
    pub fn flush_all(&self) -> Result<()> {
        let spaces: Vec<Arc<Space>> = self.spaces.read().values().cloned().collect();
        for space in spaces {
            space.sync()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_register_and_lookup() {
        let dir = TempDir::new().unwrap();
        let manager = SpaceManager::new();

        manager.register(Space::open(SYSTEM_SPACE, dir.path().join("system.db")).unwrap());
        manager.register(Space::open(SpaceId(3), dir.path().join("t3.db")).unwrap());

        assert!(manager.system().is_ok());
        assert!(manager.get(SpaceId(3)).is_some());
        assert!(manager.get(SpaceId(9)).is_none());

        manager.drop_space(SpaceId(3));
        assert!(manager.get(SpaceId(3)).is_none());
    }

    #[test]
    fn test_allocate_extent_extends_file() {
        let dir = TempDir::new().unwrap();
        let space = Space::open(SYSTEM_SPACE, dir.path().join("system.db")).unwrap();

        assert_eq!(space.size_in_pages(), 1);
        let first = space.allocate_extent(8).unwrap();
        assert_eq!(first, PageNo(1));
        assert_eq!(space.size_in_pages(), 9);
    }
}
