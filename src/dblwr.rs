//! Doublewrite buffer manager
//!
//! Pages on their way to disk are first accumulated in an in-memory
//! staging buffer sized for two extents of `pages_per_block` pages. A
//! flush writes the whole buffer contiguously to the two staging extents
//! in the system space, fsyncs them, and only then scatter-writes every
//! page to its real location. If the process dies mid-scatter, recovery
//! finds an intact copy of each page in the staging extents.
//!
//! One mutex guards the whole batch state; a condvar wakes threads that
//! blocked because a batch was in flight or the buffer was full. At most
//! one batch is ever in flight.

use crate::dispatch::ScatterPool;
use crate::error::{Error, PageId, PageNo, Result};
use crate::meta::{StagingLayout, HEADER_PAGE_NO};
use crate::page::{self, PageBuf, PageType, PAGE_SIZE};
use crate::space::{SpaceManager, SYSTEM_SPACE};
use crate::checksum;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Default number of pages per staging extent
pub const DEFAULT_PAGES_PER_BLOCK: u32 = 120;

/// Doublewrite configuration
#[derive(Debug, Clone)]
pub struct Config {
    pages_per_block: u32,
    enabled: bool,
    scatter_workers: usize,
    max_system_pages: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pages_per_block: DEFAULT_PAGES_PER_BLOCK,
            enabled: true,
            scatter_workers: num_cpus::get().min(8),
            max_system_pages: 1 << 20,
        }
    }
}

impl Config {
    /// Create a configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of pages in each of the two staging extents
    pub fn pages_per_block(mut self, pages: u32) -> Self {
        self.pages_per_block = pages;
        self
    }

    /// Disable doublewrite protection (writes bypass the staging area)
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Number of scatter-write worker threads; zero runs writes inline
    pub fn scatter_workers(mut self, workers: usize) -> Self {
        self.scatter_workers = workers;
        self
    }

    /// Upper bound on the system space size, in pages
    pub fn max_system_pages(mut self, pages: u64) -> Self {
        self.max_system_pages = pages;
        self
    }

    pub(crate) fn block_pages(&self) -> u32 {
        self.pages_per_block
    }

    fn capacity(&self) -> usize {
        2 * self.pages_per_block as usize
    }
}

/// One staged page awaiting its scatter write
#[derive(Debug, Clone, Copy)]
struct Slot {
    page_id: PageId,
    from_lru: bool,
}

/// Batch state, all behind one mutex
struct BufferState {
    /// Write-combining buffer, `2 * pages_per_block` pages
    staging: Vec<u8>,
    /// Slot table; `slots.len()` is the write cursor (`first_free`)
    slots: Vec<Slot>,
    /// Pages of the current batch not yet confirmed scatter-written
    reserved: usize,
    /// True from flush commit until the last completion resets the batch
    batch_running: bool,
    /// First asynchronous failure, surfaced by `wait_idle`
    failed: Option<Error>,
}

struct Core {
    config: Config,
    /// `None` when doublewrite is disabled: no staging area exists
    layout: Option<StagingLayout>,
    spaces: Arc<SpaceManager>,
    state: Mutex<BufferState>,
    batch_done: Condvar,
    pages_written: AtomicU64,
    pages_from_lru: AtomicU64,
    batches: AtomicU64,
}

impl Core {
    /// Write one staged page to its real location. A missing space means
    /// it was dropped while the batch was in flight; the write is moot.
    fn scatter_write(&self, id: PageId, bytes: &[u8]) -> Result<()> {
        match self.spaces.get(id.space) {
            Some(space) => space.write_page(id.page_no, bytes),
            None => {
                debug!(%id, "space dropped while batch was in flight, skipping write");
                Ok(())
            }
        }
    }

    /// Record one scatter-write completion. The final completion fsyncs
    /// every data file, then resets the batch and wakes all waiters in a
    /// single critical section, so no waiter can observe a cleared
    /// `batch_running` with a stale slot table.
    fn write_completed(&self, id: PageId, result: Result<()>) {
        if let Err(e) = result {
            error!(%id, error = %e, "scatter write failed");
            let mut state = self.state.lock();
            state.failed.get_or_insert(e);
        }

        let mut state = self.state.lock();
        debug_assert!(state.batch_running);
        debug_assert!(state.reserved > 0);
        debug_assert!(state.reserved <= state.slots.len());

        state.reserved -= 1;
        if state.reserved > 0 {
            return;
        }
        drop(state);

        // Last page of the batch: make every scattered write durable.
        let flushed = self.spaces.flush_all();

        let mut state = self.state.lock();
        if let Err(e) = flushed {
            error!(error = %e, "fsync after batch completion failed");
            state.failed.get_or_insert(e);
        }
        state.slots.clear();
        state.batch_running = false;
        self.batch_done.notify_all();
    }
}

/// The doublewrite buffer
pub struct DoublewriteBuffer {
    core: Arc<Core>,
    pool: ScatterPool,
}

impl DoublewriteBuffer {
    /// Create the staging area if absent, or load the existing layout.
    /// Idempotent. Fails with [`Error::Capacity`] when the system space
    /// cannot host both extents within its configured size limit; that is
    /// startup-fatal and must not be retried.
    pub fn create(spaces: Arc<SpaceManager>, config: Config) -> Result<Self> {
        if config.pages_per_block == 0 {
            return Err(Error::InvalidParameter("pages_per_block must be nonzero"));
        }

        let layout = if config.enabled {
            let sys = spaces.system()?;
            let mut header = sys.read_page(HEADER_PAGE_NO)?;

            Some(match StagingLayout::read_from(&header) {
                Some(layout) => {
                    layout.validate(config.pages_per_block)?;
                    info!(
                        block1 = layout.block1.0,
                        block2 = layout.block2.0,
                        "doublewrite buffer loaded"
                    );
                    layout
                }
                None => {
                    let n = config.pages_per_block;
                    let required = sys.size_in_pages() + 2 * n as u64;
                    if required > config.max_system_pages {
                        return Err(Error::Capacity {
                            required_pages: required,
                            available_pages: config.max_system_pages,
                        });
                    }

                    info!("doublewrite buffer not found: creating new");
                    let block1 = Self::build_extent(&spaces, n)?;
                    let block2 = Self::build_extent(&spaces, n)?;

                    let layout = StagingLayout { block1, block2, space_ids_stored: true };
                    layout.write_to(&mut header);
                    sys.write_page(HEADER_PAGE_NO, &header)?;
                    sys.sync()?;

                    info!(block1 = block1.0, block2 = block2.0, "doublewrite buffer created");
                    layout
                }
            })
        } else {
            // Protection is off: the staging area is never allocated.
            None
        };

        let staging = if config.enabled {
            vec![0u8; config.capacity() * PAGE_SIZE]
        } else {
            Vec::new()
        };
        let state = BufferState {
            staging,
            slots: Vec::with_capacity(config.capacity()),
            reserved: 0,
            batch_running: false,
            failed: None,
        };

        let pool = ScatterPool::new(if config.enabled { config.scatter_workers } else { 0 });
        let core = Arc::new(Core {
            config,
            layout,
            spaces,
            state: Mutex::new(state),
            batch_done: Condvar::new(),
            pages_written: AtomicU64::new(0),
            pages_from_lru: AtomicU64::new(0),
            batches: AtomicU64::new(0),
        });

        Ok(Self { core, pool })
    }

    /// Allocate one staging extent at the end of the system space and
    /// write a recognizable marker into every page, so staging pages are
    /// never mistaken for application data when inspected.
    fn build_extent(spaces: &SpaceManager, pages: u32) -> Result<PageNo> {
        let sys = spaces.system()?;
        let first = sys.allocate_extent(pages)?;

        let mut buf = vec![0u8; pages as usize * PAGE_SIZE];
        for i in 0..pages {
            let id = PageId::new(SYSTEM_SPACE, PageNo(first.0 + i));
            let marker = &mut buf[i as usize * PAGE_SIZE..(i as usize + 1) * PAGE_SIZE];
            page::set_page_no(marker, id.page_no);
            page::set_space_id(marker, id.space);
            page::set_page_type(marker, PageType::Staging);
            page::set_lsn(marker, 0);
            checksum::update(marker);
        }
        sys.write_pages(first, &buf)?;
        Ok(first)
    }

    /// Configured extent length
    pub fn pages_per_block(&self) -> u32 {
        self.core.config.pages_per_block
    }

    /// Whether a system-space page number lies inside a staging extent.
    /// The page cache uses this to avoid treating staging pages as
    /// ordinary data.
    pub fn page_inside(&self, page_no: PageNo) -> bool {
        match &self.core.layout {
            Some(layout) => layout.contains(page_no, self.core.config.pages_per_block),
            None => false,
        }
    }

    /// Stage a page for writing. Blocks while a batch is in flight. The
    /// call that fills the last free slot flushes the batch synchronously
    /// before returning, so a full buffer never sits waiting for a later
    /// trigger. On return the page's bytes at the moment of the call will
    /// be durably recoverable once the batch is flushed.
    pub fn add_to_batch(&self, id: PageId, bytes: &[u8], from_lru: bool) -> Result<()> {
        if bytes.len() != PAGE_SIZE {
            return Err(Error::InvalidParameter("staged page must be PAGE_SIZE bytes"));
        }

        if !self.core.config.enabled {
            // Protection is off: write straight to the real location.
            return self.core.scatter_write(id, bytes);
        }

        let capacity = self.core.config.capacity();
        loop {
            let staged = {
                let mut state = self.core.state.lock();
                while state.batch_running {
                    self.core.batch_done.wait(&mut state);
                }

                let index = state.slots.len();
                if index < capacity {
                    let dst = &mut state.staging[index * PAGE_SIZE..(index + 1) * PAGE_SIZE];
                    dst.copy_from_slice(bytes);
                    state.slots.push(Slot { page_id: id, from_lru });
                    state.reserved += 1;
                    debug_assert_eq!(state.reserved, state.slots.len());
                    Some(index + 1 == capacity)
                } else {
                    // Another thread filled the buffer first.
                    None
                }
            };
            match staged {
                // This call used the last slot: start the flush now.
                Some(true) => return self.flush_buffered_writes(),
                Some(false) => return Ok(()),
                // Buffer full: make room and retry.
                None => self.flush_buffered_writes()?,
            }
        }
    }

    /// Flush all buffered writes: stage the batch to the extents, fsync
    /// them, then dispatch the scatter writes. Completion of the scatter
    /// writes is asynchronous; use [`wait_idle`](Self::wait_idle) to
    /// drain. With doublewrite disabled this degenerates to an fsync of
    /// all data files.
    pub fn flush_buffered_writes(&self) -> Result<()> {
        if !self.core.config.enabled {
            return self.core.spaces.flush_all();
        }

        let (staged, slots) = {
            let mut state = self.core.state.lock();
            loop {
                if !state.batch_running && state.slots.is_empty() {
                    return Ok(());
                }
                if state.batch_running {
                    // Another thread owns the batch; wait for it and
                    // re-check, the buffer may be empty by then.
                    self.core.batch_done.wait(&mut state);
                    continue;
                }
                break;
            }

            debug_assert_eq!(state.reserved, state.slots.len());
            state.batch_running = true;

            let first_free = state.slots.len();
            let staged = state.staging[..first_free * PAGE_SIZE].to_vec();
            let slots = state.slots.clone();
            (staged, slots)
            // The snapshot is immutable from here: no add_to_batch can
            // proceed while batch_running is set.
        };

        if let Err(e) = self.stage_batch(&staged, &slots) {
            let mut state = self.core.state.lock();
            state.batch_running = false;
            self.core.batch_done.notify_all();
            return Err(e);
        }

        self.core.batches.fetch_add(1, Ordering::Relaxed);
        self.core.pages_written.fetch_add(slots.len() as u64, Ordering::Relaxed);
        let from_lru = slots.iter().filter(|s| s.from_lru).count() as u64;
        self.core.pages_from_lru.fetch_add(from_lru, Ordering::Relaxed);

        for (i, slot) in slots.iter().enumerate() {
            let core = Arc::clone(&self.core);
            let id = slot.page_id;
            let bytes: Box<[u8]> = staged[i * PAGE_SIZE..(i + 1) * PAGE_SIZE].into();
            self.pool.execute(move || {
                let result = core.scatter_write(id, &bytes);
                core.write_completed(id, result);
            });
        }

        Ok(())
    }

    /// Validate the snapshot and write it durably to the staging extents.
    /// Runs before any scatter write is dispatched; this ordering is the
    /// whole torn-page recovery argument.
    fn stage_batch(&self, staged: &[u8], slots: &[Slot]) -> Result<()> {
        for (i, slot) in slots.iter().enumerate() {
            let bytes = &staged[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            if let Err(e) = page::verify_write_sanity(bytes, slot.page_id) {
                // A page about to be flushed is corrupt in memory. The
                // caller must treat this as fatal; writing it out would
                // make the corruption durable.
                error!(id = %slot.page_id, error = %e, "corrupt page in flush batch");
                return Err(e);
            }
        }

        let Some(layout) = &self.core.layout else {
            return Err(Error::Custom("doublewrite staging area was never allocated".into()));
        };

        let sys = self.core.spaces.system()?;
        let n = self.core.config.pages_per_block as usize;
        let first_free = slots.len();

        let block1_len = first_free.min(n);
        sys.write_pages(layout.block1, &staged[..block1_len * PAGE_SIZE])?;
        if first_free > n {
            sys.write_pages(layout.block2, &staged[n * PAGE_SIZE..])?;
        }

        // Durable copies first; only then may real locations be touched.
        sys.sync()?;

        debug!(pages = first_free, "batch staged to the doublewrite area");
        Ok(())
    }

    /// Record one scatter-write completion reported by an external I/O
    /// layer. Must be invoked exactly once per dispatched page. The
    /// built-in worker pool reports its own completions; only callers
    /// that take over scatter I/O need this.
    pub fn write_completed(&self, id: PageId) {
        self.core.write_completed(id, Ok(()));
    }

    /// Flush any buffered pages and block until every scatter write of
    /// the final batch has completed and been fsynced. Surfaces the
    /// first asynchronous I/O failure, if any.
    pub fn wait_idle(&self) -> Result<()> {
        loop {
            self.flush_buffered_writes()?;

            let mut state = self.core.state.lock();
            while state.batch_running {
                self.core.batch_done.wait(&mut state);
            }
            if state.slots.is_empty() {
                debug_assert_eq!(state.reserved, 0);
                return match state.failed.take() {
                    Some(e) => Err(e),
                    None => Ok(()),
                };
            }
            // New pages arrived while we waited; flush again.
        }
    }

    /// Total pages written through the buffer
    pub fn pages_written(&self) -> u64 {
        self.core.pages_written.load(Ordering::Relaxed)
    }

    /// Pages written through the buffer on behalf of LRU eviction, as
    /// opposed to flush-list writes
    pub fn pages_from_lru(&self) -> u64 {
        self.core.pages_from_lru.load(Ordering::Relaxed)
    }

    /// Total batches flushed
    pub fn batches(&self) -> u64 {
        self.core.batches.load(Ordering::Relaxed)
    }

    /// Drain outstanding writes and release the worker pool. Logs a
    /// warning if pages could not be drained cleanly.
    pub fn close(self) -> Result<()> {
        let result = self.wait_idle();
        if let Err(ref e) = result {
            warn!(error = %e, "doublewrite buffer closed with a pending failure");
        }
        result
    }
}
