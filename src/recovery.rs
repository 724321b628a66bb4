//! Startup recovery from the staging extents
//!
//! Before redo processing begins, [`init_or_load_pages`] reads both
//! staging extents and collects every page that carries a nonzero LSN as
//! a recovery candidate. After the redo scan has established its start
//! and end points, [`process`] compares each candidate against the real
//! page at its intended location and rewrites pages that are torn or
//! zeroed, using the best staged copy available.

use crate::checksum;
use crate::dblwr::Config;
use crate::error::{Lsn, PageId, PageNo, Result, SpaceId};
use crate::meta::{StagingLayout, HEADER_PAGE_NO};
use crate::page::{self, PAGE_SIZE};
use crate::space::SpaceManager;
use tracing::{debug, error, info, warn};

/// Bounds of the redo log scan, supplied by the recovery driver
#[derive(Debug, Clone, Copy)]
pub struct LogScanState {
    /// LSN recovery starts from; staged copies older than this cannot help
    pub start_lsn: Lsn,
    /// LSN the log was scanned up to; staged copies beyond it are ignored
    pub scanned_lsn: Lsn,
}

/// One raw page copy read from a staging extent
pub struct Candidate {
    bytes: Box<[u8]>,
    /// Index of the staging slot the copy was read from
    slot: usize,
}

impl Candidate {
    /// Embedded page identity
    pub fn page_id(&self) -> PageId {
        page::page_id(&self.bytes)
    }

    /// Embedded LSN
    pub fn lsn(&self) -> Lsn {
        page::lsn(&self.bytes)
    }

    /// The raw page copy
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

/// Ordered collection of staged page copies found at startup
#[derive(Default)]
pub struct CandidateSet {
    pages: Vec<Candidate>,
}

impl CandidateSet {
    /// Number of candidates
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Iterate candidates in load order
    pub fn iter(&self) -> impl Iterator<Item = &Candidate> {
        self.pages.iter()
    }

    fn push(&mut self, bytes: &[u8], slot: usize) {
        self.pages.push(Candidate { bytes: bytes.to_vec().into_boxed_slice(), slot });
    }

    /// The best copy for a page identity: highest LSN not beyond the
    /// scanned point, among copies that pass validation. Duplicates are
    /// expected; a later batch may have staged the same page again.
    pub fn find_best(&self, id: PageId, scanned_lsn: Lsn) -> Option<&Candidate> {
        self.pages
            .iter()
            .filter(|c| c.page_id() == id)
            .filter(|c| c.lsn() <= scanned_lsn)
            .filter(|c| checksum::is_valid(&c.bytes, id))
            .max_by_key(|c| c.lsn())
    }

    /// Drop all candidates
    pub fn clear(&mut self) {
        self.pages.clear();
    }
}

/// Read the staging extents at startup and build the candidate set.
///
/// Returns an empty set when no doublewrite buffer was ever created for
/// this instance. A failure to read either extent aborts recovery;
/// partial candidate sets are never used. When the on-disk format
/// predates per-page space ids, every staged page's space-id field is
/// rewritten to zero in place as a one-time migration and no candidates
/// are collected on that run.
pub fn init_or_load_pages(spaces: &SpaceManager, config: &Config) -> Result<CandidateSet> {
    let sys = spaces.system()?;
    let header = sys.read_page(HEADER_PAGE_NO)?;

    let layout = match StagingLayout::read_from(&header) {
        Some(layout) => layout,
        None => {
            debug!("no doublewrite buffer in the system space header");
            return Ok(CandidateSet::default());
        }
    };
    let n = config.block_pages();
    layout.validate(n)?;

    let mut staged = sys.read_pages(layout.block1, n).map_err(|e| {
        error!(error = %e, "failed to read the first staging extent");
        e
    })?;
    staged.extend_from_slice(&sys.read_pages(layout.block2, n).map_err(|e| {
        error!(error = %e, "failed to read the second staging extent");
        e
    })?);

    if !layout.space_ids_stored {
        // One-time migration from the format without per-page space ids.
        // The field does not participate in the checksum, so the pages
        // are rewritten as they are.
        info!("resetting space ids in the doublewrite buffer");
        for i in 0..2 * n as usize {
            let bytes = &mut staged[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
            page::set_space_id(bytes, SpaceId(0));
            let source = if i < n as usize {
                PageNo(layout.block1.0 + i as u32)
            } else {
                PageNo(layout.block2.0 + (i as u32 - n))
            };
            sys.write_page(source, bytes)?;
        }
        sys.sync()?;
        return Ok(CandidateSet::default());
    }

    let mut set = CandidateSet::default();
    for i in 0..2 * n as usize {
        let bytes = &staged[i * PAGE_SIZE..(i + 1) * PAGE_SIZE];
        // Every page that was ever staged carries a nonzero LSN; the
        // untouched marker pages do not.
        if page::lsn(bytes) != 0 {
            set.push(bytes, i);
        }
    }

    info!(candidates = set.len(), "loaded doublewrite recovery candidates");
    Ok(set)
}

/// Repair torn or zeroed data-file pages from the candidate set.
///
/// Runs once after the redo scan has determined `scan`. Idempotent: a
/// second run finds every real page valid and writes nothing. Clears the
/// set and fsyncs all data files on completion.
pub fn process(set: &mut CandidateSet, spaces: &SpaceManager, scan: &LogScanState) -> Result<()> {
    for cand in set.iter() {
        let id = cand.page_id();
        let lsn = cand.lsn();

        if id.page_no.0 == 0 {
            // Page 0 is restored by the tablespace-restore step.
            continue;
        }
        if lsn < scan.start_lsn {
            // Staged before the recovery start point; the real page is
            // already at least as new.
            continue;
        }
        if lsn > scan.scanned_lsn {
            warn!(
                %id,
                lsn,
                scanned = scan.scanned_lsn,
                "ignoring a doublewrite copy with a future log sequence number"
            );
            continue;
        }

        let space = match spaces.get(id.space) {
            Some(space) => space,
            // The tablespace was dropped; the copy is stale.
            None => continue,
        };

        if id.page_no.0 as u64 >= space.size_in_pages() {
            if !space.is_truncatable() {
                warn!(
                    %id,
                    slot = cand.slot,
                    size = space.size_in_pages(),
                    "doublewrite copy is beyond the end of its tablespace"
                );
            }
            continue;
        }

        let real = match space.read_page(id.page_no) {
            Ok(real) => real,
            Err(e) => {
                warn!(%id, error = %e, "doublewrite recovery: page read failed");
                page::PageBuf::zeroed()
            }
        };

        let zeroed = page::is_all_zero(&real);
        if !zeroed && checksum::is_valid(&real, id) {
            // The real page is intact; the copy is superfluous.
            continue;
        }
        if !zeroed {
            info!(%id, "trying to recover a torn page from the doublewrite buffer");
        }

        let best = match set.find_best(id, scan.scanned_lsn) {
            Some(best) => best,
            // No valid staged copy either; redo log records will
            // initialize the page.
            None => continue,
        };

        space.write_page(id.page_no, best.bytes())?;
        info!(%id, lsn = best.lsn(), "recovered page from the doublewrite buffer");
    }

    set.clear();
    spaces.flush_all()?;
    Ok(())
}
