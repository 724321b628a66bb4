//! Torn-page recovery tests
//!
//! Each test stages pages through a real flush, then simulates the crash
//! window between the stage-fsync and the scatter-write completion by
//! damaging the real page on disk, and checks what recovery does.

use doublewrite::checksum;
use doublewrite::meta::{self, StagingLayout};
use doublewrite::page::{self, PageBuf, PageType};
use doublewrite::{
    init_or_load_pages, process, Config, DoublewriteBuffer, LogScanState, PageId, PageNo, Space,
    SpaceId, SpaceManager, SYSTEM_SPACE,
};
use std::sync::Arc;
use tempfile::TempDir;

const N: u32 = 4;

fn setup(dir: &TempDir) -> Arc<SpaceManager> {
    let spaces = Arc::new(SpaceManager::new());
    spaces
        .register(Space::open(SYSTEM_SPACE, dir.path().join("system.db")).unwrap());
    spaces
}

fn data_space(spaces: &SpaceManager, dir: &TempDir, id: u32, pages: u32) -> Arc<Space> {
    let space =
        spaces.register(Space::open(SpaceId(id), dir.path().join(format!("t{id}.db"))).unwrap());
    space.allocate_extent(pages).unwrap();
    space
}

fn make_page(id: PageId, lsn: u64, seed: u64) -> PageBuf {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let mut p = PageBuf::init(id, PageType::Index, lsn);
    rng.fill(&mut p[1024..2048]);
    checksum::update(&mut p);
    p
}

fn test_config() -> Config {
    Config::new().pages_per_block(N).scatter_workers(0)
}

/// Stage `pages` through a full flush so copies land in the extents and
/// the real locations, then return.
fn stage_and_flush(spaces: &Arc<SpaceManager>, pages: &[(PageId, PageBuf)]) {
    let buf = DoublewriteBuffer::create(spaces.clone(), test_config()).unwrap();
    for (id, p) in pages {
        buf.add_to_batch(*id, p, false).unwrap();
    }
    buf.flush_buffered_writes().unwrap();
    buf.wait_idle().unwrap();
    buf.close().unwrap();
}

fn scan(start_lsn: u64, scanned_lsn: u64) -> LogScanState {
    LogScanState { start_lsn, scanned_lsn }
}

#[test]
fn test_no_buffer_yields_empty_set() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);

    let set = init_or_load_pages(&spaces, &test_config()).unwrap();
    assert!(set.is_empty());
}

#[test]
fn test_zeroed_page_recovered_byte_identical() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x11);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);

    // Crash window: the scatter write never made it; the sector-level
    // write left the page zeroed.
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();
    space.sync().unwrap();

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    assert_eq!(set.len(), 1);
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert_eq!(&real[..], &good[..]);
    assert!(set.is_empty());
}

#[test]
fn test_torn_page_recovered() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x22);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);

    // Crash window: only the first sectors of the page were replaced.
    let mut torn = PageBuf::from_bytes(&good).unwrap();
    torn[2048..].fill(0xff);
    space.write_page(id.page_no, &torn).unwrap();
    space.sync().unwrap();

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert_eq!(&real[..], &good[..]);
}

#[test]
fn test_valid_page_left_untouched() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let staged = make_page(id, 50, 0x33);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&staged).unwrap())]);

    // The page was later rewritten with newer valid contents; the staged
    // copy is superfluous and must not win.
    let newer = make_page(id, 60, 0x44);
    space.write_page(id.page_no, &newer).unwrap();
    space.sync().unwrap();

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert_eq!(&real[..], &newer[..]);
}

#[test]
fn test_process_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x55);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    // Second run: the loader still finds the staged copies, but every
    // real page already validates, so nothing is written.
    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert_eq!(&real[..], &good[..]);
}

#[test]
fn test_future_lsn_candidate_ignored() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x66);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();

    // The copy claims an LSN beyond the scanned log; it cannot be trusted.
    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 40)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert!(page::is_all_zero(&real));
}

#[test]
fn test_stale_candidate_ignored() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x77);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();

    // Staged before the recovery start point: the redo log covers it.
    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(60, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert!(page::is_all_zero(&real));
}

#[test]
fn test_page_zero_skipped() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(0));
    let good = make_page(id, 50, 0x88);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();

    // Page 0 is restored by the tablespace-restore step, not here.
    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert!(page::is_all_zero(&real));
}

#[test]
fn test_dropped_space_skipped() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let _space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0x99);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);

    spaces.drop_space(SpaceId(2));

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();
    assert!(set.is_empty());
}

#[test]
fn test_copy_beyond_truncated_space_skipped() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let _space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0xaa);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);

    // The space was truncated in place; page 5 no longer exists.
    spaces.drop_space(SpaceId(2));
    spaces.register(
        Space::open_truncatable(SpaceId(2), dir.path().join("t2_truncated.db")).unwrap(),
    );

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    process(&mut set, &spaces, &scan(10, 100)).unwrap();
}

#[test]
fn test_best_of_duplicate_candidates_wins() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let old = make_page(id, 30, 0xbb);
    let new = make_page(id, 50, 0xcc);

    // Two batches stage the same page; both copies survive in the extents
    // because they land in different slots of the same flush.
    stage_and_flush(
        &spaces,
        &[
            (id, PageBuf::from_bytes(&old).unwrap()),
            (id, PageBuf::from_bytes(&new).unwrap()),
        ],
    );
    space.write_page(id.page_no, &PageBuf::zeroed()).unwrap();

    let mut set = init_or_load_pages(&spaces, &test_config()).unwrap();
    assert_eq!(set.len(), 2);
    process(&mut set, &spaces, &scan(10, 100)).unwrap();

    let real = space.read_page(id.page_no).unwrap();
    assert_eq!(&real[..], &new[..]);
}

#[test]
fn test_legacy_format_space_id_migration() {
    let dir = TempDir::new().unwrap();
    let spaces = setup(&dir);
    let _space = data_space(&spaces, &dir, 2, 20);

    let id = PageId::new(SpaceId(2), PageNo(5));
    let good = make_page(id, 50, 0xdd);
    stage_and_flush(&spaces, &[(id, PageBuf::from_bytes(&good).unwrap())]);

    // Rewrite the header as the pre-migration format would have left it.
    let sys = spaces.system().unwrap();
    let mut header = sys.read_page(meta::HEADER_PAGE_NO).unwrap();
    let layout = StagingLayout::read_from(&header).unwrap();
    StagingLayout { space_ids_stored: false, ..layout }.write_to(&mut header);
    sys.write_page(meta::HEADER_PAGE_NO, &header).unwrap();
    sys.sync().unwrap();

    // The migration run collects no candidates and resets every staged
    // page's space id field on disk.
    let set = init_or_load_pages(&spaces, &test_config()).unwrap();
    assert!(set.is_empty());

    for i in 0..2 * N {
        let no = if i < N { PageNo(layout.block1.0 + i) } else { PageNo(layout.block2.0 + i - N) };
        let staged = sys.read_page(no).unwrap();
        assert_eq!(page::space_id(&staged), SpaceId(0));
    }
}
