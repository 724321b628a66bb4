//! Concurrent batch assembly tests

use doublewrite::checksum;
use doublewrite::page::{self, PageBuf, PageType};
use doublewrite::{
    Config, DoublewriteBuffer, PageId, PageNo, Space, SpaceId, SpaceManager, SYSTEM_SPACE,
};
use std::sync::Arc;
use tempfile::TempDir;

fn make_page(id: PageId, lsn: u64, fill: u8) -> PageBuf {
    let mut p = PageBuf::init(id, PageType::Index, lsn);
    p[1024..2048].fill(fill);
    checksum::update(&mut p);
    p
}

#[test]
fn test_many_writers_one_buffer() {
    const THREADS: u32 = 8;
    const PAGES_PER_THREAD: u32 = 50;

    let dir = TempDir::new().unwrap();
    let spaces = Arc::new(SpaceManager::new());
    spaces
        .register(Space::open(SYSTEM_SPACE, dir.path().join("system.db")).unwrap());
    let space =
        spaces.register(Space::open(SpaceId(2), dir.path().join("t2.db")).unwrap());
    space.allocate_extent(THREADS * PAGES_PER_THREAD + 10).unwrap();

    // Small extents force many internal flushes under contention.
    let config = Config::new().pages_per_block(16).scatter_workers(4);
    let buf = Arc::new(DoublewriteBuffer::create(spaces.clone(), config).unwrap());

    let handles: Vec<_> = (0..THREADS)
        .map(|t| {
            let buf = buf.clone();
            std::thread::spawn(move || {
                for i in 0..PAGES_PER_THREAD {
                    let no = PageNo(1 + t * PAGES_PER_THREAD + i);
                    let id = PageId::new(SpaceId(2), no);
                    let p = make_page(id, 1000 + no.0 as u64, t as u8 + 1);
                    buf.add_to_batch(id, &p, i % 2 == 0).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    buf.wait_idle().unwrap();
    assert_eq!(buf.pages_written(), (THREADS * PAGES_PER_THREAD) as u64);

    // Every page must have reached its real location exactly as staged:
    // no slot was ever shared between two concurrent adders.
    for t in 0..THREADS {
        for i in 0..PAGES_PER_THREAD {
            let no = PageNo(1 + t * PAGES_PER_THREAD + i);
            let id = PageId::new(SpaceId(2), no);
            let real = space.read_page(no).unwrap();
            assert!(checksum::is_valid(&real, id), "page {id} damaged in flight");
            assert_eq!(page::lsn(&real), 1000 + no.0 as u64);
            assert_eq!(real[1024], t as u8 + 1);
        }
    }
}

#[test]
fn test_concurrent_flush_and_add() {
    let dir = TempDir::new().unwrap();
    let spaces = Arc::new(SpaceManager::new());
    spaces
        .register(Space::open(SYSTEM_SPACE, dir.path().join("system.db")).unwrap());
    let space =
        spaces.register(Space::open(SpaceId(2), dir.path().join("t2.db")).unwrap());
    space.allocate_extent(300).unwrap();

    let config = Config::new().pages_per_block(8).scatter_workers(2);
    let buf = Arc::new(DoublewriteBuffer::create(spaces.clone(), config).unwrap());

    let writer = {
        let buf = buf.clone();
        std::thread::spawn(move || {
            for i in 0..200u32 {
                let id = PageId::new(SpaceId(2), PageNo(1 + i));
                let p = make_page(id, 1 + i as u64, 7);
                buf.add_to_batch(id, &p, false).unwrap();
            }
        })
    };

    // A second thread keeps requesting flushes while pages stream in;
    // flush must either find the buffer idle or wait its turn.
    let flusher = {
        let buf = buf.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                buf.flush_buffered_writes().unwrap();
            }
        })
    };

    writer.join().unwrap();
    flusher.join().unwrap();
    buf.wait_idle().unwrap();

    for i in 0..200u32 {
        let id = PageId::new(SpaceId(2), PageNo(1 + i));
        let real = space.read_page(id.page_no).unwrap();
        assert!(checksum::is_valid(&real, id));
    }
}
