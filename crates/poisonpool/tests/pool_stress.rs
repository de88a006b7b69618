//! Pool contract under realistic traffic: a delivery thread pumping
//! frames through the pool while cycles of poison/verify run between
//! bursts, the way a capture session drives it.

use std::sync::Arc;
use std::thread;

use poisonpool::{AllocError, BufferPool, MAX_REQUEST_BYTES};

#[test]
fn frame_traffic_then_quarantine_cycles() {
    let pool = Arc::new(BufferPool::new(0));

    for _cycle in 0..5 {
        let mut workers = Vec::new();
        for worker in 0..4u64 {
            let pool = Arc::clone(&pool);
            workers.push(thread::spawn(move || {
                // Frame sizes drift a little so reuse has to best-fit.
                for frame in 0..200u64 {
                    let size = 4096 + ((worker * 7 + frame) % 16) as usize * 64;
                    let mut buf = pool.allocate(size).unwrap();
                    assert_eq!(buf.addr() % 16, 0);
                    assert!(buf.len() >= size);
                    buf.as_mut_slice()[..size].fill(frame as u8);
                    pool.release(buf);
                }
            }));
        }
        for handle in workers {
            handle.join().unwrap();
        }

        assert_eq!(pool.live_count(), 0);
        pool.poison_quarantined();
        let summary = pool.verify_and_reclaim();
        assert!(summary.passed(), "cycle reported corruption: {summary:?}");
        assert!(summary.checked > 0);
        assert_eq!(pool.quarantined_count(), 0);
    }
}

#[test]
fn oversized_requests_never_reach_the_backend() {
    let pool = BufferPool::new(1);
    for size in [MAX_REQUEST_BYTES, MAX_REQUEST_BYTES + 1, usize::MAX] {
        assert_eq!(
            pool.allocate(size).unwrap_err(),
            AllocError::OversizedRequest(size)
        );
    }
    // A sane request still works afterwards.
    let buf = pool.allocate(1024).unwrap();
    pool.release(buf);
    pool.poison_quarantined();
    assert!(pool.verify_and_reclaim().passed());
}
