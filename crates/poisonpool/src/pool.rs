//! Size-bucketed buffer pool with a quarantine on released memory.
//!
//! Buffers handed to the capture driver are tracked in a live
//! registry; released buffers move into a quarantine ordered by size
//! so the next allocation can reuse the smallest buffer that fits.
//! Once the owning session goes idle the quarantine is poisoned, and
//! before the next capture cycle it is verified word-by-word: any
//! divergence means somebody wrote into memory they had already
//! returned.
//!
//! Invariant: a buffer address is always in exactly one of the live
//! registry or the quarantine, at every unlock of the pool mutex.

use std::collections::{BTreeMap, HashMap};
use std::ptr::NonNull;
use std::sync::Mutex;

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::backend::{PoisonFill, QuarantineBackend, TamperEvidence};

/// Requests at or past this are treated as garbage from the driver
/// (typically an integer underflow) and refused without allocating.
pub const MAX_REQUEST_BYTES: usize = 0x8000_0000;

/// Why a buffer request could not be served.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocError {
    #[error("requested size {0:#x} is not a sane value")]
    OversizedRequest(usize),
    #[error("backend allocation of {0} bytes failed")]
    OutOfMemory(usize),
}

/// Exclusive handle to a live pool buffer.
///
/// The pool does not touch the region while the handle exists; give
/// it back with [`BufferPool::release`]. Dropping the handle without
/// releasing leaks the buffer and trips the idle check later.
#[derive(Debug)]
pub struct PoolBuffer {
    ptr: NonNull<u8>,
    len: usize,
}

// The handle is an exclusive borrow of pool-owned memory; the delivery
// thread that fills frames is not the thread that created the pool.
unsafe impl Send for PoolBuffer {}

impl PoolBuffer {
    /// Actual buffer length, possibly larger than requested on reuse.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn addr(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

#[derive(Debug)]
struct QuarantinedBuf {
    ptr: NonNull<u8>,
    armed: bool,
}

#[derive(Default)]
struct PoolState {
    /// addr -> actual length, for every buffer currently handed out.
    live: HashMap<usize, usize>,
    /// length -> buffers released and awaiting poison/verify.
    quarantined: BTreeMap<usize, Vec<QuarantinedBuf>>,
}

/// One corrupted quarantined buffer, as reported at verify time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorruptionReport {
    pub pool: usize,
    pub addr: usize,
    pub total_bytes: usize,
    pub evidence: TamperEvidence,
}

/// Outcome of [`BufferPool::verify_and_reclaim`].
#[derive(Debug, Default)]
pub struct VerifySummary {
    pub checked: usize,
    pub reports: Vec<CorruptionReport>,
}

impl VerifySummary {
    pub fn passed(&self) -> bool {
        self.reports.is_empty()
    }
}

/// The quarantine allocator backing one capture session.
pub struct BufferPool {
    index: usize,
    backend: Box<dyn QuarantineBackend>,
    state: Mutex<PoolState>,
}

// The raw pointers in the state are owned allocations, never borrows,
// and every access to them happens under the state mutex.
unsafe impl Send for BufferPool {}
unsafe impl Sync for BufferPool {}

impl BufferPool {
    /// Pool with the default poison-fill backend.
    pub fn new(index: usize) -> Self {
        Self::with_backend(index, Box::new(PoisonFill))
    }

    pub fn with_backend(index: usize, backend: Box<dyn QuarantineBackend>) -> Self {
        Self {
            index,
            backend,
            state: Mutex::new(PoolState::default()),
        }
    }

    /// Session index this pool belongs to, for diagnostics.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Hand out a buffer of at least `size` bytes, 16-byte aligned.
    ///
    /// Prefers the smallest quarantined buffer that fits; a reused
    /// buffer keeps whatever contents it had, poison pattern included,
    /// since the driver overwrites it with frame data anyway.
    pub fn allocate(&self, size: usize) -> Result<PoolBuffer, AllocError> {
        if size >= MAX_REQUEST_BYTES {
            warn!(
                "[{}] refusing buffer request of {size:#x} bytes, not a sane value",
                self.index
            );
            return Err(AllocError::OversizedRequest(size));
        }

        let mut state = self.state.lock().expect("pool mutex poisoned");

        let reuse_len = state
            .quarantined
            .range(size..)
            .next()
            .map(|(len, _)| *len);
        if let Some(len) = reuse_len {
            let bucket = state
                .quarantined
                .get_mut(&len)
                .expect("bucket vanished under lock");
            let buf = bucket.pop().expect("empty bucket left in quarantine map");
            if bucket.is_empty() {
                state.quarantined.remove(&len);
            }
            state.live.insert(buf.ptr.as_ptr() as usize, len);
            return Ok(PoolBuffer { ptr: buf.ptr, len });
        }

        let ptr = self
            .backend
            .alloc(size)
            .ok_or(AllocError::OutOfMemory(size))?;
        state.live.insert(ptr.as_ptr() as usize, size);
        Ok(PoolBuffer { ptr, len: size })
    }

    /// Return a live buffer to the quarantine.
    ///
    /// Panics if the buffer is not tracked by this pool; that is a
    /// driver contract violation, not a recoverable condition.
    pub fn release(&self, buf: PoolBuffer) {
        let PoolBuffer { ptr, len } = buf;
        let addr = ptr.as_ptr() as usize;

        let mut state = self.state.lock().expect("pool mutex poisoned");
        let tracked = state.live.remove(&addr);
        assert!(
            tracked == Some(len),
            "[{}] released buffer {addr:#x} ({len} bytes) is not tracked by this pool",
            self.index
        );
        state
            .quarantined
            .entry(len)
            .or_default()
            .push(QuarantinedBuf { ptr, armed: false });
    }

    /// Poison every quarantined buffer once the session is idle.
    ///
    /// Panics if anything is still live: the caller said the device is
    /// stopped, so an outstanding buffer means the ownership contract
    /// was broken somewhere.
    pub fn poison_quarantined(&self) {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        assert!(
            state.live.is_empty(),
            "[{}] {} buffers still live at quarantine time",
            self.index,
            state.live.len()
        );

        let mut armed = 0usize;
        for (len, bucket) in state.quarantined.iter_mut() {
            for buf in bucket.iter_mut() {
                unsafe { self.backend.seal(buf.ptr, *len) };
                buf.armed = true;
                armed += 1;
            }
        }
        debug!(pool = self.index, buffers = armed, "quarantine poisoned");
    }

    /// Check every poisoned buffer and return all of them to the
    /// backend; after this the pool is empty.
    ///
    /// A failed check does not panic: the caller decides whether to
    /// escalate. The report also goes to the log with the same fields
    /// so a corrupted run is diagnosable from console output alone.
    pub fn verify_and_reclaim(&self) -> VerifySummary {
        let mut state = self.state.lock().expect("pool mutex poisoned");
        let quarantined = std::mem::take(&mut state.quarantined);

        let mut summary = VerifySummary::default();
        for (len, bucket) in quarantined {
            for buf in bucket {
                summary.checked += 1;
                if !buf.armed {
                    // Released after the poison pass; nothing to check.
                    warn!(
                        "[{}] unpoisoned buffer {:#x} at verify time, skipping check",
                        self.index,
                        buf.ptr.as_ptr() as usize
                    );
                } else if let Err(evidence) = unsafe { self.backend.check(buf.ptr, len) } {
                    let report = CorruptionReport {
                        pool: self.index,
                        addr: buf.ptr.as_ptr() as usize,
                        total_bytes: len,
                        evidence,
                    };
                    log_corruption(&report);
                    summary.reports.push(report);
                }
                unsafe { self.backend.dealloc(buf.ptr, len) };
            }
        }

        debug!(
            pool = self.index,
            checked = summary.checked,
            failed = summary.reports.len(),
            "quarantine verified and reclaimed"
        );
        summary
    }

    /// Simulate a stray device write into the quarantined buffer at
    /// `addr`, under the pool lock so it cannot race a reclaim.
    ///
    /// Returns false when `addr` is not quarantined (already reused
    /// or reclaimed); nothing is written in that case. This is
    /// harness support for exercising the detection path on demand.
    pub fn tamper_quarantined(&self, addr: usize, offset: usize) -> bool {
        let state = self.state.lock().expect("pool mutex poisoned");
        for (len, bucket) in state.quarantined.iter() {
            if let Some(buf) = bucket.iter().find(|b| b.ptr.as_ptr() as usize == addr) {
                if *len < 4 {
                    return false;
                }
                let offset = offset.min(len - 4) & !3;
                unsafe { self.backend.tamper(buf.ptr, *len, offset) };
                return true;
            }
        }
        false
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().expect("pool mutex poisoned").live.len()
    }

    pub fn quarantined_count(&self) -> usize {
        self.state
            .lock()
            .expect("pool mutex poisoned")
            .quarantined
            .values()
            .map(Vec::len)
            .sum()
    }
}

fn log_corruption(report: &CorruptionReport) {
    match report.evidence {
        TamperEvidence::PatternMismatch(div) => error!(
            "[{}] ALERT: buffer verification failed: ptr={:#x}, total_size={}, valid_size={}, content={}*{:#010x}",
            report.pool, report.addr, report.total_bytes, div.valid_bytes, div.run_words, div.value
        ),
        TamperEvidence::ProtectionFault { errno } => error!(
            "[{}] ALERT: buffer protection changed while quarantined: ptr={:#x}, total_size={}, errno={}",
            report.pool, report.addr, report.total_bytes, errno
        ),
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().expect("pool mutex poisoned");
        if !state.live.is_empty() {
            // Whoever holds these may still write through the pointer;
            // leaking beats handing the pages back for reuse.
            error!(
                pool = self.index,
                live = state.live.len(),
                "pool dropped with live buffers, leaking them"
            );
        }
        for (len, bucket) in std::mem::take(&mut state.quarantined) {
            for buf in bucket {
                unsafe { self.backend.dealloc(buf.ptr, len) };
            }
        }
    }
}
