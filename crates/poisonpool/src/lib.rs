//! poisonpool: a quarantining buffer pool for capture stress testing.
//!
//! Capture drivers request frame buffers on their own delivery thread
//! and hand them back when the frame is consumed. A driver bug (late
//! DMA, a dangling completion) can write into a buffer the
//! application already released; nothing crashes, the heap just rots.
//! This pool makes that visible:
//!
//! - released buffers sit in a quarantine instead of going straight
//!   back to the OS;
//! - when the session is idle the quarantine is poisoned with a
//!   deterministic keystream;
//! - before the next capture cycle every poisoned buffer is verified
//!   word-by-word, and any divergence is reported with the exact
//!   offset, run length and corrupt value.
//!
//! The raw-memory strategy is pluggable: the default
//! [`PoisonFill`] backend uses the heap, while the unix
//! [`PageGuard`] backend additionally revokes write access to
//! quarantined pages so the offender faults at the moment of the bad
//! write.

mod backend;
mod keystream;
mod pool;

pub use backend::{PoisonFill, QuarantineBackend, TamperEvidence, BUFFER_ALIGN};
#[cfg(unix)]
pub use backend::PageGuard;
pub use keystream::{
    poison_fill, verify, Divergence, Keystream, KEYSTREAM_FACTOR, KEYSTREAM_MODULUS,
    KEYSTREAM_SEED,
};
pub use pool::{
    AllocError, BufferPool, CorruptionReport, PoolBuffer, VerifySummary, MAX_REQUEST_BYTES,
};
