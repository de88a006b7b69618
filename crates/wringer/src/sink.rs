//! Notification sink: the session's ear on the device delivery thread.
//!
//! The driver reports format changes and frame arrivals here,
//! concurrently with the session loop. The sink condenses them into a
//! single edge-triggered restart latch that the session blocks on
//! while capturing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};

use tracing::{debug, info, warn};

use crate::device::DisplayMode;

/// Why a capture attempt has to be torn down and reconfigured.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    /// The device detected a new input format.
    FormatChange(DisplayMode),
    /// The input signal went away while the format stayed put.
    SignalLost,
    /// Another session hit corruption; the whole run is unwinding.
    Abort,
}

/// Edge-triggered restart condition, latched until explicitly taken.
///
/// `raise` is check-and-set under one lock, so two concurrent causes
/// produce exactly one restart; the first reason wins.
#[derive(Debug, Default)]
pub struct RestartLatch {
    state: Mutex<Option<RestartReason>>,
    cond: Condvar,
}

impl RestartLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch `reason` if nothing is pending. Returns false (and
    /// changes nothing) when a restart is already latched.
    pub fn raise(&self, reason: RestartReason) -> bool {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        if state.is_some() {
            return false;
        }
        *state = Some(reason);
        self.cond.notify_all();
        true
    }

    /// Block until a restart is latched. No timeout: the only ways
    /// out of a healthy capture are a device notification or the
    /// global abort, both of which raise this latch.
    pub fn wait(&self) {
        let mut state = self.state.lock().expect("latch mutex poisoned");
        while state.is_none() {
            state = self.cond.wait(state).expect("latch mutex poisoned");
        }
    }

    /// Clear the latch, returning what raised it.
    pub fn take(&self) -> Option<RestartReason> {
        self.state.lock().expect("latch mutex poisoned").take()
    }

    pub fn is_raised(&self) -> bool {
        self.state.lock().expect("latch mutex poisoned").is_some()
    }
}

/// Per-cycle mode bookkeeping, updated under one lock so the
/// signal-lost heuristic sees a consistent pair.
#[derive(Debug)]
struct ModeState {
    /// Mode the session configured at the start of this attempt.
    configured: DisplayMode,
    /// Last mode the device reported; equals `configured` until a
    /// format change is accepted.
    detected: DisplayMode,
    have_signal: bool,
}

/// Receives asynchronous device events and drives the restart latch.
pub struct NotificationSink {
    index: usize,
    latch: RestartLatch,
    frames: AtomicU64,
    signal_frames: AtomicU64,
    modes: Mutex<ModeState>,
}

impl NotificationSink {
    pub fn new(index: usize) -> Self {
        Self {
            index,
            latch: RestartLatch::new(),
            frames: AtomicU64::new(0),
            signal_frames: AtomicU64::new(0),
            modes: Mutex::new(ModeState {
                configured: DisplayMode::default(),
                detected: DisplayMode::default(),
                have_signal: false,
            }),
        }
    }

    pub fn latch(&self) -> &RestartLatch {
        &self.latch
    }

    /// Reset per-attempt state when the session reconfigures.
    /// Cumulative frame counters survive across cycles.
    pub fn begin_cycle(&self, mode: DisplayMode) {
        let mut modes = self.modes.lock().expect("mode mutex poisoned");
        modes.configured = mode;
        modes.detected = mode;
        modes.have_signal = false;
    }

    /// Device callback: the input format changed.
    ///
    /// Ignored entirely while a restart is already pending, so a
    /// burst of change events produces one restart with the first
    /// detected mode.
    pub fn on_format_changed(&self, mode: DisplayMode) {
        let mut modes = self.modes.lock().expect("mode mutex poisoned");
        if self.latch.raise(RestartReason::FormatChange(mode)) {
            modes.detected = mode;
            info!("[{}] input format changed to {mode}, restarting capture", self.index);
        } else {
            debug!("[{}] format change to {mode} ignored, restart already pending", self.index);
        }
    }

    /// Device callback: a frame arrived, with or without input signal.
    ///
    /// A transition out of signal while the detected mode still equals
    /// the mode configured at the start of this attempt is treated
    /// like a format change: prolonged signal loss needs the same
    /// reconfigure.
    pub fn on_frame_arrived(&self, has_signal: bool) {
        self.frames.fetch_add(1, Ordering::Relaxed);

        let mut modes = self.modes.lock().expect("mode mutex poisoned");
        if has_signal {
            self.signal_frames.fetch_add(1, Ordering::Relaxed);
            if !modes.have_signal {
                modes.have_signal = true;
                info!("[{}] input signal acquired", self.index);
            }
        } else if modes.have_signal {
            modes.have_signal = false;
            if modes.detected == modes.configured
                && self.latch.raise(RestartReason::SignalLost)
            {
                warn!("[{}] input signal lost, restarting capture", self.index);
            }
        }
    }

    /// Total frames delivered since the session was created.
    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Frames that carried input signal.
    pub fn signal_frames(&self) -> u64 {
        self.signal_frames.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latch_raises_once() {
        let latch = RestartLatch::new();
        assert!(!latch.is_raised());
        assert!(latch.raise(RestartReason::SignalLost));
        assert!(!latch.raise(RestartReason::Abort));
        assert_eq!(latch.take(), Some(RestartReason::SignalLost));
        assert!(!latch.is_raised());
    }

    #[test]
    fn rapid_format_changes_latch_one_restart() {
        let sink = NotificationSink::new(0);
        sink.begin_cycle(DisplayMode::Hd720p5994);

        sink.on_format_changed(DisplayMode::Hd1080p25);
        sink.on_format_changed(DisplayMode::Pal);

        // One restart, carrying the first detected mode.
        assert_eq!(
            sink.latch().take(),
            Some(RestartReason::FormatChange(DisplayMode::Hd1080p25))
        );
        assert_eq!(sink.latch().take(), None);
    }

    #[test]
    fn signal_loss_raises_restart() {
        let sink = NotificationSink::new(0);
        sink.begin_cycle(DisplayMode::Hd720p5994);

        sink.on_frame_arrived(true);
        sink.on_frame_arrived(true);
        sink.on_frame_arrived(false);

        assert_eq!(sink.latch().take(), Some(RestartReason::SignalLost));
        assert_eq!(sink.frames(), 3);
        assert_eq!(sink.signal_frames(), 2);
    }

    #[test]
    fn signal_loss_without_prior_signal_is_quiet() {
        let sink = NotificationSink::new(0);
        sink.begin_cycle(DisplayMode::Hd720p5994);

        sink.on_frame_arrived(false);
        sink.on_frame_arrived(false);

        assert!(!sink.latch().is_raised());
    }

    #[test]
    fn signal_loss_after_format_change_does_not_double_trigger() {
        let sink = NotificationSink::new(0);
        sink.begin_cycle(DisplayMode::Hd720p5994);

        sink.on_frame_arrived(true);
        sink.on_format_changed(DisplayMode::Hd1080p25);
        sink.on_frame_arrived(false);

        // The format change got there first and stays the reason.
        assert_eq!(
            sink.latch().take(),
            Some(RestartReason::FormatChange(DisplayMode::Hd1080p25))
        );
    }

    #[test]
    fn begin_cycle_resets_signal_edge() {
        let sink = NotificationSink::new(0);
        sink.begin_cycle(DisplayMode::Hd720p5994);
        sink.on_frame_arrived(true);
        let _ = sink.latch().take();

        sink.begin_cycle(DisplayMode::Hd720p5994);
        // No signal yet this cycle, so a no-signal frame is not a loss.
        sink.on_frame_arrived(false);
        assert!(!sink.latch().is_raised());
        // Counters are cumulative across cycles.
        assert_eq!(sink.frames(), 2);
    }
}
