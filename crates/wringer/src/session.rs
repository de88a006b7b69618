//! Per-device capture session: the start/stop torture loop.
//!
//! One session owns one device, one buffer pool and one notification
//! sink, and cycles through
//! `Configuring -> Capturing -> Stopping -> QuarantineCheck` until the
//! run is aborted (or an optional cycle bound is reached). The
//! quarantine check is the whole point: after every teardown the pool
//! is poisoned and, one settle window later, verified. A failed
//! verification escalates to the global abort.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use poisonpool::BufferPool;
use tracing::{debug, error, info, warn};

use crate::device::{AudioParams, CaptureDevice, DisplayMode};
use crate::orchestrator::RunGroup;
use crate::sink::{NotificationSink, RestartReason};

/// Knobs for one capture session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub initial_mode: DisplayMode,
    pub audio: AudioParams,
    /// Pause between poisoning the quarantine and verifying it; this
    /// is the window in which a late driver write gets caught.
    pub settle: Duration,
    /// Pause between capture cycles.
    pub cycle_pause: Duration,
    /// Stop after this many cycles; `None` runs until global abort.
    pub max_cycles: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initial_mode: DisplayMode::default(),
            audio: AudioParams::default(),
            settle: Duration::from_millis(250),
            cycle_pause: Duration::from_secs(2),
            max_cycles: None,
        }
    }
}

/// Session lifecycle states, logged at every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Configuring,
    Capturing,
    Stopping,
    QuarantineCheck,
    Aborted,
}

/// What a session did before it exited.
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub index: usize,
    pub cycles: u64,
    pub frames: u64,
    pub signal_frames: u64,
    /// True when this session's quarantine check failed and it raised
    /// the global abort.
    pub raised_abort: bool,
}

/// Which configure steps succeeded, so teardown can undo exactly
/// those, in reverse, best-effort.
#[derive(Debug, Default, Clone, Copy)]
struct ConfigureProgress {
    provider: bool,
    video: bool,
    audio: bool,
    sink: bool,
    streaming: bool,
}

pub struct CaptureSession {
    index: usize,
    device: Box<dyn CaptureDevice>,
    pool: Arc<BufferPool>,
    sink: Arc<NotificationSink>,
    config: SessionConfig,
    target_mode: DisplayMode,
    state: SessionState,
}

impl CaptureSession {
    pub fn new(
        index: usize,
        device: Box<dyn CaptureDevice>,
        pool: Arc<BufferPool>,
        config: SessionConfig,
    ) -> Self {
        let target_mode = config.initial_mode;
        Self {
            index,
            device,
            pool,
            sink: Arc::new(NotificationSink::new(index)),
            config,
            target_mode,
            state: SessionState::Idle,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// The sink the orchestrator registers for abort broadcast.
    pub fn sink(&self) -> &Arc<NotificationSink> {
        &self.sink
    }

    fn set_state(&mut self, next: SessionState) {
        debug!("[{}] {:?} -> {:?}", self.index, self.state, next);
        self.state = next;
    }

    /// Drive the session until global abort or the cycle bound.
    pub fn run(&mut self, group: &RunGroup) -> SessionStats {
        info!(
            "[{}] capture session starting on device {}",
            self.index,
            self.device.name()
        );

        let mut cycles = 0u64;
        let mut raised_abort = false;

        loop {
            if group.is_aborted() {
                info!("[{}] global abort observed, exiting", self.index);
                break;
            }
            if let Some(bound) = self.config.max_cycles {
                if cycles >= bound {
                    info!("[{}] cycle bound {} reached, exiting", self.index, bound);
                    break;
                }
            }
            cycles += 1;
            info!(
                "[{}] capture cycle #{} starting, mode {}",
                self.index, cycles, self.target_mode
            );

            let progress = self.configure();
            if progress.streaming {
                self.set_state(SessionState::Capturing);
                self.sink.latch().wait();
            }

            self.set_state(SessionState::Stopping);
            self.teardown(progress);

            match self.sink.latch().take() {
                Some(RestartReason::FormatChange(mode)) => {
                    info!("[{}] next capture attempt will use {mode}", self.index);
                    self.target_mode = mode;
                }
                Some(RestartReason::SignalLost) => {
                    // Same mode again; the source may come back.
                }
                Some(RestartReason::Abort) | None => {}
            }

            // The device is idle now; anything still live means the
            // driver broke the ownership contract, and the pool will
            // say so loudly.
            self.pool.poison_quarantined();

            self.set_state(SessionState::QuarantineCheck);
            thread::sleep(self.config.settle);
            let summary = self.pool.verify_and_reclaim();
            if !summary.passed() {
                error!(
                    "[{}] quarantine verification FAILED: {} corrupt of {} checked",
                    self.index,
                    summary.reports.len(),
                    summary.checked
                );
                group.raise_abort();
                raised_abort = true;
                self.set_state(SessionState::Aborted);
                break;
            }
            debug!(
                "[{}] quarantine clean ({} buffers checked)",
                self.index, summary.checked
            );

            self.set_state(SessionState::Idle);
            if group.is_aborted() {
                continue; // exits at loop top without the pause
            }
            thread::sleep(self.config.cycle_pause);
        }

        let stats = SessionStats {
            index: self.index,
            cycles,
            frames: self.sink.frames(),
            signal_frames: self.sink.signal_frames(),
            raised_abort,
        };
        info!(
            "[{}] session finished: cycles={}, frames={} ({} with signal)",
            self.index, stats.cycles, stats.frames, stats.signal_frames
        );
        stats
    }

    /// Bring the device up step by step. Any failure logs, leaves the
    /// remaining steps untried and returns what did succeed so
    /// teardown can undo it.
    fn configure(&mut self) -> ConfigureProgress {
        self.set_state(SessionState::Configuring);
        self.sink.begin_cycle(self.target_mode);

        let mut progress = ConfigureProgress::default();

        if let Err(e) = self.device.set_buffer_provider(Some(Arc::clone(&self.pool))) {
            error!("[{}] set_buffer_provider failed: {e}", self.index);
            return progress;
        }
        progress.provider = true;

        if let Err(e) = self.device.select_input_connection() {
            warn!(
                "[{}] input connection query failed, continuing: {e}",
                self.index
            );
        }

        if let Err(e) = self.device.enable_video(self.target_mode) {
            error!("[{}] enable_video({}) failed: {e}", self.index, self.target_mode);
            return progress;
        }
        progress.video = true;

        if let Err(e) = self.device.enable_audio(self.config.audio) {
            error!("[{}] enable_audio failed: {e}", self.index);
            return progress;
        }
        progress.audio = true;

        if let Err(e) = self.device.set_notification_sink(Some(Arc::clone(&self.sink))) {
            error!("[{}] set_notification_sink failed: {e}", self.index);
            return progress;
        }
        progress.sink = true;

        if let Err(e) = self.device.start_streams() {
            error!("[{}] start_streams failed: {e}", self.index);
            return progress;
        }
        progress.streaming = true;

        progress
    }

    /// Undo the completed configure steps in reverse. Every step is
    /// best-effort; a failure here is logged and the teardown keeps
    /// going.
    fn teardown(&mut self, progress: ConfigureProgress) {
        if progress.streaming {
            if let Err(e) = self.device.stop_streams() {
                error!("[{}] stop_streams failed: {e}", self.index);
            }
        }
        if progress.sink {
            if let Err(e) = self.device.set_notification_sink(None) {
                error!("[{}] clearing notification sink failed: {e}", self.index);
            }
        }
        if progress.audio {
            if let Err(e) = self.device.disable_audio() {
                error!("[{}] disable_audio failed: {e}", self.index);
            }
        }
        if progress.video {
            if let Err(e) = self.device.disable_video() {
                error!("[{}] disable_video failed: {e}", self.index);
            }
        }
        if progress.provider {
            if let Err(e) = self.device.set_buffer_provider(None) {
                error!("[{}] clearing buffer provider failed: {e}", self.index);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceError;
    use crate::orchestrator::RunGroup;

    /// Device whose enable_video always fails; the session must keep
    /// cycling through best-effort teardown without ever capturing.
    struct BrokenVideoDevice;

    impl CaptureDevice for BrokenVideoDevice {
        fn name(&self) -> &str {
            "broken-video"
        }
        fn select_input_connection(&mut self) -> Result<(), DeviceError> {
            Err(DeviceError::NotSupported("input connection query"))
        }
        fn set_buffer_provider(
            &mut self,
            _pool: Option<Arc<BufferPool>>,
        ) -> Result<(), DeviceError> {
            Ok(())
        }
        fn set_notification_sink(
            &mut self,
            _sink: Option<Arc<NotificationSink>>,
        ) -> Result<(), DeviceError> {
            panic!("sink must not be registered when enable_video fails");
        }
        fn enable_video(&mut self, _mode: DisplayMode) -> Result<(), DeviceError> {
            Err(DeviceError::Backend("no such input".into()))
        }
        fn enable_audio(&mut self, _params: AudioParams) -> Result<(), DeviceError> {
            panic!("audio must not be enabled when enable_video fails");
        }
        fn start_streams(&mut self) -> Result<(), DeviceError> {
            panic!("streams must not start when enable_video fails");
        }
        fn stop_streams(&mut self) -> Result<(), DeviceError> {
            panic!("nothing to stop");
        }
        fn disable_video(&mut self) -> Result<(), DeviceError> {
            panic!("video was never enabled");
        }
        fn disable_audio(&mut self) -> Result<(), DeviceError> {
            panic!("audio was never enabled");
        }
    }

    #[test]
    fn configure_failure_cycles_without_capturing() {
        let device = Box::new(BrokenVideoDevice);
        let pool = Arc::new(BufferPool::new(0));
        let config = SessionConfig {
            settle: Duration::from_millis(1),
            cycle_pause: Duration::from_millis(1),
            max_cycles: Some(3),
            ..Default::default()
        };
        let mut session = CaptureSession::new(0, device, pool, config);
        let group = RunGroup::new(1);

        let stats = session.run(&group);
        assert_eq!(stats.cycles, 3);
        assert_eq!(stats.frames, 0);
        assert!(!stats.raised_abort);
        assert!(!group.is_aborted());
    }
}
