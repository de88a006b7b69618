//! Scripted in-process capture devices.
//!
//! There is no capture hardware in this tree; [`crate::device::CaptureDevice`]
//! is the seam where a real driver binding would plug in. `SimDevice`
//! honors the full contract from the other side: a delivery thread
//! that pumps frame buffers through the session's pool and reports
//! arrivals and format changes through its sink, plus an optional
//! sabotage step that writes into a released buffer after streams
//! stop, which is exactly the defect class the harness exists to
//! catch.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use poisonpool::BufferPool;
use tracing::{debug, warn};

use crate::device::{AudioParams, CaptureDevice, DeviceError, DisplayMode};
use crate::sink::NotificationSink;

/// One deliberate write into released memory, issued from a lingering
/// thread after `stop_streams`.
///
/// `delay` must land inside the owning session's settle window: after
/// the pool is poisoned, before it is verified. Too early and the
/// poison pass overwrites the damage; too late and the buffer is
/// already reclaimed (the write is then skipped, not misdirected).
#[derive(Debug, Clone, Copy)]
pub struct Sabotage {
    pub delay: Duration,
    pub offset: usize,
}

impl Default for Sabotage {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(100),
            offset: 4096,
        }
    }
}

/// What a `SimDevice` does while streaming.
#[derive(Debug, Clone)]
pub struct SimScript {
    /// Pacing between delivered frames.
    pub frame_interval: Duration,
    /// Announce a format change after this many frames of a cycle.
    pub frames_per_format: Option<u32>,
    /// Modes announced by successive format changes, cycled through
    /// across the whole device lifetime.
    pub mode_rotation: Vec<DisplayMode>,
    /// Report loss of input signal after this many frames of a cycle.
    pub dropout_after: Option<u32>,
    /// Fail the input-connection capability query, exercising the
    /// session's best-effort path.
    pub fail_input_query: bool,
    pub sabotage: Option<Sabotage>,
}

impl Default for SimScript {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(5),
            frames_per_format: Some(25),
            mode_rotation: vec![DisplayMode::Hd1080p25, DisplayMode::Hd720p5994],
            dropout_after: None,
            fail_input_query: false,
            sabotage: None,
        }
    }
}

struct Delivery {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<DeliveryOutcome>,
}

/// Handed back by the delivery thread when it stops.
struct DeliveryOutcome {
    /// Address of the last buffer released, the sabotage target.
    last_addr: Option<usize>,
}

/// A capture device that exists only as threads and a script.
pub struct SimDevice {
    name: String,
    script: SimScript,
    pool: Option<Arc<BufferPool>>,
    sink: Option<Arc<NotificationSink>>,
    mode: Option<DisplayMode>,
    audio: Option<AudioParams>,
    /// Position in the mode rotation; survives restarts so each
    /// format change announces something different.
    rotation: Arc<AtomicUsize>,
    delivery: Option<Delivery>,
    lingerers: Vec<JoinHandle<()>>,
}

impl SimDevice {
    pub fn new(name: impl Into<String>, script: SimScript) -> Self {
        Self {
            name: name.into(),
            script,
            pool: None,
            sink: None,
            mode: None,
            audio: None,
            rotation: Arc::new(AtomicUsize::new(0)),
            delivery: None,
            lingerers: Vec::new(),
        }
    }
}

impl CaptureDevice for SimDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn select_input_connection(&mut self) -> Result<(), DeviceError> {
        if self.script.fail_input_query {
            return Err(DeviceError::NotSupported("input connection query"));
        }
        Ok(())
    }

    fn set_buffer_provider(&mut self, pool: Option<Arc<BufferPool>>) -> Result<(), DeviceError> {
        if pool.is_some() && self.delivery.is_some() {
            return Err(DeviceError::WrongState("streaming"));
        }
        self.pool = pool;
        Ok(())
    }

    fn set_notification_sink(
        &mut self,
        sink: Option<Arc<NotificationSink>>,
    ) -> Result<(), DeviceError> {
        self.sink = sink;
        Ok(())
    }

    fn enable_video(&mut self, mode: DisplayMode) -> Result<(), DeviceError> {
        self.mode = Some(mode);
        Ok(())
    }

    fn enable_audio(&mut self, params: AudioParams) -> Result<(), DeviceError> {
        self.audio = Some(params);
        Ok(())
    }

    fn start_streams(&mut self) -> Result<(), DeviceError> {
        if self.delivery.is_some() {
            return Err(DeviceError::WrongState("already streaming"));
        }
        let pool = self
            .pool
            .clone()
            .ok_or(DeviceError::WrongState("no buffer provider"))?;
        let sink = self
            .sink
            .clone()
            .ok_or(DeviceError::WrongState("no notification sink"))?;
        let mode = self.mode.ok_or(DeviceError::WrongState("video not enabled"))?;

        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let script = self.script.clone();
        let rotation = Arc::clone(&self.rotation);

        let handle = thread::Builder::new()
            .name(format!("delivery-{}", self.name))
            .spawn(move || run_delivery(script, mode, rotation, pool, sink, stop_for_thread))
            .map_err(|e| DeviceError::Backend(format!("failed to spawn delivery thread: {e}")))?;

        self.delivery = Some(Delivery { stop, handle });
        Ok(())
    }

    fn stop_streams(&mut self) -> Result<(), DeviceError> {
        let Some(delivery) = self.delivery.take() else {
            return Err(DeviceError::WrongState("not streaming"));
        };
        delivery.stop.store(true, Ordering::Release);
        let outcome = delivery
            .handle
            .join()
            .map_err(|_| DeviceError::Backend("delivery thread panicked".into()))?;

        if let (Some(sabotage), Some(addr), Some(pool)) =
            (self.script.sabotage, outcome.last_addr, self.pool.clone())
        {
            debug!(
                "{}: scheduling a late write into released buffer {addr:#x}",
                self.name
            );
            let name = self.name.clone();
            let handle = thread::Builder::new()
                .name(format!("late-dma-{}", self.name))
                .spawn(move || {
                    thread::sleep(sabotage.delay);
                    if pool.tamper_quarantined(addr, sabotage.offset) {
                        debug!("{name}: late write landed in quarantined buffer {addr:#x}");
                    } else {
                        warn!("{name}: late write missed, buffer {addr:#x} already reclaimed");
                    }
                })
                .map_err(|e| DeviceError::Backend(format!("failed to spawn late writer: {e}")))?;
            self.lingerers.push(handle);
        }
        Ok(())
    }

    fn disable_video(&mut self) -> Result<(), DeviceError> {
        if self.delivery.is_some() {
            return Err(DeviceError::WrongState("streaming"));
        }
        self.mode = None;
        Ok(())
    }

    fn disable_audio(&mut self) -> Result<(), DeviceError> {
        self.audio = None;
        Ok(())
    }
}

impl Drop for SimDevice {
    fn drop(&mut self) {
        if let Some(delivery) = self.delivery.take() {
            delivery.stop.store(true, Ordering::Release);
            let _ = delivery.handle.join();
        }
        for lingerer in self.lingerers.drain(..) {
            let _ = lingerer.join();
        }
    }
}

/// The delivery loop: what the driver does between start and stop.
fn run_delivery(
    script: SimScript,
    mode: DisplayMode,
    rotation: Arc<AtomicUsize>,
    pool: Arc<BufferPool>,
    sink: Arc<NotificationSink>,
    stop: Arc<AtomicBool>,
) -> DeliveryOutcome {
    let frame_bytes = mode.frame_bytes();
    let mut frame = 0u32;
    let mut last_addr = None;

    while !stop.load(Ordering::Acquire) {
        match pool.allocate(frame_bytes) {
            Ok(mut buf) => {
                // Stand-in for the capture DMA writing the frame.
                buf.as_mut_slice().fill(frame as u8);
                last_addr = Some(buf.addr());
                let has_signal = script.dropout_after.map_or(true, |n| frame < n);
                sink.on_frame_arrived(has_signal);
                pool.release(buf);
            }
            Err(e) => warn!("frame allocation failed: {e}"),
        }

        frame += 1;
        if script.frames_per_format == Some(frame) {
            if let Some(&next) = {
                let i = rotation.fetch_add(1, Ordering::Relaxed);
                script.mode_rotation.get(i % script.mode_rotation.len().max(1))
            } {
                sink.on_format_changed(next);
            }
        }
        thread::sleep(script.frame_interval);
    }

    DeliveryOutcome { last_addr }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn device_refuses_to_start_unconfigured() {
        let mut device = SimDevice::new("sim-test", SimScript::default());
        assert!(matches!(
            device.start_streams(),
            Err(DeviceError::WrongState(_))
        ));
        assert!(matches!(
            device.stop_streams(),
            Err(DeviceError::WrongState(_))
        ));
    }

    #[test]
    fn delivery_pumps_frames_through_the_pool() {
        let script = SimScript {
            frame_interval: Duration::from_millis(1),
            frames_per_format: None,
            dropout_after: None,
            ..Default::default()
        };
        let mut device = SimDevice::new("sim-pump", script);
        let pool = Arc::new(BufferPool::new(0));
        let sink = Arc::new(NotificationSink::new(0));
        sink.begin_cycle(DisplayMode::Ntsc);

        device.set_buffer_provider(Some(Arc::clone(&pool))).unwrap();
        device.enable_video(DisplayMode::Ntsc).unwrap();
        device.enable_audio(AudioParams::default()).unwrap();
        device.set_notification_sink(Some(Arc::clone(&sink))).unwrap();
        device.start_streams().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while sink.frames() < 5 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        device.stop_streams().unwrap();

        assert!(sink.frames() >= 5, "delivery never got going");
        assert_eq!(sink.frames(), sink.signal_frames());
        assert_eq!(pool.live_count(), 0);
        assert!(pool.quarantined_count() >= 1, "frames reuse one buffer");

        pool.poison_quarantined();
        assert!(pool.verify_and_reclaim().passed());
    }

    #[test]
    fn format_change_fires_after_scripted_frames() {
        let script = SimScript {
            frame_interval: Duration::from_millis(1),
            frames_per_format: Some(3),
            mode_rotation: vec![DisplayMode::Pal],
            ..Default::default()
        };
        let mut device = SimDevice::new("sim-format", script);
        let pool = Arc::new(BufferPool::new(0));
        let sink = Arc::new(NotificationSink::new(0));
        sink.begin_cycle(DisplayMode::Ntsc);

        device.set_buffer_provider(Some(Arc::clone(&pool))).unwrap();
        device.enable_video(DisplayMode::Ntsc).unwrap();
        device.set_notification_sink(Some(Arc::clone(&sink))).unwrap();
        device.start_streams().unwrap();

        sink.latch().wait();
        device.stop_streams().unwrap();

        use crate::sink::RestartReason;
        assert_eq!(
            sink.latch().take(),
            Some(RestartReason::FormatChange(DisplayMode::Pal))
        );

        pool.poison_quarantined();
        assert!(pool.verify_and_reclaim().passed());
    }
}
