//! Capture device collaborator contract.
//!
//! The harness never talks to hardware directly; everything it needs
//! from a capture driver is behind [`CaptureDevice`]. The driver side
//! of the bargain is that it requests every frame buffer through the
//! session's [`BufferPool`] and reports format changes and frame
//! arrivals through the session's [`NotificationSink`], both on its
//! own delivery thread.

use std::fmt;
use std::sync::Arc;

use poisonpool::BufferPool;
use thiserror::Error;

use crate::sink::NotificationSink;

/// Video input modes the harness knows how to name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayMode {
    Ntsc,
    Pal,
    Hd720p50,
    Hd720p5994,
    Hd720p60,
    Hd1080i50,
    Hd1080i5994,
    Hd1080p24,
    Hd1080p25,
    Hd1080p2997,
    Hd1080p30,
    Hd1080p50,
    Hd1080p5994,
    Uhd2160p25,
    Uhd2160p2997,
}

impl DisplayMode {
    pub fn name(&self) -> &'static str {
        match self {
            DisplayMode::Ntsc => "NTSC",
            DisplayMode::Pal => "PAL",
            DisplayMode::Hd720p50 => "HD720p50",
            DisplayMode::Hd720p5994 => "HD720p5994",
            DisplayMode::Hd720p60 => "HD720p60",
            DisplayMode::Hd1080i50 => "HD1080i50",
            DisplayMode::Hd1080i5994 => "HD1080i5994",
            DisplayMode::Hd1080p24 => "HD1080p24",
            DisplayMode::Hd1080p25 => "HD1080p25",
            DisplayMode::Hd1080p2997 => "HD1080p2997",
            DisplayMode::Hd1080p30 => "HD1080p30",
            DisplayMode::Hd1080p50 => "HD1080p50",
            DisplayMode::Hd1080p5994 => "HD1080p5994",
            DisplayMode::Uhd2160p25 => "4K2160p25",
            DisplayMode::Uhd2160p2997 => "4K2160p2997",
        }
    }

    /// Active picture dimensions in pixels.
    pub fn dimensions(&self) -> (usize, usize) {
        match self {
            DisplayMode::Ntsc => (720, 486),
            DisplayMode::Pal => (720, 576),
            DisplayMode::Hd720p50 | DisplayMode::Hd720p5994 | DisplayMode::Hd720p60 => (1280, 720),
            DisplayMode::Hd1080i50
            | DisplayMode::Hd1080i5994
            | DisplayMode::Hd1080p24
            | DisplayMode::Hd1080p25
            | DisplayMode::Hd1080p2997
            | DisplayMode::Hd1080p30
            | DisplayMode::Hd1080p50
            | DisplayMode::Hd1080p5994 => (1920, 1080),
            DisplayMode::Uhd2160p25 | DisplayMode::Uhd2160p2997 => (3840, 2160),
        }
    }

    /// Frame buffer size for 8-bit YCbCr 4:2:2 (two bytes per pixel).
    pub fn frame_bytes(&self) -> usize {
        let (width, height) = self.dimensions();
        width * height * 2
    }
}

impl Default for DisplayMode {
    fn default() -> Self {
        DisplayMode::Hd720p5994
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Audio capture parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioParams {
    pub sample_rate: u32,
    pub sample_bits: u32,
    pub channels: u32,
}

impl Default for AudioParams {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            sample_bits: 32,
            channels: 16,
        }
    }
}

/// Failure of a single device operation.
///
/// The session recovers from these locally: the failing step is
/// logged and the already-completed steps are torn down best-effort.
/// A device error never aborts the run by itself.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("operation not supported: {0}")]
    NotSupported(&'static str),
    #[error("device in the wrong state: {0}")]
    WrongState(&'static str),
    #[error("device backend error: {0}")]
    Backend(String),
}

/// Everything the capture session requires from a device driver.
///
/// Call order per capture cycle: buffer provider, input connection
/// query (best-effort), `enable_video`, `enable_audio`, notification
/// sink, `start_streams`; teardown runs the reverse. Implementations
/// deliver frames asynchronously between `start_streams` and
/// `stop_streams`, allocating through the provided pool and reporting
/// through the provided sink.
pub trait CaptureDevice: Send {
    fn name(&self) -> &str;

    /// Pick an input connection from the device capability set.
    /// Best-effort; the session continues when this fails.
    fn select_input_connection(&mut self) -> Result<(), DeviceError>;

    fn set_buffer_provider(&mut self, pool: Option<Arc<BufferPool>>) -> Result<(), DeviceError>;

    fn set_notification_sink(
        &mut self,
        sink: Option<Arc<NotificationSink>>,
    ) -> Result<(), DeviceError>;

    fn enable_video(&mut self, mode: DisplayMode) -> Result<(), DeviceError>;

    fn enable_audio(&mut self, params: AudioParams) -> Result<(), DeviceError>;

    fn start_streams(&mut self) -> Result<(), DeviceError>;

    fn stop_streams(&mut self) -> Result<(), DeviceError>;

    fn disable_video(&mut self) -> Result<(), DeviceError>;

    fn disable_audio(&mut self) -> Result<(), DeviceError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bytes_match_dimensions() {
        assert_eq!(DisplayMode::Hd720p5994.frame_bytes(), 1280 * 720 * 2);
        assert_eq!(DisplayMode::Hd1080p25.frame_bytes(), 1920 * 1080 * 2);
        assert_eq!(DisplayMode::Ntsc.frame_bytes(), 720 * 486 * 2);
    }

    #[test]
    fn mode_names_are_stable() {
        assert_eq!(DisplayMode::default().to_string(), "HD720p5994");
        assert_eq!(DisplayMode::Uhd2160p2997.to_string(), "4K2160p2997");
    }
}
