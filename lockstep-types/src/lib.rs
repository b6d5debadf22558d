//! Shared plain-data types for the lockstep acquisition workspace.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use machine_vision_formats::PixFmt;
use serde::{Deserialize, Serialize};

mod stim;
mod timestamp;

pub use stim::{StimulationBlock, StimulationEvent};
pub use timestamp::{datetime_to_f64, f64_to_datetime};

/// Image data with explicit dimensions, stride and pixel format.
#[derive(Clone)]
pub struct ImageFrame {
    /// width in pixels
    pub width: u32,
    /// height in pixels
    pub height: u32,
    /// number of bytes in an image row
    pub stride: u32,
    pub pixel_format: PixFmt,
    /// raw image data
    pub image_data: Vec<u8>,
}

impl std::fmt::Debug for ImageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageFrame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("stride", &self.stride)
            .field("pixel_format", &self.pixel_format)
            .field("image_data", &format_args!("[{} bytes]", self.image_data.len()))
            .finish()
    }
}

/// One captured frame plus everything needed to place it on the session
/// timeline.
///
/// Produced exclusively by the capture loop. The payload is shared with
/// every sink through an [Arc], so each consumer gets an immutable view and
/// no copy is made during fan-out.
#[derive(Debug, Clone)]
pub struct FrameEnvelope {
    /// Monotonic per-device count, starting at 1 for the first frame.
    pub frame_number: u64,
    /// The device hardware counter value for this frame, in device ticks.
    pub device_timestamp_raw: u64,
    /// Device timestamp mapped onto the host clock via [ClockOffset],
    /// seconds since the UNIX epoch.
    pub synced_timestamp: f64,
    /// Host wall clock at the moment the frame arrived in the capture loop.
    pub arrival_wallclock: DateTime<Utc>,
    pub payload: Arc<ImageFrame>,
}

/// A one-time mapping from the device hardware clock to the host clock.
///
/// Computed exactly once per session, before the first frame is retrieved,
/// from a hardware latch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockOffset {
    /// Host time observed at the latch instant, seconds since the UNIX epoch.
    pub host_time_at_latch: f64,
    /// Device counter value reported by the latch, in device ticks.
    pub device_time_at_latch: u64,
    /// Device counter frequency in ticks per second.
    pub tick_hz: f64,
}

impl ClockOffset {
    /// Map a raw device timestamp onto the host clock.
    ///
    /// The integer tick difference is taken before any floating-point
    /// arithmetic, so `synced_time(device_time_at_latch)` reproduces
    /// `host_time_at_latch` exactly.
    pub fn synced_time(&self, device_timestamp_raw: u64) -> f64 {
        let dticks = device_timestamp_raw as i128 - self.device_time_at_latch as i128;
        self.host_time_at_latch + dticks as f64 / self.tick_hz
    }
}

/// How frame acquisition is clocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    /// The device free-runs at its configured frame rate.
    Software,
    /// Each exposure is driven by the external controller's pulse clock.
    External,
}

/// Which consumers receive captured frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSet {
    #[serde(default = "default_true")]
    pub disk: bool,
    #[serde(default)]
    pub preview: bool,
    #[serde(default)]
    pub predict: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SinkSet {
    fn default() -> Self {
        Self {
            disk: true,
            preview: false,
            predict: false,
        }
    }
}

/// Per-frame record persisted alongside the movie file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetadataRow {
    pub frame_number: u64,
    pub device_timestamp_raw: u64,
    pub synced_timestamp: f64,
    pub arrival_wallclock: DateTime<Utc>,
    /// Acquisition rate measured from successive arrival times, Hz.
    pub measured_fps: f64,
}
