//! Device-to-host clock synchronization.

use cam_iface::CameraDriver;
use lockstep_types::{datetime_to_f64, ClockOffset};
use tracing::info;

use crate::Result;

/// Compute the device-to-host clock mapping from a hardware latch.
///
/// Runs exactly once per session, before the first frame is retrieved; the
/// resulting offset stamps every frame for the session's lifetime. A latch
/// that cannot be read makes the device unusable, so the error is fatal.
pub fn compute_offset(camera: &mut dyn CameraDriver) -> Result<ClockOffset> {
    let latch = camera.latch_clock()?;
    let tick_hz = camera.timestamp_tick_hz()?;
    let offset = ClockOffset {
        host_time_at_latch: datetime_to_f64(&latch.host_time),
        device_time_at_latch: latch.device_time,
        tick_hz,
    };
    info!(
        "camera {}: latched device clock at {} ticks ({} Hz) against host {}",
        camera.name(),
        offset.device_time_at_latch,
        offset.tick_hz,
        latch.host_time
    );
    Ok(offset)
}
