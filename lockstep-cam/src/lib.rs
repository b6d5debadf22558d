//! Lock-step multi-camera acquisition.
//!
//! Drives one [frame_source::FrameSource] per configured device in
//! parallel, reconciles each device's hardware clock with the host clock,
//! and fans captured frames out to disk/preview/predictor sinks. When an
//! external trigger is configured it also arms a serial
//! [pulse_box::TriggerController] that paces every camera and sequences the
//! stimulation schedule.

pub mod clock;
pub mod config;
pub mod frame_source;
pub mod logging;
pub mod session;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("camera error: {0}")]
    Camera(#[from] cam_iface::Error),
    #[error("sink error: {0}")]
    Sink(#[from] frame_sinks::Error),
    #[error("trigger controller error: {0}")]
    Trigger(#[from] pulse_box::Error),
    #[error("stimulation schedule error: {0}")]
    Schedule(#[from] stim_schedule::ScheduleError),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("capture thread for camera {0} panicked")]
    CaptureThreadPanicked(String),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}
