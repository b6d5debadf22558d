//! Capability traits for frame-capture devices.
//!
//! [CameraModule] opens devices (with a bounded retry budget) and
//! [CameraDriver] is the per-device capability set: a typed parameter
//! surface validated against device-reported limits, a hardware clock
//! latch, and blocking frame retrieval with a timeout. Vendor SDKs
//! implement these traits in their own backend crates; this crate carries
//! no vendor code.

use std::time::Duration;

use lockstep_types::ImageFrame;
use tracing::{debug, info, warn};

mod params;

pub use params::{ParamTable, ParamValue};

// ---------------------------
// errors

pub type Result<M> = std::result::Result<M, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No frame arrived within the retrieve timeout. Transient.
    #[error("Timeout")]
    Timeout,
    #[error("connection failed after {attempts} attempts")]
    Connect { attempts: usize },
    #[error("configuration of `{name}` failed: {reason}")]
    Configuration { name: String, reason: String },
    #[error("clock latch failed: {0}")]
    Latch(String),
    #[error("feature not present")]
    FeatureNotPresent,
    #[error("CameraError({0})")]
    Camera(String),
    #[error("{0}")]
    IoError(#[from] std::io::Error),
}

fn _test_error_is_send() {
    // Compile-time test to ensure Error implements Send trait.
    fn implements<T: Send>() {}
    implements::<Error>();
}

impl<'a> From<&'a str> for Error {
    fn from(orig: &'a str) -> Error {
        Error::Camera(orig.to_string())
    }
}

// ---------------------------
// ClockLatch

/// Result of a hardware timestamp latch: the device counter value captured
/// at a host-observable instant, plus the host wall clock read immediately
/// after.
#[derive(Debug, Clone)]
pub struct ClockLatch {
    /// Device counter at the latch, in device ticks.
    pub device_time: u64,
    pub host_time: chrono::DateTime<chrono::Utc>,
}

// ---------------------------
// CapturedFrame

/// One retrieved frame and its raw device timestamp.
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: ImageFrame,
    /// Device hardware counter value for this frame, in device ticks.
    pub device_timestamp: u64,
}

// ---------------------------
// CameraModule

/// A module for opening cameras of one backend.
pub trait CameraModule {
    type CameraType: CameraDriver;

    fn name(&self) -> &str;

    /// Names of the devices this module can currently see.
    fn camera_names(&self) -> Result<Vec<String>>;

    /// Open the named camera once. Called by [CameraModule::connect] inside
    /// the retry loop.
    fn camera(&mut self, name: &str) -> Result<Self::CameraType>;

    /// Open the named camera, retrying up to `retries` times with a fixed
    /// sleep between attempts. Exhausting the budget is fatal.
    fn connect(
        &mut self,
        name: &str,
        retries: usize,
        retry_delay: Duration,
    ) -> Result<Self::CameraType> {
        for attempt in 1..=retries {
            match self.camera(name) {
                Ok(camera) => {
                    info!("connected to camera {name} on attempt {attempt}");
                    return Ok(camera);
                }
                Err(e) => {
                    warn!("connect attempt {attempt}/{retries} to camera {name} failed: {e}");
                    std::thread::sleep(retry_delay);
                }
            }
        }
        Err(Error::Connect { attempts: retries })
    }
}

// ---------------------------
// CameraDriver

/// Per-device capability set.
///
/// The `feature_*` methods mirror the four parameter kinds a GenICam-style
/// node tree exposes. Range and entry queries let
/// [CameraDriver::apply_param_table] validate every value before it is
/// written.
pub trait CameraDriver: Send {
    fn name(&self) -> &str;
    fn serial(&self) -> &str;
    fn model(&self) -> &str;
    fn vendor(&self) -> &str;

    // Settings: integer features ----------------------------
    fn feature_int(&self, name: &str) -> Result<i64>;
    fn feature_int_range(&self, name: &str) -> Result<(i64, i64)>;
    fn feature_int_set(&mut self, name: &str, value: i64) -> Result<()>;

    // Settings: float features ----------------------------
    fn feature_float(&self, name: &str) -> Result<f64>;
    fn feature_float_range(&self, name: &str) -> Result<(f64, f64)>;
    fn feature_float_set(&mut self, name: &str, value: f64) -> Result<()>;

    // Settings: enumeration features ----------------------------
    fn feature_enum(&self, name: &str) -> Result<String>;
    fn feature_enum_entries(&self, name: &str) -> Result<Vec<String>>;
    fn feature_enum_set(&mut self, name: &str, value: &str) -> Result<()>;

    // Settings: boolean features ----------------------------
    fn feature_bool(&self, name: &str) -> Result<bool>;
    fn feature_bool_set(&mut self, name: &str, value: bool) -> Result<()>;

    /// Apply a typed parameter table in order.
    ///
    /// Every value is validated against the device-reported range or entry
    /// set before anything is written; the first violation aborts with
    /// [Error::Configuration] and no further parameter is touched. Partial
    /// application is not assumed safe, so a failure here must abort the
    /// session.
    fn apply_param_table(&mut self, table: &ParamTable) -> Result<()> {
        for (name, value) in table.iter() {
            match value {
                ParamValue::Integer(v) => {
                    let (min, max) = self
                        .feature_int_range(name)
                        .map_err(|e| config_err(name, &e))?;
                    if *v < min || *v > max {
                        return Err(Error::Configuration {
                            name: name.clone(),
                            reason: format!("value {v} outside device range [{min}, {max}]"),
                        });
                    }
                    self.feature_int_set(name, *v)
                        .map_err(|e| config_err(name, &e))?;
                }
                ParamValue::Float(v) => {
                    let (min, max) = self
                        .feature_float_range(name)
                        .map_err(|e| config_err(name, &e))?;
                    if *v < min || *v > max {
                        return Err(Error::Configuration {
                            name: name.clone(),
                            reason: format!("value {v} outside device range [{min}, {max}]"),
                        });
                    }
                    self.feature_float_set(name, *v)
                        .map_err(|e| config_err(name, &e))?;
                }
                ParamValue::Enumeration(v) => {
                    let entries = self
                        .feature_enum_entries(name)
                        .map_err(|e| config_err(name, &e))?;
                    if !entries.iter().any(|entry| entry == v) {
                        return Err(Error::Configuration {
                            name: name.clone(),
                            reason: format!(
                                "entry \"{v}\" not in device entry set {entries:?}"
                            ),
                        });
                    }
                    self.feature_enum_set(name, v)
                        .map_err(|e| config_err(name, &e))?;
                }
                ParamValue::Boolean(v) => {
                    self.feature_bool_set(name, *v)
                        .map_err(|e| config_err(name, &e))?;
                }
            }
            debug!("camera {}: set {} = {:?}", self.name(), name, value);
        }
        Ok(())
    }

    // Clock ----------------------------

    /// Execute a hardware timestamp latch. A latch that cannot be read is
    /// fatal: the device is not usable for synchronized capture.
    fn latch_clock(&mut self) -> Result<ClockLatch>;

    /// Device counter frequency in ticks per second.
    fn timestamp_tick_hz(&self) -> Result<f64>;

    // Acquisition ----------------------------

    fn start_streaming(&mut self) -> Result<()>;
    fn stop_streaming(&mut self) -> Result<()>;

    /// Blocking frame retrieval, bounded by `timeout`.
    ///
    /// [Error::Timeout] means no frame arrived in time and is transient;
    /// any other error is fatal for the device.
    fn retrieve_frame(&mut self, timeout: Duration) -> Result<CapturedFrame>;

    fn close(&mut self) -> Result<()>;
}

fn config_err(name: &str, e: &Error) -> Error {
    Error::Configuration {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// A minimal in-memory driver recording parameter writes.
    struct FakeDriver {
        ints: HashMap<&'static str, (i64, i64, i64)>,
        floats: HashMap<&'static str, (f64, f64, f64)>,
        enums: HashMap<&'static str, (String, Vec<String>)>,
        bools: HashMap<&'static str, bool>,
        writes: Vec<String>,
    }

    impl FakeDriver {
        fn new() -> Self {
            let mut ints = HashMap::new();
            ints.insert("Width", (640, 16, 4096));
            ints.insert("Height", (480, 16, 4096));
            let mut floats = HashMap::new();
            floats.insert("AcquisitionFrameRate", (30.0, 1.0, 500.0));
            let mut enums = HashMap::new();
            enums.insert(
                "AcquisitionMode",
                (
                    "Continuous".to_string(),
                    vec!["Continuous".to_string(), "SingleFrame".to_string()],
                ),
            );
            let mut bools = HashMap::new();
            bools.insert("AcquisitionFrameRateEnable", false);
            Self {
                ints,
                floats,
                enums,
                bools,
                writes: Vec::new(),
            }
        }
    }

    impl CameraDriver for FakeDriver {
        fn name(&self) -> &str {
            "fake0"
        }
        fn serial(&self) -> &str {
            "000"
        }
        fn model(&self) -> &str {
            "fake"
        }
        fn vendor(&self) -> &str {
            "none"
        }

        fn feature_int(&self, name: &str) -> Result<i64> {
            self.ints.get(name).map(|v| v.0).ok_or(Error::FeatureNotPresent)
        }
        fn feature_int_range(&self, name: &str) -> Result<(i64, i64)> {
            self.ints
                .get(name)
                .map(|v| (v.1, v.2))
                .ok_or(Error::FeatureNotPresent)
        }
        fn feature_int_set(&mut self, name: &str, value: i64) -> Result<()> {
            let entry = self.ints.get_mut(name).ok_or(Error::FeatureNotPresent)?;
            entry.0 = value;
            self.writes.push(format!("{name}={value}"));
            Ok(())
        }

        fn feature_float(&self, name: &str) -> Result<f64> {
            self.floats.get(name).map(|v| v.0).ok_or(Error::FeatureNotPresent)
        }
        fn feature_float_range(&self, name: &str) -> Result<(f64, f64)> {
            self.floats
                .get(name)
                .map(|v| (v.1, v.2))
                .ok_or(Error::FeatureNotPresent)
        }
        fn feature_float_set(&mut self, name: &str, value: f64) -> Result<()> {
            let entry = self.floats.get_mut(name).ok_or(Error::FeatureNotPresent)?;
            entry.0 = value;
            self.writes.push(format!("{name}={value}"));
            Ok(())
        }

        fn feature_enum(&self, name: &str) -> Result<String> {
            self.enums
                .get(name)
                .map(|v| v.0.clone())
                .ok_or(Error::FeatureNotPresent)
        }
        fn feature_enum_entries(&self, name: &str) -> Result<Vec<String>> {
            self.enums
                .get(name)
                .map(|v| v.1.clone())
                .ok_or(Error::FeatureNotPresent)
        }
        fn feature_enum_set(&mut self, name: &str, value: &str) -> Result<()> {
            let entry = self.enums.get_mut(name).ok_or(Error::FeatureNotPresent)?;
            entry.0 = value.to_string();
            self.writes.push(format!("{name}={value}"));
            Ok(())
        }

        fn feature_bool(&self, name: &str) -> Result<bool> {
            self.bools.get(name).copied().ok_or(Error::FeatureNotPresent)
        }
        fn feature_bool_set(&mut self, name: &str, value: bool) -> Result<()> {
            let entry = self.bools.get_mut(name).ok_or(Error::FeatureNotPresent)?;
            *entry = value;
            self.writes.push(format!("{name}={value}"));
            Ok(())
        }

        fn latch_clock(&mut self) -> Result<ClockLatch> {
            Ok(ClockLatch {
                device_time: 0,
                host_time: chrono::Utc::now(),
            })
        }
        fn timestamp_tick_hz(&self) -> Result<f64> {
            Ok(1e9)
        }
        fn start_streaming(&mut self) -> Result<()> {
            Ok(())
        }
        fn stop_streaming(&mut self) -> Result<()> {
            Ok(())
        }
        fn retrieve_frame(&mut self, _timeout: Duration) -> Result<CapturedFrame> {
            Err(Error::Timeout)
        }
        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn table(entries: &[(&str, ParamValue)]) -> ParamTable {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn valid_table_applies_in_order() {
        let mut cam = FakeDriver::new();
        let t = table(&[
            ("AcquisitionMode", ParamValue::Enumeration("Continuous".into())),
            ("AcquisitionFrameRateEnable", ParamValue::Boolean(true)),
            ("AcquisitionFrameRate", ParamValue::Float(120.0)),
            ("Width", ParamValue::Integer(1280)),
        ]);
        cam.apply_param_table(&t).unwrap();
        assert_eq!(
            cam.writes,
            vec![
                "AcquisitionMode=Continuous",
                "AcquisitionFrameRateEnable=true",
                "AcquisitionFrameRate=120",
                "Width=1280",
            ]
        );
    }

    #[test]
    fn out_of_range_integer_rejected_before_write() {
        let mut cam = FakeDriver::new();
        let t = table(&[
            ("Width", ParamValue::Integer(10_000)),
            ("Height", ParamValue::Integer(480)),
        ]);
        let err = cam.apply_param_table(&t).unwrap_err();
        match err {
            Error::Configuration { name, reason } => {
                assert_eq!(name, "Width");
                assert!(reason.contains("10000"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        // Nothing was written, including the later valid Height entry.
        assert!(cam.writes.is_empty());
    }

    #[test]
    fn unknown_enum_entry_rejected() {
        let mut cam = FakeDriver::new();
        let t = table(&[(
            "AcquisitionMode",
            ParamValue::Enumeration("MultiFrame".into()),
        )]);
        let err = cam.apply_param_table(&t).unwrap_err();
        match err {
            Error::Configuration { name, reason } => {
                assert_eq!(name, "AcquisitionMode");
                assert!(reason.contains("MultiFrame"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn missing_feature_is_configuration_error() {
        let mut cam = FakeDriver::new();
        let t = table(&[("NoSuchNode", ParamValue::Integer(1))]);
        assert!(matches!(
            cam.apply_param_table(&t),
            Err(Error::Configuration { .. })
        ));
    }
}
