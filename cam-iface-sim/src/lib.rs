//! Simulated camera backend.
//!
//! Produces synthetic Mono8 frames paced by the configured
//! `AcquisitionFrameRate`, keeps a nanosecond device tick counter for latch
//! operations, and honors the `TriggerMode` feature: with triggering `On`
//! no frame is produced until the external pulse gate opens. Connect and
//! latch failures can be injected for testing the fatal setup paths.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_iface::{CameraDriver, CameraModule, CapturedFrame, ClockLatch, Error, Result};
use lockstep_types::ImageFrame;
use machine_vision_formats::PixFmt;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Configuration of one simulated device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimCameraConfig {
    pub name: String,
    #[serde(default = "default_serial")]
    pub serial: String,
    /// An absent device fails every connect attempt.
    #[serde(default = "default_true")]
    pub present: bool,
    /// Device counter frequency, ticks per second.
    #[serde(default = "default_tick_hz")]
    pub tick_hz: f64,
    /// Fail the timestamp latch, for exercising the fatal setup path.
    #[serde(default)]
    pub fail_latch: bool,
}

fn default_serial() -> String {
    "40000000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_tick_hz() -> f64 {
    1e9
}

impl SimCameraConfig {
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            serial: default_serial(),
            present: true,
            tick_hz: default_tick_hz(),
            fail_latch: false,
        }
    }

    pub fn absent(name: &str) -> Self {
        Self {
            present: false,
            ..Self::named(name)
        }
    }
}

/// A module holding the configured simulated devices.
pub struct SimCameraModule {
    cameras: Vec<SimCameraConfig>,
}

impl SimCameraModule {
    pub fn new(cameras: Vec<SimCameraConfig>) -> Self {
        Self { cameras }
    }
}

impl CameraModule for SimCameraModule {
    type CameraType = SimCamera;

    fn name(&self) -> &str {
        "sim"
    }

    fn camera_names(&self) -> Result<Vec<String>> {
        Ok(self
            .cameras
            .iter()
            .filter(|c| c.present)
            .map(|c| c.name.clone())
            .collect())
    }

    fn camera(&mut self, name: &str) -> Result<SimCamera> {
        let config = self
            .cameras
            .iter()
            .find(|c| c.name == name)
            .ok_or_else(|| Error::Camera(format!("no simulated camera named {name}")))?;
        if !config.present {
            return Err(Error::Camera(format!("camera {name} not responding")));
        }
        Ok(SimCamera::new(config.clone()))
    }
}

#[derive(Debug)]
enum SimFeature {
    Int { value: i64, min: i64, max: i64 },
    Float { value: f64, min: f64, max: f64 },
    Enum { value: String, entries: Vec<String> },
    Bool { value: bool },
}

fn default_node_tree() -> HashMap<String, SimFeature> {
    let mut nodes = HashMap::new();
    nodes.insert(
        "Width".to_string(),
        SimFeature::Int {
            value: 640,
            min: 16,
            max: 4096,
        },
    );
    nodes.insert(
        "Height".to_string(),
        SimFeature::Int {
            value: 480,
            min: 16,
            max: 4096,
        },
    );
    nodes.insert(
        "AcquisitionFrameRate".to_string(),
        SimFeature::Float {
            value: 30.0,
            min: 1.0,
            max: 1000.0,
        },
    );
    nodes.insert(
        "ExposureTime".to_string(),
        SimFeature::Float {
            value: 5000.0,
            min: 10.0,
            max: 1_000_000.0,
        },
    );
    nodes.insert(
        "AcquisitionFrameRateEnable".to_string(),
        SimFeature::Bool { value: false },
    );
    nodes.insert(
        "AcquisitionMode".to_string(),
        SimFeature::Enum {
            value: "Continuous".to_string(),
            entries: vec!["Continuous".to_string(), "SingleFrame".to_string()],
        },
    );
    nodes.insert(
        "PixelFormat".to_string(),
        SimFeature::Enum {
            value: "Mono8".to_string(),
            entries: vec!["Mono8".to_string()],
        },
    );
    nodes.insert(
        "TriggerMode".to_string(),
        SimFeature::Enum {
            value: "Off".to_string(),
            entries: vec!["Off".to_string(), "On".to_string()],
        },
    );
    nodes
}

/// One simulated device.
#[derive(Debug)]
pub struct SimCamera {
    config: SimCameraConfig,
    nodes: HashMap<String, SimFeature>,
    /// Device clock zero.
    epoch: Instant,
    streaming: bool,
    /// Pacing origin while streaming: stream start for software trigger,
    /// gate-open instant for external trigger.
    pace_origin: Option<Instant>,
    frames_emitted: u64,
    pulse_gate: Arc<AtomicBool>,
}

impl SimCamera {
    fn new(config: SimCameraConfig) -> Self {
        Self {
            config,
            nodes: default_node_tree(),
            epoch: Instant::now(),
            streaming: false,
            pace_origin: None,
            frames_emitted: 0,
            pulse_gate: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle standing in for the controller's pulse output. While
    /// `TriggerMode` is `On`, no frame is produced until this goes up.
    pub fn pulse_gate(&self) -> Arc<AtomicBool> {
        self.pulse_gate.clone()
    }

    fn device_ticks(&self) -> u64 {
        (self.epoch.elapsed().as_secs_f64() * self.config.tick_hz) as u64
    }

    fn externally_triggered(&self) -> bool {
        matches!(
            self.nodes.get("TriggerMode"),
            Some(SimFeature::Enum { value, .. }) if value == "On"
        )
    }

    fn frame_rate(&self) -> f64 {
        match self.nodes.get("AcquisitionFrameRate") {
            Some(SimFeature::Float { value, .. }) => *value,
            _ => 30.0,
        }
    }

    fn dims(&self) -> (u32, u32) {
        let width = match self.nodes.get("Width") {
            Some(SimFeature::Int { value, .. }) => *value as u32,
            _ => 640,
        };
        let height = match self.nodes.get("Height") {
            Some(SimFeature::Int { value, .. }) => *value as u32,
            _ => 480,
        };
        (width, height)
    }

    fn generate_frame(&self) -> ImageFrame {
        let (width, height) = self.dims();
        let stride = width;
        let mut image_data = vec![0u8; (stride * height) as usize];
        let phase = self.frames_emitted as u32;
        for y in 0..height {
            for x in 0..width {
                image_data[(y * stride + x) as usize] = (x + y + phase) as u8;
            }
        }
        ImageFrame {
            width,
            height,
            stride,
            pixel_format: PixFmt::Mono8,
            image_data,
        }
    }
}

impl CameraDriver for SimCamera {
    fn name(&self) -> &str {
        &self.config.name
    }
    fn serial(&self) -> &str {
        &self.config.serial
    }
    fn model(&self) -> &str {
        "sim-2040"
    }
    fn vendor(&self) -> &str {
        "lockstep"
    }

    fn feature_int(&self, name: &str) -> Result<i64> {
        match self.nodes.get(name) {
            Some(SimFeature::Int { value, .. }) => Ok(*value),
            Some(_) => Err(Error::Camera(format!("{name} is not an integer feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_int_range(&self, name: &str) -> Result<(i64, i64)> {
        match self.nodes.get(name) {
            Some(SimFeature::Int { min, max, .. }) => Ok((*min, *max)),
            Some(_) => Err(Error::Camera(format!("{name} is not an integer feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_int_set(&mut self, name: &str, new_value: i64) -> Result<()> {
        match self.nodes.get_mut(name) {
            Some(SimFeature::Int { value, .. }) => {
                *value = new_value;
                Ok(())
            }
            Some(_) => Err(Error::Camera(format!("{name} is not an integer feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }

    fn feature_float(&self, name: &str) -> Result<f64> {
        match self.nodes.get(name) {
            Some(SimFeature::Float { value, .. }) => Ok(*value),
            Some(_) => Err(Error::Camera(format!("{name} is not a float feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_float_range(&self, name: &str) -> Result<(f64, f64)> {
        match self.nodes.get(name) {
            Some(SimFeature::Float { min, max, .. }) => Ok((*min, *max)),
            Some(_) => Err(Error::Camera(format!("{name} is not a float feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_float_set(&mut self, name: &str, new_value: f64) -> Result<()> {
        match self.nodes.get_mut(name) {
            Some(SimFeature::Float { value, .. }) => {
                *value = new_value;
                Ok(())
            }
            Some(_) => Err(Error::Camera(format!("{name} is not a float feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }

    fn feature_enum(&self, name: &str) -> Result<String> {
        match self.nodes.get(name) {
            Some(SimFeature::Enum { value, .. }) => Ok(value.clone()),
            Some(_) => Err(Error::Camera(format!("{name} is not an enumeration"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_enum_entries(&self, name: &str) -> Result<Vec<String>> {
        match self.nodes.get(name) {
            Some(SimFeature::Enum { entries, .. }) => Ok(entries.clone()),
            Some(_) => Err(Error::Camera(format!("{name} is not an enumeration"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_enum_set(&mut self, name: &str, new_value: &str) -> Result<()> {
        match self.nodes.get_mut(name) {
            Some(SimFeature::Enum { value, entries }) => {
                if !entries.iter().any(|e| e == new_value) {
                    return Err(Error::Camera(format!(
                        "entry {new_value} not valid for {name}"
                    )));
                }
                *value = new_value.to_string();
                Ok(())
            }
            Some(_) => Err(Error::Camera(format!("{name} is not an enumeration"))),
            None => Err(Error::FeatureNotPresent),
        }
    }

    fn feature_bool(&self, name: &str) -> Result<bool> {
        match self.nodes.get(name) {
            Some(SimFeature::Bool { value }) => Ok(*value),
            Some(_) => Err(Error::Camera(format!("{name} is not a boolean feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }
    fn feature_bool_set(&mut self, name: &str, new_value: bool) -> Result<()> {
        match self.nodes.get_mut(name) {
            Some(SimFeature::Bool { value }) => {
                *value = new_value;
                Ok(())
            }
            Some(_) => Err(Error::Camera(format!("{name} is not a boolean feature"))),
            None => Err(Error::FeatureNotPresent),
        }
    }

    fn latch_clock(&mut self) -> Result<ClockLatch> {
        if self.config.fail_latch {
            return Err(Error::Latch("latch register read failed".to_string()));
        }
        let device_time = self.device_ticks();
        let host_time = chrono::Utc::now();
        Ok(ClockLatch {
            device_time,
            host_time,
        })
    }

    fn timestamp_tick_hz(&self) -> Result<f64> {
        Ok(self.config.tick_hz)
    }

    fn start_streaming(&mut self) -> Result<()> {
        self.streaming = true;
        self.frames_emitted = 0;
        self.pace_origin = if self.externally_triggered() {
            // Pacing begins when the pulse gate opens.
            None
        } else {
            Some(Instant::now())
        };
        debug!("camera {}: streaming started", self.config.name);
        Ok(())
    }

    fn stop_streaming(&mut self) -> Result<()> {
        self.streaming = false;
        self.pace_origin = None;
        Ok(())
    }

    fn retrieve_frame(&mut self, timeout: Duration) -> Result<CapturedFrame> {
        if !self.streaming {
            return Err(Error::Camera("retrieve while not streaming".to_string()));
        }

        if self.externally_triggered() && self.pace_origin.is_none() {
            if self.pulse_gate.load(Ordering::Relaxed) {
                self.pace_origin = Some(Instant::now());
            } else {
                std::thread::sleep(timeout);
                return Err(Error::Timeout);
            }
        }

        let origin = match self.pace_origin {
            Some(origin) => origin,
            None => unreachable!("pace origin set above"),
        };
        let rate = self.frame_rate();
        let due = origin + Duration::from_secs_f64((self.frames_emitted + 1) as f64 / rate);
        let now = Instant::now();
        if due > now + timeout {
            std::thread::sleep(timeout);
            return Err(Error::Timeout);
        }
        if due > now {
            std::thread::sleep(due - now);
        }

        let image = self.generate_frame();
        self.frames_emitted += 1;
        Ok(CapturedFrame {
            image,
            device_timestamp: self.device_ticks(),
        })
    }

    fn close(&mut self) -> Result<()> {
        self.streaming = false;
        debug!("camera {}: closed", self.config.name);
        Ok(())
    }
}
