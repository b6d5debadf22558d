//! Per-device capture state machine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_iface::CameraDriver;
use frame_sinks::{DiskSink, PredictSink, PreviewSink};
use lockstep_types::{ClockOffset, FrameEnvelope, TriggerMode};
use tracing::{debug, info, warn};

use crate::{clock, Error, Result};

/// Fixed per-source settings, immutable after arm.
#[derive(Debug, Clone)]
pub struct FrameSourceConfig {
    pub target_count: u64,
    pub trigger_mode: TriggerMode,
    pub retrieve_timeout: Duration,
    pub report_period: Duration,
}

impl Default for FrameSourceConfig {
    fn default() -> Self {
        Self {
            target_count: 0,
            trigger_mode: TriggerMode::Software,
            retrieve_timeout: Duration::from_millis(500),
            report_period: Duration::from_secs(5),
        }
    }
}

/// The enabled sinks of one source. Each policy gets its own push call
/// site: disk must not drop, preview and predict never block.
pub struct SinkBundle {
    pub disk: Option<DiskSink>,
    pub preview: Option<PreviewSink>,
    pub predict: Option<PredictSink>,
}

impl SinkBundle {
    pub fn none() -> Self {
        Self {
            disk: None,
            preview: None,
            predict: None,
        }
    }

    fn dispatch(&self, frame: &FrameEnvelope) -> Result<()> {
        if let Some(disk) = &self.disk {
            // Must-not-drop: blocks only when a bounded queue is full.
            disk.push(frame.clone())?;
        }
        if let Some(preview) = &self.preview {
            preview.push(frame.clone());
        }
        if let Some(predict) = &self.predict {
            predict.push(frame.clone());
        }
        Ok(())
    }

    /// Stop all workers, flushing queued frames on the disk sink. Every
    /// sink is joined even if an earlier one failed.
    fn finish(self) -> Result<()> {
        let mut first_err: Option<Error> = None;
        let mut note = |r: std::result::Result<(), frame_sinks::Error>| {
            if let Err(e) = r {
                if first_err.is_none() {
                    first_err = Some(e.into());
                }
            }
        };
        if let Some(disk) = self.disk {
            note(disk.finish());
        }
        if let Some(preview) = self.preview {
            note(preview.finish());
        }
        if let Some(predict) = self.predict {
            note(predict.finish());
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Idle,
    Connecting,
    Configured,
    Armed,
    Streaming,
    Draining,
    Closed,
}

/// Completion summary of one capture run.
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub name: String,
    pub frames: u64,
    pub elapsed: Duration,
    pub mean_fps: f64,
}

/// Drives one device through
/// connect → configure → arm → stream → drain → close.
pub struct FrameSource {
    name: String,
    state: SourceState,
    camera: Option<Box<dyn CameraDriver>>,
    clock_offset: Option<ClockOffset>,
    config: FrameSourceConfig,
    frame_number: u64,
}

impl FrameSource {
    pub fn new(name: &str, config: FrameSourceConfig) -> Self {
        Self {
            name: name.to_string(),
            state: SourceState::Idle,
            camera: None,
            clock_offset: None,
            config,
            frame_number: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub fn clock_offset(&self) -> Option<&ClockOffset> {
        self.clock_offset.as_ref()
    }

    fn set_state(&mut self, next: SourceState) {
        debug!("{}: {:?} -> {:?}", self.name, self.state, next);
        self.state = next;
    }

    fn camera_mut(&mut self) -> Result<&mut Box<dyn CameraDriver>> {
        self.camera
            .as_mut()
            .ok_or_else(|| Error::Config(format!("camera {} not connected", self.name)))
    }

    /// Connect via `connector`, which performs the backend's bounded retry
    /// loop. Exhausting the retry budget is fatal.
    pub fn connect<F>(&mut self, connector: F) -> Result<()>
    where
        F: FnOnce() -> cam_iface::Result<Box<dyn CameraDriver>>,
    {
        self.set_state(SourceState::Connecting);
        let camera = connector()?;
        info!(
            "{}: connected to {} (serial {}, {} {})",
            self.name,
            camera.name(),
            camera.serial(),
            camera.vendor(),
            camera.model()
        );
        self.camera = Some(camera);
        Ok(())
    }

    /// Apply the parameter table and latch the device clock. Both are
    /// fatal on failure: partial parameter application is not assumed
    /// safe, and an unlatched clock cannot stamp frames.
    pub fn configure(&mut self, params: &cam_iface::ParamTable) -> Result<()> {
        let camera = self.camera_mut()?;
        camera.apply_param_table(params)?;
        let offset = clock::compute_offset(camera.as_mut())?;
        self.clock_offset = Some(offset);
        self.set_state(SourceState::Configured);
        Ok(())
    }

    /// Start the device's continuous-grab mode.
    pub fn arm(&mut self) -> Result<()> {
        self.camera_mut()?.start_streaming()?;
        self.set_state(SourceState::Armed);
        Ok(())
    }

    /// Stream until the target frame count is reached or `stop` goes up,
    /// then drain the sinks and close the device.
    ///
    /// Termination convention: the loop exits as soon as the
    /// post-increment frame number reaches the target, so a completed run
    /// captures exactly `target_count` frames.
    pub fn run(mut self, sinks: SinkBundle, stop: Arc<AtomicBool>) -> Result<SourceReport> {
        let stream_result = self.stream_loop(&sinks, &stop);

        self.set_state(SourceState::Draining);
        let sink_result = sinks.finish();
        let close_result = self.close();

        let report = stream_result?;
        sink_result?;
        close_result?;
        Ok(report)
    }

    fn stream_loop(&mut self, sinks: &SinkBundle, stop: &AtomicBool) -> Result<SourceReport> {
        self.set_state(SourceState::Streaming);
        let started = Instant::now();
        let mut last_heartbeat = Instant::now();
        let mut last_report = Instant::now();
        let mut frames_at_last_report: u64 = 0;

        while !stop.load(Ordering::Relaxed) {
            let retrieve_timeout = self.config.retrieve_timeout;
            let captured = match self.camera_mut()?.retrieve_frame(retrieve_timeout) {
                Ok(captured) => captured,
                Err(cam_iface::Error::Timeout) => {
                    // Transient: the frame counter does not move.
                    if self.frame_number == 0
                        && self.config.trigger_mode == TriggerMode::External
                    {
                        if last_heartbeat.elapsed() >= Duration::from_secs(5) {
                            info!("{}: waiting for external trigger", self.name);
                            last_heartbeat = Instant::now();
                        }
                    } else {
                        debug!("{}: frame retrieve timeout", self.name);
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            self.frame_number += 1;
            let clock_offset = self
                .clock_offset
                .as_ref()
                .ok_or_else(|| Error::Config(format!("camera {} has no clock offset", self.name)))?;
            let frame = FrameEnvelope {
                frame_number: self.frame_number,
                device_timestamp_raw: captured.device_timestamp,
                synced_timestamp: clock_offset.synced_time(captured.device_timestamp),
                arrival_wallclock: chrono::Utc::now(),
                payload: Arc::new(captured.image),
            };
            sinks.dispatch(&frame)?;

            if self.frame_number >= self.config.target_count {
                break;
            }

            if last_report.elapsed() >= self.config.report_period {
                let measured = (self.frame_number - frames_at_last_report) as f64
                    / last_report.elapsed().as_secs_f64();
                info!(
                    "{}: {}/{} frames, {:.1} Hz",
                    self.name, self.frame_number, self.config.target_count, measured
                );
                last_report = Instant::now();
                frames_at_last_report = self.frame_number;
            }
        }

        let elapsed = started.elapsed();
        if stop.load(Ordering::Relaxed) && self.frame_number < self.config.target_count {
            warn!(
                "{}: cancelled after {} of {} frames",
                self.name, self.frame_number, self.config.target_count
            );
        } else {
            info!(
                "{}: acquired {} frames in {:.2} s",
                self.name,
                self.frame_number,
                elapsed.as_secs_f64()
            );
        }
        Ok(SourceReport {
            name: self.name.clone(),
            frames: self.frame_number,
            elapsed,
            mean_fps: self.frame_number as f64 / elapsed.as_secs_f64().max(f64::EPSILON),
        })
    }

    fn close(&mut self) -> Result<()> {
        if let Some(camera) = self.camera.as_mut() {
            let stop_result = camera.stop_streaming();
            let close_result = camera.close();
            stop_result?;
            close_result?;
        }
        self.set_state(SourceState::Closed);
        Ok(())
    }

    /// Release the device after a setup failure elsewhere in the session.
    pub fn abort(mut self) {
        if let Err(e) = self.close() {
            warn!("{}: error while aborting: {e}", self.name);
        }
    }
}
