//! Session orchestration: fans every configured device out onto its own
//! capture thread, arms the trigger controller only after all sources are
//! ready, and collects completion without letting one device's failure
//! swallow another's.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cam_iface::{CameraDriver, CameraModule, ParamValue};
use cam_iface_sim::{SimCameraConfig, SimCameraModule};
use frame_sinks::{
    DiskSink, MetadataWriter, NullDisplay, PredictSink, PreviewSink, RawMovieWriter,
    StubPredictor,
};
use lockstep_types::{SinkSet, StimulationBlock, StimulationEvent, TriggerMode};
use pulse_box::{TriggerController, TriggerLink};
use tracing::{error, info, warn};

use crate::config::{CamConfig, DriverKind, RigConfig};
use crate::frame_source::{FrameSource, FrameSourceConfig, SinkBundle, SourceReport};
use crate::{Error, Result};

/// Session-wide settings assembled from the command line.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub n_total_frames: u64,
    pub trigger_mode: TriggerMode,
    pub sinks: SinkSet,
    pub connect_retries: usize,
    pub connect_retry_delay: Duration,
    pub retrieve_timeout: Duration,
    pub report_period: Duration,
    /// Where movie and metadata files land. `None` disables the disk sink.
    pub session_dir: Option<PathBuf>,
    /// Serial device of the trigger controller, for external trigger mode.
    pub trigger_port: Option<String>,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            n_total_frames: 0,
            trigger_mode: TriggerMode::Software,
            sinks: SinkSet::default(),
            connect_retries: 20,
            connect_retry_delay: Duration::from_millis(100),
            retrieve_timeout: Duration::from_millis(500),
            report_period: Duration::from_secs(5),
            session_dir: None,
            trigger_port: None,
        }
    }
}

struct BuiltSource {
    source: FrameSource,
    sinks: SinkBundle,
    /// Simulated pulse output; raised when the controller fires.
    gate: Option<Arc<AtomicBool>>,
}

/// Run one acquisition session to completion.
///
/// Order of operations: compile the stimulation schedule (nothing touches
/// hardware if it fails), connect/configure/latch every device, arm every
/// device, then rate → schedule → fire on the controller, then await all
/// capture threads. Shutdown always drains sinks and resets the
/// controller, whether the session completed, failed, or was cancelled.
///
/// `link_override` substitutes the controller transport, used by tests.
pub fn run_session(
    rig: &RigConfig,
    settings: &SessionSettings,
    blocks: Option<&[StimulationBlock]>,
    link_override: Option<Box<dyn TriggerLink>>,
    stop: Arc<AtomicBool>,
) -> Result<Vec<SourceReport>> {
    let fps = shared_fps(rig)?;

    // Fatal-before-hardware: a schedule that does not compile leaves every
    // device and the controller untouched.
    let schedule: Option<Vec<StimulationEvent>> = blocks
        .map(|blocks| stim_schedule::compile(blocks, fps, settings.n_total_frames))
        .transpose()?;

    match rig.disk_queue_frames {
        Some(bound) => info!(
            "disk queue bounded to {bound} frames; capture blocks when full"
        ),
        None => info!("disk queue unbounded; zero frame loss over bounded memory"),
    }

    // Connect, configure and latch every device before arming any.
    let mut built: Vec<BuiltSource> = Vec::new();
    for cam in &rig.cams {
        match build_source(cam, rig, settings, fps) {
            Ok(b) => built.push(b),
            Err(e) => {
                error!("setup of camera {} failed: {e}", cam.name);
                abort_all(built);
                return Err(e);
            }
        }
    }

    let controller = match make_controller(settings, link_override) {
        Ok(controller) => controller,
        Err(e) => {
            abort_all(built);
            return Err(e);
        }
    };

    // Arm everything before the shared rate/fire commands are issued.
    let mut arm_err: Option<Error> = None;
    for b in &mut built {
        if let Err(e) = b.source.arm() {
            error!("arming camera {} failed: {e}", b.source.name());
            arm_err = Some(e);
            break;
        }
    }
    if let Some(e) = arm_err {
        if let Some(controller) = controller {
            if let Err(e2) = controller.shutdown() {
                warn!("controller shutdown failed: {e2}");
            }
        }
        abort_all(built);
        return Err(e);
    }

    // One capture thread per device.
    let mut gates = Vec::new();
    let mut handles = Vec::new();
    for b in built {
        let BuiltSource {
            source,
            sinks,
            gate,
        } = b;
        if let Some(gate) = gate {
            gates.push(gate);
        }
        let name = source.name().to_string();
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("frame-source-{name}"))
            .spawn(move || {
                let result = source.run(sinks, thread_stop.clone());
                if result.is_err() {
                    // One device's fatal error drains every other source.
                    thread_stop.store(true, Ordering::Relaxed);
                }
                result
            })
            .map_err(|e| Error::Config(format!("spawning capture thread failed: {e}")))?;
        handles.push((name, handle));
    }

    // Rate, schedule, fire.
    let fire_result = start_trigger(&controller, fps, schedule.as_deref());
    match &fire_result {
        Ok(()) => {
            for gate in &gates {
                gate.store(true, Ordering::Relaxed);
            }
        }
        Err(e) => {
            error!("starting the trigger controller failed: {e}");
            stop.store(true, Ordering::Relaxed);
        }
    }

    // Collect every device's result; the first error wins but all are
    // logged and all threads are joined.
    let mut reports = Vec::new();
    let mut first_err: Option<Error> = None;
    for (name, handle) in handles {
        match handle.join() {
            Ok(Ok(report)) => {
                info!(
                    "{}: {} frames in {:.2} s ({:.1} Hz mean)",
                    report.name,
                    report.frames,
                    report.elapsed.as_secs_f64(),
                    report.mean_fps
                );
                reports.push(report);
            }
            Ok(Err(e)) => {
                error!("camera {name} failed: {e}");
                first_err.get_or_insert(e);
            }
            Err(_) => {
                error!("capture thread for camera {name} panicked");
                first_err.get_or_insert(Error::CaptureThreadPanicked(name));
            }
        }
    }

    // Stop and reset the controller last.
    if let Some(controller) = controller {
        if let Err(e) = controller.shutdown() {
            warn!("controller shutdown failed: {e}");
            first_err.get_or_insert(e.into());
        }
    }

    fire_result?;
    match first_err {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

/// All cameras must agree on the acquisition rate: one shared `S,<fps>`
/// drives every device.
fn shared_fps(rig: &RigConfig) -> Result<f64> {
    let mut shared: Option<f64> = None;
    for cam in &rig.cams {
        let fps = cam.acquisition_fps().ok_or_else(|| {
            Error::Config(format!(
                "camera {} has no AcquisitionFrameRate parameter",
                cam.name
            ))
        })?;
        match shared {
            None => shared = Some(fps),
            Some(prev) if (prev - fps).abs() > 1e-9 => {
                return Err(Error::Config(format!(
                    "cameras disagree on AcquisitionFrameRate ({prev} vs {fps})"
                )));
            }
            Some(_) => {}
        }
    }
    shared.ok_or_else(|| Error::Config("no cameras configured".to_string()))
}

fn build_source(
    cam: &CamConfig,
    rig: &RigConfig,
    settings: &SessionSettings,
    fps: f64,
) -> Result<BuiltSource> {
    let source_config = FrameSourceConfig {
        target_count: settings.n_total_frames,
        trigger_mode: settings.trigger_mode,
        retrieve_timeout: settings.retrieve_timeout,
        report_period: settings.report_period,
    };
    let mut source = FrameSource::new(&cam.name, source_config);

    // Backend chosen per configured driver kind.
    let sim_config = match cam.driver {
        DriverKind::Sim => SimCameraConfig::named(&cam.name),
        DriverKind::SimAbsent => SimCameraConfig::absent(&cam.name),
    };
    let mut module = SimCameraModule::new(vec![sim_config]);
    let mut gate = None;
    source.connect(|| {
        let camera = module.connect(
            &cam.name,
            settings.connect_retries,
            settings.connect_retry_delay,
        )?;
        gate = Some(camera.pulse_gate());
        Ok(Box::new(camera) as Box<dyn CameraDriver>)
    })?;

    // The trigger mode rides along in the validated parameter table.
    let mut params = cam.params.clone();
    params.push(
        "TriggerMode",
        ParamValue::Enumeration(
            match settings.trigger_mode {
                TriggerMode::External => "On",
                TriggerMode::Software => "Off",
            }
            .to_string(),
        ),
    );
    source.configure(&params)?;

    let sinks = build_sinks(&cam.name, rig, settings, fps)?;
    Ok(BuiltSource {
        source,
        sinks,
        gate,
    })
}

fn build_sinks(
    name: &str,
    rig: &RigConfig,
    settings: &SessionSettings,
    fps: f64,
) -> Result<SinkBundle> {
    let disk = match (&settings.session_dir, settings.sinks.disk) {
        (Some(dir), true) => {
            let movie = RawMovieWriter::create(dir.join(format!("video_{name}.raw")))?;
            let metadata =
                MetadataWriter::create(dir.join(format!("metadata_{name}.csv")), fps)?;
            Some(DiskSink::new(
                name,
                Box::new(movie),
                metadata,
                rig.disk_queue_frames,
            )?)
        }
        _ => None,
    };

    let predict = if settings.sinks.predict {
        Some(PredictSink::new(name, Box::new(StubPredictor::default()))?)
    } else {
        None
    };

    let preview = if settings.sinks.preview {
        let overlay = predict.as_ref().map(|p| p.shared_prediction());
        Some(PreviewSink::new(
            name,
            Box::new(NullDisplay::default()),
            rig.preview_queue_frames,
            overlay,
        )?)
    } else {
        None
    };

    Ok(SinkBundle {
        disk,
        preview,
        predict,
    })
}

fn make_controller(
    settings: &SessionSettings,
    link_override: Option<Box<dyn TriggerLink>>,
) -> Result<Option<TriggerController>> {
    if settings.trigger_mode != TriggerMode::External {
        return Ok(None);
    }
    let controller = match link_override {
        Some(link) => TriggerController::with_link(link, pulse_box::DEFAULT_SETTLE)?,
        None => {
            let port = settings.trigger_port.as_deref().ok_or_else(|| {
                Error::Config("external trigger mode requires a serial port".to_string())
            })?;
            TriggerController::open_serial(port)?
        }
    };
    Ok(Some(controller))
}

fn start_trigger(
    controller: &Option<TriggerController>,
    fps: f64,
    schedule: Option<&[StimulationEvent]>,
) -> Result<()> {
    let controller = match controller {
        Some(controller) => controller,
        None => return Ok(()),
    };
    controller.set_rate(fps.round() as u32)?;
    if let Some(schedule) = schedule {
        if !schedule.is_empty() {
            controller.push_schedule(schedule)?;
        }
    }
    controller.fire()?;
    Ok(())
}

fn abort_all(built: Vec<BuiltSource>) {
    for b in built {
        b.source.abort();
    }
}
