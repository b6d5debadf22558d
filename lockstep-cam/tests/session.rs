//! End-to-end session tests against the simulated backend.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use cam_iface::{ParamTable, ParamValue};
use lockstep_cam::config::{CamConfig, DriverKind, RigConfig};
use lockstep_cam::session::{run_session, SessionSettings};
use lockstep_types::{SinkSet, StimulationBlock, TriggerMode};
use pulse_box::TriggerLink;

fn sim_cam(name: &str, fps: f64) -> CamConfig {
    let mut params = ParamTable::new();
    params.push("AcquisitionFrameRateEnable", ParamValue::Boolean(true));
    params.push("AcquisitionFrameRate", ParamValue::Float(fps));
    params.push("Width", ParamValue::Integer(64));
    params.push("Height", ParamValue::Integer(48));
    CamConfig {
        name: name.to_string(),
        driver: DriverKind::Sim,
        params,
    }
}

fn rig(savedir: &Path, cams: Vec<CamConfig>) -> RigConfig {
    RigConfig {
        savedir: savedir.to_path_buf(),
        disk_queue_frames: None,
        preview_queue_frames: 5,
        cams,
    }
}

fn all_sinks() -> SinkSet {
    SinkSet {
        disk: true,
        preview: true,
        predict: true,
    }
}

/// Transport recording every line the controller sends.
struct RecordingLink {
    lines: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl RecordingLink {
    fn new() -> (Self, Arc<parking_lot::Mutex<Vec<String>>>) {
        let lines = Arc::new(parking_lot::Mutex::new(Vec::new()));
        (
            Self {
                lines: lines.clone(),
            },
            lines,
        )
    }
}

impl TriggerLink for RecordingLink {
    fn send_line(&mut self, line: &str) -> pulse_box::Result<()> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }
    fn recv_line(&mut self, timeout: Duration) -> pulse_box::Result<Option<String>> {
        std::thread::sleep(timeout);
        Ok(None)
    }
}

fn assert_disk_output(dir: &Path, name: &str, expected_frames: u64) {
    let mut reader =
        frame_sinks::RawMovieReader::open(dir.join(format!("video_{name}.raw"))).unwrap();
    assert_eq!(reader.info().n_frames, expected_frames, "movie for {name}");

    let csv = std::fs::read_to_string(dir.join(format!("metadata_{name}.csv"))).unwrap();
    let rows: Vec<&str> = csv.lines().collect();
    assert_eq!(rows.len() as u64, expected_frames + 1, "csv rows for {name}");
    if expected_frames > 0 {
        assert!(rows[1].starts_with("1,"));
        assert!(rows[rows.len() - 1].starts_with(&format!("{expected_frames},")));
    }
}

#[test]
fn software_session_persists_every_frame() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), vec![sim_cam("cam0", 100.0), sim_cam("cam1", 100.0)]);
    let settings = SessionSettings {
        n_total_frames: 30,
        trigger_mode: TriggerMode::Software,
        sinks: all_sinks(),
        session_dir: Some(dir.path().to_path_buf()),
        retrieve_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let stop = Arc::new(AtomicBool::new(false));

    let reports = run_session(&rig, &settings, None, None, stop).unwrap();

    assert_eq!(reports.len(), 2);
    for report in &reports {
        assert_eq!(report.frames, 30);
    }
    for name in ["cam0", "cam1"] {
        assert_disk_output(dir.path(), name, 30);
    }
}

#[test]
fn external_session_sends_rate_schedule_fire_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), vec![sim_cam("cam0", 100.0)]);
    let settings = SessionSettings {
        n_total_frames: 50,
        trigger_mode: TriggerMode::External,
        sinks: SinkSet {
            disk: true,
            preview: false,
            predict: false,
        },
        session_dir: Some(dir.path().to_path_buf()),
        retrieve_timeout: Duration::from_millis(50),
        ..Default::default()
    };

    // 0.25 s quiet + 0.25 s block with one 50 ms stimulation 0.125 s in:
    // 0.5 s at 100 Hz = the requested 50 frames.
    let blocks = vec![
        StimulationBlock {
            duration_sec: 0.25,
            stimulation: false,
            onsets_sec: vec![],
            durations_ms: vec![],
            pulse_on_ms: vec![],
            pulse_off_ms: vec![],
        },
        StimulationBlock {
            duration_sec: 0.25,
            stimulation: true,
            onsets_sec: vec![0.125],
            durations_ms: vec![50.0],
            pulse_on_ms: vec![5.0],
            pulse_off_ms: vec![5.0],
        },
    ];

    let (link, lines) = RecordingLink::new();
    let stop = Arc::new(AtomicBool::new(false));
    let reports = run_session(&rig, &settings, Some(&blocks), Some(Box::new(link)), stop).unwrap();

    assert_eq!(reports[0].frames, 50);
    assert_disk_output(dir.path(), "cam0", 50);

    // The one bit-exact boundary: command letters, separators, order.
    assert_eq!(
        *lines.lock(),
        vec!["S,100", "D,0.375-50-10-50", "T", "Q", "V"]
    );
}

#[test]
fn conflicting_schedule_aborts_before_any_hardware() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), vec![sim_cam("cam0", 100.0)]);
    let settings = SessionSettings {
        n_total_frames: 30,
        trigger_mode: TriggerMode::External,
        sinks: all_sinks(),
        session_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    // Two stimulations in one block, the second starting inside the first.
    let blocks = vec![StimulationBlock {
        duration_sec: 0.3,
        stimulation: true,
        onsets_sec: vec![0.05, 0.06],
        durations_ms: vec![50.0, 50.0],
        pulse_on_ms: vec![5.0, 5.0],
        pulse_off_ms: vec![5.0, 5.0],
    }];

    let (link, lines) = RecordingLink::new();
    let stop = Arc::new(AtomicBool::new(false));
    let err = run_session(&rig, &settings, Some(&blocks), Some(Box::new(link)), stop).unwrap_err();

    assert!(matches!(
        err,
        lockstep_cam::Error::Schedule(stim_schedule::ScheduleError::Conflict { .. })
    ));
    // Nothing was sent and nothing was created on disk.
    assert!(lines.lock().is_empty());
    assert!(!dir.path().join("video_cam0.raw").exists());
    assert!(!dir.path().join("metadata_cam0.csv").exists());
}

#[test]
fn inconsistent_frame_budget_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), vec![sim_cam("cam0", 100.0)]);
    let settings = SessionSettings {
        n_total_frames: 31, // blocks cover 30
        trigger_mode: TriggerMode::Software,
        sinks: all_sinks(),
        session_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let blocks = vec![StimulationBlock {
        duration_sec: 0.3,
        stimulation: true,
        onsets_sec: vec![0.05],
        durations_ms: vec![50.0],
        pulse_on_ms: vec![5.0],
        pulse_off_ms: vec![5.0],
    }];
    let stop = Arc::new(AtomicBool::new(false));
    let err = run_session(&rig, &settings, Some(&blocks), None, stop).unwrap_err();
    assert!(matches!(
        err,
        lockstep_cam::Error::Schedule(stim_schedule::ScheduleError::Inconsistent { .. })
    ));
}

#[test]
fn cancellation_drains_queued_frames() {
    let dir = tempfile::tempdir().unwrap();
    let rig = rig(dir.path(), vec![sim_cam("cam0", 200.0)]);
    let settings = SessionSettings {
        n_total_frames: 100_000,
        trigger_mode: TriggerMode::Software,
        sinks: SinkSet {
            disk: true,
            preview: false,
            predict: false,
        },
        session_dir: Some(dir.path().to_path_buf()),
        retrieve_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let stop = Arc::new(AtomicBool::new(false));

    let handle = {
        let rig = rig.clone();
        let settings = settings.clone();
        let stop = stop.clone();
        std::thread::spawn(move || run_session(&rig, &settings, None, None, stop))
    };
    std::thread::sleep(Duration::from_millis(300));
    stop.store(true, Ordering::Relaxed);
    let reports = handle.join().unwrap().unwrap();

    // Cancellation is not an error; whatever was captured is on disk.
    let frames = reports[0].frames;
    assert!(frames > 0);
    assert!(frames < 100_000);
    assert_disk_output(dir.path(), "cam0", frames);
}

#[test]
fn connect_retry_budget_is_exhausted_before_failing() {
    let dir = tempfile::tempdir().unwrap();
    let mut absent = sim_cam("gone", 100.0);
    absent.driver = DriverKind::SimAbsent;
    let rig = rig(dir.path(), vec![absent]);
    let settings = SessionSettings {
        n_total_frames: 10,
        trigger_mode: TriggerMode::Software,
        sinks: all_sinks(),
        session_dir: Some(dir.path().to_path_buf()),
        connect_retries: 5,
        connect_retry_delay: Duration::from_millis(100),
        ..Default::default()
    };
    let stop = Arc::new(AtomicBool::new(false));

    let started = Instant::now();
    let err = run_session(&rig, &settings, None, None, stop).unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(
        err,
        lockstep_cam::Error::Camera(cam_iface::Error::Connect { attempts: 5 })
    ));
    // Five attempts with a 100 ms sleep after each.
    assert!(elapsed >= Duration::from_millis(500));
}

#[test]
fn bounded_disk_queue_stays_lossless() {
    let dir = tempfile::tempdir().unwrap();
    let mut rig = rig(dir.path(), vec![sim_cam("cam0", 200.0)]);
    rig.disk_queue_frames = Some(2);
    let settings = SessionSettings {
        n_total_frames: 25,
        trigger_mode: TriggerMode::Software,
        sinks: SinkSet {
            disk: true,
            preview: false,
            predict: false,
        },
        session_dir: Some(dir.path().to_path_buf()),
        retrieve_timeout: Duration::from_millis(50),
        ..Default::default()
    };
    let stop = Arc::new(AtomicBool::new(false));
    let reports = run_session(&rig, &settings, None, None, stop).unwrap();
    assert_eq!(reports[0].frames, 25);
    assert_disk_output(dir.path(), "cam0", 25);
}
