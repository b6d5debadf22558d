use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use lockstep_types::{SinkSet, TriggerMode};

use lockstep_cam::session::{run_session, SessionSettings};
use lockstep_cam::{config, logging};

#[derive(Parser, Debug)]
#[command(name = "lockstep-cam", about = "Multi-device lock-step acquisition")]
struct Cli {
    /// Base name for the session directory, e.g. an animal ID.
    #[arg(short, long, default_value = "JB999")]
    name: String,

    /// Rig configuration file (YAML).
    #[arg(short, long, default_value = "config/rig.yaml")]
    config: PathBuf,

    /// Total number of frames to acquire per camera.
    #[arg(long, default_value_t = 450)]
    n_total_frames: u64,

    /// Drive acquisition from the external trigger controller instead of
    /// free-running.
    #[arg(short = 't', long)]
    external_trigger: bool,

    /// Serial port of the trigger controller.
    #[arg(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Stimulation configuration file (JSON).
    #[arg(long)]
    stimulation_path: Option<PathBuf>,

    /// Show the live preview.
    #[arg(short, long)]
    preview: bool,

    /// Run the online annotator on captured frames.
    #[arg(long)]
    predict: bool,

    /// Do not write movies or metadata to disk.
    #[arg(long)]
    no_save: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let rig = config::parse_config_file(&cli.config)?;

    let save = !cli.no_save;
    let session_dir = if save {
        let stamp = chrono::Local::now().format("%Y%m%d_%H_%M_%S_");
        let dir = rig.savedir.join(format!("{stamp}{}", cli.name));
        std::fs::create_dir_all(&dir)?;
        Some(dir)
    } else {
        None
    };

    let _log_guard = logging::initiate_logging(session_dir.as_ref().map(|d| d.join("logs.log")))
        .map_err(|e| anyhow::anyhow!("logging setup failed: {e}"))?;

    // Keep a copy of everything the session ran with beside the data.
    if let Some(dir) = &session_dir {
        tracing::info!("session directory: {}", dir.display());
        std::fs::write(
            dir.join("loaded_config_file.yaml"),
            serde_yaml::to_string(&rig)?,
        )?;
        if let Some(stim_path) = &cli.stimulation_path {
            std::fs::copy(stim_path, dir.join("loaded_stimulation_config.json"))?;
        }
    }

    let blocks = cli
        .stimulation_path
        .as_ref()
        .map(config::load_stimulation_config)
        .transpose()?;

    let settings = SessionSettings {
        n_total_frames: cli.n_total_frames,
        trigger_mode: if cli.external_trigger {
            TriggerMode::External
        } else {
            TriggerMode::Software
        },
        sinks: SinkSet {
            disk: save,
            preview: cli.preview,
            predict: cli.predict,
        },
        session_dir,
        trigger_port: Some(cli.port),
        ..Default::default()
    };

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            tracing::warn!("interrupt received, draining");
            stop.store(true, Ordering::Relaxed);
        })?;
    }

    let reports = run_session(&rig, &settings, blocks.as_deref(), None, stop)?;
    let total: u64 = reports.iter().map(|r| r.frames).sum();
    tracing::info!("session complete: {total} frames across {} cameras", reports.len());
    Ok(())
}
