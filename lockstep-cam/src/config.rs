//! Rig and stimulation configuration loading.

use std::path::Path;

use cam_iface::{ParamTable, ParamValue};
use lockstep_types::StimulationBlock;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// The rig configuration file (YAML).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RigConfig {
    /// Directory under which per-session directories are created.
    pub savedir: std::path::PathBuf,
    /// Bound on the disk sink queue, in frames.
    ///
    /// `None` (the default) keeps the queue unbounded: zero frame loss,
    /// unbounded memory growth if the device outruns the disk. `Some(n)`
    /// bounds memory while staying lossless by blocking the capture loop
    /// when the queue is full.
    #[serde(default)]
    pub disk_queue_frames: Option<usize>,
    /// Drop-oldest preview ring capacity, in frames.
    #[serde(default = "default_preview_queue_frames")]
    pub preview_queue_frames: usize,
    pub cams: Vec<CamConfig>,
}

fn default_preview_queue_frames() -> usize {
    5
}

/// One configured capture device.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CamConfig {
    pub name: String,
    /// Which backend implements this device.
    #[serde(default, rename = "type")]
    pub driver: DriverKind,
    /// Typed parameter table, applied in file order at configure time.
    #[serde(default)]
    pub params: ParamTable,
}

/// Backend selection, resolved to a [cam_iface::CameraModule]
/// implementation when the session is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    #[default]
    Sim,
    /// A simulated device that never answers; exercises the connect retry
    /// budget.
    SimAbsent,
}

impl CamConfig {
    /// The device's configured acquisition rate, from its parameter table.
    pub fn acquisition_fps(&self) -> Option<f64> {
        match self.params.get("AcquisitionFrameRate") {
            Some(ParamValue::Float(v)) => Some(*v),
            Some(ParamValue::Integer(v)) => Some(*v as f64),
            _ => None,
        }
    }
}

/// Parse the rig YAML file.
pub fn parse_config_file<P: AsRef<Path>>(fname: P) -> Result<RigConfig> {
    let contents = std::fs::read_to_string(fname.as_ref())?;
    let cfg: RigConfig = serde_yaml::from_str(&contents)?;
    if cfg.cams.is_empty() {
        return Err(Error::Config("no cameras configured".to_string()));
    }
    if cfg.preview_queue_frames == 0 {
        return Err(Error::Config(
            "preview_queue_frames must be at least 1".to_string(),
        ));
    }
    Ok(cfg)
}

/// Load a stimulation configuration file (JSON).
///
/// The on-disk shape is a map whose keys are block indices ("0", "1", ...);
/// blocks are returned in numeric key order.
pub fn load_stimulation_config<P: AsRef<Path>>(path: P) -> Result<Vec<StimulationBlock>> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let raw: std::collections::BTreeMap<String, StimulationBlock> =
        serde_json::from_str(&contents)?;
    let mut numbered = Vec::with_capacity(raw.len());
    for (key, block) in raw {
        let index: usize = key.parse().map_err(|_| {
            Error::Config(format!("stimulation block key \"{key}\" is not an integer"))
        })?;
        numbered.push((index, block));
    }
    numbered.sort_by_key(|(index, _)| *index);
    Ok(numbered.into_iter().map(|(_, block)| block).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const RIG_YAML: &str = "\
savedir: /tmp/lockstep-data
cams:
  - name: cam0
    type: sim
    params:
      AcquisitionFrameRateEnable: true
      AcquisitionFrameRate: 100.0
      Width: 64
      Height: 48
  - name: cam1
    params:
      AcquisitionFrameRate: 100.0
";

    #[test]
    fn rig_config_parses() {
        let cfg: RigConfig = serde_yaml::from_str(RIG_YAML).unwrap();
        assert_eq!(cfg.cams.len(), 2);
        assert_eq!(cfg.cams[0].driver, DriverKind::Sim);
        assert_eq!(cfg.cams[0].acquisition_fps(), Some(100.0));
        assert_eq!(cfg.preview_queue_frames, 5);
        assert!(cfg.disk_queue_frames.is_none());
    }

    #[test]
    fn unknown_fields_rejected() {
        let yaml = "savedir: /tmp/x\nwhatever: 1\ncams: []\n";
        assert!(serde_yaml::from_str::<RigConfig>(yaml).is_err());
    }

    #[test]
    fn stimulation_blocks_ordered_by_numeric_key() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Key "10" sorts before "2" as a string but not as an integer.
        write!(
            file,
            r#"{{
                "10": {{"duration_sec": 30}},
                "2": {{"duration_sec": 20}},
                "0": {{"duration_sec": 10}}
            }}"#
        )
        .unwrap();
        let blocks = load_stimulation_config(file.path()).unwrap();
        let durations: Vec<f64> = blocks.iter().map(|b| b.duration_sec).collect();
        assert_eq!(durations, vec![10.0, 20.0, 30.0]);
    }

    #[test]
    fn non_integer_block_key_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"first": {{"duration_sec": 10}}}}"#).unwrap();
        assert!(matches!(
            load_stimulation_config(file.path()),
            Err(Error::Config(_))
        ));
    }
}
