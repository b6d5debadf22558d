use serde::{Deserialize, Deserializer, Serialize};

/// One time-bounded segment of an experiment protocol.
///
/// The field names mirror the on-disk stimulation configuration format. The
/// four pulse arrays must be equal length and are only consulted when
/// `stimulation` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationBlock {
    pub duration_sec: f64,
    #[serde(default, deserialize_with = "flexible_bool")]
    pub stimulation: bool,
    #[serde(default, rename = "stimulation_turnOn_times_sec")]
    pub onsets_sec: Vec<f64>,
    #[serde(default, rename = "stimulation_durations_ms")]
    pub durations_ms: Vec<f64>,
    #[serde(default, rename = "pulse_ontime_ms")]
    pub pulse_on_ms: Vec<f64>,
    #[serde(default, rename = "pulse_offtime_ms")]
    pub pulse_off_ms: Vec<f64>,
}

/// One flattened, validated stimulus event on the session timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulationEvent {
    /// Onset relative to acquisition start, seconds.
    pub global_onset_sec: f64,
    pub duration_sec: f64,
    /// One pulse period: on-time plus off-time, milliseconds.
    pub pulse_interval_ms: u32,
    /// Percentage of each pulse interval the output is active.
    pub duty_cycle_pct: u32,
}

impl StimulationEvent {
    /// End of the stimulation window, seconds.
    pub fn end_sec(&self) -> f64 {
        self.global_onset_sec + self.duration_sec
    }
}

/// Accept `true`, `1` or the strings `"1"`/`"true"`/`"True"`; all forms
/// occur in stimulation configuration files in the wild.
fn flexible_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flexible {
        Bool(bool),
        Int(i64),
        Str(String),
    }

    Ok(match Flexible::deserialize(deserializer)? {
        Flexible::Bool(b) => b,
        Flexible::Int(i) => i != 0,
        Flexible::Str(s) => matches!(s.as_str(), "1" | "true" | "True"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_parses_with_string_flag() {
        let block: StimulationBlock = serde_json::from_str(
            r#"{
                "duration_sec": 5,
                "stimulation": "True",
                "stimulation_turnOn_times_sec": [2],
                "stimulation_durations_ms": [500],
                "pulse_ontime_ms": [50],
                "pulse_offtime_ms": [50]
            }"#,
        )
        .unwrap();
        assert!(block.stimulation);
        assert_eq!(block.onsets_sec, vec![2.0]);
    }

    #[test]
    fn block_without_stimulation_needs_no_arrays() {
        let block: StimulationBlock =
            serde_json::from_str(r#"{"duration_sec": 10}"#).unwrap();
        assert!(!block.stimulation);
        assert!(block.onsets_sec.is_empty());
    }

    #[test]
    fn event_end_time() {
        let ev = StimulationEvent {
            global_onset_sec: 12.0,
            duration_sec: 0.5,
            pulse_interval_ms: 100,
            duty_cycle_pct: 50,
        };
        assert!((ev.end_sec() - 12.5).abs() < 1e-12);
    }
}
