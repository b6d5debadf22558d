//! Compiles a block-structured stimulus description into a flat, validated,
//! time-ordered event list.
//!
//! All validation happens here, before any device is armed or any serial
//! command is sent: a schedule that fails to compile must leave every piece
//! of hardware untouched.

use lockstep_types::{StimulationBlock, StimulationEvent};
use tracing::info;

pub type Result<T> = std::result::Result<T, ScheduleError>;

#[derive(thiserror::Error, Debug)]
pub enum ScheduleError {
    #[error("stimulation block {block}: {reason}")]
    BadBlock { block: usize, reason: String },
    #[error(
        "conflicting stimulation windows: onset at {onset_sec} s precedes \
         previous stimulation end at {previous_end_sec} s"
    )]
    Conflict {
        onset_sec: f64,
        previous_end_sec: f64,
    },
    #[error(
        "stimulation blocks cover {expected_frames} frames at {frame_rate} Hz \
         but {requested_frames} frames were requested"
    )]
    Inconsistent {
        expected_frames: f64,
        frame_rate: f64,
        requested_frames: u64,
    },
}

/// Flatten `blocks` into a time-ordered event list.
///
/// Each block's local onsets are shifted by the accumulated duration of all
/// preceding blocks. Overlapping stimulation windows and a block-sum that
/// disagrees with the requested frame count are compile errors.
pub fn compile(
    blocks: &[StimulationBlock],
    frame_rate: f64,
    requested_frame_count: u64,
) -> Result<Vec<StimulationEvent>> {
    let mut events: Vec<StimulationEvent> = Vec::new();
    let mut global_offset_sec = 0.0;
    let mut previous_end_sec: Option<f64> = None;

    for (block_idx, block) in blocks.iter().enumerate() {
        if !block.stimulation {
            global_offset_sec += block.duration_sec;
            continue;
        }

        let n = block.onsets_sec.len();
        if n == 0 {
            return Err(ScheduleError::BadBlock {
                block: block_idx,
                reason: "stimulation block has no onsets".to_string(),
            });
        }
        if block.durations_ms.len() != n
            || block.pulse_on_ms.len() != n
            || block.pulse_off_ms.len() != n
        {
            return Err(ScheduleError::BadBlock {
                block: block_idx,
                reason: format!(
                    "array lengths differ: {} onsets, {} durations, {} pulse on-times, \
                     {} pulse off-times",
                    n,
                    block.durations_ms.len(),
                    block.pulse_on_ms.len(),
                    block.pulse_off_ms.len()
                ),
            });
        }

        for i in 0..n {
            let global_onset_sec = block.onsets_sec[i] + global_offset_sec;
            if let Some(end) = previous_end_sec {
                if global_onset_sec < end {
                    return Err(ScheduleError::Conflict {
                        onset_sec: global_onset_sec,
                        previous_end_sec: end,
                    });
                }
            }

            let pulse_on = block.pulse_on_ms[i];
            let pulse_off = block.pulse_off_ms[i];
            let interval = pulse_on + pulse_off;
            if !(interval > 0.0) {
                return Err(ScheduleError::BadBlock {
                    block: block_idx,
                    reason: format!("pulse interval for onset {i} is not positive"),
                });
            }

            let event = StimulationEvent {
                global_onset_sec,
                duration_sec: block.durations_ms[i] / 1000.0,
                pulse_interval_ms: interval.round() as u32,
                duty_cycle_pct: (pulse_on / interval * 100.0).round() as u32,
            };
            previous_end_sec = Some(event.end_sec());
            events.push(event);
        }

        global_offset_sec += block.duration_sec;
    }

    let expected_frames = global_offset_sec * frame_rate;
    if (expected_frames - requested_frame_count as f64).abs() > 1e-6 {
        return Err(ScheduleError::Inconsistent {
            expected_frames,
            frame_rate,
            requested_frames: requested_frame_count,
        });
    }

    info!(
        "compiled stimulation schedule: {} events over {global_offset_sec} s",
        events.len()
    );
    Ok(events)
}
