//! The latest-only predictor sink.

use std::sync::Arc;
use std::time::Duration;

use lockstep_types::FrameEnvelope;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::{poll_err, ErrorSlot, Keypoints, Predictor, Result, SinkWorker};

const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

/// Latest inference result, shared with the preview overlay.
pub type SharedPrediction = Arc<Mutex<Option<Keypoints>>>;

struct Slot {
    latest: Mutex<Option<FrameEnvelope>>,
    available: Condvar,
}

/// A single overwritten latest-frame reference feeding the predictor.
///
/// There is no queue: each push replaces the previous frame, and the
/// worker skips frames it has already seen (by `frame_number` comparison)
/// so the model never runs twice on the same input.
pub struct PredictSink {
    slot: Arc<Slot>,
    prediction: SharedPrediction,
    worker: Option<SinkWorker>,
    err_from_worker: ErrorSlot,
}

impl PredictSink {
    pub fn new(name: &str, predictor: Box<dyn Predictor>) -> Result<Self> {
        let slot = Arc::new(Slot {
            latest: Mutex::new(None),
            available: Condvar::new(),
        });
        let prediction: SharedPrediction = Arc::new(Mutex::new(None));
        let err_to_launcher: ErrorSlot = Arc::new(Mutex::new(None));
        let err_in_worker = err_to_launcher.clone();

        let worker = {
            let slot = slot.clone();
            let prediction = prediction.clone();
            SinkWorker::spawn(format!("predict-sink-{name}"), move |flag| {
                if let Err(e) = predict_worker_loop(slot, flag, predictor, prediction) {
                    error!("predict sink failed: {e}");
                    *err_in_worker.lock() = Some(e);
                }
            })?
        };

        Ok(Self {
            slot,
            prediction,
            worker: Some(worker),
            err_from_worker: err_to_launcher,
        })
    }

    /// Overwrite the latest-frame slot. Never blocks.
    pub fn push(&self, frame: FrameEnvelope) {
        *self.slot.latest.lock() = Some(frame);
        self.slot.available.notify_one();
    }

    /// Handle to the latest inference result, for the preview overlay.
    pub fn shared_prediction(&self) -> SharedPrediction {
        self.prediction.clone()
    }

    pub fn finish(mut self) -> Result<()> {
        poll_err!(self.err_from_worker);
        if let Some(worker) = self.worker.take() {
            worker.stop_and_join()?;
        }
        poll_err!(self.err_from_worker);
        Ok(())
    }
}

fn predict_worker_loop(
    slot: Arc<Slot>,
    flag: thread_control::Flag,
    mut predictor: Box<dyn Predictor>,
    prediction: SharedPrediction,
) -> Result<()> {
    let mut last_seen: u64 = 0;
    let mut inferred: u64 = 0;
    loop {
        let fresh = {
            let mut latest = slot.latest.lock();
            let is_fresh =
                |l: &Option<FrameEnvelope>| matches!(l, Some(f) if f.frame_number != last_seen);
            if !is_fresh(&latest) {
                slot.available.wait_for(&mut latest, WAIT_TIMEOUT);
            }
            if is_fresh(&latest) {
                latest.clone()
            } else {
                None
            }
        };
        match fresh {
            Some(frame) => {
                predictor.set_frame(&frame)?;
                *prediction.lock() = predictor.latest_result();
                last_seen = frame.frame_number;
                inferred += 1;
            }
            None => {
                if !flag.alive() {
                    break;
                }
            }
        }
    }
    debug!("predict sink ran inference on {inferred} frames");
    Ok(())
}
