//! The drop-oldest preview sink.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lockstep_types::FrameEnvelope;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::{poll_err, Display, ErrorSlot, Result, SinkWorker, SharedPrediction};

const WAIT_TIMEOUT: Duration = Duration::from_millis(100);

struct Ring {
    queue: Mutex<VecDeque<FrameEnvelope>>,
    available: Condvar,
}

/// Bounded ring feeding the display worker.
///
/// A push into a full ring evicts the oldest queued frame; the worker
/// always renders the most recently enqueued frame and discards anything
/// older. Frames may be skipped but are never reordered, and the ring
/// never holds more than `capacity` frames.
pub struct PreviewSink {
    ring: Arc<Ring>,
    capacity: usize,
    worker: Option<SinkWorker>,
    err_from_worker: ErrorSlot,
}

impl PreviewSink {
    pub fn new(
        name: &str,
        display: Box<dyn Display>,
        capacity: usize,
        overlay: Option<SharedPrediction>,
    ) -> Result<Self> {
        assert!(capacity > 0, "preview ring capacity must be positive");
        let ring = Arc::new(Ring {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            available: Condvar::new(),
        });
        let err_to_launcher: ErrorSlot = Arc::new(Mutex::new(None));
        let err_in_worker = err_to_launcher.clone();

        let worker = {
            let ring = ring.clone();
            SinkWorker::spawn(format!("preview-sink-{name}"), move |flag| {
                if let Err(e) = preview_worker_loop(ring, flag, display, overlay) {
                    error!("preview sink failed: {e}");
                    *err_in_worker.lock() = Some(e);
                }
            })?
        };

        Ok(Self {
            ring,
            capacity,
            worker: Some(worker),
            err_from_worker: err_to_launcher,
        })
    }

    /// Enqueue a frame, evicting the oldest when the ring is full. Never
    /// blocks.
    pub fn push(&self, frame: FrameEnvelope) {
        let mut queue = self.ring.queue.lock();
        queue.push_back(frame);
        while queue.len() > self.capacity {
            queue.pop_front();
        }
        self.ring.available.notify_one();
    }

    /// Current ring occupancy.
    pub fn queued(&self) -> usize {
        self.ring.queue.lock().len()
    }

    /// Newest queued frame number, if any frame is waiting.
    pub fn newest_queued(&self) -> Option<u64> {
        self.ring.queue.lock().back().map(|f| f.frame_number)
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

fn preview_worker_loop(
    ring: Arc<Ring>,
    flag: thread_control::Flag,
    mut display: Box<dyn Display>,
    overlay: Option<SharedPrediction>,
) -> Result<()> {
    let mut rendered: u64 = 0;
    loop {
        let newest = {
            let mut queue = ring.queue.lock();
            if queue.is_empty() {
                ring.available.wait_for(&mut queue, WAIT_TIMEOUT);
            }
            // Render only the freshest frame; everything older is stale.
            let newest = queue.pop_back();
            queue.clear();
            newest
        };
        match newest {
            Some(frame) => {
                let keypoints = overlay.as_ref().and_then(|o| o.lock().clone());
                display.render(&frame, keypoints.as_ref())?;
                rendered += 1;
            }
            None => {
                if !flag.alive() {
                    break;
                }
            }
        }
    }
    debug!("preview sink rendered {rendered} frames");
    Ok(())
}
