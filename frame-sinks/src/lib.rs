//! Frame fan-out sinks.
//!
//! Each sink is an independent consumer of captured frames: a queue, one
//! named worker thread, and a control flag. Three backpressure policies
//! exist:
//!
//! - [DiskSink]: must-not-drop. Unbounded (or optionally bounded, still
//!   lossless) queue; the worker drains everything before exiting.
//! - [PreviewSink]: drop-oldest ring of capacity `k`; the worker renders
//!   the most recently enqueued frame. Freshness over completeness.
//! - [PredictSink]: latest-only slot; the worker skips frames it has
//!   already seen.
//!
//! Workers always block with a timeout (`recv_timeout`, condvar
//! `wait_for`); there is no busy polling anywhere.

use std::sync::Arc;

use lockstep_types::FrameEnvelope;
use parking_lot::Mutex;
use tracing::debug;

mod disk;
mod movie;
mod predict;
mod preview;
mod stubs;

pub use disk::{DiskSink, MetadataWriter};
pub use movie::{MovieInfo, RawMovieReader, RawMovieWriter};
pub use predict::{PredictSink, SharedPrediction};
pub use preview::PreviewSink;
pub use stubs::{NullDisplay, StubPredictor};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    CsvError(#[from] csv::Error),
    #[error("worker thread disconnected")]
    WorkerDisconnected,
    #[error("sink already finished")]
    AlreadyFinished,
    #[error("frame size changed mid-movie: {0}")]
    FrameSizeChanged(String),
    #[error("not a raw movie file: {0}")]
    BadMovieHeader(String),
    #[error("encoder error: {0}")]
    EncoderError(String),
    #[error("display error: {0}")]
    DisplayError(String),
    #[error("predictor error: {0}")]
    PredictorError(String),
    #[error("spawning sink thread failed: {0}")]
    SpawnError(String),
}

/// From outside the worker thread, surface an error the worker stored.
macro_rules! poll_err {
    ($err_slot:expr) => {{
        if let Some(e) = $err_slot.lock().take() {
            return Err(e);
        }
    }};
}
pub(crate) use poll_err;

pub(crate) type ErrorSlot = Arc<Mutex<Option<Error>>>;

/// 2D keypoints produced by the online annotator.
pub type Keypoints = Vec<[f32; 2]>;

// ---------------------------
// collaborator traits

/// Movie container writing. The real encoder lives outside this system;
/// [RawMovieWriter] is the built-in uncompressed implementation.
pub trait VideoEncoder: Send {
    fn write(&mut self, frame: &FrameEnvelope) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// On-screen rendering. The real window lives outside this system.
pub trait Display: Send {
    fn render(&mut self, frame: &FrameEnvelope, overlay: Option<&Keypoints>) -> Result<()>;
}

/// Online inference. The real model lives outside this system;
/// [StubPredictor] is the built-in placeholder.
pub trait Predictor: Send {
    fn set_frame(&mut self, frame: &FrameEnvelope) -> Result<()>;
    fn latest_result(&self) -> Option<Keypoints>;
}

// ---------------------------
// worker plumbing

/// A sink's worker thread plus its stop flag.
pub(crate) struct SinkWorker {
    control: thread_control::Control,
    join_handle: Option<std::thread::JoinHandle<()>>,
}

impl SinkWorker {
    pub(crate) fn spawn<F>(name: String, body: F) -> Result<Self>
    where
        F: FnOnce(thread_control::Flag) + Send + 'static,
    {
        let (flag, control) = thread_control::make_pair();
        let join_handle = std::thread::Builder::new()
            .name(name)
            .spawn(move || body(flag))
            .map_err(|e| Error::SpawnError(e.to_string()))?;
        Ok(Self {
            control,
            join_handle: Some(join_handle),
        })
    }

    /// Lower the flag and wait for the worker to observe it. The wait is
    /// bounded because every worker blocks with a timeout.
    pub(crate) fn stop_and_join(mut self) -> Result<()> {
        self.control.stop();
        if let Some(handle) = self.join_handle.take() {
            let name = handle.thread().name().unwrap_or("sink").to_string();
            handle.join().map_err(|_| Error::WorkerDisconnected)?;
            debug!("joined {name}");
        }
        Ok(())
    }
}

impl Drop for SinkWorker {
    fn drop(&mut self) {
        // Idempotent; stops a worker that was never explicitly finished.
        self.control.stop();
    }
}
