//! The must-not-drop disk sink.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lockstep_types::{datetime_to_f64, FrameEnvelope, FrameMetadataRow};
use parking_lot::Mutex;
use tracing::{debug, error};

use crate::{poll_err, Error, ErrorSlot, Result, SinkWorker, VideoEncoder};

const RECV_TIMEOUT: Duration = Duration::from_millis(100);

/// Writes every frame it is given, in order, to a movie file plus a
/// per-frame metadata CSV.
///
/// With `queue_bound: None` the queue is unbounded: zero frame loss at the
/// cost of unbounded memory growth if the device produces faster than disk
/// absorbs. With `Some(n)` memory is bounded and [DiskSink::push] blocks
/// when full, which is still lossless. The choice is the caller's, made
/// explicit in configuration.
pub struct DiskSink {
    tx: crossbeam_channel::Sender<FrameEnvelope>,
    worker: Option<SinkWorker>,
    err_from_worker: ErrorSlot,
}

impl DiskSink {
    pub fn new(
        name: &str,
        encoder: Box<dyn VideoEncoder>,
        metadata: MetadataWriter,
        queue_bound: Option<usize>,
    ) -> Result<Self> {
        let (tx, rx) = match queue_bound {
            Some(cap) => crossbeam_channel::bounded(cap),
            None => crossbeam_channel::unbounded(),
        };
        let err_to_launcher: ErrorSlot = Arc::new(Mutex::new(None));
        let err_in_worker = err_to_launcher.clone();

        let worker = SinkWorker::spawn(format!("disk-sink-{name}"), move |flag| {
            match disk_worker_loop(rx, flag, encoder, metadata) {
                Ok(n) => debug!("disk sink wrote {n} frames"),
                Err(e) => {
                    error!("disk sink failed: {e}");
                    *err_in_worker.lock() = Some(e);
                }
            }
        })?;

        Ok(Self {
            tx,
            worker: Some(worker),
            err_from_worker: err_to_launcher,
        })
    }

    /// Enqueue a frame. Blocks only when a bounded queue is full.
    pub fn push(&self, frame: FrameEnvelope) -> Result<()> {
        poll_err!(self.err_from_worker);
        self.tx.send(frame).map_err(|_| Error::WorkerDisconnected)
    }

    /// Stop accepting frames, flush everything still queued, release the
    /// encoder and join the worker.
    pub fn finish(mut self) -> Result<()> {
        poll_err!(self.err_from_worker);
        if let Some(worker) = self.worker.take() {
            worker.stop_and_join()?;
        }
        poll_err!(self.err_from_worker);
        Ok(())
    }
}

fn disk_worker_loop(
    rx: crossbeam_channel::Receiver<FrameEnvelope>,
    flag: thread_control::Flag,
    mut encoder: Box<dyn VideoEncoder>,
    mut metadata: MetadataWriter,
) -> Result<u64> {
    let mut written: u64 = 0;
    loop {
        match rx.recv_timeout(RECV_TIMEOUT) {
            Ok(frame) => {
                encoder.write(&frame)?;
                metadata.append(&frame)?;
                written += 1;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                // Queue empty. Keep waiting unless a stop was requested.
                if !flag.alive() {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    // Flush anything that raced in between the last receive and the stop.
    while let Ok(frame) = rx.try_recv() {
        encoder.write(&frame)?;
        metadata.append(&frame)?;
        written += 1;
    }
    encoder.release()?;
    metadata.finish()?;
    Ok(written)
}

/// Session-scoped per-frame metadata file.
///
/// One CSV row per written frame; the measured rate is derived from
/// successive arrival wall clock times.
pub struct MetadataWriter {
    writer: csv::Writer<Box<dyn std::io::Write + Send>>,
    nominal_fps: f64,
    last_arrival: Option<DateTime<Utc>>,
}

impl MetadataWriter {
    pub fn create<P: AsRef<Path>>(path: P, nominal_fps: f64) -> Result<Self> {
        let file = std::fs::File::create(path.as_ref())?;
        Ok(Self::from_writer(Box::new(file), nominal_fps))
    }

    pub fn from_writer(writer: Box<dyn std::io::Write + Send>, nominal_fps: f64) -> Self {
        Self {
            writer: csv::Writer::from_writer(writer),
            nominal_fps,
            last_arrival: None,
        }
    }

    fn append(&mut self, frame: &FrameEnvelope) -> Result<()> {
        let measured_fps = match self.last_arrival {
            Some(prev) => {
                let dt = datetime_to_f64(&frame.arrival_wallclock) - datetime_to_f64(&prev);
                if dt > 0.0 {
                    1.0 / dt
                } else {
                    self.nominal_fps
                }
            }
            None => self.nominal_fps,
        };
        self.last_arrival = Some(frame.arrival_wallclock);
        self.writer.serialize(FrameMetadataRow {
            frame_number: frame.frame_number,
            device_timestamp_raw: frame.device_timestamp_raw,
            synced_timestamp: frame.synced_timestamp,
            arrival_wallclock: frame.arrival_wallclock,
            measured_fps,
        })?;
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
