//! Serial protocol to the trigger/stimulation microcontroller.
//!
//! The controller generates the shared pulse clock that drives synchronized
//! frame capture and sequences the stimulation schedule. This crate owns
//! the serial link for the whole session: a single background thread writes
//! command lines and drains acknowledgement lines with a bounded read
//! timeout. Acknowledgements are best-effort telemetry; a malformed or
//! missing ack is logged and never fails the session.
//!
//! Wire protocol (ASCII lines, `\n`-terminated):
//!
//! - `S,<fps>`: set the shared acquisition rate.
//! - `D,<onset>-<dur_ms>-<interval_ms>-<duty>,...`: push the compiled
//!   stimulation schedule.
//! - `T`: fire, starting the frame clock and stimulus sequencing.
//! - `Q` then, after a settle delay, `V`: stop and reset on shutdown.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use lockstep_types::StimulationEvent;
use tracing::{debug, info, trace, warn};

mod link;

pub use link::{SerialLink, TriggerLink};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("{0}")]
    IoError(#[from] std::io::Error),
    #[error("serial port error: {0}")]
    SerialError(#[from] serialport::Error),
    #[error("controller thread disconnected")]
    WorkerDisconnected,
    #[error("spawning controller thread failed: {0}")]
    SpawnError(String),
}

/// Delay between the stop and reset commands, and after the reset, before
/// the port is closed.
pub const DEFAULT_SETTLE: Duration = Duration::from_millis(200);

const READ_TIMEOUT: Duration = Duration::from_millis(10);

// ---------------------------
// commands

/// One command line to the microcontroller.
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerCommand {
    /// `S,<fps>`: set the shared acquisition rate.
    SetRate(u32),
    /// `D,...`: push the full compiled stimulation schedule.
    PushSchedule(Vec<StimulationEvent>),
    /// `T`: start the synchronized frame clock and stimulus sequencing.
    Fire,
    /// `Q`: stop pulse generation.
    Stop,
    /// `V`: reset the controller state.
    Reset,
}

impl TriggerCommand {
    /// The command line, without the terminating newline.
    pub fn encode(&self) -> String {
        match self {
            TriggerCommand::SetRate(fps) => format!("S,{fps}"),
            TriggerCommand::PushSchedule(events) => {
                let fields: Vec<String> = events.iter().map(encode_event).collect();
                format!("D,{}", fields.join(","))
            }
            TriggerCommand::Fire => "T".to_string(),
            TriggerCommand::Stop => "Q".to_string(),
            TriggerCommand::Reset => "V".to_string(),
        }
    }
}

fn encode_event(ev: &StimulationEvent) -> String {
    let duration_ms = (ev.duration_sec * 1000.0).round() as i64;
    format!(
        "{}-{}-{}-{}",
        ev.global_onset_sec, duration_ms, ev.pulse_interval_ms, ev.duty_cycle_pct
    )
}

// ---------------------------
// controller

enum Cmd {
    Send(TriggerCommand),
    Shutdown,
}

/// Sole owner of the serial connection to the microcontroller.
///
/// Commands are handed to a background comms thread over a channel; the
/// same thread drains acknowledgement lines between commands so no second
/// reader ever touches the port.
pub struct TriggerController {
    cmd_tx: crossbeam_channel::Sender<Cmd>,
    control: thread_control::Control,
    join_handle: Option<std::thread::JoinHandle<()>>,
    err_from_worker: Arc<Mutex<Option<Error>>>,
}

impl TriggerController {
    /// Open the serial device and start the comms thread.
    pub fn open_serial(device: &str) -> Result<Self> {
        let link = SerialLink::open(device)?;
        info!("connected to trigger controller on {device}");
        Self::with_link(Box::new(link), DEFAULT_SETTLE)
    }

    /// Start the comms thread over an arbitrary transport.
    pub fn with_link(link: Box<dyn TriggerLink>, settle: Duration) -> Result<Self> {
        let (cmd_tx, cmd_rx) = crossbeam_channel::unbounded();
        let (flag, control) = thread_control::make_pair();
        let err_to_launcher = Arc::new(Mutex::new(None));
        let err_from_worker = err_to_launcher.clone();

        let builder = std::thread::Builder::new().name("pulsebox-comms".to_string());
        let join_handle = builder
            .spawn(move || comms_loop(link, cmd_rx, flag, settle, err_to_launcher))
            .map_err(|e| Error::SpawnError(e.to_string()))?;

        Ok(Self {
            cmd_tx,
            control,
            join_handle: Some(join_handle),
            err_from_worker,
        })
    }

    fn send(&self, command: TriggerCommand) -> Result<()> {
        if let Some(e) = self.err_from_worker.lock().unwrap().take() {
            return Err(e);
        }
        self.cmd_tx
            .send(Cmd::Send(command))
            .map_err(|_| Error::WorkerDisconnected)
    }

    /// Send the shared acquisition rate. Call once, after every source is
    /// armed, before firing.
    pub fn set_rate(&self, fps: u32) -> Result<()> {
        self.send(TriggerCommand::SetRate(fps))
    }

    /// Push the compiled schedule. Call once, before firing.
    pub fn push_schedule(&self, events: &[StimulationEvent]) -> Result<()> {
        self.send(TriggerCommand::PushSchedule(events.to_vec()))
    }

    /// Start the synchronized frame clock (and stimulus sequencing when a
    /// schedule was pushed).
    pub fn fire(&self) -> Result<()> {
        self.send(TriggerCommand::Fire)
    }

    /// Stop pulse generation, reset the controller, and close the port:
    /// `Q`, settle delay, `V`, settle delay, close.
    pub fn shutdown(mut self) -> Result<()> {
        self.cmd_tx
            .send(Cmd::Shutdown)
            .map_err(|_| Error::WorkerDisconnected)?;
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                return Err(Error::WorkerDisconnected);
            }
        }
        if let Some(e) = self.err_from_worker.lock().unwrap().take() {
            return Err(e);
        }
        Ok(())
    }
}

impl Drop for TriggerController {
    fn drop(&mut self) {
        // Normal teardown goes through shutdown(); this only stops a
        // leaked comms thread.
        self.control.stop();
    }
}

fn comms_loop(
    mut link: Box<dyn TriggerLink>,
    cmd_rx: crossbeam_channel::Receiver<Cmd>,
    flag: thread_control::Flag,
    settle: Duration,
    err_slot: Arc<Mutex<Option<Error>>>,
) {
    while flag.alive() {
        match cmd_rx.recv_timeout(READ_TIMEOUT) {
            Ok(Cmd::Send(command)) => {
                let line = command.encode();
                trace!("sending: \"{line}\"");
                if let Err(e) = link.send_line(&line) {
                    warn!("writing command to controller failed: {e}");
                    *err_slot.lock().unwrap() = Some(e);
                    break;
                }
            }
            Ok(Cmd::Shutdown) => {
                for line in ["Q", "V"] {
                    trace!("sending: \"{line}\"");
                    if let Err(e) = link.send_line(line) {
                        warn!("writing {line} to controller failed: {e}");
                        *err_slot.lock().unwrap() = Some(e);
                        break;
                    }
                    std::thread::sleep(settle);
                }
                break;
            }
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        // Drain any pending acknowledgement line. Best-effort only.
        match link.recv_line(READ_TIMEOUT) {
            Ok(Some(line)) => handle_ack(&line),
            Ok(None) => {}
            Err(e) => {
                warn!("reading controller acknowledgement failed: {e}");
            }
        }
    }
    debug!("controller comms thread exiting");
}

fn handle_ack(line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    if line.bytes().all(|b| b.is_ascii() && !b.is_ascii_control()) {
        debug!("controller ack: \"{line}\"");
    } else {
        warn!("malformed controller acknowledgement: {line:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[derive(Debug, Clone, PartialEq)]
    enum LinkEvent {
        Line(String),
        Closed,
    }

    /// In-memory transport recording every line with its send time.
    struct MockLink {
        log: Arc<parking_lot::Mutex<Vec<(Instant, LinkEvent)>>>,
        acks: Vec<String>,
    }

    impl MockLink {
        fn new() -> (Self, Arc<parking_lot::Mutex<Vec<(Instant, LinkEvent)>>>) {
            let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
            (
                Self {
                    log: log.clone(),
                    acks: Vec::new(),
                },
                log,
            )
        }
    }

    impl TriggerLink for MockLink {
        fn send_line(&mut self, line: &str) -> Result<()> {
            self.log
                .lock()
                .push((Instant::now(), LinkEvent::Line(line.to_string())));
            Ok(())
        }

        fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>> {
            if self.acks.is_empty() {
                std::thread::sleep(timeout);
                Ok(None)
            } else {
                Ok(Some(self.acks.remove(0)))
            }
        }
    }

    impl Drop for MockLink {
        fn drop(&mut self) {
            self.log.lock().push((Instant::now(), LinkEvent::Closed));
        }
    }

    fn lines(log: &[(Instant, LinkEvent)]) -> Vec<String> {
        log.iter()
            .filter_map(|(_, ev)| match ev {
                LinkEvent::Line(l) => Some(l.clone()),
                LinkEvent::Closed => None,
            })
            .collect()
    }

    #[test]
    fn rate_command_encoding() {
        assert_eq!(TriggerCommand::SetRate(30).encode(), "S,30");
        assert_eq!(TriggerCommand::SetRate(120).encode(), "S,120");
    }

    #[test]
    fn schedule_command_encoding() {
        let events = vec![
            StimulationEvent {
                global_onset_sec: 12.0,
                duration_sec: 0.5,
                pulse_interval_ms: 100,
                duty_cycle_pct: 50,
            },
            StimulationEvent {
                global_onset_sec: 20.5,
                duration_sec: 1.0,
                pulse_interval_ms: 40,
                duty_cycle_pct: 25,
            },
        ];
        assert_eq!(
            TriggerCommand::PushSchedule(events).encode(),
            "D,12-500-100-50,20.5-1000-40-25"
        );
    }

    #[test]
    fn single_letter_commands() {
        assert_eq!(TriggerCommand::Fire.encode(), "T");
        assert_eq!(TriggerCommand::Stop.encode(), "Q");
        assert_eq!(TriggerCommand::Reset.encode(), "V");
    }

    #[test]
    fn session_command_order() {
        let (link, log) = MockLink::new();
        let controller =
            TriggerController::with_link(Box::new(link), Duration::from_millis(1)).unwrap();
        controller.set_rate(30).unwrap();
        controller
            .push_schedule(&[StimulationEvent {
                global_onset_sec: 12.0,
                duration_sec: 0.5,
                pulse_interval_ms: 100,
                duty_cycle_pct: 50,
            }])
            .unwrap();
        controller.fire().unwrap();
        controller.shutdown().unwrap();

        let log = log.lock();
        assert_eq!(
            lines(&log),
            vec!["S,30", "D,12-500-100-50", "T", "Q", "V"]
        );
        assert_eq!(log.last().unwrap().1, LinkEvent::Closed);
    }

    #[test]
    fn shutdown_settle_delays_are_respected() {
        let settle = Duration::from_millis(200);
        let (link, log) = MockLink::new();
        let controller = TriggerController::with_link(Box::new(link), settle).unwrap();
        controller.shutdown().unwrap();

        let log = log.lock();
        assert_eq!(lines(&log), vec!["Q", "V"]);

        let t_q = log[0].0;
        let t_v = log[1].0;
        let t_close = log
            .iter()
            .find(|(_, ev)| *ev == LinkEvent::Closed)
            .unwrap()
            .0;
        assert!(t_v.duration_since(t_q) >= settle);
        assert!(t_close.duration_since(t_q) >= settle * 2);
    }

    #[test]
    fn acks_are_drained_without_failing() {
        let (mut link, log) = MockLink::new();
        link.acks = vec!["FPS 30".to_string(), "\u{7f}garbled\u{1}".to_string()];
        let controller =
            TriggerController::with_link(Box::new(link), Duration::from_millis(1)).unwrap();
        controller.set_rate(30).unwrap();
        // Give the comms thread a couple of poll cycles to drain both acks.
        std::thread::sleep(Duration::from_millis(100));
        controller.shutdown().unwrap();
        assert_eq!(lines(&log.lock()), vec!["S,30", "Q", "V"]);
    }
}
