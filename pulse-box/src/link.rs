use std::io::{Read, Write};
use std::time::Duration;

use tracing::trace;

use crate::Result;

/// Byte transport under the trigger protocol.
///
/// The production implementation is [SerialLink]; tests substitute an
/// in-memory recording link.
pub trait TriggerLink: Send {
    /// Write one command line. The implementation appends the `\n`
    /// terminator.
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Read one acknowledgement line, waiting at most `timeout`. Returns
    /// `Ok(None)` when no complete line arrived in time.
    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>>;
}

/// Serial transport: 115200 baud, 8N1, the microcontroller's fixed link
/// parameters.
pub struct SerialLink {
    port: Box<dyn serialport::SerialPort>,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn open(device: &str) -> Result<Self> {
        let port = serialport::new(device, 115_200)
            .data_bits(serialport::DataBits::Eight)
            .flow_control(serialport::FlowControl::None)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(10))
            .open()?;
        Ok(Self {
            port,
            pending: Vec::new(),
        })
    }

    fn take_line(&mut self) -> Option<String> {
        let pos = self.pending.iter().position(|&b| b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&raw).trim_end().to_string())
    }
}

impl TriggerLink for SerialLink {
    fn send_line(&mut self, line: &str) -> Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.write_all(b"\n")?;
        self.port.flush()?;
        Ok(())
    }

    fn recv_line(&mut self, timeout: Duration) -> Result<Option<String>> {
        if let Some(line) = self.take_line() {
            return Ok(Some(line));
        }
        self.port.set_timeout(timeout)?;
        let mut buf = [0u8; 256];
        match self.port.read(&mut buf) {
            Ok(n) => {
                trace!("read {n} bytes from controller");
                self.pending.extend_from_slice(&buf[..n]);
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e.into()),
        }
        Ok(self.take_line())
    }
}
