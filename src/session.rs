use std::io::{BufRead, BufReader, Read};
use std::time::Duration;

use log::{debug, info};

use crate::cancel::Cancellation;
use crate::ports::DeviceIdentifier;

/// Transport is the byte stream underneath a Session. Reads are expected to
/// block for at most the transport's read timeout, and to report
/// ErrorKind::TimedOut (or WouldBlock) when nothing arrived.
pub trait Transport: Read {
    /// Number of bytes that can be read without blocking.
    fn bytes_available(&self) -> std::io::Result<u32>;
}

impl Transport for Box<dyn serialport::SerialPort> {
    fn bytes_available(&self) -> std::io::Result<u32> {
        Ok(self.bytes_to_read()?)
    }
}

pub trait Connector {
    type Transport: Transport;

    fn open(
        &self,
        id: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> serialport::Result<Self::Transport>;
}

/// SerialConnector opens real serial ports, 8N1 without flow control.
pub struct SerialConnector;

impl Connector for SerialConnector {
    type Transport = Box<dyn serialport::SerialPort>;

    fn open(
        &self,
        id: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> serialport::Result<Self::Transport> {
        serialport::new(id, baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            // The timeout bounds how long read_line blocks, and therefore how
            // quickly the streaming loop notices deadlines and cancellation.
            .timeout(read_timeout)
            .open()
    }
}

#[derive(Debug)]
pub struct ConnectionError {
    pub port: DeviceIdentifier,
    pub reason: String,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "failed to connect to {}: {}", self.port, self.reason)
    }
}

impl std::error::Error for ConnectionError {}

#[derive(Debug)]
pub enum OpenError {
    /// Cancelled during the settle delay, before the port was opened.
    Cancelled,
    Failed(ConnectionError),
}

#[derive(Debug, PartialEq)]
pub enum ReadOutcome {
    /// One complete line, including its terminator (if the stream had one).
    Line(Vec<u8>),
    /// Nothing (or only part of a line) arrived within the read timeout.
    Idle,
    /// The transport reported end-of-stream.
    Closed,
}

/// Session owns an open transport for its whole lifetime. Dropping the
/// session closes the transport, so every exit path closes the device.
pub struct Session<T: Transport> {
    id: DeviceIdentifier,
    reader: BufReader<T>,
    // Bytes of a line that's still in flight. read_until keeps whatever it
    // consumed before a timeout, so partial lines survive across reads.
    pending: Vec<u8>,
    eof: bool,
}

impl<T: Transport> Session<T> {
    /// Waits `settle_delay` (giving freshly attached firmware a chance to
    /// finish booting and stop spewing garbage), then opens `id`.
    pub fn open<C: Connector<Transport = T> + ?Sized>(
        connector: &C,
        id: &str,
        baud_rate: u32,
        read_timeout: Duration,
        settle_delay: Duration,
        cancellation: &Cancellation,
    ) -> Result<Session<T>, OpenError> {
        if !settle_delay.is_zero() {
            debug!("waiting {settle_delay:?} for {id} to settle");
            if cancellation.sleep(settle_delay) {
                return Err(OpenError::Cancelled);
            }
        }
        match connector.open(id, baud_rate, read_timeout) {
            Ok(transport) => {
                info!("Connected to {id} at {baud_rate} baud.");
                Ok(Session::new(id, transport))
            }
            Err(e) => Err(OpenError::Failed(ConnectionError {
                port: id.to_string(),
                reason: e.to_string(),
            })),
        }
    }

    pub fn new(id: &str, transport: T) -> Session<T> {
        Session {
            id: id.to_string(),
            reader: BufReader::new(transport),
            pending: Vec::with_capacity(128),
            eof: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Non-blocking check for buffered or incoming bytes. The streaming loop
    /// doesn't use this: it blocks in read_line, which returns within the
    /// read timeout anyway. It is here for callers that need to poll
    /// without committing to a read.
    pub fn has_data(&self) -> std::io::Result<bool> {
        if !self.reader.buffer().is_empty() {
            return Ok(true);
        }
        Ok(self.reader.get_ref().bytes_available()? > 0)
    }

    /// Reads until a newline, end-of-stream or the read timeout. Timeouts
    /// are never errors: they yield ReadOutcome::Idle.
    pub fn read_line(&mut self) -> std::io::Result<ReadOutcome> {
        if self.eof {
            return Ok(ReadOutcome::Closed);
        }
        match self.reader.read_until(b'\n', &mut self.pending) {
            Ok(0) => {
                self.eof = true;
                // A final line without terminator is still a line.
                if self.pending.is_empty() {
                    Ok(ReadOutcome::Closed)
                } else {
                    Ok(ReadOutcome::Line(std::mem::take(&mut self.pending)))
                }
            }
            Ok(_) => {
                if self.pending.last() == Some(&b'\n') {
                    Ok(ReadOutcome::Line(std::mem::take(&mut self.pending)))
                } else {
                    // read_until stopped short of a newline, i.e. it hit EOF.
                    // Hand out what we have; the next read reports Closed.
                    self.eof = true;
                    Ok(ReadOutcome::Line(std::mem::take(&mut self.pending)))
                }
            }
            Err(e) => match e.kind() {
                std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::WouldBlock
                | std::io::ErrorKind::Interrupted => Ok(ReadOutcome::Idle),
                _ => Err(e),
            },
        }
    }

    pub fn close(self) {
        // See Drop.
    }
}

impl<T: Transport> Drop for Session<T> {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                "discarding {} bytes of incomplete line from {}",
                self.pending.len(),
                self.id
            );
        }
        debug!("closed {}", self.id);
    }
}
