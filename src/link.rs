//! Byte-stream transport used by the protocol engines.
//!
//! The engines only need to open a port, poll for bytes, write and flush, so
//! that is the whole trait. [`SerialLink`] is the production implementation
//! over the `serialport` crate; tests drive the engines with scripted
//! in-memory links instead.

use std::io::{Read, Write};
use std::time::Duration;

use crate::Error;

/// A byte-stream collaborator: open, read with timeout, write, flush.
///
/// Implementations own their reconnect policy: a real I/O failure closes the
/// underlying port and the next operation reopens it.
pub trait ByteLink {
    /// Opens the underlying port. A no-op when already open.
    fn open(&mut self) -> Result<(), Error>;

    fn is_open(&self) -> bool;

    /// Drops the underlying port, forcing a reopen on the next operation.
    fn close(&mut self);

    /// Reads available bytes into `buf`. Returns `Ok(0)` when nothing
    /// arrived within the poll timeout.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Discards any pending input. Called before each request so stale reply
    /// bytes cannot be matched against a new request.
    fn clear_input(&mut self) -> Result<(), Error>;
}

/// A [`ByteLink`] over a real serial device, 8-N-1, no flow control.
pub struct SerialLink {
    path: String,
    baud_rate: u32,
    poll_timeout: Duration,
    port: Option<Box<dyn serialport::SerialPort>>,
}

impl SerialLink {
    /// Prepares a link for `path`. The port is opened lazily; construction
    /// never performs I/O.
    pub fn new(path: impl Into<String>, baud_rate: u32, poll_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            poll_timeout,
            port: None,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, Error> {
        if self.port.is_none() {
            self.open()?;
        }
        // open() either filled the slot or returned the error above
        self.port
            .as_mut()
            .ok_or_else(|| Error::Io(std::io::Error::other("serial port not open")))
    }
}

impl ByteLink for SerialLink {
    fn open(&mut self) -> Result<(), Error> {
        if self.port.is_some() {
            return Ok(());
        }
        let port = serialport::new(&self.path, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .flow_control(serialport::FlowControl::None)
            .timeout(self.poll_timeout)
            .open()
            .map_err(|e| {
                log::error!("open_port {}: {e}", self.path);
                Error::Io(e.into())
            })?;
        log::debug!("opened {} at {} baud", self.path, self.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn close(&mut self) {
        self.port = None;
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let port = self.port()?;
        match port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => {
                self.close();
                Err(Error::Io(e))
            }
        }
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), Error> {
        let port = self.port()?;
        if let Err(e) = port.write_all(data) {
            self.close();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        let port = self.port()?;
        if let Err(e) = port.flush() {
            self.close();
            return Err(Error::Io(e));
        }
        Ok(())
    }

    fn clear_input(&mut self) -> Result<(), Error> {
        let port = self.port()?;
        if let Err(e) = port.clear(serialport::ClearBuffer::Input) {
            self.close();
            return Err(Error::Io(e.into()));
        }
        Ok(())
    }
}
