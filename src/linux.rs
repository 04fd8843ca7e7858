use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use embedded_hal::serial::{Read, Write};
use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::stats::Counters;
use crate::transport::{SerialPort, Transport, RESET_BAUD};
use crate::{ConnectionMonitor, Options};

pub type LinuxMonitor = ConnectionMonitor<LinuxPort, Delay, IoErrorKind>;

/// Linux tty, reopened on demand so the line rate can be toggled
pub struct LinuxPort {
    path: PathBuf,
    baud: u32,
    poll: Duration,
    serial: Option<Serial>,
}

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        SerialErrorKind::Io(k) => k,
    }
}

impl LinuxPort {
    pub fn new<P: AsRef<Path>>(path: P, baud: u32, options: &Options) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            baud,
            poll: Duration::from_millis(options.poll_delay_ms.max(1) as u64),
            serial: None,
        }
    }

    fn configure(&self, port: &mut Serial) -> Result<(), SerialError> {
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(Parity::ParityNone);

        // B0 is hang-up in termios, drop the modem lines rather than programming the rate
        if self.baud == RESET_BAUD {
            port.0.write_settings(&settings)?;
            port.0.set_dtr(false)?;
            port.0.set_rts(false)?;
        } else {
            settings.set_baud_rate(BaudRate::from_speed(self.baud as usize))?;
            port.0.write_settings(&settings)?;
        }

        port.0.set_timeout(self.poll)?;

        Ok(())
    }

    fn serial(&mut self) -> nb::Result<&mut Serial, IoErrorKind> {
        self.serial
            .as_mut()
            .ok_or(nb::Error::Other(IoErrorKind::NotConnected))
    }
}

impl Read<u8> for LinuxPort {
    type Error = IoErrorKind;

    fn read(&mut self) -> nb::Result<u8, IoErrorKind> {
        self.serial()?.read()
    }
}

impl Write<u8> for LinuxPort {
    type Error = IoErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), IoErrorKind> {
        self.serial()?.write(word)
    }

    fn flush(&mut self) -> nb::Result<(), IoErrorKind> {
        self.serial()?.flush()
    }
}

impl SerialPort<IoErrorKind> for LinuxPort {
    fn open(&mut self) -> Result<(), IoErrorKind> {
        if self.serial.is_some() {
            return Ok(());
        }

        let mut port = Serial::open(&self.path).map_err(io_kind)?;
        self.configure(&mut port).map_err(io_kind)?;
        self.serial = Some(port);

        Ok(())
    }

    fn close(&mut self) -> Result<(), IoErrorKind> {
        self.serial = None;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.serial.is_some()
    }

    fn baud_rate(&self) -> u32 {
        self.baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), IoErrorKind> {
        self.baud = baud;
        Ok(())
    }

    fn name(&self) -> String {
        self.path.display().to_string()
    }
}

impl LinuxMonitor {
    /// Create a monitor on a linux serial port.
    ///
    /// The port is opened here so configuration problems surface immediately,
    /// after that the monitor task takes care of reconnecting.
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: u32,
        options: Options,
        counters: Arc<dyn Counters>,
    ) -> anyhow::Result<Self> {
        let port = LinuxPort::new(port, baud, &options);
        let name = port.name();

        let mut transport = Transport::new(port, Delay {}, options, counters.clone());
        transport
            .open()
            .with_context(|| format!("opening serial port {}", name))?;

        Ok(Self::new(transport, counters))
    }
}
