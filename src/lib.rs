//! AT91 SAM-BA boot ROM monitor driver.
//!
//! Talks to the SAM-BA monitor over a serial line. It keeps the link alive,
//! reads and writes target memory, loads and starts applets, and sends
//! control frames to an applet once it is running.
//!
//! ```text
//! ConnectionMonitor ── probe ──┐
//! MemoryAccess ────────────────┼── Mutex<Transport> ── SerialPort
//! CodeLoader ──────────────────┤
//! CommandLoop ── frames ───────┘
//! ```

use std::fmt;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

pub mod applet;
pub mod loader;
pub mod memory;
pub mod monitor;
pub mod protocol;
pub mod stats;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

#[cfg(test)]
pub(crate) mod mock;

pub use applet::{AppletFrame, CommandLoop, FrameError};
pub use loader::{CodeLoader, LoadMethod};
pub use memory::MemoryAccess;
pub use monitor::{ConnectionMonitor, ConnectionState};
pub use protocol::{MonitorCommand, ProbeOutcome};
pub use stats::{Counter, Counters, NoCounters, Statistics};
pub use transport::{SerialPort, Transport};

/// Default monitor line rate
pub const DEFAULT_BAUD: u32 = 115_200;

#[derive(Clone, PartialEq, Debug)]
pub enum Error<SerialError> {
    /// Underlying port failure
    Serial(SerialError),
    /// Port is closed
    NotOpen,
    /// No data arrived within the response timeout
    ResponseTimeout,
    /// Response did not have the expected shape
    InvalidResponse(Vec<u8>),
    /// Transfer size is not a whole number of words
    UnalignedSize(usize),
    /// Applet frame could not be built or parsed
    Frame(FrameError),
    /// Dump aborted part way, `data` holds the words read before the failure
    DumpIncomplete {
        data: Vec<u8>,
        cause: Box<Error<SerialError>>,
    },
    /// Load aborted part way, `written` bytes reached the target
    LoadIncomplete {
        written: usize,
        cause: Box<Error<SerialError>>,
    },
}

impl<SerialError> From<SerialError> for Error<SerialError> {
    fn from(e: SerialError) -> Self {
        Self::Serial(e)
    }
}

impl<SerialError: fmt::Debug> fmt::Display for Error<SerialError> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Serial(e) => write!(f, "serial error: {:?}", e),
            Error::NotOpen => write!(f, "serial port is not open"),
            Error::ResponseTimeout => write!(f, "timeout awaiting monitor response"),
            Error::InvalidResponse(d) => write!(f, "invalid monitor response: {:02x?}", d),
            Error::UnalignedSize(n) => write!(f, "size {} is not a multiple of 4", n),
            Error::Frame(e) => write!(f, "{}", e),
            Error::DumpIncomplete { data, cause } => {
                write!(f, "dump aborted after {} bytes: {}", data.len(), cause)
            }
            Error::LoadIncomplete { written, cause } => {
                write!(f, "load aborted after {} bytes: {}", written, cause)
            }
        }
    }
}

impl<SerialError: fmt::Debug> std::error::Error for Error<SerialError> {}

/// Argument parsing failures, raised before anything touches the wire
#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum InputError {
    #[error("'{0}' is not a valid hexadecimal integer")]
    Hex(String),
    #[error("'{0}' is not a valid integer")]
    Decimal(String),
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Timeout to wait for monitor responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "100"))]
    pub response_timeout_ms: u32,

    /// Period to poll the serial port while awaiting a response
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period between connection probes
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub probe_interval_ms: u32,

    /// Time to hold the line in hang-up when resetting the port
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub reset_hold_ms: u32,

    /// Period of silence after which a started applet is considered settled
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "200"))]
    pub settle_timeout_ms: u32,

    /// Time to wait for the monitor to come up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub connect_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            response_timeout_ms: 100,
            poll_delay_ms: 1,
            probe_interval_ms: 50,
            reset_hold_ms: 50,
            settle_timeout_ms: 200,
            connect_timeout_ms: 1000,
        }
    }
}

/// Parse a hexadecimal address or value, with or without a `0x` prefix
pub fn parse_hex(s: &str) -> Result<u32, InputError> {
    let t = s.trim();
    let digits = t
        .strip_prefix("0x")
        .or_else(|| t.strip_prefix("0X"))
        .unwrap_or(t);

    u32::from_str_radix(digits, 16).map_err(|_| InputError::Hex(s.to_string()))
}

/// Parse a decimal size
pub fn parse_size(s: &str) -> Result<usize, InputError> {
    s.trim()
        .parse()
        .map_err(|_| InputError::Decimal(s.to_string()))
}

/// Render memory as lines of 16 bytes with address, hex and ASCII columns
pub fn format_dump(address: u32, data: &[u8]) -> Vec<String> {
    data.chunks(16)
        .enumerate()
        .map(|(i, line)| {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
            let ascii: String = line
                .iter()
                .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
                .collect();

            format!(
                "{:08X}: {:<47}  {}",
                address.wrapping_add(i as u32 * 16),
                hex.join(" "),
                ascii
            )
        })
        .collect()
}
