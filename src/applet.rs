//! Applet command loop protocol.
//!
//! Once an applet is running it listens for binary frames:
//!
//! ```text
//! [command:1][length:1][payload:length-1][checksum:1]
//! ```
//!
//! `length` counts the payload plus the checksum byte. The checksum is the
//! two's complement of the sum of the preceding bytes, so every byte of a
//! valid frame sums to zero.

use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;

use crate::monitor::ConnectionMonitor;
use crate::stats::Counter;
use crate::transport::SerialPort;
use crate::Error;

/// No-op, the applet echoes it back
pub const CMD_PING: u8 = 0x03;

/// Leave the applet command loop
pub const CMD_EXIT: u8 = 0x04;

/// Set on the command id of applet replies, except the very first
pub const REPLY_FLAG: u8 = 0x80;

/// Command id plus length byte
pub const HEADER_SIZE: usize = 2;

/// Largest payload the length byte can describe
pub const MAX_PAYLOAD: usize = u8::MAX as usize - 1;

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum FrameError {
    #[error("payload of {0} bytes exceeds the {max} byte frame limit", max = MAX_PAYLOAD)]
    PayloadTooLong(usize),
    #[error("frame truncated, {needed} bytes needed but {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("frame length byte is zero")]
    ZeroLength,
    #[error("frame checksum mismatch, expected {expected:#04x} got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },
}

/// Two's complement checksum of `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter()
        .fold(0u8, |sum, b| sum.wrapping_add(*b))
        .wrapping_neg()
}

#[derive(Clone, PartialEq, Eq, Debug)]
pub struct AppletFrame {
    command: u8,
    payload: Vec<u8>,
}

impl AppletFrame {
    pub fn build(command: u8, payload: &[u8]) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD {
            return Err(FrameError::PayloadTooLong(payload.len()));
        }

        Ok(Self {
            command,
            payload: payload.to_vec(),
        })
    }

    pub fn command(&self) -> u8 {
        self.command
    }

    /// Command id with the reply flag cleared
    pub fn base_command(&self) -> u8 {
        self.command & !REPLY_FLAG
    }

    pub fn is_reply(&self) -> bool {
        self.command & REPLY_FLAG != 0
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length plus one for the checksum
    pub fn length_byte(&self) -> u8 {
        self.payload.len() as u8 + 1
    }

    pub fn checksum(&self) -> u8 {
        let mut sum = self.command.wrapping_add(self.length_byte());
        for b in &self.payload {
            sum = sum.wrapping_add(*b);
        }
        sum.wrapping_neg()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut b = Vec::with_capacity(HEADER_SIZE + self.payload.len() + 1);
        b.push(self.command);
        b.push(self.length_byte());
        b.extend_from_slice(&self.payload);
        b.push(self.checksum());
        b
    }

    /// Parse a frame from the start of `data`, returning it with the number
    /// of bytes consumed
    pub fn parse(data: &[u8]) -> Result<(Self, usize), FrameError> {
        if data.len() < HEADER_SIZE + 1 {
            return Err(FrameError::Truncated {
                needed: HEADER_SIZE + 1,
                available: data.len(),
            });
        }

        let length = data[1] as usize;
        if length == 0 {
            return Err(FrameError::ZeroLength);
        }

        let size = HEADER_SIZE + length;
        if data.len() < size {
            return Err(FrameError::Truncated {
                needed: size,
                available: data.len(),
            });
        }

        let expected = checksum(&data[..size - 1]);
        let actual = data[size - 1];
        if expected != actual {
            return Err(FrameError::Checksum { expected, actual });
        }

        let frame = Self {
            command: data[0],
            payload: data[HEADER_SIZE..size - 1].to_vec(),
        };

        Ok((frame, size))
    }
}

/// Sends frames to a running applet.
///
/// Frames go straight to the transport, bypassing the monitor command
/// language, and no reply is awaited.
pub struct CommandLoop<P, D, E> {
    monitor: Arc<ConnectionMonitor<P, D, E>>,
}

impl<P, D, E> CommandLoop<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(monitor: Arc<ConnectionMonitor<P, D, E>>) -> Self {
        Self { monitor }
    }

    pub fn send(&self, command: u8, payload: &[u8]) -> Result<(), Error<E>> {
        let frame = AppletFrame::build(command, payload).map_err(Error::Frame)?;
        let bytes = frame.to_bytes();

        debug!("Sending frame {:02x?}", bytes);

        self.monitor.with_transport(|t| t.write(&bytes))?;
        self.monitor.counters().increment(Counter::FrameTx);

        Ok(())
    }

    pub fn ping(&self) -> Result<(), Error<E>> {
        self.send(CMD_PING, &[])
    }

    /// Ask the applet to return to the monitor
    pub fn exit(&self) -> Result<(), Error<E>> {
        self.send(CMD_EXIT, &[])
    }
}
