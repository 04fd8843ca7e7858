//! Serial transport to the monitor.
//!
//! Wraps a non-blocking embedded-hal port with the bounded-timeout reads and
//! flush-then-write semantics the monitor exchanges rely on. Failures are
//! returned to the caller, which decides whether to retry or mark the link
//! down.

use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::stats::{Counter, Counters};
use crate::{Error, Options};

/// Baud rate used to force the line into hang-up during [`Transport::reset`]
pub const RESET_BAUD: u32 = 0;

/// Serial port with open/close and rate control on top of the embedded-hal traits
pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn open(&mut self) -> Result<(), E>;
    fn close(&mut self) -> Result<(), E>;
    fn is_open(&self) -> bool;

    fn baud_rate(&self) -> u32;
    /// Set the line rate, applied on the next open
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), E>;

    fn name(&self) -> String;
}

pub struct Transport<P, D, E> {
    port: P,
    delay: D,
    options: Options,
    counters: Arc<dyn Counters>,
    _err: core::marker::PhantomData<E>,
}

impl<P, D, E> Transport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, options: Options, counters: Arc<dyn Counters>) -> Self {
        Self {
            port,
            delay,
            options,
            counters,
            _err: core::marker::PhantomData,
        }
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn name(&self) -> String {
        self.port.name()
    }

    pub fn is_open(&self) -> bool {
        self.port.is_open()
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn counters(&self) -> &Arc<dyn Counters> {
        &self.counters
    }

    pub fn open(&mut self) -> Result<(), Error<E>> {
        if !self.port.is_open() {
            debug!("Opening {}", self.port.name());
            self.port.open()?;
        }
        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error<E>> {
        if self.port.is_open() {
            debug!("Closing {}", self.port.name());
            self.port.close()?;
        }
        Ok(())
    }

    /// Toggle the line through hang-up to get an unresponsive monitor to re-announce
    /// itself. Leaves the port at its original rate and open state.
    ///
    /// The original rate is restored even when the hang-up fails, in which
    /// case the port is left closed.
    pub fn reset(&mut self) -> Result<(), Error<E>> {
        let was_open = self.port.is_open();
        let baud = self.port.baud_rate();

        debug!("Resetting {} (open: {})", self.port.name(), was_open);

        let hangup = self.hangup(was_open);
        let restored = self.port.set_baud_rate(baud);
        hangup?;
        restored?;

        if was_open {
            self.port.open()?;
        }

        Ok(())
    }

    fn hangup(&mut self, was_open: bool) -> Result<(), E> {
        if was_open {
            self.port.close()?;
        }

        self.port.set_baud_rate(RESET_BAUD)?;
        self.port.open()?;
        self.delay.delay_ms(self.options.reset_hold_ms);
        self.port.close()
    }

    /// Flush pending output then write `data`
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        match self.write_inner(data) {
            Ok(()) => {
                self.counters.increment(Counter::Tx);
                Ok(())
            }
            Err(e) => {
                self.counters.increment(Counter::TxFail);
                Err(e)
            }
        }
    }

    fn write_inner(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        if !self.port.is_open() {
            return Err(Error::NotOpen);
        }

        block!(self.port.flush())?;
        for b in data {
            block!(self.port.write(*b))?;
        }

        Ok(())
    }

    /// Read up to `max` bytes, waiting at most the response timeout.
    ///
    /// Returns whatever arrived, which is empty if nothing did. Only a port
    /// failure is an error.
    pub fn read(&mut self, max: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::with_capacity(max);
        let mut t = 0;

        if !self.port.is_open() {
            self.counters.increment(Counter::RxFail);
            return Err(Error::NotOpen);
        }

        while data.len() < max {
            match self.port.read() {
                Ok(v) => {
                    data.push(v);
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => {
                    error!("Failed to read {}: {:?}", self.port.name(), e);
                    self.counters.increment(Counter::RxFail);
                    return Err(e.into());
                }
            }

            if t >= self.options.response_timeout_ms {
                break;
            }

            self.delay.delay_ms(self.options.poll_delay_ms);
            t += self.options.poll_delay_ms.max(1);
        }

        self.counters.increment(Counter::Rx);
        Ok(data)
    }

    /// Read up to `max` bytes that are already waiting, without blocking
    pub fn read_available(&mut self, max: usize) -> Result<Vec<u8>, Error<E>> {
        let mut data = Vec::new();

        if !self.port.is_open() {
            return Err(Error::NotOpen);
        }

        while data.len() < max {
            match self.port.read() {
                Ok(v) => data.push(v),
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => {
                    self.counters.increment(Counter::RxFail);
                    return Err(e.into());
                }
            }
        }

        Ok(data)
    }

    /// Discard anything left on the line, returning the number of bytes dropped
    pub fn drain(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;
        loop {
            let d = self.read_available(64)?;
            if d.is_empty() {
                break;
            }
            trace!("Drained {:02x?}", d);
            n += d.len();
        }
        Ok(n)
    }

    /// Collect output until the line has been silent for `timeout_ms`.
    ///
    /// The window is split into a fixed number of slices. Any data arriving
    /// restarts the full window, so this keeps waiting as long as the device
    /// keeps talking.
    pub fn wait_for_output(&mut self, timeout_ms: u32) -> Result<Vec<u8>, Error<E>> {
        const SLICES: u32 = 10;
        const CHUNK: usize = 32;

        let slice = (timeout_ms / SLICES).max(1);
        let mut remaining = SLICES;
        let mut output = Vec::new();

        while remaining > 0 {
            let d = self.read_available(CHUNK)?;
            if !d.is_empty() {
                debug!("Output: {:02x?}", d);
                output.extend_from_slice(&d);
                remaining = SLICES;
            }

            self.delay.delay_ms(slice);
            remaining -= 1;
        }

        Ok(output)
    }
}
