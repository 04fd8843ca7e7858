//! Target memory access through the monitor.

use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;

use crate::monitor::ConnectionMonitor;
use crate::protocol::{decode_word, MonitorCommand, MAX_BLOCK, WORD_SIZE};
use crate::stats::{Counter, Counters};
use crate::transport::{SerialPort, Transport};
use crate::Error;

/// Read one word from `address`
pub fn read_word<P, D, E>(t: &mut Transport<P, D, E>, address: u32) -> Result<u32, Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    t.counters().increment(Counter::ReadWord);
    t.write(&MonitorCommand::ReadWord(address).encode())?;

    let data = t.read(WORD_SIZE)?;
    if data.is_empty() {
        return Err(Error::ResponseTimeout);
    }

    decode_word(&data).ok_or(Error::InvalidResponse(data))
}

/// Write one word to `address`
pub fn write_word<P, D, E>(
    t: &mut Transport<P, D, E>,
    address: u32,
    value: u32,
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    trace!("W {:08X} = {:08X}", address, value);
    t.counters().increment(Counter::WriteWord);
    t.write(&MonitorCommand::WriteWord(address, value).encode())
}

/// Send a single block, at most [`MAX_BLOCK`] bytes
pub fn send_block<P, D, E>(
    t: &mut Transport<P, D, E>,
    address: u32,
    data: &[u8],
) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    debug_assert!(data.len() <= MAX_BLOCK);
    trace!("S {:08X} ({} bytes)", address, data.len());
    t.counters().increment(Counter::SendBlock);
    t.write(&MonitorCommand::SendBlock(address, data).encode())
}

/// Start executing at `address`
pub fn execute<P, D, E>(t: &mut Transport<P, D, E>, address: u32) -> Result<(), Error<E>>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    debug!("Executing from 0x{:08X}", address);
    t.counters().increment(Counter::Execute);
    t.write(&MonitorCommand::Execute(address).encode())
}

/// Word and block access to target memory.
///
/// Each call holds the transport for its full duration, so a dump is never
/// interleaved with a connection probe.
pub struct MemoryAccess<P, D, E> {
    monitor: Arc<ConnectionMonitor<P, D, E>>,
}

impl<P, D, E> Clone for MemoryAccess<P, D, E> {
    fn clone(&self) -> Self {
        Self {
            monitor: self.monitor.clone(),
        }
    }
}

impl<P, D, E> MemoryAccess<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(monitor: Arc<ConnectionMonitor<P, D, E>>) -> Self {
        Self { monitor }
    }

    fn counters(&self) -> &Arc<dyn Counters> {
        self.monitor.counters()
    }

    /// Read the word at `address`
    pub fn read(&self, address: u32) -> Result<u32, Error<E>> {
        self.monitor.with_transport(|t| read_word(t, address))
    }

    /// Write `value` to the word at `address`
    pub fn write(&self, address: u32, value: u32) -> Result<(), Error<E>> {
        self.monitor.with_transport(|t| write_word(t, address, value))
    }

    /// Read `size` bytes starting at `address`, one word at a time.
    ///
    /// `size` must be a multiple of the word size. If a read fails part way
    /// the words read so far are returned in [`Error::DumpIncomplete`].
    pub fn dump(&self, address: u32, size: usize) -> Result<Vec<u8>, Error<E>> {
        if size % WORD_SIZE != 0 {
            return Err(Error::UnalignedSize(size));
        }

        let counters = self.counters().clone();

        self.monitor.with_transport(|t| {
            let mut data = Vec::with_capacity(size);

            for i in 0..size / WORD_SIZE {
                let a = address.wrapping_add((i * WORD_SIZE) as u32);

                match read_word(t, a) {
                    Ok(w) => data.extend_from_slice(&w.to_le_bytes()),
                    Err(e) => {
                        error!("Failed to dump 0x{:08X}: {:?}", a, e);
                        counters.increment(Counter::DumpFail);
                        return Err(Error::DumpIncomplete {
                            data,
                            cause: Box::new(e),
                        });
                    }
                }
            }

            Ok(data)
        })
    }

    /// Write raw bytes starting at `address` in blocks of up to [`MAX_BLOCK`]
    pub fn write_block(&self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.monitor.with_transport(|t| {
            for (i, chunk) in data.chunks(MAX_BLOCK).enumerate() {
                send_block(t, address.wrapping_add((i * MAX_BLOCK) as u32), chunk)?;
            }
            Ok(())
        })
    }
}
