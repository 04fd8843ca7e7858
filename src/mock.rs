//! Simulated SAM-BA monitor behind a serial port, for tests.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::transport::SerialPort;
use crate::DEFAULT_BAUD;

/// Delay that advances a shared virtual clock instead of sleeping
#[derive(Clone, Debug, Default)]
pub struct MockDelay {
    clock: Arc<AtomicU64>,
}

impl DelayMs<u32> for MockDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.clock.fetch_add(ms as u64, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct State {
    open: bool,
    baud: u32,
    opened_at: Vec<u32>,

    written: Vec<u8>,
    command: Vec<u8>,
    commands: Vec<String>,
    rx: VecDeque<u8>,
    scheduled: Vec<(u64, Vec<u8>)>,

    memory: HashMap<u32, u8>,
    block: Option<(u32, usize)>,
    executed: Vec<u32>,

    mute: bool,
    probe_reply: Option<Vec<u8>>,
    word_reads: usize,
    fail_reads_after: Option<usize>,
    read_fail: bool,
    open_fail: bool,
}

#[derive(Clone)]
pub struct MockPort {
    state: Arc<Mutex<State>>,
    clock: Arc<AtomicU64>,
}

impl MockPort {
    pub fn new() -> Self {
        let state = State {
            baud: DEFAULT_BAUD,
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock: Arc::new(AtomicU64::new(0)),
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn delay(&self) -> MockDelay {
        MockDelay {
            clock: self.clock.clone(),
        }
    }

    pub fn now(&self) -> u64 {
        self.clock.load(Ordering::SeqCst)
    }

    pub fn set_mute(&self, mute: bool) {
        self.state().mute = mute;
    }

    pub fn set_probe_reply(&self, reply: &[u8]) {
        self.state().probe_reply = Some(reply.to_vec());
    }

    pub fn fail_reads(&self, fail: bool) {
        self.state().read_fail = fail;
    }

    /// Start failing reads once `n` word reads have been answered
    pub fn fail_reads_after(&self, n: usize) {
        self.state().fail_reads_after = Some(n);
    }

    pub fn queue_rx(&self, data: &[u8]) {
        self.state().rx.extend(data);
    }

    /// Make `data` readable once the virtual clock reaches `at_ms`
    pub fn schedule_rx(&self, at_ms: u64, data: &[u8]) {
        self.state().scheduled.push((at_ms, data.to_vec()));
    }

    pub fn poke(&self, address: u32, data: &[u8]) {
        let mut s = self.state();
        for (i, b) in data.iter().enumerate() {
            s.memory.insert(address + i as u32, *b);
        }
    }

    pub fn peek(&self, address: u32, len: usize) -> Vec<u8> {
        let s = self.state();
        (0..len as u32)
            .map(|i| *s.memory.get(&(address + i)).unwrap_or(&0))
            .collect()
    }

    pub fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    /// Make every `open` fail until cleared
    pub fn fail_opens(&self, fail: bool) {
        self.state().open_fail = fail;
    }

    /// Commands received, without the `#` terminator or block payloads
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    pub fn executed(&self) -> Vec<u32> {
        self.state().executed.clone()
    }

    pub fn opened_at(&self) -> Vec<u32> {
        self.state().opened_at.clone()
    }

    pub fn is_open_now(&self) -> bool {
        self.state().open
    }

    pub fn open_count(&self) -> usize {
        self.state().opened_at.len()
    }
}

impl State {
    fn receive(&mut self, b: u8) {
        self.written.push(b);

        if let Some((addr, remaining)) = self.block {
            self.memory.insert(addr, b);
            self.block = if remaining > 1 {
                Some((addr + 1, remaining - 1))
            } else {
                None
            };
            return;
        }

        if b != b'#' {
            self.command.push(b);
            return;
        }

        let cmd = String::from_utf8_lossy(&self.command).to_string();
        self.command.clear();
        self.handle(&cmd);
        self.commands.push(cmd);
    }

    fn handle(&mut self, cmd: &str) {
        if cmd.is_empty() {
            return;
        }
        let (op, args) = cmd.split_at(1);
        let args: Vec<u32> = args
            .split(',')
            .filter(|a| !a.is_empty())
            .map(|a| u32::from_str_radix(a, 16).unwrap())
            .collect();

        match op {
            "N" if !self.mute => {
                let reply = self.probe_reply.clone().unwrap_or_else(|| b"\n\r".to_vec());
                self.rx.extend(reply);
            }
            "w" if !self.mute => {
                let addr = args[0];
                let word: Vec<u8> = (0..4)
                    .map(|i| *self.memory.get(&(addr + i)).unwrap_or(&0))
                    .collect();
                self.rx.extend(word);

                self.word_reads += 1;
                if let Some(n) = self.fail_reads_after {
                    if self.word_reads >= n {
                        self.read_fail = true;
                    }
                }
            }
            "W" => {
                for (i, b) in args[1].to_le_bytes().iter().enumerate() {
                    self.memory.insert(args[0] + i as u32, *b);
                }
            }
            "S" if args[1] > 0 => self.block = Some((args[0], args[1] as usize)),
            "G" => self.executed.push(args[0]),
            _ => (),
        }
    }
}

impl Read<u8> for MockPort {
    type Error = ErrorKind;

    fn read(&mut self) -> nb::Result<u8, ErrorKind> {
        let now = self.now();
        let mut s = self.state();

        if !s.open {
            return Err(nb::Error::Other(ErrorKind::NotConnected));
        }
        if s.read_fail {
            return Err(nb::Error::Other(ErrorKind::BrokenPipe));
        }

        let (due, later): (Vec<_>, Vec<_>) = s.scheduled.drain(..).partition(|(at, _)| *at <= now);
        s.scheduled = later;
        for (_, d) in due {
            s.rx.extend(d);
        }

        s.rx.pop_front().ok_or(nb::Error::WouldBlock)
    }
}

impl Write<u8> for MockPort {
    type Error = ErrorKind;

    fn write(&mut self, word: u8) -> nb::Result<(), ErrorKind> {
        let mut s = self.state();
        if !s.open {
            return Err(nb::Error::Other(ErrorKind::NotConnected));
        }
        s.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), ErrorKind> {
        Ok(())
    }
}

impl SerialPort<ErrorKind> for MockPort {
    fn open(&mut self) -> Result<(), ErrorKind> {
        let mut s = self.state();
        if s.open_fail {
            return Err(ErrorKind::PermissionDenied);
        }
        s.open = true;
        let baud = s.baud;
        s.opened_at.push(baud);
        Ok(())
    }

    fn close(&mut self) -> Result<(), ErrorKind> {
        self.state().open = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn baud_rate(&self) -> u32 {
        self.state().baud
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), ErrorKind> {
        self.state().baud = baud;
        Ok(())
    }

    fn name(&self) -> String {
        "mock".to_string()
    }
}
