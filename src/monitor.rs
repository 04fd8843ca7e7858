//! Connection keep-alive.
//!
//! [`ConnectionMonitor`] owns the transport and periodically probes the
//! monitor from a background thread, resetting the port when the probe goes
//! unanswered. Other components borrow the transport through
//! [`ConnectionMonitor::with_transport`], which serialises them against the
//! probe cycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;

use crate::protocol::{MonitorCommand, ProbeOutcome, PROBE_READ_LEN};
use crate::stats::{Counter, Counters};
use crate::transport::{SerialPort, Transport};
use crate::Options;

/// Number of polls [`ConnectionMonitor::wait_until_connected`] spreads its timeout over
const WAIT_POLLS: u32 = 10;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ConnectionState {
    Down,
    Up,
}

impl ConnectionState {
    fn from_up(up: bool) -> Self {
        if up {
            ConnectionState::Up
        } else {
            ConnectionState::Down
        }
    }
}

/// Gate controlling whether the probe cycle runs.
///
/// Counts suspenders so overlapping suspensions nest, probing resumes once
/// every suspender has released it.
#[derive(Debug, Default)]
pub struct PollingGate {
    suspended: AtomicUsize,
}

impl PollingGate {
    pub fn is_enabled(&self) -> bool {
        self.suspended.load(Ordering::Acquire) == 0
    }

    pub fn suspend(&self) {
        self.suspended.fetch_add(1, Ordering::AcqRel);
    }

    pub fn resume(&self) {
        let _ = self
            .suspended
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }
}

pub struct ConnectionMonitor<P, D, E> {
    transport: Mutex<Transport<P, D, E>>,
    connected: AtomicBool,
    polling: PollingGate,
    exit: AtomicBool,
    listeners: Mutex<Vec<Sender<ConnectionState>>>,
    counters: Arc<dyn Counters>,
    interval: Duration,
}

impl<P, D, E> ConnectionMonitor<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a monitor around a transport, initially [`ConnectionState::Down`]
    pub fn new(transport: Transport<P, D, E>, counters: Arc<dyn Counters>) -> Self {
        let interval = Duration::from_millis(transport.options().probe_interval_ms as u64);

        Self {
            transport: Mutex::new(transport),
            connected: AtomicBool::new(false),
            polling: PollingGate::default(),
            exit: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
            counters,
            interval,
        }
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_up(self.is_connected())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> &Arc<dyn Counters> {
        &self.counters
    }

    pub fn options(&self) -> Options {
        self.lock().options().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Transport<P, D, E>> {
        self.transport.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive use of the transport.
    ///
    /// The lock is held for the whole of `f`, so a multi-exchange sequence is
    /// never interleaved with a probe.
    pub fn with_transport<R>(&self, f: impl FnOnce(&mut Transport<P, D, E>) -> R) -> R {
        let mut t = self.lock();
        f(&mut t)
    }

    /// Suspend or resume the background probe.
    ///
    /// Suspensions nest, each `false` must be matched by a `true`. A probe
    /// already in flight is not interrupted.
    pub fn set_polling_enabled(&self, enabled: bool) {
        if enabled {
            self.polling.resume();
        } else {
            self.polling.suspend();
        }
        debug!("Polling {}", if self.polling.is_enabled() { "enabled" } else { "suspended" });
    }

    pub fn is_polling_enabled(&self) -> bool {
        self.polling.is_enabled()
    }

    /// Receive a [`ConnectionState`] on every up/down transition
    pub fn subscribe(&self) -> Receiver<ConnectionState> {
        let (tx, rx) = channel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Probe the monitor once, reconnecting if it did not answer
    pub fn probe_cycle(&self) -> ProbeOutcome {
        let t = self.lock();
        self.cycle(t)
    }

    /// Probe cycle of the background task. Polling may be suspended while
    /// the task waits for the transport, so the gate is checked again under
    /// the lock.
    fn poll_cycle(&self) -> Option<ProbeOutcome> {
        let t = self.lock();
        if !self.polling.is_enabled() {
            trace!("Polling suspended, skipping probe");
            return None;
        }
        Some(self.cycle(t))
    }

    fn cycle(&self, mut t: MutexGuard<'_, Transport<P, D, E>>) -> ProbeOutcome {
        let outcome = self.probe(&mut t);
        self.count(&outcome);

        if !outcome.is_up() {
            self.reconnect(&mut t);
        }

        if t.is_open() {
            match t.drain() {
                Ok(0) => (),
                Ok(n) => debug!("Discarded {} stray bytes", n),
                Err(e) => debug!("Drain failed: {:?}", e),
            }
        }

        let name = t.name();
        drop(t);

        self.update(&name, outcome.is_up());

        outcome
    }

    fn probe(&self, t: &mut Transport<P, D, E>) -> ProbeOutcome {
        if let Err(e) = t.write(&MonitorCommand::Probe.encode()) {
            debug!("Probe write failed: {:?}", e);
            return ProbeOutcome::Failed;
        }

        let response = match t.read(PROBE_READ_LEN) {
            Ok(r) => r,
            Err(e) => {
                debug!("Probe read failed: {:?}", e);
                return ProbeOutcome::Failed;
            }
        };

        let outcome = ProbeOutcome::classify(&response);
        match &outcome {
            ProbeOutcome::Malformed(d) => error!("Read unexpected data {:02x?}", d),
            ProbeOutcome::BadLength(d) => warn!("Probe response of unexpected length {:02x?}", d),
            _ => (),
        }

        outcome
    }

    fn count(&self, outcome: &ProbeOutcome) {
        let c = match outcome {
            ProbeOutcome::Ok => Counter::ProbeOk,
            ProbeOutcome::Ok4 => Counter::ProbeOk4,
            ProbeOutcome::BadLength(_) => Counter::ProbeBadLength,
            ProbeOutcome::NoResponse => Counter::ProbeNoResponse,
            ProbeOutcome::Malformed(_) => Counter::ProbeMalformed,
            ProbeOutcome::Failed => Counter::ProbeFail,
        };
        self.counters.increment(c);
    }

    fn reconnect(&self, t: &mut Transport<P, D, E>) {
        self.counters.increment(Counter::Reconnect);

        let r = t.reset().and_then(|_| t.open());
        if let Err(e) = r {
            debug!("Reconnect to {} failed: {:?}", t.name(), e);
            self.counters.increment(Counter::ReconnectFail);
        }
    }

    fn update(&self, name: &str, up: bool) {
        if self.connected.swap(up, Ordering::AcqRel) == up {
            return;
        }

        let state = ConnectionState::from_up(up);
        self.counters.increment(Counter::StateChange);
        info!("Connection {} is {}", name, if up { "up" } else { "down" });

        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|l| l.send(state).is_ok());
    }

    /// Wait up to `timeout_ms` for the background task to see the monitor.
    ///
    /// Only observes state, the probing itself is done by the task started
    /// with [`ConnectionMonitor::spawn`].
    pub fn wait_until_connected(&self, timeout_ms: u32) -> bool {
        let step = Duration::from_millis((timeout_ms / WAIT_POLLS).max(1) as u64);

        for _ in 0..WAIT_POLLS {
            if self.is_connected() {
                break;
            }
            thread::sleep(step);
        }

        self.is_connected()
    }

    /// Stop the background task after its current cycle
    pub fn cancel(&self) {
        self.exit.store(true, Ordering::Release);
    }

    fn run(&self) {
        debug!("Monitor task started");

        while !self.exit.load(Ordering::Acquire) {
            if self.polling.is_enabled() {
                self.poll_cycle();
            }
            thread::sleep(self.interval);
        }

        debug!("Monitor task exiting");
    }
}

impl<P, D, E> ConnectionMonitor<P, D, E>
where
    P: SerialPort<E> + Send + 'static,
    D: DelayMs<u32> + Send + 'static,
    E: core::fmt::Debug + Send + 'static,
{
    /// Start the periodic probe on a background thread
    pub fn spawn(self: &Arc<Self>) -> std::io::Result<JoinHandle<()>> {
        let monitor = self.clone();
        thread::Builder::new()
            .name("samba-monitor".to_string())
            .spawn(move || monitor.run())
    }
}
