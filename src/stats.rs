//! Operation counters.
//!
//! Components report what happened on the wire through a [`Counters`] sink
//! handed to them at construction, rather than through a global.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Countable events
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Counter {
    Tx,
    TxFail,
    Rx,
    RxFail,

    ProbeOk,
    ProbeOk4,
    ProbeNoResponse,
    ProbeMalformed,
    ProbeBadLength,
    ProbeFail,

    Reconnect,
    ReconnectFail,
    StateChange,

    ReadWord,
    WriteWord,
    SendBlock,
    Execute,
    DumpFail,

    Load,
    LoadFail,

    FrameTx,
}

impl Counter {
    pub const ALL: [Counter; 21] = [
        Counter::Tx,
        Counter::TxFail,
        Counter::Rx,
        Counter::RxFail,
        Counter::ProbeOk,
        Counter::ProbeOk4,
        Counter::ProbeNoResponse,
        Counter::ProbeMalformed,
        Counter::ProbeBadLength,
        Counter::ProbeFail,
        Counter::Reconnect,
        Counter::ReconnectFail,
        Counter::StateChange,
        Counter::ReadWord,
        Counter::WriteWord,
        Counter::SendBlock,
        Counter::Execute,
        Counter::DumpFail,
        Counter::Load,
        Counter::LoadFail,
        Counter::FrameTx,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Counter::Tx => "tx",
            Counter::TxFail => "txFail",
            Counter::Rx => "rx",
            Counter::RxFail => "rxFail",
            Counter::ProbeOk => "initOk",
            Counter::ProbeOk4 => "init4",
            Counter::ProbeNoResponse => "initNoResponse",
            Counter::ProbeMalformed => "initMalformed",
            Counter::ProbeBadLength => "initBadLength",
            Counter::ProbeFail => "initFail",
            Counter::Reconnect => "reconnect",
            Counter::ReconnectFail => "reconnectFail",
            Counter::StateChange => "stateChange",
            Counter::ReadWord => "readWord",
            Counter::WriteWord => "writeWord",
            Counter::SendBlock => "sendBlock",
            Counter::Execute => "execute",
            Counter::DumpFail => "dumpFail",
            Counter::Load => "load",
            Counter::LoadFail => "loadFail",
            Counter::FrameTx => "frameTx",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Counter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sink for counter events
pub trait Counters: Send + Sync {
    fn increment(&self, counter: Counter);
}

/// Discards all events
#[derive(Copy, Clone, Debug, Default)]
pub struct NoCounters;

impl Counters for NoCounters {
    fn increment(&self, _counter: Counter) {}
}

/// In-memory counter set
#[derive(Debug, Default)]
pub struct Statistics {
    counts: [AtomicU64; Counter::ALL.len()],
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the current value of a single counter
    pub fn get(&self, counter: Counter) -> u64 {
        self.counts[counter.index()].load(Ordering::Relaxed)
    }

    /// Non-zero counters, in declaration order
    pub fn snapshot(&self) -> Vec<(Counter, u64)> {
        Counter::ALL
            .iter()
            .map(|c| (*c, self.get(*c)))
            .filter(|(_, v)| *v != 0)
            .collect()
    }
}

impl Counters for Statistics {
    fn increment(&self, counter: Counter) {
        self.counts[counter.index()].fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Display for Statistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (c, v) in self.snapshot() {
            writeln!(f, "{:<16} {}", c.name(), v)?;
        }
        Ok(())
    }
}
