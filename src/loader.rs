//! Applet loading.
//!
//! Copies an image into target memory through the monitor and starts it
//! with a `G` command.

use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;

use crate::memory::{execute, send_block, write_word};
use crate::monitor::ConnectionMonitor;
use crate::protocol::{MAX_BLOCK, WORD_SIZE};
use crate::stats::Counter;
use crate::transport::{SerialPort, Transport};
use crate::Error;

/// How the image is transferred to the target
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum LoadMethod {
    /// One `W` command per word. A trailing partial word is dropped.
    Words,
    /// `S` commands of up to [`MAX_BLOCK`] bytes, the whole image is sent
    Block,
}

impl Default for LoadMethod {
    fn default() -> Self {
        LoadMethod::Words
    }
}

type Progress = Box<dyn FnMut(usize, usize) + Send>;

pub struct CodeLoader<P, D, E> {
    monitor: Arc<ConnectionMonitor<P, D, E>>,
    method: LoadMethod,
    progress: Option<Progress>,
}

impl<P, D, E> CodeLoader<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(monitor: Arc<ConnectionMonitor<P, D, E>>) -> Self {
        Self {
            monitor,
            method: LoadMethod::default(),
            progress: None,
        }
    }

    pub fn with_method(mut self, method: LoadMethod) -> Self {
        self.method = method;
        self
    }

    /// Report `(bytes_written, total)` as the image is transferred
    pub fn with_progress(mut self, f: impl FnMut(usize, usize) + Send + 'static) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    /// Copy `image` to `address`, then execute it.
    ///
    /// Polling is suspended for the duration. With a non-zero
    /// `settle_timeout_ms` the output of the applet is collected until it has
    /// been quiet for that long, polling is re-enabled and the output
    /// returned. With a zero timeout polling is left suspended for the caller
    /// to re-enable once it is done with the applet.
    ///
    /// With [`LoadMethod::Words`] the image is sent as whole little-endian
    /// words, `image.len() % 4` trailing bytes are not transmitted.
    pub fn load_and_run(
        &mut self,
        address: u32,
        image: &[u8],
        settle_timeout_ms: u32,
    ) -> Result<Vec<u8>, Error<E>> {
        let counters = self.monitor.counters().clone();
        counters.increment(Counter::Load);

        self.monitor.set_polling_enabled(false);

        let method = self.method;
        let progress = &mut self.progress;

        let r = self.monitor.with_transport(|t| {
            let written = match method {
                LoadMethod::Words => load_words(t, address, image, progress),
                LoadMethod::Block => load_blocks(t, address, image, progress),
            };

            if let Err((written, cause)) = written {
                return Err(Error::LoadIncomplete {
                    written,
                    cause: Box::new(cause),
                });
            }

            execute(t, address)?;

            if settle_timeout_ms > 0 {
                t.wait_for_output(settle_timeout_ms)
            } else {
                Ok(Vec::new())
            }
        });

        if r.is_err() {
            counters.increment(Counter::LoadFail);
        }

        if r.is_err() || settle_timeout_ms > 0 {
            self.monitor.set_polling_enabled(true);
        }

        r
    }

    /// Collect device output until it has been quiet for `timeout_ms`
    pub fn wait_for_output(&self, timeout_ms: u32) -> Result<Vec<u8>, Error<E>> {
        self.monitor.with_transport(|t| t.wait_for_output(timeout_ms))
    }
}

fn load_words<P, D, E>(
    t: &mut Transport<P, D, E>,
    address: u32,
    image: &[u8],
    progress: &mut Option<Progress>,
) -> Result<usize, (usize, Error<E>)>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    let words = image.chunks_exact(WORD_SIZE);
    let dropped = words.remainder().len();
    if dropped != 0 {
        warn!(
            "Image length {} is not a multiple of {}, dropping {} trailing bytes",
            image.len(),
            WORD_SIZE,
            dropped
        );
    }

    let total = image.len() - dropped;
    let mut written = 0;

    for w in words {
        let value = u32::from_le_bytes([w[0], w[1], w[2], w[3]]);
        let a = address.wrapping_add(written as u32);

        write_word(t, a, value).map_err(|e| (written, e))?;

        written += WORD_SIZE;
        if let Some(f) = progress {
            f(written, total);
        }
    }

    Ok(written)
}

fn load_blocks<P, D, E>(
    t: &mut Transport<P, D, E>,
    address: u32,
    image: &[u8],
    progress: &mut Option<Progress>,
) -> Result<usize, (usize, Error<E>)>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    let mut written = 0;

    for chunk in image.chunks(MAX_BLOCK) {
        send_block(t, address.wrapping_add(written as u32), chunk).map_err(|e| (written, e))?;

        written += chunk.len();
        if let Some(f) = progress {
            f(written, image.len());
        }
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockDelay, MockPort};
    use crate::stats::Statistics;
    use crate::Options;
    use std::io::ErrorKind;
    use std::sync::Mutex;

    type Monitor = ConnectionMonitor<MockPort, MockDelay, ErrorKind>;

    fn monitor(port: &MockPort) -> (Arc<Monitor>, Arc<Statistics>) {
        let stats = Arc::new(Statistics::new());
        let mut t = Transport::new(port.clone(), port.delay(), Options::default(), stats.clone());
        t.open().unwrap();
        (Arc::new(ConnectionMonitor::new(t, stats.clone())), stats)
    }

    #[test]
    fn image_is_split_into_words_and_executed() {
        let port = MockPort::new();
        let (m, stats) = monitor(&port);
        let image: Vec<u8> = (1u8..=10).collect();

        let out = CodeLoader::new(m.clone())
            .load_and_run(0x308000, &image, 0)
            .unwrap();

        assert!(out.is_empty());
        assert_eq!(
            port.commands(),
            vec!["W308000,4030201", "W308004,8070605", "G308000"]
        );
        assert_eq!(port.peek(0x308000, 8), image[..8].to_vec());
        assert_eq!(port.peek(0x308008, 2), vec![0, 0]);
        assert_eq!(port.executed(), vec![0x308000]);
        assert_eq!(stats.get(Counter::Execute), 1);
        assert_eq!(stats.get(Counter::WriteWord), 2);
    }

    #[test]
    fn zero_settle_leaves_polling_suspended() {
        let port = MockPort::new();
        let (m, _) = monitor(&port);

        CodeLoader::new(m.clone())
            .load_and_run(0x308000, &[0; 8], 0)
            .unwrap();

        assert!(!m.is_polling_enabled());
        m.set_polling_enabled(true);
        assert!(m.is_polling_enabled());
    }

    #[test]
    fn settle_collects_output_and_resumes_polling() {
        let port = MockPort::new();
        port.schedule_rx(20, b"DDR OK\r\n");
        let (m, _) = monitor(&port);

        let out = CodeLoader::new(m.clone())
            .load_and_run(0x308000, &[0; 4], 100)
            .unwrap();

        assert_eq!(out, b"DDR OK\r\n".to_vec());
        assert!(m.is_polling_enabled());
    }

    #[test]
    fn block_method_sends_whole_image() {
        let port = MockPort::new();
        let (m, stats) = monitor(&port);
        let image: Vec<u8> = (0..130).map(|i| i as u8).collect();

        CodeLoader::new(m.clone())
            .with_method(LoadMethod::Block)
            .load_and_run(0x300000, &image, 0)
            .unwrap();

        assert_eq!(port.commands(), vec!["S300000,80", "S300080,2", "G300000"]);
        assert_eq!(port.peek(0x300000, 130), image);
        assert_eq!(stats.get(Counter::SendBlock), 2);
    }

    #[test]
    fn progress_reports_each_word() {
        let port = MockPort::new();
        let (m, _) = monitor(&port);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();

        CodeLoader::new(m.clone())
            .with_progress(move |n, total| s.lock().unwrap().push((n, total)))
            .load_and_run(0x0, &[0; 13], 0)
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![(4, 12), (8, 12), (12, 12)]);
    }

    #[test]
    fn failed_write_aborts_load_without_executing() {
        let port = MockPort::new();
        let (m, stats) = monitor(&port);
        m.with_transport(|t| t.close()).unwrap();

        let r = CodeLoader::new(m.clone()).load_and_run(0x308000, &[0; 8], 0);

        assert_eq!(
            r,
            Err(Error::LoadIncomplete {
                written: 0,
                cause: Box::new(Error::NotOpen)
            })
        );
        assert!(port.executed().is_empty());
        assert_eq!(stats.get(Counter::LoadFail), 1);
        assert!(m.is_polling_enabled());
    }
}
