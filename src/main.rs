#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};

use samba_loader::linux::LinuxMonitor;
use samba_loader::{
    format_dump, parse_hex, parse_size, CodeLoader, CommandLoop, ConnectionMonitor, LoadMethod,
    MemoryAccess, Options, Statistics, DEFAULT_BAUD,
};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyACM0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    /// Print operation counters on exit
    #[structopt(long)]
    stats: bool,

    #[structopt(subcommand)]
    command: Command,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Command {
    /// Load an applet image and run it
    Run {
        /// Binary image to load
        #[structopt(long, default_value = "./applets/mk/firmware.bin")]
        filename: PathBuf,

        /// Load and entry address (hex)
        #[structopt(long, default_value = "308000", parse(try_from_str = parse_hex))]
        address: u32,

        /// Transfer with block writes instead of word writes
        #[structopt(long)]
        block: bool,
    },

    /// Dump target memory
    Dump {
        /// Start address (hex)
        #[structopt(long, default_value = "308000", parse(try_from_str = parse_hex))]
        address: u32,

        /// Number of bytes, a multiple of 4
        #[structopt(long, default_value = "256", parse(try_from_str = parse_size))]
        size: usize,
    },

    /// Read a word
    Read {
        #[structopt(long, parse(try_from_str = parse_hex))]
        address: u32,
    },

    /// Write a word
    Write {
        #[structopt(long, parse(try_from_str = parse_hex))]
        address: u32,

        #[structopt(long, parse(try_from_str = parse_hex))]
        value: u32,
    },

    /// Send a ping frame to a running applet
    Ping,

    /// Tell a running applet to return to the monitor
    Exit,
}

impl Command {
    fn is_applet(&self) -> bool {
        matches!(self, Command::Ping | Command::Exit)
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    if o.baud != DEFAULT_BAUD {
        warn!("Using non-default baud rate {}", o.baud);
    }

    info!("Use device {}", o.port);

    let stats = Arc::new(Statistics::new());
    let monitor = Arc::new(ConnectionMonitor::linux(
        &o.port,
        o.baud,
        o.options.clone(),
        stats.clone(),
    )?);

    // A running applet does not speak the monitor language, keep probes off the line
    if o.command.is_applet() {
        monitor.set_polling_enabled(false);
    }

    let task = monitor.spawn().context("starting monitor task")?;

    let r = execute(&o, &monitor);

    monitor.cancel();
    let _ = task.join();

    if o.stats {
        print!("{}", stats);
    }

    r
}

fn execute(o: &Args, monitor: &Arc<LinuxMonitor>) -> anyhow::Result<()> {
    if !o.command.is_applet() {
        info!("Connecting to SAM-BA monitor");

        if !monitor.wait_until_connected(o.options.connect_timeout_ms) {
            bail!("monitor on {} is not responding", o.port);
        }
    }

    match &o.command {
        Command::Run {
            filename,
            address,
            block,
        } => {
            let image = std::fs::read(filename)
                .with_context(|| format!("reading {}", filename.display()))?;

            info!(
                "Loading {} ({}) to 0x{:08X}",
                filename.display(),
                bytefmt::format(image.len() as u64),
                address
            );

            let bar = ProgressBar::new(image.len() as u64);
            bar.set_style(ProgressStyle::default_bar().template("{bar:40} {bytes}/{total_bytes}"));
            let b = bar.clone();

            let method = if *block { LoadMethod::Block } else { LoadMethod::Words };
            let output = CodeLoader::new(monitor.clone())
                .with_method(method)
                .with_progress(move |n, _| b.set_position(n as u64))
                .load_and_run(*address, &image, o.options.settle_timeout_ms)?;

            bar.finish();

            if !output.is_empty() {
                println!("{}", String::from_utf8_lossy(&output));
            }
        }
        Command::Dump { address, size } => {
            let data = MemoryAccess::new(monitor.clone()).dump(*address, *size)?;
            for line in format_dump(*address, &data) {
                println!("{}", line);
            }
        }
        Command::Read { address } => {
            let v = MemoryAccess::new(monitor.clone()).read(*address)?;
            println!("{:08X}: {}", address, hex::encode_upper(v.to_be_bytes()));
        }
        Command::Write { address, value } => {
            MemoryAccess::new(monitor.clone()).write(*address, *value)?;
        }
        Command::Ping => CommandLoop::new(monitor.clone()).ping()?,
        Command::Exit => CommandLoop::new(monitor.clone()).exit()?,
    }

    Ok(())
}
