use anyhow::{bail, Context, Result};
use bmsmon_lib::protocol::DecodeOutcome;
use clap::Parser;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic};

mod commandline;
mod monitor;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut bms = bmsmon_lib::serialport::BmsReader::new(&args.device)
        .with_context(|| format!("Cannot open serial port '{}'", args.device))?;

    match args.command {
        CliCommands::Read { format } => match bms.read(args.timeout) {
            DecodeOutcome::Snapshot(snapshot) => monitor::print_snapshot(&snapshot, &format)?,
            DecodeOutcome::Timeout => {
                bail!("No BMS data received within {:?}", args.timeout)
            }
            DecodeOutcome::ChecksumInvalid => {
                bail!("Received BMS data is corrupted, checksum mismatch")
            }
            DecodeOutcome::StreamError(err) => {
                return Err(err).with_context(|| "Cannot read from serial port")
            }
        },
        CliCommands::Monitor { interval, format } => {
            monitor::run(&mut bms, interval, args.timeout, &format)?
        }
    }

    Ok(())
}
