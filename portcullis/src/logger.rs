//! A logger that writes to STDERR.
use crate::error::Error;
use log::{info, warn, LevelFilter, Log, Metadata, Record};
use std::env;
use std::io::{stderr, Write};

/// The environment variable to read the log level from.
const LEVEL_VARIABLE: &str = "PORTCULLIS_LOG";

struct Logger;

static LOGGER: Logger = Logger;

impl Log for Logger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // There's nowhere left to report a failure to write to STDERR.
        let _ = writeln!(
            stderr().lock(),
            "{:<5} {}: {}",
            record.level(),
            record.target(),
            record.args()
        );
    }

    fn flush(&self) {
        let _ = stderr().flush();
    }
}

fn parse_level(value: Option<&str>) -> Result<LevelFilter, String> {
    match value {
        Some(name) => name
            .parse()
            .map_err(|_| format!("The log level '{}' is invalid", name)),
        None => Ok(LevelFilter::Info),
    }
}

fn level_from_env() -> Result<LevelFilter, String> {
    parse_level(env::var(LEVEL_VARIABLE).ok().as_deref())
}

/// Installs the logger, using the level from the environment.
pub(crate) fn init() -> Result<(), Error> {
    let level = level_from_env()?;

    log::set_logger(&LOGGER).map_err(|err| Error::generic(err.to_string()))?;
    log::set_max_level(level);
    Ok(())
}

/// Reads the log level from the environment again.
pub(crate) fn reload() {
    match level_from_env() {
        Ok(level) => {
            log::set_max_level(level);
            info!("the log level is now {}", level);
        }
        Err(message) => warn!("{}, keeping the current level", message),
    }
}
