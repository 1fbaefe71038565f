use crate::echo::Server;
use crate::error::Error;
use crate::logger;
use crate::options::{parse_option, print_usage};
use getopts::Options;
use portcullis::{Config, Reactor};
use std::env;
use std::net::SocketAddr;
use std::time::Duration;

const USAGE: &str = "Usage: portcullis [OPTIONS]

Run a TCP server that sends back everything its clients send, until it receives
SIGINT or SIGTERM. Sending SIGHUP reloads the log level from PORTCULLIS_LOG.

The coroutine stack size and the number of events read per poll default to the
values of PORTCULLIS_STACK_SIZE and PORTCULLIS_POLL_EVENTS.

Examples:

    portcullis                         # Listen on 127.0.0.1:7000
    portcullis --listen [::1]:8000     # Listen on port 8000 of ::1
    portcullis --timeout 30            # Disconnect clients idle for 30 seconds
    PORTCULLIS_LOG=debug portcullis    # Also log debug messages";

/// The address to listen on if none is given.
const DEFAULT_ADDRESS: ([u8; 4], u16) = ([127, 0, 0, 1], 7000);

pub(crate) fn run() -> Result<i32, Error> {
    let args: Vec<String> = env::args().collect();
    let mut options = Options::new();

    options.optflag("h", "help", "Show this help message");
    options.optflag("v", "version", "Print the version number");
    options.optopt("l", "listen", "The address to listen on", "ADDR");
    options.optopt(
        "s",
        "stack-size",
        "The size of each coroutine's stack",
        "BYTES",
    );
    options.optopt(
        "t",
        "timeout",
        "Disconnect clients that are idle for this long",
        "SECONDS",
    );

    let matches = options.parse(&args[1..])?;

    if matches.opt_present("h") {
        print_usage(&options, USAGE);
        return Ok(0);
    }

    if matches.opt_present("v") {
        println!("portcullis {}", env!("CARGO_PKG_VERSION"));
        return Ok(0);
    }

    if let Some(arg) = matches.free.first() {
        return Err(Error::generic(format!(
            "The argument '{}' is invalid",
            arg
        )));
    }

    logger::init()?;

    let mut config = Config::from_env();

    if let Some(size) = parse_option(&matches, "s", "stack size")? {
        config.stack_size = size;
    }

    let address = parse_option(&matches, "l", "address")?
        .unwrap_or_else(|| SocketAddr::from(DEFAULT_ADDRESS));
    let timeout = parse_option::<u64>(&matches, "t", "timeout")?
        .map(Duration::from_secs);
    let reactor = Reactor::with_config(config)?;

    Server { address, timeout }.run(&reactor)?;
    Ok(0)
}
