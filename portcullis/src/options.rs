//! Helpers for parsing command-line options.
use crate::error::Error;
use getopts::{Matches, Options};
use std::str::FromStr;

/// Prints a usage message for a set of CLI options.
pub(crate) fn print_usage(options: &Options, brief: &str) {
    let out = options.usage_with_format(|opts| {
        format!(
            "{}\n\nOptions:\n\n{}",
            brief,
            opts.collect::<Vec<String>>().join("\n")
        )
    });

    println!("{}", out);
}

/// Parses the value of the option `name`, if it's given.
///
/// `what` describes the value in the error produced for invalid input.
pub(crate) fn parse_option<T: FromStr>(
    matches: &Matches,
    name: &str,
    what: &str,
) -> Result<Option<T>, Error> {
    let Some(value) = matches.opt_str(name) else { return Ok(None) };

    value.parse().map(Some).map_err(|_| {
        Error::generic(format!("The {} '{}' is invalid", what, value))
    })
}
