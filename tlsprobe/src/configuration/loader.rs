//! Command-line surface: `key=value` arguments plus `configFile=<path>`
//! references resolved through the generic file parser.

use std::fs::File;

use clap::{crate_version, Arg, Command};
use tlsprobe_tooling::configuration::{self, KeyValuePair};

use crate::configuration::{parser, Configuration};
use crate::error::{Error, Result};

fn command() -> Command<'static> {
    Command::new("tlsprobe")
        .version(crate_version!())
        .about("Scriptable TLS conformance and negative-testing endpoint")
        .arg(
            Arg::new("arguments")
                .value_name("KEY=VALUE")
                .help("Configuration options; configFile=<path> loads more from a file")
                .multiple_values(true),
        )
}

fn collect_pairs<I: IntoIterator<Item = String>>(arguments: I) -> Result<Vec<KeyValuePair>> {
    let mut pairs = Vec::new();
    for argument in arguments {
        let (key, value) = configuration::parse_argument(&argument);
        if key == "configFile" {
            let file = File::open(&value).map_err(|e| {
                Error::Configuration(format!("Opening configuration file {} failed: {}", value, e))
            })?;
            let mut file_pairs =
                configuration::parse_key_value_lines(file).map_err(Error::Configuration)?;
            pairs.append(&mut file_pairs);
        } else {
            pairs.push((key, value));
        }
    }
    Ok(pairs)
}

/// Parse the process arguments into a configuration.
pub fn parse<I: IntoIterator<Item = String>>(arguments: I) -> Result<Configuration> {
    let matches = command()
        .try_get_matches_from(arguments)
        .map_err(|e| Error::Configuration(e.to_string()))?;
    let raw: Vec<String> = matches
        .values_of("arguments")
        .map(|values| values.map(str::to_string).collect())
        .unwrap_or_default();
    let pairs = collect_pairs(raw)?;
    let mut configuration = Configuration::default();
    parser::update_configuration(&mut configuration, &pairs)?;
    Ok(configuration)
}
