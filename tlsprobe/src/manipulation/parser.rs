//! Parsing of `manipulate*` configuration keys.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::{Error, Result};
use crate::manipulation::Manipulation;
use crate::tls::TlsVersion;

static HEX_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\((0x[0-9a-fA-F]{2}),(0x[0-9a-fA-F]{2})\)$").expect("regex"));
static HEX_TRIPLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(0x[0-9a-fA-F]{2}),(0x[0-9a-fA-F]{2}),(0x[0-9a-fA-F]{2})$").expect("regex")
});
static BOOL_QUADRUPLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(true|false),(true|false),(true|false),(true|false)$").expect("regex"));

fn parse_bool(value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(Error::Configuration(format!(
            "Invalid value \"{}\" for boolean conversion",
            other
        ))),
    }
}

fn parse_byte(name: &str, value: &str, byte_string: &str) -> Result<u8> {
    u8::from_str_radix(byte_string.trim_start_matches("0x"), 16).map_err(|_| {
        Error::Configuration(format!(
            "Invalid byte \"{}\" in value \"{}\" for {}",
            byte_string, value, name
        ))
    })
}

/// Parse one `manipulate*` key=value pair into a manipulation.
pub fn parse(name: &str, value: &str) -> Result<Manipulation> {
    match name {
        "manipulateSkipChangeCipherSpec" => Ok(Manipulation::SkipChangeCipherSpec),
        "manipulateSkipFinished" => Ok(Manipulation::SkipFinished),
        "manipulatePreMasterSecretRandom" => Ok(Manipulation::PreMasterSecretRandom),
        "manipulatePreMasterSecretRandomByte" => {
            let index: u16 = value.parse().map_err(|_| {
                Error::Configuration(format!("Invalid index \"{}\" for {}", value, name))
            })?;
            if index >= 46 {
                return Err(Error::Configuration(format!(
                    "Invalid index \"{}\" for {}",
                    value, name
                )));
            }
            Ok(Manipulation::PreMasterSecretRandomByte { index })
        }
        "manipulateRsaesPkcs1V15EncryptPadding" => {
            let captures = HEX_TRIPLE.captures(value).ok_or_else(|| {
                Error::Configuration(format!("Invalid value \"{}\" for {}", value, name))
            })?;
            Ok(Manipulation::RsaesPkcs1V15EncryptPadding {
                first_byte: parse_byte(name, value, &captures[1])?,
                block_type: parse_byte(name, value, &captures[2])?,
                padding: parse_byte(name, value, &captures[3])?,
                active: false,
            })
        }
        "manipulatePreMasterSecretVersion" => {
            let captures = HEX_PAIR.captures(value).ok_or_else(|| {
                Error::Configuration(format!("Invalid value \"{}\" for {}", value, name))
            })?;
            Ok(Manipulation::PreMasterSecretVersion {
                version: TlsVersion::new(
                    parse_byte(name, value, &captures[1])?,
                    parse_byte(name, value, &captures[2])?,
                ),
            })
        }
        "manipulateSkipRsaesPkcs1V15PaddingCheck" => {
            let captures = BOOL_QUADRUPLE.captures(value).ok_or_else(|| {
                Error::Configuration(format!("Invalid value \"{}\" for {}", value, name))
            })?;
            Ok(Manipulation::SkipRsaesPkcs1V15PaddingCheck {
                first_byte: parse_bool(&captures[1])?,
                block_type: parse_bool(&captures[2])?,
                delimiter: parse_bool(&captures[3])?,
                pms_version: parse_bool(&captures[4])?,
                active: false,
            })
        }
        other => Err(Error::Configuration(format!(
            "Unknown manipulation {}",
            other
        ))),
    }
}
