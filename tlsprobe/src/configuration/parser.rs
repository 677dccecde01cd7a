//! Dispatch of key=value pairs into the configuration model.

use once_cell::sync::Lazy;
use regex::Regex;
use tlsprobe_tooling::configuration::KeyValuePair;
use tlsprobe_tooling::logging::LogLevel;

use crate::configuration::{Configuration, NetworkMode};
use crate::error::{Error, Result};
use crate::manipulation;
use crate::tls::{CipherSuite, TlsVersion};

const MANIPULATE_PREFIX: &str = "manipulate";

static NUMBER_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\(([0-9]+),([0-9]+)\)$").expect("regex"));
static HEX_PAIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\((0x[0-9a-fA-F]{2}),(0x[0-9a-fA-F]{2})\)").expect("regex"));

fn invalid(name: &str, value: &str) -> Error {
    Error::Configuration(format!("Invalid value for {} {}", name, value))
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| invalid(name, value))
}

/// Apply `key=value` pairs onto a configuration. Unknown keys and malformed
/// values reject the whole configuration.
pub fn update_configuration(
    configuration: &mut Configuration,
    pairs: &[KeyValuePair],
) -> Result<()> {
    let mut simulation_delay_required = false;
    let mut simulation_delay_set = false;
    for (name, value) in pairs {
        match name.as_str() {
            "mode" => {
                configuration.mode = match value.as_str() {
                    "client" => NetworkMode::Client,
                    "server" => NetworkMode::Server,
                    other => {
                        return Err(Error::Configuration(format!("Unknown mode {}", other)))
                    }
                };
            }
            "host" => configuration.host = value.clone(),
            "port" => configuration.port = parse_number(name, value)?,
            "listenTimeout" => configuration.listen_timeout_seconds = parse_number(name, value)?,
            "waitBeforeClose" => {
                configuration.wait_before_close_seconds = parse_number(name, value)?
            }
            "receiveTimeout" => {
                configuration.tcp_receive_timeout_seconds = parse_number(name, value)?
            }
            "logLevel" => {
                configuration.log_level = match value.as_str() {
                    "off" => LogLevel::Off,
                    "low" => LogLevel::Low,
                    "medium" => LogLevel::Medium,
                    "high" => LogLevel::High,
                    _ => return Err(invalid(name, value)),
                };
            }
            "certificateFile" => configuration.certificate_file = value.clone(),
            "privateKeyFile" => configuration.private_key_file = value.clone(),
            "tlsVersion" => {
                let captures = NUMBER_PAIR.captures(value).ok_or_else(|| invalid(name, value))?;
                let major: u8 = parse_number(name, &captures[1])?;
                let minor: u8 = parse_number(name, &captures[2])?;
                if major != 3 {
                    return Err(Error::Configuration(format!(
                        "Invalid major version for {} {}",
                        name, value
                    )));
                }
                if minor == 0 || minor > 3 {
                    return Err(Error::Configuration(format!(
                        "Invalid minor version for {} {}",
                        name, value
                    )));
                }
                configuration.tls_version = TlsVersion::new(major, minor);
            }
            "tlsCipherSuites" => {
                let mut suites = Vec::new();
                for captures in HEX_PAIR.captures_iter(value) {
                    let upper = u8::from_str_radix(captures[1].trim_start_matches("0x"), 16)
                        .map_err(|_| invalid(name, value))?;
                    let lower = u8::from_str_radix(captures[2].trim_start_matches("0x"), 16)
                        .map_err(|_| invalid(name, value))?;
                    suites.push(CipherSuite(upper, lower));
                }
                if suites.is_empty() {
                    return Err(invalid(name, value));
                }
                configuration.tls_cipher_suites = suites;
            }
            "tlsSecretFile" => configuration.tls_secret_file = value.clone(),
            "tlsServerSimulation" => {
                let id: u16 = parse_number(name, value)?;
                if id > 6 {
                    return Err(invalid(name, value));
                }
                if id == 6 {
                    simulation_delay_required = true;
                }
                configuration.tls_server_simulation = id;
            }
            "tlsServerSimulationDelay" => {
                let delay: u32 = parse_number(name, value)?;
                if delay > 1_000_000 {
                    return Err(invalid(name, value));
                }
                configuration.tls_server_simulation_delay = Some(delay);
                simulation_delay_set = true;
            }
            other if other.starts_with(MANIPULATE_PREFIX) => {
                configuration
                    .manipulations
                    .push(manipulation::parser::parse(name, value)?);
            }
            other => {
                return Err(Error::Configuration(format!("Unknown argument {}", other)))
            }
        }
    }
    if simulation_delay_required && !simulation_delay_set {
        return Err(Error::Configuration(
            "The value of 'tlsServerSimulationDelay' needs to be set for tlsServerSimulation mode 6"
                .to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_pairs(pairs: &[(&str, &str)]) -> Result<Configuration> {
        let owned: Vec<KeyValuePair> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut configuration = Configuration::default();
        update_configuration(&mut configuration, &owned)?;
        Ok(configuration)
    }

    #[test]
    fn full_client_configuration_parses() {
        let configuration = parse_pairs(&[
            ("mode", "client"),
            ("host", "192.0.2.1"),
            ("port", "4433"),
            ("tlsVersion", "(3,3)"),
            ("tlsCipherSuites", "(0xc0,0x2f),(0x00,0x2f)"),
            ("tlsSecretFile", "/tmp/keys.log"),
            ("waitBeforeClose", "2"),
        ])
        .unwrap();
        assert_eq!(configuration.mode, NetworkMode::Client);
        assert_eq!(configuration.port, 4433);
        assert_eq!(configuration.tls_version, TlsVersion::TLS1_2);
        assert_eq!(
            configuration.tls_cipher_suites,
            vec![CipherSuite(0xc0, 0x2f), CipherSuite(0x00, 0x2f)]
        );
        assert_eq!(configuration.wait_before_close_seconds, 2);
    }

    #[test]
    fn unknown_argument_is_rejected() {
        assert!(parse_pairs(&[("definitelyNotAKey", "1")]).is_err());
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(parse_pairs(&[("mode", "spectator")]).is_err());
    }

    #[test]
    fn tls_version_bounds() {
        assert!(parse_pairs(&[("tlsVersion", "(3,0)")]).is_err());
        assert!(parse_pairs(&[("tlsVersion", "(3,4)")]).is_err());
        assert!(parse_pairs(&[("tlsVersion", "(2,1)")]).is_err());
        assert!(parse_pairs(&[("tlsVersion", "3,1")]).is_err());
        assert!(parse_pairs(&[("tlsVersion", "(3,1)")]).is_ok());
    }

    #[test]
    fn cipher_suite_list_requires_at_least_one_pair() {
        assert!(parse_pairs(&[("tlsCipherSuites", "junk")]).is_err());
        let configuration = parse_pairs(&[("tlsCipherSuites", "(0x00,0x3c)")]).unwrap();
        assert_eq!(configuration.tls_cipher_suites, vec![CipherSuite(0x00, 0x3c)]);
    }

    #[test]
    fn simulation_six_requires_a_delay() {
        assert!(parse_pairs(&[("tlsServerSimulation", "6")]).is_err());
        assert!(parse_pairs(&[("tlsServerSimulation", "7")]).is_err());
        assert!(parse_pairs(&[
            ("tlsServerSimulation", "6"),
            ("tlsServerSimulationDelay", "500")
        ])
        .is_ok());
        assert!(parse_pairs(&[
            ("tlsServerSimulation", "6"),
            ("tlsServerSimulationDelay", "1000001")
        ])
        .is_err());
    }

    #[test]
    fn manipulations_accumulate_in_order() {
        let configuration = parse_pairs(&[
            ("manipulateSkipChangeCipherSpec", ""),
            ("manipulatePreMasterSecretRandomByte", "0"),
        ])
        .unwrap();
        assert_eq!(configuration.manipulations.len(), 2);
    }

    #[test]
    fn canonical_form_round_trips() {
        let original = parse_pairs(&[
            ("mode", "server"),
            ("port", "443"),
            ("listenTimeout", "1"),
            ("tlsVersion", "(3,2)"),
            ("tlsCipherSuites", "(0x00,0x35)"),
            ("manipulateSkipRsaesPkcs1V15PaddingCheck", "true,true,true,true"),
        ])
        .unwrap();
        let mut reparsed = Configuration::default();
        update_configuration(&mut reparsed, &original.to_key_values()).unwrap();
        assert_eq!(reparsed.mode, original.mode);
        assert_eq!(reparsed.port, original.port);
        assert_eq!(reparsed.listen_timeout_seconds, original.listen_timeout_seconds);
        assert_eq!(reparsed.tls_version, original.tls_version);
        assert_eq!(reparsed.tls_cipher_suites, original.tls_cipher_suites);
        assert_eq!(reparsed.manipulations, original.manipulations);
        // And the canonical form itself is a fixed point.
        assert_eq!(reparsed.to_key_values(), original.to_key_values());
    }
}
