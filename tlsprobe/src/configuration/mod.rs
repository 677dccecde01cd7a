//! Configuration model of the tool.

pub mod loader;
pub mod parser;

use itertools::Itertools;
use tlsprobe_tooling::logging::LogLevel;

use crate::manipulation::Manipulation;
use crate::tls::{CipherSuite, TlsVersion};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkMode {
    Client,
    Server,
    Unknown,
}

/// Parsed configuration. All timeouts are seconds.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub mode: NetworkMode,
    pub host: String,
    pub port: u16,
    pub listen_timeout_seconds: u64,
    pub wait_before_close_seconds: u64,
    pub tcp_receive_timeout_seconds: u64,
    pub log_level: LogLevel,
    pub certificate_file: String,
    pub private_key_file: String,
    pub tls_version: TlsVersion,
    pub tls_cipher_suites: Vec<CipherSuite>,
    pub tls_secret_file: String,
    pub tls_server_simulation: u16,
    pub tls_server_simulation_delay: Option<u32>,
    pub manipulations: Vec<Manipulation>,
}

impl Default for Configuration {
    fn default() -> Configuration {
        Configuration {
            mode: NetworkMode::Unknown,
            host: String::new(),
            port: 0,
            listen_timeout_seconds: 0,
            wait_before_close_seconds: 10,
            tcp_receive_timeout_seconds: 120,
            log_level: LogLevel::Low,
            certificate_file: String::new(),
            private_key_file: String::new(),
            tls_version: TlsVersion::UNSET,
            tls_cipher_suites: Vec::new(),
            tls_secret_file: String::new(),
            tls_server_simulation: 0,
            tls_server_simulation_delay: None,
            manipulations: Vec::new(),
        }
    }
}

impl Configuration {
    pub fn has_tls_version(&self) -> bool {
        self.tls_version.is_set()
    }

    pub fn has_tls_cipher_suites(&self) -> bool {
        !self.tls_cipher_suites.is_empty()
    }

    /// Canonical key=value form; feeding it back through the parser yields
    /// an equal configuration.
    pub fn to_key_values(&self) -> Vec<(String, String)> {
        let mut pairs = Vec::new();
        match self.mode {
            NetworkMode::Client => pairs.push(("mode".to_string(), "client".to_string())),
            NetworkMode::Server => pairs.push(("mode".to_string(), "server".to_string())),
            NetworkMode::Unknown => {}
        }
        if !self.host.is_empty() {
            pairs.push(("host".to_string(), self.host.clone()));
        }
        pairs.push(("port".to_string(), self.port.to_string()));
        pairs.push(("listenTimeout".to_string(), self.listen_timeout_seconds.to_string()));
        pairs.push((
            "waitBeforeClose".to_string(),
            self.wait_before_close_seconds.to_string(),
        ));
        pairs.push((
            "receiveTimeout".to_string(),
            self.tcp_receive_timeout_seconds.to_string(),
        ));
        let level = match self.log_level {
            LogLevel::Off => "off",
            LogLevel::Low => "low",
            LogLevel::Medium => "medium",
            LogLevel::High => "high",
        };
        pairs.push(("logLevel".to_string(), level.to_string()));
        if !self.certificate_file.is_empty() {
            pairs.push(("certificateFile".to_string(), self.certificate_file.clone()));
        }
        if !self.private_key_file.is_empty() {
            pairs.push(("privateKeyFile".to_string(), self.private_key_file.clone()));
        }
        if self.has_tls_version() {
            pairs.push((
                "tlsVersion".to_string(),
                format!("({},{})", self.tls_version.major, self.tls_version.minor),
            ));
        }
        if self.has_tls_cipher_suites() {
            let suites = self
                .tls_cipher_suites
                .iter()
                .map(|suite| format!("(0x{:02x},0x{:02x})", suite.0, suite.1))
                .join(",");
            pairs.push(("tlsCipherSuites".to_string(), suites));
        }
        if !self.tls_secret_file.is_empty() {
            pairs.push(("tlsSecretFile".to_string(), self.tls_secret_file.clone()));
        }
        if self.tls_server_simulation != 0 {
            pairs.push((
                "tlsServerSimulation".to_string(),
                self.tls_server_simulation.to_string(),
            ));
        }
        if let Some(delay) = self.tls_server_simulation_delay {
            pairs.push(("tlsServerSimulationDelay".to_string(), delay.to_string()));
        }
        for manipulation in &self.manipulations {
            pairs.push(manipulation.to_key_value());
        }
        pairs
    }
}
