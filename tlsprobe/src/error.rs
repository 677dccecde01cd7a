use std::fmt;
use std::io;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure kinds of the tool, from startup rejection down to per-record
/// protocol errors.
#[derive(Debug)]
pub enum Error {
    /// Unknown or invalid configuration option. Fatal at startup.
    Configuration(String),
    /// TCP-level failure (connect, listen, read, write, close).
    Network(String),
    /// Handshake step failure or malformed protocol data.
    Tls(String),
    /// The peer answered with a fatal alert.
    FatalAlertReceived,
    /// A record that cannot be parsed at all.
    InvalidRecord,
    /// close_notify or EOF observed mid-stream.
    PeerClosed,
    /// A bounded wait ran out. Logged, never fatal by itself.
    Timeout(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(message) => write!(f, "{}", message),
            Error::Network(message) => write!(f, "{}", message),
            Error::Tls(message) => write!(f, "{}", message),
            Error::FatalAlertReceived => write!(f, "fatal alert message received"),
            Error::InvalidRecord => write!(f, "invalid TLS record received"),
            Error::PeerClosed => write!(f, "connection was closed gracefully"),
            Error::Timeout(what) => write!(f, "timeout while waiting for {}", what),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Network(err.to_string())
    }
}
