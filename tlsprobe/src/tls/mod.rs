//! TLS domain types, the step-wise backend, the handshake driver and the
//! backend-log filters.

pub mod backend;
pub mod log_filter;
pub mod session;

use std::fmt;

/// TLS protocol version as the `(major, minor)` pair found on the wire.
/// `(0, 0)` means "not set / not negotiated yet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TlsVersion {
    pub major: u8,
    pub minor: u8,
}

impl TlsVersion {
    pub const UNSET: TlsVersion = TlsVersion { major: 0, minor: 0 };
    pub const TLS1_0: TlsVersion = TlsVersion { major: 3, minor: 1 };
    pub const TLS1_1: TlsVersion = TlsVersion { major: 3, minor: 2 };
    pub const TLS1_2: TlsVersion = TlsVersion { major: 3, minor: 3 };

    pub const fn new(major: u8, minor: u8) -> TlsVersion {
        TlsVersion { major, minor }
    }

    pub fn is_set(&self) -> bool {
        *self != TlsVersion::UNSET
    }

    /// Human-readable protocol name, as printed in the trace.
    pub fn name(&self) -> &'static str {
        match *self {
            TlsVersion::TLS1_0 => "TLSv1.0",
            TlsVersion::TLS1_1 => "TLSv1.1",
            TlsVersion::TLS1_2 => "TLSv1.2",
            _ => "unknown",
        }
    }
}

impl fmt::Display for TlsVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.major, self.minor)
    }
}

/// Cipher suite identifier as the two bytes found on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CipherSuite(pub u8, pub u8);

impl CipherSuite {
    pub fn id(&self) -> u16 {
        ((self.0 as u16) << 8) | self.1 as u16
    }
}

impl fmt::Display for CipherSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(0x{:02x},0x{:02x})", self.0, self.1)
    }
}

/// Whether this endpoint plays the TLS client or the TLS server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// The handshake cursor. The order matches the wire progression of a full
/// handshake; manipulations may force non-adjacent jumps through
/// `set_state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HandshakeState {
    HelloRequest,
    ClientHello,
    ServerHello,
    ServerCertificate,
    ServerKeyExchange,
    CertificateRequest,
    ServerHelloDone,
    ClientCertificate,
    ClientKeyExchange,
    CertificateVerify,
    ClientChangeCipherSpec,
    ClientFinished,
    ServerChangeCipherSpec,
    ServerFinished,
    /// Flush of the final flight.
    Internal1,
    /// Handshake wrapup.
    Internal2,
    HandshakeDone,
}

impl HandshakeState {
    /// Role-sender table: true if `role` is the one transmitting the flight
    /// belonging to this state.
    pub fn is_sent_by(&self, role: Role) -> bool {
        use HandshakeState::*;
        match role {
            Role::Client => matches!(
                self,
                ClientHello
                    | ClientCertificate
                    | ClientKeyExchange
                    | CertificateVerify
                    | ClientChangeCipherSpec
                    | ClientFinished
            ),
            Role::Server => matches!(
                self,
                HelloRequest
                    | ServerHello
                    | ServerCertificate
                    | ServerKeyExchange
                    | CertificateRequest
                    | ServerHelloDone
                    | ServerChangeCipherSpec
                    | ServerFinished
            ),
        }
    }
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandshakeState::HelloRequest => "HelloRequest",
            HandshakeState::ClientHello => "ClientHello",
            HandshakeState::ServerHello => "ServerHello",
            HandshakeState::ServerCertificate => "ServerCertificate",
            HandshakeState::ServerKeyExchange => "ServerKeyExchange",
            HandshakeState::CertificateRequest => "CertificateRequest",
            HandshakeState::ServerHelloDone => "ServerHelloDone",
            HandshakeState::ClientCertificate => "ClientCertificate",
            HandshakeState::ClientKeyExchange => "ClientKeyExchange",
            HandshakeState::CertificateVerify => "CertificateVerify",
            HandshakeState::ClientChangeCipherSpec => "ClientChangeCipherSpec",
            HandshakeState::ClientFinished => "ClientFinished",
            HandshakeState::ServerChangeCipherSpec => "ServerChangeCipherSpec",
            HandshakeState::ServerFinished => "ServerFinished",
            HandshakeState::Internal1 => "FlushBuffers",
            HandshakeState::Internal2 => "HandshakeWrapup",
            HandshakeState::HandshakeDone => "HandshakeDone",
        };
        write!(f, "{}", name)
    }
}

/// TLS record content types.
pub mod content_type {
    pub const CHANGE_CIPHER_SPEC: u8 = 20;
    pub const ALERT: u8 = 21;
    pub const HANDSHAKE: u8 = 22;
    pub const APPLICATION_DATA: u8 = 23;
    pub const HEARTBEAT: u8 = 24;
}

/// Handshake message types.
pub mod handshake_type {
    pub const HELLO_REQUEST: u8 = 0;
    pub const CLIENT_HELLO: u8 = 1;
    pub const SERVER_HELLO: u8 = 2;
    pub const CERTIFICATE: u8 = 11;
    pub const SERVER_KEY_EXCHANGE: u8 = 12;
    pub const CERTIFICATE_REQUEST: u8 = 13;
    pub const SERVER_HELLO_DONE: u8 = 14;
    pub const CERTIFICATE_VERIFY: u8 = 15;
    pub const CLIENT_KEY_EXCHANGE: u8 = 16;
    pub const FINISHED: u8 = 20;
}

/// Alert descriptions the tool emits or inspects.
pub mod alert {
    pub const LEVEL_WARNING: u8 = 1;
    pub const LEVEL_FATAL: u8 = 2;

    pub const CLOSE_NOTIFY: u8 = 0;
    pub const UNEXPECTED_MESSAGE: u8 = 10;
    pub const BAD_RECORD_MAC: u8 = 20;
    pub const HANDSHAKE_FAILURE: u8 = 40;
    pub const ILLEGAL_PARAMETER: u8 = 47;
    pub const DECODE_ERROR: u8 = 50;
    pub const DECRYPT_ERROR: u8 = 51;
    pub const PROTOCOL_VERSION: u8 = 70;
}
