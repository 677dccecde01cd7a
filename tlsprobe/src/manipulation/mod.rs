//! Scripted deviations from protocol-correct behavior.
//!
//! Each manipulation reacts at four join points (pre/post handshake,
//! pre/post step) and reads the session's state and role to decide whether
//! this invocation is its moment. Manipulations that install a backend
//! override in `pre_step` flag themselves active and revert the override in
//! their own `post_step`, leaving the session clean for later flights.

pub mod parser;

use tlsprobe_tooling::logging::{LogLevel, Logger};
use tlsprobe_tooling::trace_line;

use crate::tls::session::Session;
use crate::tls::{HandshakeState, TlsVersion};

const CATEGORY: &str = "Manipulation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Manipulation {
    /// Skip sending the own ChangeCipherSpec; the Finished that follows is
    /// still sent under the new keys.
    SkipChangeCipherSpec,
    /// Client only: skip sending the Finished message.
    SkipFinished,
    /// Replace the PreMasterSecret.random field on the wire with fresh
    /// non-zero bytes; the own key schedule keeps the original bytes.
    PreMasterSecretRandom,
    /// Zero one byte of the PreMasterSecret.random field on the wire.
    PreMasterSecretRandomByte { index: u16 },
    /// Overwrite PreMasterSecret.client_version before encryption.
    PreMasterSecretVersion { version: TlsVersion },
    /// Overwrite the three structural bytes of the RSAES-PKCS1-v1_5 block.
    RsaesPkcs1V15EncryptPadding {
        first_byte: u8,
        block_type: u8,
        padding: u8,
        active: bool,
    },
    /// Server only: skip individual checks in the RSA decrypt path.
    SkipRsaesPkcs1V15PaddingCheck {
        first_byte: bool,
        block_type: bool,
        delimiter: bool,
        pms_version: bool,
        active: bool,
    },
}

fn log(logger: &Logger, message: &str) {
    trace_line!(logger, LogLevel::High, CATEGORY, "{}", message);
}

impl Manipulation {
    pub fn pre_handshake(&mut self, _session: &mut Session) {}

    pub fn pre_step(&mut self, session: &mut Session) {
        let logger = session.logger().clone();
        match self {
            Manipulation::SkipChangeCipherSpec => {
                if session.is_client() {
                    if session.state() == HandshakeState::ClientChangeCipherSpec {
                        log(&logger, "Skip sending ChangeCipherSpec message.");
                        session.set_state(HandshakeState::ClientFinished);
                    }
                } else if session.state() == HandshakeState::ServerChangeCipherSpec {
                    log(&logger, "Skip sending ChangeCipherSpec message.");
                    session.set_state(HandshakeState::ServerFinished);
                }
            }
            Manipulation::SkipFinished => {
                if session.is_client() && session.state() == HandshakeState::ClientFinished {
                    log(&logger, "Skip sending Finished message.");
                    session.set_state(HandshakeState::ServerChangeCipherSpec);
                }
            }
            Manipulation::PreMasterSecretRandom => {
                if session.is_client() && session.state() == HandshakeState::ClientKeyExchange {
                    log(
                        &logger,
                        "Overwrite the field PreMasterSecret.random with new non-zero random bytes.",
                    );
                    session.overwrite_pre_master_secret_random();
                }
            }
            Manipulation::PreMasterSecretRandomByte { index } => {
                if session.is_client() && session.state() == HandshakeState::ClientKeyExchange {
                    log(
                        &logger,
                        &format!(
                            "Overwrite the byte at index {} in the field PreMasterSecret.random with zero.",
                            index
                        ),
                    );
                    session.overwrite_pre_master_secret_random_byte(*index);
                }
            }
            Manipulation::PreMasterSecretVersion { version } => {
                if session.is_client() && session.state() == HandshakeState::ClientKeyExchange {
                    log(
                        &logger,
                        &format!(
                            "Overwrite the field PreMasterSecret.client_version with (0x{:02x},0x{:02x}).",
                            version.major, version.minor
                        ),
                    );
                    session.overwrite_pre_master_secret_version(*version);
                }
            }
            Manipulation::RsaesPkcs1V15EncryptPadding {
                first_byte,
                block_type,
                padding,
                active,
            } => {
                if session.is_client() && session.state() == HandshakeState::ClientKeyExchange {
                    log(
                        &logger,
                        &format!(
                            "Change the first byte in RSAES-PKCS1-V1_5-ENCRYPT to 0x{:02x}.",
                            first_byte
                        ),
                    );
                    log(
                        &logger,
                        &format!(
                            "Change the block type byte in RSAES-PKCS1-V1_5-ENCRYPT to 0x{:02x}.",
                            block_type
                        ),
                    );
                    log(
                        &logger,
                        &format!(
                            "Change the byte between PS and M in RSAES-PKCS1-V1_5-ENCRYPT to 0x{:02x}.",
                            padding
                        ),
                    );
                    *active = true;
                    session.overwrite_rsaes_pkcs1_v15_encrypt_padding(
                        *first_byte,
                        *block_type,
                        *padding,
                    );
                }
            }
            Manipulation::SkipRsaesPkcs1V15PaddingCheck {
                first_byte,
                block_type,
                delimiter,
                pms_version,
                active,
            } => {
                if !session.is_client() && session.state() == HandshakeState::ClientKeyExchange {
                    log(
                        &logger,
                        &format!(
                            "Skip the first byte check in RSAES-PKCS1-V1_5-ENCRYPT: {}.",
                            *first_byte as u8
                        ),
                    );
                    log(
                        &logger,
                        &format!(
                            "Skip the block type check in RSAES-PKCS1-V1_5-ENCRYPT: {}.",
                            *block_type as u8
                        ),
                    );
                    log(
                        &logger,
                        &format!(
                            "Skip the delimiter check in RSAES-PKCS1-V1_5-ENCRYPT: {}.",
                            *delimiter as u8
                        ),
                    );
                    log(
                        &logger,
                        &format!(
                            "Skip the pre-master secret version check in RSAES-PKCS1-V1_5-ENCRYPT: {}.",
                            *pms_version as u8
                        ),
                    );
                    *active = true;
                    session.skip_rsaes_pkcs1_v15_padding_check(
                        *first_byte,
                        *block_type,
                        *delimiter,
                        *pms_version,
                    );
                }
            }
        }
    }

    pub fn post_step(&mut self, session: &mut Session) {
        match self {
            Manipulation::RsaesPkcs1V15EncryptPadding { active, .. } => {
                if *active {
                    session.restore_rsaes_pkcs1_v15_encrypt_padding();
                    *active = false;
                }
            }
            Manipulation::SkipRsaesPkcs1V15PaddingCheck { active, .. } => {
                if *active {
                    session.restore_rsaes_pkcs1_v15_padding_check();
                    *active = false;
                }
            }
            _ => {}
        }
    }

    pub fn post_handshake(&mut self, _session: &mut Session) {}

    /// Whether a backend override installed in `pre_step` is still pending
    /// its `post_step` restore.
    pub fn is_active(&self) -> bool {
        match self {
            Manipulation::RsaesPkcs1V15EncryptPadding { active, .. } => *active,
            Manipulation::SkipRsaesPkcs1V15PaddingCheck { active, .. } => *active,
            _ => false,
        }
    }

    /// Canonical configuration form of this manipulation.
    pub fn to_key_value(&self) -> (String, String) {
        match self {
            Manipulation::SkipChangeCipherSpec => {
                ("manipulateSkipChangeCipherSpec".to_string(), String::new())
            }
            Manipulation::SkipFinished => ("manipulateSkipFinished".to_string(), String::new()),
            Manipulation::PreMasterSecretRandom => {
                ("manipulatePreMasterSecretRandom".to_string(), String::new())
            }
            Manipulation::PreMasterSecretRandomByte { index } => (
                "manipulatePreMasterSecretRandomByte".to_string(),
                index.to_string(),
            ),
            Manipulation::PreMasterSecretVersion { version } => (
                "manipulatePreMasterSecretVersion".to_string(),
                format!("(0x{:02x},0x{:02x})", version.major, version.minor),
            ),
            Manipulation::RsaesPkcs1V15EncryptPadding {
                first_byte,
                block_type,
                padding,
                ..
            } => (
                "manipulateRsaesPkcs1V15EncryptPadding".to_string(),
                format!("0x{:02x},0x{:02x},0x{:02x}", first_byte, block_type, padding),
            ),
            Manipulation::SkipRsaesPkcs1V15PaddingCheck {
                first_byte,
                block_type,
                delimiter,
                pms_version,
                ..
            } => (
                "manipulateSkipRsaesPkcs1V15PaddingCheck".to_string(),
                format!("{},{},{},{}", first_byte, block_type, delimiter, pms_version),
            ),
        }
    }
}

/// Ordered list of manipulations, invoked at the four join points.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    manipulations: Vec<Manipulation>,
}

impl Pipeline {
    pub fn new(manipulations: Vec<Manipulation>) -> Pipeline {
        Pipeline { manipulations }
    }

    pub fn is_empty(&self) -> bool {
        self.manipulations.is_empty()
    }

    pub fn manipulations(&self) -> &[Manipulation] {
        &self.manipulations
    }

    pub fn pre_handshake(&mut self, session: &mut Session) {
        for manipulation in self.manipulations.iter_mut() {
            manipulation.pre_handshake(session);
        }
    }

    pub fn pre_step(&mut self, session: &mut Session) {
        for manipulation in self.manipulations.iter_mut() {
            manipulation.pre_step(session);
        }
    }

    pub fn post_step(&mut self, session: &mut Session) {
        for manipulation in self.manipulations.iter_mut() {
            manipulation.post_step(session);
        }
    }

    pub fn post_handshake(&mut self, session: &mut Session) {
        for manipulation in self.manipulations.iter_mut() {
            manipulation.post_handshake(session);
        }
    }
}
