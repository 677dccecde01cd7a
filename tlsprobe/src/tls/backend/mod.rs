//! In-tree step-wise TLS 1.0/1.1/1.2 engine.
//!
//! The engine plays the role of the patched TLS library behind the
//! [`crate::tls::session::TlsAdapter`]: it advances the handshake one
//! [`HandshakeState`] per `step()`, exposes the handshake cursor for
//! manipulation-driven jumps, and carries the premaster/PKCS#1 mutation
//! knobs down into its RSA key-transport code.

pub mod codec;
pub mod debug;
pub mod kx;
pub mod pki;
pub mod prf;
pub mod record;
pub mod sig;
pub mod suites;

mod client;
mod server;

use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::RsaPublicKey;

use crate::error::{Error, Result};
use crate::network::tcp::SharedTcpConnection;
use crate::tls::{alert, content_type, handshake_type, HandshakeState, Role, TlsVersion};
use debug::DebugSink;
use prf::Transcript;
use record::Transform;
use suites::SuiteInfo;
use tlsprobe_tooling::logging::Logger;

const RECEIVE_POLL_INTERVAL: Duration = Duration::from_millis(20);

pub(crate) struct HandshakeData {
    pub client_random: Option<[u8; 32]>,
    pub server_random: Option<[u8; 32]>,
    pub session_id: Vec<u8>,
    /// client_version as offered in the ClientHello.
    pub offered_version: TlsVersion,
    /// Negotiated protocol version; unset until the ServerHello.
    pub version: TlsVersion,
    pub suite: Option<&'static SuiteInfo>,
    pub transcript: Transcript,
    pub premaster: Vec<u8>,
    pub master: Option<[u8; 48]>,
    pub peer_chain: Vec<Vec<u8>>,
    pub peer_rsa: Option<RsaPublicKey>,
    pub server_dh: Option<kx::DhEphemeral>,
    pub server_ecdh: Option<kx::EcdhEphemeral>,
    /// (p, g, Ys) taken from a received ServerKeyExchange.
    pub peer_dh_params: Option<(Vec<u8>, Vec<u8>, Vec<u8>)>,
    /// Server ECDHE point taken from a received ServerKeyExchange.
    pub peer_ecdh_point: Option<Vec<u8>>,
    pub certificate_requested: bool,
    pub client_certificate_sent: bool,
    pub peer_ccs_seen: bool,
}

impl HandshakeData {
    fn new() -> HandshakeData {
        HandshakeData {
            client_random: None,
            server_random: None,
            session_id: Vec::new(),
            offered_version: TlsVersion::UNSET,
            version: TlsVersion::UNSET,
            suite: None,
            transcript: Transcript::new(),
            premaster: Vec::new(),
            master: None,
            peer_chain: Vec::new(),
            peer_rsa: None,
            server_dh: None,
            server_ecdh: None,
            peer_dh_params: None,
            peer_ecdh_point: None,
            certificate_requested: false,
            client_certificate_sent: false,
            peer_ccs_seen: false,
        }
    }
}

pub struct Connection {
    pub(crate) role: Role,
    pub(crate) tcp: SharedTcpConnection,
    pub(crate) dbg: DebugSink,
    pub(crate) state: HandshakeState,
    pub(crate) min_version: TlsVersion,
    pub(crate) max_version: TlsVersion,
    pub(crate) offered_suites: Vec<crate::tls::CipherSuite>,
    pub(crate) identity: Option<pki::Identity>,
    pub(crate) receive_timeout: Duration,
    // Manipulation knobs. Each one is individually revertible.
    pub(crate) pms_version_override: Option<TlsVersion>,
    pub(crate) pms_random_override: bool,
    pub(crate) pms_random_byte_override: Option<u16>,
    pub(crate) pkcs1_overrides: kx::Pkcs1Overrides,
    pub(crate) pkcs1_skip: kx::Pkcs1SkipChecks,
    pub(crate) skip_pms_version_check: bool,
    pub(crate) server_simulation: u16,
    pub(crate) server_simulation_delay: u32,
    // Record layer.
    in_buf: Vec<u8>,
    hs_in: Vec<u8>,
    app_in: Vec<u8>,
    read_transform: Option<Transform>,
    write_transform: Option<Transform>,
    pending_read: Option<Transform>,
    pending_write: Option<Transform>,
    pub(crate) hs: HandshakeData,
}

impl Connection {
    pub fn new(role: Role, tcp: SharedTcpConnection, logger: Logger) -> Connection {
        Connection {
            role,
            tcp,
            dbg: DebugSink::new(logger),
            state: match role {
                Role::Client => HandshakeState::ClientHello,
                Role::Server => HandshakeState::HelloRequest,
            },
            min_version: TlsVersion::TLS1_0,
            max_version: TlsVersion::TLS1_2,
            offered_suites: suites::default_offer(),
            identity: None,
            receive_timeout: Duration::from_secs(120),
            pms_version_override: None,
            pms_random_override: false,
            pms_random_byte_override: None,
            pkcs1_overrides: kx::Pkcs1Overrides::default(),
            pkcs1_skip: kx::Pkcs1SkipChecks::default(),
            skip_pms_version_check: false,
            server_simulation: 0,
            server_simulation_delay: 0,
            in_buf: Vec::new(),
            hs_in: Vec::new(),
            app_in: Vec::new(),
            read_transform: None,
            write_transform: None,
            pending_read: None,
            pending_write: None,
            hs: HandshakeData::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Plain assignment: manipulations may force non-adjacent jumps.
    pub fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    pub fn set_version(&mut self, version: TlsVersion) {
        self.min_version = version;
        self.max_version = version;
    }

    pub fn max_version(&self) -> TlsVersion {
        self.max_version
    }

    pub fn set_max_version(&mut self, version: TlsVersion) {
        self.max_version = version;
    }

    pub fn set_cipher_suites(&mut self, suites: &[crate::tls::CipherSuite]) {
        self.offered_suites = suites.to_vec();
    }

    pub fn set_identity(&mut self, identity: pki::Identity) {
        self.identity = Some(identity);
    }

    pub fn set_receive_timeout(&mut self, timeout: Duration) {
        self.receive_timeout = timeout;
    }

    pub fn negotiated_version(&self) -> TlsVersion {
        self.hs.version
    }

    pub fn suite_name(&self) -> Option<&'static str> {
        self.hs.suite.map(|suite| suite.name)
    }

    pub fn client_random(&self) -> Option<[u8; 32]> {
        self.hs.client_random
    }

    pub fn master_secret(&self) -> Option<[u8; 48]> {
        self.hs.master
    }

    /// IV state of the receive transform, as observed by the last record.
    pub fn read_iv(&self) -> Option<Vec<u8>> {
        self.read_transform.as_ref().map(|t| t.iv_snapshot())
    }

    /// Advance the handshake by one state.
    pub fn step(&mut self) -> Result<()> {
        self.dbg
            .msg(2, &format!("handshake state: {}", self.state));
        match self.role {
            Role::Client => client::step(self),
            Role::Server => server::step(self),
        }
    }

    // ---- TCP plumbing -------------------------------------------------

    /// Wait until at least one byte is readable, respecting the receive
    /// timeout and the endpoint's closed state. Two closed-probes are needed
    /// on the server side to not mistake fragmented incoming data for a
    /// close.
    fn tcp_wait_for_data(&mut self) -> Result<()> {
        let start = Instant::now();
        loop {
            if self.tcp.borrow().available() > 0 {
                return Ok(());
            }
            if start.elapsed() > self.receive_timeout {
                return Err(Error::Timeout("incoming TLS data".to_string()));
            }
            let closed = match self.role {
                Role::Client => self.tcp.borrow_mut().is_closed(true),
                Role::Server => {
                    let mut tcp = self.tcp.borrow_mut();
                    tcp.is_closed(false) && tcp.is_closed(false)
                }
            };
            if closed {
                return Err(Error::Network(
                    "connection was closed by the remote host".to_string(),
                ));
            }
            std::thread::sleep(RECEIVE_POLL_INTERVAL);
        }
    }

    fn fetch_input(&mut self, want: usize) -> Result<()> {
        while self.in_buf.len() < want {
            self.tcp_wait_for_data()?;
            let available = self.tcp.borrow().available();
            let missing = want - self.in_buf.len();
            let take = available.min(missing);
            let data = self.tcp.borrow_mut().read(take)?;
            self.in_buf.extend_from_slice(&data);
        }
        Ok(())
    }

    /// Next record header without consuming it.
    pub fn peek_record_header(&mut self) -> Result<[u8; 5]> {
        self.fetch_input(record::RECORD_HEADER_LEN)?;
        let mut header = [0u8; 5];
        header.copy_from_slice(&self.in_buf[..5]);
        Ok(header)
    }

    fn record_version(&self) -> TlsVersion {
        if self.hs.version.is_set() {
            self.hs.version
        } else {
            // Record-layer version of the first flight.
            TlsVersion::TLS1_0
        }
    }

    pub(crate) fn write_record(&mut self, content_type: u8, payload: &[u8]) -> Result<()> {
        let version = self.record_version();
        let body = match &mut self.write_transform {
            Some(transform) => transform.encrypt(content_type, payload)?,
            None => payload.to_vec(),
        };
        let mut wire = Vec::with_capacity(record::RECORD_HEADER_LEN + body.len());
        wire.push(content_type);
        wire.push(version.major);
        wire.push(version.minor);
        codec::put_u16(&mut wire, body.len() as u16);
        wire.extend_from_slice(&body);
        self.tcp.borrow_mut().write(&wire)?;
        Ok(())
    }

    fn read_record(&mut self) -> Result<(u8, Vec<u8>)> {
        self.fetch_input(record::RECORD_HEADER_LEN)?;
        let content = self.in_buf[0];
        let major = self.in_buf[1];
        let minor = self.in_buf[2];
        let length = ((self.in_buf[3] as usize) << 8) | self.in_buf[4] as usize;
        if !(content_type::CHANGE_CIPHER_SPEC..=content_type::HEARTBEAT).contains(&content) {
            self.dbg.msg(1, "unknown record type");
            return Err(Error::InvalidRecord);
        }
        if major != 3 || minor > self.max_version.minor {
            self.dbg.msg(1, "bad record version");
            return Err(Error::InvalidRecord);
        }
        if length == 0 || length > record::MAX_CIPHERTEXT_LEN {
            self.dbg.msg(1, "bad record length");
            return Err(Error::InvalidRecord);
        }
        self.fetch_input(record::RECORD_HEADER_LEN + length)?;
        let wire: Vec<u8> = self.in_buf.drain(..record::RECORD_HEADER_LEN + length).collect();
        self.dbg.buf(4, "input record from network", &wire);
        let body = wire[record::RECORD_HEADER_LEN..].to_vec();
        let decrypted = match &mut self.read_transform {
            Some(transform) => Some(transform.decrypt(content, &body, &self.dbg)),
            None => None,
        };
        let payload = match decrypted {
            None => body,
            Some(Ok(payload)) => payload,
            Some(Err(e)) => {
                let _ = self.send_alert(alert::LEVEL_FATAL, alert::BAD_RECORD_MAC);
                return Err(e);
            }
        };
        Ok((content, payload))
    }

    fn process_alert(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() < 2 {
            return Err(Error::InvalidRecord);
        }
        let level = payload[0];
        let description = payload[1];
        self.dbg.msg(
            2,
            &format!("got an alert message, type: [{}:{}]", level, description),
        );
        if level == alert::LEVEL_FATAL {
            return Err(Error::FatalAlertReceived);
        }
        if description == alert::CLOSE_NOTIFY {
            return Err(Error::PeerClosed);
        }
        Ok(())
    }

    fn process_change_cipher_spec(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() != 1 || payload[0] != 1 {
            self.dbg.msg(1, "bad change cipher spec message");
            let _ = self.send_alert(alert::LEVEL_FATAL, alert::UNEXPECTED_MESSAGE);
            return Err(Error::Tls("bad change cipher spec message".to_string()));
        }
        self.dbg.msg(2, "<= parse change cipher spec");
        self.hs.peer_ccs_seen = true;
        if let Some(transform) = self.pending_read.take() {
            self.read_transform = Some(transform);
        }
        Ok(())
    }

    fn process_heartbeat(&mut self, version: TlsVersion, payload: &[u8]) {
        // Re-assemble a plaintext record image for the dump the filters
        // descend into.
        let mut image = Vec::with_capacity(record::RECORD_HEADER_LEN + payload.len());
        image.push(content_type::HEARTBEAT);
        image.push(version.major);
        image.push(version.minor);
        codec::put_u16(&mut image, payload.len() as u16);
        image.extend_from_slice(payload);
        self.dbg.buf(4, "heartbeat input record after decrypt", &image);
    }

    /// Consume exactly one record and file its content, used by the alert
    /// probing and the close sequence.
    pub fn read_one_record(&mut self) -> Result<()> {
        let (content, payload) = self.read_record()?;
        match content {
            content_type::ALERT => self.process_alert(&payload),
            content_type::HANDSHAKE => {
                self.hs_in.extend_from_slice(&payload);
                Ok(())
            }
            content_type::CHANGE_CIPHER_SPEC => self.process_change_cipher_spec(&payload),
            content_type::APPLICATION_DATA => {
                self.app_in.extend_from_slice(&payload);
                Ok(())
            }
            content_type::HEARTBEAT => {
                self.process_heartbeat(self.record_version(), &payload);
                Ok(())
            }
            _ => Err(Error::InvalidRecord),
        }
    }

    /// Next complete handshake message as its raw wire form (header
    /// included). HelloRequest is handled transparently on the client side.
    pub(crate) fn read_handshake_message(&mut self) -> Result<(u8, Vec<u8>)> {
        loop {
            if self.hs_in.len() >= 4 {
                let msg_type = self.hs_in[0];
                let length = ((self.hs_in[1] as usize) << 16)
                    | ((self.hs_in[2] as usize) << 8)
                    | self.hs_in[3] as usize;
                if self.hs_in.len() >= 4 + length {
                    let raw: Vec<u8> = self.hs_in.drain(..4 + length).collect();
                    if msg_type == handshake_type::HELLO_REQUEST
                        && self.role == Role::Client
                        && length == 0
                    {
                        // Not part of the transcript; ignored mid-handshake.
                        self.dbg.msg(2, "received hello request, ignoring");
                        continue;
                    }
                    return Ok((msg_type, raw));
                }
            }
            let (content, payload) = self.read_record()?;
            match content {
                content_type::HANDSHAKE => self.hs_in.extend_from_slice(&payload),
                content_type::ALERT => self.process_alert(&payload)?,
                content_type::CHANGE_CIPHER_SPEC => self.process_change_cipher_spec(&payload)?,
                content_type::HEARTBEAT => self.process_heartbeat(self.record_version(), &payload),
                content_type::APPLICATION_DATA => {
                    return Err(Error::Tls(
                        "unexpected application data during handshake".to_string(),
                    ));
                }
                _ => return Err(Error::InvalidRecord),
            }
        }
    }

    /// Type of the next buffered handshake message, reading records until at
    /// least the type byte is present. Used for the optional messages.
    pub(crate) fn peek_handshake_message_type(&mut self) -> Result<u8> {
        while self.hs_in.is_empty() {
            let (content, payload) = self.read_record()?;
            match content {
                content_type::HANDSHAKE => self.hs_in.extend_from_slice(&payload),
                content_type::ALERT => self.process_alert(&payload)?,
                content_type::HEARTBEAT => self.process_heartbeat(self.record_version(), &payload),
                _ => return Err(Error::Tls("unexpected message".to_string())),
            }
        }
        Ok(self.hs_in[0])
    }

    pub(crate) fn expect_handshake_message(&mut self, expected: u8, bad_log: &str) -> Result<Vec<u8>> {
        let (msg_type, raw) = self.read_handshake_message()?;
        if msg_type != expected {
            self.dbg.msg(1, bad_log);
            let _ = self.send_alert(alert::LEVEL_FATAL, alert::UNEXPECTED_MESSAGE);
            return Err(Error::Tls(format!(
                "unexpected handshake message type {}",
                msg_type
            )));
        }
        Ok(raw)
    }

    /// Wait for the peer's ChangeCipherSpec (it may already have been
    /// consumed by the alert probing).
    pub(crate) fn read_change_cipher_spec(&mut self) -> Result<()> {
        loop {
            if self.hs.peer_ccs_seen {
                self.hs.peer_ccs_seen = false;
                return Ok(());
            }
            let (content, payload) = self.read_record()?;
            match content {
                content_type::CHANGE_CIPHER_SPEC => {
                    self.process_change_cipher_spec(&payload)?;
                }
                content_type::ALERT => self.process_alert(&payload)?,
                content_type::HEARTBEAT => self.process_heartbeat(self.record_version(), &payload),
                content_type::HANDSHAKE => {
                    self.dbg.msg(1, "bad change cipher spec message");
                    let _ = self.send_alert(alert::LEVEL_FATAL, alert::UNEXPECTED_MESSAGE);
                    return Err(Error::Tls(
                        "expected change cipher spec message".to_string(),
                    ));
                }
                _ => return Err(Error::InvalidRecord),
            }
        }
    }

    pub(crate) fn send_handshake_message(&mut self, raw: &[u8]) -> Result<()> {
        self.hs.transcript.update(raw);
        self.write_record(content_type::HANDSHAKE, raw)
    }

    pub fn send_alert(&mut self, level: u8, description: u8) -> Result<()> {
        self.write_record(content_type::ALERT, &[level, description])
    }

    /// Drive the close_notify out. The blocking TCP write either succeeds as
    /// a whole or fails hard, so no want-write loop is needed here.
    pub fn send_close_notify(&mut self) -> Result<()> {
        self.dbg.msg(2, "=> write close notify");
        self.send_alert(alert::LEVEL_WARNING, alert::CLOSE_NOTIFY)
    }

    // ---- key schedule -------------------------------------------------

    pub(crate) fn required_suite(&self) -> Result<&'static SuiteInfo> {
        self.hs
            .suite
            .ok_or_else(|| Error::Tls("no cipher suite negotiated".to_string()))
    }

    pub(crate) fn derive_keys(&mut self) -> Result<()> {
        let suite = self.required_suite()?;
        let version = self.hs.version;
        let client_random = self
            .hs
            .client_random
            .ok_or_else(|| Error::Tls("no client random".to_string()))?;
        let server_random = self
            .hs
            .server_random
            .ok_or_else(|| Error::Tls("no server random".to_string()))?;
        if self.hs.premaster.is_empty() {
            return Err(Error::Tls("no premaster secret".to_string()));
        }
        self.dbg.buf(3, "premaster secret", &self.hs.premaster);
        let master = prf::master_secret(
            version,
            suite.prf,
            &self.hs.premaster,
            &client_random,
            &server_random,
        );
        self.dbg.buf(3, "master secret", &master);
        let key_block = prf::key_block(
            version,
            suite.prf,
            &master,
            &client_random,
            &server_random,
            record::key_block_len(suite),
        );
        let pair = record::derive_transforms(suite, version, &key_block);
        match self.role {
            Role::Client => {
                self.pending_write = Some(pair.client_write);
                self.pending_read = Some(pair.server_write);
            }
            Role::Server => {
                self.pending_write = Some(pair.server_write);
                self.pending_read = Some(pair.client_write);
            }
        }
        self.hs.master = Some(master);
        Ok(())
    }

    pub(crate) fn send_finished(&mut self, label: &[u8]) -> Result<()> {
        // The outgoing transform switches here, not at the ChangeCipherSpec:
        // a skipped CCS still yields an encrypted Finished.
        if let Some(transform) = self.pending_write.take() {
            self.write_transform = Some(transform);
        }
        let suite = self.required_suite()?;
        let master = self
            .hs
            .master
            .ok_or_else(|| Error::Tls("no master secret".to_string()))?;
        let verify = prf::verify_data(
            self.hs.version,
            suite.prf,
            &master,
            label,
            &self.hs.transcript,
        );
        let raw = codec::handshake_message(handshake_type::FINISHED, &verify);
        self.send_handshake_message(&raw)?;
        self.dbg.msg(2, "<= write finished");
        Ok(())
    }

    pub(crate) fn parse_finished(&mut self, label: &[u8]) -> Result<()> {
        let suite = self.required_suite()?;
        let master = self
            .hs
            .master
            .ok_or_else(|| Error::Tls("no master secret".to_string()))?;
        let raw = self.expect_handshake_message(handshake_type::FINISHED, "bad finished message")?;
        let expected = prf::verify_data(
            self.hs.version,
            suite.prf,
            &master,
            label,
            &self.hs.transcript,
        );
        if raw[4..] != expected {
            self.dbg.msg(1, "bad finished message");
            let _ = self.send_alert(alert::LEVEL_FATAL, alert::DECRYPT_ERROR);
            return Err(Error::Tls("finished verification failed".to_string()));
        }
        self.hs.transcript.update(&raw);
        self.dbg.msg(2, "<= parse finished");
        Ok(())
    }

    pub(crate) fn fresh_random(&self) -> [u8; 32] {
        let mut random = [0u8; 32];
        OsRng.fill_bytes(&mut random);
        random
    }

    // ---- application data ---------------------------------------------

    /// Up to `max` bytes of application data, reading records as needed.
    pub fn read_application_data(&mut self, max: usize) -> Result<Vec<u8>> {
        loop {
            if !self.app_in.is_empty() {
                let take = self.app_in.len().min(max);
                return Ok(self.app_in.drain(..take).collect());
            }
            self.read_one_record()?;
        }
    }

    pub fn write_application_data(&mut self, data: &[u8]) -> Result<()> {
        for chunk in data.chunks(record::MAX_FRAGMENT_LEN) {
            self.write_record(content_type::APPLICATION_DATA, chunk)?;
        }
        Ok(())
    }
}
