//! The handshake driver and the narrow adapter interface it drives.

use std::io::Write;
use std::time::{Duration, Instant};

use tlsprobe_tooling::logging::{LogLevel, Logger};
use tlsprobe_tooling::{strings, trace_line};

use crate::error::{Error, Result};
use crate::manipulation::Pipeline;
use crate::network::tcp::SharedTcpConnection;
use crate::tls::backend::{pki, Connection};
use crate::tls::{content_type, CipherSuite, HandshakeState, Role, TlsVersion};

const CATEGORY: &str = "TLS";
const ALERT_POLL_INTERVAL: Duration = Duration::from_millis(20);
const APPLICATION_DATA_QUANTUM: usize = 1024;

/// Capability set the driver needs from a TLS backend. Any conforming
/// backend works; the in-tree engine is the one that exposes the raw
/// premaster/PKCS#1 knobs.
pub trait TlsAdapter {
    fn role(&self) -> Role;
    fn state(&self) -> HandshakeState;
    fn set_state(&mut self, state: HandshakeState);
    /// Advance the handshake by one state. Transient retry conditions are
    /// handled internally.
    fn step(&mut self) -> Result<()>;
    fn set_version(&mut self, version: TlsVersion);
    fn version(&self) -> TlsVersion;
    fn max_version(&self) -> TlsVersion;
    fn set_max_version(&mut self, version: TlsVersion);
    fn set_cipher_suites(&mut self, suites: &[CipherSuite]);
    fn install_certificate(&mut self, certificate: &[u8], private_key: &[u8]) -> Result<()>;
    fn set_receive_timeout(&mut self, timeout: Duration);
    fn suite_name(&self) -> Option<&'static str>;
    fn client_random(&self) -> Option<[u8; 32]>;
    fn master_secret(&self) -> Option<[u8; 48]>;
    /// IV state of the receive transform.
    fn read_iv(&self) -> Option<Vec<u8>>;
    fn peek_record_header(&mut self) -> Result<[u8; 5]>;
    fn read_one_record(&mut self) -> Result<()>;
    fn read_application_data(&mut self, max: usize) -> Result<Vec<u8>>;
    fn write_application_data(&mut self, data: &[u8]) -> Result<()>;
    fn send_close_notify(&mut self) -> Result<()>;
    // Mutation hooks; each one individually revertible.
    fn overwrite_pms_version(&mut self, version: TlsVersion);
    fn overwrite_pms_random(&mut self);
    fn overwrite_pms_random_byte(&mut self, index: u16);
    fn overwrite_pkcs1_padding(&mut self, first_byte: u8, block_type: u8, padding: u8);
    fn restore_pkcs1_padding(&mut self);
    fn skip_pkcs1_checks(
        &mut self,
        first_byte: bool,
        block_type: bool,
        delimiter: bool,
        pms_version: bool,
    );
    fn restore_pkcs1_checks(&mut self);
    fn set_server_simulation(&mut self, id: u16);
    fn set_server_simulation_delay(&mut self, micros: u32);
}

impl TlsAdapter for Connection {
    fn role(&self) -> Role {
        Connection::role(self)
    }

    fn state(&self) -> HandshakeState {
        Connection::state(self)
    }

    fn set_state(&mut self, state: HandshakeState) {
        Connection::set_state(self, state)
    }

    fn step(&mut self) -> Result<()> {
        Connection::step(self)
    }

    fn set_version(&mut self, version: TlsVersion) {
        Connection::set_version(self, version)
    }

    fn version(&self) -> TlsVersion {
        self.negotiated_version()
    }

    fn max_version(&self) -> TlsVersion {
        Connection::max_version(self)
    }

    fn set_max_version(&mut self, version: TlsVersion) {
        Connection::set_max_version(self, version)
    }

    fn set_cipher_suites(&mut self, suites: &[CipherSuite]) {
        Connection::set_cipher_suites(self, suites)
    }

    fn install_certificate(&mut self, certificate: &[u8], private_key: &[u8]) -> Result<()> {
        let identity = pki::Identity::from_files_content(certificate, private_key)?;
        self.set_identity(identity);
        Ok(())
    }

    fn set_receive_timeout(&mut self, timeout: Duration) {
        Connection::set_receive_timeout(self, timeout)
    }

    fn suite_name(&self) -> Option<&'static str> {
        Connection::suite_name(self)
    }

    fn client_random(&self) -> Option<[u8; 32]> {
        Connection::client_random(self)
    }

    fn master_secret(&self) -> Option<[u8; 48]> {
        Connection::master_secret(self)
    }

    fn read_iv(&self) -> Option<Vec<u8>> {
        Connection::read_iv(self)
    }

    fn peek_record_header(&mut self) -> Result<[u8; 5]> {
        Connection::peek_record_header(self)
    }

    fn read_one_record(&mut self) -> Result<()> {
        Connection::read_one_record(self)
    }

    fn read_application_data(&mut self, max: usize) -> Result<Vec<u8>> {
        Connection::read_application_data(self, max)
    }

    fn write_application_data(&mut self, data: &[u8]) -> Result<()> {
        Connection::write_application_data(self, data)
    }

    fn send_close_notify(&mut self) -> Result<()> {
        Connection::send_close_notify(self)
    }

    fn overwrite_pms_version(&mut self, version: TlsVersion) {
        self.pms_version_override = Some(version);
    }

    fn overwrite_pms_random(&mut self) {
        self.pms_random_override = true;
    }

    fn overwrite_pms_random_byte(&mut self, index: u16) {
        self.pms_random_byte_override = Some(index);
    }

    fn overwrite_pkcs1_padding(&mut self, first_byte: u8, block_type: u8, padding: u8) {
        self.pkcs1_overrides = crate::tls::backend::kx::Pkcs1Overrides {
            enabled: true,
            first_byte,
            block_type,
            padding,
        };
    }

    fn restore_pkcs1_padding(&mut self) {
        self.pkcs1_overrides = crate::tls::backend::kx::Pkcs1Overrides::default();
    }

    fn skip_pkcs1_checks(
        &mut self,
        first_byte: bool,
        block_type: bool,
        delimiter: bool,
        pms_version: bool,
    ) {
        self.pkcs1_skip = crate::tls::backend::kx::Pkcs1SkipChecks {
            first_byte,
            block_type,
            delimiter,
            pms_version,
        };
        self.skip_pms_version_check = pms_version;
    }

    fn restore_pkcs1_checks(&mut self) {
        self.pkcs1_skip = crate::tls::backend::kx::Pkcs1SkipChecks::default();
        self.skip_pms_version_check = false;
    }

    fn set_server_simulation(&mut self, id: u16) {
        self.server_simulation = id;
    }

    fn set_server_simulation_delay(&mut self, micros: u32) {
        self.server_simulation_delay = micros;
    }
}

/// One TLS session against the peer under test: owns the adapter, drives the
/// step-wise handshake, probes for alerts and emits the NSS key log.
pub struct Session {
    role: Role,
    adapter: Box<dyn TlsAdapter>,
    tcp: SharedTcpConnection,
    logger: Logger,
    secret_output: Option<Box<dyn Write>>,
    wait_for_alert_seconds: u64,
    expect_alert_message: bool,
    captured_client_random: Option<[u8; 32]>,
}

impl Session {
    pub fn new_client(tcp: SharedTcpConnection, logger: Logger) -> Session {
        let adapter = Box::new(Connection::new(Role::Client, tcp.clone(), logger.clone()));
        Session::with_adapter(Role::Client, adapter, tcp, logger)
    }

    pub fn new_server(tcp: SharedTcpConnection, logger: Logger) -> Session {
        let adapter = Box::new(Connection::new(Role::Server, tcp.clone(), logger.clone()));
        Session::with_adapter(Role::Server, adapter, tcp, logger)
    }

    pub fn with_adapter(
        role: Role,
        adapter: Box<dyn TlsAdapter>,
        tcp: SharedTcpConnection,
        logger: Logger,
    ) -> Session {
        Session {
            role,
            adapter,
            tcp,
            logger,
            secret_output: None,
            wait_for_alert_seconds: 10,
            expect_alert_message: false,
            captured_client_random: None,
        }
    }

    pub fn is_client(&self) -> bool {
        self.role == Role::Client
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn state(&self) -> HandshakeState {
        self.adapter.state()
    }

    /// Force the handshake cursor; the peer will typically answer a forced
    /// jump with an Alert, so one is expected from here on.
    pub fn set_state(&mut self, state: HandshakeState) {
        self.adapter.set_state(state);
        self.expect_alert_message = true;
    }

    pub fn set_version(&mut self, version: TlsVersion) {
        self.adapter.set_version(version);
    }

    pub fn version(&self) -> TlsVersion {
        self.adapter.version()
    }

    pub fn set_cipher_suites(&mut self, suites: &[CipherSuite]) {
        self.adapter.set_cipher_suites(suites);
    }

    pub fn set_certificate(&mut self, certificate: &[u8], private_key: &[u8]) -> Result<()> {
        self.adapter.install_certificate(certificate, private_key)
    }

    pub fn set_secret_output(&mut self, output: Box<dyn Write>) {
        self.secret_output = Some(output);
    }

    pub fn is_secret_information_collected(&self) -> bool {
        self.secret_output.is_some()
    }

    pub fn set_wait_for_alert_seconds(&mut self, timeout: u64) {
        self.wait_for_alert_seconds = timeout;
    }

    pub fn set_tcp_receive_timeout_seconds(&mut self, timeout: u64) {
        self.adapter.set_receive_timeout(Duration::from_secs(timeout));
    }

    pub fn set_server_simulation(&mut self, id: u16) {
        self.adapter.set_server_simulation(id);
        if id != 0 {
            let simulated_server = match id {
                1 => "CISCO ACE",
                2 => "Facebook v2",
                3 => "F5 v1",
                4 => "PAN OS",
                5 => "Netscaler GCM",
                6 => "Delay",
                _ => "Unknown",
            };
            trace_line!(
                self.logger,
                LogLevel::High,
                CATEGORY,
                "Using server simulation {}.",
                simulated_server
            );
        }
    }

    pub fn set_server_simulation_delay(&mut self, micros: u32) {
        self.adapter.set_server_simulation_delay(micros);
        trace_line!(
            self.logger,
            LogLevel::High,
            CATEGORY,
            "Using server simulation delay of {} microseconds.",
            micros
        );
    }

    // Manipulation hooks, forwarded to the backend.

    pub fn overwrite_pre_master_secret_version(&mut self, version: TlsVersion) {
        self.adapter.overwrite_pms_version(version);
    }

    pub fn overwrite_pre_master_secret_random(&mut self) {
        self.adapter.overwrite_pms_random();
    }

    pub fn overwrite_pre_master_secret_random_byte(&mut self, index: u16) {
        self.adapter.overwrite_pms_random_byte(index);
    }

    pub fn overwrite_rsaes_pkcs1_v15_encrypt_padding(
        &mut self,
        first_byte: u8,
        block_type: u8,
        padding: u8,
    ) {
        self.adapter.overwrite_pkcs1_padding(first_byte, block_type, padding);
    }

    pub fn restore_rsaes_pkcs1_v15_encrypt_padding(&mut self) {
        self.adapter.restore_pkcs1_padding();
    }

    pub fn skip_rsaes_pkcs1_v15_padding_check(
        &mut self,
        first_byte: bool,
        block_type: bool,
        delimiter: bool,
        pms_version: bool,
    ) {
        self.adapter
            .skip_pkcs1_checks(first_byte, block_type, delimiter, pms_version);
    }

    pub fn restore_rsaes_pkcs1_v15_padding_check(&mut self) {
        self.adapter.restore_pkcs1_checks();
    }

    fn log(&self, message: &str) {
        trace_line!(self.logger, LogLevel::High, CATEGORY, "{}", message);
    }

    /// Run the whole handshake, one observable step at a time.
    pub fn perform_handshake(&mut self, pipeline: &mut Pipeline) -> Result<()> {
        while self.adapter.state() != HandshakeState::HandshakeDone {
            if let Err(e) = self.perform_handshake_step(pipeline) {
                self.expect_alert_message = true;
                self.wait_for_expected_alert(true);
                return Err(e);
            }
            if self.tcp.borrow_mut().is_closed(self.is_client()) {
                self.log("Handshake aborted.");
                return Ok(());
            }
        }
        self.log("Handshake successful.");
        self.log(&format!("Protocol: {}", self.adapter.version().name()));
        if let Some(name) = self.adapter.suite_name() {
            self.log(&format!("Cipher suite: {}", name));
        }
        Ok(())
    }

    pub fn perform_handshake_step(&mut self, pipeline: &mut Pipeline) -> Result<()> {
        pipeline.pre_step(self);
        // Pump the probe so handlers that became ready run now.
        let _ = self.tcp.borrow_mut().is_closed(true);
        let current_state = self.adapter.state();
        let expecting_peer_finished = (self.is_client()
            && current_state == HandshakeState::ServerFinished)
            || (!self.is_client() && current_state == HandshakeState::ClientFinished);
        if self.is_secret_information_collected()
            && current_state == HandshakeState::ClientKeyExchange
        {
            // Snapshot now; a manipulation may replace the bytes on the wire.
            self.captured_client_random = self.adapter.client_random();
        }
        let we_send_this_flight = current_state.is_sent_by(self.role);
        if we_send_this_flight {
            self.try_read_alert(false);
        }
        if let Err(e) = self.adapter.step() {
            if matches!(e, Error::FatalAlertReceived) {
                self.log("Fatal Alert message received.");
            }
            self.try_read_alert(true);
            return Err(e);
        }
        if expecting_peer_finished {
            if let Some(iv) = self.adapter.read_iv() {
                self.log(&format!(
                    "Finished.GenericBlockCipher.IV={}",
                    strings::byte_array_to_hex_string(&iv)
                ));
            }
            if self.is_secret_information_collected() {
                if let (Some(client_random), Some(master)) =
                    (self.captured_client_random, self.adapter.master_secret())
                {
                    self.provide_secret_information(&client_random, &master);
                }
            }
        }
        self.wait_for_expected_alert(we_send_this_flight);
        pipeline.post_step(self);
        Ok(())
    }

    /// Probe the wire for an Alert. The maximum accepted record version is
    /// temporarily raised to TLS 1.2 so alerts arriving before our own
    /// ServerHello are not dropped.
    pub fn try_read_alert(&mut self, force_read: bool) {
        let old_max = self.adapter.max_version();
        self.adapter.set_max_version(TlsVersion::TLS1_2);
        while self.tcp.borrow().available() > 0 {
            self.log("Checking for Alert message in received data.");
            let header = match self.adapter.peek_record_header() {
                Ok(header) => header,
                Err(_) => break,
            };
            let header_indicates_alert = header[0] == content_type::ALERT;
            if header_indicates_alert || force_read {
                match self.adapter.read_one_record() {
                    Ok(()) => {}
                    Err(Error::FatalAlertReceived) => {
                        self.log("Fatal Alert message received.");
                        break;
                    }
                    Err(Error::InvalidRecord) => {
                        self.log("Invalid TLS record received.");
                        self.log("Stop searching for Alert message.");
                        break;
                    }
                    Err(Error::PeerClosed) => break,
                    Err(_) => break,
                }
            } else if header[0] == content_type::APPLICATION_DATA
                && self.adapter.state() == HandshakeState::HandshakeDone
            {
                self.log("Skipping application data in received data.");
                if self.receive_application_data().is_err() {
                    break;
                }
            } else {
                break;
            }
        }
        self.adapter.set_max_version(old_max);
    }

    fn wait_for_expected_alert(&mut self, message_was_sent: bool) {
        if !self.expect_alert_message || !message_was_sent {
            return;
        }
        self.log("Waiting for incoming data that might contain an Alert message.");
        let timeout = Duration::from_secs(self.wait_for_alert_seconds);
        let start = Instant::now();
        while self.tcp.borrow().available() == 0 {
            if start.elapsed() > timeout {
                break;
            }
            std::thread::sleep(ALERT_POLL_INTERVAL);
        }
        self.try_read_alert(false);
        self.expect_alert_message = false;
    }

    pub fn send_application_data(&mut self, data: &[u8]) -> Result<()> {
        self.adapter.write_application_data(data)?;
        self.wait_for_expected_alert(true);
        Ok(())
    }

    /// Read in 1 KiB quanta until the stream runs dry. A graceful close with
    /// data already received ends the read; one without any data is an error.
    pub fn receive_application_data(&mut self) -> Result<Vec<u8>> {
        let mut received = Vec::new();
        loop {
            match self.adapter.read_application_data(APPLICATION_DATA_QUANTUM) {
                Ok(chunk) => {
                    let chunk_len = chunk.len();
                    received.extend_from_slice(&chunk);
                    if chunk_len < APPLICATION_DATA_QUANTUM {
                        return Ok(received);
                    }
                }
                Err(Error::PeerClosed) => {
                    if received.is_empty() {
                        return Err(Error::PeerClosed);
                    }
                    self.log("Connection was closed gracefully.");
                    return Ok(received);
                }
                Err(Error::Network(_)) if !received.is_empty() => {
                    self.log("Connection was reset by peer.");
                    return Ok(received);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Send close_notify; with a non-zero timeout, first watch the TCP side
    /// for the peer's closure while draining late alerts.
    pub fn close(&mut self, close_timeout_seconds: u64) -> Result<()> {
        self.log("Closing the TLS session.");
        if close_timeout_seconds != 0 {
            let timeout = Duration::from_secs(close_timeout_seconds);
            let start = Instant::now();
            while !self.tcp.borrow_mut().is_closed(false) {
                self.try_read_alert(true);
                if start.elapsed() > timeout {
                    break;
                }
                std::thread::sleep(ALERT_POLL_INTERVAL);
            }
        }
        self.adapter.send_close_notify()?;
        self.try_read_alert(true);
        Ok(())
    }

    fn provide_secret_information(&mut self, client_random: &[u8; 32], master_secret: &[u8; 48]) {
        if let Some(output) = &mut self.secret_output {
            // https://developer.mozilla.org/en-US/docs/Mozilla/Projects/NSS/Key_Log_Format
            let line = format!(
                "CLIENT_RANDOM {} {}\n",
                strings::byte_array_to_compact_hex(client_random),
                strings::byte_array_to_compact_hex(master_secret)
            );
            let _ = output.write_all(line.as_bytes());
            let _ = output.flush();
        }
    }
}
