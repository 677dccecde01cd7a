//! Handshake-driver semantics against a scripted adapter: step ordering,
//! manipulation pairing, client-random snapshot timing and the key log.

mod common;

use std::cell::RefCell;
use std::net::{TcpListener, TcpStream};
use std::rc::Rc;
use std::time::Duration;

use tlsprobe::error::{Error, Result};
use tlsprobe::manipulation::{Manipulation, Pipeline};
use tlsprobe::network::tcp::{SharedTcpConnection, TcpConnection};
use tlsprobe::tls::session::{Session, TlsAdapter};
use tlsprobe::tls::{CipherSuite, HandshakeState, Role, TlsVersion};
use tlsprobe_tooling::logging::Logger;

use common::SharedSink;

fn next_state(state: HandshakeState) -> HandshakeState {
    use HandshakeState::*;
    match state {
        HelloRequest => ClientHello,
        ClientHello => ServerHello,
        ServerHello => ServerCertificate,
        ServerCertificate => ServerKeyExchange,
        ServerKeyExchange => CertificateRequest,
        CertificateRequest => ServerHelloDone,
        ServerHelloDone => ClientCertificate,
        ClientCertificate => ClientKeyExchange,
        ClientKeyExchange => CertificateVerify,
        CertificateVerify => ClientChangeCipherSpec,
        ClientChangeCipherSpec => ClientFinished,
        ClientFinished => ServerChangeCipherSpec,
        ServerChangeCipherSpec => ServerFinished,
        ServerFinished => Internal1,
        Internal1 => Internal2,
        Internal2 => HandshakeDone,
        HandshakeDone => HandshakeDone,
    }
}

#[derive(Default)]
struct Recorded {
    steps: Vec<HandshakeState>,
    padding_override_calls: Vec<&'static str>,
    skip_check_calls: Vec<&'static str>,
}

struct FakeAdapter {
    state: HandshakeState,
    max_version: TlsVersion,
    client_random: [u8; 32],
    master: [u8; 48],
    log: Rc<RefCell<Recorded>>,
}

impl FakeAdapter {
    fn new(log: Rc<RefCell<Recorded>>) -> FakeAdapter {
        FakeAdapter {
            state: HandshakeState::ClientHello,
            max_version: TlsVersion::TLS1_2,
            client_random: [0xaa; 32],
            master: [0xbb; 48],
            log,
        }
    }
}

impl TlsAdapter for FakeAdapter {
    fn role(&self) -> Role {
        Role::Client
    }

    fn state(&self) -> HandshakeState {
        self.state
    }

    fn set_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    fn step(&mut self) -> Result<()> {
        self.log.borrow_mut().steps.push(self.state);
        if self.state == HandshakeState::ClientKeyExchange {
            // The scripted backend replaces its random during the step, like
            // a wire-level manipulation would.
            self.client_random = [0xcc; 32];
        }
        self.state = next_state(self.state);
        Ok(())
    }

    fn set_version(&mut self, _version: TlsVersion) {}

    fn version(&self) -> TlsVersion {
        TlsVersion::TLS1_2
    }

    fn max_version(&self) -> TlsVersion {
        self.max_version
    }

    fn set_max_version(&mut self, version: TlsVersion) {
        self.max_version = version;
    }

    fn set_cipher_suites(&mut self, _suites: &[CipherSuite]) {}

    fn install_certificate(&mut self, _certificate: &[u8], _private_key: &[u8]) -> Result<()> {
        Ok(())
    }

    fn set_receive_timeout(&mut self, _timeout: Duration) {}

    fn suite_name(&self) -> Option<&'static str> {
        Some("TLS_RSA_WITH_AES_128_CBC_SHA")
    }

    fn client_random(&self) -> Option<[u8; 32]> {
        Some(self.client_random)
    }

    fn master_secret(&self) -> Option<[u8; 48]> {
        Some(self.master)
    }

    fn read_iv(&self) -> Option<Vec<u8>> {
        Some(vec![0x11; 16])
    }

    fn peek_record_header(&mut self) -> Result<[u8; 5]> {
        Err(Error::Timeout("no data in scripted adapter".to_string()))
    }

    fn read_one_record(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_application_data(&mut self, _max: usize) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }

    fn write_application_data(&mut self, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn send_close_notify(&mut self) -> Result<()> {
        Ok(())
    }

    fn overwrite_pms_version(&mut self, _version: TlsVersion) {}

    fn overwrite_pms_random(&mut self) {}

    fn overwrite_pms_random_byte(&mut self, _index: u16) {}

    fn overwrite_pkcs1_padding(&mut self, _first_byte: u8, _block_type: u8, _padding: u8) {
        self.log.borrow_mut().padding_override_calls.push("install");
    }

    fn restore_pkcs1_padding(&mut self) {
        self.log.borrow_mut().padding_override_calls.push("restore");
    }

    fn skip_pkcs1_checks(
        &mut self,
        _first_byte: bool,
        _block_type: bool,
        _delimiter: bool,
        _pms_version: bool,
    ) {
        self.log.borrow_mut().skip_check_calls.push("install");
    }

    fn restore_pkcs1_checks(&mut self) {
        self.log.borrow_mut().skip_check_calls.push("restore");
    }

    fn set_server_simulation(&mut self, _id: u16) {}

    fn set_server_simulation_delay(&mut self, _micros: u32) {}
}

/// Session over a live loopback socket (the driver probes it for closure)
/// with a scripted adapter. The peer stream must stay alive for the test.
fn scripted_session(log: Rc<RefCell<Recorded>>) -> (Session, SharedTcpConnection, TcpStream, tlsprobe_tooling::logging::CapturedTrace) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let tcp = TcpConnection::shared();
    tcp.borrow_mut().connect("127.0.0.1", port).unwrap();
    let (peer, _) = listener.accept().unwrap();
    let (logger, trace) = Logger::capturing();
    let adapter = Box::new(FakeAdapter::new(log));
    let mut session = Session::with_adapter(Role::Client, adapter, tcp.clone(), logger);
    session.set_wait_for_alert_seconds(0);
    (session, tcp, peer, trace)
}

#[test]
fn steps_visit_every_state_in_wire_order() {
    let log = Rc::new(RefCell::new(Recorded::default()));
    let (mut session, _tcp, _peer, trace) = scripted_session(log.clone());
    let mut pipeline = Pipeline::new(Vec::new());
    session.perform_handshake(&mut pipeline).unwrap();
    use HandshakeState::*;
    assert_eq!(
        log.borrow().steps,
        vec![
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
            Internal1,
            Internal2,
        ]
    );
    assert!(trace.contains_message("Handshake successful."));
    assert!(trace.contains_message("Protocol: TLSv1.2"));
    assert!(trace.contains_message("Cipher suite: TLS_RSA_WITH_AES_128_CBC_SHA"));
}

#[test]
fn skip_change_cipher_spec_jumps_over_the_ccs_state() {
    let log = Rc::new(RefCell::new(Recorded::default()));
    let (mut session, _tcp, _peer, trace) = scripted_session(log.clone());
    let mut pipeline = Pipeline::new(vec![Manipulation::SkipChangeCipherSpec]);
    session.perform_handshake(&mut pipeline).unwrap();
    let steps = log.borrow().steps.clone();
    assert!(!steps.contains(&HandshakeState::ClientChangeCipherSpec));
    assert_eq!(
        steps
            .iter()
            .filter(|s| **s == HandshakeState::ClientFinished)
            .count(),
        1
    );
    assert!(trace.contains_message("Skip sending ChangeCipherSpec message."));
}

#[test]
fn padding_manipulation_installs_and_restores_within_one_step() {
    let log = Rc::new(RefCell::new(Recorded::default()));
    let (mut session, _tcp, _peer, _trace) = scripted_session(log.clone());
    let mut pipeline = Pipeline::new(vec![Manipulation::RsaesPkcs1V15EncryptPadding {
        first_byte: 0x01,
        block_type: 0x02,
        padding: 0x00,
        active: false,
    }]);
    session.perform_handshake(&mut pipeline).unwrap();
    // Exactly one install paired with exactly one restore, and the instance
    // does not stay active across steps.
    assert_eq!(log.borrow().padding_override_calls, vec!["install", "restore"]);
    assert!(pipeline.manipulations().iter().all(|m| !m.is_active()));
}

#[test]
fn key_log_uses_the_random_snapshotted_at_client_key_exchange() {
    let log = Rc::new(RefCell::new(Recorded::default()));
    let (mut session, _tcp, _peer, trace) = scripted_session(log.clone());
    let sink = SharedSink::new();
    session.set_secret_output(Box::new(sink.clone()));
    let mut pipeline = Pipeline::new(Vec::new());
    session.perform_handshake(&mut pipeline).unwrap();
    let contents = sink.contents();
    let expected = format!(
        "CLIENT_RANDOM {} {}\n",
        "aa".repeat(32),
        "bb".repeat(48)
    );
    // The backend replaced its random during the step; the log must carry
    // the value captured at entry to ClientKeyExchange.
    assert_eq!(contents, expected);
    assert!(trace
        .messages()
        .iter()
        .any(|m| m.starts_with("Finished.GenericBlockCipher.IV=11 11 ")));
}

#[test]
fn no_key_log_line_without_a_secret_sink() {
    let log = Rc::new(RefCell::new(Recorded::default()));
    let (mut session, _tcp, _peer, _trace) = scripted_session(log.clone());
    let mut pipeline = Pipeline::new(Vec::new());
    session.perform_handshake(&mut pipeline).unwrap();
    assert!(!session.is_secret_information_collected());
}
