//! End-to-end handshakes over a loopback socket, client and server both
//! driven by this crate, covering the literal scenarios of the tool.

mod common;

use std::net::TcpListener;
use std::thread;
use std::time::Duration;

use tlsprobe::manipulation::{Manipulation, Pipeline};
use tlsprobe::network::tcp::TcpConnection;
use tlsprobe::tls::log_filter;
use tlsprobe::tls::session::Session;
use tlsprobe::tls::{CipherSuite, TlsVersion};
use tlsprobe_tooling::logging::{LogLevel, Logger};

use common::{self_signed_identity, SharedSink};

struct EndpointOutcome {
    result: Result<(), String>,
    trace: String,
}

impl EndpointOutcome {
    fn contains(&self, needle: &str) -> bool {
        self.trace
            .lines()
            .any(|line| line.rsplit('\t').next() == Some(needle))
    }

    fn message_with_prefix(&self, prefix: &str) -> Option<String> {
        self.trace
            .lines()
            .filter_map(|line| line.rsplit('\t').next())
            .find(|message| message.starts_with(prefix))
            .map(str::to_string)
    }
}

fn capturing_logger() -> (Logger, tlsprobe_tooling::logging::CapturedTrace) {
    let (logger, trace) = Logger::capturing();
    logger.set_log_level(LogLevel::High);
    log_filter::register_filters(&logger);
    (logger, trace)
}

fn run_handshake_pair(
    version: TlsVersion,
    suites: Vec<CipherSuite>,
    client_manipulations: Vec<Manipulation>,
    server_manipulations: Vec<Manipulation>,
    client_secret_sink: Option<SharedSink>,
) -> (EndpointOutcome, EndpointOutcome) {
    let (certificate, private_key) = self_signed_identity();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let tcp = TcpConnection::shared();
        tcp.borrow_mut().adopt(stream).unwrap();
        let (logger, trace) = capturing_logger();
        let mut session = Session::new_server(tcp.clone(), logger);
        session.set_certificate(&certificate, &private_key).unwrap();
        session.set_tcp_receive_timeout_seconds(10);
        session.set_wait_for_alert_seconds(1);
        let mut pipeline = Pipeline::new(server_manipulations);
        let result = session
            .perform_handshake(&mut pipeline)
            .map_err(|e| e.to_string());
        // Keep the socket open long enough for the client's last steps.
        thread::sleep(Duration::from_millis(800));
        EndpointOutcome {
            result,
            trace: trace.contents(),
        }
    });

    let tcp = TcpConnection::shared();
    tcp.borrow_mut().connect("127.0.0.1", port).unwrap();
    let (logger, trace) = capturing_logger();
    let mut session = Session::new_client(tcp.clone(), logger);
    session.set_version(version);
    session.set_cipher_suites(&suites);
    session.set_tcp_receive_timeout_seconds(10);
    session.set_wait_for_alert_seconds(2);
    if let Some(sink) = client_secret_sink {
        session.set_secret_output(Box::new(sink));
    }
    let mut pipeline = Pipeline::new(client_manipulations);
    let result = session
        .perform_handshake(&mut pipeline)
        .map_err(|e| e.to_string());
    let client = EndpointOutcome {
        result,
        trace: trace.contents(),
    };
    let server = server.join().unwrap();
    (client, server)
}

#[test_log::test]
fn compliant_tls12_rsa_handshake_succeeds() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        Vec::new(),
        Vec::new(),
        None,
    );
    assert!(client.result.is_ok(), "client: {:?}", client.result);
    assert!(server.result.is_ok(), "server: {:?}", server.result);
    assert!(client.contains("Handshake successful."));
    assert!(client.contains("Protocol: TLSv1.2"));
    assert!(client.contains("ServerHello.cipher_suite=00 2f"));
    assert!(client.contains("ChangeCipherSpec message transmitted."));
    assert!(client.contains("Valid Finished message received."));
    assert!(server.contains("Valid ClientHello message received."));
    assert!(server.contains("Valid ClientKeyExchange message received."));
    assert!(server.contains("Handshake successful."));
}

#[test_log::test]
fn compliant_tls12_ecdhe_gcm_handshake_succeeds() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0xc0, 0x2f)],
        Vec::new(),
        Vec::new(),
        None,
    );
    assert!(client.result.is_ok(), "client: {:?}", client.result);
    assert!(server.result.is_ok(), "server: {:?}", server.result);
    assert!(client.contains("Handshake successful."));
    assert!(client.contains("ServerHello.cipher_suite=c0 2f"));
    assert!(client.contains("Protocol: TLSv1.2"));
    assert!(client.contains("Valid ServerKeyExchange message received."));
    assert!(client.contains("ServerKeyExchange.params.curve_params.namedcurve=17"));
}

#[test_log::test]
fn compliant_tls10_dhe_handshake_succeeds() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_0,
        vec![CipherSuite(0x00, 0x33)],
        Vec::new(),
        Vec::new(),
        None,
    );
    assert!(client.result.is_ok(), "client: {:?}", client.result);
    assert!(server.result.is_ok(), "server: {:?}", server.result);
    assert!(client.contains("Handshake successful."));
    assert!(client.contains("Protocol: TLSv1.0"));
    assert!(client
        .message_with_prefix("ServerKeyExchange.params.dh_p=")
        .is_some());
}

#[test_log::test]
fn skipping_change_cipher_spec_draws_a_fatal_alert() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        vec![Manipulation::SkipChangeCipherSpec],
        Vec::new(),
        None,
    );
    assert!(server.result.is_err());
    assert!(client.contains("Skip sending ChangeCipherSpec message."));
    assert!(!client.contains("ChangeCipherSpec message transmitted."));
    assert!(client.contains("Alert.level=02"));
    assert!(client.contains("Fatal Alert message received."));
    assert!(!client.contains("Handshake successful."));
}

#[test_log::test]
fn zeroed_premaster_random_byte_fails_at_the_finished() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        vec![Manipulation::PreMasterSecretRandomByte { index: 0 }],
        Vec::new(),
        None,
    );
    // The server accepts the ClientKeyExchange (valid padding) but derives
    // different keys, so the client's Finished fails its record check.
    assert!(server.result.is_err());
    assert!(client.result.is_err());
    assert!(client.contains(
        "Overwrite the byte at index 0 in the field PreMasterSecret.random with zero."
    ));
    assert!(client.contains("Fatal Alert message received."));
    assert!(!client.contains("Handshake successful."));
}

#[test_log::test]
fn wrong_pkcs1_first_byte_draws_an_alert() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        vec![Manipulation::RsaesPkcs1V15EncryptPadding {
            first_byte: 0x01,
            block_type: 0x02,
            padding: 0x00,
            active: false,
        }],
        Vec::new(),
        None,
    );
    assert!(server.result.is_err());
    assert!(client.contains("Change the first byte in RSAES-PKCS1-V1_5-ENCRYPT to 0x01."));
    assert!(client.contains("Alert.level=02"));
    assert!(!client.contains("Handshake successful."));
    assert!(server.contains("Bad ClientKeyExchange message received."));
}

#[test_log::test]
fn skipped_padding_checks_accept_a_malformed_block() {
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        vec![Manipulation::RsaesPkcs1V15EncryptPadding {
            first_byte: 0x00,
            block_type: 0x02,
            padding: 0x01,
            active: false,
        }],
        vec![Manipulation::SkipRsaesPkcs1V15PaddingCheck {
            first_byte: true,
            block_type: true,
            delimiter: true,
            pms_version: true,
            active: false,
        }],
        None,
    );
    assert!(client.result.is_ok(), "client: {:?}", client.result);
    assert!(server.result.is_ok(), "server: {:?}", server.result);
    assert!(client.contains("Handshake successful."));
    assert!(server.contains("Handshake successful."));
    assert!(server.contains("Skip the first byte check in RSAES-PKCS1-V1_5-ENCRYPT: 1."));
    assert!(server.contains("Skip the block type check in RSAES-PKCS1-V1_5-ENCRYPT: 1."));
    assert!(server.contains("Skip the delimiter check in RSAES-PKCS1-V1_5-ENCRYPT: 1."));
    assert!(server.contains(
        "Skip the pre-master secret version check in RSAES-PKCS1-V1_5-ENCRYPT: 1."
    ));
}

#[test_log::test]
fn key_log_line_matches_the_wire_client_random() {
    let sink = SharedSink::new();
    let (client, server) = run_handshake_pair(
        TlsVersion::TLS1_2,
        vec![CipherSuite(0x00, 0x2f)],
        Vec::new(),
        Vec::new(),
        Some(sink.clone()),
    );
    assert!(client.result.is_ok(), "client: {:?}", client.result);
    assert!(server.result.is_ok(), "server: {:?}", server.result);
    let key_log = sink.contents();
    let line = key_log.lines().next().expect("one key log line");
    let mut fields = line.split(' ');
    assert_eq!(fields.next(), Some("CLIENT_RANDOM"));
    let random_hex = fields.next().expect("client random field");
    let master_hex = fields.next().expect("master secret field");
    assert_eq!(random_hex.len(), 64);
    assert_eq!(master_hex.len(), 96);
    // The first field must equal the ClientHello.random seen on the wire
    // (the server's trace shows the received bytes).
    let wire_random = server
        .message_with_prefix("ClientHello.random=")
        .expect("server observed the client random");
    let wire_compact: String = wire_random
        .trim_start_matches("ClientHello.random=")
        .chars()
        .filter(|c| c.is_ascii_hexdigit())
        .collect();
    assert_eq!(wire_compact, random_hex);
}

#[test_log::test]
fn graceful_application_data_exchange_after_handshake() {
    let (certificate, private_key) = self_signed_identity();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = thread::spawn(move || {
        let (stream, _) = listener.accept().unwrap();
        let tcp = TcpConnection::shared();
        tcp.borrow_mut().adopt(stream).unwrap();
        let (logger, _trace) = capturing_logger();
        let mut session = Session::new_server(tcp.clone(), logger);
        session.set_certificate(&certificate, &private_key).unwrap();
        session.set_tcp_receive_timeout_seconds(10);
        let mut pipeline = Pipeline::new(Vec::new());
        session.perform_handshake(&mut pipeline).unwrap();
        session.send_application_data(b"hello from the peer").unwrap();
        thread::sleep(Duration::from_millis(800));
    });

    let tcp = TcpConnection::shared();
    tcp.borrow_mut().connect("127.0.0.1", port).unwrap();
    let (logger, _trace) = capturing_logger();
    let mut session = Session::new_client(tcp.clone(), logger);
    session.set_version(TlsVersion::TLS1_2);
    session.set_cipher_suites(&[CipherSuite(0xc0, 0x2f)]);
    session.set_tcp_receive_timeout_seconds(10);
    let mut pipeline = Pipeline::new(Vec::new());
    session.perform_handshake(&mut pipeline).unwrap();
    let data = session.receive_application_data().unwrap();
    assert_eq!(data, b"hello from the peer");
    server.join().unwrap();
}
