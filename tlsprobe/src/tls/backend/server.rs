//! Server-side handshake steps, one per state, including the simulated
//! non-conforming alert behaviors in the RSA key-transport error path.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::tls::backend::codec::{self, Reader, ServerHello};
use crate::tls::backend::suites::{by_id, KeyExchange};
use crate::tls::backend::{kx, sig, Connection};
use crate::tls::{alert, handshake_type, HandshakeState};

pub(crate) fn step(conn: &mut Connection) -> Result<()> {
    match conn.state {
        HandshakeState::HelloRequest => {
            conn.state = HandshakeState::ClientHello;
            Ok(())
        }
        HandshakeState::ClientHello => parse_client_hello(conn),
        HandshakeState::ServerHello => write_server_hello(conn),
        HandshakeState::ServerCertificate => write_server_certificate(conn),
        HandshakeState::ServerKeyExchange => write_server_key_exchange(conn),
        HandshakeState::CertificateRequest => {
            // The tool never asks for client authentication.
            conn.state = HandshakeState::ServerHelloDone;
            Ok(())
        }
        HandshakeState::ServerHelloDone => write_server_hello_done(conn),
        HandshakeState::ClientCertificate => parse_client_certificate(conn),
        HandshakeState::ClientKeyExchange => parse_client_key_exchange(conn),
        HandshakeState::CertificateVerify => parse_certificate_verify(conn),
        HandshakeState::ClientChangeCipherSpec => {
            conn.read_change_cipher_spec()?;
            conn.state = HandshakeState::ClientFinished;
            Ok(())
        }
        HandshakeState::ClientFinished => {
            conn.parse_finished(b"client finished")?;
            conn.state = HandshakeState::ServerChangeCipherSpec;
            Ok(())
        }
        HandshakeState::ServerChangeCipherSpec => write_change_cipher_spec(conn),
        HandshakeState::ServerFinished => {
            simulation_delay(conn);
            conn.send_finished(b"server finished")?;
            conn.state = HandshakeState::Internal1;
            Ok(())
        }
        HandshakeState::Internal1 => {
            conn.state = HandshakeState::Internal2;
            Ok(())
        }
        HandshakeState::Internal2 => {
            conn.dbg.msg(3, "<= handshake wrapup");
            conn.state = HandshakeState::HandshakeDone;
            Ok(())
        }
        HandshakeState::HandshakeDone => Ok(()),
    }
}

/// Simulation id 6 delays every server flight by the configured time.
fn simulation_delay(conn: &Connection) {
    if conn.server_simulation == 6 && conn.server_simulation_delay > 0 {
        std::thread::sleep(std::time::Duration::from_micros(
            conn.server_simulation_delay as u64,
        ));
    }
}

fn parse_client_hello(conn: &mut Connection) -> Result<()> {
    let raw = conn.expect_handshake_message(handshake_type::CLIENT_HELLO, "bad client hello message")?;
    let hello = match codec::ClientHello::parse(&raw[4..]) {
        Ok(hello) => hello,
        Err(e) => {
            conn.dbg.msg(1, "bad client hello message");
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECODE_ERROR);
            return Err(e);
        }
    };
    conn.dbg.buf(
        3,
        "client hello, version",
        &[hello.client_version.major, hello.client_version.minor],
    );
    conn.dbg.buf(3, "client hello, random bytes", &hello.random);
    conn.dbg.buf(3, "client hello, session id", &hello.session_id);
    let suite_bytes: Vec<u8> = hello
        .cipher_suites
        .iter()
        .flat_map(|suite| [suite.0, suite.1])
        .collect();
    conn.dbg.buf(3, "client hello, ciphersuitelist", &suite_bytes);
    conn.dbg.buf(3, "client hello, compression", &hello.compression_methods);

    if hello.client_version.major != 3 || hello.client_version < conn.min_version {
        conn.dbg.msg(1, "bad client hello message");
        let _ = conn.send_alert(alert::LEVEL_FATAL, alert::PROTOCOL_VERSION);
        return Err(Error::Tls(format!(
            "client offered unacceptable protocol version ({},{})",
            hello.client_version.major, hello.client_version.minor
        )));
    }
    let version = hello.client_version.min(conn.max_version());
    if conn.identity.is_none() {
        conn.dbg.msg(1, "got no certificate to present");
        let _ = conn.send_alert(alert::LEVEL_FATAL, alert::HANDSHAKE_FAILURE);
        return Err(Error::Tls("no server certificate configured".to_string()));
    }
    // Own preference order decides, restricted to what the client offered.
    let chosen = conn
        .offered_suites
        .iter()
        .filter_map(|id| by_id(*id))
        .find(|suite| hello.cipher_suites.contains(&suite.id) && suite.usable_with(version));
    let suite = match chosen {
        Some(suite) => suite,
        None => {
            conn.dbg.msg(1, "got no ciphersuites in common");
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::HANDSHAKE_FAILURE);
            return Err(Error::Tls("no cipher suite in common".to_string()));
        }
    };
    conn.hs.offered_version = hello.client_version;
    conn.hs.version = version;
    conn.hs.client_random = Some(hello.random);
    conn.hs.suite = Some(suite);
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse client hello");
    conn.state = HandshakeState::ServerHello;
    Ok(())
}

fn write_server_hello(conn: &mut Connection) -> Result<()> {
    simulation_delay(conn);
    let version = conn.hs.version;
    let random = conn.fresh_random();
    let mut session_id = vec![0u8; 32];
    OsRng.fill_bytes(&mut session_id);
    conn.hs.server_random = Some(random);
    conn.hs.session_id = session_id.clone();
    let suite = conn.required_suite()?;

    let hello = ServerHello {
        server_version: version,
        random,
        session_id,
        cipher_suite: suite.id,
        compression_method: 0,
        extensions: Vec::new(),
    };
    conn.dbg.buf(3, "server hello, version", &[version.major, version.minor]);
    conn.dbg.buf(3, "server hello, random bytes", &random);
    conn.dbg.buf(3, "server hello, session id", &hello.session_id);
    conn.dbg.msg(
        3,
        &format!(
            "server hello, chosen ciphersuite: {}",
            hex::encode([suite.id.0, suite.id.1])
        ),
    );
    conn.dbg.msg(3, "server hello, compress alg.: 0");

    let raw = codec::handshake_message(handshake_type::SERVER_HELLO, &hello.encode());
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write server hello");
    conn.state = HandshakeState::ServerCertificate;
    Ok(())
}

fn write_server_certificate(conn: &mut Connection) -> Result<()> {
    simulation_delay(conn);
    let chain = match conn.identity.as_ref() {
        Some(identity) => identity.certificate_chain.clone(),
        None => return Err(Error::Tls("no server certificate configured".to_string())),
    };
    let raw = codec::handshake_message(handshake_type::CERTIFICATE, &codec::encode_certificate(&chain));
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write certificate");
    conn.state = HandshakeState::ServerKeyExchange;
    Ok(())
}

fn write_server_key_exchange(conn: &mut Connection) -> Result<()> {
    let suite = conn.required_suite()?;
    if suite.kx == KeyExchange::Rsa {
        conn.dbg.msg(2, "<= skip write server key exchange");
        conn.state = HandshakeState::CertificateRequest;
        return Ok(());
    }
    simulation_delay(conn);
    let mut params = Vec::new();
    match suite.kx {
        KeyExchange::DheRsa => {
            let ephemeral = kx::DhEphemeral::generate();
            let p = ephemeral.prime_bytes();
            let g = ephemeral.generator_bytes();
            codec::put_vec16(&mut params, &p);
            codec::put_vec16(&mut params, &g);
            codec::put_vec16(&mut params, &ephemeral.public);
            conn.dbg.mpi(3, "DHM: P ", &p);
            conn.dbg.mpi(3, "DHM: G ", &g);
            conn.dbg.mpi(3, "DHM: GY", &ephemeral.public);
            conn.hs.server_dh = Some(ephemeral);
        }
        KeyExchange::EcdheRsa => {
            let ephemeral = kx::EcdhEphemeral::generate();
            params.push(3); // named_curve
            codec::put_u16(&mut params, kx::NAMED_CURVE_SECP256R1);
            codec::put_vec8(&mut params, &ephemeral.public_point);
            conn.hs.server_ecdh = Some(ephemeral);
        }
        KeyExchange::Rsa => unreachable!("handled above"),
    }
    conn.dbg.buf(3, "server key exchange", &params);

    let client_random = conn.hs.client_random.unwrap_or([0u8; 32]);
    let server_random = conn.hs.server_random.unwrap_or([0u8; 32]);
    let key = match conn.identity.as_ref() {
        Some(identity) => identity.private_key.clone(),
        None => return Err(Error::Tls("no server key configured".to_string())),
    };
    let (algorithm, signature) =
        sig::sign_server_params(conn.hs.version, &key, &client_random, &server_random, &params)?;
    let mut body = params;
    if let Some((hash, signature_alg)) = algorithm {
        body.push(hash);
        body.push(signature_alg);
    }
    codec::put_vec16(&mut body, &signature);
    let raw = codec::handshake_message(handshake_type::SERVER_KEY_EXCHANGE, &body);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write server key exchange");
    conn.state = HandshakeState::CertificateRequest;
    Ok(())
}

fn write_server_hello_done(conn: &mut Connection) -> Result<()> {
    simulation_delay(conn);
    let raw = codec::handshake_message(handshake_type::SERVER_HELLO_DONE, &[]);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write server hello done");
    conn.state = HandshakeState::ClientCertificate;
    Ok(())
}

fn parse_client_certificate(conn: &mut Connection) -> Result<()> {
    // Only present if a certificate was requested; tolerate one anyway.
    if conn.peek_handshake_message_type()? == handshake_type::CERTIFICATE {
        let raw = conn.expect_handshake_message(handshake_type::CERTIFICATE, "bad certificate message")?;
        conn.hs.peer_chain = codec::parse_certificate(&raw[4..]).unwrap_or_default();
        conn.hs.transcript.update(&raw);
        conn.dbg.msg(2, "<= parse certificate");
    }
    conn.state = HandshakeState::ClientKeyExchange;
    Ok(())
}

/// Alert behavior of the simulated non-conforming servers on a bad RSA
/// ClientKeyExchange. Ids follow the configuration surface: 1 CISCO ACE,
/// 2 Facebook v2, 3 F5 v1, 4 PAN OS, 5 Netscaler GCM.
fn simulated_bad_pms_reaction(conn: &mut Connection) -> Result<()> {
    match conn.server_simulation {
        1 => {
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::BAD_RECORD_MAC);
            Err(Error::Tls("bad client key exchange".to_string()))
        }
        2 => {
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::HANDSHAKE_FAILURE);
            Err(Error::Tls("bad client key exchange".to_string()))
        }
        3 => {
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::ILLEGAL_PARAMETER);
            Err(Error::Tls("bad client key exchange".to_string()))
        }
        4 => {
            let _ = conn.tcp.borrow_mut().close();
            Err(Error::Tls("bad client key exchange".to_string()))
        }
        5 => {
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECODE_ERROR);
            Err(Error::Tls("bad client key exchange".to_string()))
        }
        _ => {
            // Countermeasure of RFC 5246 7.4.7.1: continue with a random
            // premaster so the failure only surfaces at the Finished.
            let mut premaster = vec![0u8; 48];
            premaster[0] = conn.hs.offered_version.major;
            premaster[1] = conn.hs.offered_version.minor;
            OsRng.fill_bytes(&mut premaster[2..]);
            conn.hs.premaster = premaster;
            Ok(())
        }
    }
}

fn parse_client_key_exchange(conn: &mut Connection) -> Result<()> {
    let suite = conn.required_suite()?;
    let raw = conn.expect_handshake_message(
        handshake_type::CLIENT_KEY_EXCHANGE,
        "bad client key exchange",
    )?;
    let body = &raw[4..];
    let mut reader = Reader::new(body);
    match suite.kx {
        KeyExchange::Rsa => {
            let encrypted = reader.vec16()?.to_vec();
            let key = match conn.identity.as_ref() {
                Some(identity) => identity.private_key.clone(),
                None => return Err(Error::Tls("no server key configured".to_string())),
            };
            match kx::rsaes_pkcs1_v15_decrypt(&key, &encrypted, 48, &conn.pkcs1_skip) {
                Ok(premaster) => {
                    let version_ok = premaster.len() == 48
                        && (conn.skip_pms_version_check
                            || premaster[..2]
                                == [conn.hs.offered_version.major, conn.hs.offered_version.minor]);
                    if premaster.len() != 48 || !version_ok {
                        conn.dbg.msg(1, "bad client key exchange");
                        simulated_bad_pms_reaction(conn)?;
                    } else {
                        conn.hs.premaster = premaster;
                    }
                }
                Err(_) => {
                    conn.dbg.msg(1, "bad client key exchange");
                    simulated_bad_pms_reaction(conn)?;
                }
            }
        }
        KeyExchange::DheRsa => {
            let public = reader.vec16()?.to_vec();
            let ephemeral = conn
                .hs
                .server_dh
                .as_ref()
                .ok_or_else(|| Error::Tls("no Diffie-Hellman state".to_string()))?;
            conn.hs.premaster = ephemeral.agree(&public)?;
        }
        KeyExchange::EcdheRsa => {
            let point = reader.vec8()?.to_vec();
            let ephemeral = conn
                .hs
                .server_ecdh
                .as_ref()
                .ok_or_else(|| Error::Tls("no ECDHE state".to_string()))?;
            conn.hs.premaster = ephemeral.agree(&point)?;
        }
    }
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse client key exchange");
    conn.derive_keys()?;
    conn.state = HandshakeState::CertificateVerify;
    Ok(())
}

fn parse_certificate_verify(conn: &mut Connection) -> Result<()> {
    // Only a client that sent a certificate sends one; since the tool never
    // requests authentication, this is consumed without verification.
    if !conn.hs.peer_chain.is_empty()
        && conn.peek_handshake_message_type()? == handshake_type::CERTIFICATE_VERIFY
    {
        let raw = conn.expect_handshake_message(
            handshake_type::CERTIFICATE_VERIFY,
            "bad certificate verify message",
        )?;
        conn.hs.transcript.update(&raw);
        conn.dbg.msg(2, "<= parse certificate verify");
    }
    conn.state = HandshakeState::ClientChangeCipherSpec;
    Ok(())
}

fn write_change_cipher_spec(conn: &mut Connection) -> Result<()> {
    simulation_delay(conn);
    conn.write_record(crate::tls::content_type::CHANGE_CIPHER_SPEC, &[1])?;
    conn.dbg.msg(2, "<= write change cipher spec");
    conn.state = HandshakeState::ServerFinished;
    Ok(())
}
