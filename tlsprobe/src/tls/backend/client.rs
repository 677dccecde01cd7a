//! Client-side handshake steps, one per state.

use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Error, Result};
use crate::tls::backend::codec::{self, ClientHello, Reader};
use crate::tls::backend::suites::KeyExchange;
use crate::tls::backend::{kx, pki, sig, Connection};
use crate::tls::{alert, handshake_type, HandshakeState, TlsVersion};

const EXT_SUPPORTED_GROUPS: u16 = 10;
const EXT_EC_POINT_FORMATS: u16 = 11;
const EXT_SIGNATURE_ALGORITHMS: u16 = 13;

pub(crate) fn step(conn: &mut Connection) -> Result<()> {
    match conn.state {
        HandshakeState::HelloRequest => {
            conn.state = HandshakeState::ClientHello;
            Ok(())
        }
        HandshakeState::ClientHello => write_client_hello(conn),
        HandshakeState::ServerHello => parse_server_hello(conn),
        HandshakeState::ServerCertificate => parse_server_certificate(conn),
        HandshakeState::ServerKeyExchange => parse_server_key_exchange(conn),
        HandshakeState::CertificateRequest => parse_certificate_request(conn),
        HandshakeState::ServerHelloDone => parse_server_hello_done(conn),
        HandshakeState::ClientCertificate => write_client_certificate(conn),
        HandshakeState::ClientKeyExchange => write_client_key_exchange(conn),
        HandshakeState::CertificateVerify => write_certificate_verify(conn),
        HandshakeState::ClientChangeCipherSpec => write_change_cipher_spec(conn),
        HandshakeState::ClientFinished => {
            conn.send_finished(b"client finished")?;
            conn.state = HandshakeState::ServerChangeCipherSpec;
            Ok(())
        }
        HandshakeState::ServerChangeCipherSpec => {
            conn.read_change_cipher_spec()?;
            conn.state = HandshakeState::ServerFinished;
            Ok(())
        }
        HandshakeState::ServerFinished => {
            conn.parse_finished(b"server finished")?;
            conn.state = HandshakeState::Internal1;
            Ok(())
        }
        HandshakeState::Internal1 => {
            // Writes go out unbuffered; flushing is a no-op.
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

fn write_client_hello(conn: &mut Connection) -> Result<()> {
    let version = conn.max_version();
    let random = conn.fresh_random();
    conn.hs.offered_version = version;
    conn.hs.client_random = Some(random);

    let mut extensions = Vec::new();
    // secp256r1 only; the backend has no other curve.
    extensions.push((EXT_SUPPORTED_GROUPS, vec![0x00, 0x02, 0x00, 0x17]));
    extensions.push((EXT_EC_POINT_FORMATS, vec![0x01, 0x00]));
    if version >= TlsVersion::TLS1_2 {
        extensions.push((
            EXT_SIGNATURE_ALGORITHMS,
            vec![0x00, 0x06, 0x04, 0x01, 0x05, 0x01, 0x02, 0x01],
        ));
    }

    let hello = ClientHello {
        client_version: version,
        random,
        session_id: Vec::new(),
        cipher_suites: conn.offered_suites.clone(),
        compression_methods: vec![0],
        extensions,
    };
    let body = hello.encode();

    conn.dbg.buf(3, "client hello, version", &[version.major, version.minor]);
    conn.dbg.buf(3, "client hello, random bytes", &random);
    conn.dbg.buf(3, "client hello, session id", &hello.session_id);
    let suite_bytes: Vec<u8> = hello
        .cipher_suites
        .iter()
        .flat_map(|suite| [suite.0, suite.1])
        .collect();
    conn.dbg.buf(3, "client hello, ciphersuitelist", &suite_bytes);
    conn.dbg.buf(3, "client hello, compression", &hello.compression_methods);
    if !hello.extensions.is_empty() {
        let mut extension_bytes = Vec::new();
        for (typ, data) in &hello.extensions {
            codec::put_u16(&mut extension_bytes, *typ);
            codec::put_vec16(&mut extension_bytes, data);
        }
        conn.dbg.buf(3, "client hello extensions", &extension_bytes);
    }

    let raw = codec::handshake_message(handshake_type::CLIENT_HELLO, &body);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write client hello");
    conn.state = HandshakeState::ServerHello;
    Ok(())
}

fn parse_server_hello(conn: &mut Connection) -> Result<()> {
    let raw = conn.expect_handshake_message(handshake_type::SERVER_HELLO, "bad server hello message")?;
    let hello = match codec::ServerHello::parse(&raw[4..]) {
        Ok(hello) => hello,
        Err(e) => {
            conn.dbg.msg(1, "bad server hello message");
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECODE_ERROR);
            return Err(e);
        }
    };
    let version = hello.server_version;
    if version < conn.min_version || version > conn.max_version() {
        conn.dbg.msg(1, "bad server hello message");
        let _ = conn.send_alert(alert::LEVEL_FATAL, alert::PROTOCOL_VERSION);
        return Err(Error::Tls(format!(
            "server chose unacceptable protocol version ({},{})",
            version.major, version.minor
        )));
    }
    let suite = match crate::tls::backend::suites::by_id(hello.cipher_suite) {
        Some(suite)
            if conn.offered_suites.contains(&hello.cipher_suite)
                && suite.usable_with(version) =>
        {
            suite
        }
        _ => {
            conn.dbg.msg(1, "bad server hello message");
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::ILLEGAL_PARAMETER);
            return Err(Error::Tls("server chose an unoffered cipher suite".to_string()));
        }
    };
    conn.hs.version = version;
    conn.hs.server_random = Some(hello.random);
    conn.hs.session_id = hello.session_id.clone();
    conn.hs.suite = Some(suite);

    conn.dbg.buf(3, "server hello, version", &[version.major, version.minor]);
    conn.dbg.buf(3, "server hello, random bytes", &hello.random);
    conn.dbg.buf(3, "server hello, session id", &hello.session_id);
    conn.dbg.msg(
        3,
        &format!(
            "server hello, chosen ciphersuite: {}",
            hex::encode([hello.cipher_suite.0, hello.cipher_suite.1])
        ),
    );
    conn.dbg.msg(
        3,
        &format!("server hello, compress alg.: {}", hello.compression_method),
    );
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse server hello");
    conn.state = HandshakeState::ServerCertificate;
    Ok(())
}

fn parse_server_certificate(conn: &mut Connection) -> Result<()> {
    let raw = conn.expect_handshake_message(handshake_type::CERTIFICATE, "bad certificate message")?;
    let chain = match codec::parse_certificate(&raw[4..]) {
        Ok(chain) if !chain.is_empty() => chain,
        _ => {
            conn.dbg.msg(1, "bad certificate message");
            let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECODE_ERROR);
            return Err(Error::Tls("bad certificate message".to_string()));
        }
    };
    // Chain validation is out of the tool's business; only the key is taken.
    conn.hs.peer_rsa = Some(pki::rsa_public_key_from_certificate(&chain[0])?);
    conn.hs.peer_chain = chain;
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse certificate");
    conn.state = HandshakeState::ServerKeyExchange;
    Ok(())
}

fn parse_server_key_exchange(conn: &mut Connection) -> Result<()> {
    let suite = conn.required_suite()?;
    if suite.kx == KeyExchange::Rsa {
        conn.dbg.msg(2, "<= skip parse server key exchange");
        conn.state = HandshakeState::CertificateRequest;
        return Ok(());
    }
    let raw = conn.expect_handshake_message(
        handshake_type::SERVER_KEY_EXCHANGE,
        "bad server key exchange message",
    )?;
    let body = &raw[4..];
    let mut reader = Reader::new(body);
    let params_start = body.len() - reader.remaining();
    match suite.kx {
        KeyExchange::DheRsa => {
            let p = reader.vec16()?.to_vec();
            let g = reader.vec16()?.to_vec();
            let ys = reader.vec16()?.to_vec();
            conn.dbg.mpi(3, "DHM: P ", &p);
            conn.dbg.mpi(3, "DHM: G ", &g);
            conn.dbg.mpi(3, "DHM: GY", &ys);
            conn.hs.peer_dh_params = Some((p, g, ys));
        }
        KeyExchange::EcdheRsa => {
            let curve_type = reader.u8()?;
            let named_curve = reader.u16()?;
            if curve_type != 3 || named_curve != kx::NAMED_CURVE_SECP256R1 {
                conn.dbg.msg(1, "bad server key exchange message");
                let _ = conn.send_alert(alert::LEVEL_FATAL, alert::ILLEGAL_PARAMETER);
                return Err(Error::Tls("unsupported ECDHE parameters".to_string()));
            }
            conn.hs.peer_ecdh_point = Some(reader.vec8()?.to_vec());
        }
        KeyExchange::Rsa => unreachable!("handled above"),
    }
    let params_end = body.len() - reader.remaining();
    let params = &body[params_start..params_end];
    conn.dbg.buf(3, "server key exchange", params);

    let algorithm = if conn.hs.version >= TlsVersion::TLS1_2 {
        let hash = reader.u8()?;
        let signature_alg = reader.u8()?;
        conn.dbg.msg(3, &format!("Server used HashAlgorithm {}", hash));
        conn.dbg
            .msg(3, &format!("Server used SignatureAlgorithm {}", signature_alg));
        Some((hash, signature_alg))
    } else {
        None
    };
    let signature = reader.vec16()?.to_vec();
    conn.dbg.buf(3, "signature", &signature);
    let peer_key = conn
        .hs
        .peer_rsa
        .clone()
        .ok_or_else(|| Error::Tls("no peer certificate".to_string()))?;
    let client_random = conn.hs.client_random.unwrap_or([0u8; 32]);
    let server_random = conn.hs.server_random.unwrap_or([0u8; 32]);
    if let Err(e) = sig::verify_server_params(
        &peer_key,
        &client_random,
        &server_random,
        params,
        algorithm,
        &signature,
    ) {
        conn.dbg.msg(1, "bad server key exchange message");
        let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECRYPT_ERROR);
        return Err(e);
    }
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse server key exchange");
    conn.state = HandshakeState::CertificateRequest;
    Ok(())
}

fn parse_certificate_request(conn: &mut Connection) -> Result<()> {
    if conn.peek_handshake_message_type()? == handshake_type::CERTIFICATE_REQUEST {
        let raw = conn.expect_handshake_message(
            handshake_type::CERTIFICATE_REQUEST,
            "bad certificate request message",
        )?;
        conn.hs.certificate_requested = true;
        conn.hs.transcript.update(&raw);
        conn.dbg.msg(2, "got a certificate request");
    }
    conn.state = HandshakeState::ServerHelloDone;
    Ok(())
}

fn parse_server_hello_done(conn: &mut Connection) -> Result<()> {
    let raw = conn.expect_handshake_message(
        handshake_type::SERVER_HELLO_DONE,
        "bad server hello done message",
    )?;
    if raw.len() != 4 {
        conn.dbg.msg(1, "bad server hello done message");
        let _ = conn.send_alert(alert::LEVEL_FATAL, alert::DECODE_ERROR);
        return Err(Error::Tls("bad server hello done message".to_string()));
    }
    conn.hs.transcript.update(&raw);
    conn.dbg.msg(2, "<= parse server hello done");
    conn.state = HandshakeState::ClientCertificate;
    Ok(())
}

fn write_client_certificate(conn: &mut Connection) -> Result<()> {
    if !conn.hs.certificate_requested {
        conn.dbg.msg(2, "<= skip write certificate");
        conn.state = HandshakeState::ClientKeyExchange;
        return Ok(());
    }
    let chain = conn
        .identity
        .as_ref()
        .map(|identity| identity.certificate_chain.clone())
        .unwrap_or_default();
    conn.hs.client_certificate_sent = !chain.is_empty();
    let body = codec::encode_certificate(&chain);
    let raw = codec::handshake_message(handshake_type::CERTIFICATE, &body);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write certificate");
    conn.state = HandshakeState::ClientKeyExchange;
    Ok(())
}

fn write_client_key_exchange(conn: &mut Connection) -> Result<()> {
    let suite = conn.required_suite()?;
    let body = match suite.kx {
        KeyExchange::Rsa => {
            // PreMasterSecret = client_version(2) | random(46).
            let mut premaster = vec![0u8; 48];
            premaster[0] = conn.hs.offered_version.major;
            premaster[1] = conn.hs.offered_version.minor;
            OsRng.fill_bytes(&mut premaster[2..]);
            if let Some(version) = conn.pms_version_override {
                // The override reaches the key schedule as well.
                premaster[0] = version.major;
                premaster[1] = version.minor;
            }
            // The random-field overrides only touch the encrypted copy; the
            // key schedule keeps the original bytes.
            let mut wire_premaster = premaster.clone();
            if conn.pms_random_override {
                let mut fresh = [0u8; 46];
                for byte in fresh.iter_mut() {
                    let mut candidate = [0u8];
                    loop {
                        OsRng.fill_bytes(&mut candidate);
                        if candidate[0] != 0 {
                            break;
                        }
                    }
                    *byte = candidate[0];
                }
                wire_premaster[2..].copy_from_slice(&fresh);
            }
            if let Some(index) = conn.pms_random_byte_override {
                if (index as usize) < 46 {
                    wire_premaster[2 + index as usize] = 0;
                }
            }
            let peer_key = conn
                .hs
                .peer_rsa
                .clone()
                .ok_or_else(|| Error::Tls("no peer certificate".to_string()))?;
            let encrypted =
                kx::rsaes_pkcs1_v15_encrypt(&peer_key, &wire_premaster, &conn.pkcs1_overrides)?;
            conn.hs.premaster = premaster;
            let mut body = Vec::with_capacity(2 + encrypted.len());
            codec::put_vec16(&mut body, &encrypted);
            body
        }
        KeyExchange::DheRsa => {
            let (p, g, ys) = conn
                .hs
                .peer_dh_params
                .clone()
                .ok_or_else(|| Error::Tls("no Diffie-Hellman parameters".to_string()))?;
            let (own_public, shared) = kx::dh_client_exchange(&p, &g, &ys)?;
            conn.hs.premaster = shared;
            let mut body = Vec::with_capacity(2 + own_public.len());
            codec::put_vec16(&mut body, &own_public);
            body
        }
        KeyExchange::EcdheRsa => {
            let peer_point = conn
                .hs
                .peer_ecdh_point
                .clone()
                .ok_or_else(|| Error::Tls("no ECDHE parameters".to_string()))?;
            let ephemeral = kx::EcdhEphemeral::generate();
            conn.hs.premaster = ephemeral.agree(&peer_point)?;
            let mut body = Vec::with_capacity(1 + ephemeral.public_point.len());
            codec::put_vec8(&mut body, &ephemeral.public_point);
            body
        }
    };
    let raw = codec::handshake_message(handshake_type::CLIENT_KEY_EXCHANGE, &body);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write client key exchange");
    conn.derive_keys()?;
    conn.state = HandshakeState::CertificateVerify;
    Ok(())
}

fn write_certificate_verify(conn: &mut Connection) -> Result<()> {
    if !conn.hs.client_certificate_sent {
        conn.dbg.msg(2, "<= skip write certificate verify");
        conn.state = HandshakeState::ClientChangeCipherSpec;
        return Ok(());
    }
    let version = conn.hs.version;
    let digest = if version >= TlsVersion::TLS1_2 {
        conn.hs
            .transcript
            .finished_digest(version, crate::tls::backend::prf::PrfHash::Sha256)
    } else {
        conn.hs.transcript.finished_digest(TlsVersion::TLS1_0, crate::tls::backend::prf::PrfHash::Sha256)
    };
    let key = match conn.identity.as_ref() {
        Some(identity) => identity.private_key.clone(),
        None => return Err(Error::Tls("no private key for certificate verify".to_string())),
    };
    let signature = sig::sign_transcript_digest(version, &key, &digest)?;
    let mut body = Vec::new();
    if version >= TlsVersion::TLS1_2 {
        body.push(sig::HASH_SHA256);
        body.push(sig::SIG_RSA);
    }
    codec::put_vec16(&mut body, &signature);
    let raw = codec::handshake_message(handshake_type::CERTIFICATE_VERIFY, &body);
    conn.send_handshake_message(&raw)?;
    conn.dbg.msg(2, "<= write certificate verify");
    conn.state = HandshakeState::ClientChangeCipherSpec;
    Ok(())
}

fn write_change_cipher_spec(conn: &mut Connection) -> Result<()> {
    conn.write_record(crate::tls::content_type::CHANGE_CIPHER_SPEC, &[1])?;
    conn.dbg.msg(2, "<= write change cipher spec");
    conn.state = HandshakeState::ClientFinished;
    Ok(())
}
